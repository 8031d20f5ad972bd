//! Named scratch volumes shared between the compile and execute containers
//! of a single compiler-mode case.

use std::collections::HashMap;

use bollard::{
    volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions},
    Docker,
};
use drop_bomb::DropBomb;

/// Prefix of every scratch volume name; the startup janitor sweeps on it.
const SCRATCH_PREFIX: &str = "submission-";

pub struct ScratchVolume {
    docker: Docker,
    name: String,

    _drop_bomb: DropBomb,
}

impl ScratchVolume {
    pub fn name_for(submission_id: &str, index: usize) -> String {
        format!("{SCRATCH_PREFIX}{submission_id}-{index}")
    }

    pub async fn create(
        docker: Docker,
        submission_id: &str,
        index: usize,
    ) -> Result<Self, bollard::errors::Error> {
        let name = Self::name_for(submission_id, index);
        tracing::trace!(%name, "creating scratch volume");
        docker
            .create_volume(CreateVolumeOptions {
                name: name.as_str(),
                driver: "local",
                ..Default::default()
            })
            .await?;

        Ok(Self {
            docker,
            name,

            _drop_bomb: DropBomb::new("`ScratchVolume::remove()` must be called before dropping!"),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Best-effort removal; the containers that mounted the volume must be
    /// gone first or the forced removal still fails.
    pub async fn remove(mut self) {
        tracing::trace!(name = %self.name, "removing scratch volume");

        self._drop_bomb.defuse();

        let removal = self
            .docker
            .remove_volume(&self.name, Some(RemoveVolumeOptions { force: true }))
            .await;
        if let Err(e) = removal {
            tracing::warn!(volume = %self.name, error = %e, "failed to remove scratch volume");
        }
    }
}

/// Sweep scratch volumes left behind by a previous worker that died between
/// volume creation and teardown. Best effort, startup only.
pub async fn sweep_leaked_volumes(docker: &Docker) {
    let filters: HashMap<&str, Vec<&str>> = [("name", vec![SCRATCH_PREFIX])].into_iter().collect();
    let listing = match docker.list_volumes(Some(ListVolumesOptions { filters })).await {
        Ok(listing) => listing,
        Err(e) => {
            tracing::warn!(error = %e, "failed to list scratch volumes");
            return;
        }
    };

    for volume in listing.volumes.unwrap_or_default() {
        // The name filter is a substring match; only trust the prefix.
        if !volume.name.starts_with(SCRATCH_PREFIX) {
            continue;
        }
        match docker
            .remove_volume(&volume.name, Some(RemoveVolumeOptions { force: true }))
            .await
        {
            Ok(()) => tracing::info!(volume = %volume.name, "removed leaked scratch volume"),
            Err(e) => {
                tracing::warn!(volume = %volume.name, error = %e, "failed to remove leaked scratch volume")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_names_carry_submission_and_case() {
        assert_eq!(
            ScratchVolume::name_for("abc123", 1),
            "submission-abc123-1"
        );
        assert!(ScratchVolume::name_for("x", 0).starts_with(SCRATCH_PREFIX));
    }
}
