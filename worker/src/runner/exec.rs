use std::time::Duration;

use anyhow::Context;
use bollard::{
    container::{
        AttachContainerOptions, Config, LogOutput, LogsOptions, RemoveContainerOptions,
        StartContainerOptions, UploadToContainerOptions, WaitContainerOptions,
    },
    models::{HostConfig, ResourcesUlimits},
    Docker,
};
use bytes::{Bytes, BytesMut};
use derive_builder::Builder;
use tokio::io::AsyncWriteExt;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use super::model::{classify_exit, Phase, PhaseResult, SANDBOX_ERROR};
use super::util::is_recoverable_error;
use crate::util::tar::stream_source_file;

const MIB: i64 = 1024 * 1024;

/// Everything needed to run one container for one phase of one case.
#[derive(Debug, Builder)]
#[builder(setter(into, strip_option), pattern = "owned")]
pub struct SandboxPhase {
    image: String,

    /// The phase command, already split into an argument vector.
    cmd: Vec<String>,

    phase: Phase,

    /// Hard memory cap in MiB.
    memory_limit_mib: i64,

    /// Wall-clock budget for awaiting container termination.
    deadline: Duration,

    /// File name of the source entry uploaded into `/app`.
    source_name: String,

    /// Transformed source bytes for this case.
    source: Bytes,

    /// Payload written to the container's stdin after start. The container
    /// is created with an open stdin iff this is present.
    #[builder(default)]
    stdin: Option<Bytes>,

    /// Named scratch volume bound to `/app`, shared between the compile and
    /// execute containers of a compiler-mode case.
    #[builder(default)]
    scratch_volume: Option<String>,

    /// Submission-wide cancellation scope.
    #[builder(default)]
    cancellation: CancellationToken,
}

/// Drive one container through create / populate / start / attach / await,
/// classify its termination and tear it down.
///
/// Every exit path removes the container, including cancellation; a bound
/// scratch volume is never removed here (it belongs to the case runner),
/// but anonymous volumes attached to the container are.
pub async fn run_phase(docker: &Docker, cfg: SandboxPhase) -> PhaseResult {
    let id = match create(docker, &cfg).await {
        Ok(id) => id,
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), "failed to create sandbox");
            return PhaseResult::Halted(SANDBOX_ERROR);
        }
    };

    let result = match drive(docker, &id, &cfg).await {
        Ok(result) => result,
        Err(e) => {
            tracing::warn!(error = %format!("{e:#}"), container = %id, "sandbox phase failed");
            PhaseResult::Halted(SANDBOX_ERROR)
        }
    };

    remove(docker, &id, cfg.scratch_volume.is_some()).await;
    result
}

async fn create(docker: &Docker, cfg: &SandboxPhase) -> anyhow::Result<String> {
    let (soft, hard) = cfg.phase.nproc_ulimit();
    let host_config = HostConfig {
        auto_remove: Some(false),
        binds: cfg
            .scratch_volume
            .as_ref()
            .map(|volume| vec![format!("{volume}:/app")]),
        memory: Some(cfg.memory_limit_mib * MIB),
        ulimits: Some(vec![ResourcesUlimits {
            name: Some("nproc".into()),
            soft: Some(soft),
            hard: Some(hard),
        }]),
        ..Default::default()
    };

    let created = docker
        .create_container::<String, _>(
            None,
            Config {
                image: Some(cfg.image.clone()),
                cmd: Some(cfg.cmd.clone()),
                tty: Some(false),
                open_stdin: Some(cfg.stdin.is_some()),
                working_dir: Some("/app".into()),
                host_config: Some(host_config),
                ..Default::default()
            },
        )
        .await
        .context("creating sandbox container")?;
    Ok(created.id)
}

async fn drive(docker: &Docker, id: &str, cfg: &SandboxPhase) -> anyhow::Result<PhaseResult> {
    let (archive, packing) = stream_source_file(cfg.source_name.clone(), cfg.source.clone());
    let mut archive = Box::pin(archive);
    let mut archive_bytes = Vec::new();
    while let Some(chunk) = archive.next().await {
        archive_bytes.extend_from_slice(&chunk.context("reading source archive stream")?);
    }
    docker
        .upload_to_container(
            id,
            Some(UploadToContainerOptions {
                path: "/app",
                no_overwrite_dir_non_dir: "false",
            }),
            Bytes::from(archive_bytes),
        )
        .await
        .context("populating sandbox working directory")?;
    packing
        .await
        .context("source archiving task panicked")?
        .context("packing source archive")?;

    docker
        .start_container(id, None::<StartContainerOptions<String>>)
        .await
        .context("starting sandbox container")?;

    if let Some(input) = &cfg.stdin {
        // The writer half is dropped right after the payload, which closes
        // our side of the stream.
        let attached = docker
            .attach_container(
                id,
                Some(AttachContainerOptions::<String> {
                    stream: Some(true),
                    stdin: Some(true),
                    stdout: Some(false),
                    stderr: Some(false),
                    ..Default::default()
                }),
            )
            .await
            .context("attaching sandbox stdin")?;
        let mut writer = attached.input;
        let mut payload = input.to_vec();
        payload.push(b'\n');
        // A program may exit without reading its input; a failed write is
        // not a sandbox failure.
        if let Err(e) = writer.write_all(&payload).await {
            tracing::warn!(container = %id, error = %e, "failed to write stdin payload");
        } else if let Err(e) = writer.flush().await {
            tracing::warn!(container = %id, error = %e, "failed to flush stdin payload");
        }
    }

    let mut wait = docker.wait_container(
        id,
        Some(WaitContainerOptions {
            condition: "not-running",
        }),
    );

    let status = tokio::select! {
        _ = cfg.cancellation.cancelled() => return Ok(PhaseResult::Cancelled),
        waited = tokio::time::timeout(cfg.deadline, wait.next()) => match waited {
            Err(_) => return Ok(PhaseResult::Halted(cfg.phase.deadline_sentinel())),
            Ok(Some(Ok(_))) => 0,
            // bollard reports nonzero exit statuses through the error
            // channel of the wait stream.
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => code,
            Ok(Some(Err(e))) => return Err(e).context("awaiting sandbox container"),
            Ok(None) => return Ok(PhaseResult::Halted(SANDBOX_ERROR)),
        },
    };

    if let Some(sentinel) = classify_exit(cfg.phase, status) {
        return Ok(PhaseResult::Halted(sentinel));
    }

    let (stdout, stderr) = collect_logs(docker, id).await?;
    Ok(PhaseResult::Exited {
        status,
        stdout,
        stderr,
    })
}

/// Read back the container log and split the multiplexed frames into
/// separate stdout/stderr buffers.
async fn collect_logs(docker: &Docker, id: &str) -> anyhow::Result<(Vec<u8>, Vec<u8>)> {
    let mut logs = docker.logs(
        id,
        Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            ..Default::default()
        }),
    );

    let mut stdout = BytesMut::new();
    let mut stderr = BytesMut::new();
    while let Some(frame) = logs.next().await {
        match frame {
            Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
            Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
            Ok(LogOutput::StdIn { .. }) | Ok(LogOutput::Console { .. }) => {}
            Err(e) if is_recoverable_error(&e) => continue,
            Err(e) => return Err(e).context("reading sandbox log stream"),
        }
    }
    Ok((stdout.to_vec(), stderr.to_vec()))
}

async fn remove(docker: &Docker, id: &str, with_anonymous_volumes: bool) {
    let removal = docker
        .remove_container(
            id,
            Some(RemoveContainerOptions {
                force: true,
                v: with_anonymous_volumes,
                ..Default::default()
            }),
        )
        .await;
    if let Err(e) = removal {
        tracing::warn!(container = %id, error = %e, "failed to remove sandbox container");
    }
}
