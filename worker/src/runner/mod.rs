//! Concrete implementation of running one case inside disposable sandboxes.
//!
//! This module is not responsible for scheduling cases or persisting their
//! results. See [`crate::client`] for corresponding code.

use std::sync::Arc;

use async_trait::async_trait;
use bollard::Docker;
use tokio_util::sync::CancellationToken;

pub mod exec;
pub mod image;
pub mod model;
mod util;
pub mod volume;

pub use self::model::{CaseOutcome, CaseSpec};

use self::exec::{run_phase, SandboxPhaseBuilder};
use self::model::{Phase, PhaseResult, COMPILE_DEADLINE, SANDBOX_ERROR, UNSUPPORTED_LANGUAGE};
use self::volume::ScratchVolume;
use crate::lang::{LanguageKind, LanguageRegistry, LanguageSpec};

/// Runs one case to completion. The seam exists so the submission scheduler
/// can be exercised without a container daemon.
#[async_trait]
pub trait CaseRunner: Send + Sync {
    /// Returns `None` iff the submission scope was cancelled before an
    /// outcome could be produced; every other path, including sandbox
    /// failures, yields exactly one outcome.
    async fn run_case(&self, case: &CaseSpec, scope: &CancellationToken) -> Option<CaseOutcome>;
}

pub struct DockerCaseRunner {
    docker: Docker,
    languages: Arc<LanguageRegistry>,
}

impl DockerCaseRunner {
    pub fn new(docker: Docker, languages: Arc<LanguageRegistry>) -> Self {
        DockerCaseRunner { docker, languages }
    }

    fn phase_builder(&self, case: &CaseSpec, lang: &LanguageSpec) -> SandboxPhaseBuilder {
        SandboxPhaseBuilder::default()
            .image(lang.image.clone())
            .memory_limit_mib(case.memory_limit_mib)
            .source_name(format!("code{}", lang.extension))
            .source(case.code.clone())
    }

    async fn run_interpreted(
        &self,
        case: &CaseSpec,
        lang: &LanguageSpec,
        scope: &CancellationToken,
    ) -> Option<CaseOutcome> {
        let phase = self
            .phase_builder(case, lang)
            .cmd(lang.execute_cmd.clone())
            .phase(Phase::Interpret)
            .deadline(std::time::Duration::from_secs(case.time_limit))
            .stdin(case.stdin.clone())
            .cancellation(scope.child_token())
            .build();
        let phase = match phase {
            Ok(phase) => phase,
            Err(e) => {
                tracing::error!(error = %e, "invalid sandbox phase configuration");
                return Some(CaseOutcome::sentinel(case.index, SANDBOX_ERROR));
            }
        };

        match run_phase(&self.docker, phase).await {
            PhaseResult::Cancelled => None,
            PhaseResult::Halted(sentinel) => Some(CaseOutcome::sentinel(case.index, sentinel)),
            PhaseResult::Exited { stdout, stderr, .. } => {
                Some(CaseOutcome::captured(case.index, stdout, stderr))
            }
        }
    }

    async fn run_compiled(
        &self,
        case: &CaseSpec,
        lang: &LanguageSpec,
        scope: &CancellationToken,
    ) -> Option<CaseOutcome> {
        let compile_cmd = match &lang.compile_cmd {
            Some(cmd) => cmd.clone(),
            None => {
                // Registry parsing rejects this; guard anyway.
                tracing::error!(language = %lang.name, "compiler entry without compile command");
                return Some(CaseOutcome::sentinel(case.index, SANDBOX_ERROR));
            }
        };

        let volume =
            match ScratchVolume::create(self.docker.clone(), &case.submission_id, case.index).await
            {
                Ok(volume) => volume,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to create scratch volume");
                    return Some(CaseOutcome::sentinel(case.index, SANDBOX_ERROR));
                }
            };

        let compile = self
            .phase_builder(case, lang)
            .cmd(compile_cmd)
            .phase(Phase::Compile)
            .deadline(COMPILE_DEADLINE)
            .scratch_volume(volume.name().to_owned())
            .cancellation(scope.child_token())
            .build();
        let compile = match compile {
            Ok(phase) => phase,
            Err(e) => {
                tracing::error!(error = %e, "invalid sandbox phase configuration");
                volume.remove().await;
                return Some(CaseOutcome::sentinel(case.index, SANDBOX_ERROR));
            }
        };

        match run_phase(&self.docker, compile).await {
            PhaseResult::Cancelled => {
                volume.remove().await;
                return None;
            }
            PhaseResult::Halted(sentinel) => {
                volume.remove().await;
                return Some(CaseOutcome::sentinel(case.index, sentinel));
            }
            PhaseResult::Exited {
                status,
                stdout,
                stderr,
            } if status != 0 => {
                // Compiler diagnostics surface as the case's outcome; the
                // execute phase never starts.
                volume.remove().await;
                return Some(CaseOutcome::captured(case.index, stdout, stderr));
            }
            PhaseResult::Exited { .. } => {}
        }

        let run = self
            .phase_builder(case, lang)
            .cmd(lang.execute_cmd.clone())
            .phase(Phase::Run)
            .deadline(std::time::Duration::from_secs(case.time_limit))
            .stdin(case.stdin.clone())
            .scratch_volume(volume.name().to_owned())
            .cancellation(scope.child_token())
            .build();
        let run = match run {
            Ok(phase) => phase,
            Err(e) => {
                tracing::error!(error = %e, "invalid sandbox phase configuration");
                volume.remove().await;
                return Some(CaseOutcome::sentinel(case.index, SANDBOX_ERROR));
            }
        };

        let ran = run_phase(&self.docker, run).await;
        volume.remove().await;
        match ran {
            PhaseResult::Cancelled => None,
            PhaseResult::Halted(sentinel) => Some(CaseOutcome::sentinel(case.index, sentinel)),
            PhaseResult::Exited { stdout, stderr, .. } => {
                Some(CaseOutcome::captured(case.index, stdout, stderr))
            }
        }
    }
}

#[async_trait]
impl CaseRunner for DockerCaseRunner {
    async fn run_case(&self, case: &CaseSpec, scope: &CancellationToken) -> Option<CaseOutcome> {
        let lang = match self.languages.get(&case.language) {
            Some(lang) => lang,
            None => return Some(CaseOutcome::sentinel(case.index, UNSUPPORTED_LANGUAGE)),
        };

        match lang.kind {
            LanguageKind::Interpreter => self.run_interpreted(case, lang, scope).await,
            LanguageKind::Compiler => self.run_compiled(case, lang, scope).await,
        }
    }
}
