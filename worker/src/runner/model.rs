use std::time::Duration;

use bytes::Bytes;

/// Diagnostic sentinel for container-runtime failures (daemon errors, attach
/// failures and the like). The submission is not failed; the user is asked
/// to resubmit.
pub const SANDBOX_ERROR: &str = "Sandbox error, try to run again";

/// Diagnostic sentinel for a compile command that the image cannot resolve
/// (exit status 127).
pub const COMPILE_INVALID_COMMAND: &str = "Compile Error, Invalid Command";

/// Diagnostic sentinel for a language name with no registry entry.
pub const UNSUPPORTED_LANGUAGE: &str = "Unsupported language";

/// Wall-clock budget of a compile phase. Execute phases use the per-case
/// time limit instead.
pub const COMPILE_DEADLINE: Duration = Duration::from_secs(5);

/// One test case of a submission, fully decoded: the per-case replacements
/// have already been applied to `code`.
#[derive(Debug, Clone)]
pub struct CaseSpec {
    pub submission_id: String,
    pub index: usize,
    pub language: String,
    pub code: Bytes,
    pub stdin: Bytes,
    /// Execute-phase wall-clock limit, seconds.
    pub time_limit: u64,
    /// Hard memory cap, MiB.
    pub memory_limit_mib: i64,
}

/// The captured result of one case. `stderr` carries a diagnostic sentinel
/// for non-normal terminations.
///
/// Buffers stay raw bytes end to end so that base64-encoding them preserves
/// the exact container output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaseOutcome {
    pub index: usize,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CaseOutcome {
    pub fn captured(index: usize, stdout: Vec<u8>, stderr: Vec<u8>) -> Self {
        CaseOutcome {
            index,
            stdout,
            stderr,
        }
    }

    /// An outcome with empty stdout and a sentinel in stderr.
    pub fn sentinel(index: usize, sentinel: &str) -> Self {
        CaseOutcome {
            index,
            stdout: Vec::new(),
            stderr: sentinel.as_bytes().to_vec(),
        }
    }
}

/// Which phase a sandbox container is running. Resource limits and sentinel
/// strings depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The single execute phase of an interpreted language.
    Interpret,
    /// The compile phase of a compiled language.
    Compile,
    /// The execute phase following a successful compile.
    Run,
}

impl Phase {
    pub fn deadline_sentinel(self) -> &'static str {
        match self {
            Phase::Interpret => "Time Limit Exceeded",
            Phase::Compile => "Compile Time Limit Exceeded",
            Phase::Run => "Run Time Limit Exceeded",
        }
    }

    pub fn memory_sentinel(self) -> &'static str {
        match self {
            Phase::Interpret => "Memory Limit Exceeded",
            Phase::Compile => "Compile Memory Limit Exceeded",
            Phase::Run => "Run Time Memory Limit Exceeded",
        }
    }

    /// `(soft, hard)` nproc ulimit. Programs running behind a compile step
    /// get a much tighter process budget.
    pub fn nproc_ulimit(self) -> (i64, i64) {
        match self {
            Phase::Interpret | Phase::Compile => (1024, 2048),
            Phase::Run => (100, 1024),
        }
    }
}

/// Terminal state of one sandbox phase.
#[derive(Debug)]
pub enum PhaseResult {
    /// The container exited on its own; logs have been demultiplexed.
    Exited {
        status: i64,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
    /// The phase was halted by classification; the sentinel becomes the
    /// outcome's stderr.
    Halted(&'static str),
    /// The submission scope was cancelled; no outcome may be published.
    Cancelled,
}

/// Map an exit status to a halt sentinel, if any. Status 137 is the cgroup
/// OOM kill; 127 during compile is an unresolvable command.
pub(crate) fn classify_exit(phase: Phase, status: i64) -> Option<&'static str> {
    match status {
        137 => Some(phase.memory_sentinel()),
        127 if phase == Phase::Compile => Some(COMPILE_INVALID_COMMAND),
        _ => None,
    }
}
