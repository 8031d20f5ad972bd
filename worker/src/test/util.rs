//! Test support: a scripted case runner that never touches the container
//! daemon.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::runner::{CaseOutcome, CaseRunner, CaseSpec};

/// Runs each case after an artificial per-index delay, emitting
/// `case-<index>` on stdout. Tracks how many cases are in flight at once.
pub struct MockRunner {
    delays: Vec<Duration>,
    active: AtomicUsize,
    peak: Arc<AtomicUsize>,
}

impl MockRunner {
    pub fn new(delays: Vec<Duration>) -> MockRunner {
        MockRunner {
            delays,
            active: AtomicUsize::new(0),
            peak: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn peak_gauge(&self) -> Arc<AtomicUsize> {
        self.peak.clone()
    }
}

#[async_trait]
impl CaseRunner for MockRunner {
    async fn run_case(&self, case: &CaseSpec, scope: &CancellationToken) -> Option<CaseOutcome> {
        let in_flight = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(in_flight, Ordering::SeqCst);

        let delay = self
            .delays
            .get(case.index)
            .copied()
            .unwrap_or(Duration::ZERO);
        tokio::time::sleep(delay).await;

        self.active.fetch_sub(1, Ordering::SeqCst);
        if scope.is_cancelled() {
            return None;
        }
        Some(CaseOutcome::captured(
            case.index,
            format!("case-{}", case.index).into_bytes(),
            Vec::new(),
        ))
    }
}

/// A runner that never produces an outcome, as if every case task died.
pub struct SilentRunner;

#[async_trait]
impl CaseRunner for SilentRunner {
    async fn run_case(&self, _case: &CaseSpec, _scope: &CancellationToken) -> Option<CaseOutcome> {
        None
    }
}

pub fn case(index: usize) -> CaseSpec {
    CaseSpec {
        submission_id: "sub-test".into(),
        index,
        language: "py".into(),
        code: Bytes::from_static(b"print('ok')"),
        stdin: Bytes::new(),
        time_limit: 1,
        memory_limit_mib: 64,
    }
}

pub fn cases(count: usize) -> Vec<CaseSpec> {
    (0..count).map(case).collect()
}
