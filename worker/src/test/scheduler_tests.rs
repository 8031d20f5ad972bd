//! Tests to verify the submission scheduler's fan-out invariants.

use std::sync::Arc;
use std::time::Duration;

use crate::client::run_submission;
use crate::lang::LanguageRegistry;
use crate::runner::{
    model::{SANDBOX_ERROR, UNSUPPORTED_LANGUAGE},
    CaseRunner, DockerCaseRunner,
};

use super::util::{case, cases, MockRunner, SilentRunner};

#[tokio::test]
async fn outcomes_follow_case_order_even_when_completion_flips() {
    // Case 0 is slow and case 1 returns immediately, so collection order is
    // 1 then 0; the persisted order must still be 0 then 1.
    let runner = MockRunner::new(vec![Duration::from_millis(200), Duration::from_millis(1)]);
    let outcomes = run_submission(Arc::new(runner), cases(2)).await;

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].index, 0);
    assert_eq!(outcomes[0].stdout, b"case-0".to_vec());
    assert_eq!(outcomes[1].index, 1);
    assert_eq!(outcomes[1].stdout, b"case-1".to_vec());
}

#[tokio::test]
async fn at_most_two_cases_run_concurrently() {
    let runner = MockRunner::new(vec![Duration::from_millis(30); 6]);
    let peak = runner.peak_gauge();
    let outcomes = run_submission(Arc::new(runner), cases(6)).await;

    assert_eq!(outcomes.len(), 6);
    assert!(
        peak.load(std::sync::atomic::Ordering::SeqCst) <= 2,
        "more than two cases were in flight"
    );
}

#[tokio::test]
async fn a_case_that_publishes_nothing_leaves_a_sandbox_sentinel() {
    let outcomes = run_submission(Arc::new(SilentRunner), cases(3)).await;

    assert_eq!(outcomes.len(), 3);
    for (index, outcome) in outcomes.iter().enumerate() {
        assert_eq!(outcome.index, index);
        assert!(outcome.stdout.is_empty());
        assert_eq!(outcome.stderr, SANDBOX_ERROR.as_bytes().to_vec());
    }
}

#[tokio::test]
async fn empty_submissions_complete_without_outcomes() {
    let runner = MockRunner::new(Vec::new());
    let outcomes = run_submission(Arc::new(runner), Vec::new()).await;
    assert!(outcomes.is_empty());
}

#[tokio::test]
async fn unknown_language_yields_its_sentinel_without_a_daemon() {
    // The Docker client is lazily connected, so an unknown language never
    // touches the daemon at all.
    let docker = bollard::Docker::connect_with_local_defaults().unwrap();
    let registry =
        LanguageRegistry::parse("py@python:3.11@.py@interpreter@python code.py").unwrap();
    let runner = DockerCaseRunner::new(docker, Arc::new(registry));

    let mut unknown = case(0);
    unknown.language = "brainfuck".into();
    let scope = tokio_util::sync::CancellationToken::new();
    let outcome = runner.run_case(&unknown, &scope).await.unwrap();

    assert!(outcome.stdout.is_empty());
    assert_eq!(outcome.stderr, UNSUPPORTED_LANGUAGE.as_bytes().to_vec());
}

#[tokio::test]
async fn cancelled_scope_suppresses_publishing() {
    let runner = MockRunner::new(vec![Duration::from_millis(10)]);
    let scope = tokio_util::sync::CancellationToken::new();
    scope.cancel();
    assert!(runner.run_case(&case(0), &scope).await.is_none());
}
