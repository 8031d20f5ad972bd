//! The worker's outward face: the durable queue consumer and the pipeline
//! that drives one submission from delivery to acknowledgement.

pub mod cache;
pub mod config;
mod err;
pub mod judge;
pub mod model;

pub use self::err::SubmissionError;

use std::{sync::Arc, time::Instant};

use anyhow::{bail, Context};
use bytes::Bytes;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{BasicAckOptions, BasicConsumeOptions, BasicQosOptions, QueueDeclareOptions},
    types::FieldTable,
    Connection, ConnectionProperties,
};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use self::config::SharedWorkerData;
use self::model::{Submission, SubmissionToken};
use crate::runner::{
    model::SANDBOX_ERROR, CaseOutcome, CaseRunner, CaseSpec, DockerCaseRunner,
};

/// How many cases of one submission may execute at once. Container startup
/// dominates wall time; more parallelism overloads the daemon.
const CASE_PARALLELISM: usize = 2;

const CONSUMER_TAG: &str = "cee";

/// Establish the durable consumer and dispatch deliveries until the broker
/// connection goes away. Prefetch is 1: a worker owns at most one
/// submission at a time.
pub async fn consume(data: Arc<SharedWorkerData>) -> anyhow::Result<()> {
    let conn = Connection::connect(&data.cfg.amqp_url(), ConnectionProperties::default())
        .await
        .context("connecting to the message broker")?;
    conn.on_error(|e| tracing::error!(error = %e, "broker connection closed"));

    let channel = conn
        .create_channel()
        .await
        .context("opening broker channel")?;
    channel
        .queue_declare(
            &data.cfg.queue_name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .context("declaring work queue")?;
    channel
        .basic_qos(1, BasicQosOptions::default())
        .await
        .context("setting prefetch count")?;

    let mut consumer = channel
        .basic_consume(
            &data.cfg.queue_name,
            CONSUMER_TAG,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .context("registering consumer")?;

    tracing::info!(queue = %data.cfg.queue_name, "consuming");

    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                tracing::error!(error = %e, "failed to receive delivery");
                continue;
            }
        };
        let data = data.clone();
        tokio::spawn(async move { handle_delivery(delivery, data).await });
    }

    // Unacknowledged deliveries are redelivered after the supervisor
    // restarts us.
    bail!("consumer stream ended");
}

/// Run the full pipeline for one delivery, then acknowledge it. The ack
/// happens on every path so a poisoned message cannot wedge the queue;
/// a crash before this point causes redelivery and full re-execution.
async fn handle_delivery(delivery: Delivery, data: Arc<SharedWorkerData>) {
    let started = Instant::now();
    match serde_json::from_slice::<SubmissionToken>(&delivery.data) {
        Ok(token) => {
            let id = token.submission_id;
            if let Err(e) = process_submission(&id, &data)
                .instrument(tracing::info_span!("submission", %id))
                .await
            {
                tracing::warn!(%id, error = %e, "submission aborted");
            }
            tracing::info!(%id, elapsed_s = started.elapsed().as_secs_f64(), "delivery processed");
        }
        Err(e) => tracing::warn!(error = %e, "undecodable delivery body"),
    }

    if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
        tracing::error!(error = %e, "failed to acknowledge delivery");
    }
}

async fn process_submission(id: &str, data: &Arc<SharedWorkerData>) -> Result<(), SubmissionError> {
    let mut submission = data.cache.get(id).await?;
    submission.validate()?;
    let cases = prepare_cases(&submission)?;
    tracing::info!(cases = cases.len(), language = %submission.language, "running submission");

    let runner = Arc::new(DockerCaseRunner::new(
        data.docker.clone(),
        data.languages.clone(),
    ));
    let outcomes = run_submission(runner, cases).await;

    store_outcomes(&mut submission, &outcomes);
    data.cache.put(&submission).await?;

    let status = judge::notify_judge(&data.http, id).await?;
    if status == 200 {
        // The judge may have rewritten the record; re-read before updating
        // the status.
        let mut judged = data.cache.get(id).await?;
        judged.status = model::STATUS_DONE.to_owned();
        data.cache.put(&judged).await?;
        tracing::info!("submission marked done");
    } else {
        tracing::warn!(status, "judge did not accept the submission");
    }
    Ok(())
}

/// Decode the submission into per-case specs. Each case gets its own copy
/// of the source with only its own replacement list applied.
fn prepare_cases(submission: &Submission) -> Result<Vec<CaseSpec>, SubmissionError> {
    let code = model::decode_field(&submission.code)?;
    let mut cases = Vec::with_capacity(submission.case_count());
    for (index, stdin) in submission.stdin.iter().enumerate() {
        let stdin = model::decode_field(stdin)?;
        let source = model::apply_replacements(&code, &submission.replace[index])?;
        cases.push(CaseSpec {
            submission_id: submission.submission_id.clone(),
            index,
            language: submission.language.clone(),
            code: Bytes::from(source),
            stdin: Bytes::from(stdin),
            time_limit: submission.time_limit[index],
            memory_limit_mib: submission.memory_limit[index],
        });
    }
    Ok(cases)
}

/// Fan the cases out under the per-submission concurrency cap, collect one
/// outcome per case and hand them back in case-index order.
///
/// Collection order is completion order; the reorder pass at the end is
/// what guarantees that persisted entry `j` answers `stdin[j]`. The scope
/// is cancelled only after all outcomes are in, so under normal operation
/// it never suppresses one, only reaps stragglers on error paths. A case
/// task that dies without publishing (cancelled or panicked) leaves a
/// sandbox-error sentinel in its slot.
pub(crate) async fn run_submission(
    runner: Arc<dyn CaseRunner>,
    cases: Vec<CaseSpec>,
) -> Vec<CaseOutcome> {
    let total = cases.len();
    let (outcome_tx, mut outcome_rx) = mpsc::channel(total.max(1));
    let scope = CancellationToken::new();
    let tokens = Arc::new(Semaphore::new(CASE_PARALLELISM));

    for case in cases {
        let permit = match tokens.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break, // the pool is never closed
        };
        let runner = runner.clone();
        let outcome_tx = outcome_tx.clone();
        let scope = scope.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Some(outcome) = runner.run_case(&case, &scope).await {
                // A straggler must not publish into a finished collection.
                if scope.is_cancelled() {
                    return;
                }
                let _ = outcome_tx.send(outcome).await;
            }
        });
    }
    drop(outcome_tx);

    let mut collected = Vec::with_capacity(total);
    while collected.len() < total {
        match outcome_rx.recv().await {
            Some(outcome) => collected.push(outcome),
            None => break, // every sender is gone; some case published nothing
        }
    }
    scope.cancel();

    let mut slots: Vec<Option<CaseOutcome>> = (0..total).map(|_| None).collect();
    for outcome in collected {
        if outcome.index < total {
            let idx = outcome.index;
            slots[idx] = Some(outcome);
        }
    }
    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| slot.unwrap_or_else(|| CaseOutcome::sentinel(index, SANDBOX_ERROR)))
        .collect()
}

/// Write the ordered outcomes into the record. The output arrays are
/// replaced, never appended to, so redelivered jobs stay idempotent.
pub(crate) fn store_outcomes(submission: &mut Submission, outcomes: &[CaseOutcome]) {
    submission.stdout.clear();
    submission.stderr.clear();
    for outcome in outcomes {
        submission.stdout.push(model::encode_field(&outcome.stdout));
        submission.stderr.push(model::encode_field(&outcome.stderr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::model::ReplacePair;

    fn b64(bytes: &[u8]) -> String {
        model::encode_field(bytes)
    }

    fn two_case_submission() -> Submission {
        Submission {
            submission_id: "sub-7".into(),
            language: "py".into(),
            code: b64(b"print('X')"),
            stdin: vec![b64(b"slow\n"), b64(b"fast\n")],
            replace: vec![
                vec![ReplacePair {
                    from: b64(b"X"),
                    to: b64(b"Y"),
                }],
                vec![],
            ],
            time_limit: vec![1, 2],
            memory_limit: vec![64, 128],
            stdout: vec![],
            stderr: vec![],
            status: String::new(),
        }
    }

    #[test]
    fn cases_decode_with_per_case_replacements() {
        let cases = prepare_cases(&two_case_submission()).unwrap();
        assert_eq!(cases.len(), 2);
        assert_eq!(&cases[0].code[..], b"print('Y')");
        assert_eq!(&cases[1].code[..], b"print('X')");
        assert_eq!(&cases[0].stdin[..], b"slow\n");
        assert_eq!(cases[1].time_limit, 2);
        assert_eq!(cases[1].memory_limit_mib, 128);
    }

    #[test]
    fn undecodable_stdin_fails_the_pipeline() {
        let mut submission = two_case_submission();
        submission.stdin[1] = "not-base64!".into();
        assert!(matches!(
            prepare_cases(&submission),
            Err(SubmissionError::Decode(_))
        ));
    }

    #[test]
    fn outcomes_replace_previous_outputs() {
        let mut submission = two_case_submission();
        submission.stdout = vec![b64(b"stale"), b64(b"stale")];
        submission.stderr = vec![b64(b"stale"), b64(b"stale")];

        let outcomes = vec![
            CaseOutcome::captured(0, b"84\n".to_vec(), Vec::new()),
            CaseOutcome::sentinel(1, "Time Limit Exceeded"),
        ];
        store_outcomes(&mut submission, &outcomes);

        assert_eq!(submission.stdout, vec![b64(b"84\n"), b64(b"")]);
        assert_eq!(
            submission.stderr,
            vec![b64(b""), b64(b"Time Limit Exceeded")]
        );
    }

    #[test]
    fn stored_outputs_preserve_raw_container_bytes() {
        let mut submission = two_case_submission();
        let raw = vec![0u8, 0xff, 0x80, b'\n'];
        store_outcomes(
            &mut submission,
            &[
                CaseOutcome::captured(0, raw.clone(), Vec::new()),
                CaseOutcome::captured(1, Vec::new(), Vec::new()),
            ],
        );
        assert_eq!(model::decode_field(&submission.stdout[0]).unwrap(), raw);
    }
}
