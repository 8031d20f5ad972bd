use crate::client::err::SubmissionError;

/// The downstream judging service. Fixed in-cluster address.
const JUDGE_ENDPOINT: &str = "http://judge.judge.svc.cluster.local/judge";

/// Ask the judge to score a submission whose outputs are in the cache.
/// Returns the HTTP status code; only 200 means the judge accepted it.
pub async fn notify_judge(
    http: &reqwest::Client,
    submission_id: &str,
) -> Result<u16, SubmissionError> {
    if submission_id.is_empty() {
        return Err(SubmissionError::Invariant(
            "refusing to notify the judge with an empty submission id".into(),
        ));
    }

    let response = http
        .post(JUDGE_ENDPOINT)
        .json(&serde_json::json!({ "submission_id": submission_id }))
        .send()
        .await?;
    Ok(response.status().as_u16())
}
