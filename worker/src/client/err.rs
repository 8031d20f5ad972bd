use err_derive::Error;

/// Failures of one delivery's pipeline. All of these are recoverable at the
/// worker level: they are logged and the delivery is still acknowledged.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error(display = "no cache record for submission {}", _0)]
    CacheMiss(String),

    #[error(display = "cache error: {}", _0)]
    Cache(#[error(source)] redis::RedisError),

    #[error(display = "malformed record: {}", _0)]
    Parse(#[error(source)] serde_json::Error),

    #[error(display = "undecodable base64 field: {}", _0)]
    Decode(#[error(source)] base64::DecodeError),

    #[error(display = "record invariant violated: {}", _0)]
    Invariant(String),

    #[error(display = "judge request failed: {}", _0)]
    Judge(#[error(source)] reqwest::Error),
}
