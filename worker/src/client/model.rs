use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};

use crate::client::err::SubmissionError;

/// Status the worker writes once the judge has acknowledged the submission.
pub const STATUS_DONE: &str = "done execution";

/// Body of a work-queue delivery.
#[derive(Debug, Deserialize)]
pub struct SubmissionToken {
    pub submission_id: String,
}

/// One literal byte-substring substitution, both sides base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplacePair {
    pub from: String,
    pub to: String,
}

/// The cache record for one submission. The worker mutates only `stdout`,
/// `stderr` and `status`; everything else is owned upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Submission {
    pub submission_id: String,
    pub language: String,
    /// User source, base64-encoded.
    pub code: String,
    /// Per-case inputs, base64-encoded. Its length defines the case count.
    pub stdin: Vec<String>,
    /// Per-case replacement lists applied to the decoded source.
    pub replace: Vec<Vec<ReplacePair>>,
    /// Per-case execute wall-clock limits, seconds.
    pub time_limit: Vec<u64>,
    /// Per-case memory caps, MiB.
    pub memory_limit: Vec<i64>,
    #[serde(default)]
    pub stdout: Vec<String>,
    #[serde(default)]
    pub stderr: Vec<String>,
    #[serde(default)]
    pub status: String,
}

impl Submission {
    pub fn case_count(&self) -> usize {
        self.stdin.len()
    }

    /// The four per-case vectors must agree in length.
    pub fn validate(&self) -> Result<(), SubmissionError> {
        let n = self.stdin.len();
        if self.replace.len() != n || self.time_limit.len() != n || self.memory_limit.len() != n {
            return Err(SubmissionError::Invariant(format!(
                "per-case vectors disagree: stdin={}, replace={}, time_limit={}, memory_limit={}",
                n,
                self.replace.len(),
                self.time_limit.len(),
                self.memory_limit.len()
            )));
        }
        Ok(())
    }
}

pub fn decode_field(field: &str) -> Result<Vec<u8>, base64::DecodeError> {
    general_purpose::STANDARD.decode(field)
}

pub fn encode_field(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// Apply a case's replacement list to the decoded source, in list order,
/// substituting every occurrence. The input is not shared with any other
/// case, so replacements never leak between cases.
pub fn apply_replacements(
    code: &[u8],
    pairs: &[ReplacePair],
) -> Result<Vec<u8>, base64::DecodeError> {
    let mut source = code.to_vec();
    for pair in pairs {
        let from = decode_field(&pair.from)?;
        let to = decode_field(&pair.to)?;
        source = replace_all(&source, &from, &to);
    }
    Ok(source)
}

/// Replace every non-overlapping occurrence of `from` in `haystack`,
/// scanning left to right. An empty pattern is a no-op.
fn replace_all(haystack: &[u8], from: &[u8], to: &[u8]) -> Vec<u8> {
    if from.is_empty() {
        return haystack.to_vec();
    }

    let mut replaced = Vec::with_capacity(haystack.len());
    let mut rest = haystack;
    while let Some(at) = find(rest, from) {
        replaced.extend_from_slice(&rest[..at]);
        replaced.extend_from_slice(to);
        rest = &rest[at + from.len()..];
    }
    replaced.extend_from_slice(rest);
    replaced
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b64(s: &str) -> String {
        encode_field(s.as_bytes())
    }

    fn pair(from: &str, to: &str) -> ReplacePair {
        ReplacePair {
            from: b64(from),
            to: b64(to),
        }
    }

    #[test]
    fn replaces_every_occurrence_in_list_order() {
        let code = b"a = X; b = X; print(X)";
        let replaced = apply_replacements(code, &[pair("X", "1"), pair("b", "c")]).unwrap();
        assert_eq!(replaced, b"a = 1; c = 1; print(1)");
    }

    #[test]
    fn later_pairs_see_earlier_substitutions() {
        let replaced = apply_replacements(b"ab", &[pair("a", "bb"), pair("bb", "c")]).unwrap();
        assert_eq!(replaced, b"cb");
    }

    #[test]
    fn empty_pattern_is_a_no_op() {
        let replaced = apply_replacements(b"print('X')", &[pair("", "Y")]).unwrap();
        assert_eq!(replaced, b"print('X')");
    }

    #[test]
    fn replacements_do_not_leak_between_cases() {
        let code = b"print('X')";
        let case0 = apply_replacements(code, &[pair("X", "Y")]).unwrap();
        let case1 = apply_replacements(code, &[]).unwrap();
        assert_eq!(case0, b"print('Y')");
        assert_eq!(case1, b"print('X')");
    }

    #[test]
    fn undecodable_pair_is_an_error() {
        let bad = ReplacePair {
            from: "!!!".into(),
            to: b64("Y"),
        };
        assert!(apply_replacements(b"code", &[bad]).is_err());
    }

    #[test]
    fn base64_round_trip_preserves_arbitrary_bytes() {
        let payload = vec![0u8, 0xff, 0x80, b'\n', 0x7f];
        assert_eq!(decode_field(&encode_field(&payload)).unwrap(), payload);
    }

    #[test]
    fn record_parses_from_upstream_json() {
        let raw = serde_json::json!({
            "submission_id": "sub-1",
            "language": "py",
            "code": b64("print(int(input())*2)"),
            "stdin": [b64("42\n")],
            "replace": [[]],
            "time_limit": [1],
            "memory_limit": [64],
            "stdout": [],
            "stderr": [],
            "status": ""
        });
        let submission: Submission = serde_json::from_value(raw).unwrap();
        assert_eq!(submission.case_count(), 1);
        submission.validate().unwrap();
        assert_eq!(
            decode_field(&submission.stdin[0]).unwrap(),
            b"42\n".to_vec()
        );
    }

    #[test]
    fn mismatched_vectors_fail_validation() {
        let submission = Submission {
            submission_id: "sub-1".into(),
            language: "py".into(),
            code: b64("pass"),
            stdin: vec![b64("")],
            replace: vec![],
            time_limit: vec![1],
            memory_limit: vec![64],
            stdout: vec![],
            stderr: vec![],
            status: String::new(),
        };
        assert!(submission.validate().is_err());
    }
}
