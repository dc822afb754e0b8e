//! Retry key derivation.
//!
//! The retry key is the only thing tying a job to its attempt counter and
//! failure snapshot in the store:
//!
//! ```text
//! resque-retry:<JobName>:<identifier>
//! ```
//!
//! The identifier segment is dropped entirely for jobs without arguments.

use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::job::Job;

/// Prefix of every retry key.
pub const RETRY_KEY_PREFIX: &str = "resque-retry";

/// Prefix of failure snapshot keys.
pub const FAILURE_KEY_PREFIX: &str = "failure-";

/// Default identifier: arguments stringified and joined with `-`.
///
/// Nested arrays are flattened into the join. Returns `None` when the joined
/// string is empty.
#[must_use]
pub fn default_identifier(args: &[Value]) -> Option<String> {
    let mut parts = Vec::with_capacity(args.len());
    for arg in args {
        push_stringified(arg, &mut parts);
    }
    let joined = parts.join("-");
    if joined.is_empty() { None } else { Some(joined) }
}

/// Identifier for job types with long or deeply nested arguments: the hex
/// SHA-256 of the JSON-encoded argument list.
#[must_use]
pub fn hashed_identifier(args: &[Value]) -> Option<String> {
    if args.is_empty() {
        return None;
    }
    let encoded = Value::Array(args.to_vec()).to_string();
    Some(hex::encode(Sha256::digest(encoded.as_bytes())))
}

/// Build a retry key from a job name and an identifier segment.
#[must_use]
pub fn retry_key(job_name: &str, identifier: Option<&str>) -> String {
    let mut segments = vec![RETRY_KEY_PREFIX, job_name];
    if let Some(identifier) = identifier {
        segments.push(identifier);
    }
    segments
        .join(":")
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect()
}

/// Retry key for a job name and arguments, using the default identifier.
#[must_use]
pub fn redis_retry_key(job_name: &str, args: &[Value]) -> String {
    retry_key(job_name, default_identifier(args).as_deref())
}

/// Retry key for a job type, honouring its identifier override.
#[must_use]
pub fn retry_key_for_job(job: &dyn Job, args: &[Value]) -> String {
    retry_key(job.name(), job.retry_identifier(args).as_deref())
}

/// Key of the failure snapshot kept for a pending retry.
#[must_use]
pub fn failure_key_for(retry_key: &str) -> String {
    format!("{FAILURE_KEY_PREFIX}{retry_key}")
}

fn push_stringified(value: &Value, parts: &mut Vec<String>) {
    match value {
        Value::Null => parts.push(String::new()),
        Value::String(s) => parts.push(s.clone()),
        Value::Array(items) => {
            for item in items {
                push_stringified(item, parts);
            }
        }
        other => parts.push(other.to_string()),
    }
}
