//! Envelope: the identifying header of one pipeline step request/response.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one step request.
///
/// Every field is required on the wire. An empty string is a valid value,
/// but a missing field fails deserialization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    run_id: String,
    job_id: String,
    step_name: String,
    inputs_hash: String,
    timestamp: String,
    auth_token: String,
}

impl Envelope {
    pub fn new(
        run_id: impl Into<String>,
        job_id: impl Into<String>,
        step_name: impl Into<String>,
        inputs_hash: impl Into<String>,
        timestamp: impl Into<String>,
        auth_token: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            job_id: job_id.into(),
            step_name: step_name.into(),
            inputs_hash: inputs_hash.into(),
            timestamp: timestamp.into(),
            auth_token: auth_token.into(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn step_name(&self) -> &str {
        &self.step_name
    }

    pub fn inputs_hash(&self) -> &str {
        &self.inputs_hash
    }

    pub fn timestamp(&self) -> &str {
        &self.timestamp
    }

    pub fn auth_token(&self) -> &str {
        &self.auth_token
    }

    /// Idempotency identity of this request.
    pub fn job_key(&self) -> JobKey {
        job_key(self)
    }
}

/// `step_name:inputs_hash`.
///
/// Two envelopes with the same step and byte-identical inputs map to the same
/// key no matter which run, job or timestamp they carry. This is what makes a
/// retried request hit the cache instead of re-running side effects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKey(String);

impl JobKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

pub fn job_key(envelope: &Envelope) -> JobKey {
    JobKey(format!("{}:{}", envelope.step_name, envelope.inputs_hash))
}
