//! Wire shape of a job record, as polled by orchestrators.
//!
//! The key set is fixed. Empty optional values are rendered as `""`
//! (strings/timestamps) or `null` (`exit_code`), never omitted.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use super::record::JobRecord;

/// Keys of the wire shape, in emission order.
pub const WIRE_KEYS: [&str; 20] = [
    "run_id",
    "job_id",
    "step_name",
    "inputs_hash",
    "status",
    "progress",
    "message",
    "created_at",
    "started_at",
    "finished_at",
    "exit_code",
    "metrics",
    "artifacts",
    "error_code",
    "error_message",
    "idempotent",
    "cached_job_id",
    "worker_id",
    "log_path",
    "receipt_path",
];

fn timestamp(at: Option<DateTime<Utc>>) -> Value {
    Value::String(
        at.map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
            .unwrap_or_default(),
    )
}

/// Flatten a record into its wire map.
pub fn serialize_record(record: &JobRecord) -> Map<String, Value> {
    let env = &record.envelope;
    let artifacts = record
        .artifacts
        .iter()
        .map(|a| {
            let mut obj = Map::new();
            obj.insert("type".into(), Value::String(a.kind.clone()));
            obj.insert("path".into(), Value::String(a.path.clone()));
            Value::Object(obj)
        })
        .collect();
    let progress = serde_json::Number::from_f64(record.progress)
        .map(Value::Number)
        .unwrap_or_else(|| Value::from(0));

    let mut out = Map::new();
    out.insert("run_id".into(), env.run_id().into());
    out.insert("job_id".into(), env.job_id().into());
    out.insert("step_name".into(), env.step_name().into());
    out.insert("inputs_hash".into(), env.inputs_hash().into());
    out.insert("status".into(), record.status.as_str().into());
    out.insert("progress".into(), progress);
    out.insert("message".into(), record.message.clone().into());
    out.insert("created_at".into(), timestamp(record.created_at));
    out.insert("started_at".into(), timestamp(record.started_at));
    out.insert("finished_at".into(), timestamp(record.finished_at));
    out.insert(
        "exit_code".into(),
        record.exit_code.map(Value::from).unwrap_or(Value::Null),
    );
    out.insert("metrics".into(), Value::Object(record.metrics.clone()));
    out.insert("artifacts".into(), Value::Array(artifacts));
    out.insert("error_code".into(), record.error_code.clone().into());
    out.insert("error_message".into(), record.error_message.clone().into());
    out.insert("idempotent".into(), record.idempotent.into());
    out.insert("cached_job_id".into(), record.cached_job_id.clone().into());
    out.insert(
        "worker_id".into(),
        record
            .worker_id
            .map(|w| w.to_string())
            .unwrap_or_default()
            .into(),
    );
    out.insert("log_path".into(), record.log_path.clone().into());
    out.insert("receipt_path".into(), record.receipt_path.clone().into());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ArtifactRef, Envelope, StepOutput, WorkerId};
    use chrono::TimeZone;
    use std::collections::BTreeSet;
    use ulid::Ulid;

    fn keys(map: &Map<String, Value>) -> BTreeSet<&str> {
        map.keys().map(String::as_str).collect()
    }

    #[test]
    fn fresh_record_has_every_key() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        let rec = JobRecord::new(Envelope::new("", "", "", "", "", ""), now);
        let wire = serialize_record(&rec);

        assert_eq!(keys(&wire), WIRE_KEYS.into_iter().collect());
        assert_eq!(wire["status"], "queued");
        assert_eq!(wire["created_at"], "2024-05-01T08:30:00.000Z");
        assert_eq!(wire["started_at"], "");
        assert_eq!(wire["exit_code"], Value::Null);
        assert_eq!(wire["worker_id"], "");
    }

    #[test]
    fn finished_record_has_the_same_keys() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        let mut rec = JobRecord::new(Envelope::new("r", "j", "render", "h", "t", "a"), now);
        rec.start(WorkerId::from_ulid(Ulid::new()), now);
        rec.mark_succeeded(
            StepOutput::new()
                .with_metric("duration_s", 41.5.into())
                .with_artifact(ArtifactRef::new("video", "out/final.mp4"))
                .with_log_path("logs/render.log"),
            now,
        );
        let wire = serialize_record(&rec);

        assert_eq!(keys(&wire), WIRE_KEYS.into_iter().collect());
        assert_eq!(wire["run_id"], "r");
        assert_eq!(wire["step_name"], "render");
        assert_eq!(wire["status"], "succeeded");
        assert_eq!(wire["progress"], 1.0);
        assert_eq!(wire["exit_code"], 0);
        assert_eq!(wire["artifacts"][0]["type"], "video");
        assert_eq!(wire["artifacts"][0]["path"], "out/final.mp4");
        assert!(wire["worker_id"].as_str().unwrap().starts_with("worker-"));
    }

    #[test]
    fn serialization_is_deterministic() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 8, 30, 0).unwrap();
        let rec = JobRecord::new(Envelope::new("r", "j", "s", "h", "t", "a"), now);
        assert_eq!(serialize_record(&rec), serialize_record(&rec));
    }
}
