//! Placeholder handlers for the job types this binary serves.
//!
//! The real CSV, enforcement and enrichment logic lives with its owners and
//! plugs in through `HandlerRegistry`. These only acknowledge the job so the
//! queue can be exercised end to end. Payloads are opaque: the only check is
//! that they are JSON objects, plus `batch_id` for CSV batches.

use collectq_infra::jobs::JobType;
use collectq_infra::worker::{HandlerError, HandlerRegistry};
use serde_json::{Value, json};

pub fn registry() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register_fn(JobType::IngestCsv, |payload| async move { ingest_csv(&payload) })
        .register_fn(JobType::Enforce, |payload| async move {
            acknowledge(&JobType::Enforce, &payload)
        })
        .register_fn(JobType::Enrich, |payload| async move {
            acknowledge(&JobType::Enrich, &payload)
        });
    registry
}

fn ingest_csv(payload: &Value) -> Result<Value, HandlerError> {
    let batch_id = payload
        .get("batch_id")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| HandlerError::permanent("payload is missing `batch_id`"))?;
    Ok(json!({ "job_type": JobType::IngestCsv.as_str(), "batch_id": batch_id }))
}

fn acknowledge(job_type: &JobType, payload: &Value) -> Result<Value, HandlerError> {
    if !payload.is_object() {
        return Err(HandlerError::permanent("payload must be a JSON object"));
    }
    Ok(json!({ "job_type": job_type.as_str() }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_serves_all_builtin_types() {
        assert_eq!(
            registry().job_types(),
            vec![JobType::IngestCsv, JobType::Enforce, JobType::Enrich]
        );
    }

    #[tokio::test]
    async fn csv_batch_with_only_a_batch_id_completes() {
        let handler = registry().get(&JobType::IngestCsv).unwrap();
        let out = handler.handle(json!({ "batch_id": "b1" })).await.unwrap();
        assert_eq!(out, json!({ "job_type": "ingest_csv", "batch_id": "b1" }));
    }

    #[tokio::test]
    async fn malformed_payloads_fail_permanently() {
        let registry = registry();
        for (job_type, payload) in [
            (JobType::IngestCsv, json!({})),
            (JobType::IngestCsv, json!({ "batch_id": "  " })),
            (JobType::Enforce, json!("case-1")),
            (JobType::Enrich, json!(null)),
        ] {
            let err = registry
                .get(&job_type)
                .unwrap()
                .handle(payload)
                .await
                .unwrap_err();
            assert!(!err.retryable, "{job_type:?} should not retry");
        }
    }

    #[tokio::test]
    async fn object_payloads_are_acknowledged() {
        let handler = registry().get(&JobType::Enrich).unwrap();
        let out = handler.handle(json!({ "debtor_id": "d1" })).await.unwrap();
        assert_eq!(out, json!({ "job_type": "enrich" }));
    }
}
