//! JSON Schema validation for task results received from peers

use std::sync::LazyLock;

use jsonschema::Validator;
use serde_json::{Value, json};

use courier_store::MAX_ERROR_CHARS;

use crate::error::ClientError;
use crate::protocol::TaskResult;

static TASK_RESULT_SCHEMA: LazyLock<Value> = LazyLock::new(|| {
    json!({
        "type": "object",
        "additionalProperties": false,
        "required": ["taskId", "state", "executedBy", "completedAt"],
        "properties": {
            "taskId": { "type": "string", "minLength": 1, "maxLength": 255 },
            "state": { "type": "string", "enum": ["COMPLETED", "FAILED", "TIMEOUT"] },
            "executedBy": { "type": "string", "minLength": 1, "maxLength": 255 },
            "completedAt": { "type": "string", "maxLength": 64 },
            "error": { "type": "string", "maxLength": MAX_ERROR_CHARS },
            "durationMs": {
                "type": "integer",
                "minimum": 0,
                "maximum": TaskResult::MAX_DURATION_MS
            },
            "result": true
        }
    })
});

static TASK_RESULT_VALIDATOR: LazyLock<Result<Validator, String>> =
    LazyLock::new(|| jsonschema::validator_for(&TASK_RESULT_SCHEMA).map_err(|e| e.to_string()));

/// Check a task result payload, collecting every violation
pub fn validate_task_result(data: &Value) -> Result<(), ClientError> {
    let validator = TASK_RESULT_VALIDATOR
        .as_ref()
        .map_err(|e| ClientError::InvalidResponseSchema {
            violations: vec![format!("task result schema failed to compile: {}", e)],
        })?;

    let violations: Vec<String> = validator.iter_errors(data).map(|e| e.to_string()).collect();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ClientError::InvalidResponseSchema { violations })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Value {
        json!({
            "taskId": "0b7c5d3e-1111-4f00-9a77-1234567890ab",
            "state": "COMPLETED",
            "executedBy": "agent-b",
            "completedAt": "2024-05-01T12:00:00.000000Z",
            "durationMs": 1200,
            "result": {"answer": 42}
        })
    }

    #[test]
    fn test_accepts_valid_result() {
        assert!(validate_task_result(&valid()).is_ok());

        let mut minimal = valid();
        let obj = minimal.as_object_mut().unwrap();
        obj.remove("durationMs");
        obj.remove("result");
        assert!(validate_task_result(&minimal).is_ok());
    }

    #[test]
    fn test_rejects_missing_executed_by() {
        let mut data = valid();
        data.as_object_mut().unwrap().remove("executedBy");
        match validate_task_result(&data) {
            Err(ClientError::InvalidResponseSchema { violations }) => {
                assert!(violations.iter().any(|v| v.contains("executedBy")));
            }
            other => panic!("expected schema error, got {:?}", other),
        }
    }

    #[test]
    fn test_rejects_bad_values() {
        let cases = [
            ("state", json!("WORKING")),
            ("taskId", json!("x".repeat(256))),
            ("error", json!("e".repeat(10_001))),
            ("durationMs", json!(-1)),
            ("durationMs", json!(86_400_001)),
            ("durationMs", json!(1.5)),
            ("completedAt", json!(12345)),
        ];
        for (field, value) in cases {
            let mut data = valid();
            data[field] = value;
            assert!(
                validate_task_result(&data).is_err(),
                "{} should be rejected",
                field
            );
        }
    }

    #[test]
    fn test_rejects_extra_properties() {
        let mut data = valid();
        data["surprise"] = json!(true);
        assert!(validate_task_result(&data).is_err());
    }

    #[test]
    fn test_collects_every_violation() {
        let data = json!({ "state": "DONE" });
        match validate_task_result(&data) {
            Err(ClientError::InvalidResponseSchema { violations }) => {
                assert!(violations.len() >= 4, "{:?}", violations);
            }
            other => panic!("expected schema error, got {:?}", other),
        }
    }
}
