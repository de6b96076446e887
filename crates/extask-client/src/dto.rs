//! Wire types for the broker's REST contract.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Body of `POST /external-tasks/fetch-and-lock`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchAndLockBody<'a> {
    pub worker_id: &'a str,
    pub topics: Vec<&'a str>,
    /// Milliseconds.
    pub lock_duration: u64,
    pub max_tasks: u32,
}

/// One entry of the fetch-and-lock response.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockedTaskDto {
    pub id: String,

    #[serde(alias = "topic")]
    pub topic_name: String,

    #[serde(default, alias = "payload")]
    pub variables: Option<Map<String, Value>>,

    #[serde(default)]
    pub lock_expiration_time: Option<Timestamp>,

    #[serde(default)]
    pub retries: Option<u32>,
}

/// Brokers send instants either as epoch milliseconds or RFC 3339 text.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(i64),
    Text(DateTime<Utc>),
}

impl Timestamp {
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Millis(ms) => Utc.timestamp_millis_opt(*ms).single(),
            Self::Text(dt) => Some(*dt),
        }
    }
}

/// Body of `POST /external-tasks/{id}/complete`.
///
/// Output variables are flattened next to the result so the broker can merge
/// them into the process scope.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteBody<'a> {
    pub worker_id: &'a str,
    pub worker_result: &'a Value,
    #[serde(flatten)]
    pub variables: Map<String, Value>,
}

/// Body of `POST /external-tasks/{id}/failure`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureBody<'a> {
    pub worker_id: &'a str,
    pub error_message: &'a str,
    pub error_details: &'a str,
    pub retries: u32,
    /// Milliseconds.
    pub retry_timeout: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fetch_body_uses_camel_case() {
        let body = FetchAndLockBody {
            worker_id: "w1",
            topics: vec!["demo-topic"],
            lock_duration: 10_000,
            max_tasks: 2,
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(
            v,
            json!({"workerId": "w1", "topics": ["demo-topic"], "lockDuration": 10000, "maxTasks": 2})
        );
    }

    #[test]
    fn test_locked_task_accepts_reference_broker_shape() {
        let dto: LockedTaskDto = serde_json::from_value(json!({
            "id": "t1",
            "topicName": "demo-topic",
            "variables": {"amount": 10}
        }))
        .unwrap();
        assert_eq!(dto.topic_name, "demo-topic");
        assert_eq!(dto.variables.unwrap()["amount"], 10);
        assert!(dto.lock_expiration_time.is_none());
        assert!(dto.retries.is_none());
    }

    #[test]
    fn test_locked_task_accepts_alternate_names_and_timestamps() {
        let dto: LockedTaskDto = serde_json::from_value(json!({
            "id": "t2",
            "topic": "billing",
            "payload": null,
            "lockExpirationTime": 1_767_268_800_000i64,
            "retries": 3
        }))
        .unwrap();
        assert_eq!(dto.topic_name, "billing");
        assert!(dto.variables.is_none());
        assert_eq!(dto.retries, Some(3));
        let expiry = dto.lock_expiration_time.unwrap().to_datetime().unwrap();
        assert_eq!(expiry.timestamp_millis(), 1_767_268_800_000);

        let dto: LockedTaskDto = serde_json::from_value(json!({
            "id": "t3",
            "topicName": "billing",
            "lockExpirationTime": "2026-01-01T12:00:10Z"
        }))
        .unwrap();
        assert!(matches!(dto.lock_expiration_time, Some(Timestamp::Text(_))));
    }

    #[test]
    fn test_complete_body_flattens_variables() {
        let result = json!("ok");
        let mut variables = Map::new();
        variables.insert("approved".into(), json!(true));
        let body = CompleteBody {
            worker_id: "w1",
            worker_result: &result,
            variables,
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v, json!({"workerId": "w1", "workerResult": "ok", "approved": true}));
    }
}
