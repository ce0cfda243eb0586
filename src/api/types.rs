use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::error::{HatcheryError, Result};
use crate::worker::WorkerSpec;

// ============================================================================
// Request Payloads
// ============================================================================

/// Body of `POST /workers`, coerced leniently from loosely typed JSON
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertWorkerRequest {
    pub id: String,
    pub source: String,
    pub env: BTreeMap<String, String>,
    pub reconnect_timeout_ms: Option<u64>,
}

/// Body of `DELETE /workers`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteWorkerRequest {
    pub id: String,
}

fn fields(payload: &Value) -> Option<&Map<String, Value>> {
    payload.as_object()
}

fn non_empty_string(payload: &Value, key: &str) -> Option<String> {
    match fields(payload)?.get(key)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        _ => None,
    }
}

fn env_overlay(payload: &Value) -> BTreeMap<String, String> {
    let Some(Value::Object(env)) = fields(payload).and_then(|f| f.get("env")) else {
        return BTreeMap::new();
    };
    env.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect()
}

/// Milliseconds from a number or numeric string.
///
/// Any positive value is honored; fractions round up to the next whole
/// millisecond, so `0.5` becomes `1`. Zero, negative and unparseable values
/// yield `None` (use the default backoff).
fn reconnect_timeout(payload: &Value) -> Option<u64> {
    let raw = fields(payload)?.get("reconnectTimeout")?;
    let ms = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    if ms.is_finite() && ms > 0.0 {
        Some(ms.ceil() as u64)
    } else {
        None
    }
}

impl UpsertWorkerRequest {
    pub fn from_json(payload: &Value) -> Result<Self> {
        let id = non_empty_string(payload, "_id")
            .ok_or_else(|| HatcheryError::Validation("Missing worker _id.".to_string()))?;
        let source = non_empty_string(payload, "source")
            .ok_or_else(|| HatcheryError::Validation("Missing worker source.".to_string()))?;

        Ok(Self {
            id,
            source,
            env: env_overlay(payload),
            reconnect_timeout_ms: reconnect_timeout(payload),
        })
    }

    pub fn into_spec(self) -> WorkerSpec {
        WorkerSpec {
            id: self.id,
            source: self.source,
            env: self.env,
            reconnect_timeout_ms: self.reconnect_timeout_ms,
        }
    }
}

impl DeleteWorkerRequest {
    pub fn from_json(payload: &Value) -> Result<Self> {
        let id = non_empty_string(payload, "_id")
            .ok_or_else(|| HatcheryError::Validation("Missing worker _id.".to_string()))?;
        Ok(Self { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_upsert_requires_id_then_source() {
        let err = UpsertWorkerRequest::from_json(&json!({})).unwrap_err();
        assert_eq!(err.to_string(), "Missing worker _id.");

        let err = UpsertWorkerRequest::from_json(&json!({ "_id": "a" })).unwrap_err();
        assert_eq!(err.to_string(), "Missing worker source.");

        let err = UpsertWorkerRequest::from_json(&json!({ "_id": "", "source": "x" })).unwrap_err();
        assert_eq!(err.to_string(), "Missing worker _id.");

        assert!(UpsertWorkerRequest::from_json(&json!(null)).is_err());
    }

    #[test]
    fn test_upsert_coerces_env_and_timeout() {
        let req = UpsertWorkerRequest::from_json(&json!({
            "_id": "w1",
            "source": "console.log(1)",
            "env": { "PORT": 8080, "NAME": "feed", "DEBUG": true, "SKIP": null },
            "reconnectTimeout": "2500"
        }))
        .unwrap();

        assert_eq!(req.env["PORT"], "8080");
        assert_eq!(req.env["NAME"], "feed");
        assert_eq!(req.env["DEBUG"], "true");
        assert!(!req.env.contains_key("SKIP"));
        assert_eq!(req.reconnect_timeout_ms, Some(2500));
    }

    #[test]
    fn test_unusable_timeouts_fall_back_to_default() {
        for raw in [json!(0), json!(-5), json!("soon"), json!(null), json!([1])] {
            let req = UpsertWorkerRequest::from_json(&json!({
                "_id": "w1",
                "source": "x",
                "reconnectTimeout": raw
            }))
            .unwrap();
            assert_eq!(req.reconnect_timeout_ms, None);
        }
    }

    #[test]
    fn test_fractional_timeouts_round_up() {
        for (raw, expected) in [(json!(0.5), 1), (json!("2.2"), 3), (json!(750), 750)] {
            let req = UpsertWorkerRequest::from_json(&json!({
                "_id": "w1",
                "source": "x",
                "reconnectTimeout": raw
            }))
            .unwrap();
            assert_eq!(req.reconnect_timeout_ms, Some(expected));
        }
    }

    #[test]
    fn test_delete_requires_id() {
        assert!(DeleteWorkerRequest::from_json(&json!({})).is_err());
        assert_eq!(
            DeleteWorkerRequest::from_json(&json!({ "_id": "w1" })).unwrap(),
            DeleteWorkerRequest { id: "w1".to_string() }
        );
    }
}
