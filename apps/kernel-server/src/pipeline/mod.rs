// [[AXON]]/apps/kernel-server/src/pipeline/mod.rs
// Purpose: Durable event pipeline over Redis Streams.
// Architecture: Event Pipeline Layer
// Dependencies: redis (streams), sha2, hmac

pub mod consumer;
pub mod handlers;
pub mod producer;

use redis::Value;
use std::collections::HashMap;

use crate::models::EventRecord;

/// Field names every stream record carries.
pub const F_ID: &str = "id";
pub const F_TENANT: &str = "tenant";
pub const F_TYPE: &str = "type";
pub const F_PAYLOAD: &str = "payload";
pub const F_ATTEMPTS: &str = "attempts";
pub const F_FIRST_SEEN: &str = "first_seen_at";
pub const F_LAST_ERROR: &str = "last_error";

pub(crate) fn field_str(map: &HashMap<String, Value>, name: &str) -> Option<String> {
    map.get(name)
        .and_then(|v| redis::from_redis_value::<String>(v).ok())
}

/// Decode one stream entry's field map into an EventRecord. Undecodable
/// records are a poison-pill hazard for the whole group, so the caller
/// routes `None` straight to the DLQ.
pub(crate) fn record_from_fields(map: &HashMap<String, Value>) -> Option<EventRecord> {
    let id = field_str(map, F_ID)?;
    let tenant_id = field_str(map, F_TENANT)?.parse().ok()?;
    let event_type = field_str(map, F_TYPE)?;
    let payload = serde_json::from_str(&field_str(map, F_PAYLOAD)?).ok()?;
    let attempts = field_str(map, F_ATTEMPTS)
        .and_then(|a| a.parse().ok())
        .unwrap_or(0);
    let first_seen_at = field_str(map, F_FIRST_SEEN)
        .and_then(|t| chrono::DateTime::parse_from_rfc3339(&t).ok())
        .map(|t| t.with_timezone(&chrono::Utc))?;
    Some(EventRecord {
        id,
        tenant_id,
        event_type,
        payload,
        attempts,
        first_seen_at,
        last_error: field_str(map, F_LAST_ERROR),
    })
}

pub(crate) fn record_to_fields(record: &EventRecord) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        (F_ID, record.id.clone()),
        (F_TENANT, record.tenant_id.to_string()),
        (F_TYPE, record.event_type.clone()),
        (F_PAYLOAD, record.payload.to_string()),
        (F_ATTEMPTS, record.attempts.to_string()),
        (F_FIRST_SEEN, record.first_seen_at.to_rfc3339()),
    ];
    if let Some(err) = &record.last_error {
        fields.push((F_LAST_ERROR, err.clone()));
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn to_value_map(fields: &[(&'static str, String)]) -> HashMap<String, Value> {
        fields
            .iter()
            .map(|(k, v)| (k.to_string(), Value::Data(v.clone().into_bytes())))
            .collect()
    }

    #[test]
    fn record_round_trips_through_stream_fields() {
        let record = EventRecord {
            id: "evt-1".to_string(),
            tenant_id: Uuid::new_v4(),
            event_type: "push".to_string(),
            payload: serde_json::json!({"ref": "main"}),
            attempts: 2,
            first_seen_at: Utc::now(),
            last_error: Some("boom".to_string()),
        };
        let fields = record_to_fields(&record);
        let decoded = record_from_fields(&to_value_map(&fields)).unwrap();
        assert_eq!(decoded.id, record.id);
        assert_eq!(decoded.tenant_id, record.tenant_id);
        assert_eq!(decoded.event_type, record.event_type);
        assert_eq!(decoded.payload, record.payload);
        assert_eq!(decoded.attempts, 2);
        assert_eq!(decoded.last_error.as_deref(), Some("boom"));
    }

    #[test]
    fn missing_fields_yield_none() {
        let record = EventRecord {
            id: "evt-1".to_string(),
            tenant_id: Uuid::new_v4(),
            event_type: "push".to_string(),
            payload: serde_json::json!({}),
            attempts: 0,
            first_seen_at: Utc::now(),
            last_error: None,
        };
        let mut map = to_value_map(&record_to_fields(&record));
        map.remove(F_TENANT);
        assert!(record_from_fields(&map).is_none());
    }
}
