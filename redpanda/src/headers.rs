//! Outbox metadata carried in message headers.

use chrono::{DateTime, Utc};
use outbox_relay_core::broker::{BrokerError, BrokerRecord};
use outbox_relay_core::outbox::OutboxId;
use rdkafka::message::{Header, Headers, OwnedHeaders};

/// Header holding the outbox id.
pub const EVENT_ID_HEADER: &str = "event-id";

/// Header holding the outbox `created_at`.
pub const CREATED_AT_HEADER: &str = "created-at";

pub(crate) fn outbox_headers(record: &BrokerRecord) -> OwnedHeaders {
    let event_id = record.event_id.0.to_string();
    let created_at = record.created_at.to_rfc3339();
    OwnedHeaders::new()
        .insert(Header {
            key: EVENT_ID_HEADER,
            value: Some(event_id.as_bytes()),
        })
        .insert(Header {
            key: CREATED_AT_HEADER,
            value: Some(created_at.as_bytes()),
        })
}

fn header_str<'a, H: Headers>(headers: &'a H, name: &str) -> Result<&'a str, BrokerError> {
    let value = headers
        .iter()
        .find(|header| header.key == name)
        .and_then(|header| header.value)
        .ok_or_else(|| BrokerError::MalformedMessage(format!("missing header '{name}'")))?;
    std::str::from_utf8(value)
        .map_err(|e| BrokerError::MalformedMessage(format!("header '{name}' is not UTF-8: {e}")))
}

/// Read the outbox id and `created_at` back from a consumed message.
pub(crate) fn parse_outbox_headers<H: Headers>(
    headers: Option<&H>,
) -> Result<(OutboxId, DateTime<Utc>), BrokerError> {
    let headers =
        headers.ok_or_else(|| BrokerError::MalformedMessage("message has no headers".to_string()))?;

    let raw_id = header_str(headers, EVENT_ID_HEADER)?;
    let event_id = raw_id.parse::<i64>().map_err(|e| {
        BrokerError::MalformedMessage(format!("invalid {EVENT_ID_HEADER} '{raw_id}': {e}"))
    })?;

    let raw_created = header_str(headers, CREATED_AT_HEADER)?;
    let created_at = DateTime::parse_from_rfc3339(raw_created)
        .map_err(|e| {
            BrokerError::MalformedMessage(format!("invalid {CREATED_AT_HEADER} '{raw_created}': {e}"))
        })?
        .with_timezone(&Utc);

    Ok((OutboxId(event_id), created_at))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn record() -> BrokerRecord {
        BrokerRecord {
            topic: "comment".to_string(),
            key: "comment".to_string(),
            event_id: OutboxId(4711),
            created_at: Utc.with_ymd_and_hms(2025, 3, 1, 12, 30, 0).unwrap(),
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn headers_carry_outbox_id_and_timestamp() {
        let record = record();
        let headers = outbox_headers(&record);

        let (event_id, created_at) = parse_outbox_headers(Some(&headers)).unwrap();
        assert_eq!(event_id, record.event_id);
        assert_eq!(created_at, record.created_at);
    }

    #[test]
    fn missing_headers_are_malformed() {
        assert!(matches!(
            parse_outbox_headers::<OwnedHeaders>(None),
            Err(BrokerError::MalformedMessage(_))
        ));

        let only_id = OwnedHeaders::new().insert(Header {
            key: EVENT_ID_HEADER,
            value: Some("1".as_bytes()),
        });
        let err = parse_outbox_headers(Some(&only_id)).unwrap_err();
        assert!(err.to_string().contains(CREATED_AT_HEADER));
    }

    #[test]
    fn non_numeric_event_id_is_malformed() {
        let headers = OwnedHeaders::new()
            .insert(Header {
                key: EVENT_ID_HEADER,
                value: Some("abc".as_bytes()),
            })
            .insert(Header {
                key: CREATED_AT_HEADER,
                value: Some("2025-03-01T12:30:00+00:00".as_bytes()),
            });
        assert!(matches!(
            parse_outbox_headers(Some(&headers)),
            Err(BrokerError::MalformedMessage(_))
        ));
    }
}
