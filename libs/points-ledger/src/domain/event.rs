use super::customer::CustomerProfile;
use crate::CoreError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer};
use std::{fmt, str::FromStr};

/// Provenance recorded on batches when the event does not name one.
pub const DEFAULT_SOURCE: &str = "external";

// Column widths of the relational schema
const MAX_EVENT_ID_LEN: usize = 191;
const MAX_ORDER_ID_LEN: usize = 191;
const MAX_SOURCE_LEN: usize = 64;
const MAX_EMAIL_LEN: usize = 255;
const MAX_CONTACT_LEN: usize = 64;
const MAX_LOCALE_LEN: usize = 32;

const NAIVE_TIMESTAMP_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"];

// --- Inbound shape ---

/// Event as delivered by the commerce platform. Field names follow the
/// platform's camelCase, snake_case is accepted too.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawEvent {
    #[serde(default, alias = "external_event_id")]
    pub external_event_id: Option<String>,
    #[serde(default, alias = "wp_user_id")]
    pub wp_user_id: Option<i64>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default, alias = "points_delta")]
    pub points_delta: Option<i64>,
    /// Absolute balance, only meaningful for `balance_sync` events.
    #[serde(default, alias = "points_balance")]
    pub points_balance: Option<i64>,
    #[serde(default, alias = "event_type")]
    pub event_type: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default, alias = "order_id", deserialize_with = "string_or_integer")]
    pub order_id: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub whatsapp: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default, alias = "created_at", deserialize_with = "lenient_timestamp")]
    pub created_at: Option<String>,
}

// --- Errors ---

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum EventError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
    #[error("Invalid {field}: {reason}")]
    InvalidField {
        field: &'static str,
        reason: String,
    },
    #[error("Unknown event type: {0}")]
    UnknownEventType(String),
    #[error("Event type {kind} cannot carry a points delta of {delta}")]
    SignMismatch { kind: EventKind, delta: i64 },
    #[error("Malformed event: {0}")]
    Malformed(String),
}

// --- Typed event ---

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Purchase,
    Spend,
    Charge,
    BalanceSync,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Purchase => "purchase",
            EventKind::Spend => "spend",
            EventKind::Charge => "charge",
            EventKind::BalanceSync => "balance_sync",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "purchase" | "earn" | "order" => Ok(EventKind::Purchase),
            "spend" | "redeem" | "download" | "spend_download" => Ok(EventKind::Spend),
            "charge" => Ok(EventKind::Charge),
            "balance_sync" | "sync" => Ok(EventKind::BalanceSync),
            _ => Err(EventError::UnknownEventType(s.to_string())),
        }
    }
}

/// What the event does to the ledger. Amounts are positive magnitudes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointsEffect {
    Purchase { points: i64 },
    Spend { points: i64 },
    Charge { points: i64 },
    BalanceSync { balance: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointsEvent {
    pub external_event_id: Option<String>,
    pub profile: CustomerProfile,
    pub effect: PointsEffect,
    pub source: String,
    pub order_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// `created_at` was missing or unparseable and was replaced with "now".
    pub timestamp_normalized: bool,
}

impl RawEvent {
    /// Validate into a typed event. `Ok(None)` marks a zero-delta no-op.
    pub fn validate(self, now: DateTime<Utc>) -> Result<Option<PointsEvent>, EventError> {
        if self.points_delta == Some(0) && !self.is_balance_sync() {
            return Ok(None);
        }

        let kind: EventKind = non_blank(self.event_type)
            .ok_or(EventError::MissingField("eventType"))?
            .parse()?;

        let external_user_id = self
            .wp_user_id
            .ok_or(EventError::MissingField("wpUserId"))?;
        if external_user_id <= 0 {
            return Err(EventError::InvalidField {
                field: "wpUserId",
                reason: format!("must be positive, got {external_user_id}"),
            });
        }

        let email = non_blank(self.email).ok_or(EventError::MissingField("email"))?;
        check_len("email", &email, MAX_EMAIL_LEN)?;
        if !email.contains('@') {
            return Err(EventError::InvalidField {
                field: "email",
                reason: format!("'{email}' is not an address"),
            });
        }

        let effect = match kind {
            EventKind::BalanceSync => {
                let balance = self
                    .points_balance
                    .ok_or(EventError::MissingField("pointsBalance"))?;
                if balance < 0 {
                    return Err(EventError::InvalidField {
                        field: "pointsBalance",
                        reason: format!("must not be negative, got {balance}"),
                    });
                }
                PointsEffect::BalanceSync { balance }
            }
            _ => {
                let delta = self
                    .points_delta
                    .ok_or(EventError::MissingField("pointsDelta"))?;
                signed_effect(kind, delta)?
            }
        };

        let (created_at, timestamp_normalized) = match parse_timestamp(self.created_at.as_deref()) {
            Some(ts) => (ts, false),
            None => (now, true),
        };

        Ok(Some(PointsEvent {
            external_event_id: bounded("externalEventId", self.external_event_id, MAX_EVENT_ID_LEN)?,
            profile: CustomerProfile {
                external_user_id,
                email,
                phone: bounded("phone", self.phone, MAX_CONTACT_LEN)?,
                whatsapp: bounded("whatsapp", self.whatsapp, MAX_CONTACT_LEN)?,
                locale: bounded("locale", self.locale, MAX_LOCALE_LEN)?,
                timezone: bounded("timezone", self.timezone, MAX_CONTACT_LEN)?,
            },
            effect,
            source: bounded("source", self.source, MAX_SOURCE_LEN)?
                .unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
            order_id: bounded("orderId", self.order_id, MAX_ORDER_ID_LEN)?,
            created_at,
            timestamp_normalized,
        }))
    }

    fn is_balance_sync(&self) -> bool {
        self.event_type
            .as_deref()
            .is_some_and(|t| t.parse::<EventKind>() == Ok(EventKind::BalanceSync))
    }
}

fn signed_effect(kind: EventKind, delta: i64) -> Result<PointsEffect, EventError> {
    let mismatch = || EventError::SignMismatch { kind, delta };
    match kind {
        EventKind::Purchase if delta > 0 => Ok(PointsEffect::Purchase { points: delta }),
        EventKind::Spend if delta < 0 => Ok(PointsEffect::Spend {
            points: delta.checked_neg().ok_or_else(mismatch)?,
        }),
        EventKind::Charge if delta < 0 => Ok(PointsEffect::Charge {
            points: delta.checked_neg().ok_or_else(mismatch)?,
        }),
        _ => Err(mismatch()),
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn bounded(
    field: &'static str,
    value: Option<String>,
    max: usize,
) -> Result<Option<String>, EventError> {
    let value = non_blank(value);
    if let Some(text) = &value {
        check_len(field, text, max)?;
    }
    Ok(value)
}

fn check_len(field: &'static str, value: &str, max: usize) -> Result<(), EventError> {
    let len = value.chars().count();
    if len > max {
        return Err(EventError::InvalidField {
            field,
            reason: format!("exceeds {max} characters (got {len})"),
        });
    }
    Ok(())
}

/// RFC 3339, or a naive `YYYY-MM-DD HH:MM:SS` read as UTC.
pub fn parse_timestamp(value: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = value?.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NAIVE_TIMESTAMP_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Decode a whole ingestion payload. A payload that is not a JSON array is
/// rejected outright; items that do not fit `RawEvent` come back as per-item errors.
pub fn parse_events_payload(
    payload: &[u8],
) -> Result<Vec<Result<RawEvent, EventError>>, CoreError> {
    let items: Vec<serde_json::Value> = serde_json::from_slice(payload).map_err(|e| {
        CoreError::Deserialization(format!("Payload is not a JSON array of events: {e}"))
    })?;
    Ok(items
        .into_iter()
        .map(|item| {
            serde_json::from_value::<RawEvent>(item).map_err(|e| EventError::Malformed(e.to_string()))
        })
        .collect())
}

fn string_or_integer<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum TextOrNumber {
        Text(String),
        Number(i64),
    }

    Ok(
        Option::<TextOrNumber>::deserialize(deserializer)?.map(|value| match value {
            TextOrNumber::Text(text) => text,
            TextOrNumber::Number(number) => number.to_string(),
        }),
    )
}

// Any JSON value is accepted here; non-strings fail to parse later and get normalized.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(
        Option::<serde_json::Value>::deserialize(deserializer)?.map(|value| match value {
            serde_json::Value::String(text) => text,
            other => other.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn purchase(delta: i64) -> RawEvent {
        RawEvent {
            external_event_id: Some("evt-1".to_string()),
            wp_user_id: Some(42),
            email: Some("a@b.com".to_string()),
            points_delta: Some(delta),
            event_type: Some("purchase".to_string()),
            source: Some("woo_order".to_string()),
            created_at: Some("2024-01-01T00:00:00Z".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(parse_timestamp(Some("2024-01-01T00:00:00Z")), Some(expected));
        assert_eq!(parse_timestamp(Some("2024-01-01T02:00:00+02:00")), Some(expected));
        assert_eq!(parse_timestamp(Some("2024-01-01 00:00:00")), Some(expected));
        assert_eq!(parse_timestamp(Some("2024-01-01T00:00:00")), Some(expected));
        assert_eq!(parse_timestamp(Some("yesterday")), None);
        assert_eq!(parse_timestamp(Some("  ")), None);
        assert_eq!(parse_timestamp(None), None);
    }

    #[test]
    fn test_validate_purchase() {
        let event = purchase(100).validate(now()).unwrap().unwrap();
        assert_eq!(event.effect, PointsEffect::Purchase { points: 100 });
        assert_eq!(event.profile.external_user_id, 42);
        assert_eq!(event.external_event_id.as_deref(), Some("evt-1"));
        assert_eq!(event.source, "woo_order");
        assert!(!event.timestamp_normalized);
    }

    #[test]
    fn test_zero_delta_is_a_noop() {
        assert_eq!(purchase(0).validate(now()), Ok(None));
        // Even without the rest of the required fields.
        let bare = RawEvent {
            points_delta: Some(0),
            ..Default::default()
        };
        assert_eq!(bare.validate(now()), Ok(None));
    }

    #[test]
    fn test_zero_delta_with_a_balance_is_still_a_noop() {
        let mut raw = purchase(0);
        raw.points_balance = Some(10);
        assert_eq!(raw.clone().validate(now()), Ok(None));

        raw.event_type = Some("charge".to_string());
        assert_eq!(raw.validate(now()), Ok(None));
    }

    #[test]
    fn test_balance_sync_ignores_a_zero_delta() {
        let mut sync = purchase(0);
        sync.event_type = Some("balance_sync".to_string());
        sync.points_balance = Some(10);
        let event = sync.clone().validate(now()).unwrap().unwrap();
        assert_eq!(event.effect, PointsEffect::BalanceSync { balance: 10 });

        sync.points_balance = None;
        assert_eq!(sync.validate(now()), Err(EventError::MissingField("pointsBalance")));
    }

    #[test]
    fn test_field_lengths_follow_the_schema() {
        let mut long_source = purchase(10);
        long_source.source = Some("s".repeat(MAX_SOURCE_LEN + 1));
        assert!(matches!(
            long_source.validate(now()),
            Err(EventError::InvalidField { field: "source", .. })
        ));

        let mut long_id = purchase(10);
        long_id.external_event_id = Some("e".repeat(200));
        assert!(matches!(
            long_id.validate(now()),
            Err(EventError::InvalidField { field: "externalEventId", .. })
        ));

        let mut long_email = purchase(10);
        long_email.email = Some(format!("{}@b.com", "a".repeat(MAX_EMAIL_LEN)));
        assert!(matches!(
            long_email.validate(now()),
            Err(EventError::InvalidField { field: "email", .. })
        ));

        let mut long_locale = purchase(10);
        long_locale.locale = Some("l".repeat(MAX_LOCALE_LEN + 1));
        assert!(matches!(
            long_locale.validate(now()),
            Err(EventError::InvalidField { field: "locale", .. })
        ));

        let mut long_order = purchase(10);
        long_order.order_id = Some("9".repeat(MAX_ORDER_ID_LEN + 1));
        assert!(matches!(
            long_order.validate(now()),
            Err(EventError::InvalidField { field: "orderId", .. })
        ));

        // Limits count characters, not bytes
        let mut at_limit = purchase(10);
        at_limit.source = Some("é".repeat(MAX_SOURCE_LEN));
        at_limit.phone = Some(format!("  {}  ", "1".repeat(MAX_CONTACT_LEN)));
        let event = at_limit.validate(now()).unwrap().unwrap();
        assert_eq!(event.source.chars().count(), MAX_SOURCE_LEN);
        assert_eq!(event.profile.phone.map(|p| p.len()), Some(MAX_CONTACT_LEN));
    }

    #[test]
    fn test_malformed_timestamp_is_normalized() {
        let mut raw = purchase(10);
        raw.created_at = Some("not a date".to_string());
        let event = raw.validate(now()).unwrap().unwrap();
        assert_eq!(event.created_at, now());
        assert!(event.timestamp_normalized);
    }

    #[test]
    fn test_missing_required_fields() {
        let mut no_user = purchase(10);
        no_user.wp_user_id = None;
        assert_eq!(no_user.validate(now()), Err(EventError::MissingField("wpUserId")));

        let mut no_email = purchase(10);
        no_email.email = Some("   ".to_string());
        assert_eq!(no_email.validate(now()), Err(EventError::MissingField("email")));

        let mut no_type = purchase(10);
        no_type.event_type = None;
        assert_eq!(no_type.validate(now()), Err(EventError::MissingField("eventType")));
    }

    #[test]
    fn test_sign_must_match_kind() {
        let mut spend = purchase(30);
        spend.event_type = Some("spend".to_string());
        assert!(matches!(
            spend.validate(now()),
            Err(EventError::SignMismatch { kind: EventKind::Spend, delta: 30 })
        ));

        assert!(matches!(
            purchase(-30).validate(now()),
            Err(EventError::SignMismatch { kind: EventKind::Purchase, .. })
        ));

        let mut charge = purchase(-5);
        charge.event_type = Some("Charge".to_string());
        let event = charge.validate(now()).unwrap().unwrap();
        assert_eq!(event.effect, PointsEffect::Charge { points: 5 });
    }

    #[test]
    fn test_balance_sync_requires_balance() {
        let mut sync = purchase(0);
        sync.points_delta = None;
        sync.event_type = Some("balance_sync".to_string());
        assert_eq!(sync.clone().validate(now()), Err(EventError::MissingField("pointsBalance")));

        sync.points_balance = Some(250);
        let event = sync.validate(now()).unwrap().unwrap();
        assert_eq!(event.effect, PointsEffect::BalanceSync { balance: 250 });
    }

    #[test]
    fn test_unknown_event_type() {
        let mut raw = purchase(10);
        raw.event_type = Some("refund".to_string());
        assert_eq!(
            raw.validate(now()),
            Err(EventError::UnknownEventType("refund".to_string()))
        );
    }

    #[test]
    fn test_deserialize_camel_and_snake_case() {
        let camel: RawEvent = serde_json::from_str(
            r#"{"externalEventId":"evt-1","wpUserId":42,"email":"a@b.com","pointsDelta":100,
                "eventType":"purchase","source":"woo_order","orderId":1001,
                "createdAt":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        let snake: RawEvent = serde_json::from_str(
            r#"{"external_event_id":"evt-1","wp_user_id":42,"email":"a@b.com","points_delta":100,
                "event_type":"purchase","source":"woo_order","order_id":"1001",
                "created_at":"2024-01-01T00:00:00Z"}"#,
        )
        .unwrap();
        assert_eq!(camel, snake);
        assert_eq!(camel.order_id.as_deref(), Some("1001"));
    }

    #[test]
    fn test_numeric_timestamp_is_kept_for_normalization() {
        let raw: RawEvent = serde_json::from_str(
            r#"{"wpUserId":42,"email":"a@b.com","pointsDelta":5,"eventType":"purchase","createdAt":1704067200}"#,
        )
        .unwrap();
        let event = raw.validate(now()).unwrap().unwrap();
        assert!(event.timestamp_normalized);
    }

    #[test]
    fn test_payload_must_be_an_array() {
        assert!(matches!(
            parse_events_payload(br#"{"wpUserId":42}"#),
            Err(CoreError::Deserialization(_))
        ));

        let items = parse_events_payload(br#"[{"wpUserId":42}, 7, {"wpUserId":"x"}]"#).unwrap();
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(EventError::Malformed(_))));
        assert!(matches!(items[2], Err(EventError::Malformed(_))));
    }
}
