use chrono::{DateTime, Utc};
use serde::Serialize;
use std::{fmt, str::FromStr};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Purchase,
    SpendDownload,
    Expiry,
    Charge,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Purchase => "purchase",
            TransactionType::SpendDownload => "spend_download",
            TransactionType::Expiry => "expiry",
            TransactionType::Charge => "charge",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "purchase" => Ok(TransactionType::Purchase),
            "spend_download" => Ok(TransactionType::SpendDownload),
            "expiry" => Ok(TransactionType::Expiry),
            "charge" => Ok(TransactionType::Charge),
            other => Err(format!("Unknown transaction type: {other}")),
        }
    }
}

/// One immutable entry of the points audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointsTransaction {
    pub id: Uuid,
    pub tenant_id: String,
    pub customer_id: Uuid,
    pub batch_id: Option<Uuid>,
    pub delta: i64,
    pub transaction_type: TransactionType,
    pub reference_type: Option<String>,
    pub reference_id: Option<String>,
    /// De-duplication key, unique per tenant when present.
    pub external_event_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl PointsTransaction {
    pub fn new(
        tenant_id: &str,
        customer_id: Uuid,
        transaction_type: TransactionType,
        delta: i64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            customer_id,
            batch_id: None,
            delta,
            transaction_type,
            reference_type: None,
            reference_id: None,
            external_event_id: None,
            created_at,
        }
    }

    pub fn with_batch(mut self, batch_id: Option<Uuid>) -> Self {
        self.batch_id = batch_id;
        self
    }

    pub fn with_reference(mut self, reference_type: &str, reference_id: Option<String>) -> Self {
        self.reference_type = Some(reference_type.to_string());
        self.reference_id = reference_id;
        self
    }

    pub fn with_external_event_id(mut self, external_event_id: Option<String>) -> Self {
        self.external_event_id = external_event_id;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_sets_provenance() {
        let batch_id = Uuid::new_v4();
        let tx = PointsTransaction::new("store-1", Uuid::nil(), TransactionType::Purchase, 100, Utc::now())
            .with_batch(Some(batch_id))
            .with_reference("order", Some("1001".to_string()))
            .with_external_event_id(Some("evt-1".to_string()));

        assert_eq!(tx.batch_id, Some(batch_id));
        assert_eq!(tx.reference_type.as_deref(), Some("order"));
        assert_eq!(tx.reference_id.as_deref(), Some("1001"));
        assert_eq!(tx.external_event_id.as_deref(), Some("evt-1"));
        assert_eq!(tx.delta, 100);
    }

    #[test]
    fn test_type_names_match_storage_values() {
        for ty in [
            TransactionType::Purchase,
            TransactionType::SpendDownload,
            TransactionType::Expiry,
            TransactionType::Charge,
        ] {
            assert_eq!(ty.as_str().parse::<TransactionType>(), Ok(ty));
        }
        assert_eq!(TransactionType::SpendDownload.to_string(), "spend_download");
        assert!("refund".parse::<TransactionType>().is_err());
    }
}
