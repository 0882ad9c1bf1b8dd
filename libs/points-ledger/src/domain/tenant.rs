use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TENANT_TIMEZONE: &str = "UTC";
const MAX_TENANT_ID_LEN: usize = 191;
const MAX_TENANT_NAME_LEN: usize = 255;
const MAX_TENANT_TIMEZONE_LEN: usize = 64;

// --- Tenant ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tenant {
    pub id: String,
    pub name: String,
    pub timezone: String,
    pub created_at: DateTime<Utc>,
}

/// Caller-supplied tenant reference. Only `id` is required; the directory
/// fills in defaults on first sight.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
pub struct TenantRef {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub timezone: Option<String>,
}

// --- Errors ---

#[derive(thiserror::Error, Debug)]
pub enum TenantError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl TenantRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_timezone(mut self, timezone: impl Into<String>) -> Self {
        self.timezone = Some(timezone.into());
        self
    }

    pub fn validate(&self) -> Result<(), TenantError> {
        if self.id.trim().is_empty() {
            return Err(TenantError::InvalidInput("Tenant ID cannot be empty".into()));
        }
        if self.id.len() > MAX_TENANT_ID_LEN {
            return Err(TenantError::InvalidInput(format!(
                "Tenant ID exceeds {MAX_TENANT_ID_LEN} characters"
            )));
        }
        if self.name.as_deref().is_some_and(|n| n.trim().is_empty()) {
            return Err(TenantError::InvalidInput(
                "Tenant name cannot be empty".into(),
            ));
        }
        if self
            .name
            .as_deref()
            .is_some_and(|n| n.chars().count() > MAX_TENANT_NAME_LEN)
        {
            return Err(TenantError::InvalidInput(format!(
                "Tenant name exceeds {MAX_TENANT_NAME_LEN} characters"
            )));
        }
        if self
            .timezone
            .as_deref()
            .is_some_and(|tz| tz.chars().count() > MAX_TENANT_TIMEZONE_LEN)
        {
            return Err(TenantError::InvalidInput(format!(
                "Tenant timezone exceeds {MAX_TENANT_TIMEZONE_LEN} characters"
            )));
        }
        Ok(())
    }

    /// Merge this reference over an existing record, or build a fresh one.
    pub fn resolve(&self, existing: Option<&Tenant>, now: DateTime<Utc>) -> Tenant {
        match existing {
            Some(current) => Tenant {
                id: current.id.clone(),
                name: self.name.clone().unwrap_or_else(|| current.name.clone()),
                timezone: self
                    .timezone
                    .clone()
                    .unwrap_or_else(|| current.timezone.clone()),
                created_at: current.created_at,
            },
            None => Tenant {
                id: self.id.clone(),
                name: self.name.clone().unwrap_or_else(|| self.id.clone()),
                timezone: self
                    .timezone
                    .clone()
                    .unwrap_or_else(|| DEFAULT_TENANT_TIMEZONE.to_string()),
                created_at: now,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_resolve_new_tenant_uses_defaults() {
        let tenant = TenantRef::new("store-1").resolve(None, at(1));
        assert_eq!(tenant.id, "store-1");
        assert_eq!(tenant.name, "store-1");
        assert_eq!(tenant.timezone, DEFAULT_TENANT_TIMEZONE);
        assert_eq!(tenant.created_at, at(1));
    }

    #[test]
    fn test_resolve_existing_keeps_unspecified_fields() {
        let existing = TenantRef::new("store-1")
            .with_name("Coffee Club")
            .with_timezone("Asia/Jerusalem")
            .resolve(None, at(1));

        let merged = TenantRef::new("store-1").resolve(Some(&existing), at(5));
        assert_eq!(merged, existing);

        let renamed = TenantRef::new("store-1")
            .with_name("Tea Club")
            .resolve(Some(&existing), at(5));
        assert_eq!(renamed.name, "Tea Club");
        assert_eq!(renamed.timezone, "Asia/Jerusalem");
        assert_eq!(renamed.created_at, at(1));
    }

    #[test]
    fn test_validate_rejects_empty_id_and_name() {
        match TenantRef::new("  ").validate() {
            Err(TenantError::InvalidInput(msg)) => assert!(msg.contains("ID cannot be empty")),
            _ => panic!("Expected InvalidInput error for empty ID"),
        }
        match TenantRef::new("store-1").with_name("").validate() {
            Err(TenantError::InvalidInput(msg)) => assert!(msg.contains("name cannot be empty")),
            _ => panic!("Expected InvalidInput error for empty name"),
        }
        assert!(TenantRef::new("store-1").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_oversized_fields() {
        assert!(TenantRef::new("t".repeat(MAX_TENANT_ID_LEN + 1)).validate().is_err());
        assert!(
            TenantRef::new("store-1")
                .with_name("n".repeat(MAX_TENANT_NAME_LEN + 1))
                .validate()
                .is_err()
        );
        assert!(
            TenantRef::new("store-1")
                .with_timezone("z".repeat(MAX_TENANT_TIMEZONE_LEN + 1))
                .validate()
                .is_err()
        );
    }
}
