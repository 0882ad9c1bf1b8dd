use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

// --- Customer ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Customer {
    pub id: Uuid,
    pub tenant_id: String,
    pub external_user_id: i64,
    pub email: String,
    pub phone: Option<String>,
    pub whatsapp: Option<String>,
    pub locale: Option<String>,
    pub timezone: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Contact data carried by an inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CustomerProfile {
    pub external_user_id: i64,
    pub email: String,
    pub phone: Option<String>,
    pub whatsapp: Option<String>,
    pub locale: Option<String>,
    pub timezone: Option<String>,
}

/// Lock and uniqueness scope of a customer: `(tenant_id, external_user_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CustomerKey {
    pub tenant_id: String,
    pub external_user_id: i64,
}

impl CustomerKey {
    pub fn new(tenant_id: impl Into<String>, external_user_id: i64) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            external_user_id,
        }
    }

    /// Stable string form, used for advisory lock hashing.
    pub fn lock_name(&self) -> String {
        format!("{}:{}", self.tenant_id, self.external_user_id)
    }
}

/// How a caller points at a customer within a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomerRef {
    External(i64),
    Internal(Uuid),
}

impl Customer {
    pub fn register(tenant_id: &str, profile: &CustomerProfile, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.to_string(),
            external_user_id: profile.external_user_id,
            email: profile.email.clone(),
            phone: profile.phone.clone(),
            whatsapp: profile.whatsapp.clone(),
            locale: profile.locale.clone(),
            timezone: profile.timezone.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn key(&self) -> CustomerKey {
        CustomerKey::new(self.tenant_id.clone(), self.external_user_id)
    }

    /// Merge contact fields from `profile`. Absent optional fields keep the
    /// stored value. Returns whether anything changed.
    pub fn apply_profile(&mut self, profile: &CustomerProfile, now: DateTime<Utc>) -> bool {
        let mut changed = false;
        if self.email != profile.email {
            self.email = profile.email.clone();
            changed = true;
        }
        changed |= merge_optional(&mut self.phone, &profile.phone);
        changed |= merge_optional(&mut self.whatsapp, &profile.whatsapp);
        changed |= merge_optional(&mut self.locale, &profile.locale);
        changed |= merge_optional(&mut self.timezone, &profile.timezone);
        if changed {
            self.updated_at = now;
        }
        changed
    }
}

fn merge_optional(current: &mut Option<String>, incoming: &Option<String>) -> bool {
    match incoming {
        Some(value) if current.as_ref() != Some(value) => {
            *current = Some(value.clone());
            true
        }
        _ => false,
    }
}
