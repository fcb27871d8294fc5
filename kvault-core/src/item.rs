//! Stored items and their access-control lists

use crate::error::{Permission, ValidationError};
use crate::identity::{Origin, Timestamp, WILDCARD};
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// ACL
// ============================================================================

/// One entry of an ACL list: a specific tenant or the wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AclEntry {
    /// Every tenant (`"*"` on the wire).
    Any,
    Origin(Origin),
}

impl AclEntry {
    pub fn matches(&self, tenant: &Origin) -> bool {
        match self {
            AclEntry::Any => true,
            AclEntry::Origin(origin) => origin == tenant,
        }
    }
}

impl TryFrom<String> for AclEntry {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim() == WILDCARD {
            Ok(AclEntry::Any)
        } else {
            Origin::parse(value).map(AclEntry::Origin)
        }
    }
}

impl From<AclEntry> for String {
    fn from(entry: AclEntry) -> Self {
        match entry {
            AclEntry::Any => WILDCARD.to_string(),
            AclEntry::Origin(origin) => origin.into(),
        }
    }
}

impl From<Origin> for AclEntry {
    fn from(origin: Origin) -> Self {
        AclEntry::Origin(origin)
    }
}

impl fmt::Display for AclEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AclEntry::Any => f.write_str(WILDCARD),
            AclEntry::Origin(origin) => write!(f, "{}", origin),
        }
    }
}

/// Grants `tenant` access if the list holds the wildcard or the tenant itself.
pub fn has_permission(list: &[AclEntry], tenant: &Origin) -> bool {
    list.iter().any(|entry| entry.matches(tenant))
}

/// Read and write lists attached to every stored item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    pub read: Vec<AclEntry>,
    pub write: Vec<AclEntry>,
}

impl Acl {
    /// ACL for an item created by `creator` with no explicit lists:
    /// world-readable, writable only by the creator.
    pub fn for_creator(creator: &Origin) -> Self {
        Self {
            read: vec![AclEntry::Any],
            write: vec![AclEntry::Origin(creator.clone())],
        }
    }

    /// Evaluate the list appropriate to `permission`.
    pub fn allows(&self, permission: Permission, tenant: &Origin) -> bool {
        match permission {
            Permission::Read => has_permission(&self.read, tenant),
            Permission::Write => has_permission(&self.write, tenant),
        }
    }
}

/// Caller-supplied ACL lists. Absent lists fall back to the existing item's
/// lists (on update) or to the creation defaults (on create).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read: Option<Vec<AclEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write: Option<Vec<AclEntry>>,
}

impl AclPatch {
    /// Resolve the ACL for a brand-new item. The creator is always added to
    /// the write list, even when the caller supplied one without it.
    pub fn resolve_for_create(&self, creator: &Origin) -> Acl {
        let read = self.read.clone().unwrap_or_else(|| vec![AclEntry::Any]);
        let mut write = self
            .write
            .clone()
            .unwrap_or_else(|| vec![AclEntry::Origin(creator.clone())]);
        if !write.iter().any(|e| matches!(e, AclEntry::Origin(o) if o == creator)) {
            write.push(AclEntry::Origin(creator.clone()));
        }
        Acl { read, write }
    }

    /// Resolve the ACL for an update by an already write-authorized tenant.
    pub fn resolve_for_update(&self, existing: &Acl) -> Acl {
        Acl {
            read: self.read.clone().unwrap_or_else(|| existing.read.clone()),
            write: self.write.clone().unwrap_or_else(|| existing.write.clone()),
        }
    }
}

// ============================================================================
// SET OPTIONS
// ============================================================================

/// Options accepted by `set`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<AclPatch>,
    /// Lifetime in seconds; fractional values are honored to the microsecond.
    /// Zero means "never expires".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds: Option<f64>,
}

impl SetOptions {
    pub fn with_ttl_seconds(mut self, ttl_seconds: f64) -> Self {
        self.ttl_seconds = Some(ttl_seconds);
        self
    }

    pub fn with_acl(mut self, acl: AclPatch) -> Self {
        self.acl = Some(acl);
        self
    }

    /// Shallow merge: every field the caller set wins over the defaults.
    pub fn merged_over(&self, defaults: &SetOptions) -> SetOptions {
        SetOptions {
            acl: self.acl.clone().or_else(|| defaults.acl.clone()),
            ttl_seconds: self.ttl_seconds.or(defaults.ttl_seconds),
        }
    }

    /// Reject TTLs that cannot describe a point in time.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(ttl) = self.ttl_seconds {
            if !ttl.is_finite() || ttl < 0.0 {
                return Err(invalid_ttl(format!(
                    "must be a finite, non-negative number, got {}",
                    ttl
                )));
            }
            if ttl > MAX_TTL_SECONDS {
                return Err(invalid_ttl(format!(
                    "must not exceed {} seconds, got {}",
                    MAX_TTL_SECONDS, ttl
                )));
            }
        }
        Ok(())
    }

    /// Absolute expiry for an item written at `now`. Fails if the TTL is
    /// invalid or the expiry falls outside the representable range.
    pub fn expires_at(&self, now: Timestamp) -> Result<Option<Timestamp>, ValidationError> {
        self.validate()?;
        match self.ttl_seconds {
            Some(ttl) if ttl > 0.0 => {
                let micros = (ttl * 1_000_000.0).round() as i64;
                now.checked_add_signed(ChronoDuration::microseconds(micros.max(1)))
                    .map(Some)
                    .ok_or_else(|| invalid_ttl(format!("expiry out of range for {} seconds", ttl)))
            }
            _ => Ok(None),
        }
    }
}

/// Upper bound on `ttlSeconds`: one hundred years.
pub const MAX_TTL_SECONDS: f64 = 100.0 * 365.0 * 24.0 * 60.0 * 60.0;

fn invalid_ttl(reason: String) -> ValidationError {
    ValidationError::InvalidValue {
        field: "ttlSeconds".to_string(),
        reason,
    }
}

// ============================================================================
// STORAGE ITEM
// ============================================================================

/// The unit of persistence, keyed by `key` in the durable store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageItem {
    pub key: String,
    pub value: serde_json::Value,
    pub acl: Acl,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<Timestamp>,
}

impl StorageItem {
    /// An item is expired once its expiry is at or before `now`.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    pub fn can(&self, permission: Permission, tenant: &Origin) -> bool {
        self.acl.allows(permission, tenant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn origin(raw: &str) -> Origin {
        Origin::parse(raw).expect("origin should parse")
    }

    #[test]
    fn test_has_permission_wildcard_and_member() {
        let a = origin("https://a");
        let b = origin("https://b");

        assert!(has_permission(&[AclEntry::Any], &a));
        assert!(has_permission(&[AclEntry::Origin(a.clone())], &a));
        assert!(!has_permission(&[AclEntry::Origin(a.clone())], &b));
        assert!(!has_permission(&[], &a));
    }

    #[test]
    fn test_creator_defaults() {
        let a = origin("https://a");
        let acl = Acl::for_creator(&a);
        assert!(acl.allows(Permission::Read, &origin("https://anyone")));
        assert!(acl.allows(Permission::Write, &a));
        assert!(!acl.allows(Permission::Write, &origin("https://b")));
    }

    #[test]
    fn test_resolve_for_create_force_adds_creator() {
        let a = origin("https://a");
        let b = origin("https://b");
        let patch = AclPatch {
            read: None,
            write: Some(vec![AclEntry::Origin(b.clone())]),
        };

        let acl = patch.resolve_for_create(&a);
        assert_eq!(acl.read, vec![AclEntry::Any]);
        assert!(acl.allows(Permission::Write, &a));
        assert!(acl.allows(Permission::Write, &b));
        assert_eq!(acl.write.len(), 2);
    }

    #[test]
    fn test_resolve_for_create_never_defaults_write_to_wildcard() {
        let a = origin("https://a");
        let acl = AclPatch::default().resolve_for_create(&a);
        assert!(!acl.write.contains(&AclEntry::Any));
    }

    #[test]
    fn test_resolve_for_update_keeps_unspecified_lists() {
        let a = origin("https://a");
        let existing = Acl::for_creator(&a);
        let patch = AclPatch {
            read: Some(vec![AclEntry::Origin(a.clone())]),
            write: None,
        };
        let acl = patch.resolve_for_update(&existing);
        assert_eq!(acl.read, vec![AclEntry::Origin(a.clone())]);
        assert_eq!(acl.write, existing.write);
    }

    #[test]
    fn test_acl_entry_wire_format() {
        let acl = Acl::for_creator(&origin("https://a"));
        let json = serde_json::to_value(&acl).expect("serialize should succeed");
        assert_eq!(json, json!({"read": ["*"], "write": ["https://a"]}));
    }

    #[test]
    fn test_merged_over_prefers_caller() {
        let defaults = SetOptions::default().with_ttl_seconds(60.0);
        let caller = SetOptions::default().with_acl(AclPatch {
            read: Some(vec![AclEntry::Any]),
            write: None,
        });

        let merged = caller.merged_over(&defaults);
        assert_eq!(merged.ttl_seconds, Some(60.0));
        assert!(merged.acl.is_some());

        let override_ttl = SetOptions::default().with_ttl_seconds(5.0);
        assert_eq!(override_ttl.merged_over(&defaults).ttl_seconds, Some(5.0));
    }

    #[test]
    fn test_expires_at_fractional_and_zero() {
        let now = Utc::now();
        let short = SetOptions::default().with_ttl_seconds(0.001);
        assert_eq!(
            short.expires_at(now),
            Ok(Some(now + ChronoDuration::milliseconds(1)))
        );

        let zero = SetOptions::default().with_ttl_seconds(0.0);
        assert_eq!(zero.expires_at(now), Ok(None));
        assert_eq!(SetOptions::default().expires_at(now), Ok(None));
    }

    #[test]
    fn test_huge_ttl_rejected_without_overflow() {
        let now = Utc::now();
        let huge = SetOptions::default().with_ttl_seconds(1e13);
        assert!(matches!(
            huge.validate(),
            Err(ValidationError::InvalidValue { ref field, .. }) if field == "ttlSeconds"
        ));
        assert!(huge.expires_at(now).is_err());

        let max = SetOptions::default().with_ttl_seconds(MAX_TTL_SECONDS);
        assert!(max.expires_at(now).expect("max ttl should fit").is_some());
    }

    #[test]
    fn test_validate_rejects_negative_and_nan() {
        assert!(SetOptions::default().with_ttl_seconds(-1.0).validate().is_err());
        assert!(SetOptions::default().with_ttl_seconds(f64::NAN).validate().is_err());
        assert!(SetOptions::default().with_ttl_seconds(1.5).validate().is_ok());
    }

    #[test]
    fn test_item_expiry_boundary() {
        let now = Utc::now();
        let item = StorageItem {
            key: "k".to_string(),
            value: json!(1),
            acl: Acl::for_creator(&origin("https://a")),
            expires_at: Some(now),
        };
        assert!(item.is_expired(now));
        assert!(!item.is_expired(now - ChronoDuration::milliseconds(1)));

        let forever = StorageItem {
            expires_at: None,
            ..item
        };
        assert!(!forever.is_expired(now + ChronoDuration::days(3650)));
    }
}
