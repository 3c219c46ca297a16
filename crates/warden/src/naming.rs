//! Tenant-scoped container naming.
//!
//! Every pod is named `{tenant}-{tag}` or, when a prefix is configured,
//! `{prefix}-{tenant}-{tag}`. Dash is the field separator and colon is
//! reserved for image tags, so neither may appear inside a tenant name or
//! instance tag.

use api_types::Tenant;

use crate::error::Result;
use crate::error::WardenError;

/// Words that can never be tenant names or instance tags.
pub const RESERVED_NAMES: &[&str] = &["share", "admin", "root", "all"];

/// Result of splitting a raw container name into its segments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameComponents {
    pub prefix: Option<String>,
    pub tenant: Option<String>,
    pub instance: String,
}

/// Pure identifier predicate shared by tenant names and instance tags.
pub fn validate_identifier(s: &str, reserved: &[&str]) -> Result<()> {
    if !(3..=20).contains(&s.len()) {
        return Err(WardenError::InvalidInput(format!(
            "identifier '{s}' must be between 3 and 20 characters"
        )));
    }
    if s.contains('-') || s.contains(':') {
        return Err(WardenError::InvalidInput(format!(
            "identifier '{s}' cannot contain '-' or ':'"
        )));
    }
    if !s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(WardenError::InvalidInput(format!(
            "identifier '{s}' must be alphanumeric"
        )));
    }
    if s.starts_with('_') || s.ends_with('_') {
        return Err(WardenError::InvalidInput(format!(
            "identifier '{s}' cannot start or end with '_'"
        )));
    }
    if reserved.contains(&s) {
        return Err(WardenError::InvalidInput(format!(
            "identifier '{s}' is reserved"
        )));
    }
    Ok(())
}

/// Splits, joins and authorizes instance names for one configured prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingScheme {
    prefix: Option<String>,
}

impl NamingScheme {
    /// An empty prefix means pods are named `{tenant}-{tag}`.
    pub fn new(prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
        }
    }

    pub fn prefix(&self) -> Option<&str> {
        self.prefix.as_deref()
    }

    /// Split a raw name into prefix, tenant and instance segments.
    ///
    /// In strict mode the only accepted shapes are `tenant-tag` (no prefix
    /// configured) and `prefix-tenant-tag` (prefix configured and matching).
    /// Non-strict mode additionally yields partial shapes so that `resolve`
    /// can fill in the requesting tenant.
    pub fn split(&self, raw: &str, strict: bool) -> Option<NameComponents> {
        let parts: Vec<&str> = raw.split('-').collect();
        match parts.as_slice() {
            [instance] => {
                if strict {
                    return None;
                }
                Some(NameComponents {
                    prefix: None,
                    tenant: None,
                    instance: (*instance).to_string(),
                })
            }
            [tenant, instance] => {
                if strict && self.prefix.is_some() {
                    return None;
                }
                Some(NameComponents {
                    prefix: None,
                    tenant: Some((*tenant).to_string()),
                    instance: (*instance).to_string(),
                })
            }
            [prefix, tenant, instance] => {
                if strict && self.prefix.as_deref() != Some(*prefix) {
                    return None;
                }
                Some(NameComponents {
                    prefix: Some((*prefix).to_string()),
                    tenant: Some((*tenant).to_string()),
                    instance: (*instance).to_string(),
                })
            }
            _ => None,
        }
    }

    /// Canonical container name for a tenant's instance tag.
    pub fn join(&self, tenant: &str, instance: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}-{tenant}-{instance}"),
            None => format!("{tenant}-{instance}"),
        }
    }

    /// Name filter matching every pod of one tenant.
    pub fn pod_prefix(&self, tenant: &str) -> String {
        match &self.prefix {
            Some(prefix) => format!("{prefix}-{tenant}-"),
            None => format!("{tenant}-"),
        }
    }

    /// Resolve a user-supplied instance name to the canonical container
    /// name, enforcing ownership.
    pub fn resolve(&self, raw: &str, user: &Tenant) -> Result<String> {
        let components = self.split(raw, false).ok_or_else(|| {
            WardenError::InvalidInput(format!("invalid pod name: {raw}"))
        })?;

        if components.prefix.is_some() && components.prefix.as_deref() != self.prefix.as_deref() {
            return Err(WardenError::PermissionDenied(
                "invalid pod name, please check prefix".to_string(),
            ));
        }

        if !user.is_admin {
            if let Some(tenant) = &components.tenant {
                if tenant != &user.name {
                    return Err(WardenError::PermissionDenied(
                        "invalid pod name, please check the tenant name".to_string(),
                    ));
                }
            }
            return Ok(self.join(&user.name, &components.instance));
        }

        // admins may address any tenant's pod; a bare tag targets their own
        match &components.tenant {
            None => Ok(self.join(&user.name, &components.instance)),
            Some(tenant) => Ok(self.join(tenant, &components.instance)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(name: &str, is_admin: bool) -> Tenant {
        Tenant {
            userid: 1,
            name: name.to_string(),
            is_admin,
        }
    }

    #[test]
    fn identifier_rules() {
        assert!(validate_identifier("ab", RESERVED_NAMES).is_err());
        assert!(validate_identifier("ab1", RESERVED_NAMES).is_ok());
        assert!(validate_identifier("_ab", RESERVED_NAMES).is_err());
        assert!(validate_identifier("ab_", RESERVED_NAMES).is_err());
        assert!(validate_identifier("a_b1", RESERVED_NAMES).is_ok());
        assert!(validate_identifier("share", RESERVED_NAMES).is_err());
        assert!(validate_identifier("a-b1", RESERVED_NAMES).is_err());
        assert!(validate_identifier("ab:1", RESERVED_NAMES).is_err());
        assert!(validate_identifier("a".repeat(21).as_str(), RESERVED_NAMES).is_err());
    }

    #[test]
    fn strict_split_round_trips() {
        for scheme in [NamingScheme::new(""), NamingScheme::new("pod")] {
            let joined = scheme.join("alice", "train1");
            let components = scheme.split(&joined, true).expect("valid name");
            assert_eq!(components.prefix.as_deref(), scheme.prefix());
            assert_eq!(components.tenant.as_deref(), Some("alice"));
            assert_eq!(components.instance, "train1");
        }
    }

    #[test]
    fn strict_split_rejects_wrong_shapes() {
        let no_prefix = NamingScheme::new("");
        assert!(no_prefix.split("solo", true).is_none());
        assert!(no_prefix.split("a-b-c-d", true).is_none());

        let with_prefix = NamingScheme::new("pod");
        // two segments when a prefix is configured
        assert!(with_prefix.split("alice-train1", true).is_none());
        // mismatched prefix
        assert!(with_prefix.split("other-alice-train1", true).is_none());
        assert!(with_prefix.split("pod-alice-train1", true).is_some());
    }

    #[test]
    fn lax_split_keeps_partial_shapes() {
        let scheme = NamingScheme::new("pod");
        let components = scheme.split("train1", false).expect("bare tag");
        assert_eq!(components.tenant, None);
        assert_eq!(components.instance, "train1");
    }

    #[test]
    fn non_admin_cannot_cross_tenants() {
        let scheme = NamingScheme::new("");
        let err = scheme
            .resolve("bob-train1", &tenant("alice", false))
            .unwrap_err();
        assert!(matches!(err, WardenError::PermissionDenied(_)));
    }

    #[test]
    fn non_admin_resolves_own_names() {
        let scheme = NamingScheme::new("pod");
        let alice = tenant("alice", false);
        assert_eq!(scheme.resolve("train1", &alice).unwrap(), "pod-alice-train1");
        assert_eq!(
            scheme.resolve("alice-train1", &alice).unwrap(),
            "pod-alice-train1"
        );
    }

    #[test]
    fn admin_defaults_to_self_and_may_cross() {
        let scheme = NamingScheme::new("");
        let admin = tenant("root1", true);
        assert_eq!(scheme.resolve("train1", &admin).unwrap(), "root1-train1");
        assert_eq!(scheme.resolve("bob-train1", &admin).unwrap(), "bob-train1");
    }

    #[test]
    fn mismatched_prefix_is_denied() {
        let scheme = NamingScheme::new("pod");
        let err = scheme
            .resolve("other-alice-train1", &tenant("alice", false))
            .unwrap_err();
        assert!(matches!(err, WardenError::PermissionDenied(_)));
    }

    #[test]
    fn garbage_name_is_invalid_input() {
        let scheme = NamingScheme::new("pod");
        let err = scheme
            .resolve("a-b-c-d", &tenant("alice", false))
            .unwrap_err();
        assert!(matches!(err, WardenError::InvalidInput(_)));
    }
}
