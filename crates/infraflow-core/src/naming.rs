//! Deterministic provider names and step identifiers
//!
//! Provider names are derived from `(instance, logical name)` so that every
//! apply can look a resource up before creating it.

use infraflow_cloud::ResourceKind;
use sha2::{Digest, Sha256};

/// Longest name Compute Engine accepts
pub const MAX_RESOURCE_NAME: usize = 63;

/// Service account ids are limited to 6..=30 characters
pub const MAX_ACCOUNT_ID: usize = 30;
pub const MIN_ACCOUNT_ID: usize = 6;

pub fn provider_name(instance_id: &str, logical: &str) -> String {
    format!("{}-{}", instance_id, logical)
}

/// Service account id, shortened with a stable hash suffix when too long
pub fn service_account_id(instance_id: &str, logical: &str) -> String {
    let full = provider_name(instance_id, logical);
    if full.len() <= MAX_ACCOUNT_ID {
        return full;
    }

    let digest = format!("{:x}", Sha256::digest(full.as_bytes()));
    let cut = full
        .char_indices()
        .nth(MAX_ACCOUNT_ID - 9)
        .map_or(full.len(), |(i, _)| i);
    let prefix = full[..cut].trim_end_matches('-');
    format!("{}-{}", prefix, &digest[..8])
}

pub fn step_id(kind: ResourceKind, logical: &str) -> String {
    format!("{}/{}", kind.as_str(), logical)
}

/// RFC 1035 label: lowercase letter first, then letters, digits or hyphens,
/// not ending with a hyphen
pub fn is_rfc1035(name: &str) -> bool {
    let bytes = name.as_bytes();
    let Some((&first, rest)) = bytes.split_first() else {
        return false;
    };
    if !first.is_ascii_lowercase() || name.len() > MAX_RESOURCE_NAME {
        return false;
    }
    if rest.last() == Some(&b'-') {
        return false;
    }
    rest.iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rfc1035() {
        assert!(is_rfc1035("nodes"));
        assert!(is_rfc1035("shoot--dev--a-nodes"));
        assert!(is_rfc1035("a"));
        assert!(!is_rfc1035(""));
        assert!(!is_rfc1035("Nodes"));
        assert!(!is_rfc1035("1nodes"));
        assert!(!is_rfc1035("nodes-"));
        assert!(!is_rfc1035("no_des"));
        assert!(!is_rfc1035(&"a".repeat(64)));
    }

    #[test]
    fn test_service_account_id() {
        assert_eq!(service_account_id("shoot", "nodes"), "shoot-nodes");

        let long = service_account_id("shoot--garden--production", "node-pool-workers");
        assert_eq!(long.len(), MAX_ACCOUNT_ID);
        assert!(long.starts_with("shoot--garden--produ"));
        // Stable across calls
        assert_eq!(
            long,
            service_account_id("shoot--garden--production", "node-pool-workers")
        );
        assert_ne!(
            long,
            service_account_id("shoot--garden--production", "node-pool-masters")
        );
    }

    #[test]
    fn test_step_ids() {
        assert_eq!(step_id(ResourceKind::Subnet, "nodes"), "subnet/nodes");
        assert_eq!(
            step_id(ResourceKind::ServiceAccount, "nodes"),
            "service-account/nodes"
        );
    }
}
