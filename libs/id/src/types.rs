//! Typed ID definitions.

use crate::define_id;

pub use crate::macros::MAX_ID_LEN;

define_id!(OwnerId, "owner");
define_id!(EntityId, "entity");

impl From<OwnerId> for EntityId {
    fn from(owner: OwnerId) -> Self {
        Self(owner.0)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;

    #[test]
    fn test_owner_id_roundtrip() {
        let id: OwnerId = "7b3f0a2e-server".parse().unwrap();
        let s = id.to_string();
        let parsed: OwnerId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_empty_id_rejected() {
        let result: Result<EntityId, _> = "".parse();
        assert!(result.unwrap_err().is_empty());
    }

    #[test]
    fn test_whitespace_rejected() {
        let result: Result<EntityId, _> = "disk 0".parse();
        assert!(matches!(result.unwrap_err(), IdError::Whitespace(_)));
    }

    #[test]
    fn test_too_long_rejected() {
        let long = "x".repeat(MAX_ID_LEN + 1);
        let result = OwnerId::parse(&long);
        assert_eq!(
            result.unwrap_err(),
            IdError::TooLong {
                max: MAX_ID_LEN,
                actual: MAX_ID_LEN + 1
            }
        );
    }

    #[test]
    fn test_serde_roundtrip() {
        let id = EntityId::parse("disk-42").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"disk-42\"");
        let back: EntityId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn test_serde_rejects_invalid() {
        let result: Result<OwnerId, _> = serde_json::from_str("\"\"");
        assert!(result.is_err());
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn parse_display_roundtrip(raw in "[A-Za-z0-9_./-]{1,128}") {
                let id = EntityId::parse(&raw).unwrap();
                prop_assert_eq!(id.to_string(), raw);
            }

            #[test]
            fn whitespace_never_parses(prefix in "[a-z]{0,8}", suffix in "[a-z]{0,8}") {
                let raw = format!("{prefix} {suffix}");
                prop_assert!(OwnerId::parse(&raw).is_err());
            }
        }
    }
}
