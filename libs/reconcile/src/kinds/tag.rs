//! Tags applied to an asset, keyed by tag name. Tag calls are synchronous.

use serde::{Deserialize, Serialize};
use stratus_id::EntityId;

use crate::api::EntityType;
use crate::diff::ActionKind;
use crate::kind::{Completion, SubResource};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredTag {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedTag {
    pub id: EntityId,
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag;

impl SubResource for Tag {
    type Key = String;
    type Desired = DesiredTag;
    type Observed = ObservedTag;

    const NAME: &'static str = "tag";
    const ENTITY_TYPE: EntityType = EntityType::Tag;

    fn desired_key(desired: &DesiredTag) -> String {
        desired.name.clone()
    }

    fn observed_key(observed: &ObservedTag) -> String {
        observed.name.clone()
    }

    fn observed_id(observed: &ObservedTag) -> &EntityId {
        &observed.id
    }

    fn needs_change(desired: &DesiredTag, observed: &ObservedTag) -> bool {
        desired.value != observed.value
    }

    fn validate(desired: &DesiredTag) -> Result<(), String> {
        if desired.name.trim().is_empty() {
            return Err("tag name must not be empty".to_string());
        }
        Ok(())
    }

    fn completion(_kind: ActionKind) -> Completion {
        Completion::Immediate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::{diff, validate_desired};

    fn tag(name: &str, value: &str) -> DesiredTag {
        DesiredTag {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_blank_name_is_invalid() {
        let err = validate_desired::<Tag>(&[tag("  ", "x")]).unwrap_err();
        assert!(err.to_string().contains("tag name must not be empty"));
    }

    #[test]
    fn test_value_change() {
        let observed = [ObservedTag {
            id: EntityId::parse("tag-env").unwrap(),
            name: "env".into(),
            value: "staging".into(),
        }];
        let plan = diff::<Tag>(&[tag("env", "prod"), tag("team", "infra")], &observed);

        assert_eq!(plan.add.len(), 1);
        assert_eq!(plan.change.len(), 1);
        assert!(plan.remove.is_empty());
    }
}
