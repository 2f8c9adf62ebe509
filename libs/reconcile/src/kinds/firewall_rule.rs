//! Firewall rules of a network domain, keyed by rule name.
//!
//! A rule can only be enabled or disabled in place. Any other difference
//! means the rule has to be deleted and recreated.

use serde::{Deserialize, Serialize};
use stratus_id::EntityId;

use crate::api::EntityType;
use crate::diff::ActionKind;
use crate::kind::{Completion, SubResource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RuleAction {
    Accept,
    Drop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Ip,
    Tcp,
    Udp,
    Icmp,
}

fn default_enabled() -> bool {
    true
}

fn any_address() -> String {
    "ANY".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredRule {
    pub name: String,
    pub action: RuleAction,
    pub protocol: Protocol,
    #[serde(default = "any_address")]
    pub source: String,
    #[serde(default = "any_address")]
    pub destination: String,
    #[serde(default)]
    pub destination_port: Option<u16>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedRule {
    pub id: EntityId,
    pub name: String,
    pub action: RuleAction,
    pub protocol: Protocol,
    pub source: String,
    pub destination: String,
    pub destination_port: Option<u16>,
    pub enabled: bool,
}

impl DesiredRule {
    /// Name of the first attribute that cannot be changed in place.
    fn immutable_difference(&self, observed: &ObservedRule) -> Option<&'static str> {
        if self.action != observed.action {
            Some("action")
        } else if self.protocol != observed.protocol {
            Some("protocol")
        } else if self.source != observed.source {
            Some("source")
        } else if self.destination != observed.destination {
            Some("destination")
        } else if self.destination_port != observed.destination_port {
            Some("destination port")
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirewallRule;

impl SubResource for FirewallRule {
    type Key = String;
    type Desired = DesiredRule;
    type Observed = ObservedRule;

    const NAME: &'static str = "firewall rule";
    const ENTITY_TYPE: EntityType = EntityType::FirewallRule;

    fn desired_key(desired: &DesiredRule) -> String {
        desired.name.clone()
    }

    fn observed_key(observed: &ObservedRule) -> String {
        observed.name.clone()
    }

    fn observed_id(observed: &ObservedRule) -> &EntityId {
        &observed.id
    }

    fn needs_change(desired: &DesiredRule, observed: &ObservedRule) -> bool {
        desired.enabled != observed.enabled || desired.immutable_difference(observed).is_some()
    }

    fn validate(desired: &DesiredRule) -> Result<(), String> {
        if desired.name.trim().is_empty() {
            return Err("rule name must not be empty".to_string());
        }
        if desired.destination_port.is_some()
            && !matches!(desired.protocol, Protocol::Tcp | Protocol::Udp)
        {
            return Err("a destination port requires protocol TCP or UDP".to_string());
        }
        Ok(())
    }

    fn check_change(desired: &DesiredRule, observed: &ObservedRule) -> Result<(), String> {
        match desired.immutable_difference(observed) {
            Some(field) => Err(format!(
                "firewall rule '{}' cannot change {} in place (the rule must be replaced)",
                observed.name, field
            )),
            None => Ok(()),
        }
    }

    fn completion(kind: ActionKind) -> Completion {
        match kind {
            ActionKind::Add => Completion::EntityDeploy,
            ActionKind::Change => Completion::Immediate,
            ActionKind::Remove => Completion::EntityDelete,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn desired() -> DesiredRule {
        DesiredRule {
            name: "allow-https".into(),
            action: RuleAction::Accept,
            protocol: Protocol::Tcp,
            source: "ANY".into(),
            destination: "10.0.0.0/24".into(),
            destination_port: Some(443),
            enabled: true,
        }
    }

    fn observed() -> ObservedRule {
        ObservedRule {
            id: EntityId::parse("rule-1").unwrap(),
            name: "allow-https".into(),
            action: RuleAction::Accept,
            protocol: Protocol::Tcp,
            source: "ANY".into(),
            destination: "10.0.0.0/24".into(),
            destination_port: Some(443),
            enabled: false,
        }
    }

    #[test]
    fn test_enable_in_place() {
        assert!(FirewallRule::needs_change(&desired(), &observed()));
        assert!(FirewallRule::check_change(&desired(), &observed()).is_ok());
    }

    #[test]
    fn test_port_change_requires_replacement() {
        let mut want = desired();
        want.destination_port = Some(8443);
        let err = FirewallRule::check_change(&want, &observed()).unwrap_err();
        assert!(err.contains("destination port"));
    }

    #[test]
    fn test_port_requires_tcp_or_udp() {
        let mut want = desired();
        want.protocol = Protocol::Icmp;
        assert!(FirewallRule::validate(&want).is_err());
    }

    #[test]
    fn test_manifest_defaults() {
        let rule: DesiredRule = serde_json::from_str(
            r#"{"name": "deny-all", "action": "DROP", "protocol": "IP"}"#,
        )
        .unwrap();
        assert_eq!(rule.source, "ANY");
        assert_eq!(rule.destination, "ANY");
        assert!(rule.enabled);
    }
}
