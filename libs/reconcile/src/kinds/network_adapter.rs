//! Network adapters attached to a server, keyed by adapter index.
//!
//! Index 0 is the primary adapter and is never removed. Moving an adapter to
//! another VLAN is not possible in place.

use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};
use stratus_id::EntityId;

use crate::api::EntityType;
use crate::diff::ActionKind;
use crate::kind::{Completion, SubResource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdapterType {
    E1000,
    E1000E,
    #[serde(rename = "VMXNET3")]
    Vmxnet3,
}

impl fmt::Display for AdapterType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterType::E1000 => f.write_str("E1000"),
            AdapterType::E1000E => f.write_str("E1000E"),
            AdapterType::Vmxnet3 => f.write_str("VMXNET3"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DesiredAdapter {
    pub index: u32,
    pub vlan_id: EntityId,

    /// Assigned by the control plane if not set.
    #[serde(default)]
    pub private_ipv4: Option<Ipv4Addr>,

    /// Control-plane default if not set.
    #[serde(default)]
    pub adapter_type: Option<AdapterType>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedAdapter {
    pub id: EntityId,
    pub index: u32,
    pub vlan_id: EntityId,
    pub private_ipv4: Ipv4Addr,
    pub adapter_type: AdapterType,
}

/// One adapter update request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterUpdate {
    ChangeIpv4 { address: Ipv4Addr },
    ChangeType { adapter_type: AdapterType },
}

impl DesiredAdapter {
    /// The next single update that moves `observed` towards `self`.
    pub fn next_update(&self, observed: &ObservedAdapter) -> Option<AdapterUpdate> {
        if let Some(address) = self.private_ipv4.filter(|ip| *ip != observed.private_ipv4) {
            return Some(AdapterUpdate::ChangeIpv4 { address });
        }
        self.adapter_type
            .filter(|t| *t != observed.adapter_type)
            .map(|adapter_type| AdapterUpdate::ChangeType { adapter_type })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkAdapter;

impl SubResource for NetworkAdapter {
    type Key = u32;
    type Desired = DesiredAdapter;
    type Observed = ObservedAdapter;

    const NAME: &'static str = "network adapter";
    const ENTITY_TYPE: EntityType = EntityType::NetworkAdapter;
    const CHANGE_STEPS: usize = 2;

    fn desired_key(desired: &DesiredAdapter) -> u32 {
        desired.index
    }

    fn observed_key(observed: &ObservedAdapter) -> u32 {
        observed.index
    }

    fn observed_id(observed: &ObservedAdapter) -> &EntityId {
        &observed.id
    }

    fn needs_change(desired: &DesiredAdapter, observed: &ObservedAdapter) -> bool {
        desired.vlan_id != observed.vlan_id || desired.next_update(observed).is_some()
    }

    fn check_change(desired: &DesiredAdapter, observed: &ObservedAdapter) -> Result<(), String> {
        if desired.vlan_id != observed.vlan_id {
            return Err(format!(
                "cannot move network adapter {} from VLAN '{}' to '{}' (the adapter must be replaced)",
                observed.index, observed.vlan_id, desired.vlan_id
            ));
        }
        Ok(())
    }

    fn check_remove(observed: &ObservedAdapter) -> Result<(), String> {
        if observed.index == 0 {
            return Err("the primary network adapter cannot be removed".to_string());
        }
        Ok(())
    }

    fn requires_power_off(kind: ActionKind) -> bool {
        matches!(kind, ActionKind::Add | ActionKind::Remove)
    }

    fn completion(kind: ActionKind) -> Completion {
        match kind {
            ActionKind::Add | ActionKind::Change => Completion::OwnerChange,
            ActionKind::Remove => Completion::NestedDelete,
        }
    }
}
