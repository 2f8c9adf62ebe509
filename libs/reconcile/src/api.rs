//! Collaborator contracts for the remote control plane.
//!
//! The engine never talks HTTP itself. It consumes these traits:
//! - [`StatusApi`] for the Change Waiter's polling
//! - [`PowerApi`] for the owner power guard
//! - [`CollectionApi`] for fetching and mutating one sub-resource collection

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use stratus_id::{EntityId, OwnerId};

use crate::error::ApiError;
use crate::kind::SubResource;

/// Kinds of remote entities the engine addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Server,
    NetworkDomain,
    Disk,
    NetworkAdapter,
    Tag,
    FirewallRule,
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityType::Server => "server",
            EntityType::NetworkDomain => "network domain",
            EntityType::Disk => "disk",
            EntityType::NetworkAdapter => "network adapter",
            EntityType::Tag => "tag",
            EntityType::FirewallRule => "firewall rule",
        };
        f.write_str(name)
    }
}

/// The parent resource whose nested collection is being reconciled.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Owner {
    pub id: OwnerId,
    pub entity_type: EntityType,
}

impl Owner {
    pub fn server(id: OwnerId) -> Self {
        Self {
            id,
            entity_type: EntityType::Server,
        }
    }

    pub fn network_domain(id: OwnerId) -> Self {
        Self {
            id,
            entity_type: EntityType::NetworkDomain,
        }
    }

    /// The owner addressed as an entity (for status polling).
    pub fn entity_id(&self) -> EntityId {
        EntityId::from(self.id.clone())
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.entity_type, self.id)
    }
}

/// Provisioning state reported by the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisioningState {
    /// Deployed and idle.
    Normal,

    /// An operation is still in progress (the payload is the raw state, e.g. `PENDING_CHANGE`).
    Pending(String),

    /// The last operation failed.
    Failed(String),
}

/// A point-in-time status report for one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityStatus {
    pub id: EntityId,
    pub state: ProvisioningState,

    /// Entities currently nested inside this one (disks and adapters of a server).
    pub nested: Vec<EntityId>,
}

/// Power state of an owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerState {
    Running,
    Stopped,
}

/// Status endpoint of the control plane.
#[async_trait]
pub trait StatusApi: Send + Sync {
    /// Fetch the current status of an entity.
    ///
    /// Returns `Ok(None)` if the entity does not exist.
    async fn fetch_status(
        &self,
        entity_type: EntityType,
        id: &EntityId,
    ) -> Result<Option<EntityStatus>, ApiError>;
}

/// Owner power operations used when an action needs the owner powered off.
#[async_trait]
pub trait PowerApi: StatusApi {
    /// Returns `Ok(None)` if the owner does not exist.
    async fn power_state(&self, owner: &Owner) -> Result<Option<PowerState>, ApiError>;

    /// Begin a graceful shutdown (asynchronous on the control plane).
    async fn power_off(&self, owner: &Owner) -> Result<(), ApiError>;

    /// Begin starting the owner (asynchronous on the control plane).
    async fn power_on(&self, owner: &Owner) -> Result<(), ApiError>;
}

/// Fetch and mutate one sub-resource collection of an owner.
///
/// Each mutating call is a single control-plane request; the engine holds the
/// global async-operation lock around it and waits for completion afterwards.
#[async_trait]
pub trait CollectionApi<K: SubResource>: StatusApi {
    /// Fetch the observed collection.
    ///
    /// Returns `Ok(None)` if the owner itself no longer exists.
    async fn fetch_observed(&self, owner: &Owner) -> Result<Option<Vec<K::Observed>>, ApiError>;

    /// Create a new entity; returns the identifier assigned by the control plane.
    async fn add(&self, owner: &Owner, desired: &K::Desired) -> Result<EntityId, ApiError>;

    /// Update an existing entity towards the desired attributes.
    async fn change(
        &self,
        owner: &Owner,
        id: &EntityId,
        desired: &K::Desired,
        observed: &K::Observed,
    ) -> Result<(), ApiError>;

    /// Remove an existing entity.
    async fn remove(
        &self,
        owner: &Owner,
        id: &EntityId,
        observed: &K::Observed,
    ) -> Result<(), ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_display() {
        let owner = Owner::server(OwnerId::parse("srv-1").unwrap());
        assert_eq!(owner.to_string(), "server 'srv-1'");
        assert_eq!(owner.entity_id().as_str(), "srv-1");
    }
}
