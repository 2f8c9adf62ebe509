//! In-memory control plane for tests and local runs.
//!
//! Mutations apply to the in-memory state immediately; the status endpoint
//! then reports the affected entity as pending for a configurable number of
//! polls. Busy responses, scripted errors and reported failures can be
//! injected, and the mock records how the engine drove it.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use stratus_id::{EntityId, OwnerId};
use tracing::debug;

use crate::api::{
    CollectionApi, EntityStatus, EntityType, Owner, PowerApi, PowerState, ProvisioningState,
    StatusApi,
};
use crate::error::ApiError;
use crate::kind::SubResource;
use crate::kinds::{
    AdapterType, AdapterUpdate, DesiredAdapter, DesiredDisk, DesiredRule, DesiredTag, Disk,
    DiskUpdate, FirewallRule, NetworkAdapter, ObservedAdapter, ObservedDisk, ObservedRule,
    ObservedTag, Tag,
};
use crate::lock::LockRegistry;

/// A mutating call accepted by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    Add {
        owner: OwnerId,
        kind: &'static str,
        key: String,
    },
    Change {
        owner: OwnerId,
        kind: &'static str,
        key: String,
    },
    Remove {
        owner: OwnerId,
        kind: &'static str,
        key: String,
    },
    PowerOff {
        owner: OwnerId,
    },
    PowerOn {
        owner: OwnerId,
    },
}

/// State of one owner in the mock.
#[derive(Debug, Default)]
pub struct MockOwner {
    entity_type: Option<EntityType>,
    running: bool,
    disks: Vec<ObservedDisk>,
    adapters: Vec<ObservedAdapter>,
    tags: Vec<ObservedTag>,
    rules: Vec<ObservedRule>,
}

/// Kinds whose collections the mock stores.
pub trait MockCollection: SubResource {
    #[doc(hidden)]
    fn items(owner: &mut MockOwner) -> &mut Vec<Self::Observed>;
}

impl MockCollection for Disk {
    fn items(owner: &mut MockOwner) -> &mut Vec<ObservedDisk> {
        &mut owner.disks
    }
}

impl MockCollection for NetworkAdapter {
    fn items(owner: &mut MockOwner) -> &mut Vec<ObservedAdapter> {
        &mut owner.adapters
    }
}

impl MockCollection for Tag {
    fn items(owner: &mut MockOwner) -> &mut Vec<ObservedTag> {
        &mut owner.tags
    }
}

impl MockCollection for FirewallRule {
    fn items(owner: &mut MockOwner) -> &mut Vec<ObservedRule> {
        &mut owner.rules
    }
}

#[derive(Debug, Default)]
struct MockState {
    owners: BTreeMap<String, MockOwner>,
    next_id: u64,
    pending: HashMap<String, u32>,
    failures: HashMap<String, String>,
    busy_remaining: u32,
    scripted: HashMap<usize, ApiError>,
    calls: Vec<MockCall>,
    attempts: usize,
    status_polls: usize,
}

impl MockState {
    fn owner_mut(&mut self, owner: &Owner) -> Result<&mut MockOwner, ApiError> {
        self.owners
            .get_mut(owner.id.as_str())
            .ok_or_else(|| ApiError::NotFound(format!("{owner} not found")))
    }

    fn allocate_id(&mut self, prefix: &str) -> Result<EntityId, ApiError> {
        self.next_id += 1;
        EntityId::parse(&format!("{prefix}-{}", self.next_id))
            .map_err(|err| ApiError::Malformed(err.to_string()))
    }

    fn remove_item<K: MockCollection>(
        &mut self,
        owner: &Owner,
        id: &EntityId,
    ) -> Result<(), ApiError> {
        let items = K::items(self.owner_mut(owner)?);
        let before = items.len();
        items.retain(|item| K::observed_id(item) != id);
        if items.len() == before {
            return Err(ApiError::NotFound(format!("{} '{id}' not found", K::NAME)));
        }
        Ok(())
    }

    fn find_item<K: MockCollection>(
        &mut self,
        owner: &Owner,
        id: &EntityId,
    ) -> Result<&mut K::Observed, ApiError> {
        K::items(self.owner_mut(owner)?)
            .iter_mut()
            .find(|item| K::observed_id(item) == id)
            .ok_or_else(|| ApiError::NotFound(format!("{} '{id}' not found", K::NAME)))
    }

    fn status(&self, entity_type: EntityType, id: &EntityId) -> Option<EntityStatus> {
        let normal = |nested: Vec<EntityId>| EntityStatus {
            id: id.clone(),
            state: ProvisioningState::Normal,
            nested,
        };

        match entity_type {
            EntityType::Server | EntityType::NetworkDomain => self
                .owners
                .get(id.as_str())
                .filter(|owner| owner.entity_type == Some(entity_type))
                .map(|owner| {
                    let nested = owner
                        .disks
                        .iter()
                        .map(|d| d.id.clone())
                        .chain(owner.adapters.iter().map(|a| a.id.clone()))
                        .collect();
                    normal(nested)
                }),
            EntityType::Disk => self
                .owners
                .values()
                .any(|o| o.disks.iter().any(|d| &d.id == id))
                .then(|| normal(Vec::new())),
            EntityType::NetworkAdapter => self
                .owners
                .values()
                .any(|o| o.adapters.iter().any(|a| &a.id == id))
                .then(|| normal(Vec::new())),
            EntityType::Tag => self
                .owners
                .values()
                .any(|o| o.tags.iter().any(|t| &t.id == id))
                .then(|| normal(Vec::new())),
            EntityType::FirewallRule => self
                .owners
                .values()
                .any(|o| o.rules.iter().any(|r| &r.id == id))
                .then(|| normal(Vec::new())),
        }
    }
}

/// In-memory [`CollectionApi`] / [`PowerApi`] implementation.
#[derive(Debug, Default)]
pub struct MockControlPlane {
    state: Mutex<MockState>,
    pending_polls: u32,
    mutate_delay: Duration,
    locks: Option<LockRegistry>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    unlocked_mutations: AtomicUsize,
    polls_under_async_lock: AtomicUsize,
}

impl MockControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report affected entities as pending for `polls` status polls after
    /// each asynchronous mutation.
    pub fn with_pending_polls(mut self, polls: u32) -> Self {
        self.pending_polls = polls;
        self
    }

    /// Make every mutating call take `delay` before it returns.
    pub fn with_mutate_delay(mut self, delay: Duration) -> Self {
        self.mutate_delay = delay;
        self
    }

    /// Observe `locks` to record whether the async lock was held during
    /// mutations and status polls.
    pub fn with_lock_registry(mut self, locks: LockRegistry) -> Self {
        self.locks = Some(locks);
        self
    }

    pub fn add_server(&self, id: &OwnerId, running: bool) {
        self.state().owners.insert(
            id.as_str().to_string(),
            MockOwner {
                entity_type: Some(EntityType::Server),
                running,
                ..MockOwner::default()
            },
        );
    }

    pub fn add_network_domain(&self, id: &OwnerId) {
        self.state().owners.insert(
            id.as_str().to_string(),
            MockOwner {
                entity_type: Some(EntityType::NetworkDomain),
                running: true,
                ..MockOwner::default()
            },
        );
    }

    /// Delete an owner out of band.
    pub fn delete_owner(&self, id: &OwnerId) {
        self.state().owners.remove(id.as_str());
    }

    /// Replace the observed collection of kind `K` for `owner`.
    pub fn seed<K: MockCollection>(&self, owner: &Owner, items: Vec<K::Observed>) {
        let mut state = self.state();
        if let Ok(entry) = state.owner_mut(owner) {
            *K::items(entry) = items;
        }
    }

    /// Current collection of kind `K` for `owner`.
    pub fn observed<K: MockCollection>(&self, owner: &Owner) -> Vec<K::Observed> {
        let mut state = self.state();
        match state.owner_mut(owner) {
            Ok(entry) => K::items(entry).clone(),
            Err(_) => Vec::new(),
        }
    }

    /// Remove an entity out of band, so a later remove finds it gone.
    pub fn vanish<K: MockCollection>(&self, owner: &Owner, id: &EntityId) {
        let _ = self.state().remove_item::<K>(owner, id);
    }

    pub fn is_running(&self, owner: &OwnerId) -> bool {
        self.state()
            .owners
            .get(owner.as_str())
            .is_some_and(|o| o.running)
    }

    /// The next `count` mutating calls are rejected as busy.
    pub fn fail_next_with_busy(&self, count: u32) {
        self.state().busy_remaining = count;
    }

    /// The next mutating call fails with `err`.
    pub fn fail_next_with(&self, err: ApiError) {
        let mut state = self.state();
        let next = state.attempts + 1;
        state.scripted.insert(next, err);
    }

    /// The `attempt`-th mutating call (1-based, counting rejected ones)
    /// fails with `err`.
    pub fn fail_attempt(&self, attempt: usize, err: ApiError) {
        self.state().scripted.insert(attempt, err);
    }

    /// Status polls for `id` report a failed state with `reason`.
    pub fn report_failure(&self, id: &EntityId, reason: &str) {
        self.state()
            .failures
            .insert(id.as_str().to_string(), reason.to_string());
    }

    /// Mutating calls accepted so far, in order.
    pub fn calls(&self) -> Vec<MockCall> {
        self.state().calls.clone()
    }

    /// Mutating calls attempted so far, including rejected ones.
    pub fn attempts(&self) -> usize {
        self.state().attempts
    }

    pub fn status_polls(&self) -> usize {
        self.state().status_polls
    }

    /// Highest number of mutating calls that were in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Mutating calls issued while the observed registry's async lock was free.
    pub fn unlocked_mutations(&self) -> usize {
        self.unlocked_mutations.load(Ordering::SeqCst)
    }

    /// Status polls made while the observed registry's async lock was held.
    pub fn polls_under_async_lock(&self) -> usize {
        self.polls_under_async_lock.load(Ordering::SeqCst)
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_pending(&self, state: &mut MockState, id: &EntityId) {
        if self.pending_polls > 0 {
            state
                .pending
                .insert(id.as_str().to_string(), self.pending_polls);
        }
    }

    async fn mutation<T, F>(&self, call: MockCall, apply: F) -> Result<T, ApiError>
    where
        F: FnOnce(&mut MockState) -> Result<T, ApiError> + Send,
        T: Send,
    {
        if let Some(locks) = &self.locks {
            if !locks.is_async_locked() {
                self.unlocked_mutations.fetch_add(1, Ordering::SeqCst);
            }
        }

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        if !self.mutate_delay.is_zero() {
            tokio::time::sleep(self.mutate_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let mut state = self.state();
        state.attempts += 1;
        let attempt = state.attempts;
        if let Some(err) = state.scripted.remove(&attempt) {
            debug!(call = ?call, error = %err, "Mock control plane failing call");
            return Err(err);
        }
        if state.busy_remaining > 0 {
            state.busy_remaining -= 1;
            debug!(call = ?call, "Mock control plane busy");
            return Err(ApiError::Busy(
                "another asynchronous operation is in progress".to_string(),
            ));
        }

        let value = apply(&mut state)?;
        state.calls.push(call);
        Ok(value)
    }
}

fn add_call<K: SubResource>(owner: &Owner, desired: &K::Desired) -> MockCall {
    MockCall::Add {
        owner: owner.id.clone(),
        kind: K::NAME,
        key: K::desired_key(desired).to_string(),
    }
}

fn change_call<K: SubResource>(owner: &Owner, observed: &K::Observed) -> MockCall {
    MockCall::Change {
        owner: owner.id.clone(),
        kind: K::NAME,
        key: K::observed_key(observed).to_string(),
    }
}

fn remove_call<K: SubResource>(owner: &Owner, observed: &K::Observed) -> MockCall {
    MockCall::Remove {
        owner: owner.id.clone(),
        kind: K::NAME,
        key: K::observed_key(observed).to_string(),
    }
}

fn snapshot<K: MockCollection>(
    plane: &MockControlPlane,
    owner: &Owner,
) -> Result<Option<Vec<K::Observed>>, ApiError> {
    let mut state = plane.state();
    Ok(state.owner_mut(owner).ok().map(|entry| K::items(entry).clone()))
}

#[async_trait]
impl StatusApi for MockControlPlane {
    async fn fetch_status(
        &self,
        entity_type: EntityType,
        id: &EntityId,
    ) -> Result<Option<EntityStatus>, ApiError> {
        if let Some(locks) = &self.locks {
            if locks.is_async_locked() {
                self.polls_under_async_lock.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mut state = self.state();
        state.status_polls += 1;

        if let Some(reason) = state.failures.get(id.as_str()) {
            return Ok(Some(EntityStatus {
                id: id.clone(),
                state: ProvisioningState::Failed(reason.clone()),
                nested: Vec::new(),
            }));
        }

        if let Some(remaining) = state.pending.get_mut(id.as_str()) {
            if *remaining > 0 {
                *remaining -= 1;
                return Ok(Some(EntityStatus {
                    id: id.clone(),
                    state: ProvisioningState::Pending("PENDING_CHANGE".to_string()),
                    nested: Vec::new(),
                }));
            }
        }

        Ok(state.status(entity_type, id))
    }
}

#[async_trait]
impl PowerApi for MockControlPlane {
    async fn power_state(&self, owner: &Owner) -> Result<Option<PowerState>, ApiError> {
        Ok(self.state().owners.get(owner.id.as_str()).map(|o| {
            if o.running {
                PowerState::Running
            } else {
                PowerState::Stopped
            }
        }))
    }

    async fn power_off(&self, owner: &Owner) -> Result<(), ApiError> {
        let call = MockCall::PowerOff {
            owner: owner.id.clone(),
        };
        self.mutation(call, |state| {
            state.owner_mut(owner)?.running = false;
            self.mark_pending(state, &owner.entity_id());
            Ok(())
        })
        .await
    }

    async fn power_on(&self, owner: &Owner) -> Result<(), ApiError> {
        let call = MockCall::PowerOn {
            owner: owner.id.clone(),
        };
        self.mutation(call, |state| {
            state.owner_mut(owner)?.running = true;
            self.mark_pending(state, &owner.entity_id());
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl CollectionApi<Disk> for MockControlPlane {
    async fn fetch_observed(&self, owner: &Owner) -> Result<Option<Vec<ObservedDisk>>, ApiError> {
        snapshot::<Disk>(self, owner)
    }

    async fn add(&self, owner: &Owner, desired: &DesiredDisk) -> Result<EntityId, ApiError> {
        self.mutation(add_call::<Disk>(owner, desired), |state| {
            let id = state.allocate_id("disk")?;
            state.owner_mut(owner)?.disks.push(ObservedDisk {
                id: id.clone(),
                scsi_unit_id: desired.scsi_unit_id,
                size_gb: desired.size_gb,
                speed: desired.speed,
            });
            self.mark_pending(state, &owner.entity_id());
            Ok(id)
        })
        .await
    }

    async fn change(
        &self,
        owner: &Owner,
        id: &EntityId,
        desired: &DesiredDisk,
        observed: &ObservedDisk,
    ) -> Result<(), ApiError> {
        self.mutation(change_call::<Disk>(owner, observed), |state| {
            let disk = state.find_item::<Disk>(owner, id)?;
            match desired.next_update(disk) {
                Some(DiskUpdate::Expand { size_gb }) => disk.size_gb = size_gb,
                Some(DiskUpdate::ChangeSpeed { speed }) => disk.speed = speed,
                None => {}
            }
            self.mark_pending(state, &owner.entity_id());
            Ok(())
        })
        .await
    }

    async fn remove(
        &self,
        owner: &Owner,
        id: &EntityId,
        observed: &ObservedDisk,
    ) -> Result<(), ApiError> {
        self.mutation(remove_call::<Disk>(owner, observed), |state| {
            state.remove_item::<Disk>(owner, id)?;
            self.mark_pending(state, &owner.entity_id());
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl CollectionApi<NetworkAdapter> for MockControlPlane {
    async fn fetch_observed(
        &self,
        owner: &Owner,
    ) -> Result<Option<Vec<ObservedAdapter>>, ApiError> {
        snapshot::<NetworkAdapter>(self, owner)
    }

    async fn add(&self, owner: &Owner, desired: &DesiredAdapter) -> Result<EntityId, ApiError> {
        self.mutation(add_call::<NetworkAdapter>(owner, desired), |state| {
            let id = state.allocate_id("nic")?;
            let host = (100 + state.next_id % 100) as u8;
            state.owner_mut(owner)?.adapters.push(ObservedAdapter {
                id: id.clone(),
                index: desired.index,
                vlan_id: desired.vlan_id.clone(),
                private_ipv4: desired
                    .private_ipv4
                    .unwrap_or(Ipv4Addr::new(10, 0, 0, host)),
                adapter_type: desired.adapter_type.unwrap_or(AdapterType::Vmxnet3),
            });
            self.mark_pending(state, &owner.entity_id());
            Ok(id)
        })
        .await
    }

    async fn change(
        &self,
        owner: &Owner,
        id: &EntityId,
        desired: &DesiredAdapter,
        observed: &ObservedAdapter,
    ) -> Result<(), ApiError> {
        self.mutation(change_call::<NetworkAdapter>(owner, observed), |state| {
            let adapter = state.find_item::<NetworkAdapter>(owner, id)?;
            match desired.next_update(adapter) {
                Some(AdapterUpdate::ChangeIpv4 { address }) => adapter.private_ipv4 = address,
                Some(AdapterUpdate::ChangeType { adapter_type }) => {
                    adapter.adapter_type = adapter_type
                }
                None => {}
            }
            self.mark_pending(state, &owner.entity_id());
            Ok(())
        })
        .await
    }

    async fn remove(
        &self,
        owner: &Owner,
        id: &EntityId,
        observed: &ObservedAdapter,
    ) -> Result<(), ApiError> {
        self.mutation(remove_call::<NetworkAdapter>(owner, observed), |state| {
            state.remove_item::<NetworkAdapter>(owner, id)?;
            self.mark_pending(state, &owner.entity_id());
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl CollectionApi<Tag> for MockControlPlane {
    async fn fetch_observed(&self, owner: &Owner) -> Result<Option<Vec<ObservedTag>>, ApiError> {
        snapshot::<Tag>(self, owner)
    }

    async fn add(&self, owner: &Owner, desired: &DesiredTag) -> Result<EntityId, ApiError> {
        self.mutation(add_call::<Tag>(owner, desired), |state| {
            let id = state.allocate_id("tag")?;
            state.owner_mut(owner)?.tags.push(ObservedTag {
                id: id.clone(),
                name: desired.name.clone(),
                value: desired.value.clone(),
            });
            Ok(id)
        })
        .await
    }

    async fn change(
        &self,
        owner: &Owner,
        id: &EntityId,
        desired: &DesiredTag,
        observed: &ObservedTag,
    ) -> Result<(), ApiError> {
        self.mutation(change_call::<Tag>(owner, observed), |state| {
            state.find_item::<Tag>(owner, id)?.value = desired.value.clone();
            Ok(())
        })
        .await
    }

    async fn remove(
        &self,
        owner: &Owner,
        id: &EntityId,
        observed: &ObservedTag,
    ) -> Result<(), ApiError> {
        self.mutation(remove_call::<Tag>(owner, observed), |state| {
            state.remove_item::<Tag>(owner, id)
        })
        .await
    }
}

#[async_trait]
impl CollectionApi<FirewallRule> for MockControlPlane {
    async fn fetch_observed(&self, owner: &Owner) -> Result<Option<Vec<ObservedRule>>, ApiError> {
        snapshot::<FirewallRule>(self, owner)
    }

    async fn add(&self, owner: &Owner, desired: &DesiredRule) -> Result<EntityId, ApiError> {
        self.mutation(add_call::<FirewallRule>(owner, desired), |state| {
            let id = state.allocate_id("rule")?;
            state.owner_mut(owner)?.rules.push(ObservedRule {
                id: id.clone(),
                name: desired.name.clone(),
                action: desired.action,
                protocol: desired.protocol,
                source: desired.source.clone(),
                destination: desired.destination.clone(),
                destination_port: desired.destination_port,
                enabled: desired.enabled,
            });
            self.mark_pending(state, &id);
            Ok(id)
        })
        .await
    }

    async fn change(
        &self,
        owner: &Owner,
        id: &EntityId,
        desired: &DesiredRule,
        observed: &ObservedRule,
    ) -> Result<(), ApiError> {
        self.mutation(change_call::<FirewallRule>(owner, observed), |state| {
            state.find_item::<FirewallRule>(owner, id)?.enabled = desired.enabled;
            Ok(())
        })
        .await
    }

    async fn remove(
        &self,
        owner: &Owner,
        id: &EntityId,
        observed: &ObservedRule,
    ) -> Result<(), ApiError> {
        self.mutation(remove_call::<FirewallRule>(owner, observed), |state| {
            state.remove_item::<FirewallRule>(owner, id)?;
            self.mark_pending(state, id);
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> Owner {
        Owner::server(OwnerId::parse("srv-1").unwrap())
    }

    #[tokio::test]
    async fn test_pending_then_normal() {
        let plane = MockControlPlane::new().with_pending_polls(2);
        let owner = server();
        plane.add_server(&owner.id, false);

        let desired = DesiredDisk {
            scsi_unit_id: 1,
            size_gb: 10,
            speed: Default::default(),
        };
        let id = CollectionApi::<Disk>::add(&plane, &owner, &desired)
            .await
            .unwrap();

        let owner_id = owner.entity_id();
        for _ in 0..2 {
            let status = plane
                .fetch_status(EntityType::Server, &owner_id)
                .await
                .unwrap()
                .unwrap();
            assert!(matches!(status.state, ProvisioningState::Pending(_)));
        }
        let status = plane
            .fetch_status(EntityType::Server, &owner_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.state, ProvisioningState::Normal);
        assert_eq!(status.nested, vec![id]);
    }

    #[tokio::test]
    async fn test_busy_then_accepted() {
        let plane = MockControlPlane::new();
        let owner = server();
        plane.add_server(&owner.id, true);
        plane.fail_next_with_busy(1);

        let desired = DesiredTag {
            name: "env".into(),
            value: "prod".into(),
        };
        let first = CollectionApi::<Tag>::add(&plane, &owner, &desired).await;
        assert!(matches!(first, Err(ApiError::Busy(_))));
        CollectionApi::<Tag>::add(&plane, &owner, &desired)
            .await
            .unwrap();

        assert_eq!(plane.attempts(), 2);
        assert_eq!(plane.calls().len(), 1);
        assert_eq!(plane.observed::<Tag>(&owner).len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_owner() {
        let plane = MockControlPlane::new();
        let owner = server();

        let observed = CollectionApi::<Disk>::fetch_observed(&plane, &owner)
            .await
            .unwrap();
        assert!(observed.is_none());
        assert_eq!(plane.power_state(&owner).await.unwrap(), None);
    }
}
