//! The per-kind contract the engine is generic over.

use std::fmt::{Debug, Display};

use stratus_id::EntityId;

use crate::api::EntityType;
use crate::diff::ActionKind;

/// What the Change Waiter must observe before an action counts as complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The mutating call is synchronous; nothing to wait for.
    Immediate,

    /// Wait for the owner to return to a normal state.
    OwnerChange,

    /// Wait for the affected entity to be deployed.
    EntityDeploy,

    /// Wait for the affected entity to disappear.
    EntityDelete,

    /// Wait for the entity to disappear from its (still existing) owner.
    NestedDelete,
}

/// A nested sub-resource collection kind (disks, network adapters, tags, ...).
///
/// Implemented by zero-sized marker types. Desired items are matched to
/// observed items by correlation key, because a desired item has no remote
/// identifier until it has been created.
pub trait SubResource: Debug + Clone + Copy + PartialEq + Send + Sync + 'static {
    /// Correlation key (SCSI unit id, adapter index, tag name, ...).
    type Key: Ord + Clone + Debug + Display + Send + Sync;

    type Desired: Clone + Debug + PartialEq + Send + Sync;

    type Observed: Clone + Debug + PartialEq + Send + Sync;

    /// Human-readable kind name used in logs and errors.
    const NAME: &'static str;

    /// Entity type used when polling an individual entity of this kind.
    const ENTITY_TYPE: EntityType;

    /// Maximum number of mutating calls one Change may need.
    ///
    /// Some control-plane operations update a single attribute group per
    /// request (e.g. expand a disk, then change its speed).
    const CHANGE_STEPS: usize = 1;

    fn desired_key(desired: &Self::Desired) -> Self::Key;

    fn observed_key(observed: &Self::Observed) -> Self::Key;

    fn observed_id(observed: &Self::Observed) -> &EntityId;

    /// Returns true if any comparable attribute differs.
    fn needs_change(desired: &Self::Desired, observed: &Self::Observed) -> bool;

    /// Static validation of a single desired item.
    fn validate(_desired: &Self::Desired) -> Result<(), String> {
        Ok(())
    }

    /// Rejects changes the control plane can never perform in place.
    fn check_change(_desired: &Self::Desired, _observed: &Self::Observed) -> Result<(), String> {
        Ok(())
    }

    /// Rejects removals that must never be issued.
    fn check_remove(_observed: &Self::Observed) -> Result<(), String> {
        Ok(())
    }

    /// Whether this action kind needs the owner powered off.
    fn requires_power_off(_kind: ActionKind) -> bool {
        false
    }

    fn completion(kind: ActionKind) -> Completion;
}
