//! Serialized reconciliation of nested sub-resource collections.
//!
//! An owner (a server, a network domain) has collections of nested entities
//! (disks, network adapters, tags, firewall rules). A reconciliation pass
//! converges one such collection to its desired state:
//!
//! - **Differ** ([`diff()`]): pure add / change / remove classification by
//!   correlation key.
//! - **Lock registry** ([`LockRegistry`]): per-owner locks plus the single
//!   process-wide async-operation lock.
//! - **Retry executor** ([`RetryExecutor`]): fixed-delay retry of busy calls
//!   within a deadline.
//! - **Change waiter** ([`ChangeWaiter`]): status polling until a terminal
//!   state.
//! - **Orchestrator** ([`Orchestrator`]): drives a pass through the above.
//!
//! # Invariants
//!
//! - Actions are applied in order: adds, changes, removes
//! - The async-operation lock is held only around a mutating call
//! - A pass never rolls back; the next pass re-diffs from observed state

mod api;
mod diff;
mod error;
mod kind;
pub mod kinds;
mod lock;
pub mod mock;
mod orchestrator;
mod retry;
mod shutdown;
mod wait;

pub use api::{
    CollectionApi, EntityStatus, EntityType, Owner, PowerApi, PowerState, ProvisioningState,
    StatusApi,
};
pub use diff::{diff, validate_desired, Action, ActionKind, Diff};
pub use error::{ApiError, ErrorClass, ReconcileError, ReconcileResult};
pub use kind::{Completion, SubResource};
pub use kinds::ControlPlane;
pub use lock::{LockHandle, LockRegistry, LockScope};
pub use orchestrator::{mutate, AppliedAction, EngineSettings, Orchestrator, PassOutcome};
pub use retry::{Outcome, RetryExecutor, DEFAULT_RETRY_DELAY};
pub use shutdown::ShutdownSignal;
pub use wait::{ChangeWaiter, DEFAULT_POLL_INTERVAL};
