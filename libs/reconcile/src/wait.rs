//! Change waiter: polls entity status until a terminal state.

use std::time::Duration;

use stratus_id::EntityId;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::api::{EntityStatus, EntityType, ProvisioningState, StatusApi};
use crate::error::{ErrorClass, ReconcileError, ReconcileResult};
use crate::shutdown::ShutdownSignal;

/// Default interval between status polls.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Which terminal condition a wait accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WaitTarget {
    /// Entity must exist and be normal; absence is a failure.
    Change,

    /// Entity must exist and be normal; absence means "not visible yet".
    Deploy,

    /// Entity must be gone.
    Delete,

    /// The child must be gone from a parent that is not mid-operation.
    NestedDelete(EntityId),
}

enum Poll {
    Done(Option<EntityStatus>),
    Continue(String),
    Fail(String),
}

impl WaitTarget {
    fn evaluate(&self, status: Option<EntityStatus>) -> Poll {
        match (self, status) {
            (WaitTarget::Delete | WaitTarget::NestedDelete(_), None) => Poll::Done(None),
            (WaitTarget::Change, None) => Poll::Fail("entity no longer exists".to_string()),
            (WaitTarget::Deploy, None) => Poll::Continue("not yet visible".to_string()),
            (_, Some(status)) => match &status.state {
                ProvisioningState::Failed(reason) => Poll::Fail(reason.clone()),
                ProvisioningState::Pending(state) => Poll::Continue(state.clone()),
                ProvisioningState::Normal => match self {
                    WaitTarget::Change | WaitTarget::Deploy => Poll::Done(Some(status)),
                    WaitTarget::Delete => Poll::Continue("still present".to_string()),
                    WaitTarget::NestedDelete(child) => {
                        if status.nested.contains(child) {
                            Poll::Continue(format!("'{child}' still attached"))
                        } else {
                            Poll::Done(Some(status))
                        }
                    }
                },
            },
        }
    }
}

/// Polls the status endpoint until an entity reaches a terminal state.
#[derive(Debug, Clone)]
pub struct ChangeWaiter {
    poll_interval: Duration,
}

impl ChangeWaiter {
    pub fn new(poll_interval: Duration) -> Self {
        Self { poll_interval }
    }

    /// Wait for an update to an existing entity to complete.
    pub async fn wait_for_change<S: StatusApi + ?Sized>(
        &self,
        api: &S,
        entity_type: EntityType,
        id: &EntityId,
        description: &str,
        timeout: Duration,
        shutdown: &ShutdownSignal,
    ) -> ReconcileResult<EntityStatus> {
        let status = self
            .poll(api, entity_type, id, description, timeout, shutdown, WaitTarget::Change)
            .await?;
        status.ok_or_else(|| ReconcileError::Failed {
            entity_type,
            id: id.clone(),
            reason: "entity no longer exists".to_string(),
        })
    }

    /// Wait for a newly created entity to be deployed.
    pub async fn wait_for_deploy<S: StatusApi + ?Sized>(
        &self,
        api: &S,
        entity_type: EntityType,
        id: &EntityId,
        description: &str,
        timeout: Duration,
        shutdown: &ShutdownSignal,
    ) -> ReconcileResult<EntityStatus> {
        let status = self
            .poll(api, entity_type, id, description, timeout, shutdown, WaitTarget::Deploy)
            .await?;
        status.ok_or_else(|| ReconcileError::Failed {
            entity_type,
            id: id.clone(),
            reason: "entity was never deployed".to_string(),
        })
    }

    /// Wait for an entity to be deleted. Absence is the terminal state.
    pub async fn wait_for_delete<S: StatusApi + ?Sized>(
        &self,
        api: &S,
        entity_type: EntityType,
        id: &EntityId,
        description: &str,
        timeout: Duration,
        shutdown: &ShutdownSignal,
    ) -> ReconcileResult<()> {
        self.poll(api, entity_type, id, description, timeout, shutdown, WaitTarget::Delete)
            .await
            .map(|_| ())
    }

    /// Wait for `child` to disappear from `parent`, which may keep running.
    ///
    /// Returns the parent's final status, or `None` if the parent is gone too.
    #[allow(clippy::too_many_arguments)]
    pub async fn wait_for_nested_delete<S: StatusApi + ?Sized>(
        &self,
        api: &S,
        parent_type: EntityType,
        parent_id: &EntityId,
        child: &EntityId,
        description: &str,
        timeout: Duration,
        shutdown: &ShutdownSignal,
    ) -> ReconcileResult<Option<EntityStatus>> {
        self.poll(
            api,
            parent_type,
            parent_id,
            description,
            timeout,
            shutdown,
            WaitTarget::NestedDelete(child.clone()),
        )
        .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn poll<S: StatusApi + ?Sized>(
        &self,
        api: &S,
        entity_type: EntityType,
        id: &EntityId,
        description: &str,
        timeout: Duration,
        shutdown: &ShutdownSignal,
        target: WaitTarget,
    ) -> ReconcileResult<Option<EntityStatus>> {
        let started = Instant::now();
        let deadline = started + timeout;
        let operation = format!("{description} of {entity_type} '{id}'");
        let mut polls = 0u32;

        info!(
            entity_type = %entity_type,
            id = %id,
            operation = description,
            timeout_secs = timeout.as_secs(),
            "Waiting for change to complete"
        );

        loop {
            polls += 1;

            let status = match api.fetch_status(entity_type, id).await {
                Ok(status) => Some(status),
                Err(err) => match err.class() {
                    ErrorClass::NotFound => Some(None),
                    ErrorClass::Transient => {
                        debug!(id = %id, error = %err, "Status endpoint busy, polling again");
                        None
                    }
                    ErrorClass::Fatal => return Err(err.into()),
                },
            };

            if let Some(status) = status {
                match target.evaluate(status) {
                    Poll::Done(status) => {
                        info!(
                            entity_type = %entity_type,
                            id = %id,
                            operation = description,
                            polls,
                            elapsed_ms = started.elapsed().as_millis() as u64,
                            "Change complete"
                        );
                        return Ok(status);
                    }
                    Poll::Fail(reason) => {
                        warn!(
                            entity_type = %entity_type,
                            id = %id,
                            operation = description,
                            reason = %reason,
                            "Change failed"
                        );
                        return Err(ReconcileError::Failed {
                            entity_type,
                            id: id.clone(),
                            reason,
                        });
                    }
                    Poll::Continue(state) => {
                        debug!(id = %id, state = %state, polls, "Change still in progress");
                    }
                }
            }

            let next_poll = Instant::now() + self.poll_interval;
            if next_poll >= deadline {
                if !shutdown.sleep_until(deadline).await {
                    return Err(ReconcileError::Cancelled(format!("waiting for {operation}")));
                }
                warn!(operation = %operation, polls, "Timed out waiting for change");
                return Err(ReconcileError::Timeout {
                    operation,
                    timeout,
                    attempts: polls,
                });
            }

            if !shutdown.sleep_until(next_poll).await {
                return Err(ReconcileError::Cancelled(format!("waiting for {operation}")));
            }
        }
    }
}

impl Default for ChangeWaiter {
    fn default() -> Self {
        Self::new(DEFAULT_POLL_INTERVAL)
    }
}
