//! Reconciliation orchestrator.
//!
//! One pass moves through `Fetch -> Diff -> Apply(i) -> Wait(i) -> ... ->
//! Done | Aborted` for a single owner and sub-resource kind:
//!
//! 1. Validate the desired collection and fetch the observed one. A missing
//!    owner ends the pass with [`PassOutcome::OwnerDeleted`].
//! 2. Diff, then run every precondition check before any mutation.
//! 3. Apply actions in order (adds, changes, removes). Each action holds the
//!    owner lock through its wait; the async-operation lock is held only
//!    around the mutating call itself.
//! 4. The first fatal error aborts the pass. Completed actions are not rolled
//!    back; the next pass re-diffs from the then-current state.
//!
//! Actions that need the owner powered off are wrapped by a power guard:
//! the owner is shut down once before the first such action and started
//! again when the pass ends.

use std::sync::Arc;
use std::time::Duration;

use stratus_id::EntityId;
use tracing::{debug, info, instrument, warn};

use crate::api::{CollectionApi, Owner, PowerApi, PowerState};
use crate::diff::{diff, validate_desired, Action, ActionKind};
use crate::error::{ApiError, ErrorClass, ReconcileError, ReconcileResult};
use crate::kind::{Completion, SubResource};
use crate::lock::LockRegistry;
use crate::retry::{Outcome, RetryExecutor, DEFAULT_RETRY_DELAY};
use crate::shutdown::ShutdownSignal;
use crate::wait::{ChangeWaiter, DEFAULT_POLL_INTERVAL};

/// Timing and policy settings shared by every pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineSettings {
    /// Delay between attempts of a busy call.
    pub retry_delay: Duration,

    /// Deadline for retrying a single control-plane call.
    pub retry_timeout: Duration,

    /// Interval between status polls.
    pub poll_interval: Duration,

    /// Deadline for an Add to complete.
    pub create_timeout: Duration,

    /// Deadline for a Change (and owner power transitions) to complete.
    pub update_timeout: Duration,

    /// Deadline for a Remove to complete.
    pub delete_timeout: Duration,

    /// Whether the engine may shut down a running owner.
    pub allow_owner_reboot: bool,
}

impl EngineSettings {
    /// Completion deadline for an action kind.
    pub fn timeout_for(&self, kind: ActionKind) -> Duration {
        match kind {
            ActionKind::Add => self.create_timeout,
            ActionKind::Change => self.update_timeout,
            ActionKind::Remove => self.delete_timeout,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            retry_delay: DEFAULT_RETRY_DELAY,
            retry_timeout: Duration::from_secs(10 * 60),
            poll_interval: DEFAULT_POLL_INTERVAL,
            create_timeout: Duration::from_secs(30 * 60),
            update_timeout: Duration::from_secs(10 * 60),
            delete_timeout: Duration::from_secs(15 * 60),
            allow_owner_reboot: false,
        }
    }
}

/// An action that completed during a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedAction {
    pub kind: ActionKind,

    /// Description of the target, e.g. `disk 2 ('d-17')`.
    pub target: String,

    /// Identifier of the affected entity (the new one for adds).
    pub entity: EntityId,

    /// True if a remove found the entity already gone.
    pub already_satisfied: bool,
}

/// Result of a pass that did not abort.
#[derive(Debug, Clone)]
pub enum PassOutcome<K: SubResource> {
    /// All actions were applied.
    Converged {
        owner: Owner,
        applied: Vec<AppliedAction>,

        /// Observed collection after the last action.
        observed: Vec<K::Observed>,
    },

    /// The owner no longer exists; nothing was applied.
    OwnerDeleted { owner: Owner },
}

impl<K: SubResource> PassOutcome<K> {
    pub fn is_owner_deleted(&self) -> bool {
        matches!(self, PassOutcome::OwnerDeleted { .. })
    }

    pub fn applied(&self) -> &[AppliedAction] {
        match self {
            PassOutcome::Converged { applied, .. } => applied,
            PassOutcome::OwnerDeleted { .. } => &[],
        }
    }
}

/// Issue the single control-plane call for `action`.
///
/// Returns the identifier of the affected entity.
pub async fn mutate<K, A>(api: &A, owner: &Owner, action: &Action<K>) -> Result<EntityId, ApiError>
where
    K: SubResource,
    A: CollectionApi<K> + ?Sized,
{
    match action {
        Action::Add(desired) => CollectionApi::<K>::add(api, owner, desired).await,
        Action::Change(id, desired, observed) => {
            CollectionApi::<K>::change(api, owner, id, desired, observed).await?;
            Ok(id.clone())
        }
        Action::Remove(id, observed) => {
            CollectionApi::<K>::remove(api, owner, id, observed).await?;
            Ok(id.clone())
        }
    }
}

/// Classify the result of a read: busy is retried, not-found means absent.
fn read_outcome<T>(result: Result<Option<T>, ApiError>) -> Outcome<Option<T>> {
    match result {
        Ok(value) => Outcome::Success(value),
        Err(err) => match err.class() {
            ErrorClass::Transient => Outcome::Retry,
            ErrorClass::NotFound => Outcome::Success(None),
            ErrorClass::Fatal => Outcome::Fail(err.into()),
        },
    }
}

fn annotate<K: SubResource>(
    owner: &Owner,
    action: &Action<K>,
    completed: usize,
    total: usize,
    source: ReconcileError,
) -> ReconcileError {
    ReconcileError::Action {
        owner: owner.id.clone(),
        kind: action.kind(),
        target: action.describe(),
        completed,
        total,
        source: Box::new(source),
    }
}

/// Power handling for one pass.
#[derive(Debug, Default)]
struct PowerGuard {
    /// The owner is running and must be shut down before the next
    /// power-sensitive action.
    running: bool,

    /// This pass shut the owner down and must start it again.
    restart: bool,
}

/// Drives reconciliation passes against a control plane.
pub struct Orchestrator<A: ?Sized> {
    api: Arc<A>,
    locks: LockRegistry,
    retry: RetryExecutor,
    waiter: ChangeWaiter,
    settings: EngineSettings,
    shutdown: ShutdownSignal,
}

impl<A: ?Sized> Clone for Orchestrator<A> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            locks: self.locks.clone(),
            retry: self.retry.clone(),
            waiter: self.waiter.clone(),
            settings: self.settings.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<A: ?Sized> Orchestrator<A> {
    pub fn new(
        api: Arc<A>,
        locks: LockRegistry,
        settings: EngineSettings,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            api,
            locks,
            retry: RetryExecutor::new(settings.retry_delay),
            waiter: ChangeWaiter::new(settings.poll_interval),
            settings,
            shutdown,
        }
    }

    pub fn api(&self) -> &Arc<A> {
        &self.api
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }
}

impl<A: PowerApi + ?Sized> Orchestrator<A> {
    /// Run one reconciliation pass of kind `K` for `owner`.
    #[instrument(skip_all, fields(owner = %owner, kind = K::NAME))]
    pub async fn reconcile<K>(
        &self,
        owner: &Owner,
        desired: &[K::Desired],
    ) -> ReconcileResult<PassOutcome<K>>
    where
        K: SubResource,
        A: CollectionApi<K>,
    {
        validate_desired::<K>(desired)?;

        let Some(mut observed) = self.fetch_observed::<K>(owner).await? else {
            info!("Owner no longer exists, skipping pass");
            return Ok(PassOutcome::OwnerDeleted {
                owner: owner.clone(),
            });
        };

        let plan = diff::<K>(desired, &observed);
        info!(
            add = plan.add.len(),
            change = plan.change.len(),
            remove = plan.remove.len(),
            "Computed diff"
        );
        if plan.is_empty() {
            return Ok(PassOutcome::Converged {
                owner: owner.clone(),
                applied: Vec::new(),
                observed,
            });
        }

        let actions = plan.into_actions();
        let total = actions.len();

        Self::check_preconditions(owner, &actions)?;

        let mut power = PowerGuard::default();
        if let Some(first) = actions.iter().find(|a| K::requires_power_off(a.kind())) {
            match self.fetch_power_state(owner).await {
                Ok(None) => {
                    info!("Owner no longer exists, skipping pass");
                    return Ok(PassOutcome::OwnerDeleted {
                        owner: owner.clone(),
                    });
                }
                Ok(Some(PowerState::Running)) if !self.settings.allow_owner_reboot => {
                    let reason = format!(
                        "{owner} must be powered off to {} {}, and owner reboots are not allowed",
                        first.kind(),
                        first.describe()
                    );
                    return Err(annotate(
                        owner,
                        first,
                        0,
                        total,
                        ReconcileError::Precondition(reason),
                    ));
                }
                Ok(Some(state)) => power.running = state == PowerState::Running,
                Err(err) => return Err(annotate(owner, first, 0, total, err)),
            }
        }

        let mut applied = Vec::with_capacity(total);
        let mut aborted = None;

        for (index, action) in actions.iter().enumerate() {
            match self
                .apply_guarded(owner, action, &mut observed, &mut power)
                .await
            {
                Ok(done) => applied.push(done),
                Err(err) => {
                    warn!(
                        action = %action.kind(),
                        target = %action.describe(),
                        completed = index,
                        total,
                        error = %err,
                        "Aborting reconciliation pass"
                    );
                    aborted = Some(annotate(owner, action, index, total, err));
                    break;
                }
            }
        }

        if power.restart {
            let restarted = self.start_owner(owner).await;
            match (aborted, restarted) {
                (Some(err), Err(restart_err)) => {
                    warn!(error = %restart_err, "Failed to restart owner after aborted pass");
                    return Err(err);
                }
                (Some(err), Ok(())) => return Err(err),
                (None, Err(restart_err)) => return Err(restart_err),
                (None, Ok(())) => {}
            }
        } else if let Some(err) = aborted {
            return Err(err);
        }

        info!(applied = applied.len(), "Reconciliation pass complete");
        Ok(PassOutcome::Converged {
            owner: owner.clone(),
            applied,
            observed,
        })
    }

    /// Reject the whole pass if any action can never succeed.
    fn check_preconditions<K: SubResource>(
        owner: &Owner,
        actions: &[Action<K>],
    ) -> ReconcileResult<()> {
        let total = actions.len();
        for action in actions {
            let check = match action {
                Action::Add(_) => Ok(()),
                Action::Change(_, desired, observed) => K::check_change(desired, observed),
                Action::Remove(_, observed) => K::check_remove(observed),
            };
            if let Err(reason) = check {
                warn!(
                    action = %action.kind(),
                    target = %action.describe(),
                    reason = %reason,
                    "Precondition violated"
                );
                return Err(annotate(
                    owner,
                    action,
                    0,
                    total,
                    ReconcileError::Precondition(reason),
                ));
            }
        }
        Ok(())
    }

    /// Apply one action under the owner lock, powering the owner off first
    /// if the action requires it.
    async fn apply_guarded<K>(
        &self,
        owner: &Owner,
        action: &Action<K>,
        observed: &mut Vec<K::Observed>,
        power: &mut PowerGuard,
    ) -> ReconcileResult<AppliedAction>
    where
        K: SubResource,
        A: CollectionApi<K>,
    {
        let reason = format!("{} {}", action.kind(), action.describe());
        let mut owner_lock = self
            .locks
            .acquire_owner_lock(&owner.id, &reason, &self.shutdown)
            .await?;

        if power.running && K::requires_power_off(action.kind()) {
            self.stop_owner(owner, power).await?;
        }

        let result = self.apply(owner, action, observed).await;
        owner_lock.release();
        result
    }

    async fn apply<K>(
        &self,
        owner: &Owner,
        action: &Action<K>,
        observed: &mut Vec<K::Observed>,
    ) -> ReconcileResult<AppliedAction>
    where
        K: SubResource,
        A: CollectionApi<K>,
    {
        let target = action.describe();
        let mut current = action.clone();
        let mut steps = 0;

        loop {
            steps += 1;

            let Some(entity) = self.submit(owner, &current).await? else {
                let key = current.key();
                observed.retain(|item| K::observed_key(item) != key);
                return Ok(AppliedAction {
                    kind: action.kind(),
                    target,
                    entity: current.entity_id().cloned().unwrap_or_else(|| owner.entity_id()),
                    already_satisfied: true,
                });
            };

            self.wait_for_completion::<K>(owner, current.kind(), &entity, &target)
                .await?;

            *observed = self
                .fetch_observed::<K>(owner)
                .await?
                .ok_or_else(|| ReconcileError::OwnerDeleted(owner.id.clone()))?;

            let applied = AppliedAction {
                kind: action.kind(),
                target: target.clone(),
                entity: entity.clone(),
                already_satisfied: false,
            };

            let Action::Change(_, desired, _) = &current else {
                return Ok(applied);
            };
            if steps >= K::CHANGE_STEPS {
                return Ok(applied);
            }

            let key = K::desired_key(desired);
            let Some(now) = observed.iter().find(|item| K::observed_key(item) == key) else {
                return Ok(applied);
            };
            if !K::needs_change(desired, now) {
                return Ok(applied);
            }
            K::check_change(desired, now).map_err(ReconcileError::Precondition)?;

            debug!(target = %target, step = steps + 1, "Change needs another step");
            current = Action::Change(entity, desired.clone(), now.clone());
        }
    }

    /// Issue the mutating call under the retry executor.
    ///
    /// Returns `None` if a remove found the entity already gone.
    async fn submit<K>(&self, owner: &Owner, action: &Action<K>) -> ReconcileResult<Option<EntityId>>
    where
        K: SubResource,
        A: CollectionApi<K>,
    {
        let description = format!("{} {}", action.kind(), action.describe());
        let description = description.as_str();

        self.retry
            .run(
                description,
                self.settings.retry_timeout,
                &self.shutdown,
                move |_| self.attempt_mutation(owner, action, description),
            )
            .await
    }

    async fn attempt_mutation<K>(
        &self,
        owner: &Owner,
        action: &Action<K>,
        description: &str,
    ) -> Outcome<Option<EntityId>>
    where
        K: SubResource,
        A: CollectionApi<K>,
    {
        let mut async_lock = match self.locks.acquire_async_lock(description, &self.shutdown).await {
            Ok(lock) => lock,
            Err(err) => return Outcome::Fail(err),
        };
        let result = mutate::<K, A>(&*self.api, owner, action).await;
        async_lock.release();

        match result {
            Ok(entity) => Outcome::Success(Some(entity)),
            Err(err) => match err.class() {
                ErrorClass::Transient => {
                    info!(operation = description, error = %err, "Control plane busy");
                    Outcome::Retry
                }
                ErrorClass::NotFound if action.kind() == ActionKind::Remove => {
                    info!(operation = description, "Entity already removed");
                    Outcome::Success(None)
                }
                _ => Outcome::Fail(err.into()),
            },
        }
    }

    async fn wait_for_completion<K: SubResource>(
        &self,
        owner: &Owner,
        kind: ActionKind,
        entity: &EntityId,
        target: &str,
    ) -> ReconcileResult<()> {
        let description = format!("{kind} {target}");
        let timeout = self.settings.timeout_for(kind);
        let api = &*self.api;

        match K::completion(kind) {
            Completion::Immediate => Ok(()),
            Completion::OwnerChange => self
                .waiter
                .wait_for_change(
                    api,
                    owner.entity_type,
                    &owner.entity_id(),
                    &description,
                    timeout,
                    &self.shutdown,
                )
                .await
                .map(|_| ()),
            Completion::EntityDeploy => self
                .waiter
                .wait_for_deploy(api, K::ENTITY_TYPE, entity, &description, timeout, &self.shutdown)
                .await
                .map(|_| ()),
            Completion::EntityDelete => {
                self.waiter
                    .wait_for_delete(api, K::ENTITY_TYPE, entity, &description, timeout, &self.shutdown)
                    .await
            }
            Completion::NestedDelete => self
                .waiter
                .wait_for_nested_delete(
                    api,
                    owner.entity_type,
                    &owner.entity_id(),
                    entity,
                    &description,
                    timeout,
                    &self.shutdown,
                )
                .await
                .map(|_| ()),
        }
    }

    async fn fetch_observed<K>(&self, owner: &Owner) -> ReconcileResult<Option<Vec<K::Observed>>>
    where
        K: SubResource,
        A: CollectionApi<K>,
    {
        let description = format!("fetch {}s of {owner}", K::NAME);
        let api = &*self.api;
        self.retry
            .run(&description, self.settings.retry_timeout, &self.shutdown, move |_| async move {
                read_outcome(CollectionApi::<K>::fetch_observed(api, owner).await)
            })
            .await
    }

    async fn fetch_power_state(&self, owner: &Owner) -> ReconcileResult<Option<PowerState>> {
        let description = format!("fetch power state of {owner}");
        let api = &*self.api;
        self.retry
            .run(&description, self.settings.retry_timeout, &self.shutdown, move |_| async move {
                read_outcome(api.power_state(owner).await)
            })
            .await
    }

    /// Shut the owner down. The guard is armed for restart as soon as the
    /// power-off has been accepted, even if the wait that follows fails.
    async fn stop_owner(&self, owner: &Owner, power: &mut PowerGuard) -> ReconcileResult<()> {
        info!(owner = %owner, "Shutting down owner");
        self.submit_power(owner, PowerState::Stopped, &self.shutdown)
            .await?;
        power.running = false;
        power.restart = true;
        self.wait_for_power(owner, PowerState::Stopped, &self.shutdown)
            .await
    }

    /// Start the owner again at the end of a pass.
    ///
    /// Ignores the shutdown signal; bounded by the retry and update timeouts.
    async fn start_owner(&self, owner: &Owner) -> ReconcileResult<()> {
        let uncancellable = ShutdownSignal::never();
        let reason = format!("start {owner}");
        let mut owner_lock = self
            .locks
            .acquire_owner_lock(&owner.id, &reason, &uncancellable)
            .await?;
        info!(owner = %owner, "Starting owner");
        let result = match self
            .submit_power(owner, PowerState::Running, &uncancellable)
            .await
        {
            Ok(()) => {
                self.wait_for_power(owner, PowerState::Running, &uncancellable)
                    .await
            }
            Err(err) => Err(err),
        };
        owner_lock.release();
        result
    }

    async fn submit_power(
        &self,
        owner: &Owner,
        target: PowerState,
        shutdown: &ShutdownSignal,
    ) -> ReconcileResult<()> {
        let description = format!("{} {owner}", power_verb(target));
        let operation = description.as_str();

        self.retry
            .run(operation, self.settings.retry_timeout, shutdown, move |_| async move {
                let mut async_lock = match self.locks.acquire_async_lock(operation, shutdown).await {
                    Ok(lock) => lock,
                    Err(err) => return Outcome::Fail(err),
                };
                let result = match target {
                    PowerState::Running => self.api.power_on(owner).await,
                    PowerState::Stopped => self.api.power_off(owner).await,
                };
                async_lock.release();

                match result {
                    Ok(()) => Outcome::Success(()),
                    Err(err) if err.is_busy() => Outcome::Retry,
                    Err(err) => Outcome::Fail(err.into()),
                }
            })
            .await
    }

    async fn wait_for_power(
        &self,
        owner: &Owner,
        target: PowerState,
        shutdown: &ShutdownSignal,
    ) -> ReconcileResult<()> {
        self.waiter
            .wait_for_change(
                &*self.api,
                owner.entity_type,
                &owner.entity_id(),
                power_verb(target),
                self.settings.update_timeout,
                shutdown,
            )
            .await
            .map(|_| ())
    }
}

fn power_verb(target: PowerState) -> &'static str {
    match target {
        PowerState::Running => "start",
        PowerState::Stopped => "shut down",
    }
}
