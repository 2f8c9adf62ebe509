//! Collection differ.
//!
//! Pure function from (desired, observed) to add / change / remove actions.
//! No I/O, no locks.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use stratus_id::EntityId;

use crate::error::{ReconcileError, ReconcileResult};
use crate::kind::SubResource;

/// Kind of an action, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Add,
    Change,
    Remove,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::Add => f.write_str("add"),
            ActionKind::Change => f.write_str("change"),
            ActionKind::Remove => f.write_str("remove"),
        }
    }
}

/// A single reconciliation step. Immutable once produced by [`diff`].
#[derive(Debug, Clone, PartialEq)]
pub enum Action<K: SubResource> {
    Add(K::Desired),
    Change(EntityId, K::Desired, K::Observed),
    Remove(EntityId, K::Observed),
}

impl<K: SubResource> Action<K> {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Add(_) => ActionKind::Add,
            Action::Change(..) => ActionKind::Change,
            Action::Remove(..) => ActionKind::Remove,
        }
    }

    /// Correlation key of the item this action targets.
    pub fn key(&self) -> K::Key {
        match self {
            Action::Add(desired) | Action::Change(_, desired, _) => K::desired_key(desired),
            Action::Remove(_, observed) => K::observed_key(observed),
        }
    }

    /// Remote identifier, if the entity already exists.
    pub fn entity_id(&self) -> Option<&EntityId> {
        match self {
            Action::Add(_) => None,
            Action::Change(id, ..) | Action::Remove(id, _) => Some(id),
        }
    }

    /// Short description for logs and errors, e.g. `disk 2 ('d-17')`.
    pub fn describe(&self) -> String {
        match self.entity_id() {
            Some(id) => format!("{} {} ('{}')", K::NAME, self.key(), id),
            None => format!("{} {}", K::NAME, self.key()),
        }
    }
}

/// Output of [`diff`]: three disjoint action sets, each ordered by key.
#[derive(Debug, Clone, PartialEq)]
pub struct Diff<K: SubResource> {
    pub add: Vec<Action<K>>,
    pub change: Vec<Action<K>>,
    pub remove: Vec<Action<K>>,
}

impl<K: SubResource> Diff<K> {
    pub fn is_empty(&self) -> bool {
        self.add.is_empty() && self.change.is_empty() && self.remove.is_empty()
    }

    pub fn len(&self) -> usize {
        self.add.len() + self.change.len() + self.remove.len()
    }

    /// Actions in application order: all adds, then changes, then removes.
    pub fn into_actions(self) -> Vec<Action<K>> {
        let mut actions = self.add;
        actions.extend(self.change);
        actions.extend(self.remove);
        actions
    }
}

/// Diff a desired collection against an observed one.
///
/// Items are correlated by key. Desired keys are expected to be unique
/// (see [`validate_desired`]); on duplicates the first desired item wins the
/// match and later ones are reported as adds.
pub fn diff<K: SubResource>(desired: &[K::Desired], observed: &[K::Observed]) -> Diff<K> {
    let mut observed_by_key: BTreeMap<K::Key, &K::Observed> = observed
        .iter()
        .map(|item| (K::observed_key(item), item))
        .collect();

    let mut ordered: Vec<&K::Desired> = desired.iter().collect();
    ordered.sort_by_key(|item| K::desired_key(item));

    let mut add = Vec::new();
    let mut change = Vec::new();

    for desired_item in ordered {
        let key = K::desired_key(desired_item);

        // Consumed here so it is not considered for removal below.
        match observed_by_key.remove(&key) {
            Some(observed_item) => {
                if K::needs_change(desired_item, observed_item) {
                    change.push(Action::Change(
                        K::observed_id(observed_item).clone(),
                        desired_item.clone(),
                        observed_item.clone(),
                    ));
                }
            }
            None => add.push(Action::Add(desired_item.clone())),
        }
    }

    let remove = observed_by_key
        .into_values()
        .map(|item| Action::Remove(K::observed_id(item).clone(), item.clone()))
        .collect();

    Diff { add, change, remove }
}

/// Reject desired collections with duplicate correlation keys or invalid items.
pub fn validate_desired<K: SubResource>(desired: &[K::Desired]) -> ReconcileResult<()> {
    let mut seen = BTreeSet::new();
    for item in desired {
        let key = K::desired_key(item);
        K::validate(item).map_err(|message| {
            ReconcileError::InvalidDesiredState(format!("{} {}: {}", K::NAME, key, message))
        })?;
        if !seen.insert(key.clone()) {
            return Err(ReconcileError::InvalidDesiredState(format!(
                "duplicate {} key {}",
                K::NAME,
                key
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::EntityType;
    use crate::kind::Completion;

    /// Minimal sized kind: key plus a size attribute.
    #[derive(Debug, Clone, Copy, PartialEq)]
    struct Slot;

    #[derive(Debug, Clone, PartialEq)]
    struct Want {
        key: u32,
        size: u32,
    }

    #[derive(Debug, Clone, PartialEq)]
    struct Have {
        id: EntityId,
        key: u32,
        size: u32,
    }

    impl SubResource for Slot {
        type Key = u32;
        type Desired = Want;
        type Observed = Have;

        const NAME: &'static str = "item";
        const ENTITY_TYPE: EntityType = EntityType::Disk;

        fn desired_key(desired: &Want) -> u32 {
            desired.key
        }

        fn observed_key(observed: &Have) -> u32 {
            observed.key
        }

        fn observed_id(observed: &Have) -> &EntityId {
            &observed.id
        }

        fn needs_change(desired: &Want, observed: &Have) -> bool {
            desired.size != observed.size
        }

        fn completion(_kind: ActionKind) -> Completion {
            Completion::Immediate
        }
    }

    fn want(key: u32, size: u32) -> Want {
        Want { key, size }
    }

    fn have(key: u32, size: u32) -> Have {
        Have {
            id: EntityId::parse(&format!("item-{key}")).unwrap(),
            key,
            size,
        }
    }

    #[test]
    fn test_add_only() {
        let result = diff::<Slot>(&[want(0, 10), want(1, 20)], &[have(0, 10)]);

        assert_eq!(result.add, vec![Action::Add(want(1, 20))]);
        assert!(result.change.is_empty());
        assert!(result.remove.is_empty());
    }

    #[test]
    fn test_change_and_remove() {
        let result = diff::<Slot>(&[want(0, 10)], &[have(0, 5), have(1, 15)]);

        assert!(result.add.is_empty());
        assert_eq!(
            result.change,
            vec![Action::Change(
                EntityId::parse("item-0").unwrap(),
                want(0, 10),
                have(0, 5)
            )]
        );
        assert_eq!(
            result.remove,
            vec![Action::Remove(EntityId::parse("item-1").unwrap(), have(1, 15))]
        );
    }

    #[test]
    fn test_shrink_still_produces_change() {
        let result = diff::<Slot>(&[want(0, 5)], &[have(0, 10)]);
        assert_eq!(result.change.len(), 1);
        assert_eq!(result.change[0].kind(), ActionKind::Change);
    }

    #[test]
    fn test_equal_collections_produce_nothing() {
        let result = diff::<Slot>(&[want(0, 10), want(3, 1)], &[have(3, 1), have(0, 10)]);
        assert!(result.is_empty());
        assert_eq!(result.len(), 0);
    }

    #[test]
    fn test_into_actions_orders_add_change_remove() {
        let result = diff::<Slot>(&[want(2, 1), want(0, 9)], &[have(0, 5), have(7, 1)]);
        let kinds: Vec<_> = result.into_actions().iter().map(Action::kind).collect();
        assert_eq!(
            kinds,
            vec![ActionKind::Add, ActionKind::Change, ActionKind::Remove]
        );
    }

    #[test]
    fn test_describe() {
        assert_eq!(Action::<Slot>::Add(want(4, 1)).describe(), "item 4");
        assert_eq!(
            Action::<Slot>::Remove(EntityId::parse("item-4").unwrap(), have(4, 1)).describe(),
            "item 4 ('item-4')"
        );
    }

    #[test]
    fn test_duplicate_keys_first_item_matches() {
        let result = diff::<Slot>(&[want(0, 10), want(0, 20)], &[have(0, 10)]);

        assert!(result.change.is_empty());
        assert_eq!(result.add, vec![Action::Add(want(0, 20))]);
    }

    #[test]
    fn test_validate_rejects_duplicate_keys() {
        let err = validate_desired::<Slot>(&[want(1, 1), want(1, 2)]).unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidDesiredState(_)));
        assert!(validate_desired::<Slot>(&[want(1, 1), want(2, 2)]).is_ok());
    }

    mod proptests {
        use super::*;
        use proptest::collection::btree_map;
        use proptest::prelude::*;

        fn collections() -> impl Strategy<Value = (Vec<Want>, Vec<Have>)> {
            (
                btree_map(0u32..16, 1u32..4, 0..10),
                btree_map(0u32..16, 1u32..4, 0..10),
            )
                .prop_map(|(desired, observed)| {
                    (
                        desired.into_iter().map(|(k, s)| want(k, s)).collect(),
                        observed.into_iter().map(|(k, s)| have(k, s)).collect(),
                    )
                })
        }

        proptest! {
            #[test]
            fn diff_is_complete_and_disjoint((desired, observed) in collections()) {
                let result = diff::<Slot>(&desired, &observed);

                let add: BTreeSet<u32> = result.add.iter().map(Action::key).collect();
                let change: BTreeSet<u32> = result.change.iter().map(Action::key).collect();
                let remove: BTreeSet<u32> = result.remove.iter().map(Action::key).collect();

                prop_assert!(add.is_disjoint(&change));
                prop_assert!(add.is_disjoint(&remove));
                prop_assert!(change.is_disjoint(&remove));

                let desired_keys: BTreeSet<u32> = desired.iter().map(|d| d.key).collect();
                let observed_keys: BTreeSet<u32> = observed.iter().map(|o| o.key).collect();

                // Every desired key is unchanged, added or changed; never removed.
                for key in &desired_keys {
                    prop_assert!(!remove.contains(key));
                    prop_assert_eq!(add.contains(key), !observed_keys.contains(key));
                }

                // Every observed-only key is removed.
                let observed_only: BTreeSet<u32> =
                    observed_keys.difference(&desired_keys).copied().collect();
                prop_assert_eq!(&remove, &observed_only);

                let union: BTreeSet<u32> = add.iter().chain(&change).chain(&remove).copied().collect();
                let all: BTreeSet<u32> = desired_keys.union(&observed_keys).copied().collect();
                prop_assert!(union.is_subset(&all));
            }

            #[test]
            fn diff_is_idempotent_after_applying((desired, observed) in collections()) {
                let result = diff::<Slot>(&desired, &observed);

                // Apply the actions to the observed collection.
                let mut converged: BTreeMap<u32, Have> =
                    observed.iter().map(|o| (o.key, o.clone())).collect();
                for action in result.into_actions() {
                    match action {
                        Action::Add(w) => {
                            converged.insert(w.key, have(w.key, w.size));
                        }
                        Action::Change(_, w, _) => {
                            converged.get_mut(&w.key).unwrap().size = w.size;
                        }
                        Action::Remove(_, h) => {
                            converged.remove(&h.key);
                        }
                    }
                }

                let converged: Vec<Have> = converged.into_values().collect();
                prop_assert!(diff::<Slot>(&desired, &converged).is_empty());
            }
        }
    }
}
