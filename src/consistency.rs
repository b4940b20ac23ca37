//! Pre-write consistency checks.
//!
//! Entity types opt into validation by implementing [`ConsistencyHooks`] and attaching it to
//! their [`TypeSpec`](crate::registry::TypeSpec). The [`Dispatcher`] is the only caller of
//! those hooks: it runs them right before a row or a set of relation edges is written and
//! turns any hook failure into a [`ConsistencyError`] carrying the offending record and a
//! snapshot of the data under validation.

use std::{
    collections::BTreeMap,
    error::Error as StdError,
    fmt::{self, Display},
};

use crate::{
    error::CatalogError,
    registry::TypeRegistry,
    value::{EntityId, Record, Value},
};

pub type HookError = Box<dyn StdError + Send + Sync>;
pub type HookResult = Result<(), HookError>;

/// Validation capabilities of an entity type. Every method defaults to a no-op.
pub trait ConsistencyHooks: Send + Sync {
    /// Rewrite derived fields before the record is validated and written.
    fn pre_save(&self, _record: &mut Record) -> HookResult {
        Ok(())
    }

    /// Reject the record by returning an error.
    fn check_consistency(&self, _record: &Record) -> HookResult {
        Ok(())
    }

    /// Reject adding `candidates` to the multi-valued relation `column` of `owner`.
    fn check_m2m_consistency(
        &self,
        _owner: &Record,
        _candidates: &[Record],
        _column: &str,
    ) -> HookResult {
        Ok(())
    }
}

/// Per-record switches for the individual hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckToggles {
    pub pre_save: bool,
    pub checks: bool,
    pub m2m_checks: bool,
}

impl Default for CheckToggles {
    fn default() -> Self {
        CheckToggles {
            pre_save: true,
            checks: true,
            m2m_checks: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EdgeContext {
    pub column: String,
    pub candidates: Vec<Record>,
}

#[derive(Debug)]
pub struct ConsistencyError {
    /// The record whose hook failed.
    pub model: Record,
    /// What the hook returned.
    pub error: HookError,
    /// Attribute snapshot the hook was looking at.
    pub data: BTreeMap<String, Value>,
    /// Present for multi-valued relation checks.
    pub edge: Option<EdgeContext>,
}

impl Display for ConsistencyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.edge {
            None => write!(f, "Consistency check failed for {}: {}", self.model, self.error),
            Some(edge) => write!(
                f,
                "Consistency check failed for {}.{} with {} candidate(s): {}",
                self.model,
                edge.column,
                edge.candidates.len(),
                self.error
            ),
        }
    }
}

impl StdError for ConsistencyError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        Some(&*self.error)
    }
}

impl ConsistencyError {
    /// Downcast the hook's original error.
    pub fn original<E: StdError + 'static>(&self) -> Option<&E> {
        self.error.downcast_ref::<E>()
    }
}

/// Runs entity hooks on behalf of every write path.
#[derive(Debug, Clone, Copy)]
pub struct Dispatcher<'r> {
    registry: &'r TypeRegistry,
}

impl<'r> Dispatcher<'r> {
    pub fn new(registry: &'r TypeRegistry) -> Self {
        Dispatcher { registry }
    }

    fn hooks(
        &self,
        record: &Record,
    ) -> Result<Option<std::sync::Arc<dyn ConsistencyHooks>>, CatalogError> {
        let type_id = self.registry.lookup(&record.type_name)?;
        Ok(self.registry.hooks_for(type_id))
    }

    /// `pre_save` then `check_consistency`, each unless toggled off on the record.
    pub fn before_save(&self, record: &mut Record) -> Result<(), CatalogError> {
        let Some(hooks) = self.hooks(record)? else {
            return Ok(());
        };
        if record.toggles.pre_save {
            if let Err(error) = hooks.pre_save(record) {
                return Err(wrap(record, error, None));
            }
        }
        if record.toggles.checks {
            if let Err(error) = hooks.check_consistency(record) {
                tracing::debug!(
                    "[Dispatcher::before_save] {} rejected by check_consistency: {}",
                    record,
                    error
                );
                return Err(wrap(record, error, None));
            }
        }
        Ok(())
    }

    /// Owning side: one hook call with the entire candidate set.
    pub fn before_add(
        &self,
        owner: &Record,
        candidates: &[Record],
        column: &str,
    ) -> Result<(), CatalogError> {
        if !owner.toggles.m2m_checks {
            return Ok(());
        }
        let Some(hooks) = self.hooks(owner)? else {
            return Ok(());
        };
        hooks
            .check_m2m_consistency(owner, candidates, column)
            .map_err(|error| {
                wrap(
                    owner,
                    error,
                    Some(EdgeContext {
                        column: column.to_string(),
                        candidates: candidates.to_vec(),
                    }),
                )
            })
    }

    /// Reverse side: `edges` are `(member, owner)` pairs.
    ///
    /// Each distinct owner gets one hook call with only its own members. Owners are visited
    /// in ascending identity order and members are passed in ascending identity order.
    /// Returns the grouping so the caller writes exactly what was checked.
    pub fn before_reverse_add(
        &self,
        column: &str,
        edges: &[(Record, Record)],
    ) -> Result<Vec<(Record, Vec<Record>)>, CatalogError> {
        let groups = group_by_owner(edges)?;
        for (owner, members) in &groups {
            self.before_add(owner, members, column)?;
        }
        Ok(groups)
    }
}

/// Group `(member, owner)` pairs per owner, both levels sorted by identity.
pub fn group_by_owner(
    edges: &[(Record, Record)],
) -> Result<Vec<(Record, Vec<Record>)>, CatalogError> {
    let mut grouped: BTreeMap<EntityId, (Record, BTreeMap<EntityId, Record>)> = BTreeMap::new();
    for (member, owner) in edges {
        let owner_id = owner.saved_id()?;
        let member_id = member.saved_id()?;
        grouped
            .entry(owner_id)
            .or_insert_with(|| (owner.clone(), BTreeMap::new()))
            .1
            .insert(member_id, member.clone());
    }
    Ok(grouped
        .into_values()
        .map(|(owner, members)| (owner, members.into_values().collect()))
        .collect())
}

fn wrap(record: &Record, error: HookError, edge: Option<EdgeContext>) -> CatalogError {
    ConsistencyError {
        model: record.clone(),
        error,
        data: record.values.clone(),
        edge,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fields::FieldDescriptor, registry::TypeSpec};
    use parking_lot::Mutex;
    use std::sync::Arc;
    use test_log::test;

    #[derive(Debug, thiserror::Error)]
    #[error("{0}")]
    struct ValueError(String);

    type Calls = Arc<Mutex<Vec<(EntityId, Vec<EntityId>, String)>>>;

    struct Recorder {
        calls: Calls,
    }

    impl ConsistencyHooks for Recorder {
        fn pre_save(&self, record: &mut Record) -> HookResult {
            if record.get("tag").is_none() {
                record.set("tag", "derived");
            }
            Ok(())
        }

        fn check_consistency(&self, record: &Record) -> HookResult {
            match record.get("n_level") {
                Some(Value::Integer(n)) if *n < 0 => {
                    Err(ValueError("bad n_level".to_string()).into())
                }
                _ => Ok(()),
            }
        }

        fn check_m2m_consistency(
            &self,
            owner: &Record,
            candidates: &[Record],
            column: &str,
        ) -> HookResult {
            self.calls.lock().push((
                owner.id.unwrap_or_default(),
                candidates.iter().filter_map(|c| c.id).collect(),
                column.to_string(),
            ));
            if candidates.iter().any(|c| c.get("reject").is_some()) {
                return Err(ValueError("rejected member".to_string()).into());
            }
            Ok(())
        }
    }

    fn registry(calls: Calls) -> TypeRegistry {
        TypeRegistry::builder()
            .register(
                TypeSpec::new("lattice", "Ensemble")
                    .field(FieldDescriptor::integer("n_level").optional())
                    .field(FieldDescriptor::many_to_many("relation", "Config"))
                    .hooks(Recorder { calls }),
            )
            .register(TypeSpec::new("lattice", "Config"))
            .build()
            .unwrap()
    }

    fn saved(type_name: &str, id: EntityId) -> Record {
        let mut record = Record::new(type_name);
        record.id = Some(id);
        record
    }

    #[test]
    fn test_failed_check_is_wrapped() {
        let registry = registry(Calls::default());
        let dispatcher = Dispatcher::new(&registry);
        let mut record = Record::new("lattice.Ensemble").with("n_level", -1);
        let err = dispatcher.before_save(&mut record).unwrap_err();
        let consistency = err.as_consistency().unwrap();
        assert_eq!(
            consistency.original::<ValueError>().unwrap().0,
            "bad n_level"
        );
        assert_eq!(consistency.model.type_name, "lattice.Ensemble");
        assert_eq!(consistency.data.get("n_level"), Some(&Value::Integer(-1)));
        assert!(consistency.edge.is_none());
        assert_eq!(err.status_code(), http::StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn test_pre_save_runs_before_check_and_can_be_toggled() {
        let registry = registry(Calls::default());
        let dispatcher = Dispatcher::new(&registry);

        let mut record = Record::new("lattice.Ensemble").with("n_level", 2);
        dispatcher.before_save(&mut record).unwrap();
        assert_eq!(record.get("tag"), Some(&Value::from("derived")));

        let mut record = Record::new("lattice.Ensemble").with("n_level", -1);
        record.toggles.pre_save = false;
        record.toggles.checks = false;
        dispatcher.before_save(&mut record).unwrap();
        assert!(record.get("tag").is_none());
    }

    #[test]
    fn test_owning_side_fires_once_with_full_set() {
        let calls = Calls::default();
        let registry = registry(calls.clone());
        let dispatcher = Dispatcher::new(&registry);
        let owner = saved("lattice.Ensemble", 10);
        let members = vec![saved("lattice.Config", 1), saved("lattice.Config", 2)];
        dispatcher.before_add(&owner, &members, "relation").unwrap();
        assert_eq!(
            *calls.lock(),
            vec![(10, vec![1, 2], "relation".to_string())]
        );
    }

    #[test]
    fn test_reverse_side_fires_once_per_owner_in_identity_order() {
        let calls = Calls::default();
        let registry = registry(calls.clone());
        let dispatcher = Dispatcher::new(&registry);
        let a1 = saved("lattice.Config", 1);
        let a3 = saved("lattice.Config", 3);
        let b7 = saved("lattice.Ensemble", 7);
        let b5 = saved("lattice.Ensemble", 5);
        let edges = vec![
            (a3.clone(), b7.clone()),
            (a1.clone(), b7.clone()),
            (a1.clone(), b5.clone()),
        ];
        let groups = dispatcher.before_reverse_add("relation", &edges).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(
            *calls.lock(),
            vec![
                (5, vec![1], "relation".to_string()),
                (7, vec![1, 3], "relation".to_string()),
            ]
        );
    }

    #[test]
    fn test_edge_failure_carries_column_and_candidates() {
        let registry = registry(Calls::default());
        let dispatcher = Dispatcher::new(&registry);
        let owner = saved("lattice.Ensemble", 10);
        let members = vec![saved("lattice.Config", 1).with("reject", true)];
        let err = dispatcher
            .before_add(&owner, &members, "relation")
            .unwrap_err();
        let edge = err.as_consistency().unwrap().edge.clone().unwrap();
        assert_eq!(edge.column, "relation");
        assert_eq!(edge.candidates, members);
    }

    #[test]
    fn test_m2m_toggle_skips_hook() {
        let calls = Calls::default();
        let registry = registry(calls.clone());
        let dispatcher = Dispatcher::new(&registry);
        let mut owner = saved("lattice.Ensemble", 10);
        owner.toggles.m2m_checks = false;
        dispatcher
            .before_add(&owner, &[saved("lattice.Config", 1)], "relation")
            .unwrap();
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn test_unsaved_edges_are_rejected() {
        let edges = vec![(Record::new("lattice.Config"), saved("lattice.Ensemble", 1))];
        assert!(matches!(
            group_by_owner(&edges),
            Err(CatalogError::Unsaved(_))
        ));
    }
}
