//! Dotted-path helpers for parameter dictionaries and construction trees.
//!
//! Both dictionaries address nested relations with dotted keys: in a tree,
//! `"propagator0.gaugeconfig"` names the type to build for the `gaugeconfig` relation of
//! whatever sits at `propagator0`; in a parameter dictionary, `"propagator0.mval"` sets
//! `mval` for that node only. Unqualified parameter keys are broadcast to every node.

use std::collections::BTreeMap;

use crate::{
    error::CatalogError,
    fields::{open_fields, FieldKind},
    registry::{TypeId, TypeRegistry},
    value::{Parameters, Tree},
};

/// Entries nested below `root_key`, re-keyed relative to it.
///
/// `{"a.b": 1, "a.c.d": 2, "a": 3, "e.f": 4}` with root `a` yields `{"b": 1, "c.d": 2}`.
/// The bare `"a"` entry describes the relation itself and is dropped.
pub fn sub_info<V: Clone>(root_key: &str, mapping: &BTreeMap<String, V>) -> BTreeMap<String, V> {
    mapping
        .iter()
        .filter_map(|(key, value)| {
            let (head, rest) = key.split_once('.')?;
            (head == root_key).then(|| (rest.to_string(), value.clone()))
        })
        .collect()
}

/// The unqualified entries of `parameters`.
pub fn broadcast_parameters(parameters: &Parameters) -> Parameters {
    parameters
        .iter()
        .filter(|(key, _)| !key.contains('.'))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

/// Parameters handed to the node at relation `field`: broadcast values overridden by the
/// entries addressed to that path.
pub fn relation_parameters(field: &str, parameters: &Parameters) -> Parameters {
    let mut scoped = broadcast_parameters(parameters);
    scoped.extend(sub_info(field, parameters));
    scoped
}

/// Attribute name to the distinct types exposing it, over every node `tree` reaches from
/// `type_id`. Relations without a tree entry are not followed.
pub fn recursive_columns(
    registry: &TypeRegistry,
    type_id: TypeId,
    tree: &Tree,
) -> Result<BTreeMap<String, Vec<String>>, CatalogError> {
    let mut columns = BTreeMap::new();
    collect_columns(registry, type_id, tree, &mut columns)?;
    Ok(columns)
}

fn collect_columns(
    registry: &TypeRegistry,
    type_id: TypeId,
    tree: &Tree,
    columns: &mut BTreeMap<String, Vec<String>>,
) -> Result<(), CatalogError> {
    let owner = registry.qualified_name(type_id);
    for field in open_fields(registry, type_id) {
        match &field.kind {
            FieldKind::ManyToMany { .. } => {}
            FieldKind::ForeignKey { target } => {
                if let Some(sub_type) = tree.get(&field.name) {
                    let target_id = registry.lookup(target)?;
                    let concrete = registry.child_by_name(target_id, sub_type)?;
                    collect_columns(registry, concrete, &sub_info(&field.name, tree), columns)?;
                }
            }
            _ => {
                let owners = columns.entry(field.name.clone()).or_default();
                if !owners.contains(&owner) {
                    owners.push(owner.clone());
                }
            }
        }
    }
    Ok(())
}

/// Attributes exposed by more than one type; broadcasting a value to them may be unintended.
pub fn shared_columns(
    columns: &BTreeMap<String, Vec<String>>,
) -> impl Iterator<Item = (&String, &Vec<String>)> {
    columns.iter().filter(|(_, owners)| owners.len() > 1)
}
