//! Runtime resolution of an entity's most specialized type.
//!
//! The stored `type` column is informational only. Resolution probes the child tables of
//! each level for a row sharing the entity's identity and descends while exactly one
//! child claims it.

use std::collections::BTreeSet;

use sqlx::sqlite::SqliteConnection;

use crate::{
    db::{load_record, row_exists, Catalog},
    error::CatalogError,
    registry::{TypeId, TypeRegistry},
    value::{EntityId, Record, Value},
};

/// An entity seen both at the type it was asked for and at its resolved specialization.
///
/// The descendant part only carries the columns declared below the ancestor's level, so
/// every attribute has exactly one home.
#[derive(Debug, Clone, PartialEq)]
pub struct Specialization {
    ancestor: Record,
    descendant: Option<Record>,
    descendant_fields: BTreeSet<String>,
}

impl Specialization {
    fn terminal(record: Record) -> Self {
        Specialization {
            ancestor: record,
            descendant: None,
            descendant_fields: BTreeSet::new(),
        }
    }

    /// Qualified name of the most specialized type.
    pub fn type_name(&self) -> &str {
        match &self.descendant {
            Some(descendant) => &descendant.type_name,
            None => &self.ancestor.type_name,
        }
    }

    pub fn id(&self) -> Option<EntityId> {
        self.ancestor.id
    }

    pub fn is_specialized(&self) -> bool {
        self.descendant.is_some()
    }

    pub fn ancestor(&self) -> &Record {
        &self.ancestor
    }

    pub fn descendant(&self) -> Option<&Record> {
        self.descendant.as_ref()
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.descendant
            .as_ref()
            .and_then(|descendant| descendant.get(name))
            .or_else(|| self.ancestor.get(name))
    }

    /// Attributes declared below the ancestor go to the descendant, the rest to the ancestor.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        match &mut self.descendant {
            Some(descendant) if self.descendant_fields.contains(&name) => {
                descendant.set(name, value)
            }
            _ => self.ancestor.set(name, value),
        }
    }

    /// One record at the resolved type, holding every attribute of both parts.
    pub fn into_record(self) -> Record {
        match self.descendant {
            None => self.ancestor,
            Some(mut descendant) => {
                for (name, value) in self.ancestor.values {
                    descendant.values.entry(name).or_insert(value);
                }
                descendant
            }
        }
    }
}

/// Most specialized type of `id`, starting the descent at `start`.
pub(crate) async fn probe(
    conn: &mut SqliteConnection,
    registry: &TypeRegistry,
    start: TypeId,
    id: EntityId,
) -> Result<TypeId, CatalogError> {
    let mut current = start;
    loop {
        let mut claimants = Vec::new();
        for child in registry.children(current) {
            if row_exists(conn, registry, child, id).await? {
                claimants.push(child);
            }
        }
        match claimants.as_slice() {
            [] => return Ok(current),
            [single] => {
                tracing::trace!(
                    "[probe] {} {id} specializes to {}",
                    registry.qualified_name(current),
                    registry.qualified_name(*single)
                );
                current = *single;
            }
            _ => {
                tracing::error!(
                    "[probe] {} {id} has {} competing specializations",
                    registry.qualified_name(current),
                    claimants.len()
                );
                return Err(CatalogError::SpecializationConflict {
                    id,
                    type_name: registry.qualified_name(current),
                    claimants: claimants
                        .iter()
                        .map(|c| registry.qualified_name(*c))
                        .collect(),
                });
            }
        }
    }
}

impl Catalog {
    /// Resolve `record` to its most specialized stored type.
    ///
    /// A type with no specialization row resolves to itself.
    #[tracing::instrument(skip(self, record), fields(record = %record))]
    pub async fn resolve(&self, record: &Record) -> Result<Specialization, CatalogError> {
        let id = record.saved_id()?;
        let declared = self.registry.lookup(&record.type_name)?;
        let mut conn = self.pool.acquire().await?;
        let resolved = probe(&mut conn, &self.registry, declared, id).await?;
        if resolved == declared {
            return Ok(Specialization::terminal(record.clone()));
        }

        let from_level = self.registry.lineage(declared).len();
        let descendant = load_record(&mut conn, &self.registry, resolved, id, from_level)
            .await?
            .ok_or_else(|| {
                CatalogError::Integrity(format!(
                    "{} {id} vanished while resolving",
                    self.registry.qualified_name(resolved)
                ))
            })?;
        let descendant_fields = self.registry.lineage(resolved)[from_level..]
            .iter()
            .flat_map(|level| self.registry.get(*level).stored_fields())
            .map(|field| field.name.clone())
            .collect();

        Ok(Specialization {
            ancestor: record.clone(),
            descendant: Some(descendant),
            descendant_fields,
        })
    }

    /// Load `id` as `type_name` and resolve it in one step.
    pub async fn fetch_resolved(
        &self,
        type_name: &str,
        id: EntityId,
    ) -> Result<Option<Specialization>, CatalogError> {
        match self.fetch(type_name, id).await? {
            Some(record) => Ok(Some(self.resolve(&record).await?)),
            None => Ok(None),
        }
    }
}
