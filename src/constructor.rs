//! Tree-driven recursive get-or-create.
//!
//! A construction call names a root type, a flat parameter dictionary and a tree choosing
//! the concrete type at every relation path. Dependencies are resolved depth first and
//! written bottom-up, each node through an attribute-matching get-or-insert, so repeating
//! a call returns the same entities. One call is one transaction.

use futures_core::future::BoxFuture;
use serde::Serialize;
use sqlx::sqlite::SqliteConnection;
use std::{collections::BTreeMap, fmt::Write};

use crate::{
    db::{find_matching, insert_record, load_record, Catalog},
    error::CatalogError,
    fields::{open_fields, FieldKind},
    registry::{TypeId, TypeRegistry},
    tree::{recursive_columns, relation_parameters, shared_columns, sub_info},
    value::{EntityId, Parameters, Record, Tree, Value},
};

/// Input of [`Catalog::get_or_create_from_parameters`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstructRequest {
    /// Qualified or unique simple name of the type to construct.
    pub root: String,
    pub parameters: Parameters,
    pub tree: Tree,
    pub dry_run: bool,
    /// Stamped on the owner column of every inserted row. Never used for matching.
    pub user: Option<EntityId>,
}

impl ConstructRequest {
    pub fn new(root: impl Into<String>) -> Self {
        ConstructRequest {
            root: root.into(),
            ..Default::default()
        }
    }

    pub fn parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    pub fn parameters(mut self, parameters: Parameters) -> Self {
        self.parameters.extend(parameters);
        self
    }

    pub fn relation(mut self, path: impl Into<String>, type_name: impl Into<String>) -> Self {
        self.tree.insert(path.into(), type_name.into());
        self
    }

    pub fn tree(mut self, tree: Tree) -> Self {
        self.tree.extend(tree);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn user(mut self, user: EntityId) -> Self {
        self.user = Some(user);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Constructed {
    Stored { record: Record, created: bool },
    Planned(PlannedEntity),
}

/// What a dry run would write.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlannedEntity {
    pub type_name: String,
    /// Scalar attributes, coerced to their column types.
    pub attributes: BTreeMap<String, Value>,
    pub relations: BTreeMap<String, PlannedEntity>,
    /// Set when a matching row already exists. Only known when every dependency exists too.
    pub existing: Option<EntityId>,
}

impl PlannedEntity {
    pub fn will_create(&self) -> bool {
        self.existing.is_none()
    }

    /// Number of rows the plan would insert, this entity included.
    pub fn pending_inserts(&self) -> usize {
        usize::from(self.will_create())
            + self
                .relations
                .values()
                .map(PlannedEntity::pending_inserts)
                .sum::<usize>()
    }

    /// Construction steps, dependencies first, one `get_or_create` per line.
    ///
    /// ```text
    /// entity_b = demo.B1.get_or_create(b_value=5)
    /// entity = demo.A.get_or_create(a=1, b=entity_b)
    /// ```
    pub fn to_script(&self) -> String {
        let mut script = String::new();
        self.render("entity", &mut script);
        script
    }

    fn render(&self, var: &str, script: &mut String) {
        let mut args: BTreeMap<&str, String> = self
            .attributes
            .iter()
            .map(|(name, value)| (name.as_str(), value.literal()))
            .collect();
        for (field, relation) in &self.relations {
            let relation_var = format!("{var}_{field}");
            relation.render(&relation_var, script);
            args.insert(field, relation_var);
        }
        let _ = write!(
            script,
            "{var} = {}.get_or_create({})",
            self.type_name,
            args.iter()
                .map(|(name, value)| format!("{name}={value}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        if let Some(id) = self.existing {
            let _ = write!(script, "  # exists: id {id}");
        }
        script.push('\n');
    }
}

struct BuildContext<'a> {
    registry: &'a TypeRegistry,
    dry_run: bool,
    warn_shared_columns: bool,
    user: Option<EntityId>,
}

/// Result of one node of the construction graph.
struct Built {
    /// Saved or matched entity; in a dry run, unsaved when it would be created.
    record: Record,
    created: bool,
    /// Only collected for dry runs.
    relations: BTreeMap<String, Built>,
}

impl Built {
    fn into_plan(self) -> PlannedEntity {
        let mut attributes = self.record.values;
        attributes.retain(|name, _| !self.relations.contains_key(name));
        PlannedEntity {
            type_name: self.record.type_name,
            attributes,
            existing: if self.created { None } else { self.record.id },
            relations: self
                .relations
                .into_iter()
                .map(|(field, built)| (field, built.into_plan()))
                .collect(),
        }
    }
}

fn build<'a>(
    ctx: &'a BuildContext<'a>,
    conn: &'a mut SqliteConnection,
    type_id: TypeId,
    parameters: Parameters,
    tree: Tree,
    depth: usize,
) -> BoxFuture<'a, Result<Built, CatalogError>> {
    Box::pin(async move {
        let registry = ctx.registry;
        let type_name = registry.qualified_name(type_id);

        if depth == 0 && ctx.warn_shared_columns {
            let columns = recursive_columns(registry, type_id, &tree)?;
            for (column, owners) in shared_columns(&columns) {
                tracing::warn!(
                    "[build] Attribute '{}' is exposed by several types: [{}]. \
                     A broadcast value reaches all of them.",
                    column,
                    owners.join(", ")
                );
            }
        }

        let mut attributes: BTreeMap<String, Value> = BTreeMap::new();
        let mut relations = BTreeMap::new();
        // False once a dependency only exists in a dry-run plan.
        let mut resolvable = true;

        for field in open_fields(registry, type_id) {
            match &field.kind {
                FieldKind::ManyToMany { .. } => {}
                FieldKind::ForeignKey { target } => match tree.get(&field.name) {
                    Some(sub_type) => {
                        let concrete = registry.child_by_name(registry.lookup(target)?, sub_type)?;
                        let child = build(
                            ctx,
                            &mut *conn,
                            concrete,
                            relation_parameters(&field.name, &parameters),
                            sub_info(&field.name, &tree),
                            depth + 1,
                        )
                        .await?;
                        match child.record.id {
                            Some(id) => {
                                attributes.insert(field.name.clone(), Value::Integer(id));
                            }
                            None => resolvable = false,
                        }
                        if ctx.dry_run {
                            relations.insert(field.name.clone(), child);
                        }
                    }
                    None if field.required => {
                        return Err(CatalogError::MissingTreeEntry {
                            field: field.name.clone(),
                            type_name,
                        });
                    }
                    None => {}
                },
                _ => match parameters.get(&field.name).filter(|value| !value.is_null()) {
                    Some(value) => {
                        let coerced =
                            value
                                .coerce(&field.kind)
                                .ok_or_else(|| CatalogError::Coercion {
                                    field: field.name.clone(),
                                    type_name: type_name.clone(),
                                    kind: field.kind.to_string(),
                                    value: value.literal(),
                                })?;
                        attributes.insert(field.name.clone(), coerced);
                    }
                    None if field.required => {
                        return Err(CatalogError::MissingParameter {
                            field: field.name.clone(),
                            type_name,
                            available: parameters.keys().cloned().collect(),
                        });
                    }
                    None => {}
                },
            }
        }

        let existing = if resolvable {
            find_matching(&mut *conn, registry, type_id, &attributes).await?
        } else {
            None
        };

        let mut record = registry.new_record(type_id);
        record.values = attributes;
        match existing {
            Some(id) if ctx.dry_run => {
                record.id = Some(id);
                tracing::debug!("[build] Would reuse {}", record);
                Ok(Built {
                    record,
                    created: false,
                    relations,
                })
            }
            Some(id) => {
                let record = load_record(&mut *conn, registry, type_id, id, 0)
                    .await?
                    .ok_or_else(|| {
                        CatalogError::Integrity(format!("{type_name} {id} vanished after lookup"))
                    })?;
                tracing::debug!("[build] Found {}", record);
                Ok(Built {
                    record,
                    created: false,
                    relations,
                })
            }
            None if ctx.dry_run => {
                tracing::debug!(
                    "[build] Would create {} with {:?}",
                    type_name,
                    record.values
                );
                Ok(Built {
                    record,
                    created: true,
                    relations,
                })
            }
            None => {
                insert_record(&mut *conn, registry, type_id, &mut record, ctx.user).await?;
                Ok(Built {
                    record,
                    created: true,
                    relations,
                })
            }
        }
    })
}

impl Catalog {
    async fn construct(&self, request: ConstructRequest) -> Result<Built, CatalogError> {
        let type_id = self.registry.lookup(&request.root)?;
        let ctx = BuildContext {
            registry: &self.registry,
            dry_run: request.dry_run,
            warn_shared_columns: self.config.warn_shared_columns,
            user: request.user,
        };

        let mut tx = self.pool.begin().await?;
        let built = match build(
            &ctx,
            &mut *tx,
            type_id,
            request.parameters,
            request.tree,
            0,
        )
        .await
        {
            Ok(built) => built,
            Err(e) => {
                tracing::warn!(
                    "[Catalog.construct] Rolling back construction of {}: {}",
                    request.root,
                    e
                );
                if let Err(rollback) = tx.rollback().await {
                    tracing::error!(
                        "[Catalog.construct] Rollback after failed construction of {} failed: {}",
                        request.root,
                        rollback
                    );
                }
                return Err(e);
            }
        };

        if request.dry_run {
            tx.rollback().await?;
        } else {
            tx.commit().await?;
        }
        Ok(built)
    }

    /// Get or create the entity described by `request`, along with every relation its tree
    /// selects. Nothing is written when any node fails, or when `request.dry_run` is set.
    #[tracing::instrument(skip(self, request), fields(root = %request.root, dry_run = request.dry_run))]
    pub async fn get_or_create_from_parameters(
        &self,
        request: ConstructRequest,
    ) -> Result<Constructed, CatalogError> {
        let dry_run = request.dry_run;
        let built = self.construct(request).await?;
        Ok(if dry_run {
            Constructed::Planned(built.into_plan())
        } else {
            Constructed::Stored {
                record: built.record,
                created: built.created,
            }
        })
    }

    /// The entity and whether this call created it.
    pub async fn get_or_create(
        &self,
        root: &str,
        parameters: Parameters,
        tree: Tree,
    ) -> Result<(Record, bool), CatalogError> {
        let request = ConstructRequest::new(root)
            .parameters(parameters)
            .tree(tree);
        let built = self.construct(request).await?;
        Ok((built.record, built.created))
    }

    pub async fn dry_run(
        &self,
        root: &str,
        parameters: Parameters,
        tree: Tree,
    ) -> Result<PlannedEntity, CatalogError> {
        let request = ConstructRequest::new(root)
            .parameters(parameters)
            .tree(tree)
            .dry_run(true);
        Ok(self.construct(request).await?.into_plan())
    }
}
