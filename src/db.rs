//! SQLite persistence for the catalog.
//!
//! Every registered type owns one table. The root table holds the identity and the common
//! metadata; a specialization table is keyed by its parent link, so a fully specialized
//! entity is one row per level of its lineage, all sharing the same id. Multi-valued
//! relations live in `<owner table>_<field>` junction tables.

use futures_core::future::BoxFuture;
use sqlx::{
    error::BoxDynError,
    migrate::{Migration as SqlxMigration, MigrationSource, MigrationType, Migrator},
    sqlite::{Sqlite, SqliteConnectOptions, SqliteConnection, SqlitePoolOptions, SqliteRow},
    ConnectOptions, Pool, QueryBuilder, Row,
};
use std::{
    str::FromStr,
    sync::Arc,
    time::{Duration, SystemTime},
};

use crate::{
    config::CatalogConfig,
    consistency::Dispatcher,
    error::{CatalogError, SPECIALIZATION_TRIGGER_MESSAGE},
    fields::{FieldDescriptor, FieldKind},
    registry::{TypeId, TypeRegistry},
    value::{EntityId, Record, Value},
};

/// A migration definition.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: String,
    pub sql: String,
}

#[derive(Debug, Clone)]
struct MigrationList(Vec<Migration>);

impl MigrationSource<'static> for MigrationList {
    fn resolve(self) -> BoxFuture<'static, Result<Vec<SqlxMigration>, BoxDynError>> {
        Box::pin(async move {
            Ok(self
                .0
                .into_iter()
                .map(|migration| {
                    SqlxMigration::new(
                        migration.version,
                        migration.description.into(),
                        MigrationType::Simple,
                        migration.sql.into(),
                        false,
                    )
                })
                .collect())
        })
    }
}

/// <https://www.sqlite.org/limits.html#max_variable_number>
pub const SQLITE_LIMIT_VARIABLE_NUMBER: usize = 32766;

fn quoted(ident: &str) -> String {
    format!("\"{ident}\"")
}

/// DDL for every table, index, junction table and trigger the registry needs.
pub fn schema_sql(registry: &TypeRegistry) -> Result<String, CatalogError> {
    let mut sql = String::new();
    // Triggers name child tables, so they go after every CREATE TABLE.
    let mut triggers = String::new();
    for type_id in registry.types() {
        let descriptor = registry.get(type_id);
        let table = descriptor.table_name();
        let pk = descriptor.pk_column();

        let mut columns = vec![match descriptor.parent {
            None => format!("{} INTEGER PRIMARY KEY AUTOINCREMENT", quoted(pk)),
            Some(parent) => {
                let parent = registry.get(parent);
                format!(
                    "{} INTEGER PRIMARY KEY REFERENCES {}({}) ON DELETE CASCADE",
                    quoted(pk),
                    quoted(&parent.table_name()),
                    quoted(parent.pk_column())
                )
            }
        }];
        for field in descriptor.stored_fields() {
            let mut column = format!("{} {}", quoted(&field.name), field.kind.sql_type());
            if field.required {
                column.push_str(" NOT NULL");
            }
            if let FieldKind::ForeignKey { target } = &field.kind {
                let target = registry.get(registry.lookup(target)?);
                column.push_str(&format!(
                    " REFERENCES {}({})",
                    quoted(&target.table_name()),
                    quoted(target.pk_column())
                ));
            }
            columns.push(column);
        }
        sql.push_str(&format!(
            "CREATE TABLE {} ({});\n",
            quoted(&table),
            columns.join(", ")
        ));

        for (idx, unique) in descriptor.unique_together.iter().enumerate() {
            sql.push_str(&format!(
                "CREATE UNIQUE INDEX {} ON {} ({});\n",
                quoted(&format!("{table}_unique_{idx}")),
                quoted(&table),
                unique
                    .iter()
                    .map(|c| quoted(c))
                    .collect::<Vec<_>>()
                    .join(", ")
            ));
        }

        for field in descriptor
            .fields
            .iter()
            .filter(|f| f.kind.is_many_to_many())
        {
            let FieldKind::ManyToMany { target } = &field.kind else {
                continue;
            };
            let target = registry.get(registry.lookup(target)?);
            sql.push_str(&format!(
                "CREATE TABLE {} (\"owner\" INTEGER NOT NULL REFERENCES {}({}) ON DELETE CASCADE, \
                 \"member\" INTEGER NOT NULL REFERENCES {}({}) ON DELETE CASCADE, \
                 UNIQUE(\"owner\", \"member\"));\n",
                quoted(&format!("{table}_{}", field.name)),
                quoted(&table),
                quoted(pk),
                quoted(&target.table_name()),
                quoted(target.pk_column())
            ));
        }

        // At most one child table may refine a given parent row.
        let children = registry.children(type_id);
        if children.len() > 1 {
            for child in &children {
                let child_descriptor = registry.get(*child);
                let child_pk = child_descriptor.pk_column();
                let siblings = children
                    .iter()
                    .filter(|sibling| *sibling != child)
                    .map(|sibling| {
                        let sibling = registry.get(*sibling);
                        format!(
                            "EXISTS (SELECT 1 FROM {} WHERE {} = NEW.{})",
                            quoted(&sibling.table_name()),
                            quoted(sibling.pk_column()),
                            quoted(child_pk)
                        )
                    })
                    .collect::<Vec<_>>()
                    .join(" OR ");
                triggers.push_str(&format!(
                    "CREATE TRIGGER {} BEFORE INSERT ON {} WHEN {} \
                     BEGIN SELECT RAISE(ABORT, '{}'); END;\n",
                    quoted(&format!("{}_single_specialization", child_descriptor.table_name())),
                    quoted(&child_descriptor.table_name()),
                    siblings,
                    SPECIALIZATION_TRIGGER_MESSAGE
                ));
            }
        }
    }
    sql.push_str(&triggers);
    Ok(sql)
}

pub async fn db_init(config: &CatalogConfig) -> Result<Pool<Sqlite>, sqlx::Error> {
    tracing::debug!("Initializing catalog db: {:?}", config.database);
    let options = if config.is_in_memory() {
        SqliteConnectOptions::from_str("sqlite::memory:")?
    } else {
        SqliteConnectOptions::new()
            .filename(&config.database)
            .create_if_missing(true)
    };
    let options = options.foreign_keys(true).disable_statement_logging();

    let pool_options = if config.is_in_memory() {
        // Each connection to `:memory:` is a separate database, so keep exactly one alive.
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
    } else {
        SqlitePoolOptions::new().max_connections(config.max_connections.max(1))
    };
    pool_options.connect_with(options).await
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or_default()
}

fn push_value(qb: &mut QueryBuilder<'_, Sqlite>, value: &Value) {
    match value {
        Value::Null => qb.push_bind(None::<i64>),
        Value::Bool(b) => qb.push_bind(*b),
        Value::Integer(i) => qb.push_bind(*i),
        Value::Real(f) => qb.push_bind(*f),
        Value::Text(s) => qb.push_bind(s.clone()),
    };
}

fn read_value(row: &SqliteRow, field: &FieldDescriptor) -> Result<Value, sqlx::Error> {
    let name = field.name.as_str();
    Ok(match field.kind {
        FieldKind::Real => row.try_get::<Option<f64>, _>(name)?.into(),
        FieldKind::Text | FieldKind::Discriminator => row.try_get::<Option<String>, _>(name)?.into(),
        FieldKind::Boolean => row.try_get::<Option<bool>, _>(name)?.into(),
        _ => row.try_get::<Option<i64>, _>(name)?.into(),
    })
}

/// Level of `lineage` whose table holds column `name`.
fn locate<'r>(
    registry: &'r TypeRegistry,
    lineage: &[TypeId],
    name: &str,
) -> Option<(usize, &'r FieldDescriptor)> {
    lineage.iter().enumerate().find_map(|(level, type_id)| {
        registry
            .get(*type_id)
            .stored_fields()
            .find(|field| field.name == name)
            .map(|field| (level, field))
    })
}

/// `FROM root t0 JOIN level1 t1 ON ... JOIN leveln tn ON ...`
fn push_from(qb: &mut QueryBuilder<'_, Sqlite>, registry: &TypeRegistry, lineage: &[TypeId]) {
    qb.push(format!(
        " FROM {} t0",
        quoted(&registry.get(registry.root()).table_name())
    ));
    for (level, type_id) in lineage.iter().enumerate().skip(1) {
        let descriptor = registry.get(*type_id);
        qb.push(format!(
            " JOIN {} t{level} ON t{level}.{} = t0.\"id\"",
            quoted(&descriptor.table_name()),
            quoted(descriptor.pk_column())
        ));
    }
}

/// Identity of the first row of `type_id` matching every attribute, if any.
pub(crate) async fn find_matching(
    conn: &mut SqliteConnection,
    registry: &TypeRegistry,
    type_id: TypeId,
    attributes: &std::collections::BTreeMap<String, Value>,
) -> Result<Option<EntityId>, CatalogError> {
    let lineage = registry.lineage(type_id);
    let mut qb = QueryBuilder::<Sqlite>::new("SELECT t0.\"id\"");
    push_from(&mut qb, registry, &lineage);
    qb.push(" WHERE 1 = 1");
    for (name, value) in attributes {
        let (level, _) =
            locate(registry, &lineage, name).ok_or_else(|| CatalogError::UnknownField {
                type_name: registry.qualified_name(type_id),
                field: name.clone(),
            })?;
        qb.push(format!(" AND t{level}.{} IS ", quoted(name)));
        push_value(&mut qb, value);
    }
    qb.push(" ORDER BY t0.\"id\" LIMIT 1");
    let row = qb.build().fetch_optional(&mut *conn).await?;
    Ok(row.map(|row| row.try_get::<i64, _>(0)).transpose()?)
}

/// Whether the table of `type_id` has a row for `id`.
pub(crate) async fn row_exists(
    conn: &mut SqliteConnection,
    registry: &TypeRegistry,
    type_id: TypeId,
    id: EntityId,
) -> Result<bool, CatalogError> {
    let descriptor = registry.get(type_id);
    let sql = format!(
        "SELECT 1 FROM {} WHERE {} = ?",
        quoted(&descriptor.table_name()),
        quoted(descriptor.pk_column())
    );
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    Ok(row.is_some())
}

/// Load `id` as `type_id`, reading only the columns declared from lineage level `from_level`
/// downwards.
pub(crate) async fn load_record(
    conn: &mut SqliteConnection,
    registry: &TypeRegistry,
    type_id: TypeId,
    id: EntityId,
    from_level: usize,
) -> Result<Option<Record>, CatalogError> {
    let lineage = registry.lineage(type_id);
    let fields: Vec<(usize, &FieldDescriptor)> = lineage
        .iter()
        .enumerate()
        .skip(from_level)
        .flat_map(|(level, level_type)| {
            registry
                .get(*level_type)
                .stored_fields()
                .map(move |field| (level, field))
        })
        .collect();

    let mut qb = QueryBuilder::<Sqlite>::new("SELECT t0.\"id\" AS \"id\"");
    for (level, field) in &fields {
        qb.push(format!(", t{level}.{0} AS {0}", quoted(&field.name)));
    }
    push_from(&mut qb, registry, &lineage);
    qb.push(" WHERE t0.\"id\" = ");
    qb.push_bind(id);

    let Some(row) = qb.build().fetch_optional(&mut *conn).await? else {
        return Ok(None);
    };
    let mut record = registry.new_record(type_id);
    record.id = Some(id);
    for (_, field) in fields {
        record.values.insert(field.name.clone(), read_value(&row, field)?);
    }
    Ok(Some(record))
}

/// Convert every attribute of `record` to the kind of the column storing it.
fn coerce_values(
    registry: &TypeRegistry,
    lineage: &[TypeId],
    record: &mut Record,
) -> Result<(), CatalogError> {
    for (name, value) in record.values.iter_mut() {
        let Some((_, field)) = locate(registry, lineage, name) else {
            return Err(CatalogError::UnknownField {
                type_name: record.type_name.clone(),
                field: name.clone(),
            });
        };
        let Some(coerced) = value.coerce(&field.kind) else {
            return Err(CatalogError::Coercion {
                field: name.clone(),
                type_name: record.type_name.clone(),
                kind: field.kind.to_string(),
                value: value.literal(),
            });
        };
        *value = coerced;
    }
    Ok(())
}

/// Write `record` as a new entity of `type_id`, one row per lineage level.
///
/// The consistency dispatcher runs first; a rejected record writes nothing.
pub(crate) async fn insert_record(
    conn: &mut SqliteConnection,
    registry: &TypeRegistry,
    type_id: TypeId,
    record: &mut Record,
    user: Option<EntityId>,
) -> Result<EntityId, CatalogError> {
    if let Some(id) = record.id {
        return Err(CatalogError::Integrity(format!(
            "{} already exists with id {id}; entities are never rewritten",
            record.type_name
        )));
    }
    let lineage = registry.lineage(type_id);
    record.type_name = registry.qualified_name(type_id);
    // Hooks see native values, and may add attributes of their own.
    coerce_values(registry, &lineage, record)?;
    Dispatcher::new(registry).before_save(record)?;
    coerce_values(registry, &lineage, record)?;
    record
        .values
        .insert("type".to_string(), Value::Text(record.type_name.clone()));
    record
        .values
        .insert("last_modified".to_string(), Value::Integer(unix_now()));
    if let Some(user) = user {
        record.values.insert("user".to_string(), Value::Integer(user));
    }

    let mut id: Option<EntityId> = None;
    for type_id in &lineage {
        let descriptor = registry.get(*type_id);
        let table = descriptor.table_name();
        let mut columns: Vec<&str> = Vec::new();
        let mut values: Vec<Value> = Vec::new();
        if let Some(id) = id {
            columns.push(descriptor.pk_column());
            values.push(Value::Integer(id));
        }
        for field in descriptor.stored_fields() {
            if let Some(value) = record.values.get(&field.name) {
                columns.push(&field.name);
                values.push(value.clone());
            }
        }

        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT INTO {} ({}) VALUES (",
            quoted(&table),
            columns
                .iter()
                .map(|c| quoted(c))
                .collect::<Vec<_>>()
                .join(", ")
        ));
        for (idx, value) in values.iter().enumerate() {
            if idx > 0 {
                qb.push(", ");
            }
            push_value(&mut qb, value);
        }
        qb.push(")");

        let result = qb.build().execute(&mut *conn).await.map_err(|e| {
            tracing::error!(
                "[insert_record] Failed to write {} into {}: {}\n\tattributes: {:?}",
                record.type_name,
                table,
                e,
                record.values
            );
            e
        })?;
        if id.is_none() {
            id = Some(result.last_insert_rowid());
        }
    }

    let id = id.ok_or_else(|| CatalogError::Database("insert produced no row id".to_string()))?;
    record.id = Some(id);
    tracing::debug!("[insert_record] Created {}", record);
    Ok(id)
}

async fn insert_edges(
    conn: &mut SqliteConnection,
    table: &str,
    owner: EntityId,
    members: &[EntityId],
) -> Result<(), CatalogError> {
    // Two bound variables per edge.
    for chunk in members.chunks(SQLITE_LIMIT_VARIABLE_NUMBER / 2) {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT OR IGNORE INTO {} (\"owner\", \"member\") ",
            quoted(table)
        ));
        qb.push_values(chunk, |mut b, member| {
            b.push_bind(owner).push_bind(*member);
        });
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

/// The catalog: a connection pool plus the registry describing its tables.
#[derive(Debug, Clone)]
pub struct Catalog {
    pub(crate) pool: Pool<Sqlite>,
    pub(crate) registry: Arc<TypeRegistry>,
    pub(crate) config: CatalogConfig,
}

impl Catalog {
    /// Connect and create every table of `registry` that does not exist yet.
    #[tracing::instrument(skip(registry))]
    pub async fn open(
        config: CatalogConfig,
        registry: Arc<TypeRegistry>,
    ) -> Result<Self, CatalogError> {
        let pool = db_init(&config).await?;
        let migrations = MigrationList(vec![Migration {
            version: 1,
            description: "create_catalog_tables".to_string(),
            sql: schema_sql(&registry)?,
        }]);
        let migrator = Migrator::new(migrations).await?;
        migrator.run(&pool).await?;

        let count_sql = format!(
            "SELECT COUNT(*) FROM {}",
            quoted(&registry.get(registry.root()).table_name())
        );
        let count: i64 = sqlx::query_scalar(&count_sql).fetch_one(&pool).await?;
        tracing::info!(
            "Catalog initialized.\n \
             \tRegistered types:\t{}\n \
             \tCataloged entities:\t{}",
            registry.len(),
            count
        );
        Ok(Catalog {
            pool,
            registry,
            config,
        })
    }

    pub async fn in_memory(registry: Arc<TypeRegistry>) -> Result<Self, CatalogError> {
        Self::open(CatalogConfig::in_memory(), registry).await
    }

    pub fn registry(&self) -> &TypeRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// Number of entities that are at least a `type_name`.
    pub async fn count(&self, type_name: &str) -> Result<i64, CatalogError> {
        let descriptor = self.registry.get(self.registry.lookup(type_name)?);
        let sql = format!("SELECT COUNT(*) FROM {}", quoted(&descriptor.table_name()));
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count)
    }

    pub async fn fetch(
        &self,
        type_name: &str,
        id: EntityId,
    ) -> Result<Option<Record>, CatalogError> {
        let type_id = self.registry.lookup(type_name)?;
        let mut conn = self.pool.acquire().await?;
        load_record(&mut conn, &self.registry, type_id, id, 0).await
    }

    /// Write a new entity directly, outside of tree construction. Hooks still apply.
    #[tracing::instrument(skip(self, record), fields(type_name = %record.type_name))]
    pub async fn insert(&self, record: &mut Record) -> Result<EntityId, CatalogError> {
        let type_id = self.registry.lookup(&record.type_name)?;
        let mut tx = self.pool.begin().await?;
        let id = insert_record(&mut tx, &self.registry, type_id, record, None).await?;
        tx.commit().await?;
        Ok(id)
    }

    /// Junction table and target type of the multi-valued relation `column` of `owner`.
    fn junction(&self, owner: &Record, column: &str) -> Result<(String, TypeId), CatalogError> {
        let owner_type = self.registry.lookup(&owner.type_name)?;
        let unknown = || CatalogError::UnknownField {
            type_name: owner.type_name.clone(),
            field: column.to_string(),
        };
        let (declaring, field) = self
            .registry
            .find_field(owner_type, column)
            .ok_or_else(unknown)?;
        let FieldKind::ManyToMany { target } = &field.kind else {
            return Err(unknown());
        };
        Ok((
            format!("{}_{}", self.registry.get(declaring).table_name(), column),
            self.registry.lookup(target)?,
        ))
    }

    fn member_ids(&self, target: TypeId, members: &[Record]) -> Result<Vec<EntityId>, CatalogError> {
        members
            .iter()
            .map(|member| {
                let member_type = self.registry.lookup(&member.type_name)?;
                if !self.registry.is_descendant_of(member_type, target) {
                    return Err(CatalogError::Integrity(format!(
                        "{member} is not a {}",
                        self.registry.qualified_name(target)
                    )));
                }
                member.saved_id()
            })
            .collect()
    }

    /// Add `members` to `owner.column`. The owner's edge check sees the whole set once.
    #[tracing::instrument(skip(self, owner, members), fields(owner = %owner))]
    pub async fn add_members(
        &self,
        owner: &Record,
        column: &str,
        members: &[Record],
    ) -> Result<(), CatalogError> {
        let owner_id = owner.saved_id()?;
        let (table, target) = self.junction(owner, column)?;
        let member_ids = self.member_ids(target, members)?;
        Dispatcher::new(&self.registry).before_add(owner, members, column)?;

        let mut tx = self.pool.begin().await?;
        insert_edges(&mut tx, &table, owner_id, &member_ids).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Attach members from the reverse side; `edges` are `(member, owner)` pairs.
    ///
    /// Every distinct owner's edge check runs once, in ascending owner identity, with only
    /// the members being attached to it.
    #[tracing::instrument(skip(self, edges))]
    pub async fn add_reverse(
        &self,
        column: &str,
        edges: &[(Record, Record)],
    ) -> Result<(), CatalogError> {
        let groups = Dispatcher::new(&self.registry).before_reverse_add(column, edges)?;
        let mut tx = self.pool.begin().await?;
        for (owner, members) in &groups {
            let (table, target) = self.junction(owner, column)?;
            let member_ids = self.member_ids(target, members)?;
            insert_edges(&mut tx, &table, owner.saved_id()?, &member_ids).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Current members of `owner.column`, ordered by identity.
    pub async fn members(&self, owner: &Record, column: &str) -> Result<Vec<Record>, CatalogError> {
        let owner_id = owner.saved_id()?;
        let (table, target) = self.junction(owner, column)?;
        let sql = format!(
            "SELECT \"member\" FROM {} WHERE \"owner\" = ? ORDER BY \"member\"",
            quoted(&table)
        );
        let mut conn = self.pool.acquire().await?;
        let ids: Vec<i64> = sqlx::query_scalar(&sql)
            .bind(owner_id)
            .fetch_all(&mut *conn)
            .await?;
        let mut members = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(member) = load_record(&mut conn, &self.registry, target, id, 0).await? {
                members.push(member);
            }
        }
        Ok(members)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{fields::FieldDescriptor, registry::TypeSpec};
    use test_log::test;

    fn registry() -> TypeRegistry {
        TypeRegistry::builder()
            .register(
                TypeSpec::new("lattice", "GaugeConfig")
                    .field(FieldDescriptor::integer("config"))
                    .field(FieldDescriptor::integer("nx"))
                    .unique_together(&["config", "nx"]),
            )
            .register(
                TypeSpec::new("lattice", "Propagator")
                    .field(FieldDescriptor::foreign_key("gaugeconfig", "GaugeConfig")),
            )
            .register(TypeSpec::new("lattice", "Feynman").parent("Propagator"))
            .register(TypeSpec::new("lattice", "Coherent").parent("Propagator"))
            .register(
                TypeSpec::new("lattice", "Ensemble")
                    .field(FieldDescriptor::many_to_many("configurations", "GaugeConfig")),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_schema_sql_shapes() {
        let sql = schema_sql(&registry()).unwrap();
        assert!(sql.contains(
            "CREATE TABLE \"core_base\" (\"id\" INTEGER PRIMARY KEY AUTOINCREMENT"
        ));
        assert!(sql.contains(
            "\"base_ptr\" INTEGER PRIMARY KEY REFERENCES \"core_base\"(\"id\") ON DELETE CASCADE"
        ));
        assert!(sql.contains(
            "\"gaugeconfig\" INTEGER NOT NULL REFERENCES \"lattice_gaugeconfig\"(\"base_ptr\")"
        ));
        assert!(sql.contains(
            "CREATE UNIQUE INDEX \"lattice_gaugeconfig_unique_0\" ON \"lattice_gaugeconfig\" (\"config\", \"nx\")"
        ));
        assert!(sql.contains("CREATE TABLE \"lattice_ensemble_configurations\""));
        assert!(sql.contains(
            "CREATE TRIGGER \"lattice_feynman_single_specialization\" BEFORE INSERT ON \"lattice_feynman\""
        ));
        // Direct children of the root are siblings too.
        assert!(sql.contains("CREATE TRIGGER \"lattice_gaugeconfig_single_specialization\""));
    }

    #[test(tokio::test)]
    async fn test_insert_and_load_lineage() {
        let catalog = Catalog::in_memory(Arc::new(registry())).await.unwrap();
        let mut gauge = Record::new("lattice.GaugeConfig")
            .with("config", 1000)
            .with("nx", 32);
        let gauge_id = catalog.insert(&mut gauge).await.unwrap();

        let mut propagator = Record::new("Feynman").with("gaugeconfig", gauge_id);
        catalog.insert(&mut propagator).await.unwrap();
        assert_eq!(propagator.type_name, "lattice.Feynman");

        let loaded = catalog
            .fetch("lattice.Feynman", propagator.id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.get("gaugeconfig"), Some(&Value::Integer(gauge_id)));
        assert_eq!(loaded.get("type"), Some(&Value::from("lattice.Feynman")));
        assert!(loaded.get("last_modified").and_then(Value::as_integer).is_some());
        assert_eq!(catalog.count("Propagator").await.unwrap(), 1);
        assert_eq!(catalog.count("core.Base").await.unwrap(), 2);
    }

    #[test(tokio::test)]
    async fn test_unique_together_surfaces_as_integrity() {
        let catalog = Catalog::in_memory(Arc::new(registry())).await.unwrap();
        let mut first = Record::new("GaugeConfig").with("config", 1).with("nx", 8);
        catalog.insert(&mut first).await.unwrap();
        let mut second = Record::new("GaugeConfig").with("config", 1).with("nx", 8);
        let err = catalog.insert(&mut second).await.unwrap_err();
        assert!(err.is_integrity(), "unexpected error {err:?}");
        // The failed insert left no orphaned base row behind.
        assert_eq!(catalog.count("core.Base").await.unwrap(), 1);
    }

    #[test(tokio::test)]
    async fn test_catalog_with_sibling_types_opens() {
        let catalog = Catalog::in_memory(Arc::new(registry())).await.unwrap();
        let mut gauge = Record::new("GaugeConfig").with("config", 1).with("nx", 8);
        let gauge_id = catalog.insert(&mut gauge).await.unwrap();
        let mut feynman = Record::new("Feynman").with("gaugeconfig", gauge_id);
        catalog.insert(&mut feynman).await.unwrap();
        let mut coherent = Record::new("Coherent").with("gaugeconfig", gauge_id);
        catalog.insert(&mut coherent).await.unwrap();
        assert_eq!(catalog.count("Propagator").await.unwrap(), 2);

        let trigger_count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger' AND name LIKE '%_single_specialization'",
        )
        .fetch_one(catalog.pool())
        .await
        .unwrap();
        // Feynman/Coherent, plus GaugeConfig/Propagator/Ensemble under the root.
        assert_eq!(trigger_count, 5);
    }

    #[test(tokio::test)]
    async fn test_insert_coerces_to_column_kinds() {
        let catalog = Catalog::in_memory(Arc::new(registry())).await.unwrap();
        let mut gauge = Record::new("GaugeConfig").with("config", "12").with("nx", 8.0);
        let id = catalog.insert(&mut gauge).await.unwrap();
        assert_eq!(gauge.get("config"), Some(&Value::Integer(12)));
        let loaded = catalog.fetch("GaugeConfig", id).await.unwrap().unwrap();
        assert_eq!(loaded.get("nx"), Some(&Value::Integer(8)));

        let mut bad = Record::new("GaugeConfig").with("config", "abc").with("nx", 8);
        let err = catalog.insert(&mut bad).await.unwrap_err();
        match err {
            CatalogError::Coercion { field, kind, .. } => {
                assert_eq!(field, "config");
                assert_eq!(kind, "integer");
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert!(bad.id.is_none());
        assert_eq!(catalog.count("core.Base").await.unwrap(), 1);
    }

    #[test(tokio::test)]
    async fn test_unknown_attribute_is_rejected() {
        let catalog = Catalog::in_memory(Arc::new(registry())).await.unwrap();
        let mut record = Record::new("GaugeConfig")
            .with("config", 1)
            .with("nx", 8)
            .with("beta", 6.0);
        let err = catalog.insert(&mut record).await.unwrap_err();
        assert!(matches!(err, CatalogError::UnknownField { .. }));
    }
}
