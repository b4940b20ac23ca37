//! Type registry for the entity hierarchy.
//!
//! Concrete types form a single-rooted tree below [`ROOT_APP`].[`ROOT_NAME`]. Every type owns
//! one table; a specialization's table shares the identity of its parent row through a
//! parent-link primary key. The registry is assembled once with [`RegistryBuilder`] and is
//! read-only afterwards: to change the hierarchy, build a new registry and open a new
//! [`Catalog`](crate::db::Catalog) with it.
//!
//! Types are stored in a `petgraph` arena whose node index doubles as the [`TypeId`]. Child
//! order is registration order, which makes every hierarchy walk deterministic.

use once_cell::sync::Lazy;
use petgraph::{graph::DiGraph, graph::NodeIndex, Direction};
use regex::Regex;
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt::{self, Debug, Write},
    sync::Arc,
};

use crate::{
    consistency::{CheckToggles, ConsistencyHooks},
    error::CatalogError,
    fields::{FieldDescriptor, FieldKind},
    value::Record,
};

pub type TypeId = NodeIndex;

pub const ROOT_APP: &str = "core";
pub const ROOT_NAME: &str = "Base";

// Every app label, type name and field name ends up verbatim in generated SQL.
static IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("identifier pattern is valid"));

fn validate_identifier(kind: &str, ident: &str) -> Result<(), CatalogError> {
    if IDENTIFIER.is_match(ident) {
        Ok(())
    } else {
        Err(CatalogError::Registry(format!(
            "invalid {kind} '{ident}': expected a letter followed by letters, digits or '_'"
        )))
    }
}

/// Declaration of a concrete type, consumed by [`RegistryBuilder::register`].
pub struct TypeSpec {
    app: String,
    name: String,
    parent: Option<String>,
    fields: Vec<FieldDescriptor>,
    unique_together: Vec<Vec<String>>,
    hooks: Option<Arc<dyn ConsistencyHooks>>,
    toggles: CheckToggles,
}

impl TypeSpec {
    pub fn new(app: impl Into<String>, name: impl Into<String>) -> Self {
        TypeSpec {
            app: app.into(),
            name: name.into(),
            parent: None,
            fields: Vec::new(),
            unique_together: Vec::new(),
            hooks: None,
            toggles: CheckToggles::default(),
        }
    }

    /// Qualified or (unambiguous) simple name of an already registered type.
    pub fn parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    /// Declare a uniqueness constraint over columns owned by this type.
    pub fn unique_together(mut self, columns: &[&str]) -> Self {
        self.unique_together
            .push(columns.iter().map(|c| c.to_string()).collect());
        self
    }

    pub fn hooks(mut self, hooks: impl ConsistencyHooks + 'static) -> Self {
        self.hooks = Some(Arc::new(hooks));
        self
    }

    pub fn shared_hooks(mut self, hooks: Arc<dyn ConsistencyHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    pub fn run_pre_save(mut self, run: bool) -> Self {
        self.toggles.pre_save = run;
        self
    }

    pub fn run_checks(mut self, run: bool) -> Self {
        self.toggles.checks = run;
        self
    }

    pub fn run_m2m_checks(mut self, run: bool) -> Self {
        self.toggles.m2m_checks = run;
        self
    }
}

pub struct TypeDescriptor {
    pub app: String,
    pub name: String,
    pub parent: Option<TypeId>,
    /// Fields declared by this type itself. Specializations start with their parent link.
    pub fields: Vec<FieldDescriptor>,
    pub unique_together: Vec<Vec<String>>,
    pub toggles: CheckToggles,
    hooks: Option<Arc<dyn ConsistencyHooks>>,
}

impl Debug for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeDescriptor")
            .field("app", &self.app)
            .field("name", &self.name)
            .field("parent", &self.parent)
            .field("fields", &self.fields)
            .field("unique_together", &self.unique_together)
            .field("toggles", &self.toggles)
            .field("hooks", &self.hooks.is_some())
            .finish()
    }
}

impl TypeDescriptor {
    fn root() -> Self {
        TypeDescriptor {
            app: ROOT_APP.to_string(),
            name: ROOT_NAME.to_string(),
            parent: None,
            fields: vec![
                FieldDescriptor::new("id", FieldKind::Identity).non_editable(),
                FieldDescriptor::timestamp("last_modified")
                    .optional()
                    .non_editable()
                    .help("Date the entry was last modified"),
                FieldDescriptor::new("user", FieldKind::Owner)
                    .optional()
                    .help("User who last modified the entry"),
                FieldDescriptor::text("tag")
                    .optional()
                    .help("User defined tag for easy searches"),
                FieldDescriptor::new("type", FieldKind::Discriminator)
                    .optional()
                    .non_editable(),
            ],
            unique_together: Vec::new(),
            toggles: CheckToggles::default(),
            hooks: None,
        }
    }

    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.app, self.name)
    }

    pub fn table_name(&self) -> String {
        format!("{}_{}", self.app, self.name).to_lowercase()
    }

    /// Key column of this type's table: `id` for the root, the parent link otherwise.
    pub fn pk_column(&self) -> &str {
        self.fields
            .iter()
            .find(|f| matches!(f.kind, FieldKind::Identity | FieldKind::ParentLink { .. }))
            .map(|f| f.name.as_str())
            .unwrap_or("id")
    }

    /// Columns of this type's own table, excluding the key.
    pub fn stored_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| f.kind.is_stored_column())
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }
}

pub struct TypeRegistry {
    graph: DiGraph<TypeDescriptor, ()>,
    by_label: HashMap<String, TypeId>,
    root: TypeId,
}

impl Debug for TypeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.by_label.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TypeRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn root(&self) -> TypeId {
        self.root
    }

    pub fn get(&self, id: TypeId) -> &TypeDescriptor {
        &self.graph[id]
    }

    pub fn types(&self) -> impl Iterator<Item = TypeId> + '_ {
        self.graph.node_indices()
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn qualified_name(&self, id: TypeId) -> String {
        self.graph[id].qualified_name()
    }

    /// Find a type by qualified name, falling back to a unique simple name anywhere.
    pub fn lookup(&self, name: &str) -> Result<TypeId, CatalogError> {
        match self.by_label.get(name) {
            Some(id) => Ok(*id),
            None => self.child_by_name(self.root, name),
        }
    }

    /// Direct children in registration order.
    pub fn children(&self, id: TypeId) -> Vec<TypeId> {
        let mut children: Vec<TypeId> = self
            .graph
            .neighbors_directed(id, Direction::Outgoing)
            .collect();
        children.sort();
        children
    }

    /// `id` followed by all of its descendants, breadth-first.
    pub fn descendants(&self, id: TypeId) -> Vec<TypeId> {
        let mut found = Vec::new();
        let mut queue = VecDeque::from([id]);
        while let Some(next) = queue.pop_front() {
            found.push(next);
            queue.extend(self.children(next));
        }
        found
    }

    /// Ancestor chain from the root down to and including `id`.
    pub fn lineage(&self, id: TypeId) -> Vec<TypeId> {
        let mut chain = vec![id];
        let mut current = id;
        while let Some(parent) = self.graph[current].parent {
            chain.push(parent);
            current = parent;
        }
        chain.reverse();
        chain
    }

    pub fn is_descendant_of(&self, id: TypeId, ancestor: TypeId) -> bool {
        self.lineage(id).contains(&ancestor)
    }

    /// Search `id` and all of its descendants for the type called `name`.
    ///
    /// `name` is matched against simple names, or against the qualified name if it
    /// contains a dot. Anything but exactly one match is an error listing the candidates.
    pub fn child_by_name(&self, id: TypeId, name: &str) -> Result<TypeId, CatalogError> {
        let searched = self.descendants(id);
        let matches: Vec<TypeId> = searched
            .iter()
            .copied()
            .filter(|candidate| {
                let descriptor = &self.graph[*candidate];
                descriptor.name == name || descriptor.qualified_name() == name
            })
            .collect();
        match matches.as_slice() {
            [single] => Ok(*single),
            _ => {
                let candidates = if matches.is_empty() { &searched } else { &matches };
                Err(CatalogError::AmbiguousOrMissingType {
                    name: name.to_string(),
                    root: self.qualified_name(id),
                    candidates: candidates.iter().map(|c| self.qualified_name(*c)).collect(),
                })
            }
        }
    }

    /// Hooks of the type or of its nearest ancestor declaring any.
    pub fn hooks_for(&self, id: TypeId) -> Option<Arc<dyn ConsistencyHooks>> {
        self.lineage(id)
            .into_iter()
            .rev()
            .find_map(|level| self.graph[level].hooks.clone())
    }

    /// Locate a field anywhere in the lineage of `id`, returning its declaring type.
    pub fn find_field(&self, id: TypeId, name: &str) -> Option<(TypeId, &FieldDescriptor)> {
        self.lineage(id)
            .into_iter()
            .find_map(|level| self.graph[level].field(name).map(|field| (level, field)))
    }

    /// An empty record of type `id` carrying the type's default check toggles.
    pub fn new_record(&self, id: TypeId) -> Record {
        let mut record = Record::new(self.qualified_name(id));
        record.toggles = self.graph[id].toggles;
        record
    }

    /// Plain-text listing of the open fields of a type.
    pub fn describe(&self, id: TypeId) -> String {
        let descriptor = &self.graph[id];
        let mut out = format!(
            "{} (table {})\n",
            descriptor.qualified_name(),
            descriptor.table_name()
        );
        for field in crate::fields::open_fields(self, id) {
            let _ = write!(
                out,
                "  {}: {}, {}",
                field.name,
                field.kind,
                if field.required { "required" } else { "optional" }
            );
            if let Some(help) = &field.help_text {
                let _ = write!(out, " -- {help}");
            }
            out.push('\n');
        }
        out
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    specs: Vec<TypeSpec>,
}

/// Resolve a qualified name, or a simple name that is unique among `graph`'s types.
fn resolve_label(
    graph: &DiGraph<TypeDescriptor, ()>,
    by_label: &HashMap<String, TypeId>,
    name: &str,
) -> Result<TypeId, CatalogError> {
    if let Some(id) = by_label.get(name) {
        return Ok(*id);
    }
    let matches: Vec<TypeId> = graph
        .node_indices()
        .filter(|idx| graph[*idx].name == name)
        .collect();
    match matches.as_slice() {
        [single] => Ok(*single),
        [] => Err(CatalogError::UnknownType(name.to_string())),
        _ => Err(CatalogError::Registry(format!(
            "type name '{name}' is ambiguous: [{}]",
            matches
                .iter()
                .map(|m| graph[*m].qualified_name())
                .collect::<Vec<_>>()
                .join(", ")
        ))),
    }
}

impl RegistryBuilder {
    /// Types must be registered after their parent.
    pub fn register(mut self, spec: TypeSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn build(self) -> Result<TypeRegistry, CatalogError> {
        let mut graph = DiGraph::<TypeDescriptor, ()>::new();
        let mut by_label = HashMap::new();
        let root_descriptor = TypeDescriptor::root();
        let mut tables = HashSet::from([root_descriptor.table_name()]);
        let root = graph.add_node(root_descriptor);
        by_label.insert(graph[root].qualified_name(), root);

        for spec in self.specs {
            validate_identifier("app label", &spec.app)?;
            validate_identifier("type name", &spec.name)?;
            let label = format!("{}.{}", spec.app, spec.name);
            if by_label.contains_key(&label) {
                return Err(CatalogError::Registry(format!(
                    "type {label} registered twice"
                )));
            }
            let parent = match &spec.parent {
                None => root,
                Some(parent) => resolve_label(&graph, &by_label, parent)?,
            };

            let mut inherited = HashSet::new();
            let mut level = Some(parent);
            while let Some(ancestor) = level {
                inherited.extend(graph[ancestor].fields.iter().map(|f| f.name.clone()));
                level = graph[ancestor].parent;
            }

            let link = FieldDescriptor::new(
                format!("{}_ptr", graph[parent].name.to_lowercase()),
                FieldKind::ParentLink {
                    parent: graph[parent].qualified_name(),
                },
            )
            .non_editable();
            let mut fields = vec![link];
            for field in spec.fields {
                validate_identifier("field name", &field.name)?;
                if field.kind.is_internal() {
                    return Err(CatalogError::Registry(format!(
                        "{label}.{}: {} fields are managed by the registry",
                        field.name, field.kind
                    )));
                }
                if inherited.contains(&field.name) || fields.iter().any(|f| f.name == field.name)
                {
                    return Err(CatalogError::Registry(format!(
                        "{label}.{} shadows a field of the same name in its lineage",
                        field.name
                    )));
                }
                fields.push(field);
            }

            for columns in &spec.unique_together {
                for column in columns {
                    let owned = fields
                        .iter()
                        .any(|f| &f.name == column && f.kind.is_stored_column());
                    if !owned {
                        return Err(CatalogError::Registry(format!(
                            "{label}: unique_together column '{column}' is not a column of this type"
                        )));
                    }
                }
            }

            let descriptor = TypeDescriptor {
                app: spec.app,
                name: spec.name,
                parent: Some(parent),
                fields,
                unique_together: spec.unique_together,
                toggles: spec.toggles,
                hooks: spec.hooks,
            };
            if !tables.insert(descriptor.table_name()) {
                return Err(CatalogError::Registry(format!(
                    "table name {} of {label} collides with another type",
                    descriptor.table_name()
                )));
            }
            let id = graph.add_node(descriptor);
            graph.add_edge(parent, id, ());
            by_label.insert(label, id);
        }

        // Relation targets may name types registered later, so qualify them last.
        let nodes: Vec<TypeId> = graph.node_indices().collect();
        for idx in nodes {
            for field_idx in 0..graph[idx].fields.len() {
                let target = match &graph[idx].fields[field_idx].kind {
                    FieldKind::ForeignKey { target } | FieldKind::ManyToMany { target } => {
                        target.clone()
                    }
                    _ => continue,
                };
                let resolved = resolve_label(&graph, &by_label, &target)?;
                let qualified = graph[resolved].qualified_name();
                match &mut graph[idx].fields[field_idx].kind {
                    FieldKind::ForeignKey { target } | FieldKind::ManyToMany { target } => {
                        *target = qualified;
                    }
                    _ => {}
                }
            }
        }

        tracing::debug!(
            "[RegistryBuilder::build] Registered {} types",
            graph.node_count()
        );
        Ok(TypeRegistry {
            graph,
            by_label,
            root,
        })
    }
}
