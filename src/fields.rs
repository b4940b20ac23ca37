//! Field descriptors and the open-field introspector.

use std::fmt::{self, Display};

use crate::registry::{TypeId, TypeRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    Integer,
    Real,
    Text,
    Boolean,
    /// Seconds since the unix epoch.
    Timestamp,
    /// Single-valued relation. `target` is a qualified type name once the registry is built.
    ForeignKey {
        target: String,
    },
    /// Multi-valued relation, stored in a junction table.
    ManyToMany {
        target: String,
    },
    Identity,
    Owner,
    Discriminator,
    /// Primary key of a specialization table pointing back at its parent row.
    ParentLink {
        parent: String,
    },
}

impl FieldKind {
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            FieldKind::Identity
                | FieldKind::Owner
                | FieldKind::Discriminator
                | FieldKind::ParentLink { .. }
        )
    }

    pub fn related_type(&self) -> Option<&str> {
        match self {
            FieldKind::ForeignKey { target } => Some(target),
            _ => None,
        }
    }

    pub fn is_many_to_many(&self) -> bool {
        matches!(self, FieldKind::ManyToMany { .. })
    }

    /// Whether this field is a column in its declaring type's table (other than the key).
    pub(crate) fn is_stored_column(&self) -> bool {
        !matches!(
            self,
            FieldKind::Identity | FieldKind::ParentLink { .. } | FieldKind::ManyToMany { .. }
        )
    }

    pub(crate) fn sql_type(&self) -> &'static str {
        match self {
            FieldKind::Real => "REAL",
            FieldKind::Text | FieldKind::Discriminator => "TEXT",
            _ => "INTEGER",
        }
    }
}

impl Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldKind::Integer => write!(f, "integer"),
            FieldKind::Real => write!(f, "real"),
            FieldKind::Text => write!(f, "text"),
            FieldKind::Boolean => write!(f, "boolean"),
            FieldKind::Timestamp => write!(f, "timestamp"),
            FieldKind::ForeignKey { target } => write!(f, "relation to {target}"),
            FieldKind::ManyToMany { target } => write!(f, "set of {target}"),
            FieldKind::Identity => write!(f, "identity"),
            FieldKind::Owner => write!(f, "owner"),
            FieldKind::Discriminator => write!(f, "type discriminator"),
            FieldKind::ParentLink { parent } => write!(f, "link to {parent}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    /// Mandatory fields must be resolvable during construction.
    pub required: bool,
    pub editable: bool,
    pub help_text: Option<String>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        FieldDescriptor {
            name: name.into(),
            kind,
            required: true,
            editable: true,
            help_text: None,
        }
    }

    pub fn integer(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Integer)
    }

    pub fn real(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Real)
    }

    pub fn text(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Text)
    }

    pub fn boolean(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Boolean)
    }

    pub fn timestamp(name: impl Into<String>) -> Self {
        Self::new(name, FieldKind::Timestamp)
    }

    pub fn foreign_key(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::ForeignKey {
                target: target.into(),
            },
        )
    }

    pub fn many_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(
            name,
            FieldKind::ManyToMany {
                target: target.into(),
            },
        )
        .optional()
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn non_editable(mut self) -> Self {
        self.editable = false;
        self
    }

    pub fn help(mut self, text: impl Into<String>) -> Self {
        self.help_text = Some(text.into());
        self
    }

    /// Settable by a caller: not internal bookkeeping and editable.
    pub fn is_open(&self) -> bool {
        self.editable && !self.kind.is_internal()
    }
}

/// Open fields of `type_id`, ancestors' fields first, each level in declaration order.
pub fn open_fields(registry: &TypeRegistry, type_id: TypeId) -> Vec<&FieldDescriptor> {
    registry
        .lineage(type_id)
        .into_iter()
        .flat_map(|level| registry.get(level).fields.iter())
        .filter(|field| field.is_open())
        .collect()
}
