//! # espresso-core
//!
//! A typed, hierarchical catalog of lattice simulation artifacts (ensembles, gauge
//! configurations, propagators, correlators) backed by SQLite.
//!
//! ## Overview
//!
//! espresso-core stores every artifact as an entity of a single-rooted type hierarchy. Each
//! concrete type owns a table, and a specialization shares the identity of the row it
//! refines. On top of that store the crate provides:
//!
//! - **Specialization resolution**: find the most derived type of an entity by probing child
//!   tables, without trusting the stored type tag
//! - **Tree-driven construction**: materialize an entity and all of its required relations
//!   from one flat parameter dictionary and a tree choosing the concrete type at each
//!   relation path, atomically and idempotently
//! - **Consistency checks**: per-type validation hooks run before every write, including
//!   edge checks for multi-valued relations
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use espresso_core::{
//!     Catalog, ConstructRequest, Constructed, FieldDescriptor, TypeRegistry, TypeSpec,
//! };
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = TypeRegistry::builder()
//!         .register(
//!             TypeSpec::new("lattice", "GaugeConfig")
//!                 .field(FieldDescriptor::integer("config"))
//!                 .field(FieldDescriptor::integer("nx"))
//!                 .unique_together(&["config", "nx"]),
//!         )
//!         .register(
//!             TypeSpec::new("lattice", "Propagator")
//!                 .field(FieldDescriptor::foreign_key("gaugeconfig", "GaugeConfig")),
//!         )
//!         .register(
//!             TypeSpec::new("lattice", "Feynman")
//!                 .parent("Propagator")
//!                 .field(FieldDescriptor::real("mval")),
//!         )
//!         .build()?;
//!     let catalog = Catalog::in_memory(Arc::new(registry)).await?;
//!
//!     let request = ConstructRequest::new("Feynman")
//!         .parameter("config", 1000)
//!         .parameter("nx", 32)
//!         .parameter("mval", 0.1)
//!         .relation("gaugeconfig", "GaugeConfig");
//!
//!     // Preview first, then write.
//!     if let Constructed::Planned(plan) = catalog
//!         .get_or_create_from_parameters(request.clone().dry_run(true))
//!         .await?
//!     {
//!         print!("{}", plan.to_script());
//!     }
//!
//!     if let Constructed::Stored { record, created } =
//!         catalog.get_or_create_from_parameters(request).await?
//!     {
//!         println!("{record} (created: {created})");
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Core Concepts
//!
//! ### Parameter dictionaries and trees
//!
//! Both are flat maps with dotted keys. A tree maps a relation path such as
//! `"propagator0.gaugeconfig"` to the type to build there. Unqualified parameters are
//! broadcast to every node of the construction graph; a dotted parameter such as
//! `"propagator0.mval"` overrides the broadcast value for that node only. See [`tree`].
//!
//! ### Specializations
//!
//! [`Catalog::resolve`] descends from an entity's declared type while exactly one child
//! table holds its identity. Two sibling tables claiming the same identity is an integrity
//! violation: it is rejected by a trigger on write and reported as
//! [`CatalogError::SpecializationConflict`] on read.
//!
//! ## Module Guide
//!
//! Start with [`registry::TypeRegistry`] to declare types, then [`db::Catalog`] for storage
//! and [`constructor`] for recursive construction. [`consistency`] describes the hook
//! contract.

pub mod config;
pub mod consistency;
pub mod constructor;
pub mod db;
pub mod error;
pub mod fields;
pub mod registry;
pub mod resolver;
pub mod tree;
pub mod value;

pub use config::CatalogConfig;
pub use consistency::{
    CheckToggles, ConsistencyError, ConsistencyHooks, Dispatcher, EdgeContext, HookError,
    HookResult,
};
pub use constructor::{ConstructRequest, Constructed, PlannedEntity};
pub use db::Catalog;
pub use error::*;
pub use fields::{open_fields, FieldDescriptor, FieldKind};
pub use registry::{TypeDescriptor, TypeId, TypeRegistry, TypeSpec};
pub use resolver::Specialization;
pub use tree::{broadcast_parameters, recursive_columns, shared_columns, sub_info};
pub use value::{EntityId, Parameters, Record, Tree, Value};
