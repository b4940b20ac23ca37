//! Shared test utilities for integration tests.
//!
//! Import from integration test files as:
//! ```ignore
//! mod common;
//! ```

use espresso_core::{
    Catalog, CatalogConfig, ConsistencyHooks, EntityId, FieldDescriptor, HookResult, Record,
    TypeRegistry, TypeSpec, Value,
};
use parking_lot::Mutex;
use std::{io, sync::Arc};

/// Log output written on the current thread while the guard from [`CapturedLogs::install`]
/// is alive. `test_log` keeps the global subscriber; this one takes precedence locally.
#[allow(dead_code)]
#[derive(Clone, Default)]
pub struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

#[allow(dead_code)]
impl CapturedLogs {
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }
}

impl io::Write for CapturedLogs {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct ValueError(pub String);

/// `(owner id, candidate ids, column)` per edge check.
pub type EdgeCalls = Arc<Mutex<Vec<(EntityId, Vec<EntityId>, String)>>>;

struct GaugeChecks;

impl ConsistencyHooks for GaugeChecks {
    fn check_consistency(&self, record: &Record) -> HookResult {
        match record.get("n_level").and_then(Value::as_integer) {
            Some(n) if n < 0 => Err(ValueError("bad n_level".to_string()).into()),
            _ => Ok(()),
        }
    }
}

struct FeynmanTag;

impl ConsistencyHooks for FeynmanTag {
    fn pre_save(&self, record: &mut Record) -> HookResult {
        if record.get("tag").is_none() {
            let tag = match record.get("mval") {
                Some(mval) => format!("feynman m={mval}"),
                None => "feynman".to_string(),
            };
            record.set("tag", tag);
        }
        Ok(())
    }
}

struct EnsembleChecks {
    calls: EdgeCalls,
}

impl ConsistencyHooks for EnsembleChecks {
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
        let mismatched = candidates
            .iter()
            .any(|c| c.get("nx") != owner.get("nx") && owner.get("nx").is_some());
        if mismatched {
            return Err(ValueError("configuration volume differs from ensemble".to_string()).into());
        }
        Ok(())
    }
}

/// A small lattice catalog:
///
/// ```text
/// demo.A(a, b -> demo.B)            demo.B <- demo.B1(b_value), demo.B2(b_label)
/// lattice.GaugeConfig(config, nx, nt?, n_level?)   rejects n_level < 0
/// lattice.Propagator(gaugeconfig)   <- lattice.Feynman(mval), lattice.Coherent(mval, n_smear)
/// lattice.Correlator(propagator0, propagator1?, label?)
/// lattice.Ensemble(nx, configurations -> many GaugeConfig)
/// ```
#[allow(dead_code)]
pub fn lattice_registry() -> (Arc<TypeRegistry>, EdgeCalls) {
    let calls = EdgeCalls::default();
    let registry = TypeRegistry::builder()
        .register(TypeSpec::new("demo", "B"))
        .register(
            TypeSpec::new("demo", "B1")
                .parent("demo.B")
                .field(FieldDescriptor::integer("b_value")),
        )
        .register(
            TypeSpec::new("demo", "B2")
                .parent("demo.B")
                .field(FieldDescriptor::text("b_label")),
        )
        .register(
            TypeSpec::new("demo", "A")
                .field(FieldDescriptor::integer("a"))
                .field(FieldDescriptor::foreign_key("b", "demo.B")),
        )
        .register(
            TypeSpec::new("lattice", "GaugeConfig")
                .field(FieldDescriptor::integer("config").help("Configuration number"))
                .field(FieldDescriptor::integer("nx").help("Spatial extent"))
                .field(FieldDescriptor::integer("nt").optional())
                .field(FieldDescriptor::integer("n_level").optional())
                .unique_together(&["config", "nx"])
                .hooks(GaugeChecks),
        )
        .register(
            TypeSpec::new("lattice", "Propagator")
                .field(FieldDescriptor::foreign_key("gaugeconfig", "GaugeConfig")),
        )
        .register(
            TypeSpec::new("lattice", "Feynman")
                .parent("Propagator")
                .field(FieldDescriptor::real("mval").help("Valence quark mass"))
                .hooks(FeynmanTag),
        )
        .register(
            TypeSpec::new("lattice", "Coherent")
                .parent("Propagator")
                .field(FieldDescriptor::real("mval"))
                .field(FieldDescriptor::integer("n_smear")),
        )
        .register(
            TypeSpec::new("lattice", "Correlator")
                .field(FieldDescriptor::foreign_key("propagator0", "Propagator"))
                .field(FieldDescriptor::foreign_key("propagator1", "Propagator").optional())
                .field(FieldDescriptor::text("label").optional()),
        )
        .register(
            TypeSpec::new("lattice", "Ensemble")
                .field(FieldDescriptor::integer("nx"))
                .field(FieldDescriptor::many_to_many("configurations", "GaugeConfig"))
                .hooks(EnsembleChecks {
                    calls: calls.clone(),
                }),
        )
        .build()
        .expect("fixture registry is valid");
    (Arc::new(registry), calls)
}

#[allow(dead_code)]
pub async fn lattice_catalog() -> (Catalog, EdgeCalls) {
    lattice_catalog_with(CatalogConfig::in_memory()).await
}

#[allow(dead_code)]
pub async fn lattice_catalog_with(config: CatalogConfig) -> (Catalog, EdgeCalls) {
    let (registry, calls) = lattice_registry();
    let catalog = Catalog::open(config, registry)
        .await
        .expect("in-memory catalog opens");
    (catalog, calls)
}

/// Total rows of the catalog: every entity has exactly one root row.
#[allow(dead_code)]
pub async fn total_entities(catalog: &Catalog) -> i64 {
    catalog.count("core.Base").await.unwrap()
}

#[allow(dead_code)]
pub fn params(entries: &[(&str, Value)]) -> espresso_core::Parameters {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[allow(dead_code)]
pub fn tree(entries: &[(&str, &str)]) -> espresso_core::Tree {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
