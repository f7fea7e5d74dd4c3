// Fragmentation catalog: the `relsfrag(relname, attno, func_id)` system
// table and the pure routing function built on top of it.

use crate::common::{AttrNo, FragSpec, FuncId, NodeId, Value};
use crate::error::{DbError, Result};
use parking_lot::RwLock;
use std::sync::Arc;

/// One persisted row: a relation's declared distribution.
#[derive(Debug, Clone, PartialEq)]
pub struct FragRow {
    pub relname: String,
    pub spec: FragSpec,
}

/// Pluggable persistence for `relsfrag`. The in-process catalog below is the
/// only implementation this crate ships; external persistence (an actual SQL
/// connection to the `public` schema) is an out-of-scope collaborator.
pub trait CatalogStore: Send + Sync {
    fn load(&self) -> Result<Vec<FragRow>>;
    fn append(&self, row: FragRow) -> Result<()>;
}

/// An in-memory store, used directly by tests and as the default backing
/// for `FragCatalog` when no external store is wired in.
#[derive(Default)]
pub struct MemoryCatalogStore {
    rows: RwLock<Vec<FragRow>>,
}

impl CatalogStore for MemoryCatalogStore {
    fn load(&self) -> Result<Vec<FragRow>> {
        Ok(self.rows.read().clone())
    }

    fn append(&self, row: FragRow) -> Result<()> {
        let mut rows = self.rows.write();
        if rows.iter().any(|r| r.relname == row.relname) {
            return Err(DbError::AlreadyExists(format!(
                "relation {} already has a fragmentation row",
                row.relname
            )));
        }
        rows.push(row);
        Ok(())
    }
}

/// In-process, insertion-ordered cache of `relsfrag`, refreshed from its
/// backing store via an explicit [`FragCatalog::reload`] rather than on
/// every lookup, since there is no live catalog-invalidation signal to react
/// to in this prototype's scope.
pub struct FragCatalog {
    store: Arc<dyn CatalogStore>,
    rows: RwLock<Vec<FragRow>>,
}

impl FragCatalog {
    pub fn new(store: Arc<dyn CatalogStore>) -> Self {
        Self {
            store,
            rows: RwLock::new(Vec::new()),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryCatalogStore::default()))
    }

    /// Reload the in-process array from the backing store.
    pub fn reload(&self) -> Result<()> {
        let rows = self.store.load()?;
        *self.rows.write() = rows;
        Ok(())
    }

    /// Register a relation's fragmentation. Rejects a duplicate `relname`,
    /// leaving the existing row untouched.
    pub fn register(&self, relname: impl Into<String>, spec: FragSpec) -> Result<()> {
        let row = FragRow {
            relname: relname.into(),
            spec,
        };
        self.store.append(row.clone())?;
        let mut rows = self.rows.write();
        if !rows.iter().any(|r| r.relname == row.relname) {
            rows.push(row);
        }
        Ok(())
    }

    /// Linear lookup by relation name, matching the small, insertion-ordered
    /// array this catalog is specified to keep.
    pub fn lookup(&self, relname: &str) -> Result<FragSpec> {
        let rows = self.rows.read();
        rows.iter()
            .find(|r| r.relname == relname)
            .map(|r| r.spec)
            .ok_or_else(|| DbError::CatalogMiss(relname.to_string()))
    }

    /// Same as [`FragCatalog::lookup`] but treats a miss as `UNINITIALIZED`
    /// (replicated) rather than an error, per §7's `CatalogMiss` handling:
    /// unregistered relations (system catalogs) keep working unrouted.
    pub fn lookup_or_replicated(&self, relname: &str) -> FragSpec {
        match self.lookup(relname) {
            Ok(spec) => spec,
            Err(DbError::CatalogMiss(rel)) => {
                tracing::info!(relation = %rel, "no fragmentation row, treating as replicated");
                FragSpec::UNINITIALIZED
            }
            Err(_) => FragSpec::UNINITIALIZED,
        }
    }
}

/// Deterministic hash used by `HASH` routing, over a value's canonical byte
/// representation, in place of the original's catalog-resolved opclass hash
/// (attribute-type/opclass resolution is out of scope; see DESIGN.md).
fn hash_route(value: &Value, nnodes: u32) -> NodeId {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    value.canonical_bytes().hash(&mut hasher);
    (hasher.finish() % nnodes as u64) as NodeId
}

/// Pure routing function: given a fragmentation spec and a value read from
/// the distribution column, decide which node owns the tuple.
///
/// `coord_node` is only consulted for `FuncId::Gather`.
pub fn route(
    spec: FragSpec,
    value: Option<&Value>,
    my_node: NodeId,
    nnodes: u32,
    coord_node: NodeId,
) -> NodeId {
    match spec.func_id {
        FuncId::Uninitialized => my_node,
        FuncId::Gather => coord_node,
        FuncId::Modulo => {
            let v = value.map(Value::as_route_key).unwrap_or(0);
            (v.rem_euclid(nnodes as i64)) as NodeId
        }
        FuncId::Hash => match value {
            Some(v) => hash_route(v, nnodes),
            None => my_node,
        },
    }
}

/// Attribute number the catalog associates with a relation's distribution
/// column; `AttrNo` is re-exported here purely so callers that only import
/// `catalog::*` don't also need `common::AttrNo` in scope.
pub type RelAttrNo = AttrNo;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_lookup_round_trips() {
        let cat = FragCatalog::in_memory();
        cat.register("t", FragSpec::modulo(1)).unwrap();
        cat.reload().unwrap();
        assert_eq!(cat.lookup("t").unwrap(), FragSpec::modulo(1));
    }

    #[test]
    fn duplicate_relname_is_rejected() {
        let cat = FragCatalog::in_memory();
        cat.register("t", FragSpec::modulo(1)).unwrap();
        let err = cat.register("t", FragSpec::modulo(2));
        assert!(matches!(err, Err(DbError::AlreadyExists(_))));
    }

    #[test]
    fn miss_is_catalog_miss_error() {
        let cat = FragCatalog::in_memory();
        assert!(matches!(cat.lookup("nope"), Err(DbError::CatalogMiss(_))));
    }

    #[test]
    fn miss_treated_as_replicated() {
        let cat = FragCatalog::in_memory();
        assert!(cat.lookup_or_replicated("nope").is_uninitialized());
    }

    #[test]
    fn modulo_routing_is_deterministic_across_callers() {
        let spec = FragSpec::modulo(1);
        let v = Value::Integer(7);
        let a = route(spec, Some(&v), 0, 4, 0);
        let b = route(spec, Some(&v), 3, 4, 0);
        assert_eq!(a, b);
        assert_eq!(a, 3);
    }

    #[test]
    fn gather_routes_to_coordinator_regardless_of_value() {
        let spec = FragSpec::gather();
        assert_eq!(route(spec, None, 2, 4, 1), 1);
    }

    #[test]
    fn uninitialized_routes_locally() {
        assert_eq!(route(FragSpec::UNINITIALIZED, None, 2, 4, 0), 2);
    }
}
