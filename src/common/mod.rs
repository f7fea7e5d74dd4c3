// Shared value and row types for the query-execution core.
//
// Kept intentionally small: this crate treats a row's payload as a typed
// `Value` vector for the one distribution column routing cares about, and an
// opaque body for everything else. Full relational type/opclass resolution
// lives outside this core.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A node's position in the cluster, `0..nnodes`.
pub type NodeId = u32;

/// A relation's one-based distribution column index (`0` means "whole-row /
/// not applicable" and is skipped during attribute analysis).
pub type AttrNo = i32;

/// Distribution function identifier attached to a [`FragSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FuncId {
    /// Fragmentation unknown, not applicable, or replicated.
    Uninitialized,
    /// `value mod nnodes`.
    Modulo,
    /// All tuples belong to the query's coordinator node.
    Gather,
    /// Deterministic hash of `value` mod `nnodes`.
    Hash,
}

impl Default for FuncId {
    fn default() -> Self {
        FuncId::Uninitialized
    }
}

/// How a relation (or a rewritten subtree's output) is distributed across
/// the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FragSpec {
    pub attno: AttrNo,
    pub func_id: FuncId,
}

impl FragSpec {
    pub const UNINITIALIZED: FragSpec = FragSpec {
        attno: 0,
        func_id: FuncId::Uninitialized,
    };

    pub fn uninitialized() -> Self {
        Self::UNINITIALIZED
    }

    pub fn is_uninitialized(&self) -> bool {
        self.func_id == FuncId::Uninitialized
    }

    pub fn gather() -> Self {
        FragSpec {
            attno: 0,
            func_id: FuncId::Gather,
        }
    }

    pub fn modulo(attno: AttrNo) -> Self {
        FragSpec {
            attno,
            func_id: FuncId::Modulo,
        }
    }

    pub fn hash(attno: AttrNo) -> Self {
        FragSpec {
            attno,
            func_id: FuncId::Hash,
        }
    }

    /// Returns a copy of this spec with the attribute number remapped,
    /// used after a join node's output targetlist changes attribute
    /// positions (see the Plan Rewriter's join handling).
    pub fn with_attno(&self, attno: AttrNo) -> Self {
        FragSpec {
            attno,
            func_id: self.func_id,
        }
    }
}

/// A single column value. Kept deliberately small relative to a full SQL
/// type system: this core only needs to read the distribution column out of
/// a tuple to route it, and to frame the rest of the row as bytes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    /// Canonical byte representation used by the catalog's `HASH` routing
    /// function (see `catalog::route`).
    pub fn canonical_bytes(&self) -> Vec<u8> {
        match self {
            Value::Null => vec![0u8],
            Value::Integer(i) => i.to_be_bytes().to_vec(),
            Value::Text(s) => s.as_bytes().to_vec(),
            Value::Bytes(b) => b.clone(),
        }
    }

    /// Interpret the value as an integer for `MODULO` routing. Non-integer
    /// values fall back to a stable hash of their bytes, matching the
    /// original implementation's tolerance for non-integer distribution
    /// columns under modulo distribution.
    pub fn as_route_key(&self) -> i64 {
        match self {
            Value::Integer(i) => *i,
            other => {
                use std::hash::{Hash, Hasher};
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                other.canonical_bytes().hash(&mut hasher);
                hasher.finish() as i64
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(i) => write!(f, "{}", i),
            Value::Text(s) => write!(f, "{}", s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

/// A fully materialized row. Tuples cross the mesh as
/// `bincode`-encoded instances of this type with the body length carried in
/// the wire header (see `network::mesh`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tuple {
    pub values: Vec<Value>,
}

impl Tuple {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    pub fn get(&self, attno: AttrNo) -> Option<&Value> {
        if attno <= 0 {
            return None;
        }
        self.values.get((attno - 1) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fragspec_equality_is_by_attno_and_func() {
        assert_eq!(FragSpec::modulo(1), FragSpec::modulo(1));
        assert_ne!(FragSpec::modulo(1), FragSpec::modulo(2));
        assert_ne!(FragSpec::modulo(1), FragSpec::hash(1));
    }

    #[test]
    fn uninitialized_is_the_default() {
        assert!(FragSpec::default().is_uninitialized());
    }

    #[test]
    fn tuple_get_is_one_based_and_skips_nonpositive() {
        let t = Tuple::new(vec![Value::Integer(10), Value::Integer(20)]);
        assert_eq!(t.get(1), Some(&Value::Integer(10)));
        assert_eq!(t.get(2), Some(&Value::Integer(20)));
        assert_eq!(t.get(0), None);
        assert_eq!(t.get(-1), None);
    }
}
