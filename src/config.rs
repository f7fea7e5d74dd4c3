// Cluster configuration for the query-execution core.
//
// Mirrors the plain-struct-plus-`Default` configuration style used
// throughout this crate, sized to exactly the settable options this core
// needs rather than the full instance configuration surface.

use crate::common::NodeId;
use crate::error::{DbError, Result};

/// Cluster-wide configuration, identical on every node except for `node`.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// This process's position in the cluster.
    pub node: NodeId,
    /// Cluster size.
    pub nnodes: u32,
    /// Hostnames, indexed by node id.
    pub hosts: Vec<String>,
    /// SQL-listener ports, indexed by node id, matching `hosts`.
    pub ports: Vec<u16>,
    /// Size of the per-node Exchange port pool.
    pub eports: u16,
    /// Base of the Exchange port range; each node's disjoint slice starts
    /// at `eport_base + node * eports`.
    pub eport_base: u16,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node: 0,
            nnodes: 2,
            hosts: vec!["127.0.0.1".to_string(), "127.0.0.1".to_string()],
            ports: vec![5432, 5433],
            eports: 64,
            eport_base: 18000,
        }
    }
}

impl ClusterConfig {
    /// Validate the configuration, matching the field-by-field checks this
    /// crate's error taxonomy names under `ConfigError`.
    pub fn validate(&self) -> Result<()> {
        if self.nnodes < 2 || self.nnodes > 1024 {
            return Err(DbError::ConfigError(format!(
                "nnodes must be in [2, 1024], got {}",
                self.nnodes
            )));
        }
        if self.node >= self.nnodes {
            return Err(DbError::ConfigError(format!(
                "node {} out of range for nnodes {}",
                self.node, self.nnodes
            )));
        }
        if self.hosts.len() != self.nnodes as usize {
            return Err(DbError::ConfigError(format!(
                "hosts has {} entries, expected {}",
                self.hosts.len(),
                self.nnodes
            )));
        }
        if self.ports.len() != self.nnodes as usize {
            return Err(DbError::ConfigError(format!(
                "ports has {} entries, expected {}",
                self.ports.len(),
                self.nnodes
            )));
        }
        if self.eports == 0 || self.eports as u32 > 10000 {
            return Err(DbError::ConfigError(format!(
                "eports must be in [1, 10000], got {}",
                self.eports
            )));
        }
        Ok(())
    }

    /// This node's disjoint Exchange port range, `[start, end)`.
    pub fn eport_range(&self) -> (u16, u16) {
        let start = self.eport_base + (self.node as u16) * self.eports;
        let end = start + self.eports;
        (start, end)
    }

    pub fn host(&self, node: NodeId) -> Option<&str> {
        self.hosts.get(node as usize).map(|s| s.as_str())
    }

    pub fn sql_port(&self, node: NodeId) -> Option<u16> {
        self.ports.get(node as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(ClusterConfig::default().validate().is_ok());
    }

    #[test]
    fn node_out_of_range_is_config_error() {
        let mut cfg = ClusterConfig::default();
        cfg.node = 5;
        assert!(matches!(cfg.validate(), Err(DbError::ConfigError(_))));
    }

    #[test]
    fn mismatched_hosts_len_is_config_error() {
        let mut cfg = ClusterConfig::default();
        cfg.hosts.pop();
        assert!(matches!(cfg.validate(), Err(DbError::ConfigError(_))));
    }

    #[test]
    fn eport_ranges_are_disjoint_per_node() {
        let mut cfg = ClusterConfig::default();
        cfg.node = 0;
        let (s0, e0) = cfg.eport_range();
        cfg.node = 1;
        let (s1, e1) = cfg.eport_range();
        assert_eq!(e0, s1);
        assert!(s0 < e0 && s1 < e1);
    }
}
