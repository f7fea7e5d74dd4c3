// Networking layer for the query-execution core: the cluster-shared port
// pool, the control channel used to bootstrap a query on every peer, and
// the per-query tuple-exchange mesh.

pub mod control;
pub mod mesh;
pub mod ports;

pub use control::ControlChannel;
pub use mesh::{MeshConn, RecvEvent};
pub use ports::{PortLease, PortPool};
