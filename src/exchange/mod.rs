// Exchange Operator (C6): the iterator-model operator that, on each pull,
// interleaves local scan output with inbound network tuples while driving
// cooperative end-of-stream across every peer.

use crate::catalog::route;
use crate::common::{FragSpec, NodeId, Tuple};
use crate::error::Result;
use crate::network::mesh::{MeshConn, RecvEvent};
use crate::network::ports::{PortLease, PortPool};
use crate::plan::ExchangeMode;
use std::sync::Arc;

/// Minimal stand-in for the host executor's child-operator iterator
/// protocol (out of scope per §6): anything the Exchange operator pulls
/// local tuples from.
pub trait PlanSource: Send {
    fn next_tuple(&mut self) -> Option<Tuple>;
}

/// A `PlanSource` over an in-memory vector, used by tests and by any
/// already-materialized local fragment.
pub struct VecSource {
    tuples: std::vec::IntoIter<Tuple>,
}

impl VecSource {
    pub fn new(tuples: Vec<Tuple>) -> Self {
        Self {
            tuples: tuples.into_iter(),
        }
    }
}

impl PlanSource for VecSource {
    fn next_tuple(&mut self) -> Option<Tuple> {
        self.tuples.next()
    }
}

#[derive(Debug, PartialEq)]
pub enum ExchangeNext {
    Tuple(Tuple),
    EndOfStream,
}

/// Per-Exchange-instance private state (§3's `ExchangeState`).
pub struct ExchangeState {
    mesh: Arc<MeshConn>,
    mode: ExchangeMode,
    spec: FragSpec,
    my_node: NodeId,
    nnodes: u32,
    coord_node: NodeId,
    local_active: bool,
    network_active: bool,
}

impl ExchangeState {
    pub fn new(
        mesh: Arc<MeshConn>,
        mode: ExchangeMode,
        spec: FragSpec,
        my_node: NodeId,
        nnodes: u32,
        coord_node: NodeId,
    ) -> Self {
        Self {
            mesh,
            mode,
            spec,
            my_node,
            nnodes,
            coord_node,
            local_active: true,
            network_active: true,
        }
    }

    /// Route one locally-pulled tuple: returns `Some(tuple)` if this node
    /// keeps a copy to emit, `None` if it was forwarded or dropped.
    async fn route_tuple(&self, t: Tuple) -> Result<Option<Tuple>> {
        match self.mode {
            ExchangeMode::Broadcast => {
                self.mesh.broadcast(&t).await?;
                Ok(Some(t))
            }
            ExchangeMode::RouteByFunc => {
                let value = t.get(self.spec.attno);
                let dest = route(self.spec, value, self.my_node, self.nnodes, self.coord_node);
                if dest == self.my_node {
                    Ok(Some(t))
                } else {
                    self.mesh.send_to(dest, &t).await?;
                    Ok(None)
                }
            }
            ExchangeMode::DropDuplicatesRoute => {
                let value = t.get(self.spec.attno);
                let dest = route(self.spec, value, self.my_node, self.nnodes, self.coord_node);
                if dest == self.my_node {
                    Ok(Some(t))
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Demand-driven pull: on each call, either returns an inbound network
    /// tuple, pulls from the child and routes it, or detects global EOF
    /// (§4.6's `(local_active, network_active)` state machine).
    pub async fn next(&mut self, child: &mut dyn PlanSource) -> Result<ExchangeNext> {
        loop {
            if self.network_active {
                match self.mesh.recv_any().await? {
                    RecvEvent::Tuple(_from, t) => return Ok(ExchangeNext::Tuple(t)),
                    RecvEvent::Pending => {}
                    RecvEvent::Closed => self.network_active = false,
                }
            }

            if self.local_active {
                match child.next_tuple() {
                    Some(t) => {
                        if let Some(local) = self.route_tuple(t).await? {
                            return Ok(ExchangeNext::Tuple(local));
                        }
                        continue;
                    }
                    None => {
                        self.mesh.close_local_output().await?;
                        self.local_active = false;
                    }
                }
            }

            if !self.local_active && !self.network_active {
                return Ok(ExchangeNext::EndOfStream);
            }

            // Neither side had anything ready this iteration; yield so this
            // isn't a hot spin while waiting on peers.
            tokio::task::yield_now().await;
        }
    }

    /// Distinct rescan entry point (kept separate from `next()` rather than
    /// folded into its argument list, matching PostgreSQL's own
    /// `ExecReScanExchange`): resets both activity flags and reopens every
    /// mesh slot for a fresh pass.
    pub async fn rescan(&mut self) {
        self.local_active = true;
        self.network_active = true;
        self.mesh.rescan().await;
    }

    /// Normal end-of-query teardown: flush any remaining close sentinels
    /// and close every socket. Port release is the caller's responsibility
    /// via `PortLease`'s `Drop`.
    pub async fn end(&mut self) {
        self.mesh.end().await;
    }

    /// Cancellation (§5): stop reading the child, signal and close every
    /// outbound socket, then drain and discard every inbound tuple until
    /// closed.
    pub async fn cancel(&mut self) -> Result<()> {
        self.local_active = false;
        self.mesh.close_local_output().await?;
        loop {
            match self.mesh.recv_any().await? {
                RecvEvent::Tuple(_, _) => continue,
                RecvEvent::Pending => tokio::task::yield_now().await,
                RecvEvent::Closed => break,
            }
        }
        self.network_active = false;
        self.mesh.end().await;
        Ok(())
    }

    pub fn is_done(&self) -> bool {
        !self.local_active && !self.network_active
    }
}

/// One parallel worker's pre-assigned mesh slot: which port to bind its
/// share of the Exchange mesh on and which node is the coordinator.
/// Mirrors a worker reading its entry out of the leader-populated DSM
/// segment rather than allocating one for itself.
#[derive(Debug, Clone, Copy)]
pub struct ConnInfo {
    pub coord_node: NodeId,
    pub port: u16,
}

/// Leader-side half of parallel-worker mesh setup. Grounded on
/// `EXCHANGE_EstimateDSM`/`EXCHANGE_InitializeDSM`: the leader reserves one
/// port per worker up front, before any worker starts, so a worker joining
/// later only has to read its slot rather than contend on the Port Pool
/// (C1) itself.
pub struct ConnInfoPool {
    coord_node: NodeId,
    leases: Vec<PortLease>,
}

impl ConnInfoPool {
    /// Lease `num_workers` ports from `pool`. Dropping the returned pool
    /// releases every leased port back to `pool`, the same way the leader's
    /// DSM segment is torn down once every worker has exited.
    pub fn populate(pool: Arc<PortPool>, coord_node: NodeId, num_workers: u32) -> Result<Self> {
        let mut leases = Vec::with_capacity(num_workers as usize);
        for _ in 0..num_workers {
            leases.push(PortLease::acquire(pool.clone())?);
        }
        Ok(Self { coord_node, leases })
    }

    /// Worker-side half: `EXCHANGE_InitializeWorker`'s read of its
    /// pre-assigned `ConnInfo` out of the segment the leader populated.
    /// `None` if `worker_id` is past the number of workers `populate` was
    /// called with.
    pub fn join(&self, worker_id: u32) -> Option<ConnInfo> {
        self.leases.get(worker_id as usize).map(|lease| ConnInfo {
            coord_node: self.coord_node,
            port: lease.port(),
        })
    }

    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }
}
