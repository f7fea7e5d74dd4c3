// Exchange Mesh (C3): per-query, full-mesh TCP connections carrying
// tuples between peers, plus the framing and state machine the Exchange
// operator drives on top of it.
//
// Grounded in this crate's TCP transport (`TcpConnection`/`TcpConfig`,
// `socket2` keepalive/nodelay configuration) and wire codec (length-prefixed
// framing with a `bincode`-encoded body) conventions, generalized from a
// generic P2P message channel into a three-phase mesh handshake and
// tuple-specific framing.

use crate::common::{NodeId, Tuple};
use crate::error::{DbError, Result};
use socket2::SockRef;
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

/// Fixed-size length prefix preceding every tuple body, standing in for
/// "the tuple-descriptor bytes up to the variable body pointer" a real
/// tuple access method would supply.
pub const HEADER_SIZE: usize = 4;

/// The only legal one-byte wire message: "I have no more local output
/// pending on this slot for the current pass." Distinguished from a tuple
/// header by its length (a real header read never returns exactly 1 byte).
pub const CLOSE_SENTINEL: u8 = b'C';

fn configure_socket(stream: &TcpStream) -> Result<()> {
    stream
        .set_nodelay(true)
        .map_err(|e| DbError::Network(format!("failed to set TCP_NODELAY: {}", e)))?;
    let sock = SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(60));
    sock.set_tcp_keepalive(&keepalive)
        .map_err(|e| DbError::Network(format!("failed to set keepalive: {}", e)))?;
    Ok(())
}

/// One directed half of a peer connection plus its "still open for this
/// pass" flag.
struct Half {
    stream: TcpStream,
    open: bool,
}

/// Per-Exchange-instance connection table: for every peer other than
/// ourselves, a writable outbound half and a readable inbound half.
pub struct MeshConn {
    my_node: NodeId,
    w: HashMap<NodeId, Mutex<Half>>,
    r: HashMap<NodeId, Mutex<Half>>,
}

/// What `recv_any` observed.
#[derive(Debug)]
pub enum RecvEvent {
    Tuple(NodeId, Tuple),
    /// No ready socket right now; try again after doing other work.
    Pending,
    /// Every `r[]` slot is closed; the mesh has nothing left to deliver.
    Closed,
}

impl MeshConn {
    /// Run the three-phase handshake: listen on a leased port, connect out
    /// to every peer's advertised port, accept and identify every inbound
    /// connection by the `u32` node id it announces first.
    pub async fn establish(
        my_node: NodeId,
        listen_port: u16,
        peer_addrs: &HashMap<NodeId, String>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", listen_port))
            .await
            .map_err(|e| DbError::Network(format!("failed to bind mesh listener: {}", e)))?;

        let mut w = HashMap::new();
        for (&peer, addr) in peer_addrs {
            let mut stream = TcpStream::connect(addr)
                .await
                .map_err(|e| DbError::PeerUnreachable(format!("{}: {}", addr, e)))?;
            configure_socket(&stream)?;
            stream
                .write_all(&my_node.to_be_bytes())
                .await
                .map_err(|e| DbError::TransientIO(e.to_string()))?;
            w.insert(
                peer,
                Mutex::new(Half {
                    stream,
                    open: true,
                }),
            );
        }

        let expected = peer_addrs.len();
        let mut r = HashMap::new();
        while r.len() < expected {
            let (mut stream, _) = listener
                .accept()
                .await
                .map_err(|e| DbError::Network(format!("mesh accept failed: {}", e)))?;
            configure_socket(&stream)?;
            let mut id_buf = [0u8; 4];
            stream
                .read_exact(&mut id_buf)
                .await
                .map_err(|e| DbError::ProtocolError(format!("mesh identify failed: {}", e)))?;
            let peer = NodeId::from_be_bytes(id_buf);
            r.insert(
                peer,
                Mutex::new(Half {
                    stream,
                    open: true,
                }),
            );
        }

        Ok(Self { my_node, w, r })
    }

    /// Directly-constructed mesh over pre-paired sockets, used by tests that
    /// drive the framing/state-machine layer without a real listener per
    /// peer.
    pub fn from_halves(
        my_node: NodeId,
        w: HashMap<NodeId, TcpStream>,
        r: HashMap<NodeId, TcpStream>,
    ) -> Self {
        Self {
            my_node,
            w: w
                .into_iter()
                .map(|(k, s)| (k, Mutex::new(Half { stream: s, open: true })))
                .collect(),
            r: r
                .into_iter()
                .map(|(k, s)| (k, Mutex::new(Half { stream: s, open: true })))
                .collect(),
        }
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.w.keys().copied().collect()
    }

    async fn write_frame(half: &mut Half, body: &[u8]) -> Result<()> {
        if !half.open {
            return Ok(());
        }
        let len = body.len() as u32;
        if let Err(e) = half.stream.write_all(&len.to_be_bytes()).await {
            half.open = false;
            return Err(DbError::TransientIO(e.to_string()));
        }
        if let Err(e) = half.stream.write_all(body).await {
            half.open = false;
            return Err(DbError::TransientIO(e.to_string()));
        }
        Ok(())
    }

    /// Send a tuple to one peer.
    pub async fn send_to(&self, peer: NodeId, tuple: &Tuple) -> Result<()> {
        let half = self
            .w
            .get(&peer)
            .ok_or_else(|| DbError::ProtocolError(format!("no outbound slot for peer {}", peer)))?;
        let body = bincode::serde::encode_to_vec(tuple, bincode::config::standard())
            .map_err(|e| DbError::Serialization(e.to_string()))?;
        Self::write_frame(&mut *half.lock().await, &body).await
    }

    /// Broadcast a tuple to every peer (does not send to self; the Exchange
    /// operator keeps its own copy locally per §4.6).
    pub async fn broadcast(&self, tuple: &Tuple) -> Result<()> {
        for &peer in self.w.keys().collect::<Vec<_>>() {
            self.send_to(peer, tuple).await?;
        }
        Ok(())
    }

    /// Write the one-byte close sentinel on every still-open outbound
    /// socket, marking "no more local output this pass" without closing the
    /// connection (a rescan may follow).
    pub async fn close_local_output(&self) -> Result<()> {
        for half in self.w.values() {
            let mut half = half.lock().await;
            if half.open {
                let _ = half.stream.write_all(&[CLOSE_SENTINEL]).await;
            }
        }
        Ok(())
    }

    /// Two-stage, non-blocking-header/blocking-body receive. Polls every
    /// open `r[]` slot for readiness without blocking; on the first ready
    /// slot, reads the header (treating an exact 1-byte read as the close
    /// sentinel and a 0-byte read as true EOF), then blocks on the body.
    pub async fn recv_any(&self) -> Result<RecvEvent> {
        let open_peers: Vec<NodeId> = {
            let mut v = Vec::new();
            for (&peer, half) in &self.r {
                if half.lock().await.open {
                    v.push(peer);
                }
            }
            v
        };
        if open_peers.is_empty() {
            return Ok(RecvEvent::Closed);
        }

        for peer in open_peers {
            let half_lock = self.r.get(&peer).unwrap();
            let mut half = half_lock.lock().await;
            let mut header = [0u8; HEADER_SIZE];
            let n = match half.stream.try_read(&mut header) {
                Ok(0) => {
                    half.open = false;
                    continue;
                }
                Ok(n) => n,
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
                Err(e) => {
                    half.open = false;
                    return Err(DbError::TransientIO(e.to_string()));
                }
            };

            if n == 1 {
                if header[0] == CLOSE_SENTINEL {
                    continue;
                }
                half.open = false;
                return Err(DbError::ProtocolError(format!(
                    "unexpected 1-byte frame from peer {}",
                    peer
                )));
            }

            if n < HEADER_SIZE {
                half.stream
                    .read_exact(&mut header[n..])
                    .await
                    .map_err(|e| DbError::ProtocolError(e.to_string()))?;
            }

            let len = u32::from_be_bytes(header) as usize;
            let mut body = vec![0u8; len];
            half.stream
                .read_exact(&mut body)
                .await
                .map_err(|e| DbError::ProtocolError(format!("tuple body read failed: {}", e)))?;

            let (tuple, _): (Tuple, usize) =
                bincode::serde::decode_from_slice(&body, bincode::config::standard())
                    .map_err(|e| DbError::Serialization(e.to_string()))?;

            return Ok(RecvEvent::Tuple(peer, tuple));
        }

        Ok(RecvEvent::Pending)
    }

    /// Reopen every slot for a rescan. Sockets remain intact; peers will
    /// discover the fresh pass from tuples or close sentinels sent during
    /// it.
    pub async fn rescan(&self) {
        for half in self.w.values() {
            half.lock().await.open = true;
        }
        for half in self.r.values() {
            half.lock().await.open = true;
        }
    }

    /// Final teardown: best-effort close-sentinel on every outbound slot,
    /// then shut down every socket.
    pub async fn end(&self) {
        let _ = self.close_local_output().await;
        for half in self.w.values() {
            let mut half = half.lock().await;
            let _ = half.stream.shutdown().await;
        }
        for half in self.r.values() {
            let mut half = half.lock().await;
            let _ = half.stream.shutdown().await;
        }
    }

    pub fn my_node(&self) -> NodeId {
        self.my_node
    }
}
