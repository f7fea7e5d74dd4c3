// Control Channel (C2): the coordinator's persistent connection to every
// peer, used to ship query text and exchange per-query metadata ahead of
// the tuple-exchange mesh.
//
// Modeled as a plain `tokio::net::TcpStream` rather than the full SQL wire
// protocol (out of scope), carrying small `bincode`-encoded request/response
// messages in the header+payload shape this crate's wire codec uses
// elsewhere.

use crate::catalog::{route, FragCatalog};
use crate::common::{NodeId, Value};
use crate::error::{DbError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};

/// Messages carried over a control-channel connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Announce the coordinator of the next query and the port its service
    /// socket should connect back to.
    SetQueryId {
        coord_node: NodeId,
        coord_control_port: u16,
    },
    /// Ship the query text, fire-and-forget.
    LaunchQuery { query_id: u64, sql: String },
    /// Ask whether `value` belongs to the local node under `relname`'s
    /// fragmentation.
    IsLocalValue { relname: String, value: Value },
    IsLocalValueReply { is_local: bool },
    /// Sent over the service back-channel when a peer finishes draining its
    /// part of a query, or hits an error.
    QueryResult { query_id: u64, ok: bool, error: Option<String> },
    Ack,
}

async fn write_message(stream: &mut TcpStream, msg: &ControlMessage) -> Result<()> {
    let payload = bincode::serde::encode_to_vec(msg, bincode::config::standard())
        .map_err(|e| DbError::Serialization(e.to_string()))?;
    let len = payload.len() as u32;
    stream
        .write_all(&len.to_be_bytes())
        .await
        .map_err(|e| DbError::TransientIO(e.to_string()))?;
    stream
        .write_all(&payload)
        .await
        .map_err(|e| DbError::TransientIO(e.to_string()))?;
    Ok(())
}

async fn read_message(stream: &mut TcpStream) -> Result<ControlMessage> {
    let mut len_buf = [0u8; 4];
    stream
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| DbError::ProtocolError(format!("control header read failed: {}", e)))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .map_err(|e| DbError::ProtocolError(format!("control body read failed: {}", e)))?;
    let (msg, _) = bincode::serde::decode_from_slice(&body, bincode::config::standard())
        .map_err(|e| DbError::Serialization(e.to_string()))?;
    Ok(msg)
}

/// One persistent connection to a peer, opened on first query of a session
/// and reused across queries.
pub struct PeerChannel {
    stream: Mutex<TcpStream>,
}

impl PeerChannel {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| DbError::PeerUnreachable(format!("{}: {}", addr, e)))?;
        Ok(Self {
            stream: Mutex::new(stream),
        })
    }

    async fn call(&self, msg: ControlMessage) -> Result<ControlMessage> {
        let mut stream = self.stream.lock().await;
        write_message(&mut stream, &msg).await?;
        read_message(&mut stream).await
    }

    pub async fn set_query_id(&self, coord_node: NodeId, coord_control_port: u16) -> Result<()> {
        self.call(ControlMessage::SetQueryId {
            coord_node,
            coord_control_port,
        })
        .await?;
        Ok(())
    }

    pub async fn launch_query(&self, query_id: u64, sql: String) -> Result<()> {
        let mut stream = self.stream.lock().await;
        write_message(&mut stream, &ControlMessage::LaunchQuery { query_id, sql }).await
    }

    pub async fn is_local_value(&self, relname: &str, value: Value) -> Result<bool> {
        match self
            .call(ControlMessage::IsLocalValue {
                relname: relname.to_string(),
                value,
            })
            .await?
        {
            ControlMessage::IsLocalValueReply { is_local } => Ok(is_local),
            other => Err(DbError::ProtocolError(format!(
                "unexpected reply to IsLocalValue: {:?}",
                other
            ))),
        }
    }
}

/// Coordinator-side service socket (§4.2): a peer's completion/error signal
/// comes back over its own connection, keyed by `query_id` so concurrent
/// queries on the same coordinator don't cross-deliver results to the wrong
/// caller's drain loop.
struct ServiceChannel {
    port: u16,
    registry: Arc<Mutex<HashMap<u64, mpsc::Sender<ControlMessage>>>>,
}

impl ServiceChannel {
    /// Bind a listener on `host` and start accepting peer reports in the
    /// background. The listener's ephemeral port is what `set_query_id`
    /// tells every peer to dial back to.
    async fn bind(host: &str) -> Result<Self> {
        let listener = TcpListener::bind((host, 0)).await?;
        let port = listener.local_addr()?.port();
        let registry: Arc<Mutex<HashMap<u64, mpsc::Sender<ControlMessage>>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let accept_registry = registry.clone();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "service socket accept failed");
                        break;
                    }
                };
                let registry = accept_registry.clone();
                tokio::spawn(async move {
                    let msg = match read_message(&mut stream).await {
                        Ok(msg) => msg,
                        Err(e) => {
                            tracing::warn!(error = %e, "service socket read failed");
                            return;
                        }
                    };
                    if let ControlMessage::QueryResult { query_id, .. } = &msg {
                        if let Some(tx) = registry.lock().await.get(query_id) {
                            let _ = tx.send(msg).await;
                        }
                    }
                });
            }
        });

        Ok(Self { port, registry })
    }

    fn port(&self) -> u16 {
        self.port
    }

    /// Register interest in `query_id`'s reports before any peer can have
    /// been told to send one, so no report can slip in unobserved.
    async fn register(&self, query_id: u64) -> mpsc::Receiver<ControlMessage> {
        let (tx, rx) = mpsc::channel(32);
        self.registry.lock().await.insert(query_id, tx);
        rx
    }

    async fn unregister(&self, query_id: u64) {
        self.registry.lock().await.remove(&query_id);
    }
}

/// Peer-side counterpart of `ServiceChannel`: dials the coordinator's
/// service socket and reports one query's outcome.
pub struct ServiceReporter;

impl ServiceReporter {
    pub async fn report(
        coord_host: &str,
        coord_control_port: u16,
        query_id: u64,
        ok: bool,
        error: Option<String>,
    ) -> Result<()> {
        let addr = format!("{}:{}", coord_host, coord_control_port);
        let mut stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| DbError::PeerUnreachable(format!("{}: {}", addr, e)))?;
        write_message(
            &mut stream,
            &ControlMessage::QueryResult { query_id, ok, error },
        )
        .await
    }
}

/// Coordinator-side view of every peer's control channel plus the service
/// back-channel used to drain completion/error signals.
pub struct ControlChannel {
    peers: HashMap<NodeId, Arc<PeerChannel>>,
    service: ServiceChannel,
}

impl ControlChannel {
    /// `host` is this node's own address, used to bind the service socket
    /// peers report back to.
    pub async fn connect_all(hosts: &[String], ports: &[u16], skip: NodeId) -> Result<Self> {
        let mut peers = HashMap::new();
        for (node, (host, port)) in hosts.iter().zip(ports.iter()).enumerate() {
            let node = node as NodeId;
            if node == skip {
                continue;
            }
            let addr = format!("{}:{}", host, port);
            let channel = PeerChannel::connect(&addr).await?;
            peers.insert(node, Arc::new(channel));
        }
        let own_host = hosts
            .get(skip as usize)
            .map(String::as_str)
            .unwrap_or("127.0.0.1");
        let service = ServiceChannel::bind(own_host).await?;
        Ok(Self { peers, service })
    }

    pub fn peer(&self, node: NodeId) -> Option<&Arc<PeerChannel>> {
        self.peers.get(&node)
    }

    /// This node's service-socket port, announced to peers via
    /// `set_query_id` so they know where to report back to.
    pub fn service_port(&self) -> u16 {
        self.service.port()
    }

    /// Announce this node as coordinator to every peer, ship the query text
    /// asynchronously (fire-and-forget per peer), and return a receiver
    /// that will carry every peer's `QueryResult`.
    ///
    /// Registers with the service channel before announcing the query to
    /// any peer, so no peer can report before the registration that would
    /// observe it exists.
    pub async fn launch_on_all(
        &self,
        my_node: NodeId,
        query_id: u64,
        sql: &str,
    ) -> Result<mpsc::Receiver<ControlMessage>> {
        let results = self.service.register(query_id).await;
        for peer in self.peers.values() {
            peer.set_query_id(my_node, self.service.port()).await?;
        }
        for peer in self.peers.values() {
            let peer = peer.clone();
            let sql = sql.to_string();
            tokio::spawn(async move {
                if let Err(e) = peer.launch_query(query_id, sql).await {
                    tracing::warn!(error = %e, "failed to launch query on peer");
                }
            });
        }
        Ok(results)
    }

    /// Drain `query_id`'s completion signal from every peer launched by
    /// `launch_on_all`. Stops and returns the first error a peer reports;
    /// does not wait forever for a completion signal a dead peer will
    /// never send. Unregisters from the service channel on every exit path
    /// so a late or duplicate report can't be misdelivered to a later query
    /// reusing the same id.
    pub async fn check_query_result(
        &self,
        query_id: u64,
        mut results: mpsc::Receiver<ControlMessage>,
        expected: usize,
    ) -> Result<()> {
        let outcome = async {
            let mut seen = 0;
            while seen < expected {
                match results.recv().await {
                    Some(ControlMessage::QueryResult { ok, error, .. }) => {
                        if !ok {
                            return Err(DbError::ProtocolError(
                                error.unwrap_or_else(|| "peer reported query failure".to_string()),
                            ));
                        }
                        seen += 1;
                    }
                    Some(_) => {}
                    None => {
                        return Err(DbError::PeerUnreachable(
                            "service channel closed before all peers reported".to_string(),
                        ));
                    }
                }
            }
            Ok(())
        }
        .await;
        self.service.unregister(query_id).await;
        outcome
    }
}

/// Evaluate `isLocalValue` purely against the catalog, used both by the
/// control channel's RPC handler and by client-side LOCAL-predicate
/// pushdown so both paths agree.
pub fn is_local_value(
    catalog: &FragCatalog,
    relname: &str,
    value: &Value,
    my_node: NodeId,
    nnodes: u32,
    coord_node: NodeId,
) -> bool {
    let spec = catalog.lookup_or_replicated(relname);
    route(spec, Some(value), my_node, nnodes, coord_node) == my_node
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::FragSpec;

    #[test]
    fn is_local_value_agrees_with_route() {
        let catalog = FragCatalog::in_memory();
        catalog.register("t", FragSpec::modulo(1)).unwrap();
        catalog.reload().unwrap();

        let v = Value::Integer(5);
        let owner = route(FragSpec::modulo(1), Some(&v), 0, 4, 0);
        assert_eq!(
            is_local_value(&catalog, "t", &v, owner, 4, 0),
            true
        );
        assert_eq!(
            is_local_value(&catalog, "t", &v, (owner + 1) % 4, 4, 0),
            false
        );
    }

    #[tokio::test]
    async fn control_message_round_trips_over_loopback() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let msg = read_message(&mut stream).await.unwrap();
            match msg {
                ControlMessage::SetQueryId { coord_node, .. } => assert_eq!(coord_node, 3),
                other => panic!("unexpected message: {:?}", other),
            }
            write_message(&mut stream, &ControlMessage::Ack).await.unwrap();
        });

        let channel = PeerChannel::connect(&addr.to_string()).await.unwrap();
        channel.set_query_id(3, 9000).await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn service_channel_delivers_peer_reports_to_the_registered_receiver() {
        let service = ServiceChannel::bind("127.0.0.1").await.unwrap();
        let mut results = service.register(42).await;

        ServiceReporter::report("127.0.0.1", service.port(), 42, true, None)
            .await
            .unwrap();

        match results.recv().await {
            Some(ControlMessage::QueryResult { query_id, ok, .. }) => {
                assert_eq!(query_id, 42);
                assert!(ok);
            }
            other => panic!("unexpected message: {:?}", other),
        }
        service.unregister(42).await;
    }

    #[tokio::test]
    async fn service_channel_ignores_reports_for_an_unregistered_query() {
        let service = ServiceChannel::bind("127.0.0.1").await.unwrap();
        // No register() call for query_id 99: the report is delivered to
        // nobody rather than erroring, matching a late duplicate report
        // after `check_query_result` already unregistered.
        ServiceReporter::report("127.0.0.1", service.port(), 99, true, None)
            .await
            .unwrap();
        assert!(service.registry.lock().await.is_empty());
    }

    /// Full round trip: a fake peer answers the coordinator's control
    /// messages over its `PeerChannel` connection, then reports its result
    /// over the real service socket `launch_on_all` announced to it.
    #[tokio::test]
    async fn launch_on_all_and_check_query_result_round_trip() {
        let peer_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer_port = peer_listener.local_addr().unwrap().port();

        let peer_task = tokio::spawn(async move {
            let (mut stream, _) = peer_listener.accept().await.unwrap();

            let coord_control_port = match read_message(&mut stream).await.unwrap() {
                ControlMessage::SetQueryId {
                    coord_control_port, ..
                } => coord_control_port,
                other => panic!("unexpected message: {:?}", other),
            };
            write_message(&mut stream, &ControlMessage::Ack).await.unwrap();

            let query_id = match read_message(&mut stream).await.unwrap() {
                ControlMessage::LaunchQuery { query_id, .. } => query_id,
                other => panic!("unexpected message: {:?}", other),
            };

            ServiceReporter::report("127.0.0.1", coord_control_port, query_id, true, None)
                .await
                .unwrap();
        });

        let channel = ControlChannel::connect_all(
            &["127.0.0.1".to_string(), "127.0.0.1".to_string()],
            &[0, peer_port],
            0,
        )
        .await
        .unwrap();

        let results = channel.launch_on_all(0, 7, "select 1").await.unwrap();
        channel.check_query_result(7, results, 1).await.unwrap();

        peer_task.await.unwrap();
    }
}
