//! TCP client implementing [`ServerLink`].
//!
//! Uses a command-channel architecture: the [`ElectrumClient`] handle sends
//! commands over an mpsc channel to a background task that owns the socket.
//! The task correlates responses to requests by id and forwards subscription
//! notifications to a single notification stream.

use crate::config::{ClientConfig, server_address};
use crate::protocol::{self, Incoming};
use async_trait::async_trait;
use bitcoin::Txid;
use futures::{SinkExt, StreamExt};
use nowallet_core::constants::methods;
use nowallet_core::error::LinkError;
use nowallet_core::traits::ServerLink;
use nowallet_core::types::{AddressNotification, HistoryItem, ServerBalance, UnspentItem};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, warn};

type Reply = oneshot::Sender<Result<Value, LinkError>>;

/// Commands sent from [`ElectrumClient`] to the connection task.
#[derive(Debug)]
enum Command {
    /// Write a request line and route its response to `reply`.
    Call { id: u64, line: String, reply: Reply },
    /// Forget a request whose caller stopped waiting.
    Cancel { id: u64 },
    /// Report the number of requests awaiting a response.
    PendingCount { reply: oneshot::Sender<usize> },
    /// Close the connection.
    Shutdown,
}

/// Handle to one server connection.
pub struct ElectrumClient {
    server: String,
    command_tx: mpsc::UnboundedSender<Command>,
    next_id: AtomicU64,
    request_timeout: Duration,
    notifications: Mutex<Option<mpsc::UnboundedReceiver<AddressNotification>>>,
}

impl std::fmt::Debug for ElectrumClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElectrumClient")
            .field("server", &self.server)
            .field("running", &!self.command_tx.is_closed())
            .finish()
    }
}

impl ElectrumClient {
    /// Connect to `server` (`host` or `host:port`) and perform the
    /// `server.version` handshake.
    pub async fn connect(server: &str, config: &ClientConfig) -> Result<Self, LinkError> {
        let addr = server_address(server);
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| LinkError::Connect(format!("{addr}: connection timeout")))?
            .map_err(|e| LinkError::Connect(format!("{addr}: {e}")))?;
        debug!(server = %addr, "tcp connection established");

        let client = Self::start(stream, addr, config);
        client.handshake(config).await?;
        Ok(client)
    }

    /// Run the protocol over an already-established stream.
    ///
    /// Spawns the connection task; must be called inside a tokio runtime.
    pub fn start<S>(stream: S, server: impl Into<String>, config: &ClientConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let server = server.into();
        let framed = Framed::new(stream, LinesCodec::new_with_max_length(config.max_line_length));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();

        tokio::spawn(connection_loop(framed, command_rx, notify_tx, server.clone()));

        Self {
            server,
            command_tx,
            next_id: AtomicU64::new(0),
            request_timeout: config.request_timeout,
            notifications: Mutex::new(Some(notify_rx)),
        }
    }

    /// Announce the client to the server. A server-side error is logged and
    /// ignored; transport failures are returned.
    pub async fn handshake(&self, config: &ClientConfig) -> Result<(), LinkError> {
        let params = [
            json!(config.client_name),
            json!([config.protocol_min, config.protocol_max]),
        ];
        match self.call(methods::SERVER_VERSION, &params).await {
            Ok(version) => {
                info!(server = %self.server, %version, "connected to server");
                Ok(())
            }
            Err(e) if e.is_server_rejection() => {
                warn!(server = %self.server, error = %e, "server.version rejected, continuing");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// The `host:port` this client talks to.
    pub fn server(&self) -> &str {
        &self.server
    }

    /// Whether the connection task is still running.
    pub fn is_running(&self) -> bool {
        !self.command_tx.is_closed()
    }

    /// Number of requests sent and still awaiting a response.
    pub async fn pending_requests(&self) -> Result<usize, LinkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::PendingCount { reply: reply_tx })
            .map_err(|_| LinkError::Closed)?;
        reply_rx.await.map_err(|_| LinkError::Closed)
    }

    /// Close the connection. Outstanding requests fail with
    /// [`LinkError::Closed`] and the notification stream ends.
    pub fn shutdown(&self) {
        let _ = self.command_tx.send(Command::Shutdown);
    }

    async fn call(&self, method: &str, params: &[Value]) -> Result<Value, LinkError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = protocol::encode_request(id, method, params)?;
        let (reply_tx, reply_rx) = oneshot::channel();

        self.command_tx
            .send(Command::Call { id, line, reply: reply_tx })
            .map_err(|_| LinkError::Closed)?;

        match tokio::time::timeout(self.request_timeout, reply_rx).await {
            Err(_) => {
                debug!(server = %self.server, method, id, "request timed out");
                let _ = self.command_tx.send(Command::Cancel { id });
                Err(LinkError::Timeout)
            }
            Ok(Err(_)) => Err(LinkError::Closed),
            Ok(Ok(result)) => result,
        }
    }

    async fn call_as<T: DeserializeOwned>(&self, method: &str, params: &[Value]) -> Result<T, LinkError> {
        let value = self.call(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }
}

impl Drop for ElectrumClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[async_trait]
impl ServerLink for ElectrumClient {
    async fn get_history(&self, address: &str) -> Result<Vec<HistoryItem>, LinkError> {
        self.call_as(methods::ADDRESS_GET_HISTORY, &[json!(address)]).await
    }

    async fn get_balance(&self, address: &str) -> Result<ServerBalance, LinkError> {
        self.call_as(methods::ADDRESS_GET_BALANCE, &[json!(address)]).await
    }

    async fn list_unspent(&self, address: &str) -> Result<Vec<UnspentItem>, LinkError> {
        self.call_as(methods::ADDRESS_LISTUNSPENT, &[json!(address)]).await
    }

    async fn get_transaction(&self, txid: &Txid) -> Result<String, LinkError> {
        self.call_as(methods::TRANSACTION_GET, &[json!(txid.to_string())]).await
    }

    async fn estimate_fee(&self, target_blocks: u32) -> Result<f64, LinkError> {
        self.call_as(methods::ESTIMATE_FEE, &[json!(target_blocks)]).await
    }

    async fn broadcast(&self, raw_hex: &str) -> Result<String, LinkError> {
        match self.call(methods::TRANSACTION_BROADCAST, &[json!(raw_hex)]).await? {
            Value::String(answer) => Ok(answer),
            other => Ok(other.to_string()),
        }
    }

    async fn subscribe_address(&self, address: &str) -> Result<Option<String>, LinkError> {
        self.call_as(methods::ADDRESS_SUBSCRIBE, &[json!(address)]).await
    }

    fn notifications(&self) -> Option<mpsc::UnboundedReceiver<AddressNotification>> {
        self.notifications.lock().take()
    }
}

/// Background task owning the framed socket.
///
/// Ends when the server closes the stream, a read or write fails, or the
/// handle asks it to shut down. Pending requests are then failed with
/// [`LinkError::Closed`] and the notification sender is dropped.
async fn connection_loop<S>(
    mut framed: Framed<S, LinesCodec>,
    mut command_rx: mpsc::UnboundedReceiver<Command>,
    notify_tx: mpsc::UnboundedSender<AddressNotification>,
    server: String,
) where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut pending: HashMap<u64, Reply> = HashMap::new();

    loop {
        tokio::select! {
            cmd = command_rx.recv() => {
                match cmd {
                    Some(Command::Call { id, line, reply }) => {
                        if let Err(e) = framed.send(line).await {
                            warn!(%server, error = %e, "failed to write request");
                            let _ = reply.send(Err(LinkError::Io(e.to_string())));
                            break;
                        }
                        pending.insert(id, reply);
                    }
                    Some(Command::Cancel { id }) => {
                        if pending.remove(&id).is_some() {
                            debug!(%server, id, "dropped abandoned request");
                        }
                    }
                    Some(Command::PendingCount { reply }) => {
                        let _ = reply.send(pending.len());
                    }
                    Some(Command::Shutdown) | None => {
                        debug!(%server, "shutting down connection");
                        break;
                    }
                }
            }
            frame = framed.next() => {
                match frame {
                    Some(Ok(line)) => dispatch_line(&line, &mut pending, &notify_tx, &server),
                    Some(Err(e)) => {
                        warn!(%server, error = %e, "failed to read from server");
                        break;
                    }
                    None => {
                        info!(%server, "server closed the connection");
                        break;
                    }
                }
            }
        }
    }

    for (_, reply) in pending.drain() {
        let _ = reply.send(Err(LinkError::Closed));
    }
}

fn dispatch_line(
    line: &str,
    pending: &mut HashMap<u64, Reply>,
    notify_tx: &mpsc::UnboundedSender<AddressNotification>,
    server: &str,
) {
    if line.trim().is_empty() {
        return;
    }
    match Incoming::parse(line) {
        Ok(Incoming::Response { id, result }) => match pending.remove(&id) {
            Some(reply) => {
                let _ = reply.send(result);
            }
            None => debug!(%server, id, "response for unknown or expired request"),
        },
        Ok(Incoming::Notification { method, params }) if method == methods::ADDRESS_SUBSCRIBE => {
            match protocol::address_notification(&params) {
                Ok(note) => {
                    debug!(%server, address = %note.address, "address notification");
                    let _ = notify_tx.send(note);
                }
                Err(e) => warn!(%server, error = %e, "malformed address notification"),
            }
        }
        Ok(Incoming::Notification { method, .. }) => {
            debug!(%server, %method, "ignoring notification");
        }
        Err(e) => warn!(%server, error = %e, "undecodable line from server"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    const TXID: &str = "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

    fn test_config() -> ClientConfig {
        ClientConfig {
            request_timeout: Duration::from_millis(500),
            ..ClientConfig::default()
        }
    }

    /// Serve requests on the far end of a duplex pipe with `respond`, which
    /// returns the lines to write back for each request.
    fn spawn_server<F>(stream: DuplexStream, respond: F)
    where
        F: Fn(&Value) -> Vec<String> + Send + 'static,
    {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(stream);
            let mut lines = BufReader::new(read).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let req: Value = serde_json::from_str(&line).unwrap();
                for out in respond(&req) {
                    if write.write_all(format!("{out}\n").as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        });
    }

    fn reply(req: &Value, result: Value) -> String {
        json!({"jsonrpc": "2.0", "id": req["id"], "result": result}).to_string()
    }

    #[tokio::test]
    async fn history_round_trip() {
        let (local, remote) = tokio::io::duplex(4096);
        spawn_server(remote, |req| {
            assert_eq!(req["method"], "blockchain.address.get_history");
            assert_eq!(req["params"], json!(["mabc"]));
            vec![reply(req, json!([{"tx_hash": TXID, "height": 10}]))]
        });

        let client = ElectrumClient::start(local, "mock", &test_config());
        let history = client.get_history("mabc").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].tx_hash, Txid::from_str(TXID).unwrap());
        assert_eq!(history[0].height, 10);
    }

    #[tokio::test]
    async fn server_error_maps_to_rpc() {
        let (local, remote) = tokio::io::duplex(4096);
        spawn_server(remote, |req| {
            vec![json!({"id": req["id"], "error": {"code": 1, "message": "rejected"}}).to_string()]
        });

        let client = ElectrumClient::start(local, "mock", &test_config());
        let err = client.broadcast("00").await.unwrap_err();
        assert_eq!(err, LinkError::Rpc { code: 1, message: "rejected".into() });
    }

    #[tokio::test]
    async fn handshake_tolerates_server_error() {
        let (local, remote) = tokio::io::duplex(4096);
        spawn_server(remote, |req| {
            assert_eq!(req["method"], "server.version");
            vec![json!({"id": req["id"], "error": {"code": -32601, "message": "unknown method"}}).to_string()]
        });

        let client = ElectrumClient::start(local, "mock", &test_config());
        assert!(client.handshake(&test_config()).await.is_ok());
    }

    #[tokio::test]
    async fn responses_out_of_order_are_correlated() {
        let (local, remote) = tokio::io::duplex(4096);
        // Answer the fee estimate only once the balance request has arrived,
        // and answer both in reverse order.
        let held = std::sync::Arc::new(parking_lot::Mutex::new(None::<Value>));
        spawn_server(remote, move |req| {
            let mut held = held.lock();
            match held.take() {
                None => {
                    *held = Some(req.clone());
                    Vec::new()
                }
                Some(first) => {
                    let (fee_req, bal_req) = if first["method"] == "blockchain.estimatefee" {
                        (first, req.clone())
                    } else {
                        (req.clone(), first)
                    };
                    vec![
                        reply(&bal_req, json!({"confirmed": 5, "unconfirmed": 1})),
                        reply(&fee_req, json!(0.0001)),
                    ]
                }
            }
        });

        let client = ElectrumClient::start(local, "mock", &test_config());
        let (fee, balance) = tokio::join!(client.estimate_fee(6), client.get_balance("mabc"));
        assert_eq!(fee.unwrap(), 0.0001);
        assert_eq!(balance.unwrap(), ServerBalance { confirmed: 5, unconfirmed: 1 });
    }

    #[tokio::test]
    async fn subscription_notifications_are_forwarded() {
        let (local, remote) = tokio::io::duplex(4096);
        spawn_server(remote, |req| {
            let addr = req["params"][0].clone();
            vec![
                reply(req, Value::Null),
                json!({"method": "blockchain.address.subscribe", "params": [addr, "abcd"]}).to_string(),
            ]
        });

        let client = ElectrumClient::start(local, "mock", &test_config());
        let mut notes = client.notifications().unwrap();
        assert!(client.notifications().is_none());

        let status = client.subscribe_address("mabc").await.unwrap();
        assert_eq!(status, None);

        let note = notes.recv().await.unwrap();
        assert_eq!(note, AddressNotification { address: "mabc".into(), status: Some("abcd".into()) });
    }

    #[tokio::test]
    async fn silent_server_times_out() {
        let (local, remote) = tokio::io::duplex(4096);
        spawn_server(remote, |_| Vec::new());

        let client = ElectrumClient::start(local, "mock", &test_config());
        let err = client.get_transaction(&Txid::from_str(TXID).unwrap()).await.unwrap_err();
        assert_eq!(err, LinkError::Timeout);
        assert_eq!(client.pending_requests().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn late_answer_after_timeout_is_discarded() {
        let (local, remote) = tokio::io::duplex(4096);
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(remote);
            let mut lines = BufReader::new(read).lines();
            let mut first = true;
            while let Ok(Some(line)) = lines.next_line().await {
                let req: Value = serde_json::from_str(&line).unwrap();
                let out = if first {
                    first = false;
                    tokio::time::sleep(Duration::from_millis(700)).await;
                    reply(&req, json!("deadbeef"))
                } else {
                    reply(&req, json!(0.0002))
                };
                if write.write_all(format!("{out}\n").as_bytes()).await.is_err() {
                    return;
                }
            }
        });

        let client = ElectrumClient::start(local, "mock", &test_config());
        let err = client.get_transaction(&Txid::from_str(TXID).unwrap()).await.unwrap_err();
        assert_eq!(err, LinkError::Timeout);
        assert_eq!(client.pending_requests().await.unwrap(), 0);

        // The stale answer arrives first and must not satisfy the new request.
        assert_eq!(client.estimate_fee(6).await.unwrap(), 0.0002);
        assert_eq!(client.pending_requests().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn handshake_requests_a_version_with_address_methods() {
        let (local, remote) = tokio::io::duplex(4096);
        // Address methods exist only in sessions negotiated below 1.3.
        let negotiated = std::sync::Arc::new(parking_lot::Mutex::new(None::<String>));
        spawn_server(remote, move |req| {
            let method = req["method"].as_str().unwrap_or_default();
            if method == "server.version" {
                let requested = &req["params"][1];
                let max = match requested {
                    Value::Array(range) => range.last().cloned().unwrap_or(Value::Null),
                    other => other.clone(),
                };
                let version = max.as_str().unwrap_or("1.4").to_string();
                *negotiated.lock() = Some(version.clone());
                return vec![reply(req, json!(["MockX 1.16", version]))];
            }
            let session = negotiated.lock().clone().unwrap_or_default();
            if method.starts_with("blockchain.address.") && session.as_str() >= "1.3" {
                return vec![json!({
                    "id": req["id"],
                    "error": {"code": -32601, "message": format!("unknown method \"{method}\"")}
                })
                .to_string()];
            }
            vec![reply(req, json!([]))]
        });

        let config = test_config();
        let client = ElectrumClient::start(local, "mock", &config);
        client.handshake(&config).await.unwrap();

        let history = client.get_history("mabc").await.unwrap();
        assert!(history.is_empty());
    }

    #[tokio::test]
    async fn handshake_sends_protocol_range() {
        let (local, remote) = tokio::io::duplex(4096);
        spawn_server(remote, |req| {
            assert_eq!(req["params"][1], json!(["1.1", "1.2"]));
            vec![reply(req, json!(["MockX", "1.2"]))]
        });

        let config = test_config();
        let client = ElectrumClient::start(local, "mock", &config);
        client.handshake(&config).await.unwrap();
    }

    #[tokio::test]
    async fn closed_connection_fails_requests_and_ends_stream() {
        let (local, remote) = tokio::io::duplex(4096);
        drop(remote);

        let client = ElectrumClient::start(local, "mock", &test_config());
        let mut notes = client.notifications().unwrap();
        assert!(notes.recv().await.is_none());

        let err = client.get_history("mabc").await.unwrap_err();
        assert_eq!(err, LinkError::Closed);
        assert!(!client.is_running());
    }

    #[tokio::test]
    async fn shutdown_stops_task() {
        let (local, remote) = tokio::io::duplex(4096);
        spawn_server(remote, |_| Vec::new());

        let client = ElectrumClient::start(local, "mock", &test_config());
        client.shutdown();
        let mut notes = client.notifications().unwrap();
        assert!(notes.recv().await.is_none());
        assert!(format!("{client:?}").contains("ElectrumClient"));
    }

    #[tokio::test]
    async fn connect_refused_is_connect_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = ElectrumClient::connect(&addr.to_string(), &test_config()).await.unwrap_err();
        assert!(matches!(err, LinkError::Connect(_)));
    }
}
