use std::{
    collections::HashMap,
    io,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, Weak,
    },
    time::Duration,
};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpStream, UnixStream},
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time,
};
use tracing::{debug, trace};

use crate::{
    codec::{Pack, SerializeType, Unpack},
    compress::CompressType,
    error::RpcError,
    protocol::{Message, MessageStatus, MessageType},
    share::{server_key, Metadata, ERROR_KEY, ERROR_KIND_KEY},
};

mod discovery;
mod ping;
mod selector;
mod xclient;

pub use discovery::{Discovery, KvPair, StaticDiscovery};
pub use ping::calculate_weight;
pub use selector::{
    ConsistentHashSelector, GeoSelector, PingWeightedSelector, RandomSelector, RoundRobinSelector,
    SelectMode, Selector, WeightedRoundRobinSelector,
};
pub use xclient::{FailMode, XClient};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Message, RpcError>>>>>;

/// Connection-level configuration shared by [`Client`] and [`XClient`].
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Payload encoding for outgoing requests.
    pub serialize_type: SerializeType,
    /// Payload compression for outgoing requests.
    pub compress_type: CompressType,
    /// Limit on transport setup.
    pub connect_timeout: Duration,
    /// Limit on a single call awaiting its response; `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// Total attempts allowed in the `Failtry` and `Failover` modes.
    pub retries: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            serialize_type: SerializeType::default(),
            compress_type: CompressType::default(),
            connect_timeout: Duration::from_secs(10),
            call_timeout: Some(Duration::from_secs(60)),
            retries: 3,
        }
    }
}

/// A multiplexing RPC client over a single connection.
///
/// Many calls may be in flight at once; responses are correlated back to
/// their callers by the frame sequence number through a pending-call table.
/// One reader task drains the connection, and all writers funnel frames
/// through a single writer task so frames stay indivisible on the socket.
#[derive(Debug)]
pub struct Client {
    config: ClientConfig,
    seq: AtomicU64,
    pending: Pending,
    writer: mpsc::UnboundedSender<Vec<u8>>,
    closing: AtomicBool,
    shutdown: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl Client {
    /// Establishes a `tcp` or `unix` transport to `address` and spawns the
    /// connection tasks.
    pub async fn connect(
        network: &str,
        address: &str,
        config: ClientConfig,
    ) -> Result<Client, RpcError> {
        let (reader, writer) = open_transport(network, address, config.connect_timeout).await?;

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = Arc::new(AtomicBool::new(false));
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let writer_handle = tokio::spawn(writer_task(writer, writer_rx, Arc::clone(&shutdown)));
        let reader_handle = tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            Arc::clone(&shutdown),
        ));

        Ok(Client {
            config,
            seq: AtomicU64::new(1),
            pending,
            writer: writer_tx,
            closing: AtomicBool::new(false),
            shutdown,
            tasks: vec![writer_handle, reader_handle],
        })
    }

    /// Starts an asynchronous call and returns its in-flight handle.
    pub fn go<A: Pack>(
        &self,
        service_path: &str,
        service_method: &str,
        args: &A,
        metadata: Metadata,
    ) -> Result<CallHandle, RpcError> {
        let payload = args.pack(self.config.serialize_type)?;
        self.go_raw(service_path, service_method, payload, metadata)
    }

    /// [`Client::go`] with a pre-encoded payload, so fan-out callers can
    /// encode once and dispatch to many connections.
    pub fn go_raw(
        &self,
        service_path: &str,
        service_method: &str,
        payload: Vec<u8>,
        metadata: Metadata,
    ) -> Result<CallHandle, RpcError> {
        let message = self.request_message(service_path, service_method, payload, metadata);
        self.start_registered(message)
    }

    /// Performs a call and decodes the typed reply.
    pub async fn call<A: Pack, R: Unpack + Default>(
        &self,
        service_path: &str,
        service_method: &str,
        args: &A,
        metadata: Metadata,
    ) -> Result<R, RpcError> {
        let handle = self.go(service_path, service_method, args, metadata)?;
        let message = self.await_message(handle).await?;
        decode_reply(message)
    }

    /// Performs a call with a pre-encoded payload and returns the raw
    /// response message. `Error`-status responses surface as errors.
    pub async fn call_raw(
        &self,
        service_path: &str,
        service_method: &str,
        payload: Vec<u8>,
        metadata: Metadata,
    ) -> Result<Message, RpcError> {
        let handle = self.go_raw(service_path, service_method, payload, metadata)?;
        self.await_message(handle).await
    }

    /// Sends a request that expects no response. The frame is written with
    /// the oneway bit set and no pending entry is registered.
    pub fn send_oneway<A: Pack>(
        &self,
        service_path: &str,
        service_method: &str,
        args: &A,
        metadata: Metadata,
    ) -> Result<(), RpcError> {
        let payload = args.pack(self.config.serialize_type)?;
        let mut message = self.request_message(service_path, service_method, payload, metadata);
        message.oneway = true;
        self.start_unregistered(message)
    }

    /// Sends a heartbeat request and awaits the server's empty echo.
    pub async fn heartbeat(&self) -> Result<(), RpcError> {
        let mut message = self.request_message("", "", Vec::new(), Metadata::new());
        message.heartbeat = true;
        let handle = self.start_registered(message)?;
        self.await_message(handle).await.map(|_| ())
    }

    /// True until the client is locally closed or the connection has failed.
    pub fn is_alive(&self) -> bool {
        !self.closing.load(Ordering::SeqCst) && !self.shutdown.load(Ordering::SeqCst)
    }

    /// Closes the client. Every pending call is signalled with
    /// [`RpcError::Shutdown`] before this returns; closing twice is a no-op.
    pub fn close(&self) -> Result<(), RpcError> {
        if self.closing.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let drained: Vec<_> = {
            let mut guard = self.pending.lock().expect("pending lock poisoned");
            guard.drain().collect()
        };
        for (_, tx) in drained {
            let _ = tx.send(Err(RpcError::Shutdown));
        }
        for task in &self.tasks {
            task.abort();
        }
        Ok(())
    }

    fn request_message(
        &self,
        service_path: &str,
        service_method: &str,
        payload: Vec<u8>,
        metadata: Metadata,
    ) -> Message {
        Message {
            message_type: MessageType::Request,
            compress_type: self.config.compress_type,
            serialize_type: self.config.serialize_type,
            service_path: service_path.to_string(),
            service_method: service_method.to_string(),
            metadata,
            payload,
            ..Message::default()
        }
    }

    fn start_registered(&self, mut message: Message) -> Result<CallHandle, RpcError> {
        if !self.is_alive() {
            return Err(RpcError::Shutdown);
        }
        message.seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let frame = message.encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .insert(message.seq, tx);

        if self.writer.send(frame).is_err() {
            self.pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&message.seq);
            return Err(RpcError::Shutdown);
        }

        Ok(CallHandle {
            seq: message.seq,
            rx,
            pending: Arc::downgrade(&self.pending),
        })
    }

    fn start_unregistered(&self, mut message: Message) -> Result<(), RpcError> {
        if !self.is_alive() {
            return Err(RpcError::Shutdown);
        }
        message.seq = self.seq.fetch_add(1, Ordering::SeqCst);
        let frame = message.encode()?;
        self.writer.send(frame).map_err(|_| RpcError::Shutdown)
    }

    async fn await_message(&self, handle: CallHandle) -> Result<Message, RpcError> {
        match self.config.call_timeout {
            Some(limit) => match time::timeout(limit, handle.response()).await {
                Ok(result) => result,
                Err(_) => Err(RpcError::Timeout(limit)),
            },
            None => handle.response().await,
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Handle to one in-flight call.
///
/// Dropping the handle abandons the call: its pending entry is removed and
/// any late response is discarded by the read loop.
#[derive(Debug)]
pub struct CallHandle {
    pub seq: u64,
    rx: oneshot::Receiver<Result<Message, RpcError>>,
    pending: Weak<Mutex<HashMap<u64, oneshot::Sender<Result<Message, RpcError>>>>>,
}

impl CallHandle {
    /// Awaits the raw response message. `Error`-status responses are mapped
    /// back to their symbolic [`RpcError`] kind from the `_kind`/`_error`
    /// metadata.
    pub async fn response(mut self) -> Result<Message, RpcError> {
        match (&mut self.rx).await {
            Ok(Ok(message)) => map_status(message),
            Ok(Err(err)) => Err(err),
            // The sender half only disappears when the client goes away.
            Err(_) => Err(RpcError::Shutdown),
        }
    }

    /// Awaits the response and decodes the typed reply.
    pub async fn recv<R: Unpack + Default>(self) -> Result<R, RpcError> {
        let message = self.response().await?;
        decode_reply(message)
    }
}

impl Drop for CallHandle {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.upgrade() {
            pending
                .lock()
                .expect("pending lock poisoned")
                .remove(&self.seq);
        }
    }
}

pub(crate) fn decode_reply<R: Unpack + Default>(message: Message) -> Result<R, RpcError> {
    let mut reply = R::default();
    reply.unpack(message.serialize_type, &message.payload)?;
    Ok(reply)
}

fn map_status(message: Message) -> Result<Message, RpcError> {
    match message.status {
        MessageStatus::Normal => Ok(message),
        MessageStatus::Error => {
            let kind = message
                .metadata
                .get(ERROR_KIND_KEY)
                .map(String::as_str)
                .unwrap_or("handler");
            let text = message
                .metadata
                .get(ERROR_KEY)
                .cloned()
                .unwrap_or_else(|| "unknown server error".to_string());
            Err(RpcError::from_wire(kind, text))
        }
    }
}

async fn open_transport(
    network: &str,
    address: &str,
    limit: Duration,
) -> Result<(BoxedReader, BoxedWriter), RpcError> {
    let connect_failed = |source: io::Error| RpcError::ConnectFailed {
        address: server_key(network, address),
        source,
    };
    let timed_out =
        || io::Error::new(io::ErrorKind::TimedOut, format!("no connection within {limit:?}"));

    match network {
        "tcp" => {
            let stream = time::timeout(limit, TcpStream::connect(address))
                .await
                .map_err(|_| connect_failed(timed_out()))?
                .map_err(connect_failed)?;
            let _ = stream.set_nodelay(true);
            let (r, w) = stream.into_split();
            Ok((Box::new(r), Box::new(w)))
        }
        "unix" => {
            let stream = time::timeout(limit, UnixStream::connect(address))
                .await
                .map_err(|_| connect_failed(timed_out()))?
                .map_err(connect_failed)?;
            let (r, w) = stream.into_split();
            Ok((Box::new(r), Box::new(w)))
        }
        other => Err(connect_failed(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unknown network `{other}`"),
        ))),
    }
}

async fn writer_task(
    mut writer: BoxedWriter,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    shutdown: Arc<AtomicBool>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(err) = writer.write_all(&frame).await {
            debug!("connection writer exiting: {err}");
            shutdown.store(true, Ordering::SeqCst);
            break;
        }
        let _ = writer.flush().await;
    }
    let _ = writer.shutdown().await;
}

async fn read_loop(mut reader: BoxedReader, pending: Pending, shutdown: Arc<AtomicBool>) {
    let reason = loop {
        match Message::read(&mut reader).await {
            Ok(message) => {
                if message.message_type != MessageType::Response {
                    trace!(seq = message.seq, "dropping non-response frame");
                    continue;
                }
                let sender = pending
                    .lock()
                    .expect("pending lock poisoned")
                    .remove(&message.seq);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(Ok(message));
                    }
                    None => trace!(seq = message.seq, "dropping response with no pending call"),
                }
            }
            Err(err) => break err,
        }
    };

    shutdown.store(true, Ordering::SeqCst);
    let text = reason.to_string();
    debug!("connection reader exiting: {text}");

    let drained: Vec<_> = {
        let mut guard = pending.lock().expect("pending lock poisoned");
        guard.drain().collect()
    };
    for (_, tx) in drained {
        let _ = tx.send(Err(RpcError::Io(io::Error::new(
            io::ErrorKind::BrokenPipe,
            text.clone(),
        ))));
    }
}
