use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, RwLock,
    },
};

use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt},
    net::{TcpListener, UnixListener},
    sync::{mpsc, Notify},
};
use tracing::{debug, trace, warn};

use crate::{
    compress::CompressType,
    error::RpcError,
    plugin::PluginContainer,
    protocol::{Message, MessageStatus, MessageType},
    share::{Metadata, AUTH_KEY, ERROR_KEY, ERROR_KIND_KEY},
};

mod service;

pub use service::Service;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Validates the `_auth` metadata token of every request before dispatch.
pub type AuthFn = Arc<dyn Fn(Option<&str>) -> Result<(), RpcError> + Send + Sync>;

/// Server-side configuration.
#[derive(Clone, Debug, Default)]
pub struct ServerConfig {
    /// Compression applied to outgoing responses.
    pub compress_type: CompressType,
}

struct ServerInner {
    services: RwLock<HashMap<String, Service>>,
    config: ServerConfig,
    plugins: RwLock<PluginContainer>,
    auth_fn: RwLock<Option<AuthFn>>,
    shutdown: AtomicBool,
    shutdown_notify: Notify,
    local_addr: Mutex<Option<SocketAddr>>,
}

/// An RPC server hosting registered services over TCP or unix sockets.
///
/// Each accepted connection gets a reader task and a writer task; every
/// request is dispatched on its own task so a slow handler never blocks the
/// connection. Responses preserve the request's sequence number and
/// serialize type.
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Server {
        Server::with_config(ServerConfig::default())
    }

    pub fn with_config(config: ServerConfig) -> Server {
        Server {
            inner: Arc::new(ServerInner {
                services: RwLock::new(HashMap::new()),
                config,
                plugins: RwLock::new(PluginContainer::default()),
                auth_fn: RwLock::new(None),
                shutdown: AtomicBool::new(false),
                shutdown_notify: Notify::new(),
                local_addr: Mutex::new(None),
            }),
        }
    }

    /// Registers a service. Intended to run before [`Server::serve`];
    /// services registered later are visible to new requests but racing
    /// registration against live traffic is not supported.
    pub fn register(&self, service: Service) {
        self.inner
            .services
            .write()
            .expect("services lock poisoned")
            .insert(service.path().to_string(), service);
    }

    /// Installs a token check run against the `_auth` metadata of every
    /// request. Rejected requests get an `Error` response and are not
    /// dispatched.
    pub fn set_auth<F>(&self, auth: F)
    where
        F: Fn(Option<&str>) -> Result<(), RpcError> + Send + Sync + 'static,
    {
        *self.inner.auth_fn.write().expect("auth lock poisoned") = Some(Arc::new(auth));
    }

    /// Replaces the server-side plugin chain.
    pub fn set_plugins(&self, plugins: PluginContainer) {
        *self.inner.plugins.write().expect("plugins lock poisoned") = plugins;
    }

    /// Address actually bound by [`Server::serve`]; useful with port 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock().expect("addr lock poisoned")
    }

    /// Accepts connections on `network`/`address` until [`Server::close`].
    pub async fn serve(&self, network: &str, address: &str) -> Result<(), RpcError> {
        let listener = match network {
            "tcp" => {
                let listener = TcpListener::bind(address).await?;
                *self.inner.local_addr.lock().expect("addr lock poisoned") =
                    Some(listener.local_addr()?);
                AnyListener::Tcp(listener)
            }
            "unix" => AnyListener::Unix(UnixListener::bind(address)?),
            other => {
                return Err(RpcError::Io(io::Error::new(
                    io::ErrorKind::Unsupported,
                    format!("unknown network `{other}`"),
                )))
            }
        };

        loop {
            if self.inner.shutdown.load(Ordering::SeqCst) {
                break;
            }
            tokio::select! {
                _ = self.inner.shutdown_notify.notified() => break,
                accepted = listener.accept() => match accepted {
                    Ok((reader, writer, peer)) => {
                        let plugins = self
                            .inner
                            .plugins
                            .read()
                            .expect("plugins lock poisoned")
                            .clone();
                        if let Err(err) = plugins.post_accept(&peer) {
                            warn!(%peer, "connection rejected by plugin: {err}");
                            continue;
                        }
                        tokio::spawn(handle_connection(
                            Arc::clone(&self.inner),
                            reader,
                            writer,
                            peer,
                        ));
                    }
                    Err(err) => warn!("accept failed: {err}"),
                },
            }
        }
        Ok(())
    }

    /// Stops the accept loop. Established connections drain on their own.
    pub fn close(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner.shutdown_notify.notify_waiters();
    }
}

enum AnyListener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl AnyListener {
    async fn accept(&self) -> io::Result<(BoxedReader, BoxedWriter, String)> {
        match self {
            AnyListener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                let _ = stream.set_nodelay(true);
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w), peer.to_string()))
            }
            AnyListener::Unix(listener) => {
                let (stream, peer) = listener.accept().await?;
                let (r, w) = stream.into_split();
                Ok((Box::new(r), Box::new(w), format!("{peer:?}")))
            }
        }
    }
}

async fn handle_connection(
    inner: Arc<ServerInner>,
    mut reader: BoxedReader,
    writer: BoxedWriter,
    peer: String,
) {
    let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    // The writer drains on its own once every response sender is gone.
    tokio::spawn(write_frames(writer, rx));

    loop {
        let message = match Message::read(&mut reader).await {
            Ok(message) => message,
            // Malformed frames and IO failures both end the connection.
            Err(err) => {
                debug!(%peer, "connection closed: {err}");
                break;
            }
        };
        if message.message_type != MessageType::Request {
            trace!(%peer, seq = message.seq, "dropping non-request frame");
            continue;
        }

        let plugins = inner
            .plugins
            .read()
            .expect("plugins lock poisoned")
            .clone();
        if let Err(err) = plugins.post_read_request(&message) {
            let response = error_response(&message, &err, inner.config.compress_type);
            send_response(&plugins, &tx, response);
            continue;
        }

        // Heartbeats are echoed immediately with an empty body.
        if message.heartbeat {
            let mut echo = response_skeleton(&message, inner.config.compress_type);
            echo.heartbeat = true;
            send_response(&plugins, &tx, echo);
            continue;
        }

        tokio::spawn(dispatch(Arc::clone(&inner), message, tx.clone()));
    }
}

async fn dispatch(inner: Arc<ServerInner>, message: Message, tx: mpsc::UnboundedSender<Vec<u8>>) {
    let oneway = message.oneway;
    let response = execute(&inner, message).await;
    if oneway {
        return;
    }
    let plugins = inner
        .plugins
        .read()
        .expect("plugins lock poisoned")
        .clone();
    send_response(&plugins, &tx, response);
}

async fn execute(inner: &Arc<ServerInner>, mut message: Message) -> Message {
    let compress = inner.config.compress_type;

    let auth_fn = inner.auth_fn.read().expect("auth lock poisoned").clone();
    if let Some(auth_fn) = auth_fn {
        let token = message.metadata.get(AUTH_KEY).map(String::as_str);
        if let Err(err) = auth_fn(token) {
            return error_response(&message, &err, compress);
        }
    }

    let handler = {
        let services = inner.services.read().expect("services lock poisoned");
        let Some(service) = services.get(&message.service_path) else {
            let err = RpcError::ServiceNotFound(message.service_path.clone());
            return error_response(&message, &err, compress);
        };
        match service.handler(&message.service_method) {
            Some(handler) => handler,
            None => {
                let err = RpcError::MethodNotFound(format!(
                    "{}.{}",
                    message.service_path, message.service_method
                ));
                return error_response(&message, &err, compress);
            }
        }
    };

    let payload = std::mem::take(&mut message.payload);
    let metadata: Metadata = message.metadata.clone();
    match handler(message.serialize_type, payload, metadata).await {
        Ok(reply) => {
            let mut response = response_skeleton(&message, compress);
            response.payload = reply;
            response
        }
        Err(err) => error_response(&message, &err, compress),
    }
}

fn send_response(plugins: &PluginContainer, tx: &mpsc::UnboundedSender<Vec<u8>>, response: Message) {
    if let Err(err) = plugins.pre_write_response(&response) {
        warn!(seq = response.seq, "response suppressed by plugin: {err}");
        return;
    }
    match response.encode() {
        Ok(frame) => {
            let _ = tx.send(frame);
        }
        Err(err) => warn!(seq = response.seq, "failed to encode response: {err}"),
    }
}

fn response_skeleton(request: &Message, compress: CompressType) -> Message {
    Message {
        message_type: MessageType::Response,
        compress_type: compress,
        status: MessageStatus::Normal,
        serialize_type: request.serialize_type,
        seq: request.seq,
        ..Message::default()
    }
}

fn error_response(request: &Message, err: &RpcError, compress: CompressType) -> Message {
    let mut response = response_skeleton(request, compress);
    response.status = MessageStatus::Error;
    response
        .metadata
        .insert(ERROR_KIND_KEY.to_string(), err.kind().to_string());
    response
        .metadata
        .insert(ERROR_KEY.to_string(), err.to_string());
    response
}

async fn write_frames(mut writer: BoxedWriter, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) {
    while let Some(frame) = rx.recv().await {
        if let Err(err) = writer.write_all(&frame).await {
            debug!("connection writer exiting: {err}");
            break;
        }
        let _ = writer.flush().await;
    }
    let _ = writer.shutdown().await;
}
