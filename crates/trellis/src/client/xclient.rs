use std::{
    collections::HashMap,
    io,
    sync::{atomic::AtomicBool, atomic::Ordering, Arc, RwLock},
    time::Duration,
};

use tokio::{
    task::{JoinHandle, JoinSet},
    time::{self, Instant},
};
use tracing::{debug, warn};

use super::{
    decode_reply,
    selector::{self, new_selector, SelectMode, Selector},
    CallHandle, Client, ClientConfig, Discovery, GeoSelector,
};
use crate::{
    codec::{Pack, Unpack},
    error::{MultiError, RpcError},
    plugin::PluginContainer,
    protocol::Message,
    share::{split_network_and_address, Metadata, AUTH_KEY},
};

/// Retry policy applied by [`XClient::call`] when an attempt fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FailMode {
    /// One attempt; the error is returned as-is.
    #[default]
    Failfast,
    /// Retry against the same server, re-fetching its cached connection.
    Failtry,
    /// Retry with a fresh server selection on every attempt.
    Failover,
}

/// Ceiling applied to `broadcast` and `fork` regardless of call timeouts.
const FANOUT_CEILING: Duration = Duration::from_secs(60);

struct Inner {
    service_path: String,
    service_method: String,
    fail_mode: FailMode,
    select_mode: SelectMode,
    config: ClientConfig,
    servers: RwLock<HashMap<String, String>>,
    selector: RwLock<Box<dyn Selector>>,
    cached: tokio::sync::RwLock<HashMap<String, Arc<Client>>>,
    auth: RwLock<Option<String>>,
    plugins: RwLock<PluginContainer>,
    is_shutdown: AtomicBool,
}

/// A smart client for one `(service path, method)` pair.
///
/// Layers service discovery, server selection, per-endpoint connection
/// caching, retry/failover and fan-out calls over [`Client`]. Connections
/// are established lazily and reused until they die or their server leaves
/// the discovered set.
///
/// Must be created inside a Tokio runtime; construction spawns the
/// discovery-watch task.
pub struct XClient {
    inner: Arc<Inner>,
    watch_task: Option<JoinHandle<()>>,
}

impl XClient {
    pub fn new(
        service_path: impl Into<String>,
        service_method: impl Into<String>,
        fail_mode: FailMode,
        select_mode: SelectMode,
        discovery: &dyn Discovery,
        config: ClientConfig,
    ) -> XClient {
        let servers: HashMap<String, String> = discovery
            .services()
            .into_iter()
            .map(|pair| (pair.key, pair.value))
            .collect();
        let selector = new_selector(select_mode, &servers);

        let inner = Arc::new(Inner {
            service_path: service_path.into(),
            service_method: service_method.into(),
            fail_mode,
            select_mode,
            config,
            servers: RwLock::new(servers),
            selector: RwLock::new(selector),
            cached: tokio::sync::RwLock::new(HashMap::new()),
            auth: RwLock::new(None),
            plugins: RwLock::new(PluginContainer::default()),
            is_shutdown: AtomicBool::new(false),
        });

        let watch_task = discovery
            .watch()
            .map(|rx| tokio::spawn(watch(Arc::clone(&inner), rx)));

        XClient { inner, watch_task }
    }

    /// Sets the bearer token injected into every call's metadata under
    /// `_auth`.
    pub fn auth(&self, token: impl Into<String>) {
        *self.inner.auth.write().expect("auth lock poisoned") = Some(token.into());
    }

    /// Replaces the plugin chain run around every call.
    pub fn set_plugins(&self, plugins: PluginContainer) {
        *self.inner.plugins.write().expect("plugins lock poisoned") = plugins;
    }

    /// Switches selection to nearest-server using the caller's position.
    pub fn set_geo_selector(&self, latitude: f64, longitude: f64) {
        let servers = self
            .inner
            .servers
            .read()
            .expect("servers lock poisoned")
            .clone();
        *self.inner.selector.write().expect("selector lock poisoned") =
            Box::new(GeoSelector::new(&servers, latitude, longitude));
    }

    /// Starts an asynchronous call against one selected server.
    pub async fn go<A: Pack>(
        &self,
        args: &A,
        metadata: Metadata,
    ) -> Result<CallHandle, RpcError> {
        self.ensure_alive()?;
        let metadata = self.with_auth(metadata);
        let payload = args.pack(self.inner.config.serialize_type)?;
        let key = self.select_key(selector::fingerprint(&payload))?;
        let client = self.get_cached_client(&key).await?;
        client.go_raw(
            &self.inner.service_path,
            &self.inner.service_method,
            payload,
            metadata,
        )
    }

    /// Calls one server, retrying per the configured [`FailMode`].
    pub async fn call<A: Pack, R: Unpack + Default>(
        &self,
        args: &A,
        metadata: Metadata,
    ) -> Result<R, RpcError> {
        self.ensure_alive()?;
        let metadata = self.with_auth(metadata);
        let payload = args.pack(self.inner.config.serialize_type)?;
        let fp = selector::fingerprint(&payload);

        // Selection failures are never retried; connect and call failures
        // below consume attempts per the fail mode.
        let key = self.select_key(fp)?;
        let attempts = self.inner.config.retries.max(1);

        let mut result = match self.get_cached_client(&key).await {
            Ok(client) => self.attempt(&client, &payload, &metadata).await,
            Err(err) => Err(err),
        };
        match self.inner.fail_mode {
            FailMode::Failfast => {}
            FailMode::Failtry => {
                for _ in 1..attempts {
                    if result.is_ok() {
                        break;
                    }
                    result = match self.get_cached_client(&key).await {
                        Ok(client) => self.attempt(&client, &payload, &metadata).await,
                        Err(err) => Err(err),
                    };
                }
            }
            FailMode::Failover => {
                for _ in 1..attempts {
                    if result.is_ok() {
                        break;
                    }
                    let key = self.select_key(fp)?;
                    result = match self.get_cached_client(&key).await {
                        Ok(client) => self.attempt(&client, &payload, &metadata).await,
                        Err(err) => Err(err),
                    };
                }
            }
        }
        decode_reply(result?)
    }

    /// Sends the same request to every known server; succeeds only if all of
    /// them do. The first observed failure aborts the remaining branches and
    /// is returned. Bounded by a one-minute ceiling.
    pub async fn broadcast<A: Pack, R: Unpack + Default>(
        &self,
        args: &A,
        metadata: Metadata,
    ) -> Result<R, RpcError> {
        self.ensure_alive()?;
        let metadata = self.with_auth(metadata);
        let payload = args.pack(self.inner.config.serialize_type)?;

        let mut set = self.spawn_branches(payload, metadata).await?;
        let deadline = Instant::now() + FANOUT_CEILING;
        // One reply slot, overwritten as successes land; which server's
        // reply survives is unspecified.
        let mut reply: Option<Message> = None;

        loop {
            match time::timeout_at(deadline, set.join_next()).await {
                Err(_) => {
                    set.abort_all();
                    return Err(RpcError::Timeout(FANOUT_CEILING));
                }
                Ok(None) => break,
                Ok(Some(Ok(Ok(message)))) => reply = Some(message),
                Ok(Some(Ok(Err(err)))) => {
                    set.abort_all();
                    return Err(err);
                }
                Ok(Some(Err(err))) => {
                    set.abort_all();
                    return Err(branch_panic(err));
                }
            }
        }

        match reply {
            Some(message) => decode_reply(message),
            None => Err(RpcError::NoServer),
        }
    }

    /// Sends the same request to every known server; the first success wins
    /// and the losing branches are abandoned. If no branch succeeds, the
    /// last observed error is returned. Bounded by a one-minute ceiling.
    pub async fn fork<A: Pack, R: Unpack + Default>(
        &self,
        args: &A,
        metadata: Metadata,
    ) -> Result<R, RpcError> {
        self.ensure_alive()?;
        let metadata = self.with_auth(metadata);
        let payload = args.pack(self.inner.config.serialize_type)?;

        let mut set = self.spawn_branches(payload, metadata).await?;
        let deadline = Instant::now() + FANOUT_CEILING;
        let mut last_err: Option<RpcError> = None;

        loop {
            match time::timeout_at(deadline, set.join_next()).await {
                Err(_) => {
                    set.abort_all();
                    return Err(last_err.unwrap_or(RpcError::Timeout(FANOUT_CEILING)));
                }
                Ok(None) => return Err(last_err.unwrap_or(RpcError::NoServer)),
                Ok(Some(Ok(Ok(message)))) => match decode_reply(message) {
                    Ok(reply) => {
                        set.abort_all();
                        return Ok(reply);
                    }
                    Err(err) => last_err = Some(err),
                },
                Ok(Some(Ok(Err(err)))) => last_err = Some(err),
                Ok(Some(Err(err))) => last_err = Some(branch_panic(err)),
            }
        }
    }

    /// Server keys with a live cached connection, for observability.
    pub async fn cached_endpoints(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.cached.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Closes every cached connection and stops the discovery subscription.
    /// Close failures are aggregated into [`MultiError`].
    pub async fn close(&self) -> Result<(), RpcError> {
        self.inner.is_shutdown.store(true, Ordering::SeqCst);
        if let Some(watch) = &self.watch_task {
            watch.abort();
        }

        let drained: Vec<(String, Arc<Client>)> =
            self.inner.cached.write().await.drain().collect();
        let mut errors = Vec::new();
        for (_, client) in drained {
            if let Err(err) = client.close() {
                errors.push(err);
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(MultiError::new(errors).into())
        }
    }

    fn ensure_alive(&self) -> Result<(), RpcError> {
        if self.inner.is_shutdown.load(Ordering::SeqCst) {
            Err(RpcError::Shutdown)
        } else {
            Ok(())
        }
    }

    fn with_auth(&self, mut metadata: Metadata) -> Metadata {
        if let Some(token) = self
            .inner
            .auth
            .read()
            .expect("auth lock poisoned")
            .as_ref()
        {
            metadata.insert(AUTH_KEY.to_string(), token.clone());
        }
        metadata
    }

    fn select_key(&self, fingerprint: u64) -> Result<String, RpcError> {
        self.inner
            .selector
            .read()
            .expect("selector lock poisoned")
            .select(
                &self.inner.service_path,
                &self.inner.service_method,
                fingerprint,
            )
            .ok_or(RpcError::NoServer)
    }

    /// Returns a live cached connection for `key`, dialing one if the cache
    /// has none or only a dead one. Double-checked so concurrent callers
    /// share a single dial; a failed dial leaves no cache entry behind.
    async fn get_cached_client(&self, key: &str) -> Result<Arc<Client>, RpcError> {
        {
            let cache = self.inner.cached.read().await;
            if let Some(client) = cache.get(key) {
                if client.is_alive() {
                    return Ok(Arc::clone(client));
                }
            }
        }

        let mut cache = self.inner.cached.write().await;
        if let Some(client) = cache.get(key) {
            if client.is_alive() {
                return Ok(Arc::clone(client));
            }
        }
        let (network, address) = split_network_and_address(key);
        let client = Arc::new(Client::connect(network, address, self.inner.config.clone()).await?);
        cache.insert(key.to_string(), Arc::clone(&client));
        Ok(client)
    }

    async fn attempt(
        &self,
        client: &Arc<Client>,
        payload: &[u8],
        metadata: &Metadata,
    ) -> Result<Message, RpcError> {
        let plugins = self
            .inner
            .plugins
            .read()
            .expect("plugins lock poisoned")
            .clone();
        dispatch_call(
            plugins,
            Arc::clone(client),
            self.inner.service_path.clone(),
            self.inner.service_method.clone(),
            payload.to_vec(),
            metadata.clone(),
        )
        .await
    }

    /// Spawns one call task per known server for `broadcast`/`fork`.
    async fn spawn_branches(
        &self,
        payload: Vec<u8>,
        metadata: Metadata,
    ) -> Result<JoinSet<Result<Message, RpcError>>, RpcError> {
        let keys: Vec<String> = {
            let servers = self.inner.servers.read().expect("servers lock poisoned");
            servers.keys().cloned().collect()
        };
        if keys.is_empty() {
            return Err(RpcError::NoServer);
        }

        let mut clients = Vec::with_capacity(keys.len());
        for key in &keys {
            clients.push(self.get_cached_client(key).await?);
        }

        let plugins = self
            .inner
            .plugins
            .read()
            .expect("plugins lock poisoned")
            .clone();
        let mut set = JoinSet::new();
        for client in clients {
            set.spawn(dispatch_call(
                plugins.clone(),
                client,
                self.inner.service_path.clone(),
                self.inner.service_method.clone(),
                payload.clone(),
                metadata.clone(),
            ));
        }
        Ok(set)
    }
}

impl Drop for XClient {
    fn drop(&mut self) {
        if let Some(watch) = &self.watch_task {
            watch.abort();
        }
    }
}

/// One attempt against one server, wrapped in the plugin chain.
async fn dispatch_call(
    plugins: PluginContainer,
    client: Arc<Client>,
    service_path: String,
    service_method: String,
    payload: Vec<u8>,
    mut metadata: Metadata,
) -> Result<Message, RpcError> {
    plugins.pre_call(&service_path, &service_method, &mut metadata)?;
    let result = client
        .call_raw(&service_path, &service_method, payload, metadata.clone())
        .await;
    plugins.post_call(
        &service_path,
        &service_method,
        &metadata,
        result.as_ref().err(),
    );
    result
}

fn branch_panic(err: tokio::task::JoinError) -> RpcError {
    RpcError::Io(io::Error::other(format!("fan-out branch failed: {err}")))
}

/// Applies each discovery snapshot: replaces the server set, refreshes the
/// selector, and evicts cached connections whose server disappeared.
async fn watch(
    inner: Arc<Inner>,
    mut rx: tokio::sync::mpsc::UnboundedReceiver<Vec<super::KvPair>>,
) {
    while let Some(pairs) = rx.recv().await {
        let servers: HashMap<String, String> = pairs
            .into_iter()
            .map(|pair| (pair.key, pair.value))
            .collect();
        debug!(count = servers.len(), "discovery refresh");

        *inner.servers.write().expect("servers lock poisoned") = servers.clone();
        if inner.select_mode != SelectMode::Closest {
            inner
                .selector
                .write()
                .expect("selector lock poisoned")
                .update_servers(&servers);
        }

        let stale: Vec<(String, Arc<Client>)> = {
            let mut cache = inner.cached.write().await;
            let gone: Vec<String> = cache
                .keys()
                .filter(|key| !servers.contains_key(*key))
                .cloned()
                .collect();
            gone.into_iter()
                .filter_map(|key| cache.remove(&key).map(|client| (key, client)))
                .collect()
        };
        for (key, client) in stale {
            debug!(%key, "closing connection evicted by discovery");
            if let Err(err) = client.close() {
                warn!(%key, "error closing evicted connection: {err}");
            }
        }
    }
}
