use std::sync::Mutex;

use tokio::sync::mpsc;

/// One discovered server: key is the `network@address` form, value is a
/// URL-encoded metadata query string (`weight`, `latitude`, `longitude`,
/// `tps`, ...). Unknown metadata keys pass through refreshes unchanged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: String,
}

impl KvPair {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Source of the live server set.
///
/// Implementations produce the current snapshot and, optionally, a stream of
/// future snapshots. Every snapshot fully replaces the server set.
pub trait Discovery: Send + Sync {
    fn services(&self) -> Vec<KvPair>;

    /// Subscribes to future snapshots; `None` if the source is fixed.
    fn watch(&self) -> Option<mpsc::UnboundedReceiver<Vec<KvPair>>>;
}

/// A discovery over a caller-controlled server list.
///
/// [`StaticDiscovery::update`] replaces the list and pushes the new snapshot
/// to every subscribed watcher, which is all a registry plugin needs to feed
/// an [`crate::XClient`].
#[derive(Default)]
pub struct StaticDiscovery {
    pairs: Mutex<Vec<KvPair>>,
    watchers: Mutex<Vec<mpsc::UnboundedSender<Vec<KvPair>>>>,
}

impl StaticDiscovery {
    pub fn new(pairs: Vec<KvPair>) -> Self {
        Self {
            pairs: Mutex::new(pairs),
            watchers: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the server list and notifies watchers.
    pub fn update(&self, pairs: Vec<KvPair>) {
        *self.pairs.lock().expect("pairs lock poisoned") = pairs.clone();
        self.watchers
            .lock()
            .expect("watchers lock poisoned")
            .retain(|tx| tx.send(pairs.clone()).is_ok());
    }
}

impl Discovery for StaticDiscovery {
    fn services(&self) -> Vec<KvPair> {
        self.pairs.lock().expect("pairs lock poisoned").clone()
    }

    fn watch(&self) -> Option<mpsc::UnboundedReceiver<Vec<KvPair>>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.watchers
            .lock()
            .expect("watchers lock poisoned")
            .push(tx);
        Some(rx)
    }
}
