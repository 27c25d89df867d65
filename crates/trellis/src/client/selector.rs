use std::{
    collections::HashMap,
    hash::{DefaultHasher, Hash, Hasher},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use rand::{rngs::StdRng, Rng, SeedableRng};

use super::ping::calculate_weight;

/// Policy for picking one server key out of the live set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SelectMode {
    #[default]
    Random,
    RoundRobin,
    WeightedRoundRobin,
    ConsistentHash,
    /// Geographic selection; the caller position arrives through
    /// [`crate::XClient::set_geo_selector`].
    Closest,
    PingWeighted,
}

/// Picks a server key for one call out of the currently known set.
///
/// `fingerprint` is a stable hash of the encoded call arguments; only the
/// consistent-hash variant consumes it. An empty server set yields `None`.
pub trait Selector: Send + Sync {
    fn select(&self, service_path: &str, service_method: &str, fingerprint: u64) -> Option<String>;

    /// Replaces the server set after a discovery refresh. Values carry the
    /// URL-encoded metadata (`weight`, `latitude`, `longitude`, ...).
    fn update_servers(&mut self, servers: &HashMap<String, String>);
}

pub(crate) fn new_selector(
    mode: SelectMode,
    servers: &HashMap<String, String>,
) -> Box<dyn Selector> {
    match mode {
        SelectMode::Random => Box::new(RandomSelector::new(servers)),
        SelectMode::RoundRobin => Box::new(RoundRobinSelector::new(servers)),
        SelectMode::WeightedRoundRobin => Box::new(WeightedRoundRobinSelector::new(servers)),
        SelectMode::ConsistentHash => Box::new(ConsistentHashSelector::new(servers)),
        SelectMode::Closest => Box::new(GeoSelector::new(servers, 0.0, 0.0)),
        SelectMode::PingWeighted => Box::new(PingWeightedSelector::new(servers)),
    }
}

/// Stable fingerprint of encoded call arguments, used by consistent hashing.
pub(crate) fn fingerprint(bytes: &[u8]) -> u64 {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

fn sorted_keys(servers: &HashMap<String, String>) -> Vec<String> {
    let mut keys: Vec<String> = servers.keys().cloned().collect();
    keys.sort();
    keys
}

/// Reads one numeric field out of a server's URL-encoded metadata value.
fn meta_field<T: std::str::FromStr>(value: &str, field: &str) -> Option<T> {
    url::form_urlencoded::parse(value.as_bytes())
        .find(|(k, _)| k == field)
        .and_then(|(_, v)| v.parse().ok())
}

/// Uniform pick over the current key set.
pub struct RandomSelector {
    servers: Vec<String>,
    rng: Mutex<StdRng>,
}

impl RandomSelector {
    pub fn new(servers: &HashMap<String, String>) -> Self {
        Self {
            servers: sorted_keys(servers),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Seeded variant with a deterministic pick sequence.
    pub fn with_seed(servers: &HashMap<String, String>, seed: u64) -> Self {
        Self {
            servers: sorted_keys(servers),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Selector for RandomSelector {
    fn select(&self, _path: &str, _method: &str, _fingerprint: u64) -> Option<String> {
        if self.servers.is_empty() {
            return None;
        }
        let i = self
            .rng
            .lock()
            .expect("rng lock poisoned")
            .gen_range(0..self.servers.len());
        Some(self.servers[i].clone())
    }

    fn update_servers(&mut self, servers: &HashMap<String, String>) {
        self.servers = sorted_keys(servers);
    }
}

/// Monotonic counter over the sorted key set.
pub struct RoundRobinSelector {
    servers: Vec<String>,
    next: AtomicUsize,
}

impl RoundRobinSelector {
    pub fn new(servers: &HashMap<String, String>) -> Self {
        Self {
            servers: sorted_keys(servers),
            next: AtomicUsize::new(0),
        }
    }
}

impl Selector for RoundRobinSelector {
    fn select(&self, _path: &str, _method: &str, _fingerprint: u64) -> Option<String> {
        if self.servers.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.servers.len();
        Some(self.servers[i].clone())
    }

    fn update_servers(&mut self, servers: &HashMap<String, String>) {
        self.servers = sorted_keys(servers);
    }
}

struct Weighted {
    server: String,
    weight: i64,
    current_weight: i64,
    effective_weight: i64,
}

/// One round of nginx-style smooth weighted round-robin.
fn smooth_pick(items: &mut [Weighted]) -> Option<usize> {
    let mut total = 0;
    let mut best: Option<usize> = None;
    for i in 0..items.len() {
        if items[i].weight <= 0 && items[i].effective_weight <= 0 {
            continue;
        }
        items[i].current_weight += items[i].effective_weight;
        total += items[i].effective_weight;
        if best.map_or(true, |b| items[i].current_weight > items[b].current_weight) {
            best = Some(i);
        }
    }
    let picked = best?;
    items[picked].current_weight -= total;
    Some(picked)
}

/// Smooth weighted round-robin over the `weight` metadata field.
pub struct WeightedRoundRobinSelector {
    state: Mutex<Vec<Weighted>>,
}

impl WeightedRoundRobinSelector {
    pub fn new(servers: &HashMap<String, String>) -> Self {
        Self {
            state: Mutex::new(Self::build(servers)),
        }
    }

    fn build(servers: &HashMap<String, String>) -> Vec<Weighted> {
        let mut items: Vec<Weighted> = servers
            .iter()
            .map(|(key, value)| {
                let weight = meta_field(value, "weight").unwrap_or(1);
                Weighted {
                    server: key.clone(),
                    weight,
                    current_weight: 0,
                    effective_weight: weight,
                }
            })
            .collect();
        items.sort_by(|a, b| a.server.cmp(&b.server));
        items
    }
}

impl Selector for WeightedRoundRobinSelector {
    fn select(&self, _path: &str, _method: &str, _fingerprint: u64) -> Option<String> {
        let mut state = self.state.lock().expect("selector lock poisoned");
        smooth_pick(&mut state).map(|i| state[i].server.clone())
    }

    fn update_servers(&mut self, servers: &HashMap<String, String>) {
        *self.state.lock().expect("selector lock poisoned") = Self::build(servers);
    }
}

/// Hash ring keyed by `(service path, method, argument fingerprint)`.
pub struct ConsistentHashSelector {
    ring: Vec<(u64, String)>,
}

impl ConsistentHashSelector {
    pub fn new(servers: &HashMap<String, String>) -> Self {
        Self {
            ring: Self::build(servers),
        }
    }

    fn build(servers: &HashMap<String, String>) -> Vec<(u64, String)> {
        let mut ring: Vec<(u64, String)> = servers
            .keys()
            .map(|key| (fingerprint(key.as_bytes()), key.clone()))
            .collect();
        // Lexicographic key order breaks hash-point ties.
        ring.sort();
        ring
    }
}

impl Selector for ConsistentHashSelector {
    fn select(&self, path: &str, method: &str, fp: u64) -> Option<String> {
        if self.ring.is_empty() {
            return None;
        }
        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);
        method.hash(&mut hasher);
        fp.hash(&mut hasher);
        let point = hasher.finish();

        let i = self.ring.partition_point(|(h, _)| *h < point);
        let (_, key) = &self.ring[i % self.ring.len()];
        Some(key.clone())
    }

    fn update_servers(&mut self, servers: &HashMap<String, String>) {
        self.ring = Self::build(servers);
    }
}

/// Nearest server by great-circle distance from the caller.
pub struct GeoSelector {
    servers: Vec<(String, f64, f64)>,
    latitude: f64,
    longitude: f64,
}

impl GeoSelector {
    pub fn new(servers: &HashMap<String, String>, latitude: f64, longitude: f64) -> Self {
        Self {
            servers: Self::build(servers),
            latitude,
            longitude,
        }
    }

    fn build(servers: &HashMap<String, String>) -> Vec<(String, f64, f64)> {
        let mut located: Vec<(String, f64, f64)> = servers
            .iter()
            .filter_map(|(key, value)| {
                let lat = meta_field(value, "latitude")?;
                let lon = meta_field(value, "longitude")?;
                Some((key.clone(), lat, lon))
            })
            .collect();
        located.sort_by(|a, b| a.0.cmp(&b.0));
        located
    }
}

/// Great-circle distance in kilometres between two coordinates.
fn great_circle(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let (lat1, lon1) = (lat1.to_radians(), lon1.to_radians());
    let (lat2, lon2) = (lat2.to_radians(), lon2.to_radians());
    let dlat = lat2 - lat1;
    let dlon = lon2 - lon1;
    let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

impl Selector for GeoSelector {
    fn select(&self, _path: &str, _method: &str, _fingerprint: u64) -> Option<String> {
        self.servers
            .iter()
            .map(|(key, lat, lon)| {
                (
                    key,
                    great_circle(self.latitude, self.longitude, *lat, *lon),
                )
            })
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(key, _)| key.clone())
    }

    fn update_servers(&mut self, servers: &HashMap<String, String>) {
        self.servers = Self::build(servers);
    }
}

/// Smooth weighted round-robin with weights derived from round-trip times.
///
/// RTT samples are supplied by the caller; probing the network is outside
/// this crate. A server without a sample counts as timed out (1000 ms),
/// which maps to weight 0 and disqualifies it until a sample arrives.
pub struct PingWeightedSelector {
    state: Mutex<Vec<Weighted>>,
    rtts: HashMap<String, i64>,
}

/// RTT assumed for servers that have never been probed.
const DEFAULT_RTT_MS: i64 = 1000;

impl PingWeightedSelector {
    pub fn new(servers: &HashMap<String, String>) -> Self {
        let mut selector = Self {
            state: Mutex::new(Vec::new()),
            rtts: HashMap::new(),
        };
        selector.update_servers(servers);
        selector
    }

    /// Records an RTT sample for `server` and recomputes its weight.
    pub fn set_rtt(&mut self, server: &str, rtt_ms: i64) {
        self.rtts.insert(server.to_string(), rtt_ms);
        let mut state = self.state.lock().expect("selector lock poisoned");
        for item in state.iter_mut() {
            if item.server == server {
                let weight = calculate_weight(rtt_ms);
                item.weight = weight;
                item.effective_weight = weight;
            }
        }
    }
}

impl Selector for PingWeightedSelector {
    fn select(&self, _path: &str, _method: &str, _fingerprint: u64) -> Option<String> {
        let mut state = self.state.lock().expect("selector lock poisoned");
        smooth_pick(&mut state).map(|i| state[i].server.clone())
    }

    fn update_servers(&mut self, servers: &HashMap<String, String>) {
        let mut items: Vec<Weighted> = servers
            .keys()
            .map(|key| {
                let rtt = self.rtts.get(key).copied().unwrap_or(DEFAULT_RTT_MS);
                let weight = calculate_weight(rtt);
                Weighted {
                    server: key.clone(),
                    weight,
                    current_weight: 0,
                    effective_weight: weight,
                }
            })
            .collect();
        items.sort_by(|a, b| a.server.cmp(&b.server));
        *self.state.lock().expect("selector lock poisoned") = items;
    }
}
