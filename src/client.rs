//! Per-peer registry records and the registry itself. The registry is a
//! plain data structure; `Network` owns one instance behind its state
//! lock, so every method here runs under that single lock.

use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

use crate::types::{parse_groups, DeviceInfo, InstanceId, Role};

pub fn current_timestamp_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Everything known about one remote node. Mutated by announce-reply
/// processing, list-transaction completion, and explicit address/patch
/// pushes; removed from the live set on Leave but kept in the cached
/// list so per-client settings survive restarts of either side.
#[derive(Clone, Debug)]
pub struct Client {
    pub instance: InstanceId,
    pub role: Role,
    pub features: u32,
    pub hostname: String,
    /// Last socket address the node was seen from. Runtime-only; the
    /// persisted record keeps the IP.
    pub addr: Option<SocketAddr>,
    pub addressing: String,
    pub last_seen: u64,
    pub last_announce: u64,
    pub devices: HashMap<u32, DeviceInfo>,
    pub patches: HashMap<u32, u32>,
}

impl Client {
    fn new(instance: InstanceId, hostname: String) -> Self {
        let now = current_timestamp_ms();
        Self {
            instance,
            role: Role::None,
            features: 0,
            hostname,
            addr: None,
            addressing: String::new(),
            last_seen: now,
            last_announce: now,
            devices: HashMap::new(),
            patches: HashMap::new(),
        }
    }
}

/// Serialized form of a client record as embedded in the show document.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PersistedClient {
    pub instance: InstanceId,
    pub role: Role,
    pub hostname: String,
    pub ip: Option<IpAddr>,
    pub addressing: String,
    pub last_seen: u64,
    pub devices: Vec<(u32, DeviceInfo)>,
    pub patches: Vec<(u32, u32)>,
}

impl From<&Client> for PersistedClient {
    fn from(c: &Client) -> Self {
        let mut devices: Vec<_> = c.devices.iter().map(|(k, v)| (*k, v.clone())).collect();
        devices.sort_by_key(|(k, _)| *k);
        let mut patches: Vec<_> = c.patches.iter().map(|(k, v)| (*k, *v)).collect();
        patches.sort_by_key(|(k, _)| *k);
        Self {
            instance: c.instance,
            role: c.role,
            hostname: c.hostname.clone(),
            ip: c.addr.map(|a| a.ip()),
            addressing: c.addressing.clone(),
            last_seen: c.last_seen,
            devices,
            patches,
        }
    }
}

impl From<PersistedClient> for Client {
    fn from(p: PersistedClient) -> Self {
        Self {
            instance: p.instance,
            role: p.role,
            features: 0,
            hostname: p.hostname,
            addr: p.ip.map(|ip| SocketAddr::new(ip, 0)),
            addressing: p.addressing,
            last_seen: p.last_seen,
            last_announce: 0,
            devices: p.devices.into_iter().collect(),
            patches: p.patches.into_iter().collect(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    live: HashMap<InstanceId, Client>,
    /// Records of nodes not currently live. Seeded from the show
    /// document on load; consulted by hostname when a new instance id
    /// shows up, so a restarted node gets its old settings back.
    cached: Vec<Client>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process one announce-reply sighting. Returns `true` when this is
    /// the first sighting of the instance (the caller issues the
    /// device/patch pulls exactly then, never on later heartbeats).
    pub fn observe_reply(
        &mut self,
        instance: InstanceId,
        addr: Option<SocketAddr>,
        role: Role,
        features: u32,
        addressing: &str,
        hostname: &str,
    ) -> bool {
        let now = current_timestamp_ms();
        if let Some(client) = self.live.get_mut(&instance) {
            client.role = role;
            client.features = features;
            client.addressing = addressing.to_owned();
            client.addr = addr.or(client.addr);
            client.last_seen = now;
            client.last_announce = now;
            return false;
        }

        // New instance id: recover the historical record for the same
        // hostname if one exists, so addressing and patches carry over.
        let mut client = match self.cached.iter().position(|c| c.hostname == hostname) {
            Some(idx) => {
                let mut recovered = self.cached.swap_remove(idx);
                recovered.instance = instance;
                recovered
            }
            None => Client::new(instance, hostname.to_owned()),
        };
        client.role = role;
        client.features = features;
        client.addressing = addressing.to_owned();
        client.addr = addr;
        client.last_seen = now;
        client.last_announce = now;
        self.live.insert(instance, client);
        true
    }

    /// Explicit leave: drop from the live set but keep the record
    /// cached so its configuration survives.
    pub fn remove_on_leave(&mut self, instance: InstanceId) -> bool {
        match self.live.remove(&instance) {
            Some(client) => {
                self.cached.push(client);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, instance: InstanceId) -> Option<&Client> {
        self.live.get(&instance)
    }

    pub fn get_mut(&mut self, instance: InstanceId) -> Option<&mut Client> {
        self.live.get_mut(&instance)
    }

    pub fn contains(&self, instance: InstanceId) -> bool {
        self.live.contains_key(&instance)
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn live_clients(&self) -> impl Iterator<Item = &Client> {
        self.live.values()
    }

    /// Union of every live client's addressing filter. A local
    /// best-effort view, not a network-wide guarantee.
    pub fn present_groups(&self) -> BTreeSet<u16> {
        let mut groups = BTreeSet::new();
        for client in self.live.values() {
            groups.extend(parse_groups(&client.addressing));
        }
        groups
    }

    /// Atomically replace a client's device map. Used by list-devices
    /// transaction completion; readers never see a partial merge.
    pub fn swap_devices(&mut self, instance: InstanceId, devices: HashMap<u32, DeviceInfo>) -> bool {
        match self.live.get_mut(&instance) {
            Some(client) => {
                client.devices = devices;
                true
            }
            None => false,
        }
    }

    pub fn swap_patches(&mut self, instance: InstanceId, patches: HashMap<u32, u32>) -> bool {
        match self.live.get_mut(&instance) {
            Some(client) => {
                client.patches = patches;
                true
            }
            None => false,
        }
    }

    pub fn export(&self) -> Vec<PersistedClient> {
        let mut records: Vec<PersistedClient> = self.live.values().map(Into::into).collect();
        records.extend(self.cached.iter().map(Into::into));
        records.sort_by_key(|r| r.instance);
        records
    }

    /// Seed the cached list from persisted records. Live clients are
    /// untouched; a record whose hostname is already live is skipped so
    /// imports never duplicate a node.
    pub fn import(&mut self, records: Vec<PersistedClient>) {
        for record in records {
            let hostname = &record.hostname;
            let live_hit = self.live.values().any(|c| &c.hostname == hostname);
            let cached_hit = self.cached.iter().any(|c| &c.hostname == hostname);
            if !live_hit && !cached_hit {
                self.cached.push(record.into());
            }
        }
    }
}
