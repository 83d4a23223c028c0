//! Request/reply correlation. A `Transaction` is created by the
//! initiator with a timeout, registered with the transport, fed every
//! inbound packet whose header carries its id, and evicted by the
//! periodic cleanup pass once expired. Subtypes may declare themselves
//! done early; eviction of a done transaction never runs `on_expire`.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Weak;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::protocol::{Message, Packet};
use crate::types::{features, DeviceInfo, InstanceId};
use crate::NetworkEvent;

/// Back-channel from transaction completion into the owning network.
/// Transactions hold this as a `Weak` reference, validated at each
/// callback; they never extend the owner's lifetime.
pub trait NetworkHooks: Send + Sync {
    /// An election window closed: either a primary was observed during
    /// the window (concede) or none was (the node may self-promote).
    fn election_concluded(&self, txn: u32, primary_seen: bool);
    /// Replace the target client's device map in one step.
    fn commit_devices(&self, target: InstanceId, devices: HashMap<u32, DeviceInfo>);
    /// Replace the target client's patch map in one step.
    fn commit_patches(&self, target: InstanceId, patches: HashMap<u32, u32>);
}

#[derive(Debug)]
pub struct TransactionCore {
    pub id: u32,
    pub created: Instant,
    pub timeout: Duration,
    pub done: bool,
}

impl TransactionCore {
    pub fn new(id: u32, timeout: Duration) -> Self {
        Self {
            id,
            created: Instant::now(),
            timeout,
            done: false,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.done || self.created.elapsed() >= self.timeout
    }
}

pub trait Transaction: Send {
    fn core(&self) -> &TransactionCore;

    /// Called for every inbound packet carrying this transaction's id.
    fn on_reply(&mut self, src: SocketAddr, packet: &Packet);

    /// Called by the cleanup pass when the timeout elapsed without the
    /// transaction declaring itself done.
    fn on_expire(&mut self) {}

    fn id(&self) -> u32 {
        self.core().id
    }

    fn is_expired(&self) -> bool {
        self.core().is_expired()
    }

    fn is_done(&self) -> bool {
        self.core().done
    }
}

/// Election window. Accumulates whether any reply carried the primary
/// flag; concedes early on the first such reply, otherwise the expiry
/// callback gives the owner the go-ahead to self-promote. This is a
/// race with a grace period, not consensus: two nodes electing inside
/// the same window can both promote.
pub struct PromotionTransaction {
    core: TransactionCore,
    primary_seen: bool,
    network: Weak<dyn NetworkHooks>,
}

impl PromotionTransaction {
    pub fn new(id: u32, timeout: Duration, network: Weak<dyn NetworkHooks>) -> Self {
        Self {
            core: TransactionCore::new(id, timeout),
            primary_seen: false,
            network,
        }
    }
}

impl Transaction for PromotionTransaction {
    fn core(&self) -> &TransactionCore {
        &self.core
    }

    fn on_reply(&mut self, _src: SocketAddr, packet: &Packet) {
        let Message::AnnounceReply { features: mask, .. } = &packet.message else {
            return;
        };
        if self.primary_seen || !features::has(*mask, features::PRIMARY) {
            return;
        }
        self.primary_seen = true;
        self.core.done = true;
        tracing::debug!(txn = self.core.id, from = %packet.header.sender, "election conceded, primary already present");
        if let Some(network) = self.network.upgrade() {
            network.election_concluded(self.core.id, true);
        }
    }

    fn on_expire(&mut self) {
        if let Some(network) = self.network.upgrade() {
            network.election_concluded(self.core.id, self.primary_seen);
        }
    }
}

/// Inventory pull. Replies arrive in chunks, each carrying the sender's
/// current total; items accumulate in a temporary map and the target
/// client's map is replaced in one step the moment `received >= total`,
/// so readers never observe a partially merged map.
pub struct ListDevicesTransaction {
    core: TransactionCore,
    target: InstanceId,
    items: HashMap<u32, DeviceInfo>,
    network: Weak<dyn NetworkHooks>,
}

impl ListDevicesTransaction {
    pub fn new(id: u32, timeout: Duration, target: InstanceId, network: Weak<dyn NetworkHooks>) -> Self {
        Self {
            core: TransactionCore::new(id, timeout),
            target,
            items: HashMap::new(),
            network,
        }
    }
}

impl Transaction for ListDevicesTransaction {
    fn core(&self) -> &TransactionCore {
        &self.core
    }

    fn on_reply(&mut self, _src: SocketAddr, packet: &Packet) {
        if packet.header.sender != self.target {
            return;
        }
        let Message::ListDevicesReply { total, devices } = &packet.message else {
            return;
        };
        for (id, info) in devices {
            self.items.insert(*id, info.clone());
        }
        if self.items.len() as u32 >= *total && !self.core.done {
            self.core.done = true;
            if let Some(network) = self.network.upgrade() {
                network.commit_devices(self.target, std::mem::take(&mut self.items));
            }
        }
    }
}

pub struct ListPatchesTransaction {
    core: TransactionCore,
    target: InstanceId,
    items: HashMap<u32, u32>,
    network: Weak<dyn NetworkHooks>,
}

impl ListPatchesTransaction {
    pub fn new(id: u32, timeout: Duration, target: InstanceId, network: Weak<dyn NetworkHooks>) -> Self {
        Self {
            core: TransactionCore::new(id, timeout),
            target,
            items: HashMap::new(),
            network,
        }
    }
}

impl Transaction for ListPatchesTransaction {
    fn core(&self) -> &TransactionCore {
        &self.core
    }

    fn on_reply(&mut self, _src: SocketAddr, packet: &Packet) {
        if packet.header.sender != self.target {
            return;
        }
        let Message::ListPatchesReply { total, patches } = &packet.message else {
            return;
        };
        for (patch, device) in patches {
            self.items.insert(*patch, *device);
        }
        if self.items.len() as u32 >= *total && !self.core.done {
            self.core.done = true;
            if let Some(network) = self.network.upgrade() {
                network.commit_patches(self.target, std::mem::take(&mut self.items));
            }
        }
    }
}

/// Resource search window. Collects every distinct responder and emits
/// one event per responder; picking which advertised source to fetch
/// from is the subscriber's policy, not the transaction's.
pub struct FindResourceTransaction {
    core: TransactionCore,
    resource: String,
    responders: HashSet<InstanceId>,
    events: broadcast::Sender<NetworkEvent>,
}

impl FindResourceTransaction {
    pub fn new(
        id: u32,
        timeout: Duration,
        resource: String,
        events: broadcast::Sender<NetworkEvent>,
    ) -> Self {
        Self {
            core: TransactionCore::new(id, timeout),
            resource,
            responders: HashSet::new(),
            events,
        }
    }
}

impl Transaction for FindResourceTransaction {
    fn core(&self) -> &TransactionCore {
        &self.core
    }

    fn on_reply(&mut self, src: SocketAddr, packet: &Packet) {
        let Message::AdvertiseResource { resource, url, port } = &packet.message else {
            return;
        };
        if *resource != self.resource {
            return;
        }
        if !self.responders.insert(packet.header.sender) {
            return;
        }
        let _ = self.events.send(NetworkEvent::ResourceAdvertised {
            resource: resource.clone(),
            url: url.clone(),
            addr: src.ip(),
            port: *port,
            from: packet.header.sender,
        });
    }
}
