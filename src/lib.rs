//! Coordination layer for cooperating live-show nodes on a LAN: node
//! announce/discovery, primary-master election, reply correlation, the
//! client registry, and resource replication. Best-effort and
//! self-healing; correctness leans on idempotent periodic announces,
//! not on delivery guarantees.

mod announce;
mod cache;
mod client;
mod config;
mod error;
mod protocol;
mod talkback;
mod token;
mod transaction;
mod transport;
mod types;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio_util::sync::CancellationToken;

pub use crate::cache::{ClientCacheManager, Download, ResourceRequester, ResourceStatus};
pub use crate::client::{Client, ClientRegistry, PersistedClient};
pub use crate::config::NetworkConfig;
pub use crate::error::{NetError, Severity};
pub use crate::protocol::{Header, Message, Packet};
pub use crate::talkback::{ChannelTalkback, OutletRouter};
pub use crate::token::TokenKey;
pub use crate::transport::{LoopbackHub, LoopbackWire, Transport, Wire};
pub use crate::types::{features, parse_groups, DeviceInfo, InstanceId, Role};

use crate::token::advertise_url;
use crate::transaction::{
    FindResourceTransaction, ListDevicesTransaction, ListPatchesTransaction, NetworkHooks,
    PromotionTransaction,
};

/// Inventory replies are split into packets of this many entries; each
/// carries the full total so the receiving transaction knows when the
/// set is complete.
const LIST_CHUNK: usize = 16;

#[derive(Clone, Debug)]
pub enum NetworkEvent {
    Promoted {
        instance: InstanceId,
    },
    Demoted {
        instance: InstanceId,
    },
    ClientDiscovered {
        instance: InstanceId,
        hostname: String,
    },
    ClientLeft {
        instance: InstanceId,
    },
    ResourceAdvertised {
        resource: String,
        url: String,
        addr: IpAddr,
        port: u16,
        from: InstanceId,
    },
    ResetRequested {
        channel: Option<u16>,
    },
    RemoteError {
        from: InstanceId,
        severity: Severity,
        text: String,
    },
}

struct NetState {
    role: Role,
    /// This node's own addressing filter, carried in announces.
    addressing: String,
    try_become_primary: bool,
    is_primary: bool,
    election: Option<u32>,
    election_cancelled: bool,
    registry: ClientRegistry,
    local_devices: HashMap<u32, DeviceInfo>,
    local_patches: HashMap<u32, u32>,
    plugins: HashSet<String>,
}

/// Shared core behind the [`Network`] handle. Registry and role state
/// live under one lock; transactions and the cache hold weak
/// back-references to this, validated at each callback.
pub struct NetworkCore {
    instance: InstanceId,
    hostname: String,
    config: NetworkConfig,
    transport: Arc<Transport>,
    cache: Arc<ClientCacheManager>,
    token_key: TokenKey,
    state: Mutex<NetState>,
    events: broadcast::Sender<NetworkEvent>,
    outlet_router: Mutex<Option<Arc<dyn OutletRouter>>>,
    kick: Arc<Notify>,
}

impl NetworkCore {
    pub(crate) fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub(crate) fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub(crate) fn role(&self) -> Role {
        self.state.lock().role
    }

    fn features_of(&self, state: &NetState) -> u32 {
        let mut mask = 0;
        if state.is_primary {
            mask |= features::PRIMARY;
        }
        if state.try_become_primary {
            mask |= features::FAILOVER;
        }
        if self.config.advertise_resources {
            mask |= features::FILE_SERVER;
        }
        mask
    }

    /// One announce pass. A master that wants primacy and has no
    /// election in flight opens a new election window and tags the
    /// announce with its transaction id; every other announce is
    /// untagged and replies route to the network's own handler.
    pub(crate) fn do_announce(self: &Arc<Self>) {
        let (new_election, packet) = {
            let mut state = self.state.lock();
            let open_election = state.role.is_master()
                && state.try_become_primary
                && !state.is_primary
                && state.election.is_none();
            let txn = if open_election {
                let id = self.transport.allocate_txn();
                state.election = Some(id);
                state.election_cancelled = false;
                Some(id)
            } else {
                None
            };
            let header = match txn {
                Some(id) => Header::with_txn(self.instance, id),
                None => Header::plain(self.instance),
            };
            let message = Message::Announce {
                role: state.role,
                features: self.features_of(&state),
                addressing: state.addressing.clone(),
                hostname: self.hostname.clone(),
            };
            (txn, Packet::new(header, message))
        };

        if let Some(id) = new_election {
            let me: Arc<dyn NetworkHooks> = self.clone();
            let weak: Weak<dyn NetworkHooks> = Arc::downgrade(&me);
            self.transport.register(Box::new(PromotionTransaction::new(
                id,
                Duration::from_millis(self.config.election_timeout_ms),
                weak,
            )));
            tracing::info!(txn = id, "starting primary-master election");
        }
        let _ = self.transport.broadcast_packet(&packet);
    }

    fn announce(self: &Arc<Self>) {
        if self.role().is_master() {
            self.kick.notify_one();
        } else {
            self.do_announce();
        }
    }

    fn need_resource(&self, resource: &str) {
        self.cache.need_file(resource);
        let txn = self.transport.allocate_txn();
        self.transport.register(Box::new(FindResourceTransaction::new(
            txn,
            Duration::from_millis(self.config.find_timeout_ms),
            resource.to_owned(),
            self.events.clone(),
        )));
        let _ = self.transport.broadcast_packet(&Packet::new(
            Header::with_txn(self.instance, txn),
            Message::FindResource {
                resource: resource.to_owned(),
            },
        ));
    }

    fn report_error(&self, severity: Severity, text: &str) {
        match severity {
            Severity::Message => tracing::info!(report = text, "operator report"),
            Severity::Warning => tracing::warn!(report = text, "operator report"),
            Severity::Error | Severity::Severe => tracing::error!(report = text, "operator report"),
        }
        if severity >= Severity::Warning {
            let _ = self.transport.broadcast_packet(&Packet::new(
                Header::plain(self.instance),
                Message::ReportError {
                    severity,
                    text: text.to_owned(),
                },
            ));
        }
    }

    fn demote(&self, silent: bool) {
        let was_primary = {
            let mut state = self.state.lock();
            let was = state.is_primary;
            state.is_primary = false;
            if !silent {
                // operator demotion also stops the node re-electing
                state.try_become_primary = false;
            }
            was
        };
        if !was_primary {
            return;
        }
        tracing::info!(silent, "demoted from primary master");
        if !silent {
            let _ = self
                .transport
                .broadcast_packet(&Packet::new(Header::plain(self.instance), Message::Demoted));
        }
        let _ = self.events.send(NetworkEvent::Demoted {
            instance: self.instance,
        });
    }

    /// Registry update on any sighting (announce or reply). Device and
    /// patch pulls go out only on the first discovery of a client
    /// instance, never on subsequent heartbeats.
    fn observe_sighting(
        self: &Arc<Self>,
        src: SocketAddr,
        sender: InstanceId,
        role: Role,
        mask: u32,
        addressing: &str,
        hostname: &str,
    ) {
        let first = self.state.lock().registry.observe_reply(
            sender,
            Some(src),
            role,
            mask,
            addressing,
            hostname,
        );
        if !first {
            return;
        }
        tracing::info!(instance = %sender, hostname, ?role, "node discovered");
        let _ = self.events.send(NetworkEvent::ClientDiscovered {
            instance: sender,
            hostname: hostname.to_owned(),
        });
        if role == Role::Client {
            self.pull_inventories(src, sender);
        }
    }

    fn pull_inventories(self: &Arc<Self>, src: SocketAddr, target: InstanceId) {
        let timeout = Duration::from_millis(self.config.find_timeout_ms);

        let me: Arc<dyn NetworkHooks> = self.clone();
        let weak: Weak<dyn NetworkHooks> = Arc::downgrade(&me);
        let devices_txn = self.transport.allocate_txn();
        self.transport.register(Box::new(ListDevicesTransaction::new(
            devices_txn,
            timeout,
            target,
            weak,
        )));
        let _ = self.transport.send_packet(
            src,
            &Packet::new(Header::with_txn(self.instance, devices_txn), Message::ListDevices),
        );

        let me: Arc<dyn NetworkHooks> = self.clone();
        let weak: Weak<dyn NetworkHooks> = Arc::downgrade(&me);
        let patches_txn = self.transport.allocate_txn();
        self.transport.register(Box::new(ListPatchesTransaction::new(
            patches_txn,
            timeout,
            target,
            weak,
        )));
        let _ = self.transport.send_packet(
            src,
            &Packet::new(Header::with_txn(self.instance, patches_txn), Message::ListPatches),
        );
    }

    fn handle_packet(self: &Arc<Self>, src: SocketAddr, packet: Packet) {
        if packet.header.sender == self.instance {
            return;
        }

        if let Some(plugin) = &packet.header.plugin {
            let known = self.state.lock().plugins.contains(plugin);
            if !known {
                self.report_error(
                    Severity::Warning,
                    &format!("received packet for unknown plugin '{plugin}'"),
                );
                return;
            }
        }

        if self.transport.dispatch(src, &packet) {
            return;
        }

        let sender = packet.header.sender;
        match packet.message {
            Message::Announce {
                role,
                features: mask,
                addressing,
                hostname,
            } => {
                self.observe_sighting(src, sender, role, mask, &addressing, &hostname);
                // reply with our own state, echoing the announcer's
                // transaction tag so election windows see every answer
                let reply = {
                    let state = self.state.lock();
                    Message::AnnounceReply {
                        role: state.role,
                        features: self.features_of(&state),
                        addressing: state.addressing.clone(),
                        hostname: self.hostname.clone(),
                    }
                };
                let header = Header::with_txn(self.instance, packet.header.txn);
                let _ = self.transport.send_packet(src, &Packet::new(header, reply));
            }
            Message::AnnounceReply {
                role,
                features: mask,
                addressing,
                hostname,
            } => {
                self.observe_sighting(src, sender, role, mask, &addressing, &hostname);
                // a foreign primary flag demotes this master on the spot
                if features::has(mask, features::PRIMARY) && self.state.lock().is_primary {
                    tracing::warn!(other = %sender, "another primary master present, stepping back");
                    self.demote(true);
                }
            }
            Message::Leave => {
                let removed = self.state.lock().registry.remove_on_leave(sender);
                if removed {
                    tracing::info!(instance = %sender, "node left");
                    let _ = self.events.send(NetworkEvent::ClientLeft { instance: sender });
                }
            }
            Message::SetClientAddress { addressing } => {
                self.state.lock().addressing = addressing;
            }
            Message::SetPatch { patch_id, device_id } => {
                self.state.lock().local_patches.insert(patch_id, device_id);
            }
            Message::ListDevices => {
                let devices: Vec<(u32, DeviceInfo)> = {
                    let state = self.state.lock();
                    let mut items: Vec<_> = state
                        .local_devices
                        .iter()
                        .map(|(id, info)| (*id, info.clone()))
                        .collect();
                    items.sort_by_key(|(id, _)| *id);
                    items
                };
                self.send_chunked(src, packet.header.txn, devices.len() as u32, devices, |total, chunk| {
                    Message::ListDevicesReply {
                        total,
                        devices: chunk,
                    }
                });
            }
            Message::ListPatches => {
                let patches: Vec<(u32, u32)> = {
                    let state = self.state.lock();
                    let mut items: Vec<_> =
                        state.local_patches.iter().map(|(p, d)| (*p, *d)).collect();
                    items.sort_by_key(|(p, _)| *p);
                    items
                };
                self.send_chunked(src, packet.header.txn, patches.len() as u32, patches, |total, chunk| {
                    Message::ListPatchesReply {
                        total,
                        patches: chunk,
                    }
                });
            }
            Message::FindResource { resource } => {
                if self.config.advertise_resources && self.cache.has_local(&resource) {
                    let url = advertise_url(&self.token_key, &resource);
                    let header = Header::with_txn(self.instance, packet.header.txn);
                    let _ = self.transport.send_packet(
                        src,
                        &Packet::new(
                            header,
                            Message::AdvertiseResource {
                                resource,
                                url,
                                port: self.config.resource_port,
                            },
                        ),
                    );
                }
            }
            Message::AdvertiseResource { resource, .. } => {
                // search window already closed; a fresh find will ask again
                tracing::debug!(resource, "late resource advertisement ignored");
            }
            Message::PushResource { resource } => {
                let wanted = {
                    let state = self.state.lock();
                    state.role == Role::Client
                        && (packet.header.group == 0
                            || parse_groups(&state.addressing).contains(&packet.header.group))
                };
                if wanted {
                    self.need_resource(&resource);
                }
            }
            Message::ResetAll => {
                let _ = self.events.send(NetworkEvent::ResetRequested { channel: None });
            }
            Message::ResetChannel => {
                let _ = self.events.send(NetworkEvent::ResetRequested {
                    channel: Some(packet.header.channel),
                });
            }
            Message::Promoted => {
                if let Some(client) = self.state.lock().registry.get_mut(sender) {
                    client.features |= features::PRIMARY;
                }
                let _ = self.events.send(NetworkEvent::Promoted { instance: sender });
            }
            Message::Demoted => {
                if let Some(client) = self.state.lock().registry.get_mut(sender) {
                    client.features &= !features::PRIMARY;
                }
                let _ = self.events.send(NetworkEvent::Demoted { instance: sender });
            }
            Message::ReportError { severity, text } => {
                tracing::warn!(from = %sender, %severity, report = %text, "remote error report");
                let _ = self.events.send(NetworkEvent::RemoteError {
                    from: sender,
                    severity,
                    text,
                });
            }
            Message::ListDevicesReply { .. } | Message::ListPatchesReply { .. } => {
                // inventory replies are consumed by their transaction via
                // dispatch above; a stray one means the request window
                // already closed, so there is nothing to apply
                tracing::debug!("late inventory reply ignored");
            }
            Message::OutletChange { outlet, value } => {
                let is_primary = self.state.lock().is_primary;
                if !is_primary {
                    return;
                }
                // router called without the state lock held; it may
                // re-enter the network
                let router = self.outlet_router.lock().clone();
                if let Some(router) = router {
                    router.outlet_changed(packet.header.group, packet.header.channel, &outlet, value);
                }
            }
        }
    }

    fn send_chunked<T: Clone>(
        &self,
        src: SocketAddr,
        txn: u32,
        total: u32,
        items: Vec<T>,
        build: impl Fn(u32, Vec<T>) -> Message,
    ) {
        let header = Header::with_txn(self.instance, txn);
        if items.is_empty() {
            let _ = self
                .transport
                .send_packet(src, &Packet::new(header, build(total, Vec::new())));
            return;
        }
        for chunk in items.chunks(LIST_CHUNK) {
            let _ = self.transport.send_packet(
                src,
                &Packet::new(header.clone(), build(total, chunk.to_vec())),
            );
        }
    }
}

impl NetworkHooks for NetworkCore {
    fn election_concluded(&self, txn: u32, primary_seen: bool) {
        let became_primary = {
            let mut state = self.state.lock();
            if state.election != Some(txn) {
                return;
            }
            state.election = None;
            let cancelled = std::mem::replace(&mut state.election_cancelled, false);
            if primary_seen || cancelled || state.is_primary || !state.role.is_master() {
                false
            } else {
                state.is_primary = true;
                true
            }
        };
        if !became_primary {
            return;
        }
        tracing::info!("promoted to primary master");
        let _ = self
            .transport
            .broadcast_packet(&Packet::new(Header::plain(self.instance), Message::Promoted));
        let _ = self.events.send(NetworkEvent::Promoted {
            instance: self.instance,
        });
    }

    fn commit_devices(&self, target: InstanceId, devices: HashMap<u32, DeviceInfo>) {
        if !self.state.lock().registry.swap_devices(target, devices) {
            tracing::warn!(instance = %target, "device list arrived for unknown client");
        }
    }

    fn commit_patches(&self, target: InstanceId, patches: HashMap<u32, u32>) {
        if !self.state.lock().registry.swap_patches(target, patches) {
            tracing::warn!(instance = %target, "patch list arrived for unknown client");
        }
    }
}

impl ResourceRequester for NetworkCore {
    fn need_resource(&self, resource: &str) {
        NetworkCore::need_resource(self, resource);
    }
}

pub struct Network {
    core: Arc<NetworkCore>,
    pub shutdown_token: CancellationToken,
}

impl Network {
    /// Build a node on top of an already-joined wire endpoint. The
    /// wire and its inbound receiver come from the transport
    /// collaborator; nothing here opens sockets.
    pub async fn new(
        config: NetworkConfig,
        wire: Arc<dyn Wire>,
        incoming: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>,
    ) -> Result<Self, NetError> {
        config.validate()?;

        let instance = InstanceId::generate();
        let hostname = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".into());

        let transport = Transport::new(wire, instance);
        let cache = ClientCacheManager::new(config.cache_dir.clone())?;
        cache.start();

        let (events, _) = broadcast::channel(256);
        let try_become_primary = config.try_become_primary;
        let core = Arc::new(NetworkCore {
            instance,
            hostname,
            config,
            transport,
            cache: Arc::clone(&cache),
            token_key: TokenKey::generate(),
            state: Mutex::new(NetState {
                role: Role::None,
                addressing: String::new(),
                try_become_primary,
                is_primary: false,
                election: None,
                election_cancelled: false,
                registry: ClientRegistry::new(),
                local_devices: HashMap::new(),
                local_patches: HashMap::new(),
                plugins: HashSet::new(),
            }),
            events,
            outlet_router: Mutex::new(None),
            kick: Arc::new(Notify::new()),
        });

        let core_requester: Arc<dyn ResourceRequester> = core.clone();
        let requester: Weak<dyn ResourceRequester> = Arc::downgrade(&core_requester);
        cache.attach_requester(requester);

        let shutdown_token = CancellationToken::new();
        spawn_packet_handler(Arc::clone(&core), incoming, shutdown_token.clone());
        announce::spawn_announce_loop(
            Arc::clone(&core),
            Arc::clone(&core.kick),
            shutdown_token.clone(),
        );

        tracing::info!(
            instance = %core.instance,
            hostname = %core.hostname,
            addr = %core.transport.local_addr(),
            "network initialized"
        );

        Ok(Self {
            core,
            shutdown_token,
        })
    }

    pub fn instance(&self) -> InstanceId {
        self.core.instance
    }

    pub fn hostname(&self) -> &str {
        &self.core.hostname
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.core.transport
    }

    pub fn cache(&self) -> &Arc<ClientCacheManager> {
        &self.core.cache
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NetworkEvent> {
        self.core.events.subscribe()
    }

    // --- role & election --------------------------------------------------

    /// Store the role and immediately announce it.
    pub fn set_role(&self, role: Role) {
        {
            let mut state = self.core.state.lock();
            state.role = role;
            if !role.is_master() {
                state.is_primary = false;
            }
        }
        self.core.announce();
    }

    pub fn role(&self) -> Role {
        self.core.role()
    }

    /// Start trying to become primary master; the next announce tick
    /// opens the election window.
    pub fn promote(&self) {
        self.core.state.lock().try_become_primary = true;
        self.core.announce();
    }

    pub fn demote(&self, silent: bool) {
        self.core.demote(silent);
    }

    /// Claim primacy immediately, skipping the election window.
    pub fn force_promotion(&self) -> Result<(), NetError> {
        {
            let mut state = self.core.state.lock();
            if !state.role.is_master() {
                return Err(NetError::InvalidArgument(
                    "only a master node can be promoted".into(),
                ));
            }
            if state.is_primary {
                return Ok(());
            }
            state.try_become_primary = true;
            state.is_primary = true;
            state.election = None;
        }
        tracing::info!("forced promotion to primary master");
        let _ = self.core.transport.broadcast_packet(&Packet::new(
            Header::plain(self.core.instance),
            Message::Promoted,
        ));
        let _ = self.core.events.send(NetworkEvent::Promoted {
            instance: self.core.instance,
        });
        Ok(())
    }

    /// Abort a pending election and stop seeking primacy. An election
    /// window already open concludes without promoting.
    pub fn cancel_promotion(&self) {
        let mut state = self.core.state.lock();
        state.try_become_primary = false;
        if state.election.is_some() {
            state.election_cancelled = true;
        }
    }

    pub fn is_primary_master(&self) -> bool {
        self.core.state.lock().is_primary
    }

    pub fn announce(&self) {
        self.core.announce();
    }

    // --- local node configuration -----------------------------------------

    pub fn set_addressing(&self, addressing: &str) {
        self.core.state.lock().addressing = addressing.to_owned();
    }

    pub fn addressing(&self) -> String {
        self.core.state.lock().addressing.clone()
    }

    pub fn set_local_devices(&self, devices: HashMap<u32, DeviceInfo>) {
        self.core.state.lock().local_devices = devices;
    }

    pub fn set_local_patch(&self, patch_id: u32, device_id: u32) {
        self.core.state.lock().local_patches.insert(patch_id, device_id);
    }

    pub fn local_patches(&self) -> HashMap<u32, u32> {
        self.core.state.lock().local_patches.clone()
    }

    pub fn register_plugin(&self, name: &str) {
        self.core.state.lock().plugins.insert(name.to_owned());
    }

    pub fn set_outlet_router(&self, router: Arc<dyn OutletRouter>) {
        *self.core.outlet_router.lock() = Some(router);
    }

    // --- client registry --------------------------------------------------

    pub fn get_present_groups(&self) -> BTreeSet<u16> {
        self.core.state.lock().registry.present_groups()
    }

    pub fn client_count(&self) -> usize {
        self.core.state.lock().registry.live_count()
    }

    pub fn client(&self, instance: InstanceId) -> Option<Client> {
        self.core.state.lock().registry.get(instance).cloned()
    }

    /// Push a new addressing filter to one client, updating the local
    /// record optimistically without waiting for acknowledgement.
    pub fn set_client_address(
        &self,
        instance: InstanceId,
        addressing: &str,
    ) -> Result<(), NetError> {
        let addr = {
            let mut state = self.core.state.lock();
            let client = state
                .registry
                .get_mut(instance)
                .ok_or(NetError::UnknownClient(instance.as_u32()))?;
            client.addressing = addressing.to_owned();
            client.addr
        };
        if let Some(addr) = addr {
            let _ = self.core.transport.send_packet(
                addr,
                &Packet::new(
                    Header::plain(self.core.instance),
                    Message::SetClientAddress {
                        addressing: addressing.to_owned(),
                    },
                ),
            );
        }
        Ok(())
    }

    /// Push one patch entry to a client, optimistically mirrored into
    /// the local record.
    pub fn set_client_patch(
        &self,
        instance: InstanceId,
        patch_id: u32,
        device_id: u32,
    ) -> Result<(), NetError> {
        let addr = {
            let mut state = self.core.state.lock();
            let client = state
                .registry
                .get_mut(instance)
                .ok_or(NetError::UnknownClient(instance.as_u32()))?;
            client.patches.insert(patch_id, device_id);
            client.addr
        };
        if let Some(addr) = addr {
            let _ = self.core.transport.send_packet(
                addr,
                &Packet::new(
                    Header::plain(self.core.instance),
                    Message::SetPatch { patch_id, device_id },
                ),
            );
        }
        Ok(())
    }

    // --- resources --------------------------------------------------------

    /// Register interest in a resource and broadcast a search for it.
    pub fn need_resource(&self, resource: &str) {
        self.core.need_resource(resource);
    }

    /// Feed a chosen advertisement into the download queue.
    pub fn start_download(&self, resource: &str, url: &str, addr: IpAddr, port: u16) -> bool {
        self.core.cache.start_download(resource, url, addr, port)
    }

    /// Tell clients in a group that a resource exists, without waiting
    /// for them to ask. Primary master only.
    pub fn push_resource(&self, group: u16, resource: &str) -> Result<(), NetError> {
        if !self.is_primary_master() {
            return Err(NetError::NotPrimary);
        }
        let mut header = Header::plain(self.core.instance);
        header.group = group;
        self.core.transport.broadcast_packet(&Packet::new(
            header,
            Message::PushResource {
                resource: resource.to_owned(),
            },
        ))
    }

    /// Validate a presented download token against this node's key.
    /// Called by the serving collaborator before returning file bytes.
    pub fn validate_token(&self, resource: &str, expiry: u64, sig: &str) -> Result<(), NetError> {
        token::validate(&self.core.token_key, resource, expiry, sig)
    }

    // --- show control -----------------------------------------------------

    pub fn reset_all(&self) -> Result<(), NetError> {
        self.core
            .transport
            .broadcast_packet(&Packet::new(Header::plain(self.core.instance), Message::ResetAll))
    }

    pub fn reset_channel(&self, channel: u16) -> Result<(), NetError> {
        let mut header = Header::plain(self.core.instance);
        header.channel = channel;
        self.core
            .transport
            .broadcast_packet(&Packet::new(header, Message::ResetChannel))
    }

    /// Log a report locally and, for warnings and above, broadcast it
    /// so any node's operator sees it.
    pub fn report_error(&self, severity: Severity, text: &str) {
        self.core.report_error(severity, text);
    }

    pub fn talkback(&self, group: u16, channel: u16) -> ChannelTalkback {
        ChannelTalkback::new(group, channel, Arc::clone(&self.core.transport))
    }

    // --- persistence ------------------------------------------------------

    pub fn export_registry(&self) -> Vec<PersistedClient> {
        self.core.state.lock().registry.export()
    }

    pub fn import_registry(&self, records: Vec<PersistedClient>) {
        self.core.state.lock().registry.import(records);
    }

    // --- lifecycle --------------------------------------------------------

    /// Broadcast a leave notice, stop the background loops, and tear
    /// down the cache.
    pub async fn shutdown(self) {
        let _ = self
            .core
            .transport
            .broadcast_packet(&Packet::new(Header::plain(self.core.instance), Message::Leave));
        self.shutdown_token.cancel();
        self.core.kick.notify_one();
        self.core.cache.shutdown().await;
        tracing::info!(instance = %self.core.instance, "network shutdown complete");
    }
}

fn spawn_packet_handler(
    core: Arc<NetworkCore>,
    mut incoming: mpsc::UnboundedReceiver<(SocketAddr, Bytes)>,
    shutdown_token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                msg = incoming.recv() => {
                    let Some((src, buf)) = msg else { break };
                    match protocol::decode(&buf) {
                        Ok(packet) => core.handle_packet(src, packet),
                        Err(e) => {
                            tracing::warn!(%src, error = %e, "undecodable packet dropped");
                        }
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn test_config(dir: &TempDir) -> NetworkConfig {
        let mut config = NetworkConfig::default();
        config.announce_period_ms = 25;
        config.election_timeout_ms = 150;
        config.find_timeout_ms = 150;
        config.cache_dir = dir.path().join("cache");
        config
    }

    /// Node that has not announced yet: no role set, first periodic
    /// announce an announce period away.
    async fn create_idle_node(hub: &Arc<LoopbackHub>) -> (Network, TempDir) {
        let dir = TempDir::new().unwrap();
        let (wire, rx) = hub.join();
        let node = Network::new(test_config(&dir), wire, rx).await.unwrap();
        (node, dir)
    }

    async fn create_node(hub: &Arc<LoopbackHub>, role: Role) -> (Network, TempDir) {
        let (node, dir) = create_idle_node(hub).await;
        node.set_role(role);
        (node, dir)
    }

    async fn wait_until(mut f: impl FnMut() -> bool, timeout_ms: u64) -> bool {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() < deadline {
            if f() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_lone_master_becomes_primary_after_window() {
        let hub = LoopbackHub::new();
        let (master, _dir) = create_node(&hub, Role::Master).await;
        let mut events = master.subscribe();

        master.promote();
        assert!(!master.is_primary_master());

        assert!(wait_until(|| master.is_primary_master(), 3000).await);

        let mut promoted = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, NetworkEvent::Promoted { instance } if instance == master.instance())
            {
                promoted = true;
            }
        }
        assert!(promoted, "promoted event not fired");

        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_election_concedes_to_existing_primary() {
        let hub = LoopbackHub::new();
        let (a, _dir_a) = create_node(&hub, Role::Master).await;
        let (b, _dir_b) = create_node(&hub, Role::Master).await;

        a.promote();
        assert!(wait_until(|| a.is_primary_master(), 3000).await);

        b.promote();
        // b's window runs against a live primary; it must concede and
        // never set its own flag
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!b.is_primary_master());
        assert!(a.is_primary_master());

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_failover_after_primary_leaves() {
        let hub = LoopbackHub::new();
        let (a, _dir_a) = create_node(&hub, Role::Master).await;
        let (b, _dir_b) = create_node(&hub, Role::Master).await;

        a.promote();
        assert!(wait_until(|| a.is_primary_master(), 3000).await);

        b.promote();
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!b.is_primary_master());

        // primary disappears; b keeps trying and now wins its window
        a.shutdown().await;
        assert!(wait_until(|| b.is_primary_master(), 5000).await);

        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_conflicting_primaries_resolve_to_one() {
        let hub = LoopbackHub::new();
        let (a, _dir_a) = create_node(&hub, Role::Master).await;
        let (b, _dir_b) = create_node(&hub, Role::Master).await;

        a.force_promotion().unwrap();
        b.force_promotion().unwrap();
        assert!(a.is_primary_master() && b.is_primary_master());

        // announce replies carry the primary flag; one side steps back
        assert!(
            wait_until(
                || a.is_primary_master() != b.is_primary_master(),
                5000
            )
            .await,
            "conflict did not resolve to a single primary"
        );

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_promotion_blocks_pending_election() {
        let hub = LoopbackHub::new();
        let (master, _dir) = create_node(&hub, Role::Master).await;

        master.promote();
        tokio::time::sleep(Duration::from_millis(50)).await;
        master.cancel_promotion();

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!master.is_primary_master());

        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_force_promotion_requires_master_role() {
        let hub = LoopbackHub::new();
        let (node, _dir) = create_node(&hub, Role::Client).await;
        assert!(node.force_promotion().is_err());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_discovery_present_groups_and_inventory_pull() {
        let hub = LoopbackHub::new();

        // configure the clients before any master can discover them;
        // inventory pulls happen on first discovery only
        let (c1, _dir_1) = create_idle_node(&hub).await;
        c1.set_addressing("1 2");
        let mut devices = HashMap::new();
        devices.insert(
            1,
            DeviceInfo {
                name: "out-left".into(),
                kind: "video".into(),
            },
        );
        devices.insert(
            2,
            DeviceInfo {
                name: "out-right".into(),
                kind: "video".into(),
            },
        );
        c1.set_local_devices(devices);
        c1.set_local_patch(5, 1);
        c1.set_role(Role::Client);

        let (c2, _dir_2) = create_idle_node(&hub).await;
        c2.set_addressing("3");
        c2.set_role(Role::Client);

        let (master, _dir_m) = create_node(&hub, Role::Master).await;

        assert!(wait_until(|| master.client_count() == 2, 3000).await);
        assert_eq!(
            master.get_present_groups().into_iter().collect::<Vec<_>>(),
            vec![1, 2, 3]
        );

        // inventories pulled on first discovery
        let c1_id = c1.instance();
        assert!(
            wait_until(
                || master
                    .client(c1_id)
                    .map(|c| c.devices.len() == 2 && c.patches.get(&5) == Some(&1))
                    .unwrap_or(false),
                3000
            )
            .await,
            "inventory pull did not complete"
        );

        master.shutdown().await;
        c1.shutdown().await;
        c2.shutdown().await;
    }

    #[tokio::test]
    async fn test_leave_removes_client_from_live_registry() {
        let hub = LoopbackHub::new();
        let (master, _dir_m) = create_node(&hub, Role::Master).await;
        let (client, _dir_c) = create_node(&hub, Role::Client).await;

        client.announce();
        assert!(wait_until(|| master.client_count() == 1, 3000).await);

        // records survive the leave in the persisted export
        let leaving = client.instance();
        client.shutdown().await;
        assert!(wait_until(|| master.client_count() == 0, 3000).await);
        assert!(master
            .export_registry()
            .iter()
            .any(|r| r.instance == leaving));

        master.shutdown().await;
    }

    #[tokio::test]
    async fn test_set_client_address_is_optimistic_and_propagates() {
        let hub = LoopbackHub::new();
        let (master, _dir_m) = create_node(&hub, Role::Master).await;
        let (client, _dir_c) = create_node(&hub, Role::Client).await;

        client.announce();
        let client_id = client.instance();
        assert!(wait_until(|| master.client_count() == 1, 3000).await);

        master.set_client_address(client_id, "4-6").unwrap();
        // local view updates immediately, no acknowledgement needed
        assert_eq!(master.client(client_id).unwrap().addressing, "4-6");
        assert_eq!(
            master.get_present_groups().into_iter().collect::<Vec<_>>(),
            vec![4, 5, 6]
        );

        assert!(wait_until(|| client.addressing() == "4-6", 3000).await);

        master.set_client_patch(client_id, 9, 2).unwrap();
        assert_eq!(master.client(client_id).unwrap().patches.get(&9), Some(&2));
        assert!(wait_until(|| client.local_patches().get(&9) == Some(&2), 3000).await);

        assert!(matches!(
            master.set_client_address(InstanceId::from_raw(0xffff_ffff), "1"),
            Err(NetError::UnknownClient(_))
        ));

        master.shutdown().await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_find_resource_advertises_and_emits_events() {
        let hub = LoopbackHub::new();
        let (seeker, _dir_s) = create_node(&hub, Role::Master).await;
        let (holder, _dir_h) = create_node(&hub, Role::Client).await;

        // place the file in the holder's cache
        let dir = holder.cache().cache_dir().join("media");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("intro.mov"), b"data").unwrap();

        let mut events = seeker.subscribe();
        seeker.need_resource("media/intro.mov");
        assert!(seeker.cache().is_wished("media/intro.mov"));

        let holder_id = holder.instance();
        let advertised = wait_until(
            move || match events.try_recv() {
                Ok(NetworkEvent::ResourceAdvertised {
                    resource,
                    url,
                    port,
                    from,
                    ..
                }) => {
                    resource == "media/intro.mov"
                        && url.starts_with("/res/media/intro.mov?")
                        && port == 10918
                        && from == holder_id
                }
                _ => false,
            },
            3000,
        )
        .await;
        assert!(advertised, "no advertisement event received");

        seeker.shutdown().await;
        holder.shutdown().await;
    }

    #[tokio::test]
    async fn test_push_resource_requires_primary_and_reaches_group() {
        let hub = LoopbackHub::new();
        let (master, _dir_m) = create_node(&hub, Role::Master).await;
        let (client, _dir_c) = create_node(&hub, Role::Client).await;

        client.set_addressing("2");
        client.announce();
        assert!(wait_until(|| master.client_count() == 1, 3000).await);

        assert!(matches!(
            master.push_resource(2, "media/b.mov"),
            Err(NetError::NotPrimary)
        ));

        master.force_promotion().unwrap();
        master.push_resource(2, "media/b.mov").unwrap();
        assert!(wait_until(|| client.cache().is_wished("media/b.mov"), 3000).await);

        // a push for a group the client does not render is ignored
        master.push_resource(7, "media/other.mov").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!client.cache().is_wished("media/other.mov"));

        master.shutdown().await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_outlet_change_routes_only_on_primary() {
        use std::sync::Mutex as StdMutex;

        struct Recorder {
            seen: StdMutex<Vec<(u16, u16, String, f64)>>,
        }
        impl OutletRouter for Recorder {
            fn outlet_changed(&self, group: u16, channel: u16, outlet: &str, value: f64) {
                self.seen
                    .lock()
                    .unwrap()
                    .push((group, channel, outlet.to_owned(), value));
            }
        }

        let hub = LoopbackHub::new();
        let (master, _dir_m) = create_node(&hub, Role::Master).await;
        let (player, _dir_p) = create_node(&hub, Role::Client).await;

        let recorder = Arc::new(Recorder {
            seen: StdMutex::new(Vec::new()),
        });
        master.set_outlet_router(recorder.clone());

        let talkback = player.talkback(3, 11);
        talkback.outlet_changed("opacity", 0.75).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(recorder.seen.lock().unwrap().is_empty(), "routed while not primary");

        master.force_promotion().unwrap();
        talkback.outlet_changed("opacity", 0.5).unwrap();
        assert!(
            wait_until(|| !recorder.seen.lock().unwrap().is_empty(), 3000).await,
            "outlet change not routed"
        );
        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen[0], (3, 11, "opacity".to_owned(), 0.5));
        drop(seen);

        master.shutdown().await;
        player.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_error_reports_reach_other_nodes() {
        let hub = LoopbackHub::new();
        let (a, _dir_a) = create_node(&hub, Role::Master).await;
        let (b, _dir_b) = create_node(&hub, Role::Client).await;

        let mut events = a.subscribe();
        let b_id = b.instance();
        b.report_error(Severity::Error, "output device lost");

        let received = wait_until(
            move || match events.try_recv() {
                Ok(NetworkEvent::RemoteError {
                    from,
                    severity,
                    text,
                }) => from == b_id && severity == Severity::Error && text.contains("output device"),
                _ => false,
            },
            3000,
        )
        .await;
        assert!(received, "error report did not arrive");

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_reset_broadcasts_reach_clients() {
        let hub = LoopbackHub::new();
        let (master, _dir_m) = create_node(&hub, Role::Master).await;
        let (client, _dir_c) = create_node(&hub, Role::Client).await;

        let mut events = client.subscribe();
        master.reset_channel(4).unwrap();
        master.reset_all().unwrap();

        let mut got_channel = false;
        let mut got_all = false;
        assert!(
            wait_until(
                || {
                    while let Ok(event) = events.try_recv() {
                        match event {
                            NetworkEvent::ResetRequested { channel: Some(4) } => got_channel = true,
                            NetworkEvent::ResetRequested { channel: None } => got_all = true,
                            _ => {}
                        }
                    }
                    got_channel && got_all
                },
                3000
            )
            .await
        );

        master.shutdown().await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_registry_persistence_survives_restart() {
        let hub = LoopbackHub::new();
        let (master, _dir_m) = create_node(&hub, Role::Master).await;
        let (client, _dir_c) = create_node(&hub, Role::Client).await;

        client.set_addressing("1-3");
        client.announce();
        let client_id = client.instance();
        assert!(wait_until(|| master.client_count() == 1, 3000).await);
        master.set_client_patch(client_id, 2, 8).unwrap();

        // serialize as the show document would embed it
        let json = serde_json::to_string(&master.export_registry()).unwrap();
        master.shutdown().await;

        // seed the fresh node's cache before it starts announcing
        let (master2, _dir_m2) = create_idle_node(&hub).await;
        let records: Vec<PersistedClient> = serde_json::from_str(&json).unwrap();
        master2.import_registry(records);
        master2.set_role(Role::Master);

        // client re-announces with the same hostname: settings recovered
        client.announce();
        assert!(
            wait_until(
                || {
                    master2
                        .client(client_id)
                        .map(|c| c.patches.get(&2) == Some(&8))
                        .unwrap_or(false)
                },
                3000
            )
            .await,
            "cached record not recovered by hostname"
        );

        master2.shutdown().await;
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_plugin_packet_is_reported_not_fatal() {
        let hub = LoopbackHub::new();
        let (a, _dir_a) = create_node(&hub, Role::Master).await;
        let (b, _dir_b) = create_node(&hub, Role::Client).await;

        // a hears b's broadcast complaint about the bad packet
        let mut events = a.subscribe();
        let b_id = b.instance();

        // hand-craft a content packet for a plugin b does not have
        let mut header = Header::plain(a.instance());
        header.plugin = Some("holograms".into());
        a.transport()
            .broadcast_packet(&Packet::new(
                header,
                Message::OutletChange {
                    outlet: "x".into(),
                    value: 1.0,
                },
            ))
            .unwrap();

        let warned = wait_until(
            move || match events.try_recv() {
                Ok(NetworkEvent::RemoteError {
                    from,
                    severity,
                    text,
                }) => from == b_id && severity == Severity::Warning && text.contains("holograms"),
                _ => false,
            },
            3000,
        )
        .await;
        assert!(warned, "unknown-plugin report not observed");

        a.shutdown().await;
        b.shutdown().await;
    }
}
