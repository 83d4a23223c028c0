//! Transport boundary. The packet mover itself is a collaborator hidden
//! behind [`Wire`]; this module owns what sits on top of it: the
//! transaction lookup table, inbound dispatch-by-transaction-id, typed
//! outbound sends, and the pending-redelivery buffer flushed on each
//! announce tick.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::error::NetError;
use crate::protocol::{self, Packet};
use crate::transaction::Transaction;
use crate::types::InstanceId;

/// Raw datagram send primitives over the broadcast domain. Delivery is
/// best-effort: no ordering, no acknowledgement.
pub trait Wire: Send + Sync {
    fn broadcast(&self, buf: Bytes) -> Result<(), NetError>;
    fn send_to(&self, addr: SocketAddr, buf: Bytes) -> Result<(), NetError>;
    fn local_addr(&self) -> SocketAddr;
}

/// In-memory stand-in for the broadcast domain, used by tests and
/// local single-process setups. Broadcast delivers to every joined
/// endpoint including the sender, matching multicast loopback.
#[derive(Default)]
pub struct LoopbackHub {
    endpoints: Mutex<HashMap<SocketAddr, mpsc::UnboundedSender<(SocketAddr, Bytes)>>>,
    next_port: AtomicU32,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(HashMap::new()),
            next_port: AtomicU32::new(40000),
        })
    }

    pub fn join(self: &Arc<Self>) -> (Arc<LoopbackWire>, mpsc::UnboundedReceiver<(SocketAddr, Bytes)>) {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed) as u16;
        let addr: SocketAddr = SocketAddr::from(([127, 0, 0, 1], port));
        let (tx, rx) = mpsc::unbounded_channel();
        self.endpoints.lock().insert(addr, tx);
        let wire = Arc::new(LoopbackWire {
            hub: Arc::clone(self),
            addr,
        });
        (wire, rx)
    }

    pub fn leave(&self, addr: SocketAddr) {
        self.endpoints.lock().remove(&addr);
    }
}

pub struct LoopbackWire {
    hub: Arc<LoopbackHub>,
    addr: SocketAddr,
}

impl Wire for LoopbackWire {
    fn broadcast(&self, buf: Bytes) -> Result<(), NetError> {
        let endpoints = self.hub.endpoints.lock();
        for tx in endpoints.values() {
            let _ = tx.send((self.addr, buf.clone()));
        }
        Ok(())
    }

    fn send_to(&self, addr: SocketAddr, buf: Bytes) -> Result<(), NetError> {
        let endpoints = self.hub.endpoints.lock();
        match endpoints.get(&addr) {
            Some(tx) => tx.send((self.addr, buf)).map_err(|_| NetError::WireClosed),
            None => Err(NetError::WireClosed),
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.addr
    }
}

enum Outbound {
    Broadcast(Bytes),
    To(SocketAddr, Bytes),
}

pub struct Transport {
    wire: Arc<dyn Wire>,
    local: InstanceId,
    next_txn: AtomicU32,
    transactions: Mutex<HashMap<u32, Box<dyn Transaction>>>,
    /// Sends that failed at the wire, re-attempted once per announce
    /// tick. A second failure drops the packet; the protocol relies on
    /// periodic re-announce, not guaranteed delivery.
    pending: Mutex<Vec<Outbound>>,
}

impl Transport {
    pub fn new(wire: Arc<dyn Wire>, local: InstanceId) -> Arc<Self> {
        Arc::new(Self {
            wire,
            local,
            next_txn: AtomicU32::new(1),
            transactions: Mutex::new(HashMap::new()),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn local_instance(&self) -> InstanceId {
        self.local
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.wire.local_addr()
    }

    pub fn allocate_txn(&self) -> u32 {
        // id 0 is reserved for untagged packets
        let id = self.next_txn.fetch_add(1, Ordering::Relaxed);
        if id == 0 {
            self.next_txn.fetch_add(1, Ordering::Relaxed)
        } else {
            id
        }
    }

    /// Hand a transaction to the transport for reply routing. The
    /// transport only holds it for lookup; lifetime ends at expiry.
    pub fn register(&self, txn: Box<dyn Transaction>) {
        let id = txn.id();
        let stale = self.transactions.lock().insert(id, txn);
        if stale.is_some() {
            tracing::warn!(txn = id, "replaced stale transaction with same id");
        }
    }

    pub fn transaction_count(&self) -> usize {
        self.transactions.lock().len()
    }

    /// Route an inbound packet to its transaction, if the header names
    /// one we hold. Returns `true` when consumed. Replies arriving
    /// after the window closed are swallowed; the transaction itself
    /// waits for the cleanup pass. The transaction is taken out of the
    /// table while its callback runs, so callbacks may re-enter the
    /// transport freely.
    pub fn dispatch(&self, src: SocketAddr, packet: &Packet) -> bool {
        if packet.header.txn == protocol::NO_TXN {
            return false;
        }
        let mut txn = {
            let mut table = self.transactions.lock();
            match table.get(&packet.header.txn) {
                None => return false,
                Some(txn) if txn.is_expired() => return true,
                Some(_) => {}
            }
            let Some(txn) = table.remove(&packet.header.txn) else {
                return false;
            };
            txn
        };
        txn.on_reply(src, packet);
        if !txn.is_expired() {
            self.transactions.lock().insert(txn.id(), txn);
        }
        true
    }

    /// Periodic cleanup: evict expired transactions, firing `on_expire`
    /// for the ones that timed out without completing. Timeouts are
    /// only observed here, so effective resolution is bounded by the
    /// announce period.
    pub fn prune_expired(&self) {
        let expired: Vec<Box<dyn Transaction>> = {
            let mut table = self.transactions.lock();
            let ids: Vec<u32> = table
                .iter()
                .filter(|(_, txn)| txn.is_expired())
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| table.remove(&id)).collect()
        };
        for mut txn in expired {
            if !txn.is_done() {
                tracing::debug!(txn = txn.id(), "transaction timed out");
                txn.on_expire();
            }
        }
    }

    pub fn broadcast_packet(&self, packet: &Packet) -> Result<(), NetError> {
        let buf = protocol::encode(packet)?;
        if let Err(e) = self.wire.broadcast(buf.clone()) {
            tracing::warn!(kind = packet.kind(), error = %e, "broadcast failed, queued for redelivery");
            self.pending.lock().push(Outbound::Broadcast(buf));
        }
        Ok(())
    }

    pub fn send_packet(&self, addr: SocketAddr, packet: &Packet) -> Result<(), NetError> {
        let buf = protocol::encode(packet)?;
        if let Err(e) = self.wire.send_to(addr, buf.clone()) {
            tracing::warn!(kind = packet.kind(), %addr, error = %e, "send failed, queued for redelivery");
            self.pending.lock().push(Outbound::To(addr, buf));
        }
        Ok(())
    }

    /// Re-attempt parked sends once. Still-failing packets are dropped;
    /// announces repeat anyway.
    pub fn flush_redeliveries(&self) {
        let parked = std::mem::take(&mut *self.pending.lock());
        if parked.is_empty() {
            return;
        }
        tracing::debug!(count = parked.len(), "flushing pending redeliveries");
        for item in parked {
            let result = match &item {
                Outbound::Broadcast(buf) => self.wire.broadcast(buf.clone()),
                Outbound::To(addr, buf) => self.wire.send_to(*addr, buf.clone()),
            };
            if let Err(e) = result {
                tracing::warn!(error = %e, "redelivery failed, dropping packet");
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
