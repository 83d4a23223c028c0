//! Outlet-change plumbing. A remote rendering component pushes a live
//! value change back over the transport via [`ChannelTalkback`]; the
//! primary master routes the inbound change to the registered
//! [`OutletRouter`], which knows which track output slot it belongs to.

use std::sync::Arc;

use crate::error::NetError;
use crate::protocol::{Header, Message, Packet};
use crate::transport::Transport;

/// Sink the primary master registers to receive routed outlet changes.
pub trait OutletRouter: Send + Sync {
    fn outlet_changed(&self, group: u16, channel: u16, outlet: &str, value: f64);
}

/// Thin adapter bound to one channel/group pair on a player node.
pub struct ChannelTalkback {
    group: u16,
    channel: u16,
    transport: Arc<Transport>,
}

impl ChannelTalkback {
    pub fn new(group: u16, channel: u16, transport: Arc<Transport>) -> Self {
        Self {
            group,
            channel,
            transport,
        }
    }

    pub fn group(&self) -> u16 {
        self.group
    }

    pub fn channel(&self) -> u16 {
        self.channel
    }

    /// Broadcast an outlet value change tagged with this adapter's
    /// channel and group.
    pub fn outlet_changed(&self, outlet: &str, value: f64) -> Result<(), NetError> {
        let mut header = Header::plain(self.transport.local_instance());
        header.group = self.group;
        header.channel = self.channel;
        let packet = Packet::new(
            header,
            Message::OutletChange {
                outlet: outlet.to_owned(),
                value,
            },
        );
        self.transport.broadcast_packet(&packet)
    }
}
