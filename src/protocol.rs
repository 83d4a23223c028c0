//! Wire message definitions and encode/decode helpers. The transport
//! collaborator moves opaque byte buffers; everything in here is the
//! coordination layer's own framing of those buffers.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{NetError, Severity};
use crate::types::{DeviceInfo, InstanceId, Role};

/// Transaction correlation id carried in a packet header. Zero means
/// "no transaction": replies go to the network's own handler.
pub const NO_TXN: u32 = 0;

/// Common header on every packet: correlation id, sender identity,
/// group/channel addressing, and (for content messages) the plugin the
/// payload belongs to.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Header {
    pub txn: u32,
    pub sender: InstanceId,
    pub group: u16,
    pub channel: u16,
    pub plugin: Option<String>,
}

impl Header {
    pub fn plain(sender: InstanceId) -> Self {
        Self {
            txn: NO_TXN,
            sender,
            group: 0,
            channel: 0,
            plugin: None,
        }
    }

    pub fn with_txn(sender: InstanceId, txn: u32) -> Self {
        Self {
            txn,
            sender,
            group: 0,
            channel: 0,
            plugin: None,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub enum Message {
    Announce {
        role: Role,
        features: u32,
        addressing: String,
        hostname: String,
    },
    AnnounceReply {
        role: Role,
        features: u32,
        addressing: String,
        hostname: String,
    },
    Leave,

    SetClientAddress {
        addressing: String,
    },
    SetPatch {
        patch_id: u32,
        device_id: u32,
    },
    ListDevices,
    ListDevicesReply {
        total: u32,
        devices: Vec<(u32, DeviceInfo)>,
    },
    ListPatches,
    ListPatchesReply {
        total: u32,
        patches: Vec<(u32, u32)>,
    },

    FindResource {
        resource: String,
    },
    AdvertiseResource {
        resource: String,
        url: String,
        port: u16,
    },
    PushResource {
        resource: String,
    },

    ResetAll,
    ResetChannel,
    Promoted,
    Demoted,
    ReportError {
        severity: Severity,
        text: String,
    },
    OutletChange {
        outlet: String,
        value: f64,
    },
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Packet {
    pub header: Header,
    pub message: Message,
}

impl Packet {
    pub fn new(header: Header, message: Message) -> Self {
        Self { header, message }
    }

    /// Action kind code, used for logging and dispatch tables. Codes
    /// are stable across releases; new kinds append.
    pub fn kind(&self) -> u16 {
        match self.message {
            Message::Announce { .. } => kinds::ANNOUNCE,
            Message::AnnounceReply { .. } => kinds::ANNOUNCE_REPLY,
            Message::Leave => kinds::LEAVE,
            Message::SetClientAddress { .. } => kinds::SET_CLIENT_ADDRESS,
            Message::SetPatch { .. } => kinds::SET_PATCH,
            Message::ListDevices => kinds::LIST_DEVICES,
            Message::ListDevicesReply { .. } => kinds::LIST_DEVICES_REPLY,
            Message::ListPatches => kinds::LIST_PATCHES,
            Message::ListPatchesReply { .. } => kinds::LIST_PATCHES_REPLY,
            Message::FindResource { .. } => kinds::FIND_RESOURCE,
            Message::AdvertiseResource { .. } => kinds::ADVERTISE_RESOURCE,
            Message::PushResource { .. } => kinds::PUSH_RESOURCE,
            Message::ResetAll => kinds::RESET_ALL,
            Message::ResetChannel => kinds::RESET_CHANNEL,
            Message::Promoted => kinds::PROMOTED,
            Message::Demoted => kinds::DEMOTED,
            Message::ReportError { .. } => kinds::REPORT_ERROR,
            Message::OutletChange { .. } => kinds::OUTLET_CHANGE,
        }
    }
}

pub mod kinds {
    pub const ANNOUNCE: u16 = 0x0001;
    pub const ANNOUNCE_REPLY: u16 = 0x0002;
    pub const LEAVE: u16 = 0x0003;
    pub const SET_CLIENT_ADDRESS: u16 = 0x0010;
    pub const SET_PATCH: u16 = 0x0011;
    pub const LIST_DEVICES: u16 = 0x0012;
    pub const LIST_DEVICES_REPLY: u16 = 0x0013;
    pub const LIST_PATCHES: u16 = 0x0014;
    pub const LIST_PATCHES_REPLY: u16 = 0x0015;
    pub const FIND_RESOURCE: u16 = 0x0020;
    pub const ADVERTISE_RESOURCE: u16 = 0x0021;
    pub const PUSH_RESOURCE: u16 = 0x0022;
    pub const RESET_ALL: u16 = 0x0030;
    pub const RESET_CHANNEL: u16 = 0x0031;
    pub const PROMOTED: u16 = 0x0032;
    pub const DEMOTED: u16 = 0x0033;
    pub const REPORT_ERROR: u16 = 0x0034;
    pub const OUTLET_CHANGE: u16 = 0x0040;
}

pub fn encode(packet: &Packet) -> Result<Bytes, NetError> {
    let payload = postcard::to_allocvec(packet)?;
    Ok(Bytes::from(payload))
}

pub fn decode(buf: &[u8]) -> Result<Packet, NetError> {
    postcard::from_bytes(buf).map_err(NetError::Serialization)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_encode_decode() {
        let sender = InstanceId::from_raw(42);
        let messages = vec![
            Message::Announce {
                role: Role::Master,
                features: 0b101,
                addressing: String::new(),
                hostname: "stage-a".into(),
            },
            Message::AnnounceReply {
                role: Role::Client,
                features: 0,
                addressing: "1-4".into(),
                hostname: "stage-b".into(),
            },
            Message::Leave,
            Message::SetClientAddress {
                addressing: "2 3".into(),
            },
            Message::SetPatch {
                patch_id: 1,
                device_id: 9,
            },
            Message::ListDevicesReply {
                total: 1,
                devices: vec![(
                    9,
                    DeviceInfo {
                        name: "out-1".into(),
                        kind: "video".into(),
                    },
                )],
            },
            Message::FindResource {
                resource: "media/intro.mov".into(),
            },
            Message::AdvertiseResource {
                resource: "media/intro.mov".into(),
                url: "/res/media/intro.mov?t=1&sig=ab".into(),
                port: 10918,
            },
            Message::ReportError {
                severity: Severity::Warning,
                text: "no output device".into(),
            },
            Message::OutletChange {
                outlet: "opacity".into(),
                value: 0.5,
            },
        ];

        for message in messages {
            let packet = Packet::new(Header::plain(sender), message);
            let buf = encode(&packet).unwrap();
            let decoded = decode(&buf).unwrap();
            assert_eq!(decoded.kind(), packet.kind());
            assert_eq!(decoded.header.sender, sender);
            let rebuf = encode(&decoded).unwrap();
            assert_eq!(buf, rebuf);
        }
    }

    #[test]
    fn test_header_txn_tagging() {
        let sender = InstanceId::from_raw(1);
        let plain = Header::plain(sender);
        assert_eq!(plain.txn, NO_TXN);

        let tagged = Header::with_txn(sender, 17);
        assert_eq!(tagged.txn, 17);
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode(&[0xff, 0xff, 0xff, 0xff, 0xff]).is_err());
    }

    #[test]
    fn test_kind_codes_distinct() {
        use std::collections::HashSet;

        let codes = [
            kinds::ANNOUNCE,
            kinds::ANNOUNCE_REPLY,
            kinds::LEAVE,
            kinds::SET_CLIENT_ADDRESS,
            kinds::SET_PATCH,
            kinds::LIST_DEVICES,
            kinds::LIST_DEVICES_REPLY,
            kinds::LIST_PATCHES,
            kinds::LIST_PATCHES_REPLY,
            kinds::FIND_RESOURCE,
            kinds::ADVERTISE_RESOURCE,
            kinds::PUSH_RESOURCE,
            kinds::RESET_ALL,
            kinds::RESET_CHANNEL,
            kinds::PROMOTED,
            kinds::DEMOTED,
            kinds::REPORT_ERROR,
            kinds::OUTLET_CHANGE,
        ];
        let set: HashSet<u16> = codes.iter().copied().collect();
        assert_eq!(set.len(), codes.len());
    }
}
