use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Random per-process node identity, stable for the process lifetime.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, PartialOrd, Ord, Serialize)]
pub struct InstanceId(u32);

impl InstanceId {
    pub fn generate() -> Self {
        Self(rand::random::<u32>())
    }

    pub fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum Role {
    #[default]
    None,
    Master,
    Client,
}

impl Role {
    pub fn is_master(self) -> bool {
        self == Role::Master
    }
}

/// Capability flags carried in every announce. Recomputed per announce,
/// never cached across role changes.
pub mod features {
    pub const PRIMARY: u32 = 1 << 0;
    pub const FAILOVER: u32 = 1 << 1;
    pub const FILE_SERVER: u32 = 1 << 2;
    pub const POWER_CONTROL: u32 = 1 << 3;
    pub const WAKE_ON_LAN: u32 = 1 << 4;

    pub fn has(mask: u32, flag: u32) -> bool {
        mask & flag != 0
    }
}

/// One addressable output device on a client node, as reported by a
/// list-devices reply.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: String,
}

/// Parse an addressing filter string into the set of group ids it
/// accepts. The format is space-separated group ids and `a-b` ranges;
/// malformed tokens are skipped rather than rejected, since filters are
/// operator-typed and arrive from remote nodes.
pub fn parse_groups(addressing: &str) -> BTreeSet<u16> {
    let mut groups = BTreeSet::new();
    for token in addressing.split_whitespace() {
        if let Some((lo, hi)) = token.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<u16>(), hi.parse::<u16>()) {
                if lo <= hi {
                    groups.extend(lo..=hi);
                }
            }
        } else if let Ok(id) = token.parse::<u16>() {
            groups.insert(id);
        }
    }
    groups
}
