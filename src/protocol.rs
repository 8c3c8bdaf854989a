/// JSON message protocol for the serial console and the record sink.
///
/// All messages are newline-delimited JSON (NDJSON).
/// Uses `heapless` types so serialization never touches the heap.
use core::fmt::Write;

use heapless::{String, Vec};
use serde::{Deserialize, Serialize};

use crate::actions::{ActionType, AvailableAction};
use crate::ipc::ActionProgress;
use crate::target::{format_mac, MacAddr, MacString, Target};

/// Artifact bytes carried by one record, hex-encoded
pub const MAX_ARTIFACT_BYTES: usize = 96;

pub type HexString = String<{ MAX_ARTIFACT_BYTES * 2 }>;

/// A target as it appears on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct TargetView<'a> {
    /// Position in the last listing, used by `actions` / `start`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idx: Option<u8>,
    pub mac: MacString,
    pub kind: &'static str,
    pub name: &'a str,
    pub rssi: i8,
    pub sec: &'static str,
    pub ch: u8,
    pub band: &'static str,
    pub clients: u8,
    pub suspicious: bool,
    /// Uptime in milliseconds when last observed
    pub seen: u32,
}

impl<'a> TargetView<'a> {
    pub fn new(target: &'a Target, idx: Option<u8>) -> Self {
        Self {
            idx,
            mac: mac_string(target.mac()),
            kind: target.kind().as_str(),
            name: target.name.as_str(),
            rssi: target.rssi,
            sec: target.security.as_str(),
            ch: target.channel,
            band: target.band.as_str(),
            clients: target.client_count().min(u8::MAX as usize) as u8,
            suspicious: target.flags.suspicious,
            seen: target.last_seen_ms.min(u32::MAX as u64) as u32,
        }
    }
}

/// An action lifecycle snapshot as it appears on the wire.
#[derive(Debug, Clone, Serialize)]
pub struct ActionView<'a> {
    pub action: &'static str,
    pub mac: MacString,
    pub kind: &'static str,
    pub result: &'static str,
    pub status: &'a str,
    /// Milliseconds since the action started
    pub elapsed: u32,
    pub units: u32,
    /// True exactly once per action, on the terminal report
    pub done: bool,
}

impl<'a> ActionView<'a> {
    pub fn new(progress: &'a ActionProgress, done: bool) -> Self {
        Self {
            action: progress.action.slug(),
            mac: mac_string(&progress.target.mac),
            kind: progress.target.kind.as_str(),
            result: progress.result.as_str(),
            status: progress.status.as_str(),
            elapsed: progress.elapsed_ms.min(u32::MAX as u64) as u32,
            units: progress.units,
            done,
        }
    }
}

/// Messages the device writes to the console
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum DeviceMessage<'a> {
    /// Newly discovered target, or one row of a listing
    #[serde(rename = "target")]
    Target(TargetView<'a>),
    /// A station seen talking to an access point
    #[serde(rename = "assoc")]
    Association { ap: MacString, sta: MacString },
    /// Scan progress: `done` is false while running
    #[serde(rename = "scan")]
    Scan { targets: u32, done: bool },
    #[serde(rename = "action")]
    Action(ActionView<'a>),
    /// One action the operator may start on the selected target
    #[serde(rename = "option")]
    ActionOption {
        idx: u8,
        action: &'static str,
        label: &'static str,
        description: &'static str,
        destructive: bool,
    },
    /// Why an action is unavailable
    #[serde(rename = "unavailable")]
    Unavailable {
        action: &'static str,
        reason: &'static str,
    },
    /// Device status report
    #[serde(rename = "status")]
    Status {
        radio: &'static str,
        targets: u32,
        /// Events dropped on a full queue since boot
        dropped: u32,
        /// Lowest free heap seen, in bytes
        heap_low: u32,
        /// Uptime in seconds
        uptime: u32,
        board: &'static str,
        version: &'static str,
    },
    #[serde(rename = "error")]
    Error { msg: &'static str },
}

impl<'a> DeviceMessage<'a> {
    pub fn option(idx: u8, available: &AvailableAction) -> Self {
        DeviceMessage::ActionOption {
            idx,
            action: available.action.slug(),
            label: available.label,
            description: available.description,
            destructive: available.destructive,
        }
    }
}

/// Lines appended to the record sink
#[derive(Debug, Serialize)]
#[serde(tag = "rec")]
pub enum Record<'a> {
    #[serde(rename = "target")]
    Target(TargetView<'a>),
    #[serde(rename = "action")]
    Action(ActionView<'a>),
    /// Raw capture (handshake or PMKID frames), hex-encoded and truncated
    #[serde(rename = "artifact")]
    Artifact {
        action: &'static str,
        mac: MacString,
        /// Full artifact length; `hex` may be shorter
        len: u32,
        hex: &'a str,
    },
}

pub fn mac_string(mac: &MacAddr) -> MacString {
    let mut out = MacString::new();
    format_mac(mac, &mut out);
    out
}

/// Hex-encode up to [`MAX_ARTIFACT_BYTES`] of `bytes`.
pub fn hex_prefix(bytes: &[u8]) -> HexString {
    let mut out = HexString::new();
    for b in bytes.iter().take(MAX_ARTIFACT_BYTES) {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

pub fn artifact_record<'a>(
    action: ActionType,
    mac: &MacAddr,
    bytes: &[u8],
    hex: &'a HexString,
) -> Record<'a> {
    Record::Artifact {
        action: action.slug(),
        mac: mac_string(mac),
        len: bytes.len().min(u32::MAX as usize) as u32,
        hex: hex.as_str(),
    }
}

/// Commands read from the console.
///
/// Deserialized manually via [`RawCommand`] in `console::parse_command()` because
/// `serde_json_core` does not support internally tagged enums (`deserialize_any`).
#[derive(Debug, PartialEq)]
pub enum HostCommand {
    ScanWifi,
    /// Scan BLE for `ms` milliseconds (open-ended when absent)
    ScanBle { duration_ms: Option<u32> },
    StopScan,
    /// List targets; `sort` names a sort order, `kind` narrows to one kind
    List {
        sort: Option<String<8>>,
        kind: Option<String<4>>,
    },
    /// Show actions for target `idx` of the last listing
    Actions { idx: u8 },
    Start { idx: u8, action: ActionType },
    Stop,
    Status,
}

/// Wire format for host commands. A flat struct, so `serde_json_core` can
/// deserialize without `deserialize_any`.
#[derive(Deserialize)]
pub(crate) struct RawCommand {
    pub cmd: String<16>,
    #[serde(default)]
    pub idx: Option<u8>,
    #[serde(default)]
    pub action: Option<String<16>>,
    #[serde(default)]
    pub ms: Option<u32>,
    #[serde(default)]
    pub sort: Option<String<8>>,
    #[serde(default)]
    pub kind: Option<String<4>>,
}

/// Firmware version string
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum size of a serialized JSON message
pub const MAX_MSG_LEN: usize = 512;

/// Buffer type for serialized JSON messages
pub type MsgBuffer = Vec<u8, MAX_MSG_LEN>;

/// Serialize `msg` into `buf` followed by a newline.
/// Returns the number of bytes written, or None if it does not fit.
pub fn serialize_message<T: Serialize>(msg: &T, buf: &mut [u8]) -> Option<usize> {
    let len = serde_json_core::to_slice(msg, buf).ok()?;
    if len < buf.len() {
        buf[len] = b'\n';
        Some(len + 1)
    } else {
        None
    }
}

/// Serialize `msg` as one NDJSON line in a fresh buffer.
pub fn to_line<T: Serialize>(msg: &T) -> Option<MsgBuffer> {
    let mut buf = MsgBuffer::new();
    buf.resize_default(MAX_MSG_LEN).ok()?;
    let len = serialize_message(msg, &mut buf)?;
    buf.truncate(len);
    Some(buf)
}
