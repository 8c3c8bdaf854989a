/// Discovered wireless entities.
///
/// A [`Target`] is identified by its [`TargetKey`] (hardware address plus
/// entity kind). The key is fixed at construction; everything else is
/// observation data that the registry overwrites on every re-observation.
use heapless::{String, Vec};

/// 6-byte hardware address
pub type MacAddr = [u8; 6];

/// Maximum length for MAC address strings ("AA:BB:CC:DD:EE:FF")
pub type MacString = String<18>;

/// Maximum length for SSID / device name strings
pub type NameString = String<33>;

/// Maximum number of peer addresses tracked per target
pub const MAX_PEERS: usize = 8;

/// Entity kind, one half of the identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TargetKind {
    AccessPoint,
    Station,
    BleDevice,
    Infrared,
}

impl TargetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetKind::AccessPoint => "ap",
            TargetKind::Station => "sta",
            TargetKind::BleDevice => "ble",
            TargetKind::Infrared => "ir",
        }
    }

    /// Whether entities of this kind carry a WiFi security class.
    pub fn is_wifi(&self) -> bool {
        matches!(self, TargetKind::AccessPoint | TargetKind::Station)
    }
}

/// Security class advertised by a WiFi entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Security {
    Open,
    Wep,
    Wpa,
    Wpa2,
    Wpa3,
    Enterprise,
    Unknown,
    /// BLE and IR entities have no WiFi security class
    NotApplicable,
}

impl Security {
    pub fn as_str(&self) -> &'static str {
        match self {
            Security::Open => "open",
            Security::Wep => "wep",
            Security::Wpa => "wpa",
            Security::Wpa2 => "wpa2",
            Security::Wpa3 => "wpa3",
            Security::Enterprise => "enterprise",
            Security::Unknown => "unknown",
            Security::NotApplicable => "n/a",
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Security::Open)
    }
}

/// Operating band
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    Ghz2_4,
    Ghz5,
    NotApplicable,
}

impl Band {
    /// Derive the band from an 802.11 channel number. Channel 0 means
    /// "not a WiFi entity".
    pub fn from_channel(channel: u8) -> Self {
        match channel {
            1..=14 => Band::Ghz2_4,
            32..=177 => Band::Ghz5,
            _ => Band::NotApplicable,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Band::Ghz2_4 => "2.4GHz",
            Band::Ghz5 => "5GHz",
            Band::NotApplicable => "n/a",
        }
    }
}

/// Identity of a target. Unique within the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TargetKey {
    pub mac: MacAddr,
    pub kind: TargetKind,
}

/// Flags derived from observations rather than read off the air.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TargetFlags {
    /// Same SSID as another access point but a different security class
    pub suspicious: bool,
}

/// A discovered wireless entity.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    key: TargetKey,
    pub name: NameString,
    pub rssi: i8,
    pub security: Security,
    pub channel: u8,
    pub band: Band,
    /// Associated peers: stations of an AP, or the AP of a station
    pub peers: Vec<MacAddr, MAX_PEERS>,
    /// Uptime in milliseconds when last observed
    pub last_seen_ms: u64,
    pub flags: TargetFlags,
}

impl Target {
    pub fn new(mac: MacAddr, kind: TargetKind) -> Self {
        let security = if kind.is_wifi() {
            Security::Unknown
        } else {
            Security::NotApplicable
        };
        Self {
            key: TargetKey { mac, kind },
            name: NameString::new(),
            rssi: i8::MIN,
            security,
            channel: 0,
            band: Band::NotApplicable,
            peers: Vec::new(),
            last_seen_ms: 0,
            flags: TargetFlags::default(),
        }
    }

    /// Builder-style name setter; truncates to the name capacity.
    pub fn with_name(mut self, name: &str) -> Self {
        set_name(&mut self.name, name);
        self
    }

    /// Builder-style channel setter; the band follows the channel.
    pub fn with_channel(mut self, channel: u8) -> Self {
        self.channel = channel;
        self.band = Band::from_channel(channel);
        self
    }

    pub fn key(&self) -> TargetKey {
        self.key
    }

    pub fn mac(&self) -> &MacAddr {
        &self.key.mac
    }

    pub fn kind(&self) -> TargetKind {
        self.key.kind
    }

    pub fn client_count(&self) -> usize {
        self.peers.len()
    }

    /// An entity that beacons without a name (hidden SSID, anonymous BLE).
    pub fn is_hidden(&self) -> bool {
        self.name.is_empty()
    }

    /// Add a peer address. Returns true if the address was not yet known
    /// and there was room for it.
    pub fn add_peer(&mut self, peer: MacAddr) -> bool {
        if self.peers.contains(&peer) {
            return false;
        }
        self.peers.push(peer).is_ok()
    }

    /// Merge a re-observation of the same entity into this one.
    ///
    /// Observation fields are replaced wholesale; the peer set accumulates
    /// (up to capacity) and last-seen only moves forward.
    pub(crate) fn merge_from(&mut self, obs: &Target) {
        self.name = obs.name.clone();
        self.rssi = obs.rssi;
        self.security = obs.security;
        self.channel = obs.channel;
        self.band = obs.band;
        self.flags = obs.flags;
        for &peer in &obs.peers {
            self.add_peer(peer);
        }
        self.last_seen_ms = self.last_seen_ms.max(obs.last_seen_ms);
    }
}

/// Copy `src` into a bounded name, cutting at a char boundary if it does
/// not fit.
pub fn set_name(dst: &mut NameString, src: &str) {
    dst.clear();
    for c in src.chars() {
        if dst.push(c).is_err() {
            break;
        }
    }
}

/// Format a 6-byte MAC address into "AA:BB:CC:DD:EE:FF" string
pub fn format_mac(mac: &MacAddr, buf: &mut MacString) {
    use core::fmt::Write;
    buf.clear();
    let _ = write!(
        buf,
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    );
}

/// Parse "AA:BB:CC:DD:EE:FF" (either case) into a MAC address.
pub fn parse_mac(s: &str) -> Option<MacAddr> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        let part = parts.next()?;
        if part.len() != 2 {
            return None;
        }
        *byte = u8::from_str_radix(part, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    const AP: MacAddr = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];

    #[test]
    fn new_target_defaults_security_by_kind() {
        assert_eq!(Target::new(AP, TargetKind::AccessPoint).security, Security::Unknown);
        assert_eq!(Target::new(AP, TargetKind::BleDevice).security, Security::NotApplicable);
        assert!(Target::new(AP, TargetKind::Station).is_hidden());
    }

    #[test]
    fn band_follows_channel() {
        assert_eq!(Band::from_channel(6), Band::Ghz2_4);
        assert_eq!(Band::from_channel(36), Band::Ghz5);
        assert_eq!(Band::from_channel(0), Band::NotApplicable);
        let t = Target::new(AP, TargetKind::AccessPoint).with_channel(149);
        assert_eq!(t.band, Band::Ghz5);
    }

    #[test]
    fn add_peer_dedups_and_bounds() {
        let mut t = Target::new(AP, TargetKind::AccessPoint);
        assert!(t.add_peer([1; 6]));
        assert!(!t.add_peer([1; 6]));
        for i in 2..=MAX_PEERS as u8 {
            assert!(t.add_peer([i; 6]));
        }
        assert_eq!(t.client_count(), MAX_PEERS);
        assert!(!t.add_peer([0xEE; 6]), "full peer set must reject");
    }

    #[test]
    fn merge_overwrites_fields_and_accumulates_peers() {
        let mut stored = Target::new(AP, TargetKind::AccessPoint)
            .with_name("CoffeeShop")
            .with_channel(6);
        stored.security = Security::Wpa2;
        stored.rssi = -70;
        stored.last_seen_ms = 5_000;
        stored.add_peer([1; 6]);

        let mut obs = Target::new(AP, TargetKind::AccessPoint)
            .with_name("CoffeeShop-5G")
            .with_channel(11);
        obs.security = Security::Open;
        obs.rssi = -40;
        obs.last_seen_ms = 9_000;
        obs.add_peer([2; 6]);

        stored.merge_from(&obs);
        assert_eq!(stored.name.as_str(), "CoffeeShop-5G");
        assert_eq!(stored.rssi, -40);
        assert_eq!(stored.security, Security::Open);
        assert_eq!(stored.channel, 11);
        assert_eq!(stored.client_count(), 2);
        assert_eq!(stored.last_seen_ms, 9_000);
    }

    #[test]
    fn merge_never_moves_last_seen_backwards() {
        let mut stored = Target::new(AP, TargetKind::BleDevice);
        stored.last_seen_ms = 10_000;
        let mut obs = Target::new(AP, TargetKind::BleDevice);
        obs.last_seen_ms = 3_000;
        stored.merge_from(&obs);
        assert_eq!(stored.last_seen_ms, 10_000);
    }

    #[test]
    fn long_names_are_truncated() {
        let t = Target::new(AP, TargetKind::AccessPoint)
            .with_name("an-ssid-that-is-far-too-long-for-the-thirty-two-byte-limit");
        assert_eq!(t.name.len(), 33);
    }

    #[test]
    fn mac_format_and_parse() {
        let mut s = MacString::new();
        format_mac(&[0xB4, 0x1E, 0x52, 0xAB, 0xCD, 0xEF], &mut s);
        assert_eq!(s.as_str(), "B4:1E:52:AB:CD:EF");
        assert_eq!(parse_mac("b4:1e:52:ab:cd:ef"), Some([0xB4, 0x1E, 0x52, 0xAB, 0xCD, 0xEF]));
        assert_eq!(parse_mac("B4:1E:52:AB:CD"), None);
        assert_eq!(parse_mac("B4:1E:52:AB:CD:EF:00"), None);
        assert_eq!(parse_mac("B4-1E-52-AB-CD-EF"), None);
    }
}
