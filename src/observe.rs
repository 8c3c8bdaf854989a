/// Turn sniffed 802.11 frames and BLE advertisements into observations.
///
/// WiFi: management frames are classified with the ieee80211 crate; the
/// information elements that carry channel and security are walked by hand.
/// Data frames yield AP/station associations from their DS bits.
/// BLE: advertisement data (AD structures) is walked for the local name.
///
/// Everything here is allocation-free and safe to call from the sniffer
/// callback.
use ieee80211::match_frames;
use ieee80211::mgmt_frame::{BeaconFrame, ProbeRequestFrame, ProbeResponseFrame};

use crate::provider::Observation;
use crate::target::{MacAddr, Security, Target, TargetKind};

/// One WiFi scan sweep visits these channels in order, then wraps.
pub const WIFI_CHANNELS: &[u8] = &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13];

/// Time spent on each sweep channel before hopping. Covers at least one
/// beacon interval of a typical AP.
pub const DEFAULT_DWELL_MS: u64 = 120;

/// 802.11 MAC header without QoS control
const HEADER_LEN: usize = 24;

/// Beacon / probe response fixed fields: timestamp, interval, capability
const FIXED_PARAMS_LEN: usize = 12;

const CAPABILITY_PRIVACY: u16 = 0x0010;

const IE_DS_PARAMETER_SET: u8 = 3;
const IE_RSN: u8 = 48;
const IE_VENDOR: u8 = 221;

const WPA_OUI_TYPE: [u8; 4] = [0x00, 0x50, 0xF2, 0x01];
const RSN_OUI: [u8; 3] = [0x00, 0x0F, 0xAC];

/// LLC/SNAP header announcing an EAPOL payload (ethertype 0x888E)
const EAPOL_SNAP: [u8; 8] = [0xAA, 0xAA, 0x03, 0x00, 0x00, 0x00, 0x88, 0x8E];
const EAPOL_TYPE_KEY: u8 = 3;

/// PMKID key data encapsulation: vendor KDE header, length 20, OUI 00-0F-AC, type 4
const PMKID_KDE: [u8; 6] = [0xDD, 0x14, 0x00, 0x0F, 0xAC, 0x04];
pub const PMKID_LEN: usize = 16;

/// Parse a raw 802.11 frame into an observation.
///
/// Beacons and probe responses become access points, probe requests become
/// stations, and data frames between an AP and a unicast station become
/// associations. Anything else is ignored.
pub fn parse_wifi_frame(frame: &[u8], rssi: i8, channel: u8) -> Option<Observation> {
    let result = match_frames! {
        frame,
        beacon = BeaconFrame<'_> => {
            access_point(
                &beacon.header.transmitter_address.0,
                beacon.body.ssid().unwrap_or(""),
                frame,
                rssi,
                channel,
            )
        }
        probe_resp = ProbeResponseFrame<'_> => {
            access_point(
                &probe_resp.header.transmitter_address.0,
                probe_resp.body.ssid().unwrap_or(""),
                frame,
                rssi,
                channel,
            )
        }
        probe_req = ProbeRequestFrame<'_> => {
            let mut sta = Target::new(probe_req.header.transmitter_address.0, TargetKind::Station)
                .with_name(probe_req.body.ssid().unwrap_or(""))
                .with_channel(channel);
            sta.rssi = rssi;
            Observation::Device(sta)
        }
    };

    match result {
        Ok(observation) => Some(observation),
        Err(_) => parse_data_frame(frame, rssi, channel),
    }
}

fn access_point(mac: &MacAddr, ssid: &str, frame: &[u8], rssi: i8, rx_channel: u8) -> Observation {
    let (ds_channel, security) = match frame.get(HEADER_LEN..) {
        Some(body) => management_details(body),
        None => (None, Security::Unknown),
    };
    let mut ap = Target::new(*mac, TargetKind::AccessPoint)
        .with_name(ssid)
        .with_channel(ds_channel.unwrap_or(rx_channel));
    ap.rssi = rssi;
    ap.security = security;
    Observation::Device(ap)
}

/// Channel (from the DS parameter set) and security class of a beacon or
/// probe response body, starting at the fixed parameters.
pub fn management_details(body: &[u8]) -> (Option<u8>, Security) {
    if body.len() < FIXED_PARAMS_LEN {
        return (None, Security::Unknown);
    }
    let capability = u16::from_le_bytes([body[10], body[11]]);
    let mut channel = None;
    let mut rsn = None;
    let mut wpa = false;

    for (id, data) in elements(&body[FIXED_PARAMS_LEN..]) {
        match id {
            IE_DS_PARAMETER_SET if !data.is_empty() => channel = Some(data[0]),
            IE_RSN => rsn = Some(rsn_security(data)),
            IE_VENDOR if data.starts_with(&WPA_OUI_TYPE) => wpa = true,
            _ => {}
        }
    }

    let security = match rsn {
        Some(security) => security,
        None if wpa => Security::Wpa,
        None if capability & CAPABILITY_PRIVACY != 0 => Security::Wep,
        None => Security::Open,
    };
    (channel, security)
}

/// Iterate `(element id, data)` pairs, stopping at the first truncated one.
fn elements(mut ies: &[u8]) -> impl Iterator<Item = (u8, &[u8])> {
    core::iter::from_fn(move || {
        if ies.len() < 2 {
            return None;
        }
        let id = ies[0];
        let len = ies[1] as usize;
        let data = ies.get(2..2 + len)?;
        ies = &ies[2 + len..];
        Some((id, data))
    })
}

/// Classify an RSN element by its AKM suites.
///
/// PSK beats SAE (transition-mode networks still accept WPA2 clients), and
/// any 802.1X suite marks the network as enterprise.
fn rsn_security(rsn: &[u8]) -> Security {
    // version(2) group cipher(4) pairwise count(2)
    let Some(pairwise) = rsn.get(6..8) else {
        return Security::Wpa2;
    };
    let pairwise = u16::from_le_bytes([pairwise[0], pairwise[1]]) as usize;
    let akm_at = 8 + pairwise * 4;
    let Some(count) = rsn.get(akm_at..akm_at + 2) else {
        return Security::Wpa2;
    };
    let count = u16::from_le_bytes([count[0], count[1]]) as usize;
    let Some(suites) = rsn.get(akm_at + 2..akm_at + 2 + count * 4) else {
        return Security::Wpa2;
    };

    let (mut psk, mut sae, mut eap) = (false, false, false);
    for suite in suites.chunks_exact(4) {
        if suite[..3] != RSN_OUI {
            continue;
        }
        match suite[3] {
            1 | 3 | 5 => eap = true,
            2 | 4 | 6 => psk = true,
            8 | 9 => sae = true,
            _ => {}
        }
    }

    if eap {
        Security::Enterprise
    } else if psk {
        Security::Wpa2
    } else if sae {
        Security::Wpa3
    } else {
        Security::Wpa2
    }
}

fn mac_at(frame: &[u8], offset: usize) -> Option<MacAddr> {
    frame.get(offset..offset + 6)?.try_into().ok()
}

fn is_unicast(mac: &MacAddr) -> bool {
    mac[0] & 0x01 == 0
}

fn is_data_frame(frame: &[u8]) -> bool {
    frame.len() >= HEADER_LEN && (frame[0] >> 2) & 0x3 == 2
}

/// AP/station pair of a data frame, from its ToDS/FromDS bits.
fn parse_data_frame(frame: &[u8], rssi: i8, channel: u8) -> Option<Observation> {
    if !is_data_frame(frame) {
        return None;
    }
    let to_ds = frame[1] & 0x01 != 0;
    let from_ds = frame[1] & 0x02 != 0;
    let addr1 = mac_at(frame, 4)?;
    let addr2 = mac_at(frame, 10)?;

    let (ap, station) = match (to_ds, from_ds) {
        // Station → AP: addr1 is the BSSID
        (true, false) => (addr1, addr2),
        // AP → station: addr2 is the BSSID
        (false, true) => (addr2, addr1),
        // Ad-hoc and WDS frames carry no AP/station relation
        _ => return None,
    };
    if !is_unicast(&station) {
        return None;
    }
    Some(Observation::Association {
        ap,
        station,
        rssi,
        channel,
    })
}

/// Payload of a data frame after its MAC header (QoS control included).
fn data_payload(frame: &[u8]) -> Option<&[u8]> {
    if !is_data_frame(frame) {
        return None;
    }
    // Subtype bit 3 marks QoS data, which adds a 2-byte control field
    let qos = frame[0] & 0x80 != 0;
    let header = if qos { HEADER_LEN + 2 } else { HEADER_LEN };
    frame.get(header..)
}

/// Whether the frame carries an EAPOL-Key message (a handshake step).
pub fn is_eapol_key(frame: &[u8]) -> bool {
    let Some(payload) = data_payload(frame) else {
        return false;
    };
    // SNAP header, then EAPOL version(1) and type(1)
    payload.starts_with(&EAPOL_SNAP) && payload.get(EAPOL_SNAP.len() + 1) == Some(&EAPOL_TYPE_KEY)
}

/// The PMKID carried in the key data of an EAPOL-Key message, if any.
pub fn find_pmkid(frame: &[u8]) -> Option<&[u8]> {
    if !is_eapol_key(frame) {
        return None;
    }
    let payload = data_payload(frame)?;
    let at = payload
        .windows(PMKID_KDE.len())
        .position(|w| w == PMKID_KDE)?;
    let start = at + PMKID_KDE.len();
    payload.get(start..start + PMKID_LEN)
}

/// Parse BLE advertisement data (AD structures) into a BLE device target.
///
/// AD structure format: [length] [type] [data...]
/// Only the shortened (0x08) and complete (0x09) local names are read.
pub fn parse_advertisement(addr: &MacAddr, rssi: i8, ad_data: &[u8]) -> Target {
    let mut device = Target::new(*addr, TargetKind::BleDevice);
    device.rssi = rssi;

    let mut pos = 0;
    while pos < ad_data.len() {
        let len = ad_data[pos] as usize;
        if len == 0 || pos + 1 + len > ad_data.len() {
            break;
        }

        let ad_type = ad_data[pos + 1];
        let data = &ad_data[pos + 2..pos + 1 + len];

        // Shortened or Complete local name; the complete one wins
        if ad_type == 0x09 || (ad_type == 0x08 && device.name.is_empty()) {
            if let Ok(name) = core::str::from_utf8(data) {
                device.name.clear();
                crate::target::set_name(&mut device.name, name);
            }
        }

        pos += 1 + len;
    }

    device
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::vec::Vec;

    const AP: MacAddr = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
    const STA: MacAddr = [0x0A, 0x66, 0x77, 0x88, 0x99, 0xAA];

    fn data_frame(flags: u8, addr1: MacAddr, addr2: MacAddr, qos: bool, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.push(if qos { 0x88 } else { 0x08 });
        frame.push(flags);
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&addr1);
        frame.extend_from_slice(&addr2);
        frame.extend_from_slice(&AP);
        frame.extend_from_slice(&[0, 0]);
        if qos {
            frame.extend_from_slice(&[0, 0]);
        }
        frame.extend_from_slice(payload);
        frame
    }

    fn eapol_key(key_data: &[u8]) -> Vec<u8> {
        let mut payload = EAPOL_SNAP.to_vec();
        // version 2, type key, body length (unchecked)
        payload.extend_from_slice(&[0x02, EAPOL_TYPE_KEY, 0x00, 0x75]);
        payload.extend_from_slice(&[0u8; 20]);
        payload.extend_from_slice(key_data);
        payload
    }

    fn body(capability: u16, ies: &[u8]) -> Vec<u8> {
        let mut body = std::vec![0u8; 10];
        body.extend_from_slice(&capability.to_le_bytes());
        body.extend_from_slice(ies);
        body
    }

    fn rsn(akms: &[u8]) -> Vec<u8> {
        let mut ie = std::vec![IE_RSN, 0];
        ie.extend_from_slice(&[0x01, 0x00]); // version
        ie.extend_from_slice(&[0x00, 0x0F, 0xAC, 0x04]); // group CCMP
        ie.extend_from_slice(&[0x01, 0x00, 0x00, 0x0F, 0xAC, 0x04]); // one pairwise
        ie.extend_from_slice(&[akms.len() as u8, 0x00]);
        for akm in akms {
            ie.extend_from_slice(&[0x00, 0x0F, 0xAC, *akm]);
        }
        ie[1] = (ie.len() - 2) as u8;
        ie
    }

    // ── Management frame details ────────────────────────────────────

    #[test]
    fn open_network_without_privacy_bit() {
        let ies = [IE_DS_PARAMETER_SET, 1, 11];
        assert_eq!(management_details(&body(0x0001, &ies)), (Some(11), Security::Open));
    }

    #[test]
    fn privacy_without_rsn_is_wep() {
        assert_eq!(management_details(&body(0x0011, &[])), (None, Security::Wep));
    }

    #[test]
    fn wpa_vendor_element() {
        let ies = [IE_VENDOR, 6, 0x00, 0x50, 0xF2, 0x01, 0x01, 0x00];
        assert_eq!(management_details(&body(0x0011, &ies)).1, Security::Wpa);
    }

    #[test]
    fn rsn_akm_classification() {
        assert_eq!(management_details(&body(0x0011, &rsn(&[2]))).1, Security::Wpa2);
        assert_eq!(management_details(&body(0x0011, &rsn(&[8]))).1, Security::Wpa3);
        assert_eq!(management_details(&body(0x0011, &rsn(&[2, 8]))).1, Security::Wpa2);
        assert_eq!(management_details(&body(0x0011, &rsn(&[1]))).1, Security::Enterprise);
    }

    #[test]
    fn truncated_elements_stop_the_walk() {
        let ies = [IE_DS_PARAMETER_SET, 1, 6, IE_RSN, 40, 0x01];
        assert_eq!(management_details(&body(0x0001, &ies)), (Some(6), Security::Open));
        assert_eq!(management_details(&[0u8; 4]), (None, Security::Unknown));
    }

    // ── Data frames ─────────────────────────────────────────────────

    #[test]
    fn to_ds_data_frame_links_station_to_ap() {
        let frame = data_frame(0x01, AP, STA, false, &[0u8; 8]);
        assert_eq!(
            parse_wifi_frame(&frame, -55, 6),
            Some(Observation::Association {
                ap: AP,
                station: STA,
                rssi: -55,
                channel: 6
            })
        );
    }

    #[test]
    fn from_ds_data_frame_links_station_to_ap() {
        let frame = data_frame(0x02, STA, AP, true, &[0u8; 8]);
        match parse_wifi_frame(&frame, -40, 1) {
            Some(Observation::Association { ap, station, .. }) => {
                assert_eq!(ap, AP);
                assert_eq!(station, STA);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn broadcast_and_wds_frames_are_ignored() {
        let broadcast = data_frame(0x02, [0xFF; 6], AP, false, &[]);
        assert_eq!(parse_wifi_frame(&broadcast, -40, 1), None);
        let wds = data_frame(0x03, AP, STA, false, &[]);
        assert_eq!(parse_wifi_frame(&wds, -40, 1), None);
    }

    #[test]
    fn short_frames_are_ignored() {
        assert_eq!(parse_wifi_frame(&[0x08, 0x01, 0x00], -40, 1), None);
    }

    // ── EAPOL / PMKID ───────────────────────────────────────────────

    #[test]
    fn eapol_key_is_detected_in_plain_and_qos_frames() {
        let plain = data_frame(0x02, STA, AP, false, &eapol_key(&[]));
        let qos = data_frame(0x02, STA, AP, true, &eapol_key(&[]));
        assert!(is_eapol_key(&plain));
        assert!(is_eapol_key(&qos));

        let other = data_frame(0x02, STA, AP, false, &[0xAA, 0xAA, 0x03, 0, 0, 0, 0x08, 0x00]);
        assert!(!is_eapol_key(&other));
    }

    #[test]
    fn pmkid_is_extracted_from_key_data() {
        let mut kde = PMKID_KDE.to_vec();
        kde.extend(1..=16u8);
        let frame = data_frame(0x02, STA, AP, true, &eapol_key(&kde));
        let pmkid = find_pmkid(&frame).unwrap();
        assert_eq!(pmkid.len(), PMKID_LEN);
        assert_eq!(pmkid[0], 1);
        assert_eq!(pmkid[15], 16);

        let without = data_frame(0x02, STA, AP, true, &eapol_key(&[0xDD, 0x00]));
        assert_eq!(find_pmkid(&without), None);
    }

    // ── BLE advertisements ──────────────────────────────────────────

    #[test]
    fn parse_ble_complete_name() {
        // Flags, then complete local name "Buds"
        let ad = [0x02, 0x01, 0x06, 0x05, 0x09, b'B', b'u', b'd', b's'];
        let device = parse_advertisement(&STA, -62, &ad);
        assert_eq!(device.kind(), TargetKind::BleDevice);
        assert_eq!(device.name.as_str(), "Buds");
        assert_eq!(device.rssi, -62);
        assert_eq!(device.security, Security::NotApplicable);
    }

    #[test]
    fn complete_name_beats_shortened() {
        let ad = [0x03, 0x08, b'T', b'V', 0x06, 0x09, b'T', b'V', b'-', b'4', b'K'];
        assert_eq!(parse_advertisement(&STA, -70, &ad).name.as_str(), "TV-4K");
        let reversed = [0x06, 0x09, b'T', b'V', b'-', b'4', b'K', 0x03, 0x08, b'T', b'V'];
        assert_eq!(parse_advertisement(&STA, -70, &reversed).name.as_str(), "TV-4K");
    }

    #[test]
    fn truncated_ad_structure_is_ignored() {
        let ad = [0x02, 0x01, 0x06, 0x09, 0x09, b'X'];
        assert!(parse_advertisement(&STA, -70, &ad).is_hidden());
    }
}
