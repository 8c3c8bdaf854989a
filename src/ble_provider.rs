//! BLE capability provider.
//!
//! The trouble-host stack is async and runs in the main task alongside its
//! runner. The provider is synchronous, so the two talk through statics: a
//! signal carrying what the stack should do next, and a bounded channel of
//! parsed advertisement reports coming back.

use core::cell::Cell;
use core::sync::atomic::{AtomicU32, Ordering};

use critical_section::Mutex;
use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::{Duration, Timer};
use trouble_host::prelude::*;

use nightjar::actions::ActionType;
use nightjar::observe;
use nightjar::provider::{CapabilityProvider, Observation};
use nightjar::radio::RadioOwner;
use nightjar::target::{MacAddr, NameString, Target};

/// Advertising interval used by the clone flood
const ADV_INTERVAL_MS: u64 = 20;

/// How long one advertising round runs before the counter is updated
const ADV_ROUND_MS: u64 = 200;

#[derive(Debug, Clone)]
pub enum BleCommand {
    Idle,
    Scan,
    /// Advertise under a cloned name
    Advertise { name: NameString },
}

static COMMAND: Signal<CriticalSectionRawMutex, BleCommand> = Signal::new();
static REPORTS: Channel<CriticalSectionRawMutex, Target, 16> = Channel::new();

/// Device whose reports count as tracking hits
static TRACKED: Mutex<Cell<Option<MacAddr>>> = Mutex::new(Cell::new(None));
static TRACK_HITS: AtomicU32 = AtomicU32::new(0);
static ADS_SENT: AtomicU32 = AtomicU32::new(0);

/// EventHandler for BLE advertisement reports from trouble-host.
///
/// Called synchronously from the runner; must not block.
pub struct ScanEventHandler;

impl EventHandler for ScanEventHandler {
    fn on_adv_reports(&self, mut it: LeAdvReportsIter<'_>) {
        while let Some(Ok(report)) = it.next() {
            let Ok(addr) = <[u8; 6]>::try_from(report.addr.raw()) else {
                continue;
            };
            let device = observe::parse_advertisement(&addr, report.rssi, report.data);
            let tracked = critical_section::with(|cs| TRACKED.borrow(cs).get());
            if tracked == Some(addr) {
                TRACK_HITS.fetch_add(1, Ordering::Relaxed);
            }
            let _ = REPORTS.try_send(device);
        }
    }
}

fn set_tracked(mac: Option<MacAddr>) {
    critical_section::with(|cs| TRACKED.borrow(cs).set(mac));
}

/// Drive the BLE stack from [`BleCommand`]s. Never returns.
pub async fn control<'d, C: Controller, P: PacketPool>(
    central: Central<'d, C, P>,
    mut peripheral: Peripheral<'d, C, P>,
) {
    let mut scanner = Scanner::new(central);
    let mut command = BleCommand::Idle;
    loop {
        command = match command {
            BleCommand::Idle => COMMAND.wait().await,
            BleCommand::Scan => match scanner.scan(&ScanConfig::default()).await {
                // Reports flow through ScanEventHandler while the session lives
                Ok(_session) => COMMAND.wait().await,
                Err(e) => {
                    log::error!("BLE scan failed to start: {:?}", e);
                    COMMAND.wait().await
                }
            },
            BleCommand::Advertise { name } => advertise(&mut peripheral, &name).await,
        };
    }
}

/// Advertise `name` until the next command arrives, which is returned.
async fn advertise<'d, C: Controller, P: PacketPool>(
    peripheral: &mut Peripheral<'d, C, P>,
    name: &str,
) -> BleCommand {
    let mut adv_data = [0u8; 31];
    let adv_len = match AdStructure::encode_slice(
        &[
            AdStructure::Flags(LE_GENERAL_DISCOVERABLE | BR_EDR_NOT_SUPPORTED),
            AdStructure::CompleteLocalName(name.as_bytes()),
        ],
        &mut adv_data[..],
    ) {
        Ok(len) => len,
        Err(e) => {
            log::error!("Ad encode error: {:?}", e);
            return COMMAND.wait().await;
        }
    };
    let params = AdvertisementParameters {
        interval_min: Duration::from_millis(ADV_INTERVAL_MS),
        interval_max: Duration::from_millis(ADV_INTERVAL_MS),
        ..Default::default()
    };

    loop {
        let advertiser = match peripheral
            .advertise(
                &params,
                Advertisement::NonconnectableScannableUndirected {
                    adv_data: &adv_data[..adv_len],
                    scan_data: &[],
                },
            )
            .await
        {
            Ok(adv) => adv,
            Err(e) => {
                log::error!("BLE advertise error: {:?}", e);
                return COMMAND.wait().await;
            }
        };

        match select(COMMAND.wait(), Timer::after(Duration::from_millis(ADV_ROUND_MS))).await {
            Either::First(next) => return next,
            Either::Second(()) => {
                ADS_SENT.fetch_add((ADV_ROUND_MS / ADV_INTERVAL_MS) as u32, Ordering::Relaxed);
            }
        }
        drop(advertiser);
    }
}

pub struct BleProvider {
    up: bool,
    action: Option<ActionType>,
}

impl BleProvider {
    pub const fn new() -> Self {
        Self {
            up: false,
            action: None,
        }
    }
}

impl CapabilityProvider for BleProvider {
    fn name(&self) -> &'static str {
        "ble"
    }

    fn init(&mut self) -> bool {
        COMMAND.signal(BleCommand::Idle);
        true
    }

    fn on_tick(&mut self, _now_ms: u64) {}

    fn stop_hardware_activities(&mut self) {
        if let Some(action) = self.action.take() {
            log::info!("BLE: {} stopped", action.slug());
        }
        set_tracked(None);
        COMMAND.signal(BleCommand::Idle);
    }

    fn radio_up(&mut self, owner: RadioOwner) -> bool {
        self.up = owner == RadioOwner::Ble;
        self.up
    }

    fn radio_down(&mut self, _owner: RadioOwner) {
        self.stop_hardware_activities();
        self.up = false;
        while REPORTS.try_receive().is_ok() {}
    }

    fn begin_scan(&mut self, _duration_ms: Option<u32>) -> bool {
        if !self.up {
            return false;
        }
        COMMAND.signal(BleCommand::Scan);
        true
    }

    fn begin_action(&mut self, action: ActionType, target: &Target) -> bool {
        if !self.up {
            return false;
        }
        match action {
            ActionType::BleCloneFlood => {
                ADS_SENT.store(0, Ordering::Relaxed);
                COMMAND.signal(BleCommand::Advertise {
                    name: target.name.clone(),
                });
            }
            ActionType::BleTrack => {
                TRACK_HITS.store(0, Ordering::Relaxed);
                set_tracked(Some(*target.mac()));
                COMMAND.signal(BleCommand::Scan);
            }
            _ => return false,
        }
        self.action = Some(action);
        true
    }

    fn units_sent(&self) -> u32 {
        match self.action {
            Some(ActionType::BleCloneFlood) => ADS_SENT.load(Ordering::Relaxed),
            Some(ActionType::BleTrack) => TRACK_HITS.load(Ordering::Relaxed),
            _ => 0,
        }
    }

    fn poll_observation(&mut self) -> Option<Observation> {
        REPORTS.try_receive().ok().map(Observation::Device)
    }
}
