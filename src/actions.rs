/// Context-aware action resolver.
///
/// Maps a target's observed state to the actions that make sense for it.
/// Everything is driven by [`ACTION_TABLE`]: one row per action, carrying
/// both the validity predicates and the execution profile the orchestrator
/// uses to run it. The resolver is a pure function of the target with no
/// cached state.
use core::fmt;

use heapless::Vec;

use crate::board;
use crate::provider::Engine;
use crate::radio::RadioOwner;
use crate::target::{Band, Security, Target, TargetKind};

/// Upper bound on actions returned for one target
pub const MAX_ACTIONS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionType {
    Deauth,
    HandshakeCapture,
    PmkidCapture,
    BeaconClone,
    StationDeauth,
    KarmaLure,
    BleCloneFlood,
    BleTrack,
    IrPowerOff,
    IrReplay,
    SaveTarget,
}

impl ActionType {
    /// Wire name used by the console protocol and records.
    pub fn slug(&self) -> &'static str {
        match self {
            ActionType::Deauth => "deauth",
            ActionType::HandshakeCapture => "handshake",
            ActionType::PmkidCapture => "pmkid",
            ActionType::BeaconClone => "beacon_clone",
            ActionType::StationDeauth => "sta_deauth",
            ActionType::KarmaLure => "karma",
            ActionType::BleCloneFlood => "ble_flood",
            ActionType::BleTrack => "ble_track",
            ActionType::IrPowerOff => "ir_off",
            ActionType::IrReplay => "ir_replay",
            ActionType::SaveTarget => "save",
        }
    }

    pub fn from_slug(slug: &str) -> Option<Self> {
        ACTION_TABLE
            .iter()
            .map(|def| def.action)
            .find(|action| action.slug() == slug)
    }
}

/// Which target kinds an action applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindRequirement {
    Any,
    Only(TargetKind),
}

impl KindRequirement {
    fn accepts(&self, kind: TargetKind) -> bool {
        match self {
            KindRequirement::Any => true,
            KindRequirement::Only(required) => *required == kind,
        }
    }
}

/// When a running action counts as done before its timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Runs for the full timeout
    Timeout,
    /// Done once the provider holds the capture artifact
    CapturedArtifact,
    /// Done once the provider reports it has nothing left to send
    ProviderIdle,
    /// Done in the same loop iteration it started
    Immediate,
}

/// One row of the action table.
#[derive(Debug)]
pub struct ActionDef {
    pub action: ActionType,
    pub label: &'static str,
    pub description: &'static str,
    pub kind: KindRequirement,
    /// Target must have at least one associated peer
    pub requires_clients: bool,
    /// Security class the action cannot work against
    pub incompatible: Option<Security>,
    /// Action transmits and so needs the target on [`board::TX_BAND`]
    pub needs_tx_band: bool,
    pub destructive: bool,
    pub implemented: bool,
    /// Provider that carries the action out
    pub engine: Engine,
    /// Radio mode the action needs while running
    pub radio: RadioOwner,
    pub timeout_ms: u64,
    pub completion: Completion,
    /// What `units_sent` counts, for status text
    pub unit: &'static str,
}

/// Canonical action table. Row order is the order the UI shows.
pub static ACTION_TABLE: &[ActionDef] = &[
    ActionDef {
        action: ActionType::Deauth,
        label: "Deauth clients",
        description: "Disconnect every associated client from this AP",
        kind: KindRequirement::Only(TargetKind::AccessPoint),
        requires_clients: true,
        incompatible: Some(Security::Wpa3),
        needs_tx_band: true,
        destructive: true,
        implemented: true,
        engine: Engine::Wifi,
        radio: RadioOwner::WifiPromiscuous,
        timeout_ms: 30_000,
        completion: Completion::Timeout,
        unit: "pkts",
    },
    ActionDef {
        action: ActionType::HandshakeCapture,
        label: "Capture handshake",
        description: "Listen for a client's 4-way handshake",
        kind: KindRequirement::Only(TargetKind::AccessPoint),
        requires_clients: true,
        incompatible: Some(Security::Wpa3),
        needs_tx_band: true,
        destructive: false,
        implemented: true,
        engine: Engine::Wifi,
        radio: RadioOwner::WifiPromiscuous,
        timeout_ms: 60_000,
        completion: Completion::CapturedArtifact,
        unit: "frames",
    },
    ActionDef {
        action: ActionType::PmkidCapture,
        label: "Capture PMKID",
        description: "Request a PMKID from the AP without any clients",
        kind: KindRequirement::Only(TargetKind::AccessPoint),
        requires_clients: false,
        incompatible: Some(Security::Wpa3),
        needs_tx_band: true,
        destructive: false,
        implemented: true,
        engine: Engine::Wifi,
        radio: RadioOwner::WifiStation,
        timeout_ms: 30_000,
        completion: Completion::CapturedArtifact,
        unit: "tries",
    },
    ActionDef {
        action: ActionType::BeaconClone,
        label: "Clone beacon",
        description: "Broadcast beacons that impersonate this AP",
        kind: KindRequirement::Only(TargetKind::AccessPoint),
        requires_clients: false,
        incompatible: None,
        needs_tx_band: true,
        destructive: true,
        implemented: true,
        engine: Engine::Wifi,
        radio: RadioOwner::WifiPromiscuous,
        timeout_ms: 60_000,
        completion: Completion::Timeout,
        unit: "beacons",
    },
    ActionDef {
        action: ActionType::StationDeauth,
        label: "Deauth station",
        description: "Disconnect this station from its AP",
        kind: KindRequirement::Only(TargetKind::Station),
        requires_clients: true,
        incompatible: None,
        needs_tx_band: true,
        destructive: true,
        implemented: true,
        engine: Engine::Wifi,
        radio: RadioOwner::WifiPromiscuous,
        timeout_ms: 30_000,
        completion: Completion::Timeout,
        unit: "pkts",
    },
    ActionDef {
        action: ActionType::KarmaLure,
        label: "Karma lure",
        description: "Answer this station's probes with matching APs",
        kind: KindRequirement::Only(TargetKind::Station),
        requires_clients: false,
        incompatible: None,
        needs_tx_band: true,
        destructive: true,
        implemented: false,
        engine: Engine::Wifi,
        radio: RadioOwner::WifiPromiscuous,
        timeout_ms: 60_000,
        completion: Completion::Timeout,
        unit: "replies",
    },
    ActionDef {
        action: ActionType::BleCloneFlood,
        label: "Advertisement flood",
        description: "Flood advertisements that impersonate this device",
        kind: KindRequirement::Only(TargetKind::BleDevice),
        requires_clients: false,
        incompatible: None,
        needs_tx_band: false,
        destructive: true,
        implemented: true,
        engine: Engine::Ble,
        radio: RadioOwner::Ble,
        timeout_ms: 30_000,
        completion: Completion::Timeout,
        unit: "ads",
    },
    ActionDef {
        action: ActionType::BleTrack,
        label: "Track signal",
        description: "Follow this device's signal strength",
        kind: KindRequirement::Only(TargetKind::BleDevice),
        requires_clients: false,
        incompatible: None,
        needs_tx_band: false,
        destructive: false,
        implemented: true,
        engine: Engine::Ble,
        radio: RadioOwner::Ble,
        timeout_ms: 120_000,
        completion: Completion::Timeout,
        unit: "reports",
    },
    ActionDef {
        action: ActionType::IrPowerOff,
        label: "Power off",
        description: "Send power-off codes for common vendors",
        kind: KindRequirement::Only(TargetKind::Infrared),
        requires_clients: false,
        incompatible: None,
        needs_tx_band: false,
        destructive: true,
        implemented: true,
        engine: Engine::Infrared,
        radio: RadioOwner::None,
        timeout_ms: 20_000,
        completion: Completion::ProviderIdle,
        unit: "codes",
    },
    ActionDef {
        action: ActionType::IrReplay,
        label: "Replay code",
        description: "Re-send the captured infrared code",
        kind: KindRequirement::Only(TargetKind::Infrared),
        requires_clients: false,
        incompatible: None,
        needs_tx_band: false,
        destructive: false,
        implemented: true,
        engine: Engine::Infrared,
        radio: RadioOwner::None,
        timeout_ms: 5_000,
        completion: Completion::ProviderIdle,
        unit: "codes",
    },
    ActionDef {
        action: ActionType::SaveTarget,
        label: "Save to log",
        description: "Append this target to the capture log",
        kind: KindRequirement::Any,
        requires_clients: false,
        incompatible: None,
        needs_tx_band: false,
        destructive: false,
        implemented: true,
        engine: Engine::None,
        radio: RadioOwner::None,
        timeout_ms: 0,
        completion: Completion::Immediate,
        unit: "",
    },
];

/// Look up the table row for an action.
pub fn definition(action: ActionType) -> Option<&'static ActionDef> {
    ACTION_TABLE.iter().find(|def| def.action == action)
}

/// An action the front end may offer for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AvailableAction {
    pub action: ActionType,
    pub label: &'static str,
    pub description: &'static str,
    pub destructive: bool,
    pub implemented: bool,
}

impl From<&ActionDef> for AvailableAction {
    fn from(def: &ActionDef) -> Self {
        Self {
            action: def.action,
            label: def.label,
            description: def.description,
            destructive: def.destructive,
            implemented: def.implemented,
        }
    }
}

/// Why an action is not offered. Only the first failing check is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidReason {
    WrongKind { required: TargetKind },
    NoClients,
    IncompatibleSecurity(Security),
    OutsideTxBand(Band),
    NotImplemented,
    /// The board lacks the transmitter the action drives
    NoHardware,
    UnknownAction,
}

impl InvalidReason {
    pub fn message(&self) -> &'static str {
        match self {
            InvalidReason::WrongKind { required } => match required {
                TargetKind::AccessPoint => "Needs an access point",
                TargetKind::Station => "Needs a station",
                TargetKind::BleDevice => "Needs a BLE device",
                TargetKind::Infrared => "Needs an infrared device",
            },
            InvalidReason::NoClients => "No connected clients",
            InvalidReason::IncompatibleSecurity(security) => match security {
                Security::Wpa3 => "Not effective against WPA3",
                Security::Enterprise => "Not effective against enterprise auth",
                Security::Open => "Network is open",
                _ => "Not effective against this security",
            },
            InvalidReason::OutsideTxBand(_) => "Target is outside the 2.4 GHz band",
            InvalidReason::NotImplemented => "Not implemented yet",
            InvalidReason::NoHardware => "No transmitter on this board",
            InvalidReason::UnknownAction => "Unknown action",
        }
    }
}

impl fmt::Display for InvalidReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Run the predicate chain for one row. Order matters: the first failure
/// is the reason reported to the operator.
fn check(def: &ActionDef, target: &Target) -> Result<(), InvalidReason> {
    if let KindRequirement::Only(required) = def.kind {
        if !def.kind.accepts(target.kind()) {
            return Err(InvalidReason::WrongKind { required });
        }
    }
    if def.requires_clients && target.client_count() == 0 {
        return Err(InvalidReason::NoClients);
    }
    if let Some(incompatible) = def.incompatible {
        if target.security == incompatible {
            return Err(InvalidReason::IncompatibleSecurity(incompatible));
        }
    }
    if def.needs_tx_band && target.band != board::TX_BAND {
        return Err(InvalidReason::OutsideTxBand(target.band));
    }
    if !def.implemented {
        return Err(InvalidReason::NotImplemented);
    }
    if !engine_fitted(def.engine) {
        return Err(InvalidReason::NoHardware);
    }
    Ok(())
}

/// Whether this board has the hardware behind `engine`.
fn engine_fitted(engine: Engine) -> bool {
    match engine {
        Engine::Infrared => board::HAS_IR_TX,
        _ => true,
    }
}

/// Every action valid for `target`, in table order.
pub fn get_actions_for(target: &Target) -> Vec<AvailableAction, MAX_ACTIONS> {
    let mut out = Vec::new();
    for def in ACTION_TABLE.iter().filter(|def| check(def, target).is_ok()) {
        let _ = out.push(AvailableAction::from(def));
    }
    out
}

pub fn is_action_valid(target: &Target, action: ActionType) -> bool {
    get_invalid_reason(target, action).is_none()
}

/// First failing predicate for `action` on `target`, or `None` if valid.
pub fn get_invalid_reason(target: &Target, action: ActionType) -> Option<InvalidReason> {
    match definition(action) {
        Some(def) => check(def, target).err(),
        None => Some(InvalidReason::UnknownAction),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ap(clients: u8, security: Security) -> Target {
        let mut t = Target::new([0xAA; 6], TargetKind::AccessPoint)
            .with_name("lab")
            .with_channel(6);
        t.security = security;
        for i in 0..clients {
            t.add_peer([i; 6]);
        }
        t
    }

    fn kinds_of(list: &[AvailableAction]) -> heapless::Vec<ActionType, MAX_ACTIONS> {
        list.iter().map(|a| a.action).collect()
    }

    #[test]
    fn every_action_has_exactly_one_row() {
        for def in ACTION_TABLE {
            let rows = ACTION_TABLE.iter().filter(|d| d.action == def.action).count();
            assert_eq!(rows, 1, "{:?} appears {rows} times", def.action);
            assert_eq!(ActionType::from_slug(def.action.slug()), Some(def.action));
        }
        assert!(ACTION_TABLE.len() <= MAX_ACTIONS);
    }

    #[test]
    fn wpa3_ap_without_clients_gets_no_client_or_wpa3_actions() {
        let target = ap(0, Security::Wpa3);
        let actions = get_actions_for(&target);
        for a in &actions {
            let def = definition(a.action).unwrap();
            assert!(!def.requires_clients, "{:?} requires clients", a.action);
            assert_ne!(def.incompatible, Some(Security::Wpa3), "{:?} is WPA3-incompatible", a.action);
        }
        assert_eq!(
            kinds_of(&actions).as_slice(),
            &[ActionType::BeaconClone, ActionType::SaveTarget]
        );
    }

    #[test]
    fn open_ap_with_clients_includes_deauth() {
        let target = ap(3, Security::Open);
        let actions = kinds_of(&get_actions_for(&target));
        assert!(actions.contains(&ActionType::Deauth));
        for def in ACTION_TABLE.iter().filter(|d| d.kind.accepts(TargetKind::AccessPoint)) {
            assert!(
                !matches!(check(def, &target), Err(InvalidReason::IncompatibleSecurity(_))),
                "{:?} filtered by security",
                def.action
            );
        }
        assert_eq!(
            actions.as_slice(),
            &[
                ActionType::Deauth,
                ActionType::HandshakeCapture,
                ActionType::PmkidCapture,
                ActionType::BeaconClone,
                ActionType::SaveTarget,
            ]
        );
    }

    #[test]
    fn resolver_is_pure() {
        let a = ap(2, Security::Wpa2);
        let b = a.clone();
        assert_eq!(get_actions_for(&a), get_actions_for(&b));
        assert_eq!(get_actions_for(&a), get_actions_for(&a));
    }

    #[test]
    fn five_ghz_target_loses_transmit_actions() {
        let target = ap(2, Security::Wpa2).with_channel(36);
        assert_eq!(
            kinds_of(&get_actions_for(&target)).as_slice(),
            &[ActionType::SaveTarget]
        );
        assert_eq!(
            get_invalid_reason(&target, ActionType::Deauth),
            Some(InvalidReason::OutsideTxBand(Band::Ghz5))
        );
    }

    #[test]
    fn first_failing_predicate_wins() {
        // Wrong kind beats everything else
        let ble = Target::new([1; 6], TargetKind::BleDevice);
        assert_eq!(
            get_invalid_reason(&ble, ActionType::Deauth),
            Some(InvalidReason::WrongKind {
                required: TargetKind::AccessPoint
            })
        );
        // No clients is checked before security
        let target = ap(0, Security::Wpa3);
        assert_eq!(
            get_invalid_reason(&target, ActionType::Deauth),
            Some(InvalidReason::NoClients)
        );
        // Security before band
        let target = ap(1, Security::Wpa3).with_channel(36);
        assert_eq!(
            get_invalid_reason(&target, ActionType::Deauth),
            Some(InvalidReason::IncompatibleSecurity(Security::Wpa3))
        );
    }

    #[test]
    fn unimplemented_actions_are_never_offered() {
        let mut sta = Target::new([5; 6], TargetKind::Station).with_channel(1);
        sta.add_peer([0xAA; 6]);
        let actions = kinds_of(&get_actions_for(&sta));
        assert!(!actions.contains(&ActionType::KarmaLure));
        assert!(actions.contains(&ActionType::StationDeauth));
        assert_eq!(
            get_invalid_reason(&sta, ActionType::KarmaLure),
            Some(InvalidReason::NotImplemented)
        );
        assert!(!is_action_valid(&sta, ActionType::KarmaLure));
    }

    #[test]
    fn ble_targets_get_their_own_actions() {
        let ble = Target::new([1; 6], TargetKind::BleDevice).with_name("Buds");
        assert_eq!(
            kinds_of(&get_actions_for(&ble)).as_slice(),
            &[ActionType::BleCloneFlood, ActionType::BleTrack, ActionType::SaveTarget]
        );
    }

    #[test]
    fn infrared_actions_need_a_transmitter() {
        let ir = Target::new([2; 6], TargetKind::Infrared);
        if board::HAS_IR_TX {
            assert_eq!(
                kinds_of(&get_actions_for(&ir)).as_slice(),
                &[ActionType::IrPowerOff, ActionType::IrReplay, ActionType::SaveTarget]
            );
        } else {
            assert_eq!(kinds_of(&get_actions_for(&ir)).as_slice(), &[ActionType::SaveTarget]);
            assert_eq!(
                get_invalid_reason(&ir, ActionType::IrPowerOff),
                Some(InvalidReason::NoHardware)
            );
            assert!(!is_action_valid(&ir, ActionType::IrReplay));
        }
        // Kind still comes first
        let ap = Target::new([3; 6], TargetKind::AccessPoint);
        assert_eq!(
            get_invalid_reason(&ap, ActionType::IrReplay),
            Some(InvalidReason::WrongKind {
                required: TargetKind::Infrared
            })
        );
    }

    #[test]
    fn reason_messages_are_human_readable() {
        assert_eq!(InvalidReason::NoClients.message(), "No connected clients");
        assert_eq!(
            InvalidReason::IncompatibleSecurity(Security::Wpa3).message(),
            "Not effective against WPA3"
        );
    }
}
