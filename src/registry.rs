/// Single source of truth for discovered targets.
///
/// Fixed capacity, no growth: inserting a new identity into a full registry
/// evicts the entry that was seen longest ago. Consumers never get a live
/// reference: [`TargetRegistry::get_targets`] hands out a filtered, sorted
/// copy so the producer can keep mutating while a consumer iterates.
use alloc::vec::Vec as AllocVec;
use core::cell::RefCell;
use core::cmp::Ordering;

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use heapless::Vec;

use crate::error::Error;
use crate::target::{Band, MacAddr, Target, TargetKey, TargetKind};

/// Maximum number of registry observers
pub const MAX_OBSERVERS: usize = 4;

/// Change notifications. Called while the registry is locked, so
/// implementations must be quick and must not call back into the registry.
pub trait RegistryObserver: Sync {
    fn on_added(&self, _target: &Target) {}
    fn on_updated(&self, _target: &Target) {}
    fn on_removed(&self, _target: &Target) {}
}

/// Outcome of [`TargetRegistry::add_or_update`]
#[derive(Debug, Clone, PartialEq)]
pub enum Upsert {
    Added,
    Updated,
    /// Inserted after evicting the returned entry
    Evicted(Target),
}

/// Outcome of [`TargetRegistry::record_association`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Association {
    /// The station was not yet linked to the access point
    pub new_link: bool,
    /// The station entry was created by this call
    pub station_added: bool,
}

/// Which targets a snapshot includes. Allows the front end to narrow the
/// list without touching the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetFilter {
    pub show_access_points: bool,
    pub show_stations: bool,
    pub show_ble: bool,
    pub show_infrared: bool,
    /// Entities without a name (hidden SSID, anonymous BLE)
    pub show_hidden: bool,
    /// WiFi entities with no security
    pub show_open: bool,
    /// WiFi entities with any security class other than open
    pub show_secured: bool,
    /// Minimum RSSI threshold (dBm). Weaker targets are hidden.
    pub min_rssi: i8,
}

impl TargetFilter {
    pub const fn new() -> Self {
        Self {
            show_access_points: true,
            show_stations: true,
            show_ble: true,
            show_infrared: true,
            show_hidden: true,
            show_open: true,
            show_secured: true,
            min_rssi: i8::MIN,
        }
    }

    pub fn matches(&self, target: &Target) -> bool {
        let kind_shown = match target.kind() {
            TargetKind::AccessPoint => self.show_access_points,
            TargetKind::Station => self.show_stations,
            TargetKind::BleDevice => self.show_ble,
            TargetKind::Infrared => self.show_infrared,
        };
        if !kind_shown {
            return false;
        }
        if target.is_hidden() && !self.show_hidden {
            return false;
        }
        if target.kind().is_wifi() {
            let open = target.security.is_open();
            if (open && !self.show_open) || (!open && !self.show_secured) {
                return false;
            }
        }
        target.rssi >= self.min_rssi
    }
}

impl Default for TargetFilter {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    SignalDesc,
    NameAsc,
    LastSeenDesc,
    ClientsDesc,
    KindThenSignal,
}

pub struct TargetRegistry<'o, const N: usize> {
    targets: Vec<Target, N>,
    observers: Vec<&'o dyn RegistryObserver, MAX_OBSERVERS>,
}

impl<'o, const N: usize> TargetRegistry<'o, N> {
    pub const fn new() -> Self {
        Self {
            targets: Vec::new(),
            observers: Vec::new(),
        }
    }

    /// Register an observer. Returns false when all observer slots are taken.
    pub fn subscribe(&mut self, observer: &'o dyn RegistryObserver) -> bool {
        self.observers.push(observer).is_ok()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn get(&self, key: &TargetKey) -> Option<&Target> {
        self.targets.iter().find(|t| t.key() == *key)
    }

    /// Insert a new observation or merge it into the existing entry.
    pub fn add_or_update(&mut self, mut target: Target, now_ms: u64) -> Upsert {
        target.last_seen_ms = now_ms;
        let key = target.key();

        if let Some(idx) = self.position(&key) {
            self.targets[idx].merge_from(&target);
            self.flag_twins(idx);
            let stored = &self.targets[idx];
            for obs in &self.observers {
                obs.on_updated(stored);
            }
            return Upsert::Updated;
        }

        let evicted = if self.targets.len() == N {
            self.evict_oldest()
        } else {
            None
        };

        // A slot is free at this point unless N == 0, in which case the
        // observation itself is what gets dropped
        if let Err(rejected) = self.targets.push(target) {
            return Upsert::Evicted(rejected);
        }
        let idx = self.targets.len() - 1;
        self.flag_twins(idx);
        let stored = &self.targets[idx];
        for obs in &self.observers {
            obs.on_added(stored);
        }

        match evicted {
            Some(old) => Upsert::Evicted(old),
            None => Upsert::Added,
        }
    }

    /// Link `station` to access point `ap`. The station entry is created
    /// or refreshed; the AP is only touched if already known.
    pub fn record_association(
        &mut self,
        ap: MacAddr,
        station: MacAddr,
        rssi: i8,
        channel: u8,
        now_ms: u64,
    ) -> Association {
        let ap_key = TargetKey {
            mac: ap,
            kind: TargetKind::AccessPoint,
        };
        let mut new_link = false;
        if let Some(idx) = self.position(&ap_key) {
            new_link = self.targets[idx].add_peer(station);
            self.targets[idx].last_seen_ms = now_ms;
        }

        let sta_key = TargetKey {
            mac: station,
            kind: TargetKind::Station,
        };
        let station_added = match self.position(&sta_key) {
            Some(idx) => {
                let sta = &mut self.targets[idx];
                new_link |= sta.add_peer(ap);
                sta.rssi = rssi;
                sta.channel = channel;
                sta.band = Band::from_channel(channel);
                sta.last_seen_ms = now_ms;
                false
            }
            None => {
                let mut sta = Target::new(station, TargetKind::Station).with_channel(channel);
                sta.rssi = rssi;
                sta.add_peer(ap);
                new_link = true;
                !matches!(self.add_or_update(sta, now_ms), Upsert::Updated)
            }
        };

        Association {
            new_link,
            station_added,
        }
    }

    /// Filtered, sorted copy of the current contents.
    pub fn get_targets(&self, filter: &TargetFilter, order: SortOrder) -> AllocVec<Target> {
        let mut out: AllocVec<Target> = self
            .targets
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        out.sort_by(|a, b| compare(a, b, order));
        out
    }

    /// Drop every entry not seen within `ttl_ms`. Returns the number removed.
    pub fn remove_stale(&mut self, now_ms: u64, ttl_ms: u64) -> usize {
        let mut removed = 0;
        let mut i = 0;
        while i < self.targets.len() {
            if now_ms.saturating_sub(self.targets[i].last_seen_ms) > ttl_ms {
                let gone = self.targets.swap_remove(i);
                for obs in &self.observers {
                    obs.on_removed(&gone);
                }
                removed += 1;
            } else {
                i += 1;
            }
        }
        removed
    }

    pub fn clear(&mut self) {
        while let Some(gone) = self.targets.pop() {
            for obs in &self.observers {
                obs.on_removed(&gone);
            }
        }
    }

    fn position(&self, key: &TargetKey) -> Option<usize> {
        self.targets.iter().position(|t| t.key() == *key)
    }

    fn evict_oldest(&mut self) -> Option<Target> {
        let idx = self
            .targets
            .iter()
            .enumerate()
            .min_by_key(|(_, t)| t.last_seen_ms)
            .map(|(i, _)| i)?;
        let old = self.targets.swap_remove(idx);
        log::warn!("{}: dropped {:02X?}", Error::CapacityExceeded, old.mac());
        for obs in &self.observers {
            obs.on_removed(&old);
        }
        Some(old)
    }

    /// Flag access points that share an SSID with the entry at `idx` but
    /// advertise a different security class.
    fn flag_twins(&mut self, idx: usize) {
        let subject = &self.targets[idx];
        if subject.kind() != TargetKind::AccessPoint || subject.is_hidden() {
            return;
        }
        let (ssid, security, mac) = (subject.name.clone(), subject.security, *subject.mac());

        let mut twin_found = false;
        for other in self.targets.iter_mut() {
            if other.kind() == TargetKind::AccessPoint
                && other.mac() != &mac
                && other.name == ssid
                && other.security != security
            {
                other.flags.suspicious = true;
                twin_found = true;
            }
        }
        if twin_found {
            self.targets[idx].flags.suspicious = true;
        }
    }
}

impl<const N: usize> Default for TargetRegistry<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

fn compare(a: &Target, b: &Target, order: SortOrder) -> Ordering {
    let primary = match order {
        SortOrder::SignalDesc => b.rssi.cmp(&a.rssi),
        SortOrder::NameAsc => match (a.is_hidden(), b.is_hidden()) {
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
            _ => cmp_ignore_case(&a.name, &b.name),
        },
        SortOrder::LastSeenDesc => b.last_seen_ms.cmp(&a.last_seen_ms),
        SortOrder::ClientsDesc => b.client_count().cmp(&a.client_count()),
        SortOrder::KindThenSignal => a.kind().cmp(&b.kind()).then(b.rssi.cmp(&a.rssi)),
    };
    primary.then_with(|| a.mac().cmp(b.mac()))
}

fn cmp_ignore_case(a: &str, b: &str) -> Ordering {
    a.bytes()
        .map(|c| c.to_ascii_lowercase())
        .cmp(b.bytes().map(|c| c.to_ascii_lowercase()))
}

/// Registry shared between the orchestrator and the front end.
///
/// Each call holds the lock for one short, non-blocking operation.
pub struct SharedRegistry<'o, M: RawMutex, const N: usize> {
    inner: Mutex<M, RefCell<TargetRegistry<'o, N>>>,
}

impl<'o, M: RawMutex, const N: usize> SharedRegistry<'o, M, N> {
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(TargetRegistry::new())),
        }
    }

    fn with<R>(&self, f: impl FnOnce(&mut TargetRegistry<'o, N>) -> R) -> R {
        self.inner.lock(|r| f(&mut r.borrow_mut()))
    }

    pub fn subscribe(&self, observer: &'o dyn RegistryObserver) -> bool {
        self.with(|r| r.subscribe(observer))
    }

    pub fn add_or_update(&self, target: Target, now_ms: u64) -> Upsert {
        self.with(|r| r.add_or_update(target, now_ms))
    }

    pub fn record_association(
        &self,
        ap: MacAddr,
        station: MacAddr,
        rssi: i8,
        channel: u8,
        now_ms: u64,
    ) -> Association {
        self.with(|r| r.record_association(ap, station, rssi, channel, now_ms))
    }

    pub fn get(&self, key: &TargetKey) -> Option<Target> {
        self.with(|r| r.get(key).cloned())
    }

    pub fn get_targets(&self, filter: &TargetFilter, order: SortOrder) -> AllocVec<Target> {
        self.with(|r| r.get_targets(filter, order))
    }

    pub fn remove_stale(&self, now_ms: u64, ttl_ms: u64) -> usize {
        self.with(|r| r.remove_stale(now_ms, ttl_ms))
    }

    pub fn clear(&self) {
        self.with(|r| r.clear())
    }

    pub fn len(&self) -> usize {
        self.with(|r| r.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<M: RawMutex, const N: usize> Default for SharedRegistry<'_, M, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::Security;
    use core::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};

    fn ap(id: u8, rssi: i8) -> Target {
        let mut t = Target::new([0xAA, 0, 0, 0, 0, id], TargetKind::AccessPoint)
            .with_name("net")
            .with_channel(6);
        t.rssi = rssi;
        t.security = Security::Wpa2;
        t
    }

    fn ble(id: u8, rssi: i8, name: &str) -> Target {
        let mut t = Target::new([0xBB, 0, 0, 0, 0, id], TargetKind::BleDevice).with_name(name);
        t.rssi = rssi;
        t
    }

    #[derive(Default)]
    struct Counter {
        added: AtomicU32,
        updated: AtomicU32,
        removed: AtomicU32,
    }

    impl RegistryObserver for Counter {
        fn on_added(&self, _: &Target) {
            self.added.fetch_add(1, AtomicOrdering::Relaxed);
        }
        fn on_updated(&self, _: &Target) {
            self.updated.fetch_add(1, AtomicOrdering::Relaxed);
        }
        fn on_removed(&self, _: &Target) {
            self.removed.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    #[test]
    fn distinct_keys_are_all_listed_with_latest_values() {
        let mut reg: TargetRegistry<'_, 8> = TargetRegistry::new();
        reg.add_or_update(ap(1, -60), 100);
        reg.add_or_update(ap(2, -50), 200);
        reg.add_or_update(ble(3, -70, "tag"), 300);
        reg.add_or_update(ap(1, -40).with_name("renamed"), 400);

        let all = reg.get_targets(&TargetFilter::new(), SortOrder::SignalDesc);
        assert_eq!(all.len(), 3);
        let first = all.iter().find(|t| t.mac()[5] == 1).unwrap();
        assert_eq!(first.rssi, -40);
        assert_eq!(first.name.as_str(), "renamed");
        assert_eq!(first.last_seen_ms, 400);
    }

    #[test]
    fn same_mac_different_kind_is_a_different_target() {
        let mut reg: TargetRegistry<'_, 8> = TargetRegistry::new();
        let mac = [1, 2, 3, 4, 5, 6];
        reg.add_or_update(Target::new(mac, TargetKind::AccessPoint), 0);
        reg.add_or_update(Target::new(mac, TargetKind::Station), 0);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn full_registry_evicts_oldest_last_seen() {
        let mut reg: TargetRegistry<'_, 4> = TargetRegistry::new();
        reg.add_or_update(ap(1, -60), 400);
        reg.add_or_update(ap(2, -60), 100); // oldest
        reg.add_or_update(ap(3, -60), 300);
        reg.add_or_update(ap(4, -60), 200);

        let outcome = reg.add_or_update(ap(5, -60), 500);
        match outcome {
            Upsert::Evicted(old) => assert_eq!(old.mac()[5], 2),
            other => panic!("expected eviction, got {other:?}"),
        }
        assert_eq!(reg.len(), 4);
        let key = |id| TargetKey {
            mac: [0xAA, 0, 0, 0, 0, id],
            kind: TargetKind::AccessPoint,
        };
        assert!(reg.get(&key(2)).is_none());
        assert!(reg.get(&key(5)).is_some());
    }

    #[test]
    fn update_at_capacity_does_not_evict() {
        let mut reg: TargetRegistry<'_, 2> = TargetRegistry::new();
        reg.add_or_update(ap(1, -60), 100);
        reg.add_or_update(ap(2, -60), 200);
        assert_eq!(reg.add_or_update(ap(1, -30), 300), Upsert::Updated);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn observers_see_add_update_remove() {
        let counter = Counter::default();
        let mut reg: TargetRegistry<'_, 2> = TargetRegistry::new();
        assert!(reg.subscribe(&counter));

        reg.add_or_update(ap(1, -60), 100);
        reg.add_or_update(ap(1, -55), 150);
        reg.add_or_update(ap(2, -60), 200);
        reg.add_or_update(ap(3, -60), 300); // evicts ap(1)
        reg.remove_stale(10_000, 1_000);

        assert_eq!(counter.added.load(AtomicOrdering::Relaxed), 3);
        assert_eq!(counter.updated.load(AtomicOrdering::Relaxed), 1);
        assert_eq!(counter.removed.load(AtomicOrdering::Relaxed), 3);
    }

    #[test]
    fn stale_sweep_keeps_recent_entries() {
        let mut reg: TargetRegistry<'_, 8> = TargetRegistry::new();
        reg.add_or_update(ap(1, -60), 1_000);
        reg.add_or_update(ap(2, -60), 9_000);
        reg.add_or_update(ap(3, -60), 2_000);

        assert_eq!(reg.remove_stale(10_000, 5_000), 2);
        let left = reg.get_targets(&TargetFilter::new(), SortOrder::SignalDesc);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].mac()[5], 2);
    }

    #[test]
    fn clear_notifies_every_entry() {
        let counter = Counter::default();
        let mut reg: TargetRegistry<'_, 8> = TargetRegistry::new();
        reg.subscribe(&counter);
        reg.add_or_update(ap(1, -60), 0);
        reg.add_or_update(ap(2, -60), 0);
        reg.clear();
        assert!(reg.is_empty());
        assert_eq!(counter.removed.load(AtomicOrdering::Relaxed), 2);
    }

    #[test]
    fn snapshot_is_detached_from_registry() {
        let mut reg: TargetRegistry<'_, 8> = TargetRegistry::new();
        reg.add_or_update(ap(1, -60), 0);
        let snap = reg.get_targets(&TargetFilter::new(), SortOrder::SignalDesc);
        reg.clear();
        assert_eq!(snap.len(), 1);
    }

    #[test]
    fn filter_by_kind_hidden_security_and_rssi() {
        let mut reg: TargetRegistry<'_, 8> = TargetRegistry::new();
        let mut open = ap(1, -50);
        open.security = Security::Open;
        reg.add_or_update(open, 0);
        reg.add_or_update(ap(2, -80), 0);
        reg.add_or_update(ble(3, -40, ""), 0);
        reg.add_or_update(ble(4, -90, "band"), 0);

        let mut f = TargetFilter::new();
        f.show_ble = false;
        assert_eq!(reg.get_targets(&f, SortOrder::SignalDesc).len(), 2);

        let mut f = TargetFilter::new();
        f.show_hidden = false;
        assert_eq!(reg.get_targets(&f, SortOrder::SignalDesc).len(), 3);

        let mut f = TargetFilter::new();
        f.show_open = false;
        let secured = reg.get_targets(&f, SortOrder::SignalDesc);
        // BLE entries carry no security class, so the openness filter skips them
        assert_eq!(secured.len(), 3);
        assert!(secured.iter().all(|t| !t.security.is_open()));

        let mut f = TargetFilter::new();
        f.min_rssi = -60;
        assert_eq!(reg.get_targets(&f, SortOrder::SignalDesc).len(), 2);
    }

    #[test]
    fn sort_orders() {
        let mut reg: TargetRegistry<'_, 8> = TargetRegistry::new();
        reg.add_or_update(ble(1, -70, "zeta"), 300);
        reg.add_or_update(ble(2, -40, "Alpha"), 100);
        reg.add_or_update(ble(3, -55, ""), 200);
        let mut busy = ap(4, -90);
        busy.add_peer([9; 6]);
        busy.add_peer([8; 6]);
        reg.add_or_update(busy, 50);

        let ids = |order| -> AllocVec<u8> {
            reg.get_targets(&TargetFilter::new(), order)
                .iter()
                .map(|t| t.mac()[5])
                .collect()
        };
        assert_eq!(ids(SortOrder::SignalDesc), [2, 3, 1, 4]);
        assert_eq!(ids(SortOrder::NameAsc), [2, 4, 1, 3]);
        assert_eq!(ids(SortOrder::LastSeenDesc), [1, 3, 2, 4]);
        assert_eq!(ids(SortOrder::ClientsDesc)[0], 4);
        assert_eq!(ids(SortOrder::KindThenSignal), [4, 2, 3, 1]);
    }

    #[test]
    fn duplicate_ssid_with_different_security_is_suspicious() {
        let mut reg: TargetRegistry<'_, 8> = TargetRegistry::new();
        reg.add_or_update(ap(1, -60).with_name("Airport"), 0);
        let mut twin = ap(2, -30).with_name("Airport");
        twin.security = Security::Open;
        reg.add_or_update(twin, 10);
        reg.add_or_update(ap(3, -60).with_name("Other"), 20);

        let all = reg.get_targets(&TargetFilter::new(), SortOrder::SignalDesc);
        let flagged: AllocVec<u8> = all
            .iter()
            .filter(|t| t.flags.suspicious)
            .map(|t| t.mac()[5])
            .collect();
        assert_eq!(flagged.len(), 2);
        assert!(flagged.contains(&1) && flagged.contains(&2));
    }

    #[test]
    fn association_links_both_sides() {
        let mut reg: TargetRegistry<'_, 8> = TargetRegistry::new();
        let ap_mac = [0xAA, 0, 0, 0, 0, 1];
        let sta = [0x5A, 0, 0, 0, 0, 9];
        reg.add_or_update(ap(1, -60), 0);

        let first = reg.record_association(ap_mac, sta, -65, 6, 100);
        assert!(first.new_link);
        assert!(first.station_added);

        let again = reg.record_association(ap_mac, sta, -62, 6, 200);
        assert!(!again.new_link);
        assert!(!again.station_added);

        let ap_key = TargetKey {
            mac: ap_mac,
            kind: TargetKind::AccessPoint,
        };
        let sta_key = TargetKey {
            mac: sta,
            kind: TargetKind::Station,
        };
        assert_eq!(reg.get(&ap_key).unwrap().client_count(), 1);
        let station = reg.get(&sta_key).unwrap();
        assert_eq!(station.peers[0], ap_mac);
        assert_eq!(station.rssi, -62);
        assert_eq!(station.last_seen_ms, 200);
    }

    #[test]
    fn shared_registry_round_trips_through_the_lock() {
        use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
        let shared: SharedRegistry<'_, CriticalSectionRawMutex, 4> = SharedRegistry::new();
        shared.add_or_update(ap(1, -60), 0);
        assert_eq!(shared.len(), 1);
        assert_eq!(
            shared.get_targets(&TargetFilter::new(), SortOrder::NameAsc).len(),
            1
        );
        shared.clear();
        assert!(shared.is_empty());
    }
}
