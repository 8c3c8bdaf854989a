/// Capability providers: the hardware-facing half of every engine.
///
/// Each provider owns one engine (WiFi, BLE, infrared) and is driven by the
/// orchestrator through the same `init / tick / stop` contract. Providers
/// never block: `on_tick` does a bounded slice of work and returns.
use crate::actions::ActionType;
use crate::radio::{RadioBackend, RadioOwner};
use crate::target::{MacAddr, Target};

/// Observations drained from one provider per loop iteration
pub const MAX_OBSERVATIONS_PER_TICK: usize = 8;

/// Hardware engine an action or radio mode runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    None,
    Wifi,
    Ble,
    Infrared,
}

impl Engine {
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::None => "none",
            Engine::Wifi => "wifi",
            Engine::Ble => "ble",
            Engine::Infrared => "ir",
        }
    }
}

/// Every engine that has a provider, in tick order.
pub const ENGINES: [Engine; 3] = [Engine::Wifi, Engine::Ble, Engine::Infrared];

/// Something a provider saw on air.
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Device(Target),
    /// A station exchanging data with an access point
    Association {
        ap: MacAddr,
        station: MacAddr,
        rssi: i8,
        channel: u8,
    },
}

pub trait CapabilityProvider {
    fn name(&self) -> &'static str;

    /// One-time bring-up at boot. `false` disables the provider.
    fn init(&mut self) -> bool;

    /// Periodic work. Must return quickly.
    fn on_tick(&mut self, now_ms: u64);

    /// Stop anything the provider is transmitting or capturing.
    fn stop_hardware_activities(&mut self);

    /// Bring up one of this provider's radio modes.
    fn radio_up(&mut self, _owner: RadioOwner) -> bool {
        false
    }

    fn radio_down(&mut self, _owner: RadioOwner) {}

    /// Start discovery. `None` runs until stopped.
    fn begin_scan(&mut self, _duration_ms: Option<u32>) -> bool {
        false
    }

    /// Start `action` against `target`. The radio is already in the mode
    /// the action needs.
    fn begin_action(&mut self, _action: ActionType, _target: &Target) -> bool {
        false
    }

    /// Frames, advertisements or codes sent since `begin_action`
    fn units_sent(&self) -> u32 {
        0
    }

    /// A capture action got what it came for
    fn has_captured_artifact(&self) -> bool {
        false
    }

    /// Nothing left queued for transmission
    fn is_idle(&self) -> bool {
        true
    }

    /// Captured bytes for the record sink, if any
    fn artifact(&self) -> Option<&[u8]> {
        None
    }

    /// Next buffered discovery, oldest first.
    fn poll_observation(&mut self) -> Option<Observation> {
        None
    }
}

/// Placeholder for an engine the board does not have.
pub struct Absent(pub &'static str);

impl CapabilityProvider for Absent {
    fn name(&self) -> &'static str {
        self.0
    }

    fn init(&mut self) -> bool {
        false
    }

    fn on_tick(&mut self, _now_ms: u64) {}

    fn stop_hardware_activities(&mut self) {}
}

/// The providers wired into one device, one per engine.
pub struct ProviderSet<'p> {
    pub wifi: &'p mut dyn CapabilityProvider,
    pub ble: &'p mut dyn CapabilityProvider,
    pub infrared: &'p mut dyn CapabilityProvider,
}

impl<'p> ProviderSet<'p> {
    pub fn new(
        wifi: &'p mut dyn CapabilityProvider,
        ble: &'p mut dyn CapabilityProvider,
        infrared: &'p mut dyn CapabilityProvider,
    ) -> Self {
        Self { wifi, ble, infrared }
    }

    pub fn get(&mut self, engine: Engine) -> Option<&mut dyn CapabilityProvider> {
        match engine {
            Engine::Wifi => Some(&mut *self.wifi),
            Engine::Ble => Some(&mut *self.ble),
            Engine::Infrared => Some(&mut *self.infrared),
            Engine::None => None,
        }
    }

    pub fn get_ref(&self, engine: Engine) -> Option<&dyn CapabilityProvider> {
        match engine {
            Engine::Wifi => Some(&*self.wifi),
            Engine::Ble => Some(&*self.ble),
            Engine::Infrared => Some(&*self.infrared),
            Engine::None => None,
        }
    }
}

impl RadioBackend for ProviderSet<'_> {
    fn bring_up(&mut self, owner: RadioOwner) -> bool {
        match self.get(owner.engine()) {
            Some(provider) => provider.radio_up(owner),
            None => false,
        }
    }

    fn tear_down(&mut self, owner: RadioOwner) {
        if let Some(provider) = self.get(owner.engine()) {
            provider.radio_down(owner);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Stub {
        up: Option<RadioOwner>,
        downs: u32,
    }

    impl CapabilityProvider for Stub {
        fn name(&self) -> &'static str {
            "stub"
        }

        fn init(&mut self) -> bool {
            true
        }

        fn on_tick(&mut self, _now_ms: u64) {}

        fn stop_hardware_activities(&mut self) {}

        fn radio_up(&mut self, owner: RadioOwner) -> bool {
            self.up = Some(owner);
            true
        }

        fn radio_down(&mut self, _owner: RadioOwner) {
            self.up = None;
            self.downs += 1;
        }
    }

    #[test]
    fn radio_modes_route_to_their_engine() {
        let mut wifi = Stub::default();
        let mut ble = Stub::default();
        let mut ir = Absent("ir");
        let mut set = ProviderSet::new(&mut wifi, &mut ble, &mut ir);

        assert!(set.bring_up(RadioOwner::WifiStation));
        set.tear_down(RadioOwner::WifiStation);
        assert!(set.bring_up(RadioOwner::Ble));
        assert!(!set.bring_up(RadioOwner::Lora));
        drop(set);

        assert_eq!(wifi.up, None);
        assert_eq!(wifi.downs, 1);
        assert_eq!(ble.up, Some(RadioOwner::Ble));
    }

    #[test]
    fn absent_provider_refuses_everything() {
        let mut ir = Absent("ir");
        assert!(!ir.init());
        assert!(!ir.begin_scan(None));
        assert!(ir.is_idle());
        assert_eq!(ir.poll_observation(), None);
    }
}
