/// Exclusive access to the single 2.4 GHz radio.
///
/// WiFi station, WiFi promiscuous and BLE all share one physical radio.
/// [`RadioArbiter`] serializes every mode switch behind an async lock with
/// a bounded wait, and always tears the old mode down completely before
/// bringing the new one up.
use core::cell::Cell;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::mutex::Mutex;
use embedded_hal_async::delay::DelayNs;

use crate::error::{Error, Resource, Result};
use crate::provider::Engine;

/// Upper bound on waiting for the arbiter lock
pub const LOCK_TIMEOUT_MS: u32 = 2000;

/// Pause between tearing one mode down and bringing the next up
pub const SETTLE_MS: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioOwner {
    None,
    WifiStation,
    WifiPromiscuous,
    Ble,
    /// Reserved. Nothing backs it, so requesting it always fails.
    Lora,
}

impl RadioOwner {
    pub fn as_str(&self) -> &'static str {
        match self {
            RadioOwner::None => "none",
            RadioOwner::WifiStation => "wifi_sta",
            RadioOwner::WifiPromiscuous => "wifi_promisc",
            RadioOwner::Ble => "ble",
            RadioOwner::Lora => "lora",
        }
    }

    /// Provider responsible for bringing this mode up and down.
    pub fn engine(&self) -> Engine {
        match self {
            RadioOwner::WifiStation | RadioOwner::WifiPromiscuous => Engine::Wifi,
            RadioOwner::Ble => Engine::Ble,
            RadioOwner::None | RadioOwner::Lora => Engine::None,
        }
    }
}

/// Hardware side of a mode switch. Implemented by [`crate::provider::ProviderSet`],
/// which forwards to the provider owning each mode.
pub trait RadioBackend {
    /// Bring `owner` up. `false` means the hardware refused.
    fn bring_up(&mut self, owner: RadioOwner) -> bool;
    /// Tear `owner` down completely. Must not fail.
    fn tear_down(&mut self, owner: RadioOwner);
}

pub struct RadioArbiter<M: RawMutex> {
    lock: Mutex<M, ()>,
    owner: BlockingMutex<M, Cell<RadioOwner>>,
}

impl<M: RawMutex> RadioArbiter<M> {
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            owner: BlockingMutex::new(Cell::new(RadioOwner::None)),
        }
    }

    /// Current owner. Never blocks.
    pub fn owner(&self) -> RadioOwner {
        self.owner.lock(|owner| owner.get())
    }

    /// Grab the lock from outside, to simulate a stuck holder.
    #[cfg(test)]
    pub(crate) fn try_hold(&self) -> Option<embassy_sync::mutex::MutexGuard<'_, M, ()>> {
        self.lock.try_lock().ok()
    }

    fn set_owner(&self, owner: RadioOwner) {
        self.owner.lock(|cell| cell.set(owner));
    }

    /// Switch the radio to `owner`.
    ///
    /// Requesting the current owner is a no-op. On lock timeout nothing is
    /// touched. On bring-up failure the radio is left idle (`None`).
    pub async fn request_radio<B, D>(
        &self,
        owner: RadioOwner,
        backend: &mut B,
        delay: &mut D,
    ) -> Result<()>
    where
        B: RadioBackend + ?Sized,
        D: DelayNs,
    {
        if self.owner() == owner {
            return Ok(());
        }
        if owner == RadioOwner::Lora {
            log::warn!("Radio: no backend for {}", owner.as_str());
            return Err(Error::ProviderInit(owner.as_str()));
        }

        let _guard = match select(self.lock.lock(), delay.delay_ms(LOCK_TIMEOUT_MS)).await {
            Either::First(guard) => guard,
            Either::Second(()) => {
                log::warn!("Radio: lock timeout requesting {}", owner.as_str());
                return Err(Error::ResourceUnavailable(Resource::RadioLock));
            }
        };

        // Another caller may have switched while we waited
        if self.owner() == owner {
            return Ok(());
        }

        self.shut_down_current(backend, delay).await;

        if owner != RadioOwner::None {
            if !backend.bring_up(owner) {
                log::error!("Radio: {} bring-up failed, radio idle", owner.as_str());
                return Err(Error::ProviderInit(owner.as_str()));
            }
            self.set_owner(owner);
        }
        log::info!("Radio: owner -> {}", owner.as_str());
        Ok(())
    }

    /// Tear the current owner down and leave the radio idle.
    ///
    /// A lock timeout leaves the owner unchanged and returns
    /// `ResourceUnavailable`; the caller retries.
    pub async fn release_radio<B, D>(&self, backend: &mut B, delay: &mut D) -> Result<()>
    where
        B: RadioBackend + ?Sized,
        D: DelayNs,
    {
        if self.owner() == RadioOwner::None {
            return Ok(());
        }

        let _guard = match select(self.lock.lock(), delay.delay_ms(LOCK_TIMEOUT_MS)).await {
            Either::First(guard) => guard,
            Either::Second(()) => {
                log::warn!("Radio: lock timeout on release");
                return Err(Error::ResourceUnavailable(Resource::RadioLock));
            }
        };

        if self.owner() != RadioOwner::None {
            self.shut_down_current(backend, delay).await;
            log::info!("Radio: released");
        }
        Ok(())
    }

    /// Caller holds the lock.
    async fn shut_down_current<B, D>(&self, backend: &mut B, delay: &mut D)
    where
        B: RadioBackend + ?Sized,
        D: DelayNs,
    {
        let current = self.owner();
        if current == RadioOwner::None {
            return;
        }
        backend.tear_down(current);
        delay.delay_ms(SETTLE_MS).await;
        self.set_owner(RadioOwner::None);
    }
}

impl<M: RawMutex> Default for RadioArbiter<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_futures::block_on;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
    use std::vec::Vec;

    type Arbiter = RadioArbiter<CriticalSectionRawMutex>;

    #[derive(Default)]
    struct Recorder {
        log: Vec<(&'static str, RadioOwner)>,
        refuse: Option<RadioOwner>,
    }

    impl RadioBackend for Recorder {
        fn bring_up(&mut self, owner: RadioOwner) -> bool {
            self.log.push(("up", owner));
            self.refuse != Some(owner)
        }

        fn tear_down(&mut self, owner: RadioOwner) {
            self.log.push(("down", owner));
        }
    }

    struct NoDelay;

    impl DelayNs for NoDelay {
        async fn delay_ns(&mut self, _ns: u32) {}
    }

    #[test]
    fn starts_idle() {
        assert_eq!(Arbiter::new().owner(), RadioOwner::None);
    }

    #[test]
    fn repeated_request_brings_up_once() {
        let arbiter = Arbiter::new();
        let mut backend = Recorder::default();
        block_on(async {
            arbiter
                .request_radio(RadioOwner::Ble, &mut backend, &mut NoDelay)
                .await
                .unwrap();
            arbiter
                .request_radio(RadioOwner::Ble, &mut backend, &mut NoDelay)
                .await
                .unwrap();
        });
        assert_eq!(backend.log, [("up", RadioOwner::Ble)]);
        assert_eq!(arbiter.owner(), RadioOwner::Ble);
    }

    #[test]
    fn switching_tears_down_before_bring_up() {
        let arbiter = Arbiter::new();
        let mut backend = Recorder::default();
        block_on(async {
            arbiter
                .request_radio(RadioOwner::WifiPromiscuous, &mut backend, &mut NoDelay)
                .await
                .unwrap();
            arbiter
                .request_radio(RadioOwner::Ble, &mut backend, &mut NoDelay)
                .await
                .unwrap();
        });
        assert_eq!(
            backend.log,
            [
                ("up", RadioOwner::WifiPromiscuous),
                ("down", RadioOwner::WifiPromiscuous),
                ("up", RadioOwner::Ble),
            ]
        );
        assert_eq!(arbiter.owner(), RadioOwner::Ble);
    }

    #[test]
    fn lock_timeout_leaves_owner_and_hardware_alone() {
        let arbiter = Arbiter::new();
        let mut backend = Recorder::default();
        block_on(async {
            arbiter
                .request_radio(RadioOwner::WifiStation, &mut backend, &mut NoDelay)
                .await
                .unwrap();
        });
        backend.log.clear();

        let held = arbiter.try_hold().unwrap();
        let result = block_on(arbiter.request_radio(RadioOwner::Ble, &mut backend, &mut NoDelay));
        assert_eq!(result, Err(Error::ResourceUnavailable(Resource::RadioLock)));
        let result = block_on(arbiter.release_radio(&mut backend, &mut NoDelay));
        assert_eq!(result, Err(Error::ResourceUnavailable(Resource::RadioLock)));
        drop(held);

        assert!(backend.log.is_empty());
        assert_eq!(arbiter.owner(), RadioOwner::WifiStation);
    }

    #[test]
    fn failed_bring_up_leaves_radio_idle() {
        let arbiter = Arbiter::new();
        let mut backend = Recorder {
            refuse: Some(RadioOwner::Ble),
            ..Recorder::default()
        };
        let result = block_on(async {
            arbiter
                .request_radio(RadioOwner::WifiPromiscuous, &mut backend, &mut NoDelay)
                .await
                .unwrap();
            arbiter
                .request_radio(RadioOwner::Ble, &mut backend, &mut NoDelay)
                .await
        });
        assert_eq!(result, Err(Error::ProviderInit("ble")));
        assert_eq!(arbiter.owner(), RadioOwner::None);
        assert_eq!(backend.log.last(), Some(&("up", RadioOwner::Ble)));
    }

    #[test]
    fn lora_is_never_granted() {
        let arbiter = Arbiter::new();
        let mut backend = Recorder::default();
        let result = block_on(arbiter.request_radio(RadioOwner::Lora, &mut backend, &mut NoDelay));
        assert!(result.is_err());
        assert!(backend.log.is_empty());
        assert_eq!(arbiter.owner(), RadioOwner::None);
    }

    #[test]
    fn release_tears_down_and_idles() {
        let arbiter = Arbiter::new();
        let mut backend = Recorder::default();
        block_on(async {
            arbiter
                .request_radio(RadioOwner::Ble, &mut backend, &mut NoDelay)
                .await
                .unwrap();
            arbiter.release_radio(&mut backend, &mut NoDelay).await.unwrap();
            // Releasing an idle radio does nothing
            arbiter.release_radio(&mut backend, &mut NoDelay).await.unwrap();
        });
        assert_eq!(backend.log, [("up", RadioOwner::Ble), ("down", RadioOwner::Ble)]);
        assert_eq!(arbiter.owner(), RadioOwner::None);
    }
}
