/// State shared by the orchestrator and the front end.
///
/// One [`Context`] is built at boot (in a `StaticCell` on the device, on the
/// stack in tests) and handed to both sides by reference. Its methods are
/// the query surface the front end uses; none of them block.
use alloc::vec::Vec as AllocVec;

use embassy_sync::blocking_mutex::raw::RawMutex;
use heapless::Vec;

use crate::actions::{self, ActionType, AvailableAction, InvalidReason, MAX_ACTIONS};
use crate::diag::Diagnostics;
use crate::ipc::{Link, SystemEvent, SystemRequest};
use crate::radio::{RadioArbiter, RadioOwner};
use crate::registry::{RegistryObserver, SharedRegistry, SortOrder, TargetFilter};
use crate::target::Target;

pub struct Context<'o, M: RawMutex, const N: usize> {
    pub(crate) registry: SharedRegistry<'o, M, N>,
    pub(crate) arbiter: RadioArbiter<M>,
    pub(crate) link: Link<M>,
    pub(crate) diagnostics: Diagnostics,
}

impl<'o, M: RawMutex, const N: usize> Context<'o, M, N> {
    pub const fn new() -> Self {
        Self {
            registry: SharedRegistry::new(),
            arbiter: RadioArbiter::new(),
            link: Link::new(),
            diagnostics: Diagnostics::new(),
        }
    }

    /// Register for registry added/updated/removed notifications.
    pub fn subscribe(&self, observer: &'o dyn RegistryObserver) -> bool {
        self.registry.subscribe(observer)
    }

    pub fn get_targets(&self, filter: &TargetFilter, order: SortOrder) -> AllocVec<Target> {
        self.registry.get_targets(filter, order)
    }

    pub fn target_count(&self) -> usize {
        self.registry.len()
    }

    pub fn get_actions_for(&self, target: &Target) -> Vec<AvailableAction, MAX_ACTIONS> {
        actions::get_actions_for(target)
    }

    pub fn is_action_valid(&self, target: &Target, action: ActionType) -> bool {
        actions::is_action_valid(target, action)
    }

    pub fn get_invalid_reason(&self, target: &Target, action: ActionType) -> Option<InvalidReason> {
        actions::get_invalid_reason(target, action)
    }

    pub fn send_request(&self, request: SystemRequest) -> bool {
        self.link.send_request(request)
    }

    pub fn receive_event(&self) -> Option<SystemEvent> {
        self.link.receive_event()
    }

    pub fn radio_owner(&self) -> RadioOwner {
        self.arbiter.owner()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }
}

impl<M: RawMutex, const N: usize> Default for Context<'_, M, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::target::{Security, TargetKind};
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

    #[test]
    fn query_surface_reads_shared_state() {
        let ctx: Context<'_, CriticalSectionRawMutex, 8> = Context::new();
        assert_eq!(ctx.radio_owner(), RadioOwner::None);
        assert_eq!(ctx.target_count(), 0);
        assert_eq!(ctx.diagnostics().dropped_events(), 0);

        let mut ap = Target::new([3; 6], TargetKind::AccessPoint).with_channel(11);
        ap.security = Security::Wpa3;
        ctx.registry.add_or_update(ap.clone(), 100);

        let listed = ctx.get_targets(&TargetFilter::new(), SortOrder::SignalDesc);
        assert_eq!(listed.len(), 1);
        assert!(!ctx.is_action_valid(&listed[0], ActionType::PmkidCapture));
        assert_eq!(
            ctx.get_invalid_reason(&listed[0], ActionType::PmkidCapture),
            Some(InvalidReason::IncompatibleSecurity(Security::Wpa3))
        );
        assert_eq!(ctx.get_actions_for(&ap), actions::get_actions_for(&ap));
    }

    #[test]
    fn requests_and_events_go_through_the_link() {
        let ctx: Context<'_, CriticalSectionRawMutex, 8> = Context::new();
        assert!(ctx.send_request(SystemRequest::WifiScanStart));
        assert_eq!(ctx.receive_event(), None);
    }
}
