/// Two bounded queues between the front end and the orchestrator.
///
/// Requests flow in, events flow out. Anything bigger than a scalar rides
/// in a [`Payload`], a single-owner heap handle: whoever holds the envelope
/// owns the payload, and dropping the envelope frees it. There is no other
/// release path.
use alloc::vec::Vec;
use core::mem;
use core::ops::Deref;

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::{Channel, TrySendError};
use embedded_hal_async::delay::DelayNs;
use heapless::String;

use crate::actions::ActionType;
use crate::diag::Diagnostics;
use crate::error::{Error, Result};
use crate::target::{MacAddr, Target, TargetKey};

pub const REQUEST_QUEUE_DEPTH: usize = 8;
pub const EVENT_QUEUE_DEPTH: usize = 16;

/// Capacity of [`ActionProgress::status`]
pub const STATUS_LEN: usize = 48;

/// Heap-allocated value with exactly one owner.
#[derive(Debug, PartialEq)]
pub struct Payload<T> {
    // Always holds exactly one element
    slot: Vec<T>,
}

impl<T> Payload<T> {
    /// Move `value` onto the heap, reporting exhaustion instead of aborting.
    pub fn try_new(value: T) -> Result<Self> {
        let mut slot = Vec::new();
        slot.try_reserve_exact(1)
            .map_err(|_| Error::AllocationFailure)?;
        slot.push(value);
        Ok(Self { slot })
    }

    pub fn into_inner(mut self) -> T {
        self.slot.swap_remove(0)
    }
}

impl<T> Deref for Payload<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.slot[0]
    }
}

/// Front end → orchestrator.
#[derive(Debug, PartialEq)]
pub enum SystemRequest {
    WifiScanStart,
    WifiScanStop,
    BleScanStart { duration_ms: u32 },
    BleScanStop,
    ActionStart {
        action: ActionType,
        target: Payload<Target>,
    },
    ActionStop,
}

impl SystemRequest {
    pub fn action_start(action: ActionType, target: Target) -> Result<Self> {
        Ok(SystemRequest::ActionStart {
            action,
            target: Payload::try_new(target)?,
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            SystemRequest::WifiScanStart => "wifi_scan_start",
            SystemRequest::WifiScanStop => "wifi_scan_stop",
            SystemRequest::BleScanStart { .. } => "ble_scan_start",
            SystemRequest::BleScanStop => "ble_scan_stop",
            SystemRequest::ActionStart { .. } => "action_start",
            SystemRequest::ActionStop => "action_stop",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    ScanProgress,
    ScanComplete,
    DeviceFound,
    AssociationFound,
    ActionProgress,
    ActionComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionResult {
    InProgress,
    Success,
    Failure,
}

impl ActionResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionResult::InProgress => "in_progress",
            ActionResult::Success => "success",
            ActionResult::Failure => "failure",
        }
    }
}

/// Snapshot of one action's lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionProgress {
    pub action: ActionType,
    pub target: TargetKey,
    pub started_ms: u64,
    pub elapsed_ms: u64,
    pub result: ActionResult,
    pub status: String<STATUS_LEN>,
    /// Packets, advertisements or codes sent so far
    pub units: u32,
}

#[derive(Debug, PartialEq)]
pub enum EventBody {
    Scalar(u32),
    Association { ap: MacAddr, station: MacAddr },
    Target(Payload<Target>),
    Progress(Payload<ActionProgress>),
}

/// Orchestrator → front end.
#[derive(Debug, PartialEq)]
pub struct SystemEvent {
    pub kind: EventKind,
    pub body: EventBody,
}

impl SystemEvent {
    pub fn scalar(kind: EventKind, value: u32) -> Self {
        Self {
            kind,
            body: EventBody::Scalar(value),
        }
    }

    pub fn association(ap: MacAddr, station: MacAddr) -> Self {
        Self {
            kind: EventKind::AssociationFound,
            body: EventBody::Association { ap, station },
        }
    }

    pub fn device_found(target: Target) -> Result<Self> {
        Ok(Self {
            kind: EventKind::DeviceFound,
            body: EventBody::Target(Payload::try_new(target)?),
        })
    }

    pub fn progress(kind: EventKind, progress: ActionProgress) -> Result<Self> {
        Ok(Self {
            kind,
            body: EventBody::Progress(Payload::try_new(progress)?),
        })
    }

    /// Whether the body lives on the heap.
    pub fn is_pointer(&self) -> bool {
        matches!(self.body, EventBody::Target(_) | EventBody::Progress(_))
    }

    /// Size of the heap payload in bytes, 0 for inline bodies.
    pub fn payload_len(&self) -> usize {
        match self.body {
            EventBody::Target(_) => mem::size_of::<Target>(),
            EventBody::Progress(_) => mem::size_of::<ActionProgress>(),
            EventBody::Scalar(_) | EventBody::Association { .. } => 0,
        }
    }
}

/// The queue pair shared by both contexts.
pub struct Link<M: RawMutex> {
    requests: Channel<M, SystemRequest, REQUEST_QUEUE_DEPTH>,
    events: Channel<M, SystemEvent, EVENT_QUEUE_DEPTH>,
}

impl<M: RawMutex> Link<M> {
    pub const fn new() -> Self {
        Self {
            requests: Channel::new(),
            events: Channel::new(),
        }
    }

    /// Enqueue a request without blocking. A full queue drops the request
    /// (and its payload) and returns `false`.
    pub fn send_request(&self, request: SystemRequest) -> bool {
        match self.requests.try_send(request) {
            Ok(()) => true,
            Err(TrySendError::Full(request)) => {
                log::warn!("IPC: request queue full, dropped {}", request.name());
                false
            }
        }
    }

    /// Next pending event, if any. Never blocks.
    pub fn receive_event(&self) -> Option<SystemEvent> {
        self.events.try_receive().ok()
    }

    /// Wait up to `wait_ms` for the next request.
    pub(crate) async fn receive_request<D: DelayNs>(
        &self,
        delay: &mut D,
        wait_ms: u32,
    ) -> Option<SystemRequest> {
        if let Ok(request) = self.requests.try_receive() {
            return Some(request);
        }
        match select(self.requests.receive(), delay.delay_ms(wait_ms)).await {
            Either::First(request) => Some(request),
            Either::Second(()) => None,
        }
    }

    /// Enqueue an event without blocking. On a full queue the event is
    /// dropped here, which releases its payload, and counted once.
    pub(crate) fn post_event(&self, event: SystemEvent, diag: &Diagnostics) -> bool {
        match self.events.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                log::warn!("IPC: event queue full, dropped {:?}", event.kind);
                drop(event);
                diag.record_dropped_event();
                false
            }
        }
    }

    pub fn pending_events(&self) -> usize {
        self.events.len()
    }
}

impl<M: RawMutex> Default for Link<M> {
    fn default() -> Self {
        Self::new()
    }
}
