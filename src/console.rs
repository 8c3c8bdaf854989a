/// Serial console front end.
///
/// The host sends one NDJSON command per line; the device answers with
/// NDJSON lines and streams every orchestrator event the same way. The
/// console only talks to the [`Context`] query surface and the request
/// queue, so it can run on any task.
use alloc::vec::Vec as AllocVec;

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::actions::{ActionType, InvalidReason, ACTION_TABLE};
use crate::board;
use crate::context::Context;
use crate::ipc::{EventBody, EventKind, SystemEvent, SystemRequest};
use crate::protocol::{
    mac_string, to_line, ActionView, DeviceMessage, HostCommand, MsgBuffer, RawCommand,
    TargetView, MAX_MSG_LEN, VERSION,
};
use crate::registry::{SortOrder, TargetFilter};
use crate::target::{Target, TargetKind};

/// Serial baud rate
pub const SERIAL_BAUD: u32 = 115200;

/// Rows a listing can address by index
pub const MAX_LISTING: usize = u8::MAX as usize;

/// Where rendered lines go (UART on the device, a Vec in tests).
pub trait LineSink {
    fn write_line(&mut self, line: &[u8]);
}

/// Deserialize a HostCommand from a JSON byte slice.
///
/// Malformed JSON, unknown commands, unknown actions and missing
/// arguments all yield `None`.
pub fn parse_command(data: &[u8]) -> Option<HostCommand> {
    // Strip trailing newline/whitespace
    let trimmed = data.trim_ascii_end();
    if trimmed.is_empty() {
        return None;
    }
    let (raw, _) = serde_json_core::from_slice::<RawCommand>(trimmed).ok()?;
    match raw.cmd.as_str() {
        "scan_wifi" => Some(HostCommand::ScanWifi),
        "scan_ble" => Some(HostCommand::ScanBle {
            duration_ms: raw.ms,
        }),
        "stop_scan" => Some(HostCommand::StopScan),
        "list" => Some(HostCommand::List {
            sort: raw.sort,
            kind: raw.kind,
        }),
        "actions" => Some(HostCommand::Actions { idx: raw.idx? }),
        "start" => Some(HostCommand::Start {
            idx: raw.idx?,
            action: ActionType::from_slug(raw.action?.as_str())?,
        }),
        "stop" => Some(HostCommand::Stop),
        "status" => Some(HostCommand::Status),
        _ => None,
    }
}

fn sort_order(name: &str) -> Option<SortOrder> {
    match name {
        "signal" => Some(SortOrder::SignalDesc),
        "name" => Some(SortOrder::NameAsc),
        "seen" => Some(SortOrder::LastSeenDesc),
        "clients" => Some(SortOrder::ClientsDesc),
        "kind" => Some(SortOrder::KindThenSignal),
        _ => None,
    }
}

/// A filter showing only targets of the named kind.
fn kind_filter(name: &str) -> Option<TargetFilter> {
    let kind = match name {
        "ap" => TargetKind::AccessPoint,
        "sta" => TargetKind::Station,
        "ble" => TargetKind::BleDevice,
        "ir" => TargetKind::Infrared,
        _ => return None,
    };
    Some(TargetFilter {
        show_access_points: kind == TargetKind::AccessPoint,
        show_stations: kind == TargetKind::Station,
        show_ble: kind == TargetKind::BleDevice,
        show_infrared: kind == TargetKind::Infrared,
        ..TargetFilter::new()
    })
}

/// Render one orchestrator event as an NDJSON line.
///
/// Consumes the event, so any heap payload is released when this returns.
pub fn render_event(event: SystemEvent) -> Option<MsgBuffer> {
    match (event.kind, &event.body) {
        (EventKind::ScanProgress | EventKind::ScanComplete, EventBody::Scalar(targets)) => {
            to_line(&DeviceMessage::Scan {
                targets: *targets,
                done: event.kind == EventKind::ScanComplete,
            })
        }
        (EventKind::DeviceFound, EventBody::Target(target)) => {
            to_line(&DeviceMessage::Target(TargetView::new(target, None)))
        }
        (EventKind::AssociationFound, EventBody::Association { ap, station }) => {
            to_line(&DeviceMessage::Association {
                ap: mac_string(ap),
                sta: mac_string(station),
            })
        }
        (EventKind::ActionProgress | EventKind::ActionComplete, EventBody::Progress(progress)) => {
            let done = event.kind == EventKind::ActionComplete;
            to_line(&DeviceMessage::Action(ActionView::new(progress, done)))
        }
        (kind, _) => {
            log::warn!("Console: {:?} event with unexpected body", kind);
            None
        }
    }
}

/// Serial NDJSON reader state machine.
/// Accumulates bytes until a newline is found, then yields the line.
pub struct LineReader {
    buf: [u8; MAX_MSG_LEN],
    pos: usize,
    overflowed: bool,
}

impl LineReader {
    pub const fn new() -> Self {
        Self {
            buf: [0; MAX_MSG_LEN],
            pos: 0,
            overflowed: false,
        }
    }

    /// Feed a byte into the reader. Returns a complete line (without newline)
    /// when one is detected. An over-long line is dropped whole.
    pub fn feed(&mut self, byte: u8) -> Option<&[u8]> {
        if byte == b'\n' || byte == b'\r' {
            let complete = self.pos > 0 && !self.overflowed;
            let len = self.pos;
            self.pos = 0;
            self.overflowed = false;
            if complete {
                Some(&self.buf[..len])
            } else {
                None
            }
        } else if self.pos < self.buf.len() {
            self.buf[self.pos] = byte;
            self.pos += 1;
            None
        } else {
            self.overflowed = true;
            None
        }
    }
}

impl Default for LineReader {
    fn default() -> Self {
        Self::new()
    }
}

/// Console session state: the last listing, which `actions` and `start`
/// address by index.
pub struct Console {
    listing: AllocVec<Target>,
}

impl Console {
    pub const fn new() -> Self {
        Self {
            listing: AllocVec::new(),
        }
    }

    /// Parse and run one input line. Unparseable input gets an error line.
    pub fn handle_line<M: RawMutex, const N: usize>(
        &mut self,
        line: &[u8],
        ctx: &Context<'_, M, N>,
        uptime_ms: u64,
        out: &mut dyn LineSink,
    ) {
        match parse_command(line) {
            Some(cmd) => self.handle(cmd, ctx, uptime_ms, out),
            None => {
                log::debug!("Console: unparseable line ({} bytes)", line.len());
                emit(out, &DeviceMessage::Error { msg: "bad command" });
            }
        }
    }

    pub fn handle<M: RawMutex, const N: usize>(
        &mut self,
        cmd: HostCommand,
        ctx: &Context<'_, M, N>,
        uptime_ms: u64,
        out: &mut dyn LineSink,
    ) {
        match cmd {
            HostCommand::ScanWifi => request(ctx, SystemRequest::WifiScanStart, out),
            HostCommand::ScanBle { duration_ms } => request(
                ctx,
                SystemRequest::BleScanStart {
                    duration_ms: duration_ms.unwrap_or(0),
                },
                out,
            ),
            HostCommand::StopScan => {
                // Whichever scan is not running ignores its stop
                request(ctx, SystemRequest::WifiScanStop, out);
                request(ctx, SystemRequest::BleScanStop, out);
            }
            HostCommand::List { sort, kind } => {
                let order = match sort.as_deref() {
                    None => SortOrder::default(),
                    Some(name) => match sort_order(name) {
                        Some(order) => order,
                        None => return emit(out, &DeviceMessage::Error { msg: "unknown sort" }),
                    },
                };
                let filter = match kind.as_deref() {
                    None => TargetFilter::new(),
                    Some(name) => match kind_filter(name) {
                        Some(filter) => filter,
                        None => return emit(out, &DeviceMessage::Error { msg: "unknown kind" }),
                    },
                };
                self.list(ctx, &filter, order, out);
            }
            HostCommand::Actions { idx } => match self.listing.get(idx as usize) {
                Some(target) => show_actions(target, ctx, out),
                None => emit(out, &DeviceMessage::Error { msg: "no such target" }),
            },
            HostCommand::Start { idx, action } => match self.listing.get(idx as usize) {
                Some(target) => start(target, action, ctx, out),
                None => emit(out, &DeviceMessage::Error { msg: "no such target" }),
            },
            HostCommand::Stop => request(ctx, SystemRequest::ActionStop, out),
            HostCommand::Status => {
                let diag = ctx.diagnostics();
                emit(
                    out,
                    &DeviceMessage::Status {
                        radio: ctx.radio_owner().as_str(),
                        targets: ctx.target_count() as u32,
                        dropped: diag.dropped_events(),
                        heap_low: diag.low_heap_mark(),
                        uptime: (uptime_ms / 1000) as u32,
                        board: board::BOARD_NAME,
                        version: VERSION,
                    },
                );
            }
        }
    }

    fn list<M: RawMutex, const N: usize>(
        &mut self,
        ctx: &Context<'_, M, N>,
        filter: &TargetFilter,
        order: SortOrder,
        out: &mut dyn LineSink,
    ) {
        self.listing = ctx.get_targets(filter, order);
        self.listing.truncate(MAX_LISTING);
        for (idx, target) in self.listing.iter().enumerate() {
            emit(out, &DeviceMessage::Target(TargetView::new(target, Some(idx as u8))));
        }
        emit(
            out,
            &DeviceMessage::Scan {
                targets: self.listing.len() as u32,
                done: true,
            },
        );
    }

    /// Targets of the last listing, in listed order.
    pub fn listing(&self) -> &[Target] {
        &self.listing
    }
}

impl Default for Console {
    fn default() -> Self {
        Self::new()
    }
}

/// Offered actions, then the reasons for the ones of the right kind that
/// are not offered.
fn show_actions<M: RawMutex, const N: usize>(
    target: &Target,
    ctx: &Context<'_, M, N>,
    out: &mut dyn LineSink,
) {
    for (idx, available) in ctx.get_actions_for(target).iter().enumerate() {
        emit(out, &DeviceMessage::option(idx as u8, available));
    }
    for def in ACTION_TABLE {
        match ctx.get_invalid_reason(target, def.action) {
            None | Some(InvalidReason::WrongKind { .. }) => {}
            Some(reason) => emit(
                out,
                &DeviceMessage::Unavailable {
                    action: def.action.slug(),
                    reason: reason.message(),
                },
            ),
        }
    }
}

fn start<M: RawMutex, const N: usize>(
    target: &Target,
    action: ActionType,
    ctx: &Context<'_, M, N>,
    out: &mut dyn LineSink,
) {
    if let Some(reason) = ctx.get_invalid_reason(target, action) {
        return emit(
            out,
            &DeviceMessage::Unavailable {
                action: action.slug(),
                reason: reason.message(),
            },
        );
    }
    match SystemRequest::action_start(action, target.clone()) {
        Ok(req) => request(ctx, req, out),
        Err(e) => {
            log::error!("Console: {}", e);
            emit(out, &DeviceMessage::Error { msg: "out of memory" });
        }
    }
}

fn request<M: RawMutex, const N: usize>(
    ctx: &Context<'_, M, N>,
    req: SystemRequest,
    out: &mut dyn LineSink,
) {
    if !ctx.send_request(req) {
        emit(out, &DeviceMessage::Error { msg: "busy" });
    }
}

fn emit(out: &mut dyn LineSink, msg: &DeviceMessage<'_>) {
    match to_line(msg) {
        Some(line) => out.write_line(&line),
        None => log::warn!("Console: message too large to serialize"),
    }
}
