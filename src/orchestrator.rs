/// The orchestrator loop and the action lifecycle.
///
/// Runs in its own task. Each [`Orchestrator::iterate`] call handles at most
/// one request, ticks every provider, advances the active action or scan,
/// feeds the watchdog and periodically checks memory headroom. At most one
/// action is in flight; scans and actions never overlap.
use core::fmt::{self, Write as _};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;
use heapless::String;
use serde::Serialize;

use crate::actions::{self, ActionDef, ActionType, Completion};
use crate::config::Config;
use crate::context::Context;
use crate::diag::MemoryProbe;
use crate::error::{Error, Result};
use crate::ipc::{
    ActionProgress, ActionResult, EventKind, SystemEvent, SystemRequest, STATUS_LEN,
};
use crate::protocol::{self, ActionView, Record, TargetView};
use crate::provider::{Engine, Observation, ProviderSet, ENGINES, MAX_OBSERVATIONS_PER_TICK};
use crate::radio::RadioOwner;
use crate::registry::Upsert;
use crate::target::{Target, TargetKey, TargetKind};

/// Monotonic milliseconds since boot.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

pub trait Watchdog {
    fn feed(&mut self);
}

/// Append-only destination for NDJSON records (log file, SD card, serial).
pub trait RecordSink {
    /// Append one complete line. `false` if the sink could not take it.
    fn append(&mut self, line: &[u8]) -> bool;
}

/// Platform services the loop depends on.
pub struct Platform<'a> {
    pub clock: &'a dyn Clock,
    pub watchdog: &'a mut dyn Watchdog,
    pub memory: &'a dyn MemoryProbe,
    pub records: &'a mut dyn RecordSink,
}

struct ActiveAction {
    def: &'static ActionDef,
    target: Target,
    started_ms: u64,
    last_report_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scan {
    Idle,
    Wifi {
        last_report_ms: u64,
    },
    Ble {
        started_ms: u64,
        duration_ms: Option<u32>,
        last_report_ms: u64,
    },
}

impl Scan {
    fn engine(&self) -> Engine {
        match self {
            Scan::Idle => Engine::None,
            Scan::Wifi { .. } => Engine::Wifi,
            Scan::Ble { .. } => Engine::Ble,
        }
    }

    fn set_last_report(&mut self, now_ms: u64) {
        match self {
            Scan::Idle => {}
            Scan::Wifi { last_report_ms } | Scan::Ble { last_report_ms, .. } => {
                *last_report_ms = now_ms
            }
        }
    }
}

fn status(args: fmt::Arguments<'_>) -> String<STATUS_LEN> {
    let mut out = String::new();
    let _ = out.write_fmt(args);
    out
}

pub struct Orchestrator<'a, 'o, M: RawMutex, const N: usize> {
    ctx: &'a Context<'o, M, N>,
    providers: ProviderSet<'a>,
    platform: Platform<'a>,
    config: Config,
    active: Option<ActiveAction>,
    scan: Scan,
    release_pending: bool,
    release_failures: u8,
    last_sweep_ms: u64,
    last_headroom_ms: Option<u64>,
}

impl<'a, 'o, M: RawMutex, const N: usize> Orchestrator<'a, 'o, M, N> {
    pub fn new(
        ctx: &'a Context<'o, M, N>,
        providers: ProviderSet<'a>,
        platform: Platform<'a>,
        config: Config,
    ) -> Self {
        Self {
            ctx,
            providers,
            platform,
            config,
            active: None,
            scan: Scan::Idle,
            release_pending: false,
            release_failures: 0,
            last_sweep_ms: 0,
            last_headroom_ms: None,
        }
    }

    /// Bring every provider up once. Providers that refuse stay wired in
    /// and simply never report anything.
    pub fn start(&mut self) {
        for engine in ENGINES {
            if let Some(provider) = self.providers.get(engine) {
                if provider.init() {
                    log::info!("Provider {} ready", provider.name());
                } else {
                    log::warn!("Provider {} unavailable", provider.name());
                }
            }
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_action(&self) -> Option<ActionType> {
        self.active.as_ref().map(|active| active.def.action)
    }

    pub fn is_scanning(&self) -> bool {
        self.scan != Scan::Idle
    }

    /// Run forever. Returns only on a fatal error, after which the caller
    /// stops feeding the watchdog.
    pub async fn run<D: DelayNs>(mut self, delay: &mut D) -> Error {
        self.start();
        loop {
            if let Err(err) = self.iterate(delay).await {
                log::error!("Orchestrator stopped: {}", err);
                return err;
            }
        }
    }

    /// One pass of the loop. Only fatal errors are returned.
    pub async fn iterate<D: DelayNs>(&mut self, delay: &mut D) -> Result<()> {
        let wait = self.config.receive_wait_ms;
        if let Some(request) = self.ctx.link.receive_request(delay, wait).await {
            self.dispatch(request, delay).await?;
        }

        let now = self.now();
        self.tick_providers(now)?;
        self.advance_action(now)?;
        self.advance_scan(now);
        self.retry_release(delay).await?;

        self.platform.watchdog.feed();

        self.sweep(now);
        self.check_headroom(now);
        Ok(())
    }

    fn now(&self) -> u64 {
        self.platform.clock.now_ms()
    }

    fn post(&self, event: SystemEvent) -> bool {
        self.ctx.link.post_event(event, &self.ctx.diagnostics)
    }

    // ── Requests ───────────────────────────────────────────────────

    /// The request, and any payload it carries, is dropped on return.
    async fn dispatch<D: DelayNs>(&mut self, request: SystemRequest, delay: &mut D) -> Result<()> {
        log::debug!("Request {}", request.name());
        match request {
            SystemRequest::WifiScanStart => {
                self.start_scan(RadioOwner::WifiPromiscuous, None, delay).await;
            }
            SystemRequest::BleScanStart { duration_ms } => {
                let duration = (duration_ms > 0).then_some(duration_ms);
                self.start_scan(RadioOwner::Ble, duration, delay).await;
            }
            SystemRequest::WifiScanStop => {
                if self.scan.engine() == Engine::Wifi {
                    self.end_scan();
                }
            }
            SystemRequest::BleScanStop => {
                if self.scan.engine() == Engine::Ble {
                    self.end_scan();
                }
            }
            SystemRequest::ActionStart { action, target } => {
                self.start_action(action, &target, delay).await?;
            }
            SystemRequest::ActionStop => {
                if self.active.is_some() {
                    let now = self.now();
                    self.finish(ActionResult::Success, status(format_args!("Stopped")), now)?;
                } else {
                    log::debug!("{}", Error::InvalidTransition("stop with no active action"));
                }
            }
        }
        Ok(())
    }

    // ── Scans ──────────────────────────────────────────────────────

    /// Every start that does not begin a scan still answers with one
    /// `ScanComplete`, so the front end is never left waiting.
    async fn start_scan<D: DelayNs>(&mut self, owner: RadioOwner, duration_ms: Option<u32>, delay: &mut D) {
        let engine = owner.engine();
        if let Some(active) = &self.active {
            log::warn!(
                "Scan on {} rejected: {}, {} is running",
                engine.as_str(),
                Error::InvalidTransition("scan during action"),
                active.def.action.slug()
            );
            self.refuse_scan();
            return;
        }
        if self.scan.engine() == engine {
            return;
        }
        if self.scan != Scan::Idle {
            self.end_scan();
        }

        if let Err(err) = self
            .ctx
            .arbiter
            .request_radio(owner, &mut self.providers, delay)
            .await
        {
            log::warn!("Scan on {} not started: {}", engine.as_str(), err);
            self.refuse_scan();
            return;
        }
        self.release_pending = false;

        let started = self
            .providers
            .get(engine)
            .is_some_and(|provider| provider.begin_scan(duration_ms));
        if !started {
            log::warn!("Scan on {} refused by provider", engine.as_str());
            self.release_pending = true;
            self.refuse_scan();
            return;
        }

        let now = self.now();
        self.scan = match engine {
            Engine::Ble => Scan::Ble {
                started_ms: now,
                duration_ms,
                last_report_ms: now,
            },
            _ => Scan::Wifi {
                last_report_ms: now,
            },
        };
        log::info!("Scan started on {}", engine.as_str());
    }

    fn end_scan(&mut self) {
        let engine = self.scan.engine();
        if let Some(provider) = self.providers.get(engine) {
            provider.stop_hardware_activities();
        }
        self.scan = Scan::Idle;
        self.release_pending = true;

        let count = self.ctx.registry.len() as u32;
        self.post(SystemEvent::scalar(EventKind::ScanComplete, count));
        log::info!("Scan on {} stopped, {} targets", engine.as_str(), count);
    }

    fn refuse_scan(&mut self) {
        let count = self.ctx.registry.len() as u32;
        self.post(SystemEvent::scalar(EventKind::ScanComplete, count));
    }

    fn advance_scan(&mut self, now: u64) {
        let last_report_ms = match self.scan {
            Scan::Idle => return,
            Scan::Ble {
                started_ms,
                duration_ms: Some(duration),
                ..
            } if now.saturating_sub(started_ms) >= duration as u64 => {
                self.end_scan();
                return;
            }
            Scan::Wifi { last_report_ms } | Scan::Ble { last_report_ms, .. } => last_report_ms,
        };
        if now.saturating_sub(last_report_ms) >= self.config.progress_interval_ms {
            self.scan.set_last_report(now);
            let count = self.ctx.registry.len() as u32;
            self.post(SystemEvent::scalar(EventKind::ScanProgress, count));
        }
    }

    // ── Actions ────────────────────────────────────────────────────

    async fn start_action<D: DelayNs>(
        &mut self,
        action: ActionType,
        target: &Target,
        delay: &mut D,
    ) -> Result<()> {
        let now = self.now();

        if let Some(active) = &self.active {
            log::warn!(
                "{}: {} rejected while {} runs",
                Error::InvalidTransition("action already active"),
                action.slug(),
                active.def.action.slug()
            );
            let text = status(format_args!("Busy: {} running", active.def.action.slug()));
            return self.reject(action, target.key(), now, text);
        }

        let Some(def) = actions::definition(action) else {
            return self.reject(action, target.key(), now, status(format_args!("Unknown action")));
        };

        // Judge against the freshest observation when the registry has one
        let target = self
            .ctx
            .registry
            .get(&target.key())
            .unwrap_or_else(|| target.clone());

        if let Some(reason) = actions::get_invalid_reason(&target, action) {
            log::info!("Action {} invalid: {}", action.slug(), reason);
            return self.reject(action, target.key(), now, status(format_args!("{}", reason)));
        }
        if def.destructive && !self.config.allow_destructive {
            log::info!("Action {} blocked: destructive actions disabled", action.slug());
            let text = status(format_args!("Destructive actions disabled"));
            return self.reject(action, target.key(), now, text);
        }

        if self.scan != Scan::Idle {
            self.end_scan();
        }

        if def.radio != RadioOwner::None {
            if let Err(err) = self
                .ctx
                .arbiter
                .request_radio(def.radio, &mut self.providers, delay)
                .await
            {
                log::warn!("Action {} not started: {}", action.slug(), err);
                let text = status(format_args!("Radio unavailable"));
                return self.reject(action, target.key(), now, text);
            }
            self.release_pending = false;
        }

        if def.engine != Engine::None {
            let begun = self
                .providers
                .get(def.engine)
                .is_some_and(|provider| provider.begin_action(action, &target));
            if !begun {
                log::warn!("Action {}: {}", action.slug(), Error::ProviderInit(def.engine.as_str()));
                if def.radio != RadioOwner::None {
                    self.release_pending = true;
                }
                let text = status(format_args!("Refused by {} provider", def.engine.as_str()));
                return self.reject(action, target.key(), now, text);
            }
        }

        if action == ActionType::SaveTarget {
            self.append_record(&Record::Target(TargetView::new(&target, None)));
        }

        let started_ms = self.now();
        log::info!("Action {} started on {}", action.slug(), target.kind().as_str());
        self.active = Some(ActiveAction {
            def,
            target,
            started_ms,
            last_report_ms: started_ms,
        });
        Ok(())
    }

    /// Report a start that never became active.
    fn reject(
        &mut self,
        action: ActionType,
        target: TargetKey,
        now: u64,
        status: String<STATUS_LEN>,
    ) -> Result<()> {
        let progress = ActionProgress {
            action,
            target,
            started_ms: now,
            elapsed_ms: 0,
            result: ActionResult::Failure,
            status,
            units: 0,
        };
        self.post(SystemEvent::progress(EventKind::ActionComplete, progress)?);
        Ok(())
    }

    fn advance_action(&mut self, now: u64) -> Result<()> {
        let Some(active) = &self.active else {
            return Ok(());
        };
        let def = active.def;
        let target = active.target.key();
        let started_ms = active.started_ms;
        let last_report_ms = active.last_report_ms;

        let provider = self.providers.get_ref(def.engine);
        let units = provider.map_or(0, |p| p.units_sent());
        let done = match def.completion {
            Completion::Immediate => true,
            Completion::CapturedArtifact => provider.is_some_and(|p| p.has_captured_artifact()),
            Completion::ProviderIdle => provider.map_or(true, |p| p.is_idle()),
            Completion::Timeout => false,
        };

        if done {
            let text = match def.completion {
                Completion::Immediate => status(format_args!("Saved")),
                Completion::CapturedArtifact => status(format_args!("Captured")),
                _ => status(format_args!("Done, {} {} sent", units, def.unit)),
            };
            return self.finish(ActionResult::Success, text, now);
        }

        let elapsed_ms = now.saturating_sub(started_ms);
        if elapsed_ms >= def.timeout_ms {
            log::info!("Action {}: {}", def.action.slug(), Error::BoundedTimeout);
            let text = status(format_args!("Time limit reached, {} {}", units, def.unit));
            return self.finish(ActionResult::Success, text, now);
        }

        if now.saturating_sub(last_report_ms) >= self.config.progress_interval_ms {
            let text = match def.completion {
                Completion::CapturedArtifact => {
                    status(format_args!("Waiting for capture, {} {}", units, def.unit))
                }
                _ => status(format_args!("{} {} sent", units, def.unit)),
            };
            let progress = ActionProgress {
                action: def.action,
                target,
                started_ms,
                elapsed_ms,
                result: ActionResult::InProgress,
                status: text,
                units,
            };
            if let Some(active) = self.active.as_mut() {
                active.last_report_ms = now;
            }
            self.post(SystemEvent::progress(EventKind::ActionProgress, progress)?);
        }
        Ok(())
    }

    /// Leave `Active`: stop the provider, record the outcome, then emit the
    /// terminal progress event followed by the completion event.
    fn finish(&mut self, result: ActionResult, text: String<STATUS_LEN>, now: u64) -> Result<()> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        let def = active.def;

        let mut units = 0;
        let mut artifact_line = None;
        if let Some(provider) = self.providers.get(def.engine) {
            units = provider.units_sent();
            if def.completion == Completion::CapturedArtifact {
                if let Some(bytes) = provider.artifact() {
                    let hex = protocol::hex_prefix(bytes);
                    let record = protocol::artifact_record(def.action, active.target.mac(), bytes, &hex);
                    artifact_line = protocol::to_line(&record);
                }
            }
            provider.stop_hardware_activities();
        }
        if def.radio != RadioOwner::None {
            self.release_pending = true;
        }

        let progress = ActionProgress {
            action: def.action,
            target: active.target.key(),
            started_ms: active.started_ms,
            elapsed_ms: now.saturating_sub(active.started_ms),
            result,
            status: text,
            units,
        };
        log::info!(
            "Action {} finished: {} ({})",
            def.action.slug(),
            result.as_str(),
            progress.status
        );

        if let Some(line) = artifact_line {
            self.append_line(&line);
        }
        self.append_record(&Record::Action(ActionView::new(&progress, true)));

        self.post(SystemEvent::progress(EventKind::ActionProgress, progress.clone())?);
        self.post(SystemEvent::progress(EventKind::ActionComplete, progress)?);
        Ok(())
    }

    fn append_record<T: Serialize>(&mut self, record: &T) {
        match protocol::to_line(record) {
            Some(line) => self.append_line(&line),
            None => log::warn!("Record too large to serialize"),
        }
    }

    fn append_line(&mut self, line: &[u8]) {
        if !self.platform.records.append(line) {
            log::warn!("Record sink rejected {} bytes", line.len());
        }
    }

    // ── Providers and discovery ────────────────────────────────────

    fn tick_providers(&mut self, now: u64) -> Result<()> {
        for engine in ENGINES {
            if let Some(provider) = self.providers.get(engine) {
                provider.on_tick(now);
            }
        }
        for engine in ENGINES {
            for _ in 0..MAX_OBSERVATIONS_PER_TICK {
                let Some(observation) = self
                    .providers
                    .get(engine)
                    .and_then(|provider| provider.poll_observation())
                else {
                    break;
                };
                self.ingest(observation, now)?;
            }
        }
        Ok(())
    }

    fn ingest(&mut self, observation: Observation, now: u64) -> Result<()> {
        match observation {
            Observation::Device(target) => {
                let key = target.key();
                if self.ctx.registry.add_or_update(target, now) != Upsert::Updated {
                    self.announce(&key)?;
                }
            }
            Observation::Association {
                ap,
                station,
                rssi,
                channel,
            } => {
                let outcome = self
                    .ctx
                    .registry
                    .record_association(ap, station, rssi, channel, now);
                if outcome.station_added {
                    self.announce(&TargetKey {
                        mac: station,
                        kind: TargetKind::Station,
                    })?;
                }
                if outcome.new_link {
                    self.post(SystemEvent::association(ap, station));
                }
            }
        }
        Ok(())
    }

    /// Post `DeviceFound` for a freshly added registry entry.
    fn announce(&mut self, key: &TargetKey) -> Result<()> {
        if let Some(stored) = self.ctx.registry.get(key) {
            self.post(SystemEvent::device_found(stored)?);
        }
        Ok(())
    }

    // ── Housekeeping ───────────────────────────────────────────────

    /// Release the radio once nothing needs it. Gives up with
    /// [`Error::RadioDesync`] after too many consecutive failures.
    async fn retry_release<D: DelayNs>(&mut self, delay: &mut D) -> Result<()> {
        if !self.release_pending {
            return Ok(());
        }
        let radio_in_use = self.scan != Scan::Idle
            || self
                .active
                .as_ref()
                .is_some_and(|active| active.def.radio != RadioOwner::None);
        if radio_in_use {
            self.release_pending = false;
            return Ok(());
        }

        match self.ctx.arbiter.release_radio(&mut self.providers, delay).await {
            Ok(()) => {
                self.release_pending = false;
                self.release_failures = 0;
            }
            Err(err) => {
                self.release_failures = self.release_failures.saturating_add(1);
                log::warn!(
                    "Radio release failed ({}/{}): {}",
                    self.release_failures,
                    self.config.radio_release_retries,
                    err
                );
                if self.release_failures >= self.config.radio_release_retries {
                    return Err(Error::RadioDesync);
                }
            }
        }
        Ok(())
    }

    fn sweep(&mut self, now: u64) {
        if now.saturating_sub(self.last_sweep_ms) < self.config.sweep_interval_ms {
            return;
        }
        self.last_sweep_ms = now;
        let removed = self.ctx.registry.remove_stale(now, self.config.stale_ttl_ms);
        if removed > 0 {
            log::debug!("Swept {} stale targets", removed);
        }
    }

    fn check_headroom(&mut self, now: u64) {
        if let Some(last) = self.last_headroom_ms {
            if now.saturating_sub(last) < self.config.headroom_interval_ms {
                return;
            }
        }
        self.last_headroom_ms = Some(now);

        let heap_free = self.platform.memory.heap_free();
        let stack_free = self.platform.memory.stack_headroom();
        self.ctx.diagnostics.record_heap_reading(heap_free);
        if heap_free < self.config.min_heap_free || stack_free < self.config.min_stack_free {
            log::warn!("Low headroom: heap {} B free, stack {} B free", heap_free, stack_free);
            self.ctx.diagnostics.record_headroom_warning();
        }
    }
}
