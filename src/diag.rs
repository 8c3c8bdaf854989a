/// Process-wide diagnostic counters.
///
/// One [`Diagnostics`] lives in the shared context. The orchestrator is the
/// only writer; everyone else gets read-only accessors.
use core::sync::atomic::{AtomicU32, Ordering};

/// Heap and stack headroom of the running system.
pub trait MemoryProbe {
    fn heap_free(&self) -> usize;
    /// Bytes left on the orchestrator's stack. Platforms that cannot
    /// measure it report `usize::MAX`.
    fn stack_headroom(&self) -> usize {
        usize::MAX
    }
}

pub struct Diagnostics {
    dropped_events: AtomicU32,
    headroom_warnings: AtomicU32,
    low_heap_mark: AtomicU32,
}

impl Diagnostics {
    pub const fn new() -> Self {
        Self {
            dropped_events: AtomicU32::new(0),
            headroom_warnings: AtomicU32::new(0),
            low_heap_mark: AtomicU32::new(u32::MAX),
        }
    }

    /// Events dropped because the outbound queue was full
    pub fn dropped_events(&self) -> u32 {
        self.dropped_events.load(Ordering::Relaxed)
    }

    /// Headroom checks that came in under the configured threshold
    pub fn headroom_warnings(&self) -> u32 {
        self.headroom_warnings.load(Ordering::Relaxed)
    }

    /// Lowest free-heap reading seen so far (`u32::MAX` before the first check)
    pub fn low_heap_mark(&self) -> u32 {
        self.low_heap_mark.load(Ordering::Relaxed)
    }

    pub(crate) fn record_dropped_event(&self) {
        self.dropped_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_heap_reading(&self, heap_free: usize) {
        let reading = heap_free.min(u32::MAX as usize) as u32;
        if reading < self.low_heap_mark.load(Ordering::Relaxed) {
            self.low_heap_mark.store(reading, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_headroom_warning(&self) {
        self.headroom_warnings.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for Diagnostics {
    fn default() -> Self {
        Self::new()
    }
}
