/// Hardware abstraction for supported boards.
///
/// Each board module defines capabilities and sizing selected at compile
/// time via feature flags. Host builds (no board feature) get conservative
/// defaults so the library stays testable.
use crate::target::Band;

/// Band the radio can transmit on. Every supported ESP32 variant is
/// 2.4 GHz only.
pub const TX_BAND: Band = Band::Ghz2_4;

#[cfg(feature = "board-xiao")]
mod hw {
    pub const BOARD_NAME: &str = "xiao_esp32s3";
    pub const HAS_IR_TX: bool = false;
    /// Targets kept in the registry at once
    pub const REGISTRY_CAPACITY: usize = 96;
}

#[cfg(feature = "board-m5stickc")]
mod hw {
    pub const BOARD_NAME: &str = "m5stickc_plus2";
    // IR LED on GPIO19, no transmit primitive linked in this build
    pub const HAS_IR_TX: bool = false;
    pub const REGISTRY_CAPACITY: usize = 48;
}

#[cfg(not(any(feature = "board-xiao", feature = "board-m5stickc")))]
mod hw {
    pub const BOARD_NAME: &str = "unknown";
    pub const HAS_IR_TX: bool = false;
    pub const REGISTRY_CAPACITY: usize = 32;
}

pub use hw::*;
