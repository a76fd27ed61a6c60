//! Protocol constants

use std::time::Duration;

/// Default wait for a single response frame
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on the wait-for-ready poll
pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(3);

/// Default delay between status register polls
pub const DEFAULT_READY_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Default bound on the whole open sequence (connect, identify, init)
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on configure and single driver commands
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(10);

/// Default bound on cancel confirmation before a forced reset
pub const DEFAULT_CANCEL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default connect timeout for network transports
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bytes requested per data read
pub const DEFAULT_CHUNK_SIZE: usize = 32 * 1024;

/// Default TCP port for network register-protocol devices
pub const DEFAULT_PORT: u16 = 8612;

/// Status register bits
pub mod status_bits {
    /// Device idle and accepting commands
    pub const READY: u8 = 1;

    /// Motor or sensor busy
    pub const BUSY: u8 = 1 << 1;

    /// Carriage at home position
    pub const HOME: u8 = 1 << 2;

    /// Lamp powered
    pub const LAMP: u8 = 1 << 3;
}

/// Values written to the mode register
pub mod mode_codes {
    pub const LINEART: u8 = 0;
    pub const GRAY: u8 = 1;
    pub const COLOR: u8 = 2;
}

/// Calibration reference targets (payload of `CMD_CALIBRATE`)
pub mod calibration_targets {
    pub const WHITE: u8 = 0;
    pub const BLACK: u8 = 1;
}

/// Lamp register values
pub mod lamp {
    pub const OFF: u8 = 0x00;
    pub const ON: u8 = 0x01;
}
