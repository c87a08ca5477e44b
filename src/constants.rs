//! Wire constants of the STM32 USART bootloader and the VEX master processor.

/// Largest block a single read or write command can move.
pub const MAX_CHUNK_SIZE: usize = 256;

/// Auto-baud synchronization byte.
pub const SYNC: u8 = 0x7f;
pub const ACK: u8 = 0x79;
pub const NACK: u8 = 0x1f;

/// Page count byte of the erase command that selects a global erase.
pub const GLOBAL_ERASE: u8 = 0xff;

pub const DEFAULT_BAUD_RATE: u32 = 115200;
pub const DEFAULT_VERIFY_RETRIES: u32 = 10;

pub mod commands {
    pub const GET: u8 = 0x00;
    pub const GET_VERSION: u8 = 0x01;
    pub const GET_ID: u8 = 0x02;
    pub const READ_MEMORY: u8 = 0x11;
    pub const GO: u8 = 0x21;
    pub const WRITE_MEMORY: u8 = 0x31;
    pub const ERASE: u8 = 0x43;
    pub const WRITE_UNPROTECT: u8 = 0x73;
}

/// Out-of-band commands understood by the VEX master processor.
pub mod vendor {
    pub const PREFIX: [u8; 4] = [0xc9, 0x36, 0xb8, 0x47];

    pub const SYSTEM_STATUS: u8 = 0x21;
    pub const RESET_TARGET: u8 = 0x24;
    pub const ENTER_BOOTLOADER: u8 = 0x25;

    pub const STATUS_HEADER: [u8; 4] = [0xaa, 0x55, 0x21, 0x0a];
    pub const STATUS_REPLY_LEN: usize = 14;

    /// Number of times entry and reset commands are repeated.
    pub const COMMAND_REPEAT: usize = 5;

    /// Byte sent while RTS is held for the control-line entry.
    pub const CONTROL_LINE_MARKER: u8 = 0xf0;
    pub const CONTROL_LINE_BAUD_RATE: u32 = 9600;
}

/// Hardware settling waits and reply timeouts.
///
/// The control-line pulse widths were found empirically on the Cortex and must
/// not be shortened.
pub mod timing {
    use std::time::Duration;

    pub const REPLY_TIMEOUT: Duration = Duration::from_millis(500);
    pub const WRITE_TIMEOUT: Duration = Duration::from_millis(1000);
    pub const ERASE_TIMEOUT: Duration = Duration::from_secs(10);
    pub const STATUS_TIMEOUT: Duration = Duration::from_millis(500);

    pub const LINE_SETTLE: Duration = Duration::from_millis(100);
    pub const STATUS_RETRY_DELAY: Duration = Duration::from_millis(100);
    pub const SYNC_RETRY_DELAY: Duration = Duration::from_millis(100);
    pub const ENTRY_SETTLE: Duration = Duration::from_millis(250);

    pub const RTS_PRE_PULSE: Duration = Duration::from_millis(5);
    pub const RTS_LOW: Duration = Duration::from_millis(15);
    pub const RTS_HIGH: Duration = Duration::from_millis(10);
    pub const MARKER_HOLD: Duration = Duration::from_millis(20);

    pub const PROBE_ATTEMPTS: usize = 5;
    pub const SYNC_ATTEMPTS: usize = 4;
    pub const STATUS_ATTEMPTS: usize = 2;
}
