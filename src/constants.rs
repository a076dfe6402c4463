//! ## Constants
//!
//! Wire-level constants of the USBTMC class and its USB488 sub-protocol.
//!

#[allow(unused)]
pub mod usb {
    /// The interface class code for USBTMC (application-specific)
    pub const USBTMC_CLASS_CODE: u8 = 0xFE;
    /// The interface subclass code for USBTMC
    pub const USBTMC_SUBCLASS_CODE: u8 = 0x03;
    /// The interface protocol code marking the USB488 sub-protocol
    pub const USB488_PROTOCOL_CODE: u8 = 0x01;
    /// Advantest/ADCMT vendor id; their USBTMC implementation needs quirks
    pub const ADVANTEST_VID: u16 = 0x1334;
}

#[allow(unused)]
pub mod misc {
    use std::time::Duration;

    /// The default per-operation timeout
    pub const DEFAULT_TIMEOUT_DURATION: Duration = Duration::from_millis(5_000);
    /// The size in bytes of a USBTMC header in a bulk transfer
    pub const USBTMC_HEADER_SIZE: usize = 12;
    /// Default upper bound on the payload carried by one bulk header
    pub const DEFAULT_MAX_TRANSFER_SIZE: usize = 1024 * 1024;
    /// Maximum payload Advantest/ADCMT devices accept per read
    pub const ADVANTEST_MAX_TRANSFER_SIZE: usize = 63;
    /// Upper bound on CHECK_*_STATUS polls before the state machine gives up
    pub const STATUS_POLL_LIMIT: usize = 50;
    /// Back-off between status polls
    pub const STATUS_POLL_BACKOFF: Duration = Duration::from_millis(1);
    /// Timeout used for the drain reads inside abort and clear
    pub const DRAIN_TIMEOUT: Duration = Duration::from_millis(100);
}

#[allow(unused)]
pub mod usbtmc_status {
    /// Success
    pub const STATUS_SUCCESS: u8 = 0x01;
    /// A split CHECK_STATUS request was received and is still being processed
    pub const STATUS_PENDING: u8 = 0x02;
    /// Failure for unspecified or undefined reason
    pub const STATUS_FAILED: u8 = 0x80;
    /// INITIATE_ABORT received but the named transfer is not in progress
    pub const STATUS_TRANSFER_NOT_IN_PROGRESS: u8 = 0x81;
    /// CHECK_STATUS received without a preceding INITIATE request
    pub const STATUS_SPLIT_NOT_IN_PROGRESS: u8 = 0x82;
    /// INITIATE received while another split transaction is in progress
    pub const STATUS_SPLIT_IN_PROGRESS: u8 = 0x83;
}

#[allow(unused)]
pub mod control_requests {
    pub const INITIATE_ABORT_BULK_OUT: u8 = 1;
    pub const CHECK_ABORT_BULK_OUT_STATUS: u8 = 2;
    pub const INITIATE_ABORT_BULK_IN: u8 = 3;
    pub const CHECK_ABORT_BULK_IN_STATUS: u8 = 4;
    pub const INITIATE_CLEAR: u8 = 5;
    pub const CHECK_CLEAR_STATUS: u8 = 6;
    pub const GET_CAPABILITIES: u8 = 7;
    pub const INDICATOR_PULSE: u8 = 64;

    // USB488 only
    pub const READ_STATUS_BYTE: u8 = 128;
    pub const REN_CONTROL: u8 = 160;
    pub const GO_TO_LOCAL: u8 = 161;
    pub const LOCAL_LOCKOUT: u8 = 162;
}

#[allow(unused)]
pub mod bulk_msg_id {
    pub const DEV_DEP_MSG_OUT: u8 = 1;
    pub const REQUEST_DEV_DEP_MSG_IN: u8 = 2;
    pub const DEV_DEP_MSG_IN: u8 = 2;
    pub const VENDOR_SPECIFIC_OUT: u8 = 126;
    pub const REQUEST_VENDOR_SPECIFIC_IN: u8 = 127;
    pub const VENDOR_SPECIFIC_IN: u8 = 127;
    /// USB488 trigger message, header-only
    pub const TRIGGER: u8 = 128;
}
