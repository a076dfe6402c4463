//! ## Types
//!
//! The different types used across the crate.
//!

use rusb::{Direction, TransferType};

/// ### bTag
///
/// Allocator for the bulk-transfer tag byte.
///
/// Tags run 1..=255, never 0; each allocation is the previous value plus one,
/// wrapping from 255 back to 1. The last issued value is kept around because
/// the abort state machines must name the transfer they are aborting.
///
#[derive(Debug, Clone, Default)]
pub struct BTag {
    last: u8,
}

impl BTag {
    pub fn new() -> BTag {
        BTag { last: 0 }
    }

    /// Allocate the next tag.
    pub fn next(&mut self) -> u8 {
        self.last = (self.last % 255) + 1;
        self.last
    }

    /// The most recently issued tag (0 if none was issued yet).
    pub fn last(&self) -> u8 {
        self.last
    }
}

/// ### RSTB tag
///
/// Tag allocator for USB488 READ_STATUS_BYTE requests, which use their own
/// 2..=127 range.
///
#[derive(Debug, Clone)]
pub struct RstbTag {
    last: u8,
}

impl RstbTag {
    pub fn new() -> RstbTag {
        RstbTag { last: 1 }
    }

    pub fn next(&mut self) -> u8 {
        self.last = if self.last >= 127 { 2 } else { self.last + 1 };
        self.last
    }
}

/// ### Device Mode
///
/// The configuration, interface and alternate setting the session operates
/// on, plus what was learned about the interface while resolving it.
///
#[derive(Debug, Clone, Default)]
pub struct DeviceMode {
    /// The USB configuration value (bConfigurationValue)
    pub config_number: u8,
    /// The interface number within that configuration
    pub interface_number: u8,
    /// The alternate setting number within that interface
    pub setting_number: u8,
    /// Whether a kernel driver was detached and must be re-attached on close
    pub has_kernel_driver: bool,
    /// Whether the interface speaks the USB488 sub-protocol
    pub usb488: bool,
}

/// Properties of one endpoint on the claimed interface.
#[derive(Clone, Debug)]
pub struct Endpoint {
    /// Address of the endpoint (direction bit included)
    pub address: u8,
    /// Maximum packet size on this endpoint
    pub max_packet_size: u16,
    /// Bulk or Interrupt for USBTMC
    pub transfer_type: TransferType,
    /// In or Out for USBTMC
    pub direction: Direction,
}

/// ### USBTMC Endpoints
///
/// The endpoints the class requires, resolved at open time.
///
#[derive(Clone, Debug)]
pub struct UsbtmcEndpoints {
    /// The mandatory BULK OUT endpoint
    pub bulk_out_ep: Endpoint,
    /// The mandatory BULK IN endpoint
    pub bulk_in_ep: Endpoint,
    /// The optional INTERRUPT IN endpoint
    pub interrupt_in_ep: Option<Endpoint>,
}

/// ### Capabilities
///
/// Decoded GET_CAPABILITIES record (24 bytes).
///
#[derive(Clone, Debug, Default)]
pub struct Capabilities {
    /// BCD-coded USBTMC revision the device implements
    pub bcd_usbtmc: u16,
    /// Accepts the INDICATOR_PULSE control request
    pub accepts_indicator_pulse: bool,
    /// Only sends data to the host
    pub is_talk_only: bool,
    /// Only accepts data from the host
    pub is_listen_only: bool,
    /// Honors a terminator character on bulk-in requests
    pub supports_term_char: bool,
    /// USB488 bytes of the record; meaningful only on USB488 interfaces
    pub usb488: Usb488Capabilities,
}

/// USB488 portion of the capability record (bytes 12..16).
#[derive(Clone, Debug, Default)]
pub struct Usb488Capabilities {
    pub bcd_usb488: u16,
    /// The interface is a full IEEE 488.2 one
    pub is_488_2: bool,
    /// Accepts REN_CONTROL, GO_TO_LOCAL and LOCAL_LOCKOUT
    pub accepts_ren_control: bool,
    /// Accepts the TRIGGER bulk message
    pub accepts_trigger: bool,
    /// Understands SCPI commands
    pub understands_scpi: bool,
    /// SR1-capable (service request)
    pub is_sr1: bool,
    /// RL1-capable (remote/local)
    pub is_rl1: bool,
    /// DT1-capable (device trigger)
    pub is_dt1: bool,
}

/// How strictly inbound bulk headers are validated.
///
/// Many instruments leave stale data in the reserved header bytes, so the
/// lenient decoder ignores them and only enforces the tag invariants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DecodeMode {
    Strict,
    #[default]
    Lenient,
}

/// Identity and address of a discovered USBTMC device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
    /// USB bus number
    pub bus: u8,
    /// Device number on that bus
    pub address: u8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn btag_starts_at_one_and_wraps_past_255() {
        let mut tag = BTag::new();
        assert_eq!(tag.next(), 1);
        assert_eq!(tag.next(), 2);
        for _ in 0..252 {
            tag.next();
        }
        assert_eq!(tag.next(), 255);
        assert_eq!(tag.next(), 1);
        assert_eq!(tag.last(), 1);
    }

    #[test]
    fn btag_never_yields_zero() {
        let mut tag = BTag::new();
        for _ in 0..600 {
            assert_ne!(tag.next(), 0);
        }
    }

    #[test]
    fn successive_btags_differ() {
        let mut tag = BTag::new();
        let mut prev = tag.next();
        for _ in 0..300 {
            let next = tag.next();
            assert_ne!(next, prev);
            prev = next;
        }
    }

    #[test]
    fn rstb_tag_stays_in_488_range() {
        let mut tag = RstbTag::new();
        for _ in 0..300 {
            let t = tag.next();
            assert!((2..=127).contains(&t), "tag {t} outside 2..=127");
        }
    }
}
