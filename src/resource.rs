//! ## Resource strings
//!
//! Interpretation of the VISA-style `USB[board]::vid::pid[::serial]::INSTR`
//! pattern used to address instruments.
//!

use crate::error::{Error, Result};

/// Parsed identity out of a resource string.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VisaResource {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial: Option<String>,
}

/// Parse a resource string.
///
/// Accepted shapes:
/// - `USB[board]::<vid>::<pid>::INSTR`
/// - `USB[board]::<vid>::<pid>::<serial>::INSTR`
///
/// `vid` and `pid` may be decimal or `0x`-prefixed hex. Anything else fails
/// with [`Error::InvalidResource`].
pub fn parse(resource: &str) -> Result<VisaResource> {
    let invalid = || Error::InvalidResource(resource.to_string());

    let parts: Vec<&str> = resource.split("::").collect();
    if parts.len() != 4 && parts.len() != 5 {
        return Err(invalid());
    }

    // "USB" optionally followed by a board index, e.g. "USB0"
    let head = parts[0];
    let board = head
        .strip_prefix("USB")
        .or_else(|| head.strip_prefix("usb"))
        .ok_or_else(invalid)?;
    if !board.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid());
    }

    if !parts[parts.len() - 1].eq_ignore_ascii_case("INSTR") {
        return Err(invalid());
    }

    let vendor_id = parse_id(parts[1]).ok_or_else(invalid)?;
    let product_id = parse_id(parts[2]).ok_or_else(invalid)?;
    let serial = if parts.len() == 5 {
        Some(parts[3].to_string())
    } else {
        None
    };

    Ok(VisaResource {
        vendor_id,
        product_id,
        serial,
    })
}

fn parse_id(field: &str) -> Option<u16> {
    if let Some(hex) = field.strip_prefix("0x").or_else(|| field.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).ok()
    } else {
        field.parse::<u16>().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hex_ids_without_serial() {
        let res = parse("USB::0x0957::0x1755::INSTR").unwrap();
        assert_eq!(res.vendor_id, 0x0957);
        assert_eq!(res.product_id, 0x1755);
        assert_eq!(res.serial, None);
    }

    #[test]
    fn parses_serial_field() {
        let res = parse("USB::0x0957::0x1755::MY123::INSTR").unwrap();
        assert_eq!(res.serial.as_deref(), Some("MY123"));
    }

    #[test]
    fn parses_board_index_and_decimal_ids() {
        let res = parse("USB0::2391::5973::INSTR").unwrap();
        assert_eq!(res.vendor_id, 2391);
        assert_eq!(res.product_id, 5973);
    }

    #[test]
    fn rejects_malformed_strings() {
        for bad in [
            "USB::foo",
            "TCPIP::10.0.0.1::INSTR",
            "USB::0x0957::INSTR",
            "USB::0x0957::0x1755::RAW",
            "USBX::0x0957::0x1755::INSTR",
            "USB::0xZZZZ::0x1755::INSTR",
            "USB::99999::1::INSTR",
            "",
        ] {
            assert!(
                matches!(parse(bad), Err(Error::InvalidResource(_))),
                "{bad:?} should be rejected"
            );
        }
    }
}
