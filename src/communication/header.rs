//! ## Bulk headers
//!
//! Encoding and decoding of the 12-byte header that prefixes every USBTMC
//! bulk transfer, plus the 4-byte alignment rule for outgoing messages.
//!

use crate::constants::bulk_msg_id;
use crate::error::{Error, Result};
use crate::types::DecodeMode;

pub const HEADER_SIZE: usize = crate::constants::misc::USBTMC_HEADER_SIZE;

/// Decoded header of an inbound bulk transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BulkInHeader {
    pub msg_id: u8,
    pub btag: u8,
    /// Number of payload bytes that follow the header
    pub transfer_size: u32,
    /// Last fragment of the message
    pub eom: bool,
    /// Transfer ended because the terminator character was seen
    pub term_char_end: bool,
}

fn base_header(msg_id: u8, btag: u8) -> [u8; HEADER_SIZE] {
    let mut header = [0u8; HEADER_SIZE];
    header[0] = msg_id;
    header[1] = btag;
    header[2] = !btag;
    header
}

pub fn encode_dev_dep_msg_out(btag: u8, transfer_size: u32, end_of_message: bool) -> [u8; HEADER_SIZE] {
    let mut header = base_header(bulk_msg_id::DEV_DEP_MSG_OUT, btag);
    header[4..8].copy_from_slice(&transfer_size.to_le_bytes());
    if end_of_message {
        header[8] = 0b0000_0001;
    }
    header
}

pub fn encode_request_dev_dep_msg_in(
    btag: u8,
    transfer_size: u32,
    term_char: Option<u8>,
) -> [u8; HEADER_SIZE] {
    let mut header = base_header(bulk_msg_id::REQUEST_DEV_DEP_MSG_IN, btag);
    header[4..8].copy_from_slice(&transfer_size.to_le_bytes());
    if let Some(tc) = term_char {
        header[8] = 0b0000_0010;
        header[9] = tc;
    }
    header
}

/// USB488 TRIGGER message: a bare header, no payload.
pub fn encode_trigger(btag: u8) -> [u8; HEADER_SIZE] {
    base_header(bulk_msg_id::TRIGGER, btag)
}

/// Decode an inbound header.
///
/// `btag == 0` and a broken `bTag`/`bTagInverse` complement always reject;
/// non-zero reserved bytes reject only in strict mode.
pub fn decode(raw: &[u8], mode: DecodeMode) -> Result<BulkInHeader> {
    if raw.len() < HEADER_SIZE {
        return Err(Error::ProtocolMismatch(format!(
            "bulk-in transfer of {} bytes is shorter than a header",
            raw.len()
        )));
    }

    let btag = raw[1];
    if btag == 0 {
        return Err(Error::ProtocolMismatch("bTag 0 is reserved".into()));
    }
    if btag ^ raw[2] != 0xFF {
        return Err(Error::ProtocolMismatch(format!(
            "bTag {:#04x} and bTagInverse {:#04x} are not complements",
            btag, raw[2]
        )));
    }
    if mode == DecodeMode::Strict && (raw[3] != 0 || raw[9] != 0 || raw[10] != 0 || raw[11] != 0) {
        return Err(Error::ProtocolMismatch(
            "reserved header bytes are not zero".into(),
        ));
    }

    let transfer_size = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]);
    Ok(BulkInHeader {
        msg_id: raw[0],
        btag,
        transfer_size,
        eom: raw[8] & 0b0000_0001 != 0,
        term_char_end: raw[8] & 0b0000_0010 != 0,
    })
}

/// Round a payload length up to the 4-byte bulk alignment boundary.
pub fn padded_len(payload_len: usize) -> usize {
    payload_len.div_ceil(4) * 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_header_layout() {
        let h = encode_dev_dep_msg_out(1, 5, true);
        assert_eq!(
            h,
            [0x01, 0x01, 0xFE, 0x00, 0x05, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn in_request_header_layout() {
        let h = encode_request_dev_dep_msg_in(2, 0x0010_0000, None);
        assert_eq!(
            h,
            [0x02, 0x02, 0xFD, 0x00, 0x00, 0x00, 0x10, 0x00, 0x00, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn in_request_header_with_term_char() {
        let h = encode_request_dev_dep_msg_in(7, 64, Some(b'\n'));
        assert_eq!(h[8], 0b0000_0010);
        assert_eq!(h[9], b'\n');
    }

    #[test]
    fn tag_complement_holds_for_all_tags() {
        for btag in 1..=255u8 {
            let h = encode_dev_dep_msg_out(btag, 0, false);
            assert_eq!(h[1] ^ h[2], 0xFF);
            assert_ne!(h[1], 0);
        }
    }

    #[test]
    fn round_trip() {
        for (msg_id, btag, size, eom) in [
            (bulk_msg_id::DEV_DEP_MSG_OUT, 1u8, 0u32, false),
            (bulk_msg_id::DEV_DEP_MSG_OUT, 255, 42, true),
            (bulk_msg_id::DEV_DEP_MSG_OUT, 9, u32::MAX, true),
        ] {
            let raw = encode_dev_dep_msg_out(btag, size, eom);
            let decoded = decode(&raw, DecodeMode::Strict).unwrap();
            assert_eq!(decoded.msg_id, msg_id);
            assert_eq!(decoded.btag, btag);
            assert_eq!(decoded.transfer_size, size);
            assert_eq!(decoded.eom, eom);
        }
    }

    #[test]
    fn rejects_zero_tag_and_bad_complement() {
        let mut raw = encode_dev_dep_msg_out(3, 1, false);
        raw[1] = 0;
        raw[2] = 0xFF;
        assert!(decode(&raw, DecodeMode::Lenient).is_err());

        let mut raw = encode_dev_dep_msg_out(3, 1, false);
        raw[2] = !raw[2];
        assert!(decode(&raw, DecodeMode::Lenient).is_err());
    }

    #[test]
    fn reserved_bytes_reject_only_in_strict_mode() {
        let mut raw = encode_dev_dep_msg_out(3, 1, true);
        raw[10] = 0xAB;
        assert!(decode(&raw, DecodeMode::Strict).is_err());
        let lenient = decode(&raw, DecodeMode::Lenient).unwrap();
        assert_eq!(lenient.btag, 3);
        assert!(lenient.eom);
    }

    #[test]
    fn short_input_rejected() {
        assert!(decode(&[0x02, 0x01], DecodeMode::Lenient).is_err());
    }

    #[test]
    fn trigger_header_is_bare() {
        let h = encode_trigger(4);
        assert_eq!(h[0], 128);
        assert_eq!(&h[3..], &[0; 9]);
    }

    #[test]
    fn padding_rounds_up_to_four() {
        assert_eq!(padded_len(0), 0);
        assert_eq!(padded_len(1), 4);
        assert_eq!(padded_len(4), 4);
        assert_eq!(padded_len(5), 8);
        assert_eq!(padded_len(6), 8);
    }
}
