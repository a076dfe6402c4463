//! ## Bulk
//!
//! The message-level engines on the bulk endpoints: fragmentation and
//! padding on the way out, request/reassembly on the way in, and the hook
//! into the abort machinery when a transfer goes wrong.
//!

use std::time::Duration;

use log::{debug, warn};

use crate::communication::{control, header};
use crate::constants::bulk_msg_id;
use crate::error::{Error, Result};
use crate::transport::UsbTransport;
use crate::types::{BTag, Capabilities, DecodeMode, UsbtmcEndpoints};

/// Per-read configuration resolved by the session.
#[derive(Clone, Copy, Debug)]
pub struct ReadOptions {
    /// Upper bound on the returned payload
    pub max_len: usize,
    /// Terminator the device may use to end the response early
    pub term_char: Option<u8>,
    pub decode_mode: DecodeMode,
    /// Advantest/ADCMT: no REQUEST_DEV_DEP_MSG_IN, single fragment, no EOM
    pub advantest_quirk: bool,
}

/// ### Send Message
///
/// Write one device-dependent message: split the payload into
/// `max_transfer_size` chunks, each sent as `header ‖ chunk ‖ padding` in a
/// single bulk-OUT transfer with a fresh tag, EOM set on the last chunk.
///
/// An empty payload returns without touching the bus.
///
pub fn send_message<B: UsbTransport>(
    usb: &mut B,
    btag: &mut BTag,
    endpoints: &UsbtmcEndpoints,
    payload: &[u8],
    max_transfer_size: usize,
    timeout: Duration,
) -> Result<()> {
    if payload.is_empty() {
        return Ok(());
    }

    let chunk_count = payload.len().div_ceil(max_transfer_size);
    for (index, chunk) in payload.chunks(max_transfer_size).enumerate() {
        let eom = index + 1 == chunk_count;
        let tag = btag.next();
        let hdr = header::encode_dev_dep_msg_out(tag, chunk.len() as u32, eom);

        let mut frame = Vec::with_capacity(header::HEADER_SIZE + header::padded_len(chunk.len()));
        frame.extend_from_slice(&hdr);
        frame.extend_from_slice(chunk);
        frame.resize(header::HEADER_SIZE + header::padded_len(chunk.len()), 0x00);

        write_out(usb, btag, endpoints, &frame, timeout)?;
    }

    Ok(())
}

/// ### Receive Message
///
/// Read one device-dependent message: issue a single
/// REQUEST_DEV_DEP_MSG_IN, then reassemble fragments off the bulk-in
/// endpoint until the device raises EOM or `max_len` is reached.
///
/// Every fragment must carry DEV_DEP_MSG_IN and echo the request tag;
/// anything else aborts the bulk-in transfer and fails with
/// [`Error::ProtocolMismatch`]. A device that still has data queued once
/// `max_len` is hit gets aborted too, so the next operation starts clean.
///
pub fn receive_message<B: UsbTransport>(
    usb: &mut B,
    btag: &mut BTag,
    endpoints: &UsbtmcEndpoints,
    capabilities: &Capabilities,
    opts: ReadOptions,
    max_transfer_size: usize,
    timeout: Duration,
) -> Result<Vec<u8>> {
    let request_size = opts.max_len.min(max_transfer_size) as u32;

    let tag = if opts.advantest_quirk {
        // These devices stream the response without being asked.
        0
    } else {
        let tag = btag.next();
        let term_char = opts.term_char.filter(|_| capabilities.supports_term_char);
        let request = header::encode_request_dev_dep_msg_in(tag, request_size, term_char);
        write_out(usb, btag, endpoints, &request, timeout)?;
        tag
    };

    let mut accum: Vec<u8> = Vec::new();
    let mut buffer = vec![0u8; header::HEADER_SIZE + max_transfer_size + 3];

    loop {
        let n = match usb.read_bulk(endpoints.bulk_in_ep.address, &mut buffer, timeout) {
            Ok(n) => n,
            Err(Error::Timeout) => {
                recover_bulk_in(usb, endpoints, btag.last(), timeout);
                return Err(Error::Timeout);
            }
            Err(e) => return Err(e),
        };

        if n < header::HEADER_SIZE {
            recover_bulk_in(usb, endpoints, btag.last(), timeout);
            return Err(Error::ProtocolMismatch(format!(
                "bulk-in transfer of {n} bytes is shorter than a header"
            )));
        }

        let hdr = match header::decode(&buffer[..header::HEADER_SIZE], opts.decode_mode) {
            Ok(hdr) => hdr,
            Err(e) => {
                recover_bulk_in(usb, endpoints, btag.last(), timeout);
                return Err(e);
            }
        };

        if hdr.msg_id != bulk_msg_id::DEV_DEP_MSG_IN
            || (!opts.advantest_quirk && hdr.btag != tag)
        {
            recover_bulk_in(usb, endpoints, btag.last(), timeout);
            return Err(Error::ProtocolMismatch(format!(
                "expected DEV_DEP_MSG_IN with tag {tag}, got MsgID {} tag {}",
                hdr.msg_id, hdr.btag
            )));
        }

        let announced = hdr.transfer_size as usize;
        let available = n - header::HEADER_SIZE;
        if announced > available {
            warn!("fragment announced {announced} bytes but carried {available}");
        }
        let take = announced.min(available);
        accum.extend_from_slice(&buffer[header::HEADER_SIZE..header::HEADER_SIZE + take]);

        if opts.advantest_quirk {
            // No EOM will ever come; one fragment is the whole answer.
            break;
        }
        if hdr.eom || hdr.term_char_end {
            break;
        }
        if accum.len() >= opts.max_len {
            // Full without EOM: the device has more queued. Drain it so the
            // session stays consistent for the next call.
            debug!("response cap {} reached before EOM, aborting remainder", opts.max_len);
            recover_bulk_in(usb, endpoints, btag.last(), timeout);
            break;
        }
    }

    accum.truncate(opts.max_len);
    Ok(accum)
}

/// ### Send Trigger
///
/// USB488 TRIGGER: a header-only bulk-OUT message with its own tag.
///
pub fn send_trigger<B: UsbTransport>(
    usb: &mut B,
    btag: &mut BTag,
    endpoints: &UsbtmcEndpoints,
    timeout: Duration,
) -> Result<()> {
    let tag = btag.next();
    let frame = header::encode_trigger(tag);
    write_out(usb, btag, endpoints, &frame, timeout)
}

/// One bulk-OUT transfer with the abort recovery wired in: a timeout or a
/// short write runs the bulk-out abort before the error surfaces.
fn write_out<B: UsbTransport>(
    usb: &mut B,
    btag: &BTag,
    endpoints: &UsbtmcEndpoints,
    frame: &[u8],
    timeout: Duration,
) -> Result<()> {
    match usb.write_bulk(endpoints.bulk_out_ep.address, frame, timeout) {
        Ok(n) if n == frame.len() => Ok(()),
        Ok(n) => {
            recover_bulk_out(usb, endpoints, btag.last(), timeout);
            Err(Error::Io(format!(
                "short bulk-out transfer ({n} of {} bytes)",
                frame.len()
            )))
        }
        Err(Error::Timeout) => {
            recover_bulk_out(usb, endpoints, btag.last(), timeout);
            Err(Error::Timeout)
        }
        Err(e) => Err(e),
    }
}

fn recover_bulk_out<B: UsbTransport>(
    usb: &mut B,
    endpoints: &UsbtmcEndpoints,
    tag: u8,
    timeout: Duration,
) {
    if let Err(e) = control::abort_bulk_out(usb, &endpoints.bulk_out_ep, tag, timeout) {
        warn!("bulk-out abort after failed transfer did not complete: {e}");
    }
}

fn recover_bulk_in<B: UsbTransport>(
    usb: &mut B,
    endpoints: &UsbtmcEndpoints,
    tag: u8,
    timeout: Duration,
) {
    if let Err(e) = control::abort_bulk_in(usb, &endpoints.bulk_in_ep, tag, timeout) {
        warn!("bulk-in abort after failed transfer did not complete: {e}");
    }
}
