//! ## Control
//!
//! Class-specific control requests: capability query, the split abort and
//! clear state machines, and the USB488 extras.
//!

use std::thread;
use std::time::Duration;

use log::{debug, warn};
use rusb::{Direction, Recipient, RequestType};

use crate::constants::misc::{
    DRAIN_TIMEOUT, STATUS_POLL_BACKOFF, STATUS_POLL_LIMIT, USBTMC_HEADER_SIZE,
};
use crate::constants::{control_requests, usbtmc_status};
use crate::error::{Error, Result};
use crate::transport::UsbTransport;
use crate::types::{Capabilities, Endpoint, Usb488Capabilities};

fn class_in(recipient: Recipient) -> u8 {
    rusb::request_type(Direction::In, RequestType::Class, recipient)
}

/// ### Get Capabilities
///
/// Issue GET_CAPABILITIES and decode the 24-byte record.
///
pub fn get_capabilities<B: UsbTransport>(
    usb: &mut B,
    interface_number: u8,
    timeout: Duration,
) -> Result<Capabilities> {
    let mut buffer = [0u8; 24];
    usb.control_in(
        class_in(Recipient::Interface),
        control_requests::GET_CAPABILITIES,
        0x0000,
        interface_number as u16,
        &mut buffer,
        timeout,
    )?;

    if buffer[0] != usbtmc_status::STATUS_SUCCESS {
        return Err(Error::Io(format!(
            "GET_CAPABILITIES rejected with status {:#04x}",
            buffer[0]
        )));
    }

    let interface_capabilities = buffer[4];
    let device_capabilities = buffer[5];
    let usb488_interface = buffer[14];
    let usb488_device = buffer[15];

    Ok(Capabilities {
        bcd_usbtmc: u16::from_le_bytes([buffer[2], buffer[3]]),
        accepts_indicator_pulse: interface_capabilities & 0b0000_0100 != 0,
        is_talk_only: interface_capabilities & 0b0000_0010 != 0,
        is_listen_only: interface_capabilities & 0b0000_0001 != 0,
        supports_term_char: device_capabilities & 0b0000_0001 != 0,
        usb488: Usb488Capabilities {
            bcd_usb488: u16::from_le_bytes([buffer[12], buffer[13]]),
            is_488_2: usb488_interface & 0b0000_0100 != 0,
            accepts_ren_control: usb488_interface & 0b0000_0010 != 0,
            accepts_trigger: usb488_interface & 0b0000_0001 != 0,
            understands_scpi: usb488_device & 0b0000_1000 != 0,
            is_sr1: usb488_device & 0b0000_0100 != 0,
            is_rl1: usb488_device & 0b0000_0010 != 0,
            is_dt1: usb488_device & 0b0000_0001 != 0,
        },
    })
}

/// ### Abort Bulk Out
///
/// Run the INITIATE_ABORT_BULK_OUT / CHECK_ABORT_BULK_OUT_STATUS machine for
/// the transfer identified by `btag`, then clear the endpoint halt.
///
/// A device that reports the transfer as not in progress makes the abort a
/// no-op; `Error::AbortFailed` means the poll loop was exhausted.
///
pub fn abort_bulk_out<B: UsbTransport>(
    usb: &mut B,
    bulk_out_ep: &Endpoint,
    btag: u8,
    timeout: Duration,
) -> Result<()> {
    // INITIATE
    // ==========
    let mut buffer = [0u8; 2];
    usb.control_in(
        class_in(Recipient::Endpoint),
        control_requests::INITIATE_ABORT_BULK_OUT,
        btag as u16,
        bulk_out_ep.address as u16,
        &mut buffer,
        timeout,
    )?;

    if buffer[0] != usbtmc_status::STATUS_SUCCESS {
        debug!(
            "abort bulk-out not taken (status {:#04x}, btag {btag})",
            buffer[0]
        );
        return Ok(());
    }

    // CHECK STATUS
    // ==========
    let mut buffer = [0u8; 8];
    let mut settled = false;
    for _ in 0..STATUS_POLL_LIMIT {
        usb.control_in(
            class_in(Recipient::Endpoint),
            control_requests::CHECK_ABORT_BULK_OUT_STATUS,
            0x0000,
            bulk_out_ep.address as u16,
            &mut buffer,
            timeout,
        )?;
        if buffer[0] != usbtmc_status::STATUS_PENDING {
            settled = true;
            break;
        }
        thread::sleep(STATUS_POLL_BACKOFF);
    }
    if !settled {
        return Err(Error::AbortFailed);
    }

    usb.clear_halt(bulk_out_ep.address)
}

/// ### Abort Bulk In
///
/// Run the INITIATE_ABORT_BULK_IN / CHECK_ABORT_BULK_IN_STATUS machine,
/// draining whatever the device still has queued on the bulk-in endpoint,
/// then clear the endpoint halt.
///
pub fn abort_bulk_in<B: UsbTransport>(
    usb: &mut B,
    bulk_in_ep: &Endpoint,
    btag: u8,
    timeout: Duration,
) -> Result<()> {
    // INITIATE
    // ==========
    let mut buffer = [0u8; 2];
    usb.control_in(
        class_in(Recipient::Endpoint),
        control_requests::INITIATE_ABORT_BULK_IN,
        btag as u16,
        bulk_in_ep.address as u16,
        &mut buffer,
        timeout,
    )?;

    if buffer[0] != usbtmc_status::STATUS_SUCCESS {
        debug!(
            "abort bulk-in not taken (status {:#04x}, btag {btag})",
            buffer[0]
        );
        return Ok(());
    }

    // DRAIN AND CHECK STATUS
    // ==========
    let mut drain = vec![0u8; USBTMC_HEADER_SIZE + bulk_in_ep.max_packet_size as usize];
    let mut buffer = [0u8; 8];
    let mut settled = false;
    for _ in 0..STATUS_POLL_LIMIT {
        // The device may have a transfer mid-flight; read it off so the
        // abort can complete. A timeout here just means the FIFO is empty.
        match usb.read_bulk(bulk_in_ep.address, &mut drain, DRAIN_TIMEOUT) {
            Ok(n) => debug!("abort bulk-in drained {n} bytes"),
            Err(Error::Timeout) => {}
            Err(e) => return Err(e),
        }

        usb.control_in(
            class_in(Recipient::Endpoint),
            control_requests::CHECK_ABORT_BULK_IN_STATUS,
            0x0000,
            bulk_in_ep.address as u16,
            &mut buffer,
            timeout,
        )?;
        if buffer[0] != usbtmc_status::STATUS_PENDING {
            settled = true;
            break;
        }
        // bmAbortBulkIn bit 0: more data is queued, go read it.
        if buffer[1] & 0b0000_0001 == 0 {
            thread::sleep(STATUS_POLL_BACKOFF);
        }
    }
    if !settled {
        return Err(Error::AbortFailed);
    }

    usb.clear_halt(bulk_in_ep.address)
}

/// ### Clear
///
/// Device clear: INITIATE_CLEAR, poll CHECK_CLEAR_STATUS (draining the
/// bulk-in endpoint while the device asks for it), then clear the bulk-out
/// halt. Pending device output from before the clear is discarded.
///
pub fn clear<B: UsbTransport>(
    usb: &mut B,
    interface_number: u8,
    bulk_out_ep: &Endpoint,
    bulk_in_ep: &Endpoint,
    timeout: Duration,
) -> Result<()> {
    // INITIATE CLEAR
    // ==========
    let mut buffer = [0u8; 1];
    usb.control_in(
        class_in(Recipient::Interface),
        control_requests::INITIATE_CLEAR,
        0x0000,
        interface_number as u16,
        &mut buffer,
        timeout,
    )?;
    if buffer[0] != usbtmc_status::STATUS_SUCCESS {
        warn!("INITIATE_CLEAR rejected with status {:#04x}", buffer[0]);
        return Err(Error::ClearFailed);
    }

    // CHECK CLEAR
    // ==========
    let mut drain = vec![0u8; USBTMC_HEADER_SIZE + bulk_in_ep.max_packet_size as usize];
    let mut buffer = [0u8; 2];
    let mut settled = false;
    for _ in 0..STATUS_POLL_LIMIT {
        usb.control_in(
            class_in(Recipient::Interface),
            control_requests::CHECK_CLEAR_STATUS,
            0x0000,
            interface_number as u16,
            &mut buffer,
            timeout,
        )?;
        if buffer[0] != usbtmc_status::STATUS_PENDING {
            settled = true;
            break;
        }
        // bmClear bit 0: the device wants the host to read and discard
        // queued bulk-in data before it can finish clearing.
        if buffer[1] & 0b0000_0001 != 0 {
            match usb.read_bulk(bulk_in_ep.address, &mut drain, DRAIN_TIMEOUT) {
                Ok(n) => debug!("clear drained {n} bytes"),
                Err(Error::Timeout) => {}
                Err(e) => return Err(e),
            }
        } else {
            thread::sleep(STATUS_POLL_BACKOFF);
        }
    }
    if !settled {
        return Err(Error::ClearFailed);
    }

    usb.clear_halt(bulk_out_ep.address)
}

/// ### Indicator Pulse
///
/// Ask the instrument to blink its activity indicator.
///
pub fn indicator_pulse<B: UsbTransport>(
    usb: &mut B,
    interface_number: u8,
    timeout: Duration,
) -> Result<()> {
    let mut buffer = [0u8; 1];
    usb.control_in(
        class_in(Recipient::Interface),
        control_requests::INDICATOR_PULSE,
        0x0000,
        interface_number as u16,
        &mut buffer,
        timeout,
    )?;
    expect_success(control_requests::INDICATOR_PULSE, buffer[0])
}

/// ### Read Status Byte
///
/// USB488 READ_STATUS_BYTE through the control endpoint. `tag` must come
/// from the 2..=127 allocator; the status byte is returned directly since
/// the interrupt-in delivery path is not used.
///
pub fn read_status_byte<B: UsbTransport>(
    usb: &mut B,
    interface_number: u8,
    tag: u8,
    timeout: Duration,
) -> Result<u8> {
    let mut buffer = [0u8; 3];
    usb.control_in(
        class_in(Recipient::Interface),
        control_requests::READ_STATUS_BYTE,
        tag as u16,
        interface_number as u16,
        &mut buffer,
        timeout,
    )?;
    expect_success(control_requests::READ_STATUS_BYTE, buffer[0])?;
    Ok(buffer[2])
}

/// USB488 REN_CONTROL: assert (`true`) or release (`false`) remote enable.
pub fn ren_control<B: UsbTransport>(
    usb: &mut B,
    interface_number: u8,
    enable: bool,
    timeout: Duration,
) -> Result<()> {
    let mut buffer = [0u8; 1];
    usb.control_in(
        class_in(Recipient::Interface),
        control_requests::REN_CONTROL,
        enable as u16,
        interface_number as u16,
        &mut buffer,
        timeout,
    )?;
    expect_success(control_requests::REN_CONTROL, buffer[0])
}

/// USB488 GO_TO_LOCAL: return the instrument to front-panel control.
pub fn go_to_local<B: UsbTransport>(
    usb: &mut B,
    interface_number: u8,
    timeout: Duration,
) -> Result<()> {
    let mut buffer = [0u8; 1];
    usb.control_in(
        class_in(Recipient::Interface),
        control_requests::GO_TO_LOCAL,
        0x0000,
        interface_number as u16,
        &mut buffer,
        timeout,
    )?;
    expect_success(control_requests::GO_TO_LOCAL, buffer[0])
}

/// USB488 LOCAL_LOCKOUT: lock out the front panel.
pub fn local_lockout<B: UsbTransport>(
    usb: &mut B,
    interface_number: u8,
    timeout: Duration,
) -> Result<()> {
    let mut buffer = [0u8; 1];
    usb.control_in(
        class_in(Recipient::Interface),
        control_requests::LOCAL_LOCKOUT,
        0x0000,
        interface_number as u16,
        &mut buffer,
        timeout,
    )?;
    expect_success(control_requests::LOCAL_LOCKOUT, buffer[0])
}

/// Advantest/ADCMT vendor lock toggle (bRequest 0xA0). These devices ignore
/// commands until the vendor lock is held.
pub fn advantest_lock<B: UsbTransport>(
    usb: &mut B,
    locked: bool,
    timeout: Duration,
) -> Result<()> {
    let mut buffer = [0u8; 1];
    usb.control_in(0xA1, 0xA0, locked as u16, 0x0000, &mut buffer, timeout)?;
    Ok(())
}

fn expect_success(request: u8, status: u8) -> Result<()> {
    if status == usbtmc_status::STATUS_SUCCESS {
        Ok(())
    } else {
        Err(Error::Io(format!(
            "control request {request} rejected with status {status:#04x}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::{MockEvent, MockTransport};

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn bulk_in_ep() -> Endpoint {
        Endpoint {
            address: 0x86,
            max_packet_size: 512,
            transfer_type: rusb::TransferType::Bulk,
            direction: rusb::Direction::In,
        }
    }

    fn bulk_out_ep() -> Endpoint {
        Endpoint {
            address: 0x02,
            max_packet_size: 512,
            transfer_type: rusb::TransferType::Bulk,
            direction: rusb::Direction::Out,
        }
    }

    #[test]
    fn capabilities_decode() {
        let mut usb = MockTransport::new();
        let caps = get_capabilities(&mut usb, 0, TIMEOUT).unwrap();
        assert_eq!(caps.bcd_usbtmc, 0x0100);
        assert!(caps.accepts_indicator_pulse);
        assert!(!caps.is_talk_only);
        assert!(caps.supports_term_char);
        assert!(caps.usb488.is_488_2);
        assert!(caps.usb488.accepts_trigger);
        assert!(caps.usb488.understands_scpi);
    }

    #[test]
    fn capabilities_failure_status() {
        let mut usb = MockTransport::new();
        let mut rejected = vec![0u8; 24];
        rejected[0] = usbtmc_status::STATUS_FAILED;
        usb.push_control_response(control_requests::GET_CAPABILITIES, rejected);
        assert!(get_capabilities(&mut usb, 0, TIMEOUT).is_err());
    }

    #[test]
    fn abort_bulk_out_names_the_tag_and_endpoint() {
        let mut usb = MockTransport::new();
        abort_bulk_out(&mut usb, &bulk_out_ep(), 17, TIMEOUT).unwrap();
        match &usb.events[0] {
            MockEvent::ControlIn {
                request_type,
                request,
                value,
                index,
                ..
            } => {
                assert_eq!(*request_type, 0xA2); // class, endpoint, IN
                assert_eq!(*request, control_requests::INITIATE_ABORT_BULK_OUT);
                assert_eq!(*value, 17);
                assert_eq!(*index, 0x02);
            }
            other => panic!("expected control-in first, got {other:?}"),
        }
        assert!(usb
            .events
            .contains(&MockEvent::ClearHalt { endpoint: 0x02 }));
    }

    #[test]
    fn abort_bulk_out_gives_up_when_not_in_progress() {
        let mut usb = MockTransport::new();
        usb.push_control_response(
            control_requests::INITIATE_ABORT_BULK_OUT,
            vec![usbtmc_status::STATUS_TRANSFER_NOT_IN_PROGRESS, 0],
        );
        abort_bulk_out(&mut usb, &bulk_out_ep(), 3, TIMEOUT).unwrap();
        // No status polls, no halt clear.
        assert_eq!(usb.events.len(), 1);
    }

    #[test]
    fn abort_bulk_out_exhausted_poll_fails() {
        let mut usb = MockTransport::new();
        for _ in 0..STATUS_POLL_LIMIT {
            usb.push_control_response(
                control_requests::CHECK_ABORT_BULK_OUT_STATUS,
                vec![usbtmc_status::STATUS_PENDING, 0, 0, 0, 0, 0, 0, 0],
            );
        }
        assert!(matches!(
            abort_bulk_out(&mut usb, &bulk_out_ep(), 3, TIMEOUT),
            Err(Error::AbortFailed)
        ));
    }

    #[test]
    fn clear_drains_when_device_asks() {
        let mut usb = MockTransport::new();
        usb.push_control_response(
            control_requests::CHECK_CLEAR_STATUS,
            vec![usbtmc_status::STATUS_PENDING, 0b0000_0001],
        );
        usb.push_bulk_in(vec![0xAA; 16]);
        clear(&mut usb, 0, &bulk_out_ep(), &bulk_in_ep(), TIMEOUT).unwrap();

        let kinds: Vec<_> = usb
            .events
            .iter()
            .map(|ev| match ev {
                MockEvent::ControlIn { request, .. } => format!("ctl:{request}"),
                MockEvent::BulkIn { .. } => "drain".into(),
                MockEvent::ClearHalt { endpoint } => format!("halt:{endpoint:#04x}"),
                other => format!("{other:?}"),
            })
            .collect();
        assert_eq!(kinds, ["ctl:5", "ctl:6", "drain", "ctl:6", "halt:0x02"]);
    }

    #[test]
    fn clear_fails_on_initiate_rejection() {
        let mut usb = MockTransport::new();
        usb.push_control_response(
            control_requests::INITIATE_CLEAR,
            vec![usbtmc_status::STATUS_FAILED],
        );
        assert!(matches!(
            clear(&mut usb, 0, &bulk_out_ep(), &bulk_in_ep(), TIMEOUT),
            Err(Error::ClearFailed)
        ));
    }

    #[test]
    fn read_status_byte_returns_third_byte() {
        let mut usb = MockTransport::new();
        usb.push_control_response(
            control_requests::READ_STATUS_BYTE,
            vec![usbtmc_status::STATUS_SUCCESS, 2, 0x42],
        );
        assert_eq!(read_status_byte(&mut usb, 0, 2, TIMEOUT).unwrap(), 0x42);
    }

    #[test]
    fn ren_control_passes_enable_in_wvalue() {
        let mut usb = MockTransport::new();
        ren_control(&mut usb, 0, true, TIMEOUT).unwrap();
        ren_control(&mut usb, 0, false, TIMEOUT).unwrap();
        let values: Vec<u16> = usb
            .events
            .iter()
            .filter_map(|ev| match ev {
                MockEvent::ControlIn { value, .. } => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(values, [1, 0]);
    }
}
