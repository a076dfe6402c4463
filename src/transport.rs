//! ## Transport
//!
//! The blocking USB primitives the protocol engine runs on. The real
//! implementation is a thin shim over a claimed `rusb` device handle; the
//! mock replays scripted traffic so the engine can be exercised without
//! hardware.
//!

use std::time::Duration;

use crate::error::Result;

/// Blocking USB primitives of one claimed interface.
///
/// Everything the protocol engine does goes through this trait; the session
/// owns the transport exclusively, so all methods take `&mut self`.
pub trait UsbTransport {
    fn control_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize>;

    fn control_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize>;

    fn write_bulk(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize>;

    fn read_bulk(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Clear a HALT condition on the given endpoint.
    fn clear_halt(&mut self, endpoint: u8) -> Result<()>;

    fn release_interface(&mut self, interface_number: u8) -> Result<()>;

    fn attach_kernel_driver(&mut self, interface_number: u8) -> Result<()>;
}

/// ### UsbHandle
///
/// [`UsbTransport`] over an opened and claimed libusb device handle.
///
#[derive(Debug)]
pub struct UsbHandle {
    handle: rusb::DeviceHandle<rusb::Context>,
}

impl UsbHandle {
    pub(crate) fn new(handle: rusb::DeviceHandle<rusb::Context>) -> UsbHandle {
        UsbHandle { handle }
    }
}

impl UsbTransport for UsbHandle {
    fn control_in(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        Ok(self
            .handle
            .read_control(request_type, request, value, index, buf, timeout)?)
    }

    fn control_out(
        &mut self,
        request_type: u8,
        request: u8,
        value: u16,
        index: u16,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize> {
        Ok(self
            .handle
            .write_control(request_type, request, value, index, data, timeout)?)
    }

    fn write_bulk(&mut self, endpoint: u8, data: &[u8], timeout: Duration) -> Result<usize> {
        Ok(self.handle.write_bulk(endpoint, data, timeout)?)
    }

    fn read_bulk(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        Ok(self.handle.read_bulk(endpoint, buf, timeout)?)
    }

    fn clear_halt(&mut self, endpoint: u8) -> Result<()> {
        Ok(self.handle.clear_halt(endpoint)?)
    }

    fn release_interface(&mut self, interface_number: u8) -> Result<()> {
        Ok(self.handle.release_interface(interface_number)?)
    }

    fn attach_kernel_driver(&mut self, interface_number: u8) -> Result<()> {
        Ok(self.handle.attach_kernel_driver(interface_number)?)
    }
}

/// Scripted in-memory transport for tests.
///
/// Always compiled (zero runtime cost), hidden from public docs.
#[doc(hidden)]
pub mod mock {
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;

    use crate::constants::{control_requests, usbtmc_status};
    use crate::error::{Error, Result};

    use super::UsbTransport;

    /// One observed transport call, in program order.
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum MockEvent {
        ControlIn {
            request_type: u8,
            request: u8,
            value: u16,
            index: u16,
            len: usize,
        },
        ControlOut {
            request_type: u8,
            request: u8,
            value: u16,
            index: u16,
            data: Vec<u8>,
        },
        BulkOut {
            endpoint: u8,
            data: Vec<u8>,
        },
        BulkIn {
            endpoint: u8,
        },
        ClearHalt {
            endpoint: u8,
        },
        ReleaseInterface(u8),
        AttachKernelDriver(u8),
    }

    /// Injected failure for the next bulk-OUT transfer.
    #[derive(Clone, Copy, Debug)]
    pub enum BulkOutFailure {
        Timeout,
        /// Report only this many bytes as written.
        Short(usize),
    }

    /// ### MockTransport
    ///
    /// Records every call in [`MockTransport::events`] and answers bulk-IN
    /// reads from a reply queue (an empty queue behaves like a silent
    /// device, i.e. a timeout). Control-IN responses can be scripted per
    /// request code; unscripted requests get a plain success status.
    ///
    #[derive(Debug, Default)]
    pub struct MockTransport {
        pub events: Vec<MockEvent>,
        bulk_in_queue: VecDeque<Vec<u8>>,
        control_responses: HashMap<u8, VecDeque<Vec<u8>>>,
        next_bulk_out_failure: Option<BulkOutFailure>,
    }

    impl MockTransport {
        pub fn new() -> MockTransport {
            MockTransport::default()
        }

        /// Queue one raw bulk-IN reply (header, payload and padding included).
        pub fn push_bulk_in(&mut self, frame: Vec<u8>) {
            self.bulk_in_queue.push_back(frame);
        }

        /// Queue a response for one control-IN request code. Scripted
        /// responses are consumed in order before the defaults apply.
        pub fn push_control_response(&mut self, request: u8, response: Vec<u8>) {
            self.control_responses
                .entry(request)
                .or_default()
                .push_back(response);
        }

        pub fn fail_next_bulk_out(&mut self, failure: BulkOutFailure) {
            self.next_bulk_out_failure = Some(failure);
        }

        /// The payloads of all bulk-OUT transfers observed so far.
        pub fn bulk_out_frames(&self) -> Vec<&[u8]> {
            self.events
                .iter()
                .filter_map(|ev| match ev {
                    MockEvent::BulkOut { data, .. } => Some(data.as_slice()),
                    _ => None,
                })
                .collect()
        }

        /// The control request codes observed so far, in order.
        pub fn control_requests_seen(&self) -> Vec<u8> {
            self.events
                .iter()
                .filter_map(|ev| match ev {
                    MockEvent::ControlIn { request, .. }
                    | MockEvent::ControlOut { request, .. } => Some(*request),
                    _ => None,
                })
                .collect()
        }

        fn default_response(request: u8) -> Vec<u8> {
            match request {
                control_requests::GET_CAPABILITIES => default_capabilities(),
                control_requests::READ_STATUS_BYTE => {
                    vec![usbtmc_status::STATUS_SUCCESS, 0x00, 0x00]
                }
                // INITIATE_*, CHECK_*, INDICATOR_PULSE, REN/GTL/LLO: a
                // success status byte followed by zeroed detail bytes.
                _ => vec![usbtmc_status::STATUS_SUCCESS, 0, 0, 0, 0, 0, 0, 0],
            }
        }
    }

    /// A 24-byte GET_CAPABILITIES record of a friendly USB488 instrument:
    /// indicator pulse accepted, TermChar supported, trigger and the remote
    /// control requests accepted.
    pub fn default_capabilities() -> Vec<u8> {
        let mut caps = vec![0u8; 24];
        caps[0] = usbtmc_status::STATUS_SUCCESS;
        caps[2] = 0x00; // bcdUSBTMC 1.00
        caps[3] = 0x01;
        caps[4] = 0b0000_0100; // interface: accepts INDICATOR_PULSE
        caps[5] = 0b0000_0001; // device: TermChar capable
        caps[12] = 0x00; // bcdUSB488 1.00
        caps[13] = 0x01;
        caps[14] = 0b0000_0111; // 488.2, REN/GTL/LLO, TRIGGER
        caps[15] = 0b0000_1111; // SCPI, SR1, RL1, DT1
        caps
    }

    impl UsbTransport for MockTransport {
        fn control_in(
            &mut self,
            request_type: u8,
            request: u8,
            value: u16,
            index: u16,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> Result<usize> {
            self.events.push(MockEvent::ControlIn {
                request_type,
                request,
                value,
                index,
                len: buf.len(),
            });
            let response = self
                .control_responses
                .get_mut(&request)
                .and_then(VecDeque::pop_front)
                .unwrap_or_else(|| Self::default_response(request));
            let n = response.len().min(buf.len());
            buf[..n].copy_from_slice(&response[..n]);
            Ok(n)
        }

        fn control_out(
            &mut self,
            request_type: u8,
            request: u8,
            value: u16,
            index: u16,
            data: &[u8],
            _timeout: Duration,
        ) -> Result<usize> {
            self.events.push(MockEvent::ControlOut {
                request_type,
                request,
                value,
                index,
                data: data.to_vec(),
            });
            Ok(data.len())
        }

        fn write_bulk(&mut self, endpoint: u8, data: &[u8], _timeout: Duration) -> Result<usize> {
            self.events.push(MockEvent::BulkOut {
                endpoint,
                data: data.to_vec(),
            });
            match self.next_bulk_out_failure.take() {
                Some(BulkOutFailure::Timeout) => Err(Error::Timeout),
                Some(BulkOutFailure::Short(n)) => Ok(n.min(data.len())),
                None => Ok(data.len()),
            }
        }

        fn read_bulk(&mut self, endpoint: u8, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
            self.events.push(MockEvent::BulkIn { endpoint });
            match self.bulk_in_queue.pop_front() {
                Some(frame) => {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    Ok(n)
                }
                // Nothing queued: the device stays silent.
                None => Err(Error::Timeout),
            }
        }

        fn clear_halt(&mut self, endpoint: u8) -> Result<()> {
            self.events.push(MockEvent::ClearHalt { endpoint });
            Ok(())
        }

        fn release_interface(&mut self, interface_number: u8) -> Result<()> {
            self.events.push(MockEvent::ReleaseInterface(interface_number));
            Ok(())
        }

        fn attach_kernel_driver(&mut self, interface_number: u8) -> Result<()> {
            self.events
                .push(MockEvent::AttachKernelDriver(interface_number));
            Ok(())
        }
    }
}
