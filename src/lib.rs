//! # USBTMC
//!
//! Host-side driver for the USB Test and Measurement Class: message-based
//! reads and writes to lab instruments (scopes, meters, sources) plus the
//! class control requests (clear, abort recovery, capabilities, trigger and
//! the USB488 remote-control set).
//!
//! ```no_run
//! use usbtmc::Instrument;
//!
//! fn main() -> usbtmc::Result<()> {
//!     let mut scope = Instrument::open(0x0957, 0x1755)?;
//!     let idn = scope.ask("*IDN?", None)?;
//!     println!("{idn}");
//!     Ok(())
//! }
//! ```
//!

mod constants;
mod error;
mod init;
mod resource;
mod transport;
mod types;
mod communication {
    pub mod bulk;
    pub mod control;
    pub mod header;
}

pub use error::{Error, Result};
pub use resource::VisaResource;
pub use transport::{UsbHandle, UsbTransport};
pub use types::{
    Capabilities, DecodeMode, DeviceInfo, DeviceMode, Endpoint, Usb488Capabilities,
    UsbtmcEndpoints,
};

#[doc(hidden)]
pub use transport::mock;

use std::time::Duration;

use log::{debug, warn};
use rusb::{Direction, TransferType};

use communication::bulk::{self, ReadOptions};
use communication::control;
use constants::misc::{
    ADVANTEST_MAX_TRANSFER_SIZE, DEFAULT_MAX_TRANSFER_SIZE, DEFAULT_TIMEOUT_DURATION,
};
use constants::usb::ADVANTEST_VID;
use types::{BTag, RstbTag};

/// List every USBTMC-capable device currently on the bus.
pub fn list_devices() -> Result<Vec<DeviceInfo>> {
    let context = rusb::Context::new()?;
    init::list_devices(&context)
}

/// ### Instrument
///
/// An open session to one USBTMC interface.
///
/// A session is exclusive: every operation takes `&mut self`, so two
/// in-flight operations on the same session cannot exist. Independent
/// sessions to different devices may run in parallel.
///
#[derive(Debug)]
pub struct Instrument<B: UsbTransport = UsbHandle> {
    usb: B,
    vid: u16,
    pid: u16,
    serial: Option<String>,
    mode: DeviceMode,
    endpoints: UsbtmcEndpoints,
    capabilities: Capabilities,
    btag: BTag,
    rstb_tag: RstbTag,
    timeout: Duration,
    max_transfer_size: usize,
    term_char: Option<u8>,
    write_term: Option<u8>,
    decode_mode: DecodeMode,
    advantest_quirk: bool,
    advantest_locked: bool,
    connected: bool,
}

impl Instrument<UsbHandle> {
    /// Open the first device matching `vid`/`pid`.
    pub fn open(vid: u16, pid: u16) -> Result<Instrument> {
        Instrument::open_with_serial(vid, pid, None)
    }

    /// ### Open
    ///
    /// Open the device matching `vid`/`pid` and, when given, the exact
    /// serial number. Resolves the USBTMC interface and endpoints, detaches
    /// a bound kernel driver, claims the interface and queries the device
    /// capabilities.
    ///
    pub fn open_with_serial(vid: u16, pid: u16, serial: Option<&str>) -> Result<Instrument> {
        // OPEN THE DEVICE
        // ==========
        let context = rusb::Context::new()?;
        let (device, mut handle) = init::open_device(&context, vid, pid, serial)?;

        // RESOLVE THE INTERFACE
        // ==========
        let advantest = vid == ADVANTEST_VID;
        let mut mode = init::resolve_mode(&device, advantest)?;
        init::detach_kernel_driver(&mut mode, &mut handle)?;
        let endpoints = init::get_endpoints(&mode, &device)?;

        // CONFIGURE AND CLAIM
        // ==========
        handle.set_active_configuration(mode.config_number)?;
        handle.claim_interface(mode.interface_number)?;
        handle.set_alternate_setting(mode.interface_number, mode.setting_number)?;

        // QUERY CAPABILITIES
        // ==========
        let mut usb = UsbHandle::new(handle);
        let capabilities =
            control::get_capabilities(&mut usb, mode.interface_number, DEFAULT_TIMEOUT_DURATION)?;
        debug!(
            "opened {vid:04x}:{pid:04x}, interface {}, usb488: {}",
            mode.interface_number, mode.usb488
        );

        let mut session = Instrument::assemble(
            usb,
            vid,
            pid,
            serial.map(str::to_string),
            mode,
            endpoints,
            capabilities,
        );
        if advantest {
            // Advantest/ADCMT firmware chokes on larger reads and streams
            // replies without a request.
            session.advantest_quirk = true;
            session.max_transfer_size = ADVANTEST_MAX_TRANSFER_SIZE;
        }
        Ok(session)
    }

    /// Open a device addressed by a `USB[n]::vid::pid[::serial]::INSTR`
    /// resource string.
    pub fn open_resource(resource: &str) -> Result<Instrument> {
        let parsed = resource::parse(resource)?;
        Instrument::open_with_serial(
            parsed.vendor_id,
            parsed.product_id,
            parsed.serial.as_deref(),
        )
    }
}

impl<B: UsbTransport> Instrument<B> {
    fn assemble(
        usb: B,
        vid: u16,
        pid: u16,
        serial: Option<String>,
        mode: DeviceMode,
        endpoints: UsbtmcEndpoints,
        capabilities: Capabilities,
    ) -> Instrument<B> {
        Instrument {
            usb,
            vid,
            pid,
            serial,
            mode,
            endpoints,
            capabilities,
            btag: BTag::new(),
            rstb_tag: RstbTag::new(),
            timeout: DEFAULT_TIMEOUT_DURATION,
            max_transfer_size: DEFAULT_MAX_TRANSFER_SIZE,
            term_char: None,
            write_term: None,
            decode_mode: DecodeMode::default(),
            advantest_quirk: false,
            advantest_locked: false,
            connected: true,
        }
    }

    /// ### Close
    ///
    /// Release the interface and, if a kernel driver was detached at open,
    /// hand the interface back to it. Runs at most once; `Drop` calls it
    /// too, so calling it manually is only needed to observe errors.
    ///
    pub fn close(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;

        let released = self.usb.release_interface(self.mode.interface_number);
        let reattached = if self.mode.has_kernel_driver {
            self.usb.attach_kernel_driver(self.mode.interface_number)
        } else {
            Ok(())
        };
        released.and(reattached)
    }

    // TEXT AND BINARY I/O
    // ==========

    /// Send a textual command, applying the write terminator when one is
    /// configured and the message does not already end with it.
    pub fn write(&mut self, message: &str) -> Result<()> {
        match self.write_term {
            Some(t) if message.as_bytes().last() != Some(&t) => {
                let mut data = Vec::with_capacity(message.len() + 1);
                data.extend_from_slice(message.as_bytes());
                data.push(t);
                self.write_raw(&data)
            }
            _ => self.write_raw(message.as_bytes()),
        }
    }

    /// Read a textual response: UTF-8 decoded, one trailing line terminator
    /// stripped. `max_len` bounds the raw byte count (`None`: the session's
    /// maximum transfer size).
    pub fn read(&mut self, max_len: Option<usize>) -> Result<String> {
        let raw = self.read_raw(max_len)?;
        let text = String::from_utf8(raw)
            .map_err(|_| Error::Io("response is not valid utf-8".into()))?;
        Ok(strip_line_ending(text))
    }

    /// Send a command and read its textual reply.
    pub fn ask(&mut self, message: &str, max_len: Option<usize>) -> Result<String> {
        let was_locked = self.advantest_locked;
        if self.advantest_quirk && !was_locked {
            self.lock()?;
        }
        let result = (|| {
            self.write(message)?;
            self.read(max_len)
        })();
        if self.advantest_quirk && !was_locked {
            if let Err(e) = self.unlock() {
                warn!("vendor unlock after query failed: {e}");
            }
        }
        result
    }

    /// Send binary data as one device-dependent message.
    pub fn write_raw(&mut self, data: &[u8]) -> Result<()> {
        bulk::send_message(
            &mut self.usb,
            &mut self.btag,
            &self.endpoints,
            data,
            self.max_transfer_size,
            self.timeout,
        )
    }

    /// Read one device-dependent message as raw bytes.
    pub fn read_raw(&mut self, max_len: Option<usize>) -> Result<Vec<u8>> {
        let opts = ReadOptions {
            max_len: max_len.unwrap_or(self.max_transfer_size),
            term_char: self.term_char,
            decode_mode: self.decode_mode,
            advantest_quirk: self.advantest_quirk,
        };
        bulk::receive_message(
            &mut self.usb,
            &mut self.btag,
            &self.endpoints,
            &self.capabilities,
            opts,
            self.max_transfer_size,
            self.timeout,
        )
    }

    /// Send binary data and read the binary reply.
    pub fn ask_raw(&mut self, data: &[u8], max_len: Option<usize>) -> Result<Vec<u8>> {
        let was_locked = self.advantest_locked;
        if self.advantest_quirk && !was_locked {
            self.lock()?;
        }
        let result = (|| {
            self.write_raw(data)?;
            self.read_raw(max_len)
        })();
        if self.advantest_quirk && !was_locked {
            if let Err(e) = self.unlock() {
                warn!("vendor unlock after query failed: {e}");
            }
        }
        result
    }

    // CLASS OPERATIONS
    // ==========

    /// Device clear: abort whatever the device is doing and discard its
    /// pending output. The next operation starts a fresh message exchange.
    pub fn clear(&mut self) -> Result<()> {
        control::clear(
            &mut self.usb,
            self.mode.interface_number,
            &self.endpoints.bulk_out_ep,
            &self.endpoints.bulk_in_ep,
            self.timeout,
        )
    }

    /// USB488 group-execute-trigger, sent as a bulk message.
    pub fn trigger(&mut self) -> Result<()> {
        if !self.mode.usb488 || !self.capabilities.usb488.accepts_trigger {
            return Err(Error::NotSupported);
        }
        bulk::send_trigger(&mut self.usb, &mut self.btag, &self.endpoints, self.timeout)
    }

    /// Read the IEEE 488.2 status byte through the control endpoint.
    pub fn read_stb(&mut self) -> Result<u8> {
        if !self.mode.usb488 {
            return Err(Error::NotSupported);
        }
        let tag = self.rstb_tag.next();
        control::read_status_byte(&mut self.usb, self.mode.interface_number, tag, self.timeout)
    }

    /// Put the instrument under remote control (USB488 REN_CONTROL).
    pub fn remote(&mut self) -> Result<()> {
        self.require_ren()?;
        control::ren_control(&mut self.usb, self.mode.interface_number, true, self.timeout)
    }

    /// Return the instrument to front-panel control (USB488 GO_TO_LOCAL).
    pub fn local(&mut self) -> Result<()> {
        self.require_ren()?;
        control::go_to_local(&mut self.usb, self.mode.interface_number, self.timeout)
    }

    /// Lock the front panel (USB488 LOCAL_LOCKOUT; vendor request on
    /// Advantest hardware).
    pub fn lock(&mut self) -> Result<()> {
        if self.advantest_quirk {
            control::advantest_lock(&mut self.usb, true, self.timeout)?;
            self.advantest_locked = true;
            return Ok(());
        }
        self.require_ren()?;
        control::local_lockout(&mut self.usb, self.mode.interface_number, self.timeout)
    }

    /// Release the lockout by dropping remote enable (vendor request on
    /// Advantest hardware).
    pub fn unlock(&mut self) -> Result<()> {
        if self.advantest_quirk {
            control::advantest_lock(&mut self.usb, false, self.timeout)?;
            self.advantest_locked = false;
            return Ok(());
        }
        self.require_ren()?;
        control::ren_control(&mut self.usb, self.mode.interface_number, false, self.timeout)
    }

    /// Ask the instrument to blink its indicator.
    pub fn indicator_pulse(&mut self) -> Result<()> {
        if !self.capabilities.accepts_indicator_pulse {
            return Err(Error::NotSupported);
        }
        control::indicator_pulse(&mut self.usb, self.mode.interface_number, self.timeout)
    }

    fn require_ren(&self) -> Result<()> {
        if self.mode.usb488 && self.capabilities.usb488.accepts_ren_control {
            Ok(())
        } else {
            Err(Error::NotSupported)
        }
    }

    // SESSION SETTINGS
    // ==========

    /// Vendor id the session was opened with.
    pub fn vendor_id(&self) -> u16 {
        self.vid
    }

    /// Product id the session was opened with.
    pub fn product_id(&self) -> u16 {
        self.pid
    }

    /// Serial number the session was opened with, if one was given.
    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn max_transfer_size(&self) -> usize {
        self.max_transfer_size
    }

    pub fn set_max_transfer_size(&mut self, size: usize) {
        self.max_transfer_size = size.max(1);
    }

    pub fn term_char(&self) -> Option<u8> {
        self.term_char
    }

    /// Terminator the device may use to end a response early. Only
    /// advertised on the wire when the device capability allows it.
    pub fn set_term_char(&mut self, term_char: Option<u8>) {
        self.term_char = term_char;
    }

    /// Terminator appended to outgoing text commands (off by default; most
    /// instruments accept unterminated commands over USBTMC).
    pub fn set_write_term(&mut self, term: Option<u8>) {
        self.write_term = term;
    }

    pub fn decode_mode(&self) -> DecodeMode {
        self.decode_mode
    }

    pub fn set_decode_mode(&mut self, mode: DecodeMode) {
        self.decode_mode = mode;
    }

    pub fn advantest_quirk(&self) -> bool {
        self.advantest_quirk
    }

    pub fn set_advantest_quirk(&mut self, quirk: bool) {
        self.advantest_quirk = quirk;
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn is_usb488(&self) -> bool {
        self.mode.usb488
    }

    pub fn endpoints(&self) -> &UsbtmcEndpoints {
        &self.endpoints
    }

    #[doc(hidden)]
    pub fn transport_mut(&mut self) -> &mut B {
        &mut self.usb
    }
}

impl Instrument<mock::MockTransport> {
    /// Build a session over a scripted transport, running the same
    /// capability query a real open performs. Uses a canned identity
    /// (0x0957:0x1755, no serial). Test-only plumbing.
    #[doc(hidden)]
    pub fn with_mock(mut usb: mock::MockTransport, usb488: bool) -> Result<Instrument<mock::MockTransport>> {
        let mode = DeviceMode {
            config_number: 1,
            interface_number: 0,
            setting_number: 0,
            has_kernel_driver: false,
            usb488,
        };
        let endpoints = UsbtmcEndpoints {
            bulk_out_ep: Endpoint {
                address: 0x02,
                max_packet_size: 512,
                transfer_type: TransferType::Bulk,
                direction: Direction::Out,
            },
            bulk_in_ep: Endpoint {
                address: 0x86,
                max_packet_size: 512,
                transfer_type: TransferType::Bulk,
                direction: Direction::In,
            },
            interrupt_in_ep: None,
        };
        let capabilities =
            control::get_capabilities(&mut usb, mode.interface_number, DEFAULT_TIMEOUT_DURATION)?;
        Ok(Instrument::assemble(
            usb,
            0x0957,
            0x1755,
            None,
            mode,
            endpoints,
            capabilities,
        ))
    }
}

impl<B: UsbTransport> Drop for Instrument<B> {
    fn drop(&mut self) {
        if self.connected {
            if let Err(e) = self.close() {
                warn!("failed to close session cleanly: {e}");
            }
        }
    }
}

fn strip_line_ending(mut s: String) -> String {
    if s.ends_with('\n') {
        s.pop();
        if s.ends_with('\r') {
            s.pop();
        }
    } else if s.ends_with('\r') {
        s.pop();
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_ending_stripping_takes_one_terminator() {
        assert_eq!(strip_line_ending("V 1.00\n".into()), "V 1.00");
        assert_eq!(strip_line_ending("V 1.00\r\n".into()), "V 1.00");
        assert_eq!(strip_line_ending("V 1.00\r".into()), "V 1.00");
        assert_eq!(strip_line_ending("V 1.00\n\n".into()), "V 1.00\n");
        assert_eq!(strip_line_ending("V 1.00".into()), "V 1.00");
        assert_eq!(strip_line_ending(String::new()), "");
    }
}
