//! ## Initialization
//!
//! Device discovery and descriptor resolution: find the USBTMC interface,
//! its endpoints, and take the interface over from the kernel.
//!

use log::debug;
use rusb::{Device, DeviceDescriptor, DeviceHandle, Direction, TransferType, UsbContext};

use crate::constants::usb::*;
use crate::error::{Error, Result};
use crate::types::{DeviceInfo, DeviceMode, Endpoint, UsbtmcEndpoints};

fn is_usbtmc_device<T: UsbContext>(device: &Device<T>, device_desc: &DeviceDescriptor) -> bool {
    // Advantest/ADCMT instruments claim a vendor-specific interface instead
    // of the USBTMC class triple but speak (most of) the protocol.
    if device_desc.vendor_id() == ADVANTEST_VID {
        return true;
    }
    (0..device_desc.num_configurations()).any(|config_no| {
        device
            .config_descriptor(config_no)
            .map(|config_desc| {
                config_desc.interfaces().any(|interface| {
                    interface.descriptors().any(|interface_desc| {
                        interface_desc.class_code() == USBTMC_CLASS_CODE
                            && interface_desc.sub_class_code() == USBTMC_SUBCLASS_CODE
                    })
                })
            })
            .unwrap_or(false)
    })
}

/// ### List Devices
///
/// Enumerate every USBTMC-capable device on the bus.
///
pub fn list_devices<T: UsbContext>(context: &T) -> Result<Vec<DeviceInfo>> {
    Ok(context
        .devices()?
        .iter()
        .filter_map(|device| {
            let device_desc = device.device_descriptor().ok()?;
            if !is_usbtmc_device(&device, &device_desc) {
                return None;
            }
            // The serial is best-effort: it needs an open handle, which may
            // be denied without dooming the listing.
            let serial = device
                .open()
                .ok()
                .and_then(|h| h.read_serial_number_string_ascii(&device_desc).ok());
            Some(DeviceInfo {
                vendor_id: device_desc.vendor_id(),
                product_id: device_desc.product_id(),
                serial,
                bus: device.bus_number(),
                address: device.address(),
            })
        })
        .collect())
}

/// ### Open Device
///
/// Find and open the device matching `vid`/`pid` and, when given, the exact
/// serial number string.
///
pub fn open_device<T: UsbContext>(
    context: &T,
    vid: u16,
    pid: u16,
    serial: Option<&str>,
) -> Result<(Device<T>, DeviceHandle<T>)> {
    let mut last_open_error: Option<Error> = None;

    for device in context.devices()?.iter() {
        let device_desc = match device.device_descriptor() {
            Ok(desc) => desc,
            Err(_) => continue,
        };
        if device_desc.vendor_id() != vid || device_desc.product_id() != pid {
            continue;
        }
        if !is_usbtmc_device(&device, &device_desc) {
            continue;
        }

        // Another candidate may still match, but remember why this one
        // could not be opened in case nothing does.
        let handle = match device.open() {
            Ok(handle) => handle,
            Err(e) => {
                last_open_error = Some(e.into());
                continue;
            }
        };
        match serial {
            None => return Ok((device, handle)),
            Some(wanted) => {
                let found = handle
                    .read_serial_number_string_ascii(&device_desc)
                    .unwrap_or_default();
                if found == wanted {
                    return Ok((device, handle));
                }
            }
        }
    }

    Err(last_open_error.unwrap_or(Error::NotFound))
}

/// ### Resolve Mode
///
/// Walk the configurations for the first interface alternate carrying the
/// USBTMC class triple and record how to reach it. The USB488 flag is set
/// from the interface protocol code.
///
/// On Advantest hardware no alternate carries the class triple; the first
/// interface of the first configuration is used as-is.
///
pub fn resolve_mode<T: UsbContext>(device: &Device<T>, advantest: bool) -> Result<DeviceMode> {
    let device_desc = device.device_descriptor()?;

    for n in 0..device_desc.num_configurations() {
        let config_desc = device.config_descriptor(n)?;
        for interface in config_desc.interfaces() {
            for interface_desc in interface.descriptors() {
                let matches = advantest
                    || (interface_desc.class_code() == USBTMC_CLASS_CODE
                        && interface_desc.sub_class_code() == USBTMC_SUBCLASS_CODE);
                if matches {
                    return Ok(DeviceMode {
                        config_number: config_desc.number(),
                        interface_number: interface_desc.interface_number(),
                        setting_number: interface_desc.setting_number(),
                        has_kernel_driver: false,
                        usb488: interface_desc.protocol_code() == USB488_PROTOCOL_CODE,
                    });
                }
            }
        }
    }

    Err(Error::NotUsbtmc)
}

/// ### Detach Kernel Driver
///
/// If the OS has a driver bound to the interface, detach it for the lifetime
/// of the session and remember to hand it back on close.
///
pub fn detach_kernel_driver<T: UsbContext>(
    mode: &mut DeviceMode,
    handle: &mut DeviceHandle<T>,
) -> Result<()> {
    mode.has_kernel_driver = match handle.kernel_driver_active(mode.interface_number) {
        Ok(true) => {
            debug!(
                "detaching kernel driver from interface {}",
                mode.interface_number
            );
            handle.detach_kernel_driver(mode.interface_number)?;
            true
        }
        _ => false,
    };

    Ok(())
}

/// ### Get Endpoints
///
/// Resolve the bulk-OUT, bulk-IN and optional interrupt-IN endpoints of the
/// chosen interface alternate.
///
pub fn get_endpoints<T: UsbContext>(
    mode: &DeviceMode,
    device: &Device<T>,
) -> Result<UsbtmcEndpoints> {
    let device_desc = device.device_descriptor()?;

    // config_descriptor() takes an index; the mode records the configuration
    // *value*, so search for it.
    let config_desc = (0..device_desc.num_configurations())
        .filter_map(|n| device.config_descriptor(n).ok())
        .find(|desc| desc.number() == mode.config_number)
        .ok_or(Error::NotUsbtmc)?;

    let interface = config_desc
        .interfaces()
        .find(|interface| interface.number() == mode.interface_number)
        .ok_or(Error::NotUsbtmc)?;
    let interface_desc = interface
        .descriptors()
        .find(|desc| desc.setting_number() == mode.setting_number)
        .ok_or(Error::NotUsbtmc)?;

    let endpoints: Vec<Endpoint> = interface_desc
        .endpoint_descriptors()
        .map(|endpoint| Endpoint {
            address: endpoint.address(),
            max_packet_size: endpoint.max_packet_size(),
            transfer_type: endpoint.transfer_type(),
            direction: endpoint.direction(),
        })
        .collect();

    let find = |transfer_type: TransferType, direction: Direction| {
        endpoints
            .iter()
            .find(|ep| ep.transfer_type == transfer_type && ep.direction == direction)
            .cloned()
    };

    let bulk_out_ep = find(TransferType::Bulk, Direction::Out).ok_or(Error::NotUsbtmc)?;
    let bulk_in_ep = find(TransferType::Bulk, Direction::In).ok_or(Error::NotUsbtmc)?;
    let interrupt_in_ep = find(TransferType::Interrupt, Direction::In);

    Ok(UsbtmcEndpoints {
        bulk_out_ep,
        bulk_in_ep,
        interrupt_in_ep,
    })
}
