//! Device level bring-up and discovery on top of query requests.

use std::time::Duration;

use tracing::{debug, info};
use zerocopy::{FromBytes, Immutable, KnownLayout};

use super::UfsHostController;
use crate::{
    constants::{idn, query::DESCRIPTOR_MAX_LEN, wlun},
    error::{DeviceFault, Result},
    poll::poll_until,
    upiu::u16_be,
};

const DEVICE_INIT_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Leading part of the Device descriptor, as far as it is decoded.
#[repr(C)]
#[derive(Debug, FromBytes, Immutable, KnownLayout)]
struct RawDeviceDescriptor {
    _header: [u8; 6],
    number_lu: u8,
    number_wlu: u8,
    _configuration: [u8; 8],
    spec_version: u16_be,
    manufacture_date: u16_be,
    manufacturer_name: u8,
    product_name: u8,
    serial_number: u8,
    oem_id: u8,
    manufacturer_id: u16_be,
}

/// The parts of the Device descriptor the driver cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub number_lu: u8,
    pub number_wlu: u8,
    /// UFS version in BCD, e.g. `0x0310`.
    pub spec_version: u16,
    pub manufacture_date: u16,
    pub manufacturer_id: u16,
    /// String descriptor indices.
    pub manufacturer_name_index: u8,
    pub product_name_index: u8,
    pub serial_number_index: u8,
    pub oem_id_index: u8,
}

impl From<&RawDeviceDescriptor> for DeviceDescriptor {
    fn from(raw: &RawDeviceDescriptor) -> Self {
        Self {
            number_lu: raw.number_lu,
            number_wlu: raw.number_wlu,
            spec_version: raw.spec_version.get(),
            manufacture_date: raw.manufacture_date.get(),
            manufacturer_id: raw.manufacturer_id.get(),
            manufacturer_name_index: raw.manufacturer_name,
            product_name_index: raw.product_name,
            serial_number_index: raw.serial_number,
            oem_id_index: raw.oem_id,
        }
    }
}

/// A logical unit commands can be addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalUnit {
    Normal(u8),
    /// A well-known logical unit, by its W-LUN.
    WellKnown(u8),
}

impl LogicalUnit {
    /// The LUN field of a COMMAND UPIU addressing this unit.
    #[must_use]
    pub const fn lun(self) -> u8 {
        match self {
            Self::Normal(lun) | Self::WellKnown(lun) => lun,
        }
    }
}

/// Header and unit entry sizes of the configuration descriptor layouts.
const CONFIGURATION_LAYOUTS: [(usize, usize); 2] = [
    // UFS 2.x
    (16, 16),
    // UFS 3.x
    (22, 26),
];
const CONFIGURATION_UNITS: usize = 8;

/// Indices of the enabled units of a configuration descriptor.
fn enabled_units(descriptor: &[u8]) -> Result<Vec<u8>> {
    let length = descriptor.len();
    let (header, unit) = CONFIGURATION_LAYOUTS
        .into_iter()
        .find(|(header, unit)| header + CONFIGURATION_UNITS * unit == length)
        .ok_or(DeviceFault::UnknownDescriptorLayout { length })?;

    Ok((0..CONFIGURATION_UNITS)
        .filter(|i| descriptor[header + i * unit] != 0)
        .map(|i| i as u8)
        .collect())
}

impl UfsHostController {
    /// Set fDeviceInit and wait for the device to clear it again.
    pub fn finish_device_initialization(&mut self) -> Result<()> {
        self.set_flag(idn::FLAG_DEVICE_INIT)?;

        let delay = self.regs.delay_handle();
        poll_until(
            delay.as_ref(),
            self.config.device_init_timeout,
            DEVICE_INIT_POLL_INTERVAL,
            "device initialization",
            || Ok(!self.read_flag(idn::FLAG_DEVICE_INIT)?),
        )?;
        debug!("device initialization complete");
        Ok(())
    }

    pub fn read_device_descriptor(&mut self) -> Result<DeviceDescriptor> {
        let mut buf = [0u8; DESCRIPTOR_MAX_LEN];
        let len = self.read_descriptor(idn::DESC_DEVICE, 0, &mut buf)?;
        let (raw, _) = RawDeviceDescriptor::ref_from_prefix(&buf[..len])
            .map_err(|_| DeviceFault::UnknownDescriptorLayout { length: len })?;
        Ok(raw.into())
    }

    /// The enabled normal logical units followed by the well-known ones.
    pub fn discover_luns(&mut self) -> Result<Vec<LogicalUnit>> {
        let mut buf = [0u8; DESCRIPTOR_MAX_LEN];
        let len = self.read_descriptor(idn::DESC_CONFIGURATION, 0, &mut buf)?;

        let mut units: Vec<LogicalUnit> = enabled_units(&buf[..len])?
            .into_iter()
            .map(LogicalUnit::Normal)
            .collect();
        units.extend(
            [wlun::REPORT_LUNS, wlun::UFS_DEVICE, wlun::BOOT, wlun::RPMB]
                .map(LogicalUnit::WellKnown),
        );
        info!("{} logical units", units.len());
        Ok(units)
    }
}
