// Copyright (C) 2021-2024 The Aero Project Developers.
//
// This file is part of The Aero Project.
//
// Aero is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// Aero is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with Aero. If not, see <https://www.gnu.org/licenses/>.

//! The device/driver registry: drivers bind to devices whose IDs match
//! their table, regardless of which side registered first.

use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::bus::PciBus;
use crate::device::PciDevice;
use crate::Error;

/// Wildcard for the ID fields of a [`DeviceId`].
pub const PCI_ANY_ID: u16 = 0xffff;

/// One entry of a driver's match table.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceId {
    pub vendor: u16,
    pub device: u16,
    pub subvendor: u16,
    pub subdevice: u16,
    /// 24-bit class/subclass/prog-if pattern.
    pub class: u32,
    /// Bits of `class` that must match; zero wildcards the class entirely.
    pub class_mask: u32,
}

impl DeviceId {
    /// Matches on vendor/device alone, wildcarding everything else.
    pub const fn new(vendor: u16, device: u16) -> DeviceId {
        DeviceId {
            vendor,
            device,
            subvendor: PCI_ANY_ID,
            subdevice: PCI_ANY_ID,
            class: 0,
            class_mask: 0,
        }
    }

    /// Matches on the class bits selected by `class_mask`, wildcarding the
    /// IDs.
    pub const fn with_class(class: u32, class_mask: u32) -> DeviceId {
        DeviceId {
            vendor: PCI_ANY_ID,
            device: PCI_ANY_ID,
            subvendor: PCI_ANY_ID,
            subdevice: PCI_ANY_ID,
            class,
            class_mask,
        }
    }
}

/// A PCI device driver.
pub trait PciDriver: Send + Sync {
    /// Match table. A `vendor == 0` entry terminates the table early; the
    /// first matching entry wins.
    fn id_table(&self) -> &[DeviceId];

    /// Binds the driver to `dev`. Called with the registry lock held.
    fn probe(&self, dev: &Arc<PciDevice>) -> Result<(), Error>;

    /// Unbinds the driver from `dev`. Called with the registry lock held.
    fn remove(&self, dev: &Arc<PciDevice>) {
        let _ = dev;
    }
}

fn match_one(id: &DeviceId, dev: &PciDevice) -> bool {
    (id.vendor == PCI_ANY_ID || id.vendor == dev.vendor_id())
        && (id.device == PCI_ANY_ID || id.device == dev.device_id())
        && (id.subvendor == PCI_ANY_ID || id.subvendor == dev.subsystem_vendor())
        && (id.subdevice == PCI_ANY_ID || id.subdevice == dev.subsystem_device())
        && (id.class ^ dev.class()) & id.class_mask == 0
}

/// First table entry matching `dev`, honoring the sentinel terminator.
pub fn match_id<'id>(table: &'id [DeviceId], dev: &PciDevice) -> Option<&'id DeviceId> {
    table
        .iter()
        .take_while(|id| id.vendor != 0)
        .find(|id| match_one(id, dev))
}

struct Registry {
    devices: Vec<Arc<PciDevice>>,
    drivers: Vec<Arc<dyn PciDriver>>,
    root_buses: Vec<Arc<PciBus>>,
}

impl Registry {
    const fn new() -> Registry {
        Registry {
            devices: Vec::new(),
            drivers: Vec::new(),
            root_buses: Vec::new(),
        }
    }
}

static PCI_REGISTRY: Mutex<Registry> = Mutex::new(Registry::new());

fn bind(drv: &Arc<dyn PciDriver>, dev: &Arc<PciDevice>) -> bool {
    if match_id(drv.id_table(), dev).is_none() {
        return false;
    }

    if drv.probe(dev).is_err() {
        return false;
    }

    dev.set_driver(Some(drv.clone()));
    true
}

/// Registers `drv` and probes it against every unbound device.
///
/// `probe` runs with the registry lock held; a probe that re-enters the
/// registry deadlocks.
pub fn register_driver(drv: Arc<dyn PciDriver>) -> Result<(), Error> {
    if drv.id_table().is_empty() {
        return Err(Error::InvalidArgument);
    }

    let mut registry = PCI_REGISTRY.lock();
    registry.drivers.push(drv.clone());

    for dev in registry.devices.iter() {
        if dev.driver().is_none() {
            bind(&drv, dev);
        }
    }

    Ok(())
}

/// Removes `drv`, unbinding every device it claimed.
pub fn unregister_driver(drv: &Arc<dyn PciDriver>) -> Result<(), Error> {
    let mut registry = PCI_REGISTRY.lock();

    let index = registry
        .drivers
        .iter()
        .position(|other| Arc::ptr_eq(other, drv))
        .ok_or(Error::NoSuchEntry)?;

    for dev in registry.devices.iter() {
        let bound = dev
            .driver()
            .map_or(false, |bound| Arc::ptr_eq(&bound, drv));

        if bound {
            drv.remove(dev);
            dev.set_driver(None);
        }
    }

    registry.drivers.remove(index);
    Ok(())
}

/// Adds a device and binds the first registered driver that matches it and
/// probes successfully. A failed probe leaves the device unbound.
pub fn register_device(dev: &Arc<PciDevice>) {
    let mut registry = PCI_REGISTRY.lock();
    registry.devices.push(dev.clone());

    for drv in registry.drivers.iter() {
        if bind(drv, dev) {
            break;
        }
    }
}

/// Removes a device, unbinding its driver first.
pub fn unregister_device(dev: &Arc<PciDevice>) -> Result<(), Error> {
    let mut registry = PCI_REGISTRY.lock();

    let index = registry
        .devices
        .iter()
        .position(|other| Arc::ptr_eq(other, dev))
        .ok_or(Error::NoSuchEntry)?;

    if let Some(drv) = dev.driver() {
        drv.remove(dev);
        dev.set_driver(None);
    }

    registry.devices.remove(index);
    Ok(())
}

/// Publishes a freshly scanned hierarchy: the root bus itself, then every
/// device depth-first in discovery order.
pub(crate) fn publish_root_bus(root: Arc<PciBus>) {
    PCI_REGISTRY.lock().root_buses.push(root.clone());
    register_bus_devices(&root);
}

fn register_bus_devices(bus: &Arc<PciBus>) {
    for dev in bus.devices() {
        register_device(&dev);
    }

    for child in bus.children() {
        register_bus_devices(&child);
    }
}

/// Snapshot of every registered device.
pub fn devices() -> Vec<Arc<PciDevice>> {
    PCI_REGISTRY.lock().devices.clone()
}

/// Snapshot of every registered root bus.
pub fn root_buses() -> Vec<Arc<PciBus>> {
    PCI_REGISTRY.lock().root_buses.clone()
}

/// First registered device with the given vendor/device IDs.
pub fn find_device(vendor: u16, device: u16) -> Option<Arc<PciDevice>> {
    PCI_REGISTRY
        .lock()
        .devices
        .iter()
        .find(|dev| dev.vendor_id() == vendor && dev.device_id() == device)
        .cloned()
}
