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

//! The per-function device record and the API drivers program their
//! hardware through.

use alloc::sync::{Arc, Weak};

use bit_field::BitField;
use spin::Mutex;

use crate::access::*;
use crate::bus::PciBus;
use crate::class::DeviceType;
use crate::registry::PciDriver;
use crate::Error;

/// Number of resource slots in a device record; one per type-0 BAR.
pub const NUM_RESOURCES: usize = 6;

/// Capability-list hops before the walk gives up, bounding circular or
/// malicious chains.
const CAP_TTL: usize = 48;

bitflags::bitflags! {
    /// Address-space attributes of an assigned [`Resource`].
    pub struct ResourceFlags: u32 {
        /// The window lives in I/O space.
        const IO = 1 << 0;
        /// The window lives in memory space.
        const MEM = 1 << 1;
        /// Prefetchable memory.
        const PREFETCH = 1 << 2;
        /// The BAR pair decodes a 64-bit address.
        const MEM_64 = 1 << 3;
    }
}

/// One assigned BAR window; `start..=end` on the bus, `end >= start`, size a
/// power of two and `start` aligned to it.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Resource {
    pub start: u64,
    pub end: u64,
    pub flags: ResourceFlags,
}

impl Resource {
    pub(crate) const EMPTY: Resource = Resource {
        start: 0,
        end: 0,
        flags: ResourceFlags::empty(),
    };

    /// Whether BAR assignment populated this slot.
    pub fn is_assigned(&self) -> bool {
        !self.flags.is_empty()
    }

    /// Size of the window in bytes.
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// A single PCI function.
pub struct PciDevice {
    pub(crate) bus: Weak<PciBus>,
    pub(crate) devfn: u8,
    pub(crate) vendor: u16,
    pub(crate) device: u16,
    pub(crate) revision: u8,
    /// 24-bit class/subclass/prog-if word.
    pub(crate) class: u32,
    /// Header type with the multifunction bit cleared.
    pub(crate) hdr_type: u8,
    pub(crate) subsystem_vendor: u16,
    pub(crate) subsystem_device: u16,
    pub(crate) resources: [Resource; NUM_RESOURCES],
    /// Secondary bus behind this function, when it is a bridge.
    pub(crate) subordinate: Option<Arc<PciBus>>,
    pub(crate) driver: Mutex<Option<Arc<dyn PciDriver>>>,
}

impl PciDevice {
    /// The bus this function was discovered on.
    pub fn bus(&self) -> Arc<PciBus> {
        self.bus.upgrade().expect("pci: device outlived its bus")
    }

    pub fn devfn(&self) -> u8 {
        self.devfn
    }

    pub fn slot(&self) -> u8 {
        self.devfn.get_bits(3..8)
    }

    pub fn function(&self) -> u8 {
        self.devfn.get_bits(0..3)
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor
    }

    pub fn device_id(&self) -> u16 {
        self.device
    }

    pub fn revision(&self) -> u8 {
        self.revision
    }

    /// 24-bit class/subclass/prog-if word.
    pub fn class(&self) -> u32 {
        self.class
    }

    pub fn header_type(&self) -> u8 {
        self.hdr_type
    }

    pub fn subsystem_vendor(&self) -> u16 {
        self.subsystem_vendor
    }

    pub fn subsystem_device(&self) -> u16 {
        self.subsystem_device
    }

    pub fn device_type(&self) -> DeviceType {
        DeviceType::new(
            self.class.get_bits(16..24) as u8,
            self.class.get_bits(8..16) as u8,
        )
    }

    /// The window assigned to BAR `index`, [`Resource::EMPTY`]-flagged when
    /// the BAR is unimplemented or could not be placed.
    pub fn resource(&self, index: usize) -> Resource {
        self.resources
            .get(index)
            .copied()
            .unwrap_or(Resource::EMPTY)
    }

    pub fn resources(&self) -> &[Resource] {
        &self.resources
    }

    /// Secondary bus behind this function, when it is a bridge.
    pub fn subordinate(&self) -> Option<&Arc<PciBus>> {
        self.subordinate.as_ref()
    }

    /// The driver currently bound to this device.
    pub fn driver(&self) -> Option<Arc<dyn PciDriver>> {
        self.driver.lock().clone()
    }

    pub(crate) fn set_driver(&self, driver: Option<Arc<dyn PciDriver>>) {
        *self.driver.lock() = driver;
    }

    /// Reads a `T`-wide value from this function's configuration space.
    pub fn read<T>(&self, offset: u16) -> Result<u32, Error> {
        self.bus().read_config::<T>(self.devfn, offset)
    }

    /// Writes a `T`-wide value to this function's configuration space.
    pub fn write<T>(&self, offset: u16, value: u32) -> Result<(), Error> {
        self.bus().write_config::<T>(self.devfn, offset, value)
    }

    /// Turns on I/O and memory decoding.
    pub fn enable_device(&self) -> Result<(), Error> {
        let cmd = self.read::<u32>(PCI_COMMAND)?;
        let decode = (CommandRegister::IO | CommandRegister::MEMORY).bits() as u32;

        self.write::<u32>(PCI_COMMAND, cmd | decode)
    }

    /// Turns off I/O and memory decoding.
    pub fn disable_device(&self) -> Result<(), Error> {
        let cmd = self.read::<u32>(PCI_COMMAND)?;
        let decode = (CommandRegister::IO | CommandRegister::MEMORY).bits() as u32;

        self.write::<u32>(PCI_COMMAND, cmd & !decode)
    }

    /// Allows this device to master the bus; required for DMA.
    pub fn set_master(&self) -> Result<(), Error> {
        self.change_master(true)
    }

    pub fn clear_master(&self) -> Result<(), Error> {
        self.change_master(false)
    }

    fn change_master(&self, enable: bool) -> Result<(), Error> {
        let old = self.read::<u16>(PCI_COMMAND)? as u16;
        let new = if enable {
            old | CommandRegister::BUS_MASTER.bits()
        } else {
            old & !CommandRegister::BUS_MASTER.bits()
        };

        if new != old {
            self.write::<u16>(PCI_COMMAND, new as u32)?;
        }

        Ok(())
    }

    /// Returns a bitmask with bit `i` set for every resource whose flags
    /// intersect `flags`.
    pub fn select_bars(&self, flags: ResourceFlags) -> u32 {
        let mut bars = 0;

        for (i, res) in self.resources.iter().enumerate() {
            if res.flags.intersects(flags) {
                bars.set_bit(i, true);
            }
        }

        bars
    }

    /// Maps BAR `index` and returns the address it is reachable at, going
    /// through the controller's `map` op when it has one.
    pub fn map_bar(&self, index: usize) -> Option<usize> {
        let res = self.resource(index);

        if !res.is_assigned() {
            return None;
        }

        let bus = self.bus();
        match bus.access().map(bus.number(), res.start, res.end) {
            Some(addr) => Some(addr),
            None => Some(res.start as usize),
        }
    }

    /// Offset of the first capability with `id`, or `None` when the device
    /// has no such capability.
    pub fn find_capability(&self, id: u8) -> Option<u8> {
        let pos = self.capability_start()?;
        self.walk_capabilities(pos, id, CAP_TTL)
    }

    /// Offset of the next capability with `id` after the one at `pos`.
    pub fn find_next_capability(&self, pos: u8, id: u8) -> Option<u8> {
        let next = self.read::<u8>(pos as u16 + 1).ok()? as u8;
        self.walk_capabilities(next, id, CAP_TTL)
    }

    fn capability_start(&self) -> Option<u8> {
        let status = self.read::<u16>(PCI_STATUS).ok()? as u16;

        if status & PCI_STATUS_CAP_LIST == 0 {
            return None;
        }

        let list = match self.hdr_type {
            PCI_HEADER_TYPE_NORMAL | PCI_HEADER_TYPE_BRIDGE => PCI_CAPABILITY_LIST,
            PCI_HEADER_TYPE_CARDBUS => PCI_CB_CAPABILITY_LIST,
            _ => return None,
        };

        Some(self.read::<u8>(list).ok()? as u8)
    }

    fn walk_capabilities(&self, mut pos: u8, id: u8, mut ttl: usize) -> Option<u8> {
        while ttl > 0 {
            ttl -= 1;

            // Pointers are 4-byte aligned; anything below the standard
            // header is a list terminator.
            pos &= !0x3;
            if pos < 0x40 {
                return None;
            }

            let ent = self.read::<u16>(pos as u16).ok()? as u16;
            let cap = ent.get_bits(0..8) as u8;

            if cap == 0xff {
                return None;
            }

            if cap == id {
                return Some(pos);
            }

            pos = ent.get_bits(8..16) as u8;
        }

        None
    }
}
