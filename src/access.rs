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

//! Configuration-space access: the platform backend contract and the
//! width-checked accessor helpers everything else goes through.

use static_assertions::const_assert_eq;

use crate::Error;

/// Low-level configuration cycles of one host controller.
///
/// The backend is responsible for its own bus arbitration; calls are not
/// serialized by the registry lock. A read of a nonexistent function may
/// either fail or return one of the all-ones/all-zeroes empty patterns; the
/// scanner treats both as an empty slot.
pub trait ConfigAccess: Send + Sync {
    /// Reads `width` bytes of configuration space at `offset`.
    fn read(&self, bus: u8, devfn: u8, offset: u16, width: usize) -> Result<u32, Error>;

    /// Writes the low `width` bytes of `value` at `offset`.
    fn write(&self, bus: u8, devfn: u8, offset: u16, width: usize, value: u32) -> Result<(), Error>;

    /// Maps the BAR window `start..=end` into the kernel address space.
    ///
    /// Controllers whose windows are CPU-visible as-is keep the default,
    /// which makes [`map_bar`](crate::PciDevice::map_bar) return the bus
    /// address unchanged.
    fn map(&self, bus: u8, start: u64, end: u64) -> Option<usize> {
        let _ = (bus, start, end);
        None
    }
}

pub const PCI_VENDOR_ID: u16 = 0x00;
pub const PCI_COMMAND: u16 = 0x04;
pub const PCI_STATUS: u16 = 0x06;
pub const PCI_CLASS_REVISION: u16 = 0x08;
pub const PCI_HEADER_TYPE: u16 = 0x0e;
pub const PCI_BASE_ADDRESS_0: u16 = 0x10;
pub const PCI_PRIMARY_BUS: u16 = 0x18;
pub const PCI_SECONDARY_BUS: u16 = 0x19;
pub const PCI_SUBORDINATE_BUS: u16 = 0x1a;
pub const PCI_IO_BASE: u16 = 0x1c;
pub const PCI_IO_LIMIT: u16 = 0x1d;
pub const PCI_MEMORY_BASE: u16 = 0x20;
pub const PCI_MEMORY_LIMIT: u16 = 0x22;
pub const PCI_PREF_MEMORY_BASE: u16 = 0x24;
pub const PCI_PREF_MEMORY_LIMIT: u16 = 0x26;
pub const PCI_PREF_BASE_UPPER32: u16 = 0x28;
pub const PCI_PREF_LIMIT_UPPER32: u16 = 0x2c;
pub const PCI_SUBSYSTEM_VENDOR_ID: u16 = 0x2c;
pub const PCI_SUBSYSTEM_ID: u16 = 0x2e;
pub const PCI_IO_BASE_UPPER16: u16 = 0x30;
pub const PCI_IO_LIMIT_UPPER16: u16 = 0x32;
pub const PCI_CAPABILITY_LIST: u16 = 0x34;
pub const PCI_CB_CAPABILITY_LIST: u16 = 0x14;

pub const PCI_HEADER_TYPE_NORMAL: u8 = 0x00;
pub const PCI_HEADER_TYPE_BRIDGE: u8 = 0x01;
pub const PCI_HEADER_TYPE_CARDBUS: u8 = 0x02;
/// Bit 7 of the header type at function 0: higher functions exist.
pub const PCI_HEADER_TYPE_MULTI: u8 = 0x80;

pub const PCI_STATUS_CAP_LIST: u16 = 0x10;

pub const PCI_BASE_ADDRESS_SPACE_IO: u32 = 0x01;
pub const PCI_BASE_ADDRESS_MEM_TYPE_MASK: u32 = 0x06;
pub const PCI_BASE_ADDRESS_MEM_TYPE_64: u32 = 0x04;
pub const PCI_BASE_ADDRESS_MEM_PREFETCH: u32 = 0x08;
pub const PCI_BASE_ADDRESS_IO_MASK: u32 = !0x03;
pub const PCI_BASE_ADDRESS_MEM_MASK: u32 = !0x0f;

/// Class/subclass word of a PCI-to-PCI bridge.
pub const PCI_CLASS_BRIDGE_PCI: u16 = 0x0604;

pub const PCI_CAP_ID_PM: u8 = 0x01;
pub const PCI_CAP_ID_MSI: u8 = 0x05;
pub const PCI_CAP_ID_VNDR: u8 = 0x09;
pub const PCI_CAP_ID_EXP: u8 = 0x10;
pub const PCI_CAP_ID_MSIX: u8 = 0x11;

bitflags::bitflags! {
    /// Bits of the COMMAND register.
    pub struct CommandRegister: u16 {
        /// Respond to I/O space accesses.
        const IO = 1 << 0;
        /// Respond to memory space accesses.
        const MEMORY = 1 << 1;
        /// Generate memory and I/O cycles as a bus master.
        const BUS_MASTER = 1 << 2;
    }
}

const_assert_eq!(core::mem::size_of::<CommandRegister>(), 2);

/// Reads a `T`-wide value from configuration space, checking that `offset`
/// is `T`-aligned.
pub(crate) fn read_config<T>(
    access: &dyn ConfigAccess,
    bus: u8,
    devfn: u8,
    offset: u16,
) -> Result<u32, Error> {
    let width = core::mem::size_of::<T>();

    if offset as usize % width != 0 {
        return Err(Error::InvalidArgument);
    }

    match width {
        1 | 2 | 4 => access.read(bus, devfn, offset, width),
        _ => Err(Error::InvalidArgument),
    }
}

/// Writes a `T`-wide value to configuration space, checking that `offset`
/// is `T`-aligned.
pub(crate) fn write_config<T>(
    access: &dyn ConfigAccess,
    bus: u8,
    devfn: u8,
    offset: u16,
    value: u32,
) -> Result<(), Error> {
    let width = core::mem::size_of::<T>();

    if offset as usize % width != 0 {
        return Err(Error::InvalidArgument);
    }

    match width {
        1 | 2 | 4 => access.write(bus, devfn, offset, width, value),
        _ => Err(Error::InvalidArgument),
    }
}
