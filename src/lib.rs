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

//! PCI bus subsystem.
//!
//! Enumerates the PCI hierarchy behind a host controller, sizes and assigns
//! BARs out of the controller's address windows, configures PCI-to-PCI
//! bridges and binds devices to registered drivers. The platform supplies
//! the low-level configuration cycles through [`ConfigAccess`]; everything
//! above that (scanning, resource assignment, the driver registry) lives
//! here.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod access;
pub mod bus;
pub mod class;
pub mod device;
pub mod registry;

mod scan;

#[cfg(test)]
mod testutil;

pub use access::ConfigAccess;
pub use bus::{register_controller, PciBus, PciController, ScanMode, Window};
pub use class::DeviceType;
pub use device::{PciDevice, Resource, ResourceFlags, NUM_RESOURCES};
pub use registry::{
    find_device, register_device, register_driver, unregister_device, unregister_driver, DeviceId,
    PciDriver, PCI_ANY_ID,
};

/// Errors returned by the PCI subsystem.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// Misaligned configuration access or malformed argument.
    InvalidArgument,
    /// An address window cannot fit the requested allocation.
    ResourceExhausted,
    /// The backend failed to complete the configuration cycle.
    BusError,
    /// The driver or device is not registered.
    NoSuchEntry,
}
