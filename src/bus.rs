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

//! Host controllers and the bus hierarchy hanging off them.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use core::sync::atomic::{AtomicU8, Ordering};

use spin::{Mutex, Once};

use crate::access::{self, ConfigAccess};
use crate::device::PciDevice;
use crate::registry;
use crate::scan;
use crate::Error;

/// One controller address window that BARs are allocated from.
///
/// The window covers `start..end`; `start` advances as BARs are assigned. A
/// zeroed window means the controller does not forward that space.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Window {
    pub start: u64,
    pub end: u64,
}

impl Window {
    pub const fn new(start: u64, end: u64) -> Window {
        Window { start, end }
    }

    /// A window the controller does not forward.
    pub const fn none() -> Window {
        Window { start: 0, end: 0 }
    }

    /// Whether the controller forwards this space at all. Stable across
    /// allocation, which only ever moves `start`.
    pub(crate) fn present(&self) -> bool {
        self.end != 0
    }
}

/// How the scan treats state programmed by the platform firmware.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ScanMode {
    /// Number every bus and place every BAR from the controller windows.
    AssignAllBuses,
    /// Trust the bus numbers and BAR addresses firmware already programmed.
    FirmwareAssigned,
}

pub(crate) struct ScanState {
    pub io: Window,
    pub mem: Window,
    pub mem_pref: Window,
    /// Next bus number to hand out.
    pub busno: u8,
}

/// A host bridge: the backend it drives, the windows it forwards and the
/// root of the bus hierarchy behind it.
pub struct PciController {
    pub(crate) access: Arc<dyn ConfigAccess>,
    pub(crate) mode: ScanMode,
    pub(crate) state: Mutex<ScanState>,
    root: Once<Weak<PciBus>>,
}

impl PciController {
    pub fn mode(&self) -> ScanMode {
        self.mode
    }

    /// Root bus of this controller's hierarchy.
    pub fn root(&self) -> Option<Arc<PciBus>> {
        self.root.get().and_then(|root| root.upgrade())
    }
}

/// A bus in the hierarchy: the controller's root bus, or the secondary side
/// of a bridge.
pub struct PciBus {
    /// Rewritten from the bridge registers in firmware-assigned mode, hence
    /// the atomic.
    number: AtomicU8,
    pub(crate) ctrl: Arc<PciController>,
    parent: Weak<PciBus>,
    pub(crate) children: Mutex<Vec<Arc<PciBus>>>,
    pub(crate) devices: Mutex<Vec<Arc<PciDevice>>>,
}

impl PciBus {
    pub(crate) fn new(number: u8, ctrl: Arc<PciController>, parent: Weak<PciBus>) -> Arc<PciBus> {
        Arc::new(PciBus {
            number: AtomicU8::new(number),
            ctrl,
            parent,
            children: Mutex::new(Vec::new()),
            devices: Mutex::new(Vec::new()),
        })
    }

    pub fn number(&self) -> u8 {
        self.number.load(Ordering::Relaxed)
    }

    pub(crate) fn set_number(&self, number: u8) {
        self.number.store(number, Ordering::Relaxed);
    }

    pub fn controller(&self) -> &Arc<PciController> {
        &self.ctrl
    }

    pub(crate) fn access(&self) -> &dyn ConfigAccess {
        &*self.ctrl.access
    }

    /// Parent bus; `None` for a controller's root bus.
    pub fn parent(&self) -> Option<Arc<PciBus>> {
        self.parent.upgrade()
    }

    /// Snapshot of the functions discovered on this bus.
    pub fn devices(&self) -> Vec<Arc<PciDevice>> {
        self.devices.lock().clone()
    }

    /// Snapshot of the buses behind bridges on this bus.
    pub fn children(&self) -> Vec<Arc<PciBus>> {
        self.children.lock().clone()
    }

    /// Reads a `T`-wide value from the configuration space of `devfn` on
    /// this bus.
    pub fn read_config<T>(&self, devfn: u8, offset: u16) -> Result<u32, Error> {
        access::read_config::<T>(self.access(), self.number(), devfn, offset)
    }

    /// Writes a `T`-wide value to the configuration space of `devfn` on
    /// this bus.
    pub fn write_config<T>(&self, devfn: u8, offset: u16, value: u32) -> Result<(), Error> {
        access::write_config::<T>(self.access(), self.number(), devfn, offset, value)
    }
}

/// Builds the controller and scans its hierarchy, without touching the
/// global registry.
pub(crate) fn bring_up(
    access: Arc<dyn ConfigAccess>,
    mode: ScanMode,
    io: Window,
    mem: Window,
    mem_pref: Window,
) -> Result<(Arc<PciController>, Arc<PciBus>), Error> {
    for window in [&io, &mem, &mem_pref] {
        if window.start > window.end {
            return Err(Error::InvalidArgument);
        }
    }

    let ctrl = Arc::new(PciController {
        access,
        mode,
        state: Mutex::new(ScanState {
            io,
            mem,
            mem_pref,
            busno: 0,
        }),
        root: Once::new(),
    });

    let number = {
        let mut state = ctrl.state.lock();
        let number = state.busno;
        state.busno = state.busno.wrapping_add(1);
        number
    };

    let root = PciBus::new(number, ctrl.clone(), Weak::new());
    ctrl.root.call_once(|| Arc::downgrade(&root));

    scan::scan_bus(&root);

    Ok((ctrl, root))
}

/// Registers a host controller: allocates its root bus, scans the whole
/// hierarchy behind it and publishes every discovered function to the
/// device registry, probing drivers in discovery order.
pub fn register_controller(
    access: Arc<dyn ConfigAccess>,
    mode: ScanMode,
    io: Window,
    mem: Window,
    mem_pref: Window,
) -> Result<Arc<PciController>, Error> {
    let (ctrl, root) = bring_up(access, mode, io, mem, mem_pref)?;
    registry::publish_root_bus(root);

    Ok(ctrl)
}
