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

//! Bus enumeration: the recursive scan, BAR sizing and assignment, and
//! bridge window programming.

use alloc::sync::Arc;

use bit_field::BitField;
use spin::Mutex;

use crate::access::*;
use crate::bus::{PciBus, ScanMode};
use crate::device::{PciDevice, Resource, ResourceFlags, NUM_RESOURCES};
use crate::Error;

const SZ_4K: u64 = 0x1000;
const SZ_1M: u64 = 0x10_0000;

/// Address-space class a BAR allocates from.
#[derive(Copy, Clone)]
enum Space {
    Io,
    Mem,
    MemPref,
}

fn align_up(value: u64, align: u64) -> u64 {
    (value + align - 1) & !(align - 1)
}

/// Sweeps every devfn on `bus`, descending depth-first into bridges.
///
/// Bus numbers are handed out in discovery order, so the sweep is strictly
/// ascending-devfn with bridges recursed into in place.
pub(crate) fn scan_bus(bus: &Arc<PciBus>) {
    let mut multi = false;

    for devfn in 0..0xffu8 {
        let function = devfn.get_bits(0..3);

        // Functions above 0 exist only on devices whose function 0
        // advertised the multifunction bit. A fresh slot forgets the
        // previous device's bit, even when its function 0 turns out to be
        // unreadable.
        if function == 0 {
            multi = false;
        } else if !multi {
            continue;
        }

        let hdr = match bus.read_config::<u8>(devfn, PCI_HEADER_TYPE) {
            Ok(value) => value as u8,
            Err(_) => continue,
        };

        if function == 0 {
            multi = hdr & PCI_HEADER_TYPE_MULTI != 0;
        }

        let id = match bus.read_config::<u32>(devfn, PCI_VENDOR_ID) {
            Ok(value) => value,
            Err(_) => continue,
        };

        // Some broken boards return 0 or ~0 for an empty slot.
        if id == 0xffff_ffff || id == 0x0000_0000 || id == 0x0000_ffff || id == 0xffff_0000 {
            continue;
        }

        let class_revision = match bus.read_config::<u32>(devfn, PCI_CLASS_REVISION) {
            Ok(value) => value,
            Err(_) => continue,
        };

        let mut dev = PciDevice {
            bus: Arc::downgrade(bus),
            devfn,
            vendor: id.get_bits(0..16) as u16,
            device: id.get_bits(16..32) as u16,
            revision: class_revision.get_bits(0..8) as u8,
            class: class_revision.get_bits(8..32),
            hdr_type: hdr & 0x7f,
            subsystem_vendor: 0,
            subsystem_device: 0,
            resources: [Resource::EMPTY; NUM_RESOURCES],
            subordinate: None,
            driver: Mutex::new(None),
        };

        match dev.hdr_type {
            PCI_HEADER_TYPE_NORMAL => {
                if dev.class.get_bits(8..24) as u16 == PCI_CLASS_BRIDGE_PCI {
                    log::error!(
                        "pci: {:02x}:{:02x}.{:x}: endpoint header on a PCI-PCI bridge class",
                        bus.number(),
                        dev.slot(),
                        dev.function()
                    );
                    continue;
                }

                if let Err(err) = setup_device(&mut dev, 6) {
                    log::error!(
                        "pci: {:02x}:{:02x}.{:x}: BAR setup failed: {:?}",
                        bus.number(),
                        dev.slot(),
                        dev.function(),
                        err
                    );
                }

                match dev.read::<u16>(PCI_SUBSYSTEM_VENDOR_ID) {
                    Ok(value) => dev.subsystem_vendor = value as u16,
                    Err(err) => log::error!(
                        "pci: {:02x}:{:02x}.{:x}: subsystem vendor read failed: {:?}",
                        bus.number(),
                        dev.slot(),
                        dev.function(),
                        err
                    ),
                }

                match dev.read::<u16>(PCI_SUBSYSTEM_ID) {
                    Ok(value) => dev.subsystem_device = value as u16,
                    Err(err) => log::error!(
                        "pci: {:02x}:{:02x}.{:x}: subsystem id read failed: {:?}",
                        bus.number(),
                        dev.slot(),
                        dev.function(),
                        err
                    ),
                }
            }

            PCI_HEADER_TYPE_BRIDGE => {
                let child = alloc_child_bus(bus);
                dev.subordinate = Some(child.clone());

                if let Err(err) = presetup_bridge(&dev, &child) {
                    log::error!(
                        "pci: {:02x}:{:02x}.{:x}: bridge presetup failed: {:?}",
                        bus.number(),
                        dev.slot(),
                        dev.function(),
                        err
                    );
                }

                scan_bus(&child);

                if let Err(err) = postsetup_bridge(&dev) {
                    log::error!(
                        "pci: {:02x}:{:02x}.{:x}: bridge postsetup failed: {:?}",
                        bus.number(),
                        dev.slot(),
                        dev.function(),
                        err
                    );
                }

                if let Err(err) = setup_device(&mut dev, 2) {
                    log::error!(
                        "pci: {:02x}:{:02x}.{:x}: bridge BAR setup failed: {:?}",
                        bus.number(),
                        dev.slot(),
                        dev.function(),
                        err
                    );
                }
            }

            other => {
                log::warn!(
                    "pci: {:02x}:{:02x}.{:x}: unknown header type {:#04x}",
                    bus.number(),
                    devfn >> 3,
                    devfn & 0x7,
                    other
                );
                continue;
            }
        }

        log::debug!(
            "pci: {:02x}:{:02x}.{:x} {:?} (vendor={:#06x}, device={:#06x})",
            bus.number(),
            dev.slot(),
            dev.function(),
            dev.device_type(),
            dev.vendor_id(),
            dev.device_id()
        );

        bus.devices.lock().push(Arc::new(dev));
    }
}

fn alloc_child_bus(parent: &Arc<PciBus>) -> Arc<PciBus> {
    let ctrl = parent.ctrl.clone();

    let number = match ctrl.mode {
        ScanMode::AssignAllBuses => {
            let mut state = ctrl.state.lock();
            let number = state.busno;
            state.busno = state.busno.wrapping_add(1);
            number
        }
        // Rewritten from the bridge's SECONDARY_BUS register in presetup.
        ScanMode::FirmwareAssigned => 0,
    };

    let child = PciBus::new(number, ctrl, Arc::downgrade(parent));
    parent.children.lock().push(child.clone());

    child
}

/// Canonical BAR sizing: `maxbase` is the readback after writing all ones
/// and `mask` strips the register's hardwired low bits.
fn pci_size(base: u32, maxbase: u32, mask: u32) -> u64 {
    let mut size = maxbase & mask;

    if size == 0 {
        return 0;
    }

    // Bits below the lowest set bit are the decode extent.
    size = (size & size.wrapping_neg()) - 1;

    // base == maxbase is only valid when the BAR was already programmed
    // with all ones; otherwise the register is not writable at all.
    if base == maxbase && ((base | size) & mask) != mask {
        return 0;
    }

    size as u64 + 1
}

/// Sizes and places the first `max_bar` BARs of `dev`, recording the
/// outcome in `dev.resources`.
fn setup_device(dev: &mut PciDevice, max_bar: usize) -> Result<(), Error> {
    let bus = dev.bus();
    let ctrl = bus.ctrl.clone();
    let assign = ctrl.mode == ScanMode::AssignAllBuses;

    // Sizing momentarily puts all-ones into the BAR; decode must be off so
    // the device does not claim bogus addresses meanwhile.
    let cmd = if assign {
        let cmd = dev.read::<u16>(PCI_COMMAND)? as u16;
        let decode = (CommandRegister::IO | CommandRegister::MEMORY).bits();
        dev.write::<u16>(PCI_COMMAND, (cmd & !decode) as u32)?;
        Some(cmd)
    } else {
        None
    };

    let mut bar = 0;
    while bar < max_bar {
        let base0 = PCI_BASE_ADDRESS_0 + 4 * bar as u16;
        let base1 = base0 + 4;

        let orig = dev.read::<u32>(base0)?;
        dev.write::<u32>(base0, 0xffff_fffe)?;
        let mask = dev.read::<u32>(base0)?;
        dev.write::<u32>(base0, orig)?;

        if mask == 0 || mask == 0xffff_ffff {
            // Unimplemented BAR.
            bar += 1;
            continue;
        }

        let io = mask & PCI_BASE_ADDRESS_SPACE_IO != 0;

        let (size, flags, space) = if io {
            (
                pci_size(orig, mask, 0xffff_fff0),
                ResourceFlags::IO,
                Space::Io,
            )
        } else if mask & PCI_BASE_ADDRESS_MEM_PREFETCH != 0
            && ctrl.state.lock().mem_pref.present()
        {
            (
                pci_size(orig, mask, PCI_BASE_ADDRESS_MEM_MASK),
                ResourceFlags::MEM | ResourceFlags::PREFETCH,
                Space::MemPref,
            )
        } else {
            (
                pci_size(orig, mask, PCI_BASE_ADDRESS_MEM_MASK),
                ResourceFlags::MEM,
                Space::Mem,
            )
        };

        if size == 0 {
            log::error!(
                "pci: {:02x}:{:02x}.{:x}: bar{} sized to zero (mask={:#010x})",
                bus.number(),
                dev.slot(),
                dev.function(),
                bar,
                mask
            );
            bar += 1;
            continue;
        }

        let is_64 = !io && mask & PCI_BASE_ADDRESS_MEM_TYPE_MASK == PCI_BASE_ADDRESS_MEM_TYPE_64;

        let start = if assign {
            let start = {
                let mut state = ctrl.state.lock();
                let window = match space {
                    Space::Io => &mut state.io,
                    Space::Mem => &mut state.mem,
                    Space::MemPref => &mut state.mem_pref,
                };

                window.start = align_up(window.start, size);
                if window.start + size > window.end {
                    log::error!(
                        "pci: {:02x}:{:02x}.{:x}: bar{} ({:#x} bytes) does not fit its window",
                        bus.number(),
                        dev.slot(),
                        dev.function(),
                        bar,
                        size
                    );

                    // The remaining BARs stay unprogrammed and decode stays
                    // off for this device.
                    return Ok(());
                }

                let start = window.start;
                window.start += size;
                start
            };

            dev.write::<u32>(base0, start as u32)?;
            if is_64 {
                dev.write::<u32>(base1, (start >> 32) as u32)?;
            }

            start
        } else {
            let base = dev.read::<u32>(base0)?;
            let mut start = if io {
                (base & PCI_BASE_ADDRESS_IO_MASK) as u64
            } else {
                (base & PCI_BASE_ADDRESS_MEM_MASK) as u64
            };

            if is_64 {
                start |= (dev.read::<u32>(base1)? as u64) << 32;
            }

            start
        };

        dev.resources[bar] = Resource {
            start,
            end: start + size - 1,
            flags,
        };

        if is_64 {
            dev.resources[bar].flags |= ResourceFlags::MEM_64;
            // The next register is the high half of this BAR.
            bar += 1;
        }

        bar += 1;
    }

    if let Some(cmd) = cmd {
        dev.write::<u16>(PCI_COMMAND, cmd as u32)?;
    }

    Ok(())
}

/// Programs the bridge's bus numbers and window bases before descending
/// into the secondary bus.
fn presetup_bridge(dev: &PciDevice, child: &Arc<PciBus>) -> Result<(), Error> {
    let bus = dev.bus();
    let ctrl = bus.ctrl.clone();

    if ctrl.mode == ScanMode::FirmwareAssigned {
        bus.set_number(dev.read::<u8>(PCI_PRIMARY_BUS)? as u8);
        child.set_number(dev.read::<u8>(PCI_SECONDARY_BUS)? as u8);
        return Ok(());
    }

    let mut cmdstat = dev.read::<u16>(PCI_COMMAND)? as u16;

    dev.write::<u8>(PCI_PRIMARY_BUS, bus.number() as u32)?;
    dev.write::<u8>(PCI_SECONDARY_BUS, child.number() as u32)?;
    // The real upper bound is unknown until the descent finishes.
    dev.write::<u8>(PCI_SUBORDINATE_BUS, 0xff)?;

    let (mem, mem_pref, io) = {
        let mut state = ctrl.state.lock();
        if state.mem.present() {
            state.mem.start = align_up(state.mem.start, SZ_1M);
        }
        if state.mem_pref.present() {
            state.mem_pref.start = align_up(state.mem_pref.start, SZ_1M);
        }
        if state.io.present() {
            state.io.start = align_up(state.io.start, SZ_4K);
        }
        (state.mem, state.mem_pref, state.io)
    };

    if mem.present() {
        dev.write::<u16>(PCI_MEMORY_BASE, ((mem.start & 0xfff0_0000) >> 16) as u32)?;
        cmdstat |= CommandRegister::MEMORY.bits();
    } else {
        // Closed window: base above limit.
        dev.write::<u16>(PCI_MEMORY_BASE, 0x1000)?;
        dev.write::<u16>(PCI_MEMORY_LIMIT, 0x0)?;
    }

    if mem_pref.present() {
        dev.write::<u16>(
            PCI_PREF_MEMORY_BASE,
            ((mem_pref.start & 0xfff0_0000) >> 16) as u32,
        )?;
        dev.write::<u32>(PCI_PREF_BASE_UPPER32, (mem_pref.start >> 32) as u32)?;
        cmdstat |= CommandRegister::MEMORY.bits();
    } else {
        dev.write::<u16>(PCI_PREF_MEMORY_BASE, 0x1000)?;
        dev.write::<u16>(PCI_PREF_MEMORY_LIMIT, 0x0)?;
        dev.write::<u32>(PCI_PREF_BASE_UPPER32, 0x0)?;
        dev.write::<u32>(PCI_PREF_LIMIT_UPPER32, 0x0)?;
    }

    if io.present() {
        dev.write::<u8>(PCI_IO_BASE, ((io.start & 0xf000) >> 8) as u32)?;
        dev.write::<u16>(PCI_IO_BASE_UPPER16, ((io.start & 0xffff_0000) >> 16) as u32)?;
        cmdstat |= CommandRegister::IO.bits();
    }

    dev.write::<u16>(
        PCI_COMMAND,
        (cmdstat | CommandRegister::BUS_MASTER.bits()) as u32,
    )
}

/// Finalizes the bridge after the secondary scan: the subordinate bus
/// number and the window limits bracketing what the descent consumed.
fn postsetup_bridge(dev: &PciDevice) -> Result<(), Error> {
    let bus = dev.bus();
    let ctrl = bus.ctrl.clone();

    if ctrl.mode == ScanMode::FirmwareAssigned {
        return Ok(());
    }

    let (mem, mem_pref, io, busno) = {
        let mut state = ctrl.state.lock();
        if state.mem.present() {
            state.mem.start = align_up(state.mem.start, SZ_1M);
        }
        if state.mem_pref.present() {
            state.mem_pref.start = align_up(state.mem_pref.start, SZ_1M);
        }
        if state.io.present() {
            state.io.start = align_up(state.io.start, SZ_4K);
        }
        (state.mem, state.mem_pref, state.io, state.busno)
    };

    // The last bus number the descent consumed.
    dev.write::<u8>(PCI_SUBORDINATE_BUS, busno.wrapping_sub(1) as u32)?;

    if mem.present() {
        dev.write::<u16>(
            PCI_MEMORY_LIMIT,
            (((mem.start - 1) & 0xfff0_0000) >> 16) as u32,
        )?;
    }

    if mem_pref.present() {
        dev.write::<u16>(
            PCI_PREF_MEMORY_LIMIT,
            (((mem_pref.start - 1) & 0xfff0_0000) >> 16) as u32,
        )?;
        dev.write::<u32>(PCI_PREF_LIMIT_UPPER32, ((mem_pref.start - 1) >> 32) as u32)?;
    }

    if io.present() {
        dev.write::<u8>(PCI_IO_LIMIT, (((io.start - 1) & 0xf000) >> 8) as u32)?;
        dev.write::<u16>(
            PCI_IO_LIMIT_UPPER16,
            (((io.start - 1) & 0xffff_0000) >> 16) as u32,
        )?;
    }

    Ok(())
}
