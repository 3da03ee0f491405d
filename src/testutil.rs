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

//! In-memory PCI topology the tests drive the subsystem against.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::Mutex;

use crate::access::ConfigAccess;
use crate::device::PciDevice;
use crate::registry::{DeviceId, PciDriver};
use crate::Error;

/// Packs a slot/function pair the way configuration cycles address them.
pub fn devfn(slot: u8, function: u8) -> u8 {
    slot << 3 | function
}

/// Tests that touch the process-global registry run one at a time.
static SERIAL: Mutex<()> = Mutex::new(());

pub fn serialize() -> spin::MutexGuard<'static, ()> {
    SERIAL.lock()
}

/// One emulated function: a register file plus the BAR size-probe behavior
/// of real hardware (writable address bits, hardwired low bits).
pub struct FakeFunction {
    regs: [u32; 64],
    bar_mask: [u32; 6],
    bar_bits: [u32; 6],
}

impl FakeFunction {
    fn new(vendor: u16, device: u16, class: u32, hdr_type: u8) -> FakeFunction {
        let mut function = FakeFunction {
            regs: [0; 64],
            bar_mask: [0; 6],
            bar_bits: [0; 6],
        };

        function.regs[0] = (device as u32) << 16 | vendor as u32;
        function.regs[2] = class << 8;
        function.regs[3] = (hdr_type as u32) << 16;
        function
    }

    /// A type-0 function with the given 24-bit class word.
    pub fn endpoint(vendor: u16, device: u16, class: u32) -> FakeFunction {
        FakeFunction::new(vendor, device, class, 0x00)
    }

    /// A PCI-to-PCI bridge function.
    pub fn bridge(vendor: u16, device: u16) -> FakeFunction {
        FakeFunction::new(vendor, device, 0x060400, 0x01)
    }

    /// Sets the multifunction bit in the header type.
    pub fn multifunction(mut self) -> FakeFunction {
        self.regs[3] |= 0x80 << 16;
        self
    }

    /// Overrides the low 7 bits of the header type.
    pub fn header_type(mut self, hdr_type: u8) -> FakeFunction {
        self.regs[3] = (self.regs[3] & !(0x7f << 16)) | ((hdr_type as u32 & 0x7f) << 16);
        self
    }

    /// Presets the COMMAND register.
    pub fn command(mut self, value: u16) -> FakeFunction {
        self.regs[1] = (self.regs[1] & 0xffff_0000) | value as u32;
        self
    }

    /// Presets the subsystem vendor/device IDs.
    pub fn subsystem(mut self, vendor: u16, device: u16) -> FakeFunction {
        self.regs[11] = (device as u32) << 16 | vendor as u32;
        self
    }

    fn bar(mut self, index: usize, mask: u32, bits: u32) -> FakeFunction {
        self.bar_mask[index] = mask;
        self.bar_bits[index] = bits;
        self.regs[4 + index] = bits;
        self
    }

    /// An I/O BAR decoding `size` bytes.
    pub fn io_bar(self, index: usize, size: u32) -> FakeFunction {
        self.bar(index, !(size - 1), 0x1)
    }

    /// A 32-bit non-prefetchable memory BAR decoding `size` bytes.
    pub fn mem_bar(self, index: usize, size: u32) -> FakeFunction {
        self.bar(index, !(size - 1), 0x0)
    }

    /// A 32-bit prefetchable memory BAR decoding `size` bytes.
    pub fn mem_pref_bar(self, index: usize, size: u32) -> FakeFunction {
        self.bar(index, !(size - 1), 0x8)
    }

    /// A 64-bit prefetchable memory BAR pair decoding `size` bytes; the
    /// register after `index` becomes the high half.
    pub fn mem64_pref_bar(self, index: usize, size: u64) -> FakeFunction {
        self.bar(index, !((size - 1) as u32), 0xc)
            .bar(index + 1, 0xffff_ffff, 0x0)
    }

    /// Programs a BAR the way firmware would have.
    pub fn bar_value(mut self, index: usize, value: u32) -> FakeFunction {
        self.regs[4 + index] = (value & self.bar_mask[index]) | self.bar_bits[index];
        self
    }

    /// Pokes a single configuration byte.
    pub fn poke(mut self, offset: u16, value: u8) -> FakeFunction {
        let shift = (offset as usize & 3) * 8;
        let index = offset as usize / 4;

        self.regs[index] = (self.regs[index] & !(0xff << shift)) | ((value as u32) << shift);
        self
    }

    /// Links a capability chain: advertises `CAP_LIST` in STATUS and lays
    /// out `(offset, id)` entries in order, terminating the last one.
    pub fn capabilities(mut self, chain: &[(u8, u8)]) -> FakeFunction {
        self.regs[1] |= 0x10 << 16;

        if let Some(&(first, _)) = chain.first() {
            self = self.poke(0x34, first);
        }

        for (i, &(pos, id)) in chain.iter().enumerate() {
            let next = chain.get(i + 1).map_or(0, |&(next, _)| next);
            self = self.poke(pos as u16, id);
            self = self.poke(pos as u16 + 1, next);
        }

        self
    }

    fn bar_slots(&self) -> usize {
        match (self.regs[3] >> 16) as u8 & 0x7f {
            0x00 => 6,
            0x01 => 2,
            _ => 0,
        }
    }

    fn read(&self, offset: u16, width: usize) -> u32 {
        let dword = self.regs[offset as usize / 4];
        let shift = (offset as usize & 3) * 8;

        match width {
            1 => (dword >> shift) & 0xff,
            2 => (dword >> shift) & 0xffff,
            _ => dword,
        }
    }

    fn write(&mut self, offset: u16, width: usize, value: u32) {
        let index = offset as usize / 4;
        let shift = (offset as usize & 3) * 8;

        let lane_mask = match width {
            1 => 0xff << shift,
            2 => 0xffff << shift,
            _ => 0xffff_ffff,
        };
        let merged = (self.regs[index] & !lane_mask) | ((value << shift) & lane_mask);

        // BARs only accept their writable address bits; the low bits are
        // hardwired.
        let bars = self.bar_slots();
        if index >= 4 && index < 4 + bars {
            let bar = index - 4;
            self.regs[index] = (merged & self.bar_mask[bar]) | self.bar_bits[bar];
        } else {
            self.regs[index] = merged;
        }
    }
}

/// The emulated host: functions keyed by `(bus, devfn)`, plus access logs
/// for assertions about what the subsystem did (and did not) touch.
pub struct FakeHost {
    functions: Mutex<BTreeMap<(u8, u8), FakeFunction>>,
    failing: Mutex<Vec<(u8, u8)>>,
    reads: Mutex<Vec<(u8, u8, u16)>>,
    writes: Mutex<Vec<(u8, u8, u16)>>,
    map_offset: Mutex<Option<usize>>,
}

impl FakeHost {
    pub fn new() -> Arc<FakeHost> {
        Arc::new(FakeHost {
            functions: Mutex::new(BTreeMap::new()),
            failing: Mutex::new(Vec::new()),
            reads: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            map_offset: Mutex::new(None),
        })
    }

    pub fn add(&self, bus: u8, devfn: u8, function: FakeFunction) {
        self.functions.lock().insert((bus, devfn), function);
    }

    /// Makes every configuration cycle to `(bus, devfn)` fail, for backends
    /// that error on absent functions instead of floating the bus.
    pub fn fail_function(&self, bus: u8, devfn: u8) {
        self.failing.lock().push((bus, devfn));
    }

    /// Makes the `map` op translate bus addresses by `offset`.
    pub fn set_map_offset(&self, offset: usize) {
        *self.map_offset.lock() = Some(offset);
    }

    /// Every `(bus, devfn, offset)` read so far.
    pub fn reads(&self) -> Vec<(u8, u8, u16)> {
        self.reads.lock().clone()
    }

    /// How many writes hit `(bus, devfn, offset)`.
    pub fn writes_to(&self, bus: u8, devfn: u8, offset: u16) -> usize {
        self.writes
            .lock()
            .iter()
            .filter(|&&entry| entry == (bus, devfn, offset))
            .count()
    }

    pub fn byte(&self, bus: u8, devfn: u8, offset: u16) -> u8 {
        self.functions.lock()[&(bus, devfn)].read(offset, 1) as u8
    }

    pub fn word(&self, bus: u8, devfn: u8, offset: u16) -> u16 {
        self.functions.lock()[&(bus, devfn)].read(offset, 2) as u16
    }

    pub fn dword(&self, bus: u8, devfn: u8, offset: u16) -> u32 {
        self.functions.lock()[&(bus, devfn)].read(offset, 4)
    }
}

impl ConfigAccess for FakeHost {
    fn read(&self, bus: u8, devfn: u8, offset: u16, width: usize) -> Result<u32, Error> {
        self.reads.lock().push((bus, devfn, offset));

        if self.failing.lock().contains(&(bus, devfn)) {
            return Err(Error::BusError);
        }

        match self.functions.lock().get(&(bus, devfn)) {
            Some(function) => Ok(function.read(offset, width)),
            // Empty slot: decode as all-ones, like hardware without a
            // subtractive agent.
            None => Ok(0xffff_ffff),
        }
    }

    fn write(&self, bus: u8, devfn: u8, offset: u16, width: usize, value: u32) -> Result<(), Error> {
        self.writes.lock().push((bus, devfn, offset));

        if let Some(function) = self.functions.lock().get_mut(&(bus, devfn)) {
            function.write(offset, width, value);
        }

        Ok(())
    }

    fn map(&self, _bus: u8, start: u64, _end: u64) -> Option<usize> {
        self.map_offset.lock().map(|offset| start as usize + offset)
    }
}

/// Driver double recording its probe/remove traffic.
pub struct TestDriver {
    ids: Vec<DeviceId>,
    fail_probe: bool,
    probed: Mutex<Vec<u8>>,
    removed: Mutex<usize>,
}

impl TestDriver {
    pub fn new(ids: Vec<DeviceId>) -> Arc<TestDriver> {
        Arc::new(TestDriver {
            ids,
            fail_probe: false,
            probed: Mutex::new(Vec::new()),
            removed: Mutex::new(0),
        })
    }

    /// A driver whose probe always declines the device.
    pub fn failing(ids: Vec<DeviceId>) -> Arc<TestDriver> {
        Arc::new(TestDriver {
            ids,
            fail_probe: true,
            probed: Mutex::new(Vec::new()),
            removed: Mutex::new(0),
        })
    }

    pub fn probe_count(&self) -> usize {
        self.probed.lock().len()
    }

    pub fn remove_count(&self) -> usize {
        *self.removed.lock()
    }
}

impl PciDriver for TestDriver {
    fn id_table(&self) -> &[DeviceId] {
        &self.ids
    }

    fn probe(&self, dev: &Arc<PciDevice>) -> Result<(), Error> {
        self.probed.lock().push(dev.devfn());

        if self.fail_probe {
            Err(Error::NoSuchEntry)
        } else {
            Ok(())
        }
    }

    fn remove(&self, _dev: &Arc<PciDevice>) {
        *self.removed.lock() += 1;
    }
}
