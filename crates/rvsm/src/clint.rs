//! Core-local interrupt device (MSWI + MTIMER).
//!
//! One MMIO region with two sub-regions: a word of software-interrupt state
//! per hart, and the per-hart `mtimecmp` array plus the machine-wide `mtime`
//! at the conventional offsets. Writes that arm or disarm a timer wake the
//! affected hart so a WFI sleep recomputes its deadline.
//!
//! All register accesses are 4- or 8-byte aligned; the bus realign layer
//! guarantees this via the declared op-size bounds.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::bus::{MmioDevice, MmioRegion};
use crate::hart::HartShared;
use crate::machine::MachineTimer;
use crate::trap::Interrupt;

/// Conventional base of the core-local interrupt block.
pub const CLINT_BASE: u64 = 0x0200_0000;
/// Size of the block.
pub const CLINT_SIZE: u64 = 0x10000;

const MSWI_BASE: u64 = 0x0;
const MTIMECMP_BASE: u64 = 0x4000;
const MTIME_OFFSET: u64 = 0xbff8;

/// The core-local timer / software-interrupt device.
pub struct Clint {
    harts: Vec<Arc<HartShared>>,
    timer: Arc<MachineTimer>,
}

impl Clint {
    pub fn new(harts: Vec<Arc<HartShared>>, timer: Arc<MachineTimer>) -> Self {
        Self { harts, timer }
    }

    /// The region descriptor this device is attached under.
    pub fn region(self: Arc<Self>) -> MmioRegion {
        MmioRegion::new(CLINT_BASE, CLINT_SIZE, 4, 8, self)
    }

    /// Drive a hart's MTIP from its `mtimecmp`, waking WFI on a rising edge.
    fn refresh_mtimer(&self, shared: &HartShared, now: u64) {
        if now >= shared.mtimecmp.load(Ordering::Relaxed) {
            shared.raise_irq(Interrupt::MachineTimer as u32);
        } else {
            shared.lower_irq(Interrupt::MachineTimer as u32);
        }
    }

    /// Drive a hart's STIP from its `stimecmp`. The all-ones reset value
    /// means "not armed" and leaves STIP to software.
    fn refresh_stimer(&self, shared: &HartShared, now: u64) {
        let stimecmp = shared.stimecmp.load(Ordering::Relaxed);
        if stimecmp == u64::MAX {
            return;
        }
        if now >= stimecmp {
            shared.raise_irq(Interrupt::SupervisorTimer as u32);
        } else {
            shared.lower_irq(Interrupt::SupervisorTimer as u32);
        }
    }
}

impl MmioDevice for Clint {
    fn read(&self, offset: u64, dst: &mut [u8]) -> bool {
        let value: u64 = if offset >= MTIME_OFFSET && offset < MTIME_OFFSET + 8 {
            let shift = (offset - MTIME_OFFSET) * 8;
            self.timer.now() >> shift
        } else if (MTIMECMP_BASE..MTIME_OFFSET).contains(&offset) {
            let hart = ((offset - MTIMECMP_BASE) / 8) as usize;
            let Some(shared) = self.harts.get(hart) else {
                return false;
            };
            let shift = (offset - MTIMECMP_BASE) % 8 * 8;
            shared.mtimecmp.load(Ordering::Relaxed) >> shift
        } else if offset < MTIMECMP_BASE {
            let hart = ((offset - MSWI_BASE) / 4) as usize;
            let Some(shared) = self.harts.get(hart) else {
                return false;
            };
            let msip = shared.irq_pending() >> Interrupt::MachineSoftware as u32 & 1;
            if dst.len() == 8 {
                return false;
            }
            msip
        } else {
            return false;
        };
        match dst.len() {
            4 => dst.copy_from_slice(&(value as u32).to_le_bytes()),
            8 => dst.copy_from_slice(&value.to_le_bytes()),
            _ => return false,
        }
        true
    }

    fn write(&self, offset: u64, src: &[u8]) -> bool {
        let value: u64 = match src.len() {
            4 => u32::from_le_bytes(src.try_into().unwrap()) as u64,
            8 => u64::from_le_bytes(src.try_into().unwrap()),
            _ => return false,
        };
        if offset >= MTIME_OFFSET && offset < MTIME_OFFSET + 8 {
            let new = match (src.len(), offset - MTIME_OFFSET) {
                (8, 0) => value,
                (4, 0) => self.timer.now() & !0xffff_ffff | value,
                (4, 4) => self.timer.now() & 0xffff_ffff | value << 32,
                _ => return false,
            };
            self.timer.rebase(new);
            let now = self.timer.now();
            for shared in &self.harts {
                self.refresh_mtimer(shared, now);
                self.refresh_stimer(shared, now);
            }
            true
        } else if (MTIMECMP_BASE..MTIME_OFFSET).contains(&offset) {
            let hart = ((offset - MTIMECMP_BASE) / 8) as usize;
            let Some(shared) = self.harts.get(hart) else {
                return false;
            };
            let old = shared.mtimecmp.load(Ordering::Relaxed);
            let new = match (src.len(), offset - MTIMECMP_BASE) {
                (8, o) if o % 8 == 0 => value,
                (4, o) if o % 8 == 0 => old & !0xffff_ffff | value,
                (4, o) if o % 8 == 4 => old & 0xffff_ffff | value << 32,
                _ => return false,
            };
            shared.mtimecmp.store(new, Ordering::Relaxed);
            self.refresh_mtimer(shared, self.timer.now());
            // Wake the hart even on a disarming write so a WFI sleep picks
            // up the new deadline.
            shared.kick();
            true
        } else if offset < MTIMECMP_BASE {
            let hart = ((offset - MSWI_BASE) / 4) as usize;
            let Some(shared) = self.harts.get(hart) else {
                return false;
            };
            if src.len() != 4 {
                return false;
            }
            if value & 1 != 0 {
                shared.raise_irq(Interrupt::MachineSoftware as u32);
            } else {
                shared.lower_irq(Interrupt::MachineSoftware as u32);
            }
            true
        } else {
            false
        }
    }

    fn update(&self) {
        let now = self.timer.now();
        for shared in &self.harts {
            self.refresh_mtimer(shared, now);
            self.refresh_stimer(shared, now);
        }
    }

    fn reset(&self) {
        for shared in &self.harts {
            shared.mtimecmp.store(u64::MAX, Ordering::Relaxed);
            shared.stimecmp.store(u64::MAX, Ordering::Relaxed);
            shared.lower_irq(Interrupt::MachineSoftware as u32);
            shared.lower_irq(Interrupt::MachineTimer as u32);
            shared.lower_irq(Interrupt::SupervisorTimer as u32);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trap::{IRQ_MSIP, IRQ_MTIP};

    fn fixture() -> (Arc<Clint>, Arc<HartShared>, Arc<MachineTimer>) {
        let shared = Arc::new(HartShared::new());
        let timer = Arc::new(MachineTimer::new(10_000_000));
        let clint = Arc::new(Clint::new(vec![shared.clone()], timer.clone()));
        (clint, shared, timer)
    }

    #[test]
    fn msip_write_raises_software_interrupt() {
        let (clint, shared, _) = fixture();
        assert!(clint.write(0, &1u32.to_le_bytes()));
        assert_ne!(shared.irq_pending() & IRQ_MSIP, 0);
        let mut buf = [0u8; 4];
        assert!(clint.read(0, &mut buf));
        assert_eq!(u32::from_le_bytes(buf), 1);
        assert!(clint.write(0, &0u32.to_le_bytes()));
        assert_eq!(shared.irq_pending() & IRQ_MSIP, 0);
    }

    #[test]
    fn mtimecmp_in_the_past_fires_immediately() {
        let (clint, shared, _) = fixture();
        assert!(clint.write(0x4000, &0u64.to_le_bytes()));
        assert_ne!(shared.irq_pending() & IRQ_MTIP, 0);
        assert!(clint.write(0x4000, &u64::MAX.to_le_bytes()));
        assert_eq!(shared.irq_pending() & IRQ_MTIP, 0);
    }

    #[test]
    fn mtime_rebases() {
        let (clint, _, timer) = fixture();
        assert!(clint.write(MTIME_OFFSET, &0x1234_5678_9abc_u64.to_le_bytes()));
        let now = timer.now();
        assert!(now >= 0x1234_5678_9abc);
        let mut buf = [0u8; 8];
        assert!(clint.read(MTIME_OFFSET, &mut buf));
        assert!(u64::from_le_bytes(buf) >= 0x1234_5678_9abc);
    }

    #[test]
    fn halfword_mtimecmp_writes_merge() {
        let (clint, shared, _) = fixture();
        assert!(clint.write(0x4000, &0xffff_ffffu32.to_le_bytes()));
        assert!(clint.write(0x4004, &0x1u32.to_le_bytes()));
        assert_eq!(shared.mtimecmp.load(Ordering::Relaxed), 0x1_ffff_ffff);
    }

    #[test]
    fn out_of_range_hart_faults() {
        let (clint, _, _) = fixture();
        let mut buf = [0u8; 4];
        assert!(!clint.read(4, &mut buf));
        assert!(!clint.write(0x4008, &0u64.to_le_bytes()));
    }
}
