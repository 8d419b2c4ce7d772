//! A-extension execution: AMOs and LR/SC.
//!
//! AMOs on RAM-backed pages are lock-free host atomics with sequentially
//! consistent ordering; an MMIO-only page is read-modified-written through a
//! bounce value and the device callbacks. The LR reservation records the
//! observed value so the SC can commit with a compare-and-swap, which makes
//! a successful SC linearizable against both other harts' SCs and their
//! plain stores.

use std::sync::atomic::{AtomicI32, AtomicI64, AtomicU32, AtomicU64, Ordering};

use crate::hart::{Hart, Reservation};
use crate::mmu::{self, RmwTarget};
use crate::trap::Exception;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AmoOp {
    Swap,
    Add,
    Xor,
    And,
    Or,
    Min,
    Max,
    MinU,
    MaxU,
}

impl AmoOp {
    fn from_funct5(funct5: u32) -> Option<Self> {
        Some(match funct5 {
            0x00 => AmoOp::Add,
            0x01 => AmoOp::Swap,
            0x04 => AmoOp::Xor,
            0x08 => AmoOp::Or,
            0x0c => AmoOp::And,
            0x10 => AmoOp::Min,
            0x14 => AmoOp::Max,
            0x18 => AmoOp::MinU,
            0x1c => AmoOp::MaxU,
            _ => return None,
        })
    }

    fn apply32(self, old: u32, val: u32) -> u32 {
        match self {
            AmoOp::Swap => val,
            AmoOp::Add => old.wrapping_add(val),
            AmoOp::Xor => old ^ val,
            AmoOp::And => old & val,
            AmoOp::Or => old | val,
            AmoOp::Min => (old as i32).min(val as i32) as u32,
            AmoOp::Max => (old as i32).max(val as i32) as u32,
            AmoOp::MinU => old.min(val),
            AmoOp::MaxU => old.max(val),
        }
    }

    fn apply64(self, old: u64, val: u64) -> u64 {
        match self {
            AmoOp::Swap => val,
            AmoOp::Add => old.wrapping_add(val),
            AmoOp::Xor => old ^ val,
            AmoOp::And => old & val,
            AmoOp::Or => old | val,
            AmoOp::Min => (old as i64).min(val as i64) as u64,
            AmoOp::Max => (old as i64).max(val as i64) as u64,
            AmoOp::MinU => old.min(val),
            AmoOp::MaxU => old.max(val),
        }
    }
}

/// The AMO opcode (0x2f) handler.
pub fn exec_amo(hart: &mut Hart, insn: u32) -> Result<(), Exception> {
    let rd = insn >> 7 & 0x1f;
    let rs1 = insn >> 15 & 0x1f;
    let rs2 = insn >> 20 & 0x1f;
    let funct3 = insn >> 12 & 7;
    let funct5 = insn >> 27;
    let addr = hart.virt_addr(hart.xregs.read(rs1));

    let width: u64 = match funct3 {
        0x2 => 4,
        0x3 if hart.rv64 => 8,
        _ => return Err(Exception::IllegalInstruction(insn as u64)),
    };
    // The A extension requires natural alignment; an aligned access can
    // never cross a page.
    if addr % width != 0 {
        return Err(match funct5 {
            0x02 => Exception::LoadAddressMisaligned(addr),
            _ => Exception::StoreAddressMisaligned(addr),
        });
    }

    match funct5 {
        0x02 => {
            // lr.w / lr.d
            if rs2 != 0 {
                return Err(Exception::IllegalInstruction(insn as u64));
            }
            let value = if width == 4 {
                let mut buf = [0u8; 4];
                mmu::load(hart, addr, &mut buf)?;
                u32::from_le_bytes(buf) as u64
            } else {
                let mut buf = [0u8; 8];
                mmu::load(hart, addr, &mut buf)?;
                u64::from_le_bytes(buf)
            };
            hart.reservation = Some(Reservation {
                addr,
                value,
                width: width as u8,
            });
            let result = if width == 4 {
                value as u32 as i32 as i64 as u64
            } else {
                value
            };
            hart.set_x(rd, result);
        }
        0x03 => {
            // sc.w / sc.d
            let new = hart.xregs.read(rs2);
            let failed = store_conditional(hart, addr, width, new)?;
            hart.set_x(rd, failed as u64);
        }
        _ => {
            let op = AmoOp::from_funct5(funct5)
                .ok_or(Exception::IllegalInstruction(insn as u64))?;
            let val = hart.xregs.read(rs2);
            let old = if width == 4 {
                amo32(hart, addr, op, val as u32)? as i32 as i64 as u64
            } else {
                amo64(hart, addr, op, val)?
            };
            hart.set_x(rd, old);
        }
    }
    Ok(())
}

fn amo32(hart: &mut Hart, addr: u64, op: AmoOp, val: u32) -> Result<u32, Exception> {
    match mmu::rmw_translate(hart, addr, 4)? {
        RmwTarget::Ptr(ptr) => {
            let old = unsafe {
                let atom = &*(ptr as *const AtomicU32);
                match op {
                    AmoOp::Swap => atom.swap(val, Ordering::SeqCst),
                    AmoOp::Add => atom.fetch_add(val, Ordering::SeqCst),
                    AmoOp::Xor => atom.fetch_xor(val, Ordering::SeqCst),
                    AmoOp::And => atom.fetch_and(val, Ordering::SeqCst),
                    AmoOp::Or => atom.fetch_or(val, Ordering::SeqCst),
                    AmoOp::MinU => atom.fetch_min(val, Ordering::SeqCst),
                    AmoOp::MaxU => atom.fetch_max(val, Ordering::SeqCst),
                    AmoOp::Min => (*(ptr as *const AtomicI32))
                        .fetch_min(val as i32, Ordering::SeqCst)
                        as u32,
                    AmoOp::Max => (*(ptr as *const AtomicI32))
                        .fetch_max(val as i32, Ordering::SeqCst)
                        as u32,
                }
            };
            Ok(old)
        }
        RmwTarget::Mmio(paddr) => {
            let mut buf = [0u8; 4];
            if !hart.machine.phys_read(paddr, &mut buf) {
                return Err(Exception::StoreAccessFault(addr));
            }
            let old = u32::from_le_bytes(buf);
            let new = op.apply32(old, val);
            if !hart.machine.phys_write(paddr, &new.to_le_bytes()) {
                return Err(Exception::StoreAccessFault(addr));
            }
            Ok(old)
        }
    }
}

fn amo64(hart: &mut Hart, addr: u64, op: AmoOp, val: u64) -> Result<u64, Exception> {
    match mmu::rmw_translate(hart, addr, 8)? {
        RmwTarget::Ptr(ptr) => {
            let old = unsafe {
                let atom = &*(ptr as *const AtomicU64);
                match op {
                    AmoOp::Swap => atom.swap(val, Ordering::SeqCst),
                    AmoOp::Add => atom.fetch_add(val, Ordering::SeqCst),
                    AmoOp::Xor => atom.fetch_xor(val, Ordering::SeqCst),
                    AmoOp::And => atom.fetch_and(val, Ordering::SeqCst),
                    AmoOp::Or => atom.fetch_or(val, Ordering::SeqCst),
                    AmoOp::MinU => atom.fetch_min(val, Ordering::SeqCst),
                    AmoOp::MaxU => atom.fetch_max(val, Ordering::SeqCst),
                    AmoOp::Min => (*(ptr as *const AtomicI64))
                        .fetch_min(val as i64, Ordering::SeqCst)
                        as u64,
                    AmoOp::Max => (*(ptr as *const AtomicI64))
                        .fetch_max(val as i64, Ordering::SeqCst)
                        as u64,
                }
            };
            Ok(old)
        }
        RmwTarget::Mmio(paddr) => {
            let mut buf = [0u8; 8];
            if !hart.machine.phys_read(paddr, &mut buf) {
                return Err(Exception::StoreAccessFault(addr));
            }
            let old = u64::from_le_bytes(buf);
            let new = op.apply64(old, val);
            if !hart.machine.phys_write(paddr, &new.to_le_bytes()) {
                return Err(Exception::StoreAccessFault(addr));
            }
            Ok(old)
        }
    }
}

/// SC: commit `new` iff the reservation matches and the memory still holds
/// the observed value. Returns 0 on success, 1 on failure; the reservation
/// is consumed either way.
fn store_conditional(hart: &mut Hart, addr: u64, width: u64, new: u64) -> Result<u32, Exception> {
    let reservation = hart.reservation.take();
    let Some(res) = reservation else {
        return Ok(1);
    };
    if res.addr != addr || res.width as u64 != width {
        return Ok(1);
    }
    match mmu::rmw_translate(hart, addr, width)? {
        RmwTarget::Ptr(ptr) => {
            let swapped = unsafe {
                if width == 4 {
                    (*(ptr as *const AtomicU32))
                        .compare_exchange(
                            res.value as u32,
                            new as u32,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                } else {
                    (*(ptr as *const AtomicU64))
                        .compare_exchange(res.value, new, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                }
            };
            Ok(!swapped as u32)
        }
        RmwTarget::Mmio(paddr) => {
            let mut buf = [0u8; 8];
            let buf = &mut buf[..width as usize];
            if !hart.machine.phys_read(paddr, buf) {
                return Err(Exception::StoreAccessFault(addr));
            }
            let current = if width == 4 {
                u32::from_le_bytes(buf[..4].try_into().unwrap()) as u64
            } else {
                u64::from_le_bytes(buf[..8].try_into().unwrap())
            };
            if current != res.value {
                return Ok(1);
            }
            let bytes = new.to_le_bytes();
            if !hart.machine.phys_write(paddr, &bytes[..width as usize]) {
                return Err(Exception::StoreAccessFault(addr));
            }
            Ok(0)
        }
    }
}
