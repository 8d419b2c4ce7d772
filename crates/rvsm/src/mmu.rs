//! Virtual-memory walker and the translated access paths.
//!
//! The walker implements SV32/SV39/SV48/SV57 (and Bare) with atomic
//! accessed/dirty updates: the desired PTE is committed with a compare-and-
//! swap so a concurrent update from another hart is never lost; on CAS
//! failure the same level is retried with the freshly loaded PTE.
//!
//! Successful translations are cached in the hart's TLB using the put policy
//! of the access class that was satisfied. Loads and stores that cross a
//! page boundary are split at the boundary and each half reports its own
//! faulting address.

use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, Ordering};

use crate::hart::Hart;
use crate::mem::{atomic_load_copy, atomic_store_copy, PAGE_MASK, PAGE_SHIFT, PAGE_SIZE};
use crate::trap::{Exception, PrivilegeMode};
use crate::csr::{MSTATUS_MPP_SHIFT, MSTATUS_MPRV, MSTATUS_MXR, MSTATUS_SUM};

// Page-table entry bits.
pub const PTE_V: u64 = 1 << 0;
pub const PTE_R: u64 = 1 << 1;
pub const PTE_W: u64 = 1 << 2;
pub const PTE_X: u64 = 1 << 3;
pub const PTE_U: u64 = 1 << 4;
pub const PTE_A: u64 = 1 << 6;
pub const PTE_D: u64 = 1 << 7;

/// Address-translation scheme selected by satp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuMode {
    Bare,
    Sv32,
    Sv39,
    Sv48,
    Sv57,
}

impl MmuMode {
    /// Page-table depth.
    pub fn levels(self) -> u32 {
        match self {
            MmuMode::Bare => 0,
            MmuMode::Sv32 => 2,
            MmuMode::Sv39 => 3,
            MmuMode::Sv48 => 4,
            MmuMode::Sv57 => 5,
        }
    }

    /// Decode a satp MODE field for the current XLEN. None means the mode
    /// is unsupported and the write must be ignored.
    pub fn from_satp(rv64: bool, mode: u64) -> Option<Self> {
        match (rv64, mode) {
            (_, 0) => Some(MmuMode::Bare),
            (false, 1) => Some(MmuMode::Sv32),
            (true, 8) => Some(MmuMode::Sv39),
            (true, 9) => Some(MmuMode::Sv48),
            (true, 10) => Some(MmuMode::Sv57),
            _ => None,
        }
    }

    /// The satp MODE encoding of this scheme.
    pub fn satp_bits(self) -> u64 {
        match self {
            MmuMode::Bare => 0,
            MmuMode::Sv32 => 1,
            MmuMode::Sv39 => 8,
            MmuMode::Sv48 => 9,
            MmuMode::Sv57 => 10,
        }
    }
}

/// The access class a translation is asked to satisfy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemAccess {
    Read,
    Write,
    Exec,
}

fn page_fault(access: MemAccess, vaddr: u64) -> Exception {
    match access {
        MemAccess::Read => Exception::LoadPageFault(vaddr),
        MemAccess::Write => Exception::StorePageFault(vaddr),
        MemAccess::Exec => Exception::InstructionPageFault(vaddr),
    }
}

fn access_fault(access: MemAccess, vaddr: u64) -> Exception {
    match access {
        MemAccess::Read => Exception::LoadAccessFault(vaddr),
        MemAccess::Write => Exception::StoreAccessFault(vaddr),
        MemAccess::Exec => Exception::InstructionAccessFault(vaddr),
    }
}

/// Translate one virtual address to a physical address.
///
/// `no_prot` skips the U/S and permission checks (debug access);
/// `update_ad` controls the accessed/dirty commit and is off for debug
/// walks so inspection has no architectural side effects.
pub fn walk(
    hart: &Hart,
    vaddr: u64,
    access: MemAccess,
    no_prot: bool,
    update_ad: bool,
) -> Result<u64, Exception> {
    let mstatus = hart.csr.mstatus;
    let mut privilege = hart.privilege;
    if access != MemAccess::Exec && mstatus & MSTATUS_MPRV != 0 {
        privilege = PrivilegeMode::from_bits(mstatus >> MSTATUS_MPP_SHIFT);
    }
    if privilege == PrivilegeMode::Machine || hart.mmu_mode == MmuMode::Bare {
        return Ok(vaddr);
    }

    let mode = hart.mmu_mode;
    let levels = mode.levels();
    let pte_size: u64 = if mode == MmuMode::Sv32 { 4 } else { 8 };
    let index_bits: u32 = if mode == MmuMode::Sv32 { 10 } else { 9 };

    // The virtual address must equal the sign-extension of its low
    // `levels * index_bits + 12` bits (no check for SV32: every 32-bit
    // address is canonical).
    if mode != MmuMode::Sv32 {
        let va_bits = levels * index_bits + PAGE_SHIFT;
        let canonical = (vaddr as i64) << (64 - va_bits) >> (64 - va_bits);
        if canonical != vaddr as i64 {
            return Err(page_fault(access, vaddr));
        }
    }

    let mut table = hart.mmu_root;
    let mut level = levels as i32 - 1;
    loop {
        let index = vaddr >> (PAGE_SHIFT + level as u32 * index_bits) & ((1 << index_bits) - 1);
        let pte_addr = table + index * pte_size;
        let pte = match load_pte(hart, pte_addr, pte_size) {
            Some(pte) => pte,
            None => return Err(access_fault(access, vaddr)),
        };

        if pte & PTE_V == 0 || pte & PTE_R == 0 && pte & PTE_W != 0 {
            return Err(page_fault(access, vaddr));
        }

        if pte & (PTE_R | PTE_W | PTE_X) == 0 {
            // Pointer to the next level.
            level -= 1;
            if level < 0 {
                return Err(page_fault(access, vaddr));
            }
            table = (pte >> 10 & 0xfff_ffff_ffff) << PAGE_SHIFT;
            continue;
        }

        // Leaf PTE.
        if !no_prot {
            match privilege {
                PrivilegeMode::User => {
                    if pte & PTE_U == 0 {
                        return Err(page_fault(access, vaddr));
                    }
                }
                PrivilegeMode::Supervisor => {
                    if pte & PTE_U != 0
                        && (mstatus & MSTATUS_SUM == 0 || access == MemAccess::Exec)
                    {
                        return Err(page_fault(access, vaddr));
                    }
                }
                PrivilegeMode::Machine => {}
            }
            let allowed = match access {
                MemAccess::Read => {
                    pte & PTE_R != 0 || mstatus & MSTATUS_MXR != 0 && pte & PTE_X != 0
                }
                MemAccess::Write => pte & PTE_W != 0,
                MemAccess::Exec => pte & PTE_X != 0,
            };
            if !allowed {
                return Err(page_fault(access, vaddr));
            }
        }

        // A superpage must be naturally aligned: the low PPN fields of a
        // leaf above level 0 must be zero.
        if level > 0 && (pte >> 10) & ((1 << (level as u32 * index_bits)) - 1) != 0 {
            return Err(page_fault(access, vaddr));
        }

        if update_ad {
            let desired = pte
                | PTE_A
                | if access == MemAccess::Write { PTE_D } else { 0 };
            if desired != pte && !commit_pte(hart, pte_addr, pte_size, pte, desired) {
                // Another hart changed the entry under us; retry this level.
                continue;
            }
        }

        let span = (1u64 << (PAGE_SHIFT + level as u32 * index_bits)) - 1;
        let ppn = if mode == MmuMode::Sv32 {
            (pte >> 10) & 0x3f_ffff
        } else {
            (pte >> 10) & 0xfff_ffff_ffff
        };
        return Ok((ppn << PAGE_SHIFT) & !span | vaddr & span);
    }
}

/// Load a PTE through the physical fabric (RAM, then MMIO).
fn load_pte(hart: &Hart, pte_addr: u64, pte_size: u64) -> Option<u64> {
    if pte_size == 4 {
        let mut buf = [0u8; 4];
        hart.machine
            .phys_read(pte_addr, &mut buf)
            .then(|| u32::from_le_bytes(buf) as u64)
    } else {
        let mut buf = [0u8; 8];
        hart.machine
            .phys_read(pte_addr, &mut buf)
            .then(|| u64::from_le_bytes(buf))
    }
}

/// Commit an A/D update. RAM-resident PTEs go through a compare-and-swap;
/// the rare MMIO-resident table falls back to a plain device write.
fn commit_pte(hart: &Hart, pte_addr: u64, pte_size: u64, old: u64, new: u64) -> bool {
    match hart.machine.ram.translate_phys(pte_addr, pte_size) {
        Some(ptr) if pte_size == 8 => unsafe {
            (*(ptr as *const AtomicU64))
                .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        },
        Some(ptr) => unsafe {
            (*(ptr as *const AtomicU32))
                .compare_exchange(old as u32, new as u32, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        },
        None => {
            let buf = new.to_le_bytes();
            hart.machine.phys_write(pte_addr, &buf[..pte_size as usize])
        }
    }
}

/// Debug translation: no traps, no protection checks, no A/D side effects.
pub fn translate_debug(hart: &Hart, vaddr: u64, access: MemAccess) -> Option<u64> {
    walk(hart, vaddr, access, true, false).ok()
}

/// Fetch one instruction parcel. The two halves of a straddling 32-bit
/// instruction are fetched independently by the dispatcher, so this never
/// crosses a page.
pub fn fetch_u16(hart: &mut Hart, vaddr: u64) -> Result<u16, Exception> {
    if let Some(ptr) = hart.tlb.lookup_exec(vaddr) {
        return Ok(unsafe { (*(ptr as *const AtomicU16)).load(Ordering::Relaxed) });
    }
    let paddr = walk(hart, vaddr, MemAccess::Exec, false, true)?;
    // Only RAM-backed pages are cached for execution; anything else falls
    // through to the walker on every fetch.
    if let Some(ptr) = hart
        .machine
        .ram
        .translate_phys(paddr & !PAGE_MASK, PAGE_SIZE)
    {
        let ptr = unsafe { ptr.add((vaddr & PAGE_MASK) as usize) };
        hart.tlb.put_exec(vaddr, ptr);
        return Ok(unsafe { (*(ptr as *const AtomicU16)).load(Ordering::Relaxed) });
    }
    let mut buf = [0u8; 2];
    if hart.machine.phys_read(paddr, &mut buf) {
        Ok(u16::from_le_bytes(buf))
    } else {
        Err(Exception::InstructionAccessFault(vaddr))
    }
}

/// Translated load. Misaligned accesses are accepted; one that crosses a
/// page boundary is split into two walks at the boundary.
pub fn load(hart: &mut Hart, vaddr: u64, buf: &mut [u8]) -> Result<(), Exception> {
    let left = PAGE_SIZE - (vaddr & PAGE_MASK);
    if (buf.len() as u64) > left {
        let (a, b) = buf.split_at_mut(left as usize);
        load_page(hart, vaddr, a)?;
        let next = hart.virt_addr(vaddr.wrapping_add(left));
        return load_page(hart, next, b);
    }
    load_page(hart, vaddr, buf)
}

fn load_page(hart: &mut Hart, vaddr: u64, buf: &mut [u8]) -> Result<(), Exception> {
    if let Some(ptr) = hart.tlb.lookup_read(vaddr) {
        unsafe { atomic_load_copy(ptr, buf) };
        return Ok(());
    }
    let paddr = walk(hart, vaddr, MemAccess::Read, false, true)?;
    if let Some(page_ptr) = hart.machine.host_page_ptr(paddr) {
        let ptr = unsafe { page_ptr.add((vaddr & PAGE_MASK) as usize) };
        hart.tlb.put_read(vaddr, ptr);
        unsafe { atomic_load_copy(ptr, buf) };
        return Ok(());
    }
    if hart.machine.phys_read(paddr, buf) {
        Ok(())
    } else {
        Err(Exception::LoadAccessFault(vaddr))
    }
}

/// Translated store. Clears any LR reservation, invalidates compiled code
/// covering the target page, and splits at page boundaries like [`load`].
pub fn store(hart: &mut Hart, vaddr: u64, buf: &[u8]) -> Result<(), Exception> {
    hart.reservation = None;
    let left = PAGE_SIZE - (vaddr & PAGE_MASK);
    if (buf.len() as u64) > left {
        let (a, b) = buf.split_at(left as usize);
        store_page(hart, vaddr, a)?;
        let next = hart.virt_addr(vaddr.wrapping_add(left));
        return store_page(hart, next, b);
    }
    store_page(hart, vaddr, buf)
}

fn store_page(hart: &mut Hart, vaddr: u64, buf: &[u8]) -> Result<(), Exception> {
    if let Some(ptr) = hart.tlb.lookup_write(vaddr) {
        unsafe { atomic_store_copy(ptr, buf) };
        return Ok(());
    }
    let paddr = walk(hart, vaddr, MemAccess::Write, false, true)?;
    hart.machine.jit.invalidate_page(paddr);
    if let Some(ptr) = hart.machine.ram.translate_phys(paddr, buf.len() as u64) {
        hart.tlb.put_write(vaddr, ptr);
        unsafe { atomic_store_copy(ptr, buf) };
        return Ok(());
    }
    if !hart.machine.phys_write(paddr, buf) {
        return Err(Exception::StoreAccessFault(vaddr));
    }
    // A directly mapped region is cached after the callback has seen the
    // write, so later stores can go straight to the mapping.
    if let Some(page_ptr) = hart.machine.host_page_ptr(paddr) {
        let ptr = unsafe { page_ptr.add((vaddr & PAGE_MASK) as usize) };
        hart.tlb.put_write(vaddr, ptr);
    }
    Ok(())
}

/// Where a read-modify-write access landed.
pub enum RmwTarget {
    /// Host pointer into RAM or a mapped region; RMW with host atomics.
    Ptr(*mut u8),
    /// MMIO-only page; RMW through a bounce buffer and device callbacks.
    Mmio(u64),
}

/// Translate for an atomic read-modify-write. The caller has verified
/// natural alignment, so the access never crosses a page.
pub fn rmw_translate(hart: &mut Hart, vaddr: u64, len: u64) -> Result<RmwTarget, Exception> {
    if let Some(ptr) = hart.tlb.lookup_write(vaddr) {
        return Ok(RmwTarget::Ptr(ptr));
    }
    let paddr = walk(hart, vaddr, MemAccess::Write, false, true)?;
    hart.machine.jit.invalidate_page(paddr);
    if let Some(ptr) = hart.machine.ram.translate_phys(paddr, len) {
        hart.tlb.put_write(vaddr, ptr);
        return Ok(RmwTarget::Ptr(ptr));
    }
    Ok(RmwTarget::Mmio(paddr))
}
