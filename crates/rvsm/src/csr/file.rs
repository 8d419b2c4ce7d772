//! The CSR register file and per-CSR access semantics.
//!
//! All guest CSR traffic funnels through [`csr_op`]: privilege and
//! read-only checks first, then a per-register match that applies WARL
//! masks, gating (counter enables, Sstc, FS, seed policy) and side effects
//! (TLB flushes, interrupt re-checks, timer arming). On RV32 every
//! successful read is sign-extended from bit 31.

use std::sync::atomic::Ordering;

use crate::csr::*;
use crate::hart::Hart;
use crate::mmu::MmuMode;
use crate::trap::{Exception, Interrupt, PrivilegeMode, IRQ_MEIP, IRQ_MSIP, IRQ_MTIP, IRQ_SEIP, IRQ_SSIP, IRQ_STIP};

/// The three CSR access shapes of Zicsr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrOp {
    Swap,
    SetBits,
    ClearBits,
}

/// Backing storage for one hart's CSRs.
///
/// Pending-interrupt bits live in the hart's shared state, not here;
/// `mip`/`sip` reads OR them in on the fly.
pub struct CsrFile {
    pub mstatus: u64,
    pub medeleg: u64,
    pub mideleg: u64,
    pub mie: u64,
    pub mtvec: u64,
    pub mcounteren: u32,
    pub mscratch: u64,
    pub mepc: u64,
    pub mcause: u64,
    pub mtval: u64,
    pub menvcfg: u64,
    pub mseccfg: u64,
    pub miselect: u64,
    pub stvec: u64,
    pub scounteren: u32,
    pub senvcfg: u64,
    pub sscratch: u64,
    pub sepc: u64,
    pub scause: u64,
    pub stval: u64,
    pub siselect: u64,
    /// Raw satp value; the decoded mode/root live on the hart.
    pub satp: u64,
    /// frm in bits 7:5, fflags in bits 4:0.
    pub fcsr: u32,
    /// Implemented extension bits of misa (MXL is derived from the hart).
    pub misa_ext: u64,
    // AIA external-interrupt arrays behind the indirect windows.
    pub m_eip: [u64; EI_WORDS],
    pub m_eie: [u64; EI_WORDS],
    pub s_eip: [u64; EI_WORDS],
    pub s_eie: [u64; EI_WORDS],
}

impl CsrFile {
    pub fn new(rv64: bool) -> Self {
        let mut mstatus = 0;
        if rv64 {
            // UXL/SXL are WARL fields pinned to the one supported value.
            mstatus |= 2 << MSTATUS_UXL_SHIFT | 2 << MSTATUS_SXL_SHIFT;
        }
        Self {
            mstatus,
            medeleg: 0,
            mideleg: 0,
            mie: 0,
            mtvec: 0,
            mcounteren: 0,
            mscratch: 0,
            mepc: 0,
            mcause: 0,
            mtval: 0,
            menvcfg: 0,
            mseccfg: 0,
            miselect: 0,
            stvec: 0,
            scounteren: 0,
            senvcfg: 0,
            sscratch: 0,
            sepc: 0,
            scause: 0,
            stval: 0,
            siselect: 0,
            satp: 0,
            fcsr: 0,
            misa_ext: MISA_A | MISA_C | MISA_D | MISA_F | MISA_I | MISA_M | MISA_S | MISA_U,
            m_eip: [0; EI_WORDS],
            m_eie: [0; EI_WORDS],
            s_eip: [0; EI_WORDS],
            s_eie: [0; EI_WORDS],
        }
    }

    /// Mark the FPU state dirty (any FP register or fcsr write).
    pub fn set_fs_dirty(&mut self) {
        self.mstatus |= FS_DIRTY << MSTATUS_FS_SHIFT;
    }

    /// Current FS field.
    pub fn fs(&self) -> u64 {
        self.mstatus >> MSTATUS_FS_SHIFT & 3
    }
}

/// Perform one CSR operation and return the previous value.
///
/// Denied accesses and unimplemented registers surface as illegal
/// instruction; the caller substitutes the instruction bits as tval.
pub fn csr_op(hart: &mut Hart, addr: CsrAddress, op: CsrOp, value: u64) -> Result<u64, Exception> {
    let illegal = || Exception::IllegalInstruction(0);
    if hart.privilege.bits() < csr_privilege(addr) {
        return Err(illegal());
    }
    // Set/clear with a zero operand performs no write, which is the only
    // shape the read-only space accepts.
    let writes = op == CsrOp::Swap || value != 0;
    if writes && csr_read_only(addr) {
        return Err(illegal());
    }
    let old = csr_read(hart, addr)?;
    if writes {
        let new = match op {
            CsrOp::Swap => value,
            CsrOp::SetBits => old | value,
            CsrOp::ClearBits => old & !value,
        };
        csr_write(hart, addr, new)?;
    }
    Ok(hart.to_xlen(old))
}

fn require_fpu(hart: &Hart) -> Result<(), Exception> {
    if hart.csr.fs() == FS_OFF {
        Err(Exception::IllegalInstruction(0))
    } else {
        Ok(())
    }
}

/// Counter visibility below M-mode walks the mcounteren/scounteren chain.
fn counter_allowed(hart: &Hart, bit: u32) -> bool {
    match hart.privilege {
        PrivilegeMode::Machine => true,
        PrivilegeMode::Supervisor => hart.csr.mcounteren & bit != 0,
        PrivilegeMode::User => {
            hart.csr.mcounteren & bit != 0 && hart.csr.scounteren & bit != 0
        }
    }
}

/// Sstc gate: stimecmp is always visible from M, and from S only when
/// menvcfg.STCE is set.
fn stimecmp_allowed(hart: &Hart) -> bool {
    hart.privilege == PrivilegeMode::Machine || hart.csr.menvcfg & ENVCFG_STCE != 0
}

fn satp_guarded(hart: &Hart) -> Result<(), Exception> {
    if hart.privilege == PrivilegeMode::Supervisor && hart.csr.mstatus & MSTATUS_TVM != 0 {
        Err(Exception::IllegalInstruction(0))
    } else {
        Ok(())
    }
}

/// The composite SD bit: set while FS reports dirty state.
fn status_sd(hart: &Hart) -> u64 {
    if hart.csr.fs() == FS_DIRTY {
        if hart.rv64 {
            1 << 63
        } else {
            1 << 31
        }
    } else {
        0
    }
}

fn mip_value(hart: &Hart) -> u64 {
    hart.shared.irq_pending()
}

fn csr_read(hart: &mut Hart, addr: CsrAddress) -> Result<u64, Exception> {
    let illegal = || Exception::IllegalInstruction(0);
    let value = match addr {
        FFLAGS => {
            require_fpu(hart)?;
            (hart.csr.fcsr & 0x1f) as u64
        }
        FRM => {
            require_fpu(hart)?;
            (hart.csr.fcsr >> 5 & 7) as u64
        }
        FCSR => {
            require_fpu(hart)?;
            (hart.csr.fcsr & 0xff) as u64
        }
        SEED => seed_read(hart)?,

        CYCLE => gated_zero(hart, COUNTEREN_CY)?,
        INSTRET => gated_zero(hart, COUNTEREN_IR)?,
        HPMCOUNTER3..=HPMCOUNTER31 => gated_zero(hart, 0)?,
        TIME => {
            if !counter_allowed(hart, COUNTEREN_TM) {
                return Err(illegal());
            }
            hart.machine.timer.now()
        }
        CYCLEH..=HPMCOUNTER31H if hart.rv64 => return Err(illegal()),
        CYCLEH => gated_zero(hart, COUNTEREN_CY)?,
        INSTRETH => gated_zero(hart, COUNTEREN_IR)?,
        0xc83..=HPMCOUNTER31H => gated_zero(hart, 0)?,
        TIMEH => {
            if !counter_allowed(hart, COUNTEREN_TM) {
                return Err(illegal());
            }
            hart.machine.timer.now() >> 32
        }

        SSTATUS => hart.csr.mstatus & SSTATUS_MASK & !(1 << 63) | status_sd(hart),
        SIE => hart.csr.mie & hart.csr.mideleg,
        SIP => mip_value(hart) & hart.csr.mideleg,
        STVEC => hart.csr.stvec,
        SCOUNTEREN => hart.csr.scounteren as u64,
        SENVCFG => hart.csr.senvcfg,
        SSCRATCH => hart.csr.sscratch,
        SEPC => hart.csr.sepc & !1,
        SCAUSE => hart.csr.scause,
        STVAL => hart.csr.stval,
        STIMECMP => {
            if !stimecmp_allowed(hart) {
                return Err(illegal());
            }
            hart.shared.stimecmp.load(Ordering::Relaxed)
        }
        STIMECMPH => {
            if hart.rv64 || !stimecmp_allowed(hart) {
                return Err(illegal());
            }
            hart.shared.stimecmp.load(Ordering::Relaxed) >> 32
        }
        SISELECT => hart.csr.siselect,
        SIREG => ireg_read(hart, false)?,
        SATP => {
            satp_guarded(hart)?;
            hart.csr.satp
        }

        MSTATUS => hart.csr.mstatus & !(1 << 63) | status_sd(hart),
        MSTATUSH => {
            if hart.rv64 {
                return Err(illegal());
            }
            0
        }
        MISA => {
            let mxl = if hart.rv64 { 2u64 << 62 } else { 1 << 30 };
            mxl | hart.csr.misa_ext
        }
        MEDELEG => hart.csr.medeleg,
        MIDELEG => hart.csr.mideleg,
        MIE => hart.csr.mie,
        MTVEC => hart.csr.mtvec,
        MCOUNTEREN => hart.csr.mcounteren as u64,
        MENVCFG => hart.csr.menvcfg,
        MENVCFGH => {
            if hart.rv64 {
                return Err(illegal());
            }
            hart.csr.menvcfg >> 32
        }
        MCOUNTINHIBIT | MHPMEVENT3..=MHPMEVENT31 => 0,
        MSCRATCH => hart.csr.mscratch,
        MEPC => hart.csr.mepc & !1,
        MCAUSE => hart.csr.mcause,
        MTVAL => hart.csr.mtval,
        MIP => mip_value(hart),
        MISELECT => hart.csr.miselect,
        MIREG => ireg_read(hart, true)?,
        MSECCFG => hart.csr.mseccfg,
        MSECCFGH => {
            if hart.rv64 {
                return Err(illegal());
            }
            hart.csr.mseccfg >> 32
        }
        MCYCLE | MINSTRET | MHPMCOUNTER3..=MHPMCOUNTER31 => 0,
        MVENDORID | MARCHID | MIMPID => 0,
        MHARTID => hart.hart_id as u64,

        _ => return Err(illegal()),
    };
    Ok(value)
}

fn gated_zero(hart: &Hart, bit: u32) -> Result<u64, Exception> {
    // Counters are hard-wired zero; the visibility gate still applies so a
    // guest kernel can hide them from userland.
    if bit != 0 && !counter_allowed(hart, bit) {
        return Err(Exception::IllegalInstruction(0));
    }
    Ok(0)
}

fn csr_write(hart: &mut Hart, addr: CsrAddress, value: u64) -> Result<(), Exception> {
    let illegal = || Exception::IllegalInstruction(0);
    match addr {
        FFLAGS => {
            require_fpu(hart)?;
            hart.csr.fcsr = hart.csr.fcsr & !0x1f | value as u32 & 0x1f;
            hart.csr.set_fs_dirty();
        }
        FRM => {
            require_fpu(hart)?;
            hart.csr.fcsr = hart.csr.fcsr & !0xe0 | (value as u32 & 7) << 5;
            hart.csr.set_fs_dirty();
        }
        FCSR => {
            require_fpu(hart)?;
            hart.csr.fcsr = value as u32 & 0xff;
            hart.csr.set_fs_dirty();
        }
        SEED => {
            // Writes are accepted (polling wipes the register) and ignored.
            seed_read(hart)?;
        }

        SSTATUS => {
            let merged =
                hart.csr.mstatus & !SSTATUS_WRITE_MASK | value & SSTATUS_WRITE_MASK;
            mstatus_write(hart, merged, MSTATUS_WRITE_MASK);
        }
        SIE => {
            let mideleg = hart.csr.mideleg;
            hart.csr.mie = hart.csr.mie & !mideleg | value & mideleg;
            hart.restart_dispatch();
        }
        SIP => {
            // Only the software bit is writable from S-mode, and only when
            // delegated.
            let mask = IRQ_SSIP & hart.csr.mideleg;
            set_pending_bits(hart, mask, value);
        }
        STVEC => hart.csr.stvec = hart.virt_addr(value),
        SCOUNTEREN => hart.csr.scounteren = value as u32 & 7,
        SENVCFG => {
            hart.csr.senvcfg = value & (ENVCFG_CBIE | ENVCFG_CBCFE | ENVCFG_CBZE)
        }
        SSCRATCH => hart.csr.sscratch = hart.virt_addr(value),
        SEPC => hart.csr.sepc = hart.virt_addr(value),
        SCAUSE => hart.csr.scause = hart.virt_addr(value),
        STVAL => hart.csr.stval = hart.virt_addr(value),
        STIMECMP => {
            if !stimecmp_allowed(hart) {
                return Err(illegal());
            }
            stimecmp_write(hart, value);
        }
        STIMECMPH => {
            if hart.rv64 || !stimecmp_allowed(hart) {
                return Err(illegal());
            }
            let low = hart.shared.stimecmp.load(Ordering::Relaxed) & 0xffff_ffff;
            stimecmp_write(hart, value << 32 | low);
        }
        SISELECT => hart.csr.siselect = value & 0xff,
        SIREG => ireg_write(hart, false, value)?,
        SATP => {
            satp_guarded(hart)?;
            satp_write(hart, value);
        }

        MSTATUS => mstatus_write(hart, value, MSTATUS_WRITE_MASK),
        MSTATUSH => {
            if hart.rv64 {
                return Err(illegal());
            }
        }
        MISA => misa_write(hart, value),
        MEDELEG => hart.csr.medeleg = value & MEDELEG_MASK,
        MIDELEG => hart.csr.mideleg = value & MIDELEG_MASK,
        MIE => {
            hart.csr.mie =
                value & (IRQ_SSIP | IRQ_MSIP | IRQ_STIP | IRQ_MTIP | IRQ_SEIP | IRQ_MEIP);
            hart.restart_dispatch();
        }
        MTVEC => hart.csr.mtvec = hart.virt_addr(value),
        MCOUNTEREN => hart.csr.mcounteren = value as u32 & 7,
        MENVCFG => {
            let mut mask = ENVCFG_CBIE | ENVCFG_CBCFE | ENVCFG_CBZE;
            if hart.rv64 {
                mask |= ENVCFG_STCE;
            }
            hart.csr.menvcfg = value & mask;
        }
        MENVCFGH => {
            if hart.rv64 {
                return Err(illegal());
            }
            hart.csr.menvcfg =
                hart.csr.menvcfg & 0xffff_ffff | (value & ENVCFG_STCE >> 32) << 32;
        }
        MCOUNTINHIBIT | MHPMEVENT3..=MHPMEVENT31 => {}
        MSCRATCH => hart.csr.mscratch = value,
        MEPC => hart.csr.mepc = hart.virt_addr(value),
        MCAUSE => hart.csr.mcause = hart.virt_addr(value),
        MTVAL => hart.csr.mtval = hart.virt_addr(value),
        MIP => set_pending_bits(hart, MIP_WRITE_MASK, value),
        MISELECT => hart.csr.miselect = value & 0xff,
        MIREG => ireg_write(hart, true, value)?,
        MSECCFG => hart.csr.mseccfg = value & (MSECCFG_USEED | MSECCFG_SSEED),
        MSECCFGH => {
            if hart.rv64 {
                return Err(illegal());
            }
        }
        MCYCLE | MINSTRET | MHPMCOUNTER3..=MHPMCOUNTER31 => {}

        _ => return Err(illegal()),
    }
    Ok(())
}

/// Apply a masked update to the asynchronously raised pending bits and let
/// the interrupt selector run again.
fn set_pending_bits(hart: &mut Hart, mask: u64, value: u64) {
    for bit in 0..64 {
        if mask >> bit & 1 == 0 {
            continue;
        }
        if value >> bit & 1 != 0 {
            hart.shared.raise_irq(bit);
        } else {
            hart.shared.lower_irq(bit);
        }
    }
    hart.restart_dispatch();
}

fn mstatus_write(hart: &mut Hart, value: u64, mask: u64) {
    let old = hart.csr.mstatus;
    let mut new = old & !mask | value & mask;
    // MPP can never name the reserved hypervisor mode; it falls to U.
    if new >> MSTATUS_MPP_SHIFT & 3 == 2 {
        new &= !MSTATUS_MPP;
    }
    if hart.rv64 {
        new = new & !(MSTATUS_UXL | MSTATUS_SXL)
            | 2 << MSTATUS_UXL_SHIFT
            | 2 << MSTATUS_SXL_SHIFT;
    } else {
        new &= !(MSTATUS_UXL | MSTATUS_SXL);
    }
    hart.csr.mstatus = new;
    // Translation semantics changed under cached entries.
    if (old ^ new) & (MSTATUS_SUM | MSTATUS_MXR | MSTATUS_MPRV) != 0 {
        hart.tlb.flush();
    }
    // Enabling an interrupt class re-checks what is already pending.
    if (old ^ new) & (MSTATUS_MIE | MSTATUS_SIE) & new != 0 {
        hart.restart_dispatch();
    }
}

fn satp_write(hart: &mut Hart, value: u64) {
    let (mode_field, ppn) = if hart.rv64 {
        (value >> 60, value & 0xfff_ffff_ffff)
    } else {
        (value >> 31 & 1, value & 0x3f_ffff)
    };
    // Unsupported modes leave the register untouched.
    let Some(mode) = MmuMode::from_satp(hart.rv64, mode_field) else {
        return;
    };
    hart.mmu_mode = mode;
    hart.mmu_root = ppn << 12;
    hart.csr.satp = if hart.rv64 {
        value & (0xf << 60 | 0xffff << 44 | 0xfff_ffff_ffff)
    } else {
        value & 0xffff_ffff
    };
    hart.tlb.flush();
}

fn misa_write(hart: &mut Hart, value: u64) {
    // Extensions are fixed; the only writable field is MXL, and only
    // between the two XLENs this machine implements.
    let mxl = if hart.rv64 {
        value >> 62 & 3
    } else {
        value >> 30 & 3
    };
    let want_rv64 = match mxl {
        1 => false,
        2 => true,
        _ => return,
    };
    if want_rv64 != hart.rv64 {
        hart.rv64 = want_rv64;
        let mstatus = hart.csr.mstatus;
        mstatus_write(hart, mstatus, 0);
        hart.tlb.flush();
    }
}

fn stimecmp_write(hart: &mut Hart, value: u64) {
    hart.shared.stimecmp.store(value, Ordering::Relaxed);
    if hart.machine.timer.now() >= value {
        hart.shared.raise_irq(Interrupt::SupervisorTimer as u32);
    } else {
        hart.shared.lower_irq(Interrupt::SupervisorTimer as u32);
        // Wake any WFI sleeper so it recomputes its deadline.
        hart.shared.kick();
    }
}

/// Read a 16-bit entropy sample, policy permitting.
///
/// The result carries the ES16 status in bits 31:30 and the sample in the
/// low half; a failed host read reports WAIT with no entropy.
fn seed_read(hart: &mut Hart) -> Result<u64, Exception> {
    let allowed = match hart.privilege {
        PrivilegeMode::Machine => true,
        PrivilegeMode::Supervisor => hart.csr.mseccfg & MSECCFG_SSEED != 0,
        PrivilegeMode::User => hart.csr.mseccfg & MSECCFG_USEED != 0,
    };
    if !allowed {
        return Err(Exception::IllegalInstruction(0));
    }
    let mut sample = [0u8; 2];
    match getrandom::getrandom(&mut sample) {
        Ok(()) => Ok(0b10 << 30 | u16::from_le_bytes(sample) as u64),
        Err(_) => Ok(0b01 << 30),
    }
}

/// Indirect-window read: miselect/siselect choose an external-interrupt
/// pending or enable word.
fn ireg_read(hart: &Hart, machine_level: bool) -> Result<u64, Exception> {
    let (sel, eip, eie) = if machine_level {
        (hart.csr.miselect, &hart.csr.m_eip, &hart.csr.m_eie)
    } else {
        (hart.csr.siselect, &hart.csr.s_eip, &hart.csr.s_eie)
    };
    let (array, index) = decode_iselect(hart.rv64, sel, eip, eie)?;
    let word = array[index / 2];
    if hart.rv64 {
        Ok(word)
    } else {
        Ok(word >> (32 * (index as u64 & 1)) & 0xffff_ffff)
    }
}

fn ireg_write(hart: &mut Hart, machine_level: bool, value: u64) -> Result<(), Exception> {
    let sel = if machine_level {
        hart.csr.miselect
    } else {
        hart.csr.siselect
    };
    let rv64 = hart.rv64;
    let (eip, eie) = if machine_level {
        (&hart.csr.m_eip, &hart.csr.m_eie)
    } else {
        (&hart.csr.s_eip, &hart.csr.s_eie)
    };
    let (_, index) = decode_iselect(rv64, sel, eip, eie)?;
    let target = if machine_level {
        if sel < ISELECT_EIE0 {
            &mut hart.csr.m_eip
        } else {
            &mut hart.csr.m_eie
        }
    } else if sel < ISELECT_EIE0 {
        &mut hart.csr.s_eip
    } else {
        &mut hart.csr.s_eie
    };
    if rv64 {
        target[index / 2] = value;
    } else {
        let shift = 32 * (index as u64 & 1);
        let word = &mut target[index / 2];
        *word = *word & !(0xffff_ffffu64 << shift) | (value & 0xffff_ffff) << shift;
    }
    Ok(())
}

/// Validate an iselect value against the implemented window and return the
/// backing array plus the 32-bit-register index.
fn decode_iselect<'a>(
    rv64: bool,
    sel: u64,
    eip: &'a [u64; EI_WORDS],
    eie: &'a [u64; EI_WORDS],
) -> Result<(&'a [u64; EI_WORDS], usize), Exception> {
    let illegal = || Exception::IllegalInstruction(0);
    let (array, base) = if (ISELECT_EIP0..=ISELECT_EIP_LAST).contains(&sel) {
        (eip, ISELECT_EIP0)
    } else if (ISELECT_EIE0..=ISELECT_EIE_LAST).contains(&sel) {
        (eie, ISELECT_EIE0)
    } else {
        return Err(illegal());
    };
    let index = (sel - base) as usize;
    // RV64 implements only the even-numbered 32-bit registers, each access
    // covering a full 64-bit word.
    if rv64 && index % 2 != 0 {
        return Err(illegal());
    }
    if index / 2 >= EI_WORDS {
        return Err(illegal());
    }
    Ok((array, index))
}
