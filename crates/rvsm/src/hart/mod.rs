//! Hart execution state and the per-hart thread loop.
//!
//! A [`Hart`] is owned by exactly one OS thread while the machine runs; the
//! cross-thread surface lives in [`HartShared`] (pending interrupts, events,
//! the WFI condition variable, timer compares) and is reached by devices and
//! other harts through `Arc`s. The privileged state machine (trap entry,
//! trap return, interrupt selection, WFI) is implemented here.

pub mod amo;
pub mod compressed;
pub mod exec;
pub mod fpu;
pub mod regs;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use tracing::trace;

use crate::csr::file::CsrFile;
use crate::csr::{
    MSTATUS_MIE, MSTATUS_MPIE, MSTATUS_MPP, MSTATUS_MPP_SHIFT, MSTATUS_MPRV, MSTATUS_SIE,
    MSTATUS_SPIE, MSTATUS_SPP, MSTATUS_TSR, MSTATUS_TW,
};
use crate::machine::MachineState;
use crate::mmu::{self, MmuMode};
use crate::tlb::Tlb;
use crate::trap::{Exception, Interrupt, PrivilegeMode};

use regs::{FRegisters, XRegisters};

/// Pause request: the hart thread returns to its caller.
pub const EV_PAUSE: u32 = 1 << 0;
/// Preempt request: the hart sleeps for the recorded milliseconds.
pub const EV_PREEMPT: u32 = 1 << 1;

/// Upper bound on one WFI sleep slice; a lost wakeup is healed on the next
/// slice at the latest.
const WFI_SLICE: Duration = Duration::from_millis(10);

/// The cross-thread face of a hart.
pub struct HartShared {
    /// Pending-interrupt bitset (mip bits raised asynchronously).
    ip: AtomicU64,
    /// Pending-event bitset (EV_PAUSE, EV_PREEMPT).
    events: AtomicU32,
    /// Sleep duration for EV_PREEMPT, in milliseconds.
    pub preempt_ms: AtomicU32,
    /// False whenever the hart is outside the dispatch loop (WFI included).
    pub running: AtomicBool,
    /// Per-hart machine-timer compare.
    pub mtimecmp: AtomicU64,
    /// Per-hart supervisor-timer compare (Sstc). All-ones means unarmed.
    pub stimecmp: AtomicU64,
    wfi_mutex: Mutex<()>,
    wfi_cond: Condvar,
}

impl HartShared {
    pub fn new() -> Self {
        Self {
            ip: AtomicU64::new(0),
            events: AtomicU32::new(0),
            preempt_ms: AtomicU32::new(0),
            running: AtomicBool::new(false),
            mtimecmp: AtomicU64::new(u64::MAX),
            stimecmp: AtomicU64::new(u64::MAX),
            wfi_mutex: Mutex::new(()),
            wfi_cond: Condvar::new(),
        }
    }

    /// Current pending-interrupt bits.
    #[inline]
    pub fn irq_pending(&self) -> u64 {
        self.ip.load(Ordering::Relaxed)
    }

    /// Raise a pending-interrupt bit; a 0→1 transition wakes the hart.
    pub fn raise_irq(&self, bit: u32) {
        let prev = self.ip.fetch_or(1 << bit, Ordering::Relaxed);
        if prev & 1 << bit == 0 {
            self.kick();
        }
    }

    /// Lower a pending-interrupt bit.
    pub fn lower_irq(&self, bit: u32) {
        self.ip.fetch_and(!(1 << bit), Ordering::Relaxed);
    }

    /// Knock the hart out of the dispatch loop and out of WFI.
    pub fn kick(&self) {
        self.running.store(false, Ordering::Release);
        let _guard = self.wfi_mutex.lock().unwrap();
        self.wfi_cond.notify_all();
    }

    /// Ask the hart thread to return to its caller.
    pub fn request_pause(&self) {
        self.events.fetch_or(EV_PAUSE, Ordering::Release);
        self.kick();
    }

    /// Ask the hart to sleep for `ms` at its next instruction boundary.
    pub fn request_preempt(&self, ms: u32) {
        self.preempt_ms.store(ms, Ordering::Relaxed);
        self.events.fetch_or(EV_PREEMPT, Ordering::Release);
        self.kick();
    }

    fn take_events(&self) -> u32 {
        self.events.swap(0, Ordering::AcqRel)
    }
}

impl Default for HartShared {
    fn default() -> Self {
        Self::new()
    }
}

/// An LR reservation: the address and the value observed by the load.
#[derive(Debug, Clone, Copy)]
pub struct Reservation {
    pub addr: u64,
    pub value: u64,
    pub width: u8,
}

/// One hardware thread: registers, privilege state, TLB and CSR file.
pub struct Hart {
    pub machine: Arc<MachineState>,
    pub shared: Arc<HartShared>,
    pub hart_id: usize,
    pub xregs: XRegisters,
    pub fregs: FRegisters,
    pub pc: u64,
    pub privilege: PrivilegeMode,
    /// Current XLEN: true for RV64, false for RV32.
    pub rv64: bool,
    /// Address-translation mode, derived from satp.
    pub mmu_mode: MmuMode,
    /// Physical base of the root page table.
    pub mmu_root: u64,
    pub csr: CsrFile,
    pub tlb: Tlb,
    pub reservation: Option<Reservation>,
    /// Byte length of the instruction currently executing (2 or 4).
    pub insn_len: u64,
    branched: bool,
    trap_committed: bool,
}

impl Hart {
    pub fn new(
        machine: Arc<MachineState>,
        shared: Arc<HartShared>,
        hart_id: usize,
        rv64: bool,
        reset_pc: u64,
    ) -> Self {
        Self {
            machine,
            shared,
            hart_id,
            xregs: XRegisters::new(),
            fregs: FRegisters::new(),
            pc: reset_pc,
            privilege: PrivilegeMode::Machine,
            rv64,
            mmu_mode: MmuMode::Bare,
            mmu_root: 0,
            csr: CsrFile::new(rv64),
            tlb: Tlb::new(),
            reservation: None,
            insn_len: 4,
            branched: false,
            trap_committed: false,
        }
    }

    /// Architectural reset: M-mode, bare translation, cleared registers.
    pub fn reset(&mut self, rv64: bool, reset_pc: u64) {
        self.xregs.reset();
        self.fregs.reset();
        self.pc = reset_pc;
        self.privilege = PrivilegeMode::Machine;
        self.rv64 = rv64;
        self.mmu_mode = MmuMode::Bare;
        self.mmu_root = 0;
        self.csr = CsrFile::new(rv64);
        self.tlb.flush();
        self.reservation = None;
    }

    // --- XLEN helpers -----------------------------------------------------

    /// Canonicalize a computation result for the current XLEN. RV32 values
    /// are kept sign-extended in the 64-bit registers, which preserves both
    /// signed and unsigned 32-bit comparison order.
    #[inline]
    pub fn to_xlen(&self, value: u64) -> u64 {
        if self.rv64 {
            value
        } else {
            value as u32 as i32 as i64 as u64
        }
    }

    /// Mask an address to the current XLEN.
    #[inline]
    pub fn virt_addr(&self, value: u64) -> u64 {
        if self.rv64 {
            value
        } else {
            value & 0xffff_ffff
        }
    }

    /// Write an integer register, canonicalized for the current XLEN.
    #[inline]
    pub fn set_x(&mut self, rd: u32, value: u64) {
        let value = self.to_xlen(value);
        self.xregs.write(rd, value);
    }

    /// The cause sign bit for the current XLEN.
    #[inline]
    pub fn interrupt_sign_bit(&self) -> u64 {
        if self.rv64 {
            1 << 63
        } else {
            1 << 31
        }
    }

    /// Redirect control flow; the dispatcher skips the PC increment.
    #[inline]
    pub fn jump(&mut self, target: u64) {
        self.pc = self.virt_addr(target);
        self.branched = true;
    }

    /// Switch privilege, invalidating cached translations on a change.
    pub fn set_privilege(&mut self, privilege: PrivilegeMode) {
        if self.privilege != privilege {
            self.privilege = privilege;
            self.tlb.flush();
        }
    }

    /// Leave the dispatch loop after the current instruction so interrupts
    /// are re-evaluated (used by CSR writes that unmask interrupts).
    #[inline]
    pub fn restart_dispatch(&self) {
        self.shared.running.store(false, Ordering::Release);
    }

    // --- Trap machinery ---------------------------------------------------

    /// Deliver a synchronous exception. `self.pc` still addresses the
    /// faulting instruction.
    pub fn take_exception(&mut self, e: Exception) {
        trace!("hart {} exception {:?} at pc {:#x}", self.hart_id, e, self.pc);
        self.deliver_trap(e.cause(), e.tval(), false);
    }

    /// Deliver an interrupt by bit number between instructions.
    pub fn take_interrupt(&mut self, bit: u32) {
        trace!("hart {} interrupt {}", self.hart_id, bit);
        self.deliver_trap(bit as u64, 0, true);
    }

    fn deliver_trap(&mut self, code: u64, tval: u64, is_interrupt: bool) {
        // Hardware raises only one trap per dispatch cycle; a second one in
        // the same cycle is dropped.
        if self.trap_committed {
            return;
        }
        self.trap_committed = true;
        self.reservation = None;

        // Delegation descends one level per set bit, stopping at the
        // current privilege.
        let deleg = if is_interrupt {
            self.csr.mideleg
        } else {
            self.csr.medeleg
        };
        let target = if self.privilege < PrivilegeMode::Machine && deleg >> (code & 63) & 1 != 0 {
            PrivilegeMode::Supervisor
        } else {
            PrivilegeMode::Machine
        };
        let cause = if is_interrupt {
            code | self.interrupt_sign_bit()
        } else {
            code
        };

        let pc = self.virt_addr(self.pc);
        let mstatus = self.csr.mstatus;
        match target {
            PrivilegeMode::Machine => {
                self.csr.mepc = pc;
                self.csr.mcause = cause;
                self.csr.mtval = tval;
                let mie = mstatus >> 3 & 1;
                let mut new = mstatus & !(MSTATUS_MIE | MSTATUS_MPIE | MSTATUS_MPP);
                new |= mie << 7;
                new |= self.privilege.bits() << MSTATUS_MPP_SHIFT;
                self.csr.mstatus = new;
                let tvec = self.csr.mtvec;
                self.set_privilege(PrivilegeMode::Machine);
                self.jump(tvec & !3);
            }
            _ => {
                self.csr.sepc = pc;
                self.csr.scause = cause;
                self.csr.stval = tval;
                let sie = mstatus >> 1 & 1;
                let mut new = mstatus & !(MSTATUS_SIE | MSTATUS_SPIE | MSTATUS_SPP);
                new |= sie << 5;
                if self.privilege == PrivilegeMode::Supervisor {
                    new |= MSTATUS_SPP;
                }
                self.csr.mstatus = new;
                let tvec = self.csr.stvec;
                self.set_privilege(PrivilegeMode::Supervisor);
                self.jump(tvec & !3);
            }
        }
        // Make the dispatch loop restart so a now-unmasked interrupt is
        // picked up promptly.
        self.restart_dispatch();
    }

    /// MRET/SRET. `machine_level` selects the return register set.
    pub fn xret(&mut self, machine_level: bool, insn: u32) -> Result<(), Exception> {
        let mstatus = self.csr.mstatus;
        if machine_level {
            if self.privilege != PrivilegeMode::Machine {
                return Err(Exception::IllegalInstruction(insn as u64));
            }
            let mpp = PrivilegeMode::from_bits(mstatus >> MSTATUS_MPP_SHIFT);
            let mpie = mstatus >> 7 & 1;
            let mut new = mstatus & !(MSTATUS_MIE | MSTATUS_MPIE | MSTATUS_MPP);
            new |= mpie << 3;
            new |= MSTATUS_MPIE;
            if mpp != PrivilegeMode::Machine {
                new &= !MSTATUS_MPRV;
            }
            self.csr.mstatus = new;
            let epc = self.csr.mepc;
            self.set_privilege(mpp);
            self.jump(epc & !1);
        } else {
            if self.privilege < PrivilegeMode::Supervisor
                || self.privilege == PrivilegeMode::Supervisor && mstatus & MSTATUS_TSR != 0
            {
                return Err(Exception::IllegalInstruction(insn as u64));
            }
            let spp = if mstatus & MSTATUS_SPP != 0 {
                PrivilegeMode::Supervisor
            } else {
                PrivilegeMode::User
            };
            let spie = mstatus >> 5 & 1;
            let mut new = mstatus & !(MSTATUS_SIE | MSTATUS_SPIE | MSTATUS_SPP);
            new |= spie << 1;
            new |= MSTATUS_SPIE;
            if spp != PrivilegeMode::Machine {
                new &= !MSTATUS_MPRV;
            }
            self.csr.mstatus = new;
            let epc = self.csr.sepc;
            self.set_privilege(spp);
            self.jump(epc & !1);
        }
        self.reservation = None;
        self.restart_dispatch();
        Ok(())
    }

    // --- Interrupt selection ----------------------------------------------

    /// Pick the interrupt to deliver now, if any: highest-numbered bit of
    /// the pending-and-enabled set at the least privileged level the set
    /// delegates to, honoring the global enable of that level.
    pub fn pending_interrupt(&self) -> Option<u32> {
        let pending = self.csr.mie & self.shared.irq_pending();
        if pending == 0 {
            return None;
        }
        let machine_set = pending & !self.csr.mideleg;
        let (set, enabled) = if machine_set != 0 {
            (
                machine_set,
                self.privilege < PrivilegeMode::Machine
                    || self.csr.mstatus & MSTATUS_MIE != 0,
            )
        } else {
            (
                pending & self.csr.mideleg,
                self.privilege < PrivilegeMode::Supervisor
                    || self.privilege == PrivilegeMode::Supervisor
                        && self.csr.mstatus & MSTATUS_SIE != 0,
            )
        };
        if !enabled {
            return None;
        }
        Some(63 - set.leading_zeros())
    }

    /// Service a deliverable interrupt. Returns whether one was taken.
    pub fn service_interrupts(&mut self) -> bool {
        self.trap_committed = false;
        match self.pending_interrupt() {
            Some(bit) => {
                self.take_interrupt(bit);
                true
            }
            None => false,
        }
    }

    // --- WFI ----------------------------------------------------------------

    /// Re-derive the timer pending bits from the compare registers.
    pub fn refresh_timer_bits(&self) {
        let now = self.machine.timer.now();
        if now >= self.shared.mtimecmp.load(Ordering::Relaxed) {
            self.shared.raise_irq(Interrupt::MachineTimer as u32);
        } else {
            self.shared.lower_irq(Interrupt::MachineTimer as u32);
        }
        let stimecmp = self.shared.stimecmp.load(Ordering::Relaxed);
        if stimecmp != u64::MAX {
            if now >= stimecmp {
                self.shared.raise_irq(Interrupt::SupervisorTimer as u32);
            } else {
                self.shared.lower_irq(Interrupt::SupervisorTimer as u32);
            }
        }
    }

    /// Stall until a locally enabled interrupt is pending or an event
    /// arrives. The wait is bounded by the nearest timer-compare deadline.
    pub fn wfi(&mut self, insn: u32) -> Result<(), Exception> {
        if self.privilege < PrivilegeMode::Machine && self.csr.mstatus & MSTATUS_TW != 0 {
            return Err(Exception::IllegalInstruction(insn as u64));
        }
        self.shared.running.store(false, Ordering::Release);
        let mut guard = self.shared.wfi_mutex.lock().unwrap();
        loop {
            if self.csr.mie & self.shared.irq_pending() != 0 {
                break;
            }
            if self.shared.events.load(Ordering::Acquire) != 0 {
                break;
            }
            let mtimecmp = self.shared.mtimecmp.load(Ordering::Relaxed);
            let stimecmp = self.shared.stimecmp.load(Ordering::Relaxed);
            let deadline = match (
                self.machine.timer.until(mtimecmp),
                self.machine.timer.until(stimecmp),
            ) {
                (Some(a), Some(b)) => a.min(b),
                (Some(a), None) => a,
                (None, Some(b)) => b,
                (None, None) => WFI_SLICE,
            };
            let (g, _) = self
                .shared
                .wfi_cond
                .wait_timeout(guard, deadline.min(WFI_SLICE))
                .unwrap();
            guard = g;
            drop(guard);
            self.refresh_timer_bits();
            guard = self.shared.wfi_mutex.lock().unwrap();
        }
        drop(guard);
        self.refresh_timer_bits();
        Ok(())
    }

    // --- Dispatch ------------------------------------------------------------

    /// Fetch, decode and execute one instruction, committing any trap it
    /// raises. X0 stays zero across retirement by construction of the
    /// register file.
    pub fn step(&mut self) {
        self.trap_committed = false;
        if let Err(e) = self.exec_one() {
            self.take_exception(e);
        }
    }

    fn exec_one(&mut self) -> Result<(), Exception> {
        let pc = self.pc;
        let lo = mmu::fetch_u16(self, pc)? as u32;
        let (insn, len) = if lo & 3 != 3 {
            (compressed::expand(lo as u16, self.rv64)?, 2)
        } else {
            let hi = mmu::fetch_u16(self, pc.wrapping_add(2))? as u32;
            (lo | hi << 16, 4)
        };
        self.insn_len = len;
        self.branched = false;
        exec::execute(self, insn)?;
        if !self.branched {
            self.pc = self.virt_addr(pc.wrapping_add(len));
        }
        Ok(())
    }

    /// Run instructions until something drops the running flag.
    fn dispatch(&mut self) {
        while self.shared.running.load(Ordering::Acquire) {
            self.step();
        }
    }

    /// The hart thread body: poll events, service interrupts, dispatch.
    /// Returns when a pause is requested.
    pub fn run(&mut self) {
        trace!("hart {} running", self.hart_id);
        loop {
            self.shared.running.store(true, Ordering::Release);
            let events = self.shared.take_events();
            if events & EV_PAUSE != 0 {
                self.shared.running.store(false, Ordering::Release);
                trace!("hart {} paused", self.hart_id);
                return;
            }
            if events & EV_PREEMPT != 0 {
                let ms = self.shared.preempt_ms.load(Ordering::Relaxed);
                thread::sleep(Duration::from_millis(ms as u64));
            }
            self.service_interrupts();
            self.dispatch();
        }
    }
}

impl core::fmt::Display for Hart {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        writeln!(
            f,
            "hart {} pc={:#x} priv={:?} xlen={}",
            self.hart_id,
            self.pc,
            self.privilege,
            if self.rv64 { 64 } else { 32 },
        )?;
        write!(f, "{}", self.xregs)
    }
}
