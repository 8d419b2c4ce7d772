//! Guest trap causes.
//!
//! Exceptions are synchronous causes raised while an instruction executes;
//! interrupts are asynchronous causes delivered between instructions. Both
//! are delivered to the guest through the privileged state machine on the
//! hart (see `hart::Hart::take_exception` and `hart::Hart::take_interrupt`);
//! the host never aborts on guest misbehavior.

/// Synchronous exception causes.
///
/// The payload of the address-carrying variants is the faulting virtual
/// address; `IllegalInstruction` carries the offending instruction bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    InstructionAddressMisaligned(u64),
    InstructionAccessFault(u64),
    IllegalInstruction(u64),
    Breakpoint(u64),
    LoadAddressMisaligned(u64),
    LoadAccessFault(u64),
    StoreAddressMisaligned(u64),
    StoreAccessFault(u64),
    EnvironmentCallFromUMode,
    EnvironmentCallFromSMode,
    EnvironmentCallFromMMode,
    InstructionPageFault(u64),
    LoadPageFault(u64),
    StorePageFault(u64),
}

impl Exception {
    /// The exception code written to `mcause`/`scause`.
    pub fn cause(&self) -> u64 {
        match self {
            Exception::InstructionAddressMisaligned(_) => 0,
            Exception::InstructionAccessFault(_) => 1,
            Exception::IllegalInstruction(_) => 2,
            Exception::Breakpoint(_) => 3,
            Exception::LoadAddressMisaligned(_) => 4,
            Exception::LoadAccessFault(_) => 5,
            Exception::StoreAddressMisaligned(_) => 6,
            Exception::StoreAccessFault(_) => 7,
            Exception::EnvironmentCallFromUMode => 8,
            Exception::EnvironmentCallFromSMode => 9,
            Exception::EnvironmentCallFromMMode => 11,
            Exception::InstructionPageFault(_) => 12,
            Exception::LoadPageFault(_) => 13,
            Exception::StorePageFault(_) => 15,
        }
    }

    /// The value written to `mtval`/`stval`.
    pub fn tval(&self) -> u64 {
        match self {
            Exception::InstructionAddressMisaligned(addr)
            | Exception::InstructionAccessFault(addr)
            | Exception::IllegalInstruction(addr)
            | Exception::Breakpoint(addr)
            | Exception::LoadAddressMisaligned(addr)
            | Exception::LoadAccessFault(addr)
            | Exception::StoreAddressMisaligned(addr)
            | Exception::StoreAccessFault(addr)
            | Exception::InstructionPageFault(addr)
            | Exception::LoadPageFault(addr)
            | Exception::StorePageFault(addr) => *addr,
            Exception::EnvironmentCallFromUMode
            | Exception::EnvironmentCallFromSMode
            | Exception::EnvironmentCallFromMMode => 0,
        }
    }

    /// Whether re-execution after the trap handler is expected to make
    /// progress (page faults and misalignments are normal guest events).
    pub fn is_page_fault(&self) -> bool {
        matches!(
            self,
            Exception::InstructionPageFault(_)
                | Exception::LoadPageFault(_)
                | Exception::StorePageFault(_)
        )
    }
}

/// Interrupt numbers, i.e. bit positions in `mip`/`mie`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    SupervisorSoftware = 1,
    MachineSoftware = 3,
    SupervisorTimer = 5,
    MachineTimer = 7,
    SupervisorExternal = 9,
    MachineExternal = 11,
}

/// Supervisor software interrupt pending/enable bit.
pub const IRQ_SSIP: u64 = 1 << 1;
/// Machine software interrupt pending/enable bit.
pub const IRQ_MSIP: u64 = 1 << 3;
/// Supervisor timer interrupt pending/enable bit.
pub const IRQ_STIP: u64 = 1 << 5;
/// Machine timer interrupt pending/enable bit.
pub const IRQ_MTIP: u64 = 1 << 7;
/// Supervisor external interrupt pending/enable bit.
pub const IRQ_SEIP: u64 = 1 << 9;
/// Machine external interrupt pending/enable bit.
pub const IRQ_MEIP: u64 = 1 << 11;

/// Privilege modes. `Hypervisor` is reserved by the encoding but not
/// modeled; the ordering of the discriminants matches privilege ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd)]
pub enum PrivilegeMode {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

impl PrivilegeMode {
    /// Decode a 2-bit xPP field, mapping the reserved hypervisor encoding
    /// down to user per the WARL rule.
    pub fn from_bits(bits: u64) -> Self {
        match bits & 3 {
            0 => PrivilegeMode::User,
            1 => PrivilegeMode::Supervisor,
            3 => PrivilegeMode::Machine,
            _ => PrivilegeMode::User,
        }
    }

    pub fn bits(self) -> u64 {
        self as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cause_codes_match_the_privileged_encoding() {
        assert_eq!(Exception::IllegalInstruction(0).cause(), 2);
        assert_eq!(Exception::LoadPageFault(0).cause(), 13);
        assert_eq!(Exception::StorePageFault(0).cause(), 15);
        assert_eq!(Exception::EnvironmentCallFromMMode.cause(), 11);
    }

    #[test]
    fn tval_carries_the_faulting_address() {
        assert_eq!(Exception::LoadPageFault(0x42000000).tval(), 0x42000000);
        assert_eq!(Exception::EnvironmentCallFromUMode.tval(), 0);
    }

    #[test]
    fn privilege_order() {
        assert!(PrivilegeMode::User < PrivilegeMode::Supervisor);
        assert!(PrivilegeMode::Supervisor < PrivilegeMode::Machine);
        assert_eq!(PrivilegeMode::from_bits(2), PrivilegeMode::User);
    }
}
