//! RISC-V full-system emulation core.
//!
//! The crate models the hardware-thread pipeline of a machine capable of
//! booting a general-purpose OS: instruction dispatch for RV32/RV64 IMAFDC
//! with Zicsr/Zifencei/Zicbom/Zicboz/Sstc and the AIA indirect CSRs, an
//! SV32/SV39/SV48/SV57 MMU with a per-hart software TLB, the privileged
//! state machine (traps, delegation, interrupts, WFI), LR/SC and AMO
//! atomics, guest RAM with zero-copy host access, an MMIO dispatch fabric
//! for external devices, and the core-local interrupt block.
//!
//! Peripherals (UART, block storage, interrupt fan-out controllers, ...)
//! live outside this crate and plug in through [`bus::MmioDevice`] and
//! [`intc::InterruptController`].

pub mod bus;
pub mod clint;
pub mod csr;
pub mod errors;
pub mod hart;
pub mod intc;
pub mod jit;
pub mod machine;
pub mod mem;
pub mod mmu;
pub mod tlb;
pub mod trap;

pub use errors::MachineError;
pub use machine::{Machine, MachineConfig};
