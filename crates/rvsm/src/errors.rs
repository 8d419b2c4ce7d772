//! Host-side error types.
//!
//! Guest misbehavior is never reported through these: invalid guest operations
//! become guest traps (see [`crate::trap::Exception`]). The errors here cover
//! machine construction and configuration only.

use thiserror::Error;

/// Errors raised while building or reconfiguring a machine.
#[derive(Debug, Error)]
pub enum MachineError {
    /// The host refused to hand out the RAM block.
    #[error("allocation of {size:#x} bytes of guest ram failed")]
    RamAlloc { size: u64 },

    /// RAM base and size must both be multiples of the page size.
    #[error("guest ram base {base:#x} / size {size:#x} is not page aligned")]
    RamMisaligned { base: u64, size: u64 },

    /// An MMIO region would overlap RAM or a previously attached region.
    #[error("mmio region {addr:#x}..{end:#x} overlaps ram or another region")]
    MmioOverlap { addr: u64, end: u64 },

    /// MMIO op-size bounds must be powers of two with `min <= max`.
    #[error("mmio op size bounds min={min} max={max} are invalid")]
    MmioOpSize { min: u32, max: u32 },

    /// Detach of a region that was never attached.
    #[error("no mmio region based at {0:#x}")]
    MmioNotFound(u64),

    /// Attach/detach and paused-state access require a paused machine.
    #[error("operation requires the machine to be paused")]
    MachineRunning,

    /// A hart index outside the configured hart count.
    #[error("hart {0} does not exist")]
    NoSuchHart(usize),

    /// A boot or DMA image does not fit inside guest RAM.
    #[error("image of {len:#x} bytes at {addr:#x} does not fit guest ram")]
    ImageOutOfRange { addr: u64, len: usize },

    /// The machine needs at least one hart.
    #[error("a machine needs at least one hart")]
    NoHarts,
}
