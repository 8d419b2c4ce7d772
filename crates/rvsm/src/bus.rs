//! Physical MMIO dispatch.
//!
//! The registry is an insertion-ordered list of non-overlapping physical
//! address ranges, each bound to a device. Device counts are small, so the
//! lookup is a linear scan. Regions are attached and detached only while the
//! machine is paused; while harts run the registry is effectively immutable.
//!
//! Accesses narrower or wider than the device's declared op-size window, or
//! misaligned to their own size, are fixed up here by splitting/merging
//! through a bounce buffer, so devices only ever see aligned accesses of a
//! width they support.

use std::sync::Arc;

use crate::errors::MachineError;
use crate::mem::{atomic_load_copy, atomic_store_copy};

/// Physical addresses above this many bits are outside the canonical space:
/// reads return zero and writes are silently dropped, matching observed
/// silicon behavior.
pub const PHYS_ADDR_BITS: u32 = 56;

/// Largest chunk the realign fixup can bounce; `max_op_size` is capped here.
pub const MAX_BOUNCE: usize = 16;

/// The device-facing MMIO ABI.
///
/// Offsets are relative to the region base. Handlers return false to report
/// a device-side access fault, which the core turns into a guest trap, never
/// a host panic. Devices are shared between hart threads and the eventloop,
/// so state is behind interior mutability.
pub trait MmioDevice: Send + Sync {
    /// Read `dst.len()` bytes at `offset`.
    fn read(&self, offset: u64, dst: &mut [u8]) -> bool;

    /// Write `src.len()` bytes at `offset`.
    fn write(&self, offset: u64, src: &[u8]) -> bool;

    /// Periodic tick from the machine eventloop thread. May raise interrupts.
    fn update(&self) {}

    /// Machine reset.
    fn reset(&self) {}

    /// Detach notification; runs before the region is dropped.
    fn detach(&self) {}
}

/// A directly host-mapped backing for a region.
///
/// When present, reads bypass the device callback entirely and writes are
/// committed to the mapping before the callback runs for side effects.
pub struct HostMapping {
    ptr: *mut u8,
    len: u64,
}

unsafe impl Send for HostMapping {}
unsafe impl Sync for HostMapping {}

impl HostMapping {
    /// # Safety
    /// `ptr` must stay valid for `len` bytes for the region's lifetime and
    /// tolerate concurrent atomic access from multiple threads.
    pub unsafe fn new(ptr: *mut u8, len: u64) -> Self {
        Self { ptr, len }
    }

    /// Host pointer for `offset`, when `[offset, offset + len)` is inside.
    pub fn at(&self, offset: u64, len: u64) -> Option<*mut u8> {
        (offset <= self.len && len <= self.len - offset)
            .then(|| unsafe { self.ptr.add(offset as usize) })
    }
}

/// One attached region: an address range bound to a device.
pub struct MmioRegion {
    pub addr: u64,
    pub size: u64,
    pub min_op_size: u32,
    pub max_op_size: u32,
    pub device: Arc<dyn MmioDevice>,
    pub mapping: Option<HostMapping>,
}

impl MmioRegion {
    pub fn new(
        addr: u64,
        size: u64,
        min_op_size: u32,
        max_op_size: u32,
        device: Arc<dyn MmioDevice>,
    ) -> Self {
        Self {
            addr,
            size,
            min_op_size,
            max_op_size,
            device,
            mapping: None,
        }
    }

    pub fn with_mapping(mut self, mapping: HostMapping) -> Self {
        self.mapping = Some(mapping);
        self
    }

    fn contains(&self, paddr: u64, len: u64) -> bool {
        paddr >= self.addr
            && len <= self.size
            && paddr.wrapping_sub(self.addr) <= self.size - len
    }

    /// Validate op-size bounds at attach time. The bounce buffer bounds
    /// `max_op_size`; violating this would be an emulator bug later, so it
    /// is rejected up front.
    pub fn validate(&self) -> Result<(), MachineError> {
        let ok = self.min_op_size.is_power_of_two()
            && self.max_op_size.is_power_of_two()
            && self.min_op_size <= self.max_op_size
            && self.max_op_size as usize <= MAX_BOUNCE;
        if ok {
            Ok(())
        } else {
            Err(MachineError::MmioOpSize {
                min: self.min_op_size,
                max: self.max_op_size,
            })
        }
    }
}

/// Find the single region containing the whole of `[paddr, paddr + len)`.
pub fn find_region<'a>(regions: &'a [MmioRegion], paddr: u64, len: u64) -> Option<&'a MmioRegion> {
    regions.iter().find(|r| r.contains(paddr, len))
}

/// Whether `[addr, addr+size)` overlaps any attached region.
pub fn overlaps_any(regions: &[MmioRegion], addr: u64, size: u64) -> bool {
    let end = addr.saturating_add(size);
    regions
        .iter()
        .any(|r| addr < r.addr.saturating_add(r.size) && r.addr < end)
}

/// Dispatch a physical read that did not hit RAM. False means access fault.
pub fn mmio_read(regions: &[MmioRegion], paddr: u64, dst: &mut [u8]) -> bool {
    let Some(region) = find_region(regions, paddr, dst.len() as u64) else {
        if paddr >> PHYS_ADDR_BITS != 0 {
            dst.fill(0);
            return true;
        }
        return false;
    };
    let offset = paddr - region.addr;
    if let Some(mapping) = &region.mapping {
        if let Some(ptr) = mapping.at(offset, dst.len() as u64) {
            unsafe { atomic_load_copy(ptr, dst) };
            return true;
        }
    }
    if needs_realign(region, offset, dst.len()) {
        realign_access(region, offset, dst, false)
    } else {
        region.device.read(offset, dst)
    }
}

/// Dispatch a physical write that did not hit RAM. False means access fault.
pub fn mmio_write(regions: &[MmioRegion], paddr: u64, src: &[u8]) -> bool {
    let Some(region) = find_region(regions, paddr, src.len() as u64) else {
        // Writes beyond the canonical physical space are dropped.
        return paddr >> PHYS_ADDR_BITS != 0;
    };
    let offset = paddr - region.addr;
    if let Some(mapping) = &region.mapping {
        if let Some(ptr) = mapping.at(offset, src.len() as u64) {
            unsafe { atomic_store_copy(ptr, src) };
            // The callback still runs so the device can observe the store.
            return region.device.write(offset, src);
        }
    }
    if needs_realign(region, offset, src.len()) {
        let mut buf = src.to_vec();
        realign_access(region, offset, &mut buf, true)
    } else {
        region.device.write(offset, src)
    }
}

fn needs_realign(region: &MmioRegion, offset: u64, len: usize) -> bool {
    len < region.min_op_size as usize
        || len > region.max_op_size as usize
        || !len.is_power_of_two()
        || offset % len as u64 != 0
}

/// Split/merge an odd-shaped access into aligned chunks the device accepts.
///
/// Partial chunk writes are read-modify-write through the bounce buffer so
/// neighbouring register bytes are preserved.
fn realign_access(region: &MmioRegion, offset: u64, buf: &mut [u8], write: bool) -> bool {
    let align = (buf.len().next_power_of_two() as u32)
        .clamp(region.min_op_size, region.max_op_size) as u64;
    let mut bounce = [0u8; MAX_BOUNCE];
    let bounce = &mut bounce[..align as usize];

    let start = offset & !(align - 1);
    let end = offset + buf.len() as u64;
    let mut chunk = start;
    while chunk < end {
        // Overlap of [chunk, chunk+align) with the requested range.
        let lo = chunk.max(offset);
        let hi = (chunk + align).min(end);
        let in_chunk = (lo - chunk) as usize..(hi - chunk) as usize;
        let in_buf = (lo - offset) as usize..(hi - offset) as usize;

        if write {
            let partial = in_chunk.len() != align as usize;
            if partial && !region.device.read(chunk, bounce) {
                return false;
            }
            bounce[in_chunk].copy_from_slice(&buf[in_buf]);
            if !region.device.write(chunk, bounce) {
                return false;
            }
        } else {
            if !region.device.read(chunk, bounce) {
                return false;
            }
            buf[in_buf].copy_from_slice(&bounce[in_chunk]);
        }
        chunk += align;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// A 32-bit register file that only accepts aligned word accesses.
    struct WordDevice {
        words: Mutex<[u32; 4]>,
    }

    impl WordDevice {
        fn new() -> Self {
            Self {
                words: Mutex::new([0; 4]),
            }
        }
    }

    impl MmioDevice for WordDevice {
        fn read(&self, offset: u64, dst: &mut [u8]) -> bool {
            if dst.len() != 4 || offset % 4 != 0 {
                return false;
            }
            let words = self.words.lock().unwrap();
            dst.copy_from_slice(&words[(offset / 4) as usize].to_le_bytes());
            true
        }

        fn write(&self, offset: u64, src: &[u8]) -> bool {
            if src.len() != 4 || offset % 4 != 0 {
                return false;
            }
            let mut words = self.words.lock().unwrap();
            words[(offset / 4) as usize] = u32::from_le_bytes(src.try_into().unwrap());
            true
        }
    }

    fn region() -> Vec<MmioRegion> {
        vec![MmioRegion::new(
            0x1000_0000,
            16,
            4,
            4,
            Arc::new(WordDevice::new()),
        )]
    }

    #[test]
    fn aligned_word_passes_through() {
        let regions = region();
        assert!(mmio_write(&regions, 0x1000_0004, &0x1122_3344u32.to_le_bytes()));
        let mut buf = [0u8; 4];
        assert!(mmio_read(&regions, 0x1000_0004, &mut buf));
        assert_eq!(u32::from_le_bytes(buf), 0x1122_3344);
    }

    #[test]
    fn narrow_write_is_rmw() {
        let regions = region();
        assert!(mmio_write(&regions, 0x1000_0000, &0xaabb_ccddu32.to_le_bytes()));
        // Byte write into the middle of the word must keep its neighbours.
        assert!(mmio_write(&regions, 0x1000_0001, &[0x55]));
        let mut buf = [0u8; 4];
        assert!(mmio_read(&regions, 0x1000_0000, &mut buf));
        assert_eq!(u32::from_le_bytes(buf), 0xaabb_55dd);
    }

    #[test]
    fn wide_read_splits_into_words() {
        let regions = region();
        assert!(mmio_write(&regions, 0x1000_0000, &1u32.to_le_bytes()));
        assert!(mmio_write(&regions, 0x1000_0004, &2u32.to_le_bytes()));
        let mut buf = [0u8; 8];
        assert!(mmio_read(&regions, 0x1000_0000, &mut buf));
        assert_eq!(u64::from_le_bytes(buf), 0x0000_0002_0000_0001);
    }

    #[test]
    fn misaligned_read_straddles_words() {
        let regions = region();
        assert!(mmio_write(&regions, 0x1000_0000, &0x4433_2211u32.to_le_bytes()));
        assert!(mmio_write(&regions, 0x1000_0004, &0x8877_6655u32.to_le_bytes()));
        let mut buf = [0u8; 4];
        assert!(mmio_read(&regions, 0x1000_0002, &mut buf));
        assert_eq!(u32::from_le_bytes(buf), 0x6655_4433);
    }

    #[test]
    fn unmapped_hole_faults_but_noncanonical_does_not() {
        let regions = region();
        let mut buf = [0xffu8; 4];
        assert!(!mmio_read(&regions, 0x2000_0000, &mut buf));
        assert!(mmio_read(&regions, 1u64 << 60, &mut buf));
        assert_eq!(buf, [0; 4]);
        assert!(mmio_write(&regions, 1u64 << 60, &buf));
    }

    #[test]
    fn range_straddling_region_end_faults() {
        let regions = region();
        let mut buf = [0u8; 8];
        assert!(!mmio_read(&regions, 0x1000_000c, &mut buf));
    }

    #[test]
    fn overlap_detection() {
        let regions = region();
        assert!(overlaps_any(&regions, 0x1000_000f, 1));
        assert!(overlaps_any(&regions, 0x0fff_fff0, 0x20));
        assert!(!overlaps_any(&regions, 0x1000_0010, 0x100));
    }

    #[test]
    fn op_size_bounds_validated() {
        let bad = MmioRegion::new(0, 16, 3, 4, Arc::new(WordDevice::new()));
        assert!(bad.validate().is_err());
        let too_wide = MmioRegion::new(0, 64, 4, 32, Arc::new(WordDevice::new()));
        assert!(too_wide.validate().is_err());
    }
}
