//! External interrupt-controller ABI.
//!
//! The hart core does not know which interrupt controller is attached; it
//! only observes the pending-interrupt bits the controller raises on a hart.
//! A PLIC, APLIC or IMSIC model lives outside this crate and implements this
//! trait; [`ExternalLines`] is the built-in wired-OR controller the machine
//! installs by default, tracking each allocated source as a level per hart
//! and holding SEIP while any source stays asserted.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::hart::HartShared;
use crate::trap::Interrupt;

/// Controller operations the platform and devices call.
pub trait InterruptController: Send + Sync {
    /// Assert a level-triggered source.
    fn raise_irq(&self, hart: usize, irq: u32);

    /// Deassert a level-triggered source.
    fn lower_irq(&self, hart: usize, irq: u32);

    /// Deliver an edge: assert and let the target acknowledge.
    fn send_irq(&self, hart: usize, irq: u32);

    /// Hand out an unused source number, if any remain.
    fn alloc_irq(&self) -> Option<u32>;
}

/// Wired-OR of level-triggered sources onto SEIP per hart.
///
/// Source numbers are `1..=sources` (0 is reserved, matching the convention
/// that source 0 means "no interrupt"); the per-hart asserted set is a bit
/// per source, so at most 63 sources are tracked.
pub struct ExternalLines {
    harts: Vec<Arc<HartShared>>,
    asserted: Vec<AtomicU64>,
    next_irq: AtomicU32,
    limit: u32,
}

impl ExternalLines {
    pub fn new(harts: Vec<Arc<HartShared>>, sources: u32) -> Self {
        let asserted = harts.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            harts,
            asserted,
            next_irq: AtomicU32::new(1),
            limit: sources.min(63),
        }
    }

    fn line(&self, hart: usize, irq: u32) -> Option<(&HartShared, &AtomicU64)> {
        if irq == 0 || irq > self.limit {
            return None;
        }
        Some((self.harts.get(hart)?.as_ref(), self.asserted.get(hart)?))
    }
}

impl InterruptController for ExternalLines {
    fn raise_irq(&self, hart: usize, irq: u32) {
        let Some((shared, asserted)) = self.line(hart, irq) else {
            return;
        };
        asserted.fetch_or(1 << irq, Ordering::Relaxed);
        shared.raise_irq(Interrupt::SupervisorExternal as u32);
    }

    fn lower_irq(&self, hart: usize, irq: u32) {
        let Some((shared, asserted)) = self.line(hart, irq) else {
            return;
        };
        let prev = asserted.fetch_and(!(1u64 << irq), Ordering::Relaxed);
        // SEIP stays up until the last asserted source drops.
        if prev & !(1u64 << irq) == 0 {
            shared.lower_irq(Interrupt::SupervisorExternal as u32);
        }
    }

    fn send_irq(&self, hart: usize, irq: u32) {
        self.raise_irq(hart, irq);
    }

    fn alloc_irq(&self) -> Option<u32> {
        let irq = self.next_irq.fetch_add(1, Ordering::Relaxed);
        (irq <= self.limit).then_some(irq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trap::IRQ_SEIP;

    fn lines(hart_count: usize, sources: u32) -> (ExternalLines, Vec<Arc<HartShared>>) {
        let harts: Vec<_> = (0..hart_count)
            .map(|_| Arc::new(HartShared::new()))
            .collect();
        (ExternalLines::new(harts.clone(), sources), harts)
    }

    #[test]
    fn alloc_hands_out_every_source_then_runs_dry() {
        let (intc, _) = lines(1, 4);
        assert_eq!(intc.alloc_irq(), Some(1));
        assert_eq!(intc.alloc_irq(), Some(2));
        assert_eq!(intc.alloc_irq(), Some(3));
        assert_eq!(intc.alloc_irq(), Some(4));
        assert_eq!(intc.alloc_irq(), None);
        assert_eq!(intc.alloc_irq(), None);
    }

    #[test]
    fn seip_holds_until_every_source_drops() {
        let (intc, harts) = lines(1, 8);
        let a = intc.alloc_irq().unwrap();
        let b = intc.alloc_irq().unwrap();
        intc.raise_irq(0, a);
        intc.raise_irq(0, b);
        assert_ne!(harts[0].irq_pending() & IRQ_SEIP, 0);
        intc.lower_irq(0, a);
        assert_ne!(harts[0].irq_pending() & IRQ_SEIP, 0);
        intc.lower_irq(0, b);
        assert_eq!(harts[0].irq_pending() & IRQ_SEIP, 0);
    }

    #[test]
    fn sources_are_tracked_per_hart() {
        let (intc, harts) = lines(2, 8);
        let irq = intc.alloc_irq().unwrap();
        intc.send_irq(1, irq);
        assert_eq!(harts[0].irq_pending() & IRQ_SEIP, 0);
        assert_ne!(harts[1].irq_pending() & IRQ_SEIP, 0);
        intc.lower_irq(1, irq);
        assert_eq!(harts[1].irq_pending() & IRQ_SEIP, 0);
    }

    #[test]
    fn out_of_range_hart_and_source_are_ignored() {
        let (intc, harts) = lines(1, 4);
        intc.raise_irq(5, 1);
        intc.raise_irq(0, 0);
        intc.raise_irq(0, 99);
        assert_eq!(harts[0].irq_pending() & IRQ_SEIP, 0);
        // Lowering a source that was never raised must not disturb one that
        // was.
        intc.raise_irq(0, 2);
        intc.lower_irq(0, 3);
        assert_ne!(harts[0].irq_pending() & IRQ_SEIP, 0);
    }

    #[test]
    fn source_count_is_capped_by_the_mask_width() {
        let (intc, _) = lines(1, 1000);
        let mut last = 0;
        while let Some(irq) = intc.alloc_irq() {
            last = irq;
        }
        assert_eq!(last, 63);
    }
}
