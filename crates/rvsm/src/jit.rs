//! Code-cache invalidation hooks.
//!
//! The core is a pure interpreter; an accelerator backend can register one of
//! these to learn when guest code pages are clobbered. The default hook does
//! nothing.

/// Abstract interface a compiled-code cache exposes to the core.
pub trait JitCache: Send + Sync {
    /// A store hit the given physical page; any compiled block covering it
    /// must be discarded.
    fn invalidate_page(&self, _paddr: u64) {}

    /// FENCE.I: discard the whole cache.
    fn flush(&self) {}
}

/// The interpreter-only hook.
pub struct NoJit;

impl JitCache for NoJit {}
