//! Machine construction and lifecycle.
//!
//! The machine owns guest RAM, the MMIO registry, the monotonic guest timer,
//! and one hart per configured hardware thread. Hart threads borrow the
//! machine through an [`Arc<MachineState>`] handle that stays valid for the
//! machine's whole lifetime; devices are detached before harts are dropped.
//!
//! Lifecycle: create, configure (attach MMIO and load images while paused),
//! start, pause/resume/reset, drop.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::bus::{self, MmioRegion};
use crate::clint::Clint;
use crate::errors::MachineError;
use crate::hart::{Hart, HartShared};
use crate::intc::{ExternalLines, InterruptController};
use crate::jit::{JitCache, NoJit};
use crate::mem::{PhysicalRam, PAGE_MASK, PAGE_SIZE};

/// How often the eventloop thread ticks device `update` handlers.
const EVENTLOOP_PERIOD: Duration = Duration::from_millis(1);

/// Construction-time machine parameters.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub ram_base: u64,
    pub ram_size: u64,
    pub hart_count: usize,
    /// Whether harts reset into RV64 (RV32 otherwise).
    pub rv64: bool,
    /// Guest timebase frequency in Hz.
    pub timer_freq: u64,
    /// PC applied to every hart at reset.
    pub reset_pc: u64,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_base: 0x8000_0000,
            ram_size: 64 << 20,
            hart_count: 1,
            rv64: true,
            timer_freq: 10_000_000,
            reset_pc: 0x8000_0000,
        }
    }
}

/// Host-monotonic guest timebase.
///
/// The counter can be rebased by guest writes to `mtime` and is frozen while
/// the machine is paused so guest-visible time does not advance.
pub struct MachineTimer {
    freq: u64,
    inner: Mutex<TimerInner>,
}

struct TimerInner {
    origin: Instant,
    base: u64,
    frozen: Option<u64>,
}

impl MachineTimer {
    pub fn new(freq: u64) -> Self {
        Self {
            freq,
            inner: Mutex::new(TimerInner {
                origin: Instant::now(),
                base: 0,
                frozen: None,
            }),
        }
    }

    fn elapsed_ticks(&self, origin: Instant) -> u64 {
        (origin.elapsed().as_nanos() * self.freq as u128 / 1_000_000_000) as u64
    }

    /// Current guest timer value.
    pub fn now(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        match inner.frozen {
            Some(value) => value,
            None => inner.base.wrapping_add(self.elapsed_ticks(inner.origin)),
        }
    }

    /// Rebase the counter so it reads `value` now.
    pub fn rebase(&self, value: u64) {
        let mut inner = self.inner.lock().unwrap();
        if inner.frozen.is_some() {
            inner.frozen = Some(value);
        } else {
            inner.origin = Instant::now();
            inner.base = value;
        }
    }

    /// Stop the counter (machine pause).
    pub fn freeze(&self) {
        let mut inner = self.inner.lock().unwrap();
        if inner.frozen.is_none() {
            let now = inner.base.wrapping_add(self.elapsed_ticks(inner.origin));
            inner.frozen = Some(now);
        }
    }

    /// Resume the counter from its frozen value.
    pub fn unfreeze(&self) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(value) = inner.frozen.take() {
            inner.origin = Instant::now();
            inner.base = value;
        }
    }

    pub fn freq(&self) -> u64 {
        self.freq
    }

    /// Host duration until the counter reaches `target`, None when already
    /// reached or the target is unarmed (all ones).
    pub fn until(&self, target: u64) -> Option<Duration> {
        if target == u64::MAX {
            return None;
        }
        let now = self.now();
        if target <= now {
            return None;
        }
        let ticks = target - now;
        Some(Duration::from_nanos(
            (ticks as u128 * 1_000_000_000 / self.freq as u128).min(u64::MAX as u128) as u64,
        ))
    }
}

/// A device-initiated shutdown request (syscon-style).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownRequest {
    Poweroff,
    Reset,
}

/// Machine-wide state shared with every hart thread and device.
pub struct MachineState {
    pub ram: PhysicalRam,
    pub mmio: RwLock<Vec<MmioRegion>>,
    pub timer: Arc<MachineTimer>,
    pub harts: Vec<Arc<HartShared>>,
    pub jit: Box<dyn JitCache>,
    intc: RwLock<Arc<dyn InterruptController>>,
    shutdown: AtomicU32,
}

impl MachineState {
    /// Physical read: RAM fast path, then MMIO dispatch. False is a
    /// physical access fault.
    pub fn phys_read(&self, paddr: u64, buf: &mut [u8]) -> bool {
        if self.ram.read(paddr, buf) {
            return true;
        }
        bus::mmio_read(&self.mmio.read().unwrap(), paddr, buf)
    }

    /// Physical write: RAM fast path, then MMIO dispatch.
    pub fn phys_write(&self, paddr: u64, buf: &[u8]) -> bool {
        if self.ram.write(paddr, buf) {
            return true;
        }
        bus::mmio_write(&self.mmio.read().unwrap(), paddr, buf)
    }

    /// Host pointer for a whole naturally aligned page, when the page is
    /// RAM-backed or covered by a directly mapped region.
    pub fn host_page_ptr(&self, paddr: u64) -> Option<*mut u8> {
        let page = paddr & !PAGE_MASK;
        if let Some(ptr) = self.ram.translate_phys(page, PAGE_SIZE) {
            return Some(ptr);
        }
        let regions = self.mmio.read().unwrap();
        let region = bus::find_region(&regions, page, PAGE_SIZE)?;
        region
            .mapping
            .as_ref()
            .and_then(|m| m.at(page - region.addr, PAGE_SIZE))
    }

    /// Host pointer for an arbitrary RAM-backed (or mapped) byte range.
    pub fn host_ptr(&self, paddr: u64, len: u64) -> Option<*mut u8> {
        if let Some(ptr) = self.ram.translate_phys(paddr, len) {
            return Some(ptr);
        }
        let regions = self.mmio.read().unwrap();
        let region = bus::find_region(&regions, paddr, len)?;
        region
            .mapping
            .as_ref()
            .and_then(|m| m.at(paddr - region.addr, len))
    }

    /// The interrupt controller devices route their sources through. The
    /// hart itself never calls this; it only observes the pending bits the
    /// controller raises.
    pub fn intc(&self) -> Arc<dyn InterruptController> {
        self.intc.read().unwrap().clone()
    }

    /// Record a device-initiated shutdown request and kick every hart so
    /// the embedder notices promptly.
    pub fn request_shutdown(&self, req: ShutdownRequest) {
        let code = match req {
            ShutdownRequest::Poweroff => 1,
            ShutdownRequest::Reset => 2,
        };
        self.shutdown.store(code, Ordering::Release);
        for shared in &self.harts {
            shared.request_pause();
        }
    }

    /// Consume a pending shutdown request.
    pub fn take_shutdown_request(&self) -> Option<ShutdownRequest> {
        match self.shutdown.swap(0, Ordering::AcqRel) {
            1 => Some(ShutdownRequest::Poweroff),
            2 => Some(ShutdownRequest::Reset),
            _ => None,
        }
    }
}

struct HartSlot {
    shared: Arc<HartShared>,
    parked: Mutex<Option<Box<Hart>>>,
}

/// The owning handle: RAM, devices, harts, threads.
pub struct Machine {
    state: Arc<MachineState>,
    slots: Vec<Arc<HartSlot>>,
    threads: Vec<thread::JoinHandle<()>>,
    eventloop: Option<thread::JoinHandle<()>>,
    eventloop_stop: Arc<AtomicBool>,
    running: bool,
    boot_images: Vec<(u64, Vec<u8>)>,
    config: MachineConfig,
}

impl Machine {
    /// Build a paused machine with RAM, harts and the core-local interrupt
    /// device attached.
    pub fn new(config: MachineConfig) -> Result<Self, MachineError> {
        if config.hart_count == 0 {
            return Err(MachineError::NoHarts);
        }
        let ram = PhysicalRam::new(config.ram_base, config.ram_size)?;
        let timer = Arc::new(MachineTimer::new(config.timer_freq));
        timer.freeze();
        let harts: Vec<_> = (0..config.hart_count)
            .map(|_| Arc::new(HartShared::new()))
            .collect();
        let intc: Arc<dyn InterruptController> =
            Arc::new(ExternalLines::new(harts.clone(), 63));
        let state = Arc::new(MachineState {
            ram,
            mmio: RwLock::new(Vec::new()),
            timer: timer.clone(),
            harts: harts.clone(),
            jit: Box::new(NoJit),
            intc: RwLock::new(intc),
            shutdown: AtomicU32::new(0),
        });
        let slots = harts
            .iter()
            .enumerate()
            .map(|(id, shared)| {
                let hart = Hart::new(
                    state.clone(),
                    shared.clone(),
                    id,
                    config.rv64,
                    config.reset_pc,
                );
                Arc::new(HartSlot {
                    shared: shared.clone(),
                    parked: Mutex::new(Some(Box::new(hart))),
                })
            })
            .collect();
        let mut machine = Self {
            state,
            slots,
            threads: Vec::new(),
            eventloop: None,
            eventloop_stop: Arc::new(AtomicBool::new(false)),
            running: false,
            boot_images: Vec::new(),
            config,
        };
        let clint = Arc::new(Clint::new(harts, timer));
        machine.attach_mmio(clint.region())?;
        info!(
            "machine created: ram {:#x}..{:#x}, {} hart(s)",
            machine.config.ram_base,
            machine.config.ram_base + machine.config.ram_size,
            machine.config.hart_count
        );
        Ok(machine)
    }

    pub fn state(&self) -> &Arc<MachineState> {
        &self.state
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Attach an MMIO region. The machine must be paused; overlap with RAM
    /// or another region is rejected.
    pub fn attach_mmio(&mut self, region: MmioRegion) -> Result<(), MachineError> {
        if self.running {
            return Err(MachineError::MachineRunning);
        }
        region.validate()?;
        let end = region.addr.saturating_add(region.size);
        let ram_end = self.state.ram.base().saturating_add(self.state.ram.size());
        let mut regions = self.state.mmio.write().unwrap();
        if region.addr < ram_end && self.state.ram.base() < end
            || bus::overlaps_any(&regions, region.addr, region.size)
        {
            return Err(MachineError::MmioOverlap {
                addr: region.addr,
                end,
            });
        }
        debug!("mmio attached at {:#x} (+{:#x})", region.addr, region.size);
        regions.push(region);
        Ok(())
    }

    /// Replace the default wired-OR controller with an external one (PLIC,
    /// APLIC, ...). Only legal while the machine is paused, like any other
    /// topology change.
    pub fn set_intc(&mut self, intc: Arc<dyn InterruptController>) -> Result<(), MachineError> {
        if self.running {
            return Err(MachineError::MachineRunning);
        }
        *self.state.intc.write().unwrap() = intc;
        Ok(())
    }

    /// Detach the region based at `addr`, running its detach callback.
    pub fn detach_mmio(&mut self, addr: u64) -> Result<(), MachineError> {
        if self.running {
            return Err(MachineError::MachineRunning);
        }
        let mut regions = self.state.mmio.write().unwrap();
        let idx = regions
            .iter()
            .position(|r| r.addr == addr)
            .ok_or(MachineError::MmioNotFound(addr))?;
        let region = regions.remove(idx);
        region.device.detach();
        debug!("mmio detached at {addr:#x}");
        Ok(())
    }

    /// Copy a boot image into RAM and record it for re-application on reset.
    pub fn load_image(&mut self, addr: u64, image: &[u8]) -> Result<(), MachineError> {
        if !self.state.ram.write(addr, image) {
            return Err(MachineError::ImageOutOfRange {
                addr,
                len: image.len(),
            });
        }
        self.boot_images.push((addr, image.to_vec()));
        Ok(())
    }

    /// Run a closure against a paused hart's execution state.
    pub fn with_hart<R>(
        &self,
        hart: usize,
        f: impl FnOnce(&mut Hart) -> R,
    ) -> Result<R, MachineError> {
        if self.running {
            return Err(MachineError::MachineRunning);
        }
        let slot = self.slots.get(hart).ok_or(MachineError::NoSuchHart(hart))?;
        let mut parked = slot.parked.lock().unwrap();
        let hart = parked.as_mut().expect("paused hart is parked");
        Ok(f(hart))
    }

    /// Spawn hart threads and the device eventloop.
    pub fn start(&mut self) {
        if self.running {
            return;
        }
        // Cached translations may be stale after configuration changes.
        for slot in &self.slots {
            if let Some(hart) = slot.parked.lock().unwrap().as_mut() {
                hart.tlb.flush();
            }
        }
        self.state.timer.unfreeze();
        self.eventloop_stop.store(false, Ordering::Relaxed);
        if self.eventloop.is_none() {
            let state = self.state.clone();
            let stop = self.eventloop_stop.clone();
            self.eventloop = Some(thread::spawn(move || {
                while !stop.load(Ordering::Relaxed) {
                    for region in state.mmio.read().unwrap().iter() {
                        region.device.update();
                    }
                    thread::sleep(EVENTLOOP_PERIOD);
                }
            }));
        }
        for (id, slot) in self.slots.iter().enumerate() {
            let slot = slot.clone();
            let handle = thread::Builder::new()
                .name(format!("hart{id}"))
                .spawn(move || {
                    let mut hart = slot
                        .parked
                        .lock()
                        .unwrap()
                        .take()
                        .expect("hart parked before start");
                    hart.run();
                    *slot.parked.lock().unwrap() = Some(hart);
                })
                .expect("spawning a hart thread");
            self.threads.push(handle);
        }
        self.running = true;
        info!("machine started");
    }

    /// Stop every hart at its next instruction boundary and join the
    /// threads. Guest time freezes until resume.
    pub fn pause(&mut self) {
        if !self.running {
            return;
        }
        for slot in &self.slots {
            slot.shared.request_pause();
        }
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
        self.eventloop_stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.eventloop.take() {
            let _ = handle.join();
        }
        self.state.timer.freeze();
        self.running = false;
        info!("machine paused");
    }

    /// Resume a paused machine.
    pub fn resume(&mut self) {
        self.start();
    }

    /// Full machine reset: pause, reset devices in LIFO attach order,
    /// rewind the timer, re-apply boot images, reset harts, resume if the
    /// machine was running.
    pub fn reset(&mut self) {
        let was_running = self.running;
        self.pause();
        {
            let regions = self.state.mmio.read().unwrap();
            for region in regions.iter().rev() {
                region.device.reset();
            }
        }
        self.state.timer.rebase(0);
        for (addr, image) in &self.boot_images {
            // Recorded images fitted RAM when first loaded.
            self.state.ram.write(*addr, image);
        }
        for slot in &self.slots {
            if let Some(hart) = slot.parked.lock().unwrap().as_mut() {
                hart.reset(self.config.rv64, self.config.reset_pc);
            }
        }
        info!("machine reset");
        if was_running {
            self.resume();
        }
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        self.pause();
        // Devices go before harts, LIFO.
        let mut regions = self.state.mmio.write().unwrap();
        while let Some(region) = regions.pop() {
            region.device.detach();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_freeze_and_rebase() {
        let timer = MachineTimer::new(1_000_000_000);
        timer.rebase(100);
        assert!(timer.now() >= 100);
        timer.freeze();
        let frozen = timer.now();
        thread::sleep(Duration::from_millis(2));
        assert_eq!(timer.now(), frozen);
        timer.unfreeze();
        assert!(timer.now() >= frozen);
    }

    #[test]
    fn timer_until_deadline() {
        let timer = MachineTimer::new(1_000_000);
        timer.rebase(0);
        let wait = timer.until(1_000_000).expect("deadline in the future");
        assert!(wait <= Duration::from_secs(1));
        assert!(timer.until(0).is_none());
        assert!(timer.until(u64::MAX).is_none());
    }

    #[test]
    fn attach_rejects_overlap() {
        use crate::bus::{MmioDevice, MmioRegion};
        use std::sync::Arc;

        struct Dummy;
        impl MmioDevice for Dummy {
            fn read(&self, _: u64, _: &mut [u8]) -> bool {
                true
            }
            fn write(&self, _: u64, _: &[u8]) -> bool {
                true
            }
        }

        let mut machine = Machine::new(MachineConfig {
            ram_size: 2 << 20,
            ..Default::default()
        })
        .unwrap();
        // Overlaps RAM.
        let r = MmioRegion::new(0x8000_0000, 0x1000, 1, 8, Arc::new(Dummy));
        assert!(machine.attach_mmio(r).is_err());
        // Overlaps the CLINT.
        let r = MmioRegion::new(0x0200_8000, 0x1000, 1, 8, Arc::new(Dummy));
        assert!(machine.attach_mmio(r).is_err());
        // Free range.
        let r = MmioRegion::new(0x1000_0000, 0x1000, 1, 8, Arc::new(Dummy));
        assert!(machine.attach_mmio(r).is_ok());
        assert!(machine.detach_mmio(0x1000_0000).is_ok());
    }

    #[test]
    fn default_intc_drives_seip_on_the_target_hart() {
        use crate::trap::IRQ_SEIP;

        let machine = Machine::new(MachineConfig {
            ram_size: 1 << 20,
            hart_count: 2,
            ..Default::default()
        })
        .unwrap();
        let intc = machine.state().intc();
        let irq = intc.alloc_irq().expect("a free source");
        intc.raise_irq(1, irq);
        assert_eq!(machine.state().harts[0].irq_pending() & IRQ_SEIP, 0);
        assert_ne!(machine.state().harts[1].irq_pending() & IRQ_SEIP, 0);
        intc.lower_irq(1, irq);
        assert_eq!(machine.state().harts[1].irq_pending() & IRQ_SEIP, 0);
    }

    #[test]
    fn shutdown_request_round_trip() {
        let machine = Machine::new(MachineConfig {
            ram_size: 1 << 20,
            ..Default::default()
        })
        .unwrap();
        assert!(machine.state().take_shutdown_request().is_none());
        machine.state().request_shutdown(ShutdownRequest::Poweroff);
        assert_eq!(
            machine.state().take_shutdown_request(),
            Some(ShutdownRequest::Poweroff)
        );
        assert!(machine.state().take_shutdown_request().is_none());
    }
}
