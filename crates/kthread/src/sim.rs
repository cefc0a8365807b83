//! Host simulation platform.
//!
//! Runs the real scheduler on a hosted target. Interrupt state is a pair of
//! flags, pages come from the global allocator, and a context switch only
//! records which contexts were involved: the caller keeps running on the
//! host stack, acting on behalf of whichever thread the scheduler now
//! considers current. Thread bodies are never executed by the simulator.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::num::NonZeroUsize;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::vec::Vec;

use spin::Mutex;

use crate::config::KernelConfig;
use crate::platform::{
    AddressSpace, Context, EntryFn, IntrLevel, Interrupts, Page, PageAllocator, Switch,
    TimerDevice,
};
use crate::scheduler::Scheduler;
use crate::sync::Arc;

/// Word indices used by [`SimPlatform::prepare`].
pub const FRAME_ENTRY: usize = 0;
pub const FRAME_ARG: usize = 1;
pub const FRAME_STACK_TOP: usize = 2;

/// One recorded context switch, by context address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwitchRecord {
    pub from: usize,
    pub to: usize,
}

/// Simulated single-core machine.
pub struct SimPlatform {
    intr_on: AtomicBool,
    in_irq: AtomicBool,
    yield_requests: AtomicUsize,
    idle_waits: AtomicUsize,
    live_pages: AtomicUsize,
    page_limit: AtomicUsize,
    timer_hz: AtomicU32,
    tick_handler: Mutex<Option<fn()>>,
    switches: Mutex<Vec<SwitchRecord>>,
    activations: Mutex<Vec<Option<NonZeroUsize>>>,
    switch_hook: Mutex<Option<SwitchHook>>,
}

type SwitchHook = Arc<dyn Fn() + Send + Sync>;

impl Default for SimPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl SimPlatform {
    /// Creates a machine with interrupts off, as after boot.
    pub fn new() -> Self {
        Self {
            intr_on: AtomicBool::new(false),
            in_irq: AtomicBool::new(false),
            yield_requests: AtomicUsize::new(0),
            idle_waits: AtomicUsize::new(0),
            live_pages: AtomicUsize::new(0),
            page_limit: AtomicUsize::new(usize::MAX),
            timer_hz: AtomicU32::new(0),
            tick_handler: Mutex::new(None),
            switches: Mutex::new(Vec::new()),
            activations: Mutex::new(Vec::new()),
            switch_hook: Mutex::new(None),
        }
    }

    /// Caps the number of pages that may be live at once.
    pub fn with_page_limit(self, limit: usize) -> Self {
        self.page_limit.store(limit, Ordering::Relaxed);
        self
    }

    /// Runs `hook` after every recorded context switch, on behalf of the
    /// incoming thread. Lets a test deliver timer interrupts while a thread
    /// is away from the CPU.
    pub fn on_switch(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.switch_hook.lock() = Some(Arc::new(hook));
    }

    /// Allocates a page standing in for the boot stack. It is not counted
    /// as live and is never freed.
    pub fn boot_page(&self) -> NonNull<Page> {
        let page = Box::leak(Box::new(Page([0; crate::platform::PAGE_SIZE])));
        NonNull::from(page)
    }

    /// Marks the machine as executing an interrupt handler until the guard
    /// is dropped.
    pub fn enter_interrupt(&self) -> InterruptScope<'_> {
        assert!(!self.in_irq.swap(true, Ordering::AcqRel), "nested interrupt");
        let was_on = self.intr_on.swap(false, Ordering::AcqRel);
        InterruptScope {
            platform: self,
            was_on,
        }
    }

    pub fn yield_requests(&self) -> usize {
        self.yield_requests.load(Ordering::Acquire)
    }

    pub fn idle_waits(&self) -> usize {
        self.idle_waits.load(Ordering::Acquire)
    }

    /// Pages handed out and not yet freed.
    pub fn live_pages(&self) -> usize {
        self.live_pages.load(Ordering::Acquire)
    }

    pub fn switches(&self) -> Vec<SwitchRecord> {
        self.switches.lock().clone()
    }

    pub fn activations(&self) -> Vec<Option<NonZeroUsize>> {
        self.activations.lock().clone()
    }

    pub fn timer_hz(&self) -> u32 {
        self.timer_hz.load(Ordering::Acquire)
    }

    pub fn tick_handler(&self) -> Option<fn()> {
        *self.tick_handler.lock()
    }

    fn page_layout() -> Layout {
        Layout::new::<Page>()
    }
}

/// Guard returned by [`SimPlatform::enter_interrupt`].
pub struct InterruptScope<'a> {
    platform: &'a SimPlatform,
    was_on: bool,
}

impl Drop for InterruptScope<'_> {
    fn drop(&mut self) {
        self.platform.in_irq.store(false, Ordering::Release);
        self.platform.intr_on.store(self.was_on, Ordering::Release);
    }
}

impl Interrupts for SimPlatform {
    fn level(&self) -> IntrLevel {
        if self.intr_on.load(Ordering::Acquire) {
            IntrLevel::On
        } else {
            IntrLevel::Off
        }
    }

    fn set_level(&self, level: IntrLevel) -> IntrLevel {
        let was_on = self.intr_on.swap(level == IntrLevel::On, Ordering::AcqRel);
        if was_on {
            IntrLevel::On
        } else {
            IntrLevel::Off
        }
    }

    fn in_interrupt(&self) -> bool {
        self.in_irq.load(Ordering::Acquire)
    }

    fn yield_on_return(&self) {
        assert!(self.in_interrupt(), "yield_on_return() outside interrupt context");
        self.yield_requests.fetch_add(1, Ordering::AcqRel);
    }

    fn wait_for_interrupt(&self) {
        self.intr_on.store(true, Ordering::Release);
        self.idle_waits.fetch_add(1, Ordering::AcqRel);
    }
}

impl PageAllocator for SimPlatform {
    fn alloc_zeroed(&self) -> Option<NonNull<Page>> {
        let limit = self.page_limit.load(Ordering::Acquire);
        let reserved = self
            .live_pages
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < limit).then_some(live + 1)
            });
        if reserved.is_err() {
            return None;
        }
        // SAFETY: `Page` has a non-zero size.
        let page = NonNull::new(unsafe { alloc_zeroed(Self::page_layout()) }.cast::<Page>());
        if page.is_none() {
            self.live_pages.fetch_sub(1, Ordering::AcqRel);
        }
        page
    }

    unsafe fn free(&self, page: NonNull<Page>) {
        dealloc(page.as_ptr().cast(), Self::page_layout());
        self.live_pages.fetch_sub(1, Ordering::AcqRel);
    }
}

impl Switch for SimPlatform {
    fn prepare(&self, ctx: &mut Context, stack_top: usize, entry: EntryFn, arg: usize) {
        let words = ctx.words_mut();
        words[FRAME_ENTRY] = entry as usize;
        words[FRAME_ARG] = arg;
        words[FRAME_STACK_TOP] = stack_top;
    }

    unsafe fn switch(&self, from: *mut Context, to: *const Context) {
        assert_eq!(self.level(), IntrLevel::Off, "context switch with interrupts on");
        self.switches.lock().push(SwitchRecord {
            from: from as usize,
            to: to as usize,
        });
        let hook = self.switch_hook.lock().clone();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl AddressSpace for SimPlatform {
    fn activate(&self, root: Option<NonZeroUsize>) {
        self.activations.lock().push(root);
    }
}

impl TimerDevice for SimPlatform {
    fn program_periodic(&self, hz: u32) {
        self.timer_hz.store(hz, Ordering::Release);
    }

    fn register_tick_handler(&self, handler: fn()) {
        *self.tick_handler.lock() = Some(handler);
    }
}

/// Builds a scheduler on a fresh [`SimPlatform`] and adopts a boot page as
/// the initial thread. The scheduler is not started.
pub fn boot(config: KernelConfig) -> Arc<Scheduler<SimPlatform>> {
    boot_on(SimPlatform::new(), config)
}

/// Like [`boot`] on a caller-supplied platform.
pub fn boot_on(platform: SimPlatform, config: KernelConfig) -> Arc<Scheduler<SimPlatform>> {
    let sched = Arc::new(Scheduler::new(platform, config));
    let page = sched.platform().boot_page();
    // SAFETY: the simulated machine boots with interrupts off and the boot
    // page is dedicated to the initial thread.
    unsafe { sched.init(page) };
    sched
}
