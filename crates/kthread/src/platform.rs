//! Hardware boundary of the thread layer.
//!
//! Everything above these traits (queues, the thread state machine, the
//! dispatch policy) is portable. A port supplies interrupt-level control, a
//! page allocator, the context switch itself and, for the timer crate, a
//! periodic interrupt source.

use core::num::NonZeroUsize;
use core::ptr::NonNull;

/// Size of the page holding one thread's control block and stack.
pub const PAGE_SIZE: usize = 4096;

/// One page-aligned page of memory.
#[repr(C, align(4096))]
pub struct Page(pub [u8; PAGE_SIZE]);

/// Number of machine words reserved for a saved execution context.
pub const CONTEXT_WORDS: usize = 32;

/// Saved execution state of a thread that is not running.
///
/// The layout is defined by the port; the scheduler only hands out
/// pointers to it.
#[repr(C, align(16))]
pub struct Context {
    words: [usize; CONTEXT_WORDS],
}

impl Context {
    pub const fn new() -> Self {
        Self {
            words: [0; CONTEXT_WORDS],
        }
    }

    pub fn words(&self) -> &[usize; CONTEXT_WORDS] {
        &self.words
    }

    pub fn words_mut(&mut self) -> &mut [usize; CONTEXT_WORDS] {
        &mut self.words
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

/// Function a freshly prepared context starts executing, with one argument.
pub type EntryFn = extern "C" fn(usize) -> !;

/// Interrupt enable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntrLevel {
    On,
    Off,
}

/// Interrupt controller and CPU interrupt-flag services.
pub trait Interrupts {
    /// Returns the current interrupt level.
    fn level(&self) -> IntrLevel;

    /// Sets the interrupt level and returns the previous one.
    fn set_level(&self, level: IntrLevel) -> IntrLevel;

    /// Disables interrupts and returns the previous level.
    fn disable(&self) -> IntrLevel {
        self.set_level(IntrLevel::Off)
    }

    /// Enables interrupts and returns the previous level.
    fn enable(&self) -> IntrLevel {
        self.set_level(IntrLevel::On)
    }

    /// True while an external interrupt handler is executing.
    fn in_interrupt(&self) -> bool;

    /// Asks the interrupt dispatcher to yield the CPU just before returning
    /// from the handler that is currently executing.
    fn yield_on_return(&self);

    /// Enables interrupts and halts until the next one arrives.
    ///
    /// Enabling and halting must be atomic so that an interrupt arriving in
    /// between cannot be missed.
    fn wait_for_interrupt(&self);
}

/// Supplier of the pages that hold thread control blocks and stacks.
pub trait PageAllocator {
    /// Returns a zero-filled, page-aligned page, or `None` when exhausted.
    fn alloc_zeroed(&self) -> Option<NonNull<Page>>;

    /// Returns a page obtained from [`alloc_zeroed`](Self::alloc_zeroed).
    ///
    /// # Safety
    ///
    /// `page` must come from this allocator and must not be in use, which
    /// includes being the stack the CPU is executing on.
    unsafe fn free(&self, page: NonNull<Page>);
}

/// Low-level transfer of the CPU between execution contexts.
pub trait Switch {
    /// Fills `ctx` so that switching to it starts `entry(arg)` on a stack
    /// whose highest address is `stack_top`, with interrupts disabled.
    fn prepare(&self, ctx: &mut Context, stack_top: usize, entry: EntryFn, arg: usize);

    /// Saves the running context into `from` and resumes `to`.
    ///
    /// Returns when some later switch resumes `from`.
    ///
    /// # Safety
    ///
    /// Interrupts must be disabled. `from` must belong to the running thread
    /// and `to` must hold a context saved by `switch` or built by `prepare`.
    unsafe fn switch(&self, from: *mut Context, to: *const Context);
}

/// Address-space activation hook run on every context switch.
pub trait AddressSpace {
    /// Installs the page-table root of the incoming thread. `None` means the
    /// thread runs on the kernel-only address space.
    fn activate(&self, root: Option<NonZeroUsize>) {
        let _ = root;
    }
}

/// Periodic interrupt source driving the tick counter.
pub trait TimerDevice {
    /// Programs the device to interrupt `hz` times per second.
    fn program_periodic(&self, hz: u32);

    /// Registers the function invoked from interrupt context on every tick.
    fn register_tick_handler(&self, handler: fn());
}

/// Everything the scheduler needs from the hardware.
pub trait Platform: Interrupts + PageAllocator + Switch + AddressSpace {}

impl<T: Interrupts + PageAllocator + Switch + AddressSpace> Platform for T {}
