//! [`kthread::Platform`] implementation for x86-64.

use core::num::NonZeroUsize;
use core::ptr::NonNull;

use kthread::platform::{
    AddressSpace, Context, EntryFn, Interrupts, Page, PageAllocator, Switch, TimerDevice,
};
use kthread::IntrLevel;
use x86_64::registers::control::Cr3;
use x86_64::structures::paging::PhysFrame;
use x86_64::PhysAddr;

use crate::context::{prepare_frame, switch_frames, Selectors};
use crate::cpu;
use crate::pit::{Pit, PIT_VECTOR};

/// Services outside the CPU core that a board provides: the interrupt
/// controller's bookkeeping and the physical page allocator.
pub trait Board {
    /// True while an external interrupt handler runs.
    fn in_interrupt(&self) -> bool;

    /// Requests a yield when the current external interrupt returns.
    fn yield_on_return(&self);

    /// Routes interrupt `vector` to `handler`.
    fn register_handler(&self, vector: u8, handler: fn(), name: &'static str);

    /// Returns a zeroed page, or `None` when memory is exhausted.
    fn alloc_page(&self) -> Option<NonNull<Page>>;

    /// # Safety
    ///
    /// `page` must come from [`alloc_page`](Self::alloc_page) and be unused.
    unsafe fn free_page(&self, page: NonNull<Page>);
}

/// x86-64 machine: CPU services implemented here, the rest delegated to a
/// [`Board`].
pub struct X86_64<B: Board> {
    board: B,
    pit: Pit,
    selectors: Selectors,
    kernel_root: PhysFrame,
}

impl<B: Board> X86_64<B> {
    /// Uses the flat kernel GDT selectors and the boot page tables for
    /// threads without an address space of their own.
    pub fn new(board: B) -> Self {
        Self {
            board,
            pit: Pit::new(),
            selectors: Selectors::KERNEL,
            kernel_root: Cr3::read().0,
        }
    }

    pub fn with_selectors(mut self, selectors: Selectors) -> Self {
        self.selectors = selectors;
        self
    }

    pub fn board(&self) -> &B {
        &self.board
    }
}

impl<B: Board> Interrupts for X86_64<B> {
    fn level(&self) -> IntrLevel {
        cpu::level()
    }

    fn set_level(&self, level: IntrLevel) -> IntrLevel {
        cpu::set_level(level)
    }

    fn in_interrupt(&self) -> bool {
        self.board.in_interrupt()
    }

    fn yield_on_return(&self) {
        self.board.yield_on_return();
    }

    fn wait_for_interrupt(&self) {
        cpu::wait_for_interrupt();
    }
}

impl<B: Board> PageAllocator for X86_64<B> {
    fn alloc_zeroed(&self) -> Option<NonNull<Page>> {
        self.board.alloc_page()
    }

    unsafe fn free(&self, page: NonNull<Page>) {
        self.board.free_page(page);
    }
}

impl<B: Board> Switch for X86_64<B> {
    fn prepare(&self, ctx: &mut Context, stack_top: usize, entry: EntryFn, arg: usize) {
        prepare_frame(ctx, stack_top, entry, arg, self.selectors);
    }

    unsafe fn switch(&self, from: *mut Context, to: *const Context) {
        switch_frames(from, to);
    }
}

impl<B: Board> AddressSpace for X86_64<B> {
    /// Loads CR3 with the incoming thread's page-table root, or the boot
    /// tables for kernel threads. Skipped when the root is already active.
    fn activate(&self, root: Option<NonZeroUsize>) {
        let frame = match root {
            Some(root) => PhysFrame::containing_address(PhysAddr::new(root.get() as u64)),
            None => self.kernel_root,
        };
        let (active, flags) = Cr3::read();
        if active != frame {
            // SAFETY: the root comes from process management and maps the
            // kernel identically to the boot tables.
            unsafe { Cr3::write(frame, flags) };
        }
    }
}

impl<B: Board> TimerDevice for X86_64<B> {
    fn program_periodic(&self, hz: u32) {
        self.pit.program(hz);
    }

    fn register_tick_handler(&self, handler: fn()) {
        self.board.register_handler(PIT_VECTOR, handler, "8254 Timer");
    }
}
