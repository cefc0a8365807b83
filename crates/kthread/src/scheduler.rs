//! Thread dispatcher.
//!
//! ## Scheduling Policy
//!
//! 1. The ready queue is kept in non-increasing priority order and the
//!    dispatcher always takes its front.
//! 2. With an empty ready queue the idle thread runs; it is never queued.
//! 3. The timer requests a preemption once a thread has run for a full time
//!    slice, and whenever a woken sleeper outranks the running thread.
//! 4. Requests raised in interrupt context are deferred until the handler
//!    returns; no switch ever happens inside a handler.
//!
//! All queue state is protected by disabling interrupts. A dying thread's
//! page cannot be freed while the CPU still runs on its stack, so
//! [`Scheduler`] parks it in a destruction set that is drained at the start
//! of the next `do_schedule`, which by then runs on another stack.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::num::NonZeroUsize;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, Ordering};

use critical_section::Mutex;

use crate::config::KernelConfig;
use crate::error::ThreadError;
use crate::platform::{IntrLevel, Page, Platform};
use crate::queue::{DestructionSet, ReadyQueue, SleepQueue};
use crate::sync::IntrGuard;
use crate::thread::{Priority, Thread, ThreadRef, ThreadStatus, Tick, Tid};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Tick accounting split by the kind of thread that was interrupted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ThreadStats {
    pub idle_ticks: u64,
    pub kernel_ticks: u64,
    pub user_ticks: u64,
    pub context_switches: u64,
}

struct Queues {
    ready: ReadyQueue,
    sleeping: SleepQueue,
    dying: DestructionSet,
    initial: Option<ThreadRef>,
    idle: Option<ThreadRef>,
    /// Ticks since the running thread was dispatched.
    slice_ticks: u32,
    stats: ThreadStats,
}

/// Preemptive single-core scheduler.
///
/// Threads created by the scheduler receive its address as their start
/// argument, so it must not move once [`init`](Self::init) has been called;
/// keep it in a `static` or behind an `Arc`.
pub struct Scheduler<P: Platform> {
    platform: P,
    config: KernelConfig,
    queues: Mutex<RefCell<Queues>>,
    current: AtomicPtr<Thread>,
    next_tid: Mutex<RefCell<u64>>,
}

// SAFETY: queue state is reached only through a `CriticalSection` token,
// i.e. with interrupts disabled on a single core.
unsafe impl<P: Platform + Send> Send for Scheduler<P> {}
unsafe impl<P: Platform + Sync> Sync for Scheduler<P> {}

impl<P: Platform> Scheduler<P> {
    /// Creates a scheduler with no threads.
    ///
    /// # Panics
    ///
    /// Panics if `config` does not validate.
    pub fn new(platform: P, config: KernelConfig) -> Self {
        if let Err(err) = config.validate() {
            panic!("invalid kernel configuration: {err}");
        }
        let order = config.tie_order;
        Self {
            platform,
            config,
            queues: Mutex::new(RefCell::new(Queues {
                ready: ReadyQueue::new(order),
                sleeping: SleepQueue::new(),
                dying: DestructionSet::new(),
                initial: None,
                idle: None,
                slice_ticks: 0,
                stats: ThreadStats::default(),
            })),
            current: AtomicPtr::new(ptr::null_mut()),
            next_tid: Mutex::new(RefCell::new(1)),
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Turns the running boot code into the initial thread.
    ///
    /// # Safety
    ///
    /// Interrupts must be off and `boot_page` must be the page whose top the
    /// boot stack grows down from. Its low end is overwritten with the
    /// control block. The page is never reclaimed.
    pub unsafe fn init(&self, boot_page: NonNull<Page>) -> Tid {
        assert_eq!(self.platform.level(), IntrLevel::Off, "init() requires interrupts off");
        assert!(self.current.load(Ordering::Acquire).is_null(), "scheduler initialized twice");

        let tid = self.allocate_tid();
        let thread = Thread::install(
            boot_page,
            Thread::new(tid, self.config.initial_name, Priority::DEFAULT),
        );
        thread.set_status(ThreadStatus::Running);
        self.with_queues(|q| q.initial = Some(thread));
        self.current.store(thread.as_ptr(), Ordering::Release);
        log::debug!("thread '{}' ({tid}) adopted as initial thread", thread.name());
        tid
    }

    /// Creates the idle thread and enables interrupts, which starts
    /// preemptive scheduling.
    pub fn start(&self) -> Result<(), ThreadError> {
        let page = self.platform.alloc_zeroed().ok_or(ThreadError::OutOfPages)?;
        let tid = self.allocate_tid();
        // SAFETY: the page is fresh from the allocator.
        let idle = unsafe {
            Thread::install(page, Thread::new(tid, self.config.idle_name, Priority::MIN))
        };
        // SAFETY: the idle thread is blocked, nothing runs on its context.
        self.platform.prepare(
            unsafe { &mut *idle.context() },
            idle.stack_top(),
            idle_main::<P>,
            self as *const Self as usize,
        );
        self.with_queues(|q| {
            assert!(q.idle.is_none(), "scheduler started twice");
            q.idle = Some(idle);
        });
        self.platform.enable();
        log::info!("scheduler started, idle thread {tid}");
        Ok(())
    }

    /// Creates a thread running `body` at `priority` and makes it ready.
    ///
    /// If the new thread outranks the caller, the caller yields right away,
    /// or from interrupt context, as soon as the handler returns.
    pub fn spawn<F>(&self, name: &str, priority: Priority, body: F) -> Result<Tid, ThreadError>
    where
        F: FnOnce() + Send + 'static,
    {
        let page = self.platform.alloc_zeroed().ok_or(ThreadError::OutOfPages)?;
        let tid = self.allocate_tid();
        // SAFETY: the page is fresh from the allocator.
        let thread = unsafe { Thread::install(page, Thread::new(tid, name, priority)) };
        thread.set_entry(Box::new(body));
        // SAFETY: the thread is blocked and unknown to anyone else.
        self.platform.prepare(
            unsafe { &mut *thread.context() },
            thread.stack_top(),
            thread_start::<P>,
            self as *const Self as usize,
        );
        log::debug!("created thread '{}' ({tid}) at priority {priority}", thread.name());

        self.unblock(thread);
        if priority > self.current().priority() {
            self.preempt();
        }
        Ok(tid)
    }

    /// Puts the running thread to sleep until [`unblock`](Self::unblock) is
    /// called on it.
    ///
    /// # Panics
    ///
    /// Panics from interrupt context or with interrupts enabled.
    pub fn block(&self) {
        assert!(!self.platform.in_interrupt(), "block() called from interrupt context");
        assert_eq!(self.platform.level(), IntrLevel::Off, "block() requires interrupts off");
        self.do_schedule(ThreadStatus::Blocked);
    }

    /// Moves a blocked thread to the ready queue.
    ///
    /// Does not preempt the running thread; callers that need that check
    /// priorities themselves.
    ///
    /// # Panics
    ///
    /// Panics if `thread` is not blocked.
    pub fn unblock(&self, thread: ThreadRef) {
        self.with_queues(|q| make_ready(q, thread));
    }

    /// Returns the running thread.
    ///
    /// # Panics
    ///
    /// Panics if the running thread's canary is clobbered (its stack
    /// overflowed into the control block) or it is not marked running.
    pub fn current(&self) -> ThreadRef {
        let thread = self.running();
        assert!(
            thread.is_intact(),
            "stack overflow: control block canary of thread {} clobbered",
            thread.tid()
        );
        assert_eq!(thread.status(), ThreadStatus::Running, "current thread is not running");
        thread
    }

    pub fn tid(&self) -> Tid {
        self.current().tid()
    }

    pub fn name(&self) -> heapless::String<{ crate::thread::NAME_CAPACITY }> {
        self.current().name.clone()
    }

    pub fn id_of(&self, thread: ThreadRef) -> Tid {
        thread.tid()
    }

    /// Attaches a page-table root to the running thread. It is installed
    /// through the platform on every switch to the thread, and the thread
    /// counts as a user thread in the statistics.
    pub fn set_address_space(&self, root: Option<NonZeroUsize>) {
        self.current().set_address_space(root);
    }

    /// Terminates the running thread. Never returns.
    pub fn exit(&self) -> ! {
        self.retire();
        unreachable!("dying thread was scheduled again");
    }

    /// Marks the running thread dying and switches away from it.
    pub(crate) fn retire(&self) {
        assert!(!self.platform.in_interrupt(), "exit() called from interrupt context");
        self.platform.disable();
        let current = self.current();
        log::debug!("thread '{}' ({}) exiting", current.name(), current.tid());
        self.do_schedule(ThreadStatus::Dying);
    }

    /// Gives up the CPU. The caller stays ready and may be picked again
    /// immediately.
    pub fn yield_now(&self) {
        assert!(!self.platform.in_interrupt(), "yield_now() called from interrupt context");
        let _guard = IntrGuard::new(&self.platform);
        let current = self.current();
        self.with_queues(|q| {
            if q.idle != Some(current) {
                q.ready.push(current);
            }
        });
        self.do_schedule(ThreadStatus::Ready);
    }

    pub fn priority(&self) -> Priority {
        self.current().priority()
    }

    /// Changes the running thread's priority and yields if a ready thread
    /// now outranks it.
    pub fn set_priority(&self, priority: Priority) {
        let current = self.current();
        current.set_priority(priority);
        let front = self.with_queues(|q| q.ready.front_priority());
        if front.map_or(false, |front| front > priority) {
            self.preempt();
        }
    }

    /// Blocks the running thread until [`wake`](Self::wake) is called with a
    /// tick at or after `wakeup`. The idle thread is never put to sleep.
    ///
    /// # Panics
    ///
    /// Panics unless interrupts are enabled on entry.
    pub fn sleep_until(&self, wakeup: Tick) {
        let current = self.current();
        if self.is_idle(current) {
            return;
        }
        assert!(!self.platform.in_interrupt(), "sleep_until() called from interrupt context");
        assert_eq!(
            self.platform.level(),
            IntrLevel::On,
            "sleep_until() requires interrupts on"
        );

        let old = self.platform.disable();
        current.set_wakeup(wakeup);
        self.with_queues(|q| q.sleeping.push(current));
        self.block();
        self.platform.set_level(old);
    }

    /// Makes every sleeper due at `now` ready and returns how many woke up.
    ///
    /// If one of them outranks the running thread, a preemption is requested
    /// for interrupt return, or performed directly from thread context.
    pub fn wake(&self, now: Tick) -> usize {
        let running = self.current().priority();
        let (woken, outranked) = self.with_queues(|q| {
            let mut woken = 0;
            let mut outranked = false;
            while let Some(thread) = q.sleeping.pop_due(now) {
                make_ready(q, thread);
                woken += 1;
                outranked |= thread.priority() > running;
            }
            (woken, outranked)
        });
        if outranked {
            self.preempt();
        }
        woken
    }

    /// Per-tick accounting, called by the timer interrupt handler.
    ///
    /// Requests a preemption once the running thread has used its slice.
    pub fn tick(&self) {
        assert!(self.platform.in_interrupt(), "tick() called outside interrupt context");
        let current = self.current();
        let slice = self.config.time_slice;
        let expired = self.with_queues(|q| {
            if q.idle == Some(current) {
                q.stats.idle_ticks += 1;
            } else if current.address_space().is_some() {
                q.stats.user_ticks += 1;
            } else {
                q.stats.kernel_ticks += 1;
            }
            q.slice_ticks += 1;
            q.slice_ticks >= slice
        });
        if expired {
            self.platform.yield_on_return();
        }
    }

    pub fn stats(&self) -> ThreadStats {
        self.with_queues(|q| q.stats)
    }

    /// Logs the tick accounting and returns it.
    pub fn print_stats(&self) -> ThreadStats {
        let stats = self.stats();
        log::info!(
            "Thread: {} idle ticks, {} kernel ticks, {} user ticks",
            stats.idle_ticks,
            stats.kernel_ticks,
            stats.user_ticks
        );
        stats
    }

    /// Ready threads in dispatch order.
    pub fn ready_threads(&self) -> Vec<(Tid, Priority)> {
        self.with_queues(|q| q.ready.snapshot())
    }

    /// Sleeping threads in wakeup order with their wakeup ticks.
    pub fn sleeping_threads(&self) -> Vec<(Tid, Tick)> {
        self.with_queues(|q| q.sleeping.snapshot())
    }

    /// Number of dying threads whose pages are not yet reclaimed.
    pub fn pending_reclaim(&self) -> usize {
        self.with_queues(|q| q.dying.len())
    }

    pub fn idle_thread(&self) -> Option<ThreadRef> {
        self.with_queues(|q| q.idle)
    }

    fn is_idle(&self, thread: ThreadRef) -> bool {
        self.idle_thread() == Some(thread)
    }

    /// Yields now from thread context, or on interrupt return from a handler.
    fn preempt(&self) {
        if self.platform.in_interrupt() {
            self.platform.yield_on_return();
        } else {
            self.yield_now();
        }
    }

    fn allocate_tid(&self) -> Tid {
        let guard = IntrGuard::new(&self.platform);
        let mut next = self.next_tid.borrow_ref_mut(guard.cs());
        let tid = Tid(*next);
        *next += 1;
        tid
    }

    /// Runs `f` on the queue state inside a critical section. Must not be
    /// re-entered from `f`.
    fn with_queues<R>(&self, f: impl FnOnce(&mut Queues) -> R) -> R {
        let guard = IntrGuard::new(&self.platform);
        let mut queues = self.queues.borrow_ref_mut(guard.cs());
        f(&mut queues)
    }

    fn running(&self) -> ThreadRef {
        let ptr = NonNull::new(self.current.load(Ordering::Acquire));
        match ptr {
            Some(ptr) => ThreadRef::from_raw(ptr),
            None => panic!("scheduler used before init()"),
        }
    }

    /// Reclaims finished threads, gives the running thread `status` and
    /// dispatches the next one.
    fn do_schedule(&self, status: ThreadStatus) {
        assert_eq!(self.platform.level(), IntrLevel::Off, "scheduling with interrupts on");
        let current = self.current();
        while let Some(victim) = self.with_queues(|q| q.dying.pop()) {
            self.reclaim(victim);
        }
        current.set_status(status);
        self.schedule();
    }

    fn schedule(&self) {
        assert_eq!(self.platform.level(), IntrLevel::Off, "scheduling with interrupts on");
        let current = self.running();
        assert_ne!(current.status(), ThreadStatus::Running, "running thread was not moved out");

        let next = self.with_queues(|q| {
            q.slice_ticks = 0;
            q.ready.pop().or(q.idle)
        });
        let next = match next {
            Some(next) => next,
            None => panic!("no thread to run and no idle thread"),
        };
        assert!(next.is_intact(), "dispatching a corrupted thread control block");
        next.set_status(ThreadStatus::Running);

        if current == next {
            return;
        }
        self.with_queues(|q| {
            if current.status() == ThreadStatus::Dying && q.initial != Some(current) {
                q.dying.push(current);
            }
            q.stats.context_switches += 1;
        });
        self.platform.activate(next.address_space());
        log::trace!("switch {} -> {}", current.tid(), next.tid());
        self.current.store(next.as_ptr(), Ordering::Release);
        // SAFETY: interrupts are off, `current` is the running thread and
        // `next` holds a context saved by `switch` or built by `prepare`.
        unsafe { self.platform.switch(current.context(), next.context()) };
    }

    /// Drops a dead control block and returns its page.
    fn reclaim(&self, victim: ThreadRef) {
        assert_eq!(victim.status(), ThreadStatus::Dying);
        assert_ne!(Some(victim), self.with_queues(|q| q.initial));
        let page = victim.page();
        log::trace!("reclaiming page of thread {}", victim.tid());
        // SAFETY: the thread is dead, unlinked and its stack is not in use;
        // nothing refers to the control block any more.
        unsafe {
            ptr::drop_in_place(victim.as_ptr());
            self.platform.free(page);
        }
    }

    #[cfg(test)]
    pub(crate) fn running_thread(&self) -> ThreadRef {
        self.running()
    }
}

/// Blocked -> Ready transition shared by `unblock` and the wake scan.
fn make_ready(q: &mut Queues, thread: ThreadRef) {
    assert_eq!(
        thread.status(),
        ThreadStatus::Blocked,
        "unblocking thread {} which is not blocked",
        thread.tid()
    );
    assert!(!thread.is_queued(), "thread {} is already queued", thread.tid());
    q.ready.push(thread);
    thread.set_status(ThreadStatus::Ready);
}

/// First code run by every created thread.
extern "C" fn thread_start<P: Platform>(sched: usize) -> ! {
    // SAFETY: `spawn` passes the address of a scheduler that never moves.
    let sched = unsafe { &*(sched as *const Scheduler<P>) };
    sched.platform.enable();
    if let Some(body) = sched.current().take_entry() {
        body();
    }
    sched.exit()
}

/// Body of the idle thread.
///
/// Blocks itself so that it only runs when the ready queue is empty, then
/// halts until the next interrupt.
extern "C" fn idle_main<P: Platform>(sched: usize) -> ! {
    // SAFETY: `start` passes the address of a scheduler that never moves.
    let sched = unsafe { &*(sched as *const Scheduler<P>) };
    loop {
        sched.platform.disable();
        sched.block();
        sched.platform.wait_for_interrupt();
    }
}
