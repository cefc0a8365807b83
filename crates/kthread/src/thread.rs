//! Thread control blocks.
//!
//! A thread owns exactly one [`Page`]. Its control block sits at the bottom
//! of the page and its stack grows down from the top:
//!
//! ```text
//!  4 kB +---------------------------------+
//!       |          kernel stack           |
//!       |                |                |
//!       |                V                |
//!       |         grows downward          |
//!       +---------------------------------+
//!       |              magic              |
//!       |             context             |
//!       |               ...               |
//!       |               tid               |
//!  0 kB +---------------------------------+
//! ```
//!
//! A stack that overflows runs into `magic` first, which is why the canary
//! is the last field and is checked every time the running thread is
//! resolved.

use alloc::boxed::Box;
use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::num::NonZeroUsize;
use core::ops::Deref;
use core::ptr::NonNull;

use heapless::String;
use intrusive_collections::{intrusive_adapter, LinkedListLink, UnsafeRef};
use static_assertions::const_assert;

use crate::platform::{Context, Page, PAGE_SIZE};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Canary stored in every control block.
pub const THREAD_MAGIC: u32 = 0xcd6a_bf4b;

/// Maximum length of a thread name in bytes.
pub const NAME_CAPACITY: usize = 16;

/// Timer ticks since boot.
pub type Tick = i64;

/// Body of a thread, run once by the start trampoline.
pub type ThreadEntry = Box<dyn FnOnce() + Send + 'static>;

/// Thread identifier, unique for the lifetime of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Tid(pub u64);

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduling priority, higher runs first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Priority(u8);

impl Priority {
    pub const MIN: Priority = Priority(0);
    pub const DEFAULT: Priority = Priority(31);
    pub const MAX: Priority = Priority(63);

    /// # Panics
    ///
    /// Panics if `value` exceeds [`Priority::MAX`].
    pub const fn new(value: u8) -> Self {
        assert!(value <= Self::MAX.0, "priority exceeds supported range 0..=63");
        Self(value)
    }

    pub const fn get(self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread life cycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ThreadStatus {
    /// Currently executing. Exactly one thread is in this state.
    Running,
    /// Waiting in the ready queue.
    Ready,
    /// Waiting for an unblock, either from the sleep queue or from a
    /// synchronization primitive.
    Blocked,
    /// Exited; its page is reclaimed after the next switch away from it.
    Dying,
}

/// Thread control block.
#[repr(C)]
pub struct Thread {
    tid: Tid,
    status: Cell<ThreadStatus>,
    priority: Cell<Priority>,
    wakeup: Cell<Tick>,
    pub(crate) name: String<NAME_CAPACITY>,
    address_space: Cell<Option<NonZeroUsize>>,
    entry: Cell<Option<ThreadEntry>>,
    /// Link into the ready queue, the sleep queue or the destruction set.
    elem: LinkedListLink,
    context: UnsafeCell<Context>,
    magic: u32,
}

const_assert!(core::mem::size_of::<Thread>() <= PAGE_SIZE / 4);
const_assert!(core::mem::align_of::<Thread>() <= core::mem::align_of::<Page>());

intrusive_adapter!(pub(crate) ThreadAdapter = UnsafeRef<Thread>: Thread { elem: LinkedListLink });

impl Thread {
    /// Builds a blocked control block. `name` is cut to [`NAME_CAPACITY`]
    /// bytes on a character boundary.
    pub(crate) fn new(tid: Tid, name: &str, priority: Priority) -> Self {
        let mut short = String::new();
        for ch in name.chars() {
            if short.push(ch).is_err() {
                break;
            }
        }
        Self {
            tid,
            status: Cell::new(ThreadStatus::Blocked),
            priority: Cell::new(priority),
            wakeup: Cell::new(0),
            name: short,
            address_space: Cell::new(None),
            entry: Cell::new(None),
            elem: LinkedListLink::new(),
            context: UnsafeCell::new(Context::new()),
            magic: THREAD_MAGIC,
        }
    }

    /// Writes `thread` to the bottom of `page`. The rest of the page is left
    /// untouched, so a boot stack living in it survives.
    ///
    /// # Safety
    ///
    /// `page` must be valid for writes and owned by the new thread.
    pub(crate) unsafe fn install(page: NonNull<Page>, thread: Thread) -> ThreadRef {
        let tcb = page.cast::<Thread>();
        tcb.as_ptr().write(thread);
        ThreadRef(tcb)
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ThreadStatus {
        self.status.get()
    }

    pub(crate) fn set_status(&self, status: ThreadStatus) {
        self.status.set(status);
    }

    pub fn priority(&self) -> Priority {
        self.priority.get()
    }

    pub(crate) fn set_priority(&self, priority: Priority) {
        self.priority.set(priority);
    }

    /// Tick at which a sleeping thread becomes ready. Only meaningful while
    /// the thread is on the sleep queue.
    pub fn wakeup(&self) -> Tick {
        self.wakeup.get()
    }

    pub(crate) fn set_wakeup(&self, tick: Tick) {
        self.wakeup.set(tick);
    }

    /// Page-table root of a user process, `None` for kernel threads.
    pub fn address_space(&self) -> Option<NonZeroUsize> {
        self.address_space.get()
    }

    pub(crate) fn set_address_space(&self, root: Option<NonZeroUsize>) {
        self.address_space.set(root);
    }

    pub(crate) fn set_entry(&self, entry: ThreadEntry) {
        self.entry.set(Some(entry));
    }

    /// Removes the body so it can be run exactly once.
    pub(crate) fn take_entry(&self) -> Option<ThreadEntry> {
        self.entry.take()
    }

    /// True while the canary is intact.
    pub fn is_intact(&self) -> bool {
        self.magic == THREAD_MAGIC
    }

    pub(crate) fn is_queued(&self) -> bool {
        self.elem.is_linked()
    }

    pub(crate) fn context(&self) -> *mut Context {
        self.context.get()
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("name", &self.name())
            .field("status", &self.status())
            .field("priority", &self.priority())
            .finish()
    }
}

/// Handle to a thread control block.
///
/// Valid until the thread has exited and its page has been reclaimed.
/// Synchronization primitives hold these for their waiters.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct ThreadRef(NonNull<Thread>);

impl ThreadRef {
    pub(crate) fn from_raw(tcb: NonNull<Thread>) -> Self {
        Self(tcb)
    }

    pub(crate) fn from_queue(link: UnsafeRef<Thread>) -> Self {
        // SAFETY: queue entries always come from `to_queue`.
        Self(unsafe { NonNull::new_unchecked(UnsafeRef::into_raw(link)) })
    }

    pub(crate) fn to_queue(self) -> UnsafeRef<Thread> {
        // SAFETY: the control block outlives its membership in any queue;
        // it is only reclaimed after leaving the destruction set.
        unsafe { UnsafeRef::from_raw(self.0.as_ptr()) }
    }

    pub(crate) fn as_ptr(self) -> *mut Thread {
        self.0.as_ptr()
    }

    /// Page owning this control block and its stack.
    pub fn page(self) -> NonNull<Page> {
        self.0.cast()
    }

    /// Highest address of the thread's stack.
    pub fn stack_top(self) -> usize {
        self.0.as_ptr() as usize + PAGE_SIZE
    }
}

impl Deref for ThreadRef {
    type Target = Thread;

    fn deref(&self) -> &Thread {
        // SAFETY: see the type-level contract.
        unsafe { self.0.as_ref() }
    }
}

impl fmt::Debug for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}
