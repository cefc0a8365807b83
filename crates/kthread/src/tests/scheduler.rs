use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{KernelConfig, TieOrder};
use crate::error::ThreadError;
use crate::platform::{IntrLevel, Interrupts, PAGE_SIZE};
use crate::scheduler::Scheduler;
use crate::sim::{self, SimPlatform, FRAME_ARG, FRAME_STACK_TOP};
use crate::thread::{Priority, Thread, ThreadStatus, Tid};

fn booted() -> Arc<Scheduler<SimPlatform>> {
    sim::boot(KernelConfig::default())
}

fn started() -> Arc<Scheduler<SimPlatform>> {
    let sched = booted();
    sched.start().expect("idle thread");
    sched
}

fn noop() {}

#[test]
fn init_adopts_boot_thread() {
    let sched = booted();
    let main = sched.current();
    assert_eq!(main.tid(), Tid(1));
    assert_eq!(main.name(), "main");
    assert_eq!(main.priority(), Priority::DEFAULT);
    assert_eq!(main.status(), ThreadStatus::Running);
    assert_eq!(sched.tid(), Tid(1));
    assert_eq!(sched.name().as_str(), "main");
    assert_eq!(sched.platform().live_pages(), 0);
}

#[test]
fn start_creates_idle_without_queueing_it() {
    let sched = booted();
    sched.start().unwrap();

    let idle = sched.idle_thread().expect("idle thread");
    assert_eq!(idle.name(), "idle");
    assert_eq!(idle.priority(), Priority::MIN);
    assert_eq!(idle.status(), ThreadStatus::Blocked);
    assert!(sched.ready_threads().is_empty());
    assert_eq!(sched.platform().level(), IntrLevel::On);
    assert_eq!(sched.platform().live_pages(), 1);
}

#[test]
fn spawn_orders_ready_queue_by_priority() {
    let sched = booted();
    let a = sched.spawn("a", Priority::new(10), noop).unwrap();
    let b = sched.spawn("b", Priority::new(20), noop).unwrap();
    let c = sched.spawn("c", Priority::new(15), noop).unwrap();

    let order: Vec<Tid> = sched.ready_threads().into_iter().map(|(tid, _)| tid).collect();
    assert_eq!(order, vec![b, c, a]);
    assert_eq!(sched.current().tid(), Tid(1));
    assert!(sched.platform().switches().is_empty());
}

#[test]
fn name_reports_stored_short_name() {
    let sched = started();
    sched.spawn("network-rx-worker-0", Priority::new(40), noop).unwrap();
    assert_eq!(sched.name().as_str(), "network-rx-worke");
    assert_eq!(sched.name().as_str(), sched.current().name());
}

#[test]
fn tids_increase_monotonically() {
    let sched = started();
    let first = sched.spawn("a", Priority::new(1), noop).unwrap();
    let second = sched.spawn("b", Priority::new(1), noop).unwrap();
    assert_eq!(sched.idle_thread().unwrap().tid(), Tid(2));
    assert_eq!(first, Tid(3));
    assert_eq!(second, Tid(4));
}

#[test]
fn lifo_tie_order_runs_newest_first() {
    let config = KernelConfig::builder().tie_order(TieOrder::Lifo).build().unwrap();
    let sched = sim::boot(config);
    let a = sched.spawn("a", Priority::new(10), noop).unwrap();
    let b = sched.spawn("b", Priority::new(10), noop).unwrap();

    let order: Vec<Tid> = sched.ready_threads().into_iter().map(|(tid, _)| tid).collect();
    assert_eq!(order, vec![b, a]);
}

#[test]
fn spawn_higher_priority_preempts_creator() {
    let sched = started();
    let main = sched.current();
    let hi = sched.spawn("hi", Priority::new(40), noop).unwrap();

    assert_eq!(sched.current().tid(), hi);
    assert_eq!(main.status(), ThreadStatus::Ready);
    assert_eq!(sched.ready_threads(), vec![(main.tid(), Priority::DEFAULT)]);
    assert_eq!(sched.platform().switches().len(), 1);
}

#[test]
fn spawn_from_interrupt_defers_preemption() {
    let sched = started();
    let platform = sched.platform();
    {
        let _irq = platform.enter_interrupt();
        sched.spawn("hi", Priority::new(40), noop).unwrap();
    }
    assert_eq!(platform.yield_requests(), 1);
    assert_eq!(sched.current().tid(), Tid(1));
    assert!(platform.switches().is_empty());
}

#[test]
fn spawned_context_starts_on_its_own_stack() {
    let sched = started();
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();
    sched
        .spawn("body", Priority::new(50), move || flag.store(true, Ordering::SeqCst))
        .unwrap();

    let thread = sched.current();
    // SAFETY: the simulator never writes the context after `prepare`.
    let words = unsafe { &*thread.context() }.words();
    assert_eq!(words[FRAME_STACK_TOP], thread.stack_top());
    assert_eq!(words[FRAME_STACK_TOP], thread.page().as_ptr() as usize + PAGE_SIZE);
    assert_eq!(words[FRAME_ARG], Arc::as_ptr(&sched) as usize);

    let body = thread.take_entry().expect("entry installed");
    body();
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn out_of_pages_is_reported() {
    let sched = sim::boot_on(SimPlatform::new().with_page_limit(1), KernelConfig::default());
    assert!(sched.spawn("a", Priority::new(1), noop).is_ok());
    assert_eq!(sched.spawn("b", Priority::new(1), noop), Err(ThreadError::OutOfPages));
    assert_eq!(sched.start(), Err(ThreadError::OutOfPages));
}

#[test]
fn block_prefers_ready_threads_over_idle() {
    let sched = started();
    let main = sched.current();
    let low = sched.spawn("low", Priority::new(1), noop).unwrap();

    sched.platform().disable();
    sched.block();

    assert_eq!(main.status(), ThreadStatus::Blocked);
    assert_eq!(sched.current().tid(), low);
    assert!(sched.ready_threads().is_empty());
}

#[test]
fn block_with_nothing_ready_runs_idle() {
    let sched = started();
    sched.platform().disable();
    sched.block();
    assert_eq!(Some(sched.current()), sched.idle_thread());
}

#[test]
fn unblock_readies_without_preempting() {
    let sched = started();
    let main = sched.current();
    sched.platform().disable();
    sched.block();
    sched.platform().enable();

    sched.unblock(main);
    assert_eq!(main.status(), ThreadStatus::Ready);
    assert_eq!(Some(sched.current()), sched.idle_thread());
    assert_eq!(sched.ready_threads(), vec![(main.tid(), Priority::DEFAULT)]);
}

#[test]
#[should_panic(expected = "not blocked")]
fn unblock_of_running_thread_panics() {
    let sched = booted();
    let main = sched.current();
    sched.unblock(main);
}

#[test]
#[should_panic(expected = "interrupt context")]
fn block_from_interrupt_panics() {
    let sched = started();
    let _irq = sched.platform().enter_interrupt();
    sched.block();
}

#[test]
#[should_panic(expected = "requires interrupts off")]
fn block_with_interrupts_on_panics() {
    let sched = started();
    sched.block();
}

#[test]
fn yield_keeps_caller_runnable() {
    let sched = started();
    let main = sched.current();
    let peer = sched.spawn("peer", Priority::DEFAULT, noop).unwrap();

    sched.yield_now();
    assert_eq!(sched.current().tid(), peer);
    assert_eq!(sched.ready_threads(), vec![(main.tid(), Priority::DEFAULT)]);

    sched.yield_now();
    assert_eq!(sched.current(), main);
    assert_eq!(sched.platform().level(), IntrLevel::On);
}

#[test]
fn yield_from_idle_does_not_queue_idle() {
    let sched = started();
    sched.platform().disable();
    sched.block();
    sched.platform().enable();

    sched.yield_now();
    assert_eq!(Some(sched.current()), sched.idle_thread());
    assert!(sched.ready_threads().is_empty());
}

#[test]
fn lowering_priority_yields_to_higher_ready_thread() {
    let sched = started();
    let main = sched.current();
    let worker = sched.spawn("worker", Priority::new(20), noop).unwrap();

    sched.set_priority(Priority::new(10));
    assert_eq!(sched.current().tid(), worker);
    assert_eq!(main.priority(), Priority::new(10));
    assert_eq!(sched.ready_threads(), vec![(main.tid(), Priority::new(10))]);
}

#[test]
fn raising_priority_keeps_running() {
    let sched = started();
    sched.spawn("worker", Priority::new(20), noop).unwrap();
    sched.set_priority(Priority::new(50));
    assert_eq!(sched.priority(), Priority::new(50));
    assert_eq!(sched.current().tid(), Tid(1));
}

#[test]
fn sleeper_wakes_exactly_at_its_tick() {
    let sched = started();
    let platform = sched.platform();
    let main = sched.current();

    // asleep at tick 50 until tick 100
    sched.sleep_until(100);
    assert_eq!(main.status(), ThreadStatus::Blocked);
    assert_eq!(sched.sleeping_threads(), vec![(main.tid(), 100)]);
    assert_eq!(Some(sched.current()), sched.idle_thread());
    assert_eq!(platform.level(), IntrLevel::On);

    for now in 50..100 {
        let _irq = platform.enter_interrupt();
        assert_eq!(sched.wake(now), 0);
    }
    assert_eq!(main.status(), ThreadStatus::Blocked);

    {
        let _irq = platform.enter_interrupt();
        assert_eq!(sched.wake(100), 1);
    }
    assert_eq!(main.status(), ThreadStatus::Ready);
    assert!(sched.sleeping_threads().is_empty());
    assert_eq!(platform.yield_requests(), 1);

    // interrupt return
    sched.yield_now();
    assert_eq!(sched.current(), main);
}

#[test]
fn wake_from_thread_context_switches_immediately() {
    let sched = started();
    let main = sched.current();
    sched.sleep_until(10);

    assert_eq!(sched.wake(10), 1);
    assert_eq!(sched.current(), main);
    assert_eq!(sched.platform().yield_requests(), 0);
}

#[test]
fn lower_priority_wakeup_does_not_preempt() {
    let sched = started();
    let main = sched.current();
    sched.spawn("low", Priority::new(5), noop).unwrap();
    sched.set_priority(Priority::new(1));
    // "low" now runs; put it to sleep and let main run
    let low = sched.current();
    sched.sleep_until(20);
    assert_eq!(sched.current(), main);

    sched.set_priority(Priority::new(30));
    {
        let _irq = sched.platform().enter_interrupt();
        assert_eq!(sched.wake(20), 1);
    }
    assert_eq!(low.status(), ThreadStatus::Ready);
    assert_eq!(sched.platform().yield_requests(), 0);
}

/// A thread sits in at most one of the two queues and the running thread in
/// neither.
fn assert_queue_membership(sched: &Scheduler<SimPlatform>) {
    let ready: Vec<Tid> = sched.ready_threads().into_iter().map(|(tid, _)| tid).collect();
    let sleeping: Vec<Tid> = sched.sleeping_threads().into_iter().map(|(tid, _)| tid).collect();
    let current = sched.current().tid();
    assert!(!ready.contains(&current), "running thread {current} is ready");
    assert!(!sleeping.contains(&current), "running thread {current} is asleep");
    assert!(ready.iter().all(|tid| !sleeping.contains(tid)));
}

#[test]
fn sleeper_moves_between_queues() {
    let sched = started();
    let main = sched.current();
    let peer = sched.spawn("peer", Priority::DEFAULT, noop).unwrap();
    assert_queue_membership(&sched);

    sched.sleep_until(10);
    assert_eq!(sched.current().tid(), peer);
    assert_eq!(sched.sleeping_threads(), vec![(main.tid(), 10)]);
    assert!(sched.ready_threads().is_empty());
    assert_queue_membership(&sched);

    assert_eq!(sched.wake(10), 1);
    assert_eq!(sched.current().tid(), peer);
    assert!(sched.sleeping_threads().is_empty());
    assert_eq!(sched.ready_threads(), vec![(main.tid(), Priority::DEFAULT)]);
    assert_queue_membership(&sched);

    sched.yield_now();
    assert_eq!(sched.current(), main);
    assert_eq!(sched.ready_threads(), vec![(peer, Priority::DEFAULT)]);
    assert_queue_membership(&sched);
}

#[test]
#[should_panic(expected = "already queued")]
fn unblock_of_sleeping_thread_panics() {
    let sched = started();
    let main = sched.current();
    sched.spawn("peer", Priority::DEFAULT, noop).unwrap();
    sched.sleep_until(10);
    sched.unblock(main);
}

#[test]
fn idle_thread_never_sleeps() {
    let sched = started();
    sched.platform().disable();
    sched.block();
    sched.platform().enable();

    sched.sleep_until(5);
    assert!(sched.sleeping_threads().is_empty());
    assert_eq!(Some(sched.current()), sched.idle_thread());
}

#[test]
#[should_panic(expected = "requires interrupts on")]
fn sleep_with_interrupts_off_panics() {
    let sched = booted();
    sched.sleep_until(1);
}

#[test]
fn time_slice_expiry_requests_preemption() {
    let sched = started();
    let platform = sched.platform();
    for _ in 0..3 {
        let _irq = platform.enter_interrupt();
        sched.tick();
    }
    assert_eq!(platform.yield_requests(), 0);
    {
        let _irq = platform.enter_interrupt();
        sched.tick();
    }
    assert_eq!(platform.yield_requests(), 1);

    // a dispatch starts a fresh slice
    sched.yield_now();
    {
        let _irq = platform.enter_interrupt();
        sched.tick();
    }
    assert_eq!(platform.yield_requests(), 1);
    assert_eq!(sched.stats().kernel_ticks, 5);
}

#[test]
fn ticks_are_classified_by_thread_kind() {
    let sched = started();
    let platform = sched.platform();
    let tick = || {
        let _irq = platform.enter_interrupt();
        sched.tick();
    };

    tick();
    sched.set_address_space(NonZeroUsize::new(0x1000));
    tick();
    sched.set_address_space(None);
    platform.disable();
    sched.block();
    platform.enable();
    tick();

    let stats = sched.print_stats();
    assert_eq!(stats.kernel_ticks, 1);
    assert_eq!(stats.user_ticks, 1);
    assert_eq!(stats.idle_ticks, 1);
}

#[test]
fn switch_activates_incoming_address_space() {
    let sched = started();
    let root = NonZeroUsize::new(0x8000);
    sched.set_address_space(root);
    sched.spawn("kernel", Priority::new(40), noop).unwrap();
    sched.retire();

    assert_eq!(sched.platform().activations(), vec![None, root]);
    assert_eq!(sched.stats().context_switches, 2);
}

#[test]
fn exited_threads_are_reclaimed_after_next_schedule() {
    const N: usize = 8;
    let sched = started();
    let platform = sched.platform();
    let main = sched.current();

    for _ in 0..N {
        sched.spawn("worker", Priority::new(40), noop).unwrap();
        assert_ne!(sched.current(), main);
        sched.retire();
        assert_eq!(sched.current(), main);
        assert_eq!(sched.pending_reclaim(), 1);
    }
    // idle plus the last worker
    assert_eq!(platform.live_pages(), 2);

    sched.yield_now();
    assert_eq!(sched.pending_reclaim(), 0);
    assert_eq!(platform.live_pages(), 1);
}

#[test]
fn initial_thread_is_never_reclaimed() {
    let sched = started();
    let main = sched.current();
    let worker = sched.spawn("worker", Priority::new(10), noop).unwrap();

    sched.retire();
    assert_eq!(main.status(), ThreadStatus::Dying);
    assert_eq!(sched.current().tid(), worker);
    assert_eq!(sched.pending_reclaim(), 0);

    sched.yield_now();
    assert_eq!(main.status(), ThreadStatus::Dying);
    assert!(main.is_intact());
}

#[test]
#[should_panic(expected = "canary")]
fn clobbered_canary_is_fatal() {
    let sched = booted();
    let main = sched.running_thread();
    let tail = std::mem::size_of::<Thread>() - 16;
    // a runaway stack writing down into the control block
    unsafe {
        let base = main.page().as_ptr().cast::<u8>();
        std::ptr::write_bytes(base.add(tail), 0xa5, PAGE_SIZE - tail);
    }
    sched.current();
}
