//! Tick counter and time-based sleeping.

use core::cell::RefCell;
use core::sync::atomic::{AtomicU32, Ordering};

use critical_section::Mutex;
use kthread::sync::{Arc, IntrGuard};
use kthread::{IntrLevel, Platform, Scheduler, Tick, TimerDevice};

use crate::calibrate::{busy_wait, calibrate_loops, SleepPlan};

const MS_PER_S: i64 = 1000;
const US_PER_S: i64 = 1000 * 1000;
const NS_PER_S: i64 = 1000 * 1000 * 1000;

/// System timer driving the scheduler.
///
/// Counts ticks of the periodic interrupt, feeds the scheduler's time-slice
/// accounting and wakes sleeping threads.
pub struct Timer<P: Platform + TimerDevice> {
    sched: Arc<Scheduler<P>>,
    ticks: Mutex<RefCell<Tick>>,
    loops_per_tick: AtomicU32,
    hz: u32,
}

impl<P: Platform + TimerDevice> Timer<P> {
    /// Creates a timer running at the scheduler's configured frequency.
    pub fn new(sched: Arc<Scheduler<P>>) -> Self {
        let hz = sched.config().timer_hz;
        Self {
            sched,
            ticks: Mutex::new(RefCell::new(0)),
            loops_per_tick: AtomicU32::new(0),
            hz,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler<P>> {
        &self.sched
    }

    /// Interrupt frequency in hertz.
    pub fn frequency(&self) -> u32 {
        self.hz
    }

    /// Programs the periodic interrupt and registers `handler` for it. The
    /// handler is expected to call [`interrupt`](Self::interrupt).
    pub fn init(&self, handler: fn()) {
        let platform = self.sched.platform();
        platform.program_periodic(self.hz);
        platform.register_tick_handler(handler);
        log::debug!("timer programmed for {} Hz", self.hz);
    }

    /// Body of the timer interrupt handler.
    pub fn interrupt(&self) {
        let now = {
            let guard = IntrGuard::new(self.sched.platform());
            let mut ticks = self.ticks.borrow_ref_mut(guard.cs());
            *ticks += 1;
            *ticks
        };
        self.sched.tick();
        self.sched.wake(now);
    }

    /// Measures how many busy-wait loops fit in one tick, for sub-tick
    /// delays. Needs the timer interrupt running.
    ///
    /// # Panics
    ///
    /// Panics if interrupts are off.
    pub fn calibrate(&self) -> u32 {
        assert_eq!(
            self.sched.platform().level(),
            IntrLevel::On,
            "calibrate() requires interrupts on"
        );
        log::info!("Calibrating timer...");
        self.calibrate_with(|loops| self.too_many_loops(loops))
    }

    /// Runs the calibration search against a custom predicate.
    pub fn calibrate_with(&self, too_many: impl FnMut(u32) -> bool) -> u32 {
        let loops = calibrate_loops(too_many);
        self.loops_per_tick.store(loops, Ordering::Release);
        log::info!("{} loops/s", u64::from(loops) * u64::from(self.hz));
        loops
    }

    pub fn loops_per_tick(&self) -> u32 {
        self.loops_per_tick.load(Ordering::Acquire)
    }

    /// Ticks since the timer started.
    pub fn ticks(&self) -> Tick {
        let guard = IntrGuard::new(self.sched.platform());
        let ticks = *self.ticks.borrow_ref(guard.cs());
        ticks
    }

    /// Ticks elapsed since `then`, a value returned by [`ticks`](Self::ticks).
    pub fn elapsed(&self, then: Tick) -> Tick {
        self.ticks() - then
    }

    /// Yields the CPU until `ticks` ticks have passed.
    pub fn sleep(&self, ticks: Tick) {
        let start = self.ticks();
        assert_eq!(
            self.sched.platform().level(),
            IntrLevel::On,
            "sleep() requires interrupts on"
        );
        while self.elapsed(start) < ticks {
            self.sched.yield_now();
        }
    }

    /// Sleeps for about `ms` milliseconds.
    pub fn msleep(&self, ms: i64) {
        self.real_time_sleep(ms, MS_PER_S);
    }

    /// Sleeps for about `us` microseconds.
    pub fn usleep(&self, us: i64) {
        self.real_time_sleep(us, US_PER_S);
    }

    /// Sleeps for about `ns` nanoseconds.
    pub fn nsleep(&self, ns: i64) {
        self.real_time_sleep(ns, NS_PER_S);
    }

    /// Logs the tick count and returns it.
    pub fn print_stats(&self) -> Tick {
        let ticks = self.ticks();
        log::info!("Timer: {ticks} ticks");
        ticks
    }

    /// Blocks for whole ticks or busy-waits for shorter delays.
    fn real_time_sleep(&self, num: i64, denom: i64) {
        assert_eq!(
            self.sched.platform().level(),
            IntrLevel::On,
            "real-time sleep requires interrupts on"
        );
        match SleepPlan::for_duration(num, denom, self.hz, self.loops_per_tick()) {
            SleepPlan::Ticks(ticks) => {
                let wakeup = self.ticks() + ticks;
                self.sched.sleep_until(wakeup);
            }
            SleepPlan::Spin(loops) => busy_wait(loops),
        }
    }

    /// True if `loops` iterations take longer than one tick.
    fn too_many_loops(&self, loops: u32) -> bool {
        // Wait for a tick boundary.
        let start = self.ticks();
        while self.ticks() == start {
            core::hint::spin_loop();
        }

        let start = self.ticks();
        busy_wait(i64::from(loops));
        start != self.ticks()
    }
}
