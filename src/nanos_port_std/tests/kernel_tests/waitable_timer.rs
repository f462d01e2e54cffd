//! Blocking on a waitable timer.
//!
//! 1. (`seq`: 0 → 1) `waiter` (priority 3) starts `TIMER` with a period of
//!    4 ticks and waits for it.
//! 2. (`seq`: 1 → 2) `main` (priority 2) lets 4 ticks pass.
//! 3. (`seq`: 2 → 3) `waiter` wakes up and waits again.
//! 4. (`seq`: 3 → 4) `main` stops `TIMER`.
//! 5. (`seq`: 4 → 5) `waiter` wakes up with `TimerStopped`, restarts
//!    `TIMER` with a period of 10 ticks and starts sleeping.
//! 6. (`seq`: 5 → 6) `main` exits.
//! 7. (`seq`: 6 → 7) `waiter` wakes up and consumes the expiration. A
//!    one-shot expiration is lost once the timer has stopped. `waiter`
//!    destroys `TIMER`.
use nanos::{
    DestroyWaitableTimerError, IsrRequest, Kernel, KernelCfg, QueuingType, TaskAttr, TaskCb,
    WaitWaitableTimerError, WaitableTimer, WAIT_FOREVER,
};

use crate::{KernelTestUtil, SeqTracker};

nanos_port_std::use_port!(unsafe struct App);

impl KernelCfg for App {
    const NUM_PRIORITY_LEVELS: u8 = 8;
    type TaskPool = [TaskCb<Self>; 6];
    type IsrRequestPool = [Option<IsrRequest<Self>>; 4];

    fn tick_hook(kernel: &'static Kernel<Self>) {
        KernelTestUtil::watchdog(kernel);
    }
}

static KERNEL: Kernel<App> = Kernel::new();
static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static SEQ: SeqTracker = SeqTracker::new();
static TIMER: WaitableTimer<App> = WaitableTimer::new();

#[test]
fn run() {
    TEST_UTIL.run(&KERNEL, |kernel| {
        TIMER.create(kernel, QueuingType::Fifo)?;
        TIMER.set_name(kernel, "TIMER")?;
        kernel.task_create(&TaskAttr {
            name: "main",
            priority: 2,
            entry: main_body,
            param: 0,
            stack_size: 0,
        })?;
        kernel.task_create(&TaskAttr {
            name: "waiter",
            priority: 3,
            entry: waiter_body,
            param: 0,
            stack_size: 0,
        })?;
        Ok(())
    });
}

fn waiter_body(kernel: &'static Kernel<App>, _: usize) -> usize {
    SEQ.expect_and_replace(0, 1);
    assert_eq!(
        TIMER.wait(kernel, WAIT_FOREVER),
        Err(WaitWaitableTimerError::TimerStopped)
    );

    let start = kernel.tick_count();
    TIMER.start(kernel, 4, 4).unwrap();
    TIMER.wait(kernel, WAIT_FOREVER).unwrap();
    assert_eq!(kernel.tick_count().wrapping_sub(start), 4);

    SEQ.expect_and_replace(2, 3);
    // Consumed by `wait`
    assert_eq!(TIMER.has_elapsed(kernel), Ok(false));
    assert_eq!(
        TIMER.wait(kernel, WAIT_FOREVER),
        Err(WaitWaitableTimerError::TimerStopped)
    );

    SEQ.expect_and_replace(4, 5);
    assert_eq!(TIMER.is_running(), Ok(false));

    // An expiration nobody waited for satisfies the next wait immediately
    TIMER.start(kernel, 1, 10).unwrap();
    kernel.task_sleep(2).unwrap();
    SEQ.expect_and_replace(6, 7);
    assert_eq!(TIMER.is_running(), Ok(true));
    let start = kernel.tick_count();
    TIMER.wait(kernel, 0).unwrap();
    assert_eq!(kernel.tick_count(), start);
    assert_eq!(TIMER.has_elapsed(kernel), Ok(false));
    TIMER.stop(kernel).unwrap();

    // ...but not once the timer has stopped
    TIMER.start(kernel, 1, 0).unwrap();
    kernel.task_sleep(2).unwrap();
    assert_eq!(TIMER.is_running(), Ok(false));
    assert_eq!(
        TIMER.wait(kernel, 0),
        Err(WaitWaitableTimerError::TimerStopped)
    );

    TIMER.destroy(kernel).unwrap();
    assert_eq!(
        TIMER.wait(kernel, WAIT_FOREVER),
        Err(WaitWaitableTimerError::InvalidObject)
    );
    TEST_UTIL.success::<App>();
}

fn main_body(kernel: &'static Kernel<App>, _: usize) -> usize {
    SEQ.expect_and_replace(1, 2);
    nanos_port_std::advance::<App>(4);

    SEQ.expect_and_replace(3, 4);
    assert_eq!(TIMER.is_running(), Ok(true));
    assert_eq!(TIMER.name(kernel), Ok(Some("TIMER")));
    assert_eq!(
        TIMER.destroy(kernel),
        Err(DestroyWaitableTimerError::TimerStarted)
    );
    TIMER.stop(kernel).unwrap();

    SEQ.expect_and_replace(5, 6);
    0
}
