//! Periodic and one-shot timers. The callbacks run in the timer task, one
//! tick at a time.
use nanos::{
    IsrRequest, Kernel, KernelCfg, QueryError, StartTimerError, StopTimerError, TaskAttr,
    TaskCb, Timer,
};
use std::sync::Mutex;

use crate::KernelTestUtil;

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
static PERIODIC: Timer<App> = Timer::new();
static ONE_SHOT: Timer<App> = Timer::new();
static SELF_STOPPING: Timer<App> = Timer::new();

/// `(user_data, tick_count)` of every callback invocation
static FIRED: Mutex<Vec<(usize, u32)>> = Mutex::new(Vec::new());

#[test]
fn run() {
    TEST_UTIL.run(&KERNEL, |kernel| {
        PERIODIC.create(kernel, on_fire, 0)?;
        ONE_SHOT.create(kernel, on_fire, 1)?;
        SELF_STOPPING.create(kernel, on_fire, 2)?;
        kernel.task_create(&TaskAttr {
            name: "main",
            priority: 2,
            entry: main_body,
            param: 0,
            stack_size: 0,
        })?;
        Ok(())
    });
}

fn on_fire(kernel: &'static Kernel<App>, timer: &'static Timer<App>, user_data: usize) {
    assert!(!kernel.is_interrupt_context());
    let now = kernel.tick_count();
    log::debug!("timer {user_data} fired at {now}");

    let mut fired = FIRED.lock().unwrap();
    fired.push((user_data, now));

    if user_data == 2 && fired.iter().filter(|&&(i, _)| i == 2).count() == 3 {
        drop(fired);
        timer.stop(kernel).unwrap();
    }
}

fn take_fired() -> Vec<(usize, u32)> {
    std::mem::take(&mut *FIRED.lock().unwrap())
}

fn main_body(kernel: &'static Kernel<App>, _: usize) -> usize {
    assert_ne!(PERIODIC.object_id(), ONE_SHOT.object_id());
    assert_eq!(PERIODIC.is_running(), Ok(false));
    assert_eq!(PERIODIC.stop(kernel), Err(StopTimerError::TimerStopped));
    assert_eq!(PERIODIC.start(kernel, 0, 5), Err(StartTimerError::InvalidArg));

    // `ONE_SHOT` is due on the same tick as the first expiration of
    // `PERIODIC`. They fire in the order they were started.
    let t0 = kernel.tick_count();
    PERIODIC.start(kernel, 3, 5).unwrap();
    ONE_SHOT.start(kernel, 3, 0).unwrap();
    assert_eq!(PERIODIC.is_running(), Ok(true));
    assert_eq!(PERIODIC.start(kernel, 1, 1), Err(StartTimerError::TimerStarted));
    assert_eq!(PERIODIC.has_elapsed(kernel), Ok(false));

    nanos_port_std::advance::<App>(13);
    assert_eq!(
        take_fired(),
        [(0, t0 + 3), (1, t0 + 3), (0, t0 + 8), (0, t0 + 13)]
    );
    assert_eq!(ONE_SHOT.is_running(), Ok(false));
    assert_eq!(PERIODIC.is_running(), Ok(true));

    // The flag is cleared by reading it
    assert_eq!(PERIODIC.has_elapsed(kernel), Ok(true));
    assert_eq!(PERIODIC.has_elapsed(kernel), Ok(false));

    PERIODIC.stop(kernel).unwrap();
    nanos_port_std::advance::<App>(10);
    assert!(take_fired().is_empty());

    // A one-shot timer can be restarted after it fires
    let t1 = kernel.tick_count();
    ONE_SHOT.start(kernel, 2, 0).unwrap();
    nanos_port_std::advance::<App>(5);
    assert_eq!(take_fired(), [(1, t1 + 2)]);

    // The callback can stop its own timer
    let t2 = kernel.tick_count();
    SELF_STOPPING.start(kernel, 1, 1).unwrap();
    nanos_port_std::advance::<App>(6);
    assert_eq!(take_fired(), [(2, t2 + 1), (2, t2 + 2), (2, t2 + 3)]);
    assert_eq!(SELF_STOPPING.is_running(), Ok(false));

    // Destroying a running timer stops it
    PERIODIC.start(kernel, 1, 1).unwrap();
    PERIODIC.destroy(kernel).unwrap();
    nanos_port_std::advance::<App>(3);
    assert!(take_fired().is_empty());
    assert_eq!(PERIODIC.is_running(), Err(QueryError::InvalidObject));
    assert_eq!(
        PERIODIC.start(kernel, 1, 1),
        Err(StartTimerError::InvalidObject)
    );

    TEST_UTIL.success::<App>();
}
