//! A producer and a consumer synchronized by a condition variable.
//!
//! 1. (`seq`: 0 → 1) `consumer` (priority 3) locks `MUTEX` and waits on
//!    `CV`, releasing `MUTEX`.
//! 2. (`seq`: 1 → 2) `producer` (priority 2) locks `MUTEX`, stores a value
//!    and signals `CV`. `consumer` wakes up but blocks on `MUTEX`.
//! 3. (`seq`: 2 → 3) `producer` unlocks `MUTEX`, handing it to `consumer`.
//! 4. (`seq`: 3 → 4) `consumer` returns from the wait owning `MUTEX`, and
//!    then waits on `CV` with a timeout.
//! 5. (`seq`: 4 → 5) `producer` lets time pass.
//! 6. (`seq`: 5 → 6) `consumer` times out and exits.
//! 7. (`seq`: 6 → 7) `producer` finishes.
use nanos::{
    CondVar, CondVarWaitError, IsrRequest, Kernel, KernelCfg, Mutex, QueuingType,
    SignalFromIsrError, TaskAttr, TaskCb, WAIT_FOREVER,
};
use std::sync::atomic::{AtomicU32, Ordering};

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
static MUTEX: Mutex<App> = Mutex::new();
static CV: CondVar<App> = CondVar::new();

/// Guarded by `MUTEX`
static VALUE: AtomicU32 = AtomicU32::new(0);

#[test]
fn run() {
    TEST_UTIL.run(&KERNEL, |kernel| {
        MUTEX.create(kernel, QueuingType::Fifo)?;
        CV.create(kernel, QueuingType::Fifo)?;
        CV.set_name(kernel, "CV")?;
        kernel.task_create(&TaskAttr {
            name: "producer",
            priority: 2,
            entry: producer_body,
            param: 0,
            stack_size: 0,
        })?;
        kernel.task_create(&TaskAttr {
            name: "consumer",
            priority: 3,
            entry: consumer_body,
            param: 0,
            stack_size: 0,
        })?;
        Ok(())
    });
}

fn consumer_body(kernel: &'static Kernel<App>, _: usize) -> usize {
    SEQ.expect_and_replace(0, 1);

    // The mutex must be owned, exactly once
    assert_eq!(
        CV.wait(kernel, &MUTEX, WAIT_FOREVER),
        Err(CondVarWaitError::MutexNotOwned)
    );
    MUTEX.lock(kernel, WAIT_FOREVER).unwrap();
    MUTEX.lock(kernel, WAIT_FOREVER).unwrap();
    assert_eq!(
        CV.wait(kernel, &MUTEX, WAIT_FOREVER),
        Err(CondVarWaitError::MutexLockCount)
    );
    MUTEX.unlock(kernel).unwrap();

    while VALUE.load(Ordering::Relaxed) == 0 {
        CV.wait(kernel, &MUTEX, WAIT_FOREVER).unwrap();
    }

    SEQ.expect_and_replace(3, 4);
    assert_eq!(VALUE.load(Ordering::Relaxed), 7);
    assert_eq!(MUTEX.is_locked(kernel), Ok(true));

    // Nobody signals `CV` this time. The mutex is left unlocked.
    assert_eq!(CV.wait(kernel, &MUTEX, 4), Err(CondVarWaitError::Timeout));
    SEQ.expect_and_replace(5, 6);
    assert_eq!(MUTEX.is_locked(kernel), Ok(false));
    0
}

fn producer_body(kernel: &'static Kernel<App>, _: usize) -> usize {
    SEQ.expect_and_replace(1, 2);
    MUTEX.lock(kernel, WAIT_FOREVER).unwrap();
    VALUE.store(7, Ordering::Relaxed);
    CV.signal(kernel, false).unwrap();

    SEQ.expect_and_replace(2, 3);
    MUTEX.unlock(kernel).unwrap();

    SEQ.expect_and_replace(4, 5);
    let start = kernel.tick_count();
    nanos_port_std::advance::<App>(4);
    assert_eq!(kernel.tick_count().wrapping_sub(start), 4);

    SEQ.expect_and_replace(6, 7);
    assert_eq!(MUTEX.is_locked(kernel), Ok(false));

    // Signaling without waiters is a no-op
    CV.signal(kernel, true).unwrap();
    assert_eq!(
        CV.signal_from_isr(kernel, false),
        Err(SignalFromIsrError::BadContext)
    );
    nanos_port_std::pend_interrupt::<App>(|kernel| {
        CV.signal_from_isr(kernel, true).unwrap();
    });
    assert_eq!(CV.name(kernel), Ok(Some("CV")));

    TEST_UTIL.success::<App>();
}
