//! Waiting for all or any of a selection of flags.
//!
//! 1. (`seq`: 0 → 1) `waiter` (priority 3) waits for both of `0b0101`, with
//!    reset.
//! 2. (`seq`: 1 → 2) `main` (priority 2) sets `0b0001`. `waiter` is still
//!    blocked.
//! 3. (`seq`: 2 → 3) `main` sets `0b0100`. `waiter` wakes up with `0b0101`,
//!    clearing them, and waits for any of `0b1010` without reset.
//! 4. (`seq`: 3 → 4) `main` sets `0b0010`.
//! 5. (`seq`: 4 → 5) `waiter` wakes up with `0b0010` and exits.
//! 6. (`seq`: 5 → 6) `main` finishes.
use nanos::{
    FlagSet, IsrRequest, Kernel, KernelCfg, QueuingType, TaskAttr, TaskCb, WaitFlagSetError,
    WAIT_FOREVER,
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
static FLAGS: FlagSet<App> = FlagSet::new();

#[test]
fn run() {
    TEST_UTIL.run(&KERNEL, |kernel| {
        FLAGS.create(kernel, 0, QueuingType::Priority)?;
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
    assert_eq!(FLAGS.wait(kernel, 0b0101, true, true, WAIT_FOREVER), Ok(0b0101));

    SEQ.expect_and_replace(2, 3);
    assert_eq!(FLAGS.get_mask(kernel), Ok(0));
    assert_eq!(FLAGS.wait(kernel, 0b1010, false, false, WAIT_FOREVER), Ok(0b0010));

    SEQ.expect_and_replace(4, 5);
    assert_eq!(FLAGS.get_mask(kernel), Ok(0b0010));

    assert_eq!(
        FLAGS.wait(kernel, 0, false, false, WAIT_FOREVER),
        Err(WaitFlagSetError::InvalidArg)
    );
    assert_eq!(
        FLAGS.wait(kernel, 0b1000, false, false, 0),
        Err(WaitFlagSetError::Timeout)
    );

    // Already satisfied
    assert_eq!(FLAGS.wait(kernel, 0b0011, false, true, 0), Ok(0b0010));
    assert_eq!(FLAGS.get_mask(kernel), Ok(0));
    0
}

fn main_body(kernel: &'static Kernel<App>, _: usize) -> usize {
    SEQ.expect_and_replace(1, 2);
    FLAGS.set(kernel, 0b0001).unwrap();
    assert_eq!(FLAGS.get_mask(kernel), Ok(0b0001));

    assert_eq!(SEQ.get(), 2);
    FLAGS.set(kernel, 0b0100).unwrap();

    SEQ.expect_and_replace(3, 4);
    FLAGS.set(kernel, 0b0010).unwrap();

    SEQ.expect_and_replace(5, 6);
    FLAGS.set(kernel, 0b1100).unwrap();
    FLAGS.clear(kernel, 0b0100).unwrap();
    assert_eq!(FLAGS.get_mask(kernel), Ok(0b1000));

    nanos_port_std::pend_interrupt::<App>(|kernel| {
        FLAGS.set_from_isr(kernel, 0b0011).unwrap();
        FLAGS.clear_from_isr(kernel, 0b1000).unwrap();
    });
    assert_eq!(FLAGS.get_mask(kernel), Ok(0b0011));

    TEST_UTIL.success::<App>();
}
