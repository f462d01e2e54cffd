//! Round robin among equal-priority tasks, and preemption by a higher
//! priority task waking up in the middle of a time slice.
//!
//! 1. (tick 0) `high` (priority 5) starts sleeping for 100 ticks.
//! 2. (tick 0-99) `worker0` and `worker1` (priority 3) take turns, each
//!    running for a time slice of 5 ticks. They generate the ticks
//!    themselves and record which of them saw each tick.
//! 3. (tick 100) `high` wakes up and preempts `worker1`, which is in the
//!    middle of its run. It checks the record.
use nanos::{IsrRequest, Kernel, KernelCfg, TaskAttr, TaskCb};
use std::sync::Mutex;

use crate::KernelTestUtil;

nanos_port_std::use_port!(unsafe struct App);

const TIMESLICE: u32 = 5;

impl KernelCfg for App {
    const NUM_PRIORITY_LEVELS: u8 = 8;
    const ROUND_ROBIN_TIMESLICE: u32 = TIMESLICE;
    type TaskPool = [TaskCb<Self>; 8];
    type IsrRequestPool = [Option<IsrRequest<Self>>; 4];

    fn tick_hook(kernel: &'static Kernel<Self>) {
        KernelTestUtil::watchdog(kernel);
    }
}

static KERNEL: Kernel<App> = Kernel::new();
static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();

/// `(tick, worker)` pairs
static RECORD: Mutex<Vec<(u32, usize)>> = Mutex::new(Vec::new());

#[test]
fn run() {
    TEST_UTIL.run(&KERNEL, |kernel| {
        kernel.task_create(&TaskAttr {
            name: "high",
            priority: 5,
            entry: high_body,
            param: 0,
            stack_size: 0,
        })?;
        for i in 0..2 {
            kernel.task_create(&TaskAttr {
                name: "worker",
                priority: 3,
                entry: worker_body,
                param: i,
                stack_size: 0,
            })?;
        }
        Ok(())
    });
}

fn high_body(kernel: &'static Kernel<App>, _: usize) -> usize {
    assert_eq!(kernel.tick_count(), 0);
    kernel.task_sleep(100).unwrap();
    assert_eq!(kernel.tick_count(), 100);

    let record = RECORD.lock().unwrap();
    let ticks: Vec<u32> = record.iter().map(|&(tick, _)| tick).collect();
    assert_eq!(ticks, (0..100).collect::<Vec<_>>());

    for &(tick, worker) in record.iter() {
        let expected = (tick / TIMESLICE % 2) as usize;
        assert_eq!(worker, expected, "tick {tick} was seen by the wrong worker");
    }
    drop(record);

    TEST_UTIL.success::<App>();
}

fn worker_body(kernel: &'static Kernel<App>, i: usize) -> usize {
    loop {
        RECORD.lock().unwrap().push((kernel.tick_count(), i));
        nanos_port_std::advance::<App>(1);
    }
}
