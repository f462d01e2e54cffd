//! Pends an interrupt from an external thread. The interrupt handler wakes up
//! a task blocked on a semaphore.
use nanos::{IsrRequest, Kernel, KernelCfg, QueuingType, Semaphore, TaskAttr, TaskCb};
use std::thread::spawn;

use crate::KernelTestUtil;

nanos_port_std::use_port!(unsafe struct App);

impl KernelCfg for App {
    const NUM_PRIORITY_LEVELS: u8 = 4;
    type TaskPool = [TaskCb<Self>; 4];
    type IsrRequestPool = [Option<IsrRequest<Self>>; 4];

    fn tick_hook(kernel: &'static Kernel<Self>) {
        KernelTestUtil::watchdog(kernel);
    }
}

static KERNEL: Kernel<App> = Kernel::new();
static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static SEM: Semaphore<App> = Semaphore::new();

#[test]
fn run() {
    TEST_UTIL.run(&KERNEL, |kernel| {
        SEM.create(kernel, 0, 1, QueuingType::Fifo)?;
        kernel.task_create(&TaskAttr {
            name: "main",
            priority: 1,
            entry: main_body,
            param: 0,
            stack_size: 0,
        })?;
        Ok(())
    });
}

fn main_body(kernel: &'static Kernel<App>, _: usize) -> usize {
    // Spawn a host thread
    log::debug!("spawning an external thread");
    spawn(|| {
        log::debug!("pending an interrupt");
        nanos_port_std::pend_interrupt::<App>(|kernel| {
            assert!(kernel.is_interrupt_context());
            SEM.post_from_isr(kernel).unwrap();
        });
    });

    // The idle task takes the interrupt
    log::debug!("waiting for the interrupt handler to post `SEM`...");
    SEM.wait(kernel, nanos::WAIT_FOREVER).unwrap();
    log::debug!("success!");

    TEST_UTIL.success::<App>();
}
