//! Interrupt handlers operating on an object that a task is in the middle of
//! updating defer their requests to the ISR request task.
use nanos::{
    FlagSet, IsrRequest, Kernel, KernelCfg, PostSemaphoreFromIsrError, QueuingType, ResultCode,
    Semaphore, TaskAttr, TaskCb, WaitFlagSetError, WaitObjectError,
};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Mutex,
};

use crate::KernelTestUtil;

nanos_port_std::use_port!(unsafe struct App);

impl KernelCfg for App {
    const NUM_PRIORITY_LEVELS: u8 = 8;
    type TaskPool = [TaskCb<Self>; 6];
    type IsrRequestPool = [Option<IsrRequest<Self>>; 2];

    fn tick_hook(kernel: &'static Kernel<Self>) {
        KernelTestUtil::watchdog(kernel);
    }

    fn isr_request_error_hook(request: &IsrRequest<Self>, code: ResultCode) -> bool {
        log::debug!("{request:?} failed with {code:?}");
        FAILED_REQUESTS.lock().unwrap().push(code);
        true
    }
}

static KERNEL: Kernel<App> = Kernel::new();
static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
static SEM: Semaphore<App> = Semaphore::new();
static FLAGS: FlagSet<App> = FlagSet::new();

static FAILED_REQUESTS: Mutex<Vec<ResultCode>> = Mutex::new(Vec::new());
static QUEUE_FULL_COUNT: AtomicUsize = AtomicUsize::new(0);

#[test]
fn run() {
    TEST_UTIL.run(&KERNEL, |kernel| {
        SEM.create(kernel, 0, 2, QueuingType::Fifo)?;
        FLAGS.create(kernel, 0, QueuingType::Fifo)?;
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

fn post_from_isr(kernel: &'static Kernel<App>) {
    match SEM.post_from_isr(kernel) {
        Ok(()) => {}
        Err(PostSemaphoreFromIsrError::IsrRequestListFull) => {
            QUEUE_FULL_COUNT.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => panic!("unexpected error: {e:?}"),
    }
}

fn main_body(kernel: &'static Kernel<App>, _: usize) -> usize {
    // No task is touching `SEM`, so the post takes effect immediately
    nanos_port_std::pend_interrupt::<App>(post_from_isr);
    assert_eq!(SEM.get_count(kernel), Ok(1));
    SEM.wait(kernel, 0).unwrap();

    // The interrupt is taken while `wait` is in progress. The post is
    // deferred, so `wait` sees no units.
    nanos_port_std::schedule_interrupt::<App>(post_from_isr);
    assert_eq!(SEM.wait(kernel, 0), Err(WaitObjectError::Timeout));

    // The ISR request task has carried out the post by the time `wait`
    // returns
    assert_eq!(SEM.get_count(kernel), Ok(1));
    SEM.wait(kernel, 0).unwrap();

    // The request queue holds only two requests
    for _ in 0..3 {
        nanos_port_std::schedule_interrupt::<App>(post_from_isr);
    }
    assert_eq!(SEM.wait(kernel, 0), Err(WaitObjectError::Timeout));
    assert_eq!(QUEUE_FULL_COUNT.load(Ordering::Relaxed), 1);
    assert_eq!(SEM.get_count(kernel), Ok(2));

    // A deferred request that fails is reported to the error hook
    nanos_port_std::schedule_interrupt::<App>(post_from_isr);
    assert_eq!(SEM.get_count(kernel), Ok(2));
    assert_eq!(*FAILED_REQUESTS.lock().unwrap(), [ResultCode::SemaphoreFull]);
    SEM.wait(kernel, 0).unwrap();
    SEM.wait(kernel, 0).unwrap();

    // Flag updates are deferred in the same way, and carried out in order
    nanos_port_std::schedule_interrupt::<App>(|kernel| {
        FLAGS.set_from_isr(kernel, 0b110).unwrap();
        FLAGS.clear_from_isr(kernel, 0b010).unwrap();
    });
    assert_eq!(FLAGS.wait(kernel, 0b100, false, false, 0), Err(WaitFlagSetError::Timeout));
    assert_eq!(FLAGS.get_mask(kernel), Ok(0b100));

    // A tick taken while a service is in progress is deferred as well. Its
    // timer and timeout processing takes up both request slots.
    let start = kernel.tick_count();
    nanos_port_std::schedule_interrupt::<App>(|kernel| kernel.tick_interrupt());
    assert_eq!(SEM.get_count(kernel), Ok(0));
    assert_eq!(kernel.tick_count().wrapping_sub(start), 1);
    kernel.task_sleep(1).unwrap();
    assert_eq!(kernel.tick_count().wrapping_sub(start), 2);

    TEST_UTIL.success::<App>();
}
