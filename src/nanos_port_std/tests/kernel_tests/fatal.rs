//! Conditions that bring the whole system down. Each test runs its own
//! kernel instance.
use nanos::ResultCode;

fn log_fatal(code: ResultCode) {
    log::info!("fatal_hook({code:?})");
}

/// Blocking in the boot context
mod wait_before_start {
    use nanos::{IsrRequest, Kernel, KernelCfg, QueuingType, ResultCode, Semaphore, TaskCb};

    use crate::KernelTestUtil;

    nanos_port_std::use_port!(unsafe struct App);

    impl KernelCfg for App {
        const NUM_PRIORITY_LEVELS: u8 = 4;
        type TaskPool = [TaskCb<Self>; 4];
        type IsrRequestPool = [Option<IsrRequest<Self>>; 4];

        fn fatal_hook(code: ResultCode) {
            super::log_fatal(code);
        }
    }

    static KERNEL: Kernel<App> = Kernel::new();
    static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
    static SEM: Semaphore<App> = Semaphore::new();

    #[test]
    #[should_panic(expected = "OsNotStarted")]
    fn run() {
        TEST_UTIL.run(&KERNEL, |kernel| {
            SEM.create(kernel, 0, 1, QueuingType::Fifo)?;

            SEM.wait(kernel, 5)?;
            Ok(())
        });
    }
}

/// A timer callback that takes longer than the interval between two ticks
mod timer_overrun {
    use nanos::{IsrRequest, Kernel, KernelCfg, ResultCode, TaskAttr, TaskCb, Timer};

    use crate::KernelTestUtil;

    nanos_port_std::use_port!(unsafe struct App);

    impl KernelCfg for App {
        const NUM_PRIORITY_LEVELS: u8 = 4;
        type TaskPool = [TaskCb<Self>; 4];
        type IsrRequestPool = [Option<IsrRequest<Self>>; 4];

        fn tick_hook(kernel: &'static Kernel<Self>) {
            KernelTestUtil::watchdog(kernel);
        }

        fn fatal_hook(code: ResultCode) {
            super::log_fatal(code);
        }
    }

    static KERNEL: Kernel<App> = Kernel::new();
    static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
    static TIMER: Timer<App> = Timer::new();

    #[test]
    #[should_panic(expected = "TimerTaskOverrun")]
    fn run() {
        TEST_UTIL.run(&KERNEL, |kernel| {
            TIMER.create(kernel, slow_callback, 0)?;
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

    fn slow_callback(_: &'static Kernel<App>, _: &'static Timer<App>, _: usize) {
        nanos_port_std::advance::<App>(1);
    }

    fn main_body(kernel: &'static Kernel<App>, _: usize) -> usize {
        TIMER.start(kernel, 1, 0).unwrap();
        kernel.task_sleep(100).unwrap();
        unreachable!("the system should have halted by now");
    }
}

/// A deferred request that fails, with the default `isr_request_error_hook`
mod failed_isr_request {
    use nanos::{
        IsrRequest, Kernel, KernelCfg, QueuingType, ResultCode, Semaphore, TaskAttr, TaskCb,
    };

    use crate::KernelTestUtil;

    nanos_port_std::use_port!(unsafe struct App);

    impl KernelCfg for App {
        const NUM_PRIORITY_LEVELS: u8 = 4;
        type TaskPool = [TaskCb<Self>; 4];
        type IsrRequestPool = [Option<IsrRequest<Self>>; 4];

        fn tick_hook(kernel: &'static Kernel<Self>) {
            KernelTestUtil::watchdog(kernel);
        }

        fn fatal_hook(code: ResultCode) {
            super::log_fatal(code);
        }
    }

    static KERNEL: Kernel<App> = Kernel::new();
    static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();
    static SEM: Semaphore<App> = Semaphore::new();

    #[test]
    #[should_panic(expected = "SemaphoreFull")]
    fn run() {
        TEST_UTIL.run(&KERNEL, |kernel| {
            SEM.create(kernel, 1, 1, QueuingType::Fifo)?;
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
        // Taken while `get_count` is updating `SEM`, so the post is deferred
        // to the ISR request task
        nanos_port_std::schedule_interrupt::<App>(|kernel| {
            SEM.post_from_isr(kernel).unwrap();
        });
        assert_eq!(SEM.get_count(kernel), Ok(1));
        kernel.task_sleep(100).unwrap();
        unreachable!("the system should have halted by now");
    }
}

/// A task that panics takes the system down with it
mod task_panic {
    use nanos::{IsrRequest, Kernel, KernelCfg, TaskAttr, TaskCb};

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

    #[test]
    #[should_panic(expected = "task-level failure 42")]
    fn run() {
        TEST_UTIL.run(&KERNEL, |kernel| {
            kernel.task_create(&TaskAttr {
                name: "main",
                priority: 1,
                entry: main_body,
                param: 42,
                stack_size: 0,
            })?;
            Ok(())
        });
    }

    fn main_body(kernel: &'static Kernel<App>, param: usize) -> usize {
        kernel.task_sleep(3).unwrap();
        panic!("task-level failure {param}");
    }
}
