//! Task creation, queries, and joining.
use nanos::{
    CreateTaskError, GetTaskError, IsrRequest, JoinError, Kernel, KernelCfg, TaskAttr, TaskCb,
    TaskId, TaskSt, WAIT_FOREVER,
};
use once_cell::sync::OnceCell;
use std::sync::Mutex;

use crate::KernelTestUtil;

nanos_port_std::use_port!(unsafe struct App);

impl KernelCfg for App {
    const NUM_PRIORITY_LEVELS: u8 = 8;
    type TaskPool = [TaskCb<Self>; 7];
    type IsrRequestPool = [Option<IsrRequest<Self>>; 4];

    fn tick_hook(kernel: &'static Kernel<Self>) {
        KernelTestUtil::watchdog(kernel);
    }
}

/// The idle task, the timer task, and the ISR request task
const NUM_KERNEL_TASKS: u32 = 3;

static KERNEL: Kernel<App> = Kernel::new();
static TEST_UTIL: KernelTestUtil = KernelTestUtil::new();

static TARGET: OnceCell<TaskId> = OnceCell::new();
/// `(joiner, result)` of every join of `TARGET`
static JOIN_RESULTS: Mutex<Vec<(usize, Result<usize, JoinError>)>> = Mutex::new(Vec::new());

#[test]
fn run() {
    TEST_UTIL.run(&KERNEL, |kernel| {
        assert_eq!(kernel.current_task(), Ok(None));
        kernel.task_create(&attr("main", 2, main_body, 0))?;
        Ok(())
    });
}

fn attr(
    name: &'static str,
    priority: u8,
    entry: fn(&'static Kernel<App>, usize) -> usize,
    param: usize,
) -> TaskAttr<App> {
    TaskAttr {
        name,
        priority,
        entry,
        param,
        stack_size: 0,
    }
}

fn worker_body(kernel: &'static Kernel<App>, param: usize) -> usize {
    assert_eq!(param, 5);
    kernel.task_sleep(3).unwrap();
    param * 2
}

fn quick_body(_: &'static Kernel<App>, param: usize) -> usize {
    param
}

fn target_body(kernel: &'static Kernel<App>, _: usize) -> usize {
    kernel.task_sleep(2).unwrap();
    9
}

fn joiner_body(kernel: &'static Kernel<App>, param: usize) -> usize {
    let target = *TARGET.get().unwrap();
    let result = kernel.task_join(target, WAIT_FOREVER);
    JOIN_RESULTS.lock().unwrap().push((param, result));
    0
}

fn main_body(kernel: &'static Kernel<App>, _: usize) -> usize {
    let me = kernel.current_task().unwrap().unwrap();
    let info = kernel.task_info(me).unwrap();
    assert_eq!(info.name, "main");
    assert_eq!(info.state, TaskSt::Running);
    assert_eq!((info.priority, info.base_priority), (2, 2));
    assert_eq!(kernel.task_get(info.object_id), Ok(me));
    assert_eq!(kernel.task_count(), Ok(NUM_KERNEL_TASKS + 1));

    assert_eq!(kernel.task_join(me, WAIT_FOREVER), Err(JoinError::InvalidArg));

    // `worker` preempts us and starts sleeping
    let start = kernel.tick_count();
    let worker = kernel.task_create(&attr("worker", 3, worker_body, 5)).unwrap();
    assert_eq!(kernel.task_count(), Ok(NUM_KERNEL_TASKS + 2));
    let info = kernel.task_info(worker).unwrap();
    assert_eq!(info.name, "worker");
    assert_eq!(info.state, TaskSt::Pending);

    assert_eq!(kernel.task_join(worker, 0), Err(JoinError::Timeout));
    assert_eq!(kernel.task_join(worker, 1), Err(JoinError::Timeout));
    assert_eq!(kernel.task_join(worker, WAIT_FOREVER), Ok(10));
    assert_eq!(kernel.tick_count().wrapping_sub(start), 3);

    // The handle is stale now
    assert_eq!(kernel.task_join(worker, 0), Err(JoinError::InvalidObject));
    assert_eq!(kernel.task_info(worker), Err(GetTaskError::InvalidObject));
    assert_eq!(
        kernel.task_get(info.object_id),
        Err(GetTaskError::InvalidObject)
    );
    assert_eq!(kernel.task_count(), Ok(NUM_KERNEL_TASKS + 1));

    // Priority levels. A rejected task leaves no wait objects behind.
    let num_objects = kernel.wait_object_count().unwrap();
    assert_eq!(
        kernel.task_create(&attr("conflict", 2, quick_body, 0)),
        Err(CreateTaskError::InvalidPriorityLevel)
    );
    assert_eq!(kernel.wait_object_count(), Ok(num_objects));
    assert_eq!(
        kernel.task_create(&attr("too_high", App::NUM_PRIORITY_LEVELS, quick_body, 0)),
        Err(CreateTaskError::InvalidPriorityLevel)
    );

    // `quick` has a lower priority and doesn't run yet
    let quick = kernel
        .task_create(&TaskAttr {
            stack_size: 4096,
            ..attr("quick", 1, quick_body, 7)
        })
        .unwrap();
    let info = kernel.task_info(quick).unwrap();
    assert_eq!(info.state, TaskSt::Ready);
    assert_eq!(info.stack_size, 4096);

    // Exited tasks hold onto their slots until they are joined
    let filler1 = kernel.task_create(&attr("filler1", 4, quick_body, 1)).unwrap();
    let filler2 = kernel.task_create(&attr("filler2", 5, quick_body, 2)).unwrap();
    assert_eq!(kernel.task_info(filler1).unwrap().state, TaskSt::Dead);
    assert_eq!(
        kernel.task_create(&attr("overflow", 4, quick_body, 0)),
        Err(CreateTaskError::OutOfTaskSlots)
    );
    // Their wait objects are gone already
    assert_eq!(kernel.wait_object_count(), Ok(num_objects + 2));
    assert_eq!(kernel.task_join(filler1, 0), Ok(1));
    assert_eq!(kernel.task_join(filler2, 0), Ok(2));

    // Blocking lets `quick` run
    assert_eq!(kernel.task_join(quick, WAIT_FOREVER), Ok(7));

    // Only the first joiner to resume gets the exit value
    let target = kernel.task_create(&attr("target", 1, target_body, 0)).unwrap();
    TARGET.set(target).unwrap();
    kernel.task_create(&attr("joiner_a", 5, joiner_body, 0)).unwrap();
    kernel.task_create(&attr("joiner_b", 4, joiner_body, 1)).unwrap();
    kernel.task_sleep(5).unwrap();
    assert_eq!(
        *JOIN_RESULTS.lock().unwrap(),
        [(0, Ok(9)), (1, Err(JoinError::InvalidObject))]
    );

    TEST_UTIL.success::<App>();
}
