//! Simulation environment for running nanos on a hosted environment.
//!
//! Every task runs on its own host thread, but only one of them holds the
//! simulated CPU at any time. A context switch hands the CPU over to the
//! thread of the next task and parks the current one.
//!
//! Interrupts are simulated by closures. [`pend_interrupt`] runs one right
//! away (as if the interrupt line was asserted with interrupts enabled), and
//! [`schedule_interrupt`] holds it until the current task next releases
//! CPU Lock, which lets a test land an interrupt in the middle of a service
//! call. Time is simulated as well: ticks are generated by [`advance`], and
//! by the idle task whenever nothing else is ready to run.
//!
//! ```rust,ignore
//! nanos_port_std::use_port!(unsafe struct App);
//!
//! impl nanos::KernelCfg for App { /* ... */ }
//!
//! static KERNEL: nanos::Kernel<App> = nanos::Kernel::new();
//!
//! nanos_port_std::boot(&KERNEL, |kernel| {
//!     kernel.task_create(&main_task_attr)?;
//!     Ok(())
//! })
//! .unwrap();
//! ```
#![deny(unsafe_op_in_unsafe_fn)]
use nanos::{Kernel, KernelCfg, Port, PortInitError, ResultCode, TaskCb};
use once_cell::sync::OnceCell;
use spin::Mutex as SpinMutex;
use std::{
    any::Any,
    cell::Cell,
    collections::VecDeque,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Condvar, Mutex, MutexGuard, PoisonError,
    },
};

/// Used by `use_port!`
#[doc(hidden)]
pub extern crate nanos;

/// The simulated length of a tick, measured in microseconds.
pub const TICK_PERIOD_US: u32 = 1000;

/// Implemented on a kernel trait type by [`use_port!`].
///
/// # Safety
///
/// Only meant to be implemented by [`use_port!`].
#[doc(hidden)]
pub unsafe trait PortInstance: KernelCfg + Port<PortTaskState = TaskState> {
    fn port_state() -> &'static State<Self>;
}

/// A simulated interrupt handler.
pub type InterruptHandler<Traits> = Box<dyn FnOnce(&'static Kernel<Traits>) + Send>;

/// The internal state of the port.
///
/// # Safety
///
/// For the safety information of this type's methods, see the documentation
/// of the corresponding trait methods of [`Port`].
#[doc(hidden)]
pub struct State<Traits: KernelCfg> {
    kernel: OnceCell<&'static Kernel<Traits>>,
    /// The owner of the simulated CPU.
    cpu: Mutex<Cpu>,
    cpu_cond: Condvar,
    cpu_lock: AtomicBool,
    /// Set while a simulated interrupt handler runs.
    in_isr: AtomicBool,
    dispatch_pending: AtomicBool,
    pended: SpinMutex<VecDeque<InterruptHandler<Traits>>>,
    timestamp: AtomicU32,
    /// The panic that brought the system down.
    panic: SpinMutex<Option<Box<dyn Any + Send>>>,
}

struct Cpu {
    /// The address of the task control block of the thread allowed to run.
    running: Option<usize>,
    shutdown: bool,
}

#[derive(Debug)]
pub struct TaskState {
    /// The task's backing thread has been spawned.
    spawned: AtomicBool,
}

impl nanos::utils::Init for TaskState {
    #[allow(clippy::declare_interior_mutable_const)]
    const INIT: Self = Self {
        spawned: AtomicBool::new(false),
    };
}

/// The panic payload used to unwind the thread of a task that exited or
/// was abandoned by a shutdown.
struct ThreadExit;

/// The role of a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ThreadRole {
    Unknown,
    Boot,
    /// The backing thread for a task.
    Task,
}

thread_local! {
    /// The current thread's role. It's automatically assigned after the
    /// creation of a thread managed by the port.
    static THREAD_ROLE: Cell<ThreadRole> = Cell::new(ThreadRole::Unknown);
    /// The address of the task control block of the task backed by the
    /// current thread.
    static CURRENT_TASK: Cell<usize> = Cell::new(0);
}

fn task_addr<Traits: KernelCfg>(task: &'static TaskCb<Traits>) -> usize {
    task as *const TaskCb<Traits> as usize
}

#[allow(clippy::missing_safety_doc)]
impl<Traits: PortInstance> State<Traits> {
    #[allow(clippy::new_without_default)]
    pub const fn new() -> Self {
        Self {
            kernel: OnceCell::new(),
            cpu: Mutex::new(Cpu {
                running: None,
                shutdown: false,
            }),
            cpu_cond: Condvar::new(),
            cpu_lock: AtomicBool::new(false),
            in_isr: AtomicBool::new(false),
            dispatch_pending: AtomicBool::new(false),
            pended: SpinMutex::new(VecDeque::new()),
            timestamp: AtomicU32::new(0),
            panic: SpinMutex::new(None),
        }
    }

    fn lock_cpu_state(&self) -> MutexGuard<'_, Cpu> {
        // A poisoned lock only means another thread panicked, which is
        // handled separately
        self.cpu.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shut_down(&self) -> bool {
        self.lock_cpu_state().shutdown
    }

    fn kernel(&self) -> &'static Kernel<Traits> {
        match self.kernel.get() {
            Some(kernel) => kernel,
            None => panic!("the port is not initialized"),
        }
    }

    pub unsafe fn port_init(&self, kernel: &'static Kernel<Traits>) -> Result<(), PortInitError> {
        log::trace!("port_init");
        self.kernel.set(kernel).map_err(|_| PortInitError::PortInit)
    }

    pub unsafe fn init_task(&self, task: &'static TaskCb<Traits>) {
        log::trace!("init_task({task:p})");
        // The slot may be reused. The previous task's thread has exited by
        // now.
        task.port_task_state.spawned.store(false, Ordering::Relaxed);
    }

    pub unsafe fn first_context_switch(&'static self, kernel: &'static Kernel<Traits>) {
        log::trace!("first_context_switch");
        assert_eq!(expect_worker_thread(), ThreadRole::Boot);

        unsafe { self.enter_cpu_lock() };
        self.dispatch_pending.store(false, Ordering::Relaxed);
        // Safety: CPU Lock active
        let next = unsafe { kernel.commit_context_switch() };
        self.cpu_lock.store(false, Ordering::Relaxed);

        if let Some(next) = next {
            self.hand_over(kernel, next);
        }

        // The boot context is discarded. Wait for the shutdown.
        let mut cpu = self.lock_cpu_state();
        while !cpu.shutdown {
            cpu = self
                .cpu_cond
                .wait(cpu)
                .unwrap_or_else(PoisonError::into_inner);
        }
        log::trace!("first_context_switch: shut down");
    }

    pub unsafe fn context_switch(&self) {
        log::trace!("context_switch");
        self.dispatch_pending.store(true, Ordering::Relaxed);
    }

    pub unsafe fn context_switch_from_isr(&self) {
        log::trace!("context_switch_from_isr");
        self.dispatch_pending.store(true, Ordering::Relaxed);
    }

    pub unsafe fn exit_and_dispatch(&'static self, kernel: &'static Kernel<Traits>) -> ! {
        log::trace!("exit_and_dispatch");
        assert_eq!(expect_worker_thread(), ThreadRole::Task);
        assert!(self.cpu_lock.load(Ordering::Relaxed));

        self.dispatch_pending.store(false, Ordering::Relaxed);
        // Safety: CPU Lock active
        let next = unsafe { kernel.commit_context_switch() };
        self.cpu_lock.store(false, Ordering::Relaxed);

        if let Some(next) = next {
            self.hand_over(kernel, next);
        }

        log::trace!("exit_and_dispatch: terminating the thread");
        panic::resume_unwind(Box::new(ThreadExit));
    }

    pub unsafe fn try_enter_cpu_lock(&self) -> bool {
        !self.cpu_lock.swap(true, Ordering::Relaxed)
    }

    pub unsafe fn enter_cpu_lock(&self) {
        log::trace!("enter_cpu_lock");
        let was_active = self.cpu_lock.swap(true, Ordering::Relaxed);
        debug_assert!(!was_active || std::thread::panicking());
    }

    pub unsafe fn leave_cpu_lock(&'static self) {
        log::trace!("leave_cpu_lock");
        self.cpu_lock.store(false, Ordering::Relaxed);

        if self.in_isr.load(Ordering::Relaxed)
            || std::thread::panicking()
            || THREAD_ROLE.with(|r| r.get()) != ThreadRole::Task
            || self.is_shut_down()
        {
            return;
        }

        self.take_pending();
    }

    pub fn is_cpu_lock_active(&self) -> bool {
        self.cpu_lock.load(Ordering::Relaxed)
    }

    pub fn timestamp_us(&self) -> u32 {
        self.timestamp.load(Ordering::Relaxed)
    }

    /// Let time pass: take the pending interrupts, or a tick if there are
    /// none.
    pub fn idle(&'static self) {
        if self.pended.lock().is_empty() {
            self.pended.lock().push_back(Box::new(tick_handler::<Traits>));
        }
        // Safety: Task context, CPU Lock inactive
        unsafe {
            self.enter_cpu_lock();
            self.leave_cpu_lock();
        }
    }

    pub fn halt(&self, code: ResultCode) -> ! {
        log::error!("halted with {code:?}");
        panic!("the kernel halted with {code:?}");
    }

    /// Take pending interrupts and context switches until there are none
    /// left.
    fn take_pending(&'static self) {
        loop {
            let handler = self.pended.lock().pop_front();
            if let Some(handler) = handler {
                self.run_interrupt(handler);
            } else if self.dispatch_pending.load(Ordering::Relaxed) {
                self.dispatch();
            } else {
                break;
            }
        }
    }

    fn run_interrupt(&'static self, handler: InterruptHandler<Traits>) {
        let kernel = self.kernel();
        log::trace!("interrupt enter");
        self.in_isr.store(true, Ordering::Relaxed);
        // Safety: We are the port. CPU Lock inactive.
        unsafe { kernel.interrupt_enter() };
        handler(kernel);
        unsafe { kernel.interrupt_exit() };
        self.in_isr.store(false, Ordering::Relaxed);
        log::trace!("interrupt exit");
    }

    /// Perform the pending context switch. Returns when the current task is
    /// dispatched again.
    fn dispatch(&'static self) {
        let kernel = self.kernel();

        unsafe { self.enter_cpu_lock() };
        self.dispatch_pending.store(false, Ordering::Relaxed);
        // Safety: CPU Lock active
        let next = unsafe { kernel.commit_context_switch() };
        self.cpu_lock.store(false, Ordering::Relaxed);

        let me = CURRENT_TASK.with(|t| t.get());
        let Some(next) = next else {
            return;
        };
        if task_addr(next) == me {
            return;
        }

        self.hand_over(kernel, next);
        self.wait_for_cpu(me);
    }

    /// Give the CPU to `next`, spawning its thread if it's dispatched for the
    /// first time.
    fn hand_over(&'static self, kernel: &'static Kernel<Traits>, next: &'static TaskCb<Traits>) {
        let addr = task_addr(next);
        log::trace!("handing over the CPU to {addr:#x}");

        let mut cpu = self.lock_cpu_state();
        cpu.running = Some(addr);

        if !next.port_task_state.spawned.swap(true, Ordering::Relaxed) {
            let builder = std::thread::Builder::new().name(format!("task@{addr:#x}"));
            let spawned = builder.spawn(move || {
                THREAD_ROLE.with(|role| role.set(ThreadRole::Task));
                CURRENT_TASK.with(|t| t.set(addr));

                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    self.wait_for_cpu(addr);
                    log::debug!("task {addr:#x} is now running");
                    // Safety: A fresh context, CPU Lock inactive
                    unsafe { kernel.run_task(next) }
                }));

                if let Err(payload) = result {
                    if !payload.is::<ThreadExit>() {
                        self.abort(payload);
                    }
                }
            });
            if let Err(e) = spawned {
                drop(cpu);
                panic!("failed to spawn a task thread: {e}");
            }
        }

        drop(cpu);
        self.cpu_cond.notify_all();
    }

    /// Park the current thread until the CPU is given to the task at `me`.
    /// Unwinds the thread if the system is shut down in the meantime.
    fn wait_for_cpu(&self, me: usize) {
        let mut cpu = self.lock_cpu_state();
        while cpu.running != Some(me) && !cpu.shutdown {
            cpu = self
                .cpu_cond
                .wait(cpu)
                .unwrap_or_else(PoisonError::into_inner);
        }
        if cpu.shutdown {
            drop(cpu);
            panic::resume_unwind(Box::new(ThreadExit));
        }
    }

    /// Bring the system down because of a panic in a task.
    fn abort(&self, payload: Box<dyn Any + Send>) {
        log::trace!("a task panicked; shutting down");
        self.panic.lock().get_or_insert(payload);
        self.shutdown();
    }

    fn shutdown(&self) {
        self.lock_cpu_state().shutdown = true;
        self.cpu_cond.notify_all();
    }

    fn pend(&'static self, handler: InterruptHandler<Traits>, take_now: bool) {
        self.pended.lock().push_back(handler);

        if take_now
            && !self.cpu_lock.load(Ordering::Relaxed)
            && !self.in_isr.load(Ordering::Relaxed)
        {
            // Safety: CPU Lock inactive
            unsafe {
                self.enter_cpu_lock();
                self.leave_cpu_lock();
            }
        }
    }
}

/// The tick interrupt handler.
fn tick_handler<Traits: PortInstance>(kernel: &'static Kernel<Traits>) {
    Traits::port_state()
        .timestamp
        .fetch_add(TICK_PERIOD_US, Ordering::Relaxed);
    kernel.tick_interrupt();
}

/// Assert that the current thread is managed by the port.
fn expect_worker_thread() -> ThreadRole {
    let role = THREAD_ROLE.with(|r| r.get());
    assert_ne!(role, ThreadRole::Unknown);
    role
}

/// Initialize and start `kernel`, calling `init` in the boot context to
/// create the application's objects and tasks.
///
/// Returns when the system is shut down by [`shutdown`]. A panic in a task
/// (including a fatal kernel error) shuts the system down and is propagated
/// to the caller.
pub fn boot<Traits: PortInstance>(
    kernel: &'static Kernel<Traits>,
    init: impl FnOnce(&'static Kernel<Traits>) -> Result<(), ResultCode>,
) -> Result<(), ResultCode> {
    let _ = env_logger::builder().is_test(true).try_init();

    assert_eq!(
        THREAD_ROLE.with(|r| r.get()),
        ThreadRole::Unknown,
        "`boot` cannot be called from a port-managed thread"
    );
    THREAD_ROLE.with(|role| role.set(ThreadRole::Boot));

    let result = (|| {
        kernel.init()?;
        init(kernel)?;
        kernel.start()?;
        Ok(())
    })();

    THREAD_ROLE.with(|role| role.set(ThreadRole::Unknown));

    // Propagate any panic that occured in a task
    if let Some(payload) = Traits::port_state().panic.lock().take() {
        panic::resume_unwind(payload);
    }

    result
}

/// Initiate a shutdown. [`boot`] returns afterwards.
///
/// Must be called from a task. The calling task never resumes.
pub fn shutdown<Traits: PortInstance>() -> ! {
    assert_eq!(expect_worker_thread(), ThreadRole::Task);
    log::debug!("shutdown");
    Traits::port_state().shutdown();
    panic::resume_unwind(Box::new(ThreadExit));
}

/// Raise a simulated interrupt. If the caller is a task with CPU Lock
/// inactive, the interrupt is taken before this function returns.
/// Otherwise, it's taken when the running task next releases CPU Lock.
///
/// Can be called from any thread, including threads not managed by the
/// port.
pub fn pend_interrupt<Traits: PortInstance>(
    handler: impl FnOnce(&'static Kernel<Traits>) + Send + 'static,
) {
    log::trace!("pend_interrupt");
    let take_now = THREAD_ROLE.with(|r| r.get()) == ThreadRole::Task;
    Traits::port_state().pend(Box::new(handler), take_now);
}

/// Raise a simulated interrupt that's taken the next time the current task
/// releases CPU Lock, e.g., in the middle of the next service call.
pub fn schedule_interrupt<Traits: PortInstance>(
    handler: impl FnOnce(&'static Kernel<Traits>) + Send + 'static,
) {
    log::trace!("schedule_interrupt");
    expect_worker_thread();
    Traits::port_state().pend(Box::new(handler), false);
}

/// Let `ticks` ticks pass. Each tick is processed, along with the task
/// switches it causes, before the next one.
///
/// Must be called from a task.
pub fn advance<Traits: PortInstance>(ticks: u32) {
    assert_eq!(expect_worker_thread(), ThreadRole::Task);
    for _ in 0..ticks {
        pend_interrupt::<Traits>(tick_handler::<Traits>);
    }
}

#[macro_export]
macro_rules! use_port {
    (unsafe $vis:vis struct $Traits:ident) => {
        $vis struct $Traits;

        mod port_std_impl {
            use super::$Traits;
            use $crate::nanos::{Kernel, Port, PortInitError, ResultCode, TaskCb};
            use $crate::{PortInstance, State, TaskState};

            pub(super) static PORT_STATE: State<$Traits> = State::new();

            unsafe impl PortInstance for $Traits {
                #[inline]
                fn port_state() -> &'static State<Self> {
                    &PORT_STATE
                }
            }

            // Assume `$Traits: KernelCfg`
            unsafe impl Port for $Traits {
                type PortTaskState = TaskState;

                unsafe fn port_init(kernel: &'static Kernel<Self>) -> Result<(), PortInitError> {
                    unsafe { PORT_STATE.port_init(kernel) }
                }

                unsafe fn init_task(_kernel: &'static Kernel<Self>, task: &'static TaskCb<Self>) {
                    unsafe { PORT_STATE.init_task(task) }
                }

                unsafe fn first_context_switch(kernel: &'static Kernel<Self>) {
                    unsafe { PORT_STATE.first_context_switch(kernel) }
                }

                unsafe fn context_switch(_kernel: &'static Kernel<Self>) {
                    unsafe { PORT_STATE.context_switch() }
                }

                unsafe fn context_switch_from_isr(_kernel: &'static Kernel<Self>) {
                    unsafe { PORT_STATE.context_switch_from_isr() }
                }

                unsafe fn exit_and_dispatch(kernel: &'static Kernel<Self>) -> ! {
                    unsafe { PORT_STATE.exit_and_dispatch(kernel) }
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    unsafe { PORT_STATE.try_enter_cpu_lock() }
                }

                unsafe fn enter_cpu_lock() {
                    unsafe { PORT_STATE.enter_cpu_lock() }
                }

                unsafe fn leave_cpu_lock() {
                    unsafe { PORT_STATE.leave_cpu_lock() }
                }

                fn is_cpu_lock_active() -> bool {
                    PORT_STATE.is_cpu_lock_active()
                }

                fn timestamp_us() -> u32 {
                    PORT_STATE.timestamp_us()
                }

                fn idle(_kernel: &'static Kernel<Self>) {
                    PORT_STATE.idle()
                }

                fn halt(code: ResultCode) -> ! {
                    PORT_STATE.halt(code)
                }
            }
        }
    };
}
