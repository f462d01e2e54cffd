//! A small preemptive priority RTOS kernel.
//!
//! # Overview
//!
//! The kernel manages a fixed pool of tasks scheduled by priority (a higher
//! number means a higher priority) with optional round-robin time slicing
//! among peers. Tasks block on *wait objects*, which every synchronization
//! object embeds: [`Semaphore`], [`Mutex`], [`CondVar`], [`FlagSet`],
//! [`Mailbox`], [`Timer`], and [`WaitableTimer`].
//!
//! All kernel state lives in one [`Kernel`] value, which the application
//! declares as a `static`:
//!
//! ```rust,ignore
//! nanos_port_std::use_port!(unsafe struct App);
//!
//! impl nanos::KernelCfg for App {
//!     const NUM_PRIORITY_LEVELS: u8 = 8;
//!     const ROUND_ROBIN_TIMESLICE: u32 = 5;
//!     const CPU_USAGE_MEASUREMENT_PERIOD: u32 = 100;
//!     type TaskPool = [nanos::TaskCb<Self>; 8];
//!     type IsrRequestPool = [Option<nanos::IsrRequest<Self>>; 8];
//! }
//!
//! static KERNEL: nanos::Kernel<App> = nanos::Kernel::new();
//! static SEM: nanos::Semaphore<App> = nanos::Semaphore::new();
//! ```
//!
//! # Contexts
//!
//! Services are called from one of the following contexts:
//!
//!  - **Boot context**: between [`Kernel::init`] and [`Kernel::start`].
//!    Objects and tasks can be created, but nothing can block.
//!  - **Task context**: the code of a task. Every service is available.
//!  - **Interrupt context**: the code of an interrupt handler, between
//!    [`Kernel::interrupt_enter`] and [`Kernel::interrupt_exit`]. Blocking
//!    services fail with `BadContext`. The `*_from_isr` services are only
//!    available here.
//!
//! # Critical sections
//!
//! A service runs as a series of short *CPU Lock* sections (interrupts
//! disabled). Between them, interrupts may be taken. The global lock count
//! keeps scheduling deferred for the whole service, and the *ISR lock*
//! marks the one wait object whose state a task is currently updating, so
//! that an interrupt handler touching the same object defers its request to
//! the ISR request task instead of racing with the task.
#![cfg_attr(not(test), no_std)] // Link `std` only when building a test (`cfg(test)`)
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::all)]
#![allow(clippy::new_without_default)]

#[cfg(test)]
#[macro_use]
mod test_port;

pub mod utils;

mod cond_var;
mod error;
mod flag_set;
mod interrupt;
mod kernel;
mod klock;
mod mailbox;
mod mutex;
mod scheduler;
mod semaphore;
mod state;
mod task;
mod task_list;
mod timer;
mod wait;
mod waitable_timer;

pub use self::{
    cond_var::*, error::*, flag_set::*, interrupt::*, kernel::*, mailbox::*, mutex::*,
    semaphore::*, task::*, timer::*, wait::*, waitable_timer::*,
};

use self::utils::Init;

/// The timeout value that makes a blocking service wait forever.
pub const WAIT_FOREVER: u32 = u32::MAX;

/// Implemented by a port. This trait contains items related to low-level
/// operations for controlling CPU states and context switching.
///
/// # Safety
///
/// Implementing a port is inherently unsafe because it's responsible for
/// initializing the execution environment and providing a dispatcher
/// implementation.
///
/// These methods are only meant to be called by the kernel.
#[allow(clippy::missing_safety_doc)]
pub unsafe trait Port: Sized + Send + Sync + 'static {
    /// The per-task state managed by the port, such as a saved stack pointer.
    type PortTaskState: Send + Sync + Init + 'static;

    /// Prepare the execution environment. Called once by [`Kernel::init`]
    /// before any task is created.
    ///
    /// Precondition: CPU Lock inactive, Boot context
    unsafe fn port_init(kernel: &'static Kernel<Self>) -> Result<(), PortInitError>
    where
        Self: KernelCfg;

    /// Prepare `task` for its first activation, so that the next dispatch to
    /// it calls [`Kernel::run_task`] on a fresh stack.
    ///
    /// Precondition: CPU Lock active
    unsafe fn init_task(kernel: &'static Kernel<Self>, task: &'static TaskCb<Self>)
    where
        Self: KernelCfg;

    /// Transfer the control to the task chosen by the scheduler, discarding
    /// the boot context. Returns only when the system is shut down.
    ///
    /// Precondition: CPU Lock inactive, Boot context
    unsafe fn first_context_switch(kernel: &'static Kernel<Self>)
    where
        Self: KernelCfg;

    /// Request a context switch from task level. The switch takes place when
    /// CPU Lock is released, and must not take place before that.
    ///
    /// The port calls [`Kernel::commit_context_switch`] at the point of the
    /// switch.
    ///
    /// Precondition: CPU Lock active
    unsafe fn context_switch(kernel: &'static Kernel<Self>)
    where
        Self: KernelCfg;

    /// Request a context switch from an interrupt handler. The switch takes
    /// place when the outermost interrupt handler returns.
    ///
    /// Precondition: CPU Lock active, Interrupt context
    unsafe fn context_switch_from_isr(kernel: &'static Kernel<Self>)
    where
        Self: KernelCfg;

    /// Discard the current (dead) task's context and transfer the control to
    /// the task chosen by the scheduler. The current context is never
    /// resumed.
    ///
    /// Precondition: CPU Lock active, Task context
    unsafe fn exit_and_dispatch(kernel: &'static Kernel<Self>) -> !
    where
        Self: KernelCfg;

    /// Disable all kernel-managed interrupts (this state is called
    /// *CPU Lock*). Returns `false` if CPU Lock is already active.
    unsafe fn try_enter_cpu_lock() -> bool;

    /// Disable all kernel-managed interrupts.
    ///
    /// Precondition: CPU Lock inactive
    unsafe fn enter_cpu_lock();

    /// Re-enable kernel-managed interrupts previously disabled by
    /// `enter_cpu_lock`, thus deactivating the CPU Lock state. Pending
    /// interrupts and a pending context switch are taken at this point.
    ///
    /// Precondition: CPU Lock active
    unsafe fn leave_cpu_lock();

    /// Return a flag indicating whether a CPU Lock state is active.
    fn is_cpu_lock_active() -> bool;

    /// Get a free-running timestamp in microseconds. Used for CPU-usage
    /// measurement. Wraps around.
    fn timestamp_us() -> u32;

    /// Called repeatedly by the idle task, e.g., to put the processor to
    /// sleep until the next interrupt.
    fn idle(_kernel: &'static Kernel<Self>)
    where
        Self: KernelCfg,
    {
    }

    /// Check the stack of the task being switched out. Called by the
    /// scheduler on every context switch. An error is fatal.
    fn check_task_stack(_task: &'static TaskCb<Self>) -> Result<(), StackCheckError>
    where
        Self: KernelCfg,
    {
        Ok(())
    }

    /// Stop the system for good. Called by [`Kernel::fatal`] with CPU Lock
    /// active.
    fn halt(code: ResultCode) -> !;
}

/// Static configuration of a kernel instance, implemented by the
/// application on its `Traits` type.
pub trait KernelCfg: Port {
    /// The number of task priority levels, in range `3..=64`.
    ///
    /// `0` is the lowest level and belongs to the idle task. The highest two
    /// levels belong to the ISR request task and the timer task.
    const NUM_PRIORITY_LEVELS: u8;

    /// The round-robin time slice, measured in ticks. `0` disables round
    /// robin, in which case each priority level accepts only one task.
    const ROUND_ROBIN_TIMESLICE: u32 = 0;

    /// The period of the CPU-usage measurement window, measured in ticks.
    /// `0` disables the measurement.
    const CPU_USAGE_MEASUREMENT_PERIOD: u32 = 0;

    /// The task control block arena, e.g., `[TaskCb<Self>; 8]`. Three of the
    /// blocks are used by the kernel itself.
    type TaskPool: Init + AsRef<[TaskCb<Self>]> + Send + Sync + 'static;

    /// The deferred interrupt service request ring, e.g.,
    /// `[Option<IsrRequest<Self>>; 8]`. Its length is the number of requests
    /// that can be pending at once.
    type IsrRequestPool: Init
        + AsRef<[Option<IsrRequest<Self>>]>
        + AsMut<[Option<IsrRequest<Self>>]>
        + Send
        + 'static;

    /// Called by [`Kernel::tick_interrupt`] after the kernel processed the
    /// tick. Runs in interrupt context.
    fn tick_hook(_kernel: &'static Kernel<Self>) {}

    /// Called repeatedly by the idle task after [`Port::idle`].
    fn idle_hook(_kernel: &'static Kernel<Self>) {}

    /// Called by [`Kernel::fatal`] before the system is halted.
    fn fatal_hook(_code: ResultCode) {}

    /// Called by the ISR request task when a deferred request fails. Return
    /// `true` to ignore the failure. The default implementation escalates it
    /// to a fatal error.
    fn isr_request_error_hook(_request: &IsrRequest<Self>, _code: ResultCode) -> bool {
        false
    }
}
