//! The kernel object
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use crate::{
    error::{InitError, StartError},
    interrupt::{isr_request_task, IsrRequest, IsrState},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    scheduler::SchedState,
    task::{TaskAttr, TaskSt, TaskState},
    timer::{timer_task, TimerState},
    utils::{Init, MAX_PRIORITY_LEVELS},
    wait::{QueuingType, WaitObjectRegistry, WaitObjectType},
    KernelCfg, ResultCode,
};

/// The version of the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version {
    pub major: u8,
    pub minor: u8,
}

/// The state of a kernel instance.
///
/// There must be only one instance per `Traits` type, declared as a
/// `static`.
pub struct Kernel<Traits: KernelCfg> {
    pub(crate) task_pool: Traits::TaskPool,
    pub(crate) tasks: TaskState<Traits>,
    pub(crate) sched: SchedState<Traits>,
    pub(crate) isr: IsrState<Traits>,
    pub(crate) timers: TimerState<Traits>,
    pub(crate) wait_objects: WaitObjectRegistry<Traits>,
    pub(crate) tick_count: AtomicU32,
    cpu_usage: CpuUsageState<Traits>,
    initialized: AtomicBool,
    pub(crate) started: AtomicBool,
}

struct CpuUsageState<Traits: KernelCfg> {
    /// The tick at which the current measurement window ends.
    next_measurement: CpuLockCell<Traits, u32>,
    /// The timestamp at which the current measurement window started.
    window_start: CpuLockCell<Traits, u32>,
}

impl<Traits: KernelCfg> Init for CpuUsageState<Traits> {
    const INIT: Self = Self {
        next_measurement: Init::INIT,
        window_start: Init::INIT,
    };
}

impl<Traits: KernelCfg> Kernel<Traits> {
    /// The version of this kernel implementation.
    pub const VERSION: Version = Version { major: 1, minor: 0 };

    pub const fn new() -> Self {
        const {
            assert!(
                Traits::NUM_PRIORITY_LEVELS >= 3
                    && Traits::NUM_PRIORITY_LEVELS as usize <= MAX_PRIORITY_LEVELS,
                "`NUM_PRIORITY_LEVELS` must be in range `3..=64`"
            );
        }

        Self {
            task_pool: Init::INIT,
            tasks: Init::INIT,
            sched: Init::INIT,
            isr: Init::INIT,
            timers: Init::INIT,
            wait_objects: Init::INIT,
            tick_count: AtomicU32::new(0),
            cpu_usage: Init::INIT,
            initialized: AtomicBool::new(false),
            started: AtomicBool::new(false),
        }
    }

    /// Initialize the port and the kernel, and create the kernel tasks: the
    /// ISR request task (the highest priority), the timer task (the second
    /// highest priority), and the idle task (priority `0`).
    ///
    /// Called once from the boot context.
    pub fn init(&'static self) -> Result<(), InitError> {
        if self.is_started() || self.initialized.swap(true, Ordering::AcqRel) {
            return Err(InitError::BadContext);
        }

        // Safety: Boot context, CPU Lock inactive
        unsafe { Traits::port_init(self) }?;

        let mut lock = klock::lock_cpu::<Traits>()?;

        self.isr.wait.initialize(
            self,
            lock.borrow_mut(),
            WaitObjectType::Task,
            QueuingType::Fifo,
        )?;
        self.timers.wait.initialize(
            self,
            lock.borrow_mut(),
            WaitObjectType::Task,
            QueuingType::Fifo,
        )?;

        let top = Traits::NUM_PRIORITY_LEVELS - 1;
        for attr in [
            TaskAttr {
                name: "ISR request task",
                priority: top,
                entry: isr_request_task::<Traits>,
                param: 0,
                stack_size: 0,
            },
            TaskAttr {
                name: "Timer task",
                priority: top - 1,
                entry: timer_task::<Traits>,
                param: 0,
                stack_size: 0,
            },
            TaskAttr {
                name: "Idle task",
                priority: 0,
                entry: idle_task::<Traits>,
                param: 0,
                stack_size: 0,
            },
        ] {
            self.create_task_inner(lock.borrow_mut(), &attr)?;
        }

        self.cpu_usage
            .next_measurement
            .replace(&mut *lock, Traits::CPU_USAGE_MEASUREMENT_PERIOD);

        log::debug!(
            "kernel initialized ({} priority levels, time slice = {})",
            Traits::NUM_PRIORITY_LEVELS,
            Traits::ROUND_ROBIN_TIMESLICE
        );
        Ok(())
    }

    /// Start scheduling tasks. Returns only when the port shuts the system
    /// down.
    pub fn start(&'static self) -> Result<(), StartError> {
        {
            let mut lock = klock::lock_cpu::<Traits>()?;
            if !self.initialized.load(Ordering::Acquire) || self.is_started() {
                return Err(StartError::BadContext);
            }

            self.choose_next_running_task(lock.borrow_mut());

            let now = Traits::timestamp_us();
            self.sched.context_switch_timestamp.replace(&mut *lock, now);
            self.cpu_usage.window_start.replace(&mut *lock, now);

            self.started.store(true, Ordering::Release);
            log::debug!("starting the first task");
        }

        // Safety: Boot context, CPU Lock inactive
        unsafe { Traits::first_context_switch(self) };

        self.started.store(false, Ordering::Release);
        Ok(())
    }

    /// Get the number of ticks since the kernel was started. Wraps around.
    #[inline]
    pub fn tick_count(&self) -> u32 {
        self.tick_count.load(Ordering::Relaxed)
    }

    /// Process a tick. Called by the port's tick interrupt handler once per
    /// tick period.
    pub fn tick_interrupt(&'static self) {
        let tick = self.tick_count.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        {
            let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
                self.fatal(ResultCode::BadContext);
            };

            if let Some(cur) = self.sched.current_task.get(&*lock) {
                if let Err(e) = Traits::check_task_stack(self.task_cb(cur)) {
                    self.fatal(e.into());
                }
            }

            self.measure_cpu_usage(lock.borrow_mut(), tick);

            if self.isr.lock_count.load(Ordering::Relaxed) == 0 {
                self.timer_tick(lock.borrow_mut(), tick);
                self.handle_suspended_tasks(lock.borrow_mut(), tick, true);
            } else {
                for request in [
                    IsrRequest::TimerTick { tick },
                    IsrRequest::HandleSuspendedTasks { tick },
                ] {
                    if let Err(e) = self.queue_isr_request(lock.borrow_mut(), request) {
                        self.fatal(e.into());
                    }
                }
            }
        }

        Traits::tick_hook(self);
    }

    /// Close the CPU-usage measurement window if it ends on `tick`.
    fn measure_cpu_usage(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, tick: u32) {
        let period = Traits::CPU_USAGE_MEASUREMENT_PERIOD;
        if period == 0 || self.cpu_usage.next_measurement.get(&*lock) != tick {
            return;
        }

        let now = Traits::timestamp_us();
        self.account_execution_time(lock.borrow_mut(), now);
        let window = now.wrapping_sub(self.cpu_usage.window_start.replace(&mut *lock, now));

        for task in self.task_pool() {
            if task.st.get(&*lock) == TaskSt::Free {
                continue;
            }
            let time = task.execution_time.replace(&mut *lock, 0);
            let usage = if window == 0 {
                0
            } else {
                (u64::from(time) * 1000 / u64::from(window)).min(1000) as u32
            };
            task.cpu_usage.replace(&mut *lock, usage);
        }

        self.cpu_usage
            .next_measurement
            .replace(&mut *lock, tick.wrapping_add(period));
    }

    /// Halt the system.
    ///
    /// This is where a broken invariant ends up. It enters CPU Lock, calls
    /// [`KernelCfg::fatal_hook`], and then [`Port::halt`](crate::Port::halt).
    pub fn fatal(&'static self, code: ResultCode) -> ! {
        // Safety: The CPU Lock state is never left after this point
        let _ = unsafe { Traits::try_enter_cpu_lock() };
        log::error!("fatal error: {code:?}");
        Traits::fatal_hook(code);
        Traits::halt(code)
    }
}

/// The body of the idle task.
fn idle_task<Traits: KernelCfg>(kernel: &'static Kernel<Traits>, _: usize) -> usize {
    loop {
        Traits::idle(kernel);
        Traits::idle_hook(kernel);
    }
}
