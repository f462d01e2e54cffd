//! Tasks
use core::{fmt, mem};

use crate::{
    error::{
        BadContextError, CreateTaskError, GetTaskError, InvalidObjectError, JoinError, SleepError,
        WaitError,
    },
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    mailbox::MailSlot,
    task_list::{self, Link, TaskIdx, TaskList},
    utils::Init,
    wait::{QueuingType, WaitObject, WaitObjectType},
    Kernel, KernelCfg, ResultCode,
};

/// The entry point of a task. Receives the task parameter and returns the
/// exit value, which can be retrieved by [`Kernel::task_join`].
pub type TaskEntry<Traits> = fn(&'static Kernel<Traits>, usize) -> usize;

/// Task state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskSt {
    /// The slot is unused.
    Free,
    Ready,
    Pending,
    Running,
    /// The entry function returned. The slot is freed when the task is
    /// joined.
    Dead,
}

impl Init for TaskSt {
    const INIT: Self = Self::Free;
}

/// The parameters of [`Kernel::task_create`].
pub struct TaskAttr<Traits: KernelCfg> {
    pub name: &'static str,
    /// In range `0..NUM_PRIORITY_LEVELS`. A higher value means a higher
    /// priority.
    pub priority: u8,
    pub entry: TaskEntry<Traits>,
    pub param: usize,
    /// The stack size requested from the port. `0` selects the port's
    /// default.
    pub stack_size: usize,
}

impl<Traits: KernelCfg> Clone for TaskAttr<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelCfg> Copy for TaskAttr<Traits> {}

impl<Traits: KernelCfg> fmt::Debug for TaskAttr<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskAttr")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("param", &self.param)
            .field("stack_size", &self.stack_size)
            .finish_non_exhaustive()
    }
}

/// A handle to a task.
///
/// A handle outlives the task it refers to. Once the task is joined and its
/// slot is reused, the handle is rejected with `InvalidObject`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId {
    index: TaskIdx,
    object_id: u32,
}

impl TaskId {
    /// The index of the task control block in the task pool.
    pub fn index(self) -> usize {
        self.index
    }

    /// The kernel-wide object identifier of the task.
    pub fn object_id(self) -> u32 {
        self.object_id
    }
}

/// A snapshot of a task's state, returned by [`Kernel::task_info`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskInfo {
    pub name: &'static str,
    pub object_id: u32,
    pub priority: u8,
    pub base_priority: u8,
    pub state: TaskSt,
    pub stack_size: usize,
    /// The share of the CPU time used during the last measurement window,
    /// in per-mille.
    pub cpu_usage: u32,
    /// The number of times the task was dispatched.
    pub execution_count: u32,
}

/// Per-wait information exchanged between a blocked task and the object
/// that wakes it up.
#[derive(Debug)]
pub(crate) enum WaitPayload {
    None,
    FlagSet {
        mask: u32,
        wait_all: bool,
        reset: bool,
        /// The flags that satisfied the wait.
        result: u32,
    },
    /// The buffer that receives a mail.
    Mail(MailSlot),
    /// The waitable timer was stopped during the wait.
    TimerStopped,
}

impl Init for WaitPayload {
    const INIT: Self = Self::None;
}

/// *Task control block* - the state data of a task.
#[repr(C)]
pub struct TaskCb<Traits: KernelCfg> {
    /// The port-specific state of the task.
    ///
    /// This field is placed at the beginning so that ports written in
    /// assembly can find it at a fixed offset.
    pub port_task_state: Traits::PortTaskState,

    pub(crate) st: CpuLockCell<Traits, TaskSt>,
    pub(crate) object_id: CpuLockCell<Traits, u32>,
    pub(crate) name: CpuLockCell<Traits, &'static str>,
    /// The priority the task is scheduled with. Always equal to
    /// `base_priority` since there's no priority inheritance.
    pub(crate) priority: CpuLockCell<Traits, u8>,
    pub(crate) base_priority: CpuLockCell<Traits, u8>,
    pub(crate) entry: CpuLockCell<Traits, Option<TaskEntry<Traits>>>,
    pub(crate) param: CpuLockCell<Traits, usize>,
    pub(crate) ret_value: CpuLockCell<Traits, usize>,
    pub(crate) stack_size: CpuLockCell<Traits, usize>,

    /// The next task in the ready list or the wait list containing this
    /// task.
    pub(crate) next: CpuLockCell<Traits, Option<TaskIdx>>,
    pub(crate) suspended_next: CpuLockCell<Traits, Option<TaskIdx>>,
    pub(crate) global_next: CpuLockCell<Traits, Option<TaskIdx>>,

    pub(crate) wait_target: CpuLockCell<Traits, Option<&'static WaitObject<Traits>>>,
    /// The tick at which the current wait times out.
    pub(crate) wait_timeout: CpuLockCell<Traits, Option<u32>>,
    pub(crate) wait_status: CpuLockCell<Traits, Result<(), WaitError>>,
    pub(crate) wait_payload: CpuLockCell<Traits, WaitPayload>,

    /// The remaining round-robin time slice, measured in ticks.
    pub(crate) timeslice: CpuLockCell<Traits, u32>,
    /// The CPU time used in the current measurement window, measured in
    /// microseconds.
    pub(crate) execution_time: CpuLockCell<Traits, u32>,
    pub(crate) execution_count: CpuLockCell<Traits, u32>,
    pub(crate) cpu_usage: CpuLockCell<Traits, u32>,

    pub(crate) sleep_wait: WaitObject<Traits>,
    pub(crate) join_wait: WaitObject<Traits>,
}

impl<Traits: KernelCfg> Init for TaskCb<Traits> {
    const INIT: Self = Self {
        port_task_state: Init::INIT,
        st: Init::INIT,
        object_id: Init::INIT,
        name: Init::INIT,
        priority: Init::INIT,
        base_priority: Init::INIT,
        entry: Init::INIT,
        param: Init::INIT,
        ret_value: Init::INIT,
        stack_size: Init::INIT,
        next: Init::INIT,
        suspended_next: Init::INIT,
        global_next: Init::INIT,
        wait_target: Init::INIT,
        wait_timeout: Init::INIT,
        wait_status: CpuLockCell::new(Ok(())),
        wait_payload: Init::INIT,
        timeslice: Init::INIT,
        execution_time: Init::INIT,
        execution_count: Init::INIT,
        cpu_usage: Init::INIT,
        sleep_wait: Init::INIT,
        join_wait: Init::INIT,
    };
}

impl<Traits: KernelCfg> fmt::Debug for TaskCb<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("self", &(self as *const _))
            .field("st", &self.st)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelCfg> TaskCb<Traits> {
    /// Get the name of the task. Returns `None` if CPU Lock is active.
    pub fn name(&self) -> Option<&'static str> {
        let lock = klock::lock_cpu::<Traits>().ok()?;
        Some(self.name.get(&*lock))
    }
}

/// The task bookkeeping of a kernel.
pub(crate) struct TaskState<Traits: KernelCfg> {
    /// Every created and not yet joined task, linked by
    /// [`TaskCb::global_next`].
    pub(crate) global_head: CpuLockCell<Traits, Option<TaskIdx>>,
    pub(crate) count: CpuLockCell<Traits, u32>,
}

impl<Traits: KernelCfg> Init for TaskState<Traits> {
    const INIT: Self = Self {
        global_head: Init::INIT,
        count: Init::INIT,
    };
}

impl<Traits: KernelCfg> Kernel<Traits> {
    pub(crate) fn task_pool(&self) -> &[TaskCb<Traits>] {
        self.task_pool.as_ref()
    }

    pub(crate) fn task_cb(&'static self, idx: TaskIdx) -> &'static TaskCb<Traits> {
        &self.task_pool.as_ref()[idx]
    }

    /// Get the index of a task control block in the task pool.
    pub(crate) fn task_idx(&self, task: &TaskCb<Traits>) -> TaskIdx {
        let base = self.task_pool().as_ptr() as usize;
        (task as *const TaskCb<Traits> as usize - base) / mem::size_of::<TaskCb<Traits>>()
    }

    fn task_id(&'static self, lock: CpuLockTokenRefMut<'_, Traits>, index: TaskIdx) -> TaskId {
        TaskId {
            index,
            object_id: self.task_cb(index).object_id.get(&*lock),
        }
    }

    /// Resolve a handle to a live (created and not yet joined) task.
    fn resolve_task<E: From<InvalidObjectError>>(
        &'static self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        id: TaskId,
    ) -> Result<TaskIdx, E> {
        match self.task_pool().get(id.index) {
            Some(task)
                if task.st.get(&*lock) != TaskSt::Free
                    && task.object_id.get(&*lock) == id.object_id =>
            {
                Ok(id.index)
            }
            _ => Err(InvalidObjectError::InvalidObject.into()),
        }
    }

    /// Create a task. The new task is ready to run immediately.
    ///
    /// Fails with `OutOfTaskSlots` if the task pool is exhausted, and with
    /// `InvalidPriorityLevel` if the priority is out of range or, when round
    /// robin is disabled, already taken by another ready task.
    pub fn task_create(&'static self, attr: &TaskAttr<Traits>) -> Result<TaskId, CreateTaskError> {
        self.expect_thread_context()?;
        self.syscall(|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.create_task_inner(lock.borrow_mut(), attr)
        })
    }

    pub(crate) fn create_task_inner(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        attr: &TaskAttr<Traits>,
    ) -> Result<TaskId, CreateTaskError> {
        if attr.priority >= Traits::NUM_PRIORITY_LEVELS {
            return Err(CreateTaskError::InvalidPriorityLevel);
        }

        let idx = self
            .task_pool()
            .iter()
            .position(|task| task.st.get(&*lock) == TaskSt::Free)
            .ok_or(CreateTaskError::OutOfTaskSlots)?;
        let task = self.task_cb(idx);

        task.name.replace(&mut *lock, attr.name);
        task.priority.replace(&mut *lock, attr.priority);
        task.base_priority.replace(&mut *lock, attr.priority);
        task.entry.replace(&mut *lock, Some(attr.entry));
        task.param.replace(&mut *lock, attr.param);
        task.ret_value.replace(&mut *lock, 0);
        task.stack_size.replace(&mut *lock, attr.stack_size);
        task.wait_target.replace(&mut *lock, None);
        task.wait_status.replace(&mut *lock, Ok(()));
        task.wait_payload.replace(&mut *lock, WaitPayload::None);
        task.execution_time.replace(&mut *lock, 0);
        task.execution_count.replace(&mut *lock, 0);
        task.cpu_usage.replace(&mut *lock, 0);

        task.sleep_wait
            .initialize(self, lock.borrow_mut(), WaitObjectType::Task, QueuingType::Priority)?;
        if let Err(e) = task.join_wait.initialize(
            self,
            lock.borrow_mut(),
            WaitObjectType::Task,
            QueuingType::Priority,
        ) {
            task.sleep_wait.destroy(self, lock.borrow_mut())?;
            return Err(e.into());
        }

        if self.register_task(lock.borrow_mut(), idx).is_err() {
            task.sleep_wait.destroy(self, lock.borrow_mut())?;
            task.join_wait.destroy(self, lock.borrow_mut())?;
            return Err(CreateTaskError::InvalidPriorityLevel);
        }

        let object_id = self.alloc_object_id(lock.borrow_mut());
        task.object_id.replace(&mut *lock, object_id);

        // Safety: CPU Lock active, the task is not running
        unsafe { Traits::init_task(self, task) };

        task_list::push_front(
            &mut TaskList::new(self, lock.borrow_mut(), &self.tasks.global_head, Link::Global),
            idx,
        );
        *self.tasks.count.write(&mut *lock) += 1;

        log::debug!(
            "task {idx} ({:?}) created with priority {} and id {object_id}",
            attr.name,
            attr.priority
        );

        Ok(TaskId { index: idx, object_id })
    }

    /// Block the current task for `ticks` ticks.
    pub fn task_sleep(&'static self, ticks: u32) -> Result<(), SleepError> {
        self.expect_thread_context()?;
        self.syscall(|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let cur = self.running_task_idx(lock.borrow_mut());
            let sleep_wait = &self.task_cb(cur).sleep_wait;

            // Nothing signals `sleep_wait`, so the wait always times out
            match sleep_wait.wait(self, lock.borrow_mut(), ticks) {
                Err(WaitError::Timeout) => Ok(()),
                Ok(()) | Err(WaitError::ObjectDestroyed) => self.fatal(ResultCode::Failure),
            }
        })
    }

    /// Wait until the task `id` exits, and return its exit value. The task
    /// slot is freed on success.
    ///
    /// A task can't join itself (`InvalidArg`). If several tasks join the
    /// same task, only the first one to resume gets the exit value. The
    /// others fail with `InvalidObject`.
    pub fn task_join(&'static self, id: TaskId, timeout: u32) -> Result<usize, JoinError> {
        self.expect_thread_context()?;
        self.syscall(|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let idx = self.resolve_task::<JoinError>(lock.borrow_mut(), id)?;
            if idx == self.running_task_idx(lock.borrow_mut()) {
                return Err(JoinError::InvalidArg);
            }

            let task = self.task_cb(idx);
            if task.st.get(&*lock) != TaskSt::Dead {
                match task.join_wait.wait(self, lock.borrow_mut(), timeout) {
                    Ok(()) => {}
                    Err(WaitError::Timeout) => return Err(JoinError::Timeout),
                    Err(WaitError::ObjectDestroyed) => return Err(JoinError::InvalidObject),
                }
            }

            // Another joiner may have freed the slot while we were blocked
            let idx = self.resolve_task::<JoinError>(lock.borrow_mut(), id)?;
            if task.st.get(&*lock) != TaskSt::Dead {
                return Err(JoinError::InvalidObject);
            }

            let ret = task.ret_value.get(&*lock);
            task_list::remove(
                &mut TaskList::new(self, lock.borrow_mut(), &self.tasks.global_head, Link::Global),
                idx,
            );
            task.st.replace(&mut *lock, TaskSt::Free);

            log::debug!("task {idx} joined with exit value {ret:#x}");
            Ok(ret)
        })
    }

    /// Find a task by its object identifier.
    pub fn task_get(&'static self, object_id: u32) -> Result<TaskId, GetTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let mut cur = self.tasks.global_head.get(&*lock);
        while let Some(idx) = cur {
            let task = self.task_cb(idx);
            if task.object_id.get(&*lock) == object_id {
                return Ok(self.task_id(lock.borrow_mut(), idx));
            }
            cur = task.global_next.get(&*lock);
        }
        Err(GetTaskError::InvalidObject)
    }

    /// Get the current task. Returns `None` before the kernel is started.
    pub fn current_task(&'static self) -> Result<Option<TaskId>, BadContextError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        Ok(self
            .sched
            .current_task
            .get(&*lock)
            .map(|idx| self.task_id(lock.borrow_mut(), idx)))
    }

    /// Get a snapshot of the state of the task `id`.
    pub fn task_info(&'static self, id: TaskId) -> Result<TaskInfo, GetTaskError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        let idx = self.resolve_task::<GetTaskError>(lock.borrow_mut(), id)?;
        let task = self.task_cb(idx);
        Ok(TaskInfo {
            name: task.name.get(&*lock),
            object_id: task.object_id.get(&*lock),
            priority: task.priority.get(&*lock),
            base_priority: task.base_priority.get(&*lock),
            state: task.st.get(&*lock),
            stack_size: task.stack_size.get(&*lock),
            cpu_usage: task.cpu_usage.get(&*lock),
            execution_count: task.execution_count.get(&*lock),
        })
    }

    /// Get the number of tasks that haven't exited, including the kernel's
    /// own tasks.
    pub fn task_count(&'static self) -> Result<u32, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.tasks.count.get(&*lock))
    }

    /// Run the entry function of `task`, then tear it down and dispatch the
    /// next task.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port, on the fresh context prepared by
    /// [`Port::init_task`](crate::Port::init_task), with CPU Lock inactive.
    pub unsafe fn run_task(&'static self, task: &'static TaskCb<Traits>) -> ! {
        let (entry, param) = match klock::lock_cpu::<Traits>() {
            Ok(lock) => (task.entry.get(&*lock), task.param.get(&*lock)),
            Err(_) => self.fatal(ResultCode::BadContext),
        };
        let Some(entry) = entry else {
            self.fatal(ResultCode::Failure);
        };

        let ret = entry(self, param);

        // Safety: CPU Lock inactive. The task is in a task context, where
        //         the kernel controls the CPU Lock state.
        let mut lock = match klock::lock_cpu::<Traits>() {
            Ok(lock) => lock,
            Err(_) => self.fatal(ResultCode::BadContext),
        };

        let idx = self.task_idx(task);
        self.unregister_task(lock.borrow_mut(), idx);
        task.ret_value.replace(&mut *lock, ret);

        task.join_wait.signal(self, lock.borrow_mut(), Ok(()), true);
        for obj in [&task.join_wait, &task.sleep_wait] {
            if let Err(e) = obj.destroy(self, lock.borrow_mut()) {
                self.fatal(e.into());
            }
        }

        task.st.replace(&mut *lock, TaskSt::Dead);
        *self.tasks.count.write(&mut *lock) -= 1;
        self.sched.schedule_needed.replace(&mut *lock, true);

        log::debug!("task {idx} exited with {ret:#x}");

        self.choose_next_running_task(lock.borrow_mut());

        // `exit_and_dispatch` consumes the CPU Lock state
        mem::forget(lock);

        // Safety: CPU Lock active, task context
        unsafe { Traits::exit_and_dispatch(self) }
    }
}
