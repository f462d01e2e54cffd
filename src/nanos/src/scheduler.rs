//! The scheduler
//!
//! Each priority level has a FIFO ready list, and a [`PrioBitfield`] records
//! which of them are non-empty. The running task stays at the head of its
//! ready list while it runs.
//!
//! A context switch is a two-step process. [`Kernel::schedule`] picks the
//! task to run next (`next_running_task`) and asks the port to switch. The
//! port performs the switch when CPU Lock is released (or when the outermost
//! interrupt handler returns) and calls [`Kernel::commit_context_switch`],
//! which updates `current_task`.
use core::sync::atomic::Ordering;

use crate::{
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    task::{TaskCb, TaskSt},
    task_list::{self, Link, TaskIdx, TaskList},
    utils::{Init, PrioBitfield, MAX_PRIORITY_LEVELS},
    Kernel, KernelCfg, ResultCode, WAIT_FOREVER,
};

pub(crate) struct SchedState<Traits: KernelCfg> {
    /// The task whose context is currently loaded.
    pub(crate) current_task: CpuLockCell<Traits, Option<TaskIdx>>,
    /// The task chosen by the last scheduling decision. Differs from
    /// `current_task` while a context switch is pending.
    pub(crate) next_running_task: CpuLockCell<Traits, Option<TaskIdx>>,
    pub(crate) schedule_needed: CpuLockCell<Traits, bool>,
    ready_tasks: [CpuLockCell<Traits, Option<TaskIdx>>; MAX_PRIORITY_LEVELS],
    ready_bitfield: CpuLockCell<Traits, PrioBitfield>,
    /// Tasks blocked with a finite timeout, linked by
    /// [`TaskCb::suspended_next`].
    suspended_tasks: CpuLockCell<Traits, Option<TaskIdx>>,
    pub(crate) context_switch_timestamp: CpuLockCell<Traits, u32>,
}

impl<Traits: KernelCfg> Init for SchedState<Traits> {
    const INIT: Self = Self {
        current_task: Init::INIT,
        next_running_task: Init::INIT,
        schedule_needed: Init::INIT,
        ready_tasks: Init::INIT,
        ready_bitfield: Init::INIT,
        suspended_tasks: Init::INIT,
        context_switch_timestamp: Init::INIT,
    };
}

impl<Traits: KernelCfg> Kernel<Traits> {
    fn ready_list<'a>(
        &'static self,
        lock: CpuLockTokenRefMut<'a, Traits>,
        priority: u8,
    ) -> TaskList<'a, Traits> {
        TaskList::new(
            self,
            lock,
            &self.sched.ready_tasks[priority as usize],
            Link::Next,
        )
    }

    fn suspended_list<'a>(
        &'static self,
        lock: CpuLockTokenRefMut<'a, Traits>,
    ) -> TaskList<'a, Traits> {
        TaskList::new(self, lock, &self.sched.suspended_tasks, Link::Suspended)
    }

    fn add_to_ready_list(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, idx: TaskIdx) {
        let pri = self.task_cb(idx).priority.get(&*lock);
        task_list::add_to_end(&mut self.ready_list(lock.borrow_mut(), pri), idx);
        self.sched.ready_bitfield.write(&mut *lock).set(pri as usize);
    }

    fn remove_from_ready_list(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        idx: TaskIdx,
    ) -> bool {
        let pri = self.task_cb(idx).priority.get(&*lock);
        if !task_list::remove(&mut self.ready_list(lock.borrow_mut(), pri), idx) {
            return false;
        }
        if self.sched.ready_tasks[pri as usize].get(&*lock).is_none() {
            self.sched.ready_bitfield.write(&mut *lock).clear(pri as usize);
        }
        true
    }

    /// Get the first task of the highest non-empty ready list.
    ///
    /// There is always a ready task (the idle task never blocks), so an empty
    /// ready queue is a fatal error.
    fn highest_ready(&'static self, lock: CpuLockTokenRefMut<'_, Traits>) -> TaskIdx {
        let Some(pri) = self.sched.ready_bitfield.read(&*lock).find_highest() else {
            self.fatal(ResultCode::NoTaskReady);
        };
        match self.sched.ready_tasks[pri].get(&*lock) {
            Some(idx) => idx,
            None => self.fatal(ResultCode::NoTaskReady),
        }
    }

    /// Get the current task. The caller must be in a task context.
    pub(crate) fn running_task_idx(&'static self, lock: CpuLockTokenRefMut<'_, Traits>) -> TaskIdx {
        match self.sched.current_task.get(&*lock) {
            Some(idx) => idx,
            None => self.fatal(ResultCode::Failure),
        }
    }

    /// Make a newly created task schedulable.
    ///
    /// Fails if round robin is disabled and another task is already ready at
    /// the task's priority level.
    pub(crate) fn register_task(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        idx: TaskIdx,
    ) -> Result<(), InvalidPriorityLevel> {
        let pri = self.task_cb(idx).priority.get(&*lock);
        if pri >= Traits::NUM_PRIORITY_LEVELS {
            return Err(InvalidPriorityLevel);
        }
        if Traits::ROUND_ROBIN_TIMESLICE == 0
            && self.sched.ready_tasks[pri as usize].get(&*lock).is_some()
        {
            return Err(InvalidPriorityLevel);
        }
        self.set_task_ready(lock.borrow_mut(), idx);
        Ok(())
    }

    /// Remove a task from the ready list or the suspended list.
    pub(crate) fn unregister_task(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        idx: TaskIdx,
    ) {
        if !self.remove_from_ready_list(lock.borrow_mut(), idx) {
            task_list::remove(&mut self.suspended_list(lock.borrow_mut()), idx);
        }
    }

    /// Transition a new or pending task to the Ready state and append it to
    /// its ready list.
    pub(crate) fn set_task_ready(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        idx: TaskIdx,
    ) {
        let task = self.task_cb(idx);
        let st = task.st.get(&*lock);
        debug_assert!(
            matches!(st, TaskSt::Free | TaskSt::Pending),
            "task {idx} is already schedulable ({st:?})"
        );

        if task.wait_timeout.replace(&mut *lock, None).is_some() {
            task_list::remove(&mut self.suspended_list(lock.borrow_mut()), idx);
        }

        self.add_to_ready_list(lock.borrow_mut(), idx);
        task.st.replace(&mut *lock, TaskSt::Ready);
        task.timeslice.replace(&mut *lock, Traits::ROUND_ROBIN_TIMESLICE);
        self.sched.schedule_needed.replace(&mut *lock, true);
    }

    /// Transition the running task to the Pending state. A task blocked with
    /// a finite timeout is put on the suspended list and becomes ready again
    /// after `ticks` ticks unless it's woken up earlier.
    pub(crate) fn set_task_pending(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        idx: TaskIdx,
        ticks: u32,
    ) {
        if !self.remove_from_ready_list(lock.borrow_mut(), idx) {
            self.fatal(ResultCode::Failure);
        }

        let task = self.task_cb(idx);
        task.st.replace(&mut *lock, TaskSt::Pending);

        if ticks == WAIT_FOREVER {
            task.wait_timeout.replace(&mut *lock, None);
        } else {
            let due = self.tick_count.load(Ordering::Relaxed).wrapping_add(ticks);
            task.wait_timeout.replace(&mut *lock, Some(due));
            task_list::push_front(&mut self.suspended_list(lock.borrow_mut()), idx);
        }

        self.sched.schedule_needed.replace(&mut *lock, true);
    }

    /// Per-tick scheduler work: ready the tasks whose timeout expires on
    /// `tick`, and rotate the running task if its time slice is used up.
    ///
    /// `round_robin` is `false` when the work was deferred to the ISR request
    /// task, which is then the running task and has no peers.
    pub(crate) fn handle_suspended_tasks(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        tick: u32,
        round_robin: bool,
    ) {
        let mut cur = self.sched.suspended_tasks.get(&*lock);
        while let Some(idx) = cur {
            let task = self.task_cb(idx);
            cur = task.suspended_next.get(&*lock);

            if task.wait_timeout.get(&*lock) != Some(tick) {
                continue;
            }

            if let Some(obj) = task.wait_target.replace(&mut *lock, None) {
                obj.remove_waiter(self, lock.borrow_mut(), idx);
            }
            task.wait_status.replace(&mut *lock, Err(crate::WaitError::Timeout));
            self.set_task_ready(lock.borrow_mut(), idx);

            log::trace!("task {idx} timed out at tick {tick}");
        }

        if round_robin && Traits::ROUND_ROBIN_TIMESLICE != 0 {
            self.rotate_ready_list(lock, tick);
        }
    }

    fn rotate_ready_list(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, tick: u32) {
        let Some(idx) = self.sched.current_task.get(&*lock) else {
            return;
        };
        let task = self.task_cb(idx);
        let pri = task.priority.get(&*lock);

        // Only a running task at the head of a list with peers has a slice
        if self.sched.ready_tasks[pri as usize].get(&*lock) != Some(idx)
            || task.next.get(&*lock).is_none()
        {
            return;
        }

        let slice = task.timeslice.write(&mut *lock);
        *slice = slice.saturating_sub(1);
        if *slice != 0 {
            return;
        }
        *slice = Traits::ROUND_ROBIN_TIMESLICE;

        let mut list = self.ready_list(lock.borrow_mut(), pri);
        task_list::pop(&mut list);
        task_list::add_to_end(&mut list, idx);
        self.sched.schedule_needed.replace(&mut *lock, true);

        log::trace!("task {idx} used up its time slice at tick {tick}");
    }

    /// Choose the task to run next. Returns `true` if it differs from the
    /// previous choice, in which case a context switch is needed.
    pub(crate) fn choose_next_running_task(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> bool {
        self.sched.schedule_needed.replace(&mut *lock, false);

        let ready = self.highest_ready(lock.borrow_mut());
        let prev = self.sched.next_running_task.get(&*lock);
        if prev == Some(ready) {
            return false;
        }

        if let Some(prev) = prev {
            let prev = self.task_cb(prev);
            if prev.st.get(&*lock) == TaskSt::Running {
                prev.st.replace(&mut *lock, TaskSt::Ready);
            }
        }

        let task = self.task_cb(ready);
        task.st.replace(&mut *lock, TaskSt::Running);
        let count = task.execution_count.write(&mut *lock);
        *count = count.wrapping_add(1);
        self.sched.next_running_task.replace(&mut *lock, Some(ready));

        log::trace!("scheduling task {ready} (previously {prev:?})");
        true
    }

    /// Reconsider the scheduling decision if something has changed, and
    /// request a context switch if another task should be running.
    pub(crate) fn schedule(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        from_isr: bool,
    ) {
        if !*self.sched.schedule_needed.read(&*lock) || !self.is_started() {
            return;
        }

        if self.choose_next_running_task(lock.borrow_mut()) {
            // Safety: CPU Lock active
            unsafe {
                if from_isr {
                    Traits::context_switch_from_isr(self);
                } else {
                    Traits::context_switch(self);
                }
            }
        }
    }

    /// Add the time elapsed since the last context switch to the execution
    /// time of the current task.
    pub(crate) fn account_execution_time(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        now: u32,
    ) {
        let since = self.sched.context_switch_timestamp.replace(&mut *lock, now);
        if let Some(idx) = self.sched.current_task.get(&*lock) {
            let time = self.task_cb(idx).execution_time.write(&mut *lock);
            *time = time.saturating_add(now.wrapping_sub(since));
        }
    }

    /// Make the task chosen by the scheduler the current task, and return
    /// it.
    ///
    /// The port calls this at the point where a requested context switch
    /// actually takes place, right before loading the context of the returned
    /// task.
    ///
    /// # Safety
    ///
    /// CPU Lock must be active. Only meant to be called by the port.
    pub unsafe fn commit_context_switch(&'static self) -> Option<&'static TaskCb<Traits>> {
        // Safety: CPU Lock active, upheld by the caller
        let mut lock = unsafe { klock::assume_cpu_lock::<Traits>() };

        let next = self.sched.next_running_task.get(&*lock);
        let prev = self.sched.current_task.get(&*lock);

        if prev != next {
            self.account_execution_time(lock.borrow_mut(), Traits::timestamp_us());

            if let Some(prev) = prev {
                let prev = self.task_cb(prev);
                if prev.st.get(&*lock) != TaskSt::Dead {
                    if let Err(e) = Traits::check_task_stack(prev) {
                        self.fatal(e.into());
                    }
                }
            }

            self.sched.current_task.replace(&mut *lock, next);
            log::trace!("context switch {prev:?} -> {next:?}");
        }

        // Post-condition: CPU Lock active
        core::mem::forget(lock);

        next.map(|idx| self.task_cb(idx))
    }
}

/// The priority is out of range or the level is already occupied.
pub(crate) struct InvalidPriorityLevel;
