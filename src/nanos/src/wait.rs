//! Wait objects
//!
//! A wait object is the blocking point embedded in every synchronization
//! object. It owns a queue of the tasks blocked on it, ordered by the
//! object's [`QueuingType`].
use core::{fmt, ptr, sync::atomic::Ordering};

use crate::{
    error::{BadContextError, InvalidObjectError, WaitError},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    task::{TaskCb, TaskSt},
    task_list::{self, Link, TaskIdx, TaskList},
    utils::Init,
    Kernel, KernelCfg, ResultCode,
};

/// The order in which the tasks blocked on an object are woken up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueuingType {
    /// In arrival order.
    Fifo,
    /// By descending task priority, then in arrival order.
    Priority,
}

impl Init for QueuingType {
    const INIT: Self = Self::Fifo;
}

/// The kind of object embedding a [`WaitObject`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum WaitObjectType {
    /// Never created, or destroyed.
    NotInit,
    /// Internal per-task or per-kernel object.
    Task,
    Semaphore,
    Mutex,
    CondVar,
    Timer,
    Mailbox,
    FlagSet,
}

impl Init for WaitObjectType {
    const INIT: Self = Self::NotInit;
}

pub(crate) struct WaitObject<Traits: KernelCfg> {
    ty: CpuLockCell<Traits, WaitObjectType>,
    queuing: CpuLockCell<Traits, QueuingType>,
    /// The head of the queue of blocked tasks, linked by
    /// [`TaskCb::next`].
    waiting_tasks: CpuLockCell<Traits, Option<TaskIdx>>,
    name: CpuLockCell<Traits, Option<&'static str>>,
    object_id: CpuLockCell<Traits, u32>,
    /// The next object in [`WaitObjectRegistry`].
    next: CpuLockCell<Traits, Option<&'static WaitObject<Traits>>>,
}

impl<Traits: KernelCfg> Init for WaitObject<Traits> {
    const INIT: Self = Self {
        ty: Init::INIT,
        queuing: Init::INIT,
        waiting_tasks: Init::INIT,
        name: Init::INIT,
        object_id: Init::INIT,
        next: Init::INIT,
    };
}

impl<Traits: KernelCfg> fmt::Debug for WaitObject<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaitObject")
            .field("self", &(self as *const _))
            .field("ty", &self.ty)
            .field("name", &self.name)
            .field("waiting_tasks", &self.waiting_tasks)
            .finish()
    }
}

/// The list of every live wait object, for introspection.
pub(crate) struct WaitObjectRegistry<Traits: KernelCfg> {
    head: CpuLockCell<Traits, Option<&'static WaitObject<Traits>>>,
    count: CpuLockCell<Traits, u32>,
    next_object_id: CpuLockCell<Traits, u32>,
}

impl<Traits: KernelCfg> Init for WaitObjectRegistry<Traits> {
    const INIT: Self = Self {
        head: Init::INIT,
        count: Init::INIT,
        next_object_id: Init::INIT,
    };
}

impl<Traits: KernelCfg> Kernel<Traits> {
    /// Allocate an identifier for a new task, wait object, or timer.
    pub(crate) fn alloc_object_id(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> u32 {
        let id = self.wait_objects.next_object_id.write(&mut *lock);
        let out = *id;
        *id = id.wrapping_add(1);
        out
    }

    /// Get the number of live wait objects, including the ones owned by the
    /// kernel and its tasks.
    pub fn wait_object_count(&'static self) -> Result<u32, BadContextError> {
        let lock = klock::lock_cpu::<Traits>()?;
        Ok(self.wait_objects.count.get(&*lock))
    }
}

impl<Traits: KernelCfg> WaitObject<Traits> {
    pub(crate) const fn new() -> Self {
        Self::INIT
    }

    /// Make the object live and register it.
    ///
    /// Fails with `InvalidObject` if it's already live.
    pub(crate) fn initialize(
        &'static self,
        kernel: &'static Kernel<Traits>,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        ty: WaitObjectType,
        queuing: QueuingType,
    ) -> Result<(), InvalidObjectError> {
        debug_assert_ne!(ty, WaitObjectType::NotInit);
        if self.ty.get(&*lock) != WaitObjectType::NotInit {
            return Err(InvalidObjectError::InvalidObject);
        }

        self.ty.replace(&mut *lock, ty);
        self.queuing.replace(&mut *lock, queuing);
        self.waiting_tasks.replace(&mut *lock, None);
        self.name.replace(&mut *lock, None);
        let id = kernel.alloc_object_id(lock.borrow_mut());
        self.object_id.replace(&mut *lock, id);

        let head = kernel.wait_objects.head.replace(&mut *lock, Some(self));
        self.next.replace(&mut *lock, head);
        *kernel.wait_objects.count.write(&mut *lock) += 1;

        log::trace!("wait object {:p} ({ty:?}) created with id {id}", self);
        Ok(())
    }

    /// Check that the object is live and of type `ty`.
    pub(crate) fn expect_type(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
        ty: WaitObjectType,
    ) -> Result<(), InvalidObjectError> {
        if self.ty.get(&*lock) == ty {
            Ok(())
        } else {
            Err(InvalidObjectError::InvalidObject)
        }
    }

    pub(crate) fn is_live(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.ty.get(&*lock) != WaitObjectType::NotInit
    }

    pub(crate) fn set_name(&self, mut lock: CpuLockTokenRefMut<'_, Traits>, name: &'static str) {
        self.name.replace(&mut *lock, Some(name));
    }

    pub(crate) fn name(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> Option<&'static str> {
        self.name.get(&*lock)
    }

    pub(crate) fn object_id(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> u32 {
        self.object_id.get(&*lock)
    }

    /// Get a flag indicating whether any task is blocked on the object.
    pub(crate) fn has_waiters(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.waiting_tasks.get(&*lock).is_some()
    }

    fn waiting_list<'a>(
        &'a self,
        kernel: &'static Kernel<Traits>,
        lock: CpuLockTokenRefMut<'a, Traits>,
    ) -> TaskList<'a, Traits> {
        TaskList::new(kernel, lock, &self.waiting_tasks, Link::Next)
    }

    /// Block the current task on this object until it's signaled, the
    /// timeout expires, or the object is destroyed.
    ///
    /// The caller must be in a task context, inside a service bracket, and
    /// must hold CPU Lock. Calling this before the kernel is started is a
    /// fatal error. CPU Lock is released while the task is blocked,
    /// and so is the ISR lock.
    pub(crate) fn wait(
        &'static self,
        kernel: &'static Kernel<Traits>,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        timeout: u32,
    ) -> Result<(), WaitError> {
        if !kernel.is_started() {
            kernel.fatal(ResultCode::OsNotStarted);
        }
        if timeout == 0 {
            return Err(WaitError::Timeout);
        }

        let cur = kernel.running_task_idx(lock.borrow_mut());
        let task = kernel.task_cb(cur);
        task.wait_target.replace(&mut *lock, Some(self));
        task.wait_status.replace(&mut *lock, Ok(()));

        kernel.set_task_pending(lock.borrow_mut(), cur, timeout);

        {
            let queuing = self.queuing.get(&*lock);
            let mut list = self.waiting_list(kernel, lock.borrow_mut());
            match queuing {
                QueuingType::Fifo => task_list::add_to_end(&mut list, cur),
                QueuingType::Priority => task_list::add_high_priority(&mut list, cur),
            }
        }

        log::trace!("task {cur} waits on {:p} (timeout = {timeout})", self);

        // Leave the service bracket while blocked so that interrupt handlers
        // may operate on this object again
        let isr_locked = kernel.isr.locked_wait_object.replace(&mut *lock, None);
        kernel.isr.lock_count.fetch_sub(1, Ordering::Relaxed);
        kernel.schedule(lock.borrow_mut(), false);

        while task.st.get(&*lock) != TaskSt::Running {
            // Safety: (1) We don't access resources protected by CPU Lock.
            //         (2) We currently have CPU Lock.
            //         (3) We re-acquire CPU Lock before returning from this
            //             function.
            unsafe { Traits::leave_cpu_lock() };
            unsafe { Traits::enter_cpu_lock() };
        }

        kernel.isr.lock_count.fetch_add(1, Ordering::Relaxed);
        kernel.isr.locked_wait_object.replace(&mut *lock, isr_locked);

        task.wait_status.get(&*lock)
    }

    /// Wake up the first waiting task.
    pub(crate) fn signal(
        &'static self,
        kernel: &'static Kernel<Traits>,
        lock: CpuLockTokenRefMut<'_, Traits>,
        status: Result<(), WaitError>,
        signal_all: bool,
    ) -> u32 {
        self.signal_if(kernel, lock, status, signal_all, |_, _| true)
    }

    /// Walk the waiting tasks in queue order and wake up each task for which
    /// `wakeup_cond` returns `true`, completing its wait with `status`. Stops
    /// after the first woken task unless `signal_all` is set. Tasks rejected
    /// by `wakeup_cond` keep their relative order in the queue.
    ///
    /// `wakeup_cond` is where an object applies its side effects on the woken
    /// task, e.g., transferring the ownership of a mutex.
    ///
    /// Returns the number of woken tasks.
    pub(crate) fn signal_if(
        &'static self,
        kernel: &'static Kernel<Traits>,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        status: Result<(), WaitError>,
        signal_all: bool,
        mut wakeup_cond: impl FnMut(
            CpuLockTokenRefMut<'_, Traits>,
            &'static TaskCb<Traits>,
        ) -> bool,
    ) -> u32 {
        let mut woken = 0;
        let mut prev: Option<TaskIdx> = None;
        let mut cur = self.waiting_tasks.get(&*lock);

        while let Some(idx) = cur {
            let task = kernel.task_cb(idx);
            let next = task.next.get(&*lock);

            if !wakeup_cond(lock.borrow_mut(), task) {
                prev = Some(idx);
                cur = next;
                continue;
            }

            // Unlink `task`
            match prev {
                Some(prev) => {
                    kernel.task_cb(prev).next.replace(&mut *lock, next);
                }
                None => {
                    self.waiting_tasks.replace(&mut *lock, next);
                }
            }
            task.next.replace(&mut *lock, None);

            task.wait_target.replace(&mut *lock, None);
            task.wait_status.replace(&mut *lock, status);
            kernel.set_task_ready(lock.borrow_mut(), idx);
            woken += 1;

            log::trace!("task {idx} woken up by {:p} with {status:?}", self);

            if !signal_all {
                break;
            }
            cur = next;
        }

        woken
    }

    /// Remove `task` from the queue without waking it up.
    pub(crate) fn remove_waiter(
        &'static self,
        kernel: &'static Kernel<Traits>,
        lock: CpuLockTokenRefMut<'_, Traits>,
        task: TaskIdx,
    ) -> bool {
        task_list::remove(&mut self.waiting_list(kernel, lock), task)
    }

    /// Wake up every waiting task with `ObjectDestroyed`, unregister the
    /// object, and return it to the never-created state.
    pub(crate) fn destroy(
        &'static self,
        kernel: &'static Kernel<Traits>,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Result<(), InvalidObjectError> {
        if !self.is_live(lock.borrow_mut()) {
            return Err(InvalidObjectError::InvalidObject);
        }

        self.signal(kernel, lock.borrow_mut(), Err(WaitError::ObjectDestroyed), true);

        // Unlink `self` from the registry
        let mut prev: Option<&'static WaitObject<Traits>> = None;
        let mut cur = kernel.wait_objects.head.get(&*lock);
        while let Some(obj) = cur {
            if ptr::eq(obj, self) {
                break;
            }
            prev = Some(obj);
            cur = obj.next.get(&*lock);
        }
        if cur.is_none() {
            // A live object is always registered
            kernel.fatal(ResultCode::InvalidObject);
        }
        let next = self.next.get(&*lock);
        match prev {
            Some(prev) => {
                prev.next.replace(&mut *lock, next);
            }
            None => {
                kernel.wait_objects.head.replace(&mut *lock, next);
            }
        }
        *kernel.wait_objects.count.write(&mut *lock) -= 1;

        log::trace!("wait object {:p} destroyed", self);

        self.ty.replace(&mut *lock, WaitObjectType::NotInit);
        self.queuing.replace(&mut *lock, QueuingType::Fifo);
        self.name.replace(&mut *lock, None);
        self.object_id.replace(&mut *lock, 0);
        self.next.replace(&mut *lock, None);
        Ok(())
    }
}
