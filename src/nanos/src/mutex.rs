//! Recursive mutexes
use core::fmt;

use crate::{
    error::{
        CondVarWaitError, CreateError, DestroyError, QueryError, TryLockMutexError,
        UnlockMutexError, WaitError, WaitObjectError,
    },
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    task_list::TaskIdx,
    utils::Init,
    wait::{QueuingType, WaitObject, WaitObjectType},
    Kernel, KernelCfg,
};

/// A recursive mutex. The owner may lock it again, and must unlock it as
/// many times as it locked it.
///
/// There's no priority inheritance.
pub struct Mutex<Traits: KernelCfg> {
    pub(crate) wait: WaitObject<Traits>,
    owner: CpuLockCell<Traits, Option<TaskIdx>>,
    /// The recursion depth of the owner.
    lock_count: CpuLockCell<Traits, u32>,
}

impl<Traits: KernelCfg> Init for Mutex<Traits> {
    const INIT: Self = Self {
        wait: Init::INIT,
        owner: Init::INIT,
        lock_count: Init::INIT,
    };
}

impl<Traits: KernelCfg> fmt::Debug for Mutex<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("self", &(self as *const _))
            .field("owner", &self.owner)
            .field("lock_count", &self.lock_count)
            .field("wait", &self.wait)
            .finish()
    }
}

impl<Traits: KernelCfg> Mutex<Traits> {
    pub const fn new() -> Self {
        Self::INIT
    }

    /// Make the mutex usable. It's created unlocked.
    pub fn create(
        &'static self,
        kernel: &'static Kernel<Traits>,
        queuing: QueuingType,
    ) -> Result<(), CreateError> {
        kernel.expect_thread_context()?;
        kernel.syscall(|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.wait
                .initialize(kernel, lock.borrow_mut(), WaitObjectType::Mutex, queuing)?;
            self.owner.replace(&mut *lock, None);
            self.lock_count.replace(&mut *lock, 0);
            Ok(())
        })
    }

    /// Make the mutex unusable. The waiting tasks are woken up with
    /// `ObjectDestroyed`.
    pub fn destroy(&'static self, kernel: &'static Kernel<Traits>) -> Result<(), DestroyError> {
        kernel.object_service(&self.wait, WaitObjectType::Mutex, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.wait.destroy(kernel, lock.borrow_mut())?;
            self.owner.replace(&mut *lock, None);
            self.lock_count.replace(&mut *lock, 0);
            Ok(())
        })
    }

    /// Lock the mutex, blocking for up to `timeout` ticks if another task
    /// owns it.
    pub fn lock(
        &'static self,
        kernel: &'static Kernel<Traits>,
        timeout: u32,
    ) -> Result<(), WaitObjectError> {
        kernel.object_service(&self.wait, WaitObjectType::Mutex, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.lock_inner(kernel, lock.borrow_mut(), timeout)?;
            Ok(())
        })
    }

    pub(crate) fn lock_inner(
        &'static self,
        kernel: &'static Kernel<Traits>,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        timeout: u32,
    ) -> Result<(), WaitError> {
        let cur = kernel.running_task_idx(lock.borrow_mut());
        match self.owner.get(&*lock) {
            None => {
                self.owner.replace(&mut *lock, Some(cur));
                self.lock_count.replace(&mut *lock, 1);
                Ok(())
            }
            Some(owner) if owner == cur => {
                *self.lock_count.write(&mut *lock) += 1;
                Ok(())
            }
            // On wake-up, `unlock_inner` has made us the owner
            Some(_) => self.wait.wait(kernel, lock, timeout),
        }
    }

    /// Lock the mutex if it's free or already owned by the current task.
    /// Fails with `MutexLocked` otherwise.
    pub fn try_lock(
        &'static self,
        kernel: &'static Kernel<Traits>,
    ) -> Result<(), TryLockMutexError> {
        kernel.object_service(&self.wait, WaitObjectType::Mutex, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let cur = kernel.running_task_idx(lock.borrow_mut());
            match self.owner.get(&*lock) {
                None => {
                    self.owner.replace(&mut *lock, Some(cur));
                    self.lock_count.replace(&mut *lock, 1);
                    Ok(())
                }
                Some(owner) if owner == cur => {
                    *self.lock_count.write(&mut *lock) += 1;
                    Ok(())
                }
                Some(_) => Err(TryLockMutexError::MutexLocked),
            }
        })
    }

    /// Undo one level of locking. The mutex is released when the count
    /// drops to zero, and ownership passes to the first waiting task.
    ///
    /// Fails with `MutexNotOwned` if the current task isn't the owner.
    pub fn unlock(
        &'static self,
        kernel: &'static Kernel<Traits>,
    ) -> Result<(), UnlockMutexError> {
        kernel.object_service(&self.wait, WaitObjectType::Mutex, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.unlock_inner(kernel, lock.borrow_mut())
        })
    }

    pub(crate) fn unlock_inner(
        &'static self,
        kernel: &'static Kernel<Traits>,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Result<(), UnlockMutexError> {
        let cur = kernel.running_task_idx(lock.borrow_mut());
        if self.owner.get(&*lock) != Some(cur) {
            return Err(UnlockMutexError::MutexNotOwned);
        }

        let count = self.lock_count.write(&mut *lock);
        *count -= 1;
        if *count > 0 {
            return Ok(());
        }

        self.owner.replace(&mut *lock, None);
        self.wait
            .signal_if(kernel, lock, Ok(()), false, |mut lock, task| {
                self.owner.replace(&mut *lock, Some(kernel.task_idx(task)));
                self.lock_count.replace(&mut *lock, 1);
                true
            });
        Ok(())
    }

    /// Check that the current task owns the mutex exactly once.
    pub(crate) fn expect_single_lock(
        &self,
        kernel: &'static Kernel<Traits>,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Result<(), CondVarWaitError> {
        self.wait.expect_type(lock.borrow_mut(), WaitObjectType::Mutex)?;
        let cur = kernel.running_task_idx(lock.borrow_mut());
        if self.owner.get(&*lock) != Some(cur) {
            return Err(CondVarWaitError::MutexNotOwned);
        }
        if self.lock_count.get(&*lock) != 1 {
            return Err(CondVarWaitError::MutexLockCount);
        }
        Ok(())
    }

    /// Get a flag indicating whether any task owns the mutex.
    pub fn is_locked(&'static self, kernel: &'static Kernel<Traits>) -> Result<bool, QueryError> {
        kernel.object_service(&self.wait, WaitObjectType::Mutex, || {
            let lock = klock::lock_cpu::<Traits>()?;
            Ok(self.owner.get(&*lock).is_some())
        })
    }

    /// Attach a name to the mutex, for debugging.
    pub fn set_name(
        &'static self,
        kernel: &'static Kernel<Traits>,
        name: &'static str,
    ) -> Result<(), QueryError> {
        kernel.object_service(&self.wait, WaitObjectType::Mutex, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.wait.set_name(lock.borrow_mut(), name);
            Ok(())
        })
    }

    pub fn name(
        &'static self,
        kernel: &'static Kernel<Traits>,
    ) -> Result<Option<&'static str>, QueryError> {
        kernel.object_service(&self.wait, WaitObjectType::Mutex, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            Ok(self.wait.name(lock.borrow_mut()))
        })
    }
}
