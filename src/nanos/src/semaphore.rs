//! Counting semaphores
use core::fmt;

use crate::{
    error::{
        CreateError, DestroyError, PostSemaphoreError, PostSemaphoreFromIsrError, QueryError,
        WaitObjectError,
    },
    interrupt::IsrRequest,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    utils::Init,
    wait::{QueuingType, WaitObject, WaitObjectType},
    Kernel, KernelCfg,
};

/// A counting semaphore bounded by a maximum count.
pub struct Semaphore<Traits: KernelCfg> {
    wait: WaitObject<Traits>,
    count: CpuLockCell<Traits, u32>,
    max_count: CpuLockCell<Traits, u32>,
}

impl<Traits: KernelCfg> Init for Semaphore<Traits> {
    const INIT: Self = Self {
        wait: Init::INIT,
        count: Init::INIT,
        max_count: Init::INIT,
    };
}

impl<Traits: KernelCfg> fmt::Debug for Semaphore<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Semaphore")
            .field("self", &(self as *const _))
            .field("count", &self.count)
            .field("max_count", &self.max_count)
            .field("wait", &self.wait)
            .finish()
    }
}

impl<Traits: KernelCfg> Semaphore<Traits> {
    pub const fn new() -> Self {
        Self::INIT
    }

    /// Make the semaphore usable with `initial_count` units out of
    /// `max_count`.
    pub fn create(
        &'static self,
        kernel: &'static Kernel<Traits>,
        initial_count: u32,
        max_count: u32,
        queuing: QueuingType,
    ) -> Result<(), CreateError> {
        if max_count == 0 || initial_count > max_count {
            return Err(CreateError::InvalidArg);
        }
        kernel.expect_thread_context()?;
        kernel.syscall(|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.wait
                .initialize(kernel, lock.borrow_mut(), WaitObjectType::Semaphore, queuing)?;
            self.count.replace(&mut *lock, initial_count);
            self.max_count.replace(&mut *lock, max_count);
            Ok(())
        })
    }

    /// Make the semaphore unusable. The waiting tasks are woken up with
    /// `ObjectDestroyed`.
    pub fn destroy(&'static self, kernel: &'static Kernel<Traits>) -> Result<(), DestroyError> {
        kernel.object_service(&self.wait, WaitObjectType::Semaphore, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.wait.destroy(kernel, lock.borrow_mut())?;
            Ok(())
        })
    }

    /// Take one unit, blocking for up to `timeout` ticks if there are none.
    pub fn wait(
        &'static self,
        kernel: &'static Kernel<Traits>,
        timeout: u32,
    ) -> Result<(), WaitObjectError> {
        kernel.object_service(&self.wait, WaitObjectType::Semaphore, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let count = self.count.write(&mut *lock);
            if *count > 0 {
                *count -= 1;
                return Ok(());
            }

            // `post` hands the unit directly to us
            self.wait.wait(kernel, lock.borrow_mut(), timeout)?;
            Ok(())
        })
    }

    /// Release one unit. A waiting task receives it directly.
    ///
    /// Fails with `SemaphoreFull` if the count is already at its maximum.
    pub fn post(&'static self, kernel: &'static Kernel<Traits>) -> Result<(), PostSemaphoreError> {
        kernel.object_service(&self.wait, WaitObjectType::Semaphore, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.post_inner(kernel, lock.borrow_mut())
        })
    }

    /// [`Self::post`] for interrupt handlers.
    pub fn post_from_isr(
        &'static self,
        kernel: &'static Kernel<Traits>,
    ) -> Result<(), PostSemaphoreFromIsrError> {
        kernel.isr_service(
            &self.wait,
            WaitObjectType::Semaphore,
            IsrRequest::SemaphorePost(self),
            |lock| Ok(self.post_inner(kernel, lock)?),
        )
    }

    fn post_inner(
        &'static self,
        kernel: &'static Kernel<Traits>,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Result<(), PostSemaphoreError> {
        if self.count.get(&*lock) >= self.max_count.get(&*lock) {
            return Err(PostSemaphoreError::SemaphoreFull);
        }
        if self.wait.signal(kernel, lock.borrow_mut(), Ok(()), false) == 0 {
            *self.count.write(&mut *lock) += 1;
        }
        Ok(())
    }

    /// Get the number of available units.
    pub fn get_count(&'static self, kernel: &'static Kernel<Traits>) -> Result<u32, QueryError> {
        kernel.object_service(&self.wait, WaitObjectType::Semaphore, || {
            let lock = klock::lock_cpu::<Traits>()?;
            Ok(self.count.get(&*lock))
        })
    }

    /// Attach a name to the semaphore, for debugging.
    pub fn set_name(
        &'static self,
        kernel: &'static Kernel<Traits>,
        name: &'static str,
    ) -> Result<(), QueryError> {
        kernel.object_service(&self.wait, WaitObjectType::Semaphore, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.wait.set_name(lock.borrow_mut(), name);
            Ok(())
        })
    }

    pub fn name(
        &'static self,
        kernel: &'static Kernel<Traits>,
    ) -> Result<Option<&'static str>, QueryError> {
        kernel.object_service(&self.wait, WaitObjectType::Semaphore, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            Ok(self.wait.name(lock.borrow_mut()))
        })
    }
}
