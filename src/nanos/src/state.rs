//! Service brackets and calling context checks
use core::sync::atomic::Ordering;

use crate::{
    error::{BadContextError, InvalidObjectError},
    klock,
    wait::{WaitObject, WaitObjectType},
    Kernel, KernelCfg, ResultCode,
};

impl<Traits: KernelCfg> Kernel<Traits> {
    /// Get a flag indicating whether the kernel has been started and is
    /// scheduling tasks.
    #[inline]
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Get a flag indicating whether the caller is an interrupt handler.
    #[inline]
    pub fn is_interrupt_context(&self) -> bool {
        self.isr.int_nesting.load(Ordering::Relaxed) != 0
    }

    /// Fail with `BadContext` if called from an interrupt handler.
    pub(crate) fn expect_thread_context(&self) -> Result<(), BadContextError> {
        if self.is_interrupt_context() {
            Err(BadContextError::BadContext)
        } else {
            Ok(())
        }
    }

    /// Fail with `BadContext` unless called from an interrupt handler.
    pub(crate) fn expect_isr_context(&self) -> Result<(), BadContextError> {
        if self.is_interrupt_context() {
            Ok(())
        } else {
            Err(BadContextError::BadContext)
        }
    }

    /// Run `f` as a service call.
    ///
    /// After the kernel is started, scheduling is deferred while `f` runs.
    /// When the outermost service call returns, the scheduler takes over
    /// and switches to another task if needed. `f` must not be holding CPU
    /// Lock when it returns.
    pub(crate) fn syscall<R>(&'static self, f: impl FnOnce() -> R) -> R {
        if !self.is_started() {
            // Boot context; nothing can preempt us
            return f();
        }

        self.isr.lock_count.fetch_add(1, Ordering::Relaxed);
        let ret = f();

        let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
            self.fatal(ResultCode::BadContext);
        };
        let count = self.isr.lock_count.fetch_sub(1, Ordering::Relaxed) - 1;
        if count == 0 && !self.is_interrupt_context() {
            self.schedule(lock.borrow_mut(), false);
        }
        ret
    }

    /// Run `f` as a service call operating on the wait object `obj`, which
    /// must be live and of type `ty`.
    ///
    /// `obj` is marked as ISR-locked while `f` runs. An interrupt handler
    /// taken in the meantime doesn't touch `obj` directly but defers its
    /// request to the ISR request task.
    pub(crate) fn object_service<R, E>(
        &'static self,
        obj: &'static WaitObject<Traits>,
        ty: WaitObjectType,
        f: impl FnOnce() -> Result<R, E>,
    ) -> Result<R, E>
    where
        E: From<BadContextError> + From<InvalidObjectError>,
    {
        self.expect_thread_context()?;

        self.syscall(|| {
            let prev = {
                let mut lock = klock::lock_cpu::<Traits>()?;
                obj.expect_type(lock.borrow_mut(), ty)?;
                self.isr.locked_wait_object.replace(&mut *lock, Some(obj))
            };

            let ret = f();

            if let Ok(mut lock) = klock::lock_cpu::<Traits>() {
                self.isr.locked_wait_object.replace(&mut *lock, prev);
            }
            ret
        })
    }
}
