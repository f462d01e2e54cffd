//! Condition variables
use core::fmt;

use crate::{
    error::{
        CondVarWaitError, CreateError, DestroyError, QueryError, SignalError, SignalFromIsrError,
    },
    interrupt::IsrRequest,
    klock::{self, CpuLockTokenRefMut},
    utils::Init,
    wait::{QueuingType, WaitObject, WaitObjectType},
    Kernel, KernelCfg, Mutex, WAIT_FOREVER,
};

/// A condition variable, used together with a [`Mutex`].
pub struct CondVar<Traits: KernelCfg> {
    wait: WaitObject<Traits>,
}

impl<Traits: KernelCfg> Init for CondVar<Traits> {
    const INIT: Self = Self { wait: Init::INIT };
}

impl<Traits: KernelCfg> fmt::Debug for CondVar<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CondVar")
            .field("self", &(self as *const _))
            .field("wait", &self.wait)
            .finish()
    }
}

impl<Traits: KernelCfg> CondVar<Traits> {
    pub const fn new() -> Self {
        Self::INIT
    }

    pub fn create(
        &'static self,
        kernel: &'static Kernel<Traits>,
        queuing: QueuingType,
    ) -> Result<(), CreateError> {
        kernel.expect_thread_context()?;
        kernel.syscall(|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.wait
                .initialize(kernel, lock.borrow_mut(), WaitObjectType::CondVar, queuing)?;
            Ok(())
        })
    }

    /// Make the condition variable unusable. The waiting tasks are woken up
    /// with `ObjectDestroyed` and don't reacquire their mutexes.
    pub fn destroy(&'static self, kernel: &'static Kernel<Traits>) -> Result<(), DestroyError> {
        kernel.object_service(&self.wait, WaitObjectType::CondVar, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.wait.destroy(kernel, lock.borrow_mut())?;
            Ok(())
        })
    }

    /// Atomically release `mutex` and block until the condition variable is
    /// signaled, then reacquire `mutex`.
    ///
    /// The current task must own `mutex` exactly once. `timeout` bounds the
    /// whole operation, including reacquiring `mutex`. If the wait itself
    /// fails, `mutex` is left unlocked.
    pub fn wait(
        &'static self,
        kernel: &'static Kernel<Traits>,
        mutex: &'static Mutex<Traits>,
        timeout: u32,
    ) -> Result<(), CondVarWaitError> {
        kernel.object_service(&self.wait, WaitObjectType::CondVar, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            mutex.expect_single_lock(kernel, lock.borrow_mut())?;

            let start = kernel.tick_count();
            mutex.unlock_inner(kernel, lock.borrow_mut())?;
            self.wait.wait(kernel, lock.borrow_mut(), timeout)?;

            // The mutex may have been destroyed in the meantime
            mutex.wait.expect_type(lock.borrow_mut(), WaitObjectType::Mutex)?;

            let remaining = if timeout == WAIT_FOREVER {
                WAIT_FOREVER
            } else {
                timeout.saturating_sub(kernel.tick_count().wrapping_sub(start))
            };
            mutex.lock_inner(kernel, lock.borrow_mut(), remaining)?;
            Ok(())
        })
    }

    /// Wake up the first waiting task, or all of them if `broadcast` is set.
    pub fn signal(
        &'static self,
        kernel: &'static Kernel<Traits>,
        broadcast: bool,
    ) -> Result<(), SignalError> {
        kernel.object_service(&self.wait, WaitObjectType::CondVar, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.signal_inner(kernel, lock.borrow_mut(), broadcast);
            Ok(())
        })
    }

    /// [`Self::signal`] for interrupt handlers.
    pub fn signal_from_isr(
        &'static self,
        kernel: &'static Kernel<Traits>,
        broadcast: bool,
    ) -> Result<(), SignalFromIsrError> {
        kernel.isr_service(
            &self.wait,
            WaitObjectType::CondVar,
            IsrRequest::CondVarSignal(self, broadcast),
            |lock| {
                self.signal_inner(kernel, lock, broadcast);
                Ok(())
            },
        )
    }

    fn signal_inner(
        &'static self,
        kernel: &'static Kernel<Traits>,
        lock: CpuLockTokenRefMut<'_, Traits>,
        broadcast: bool,
    ) {
        let woken = self.wait.signal(kernel, lock, Ok(()), broadcast);
        log::trace!("condition variable {:p} signaled, {woken} task(s) woken", self);
    }

    /// Attach a name to the condition variable, for debugging.
    pub fn set_name(
        &'static self,
        kernel: &'static Kernel<Traits>,
        name: &'static str,
    ) -> Result<(), QueryError> {
        kernel.object_service(&self.wait, WaitObjectType::CondVar, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.wait.set_name(lock.borrow_mut(), name);
            Ok(())
        })
    }

    pub fn name(
        &'static self,
        kernel: &'static Kernel<Traits>,
    ) -> Result<Option<&'static str>, QueryError> {
        kernel.object_service(&self.wait, WaitObjectType::CondVar, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            Ok(self.wait.name(lock.borrow_mut()))
        })
    }
}
