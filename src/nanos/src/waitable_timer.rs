//! Waitable timers
use core::fmt;

use crate::{
    error::{
        CreateError, DestroyWaitableTimerError, QueryError, StartTimerError, StopTimerError,
        WaitWaitableTimerError,
    },
    klock,
    task::WaitPayload,
    timer::{Timer, TimerCallback},
    utils::Init,
    wait::{QueuingType, WaitObject, WaitObjectType},
    Kernel, KernelCfg,
};

/// A timer that tasks can block on. Every expiration wakes up all waiting
/// tasks.
pub struct WaitableTimer<Traits: KernelCfg> {
    timer: Timer<Traits>,
    wait: WaitObject<Traits>,
}

impl<Traits: KernelCfg> Init for WaitableTimer<Traits> {
    const INIT: Self = Self {
        timer: Init::INIT,
        wait: Init::INIT,
    };
}

impl<Traits: KernelCfg> fmt::Debug for WaitableTimer<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WaitableTimer")
            .field("timer", &self.timer)
            .field("wait", &self.wait)
            .finish()
    }
}

impl<Traits: KernelCfg> WaitableTimer<Traits> {
    pub const fn new() -> Self {
        Self::INIT
    }

    /// Make the timer usable. The timer is created stopped.
    pub fn create(
        &'static self,
        kernel: &'static Kernel<Traits>,
        queuing: QueuingType,
    ) -> Result<(), CreateError> {
        kernel.expect_thread_context()?;
        kernel.syscall(|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.wait
                .initialize(kernel, lock.borrow_mut(), WaitObjectType::Timer, queuing)?;
            if let Err(e) =
                self.timer
                    .init_inner(kernel, lock.borrow_mut(), TimerCallback::Waitable(self), 0)
            {
                self.wait.destroy(kernel, lock.borrow_mut())?;
                return Err(e);
            }
            Ok(())
        })
    }

    /// Make the timer unusable. Fails with `TimerStarted` if it's running.
    pub fn destroy(
        &'static self,
        kernel: &'static Kernel<Traits>,
    ) -> Result<(), DestroyWaitableTimerError> {
        kernel.object_service(&self.wait, WaitObjectType::Timer, || {
            {
                let mut lock = klock::lock_cpu::<Traits>()?;
                if self.timer.is_active(lock.borrow_mut()) {
                    return Err(DestroyWaitableTimerError::TimerStarted);
                }
            }
            self.timer.destroy(kernel)?;

            let mut lock = klock::lock_cpu::<Traits>()?;
            self.wait.destroy(kernel, lock.borrow_mut())?;
            Ok(())
        })
    }

    /// Start the timer. See [`Timer::start`].
    pub fn start(
        &'static self,
        kernel: &'static Kernel<Traits>,
        first_due: u32,
        period: u32,
    ) -> Result<(), StartTimerError> {
        kernel.object_service(&self.wait, WaitObjectType::Timer, || {
            self.timer.start(kernel, first_due, period)
        })
    }

    /// Stop the timer. The waiting tasks are woken up with `TimerStopped`.
    pub fn stop(&'static self, kernel: &'static Kernel<Traits>) -> Result<(), StopTimerError> {
        kernel.object_service(&self.wait, WaitObjectType::Timer, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            if !self.timer.is_active(lock.borrow_mut()) {
                return Err(StopTimerError::TimerStopped);
            }
            self.timer.stop_inner(kernel, lock.borrow_mut());
            self.wait
                .signal_if(kernel, lock.borrow_mut(), Ok(()), true, |mut lock, task| {
                    task.wait_payload.replace(&mut *lock, WaitPayload::TimerStopped);
                    true
                });
            Ok(())
        })
    }

    /// Block until the timer fires. Returns immediately if it has fired
    /// since it was started or since the last wait.
    ///
    /// Fails with `TimerStopped` if the timer isn't running (even if it has
    /// fired before stopping) or is stopped during the wait.
    pub fn wait(
        &'static self,
        kernel: &'static Kernel<Traits>,
        timeout: u32,
    ) -> Result<(), WaitWaitableTimerError> {
        kernel.object_service(&self.wait, WaitObjectType::Timer, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            if !self.timer.is_active(lock.borrow_mut()) {
                return Err(WaitWaitableTimerError::TimerStopped);
            }
            if self.timer.take_elapsed(lock.borrow_mut()) {
                return Ok(());
            }

            let cur = kernel.running_task_idx(lock.borrow_mut());
            let task = kernel.task_cb(cur);
            let status = self.wait.wait(kernel, lock.borrow_mut(), timeout);

            if let WaitPayload::TimerStopped =
                task.wait_payload.replace(&mut *lock, WaitPayload::None)
            {
                return Err(WaitWaitableTimerError::TimerStopped);
            }
            status?;
            self.timer.take_elapsed(lock.borrow_mut());
            Ok(())
        })
    }

    /// Called by the timer task when the timer fires.
    pub(crate) fn on_elapsed(&'static self, kernel: &'static Kernel<Traits>) {
        let result: Result<u32, QueryError> =
            kernel.object_service(&self.wait, WaitObjectType::Timer, || {
                let mut lock = klock::lock_cpu::<Traits>()?;
                Ok(self.wait.signal(kernel, lock.borrow_mut(), Ok(()), true))
            });
        match result {
            Ok(woken) => log::trace!("waitable timer {:p} woke up {woken} task(s)", self),
            Err(e) => log::warn!("waitable timer {:p} fired while unusable: {e:?}", self),
        }
    }

    /// Get a flag indicating whether the timer has fired since it was
    /// started or since the last wait, and clear it.
    pub fn has_elapsed(&'static self, kernel: &'static Kernel<Traits>) -> Result<bool, QueryError> {
        self.timer.has_elapsed(kernel)
    }

    /// Get a flag indicating whether the timer is running.
    pub fn is_running(&'static self) -> Result<bool, QueryError> {
        self.timer.is_running()
    }

    /// Attach a name to the timer, for debugging.
    pub fn set_name(
        &'static self,
        kernel: &'static Kernel<Traits>,
        name: &'static str,
    ) -> Result<(), QueryError> {
        kernel.object_service(&self.wait, WaitObjectType::Timer, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.wait.set_name(lock.borrow_mut(), name);
            Ok(())
        })
    }

    pub fn name(
        &'static self,
        kernel: &'static Kernel<Traits>,
    ) -> Result<Option<&'static str>, QueryError> {
        kernel.object_service(&self.wait, WaitObjectType::Timer, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            Ok(self.wait.name(lock.borrow_mut()))
        })
    }
}
