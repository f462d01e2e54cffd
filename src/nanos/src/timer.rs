//! Software timers
//!
//! Started timers are kept in a list sorted by due tick. The tick handler
//! wakes up the timer task when the first timer is due, and the timer task
//! calls the callbacks of every timer due on that tick with CPU Lock
//! inactive.
use core::{fmt, ptr};

use crate::{
    error::{
        CreateError, DestroyError, InvalidObjectError, QueryError, StartTimerError, StopTimerError,
    },
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    utils::Init,
    wait::WaitObject,
    Kernel, KernelCfg, ResultCode, WaitableTimer, WAIT_FOREVER,
};

/// A timer callback. Receives the user data word given to
/// [`Timer::create`].
pub type TimerFn<Traits> = fn(&'static Kernel<Traits>, &'static Timer<Traits>, usize);

pub(crate) enum TimerCallback<Traits: KernelCfg> {
    User(TimerFn<Traits>),
    Waitable(&'static WaitableTimer<Traits>),
}

impl<Traits: KernelCfg> Clone for TimerCallback<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelCfg> Copy for TimerCallback<Traits> {}

/// A one-shot or periodic software timer.
pub struct Timer<Traits: KernelCfg> {
    created: CpuLockCell<Traits, bool>,
    object_id: CpuLockCell<Traits, u32>,
    callback: CpuLockCell<Traits, Option<TimerCallback<Traits>>>,
    user_data: CpuLockCell<Traits, usize>,
    /// `0` means one-shot.
    period: CpuLockCell<Traits, u32>,
    due: CpuLockCell<Traits, u32>,
    has_elapsed: CpuLockCell<Traits, bool>,
    /// Started and not stopped yet. Stays set while the callback of a
    /// periodic timer runs.
    active: CpuLockCell<Traits, bool>,
    /// Linked into the started timer list.
    queued: CpuLockCell<Traits, bool>,
    next: CpuLockCell<Traits, Option<&'static Timer<Traits>>>,
}

impl<Traits: KernelCfg> Init for Timer<Traits> {
    const INIT: Self = Self {
        created: Init::INIT,
        object_id: Init::INIT,
        callback: Init::INIT,
        user_data: Init::INIT,
        period: Init::INIT,
        due: Init::INIT,
        has_elapsed: Init::INIT,
        active: Init::INIT,
        queued: Init::INIT,
        next: Init::INIT,
    };
}

impl<Traits: KernelCfg> fmt::Debug for Timer<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Timer")
            .field("self", &(self as *const _))
            .field("active", &self.active)
            .field("due", &self.due)
            .field("period", &self.period)
            .finish_non_exhaustive()
    }
}

pub(crate) struct TimerState<Traits: KernelCfg> {
    /// Started timers sorted by due tick, nearest first.
    started: CpuLockCell<Traits, Option<&'static Timer<Traits>>>,
    /// The timer task blocks on this.
    pub(crate) wait: WaitObject<Traits>,
}

impl<Traits: KernelCfg> Init for TimerState<Traits> {
    const INIT: Self = Self {
        started: Init::INIT,
        wait: Init::INIT,
    };
}

/// Get a flag indicating whether `due2` comes strictly later than `due1`
/// when counted from `now`. Tick values wrap around, so they are compared
/// by their distance from `now`.
#[inline]
fn is_later(now: u32, due1: u32, due2: u32) -> bool {
    due2.wrapping_sub(now) > due1.wrapping_sub(now)
}

impl<Traits: KernelCfg> Timer<Traits> {
    pub const fn new() -> Self {
        Self::INIT
    }

    /// Make the timer usable. The timer is created stopped.
    pub fn create(
        &'static self,
        kernel: &'static Kernel<Traits>,
        callback: TimerFn<Traits>,
        user_data: usize,
    ) -> Result<(), CreateError> {
        kernel.expect_thread_context()?;
        kernel.syscall(|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.init_inner(kernel, lock.borrow_mut(), TimerCallback::User(callback), user_data)
        })
    }

    pub(crate) fn init_inner(
        &'static self,
        kernel: &'static Kernel<Traits>,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        callback: TimerCallback<Traits>,
        user_data: usize,
    ) -> Result<(), CreateError> {
        if self.created.get(&*lock) {
            return Err(CreateError::InvalidObject);
        }
        self.created.replace(&mut *lock, true);
        self.callback.replace(&mut *lock, Some(callback));
        self.user_data.replace(&mut *lock, user_data);
        self.period.replace(&mut *lock, 0);
        self.has_elapsed.replace(&mut *lock, false);
        self.active.replace(&mut *lock, false);
        let id = kernel.alloc_object_id(lock.borrow_mut());
        self.object_id.replace(&mut *lock, id);
        log::trace!("timer {:p} created with id {id}", self);
        Ok(())
    }

    fn expect_created(
        &self,
        lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Result<(), InvalidObjectError> {
        if self.created.get(&*lock) {
            Ok(())
        } else {
            Err(InvalidObjectError::InvalidObject)
        }
    }

    /// Stop the timer if it's running and make it unusable.
    pub fn destroy(&'static self, kernel: &'static Kernel<Traits>) -> Result<(), DestroyError> {
        kernel.expect_thread_context()?;
        kernel.syscall(|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.expect_created(lock.borrow_mut())?;
            if self.active.get(&*lock) {
                self.stop_inner(kernel, lock.borrow_mut());
            }
            self.created.replace(&mut *lock, false);
            self.callback.replace(&mut *lock, None);
            Ok(())
        })
    }

    /// Start the timer. It fires `first_due` ticks from now, and then every
    /// `period` ticks if `period` is non-zero.
    ///
    /// Fails with `InvalidArg` if `first_due` is zero and with
    /// `TimerStarted` if the timer is already running.
    pub fn start(
        &'static self,
        kernel: &'static Kernel<Traits>,
        first_due: u32,
        period: u32,
    ) -> Result<(), StartTimerError> {
        kernel.expect_thread_context()?;
        kernel.syscall(|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.expect_created(lock.borrow_mut())?;
            if first_due == 0 {
                return Err(StartTimerError::InvalidArg);
            }
            if self.active.get(&*lock) {
                return Err(StartTimerError::TimerStarted);
            }

            self.has_elapsed.replace(&mut *lock, false);
            self.period.replace(&mut *lock, period);
            self.active.replace(&mut *lock, true);
            let now = kernel.tick_count();
            kernel.queue_timer(lock.borrow_mut(), self, now.wrapping_add(first_due));
            Ok(())
        })
    }

    /// Stop the timer. Fails with `TimerStopped` if it's not running.
    pub fn stop(&'static self, kernel: &'static Kernel<Traits>) -> Result<(), StopTimerError> {
        kernel.expect_thread_context()?;
        kernel.syscall(|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.expect_created(lock.borrow_mut())?;
            if !self.active.get(&*lock) {
                return Err(StopTimerError::TimerStopped);
            }
            self.stop_inner(kernel, lock.borrow_mut());
            Ok(())
        })
    }

    pub(crate) fn stop_inner(
        &'static self,
        kernel: &'static Kernel<Traits>,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) {
        if self.queued.get(&*lock) {
            kernel.unqueue_timer(lock.borrow_mut(), self);
        }
        self.active.replace(&mut *lock, false);
        self.period.replace(&mut *lock, 0);
        self.has_elapsed.replace(&mut *lock, false);
    }

    /// Get a flag indicating whether the timer has fired since it was
    /// started or since the last call to this method, and clear it.
    pub fn has_elapsed(&'static self, kernel: &'static Kernel<Traits>) -> Result<bool, QueryError> {
        kernel.expect_thread_context()?;
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.expect_created(lock.borrow_mut())?;
        Ok(self.has_elapsed.replace(&mut *lock, false))
    }

    /// Get a flag indicating whether the timer is running.
    pub fn is_running(&'static self) -> Result<bool, QueryError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.expect_created(lock.borrow_mut())?;
        Ok(self.active.get(&*lock))
    }

    pub(crate) fn is_active(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.active.get(&*lock)
    }

    pub(crate) fn take_elapsed(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> bool {
        self.has_elapsed.replace(&mut *lock, false)
    }

    /// Get the object identifier of the timer.
    pub fn object_id(&'static self) -> Result<u32, QueryError> {
        let mut lock = klock::lock_cpu::<Traits>()?;
        self.expect_created(lock.borrow_mut())?;
        Ok(self.object_id.get(&*lock))
    }
}

impl<Traits: KernelCfg> Kernel<Traits> {
    /// Insert `timer` into the started timer list so that it fires on `due`.
    /// It's placed after the timers with the same due tick.
    fn queue_timer(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        timer: &'static Timer<Traits>,
        due: u32,
    ) {
        let now = self.tick_count();
        timer.due.replace(&mut *lock, due);

        let mut prev: Option<&'static Timer<Traits>> = None;
        let mut cur = self.timers.started.get(&*lock);
        while let Some(c) = cur {
            if is_later(now, due, c.due.get(&*lock)) {
                break;
            }
            prev = Some(c);
            cur = c.next.get(&*lock);
        }

        timer.next.replace(&mut *lock, cur);
        match prev {
            Some(prev) => prev.next.replace(&mut *lock, Some(timer)),
            None => self.timers.started.replace(&mut *lock, Some(timer)),
        };
        timer.queued.replace(&mut *lock, true);

        log::trace!("timer {:p} due at tick {due} (now = {now})", timer);
    }

    fn unqueue_timer(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        timer: &'static Timer<Traits>,
    ) {
        let mut prev: Option<&'static Timer<Traits>> = None;
        let mut cur = self.timers.started.get(&*lock);
        while let Some(c) = cur {
            if ptr::eq(c, timer) {
                let next = c.next.get(&*lock);
                match prev {
                    Some(prev) => prev.next.replace(&mut *lock, next),
                    None => self.timers.started.replace(&mut *lock, next),
                };
                break;
            }
            prev = Some(c);
            cur = c.next.get(&*lock);
        }
        timer.next.replace(&mut *lock, None);
        timer.queued.replace(&mut *lock, false);
    }

    /// Wake up the timer task if the first started timer is due on `tick`.
    pub(crate) fn timer_tick(&'static self, mut lock: CpuLockTokenRefMut<'_, Traits>, tick: u32) {
        let Some(head) = self.timers.started.get(&*lock) else {
            return;
        };
        if head.due.get(&*lock) != tick {
            return;
        }

        // The timer task must be waiting by now
        if self.timers.wait.signal(self, lock.borrow_mut(), Ok(()), false) == 0 {
            self.fatal(ResultCode::TimerTaskOverrun);
        }
    }

    /// Fire every timer due on the due tick of the first started timer.
    fn fire_due_timers(&'static self) {
        let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
            self.fatal(ResultCode::BadContext);
        };

        // The timer may have been stopped since the timer task was woken up
        let Some(head) = self.timers.started.get(&*lock) else {
            return;
        };
        let serviced = head.due.get(&*lock);

        while let Some(timer) = self
            .timers
            .started
            .get(&*lock)
            .filter(|timer| timer.due.get(&*lock) == serviced)
        {
            self.unqueue_timer(lock.borrow_mut(), timer);
            timer.has_elapsed.replace(&mut *lock, true);
            let callback = timer.callback.get(&*lock);
            let user_data = timer.user_data.get(&*lock);

            drop(lock);
            log::trace!("timer {:p} fired at tick {serviced}", timer);
            match callback {
                Some(TimerCallback::User(f)) => f(self, timer, user_data),
                Some(TimerCallback::Waitable(wt)) => wt.on_elapsed(self),
                None => {}
            }
            lock = match klock::lock_cpu::<Traits>() {
                Ok(lock) => lock,
                Err(_) => self.fatal(ResultCode::BadContext),
            };

            // The callback may have stopped or restarted the timer
            if timer.active.get(&*lock) && !timer.queued.get(&*lock) {
                let period = timer.period.get(&*lock);
                if period == 0 {
                    timer.active.replace(&mut *lock, false);
                } else {
                    let due = self.tick_count().wrapping_add(period);
                    self.queue_timer(lock.borrow_mut(), timer, due);
                }
            }
        }

        if serviced != self.tick_count() {
            self.fatal(ResultCode::TimerTaskOverrun);
        }
    }
}

/// The body of the timer task.
pub(crate) fn timer_task<Traits: KernelCfg>(kernel: &'static Kernel<Traits>, _: usize) -> usize {
    loop {
        kernel.syscall(|| {
            let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
                kernel.fatal(ResultCode::BadContext);
            };
            if kernel.timers.wait.wait(kernel, lock.borrow_mut(), WAIT_FOREVER).is_err() {
                kernel.fatal(ResultCode::Failure);
            }
        });

        kernel.fire_due_timers();
    }
}
