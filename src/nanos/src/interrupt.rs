//! Interrupt handling and deferred interrupt service requests
//!
//! An interrupt handler may not touch a wait object that a task is in the
//! middle of updating (the *ISR-locked* object), nor the timer and scheduler
//! state while any service call is in progress. In these cases the work is
//! recorded as an [`IsrRequest`] and carried out later by the ISR request
//! task, which runs at the highest priority.
use core::{
    fmt, ptr,
    sync::atomic::{AtomicU32, Ordering},
};

use crate::{
    error::{BadContextError, InvalidObjectError, QueueIsrRequestError},
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    utils::Init,
    wait::{WaitObject, WaitObjectType},
    CondVar, FlagSet, Kernel, KernelCfg, Mailbox, ResultCode, Semaphore, WAIT_FOREVER,
};

/// A deferred interrupt service request.
pub enum IsrRequest<Traits: KernelCfg> {
    SemaphorePost(&'static Semaphore<Traits>),
    MailboxPost(&'static Mailbox<Traits>, &'static [u8]),
    FlagSetSet(&'static FlagSet<Traits>, u32),
    FlagSetClear(&'static FlagSet<Traits>, u32),
    /// The flag selects a broadcast.
    CondVarSignal(&'static CondVar<Traits>, bool),
    /// Timer processing for the given tick.
    TimerTick { tick: u32 },
    /// Timeout and round-robin processing for the given tick.
    HandleSuspendedTasks { tick: u32 },
}

impl<Traits: KernelCfg> Clone for IsrRequest<Traits> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<Traits: KernelCfg> Copy for IsrRequest<Traits> {}

impl<Traits: KernelCfg> fmt::Debug for IsrRequest<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::SemaphorePost(sem) => f
                .debug_tuple("SemaphorePost")
                .field(&(sem as *const _))
                .finish(),
            Self::MailboxPost(mb, mail) => f
                .debug_tuple("MailboxPost")
                .field(&(mb as *const _))
                .field(&mail.len())
                .finish(),
            Self::FlagSetSet(fs, mask) => f
                .debug_tuple("FlagSetSet")
                .field(&(fs as *const _))
                .field(&format_args!("{mask:#x}"))
                .finish(),
            Self::FlagSetClear(fs, mask) => f
                .debug_tuple("FlagSetClear")
                .field(&(fs as *const _))
                .field(&format_args!("{mask:#x}"))
                .finish(),
            Self::CondVarSignal(cv, broadcast) => f
                .debug_tuple("CondVarSignal")
                .field(&(cv as *const _))
                .field(&broadcast)
                .finish(),
            Self::TimerTick { tick } => f.debug_struct("TimerTick").field("tick", &tick).finish(),
            Self::HandleSuspendedTasks { tick } => f
                .debug_struct("HandleSuspendedTasks")
                .field("tick", &tick)
                .finish(),
        }
    }
}

impl<Traits: KernelCfg> IsrRequest<Traits> {
    /// Carry out the request from the ISR request task.
    fn execute(self, kernel: &'static Kernel<Traits>) -> Result<(), ResultCode> {
        match self {
            Self::SemaphorePost(sem) => sem.post(kernel).map_err(Into::into),
            Self::MailboxPost(mb, mail) => mb.post(kernel, mail).map_err(Into::into),
            Self::FlagSetSet(fs, mask) => fs.set(kernel, mask).map_err(Into::into),
            Self::FlagSetClear(fs, mask) => fs.clear(kernel, mask).map_err(Into::into),
            Self::CondVarSignal(cv, broadcast) => cv.signal(kernel, broadcast).map_err(Into::into),
            Self::TimerTick { tick } => kernel.syscall(|| {
                let mut lock = klock::lock_cpu::<Traits>().map_err(ResultCode::from)?;
                kernel.timer_tick(lock.borrow_mut(), tick);
                Ok(())
            }),
            Self::HandleSuspendedTasks { tick } => kernel.syscall(|| {
                let mut lock = klock::lock_cpu::<Traits>().map_err(ResultCode::from)?;
                kernel.handle_suspended_tasks(lock.borrow_mut(), tick, false);
                Ok(())
            }),
        }
    }
}

pub(crate) struct IsrState<Traits: KernelCfg> {
    /// The interrupt nesting depth.
    pub(crate) int_nesting: AtomicU32,
    /// The service call nesting depth. Scheduling is deferred while it's
    /// non-zero.
    pub(crate) lock_count: AtomicU32,
    /// The wait object being updated by the current service call.
    pub(crate) locked_wait_object: CpuLockCell<Traits, Option<&'static WaitObject<Traits>>>,
    /// The ISR request task blocks on this.
    pub(crate) wait: WaitObject<Traits>,
    /// A ring buffer of `count` requests starting at `read`.
    requests: CpuLockCell<Traits, Traits::IsrRequestPool>,
    read: CpuLockCell<Traits, usize>,
    count: CpuLockCell<Traits, usize>,
}

impl<Traits: KernelCfg> Init for IsrState<Traits> {
    const INIT: Self = Self {
        int_nesting: Init::INIT,
        lock_count: Init::INIT,
        locked_wait_object: Init::INIT,
        wait: Init::INIT,
        requests: Init::INIT,
        read: Init::INIT,
        count: Init::INIT,
    };
}

impl<Traits: KernelCfg> Kernel<Traits> {
    /// Mark the beginning of an interrupt handler.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port, paired with
    /// [`Self::interrupt_exit`].
    pub unsafe fn interrupt_enter(&'static self) {
        self.isr.int_nesting.fetch_add(1, Ordering::Relaxed);
    }

    /// Mark the end of an interrupt handler. When the outermost handler
    /// returns and no service call is in progress, the scheduler is invoked.
    ///
    /// # Safety
    ///
    /// Only meant to be called by the port, with CPU Lock inactive.
    pub unsafe fn interrupt_exit(&'static self) {
        let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
            self.fatal(ResultCode::BadContext);
        };
        let nesting = self.isr.int_nesting.fetch_sub(1, Ordering::Relaxed) - 1;
        if nesting == 0 && self.isr.lock_count.load(Ordering::Relaxed) == 0 {
            self.schedule(lock.borrow_mut(), true);
        }
    }

    /// Append a request to the ring and wake up the ISR request task.
    pub(crate) fn queue_isr_request(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        request: IsrRequest<Traits>,
    ) -> Result<(), QueueIsrRequestError> {
        let read = self.isr.read.get(&*lock);
        let count = self.isr.count.get(&*lock);
        let requests = self.isr.requests.write(&mut *lock).as_mut();
        if count >= requests.len() {
            return Err(QueueIsrRequestError::IsrRequestListFull);
        }

        let i = (read + count) % requests.len();
        requests[i] = Some(request);
        self.isr.count.replace(&mut *lock, count + 1);

        log::trace!("queued ISR request {request:?}");

        self.isr.wait.signal(self, lock.borrow_mut(), Ok(()), false);
        Ok(())
    }

    /// Remove the oldest request from the ring. Its slot is available to
    /// interrupt handlers while the request is carried out.
    fn take_isr_request(&'static self) -> Option<IsrRequest<Traits>> {
        let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
            self.fatal(ResultCode::BadContext);
        };
        let count = self.isr.count.get(&*lock);
        if count == 0 {
            return None;
        }
        let read = self.isr.read.get(&*lock);
        let requests = self.isr.requests.write(&mut *lock).as_mut();
        let request = requests[read].take();
        let next = (read + 1) % requests.len();
        self.isr.read.replace(&mut *lock, next);
        self.isr.count.replace(&mut *lock, count - 1);
        request
    }

    /// Run a from-ISR variant of a service on `obj`.
    ///
    /// If `obj` is ISR-locked, `request` is queued for the ISR request task.
    /// Otherwise, `f` carries out the service immediately.
    pub(crate) fn isr_service<E>(
        &'static self,
        obj: &'static WaitObject<Traits>,
        ty: WaitObjectType,
        request: IsrRequest<Traits>,
        f: impl FnOnce(CpuLockTokenRefMut<'_, Traits>) -> Result<(), E>,
    ) -> Result<(), E>
    where
        E: From<BadContextError> + From<InvalidObjectError> + From<QueueIsrRequestError>,
    {
        self.expect_isr_context()?;

        let mut lock = klock::lock_cpu::<Traits>()?;
        obj.expect_type(lock.borrow_mut(), ty)?;

        let is_locked = self
            .isr
            .locked_wait_object
            .get(&*lock)
            .is_some_and(|locked| ptr::eq(locked, obj));
        if is_locked {
            self.queue_isr_request(lock.borrow_mut(), request)?;
            return Ok(());
        }

        f(lock.borrow_mut())
    }
}

/// The body of the ISR request task.
pub(crate) fn isr_request_task<Traits: KernelCfg>(
    kernel: &'static Kernel<Traits>,
    _: usize,
) -> usize {
    loop {
        kernel.syscall(|| {
            let Ok(mut lock) = klock::lock_cpu::<Traits>() else {
                kernel.fatal(ResultCode::BadContext);
            };
            if kernel.isr.count.get(&*lock) == 0
                && kernel.isr.wait.wait(kernel, lock.borrow_mut(), WAIT_FOREVER).is_err()
            {
                kernel.fatal(ResultCode::Failure);
            }
        });

        // CPU Lock is held only while touching the ring, so that interrupts
        // are taken between requests
        while let Some(request) = kernel.take_isr_request() {
            log::trace!("executing ISR request {request:?}");
            if let Err(code) = request.execute(kernel) {
                if !Traits::isr_request_error_hook(&request, code) {
                    kernel.fatal(code);
                }
            }
        }
    }
}
