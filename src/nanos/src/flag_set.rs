//! Flag sets
use core::fmt;

use crate::{
    error::{
        CreateError, DestroyError, QueryError, SignalError, SignalFromIsrError, WaitFlagSetError,
    },
    interrupt::IsrRequest,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    task::WaitPayload,
    utils::Init,
    wait::{QueuingType, WaitObject, WaitObjectType},
    Kernel, KernelCfg,
};

/// A set of 32 event flags. Tasks wait for any or all of a selection of
/// flags to be set.
pub struct FlagSet<Traits: KernelCfg> {
    wait: WaitObject<Traits>,
    mask: CpuLockCell<Traits, u32>,
}

impl<Traits: KernelCfg> Init for FlagSet<Traits> {
    const INIT: Self = Self {
        wait: Init::INIT,
        mask: Init::INIT,
    };
}

impl<Traits: KernelCfg> fmt::Debug for FlagSet<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("FlagSet")
            .field("self", &(self as *const _))
            .field("mask", &self.mask)
            .field("wait", &self.wait)
            .finish()
    }
}

/// Get the flags of `current` satisfying a wait for `mask`, or `None` if the
/// wait isn't satisfied.
fn matched_flags(current: u32, mask: u32, wait_all: bool) -> Option<u32> {
    let matched = current & mask;
    let satisfied = if wait_all {
        matched == mask
    } else {
        matched != 0
    };
    satisfied.then_some(matched)
}

impl<Traits: KernelCfg> FlagSet<Traits> {
    pub const fn new() -> Self {
        Self::INIT
    }

    pub fn create(
        &'static self,
        kernel: &'static Kernel<Traits>,
        initial_mask: u32,
        queuing: QueuingType,
    ) -> Result<(), CreateError> {
        kernel.expect_thread_context()?;
        kernel.syscall(|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.wait
                .initialize(kernel, lock.borrow_mut(), WaitObjectType::FlagSet, queuing)?;
            self.mask.replace(&mut *lock, initial_mask);
            Ok(())
        })
    }

    /// Make the flag set unusable. The waiting tasks are woken up with
    /// `ObjectDestroyed`.
    pub fn destroy(&'static self, kernel: &'static Kernel<Traits>) -> Result<(), DestroyError> {
        kernel.object_service(&self.wait, WaitObjectType::FlagSet, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.wait.destroy(kernel, lock.borrow_mut())?;
            self.mask.replace(&mut *lock, 0);
            Ok(())
        })
    }

    /// Block until any (or, if `wait_all` is set, all) of the flags in
    /// `mask` are set. Returns the flags of `mask` that were set at that
    /// point. If `reset` is set, these flags are cleared.
    pub fn wait(
        &'static self,
        kernel: &'static Kernel<Traits>,
        mask: u32,
        wait_all: bool,
        reset: bool,
        timeout: u32,
    ) -> Result<u32, WaitFlagSetError> {
        if mask == 0 {
            return Err(WaitFlagSetError::InvalidArg);
        }

        kernel.object_service(&self.wait, WaitObjectType::FlagSet, || {
            let mut lock = klock::lock_cpu::<Traits>()?;

            if let Some(matched) = matched_flags(self.mask.get(&*lock), mask, wait_all) {
                if reset {
                    *self.mask.write(&mut *lock) &= !matched;
                }
                return Ok(matched);
            }

            let cur = kernel.running_task_idx(lock.borrow_mut());
            let task = kernel.task_cb(cur);
            task.wait_payload.replace(
                &mut *lock,
                WaitPayload::FlagSet {
                    mask,
                    wait_all,
                    reset,
                    result: 0,
                },
            );

            let status = self.wait.wait(kernel, lock.borrow_mut(), timeout);

            let matched = match task.wait_payload.replace(&mut *lock, WaitPayload::None) {
                WaitPayload::FlagSet { result, .. } => result,
                _ => 0,
            };
            status?;
            Ok(matched)
        })
    }

    /// Set the flags in `mask` and wake up every task whose wait is now
    /// satisfied.
    pub fn set(
        &'static self,
        kernel: &'static Kernel<Traits>,
        mask: u32,
    ) -> Result<(), SignalError> {
        kernel.object_service(&self.wait, WaitObjectType::FlagSet, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.set_inner(kernel, lock.borrow_mut(), mask);
            Ok(())
        })
    }

    /// [`Self::set`] for interrupt handlers.
    pub fn set_from_isr(
        &'static self,
        kernel: &'static Kernel<Traits>,
        mask: u32,
    ) -> Result<(), SignalFromIsrError> {
        kernel.isr_service(
            &self.wait,
            WaitObjectType::FlagSet,
            IsrRequest::FlagSetSet(self, mask),
            |lock| {
                self.set_inner(kernel, lock, mask);
                Ok(())
            },
        )
    }

    fn set_inner(
        &'static self,
        kernel: &'static Kernel<Traits>,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mask: u32,
    ) {
        *self.mask.write(&mut *lock) |= mask;

        // Each waiter is checked against the mask left by the previous
        // waiters' resets
        self.wait
            .signal_if(kernel, lock, Ok(()), true, |mut lock, task| {
                let current = self.mask.get(&*lock);
                let WaitPayload::FlagSet {
                    mask,
                    wait_all,
                    reset,
                    result,
                } = task.wait_payload.write(&mut *lock)
                else {
                    return false;
                };
                let Some(matched) = matched_flags(current, *mask, *wait_all) else {
                    return false;
                };
                *result = matched;
                let reset = *reset;
                if reset {
                    *self.mask.write(&mut *lock) &= !matched;
                }
                true
            });
    }

    /// Clear the flags in `mask`.
    pub fn clear(
        &'static self,
        kernel: &'static Kernel<Traits>,
        mask: u32,
    ) -> Result<(), SignalError> {
        kernel.object_service(&self.wait, WaitObjectType::FlagSet, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            *self.mask.write(&mut *lock) &= !mask;
            Ok(())
        })
    }

    /// [`Self::clear`] for interrupt handlers.
    pub fn clear_from_isr(
        &'static self,
        kernel: &'static Kernel<Traits>,
        mask: u32,
    ) -> Result<(), SignalFromIsrError> {
        kernel.isr_service(
            &self.wait,
            WaitObjectType::FlagSet,
            IsrRequest::FlagSetClear(self, mask),
            |mut lock| {
                *self.mask.write(&mut *lock) &= !mask;
                Ok(())
            },
        )
    }

    /// Get the current flags.
    pub fn get_mask(&'static self, kernel: &'static Kernel<Traits>) -> Result<u32, QueryError> {
        kernel.object_service(&self.wait, WaitObjectType::FlagSet, || {
            let lock = klock::lock_cpu::<Traits>()?;
            Ok(self.mask.get(&*lock))
        })
    }

    /// Attach a name to the flag set, for debugging.
    pub fn set_name(
        &'static self,
        kernel: &'static Kernel<Traits>,
        name: &'static str,
    ) -> Result<(), QueryError> {
        kernel.object_service(&self.wait, WaitObjectType::FlagSet, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.wait.set_name(lock.borrow_mut(), name);
            Ok(())
        })
    }

    pub fn name(
        &'static self,
        kernel: &'static Kernel<Traits>,
    ) -> Result<Option<&'static str>, QueryError> {
        kernel.object_service(&self.wait, WaitObjectType::FlagSet, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            Ok(self.wait.name(lock.borrow_mut()))
        })
    }
}
