//! Mailboxes
use core::{fmt, ptr};

use crate::{
    error::{
        CreateError, DestroyError, PostMailboxError, PostMailboxFromIsrError, QueryError,
        WaitMailboxError,
    },
    interrupt::IsrRequest,
    klock::{self, CpuLockCell, CpuLockTokenRefMut},
    task::WaitPayload,
    utils::Init,
    wait::{QueuingType, WaitObject, WaitObjectType},
    Kernel, KernelCfg,
};

/// The receive buffer of a task blocked on a mailbox.
///
/// The buffer is borrowed by the blocked [`Mailbox::wait`] call, which
/// doesn't return before the task is removed from the wait queue.
#[derive(Debug)]
pub(crate) struct MailSlot {
    ptr: *mut u8,
    len: usize,
}

// Safety: Only accessed with CPU Lock active
unsafe impl Send for MailSlot {}

impl MailSlot {
    /// Copy `mail` into the slot.
    ///
    /// # Safety
    ///
    /// The borrow the slot was created from must be alive.
    unsafe fn fill(&self, mail: &[u8]) {
        debug_assert_eq!(mail.len(), self.len);
        // Safety: Upheld by the caller
        unsafe { ptr::copy_nonoverlapping(mail.as_ptr(), self.ptr, self.len.min(mail.len())) };
    }
}

/// A bounded queue of fixed-size mails.
///
/// A mail posted while a task is waiting is copied directly into the task's
/// receive buffer. Otherwise it's stored in the mailbox's buffer until it's
/// received.
pub struct Mailbox<Traits: KernelCfg> {
    wait: WaitObject<Traits>,
    buffer: CpuLockCell<Traits, Option<&'static mut [u8]>>,
    mail_size: CpuLockCell<Traits, usize>,
    max_count: CpuLockCell<Traits, u32>,
    /// The index of the oldest mail.
    read: CpuLockCell<Traits, u32>,
    count: CpuLockCell<Traits, u32>,
}

impl<Traits: KernelCfg> Init for Mailbox<Traits> {
    const INIT: Self = Self {
        wait: Init::INIT,
        buffer: Init::INIT,
        mail_size: Init::INIT,
        max_count: Init::INIT,
        read: Init::INIT,
        count: Init::INIT,
    };
}

impl<Traits: KernelCfg> fmt::Debug for Mailbox<Traits> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Mailbox")
            .field("self", &(self as *const _))
            .field("mail_size", &self.mail_size)
            .field("max_count", &self.max_count)
            .field("count", &self.count)
            .field("wait", &self.wait)
            .finish_non_exhaustive()
    }
}

impl<Traits: KernelCfg> Mailbox<Traits> {
    pub const fn new() -> Self {
        Self::INIT
    }

    /// Make the mailbox usable. It holds up to `max_count` mails of
    /// `mail_size` bytes each, stored in `buffer`.
    ///
    /// Fails with `InvalidArg` if either size is zero or `buffer` is too
    /// small.
    pub fn create(
        &'static self,
        kernel: &'static Kernel<Traits>,
        max_count: u32,
        mail_size: usize,
        buffer: &'static mut [u8],
        queuing: QueuingType,
    ) -> Result<(), CreateError> {
        let required = (max_count as usize).checked_mul(mail_size);
        if max_count == 0 || mail_size == 0 || required.map_or(true, |x| buffer.len() < x) {
            return Err(CreateError::InvalidArg);
        }

        kernel.expect_thread_context()?;
        kernel.syscall(|| {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.wait
                .initialize(kernel, lock.borrow_mut(), WaitObjectType::Mailbox, queuing)?;
            self.buffer.replace(&mut *lock, Some(buffer));
            self.mail_size.replace(&mut *lock, mail_size);
            self.max_count.replace(&mut *lock, max_count);
            self.read.replace(&mut *lock, 0);
            self.count.replace(&mut *lock, 0);
            Ok(())
        })
    }

    /// Make the mailbox unusable. The waiting tasks are woken up with
    /// `ObjectDestroyed`, and the stored mails are discarded.
    pub fn destroy(&'static self, kernel: &'static Kernel<Traits>) -> Result<(), DestroyError> {
        kernel.object_service(&self.wait, WaitObjectType::Mailbox, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.wait.destroy(kernel, lock.borrow_mut())?;
            self.count.replace(&mut *lock, 0);
            Ok(())
        })
    }

    /// Receive the oldest mail into `mail`, blocking for up to `timeout`
    /// ticks if the mailbox is empty. `mail` must be exactly one mail long.
    pub fn wait(
        &'static self,
        kernel: &'static Kernel<Traits>,
        mail: &mut [u8],
        timeout: u32,
    ) -> Result<(), WaitMailboxError> {
        kernel.object_service(&self.wait, WaitObjectType::Mailbox, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            let mail_size = self.mail_size.get(&*lock);
            if mail.len() != mail_size {
                return Err(WaitMailboxError::InvalidArg);
            }

            let count = self.count.get(&*lock);
            if count > 0 {
                let read = self.read.get(&*lock);
                let max_count = self.max_count.get(&*lock);
                if let Some(buffer) = self.buffer.read(&*lock) {
                    let start = read as usize * mail_size;
                    mail.copy_from_slice(&buffer[start..start + mail_size]);
                }
                self.read.replace(&mut *lock, (read + 1) % max_count);
                self.count.replace(&mut *lock, count - 1);
                return Ok(());
            }

            let cur = kernel.running_task_idx(lock.borrow_mut());
            let task = kernel.task_cb(cur);
            task.wait_payload.replace(
                &mut *lock,
                WaitPayload::Mail(MailSlot {
                    ptr: mail.as_mut_ptr(),
                    len: mail.len(),
                }),
            );

            // `post` fills `mail` before waking us up
            let status = self.wait.wait(kernel, lock.borrow_mut(), timeout);
            task.wait_payload.replace(&mut *lock, WaitPayload::None);
            status?;
            Ok(())
        })
    }

    /// Post a mail. `mail` must be exactly one mail long.
    ///
    /// Fails with `MailboxFull` if the mailbox is full.
    pub fn post(
        &'static self,
        kernel: &'static Kernel<Traits>,
        mail: &[u8],
    ) -> Result<(), PostMailboxError> {
        kernel.object_service(&self.wait, WaitObjectType::Mailbox, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.post_inner(kernel, lock.borrow_mut(), mail)
        })
    }

    /// [`Self::post`] for interrupt handlers. The mail may be read later by
    /// the ISR request task, hence the `'static` lifetime.
    pub fn post_from_isr(
        &'static self,
        kernel: &'static Kernel<Traits>,
        mail: &'static [u8],
    ) -> Result<(), PostMailboxFromIsrError> {
        kernel.isr_service(
            &self.wait,
            WaitObjectType::Mailbox,
            IsrRequest::MailboxPost(self, mail),
            |lock| Ok(self.post_inner(kernel, lock, mail)?),
        )
    }

    fn post_inner(
        &'static self,
        kernel: &'static Kernel<Traits>,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        mail: &[u8],
    ) -> Result<(), PostMailboxError> {
        let mail_size = self.mail_size.get(&*lock);
        if mail.len() != mail_size {
            return Err(PostMailboxError::InvalidArg);
        }

        let count = self.count.get(&*lock);
        let max_count = self.max_count.get(&*lock);
        if count >= max_count {
            return Err(PostMailboxError::MailboxFull);
        }

        let woken = self
            .wait
            .signal_if(kernel, lock.borrow_mut(), Ok(()), false, |mut lock, task| {
                match task.wait_payload.replace(&mut *lock, WaitPayload::None) {
                    WaitPayload::Mail(slot) => {
                        // Safety: The waiter is still blocked in `wait`
                        unsafe { slot.fill(mail) };
                        true
                    }
                    other => {
                        task.wait_payload.replace(&mut *lock, other);
                        false
                    }
                }
            });
        if woken > 0 {
            return Ok(());
        }

        let write = (self.read.get(&*lock) + count) % max_count;
        if let Some(buffer) = self.buffer.write(&mut *lock) {
            let start = write as usize * mail_size;
            buffer[start..start + mail_size].copy_from_slice(mail);
        }
        self.count.replace(&mut *lock, count + 1);
        Ok(())
    }

    /// Get the number of stored mails.
    pub fn get_count(&'static self, kernel: &'static Kernel<Traits>) -> Result<u32, QueryError> {
        kernel.object_service(&self.wait, WaitObjectType::Mailbox, || {
            let lock = klock::lock_cpu::<Traits>()?;
            Ok(self.count.get(&*lock))
        })
    }

    /// Attach a name to the mailbox, for debugging.
    pub fn set_name(
        &'static self,
        kernel: &'static Kernel<Traits>,
        name: &'static str,
    ) -> Result<(), QueryError> {
        kernel.object_service(&self.wait, WaitObjectType::Mailbox, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            self.wait.set_name(lock.borrow_mut(), name);
            Ok(())
        })
    }

    pub fn name(
        &'static self,
        kernel: &'static Kernel<Traits>,
    ) -> Result<Option<&'static str>, QueryError> {
        kernel.object_service(&self.wait, WaitObjectType::Mailbox, || {
            let mut lock = klock::lock_cpu::<Traits>()?;
            Ok(self.wait.name(lock.borrow_mut()))
        })
    }
}
