//! Result codes and per-service error types
use core::{fmt, mem::transmute};

/// The macro to define [`ResultCode`].
macro_rules! define_result_code {
    (
        $( #[$meta:meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident = $vd:expr
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        pub enum ResultCode {
            $(
                $( #[$vmeta] )*
                $vname = $vd
            ),*
        }

        impl ResultCode {
            /// Get the short name of the result code.
            ///
            /// # Examples
            ///
            /// ```
            /// use nanos::ResultCode;
            /// assert_eq!(ResultCode::SemaphoreFull.as_str(), "SemaphoreFull");
            /// ```
            pub fn as_str(self) -> &'static str {
                match self {
                    $(
                        Self::$vname => stringify!($vname),
                    )*
                }
            }

            fn fmt(self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl fmt::Debug for ResultCode {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                (*self).fmt(f)
            }
        }
    };
}

define_result_code! {
    /// All result codes (including success) that kernel services can report.
    ///
    /// The numbering is stable. Codes up to `MpuRegionAttribute` keep the
    /// values used by the C implementations of the kernel so that trace tools
    /// can decode them.
    #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[repr(i8)]
    pub enum ResultCode {
        /// The operation was successful.
        Success = 0,
        /// Generic failure. Also reported when an internal invariant of a
        /// service does not hold.
        Failure = 1,
        /// A parameter is invalid.
        InvalidArg = 2,
        /// The operation timed out.
        Timeout = 3,
        /// The port failed to initialize.
        PortInit = 4,
        /// The object was never created, was destroyed, or is already in use.
        InvalidObject = 5,
        /// The object was destroyed while the caller was waiting on it.
        ObjectDestroyed = 6,
        /// The scheduler found no ready task. Always fatal.
        NoTaskReady = 7,
        /// The priority is out of range, or the level is already occupied
        /// while round robin is disabled.
        InvalidPriorityLevel = 8,
        /// The deferred interrupt service request queue is full.
        IsrRequestListFull = 9,
        /// The semaphore already holds its maximum count.
        SemaphoreFull = 10,
        /// The mutex is owned by another task.
        MutexLocked = 11,
        /// The caller does not own the mutex.
        MutexNotOwned = 12,
        /// The mutex is locked recursively where a single lock is required.
        MutexLockCount = 13,
        /// The mailbox is full and no task is waiting for mail.
        MailboxFull = 14,
        /// The timer is already running.
        TimerStarted = 15,
        /// The timer is not running.
        TimerStopped = 16,
        /// The timer task could not keep up with the tick. Always fatal.
        TimerTaskOverrun = 17,
        /// Heap metadata is corrupted.
        CorruptedHeap = 18,
        /// The operation is not supported.
        NotSupported = 19,
        /// A task's stack pointer left its stack region. Always fatal.
        InvalidSp = 20,
        /// A task's stack guard marker was overwritten. Always fatal.
        CorruptedStack = 21,
        /// The service requires a started kernel. Always fatal.
        OsNotStarted = 22,
        /// No memory protection unit is available.
        MpuNotAvailable = 23,
        /// A memory protection region is misaligned.
        MpuRegionAlignment = 24,
        /// A memory protection region has invalid attributes.
        MpuRegionAttribute = 25,
        /// Every task control block of the task pool is in use.
        OutOfTaskSlots = 26,
        /// The current context disallows the operation. For example, a
        /// blocking service was called by an interrupt handler.
        BadContext = 27,
    }
}

impl ResultCode {
    /// Get a flag indicating whether the code represents a failure.
    #[inline]
    pub fn is_err(self) -> bool {
        self != Self::Success
    }

    /// Get a flag indicating whether the code represents a success.
    #[inline]
    pub fn is_ok(self) -> bool {
        !self.is_err()
    }
}

macro_rules! define_error {
    (
        mod $mod_name:ident {}
        $( #[$meta:meta] )*
        $vis:vis enum $name:ident $(: $($subty:ident),* $(,)*)? {
            $(
                $( #[$vmeta:meta] )*
                $vname:ident
            ),* $(,)*
        }
    ) => {
        $( #[$meta] )*
        ///
        /// See [`ResultCode`] for all result codes and generic descriptions.
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(i8)]
        $vis enum $name {
            $(
                $( #[$vmeta] )*
                // Use the same discriminants as `ResultCode` for cost-free
                // conversion
                $vname = ResultCode::$vname as i8
            ),*
        }

        impl fmt::Debug for $name {
            #[inline]
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                ResultCode::from(*self).fmt(f)
            }
        }

        impl From<Result<(), $name>> for ResultCode {
            #[inline]
            fn from(x: Result<(), $name>) -> Self {
                match x {
                    Ok(()) => Self::Success,
                    Err(e) => Self::from(e),
                }
            }
        }

        impl From<$name> for ResultCode {
            #[inline]
            fn from(x: $name) -> Self {
                // Safety: `ResultCode` and `$name` has the same representation
                //         type, and the representation of `ResultCode` is a
                //         superset of `x`.
                unsafe { transmute(x) }
            }
        }

        #[cfg(test)]
        mod $mod_name {
            use super::*;

            #[test]
            fn to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from($name::$vname),
                    );
                )*
            }

            #[test]
            fn result_to_result_code() {
                $(
                    assert_eq!(
                        ResultCode::$vname,
                        ResultCode::from(Err($name::$vname)),
                    );
                )*
                assert_eq!(
                    ResultCode::Success,
                    ResultCode::from(Result::<(), $name>::Ok(())),
                );
            }
        }

        $($(
            $subty!(impl From<_> for $name);
        )*)?

        #[allow(unused_macros)]
        macro_rules! $name {
            (impl From<_> for $dest_ty:ty) => {
                impl From<$name> for $dest_ty {
                    #[inline]
                    fn from(x: $name) -> Self {
                        match x {
                            $(
                                $name::$vname => Self::$vname,
                            )*
                        }
                    }
                }
            };
        }
    };
}

// Building blocks
// ---------------------------------------------------------------------------

define_error! {
    mod bad_context_error {}
    /// The current context disallows the operation.
    pub enum BadContextError {
        BadContext,
    }
}

define_error! {
    mod invalid_object_error {}
    /// The object is not in a usable state.
    pub enum InvalidObjectError {
        InvalidObject,
    }
}

define_error! {
    mod wait_error {}
    /// The reason a blocked task was woken without its condition being
    /// satisfied.
    pub enum WaitError {
        Timeout,
        ObjectDestroyed,
    }
}

define_error! {
    mod queue_isr_request_error {}
    /// A deferred interrupt service request could not be queued.
    pub enum QueueIsrRequestError {
        IsrRequestListFull,
    }
}

// Kernel
// ---------------------------------------------------------------------------

define_error! {
    mod start_error {}
    /// Error type for [`Kernel::start`](crate::Kernel::start).
    pub enum StartError: BadContextError {
        /// The kernel is not initialized or is already started.
        BadContext,
    }
}

define_error! {
    mod port_init_error {}
    /// Error type for [`Port::port_init`](crate::Port::port_init).
    pub enum PortInitError {
        PortInit,
    }
}

define_error! {
    mod stack_check_error {}
    /// Error type for [`Port::check_task_stack`](crate::Port::check_task_stack).
    pub enum StackCheckError {
        InvalidSp,
        CorruptedStack,
    }
}

// Tasks
// ---------------------------------------------------------------------------

define_error! {
    mod create_task_error {}
    /// Error type for [`Kernel::task_create`](crate::Kernel::task_create).
    pub enum CreateTaskError: BadContextError, InvalidObjectError {
        BadContext,
        InvalidObject,
        InvalidPriorityLevel,
        OutOfTaskSlots,
    }
}

define_error! {
    mod init_error {}
    /// Error type for [`Kernel::init`](crate::Kernel::init).
    pub enum InitError: BadContextError, InvalidObjectError, PortInitError, CreateTaskError {
        /// The kernel was already initialized or started.
        BadContext,
        PortInit,
        InvalidObject,
        InvalidPriorityLevel,
        OutOfTaskSlots,
    }
}

define_error! {
    mod sleep_error {}
    /// Error type for [`Kernel::task_sleep`](crate::Kernel::task_sleep).
    pub enum SleepError: BadContextError {
        BadContext,
    }
}

define_error! {
    mod join_error {}
    /// Error type for [`Kernel::task_join`](crate::Kernel::task_join).
    pub enum JoinError: BadContextError, InvalidObjectError {
        BadContext,
        InvalidObject,
        /// The task tried to join itself.
        InvalidArg,
        Timeout,
    }
}

define_error! {
    mod get_task_error {}
    /// Error type for task queries such as
    /// [`Kernel::task_get`](crate::Kernel::task_get).
    pub enum GetTaskError: BadContextError, InvalidObjectError {
        BadContext,
        InvalidObject,
    }
}

// Objects in general
// ---------------------------------------------------------------------------

define_error! {
    mod create_error {}
    /// Error type for the `create` methods of synchronization objects and
    /// timers.
    pub enum CreateError: BadContextError, InvalidObjectError {
        BadContext,
        InvalidObject,
        InvalidArg,
    }
}

define_error! {
    mod destroy_error {}
    /// Error type for the `destroy` methods of synchronization objects.
    pub enum DestroyError: BadContextError, InvalidObjectError {
        BadContext,
        InvalidObject,
    }
}

define_error! {
    mod query_error {}
    /// Error type for methods that read or rename an object without blocking.
    pub enum QueryError: BadContextError, InvalidObjectError {
        BadContext,
        InvalidObject,
    }
}

define_error! {
    mod signal_error {}
    /// Error type for signaling operations that cannot fail because of the
    /// object's state, such as [`CondVar::signal`](crate::CondVar::signal)
    /// and [`FlagSet::set`](crate::FlagSet::set).
    pub enum SignalError: BadContextError, InvalidObjectError {
        BadContext,
        InvalidObject,
    }
}

define_error! {
    mod signal_from_isr_error {}
    /// Error type for signaling operations invoked by an interrupt handler.
    pub enum SignalFromIsrError: BadContextError, InvalidObjectError, QueueIsrRequestError {
        BadContext,
        InvalidObject,
        IsrRequestListFull,
    }
}

define_error! {
    mod wait_object_error {}
    /// Error type for blocking operations.
    pub enum WaitObjectError: BadContextError, InvalidObjectError, WaitError {
        BadContext,
        InvalidObject,
        Timeout,
        ObjectDestroyed,
    }
}

// Semaphores
// ---------------------------------------------------------------------------

define_error! {
    mod post_semaphore_error {}
    /// Error type for [`Semaphore::post`](crate::Semaphore::post).
    pub enum PostSemaphoreError: BadContextError, InvalidObjectError {
        BadContext,
        InvalidObject,
        SemaphoreFull,
    }
}

define_error! {
    mod post_semaphore_from_isr_error {}
    /// Error type for
    /// [`Semaphore::post_from_isr`](crate::Semaphore::post_from_isr).
    pub enum PostSemaphoreFromIsrError:
        BadContextError, InvalidObjectError, QueueIsrRequestError, PostSemaphoreError
    {
        BadContext,
        InvalidObject,
        SemaphoreFull,
        IsrRequestListFull,
    }
}

// Mutexes and condition variables
// ---------------------------------------------------------------------------

define_error! {
    mod try_lock_mutex_error {}
    /// Error type for [`Mutex::try_lock`](crate::Mutex::try_lock).
    pub enum TryLockMutexError: BadContextError, InvalidObjectError {
        BadContext,
        InvalidObject,
        MutexLocked,
    }
}

define_error! {
    mod unlock_mutex_error {}
    /// Error type for [`Mutex::unlock`](crate::Mutex::unlock).
    pub enum UnlockMutexError: BadContextError, InvalidObjectError {
        BadContext,
        InvalidObject,
        MutexNotOwned,
    }
}

define_error! {
    mod cond_var_wait_error {}
    /// Error type for [`CondVar::wait`](crate::CondVar::wait).
    pub enum CondVarWaitError:
        BadContextError, InvalidObjectError, WaitError, WaitObjectError, UnlockMutexError
    {
        BadContext,
        InvalidObject,
        MutexNotOwned,
        MutexLockCount,
        Timeout,
        ObjectDestroyed,
    }
}

// Flag sets
// ---------------------------------------------------------------------------

define_error! {
    mod wait_flag_set_error {}
    /// Error type for [`FlagSet::wait`](crate::FlagSet::wait).
    pub enum WaitFlagSetError: BadContextError, InvalidObjectError, WaitError {
        BadContext,
        InvalidObject,
        /// The wait mask is empty.
        InvalidArg,
        Timeout,
        ObjectDestroyed,
    }
}

// Mailboxes
// ---------------------------------------------------------------------------

define_error! {
    mod wait_mailbox_error {}
    /// Error type for [`Mailbox::wait`](crate::Mailbox::wait).
    pub enum WaitMailboxError: BadContextError, InvalidObjectError, WaitError {
        BadContext,
        InvalidObject,
        /// The receive buffer is not exactly one mail long.
        InvalidArg,
        Timeout,
        ObjectDestroyed,
    }
}

define_error! {
    mod post_mailbox_error {}
    /// Error type for [`Mailbox::post`](crate::Mailbox::post).
    pub enum PostMailboxError: BadContextError, InvalidObjectError {
        BadContext,
        InvalidObject,
        /// The mail is not exactly one mail long.
        InvalidArg,
        MailboxFull,
    }
}

define_error! {
    mod post_mailbox_from_isr_error {}
    /// Error type for [`Mailbox::post_from_isr`](crate::Mailbox::post_from_isr).
    pub enum PostMailboxFromIsrError:
        BadContextError, InvalidObjectError, QueueIsrRequestError, PostMailboxError
    {
        BadContext,
        InvalidObject,
        InvalidArg,
        MailboxFull,
        IsrRequestListFull,
    }
}

// Timers
// ---------------------------------------------------------------------------

define_error! {
    mod start_timer_error {}
    /// Error type for [`Timer::start`](crate::Timer::start).
    pub enum StartTimerError: BadContextError, InvalidObjectError {
        BadContext,
        InvalidObject,
        /// The first due time is zero.
        InvalidArg,
        TimerStarted,
    }
}

define_error! {
    mod stop_timer_error {}
    /// Error type for [`Timer::stop`](crate::Timer::stop).
    pub enum StopTimerError: BadContextError, InvalidObjectError {
        BadContext,
        InvalidObject,
        TimerStopped,
    }
}

define_error! {
    mod destroy_waitable_timer_error {}
    /// Error type for
    /// [`WaitableTimer::destroy`](crate::WaitableTimer::destroy).
    pub enum DestroyWaitableTimerError: BadContextError, InvalidObjectError, DestroyError {
        BadContext,
        InvalidObject,
        TimerStarted,
    }
}

define_error! {
    mod wait_waitable_timer_error {}
    /// Error type for [`WaitableTimer::wait`](crate::WaitableTimer::wait).
    pub enum WaitWaitableTimerError: BadContextError, InvalidObjectError, WaitError {
        BadContext,
        InvalidObject,
        TimerStopped,
        Timeout,
        ObjectDestroyed,
    }
}
