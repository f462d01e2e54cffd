//! A port for unit tests that drive kernel internals from the test thread
//!
//! Nothing is ever dispatched. The kernel stays in the boot context, so the
//! tests can call the scheduler and timer functions directly and inspect the
//! resulting state.

/// Define a `Traits` type implementing [`Port`](crate::Port) with CPU Lock
/// and nothing else. The test module supplies the `KernelCfg` impl.
macro_rules! test_port {
    (struct $Traits:ident) => {
        struct $Traits;

        mod test_port_impl {
            use super::$Traits;
            use crate::{Kernel, Port, PortInitError, ResultCode, TaskCb};
            use core::sync::atomic::{AtomicBool, Ordering};

            static CPU_LOCK: AtomicBool = AtomicBool::new(false);

            // Assume `$Traits: KernelCfg`
            unsafe impl Port for $Traits {
                type PortTaskState = ();

                unsafe fn port_init(_kernel: &'static Kernel<Self>) -> Result<(), PortInitError> {
                    Ok(())
                }

                unsafe fn init_task(_kernel: &'static Kernel<Self>, _task: &'static TaskCb<Self>) {}

                unsafe fn first_context_switch(_kernel: &'static Kernel<Self>) {
                    unreachable!("the test port doesn't run tasks");
                }

                unsafe fn context_switch(_kernel: &'static Kernel<Self>) {}

                unsafe fn context_switch_from_isr(_kernel: &'static Kernel<Self>) {}

                unsafe fn exit_and_dispatch(_kernel: &'static Kernel<Self>) -> ! {
                    unreachable!("the test port doesn't run tasks");
                }

                unsafe fn try_enter_cpu_lock() -> bool {
                    !CPU_LOCK.swap(true, Ordering::Acquire)
                }

                unsafe fn enter_cpu_lock() {
                    assert!(!CPU_LOCK.swap(true, Ordering::Acquire));
                }

                unsafe fn leave_cpu_lock() {
                    assert!(CPU_LOCK.swap(false, Ordering::Release));
                }

                fn is_cpu_lock_active() -> bool {
                    CPU_LOCK.load(Ordering::Relaxed)
                }

                fn timestamp_us() -> u32 {
                    0
                }

                fn halt(code: ResultCode) -> ! {
                    panic!("the kernel halted with {code:?}");
                }
            }
        }
    };
}
