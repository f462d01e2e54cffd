#![allow(clippy::declare_interior_mutable_const)]
use core::{marker::PhantomData, sync::atomic};

/// Trait for types having a constant default value. This is essentially a
/// constant version of `Default`.
///
/// Every kernel object is built from `Init` values so that it can be placed
/// in a `static` without any runtime initialization.
pub trait Init {
    /// The default value.
    const INIT: Self;
}

impl Init for &'_ str {
    const INIT: Self = "";
}

impl<T: 'static> Init for &'_ [T] {
    const INIT: Self = &[];
}

impl<T> Init for Option<T> {
    const INIT: Self = None;
}

impl<T: ?Sized> Init for PhantomData<T> {
    const INIT: Self = PhantomData;
}

impl<T: Init, const LEN: usize> Init for [T; LEN] {
    const INIT: Self = [const { T::INIT }; LEN];
}

impl<T: Init, I: Init> Init for tokenlock::UnsyncTokenLock<T, I> {
    const INIT: Self = Self::new(I::INIT, T::INIT);
}

impl<Tag: ?Sized> Init for tokenlock::SingletonTokenId<Tag> {
    const INIT: Self = Self::new();
}

macro_rules! impl_init {
    (
        $(
            $( #[$meta:meta] )*
            $ty:ty => $value:expr,
        )*
    ) => {
        $(
            $( #[$meta] )*
            impl Init for $ty {
                const INIT: Self = $value;
            }
        )*
    };
}

impl_init! {
    bool => false,
    u8 => 0,
    u16 => 0,
    u32 => 0,
    u64 => 0,
    usize => 0,
    #[cfg(target_has_atomic = "8")]
    atomic::AtomicBool => atomic::AtomicBool::new(false),
    #[cfg(target_has_atomic = "32")]
    atomic::AtomicU32 => atomic::AtomicU32::new(0),
    () => (),
}
