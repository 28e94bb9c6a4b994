//! Internal utilities shared by the synchronization primitives.

#[cfg(any(test, feature = "tracing"))]
macro_rules! trace {
    ($($t:tt)*) => { tracing::trace!($($t)*) }
}

#[cfg(not(any(test, feature = "tracing")))]
macro_rules! trace {
    ($($t:tt)*) => {};
}

pub(crate) mod fmt;
mod wake_batch;

pub(crate) use self::wake_batch::WakeBatch;
