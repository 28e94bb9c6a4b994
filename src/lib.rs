#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg, doc_auto_cfg))]
#![cfg_attr(not(any(test, feature = "std")), no_std)]
#![warn(missing_docs, missing_debug_implementations)]

extern crate alloc;

#[macro_use]
mod util;

pub mod abort;
pub mod error;
pub mod semaphore;
pub mod time;

#[doc(inline)]
pub use self::abort::AbortSource;
#[doc(inline)]
pub use self::error::{
    DefaultErrorFactory, ErrorFactory, NamedErrorFactory, NotEnoughUnits, WaitError,
    WaitErrorKind, WaitResult,
};
#[doc(inline)]
pub use self::semaphore::{NamedSemaphore, OwnedUnits, Semaphore, Units};
#[doc(inline)]
pub use self::time::{Clock, Duration, Instant, Timer};
