//! Panic isolation for user-supplied code.
//!
//! Subscriber callbacks, middleware stages and network method handlers run
//! inside [`isolate`] so one misbehaving closure cannot take down the pump
//! that is delivering to everyone else.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};

/// Run `f`, converting a panic into its message.
pub(crate) fn isolate<R>(f: impl FnOnce() -> R) -> Result<R, String> {
    catch_unwind(AssertUnwindSafe(f)).map_err(|panic| panic_message(&panic))
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic")
        .to_string()
}
