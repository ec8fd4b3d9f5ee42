//! Capture sources feeding captured connections into the relay core.

pub mod original_dst;
pub mod redirect;
pub mod stack;

pub use redirect::RedirectStack;
pub use stack::{Stack, StackError};
pub use tunrelay_core::tunnel::StackEvent;
