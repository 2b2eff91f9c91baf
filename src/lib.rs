//! Thread-safe reference counted [`Strong`] and [`Weak`] pointers.
//!
//! The pointer types behave much like [`std::sync::Arc`] and [`std::sync::Weak`], with two
//! differences: both handles may be empty, and a weak handle is promoted through
//! [`Weak::lock`], which serializes competing promotions of the same value on a spin lock kept
//! in the shared control block.
//!
//! Every value has one control block holding two counters. The strong count tracks the live
//! `Strong` handles and decides when the value is destroyed. The weak count tracks every live
//! handle, strong or weak, and decides when the control block itself is freed. A `Strong` counts
//! once in each.
//!
//! A promotion increments the strong count and inspects the result. A result of one means the
//! count was already zero and the value is gone, so the increment is undone and an empty handle
//! returned. Only promotions can raise the count from zero and they hold the lock while doing so,
//! which keeps two of them from both reading the transient one as a live value.
//!
//! ```
//! # use tether::Strong;
//! let s = Strong::new(String::from("a"));
//! let w = s.downgrade();
//!
//! assert!(w.lock().as_str() == "a");
//! drop(s);
//! assert!(w.lock().is_empty());
//! ```
//!
//! Enabling the `serialized-release` feature makes the strong decrement in
//! [`Strong::reset`] take the same lock as promotion.

mod control;
mod error;
mod pointer;

pub use crate::error::NullDereference;
pub use crate::pointer::{Strong, Weak};
