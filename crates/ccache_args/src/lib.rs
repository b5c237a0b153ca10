//! Compiler argument classification.
//!
//! Consumes the original compiler argv and produces the argument lists
//! used for preprocessing and compiling, the cache-control flags derived
//! from them, and the filtered view of arguments that participate in the
//! hash. Anything the cache cannot handle is reported as a [`Bypass`] so
//! the driver can hand the invocation to the real compiler untouched.

#![warn(missing_docs)]

mod classify;
mod error;

pub use classify::{hash_args, process_args, HashArg, ProcessedArgs};
pub use error::Bypass;
