//! Common error types shared across k3c crates.

mod common;

pub use common::CommonError;
