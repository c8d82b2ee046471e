//! Credential identity and value types

mod types;

pub use types::*;
