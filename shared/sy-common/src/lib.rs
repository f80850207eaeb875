//! Switchyard Common Library
//!
//! The message contract shared by the ingestion server (producer) and the
//! automation workers (consumer). Nothing in here performs I/O.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
