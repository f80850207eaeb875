//! Shared Types

pub mod identity;
pub mod task;

pub use identity::EventIdentity;
pub use task::{Attachment, AttachmentKind, DispatchTask, FailureRecord, TaskPayload};
