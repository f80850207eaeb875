//! Background Workers
//!
//! Consumers of the dispatch queue: the executor loop, the attachment stager,
//! the automation it runs and the platform client it reports through.

pub mod attachments;
pub mod automation;
pub mod executor;
pub mod platform;

pub use automation::{
    AutomationError, AutomationOutput, AutomationRequest, AutomationRunner, AutomationStats,
    CommandRunner,
};
pub use attachments::{AttachmentFetcher, FetchError, StagedFile, StagedFiles};
pub use executor::{
    retry_delay, TaskOutcome, WorkerConfig, WorkerError, WorkerPool, EMPTY_PROMPT_REPLY,
};
pub use platform::{PlatformClient, PlatformError, SlackClient, Target};
