//! # brgy-core
//!
//! Configuration and the shared error type used by every brgy-health crate.

pub mod config;
pub mod error;

pub use config::{
    BrgyConfig, FollowUpConfig, NotificationConfig, SatisfiedPolicy, SchedulerConfig,
};
pub use error::{BrgyError, Result};
