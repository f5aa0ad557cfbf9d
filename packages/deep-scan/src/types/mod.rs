//! Data types shared by the pipeline, stores and adapters.

pub mod document;
pub mod job;
pub mod mailbox;
pub mod message;
pub mod queue;
