//! Core trait abstractions for the deep-scan pipeline.
//!
//! Every collaborator the pipeline touches is injected through one of these
//! traits so tests can swap in fakes without process-wide state.

pub mod ai;
pub mod mailbox;
pub mod store;
