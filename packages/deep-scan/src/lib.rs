//! # Deep Scan
//!
//! Resumable ingestion of invoices and receipts from a user's mailbox.
//!
//! A deep scan is a multi-phase job that a scheduler invokes over and over.
//! Each invocation does a bounded amount of work, checkpoints to the store
//! and returns before the host's execution limit:
//!
//! - **Discovery** pages through the remote query and fills a per-message
//!   work queue
//! - **Processing** claims queue items and runs the regex extractor, creating
//!   one document per message
//! - **AI pass** enriches documents from their PDF or image attachments
//!   (optional, skipped when the AI client is disabled)
//!
//! Incremental sync is the lighter continuous path: it reads the mailbox's
//! history since a saved cursor and reuses the same extraction steps.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use deep_scan::{
//!     DisabledExtractor, GmailConnector, PostgresStore, ScanConfig, ScanControl, ScanDeps,
//!     ScanOrchestrator,
//! };
//!
//! let store = Arc::new(PostgresStore::new(&database_url).await?);
//! store.migrate().await?;
//!
//! let deps = ScanDeps::new(
//!     store,
//!     Arc::new(GmailConnector::default()),
//!     Arc::new(DisabledExtractor),
//!     ScanConfig::default(),
//! );
//!
//! let job_id = ScanControl::new(deps.clone()).start(mailbox_id).await?;
//! let report = ScanOrchestrator::new(deps).tick().await?;
//! ```
//!
//! ## Testing
//!
//! [`MemoryStore`] together with the mocks in [`testing`] runs the whole
//! pipeline in-process.

pub mod ai;
pub mod config;
pub mod error;
pub mod extractor;
pub mod mailbox;
pub mod pipeline;
pub mod stores;
pub mod testing;
pub mod traits;
pub mod types;

pub use ai::OpenAiExtractor;
pub use config::{ScanConfig, WorkerConfig};
pub use error::{Result, ScanError};
pub use mailbox::{GmailClient, GmailConnector};
pub use pipeline::{
    IncrementalSync, PhaseReport, ScanControl, ScanDeps, ScanOrchestrator, SyncReport, TickReport,
    TimeBudget,
};
pub use stores::{MemoryStore, PostgresStore};
pub use traits::{
    ai::{AiExtraction, AiExtractor, AiInput, DisabledExtractor, ExtractionHints},
    mailbox::{MailboxClient, MailboxConnector},
    store::{DocumentStore, MailboxStore, ScanJobStore, ScanQueueStore, ScanStore},
};
pub use types::{
    document::{DocumentSource, DocumentStatus, DocumentType, FinancialDocument},
    job::{ScanJob, ScanProgress, ScanStatus},
    mailbox::MailboxConnection,
    message::{AttachmentRef, HistoryDelta, MailMessage, MessagePage},
    queue::{QueueItemStatus, ScanQueueItem},
};
