//! Mailbox adapters.

pub mod gmail;

pub use gmail::{GmailClient, GmailConnector};
