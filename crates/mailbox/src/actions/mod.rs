//! Mailbox actions module
//!
//! Read/unread, star, important, label and folder transitions over one or
//! many emails, plus permanent deletion from trash.

mod handler;

pub use handler::{BatchAction, BatchOutcome, MAX_BATCH_SIZE, MailboxActions};
