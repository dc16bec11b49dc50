//! Query API for the HTTP surface
//!
//! Read models shaped for display: thread summaries, thread details with
//! their emails, and emails with their attachment metadata.

mod threads;

pub use threads::{
    EmailDetail, ThreadDetail, ThreadSummary, get_email_detail, get_thread_detail, list_threads,
};
