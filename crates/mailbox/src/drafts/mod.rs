//! Draft lifecycle
//!
//! Drafts are edited freely, then either deleted or converted into exactly
//! one sent email. Conversion hands the message to the transport first and
//! files it afterwards in a single store transaction.

mod manager;
mod message_id;

pub use manager::{DraftManager, reply_fields};
pub use message_id::MessageIdGenerator;
