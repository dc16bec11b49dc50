//! Thread and email read models

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::Result;
use crate::models::{Attachment, Email, EmailId, MailboxScope, Page, Thread, ThreadId};
use crate::storage::{MailboxStore, ThreadFilter};

/// Summary information for displaying a thread in a list
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadSummary {
    pub id: ThreadId,
    pub subject: String,
    /// Preview of the most recent message
    pub snippet: String,
    pub participants: Vec<String>,
    pub last_message_at: DateTime<Utc>,
    pub message_count: u32,
    pub unread_count: u32,
    pub is_unread: bool,
    pub is_starred: bool,
    pub is_important: bool,
    pub has_attachments: bool,
    pub labels: Vec<String>,
}

impl From<Thread> for ThreadSummary {
    fn from(thread: Thread) -> Self {
        Self {
            is_unread: thread.is_unread(),
            id: thread.id,
            subject: thread.subject,
            snippet: thread.snippet,
            participants: thread.participants,
            last_message_at: thread.last_message_at,
            message_count: thread.message_count,
            unread_count: thread.unread_count,
            is_starred: thread.is_starred,
            is_important: thread.is_important,
            has_attachments: thread.has_attachments,
            labels: thread.labels,
        }
    }
}

/// Detailed thread information including all emails
#[derive(Debug, Clone, Serialize)]
pub struct ThreadDetail {
    pub thread: Thread,
    /// All emails in the thread, oldest first
    pub emails: Vec<Email>,
}

/// One email with its attachment metadata
#[derive(Debug, Clone, Serialize)]
pub struct EmailDetail {
    #[serde(flatten)]
    pub email: Email,
    pub attachments: Vec<Attachment>,
}

/// List threads, newest activity first
pub fn list_threads(
    store: &dyn MailboxStore,
    scope: MailboxScope,
    filter: &ThreadFilter,
) -> Result<Page<ThreadSummary>> {
    Ok(store.list_threads(scope, filter)?.map(ThreadSummary::from))
}

/// Get a thread with every member email
pub fn get_thread_detail(
    store: &dyn MailboxStore,
    scope: MailboxScope,
    thread_id: ThreadId,
) -> Result<Option<ThreadDetail>> {
    let thread = match store.get_thread(scope, thread_id)? {
        Some(t) => t,
        None => return Ok(None),
    };

    let emails = store.list_thread_emails(scope, thread_id)?;

    Ok(Some(ThreadDetail { thread, emails }))
}

pub fn get_email_detail(
    store: &dyn MailboxStore,
    scope: MailboxScope,
    email_id: EmailId,
) -> Result<Option<EmailDetail>> {
    let Some(email) = store.get_email(scope, email_id)? else {
        return Ok(None);
    };
    let attachments = if email.has_attachments {
        store.list_email_attachments(scope, email_id)?
    } else {
        Vec::new()
    };
    Ok(Some(EmailDetail { email, attachments }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmailAddress, NewEmail, TenantId, UserId};
    use crate::storage::SqliteMailboxStore;

    fn setup_test_store() -> (SqliteMailboxStore, MailboxScope) {
        let store = SqliteMailboxStore::open_in_memory().unwrap();
        let scope = MailboxScope::new(TenantId::new(), UserId::new());

        // Five threads of two messages each
        for i in 0..5 {
            let at = Utc::now() - chrono::Duration::hours(i as i64 * 2);
            let root = format!("t{}@example.com", i);
            let first = NewEmail::builder(&root, EmailAddress::new("buyer@example.com"))
                .subject(format!("Thread {}", i))
                .received_at(at - chrono::Duration::minutes(30))
                .build();
            store.insert_email(scope, &first).unwrap();

            let reply = NewEmail::builder(format!("r{}@example.com", i), EmailAddress::new("rep@dealer.com"))
                .subject(format!("Re: Thread {}", i))
                .in_reply_to(&root)
                .read(i % 2 == 1)
                .received_at(at)
                .build();
            store.insert_email(scope, &reply).unwrap();
        }

        (store, scope)
    }

    #[test]
    fn test_list_threads() {
        let (store, scope) = setup_test_store();

        let page = list_threads(
            &store,
            scope,
            &ThreadFilter {
                limit: Some(3),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(page.items.len(), 3);
        assert_eq!(page.total, 5);
        // Sorted by last_message_at descending
        assert_eq!(page.items[0].subject, "Thread 0");
        assert_eq!(page.items[1].subject, "Thread 1");
        assert!(page.items.iter().all(|t| t.message_count == 2));
        assert!(page.items[0].is_unread);
    }

    #[test]
    fn test_get_thread_detail() {
        let (store, scope) = setup_test_store();
        let thread_id = list_threads(&store, scope, &ThreadFilter::default())
            .unwrap()
            .items[0]
            .id;

        let detail = get_thread_detail(&store, scope, thread_id).unwrap().unwrap();
        assert_eq!(detail.emails.len(), 2);
        assert!(detail.emails[0].activity_at() <= detail.emails[1].activity_at());

        let stranger = MailboxScope::new(scope.tenant_id, UserId::new());
        assert!(get_thread_detail(&store, stranger, thread_id).unwrap().is_none());
    }

    #[test]
    fn test_get_email_detail_not_found() {
        let (store, scope) = setup_test_store();
        assert!(get_email_detail(&store, scope, EmailId::new()).unwrap().is_none());
    }
}
