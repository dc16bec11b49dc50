//! Full-text search module using Tantivy
//!
//! Emails are indexed by subject, body and sender. Every query is pinned to
//! one mailbox by mandatory tenant and user terms.

mod index;
mod schema;

pub use index::{SearchHit, SearchHits, SearchIndex};

use serde::Serialize;

use crate::error::{MailboxError, Result};
use crate::models::{Email, MailboxScope, Page};
use crate::storage::MailboxStore;
use crate::storage::filter::clamp_limit;

/// A single search result: the matched email and its relevance
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    #[serde(flatten)]
    pub email: Email,
    /// Relevance score from Tantivy
    pub score: f32,
}

/// Search one mailbox by query string
///
/// This is the main entry point for searching. It executes the query
/// against the index and loads the matched emails from the store. Index
/// entries whose email is gone are skipped.
pub fn search_emails(
    index: &SearchIndex,
    store: &dyn MailboxStore,
    scope: MailboxScope,
    query: &str,
    limit: Option<u32>,
    offset: Option<u32>,
) -> Result<Page<SearchResult>> {
    let query = query.trim();
    if query.is_empty() {
        return Err(MailboxError::validation("q", "search query is required"));
    }

    let limit = clamp_limit(limit);
    let offset = offset.unwrap_or(0);
    let found = index.search(scope, query, limit as usize, offset as usize)?;

    let ids: Vec<_> = found.hits.iter().map(|h| h.email_id).collect();
    let emails = store.get_emails(scope, &ids)?;

    let items = found
        .hits
        .iter()
        .filter_map(|hit| {
            emails
                .iter()
                .find(|e| e.id == hit.email_id)
                .map(|email| SearchResult {
                    email: email.clone(),
                    score: hit.score,
                })
        })
        .collect();

    Ok(Page::new(items, found.total as u64, limit, offset))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmailAddress, NewEmail, TenantId, UserId};
    use crate::storage::SqliteMailboxStore;

    #[test]
    fn test_search_emails_pages_and_hydrates() {
        let index = SearchIndex::in_memory().unwrap();
        let store = SqliteMailboxStore::open_in_memory().unwrap();
        let scope = MailboxScope::new(TenantId::new(), UserId::new());

        for i in 0..3 {
            let email = NewEmail::builder(format!("m{}@x", i), EmailAddress::new("a@example.com"))
                .subject(format!("Lease offer {}", i))
                .body_text(Some("Monthly payment details".to_string()))
                .build();
            let stored = store.insert_email(scope, &email).unwrap().email;
            index.index_email(&stored).unwrap();
        }
        index.commit().unwrap();

        let page = search_emails(&index, &store, scope, "lease", Some(2), None).unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items.len(), 2);
        assert!(page.has_more);
        assert_eq!(page.next_offset, Some(2));
        assert!(page.items[0].email.subject.starts_with("Lease offer"));
    }

    #[test]
    fn test_huge_offset_returns_empty_page() {
        let index = SearchIndex::in_memory().unwrap();
        let store = SqliteMailboxStore::open_in_memory().unwrap();
        let scope = MailboxScope::new(TenantId::new(), UserId::new());

        let email = NewEmail::builder("lease@x", EmailAddress::new("a@example.com"))
            .subject("Lease renewal")
            .build();
        let stored = store.insert_email(scope, &email).unwrap().email;
        index.index_email(&stored).unwrap();
        index.commit().unwrap();

        let page =
            search_emails(&index, &store, scope, "lease", Some(10), Some(u32::MAX)).unwrap();
        assert_eq!(page.total, 1);
        assert!(page.items.is_empty());
        assert!(!page.has_more);
    }

    #[test]
    fn test_blank_query_is_rejected() {
        let index = SearchIndex::in_memory().unwrap();
        let store = SqliteMailboxStore::open_in_memory().unwrap();
        let scope = MailboxScope::new(TenantId::new(), UserId::new());

        let err = search_emails(&index, &store, scope, "   ", None, None).unwrap_err();
        assert!(matches!(err, MailboxError::Validation(_)));
    }

    #[test]
    fn test_search_result_serialization_flattens_email() {
        let store = SqliteMailboxStore::open_in_memory().unwrap();
        let scope = MailboxScope::new(TenantId::new(), UserId::new());
        let email = store
            .insert_email(
                scope,
                &NewEmail::builder("m@x", EmailAddress::new("a@example.com")).subject("Hi").build(),
            )
            .unwrap()
            .email;

        let json = serde_json::to_value(SearchResult { email, score: 1.5 }).unwrap();
        assert_eq!(json["subject"], "Hi");
        assert_eq!(json["score"], 1.5);
    }
}
