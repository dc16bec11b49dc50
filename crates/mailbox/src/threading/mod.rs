//! Thread reconciliation
//!
//! Matches an incoming or outgoing email to an existing conversation using,
//! in order: an explicit thread hint, `In-Reply-To`, then `References`
//! (first resolvable entry wins). Every lookup is confined to the mailbox
//! owner's scope, so a header that points at someone else's message simply
//! does not resolve and the email starts a new thread.
//!
//! Aggregates are never updated here; the store recomputes them from the
//! member set after the email is written.

use crate::error::Result;
use crate::models::{MailboxScope, NewEmail, ThreadId, normalize_subject};

/// Read access the resolver needs, implemented by the store inside its transaction
pub trait ThreadLookup {
    /// Whether the thread exists in this scope
    fn thread_exists(&self, scope: MailboxScope, thread_id: ThreadId) -> Result<bool>;

    /// Thread of the email carrying this Message-ID in this scope
    fn thread_for_message_id(
        &self,
        scope: MailboxScope,
        message_id: &str,
    ) -> Result<Option<ThreadId>>;
}

/// Which signal matched an existing thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedBy {
    Hint,
    InReplyTo,
    References,
}

/// Seed values for a thread that does not exist yet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewThread {
    pub id: ThreadId,
    pub subject: String,
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Existing {
        thread_id: ThreadId,
        matched: MatchedBy,
    },
    New(NewThread),
}

impl Resolution {
    pub fn thread_id(&self) -> ThreadId {
        match self {
            Resolution::Existing { thread_id, .. } => *thread_id,
            Resolution::New(thread) => thread.id,
        }
    }
}

/// Find or plan the thread for `email`
pub fn resolve_thread(
    lookup: &dyn ThreadLookup,
    scope: MailboxScope,
    email: &NewEmail,
) -> Result<Resolution> {
    if let Some(hint) = email.thread_hint
        && lookup.thread_exists(scope, hint)?
    {
        return Ok(Resolution::Existing {
            thread_id: hint,
            matched: MatchedBy::Hint,
        });
    }

    if let Some(parent) = &email.in_reply_to
        && let Some(thread_id) = lookup.thread_for_message_id(scope, parent)?
    {
        return Ok(Resolution::Existing {
            thread_id,
            matched: MatchedBy::InReplyTo,
        });
    }

    for reference in &email.references {
        if let Some(thread_id) = lookup.thread_for_message_id(scope, reference)? {
            return Ok(Resolution::Existing {
                thread_id,
                matched: MatchedBy::References,
            });
        }
    }

    Ok(Resolution::New(NewThread {
        id: ThreadId::new(),
        subject: normalize_subject(&email.subject),
        participants: email.participants(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EmailAddress, TenantId, UserId};
    use std::collections::{HashMap, HashSet};

    #[derive(Default)]
    struct MapLookup {
        threads: HashSet<(MailboxScope, ThreadId)>,
        messages: HashMap<(MailboxScope, String), ThreadId>,
    }

    impl MapLookup {
        fn add(&mut self, scope: MailboxScope, message_id: &str) -> ThreadId {
            let thread_id = ThreadId::new();
            self.threads.insert((scope, thread_id));
            self.messages
                .insert((scope, message_id.to_string()), thread_id);
            thread_id
        }
    }

    impl ThreadLookup for MapLookup {
        fn thread_exists(&self, scope: MailboxScope, thread_id: ThreadId) -> Result<bool> {
            Ok(self.threads.contains(&(scope, thread_id)))
        }

        fn thread_for_message_id(
            &self,
            scope: MailboxScope,
            message_id: &str,
        ) -> Result<Option<ThreadId>> {
            Ok(self.messages.get(&(scope, message_id.to_string())).copied())
        }
    }

    fn scope() -> MailboxScope {
        MailboxScope::new(TenantId::new(), UserId::new())
    }

    fn email(message_id: &str) -> crate::models::NewEmailBuilder {
        NewEmail::builder(message_id, EmailAddress::new("buyer@example.com"))
            .to(vec![EmailAddress::new("Rep@Dealer.com")])
            .subject("Re: Quote for the blue one")
    }

    #[test]
    fn test_in_reply_to_matches() {
        let scope = scope();
        let mut lookup = MapLookup::default();
        let thread_id = lookup.add(scope, "<m1@x>");

        let resolution = resolve_thread(&lookup, scope, &email("m2@x").in_reply_to("m1@x").build()).unwrap();
        assert_eq!(
            resolution,
            Resolution::Existing {
                thread_id,
                matched: MatchedBy::InReplyTo
            }
        );
    }

    #[test]
    fn test_first_resolvable_reference_wins() {
        let scope = scope();
        let mut lookup = MapLookup::default();
        let second = lookup.add(scope, "<r2@x>");
        lookup.add(scope, "<r3@x>");

        let new = email("m4@x")
            .references(vec!["<r1@x> <r2@x> <r3@x>".to_string()])
            .build();
        let resolution = resolve_thread(&lookup, scope, &new).unwrap();
        assert_eq!(resolution.thread_id(), second);
    }

    #[test]
    fn test_hint_wins_over_headers_when_in_scope() {
        let scope = scope();
        let mut lookup = MapLookup::default();
        let hinted = lookup.add(scope, "<a@x>");
        lookup.add(scope, "<b@x>");

        let new = email("c@x").thread_hint(Some(hinted)).in_reply_to("b@x").build();
        assert_eq!(
            resolve_thread(&lookup, scope, &new).unwrap(),
            Resolution::Existing {
                thread_id: hinted,
                matched: MatchedBy::Hint
            }
        );
    }

    #[test]
    fn test_headers_outside_scope_start_new_thread() {
        let owner = scope();
        let other = scope();
        let mut lookup = MapLookup::default();
        let foreign = lookup.add(other, "<m1@x>");

        let new = email("m2@x")
            .in_reply_to("m1@x")
            .thread_hint(Some(foreign))
            .build();
        match resolve_thread(&lookup, owner, &new).unwrap() {
            Resolution::New(thread) => {
                assert_ne!(thread.id, foreign);
                assert_eq!(thread.subject, "Quote for the blue one");
                assert_eq!(thread.participants, vec!["buyer@example.com", "rep@dealer.com"]);
            }
            other => panic!("expected a new thread, got {:?}", other),
        }
    }
}
