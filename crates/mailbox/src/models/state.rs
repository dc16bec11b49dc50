//! Pure per-email state transitions
//!
//! The store applies these to each matched row and only writes back rows whose
//! state actually changed, which keeps every batch operation idempotent.

use super::{Email, Folder};

/// The mutable part of an email
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailState {
    pub folder: Folder,
    pub is_read: bool,
    pub is_starred: bool,
    pub is_important: bool,
    pub labels: Vec<String>,
}

impl From<&Email> for EmailState {
    fn from(email: &Email) -> Self {
        Self {
            folder: email.folder,
            is_read: email.is_read,
            is_starred: email.is_starred,
            is_important: email.is_important,
            labels: email.labels.clone(),
        }
    }
}

/// A transition over one email's mutable state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmailMutation {
    SetRead(bool),
    SetStarred(bool),
    ToggleStarred,
    ToggleImportant,
    Move(Folder),
    AddLabels(Vec<String>),
    RemoveLabels(Vec<String>),
}

impl EmailMutation {
    /// Short name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            EmailMutation::SetRead(true) => "mark_read",
            EmailMutation::SetRead(false) => "mark_unread",
            EmailMutation::SetStarred(_) => "set_starred",
            EmailMutation::ToggleStarred => "toggle_star",
            EmailMutation::ToggleImportant => "toggle_important",
            EmailMutation::Move(_) => "move",
            EmailMutation::AddLabels(_) => "add_labels",
            EmailMutation::RemoveLabels(_) => "remove_labels",
        }
    }

    /// Compute the next state; `None` means the email is unchanged
    pub fn apply(&self, state: &EmailState) -> Option<EmailState> {
        let mut next = state.clone();

        match self {
            EmailMutation::SetRead(value) => next.is_read = *value,
            EmailMutation::SetStarred(value) => next.is_starred = *value,
            EmailMutation::ToggleStarred => next.is_starred = !state.is_starred,
            EmailMutation::ToggleImportant => next.is_important = !state.is_important,
            EmailMutation::Move(folder) => next.folder = *folder,
            EmailMutation::AddLabels(labels) => {
                for label in labels {
                    if !next.labels.iter().any(|l| l.eq_ignore_ascii_case(label)) {
                        next.labels.push(label.clone());
                    }
                }
            }
            EmailMutation::RemoveLabels(labels) => {
                next.labels
                    .retain(|l| !labels.iter().any(|r| r.eq_ignore_ascii_case(l)));
            }
        }

        (next != *state).then_some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> EmailState {
        EmailState {
            folder: Folder::Inbox,
            is_read: false,
            is_starred: false,
            is_important: false,
            labels: vec!["Leads".to_string()],
        }
    }

    #[test]
    fn test_mark_read_is_idempotent() {
        let read = EmailMutation::SetRead(true).apply(&state()).unwrap();
        assert!(read.is_read);
        assert_eq!(EmailMutation::SetRead(true).apply(&read), None);
    }

    #[test]
    fn test_toggles_flip() {
        let starred = EmailMutation::ToggleStarred.apply(&state()).unwrap();
        assert!(starred.is_starred);
        let unstarred = EmailMutation::ToggleStarred.apply(&starred).unwrap();
        assert!(!unstarred.is_starred);
    }

    #[test]
    fn test_move_to_same_folder_is_noop() {
        assert_eq!(EmailMutation::Move(Folder::Inbox).apply(&state()), None);
        let archived = EmailMutation::Move(Folder::Archive).apply(&state()).unwrap();
        assert_eq!(archived.folder, Folder::Archive);
    }

    #[test]
    fn test_labels_are_case_insensitive_sets() {
        let add = EmailMutation::AddLabels(vec!["leads".to_string(), "Hot".to_string()]);
        let next = add.apply(&state()).unwrap();
        assert_eq!(next.labels, vec!["Leads", "Hot"]);

        let remove = EmailMutation::RemoveLabels(vec!["LEADS".to_string()]);
        let next = remove.apply(&next).unwrap();
        assert_eq!(next.labels, vec!["Hot"]);

        assert_eq!(
            EmailMutation::RemoveLabels(vec!["missing".to_string()]).apply(&next),
            None
        );
    }
}
