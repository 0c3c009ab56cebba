use crate::domain::{board::ColumnKey, CardId, Issue, IssueId};
use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Longest post the publishing client accepts, in characters
pub const MAX_POST_LENGTH: usize = 280;

/// Annotation written to a provider card once it was published
pub const PUBLISHED_NOTE_PREFIX: &str = "Published: ";

const RETWEET_DIRECTIVE: &str = "retweet:";
const REPLY_DIRECTIVE: &str = "reply-to:";

/// Publishable payload derived from an issue body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CardContent {
    Post { text: String },
    Reply { text: String, reply_to: String },
    Retweet { target: String },
}

impl CardContent {
    /// Derives the payload from the issue body.
    ///
    /// A `retweet: <target>` line turns the card into a repost and wins over
    /// everything else. A `reply-to: <target>` line makes the remaining body a
    /// reply. Otherwise the trimmed body is posted as is.
    pub fn from_issue(issue: &Issue) -> Self {
        let mut reply_to = None;
        let mut lines = Vec::new();

        for line in issue.body.lines() {
            let trimmed = line.trim();
            if let Some(target) = strip_directive(trimmed, RETWEET_DIRECTIVE) {
                return Self::Retweet {
                    target: target.to_string(),
                };
            }
            if let Some(target) = strip_directive(trimmed, REPLY_DIRECTIVE) {
                reply_to = Some(target.to_string());
                continue;
            }
            lines.push(line);
        }

        let text = lines.join("\n").trim().to_string();
        match reply_to {
            Some(reply_to) => Self::Reply { text, reply_to },
            None => Self::Post { text },
        }
    }

    /// Checks that the payload can be handed to the publishing client
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Post { text } | Self::Reply { text, .. } => {
                if text.is_empty() {
                    return Err(SyncError::Validation("post text is empty".to_string()));
                }
                let length = text.chars().count();
                if length > MAX_POST_LENGTH {
                    return Err(SyncError::Validation(format!(
                        "post is {length} characters long, limit is {MAX_POST_LENGTH}"
                    )));
                }
                if let Self::Reply { reply_to, .. } = self {
                    if reply_to.is_empty() {
                        return Err(SyncError::Validation("reply target is empty".to_string()));
                    }
                }
                Ok(())
            }
            Self::Retweet { target } if target.is_empty() => {
                Err(SyncError::Validation("retweet target is empty".to_string()))
            }
            Self::Retweet { .. } => Ok(()),
        }
    }

    pub fn is_retweet(&self) -> bool {
        matches!(self, Self::Retweet { .. })
    }

    pub fn is_reply(&self) -> bool {
        matches!(self, Self::Reply { .. })
    }
}

fn strip_directive<'a>(line: &'a str, directive: &str) -> Option<&'a str> {
    let head = line.get(..directive.len())?;
    if head.eq_ignore_ascii_case(directive) {
        Some(line[directive.len()..].trim())
    } else {
        None
    }
}

/// Where a card is in the at-most-once publishing protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishState {
    Eligible,
    Publishing,
    Published { url: String, at: DateTime<Utc> },
}

#[derive(Debug)]
struct CardState {
    content: Option<CardContent>,
    valid: bool,
    publish: PublishState,
    column: ColumnKey,
    outbound: bool,
}

/// Publishable content wrapper around one tracked issue.
///
/// The URL recorded by a `Published: <url>` provider note, if any
pub(crate) fn published_url_from_note(note: Option<&str>) -> Option<&str> {
    note.and_then(|note| note.strip_prefix(PUBLISHED_NOTE_PREFIX))
        .map(str::trim)
        .filter(|url| !url.is_empty())
}

/// A card is shared between its column and any publish in flight, so all of
/// its mutable state lives behind a short-lived lock that is never held
/// across an await point.
#[derive(Debug)]
pub struct Card {
    id: CardId,
    issue: IssueId,
    state: Mutex<CardState>,
}

impl Card {
    /// Creates a card whose content is not known yet
    pub(crate) fn new(id: CardId, issue: IssueId, column: ColumnKey, outbound: bool) -> Self {
        Self {
            id,
            issue,
            state: Mutex::new(CardState {
                content: None,
                valid: false,
                publish: PublishState::Eligible,
                column,
                outbound,
            }),
        }
    }

    /// Rebuilds a card from its provider annotation
    pub(crate) fn from_note(
        id: CardId,
        issue: IssueId,
        note: Option<&str>,
        column: ColumnKey,
        outbound: bool,
    ) -> Self {
        let card = Self::new(id, issue, column, outbound);
        if let Some(url) = published_url_from_note(note) {
            card.mark_published(url);
        }
        card
    }

    fn state(&self) -> MutexGuard<'_, CardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> &CardId {
        &self.id
    }

    pub fn issue(&self) -> IssueId {
        self.issue
    }

    pub fn content(&self) -> Option<CardContent> {
        self.state().content.clone()
    }

    pub fn is_valid(&self) -> bool {
        self.state().valid
    }

    pub fn column(&self) -> ColumnKey {
        self.state().column.clone()
    }

    pub fn publish_state(&self) -> PublishState {
        self.state().publish.clone()
    }

    pub fn published_url(&self) -> Option<String> {
        match &self.state().publish {
            PublishState::Published { url, .. } => Some(url.clone()),
            _ => None,
        }
    }

    /// True iff the content is valid, not yet published and the card sits in
    /// the outbound column
    pub fn can_tweet(&self) -> bool {
        let state = self.state();
        state.valid && state.outbound && state.publish == PublishState::Eligible
    }

    /// Re-derives the validity flag from the current content
    pub fn check_validity(&self) -> bool {
        let mut state = self.state();
        state.valid = match &state.content {
            Some(content) => match content.validate() {
                Ok(()) => true,
                Err(err) => {
                    tracing::debug!(issue = %self.issue, error = %err, "card content is invalid");
                    false
                }
            },
            None => false,
        };
        state.valid
    }

    /// Replaces the content with one derived from `issue` and re-validates.
    /// Returns the new validity.
    pub(crate) fn refresh(&self, issue: &Issue) -> bool {
        self.state().content = Some(CardContent::from_issue(issue));
        self.check_validity()
    }

    pub(crate) fn place(&self, column: ColumnKey, outbound: bool) {
        let mut state = self.state();
        state.column = column;
        state.outbound = outbound;
    }

    /// Atomically moves an eligible card to `Publishing` and hands out the
    /// content to publish. Returns `None` when the card is not eligible or
    /// another trigger already claimed it.
    pub(crate) fn begin_publish(&self) -> Option<CardContent> {
        let mut state = self.state();
        if !(state.valid && state.outbound && state.publish == PublishState::Eligible) {
            return None;
        }
        let content = state.content.clone()?;
        state.publish = PublishState::Publishing;
        Some(content)
    }

    /// Returns a card whose publish call failed to `Eligible`
    pub(crate) fn abort_publish(&self) {
        let mut state = self.state();
        if state.publish == PublishState::Publishing {
            state.publish = PublishState::Eligible;
        }
    }

    /// Records the published URL. Returns false if the card was already
    /// published.
    pub(crate) fn mark_published(&self, url: &str) -> bool {
        let mut state = self.state();
        if matches!(state.publish, PublishState::Published { .. }) {
            return false;
        }
        state.publish = PublishState::Published {
            url: url.to_string(),
            at: Utc::now(),
        };
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn issue(body: &str) -> Issue {
        Issue::new(IssueId::new(42), "Card").with_body(body)
    }

    fn outbound_card() -> Card {
        Card::new(
            CardId::new("card-1"),
            IssueId::new(42),
            ColumnKey::new("toTweet"),
            true,
        )
    }

    #[test]
    fn test_content_plain_post() {
        let content = CardContent::from_issue(&issue("  Hello world  \n"));
        assert_eq!(
            content,
            CardContent::Post {
                text: "Hello world".to_string()
            }
        );
        assert!(!content.is_reply());
        assert!(!content.is_retweet());
    }

    #[test]
    fn test_content_reply() {
        let content = CardContent::from_issue(&issue("reply-to: 1234\nThanks!"));
        assert_eq!(
            content,
            CardContent::Reply {
                text: "Thanks!".to_string(),
                reply_to: "1234".to_string()
            }
        );
    }

    #[test]
    fn test_content_retweet_wins() {
        let content = CardContent::from_issue(&issue("Some words\nRetweet: 987\nreply-to: 1"));
        assert_eq!(
            content,
            CardContent::Retweet {
                target: "987".to_string()
            }
        );
    }

    #[test]
    fn test_content_validation() {
        assert!(CardContent::from_issue(&issue("ok")).validate().is_ok());
        assert!(CardContent::from_issue(&issue("   ")).validate().is_err());
        assert!(CardContent::from_issue(&issue("retweet:")).validate().is_err());
        assert!(CardContent::from_issue(&issue("reply-to:\ntext"))
            .validate()
            .is_err());

        let long = "a".repeat(MAX_POST_LENGTH + 1);
        let err = CardContent::from_issue(&issue(&long)).validate().unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));

        let exact = "é".repeat(MAX_POST_LENGTH);
        assert!(CardContent::from_issue(&issue(&exact)).validate().is_ok());
    }

    #[test]
    fn test_card_without_content_is_invalid() {
        let card = outbound_card();
        assert!(!card.check_validity());
        assert!(!card.can_tweet());
    }

    #[test]
    fn test_refresh_updates_validity() {
        let card = outbound_card();
        assert!(card.refresh(&issue("Hello")));
        assert!(card.can_tweet());

        assert!(!card.refresh(&issue("")));
        assert!(!card.can_tweet());
    }

    #[test]
    fn test_can_tweet_requires_outbound_column() {
        let card = Card::new(
            CardId::new("card-2"),
            IssueId::new(1),
            ColumnKey::new("ideas"),
            false,
        );
        card.refresh(&issue("Hello"));
        assert!(!card.can_tweet());

        card.place(ColumnKey::new("toTweet"), true);
        assert!(card.can_tweet());
        assert_eq!(card.column(), ColumnKey::new("toTweet"));
    }

    #[test]
    fn test_begin_publish_claims_once() {
        let card = outbound_card();
        card.refresh(&issue("Hello"));

        assert!(card.begin_publish().is_some());
        assert_eq!(card.publish_state(), PublishState::Publishing);
        assert!(card.begin_publish().is_none());
        assert!(!card.can_tweet());
    }

    #[test]
    fn test_abort_publish_restores_eligibility() {
        let card = outbound_card();
        card.refresh(&issue("Hello"));
        card.begin_publish();
        card.abort_publish();

        assert_eq!(card.publish_state(), PublishState::Eligible);
        assert!(card.can_tweet());
    }

    #[test]
    fn test_mark_published_is_final() {
        let card = outbound_card();
        card.refresh(&issue("Hello"));
        card.begin_publish();

        assert!(card.mark_published("https://example.invalid/1"));
        assert!(!card.mark_published("https://example.invalid/2"));
        assert_eq!(
            card.published_url().as_deref(),
            Some("https://example.invalid/1")
        );

        card.abort_publish();
        assert!(card.begin_publish().is_none());
    }

    #[test]
    fn test_from_note_restores_published_state() {
        let card = Card::from_note(
            CardId::new("card-3"),
            IssueId::new(5),
            Some("Published: https://example.invalid/5"),
            ColumnKey::new("toTweet"),
            true,
        );
        card.refresh(&issue("Hello"));

        assert_eq!(
            card.published_url().as_deref(),
            Some("https://example.invalid/5")
        );
        assert!(!card.can_tweet());
    }
}
