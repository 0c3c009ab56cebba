use crate::{
    domain::{
        BoardId, CardId, ColumnId, ColumnPosition, Issue, IssueEvent, IssueId, RemoteBoard,
        RemoteCard, RemoteColumn,
    },
    error::Result,
};
use async_trait::async_trait;
use tokio::sync::broadcast;

#[cfg(any(test, feature = "memory"))]
pub mod memory;

/// Raw column and card calls against the board provider.
///
/// Implementations report failures as [`SyncError::Provider`](crate::SyncError::Provider);
/// the core never retries them on its own.
#[async_trait]
pub trait BoardProvider: Send + Sync {
    /// Lists the boards of a repository
    async fn list_boards(&self, owner: &str, repo: &str) -> Result<Vec<RemoteBoard>>;

    /// Creates a board and returns it
    async fn create_board(&self, owner: &str, repo: &str, name: &str, body: &str)
        -> Result<RemoteBoard>;

    /// Lists the columns of a board in visual order
    async fn list_columns(&self, board: &BoardId) -> Result<Vec<RemoteColumn>>;

    /// Creates a column at the end of a board
    async fn create_column(&self, board: &BoardId, name: &str) -> Result<RemoteColumn>;

    /// Moves a column. `After` placement is advisory on some providers.
    async fn move_column(&self, column: &ColumnId, position: &ColumnPosition) -> Result<()>;

    /// Lists the cards of a column
    async fn list_cards(&self, column: &ColumnId) -> Result<Vec<RemoteCard>>;

    /// Creates a card referencing an issue
    async fn create_card(&self, column: &ColumnId, issue: IssueId) -> Result<RemoteCard>;

    /// Moves a card to another column
    async fn move_card(&self, card: &CardId, column: &ColumnId) -> Result<()>;

    /// Deletes a card
    async fn delete_card(&self, card: &CardId) -> Result<()>;

    /// Replaces the note attached to a card
    async fn annotate_card(&self, card: &CardId, note: &str) -> Result<()>;
}

/// Client performing the actual publish call
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `text`, optionally as a reply, and returns the resulting URL
    async fn post(&self, text: &str, reply_to: Option<&str>) -> Result<String>;

    /// Reposts `target` and returns the resulting URL
    async fn repost(&self, target: &str) -> Result<String>;
}

/// Issue tracker feeding the sync engine
#[async_trait]
pub trait IssueTracker: Send + Sync {
    /// Subscribes to lifecycle events in delivery order
    fn subscribe(&self) -> broadcast::Receiver<IssueEvent>;

    /// Currently open issues
    async fn open_issues(&self) -> Result<Vec<Issue>>;

    /// Recently closed issues
    async fn closed_issues(&self) -> Result<Vec<Issue>>;

    /// Whether `opened` events are still part of the initial load
    fn is_first_run(&self) -> bool {
        false
    }
}
