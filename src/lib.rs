//! # Queueboard Core
//!
//! Keeps a kanban board in sync with the issues of a repository and
//! publishes the cards that reach the outbound column.
//!
//! The board itself is the source of truth: columns are provisioned
//! idempotently on the provider, cards mirror the issue lifecycle, and a card
//! is published at most once even when updates overlap. The issue tracker,
//! the board provider and the publishing client are collaborators behind the
//! traits in [`provider`].

pub mod board;
pub mod domain;
pub mod error;
pub mod provider;
pub mod repo;
pub mod sources;

// Re-export commonly used types
pub use board::{Board, BoardEvent, Column};
pub use domain::{
    BoardConfig, Card, CardContent, ColumnKey, Issue, IssueEvent, IssueId, PublishState,
};
pub use error::{Result, SyncError};
pub use provider::{BoardProvider, IssueTracker, Publisher};
pub use repo::{Repo, RepoHandle};
pub use sources::{IssueSyncSource, PublishSource, SourceHandle};
