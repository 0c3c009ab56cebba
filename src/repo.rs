//! Wires a board, the issue tracker and the publishing client together.

use crate::{
    board::Board,
    domain::BoardConfig,
    error::Result,
    provider::{BoardProvider, IssueTracker, Publisher},
    sources::{IssueSyncSource, PublishSource, SourceHandle},
};
use anyhow::Context;
use std::{path::Path, sync::Arc};
use tokio::task::JoinHandle;

pub struct Repo {
    board: Arc<Board>,
    issues: Arc<IssueSyncSource>,
    publish: Arc<PublishSource>,
}

impl Repo {
    pub fn new(
        config: BoardConfig,
        provider: Arc<dyn BoardProvider>,
        tracker: Arc<dyn IssueTracker>,
        publisher: Arc<dyn Publisher>,
    ) -> Result<Self> {
        let board = Arc::new(Board::new(provider, config)?);
        Ok(Self {
            issues: Arc::new(IssueSyncSource::new(Arc::clone(&board), tracker)),
            publish: Arc::new(PublishSource::new(Arc::clone(&board), publisher)),
            board,
        })
    }

    /// Builds a repo from a JSON board config file
    pub async fn from_config_file(
        path: impl AsRef<Path>,
        provider: Arc<dyn BoardProvider>,
        tracker: Arc<dyn IssueTracker>,
        publisher: Arc<dyn Publisher>,
    ) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let config = BoardConfig::load(path)
            .await
            .with_context(|| format!("failed to load board config from {}", path.display()))?;
        let repo = Self::new(config, provider, tracker, publisher)
            .context("failed to build board")?;
        Ok(repo)
    }

    pub fn board(&self) -> &Arc<Board> {
        &self.board
    }

    /// Starts board provisioning and both sources
    pub fn start(&self) -> RepoHandle {
        RepoHandle {
            setup: self.board.spawn_setup(),
            issues: Arc::clone(&self.issues).start(),
            publish: Arc::clone(&self.publish).start(),
        }
    }
}

#[derive(Debug)]
pub struct RepoHandle {
    setup: JoinHandle<()>,
    issues: SourceHandle,
    publish: SourceHandle,
}

impl RepoHandle {
    pub fn stop(self) {
        self.setup.abort();
        self.issues.stop();
        self.publish.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{ColumnKey, Issue, IssueEvent, IssueId},
        provider::memory::{InMemoryBoardProvider, InMemoryIssueTracker, InMemoryPublisher},
        sources::test_support::eventually,
    };
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_issue_flows_to_publication() {
        let provider = InMemoryBoardProvider::new();
        let tracker = InMemoryIssueTracker::new()
            .with_open([Issue::new(IssueId::new(1), "Launch").with_body("We launched!")]);
        let publisher = InMemoryPublisher::new();
        let repo = Repo::new(
            BoardConfig::new("octo", "queue"),
            Arc::new(provider.clone()),
            Arc::new(tracker.clone()),
            Arc::new(publisher.clone()),
        )
        .unwrap();

        let handle = repo.start();
        assert!(eventually(|| provider.cards_for_issue(IssueId::new(1)) == 1).await);
        assert!(publisher.published().is_empty());

        let board = repo.board();
        let ideas = board.target_column().await.unwrap();
        let card = ideas.get_card(IssueId::new(1)).await.unwrap().unwrap();
        let outbound = board.outbound_column().await.unwrap();
        board.move_card(&card, &outbound).await.unwrap();

        assert!(eventually(|| publisher.published().len() == 1).await);
        assert!(eventually(|| card.published_url().is_some()).await);

        tracker.emit(IssueEvent::Updated(
            Issue::new(IssueId::new(1), "Launch").with_body("We launched, again!"),
        ));
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        assert_eq!(publisher.published().len(), 1);
        assert_eq!(card.column(), ColumnKey::new("toTweet"));

        handle.stop();
    }

    #[tokio::test]
    async fn test_from_config_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("board.json");
        tokio::fs::write(&path, r#"{ "owner": "octo", "repo": "queue", "project_name": "Drafts" }"#)
            .await
            .unwrap();

        let repo = Repo::from_config_file(
            &path,
            Arc::new(InMemoryBoardProvider::new()),
            Arc::new(InMemoryIssueTracker::new()),
            Arc::new(InMemoryPublisher::new()),
        )
        .await
        .unwrap();
        assert_eq!(repo.board().config().project_name, "Drafts");

        let missing = temp_dir.path().join("missing.json");
        let err = Repo::from_config_file(
            &missing,
            Arc::new(InMemoryBoardProvider::new()),
            Arc::new(InMemoryIssueTracker::new()),
            Arc::new(InMemoryPublisher::new()),
        )
        .await
        .err()
        .unwrap();
        assert!(err.to_string().contains("failed to load board config"));
    }
}
