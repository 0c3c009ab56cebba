use crate::{
    board::{Board, BoardEvent},
    domain::{Card, CardContent},
    error::Result,
    provider::Publisher,
    sources::SourceHandle,
};
use futures::future::join_all;
use std::sync::Arc;
use tokio::{sync::broadcast::error::RecvError, task::JoinSet};
use tracing::{debug, info, warn};

/// Publishes every eligible card of the outbound column whenever the board
/// changes.
///
/// Triggers may overlap. Each card is claimed with a compare-and-set on its
/// publish state before the publish call, so a card is handed to the
/// publisher at most once no matter how many triggers observe it.
pub struct PublishSource {
    board: Arc<Board>,
    publisher: Arc<dyn Publisher>,
}

impl PublishSource {
    pub fn new(board: Arc<Board>, publisher: Arc<dyn Publisher>) -> Self {
        Self { board, publisher }
    }

    pub fn start(self: Arc<Self>) -> SourceHandle {
        let mut updates = self.board.subscribe();
        let task = tokio::spawn(async move {
            let mut triggers = JoinSet::new();
            loop {
                match updates.recv().await {
                    Ok(BoardEvent::Updated) | Err(RecvError::Lagged(_)) => {
                        let source = Arc::clone(&self);
                        triggers.spawn(async move {
                            source.publish_eligible().await;
                        });
                    }
                    Err(RecvError::Closed) => break,
                }
                while triggers.try_join_next().is_some() {}
            }
            while triggers.join_next().await.is_some() {}
        });
        SourceHandle::new("publish", task)
    }

    /// Publishes all eligible outbound cards concurrently. Returns how many
    /// were published.
    pub async fn publish_eligible(&self) -> usize {
        let outbound = match self.board.outbound_column().await {
            Ok(column) => column,
            Err(err) => {
                warn!(error = %err, "outbound column unavailable");
                return 0;
            }
        };
        if let Err(err) = self
            .board
            .sync_cards(std::slice::from_ref(&outbound))
            .await
        {
            warn!(column = %outbound.key(), error = %err, "failed to sync outbound cards");
            return 0;
        }
        let cards = match outbound.cards().await {
            Ok(cards) => cards,
            Err(err) => {
                warn!(column = %outbound.key(), error = %err, "failed to read outbound cards");
                return 0;
            }
        };

        let claimed: Vec<_> = cards
            .into_iter()
            .filter_map(|card| card.begin_publish().map(|content| (card, content)))
            .collect();
        if claimed.is_empty() {
            return 0;
        }
        debug!(count = claimed.len(), "publishing cards");

        join_all(
            claimed
                .into_iter()
                .map(|(card, content)| self.publish_card(card, content)),
        )
        .await
        .into_iter()
        .filter(|published| *published)
        .count()
    }

    async fn publish_card(&self, card: Arc<Card>, content: CardContent) -> bool {
        let url = match self.send(&content).await {
            Ok(url) => url,
            Err(err) => {
                card.abort_publish();
                warn!(issue = %card.issue(), error = %err, "publishing card failed");
                return false;
            }
        };

        if let Err(err) = self.board.card_tweeted(&card, &url).await {
            warn!(issue = %card.issue(), %url, error = %err, "failed to record published card");
        }
        info!(issue = %card.issue(), %url, "published card");
        true
    }

    async fn send(&self, content: &CardContent) -> Result<String> {
        match content {
            CardContent::Retweet { target } => self.publisher.repost(target).await,
            CardContent::Reply { text, reply_to } => {
                self.publisher.post(text, Some(reply_to.as_str())).await
            }
            CardContent::Post { text } => self.publisher.post(text, None).await,
        }
    }
}
