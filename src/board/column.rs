use crate::{
    domain::{
        card::published_url_from_note, BoardId, Card, CardId, ColumnId, ColumnKey,
        ColumnPosition, Issue, IssueId, RemoteColumn,
    },
    error::{Result, SyncError},
    provider::BoardProvider,
};
use indexmap::IndexMap;
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct CardSet {
    warmed: bool,
    cards: IndexMap<IssueId, Arc<Card>>,
}

/// One provider-side column and the cards it holds.
///
/// The card set is fetched from the provider on first use and kept in
/// insertion order afterwards. [`Column::sync`] re-reads it to pick up cards
/// moved, added or deleted on the provider. Every mutation goes to the
/// provider first and only touches the local set once the call succeeded.
pub struct Column {
    id: ColumnId,
    key: ColumnKey,
    name: String,
    outbound: bool,
    provider: Arc<dyn BoardProvider>,
    cards: Mutex<CardSet>,
}

impl std::fmt::Debug for Column {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Column")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Column {
    /// Wraps an existing provider column. Cards are loaded lazily.
    pub fn new(
        provider: Arc<dyn BoardProvider>,
        remote: RemoteColumn,
        key: ColumnKey,
        outbound: bool,
    ) -> Self {
        Self {
            id: remote.id,
            key,
            name: remote.name,
            outbound,
            provider,
            cards: Mutex::new(CardSet::default()),
        }
    }

    /// Provisions a new provider column named `name`
    pub async fn create(
        provider: Arc<dyn BoardProvider>,
        board: &BoardId,
        key: ColumnKey,
        name: &str,
        outbound: bool,
    ) -> Result<Self> {
        let remote = provider.create_column(board, name).await?;
        debug!(column = %key, id = %remote.id, "created column");
        let column = Self::new(provider, remote, key, outbound);
        column.cards.lock().await.warmed = true;
        Ok(column)
    }

    pub fn id(&self) -> &ColumnId {
        &self.id
    }

    pub fn key(&self) -> &ColumnKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    async fn warm(&self) -> Result<MutexGuard<'_, CardSet>> {
        let mut set = self.cards.lock().await;
        if !set.warmed {
            let remote = self.provider.list_cards(&self.id).await?;
            for card in remote {
                if set.cards.contains_key(&card.issue) {
                    warn!(
                        column = %self.key,
                        issue = %card.issue,
                        card = %card.id,
                        "ignoring duplicate card"
                    );
                    continue;
                }
                let loaded = Card::from_note(
                    card.id,
                    card.issue,
                    card.note.as_deref(),
                    self.key.clone(),
                    self.outbound,
                );
                set.cards.insert(card.issue, Arc::new(loaded));
            }
            set.warmed = true;
            debug!(column = %self.key, cards = set.cards.len(), "loaded cards");
        }
        Ok(set)
    }

    pub async fn has_issue(&self, issue: IssueId) -> Result<bool> {
        Ok(self.warm().await?.cards.contains_key(&issue))
    }

    pub async fn get_card(&self, issue: IssueId) -> Result<Option<Arc<Card>>> {
        Ok(self.warm().await?.cards.get(&issue).cloned())
    }

    /// Snapshot of the cards in insertion order
    pub async fn cards(&self) -> Result<Vec<Arc<Card>>> {
        Ok(self.warm().await?.cards.values().cloned().collect())
    }

    /// Replaces the card set with the provider's current one.
    ///
    /// Card instances are kept for cards already held here or listed in
    /// `known`, so content and publish state survive a move between columns.
    /// Returns the cards taken over from another column together with the
    /// key of that column.
    pub(crate) async fn sync(
        &self,
        known: &HashMap<CardId, Arc<Card>>,
    ) -> Result<Vec<(ColumnKey, Arc<Card>)>> {
        let mut set = self.cards.lock().await;
        let remote = self.provider.list_cards(&self.id).await?;

        let mut cards = IndexMap::with_capacity(remote.len());
        let mut adopted = Vec::new();
        for card in remote {
            if cards.contains_key(&card.issue) {
                warn!(
                    column = %self.key,
                    issue = %card.issue,
                    card = %card.id,
                    "ignoring duplicate card"
                );
                continue;
            }
            let existing = set
                .cards
                .get(&card.issue)
                .filter(|held| held.id() == &card.id)
                .or_else(|| known.get(&card.id))
                .cloned();
            let synced = match existing {
                Some(existing) => {
                    let previous = existing.column();
                    if let Some(url) = published_url_from_note(card.note.as_deref()) {
                        existing.mark_published(url);
                    }
                    existing.place(self.key.clone(), self.outbound);
                    if previous != self.key {
                        adopted.push((previous, Arc::clone(&existing)));
                    }
                    existing
                }
                None => Arc::new(Card::from_note(
                    card.id,
                    card.issue,
                    card.note.as_deref(),
                    self.key.clone(),
                    self.outbound,
                )),
            };
            cards.insert(synced.issue(), synced);
        }

        let dropped = set.cards.keys().filter(|issue| !cards.contains_key(*issue)).count();
        set.cards = cards;
        set.warmed = true;
        debug!(column = %self.key, cards = set.cards.len(), dropped, "synced cards");
        Ok(adopted)
    }

    /// Forgets `card` locally if this column still holds that very instance
    pub(crate) async fn release(&self, card: &Arc<Card>) {
        let mut set = self.cards.lock().await;
        if set
            .cards
            .get(&card.issue())
            .is_some_and(|held| Arc::ptr_eq(held, card))
        {
            set.cards.shift_remove(&card.issue());
        }
    }

    /// Cards already loaded, without touching the provider
    pub(crate) async fn loaded_cards(&self) -> Vec<Arc<Card>> {
        self.cards.lock().await.cards.values().cloned().collect()
    }

    /// Repositions the column. A failed `after:` placement is only logged
    /// since providers do not reliably honour it.
    pub async fn move_to(&self, position: &ColumnPosition) -> Result<()> {
        match self.provider.move_column(&self.id, position).await {
            Ok(()) => {
                debug!(column = %self.key, %position, "moved column");
                Ok(())
            }
            Err(err) if matches!(position, ColumnPosition::After(_)) => {
                warn!(column = %self.key, %position, error = %err, "column placement ignored");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Deletes the card from the provider, then from this column
    pub async fn remove_card(&self, card: &Card) -> Result<()> {
        let mut set = self.warm().await?;
        if !set.cards.contains_key(&card.issue()) {
            return Err(SyncError::CardNotFound(card.issue()));
        }
        self.provider.delete_card(card.id()).await?;
        set.cards.shift_remove(&card.issue());
        debug!(column = %self.key, issue = %card.issue(), "removed card");
        Ok(())
    }

    /// Refreshes the card for `issue` or creates one on the provider
    pub(crate) async fn upsert(&self, issue: &Issue) -> Result<(Arc<Card>, bool)> {
        let mut set = self.warm().await?;
        if let Some(card) = set.cards.get(&issue.id) {
            card.refresh(issue);
            return Ok((card.clone(), false));
        }
        let remote = self.provider.create_card(&self.id, issue.id).await?;
        let card = Arc::new(Card::new(remote.id, issue.id, self.key.clone(), self.outbound));
        card.refresh(issue);
        set.cards.insert(issue.id, card.clone());
        debug!(column = %self.key, issue = %issue.id, "created card");
        Ok((card, true))
    }

    pub(crate) async fn attach(&self, card: Arc<Card>) -> Result<()> {
        let mut set = self.warm().await?;
        card.place(self.key.clone(), self.outbound);
        set.cards.insert(card.issue(), card);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{domain::CardId, provider::memory::InMemoryBoardProvider};

    fn setup() -> (InMemoryBoardProvider, BoardId) {
        let provider = InMemoryBoardProvider::new();
        let board = provider.seed_board("octo", "queue", "Queue");
        (provider, board)
    }

    fn wrap(provider: &InMemoryBoardProvider, id: ColumnId, key: &str) -> Column {
        Column::new(
            Arc::new(provider.clone()),
            RemoteColumn {
                id,
                name: key.to_string(),
            },
            ColumnKey::new(key),
            false,
        )
    }

    #[tokio::test]
    async fn test_create_starts_warm() {
        let (provider, board) = setup();
        let column = Column::create(
            Arc::new(provider.clone()),
            &board,
            ColumnKey::new("ideas"),
            "Ideas",
            false,
        )
        .await
        .unwrap();

        assert!(!column.has_issue(IssueId::new(1)).await.unwrap());
        assert_eq!(provider.calls("list_cards"), 0);
        assert_eq!(provider.column_names("Queue"), ["Ideas"]);
    }

    #[tokio::test]
    async fn test_lazy_load_happens_once() {
        let (provider, board) = setup();
        let id = provider.seed_column(&board, "Ideas").unwrap();
        provider.seed_card(&id, IssueId::new(4), None);
        provider.seed_card(&id, IssueId::new(2), None);
        let column = wrap(&provider, id, "ideas");

        assert!(column.has_issue(IssueId::new(4)).await.unwrap());
        assert!(column.get_card(IssueId::new(3)).await.unwrap().is_none());
        let issues: Vec<_> = column
            .cards()
            .await
            .unwrap()
            .iter()
            .map(|card| card.issue())
            .collect();
        assert_eq!(issues, [IssueId::new(4), IssueId::new(2)]);
        assert_eq!(provider.calls("list_cards"), 1);
    }

    #[tokio::test]
    async fn test_failed_load_is_retried() {
        let (provider, board) = setup();
        let id = provider.seed_column(&board, "Ideas").unwrap();
        provider.seed_card(&id, IssueId::new(1), None);
        let column = wrap(&provider, id, "ideas");

        provider.fail("list_cards");
        assert!(column.has_issue(IssueId::new(1)).await.is_err());

        provider.recover("list_cards");
        assert!(column.has_issue(IssueId::new(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_upsert_creates_then_refreshes() {
        let (provider, board) = setup();
        let id = provider.seed_column(&board, "Ideas").unwrap();
        let column = wrap(&provider, id.clone(), "ideas");
        let issue = Issue::new(IssueId::new(42), "Idea").with_body("First");

        let (card, created) = column.upsert(&issue).await.unwrap();
        assert!(created);
        assert!(card.is_valid());

        let (again, created) = column.upsert(&issue.clone().with_body("")).await.unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&card, &again));
        assert!(!again.is_valid());
        assert_eq!(provider.cards_in(&id).len(), 1);
    }

    #[tokio::test]
    async fn test_remove_card_keeps_state_on_failure() {
        let (provider, board) = setup();
        let id = provider.seed_column(&board, "Ideas").unwrap();
        provider.seed_card(&id, IssueId::new(7), None);
        let column = wrap(&provider, id.clone(), "ideas");
        let card = column.get_card(IssueId::new(7)).await.unwrap().unwrap();

        provider.fail("delete_card");
        assert!(matches!(
            column.remove_card(&card).await,
            Err(SyncError::Provider { .. })
        ));
        assert!(column.has_issue(IssueId::new(7)).await.unwrap());

        provider.recover("delete_card");
        column.remove_card(&card).await.unwrap();
        assert!(!column.has_issue(IssueId::new(7)).await.unwrap());
        assert!(provider.cards_in(&id).is_empty());
    }

    #[tokio::test]
    async fn test_remove_unknown_card() {
        let (provider, board) = setup();
        let id = provider.seed_column(&board, "Ideas").unwrap();
        let column = wrap(&provider, id, "ideas");
        let stranger = Card::new(
            CardId::new("card-x"),
            IssueId::new(9),
            ColumnKey::new("ideas"),
            false,
        );

        assert!(matches!(
            column.remove_card(&stranger).await,
            Err(SyncError::CardNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_after_placement_is_advisory() {
        let (provider, board) = setup();
        let id = provider.seed_column(&board, "Ideas").unwrap();
        let column = wrap(&provider, id, "ideas");

        let missing = ColumnPosition::After(ColumnId::new("gone"));
        assert!(column.move_to(&missing).await.is_ok());

        provider.fail("move_column");
        assert!(column.move_to(&ColumnPosition::First).await.is_err());
        assert!(column.move_to(&missing).await.is_ok());
    }
}
