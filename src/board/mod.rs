//! The board engine: provisions the configured columns on the provider and
//! is the single authority for card placement.

use crate::{
    domain::{
        card::PUBLISHED_NOTE_PREFIX, BoardConfig, BoardId, Card, ColumnId, ColumnKey,
        ColumnPosition, Issue, OrderRule,
    },
    error::{Result, SyncError},
    provider::BoardProvider,
};
use indexmap::IndexMap;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
};
use tokio::{
    sync::{broadcast, watch, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

pub mod column;

pub use column::Column;

/// Notification emitted after any card-set mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardEvent {
    Updated,
}

pub struct Board {
    provider: Arc<dyn BoardProvider>,
    config: BoardConfig,
    id: Mutex<Option<BoardId>>,
    slots: RwLock<IndexMap<ColumnKey, Option<Arc<Column>>>>,
    arrange_pending: AtomicBool,
    placement: Mutex<()>,
    ready: watch::Sender<bool>,
    updates: broadcast::Sender<BoardEvent>,
}

impl std::fmt::Debug for Board {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Board")
            .field("project", &self.config.project_name)
            .field("ready", &*self.ready.borrow())
            .finish_non_exhaustive()
    }
}

impl Board {
    pub fn new(provider: Arc<dyn BoardProvider>, config: BoardConfig) -> Result<Self> {
        config.validate()?;
        let slots = config.columns.keys().map(|key| (key.clone(), None)).collect();
        let (ready, _) = watch::channel(false);
        let (updates, _) = broadcast::channel(64);
        Ok(Self {
            provider,
            config,
            id: Mutex::new(None),
            slots: RwLock::new(slots),
            arrange_pending: AtomicBool::new(false),
            placement: Mutex::new(()),
            ready,
            updates,
        })
    }

    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    /// Runs [`Board::setup`] in the background, logging a failure
    pub fn spawn_setup(self: &Arc<Self>) -> JoinHandle<()> {
        let board = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = board.setup().await {
                error!(project = %board.config.project_name, error = %err, "board setup failed");
            }
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.updates.subscribe()
    }

    /// Emits [`BoardEvent::Updated`]
    pub fn notify_updated(&self) {
        let _ = self.updates.send(BoardEvent::Updated);
    }

    fn read_slots(&self) -> RwLockReadGuard<'_, IndexMap<ColumnKey, Option<Arc<Column>>>> {
        self.slots.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_slots(&self) -> RwLockWriteGuard<'_, IndexMap<ColumnKey, Option<Arc<Column>>>> {
        self.slots.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn unresolved(&self) -> Vec<ColumnKey> {
        self.read_slots()
            .iter()
            .filter(|(_, column)| column.is_none())
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Whether every configured column has a Column instance
    pub fn all_resolved(&self) -> bool {
        self.read_slots().values().all(Option::is_some)
    }

    fn publish_readiness(&self) {
        if self.all_resolved() {
            self.ready.send_replace(true);
        }
    }

    /// Resolves the board id by name and memoizes it. Failures are not cached.
    pub async fn get_board_id(&self) -> Result<BoardId> {
        let mut id = self.id.lock().await;
        if let Some(id) = id.as_ref() {
            return Ok(id.clone());
        }
        let boards = self
            .provider
            .list_boards(&self.config.owner, &self.config.repo)
            .await?;
        let board = boards
            .into_iter()
            .find(|board| board.name == self.config.project_name)
            .ok_or_else(|| SyncError::BoardNotFound(self.config.project_name.clone()))?;
        debug!(project = %board.name, id = %board.id, "resolved board");
        *id = Some(board.id.clone());
        Ok(board.id)
    }

    pub async fn board_exists(&self) -> bool {
        match self.get_board_id().await {
            Ok(_) => true,
            Err(err) => {
                debug!(error = %err, "board lookup failed");
                false
            }
        }
    }

    /// Creates the board on the provider and remembers its id
    pub async fn create_board(&self) -> Result<BoardId> {
        let mut id = self.id.lock().await;
        let board = self
            .provider
            .create_board(
                &self.config.owner,
                &self.config.repo,
                &self.config.project_name,
                &self.config.project_body,
            )
            .await?;
        info!(project = %board.name, id = %board.id, "created board");
        *id = Some(board.id.clone());
        Ok(board.id)
    }

    /// Wires Column instances for configured columns that already exist on
    /// the provider and returns the keys that are still absent
    pub async fn missing_columns(&self) -> Result<Vec<ColumnKey>> {
        if self.unresolved().is_empty() {
            return Ok(Vec::new());
        }

        let board = self.get_board_id().await?;
        let live = self.provider.list_columns(&board).await?;

        let mut slots = self.write_slots();
        let mut missing = Vec::new();
        for (key, name) in &self.config.columns {
            if matches!(slots.get(key), Some(Some(_))) {
                continue;
            }
            match live.iter().find(|remote| &remote.name == name) {
                Some(remote) => {
                    let column = Column::new(
                        Arc::clone(&self.provider),
                        remote.clone(),
                        key.clone(),
                        key == &self.config.outbound,
                    );
                    slots.insert(key.clone(), Some(Arc::new(column)));
                }
                None => missing.push(key.clone()),
            }
        }
        drop(slots);

        self.publish_readiness();
        Ok(missing)
    }

    pub async fn columns_exist(&self) -> Result<bool> {
        Ok(self.missing_columns().await?.is_empty())
    }

    /// Board exists and every configured column is wired
    pub async fn ready(&self) -> bool {
        self.board_exists().await && self.columns_exist().await.unwrap_or(false)
    }

    /// Provisions the column for `key`. Returns the existing one if already wired.
    pub async fn create_column(&self, key: &ColumnKey) -> Result<Arc<Column>> {
        if let Some(column) = self.column(key) {
            return Ok(column);
        }
        let name = self
            .config
            .display_name(key)
            .ok_or_else(|| SyncError::ColumnNotFound(key.clone()))?;
        let board = self.get_board_id().await?;
        let column = Column::create(
            Arc::clone(&self.provider),
            &board,
            key.clone(),
            name,
            key == &self.config.outbound,
        )
        .await?;
        let column = Arc::new(column);
        self.write_slots().insert(key.clone(), Some(Arc::clone(&column)));
        self.arrange_pending.store(true, Ordering::SeqCst);
        self.publish_readiness();
        info!(column = %key, name, "created column");
        Ok(column)
    }

    /// Moves every wired column according to the ordering table, in
    /// declaration order
    pub async fn arrange_columns(&self) -> Result<()> {
        for entry in &self.config.order {
            let Some(column) = self.column(&entry.column) else {
                continue;
            };
            let position = match &entry.position {
                OrderRule::First => ColumnPosition::First,
                OrderRule::Last => ColumnPosition::Last,
                OrderRule::After(dependency) => match self.column(dependency) {
                    Some(anchor) => ColumnPosition::After(anchor.id().clone()),
                    None => {
                        warn!(
                            column = %entry.column,
                            after = %dependency,
                            "anchor column not provisioned"
                        );
                        continue;
                    }
                },
            };
            column.move_to(&position).await?;
        }
        self.arrange_pending.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Creates the board if absent, provisions missing columns and arranges
    /// them when anything was created. Each step re-reads provider state, so
    /// an interrupted run is resumed by calling this again.
    pub async fn setup(&self) -> Result<()> {
        match self.get_board_id().await {
            Ok(_) => {}
            Err(SyncError::BoardNotFound(_)) => {
                self.create_board().await?;
            }
            Err(err) => return Err(err),
        }

        let missing = self.missing_columns().await?;
        for key in &missing {
            self.create_column(key).await?;
        }

        if self.arrange_pending.load(Ordering::SeqCst) {
            self.arrange_columns().await?;
        }

        self.publish_readiness();
        info!(project = %self.config.project_name, created = missing.len(), "board ready");
        Ok(())
    }

    /// The column for `key` if it is wired already
    pub fn column(&self, key: &ColumnKey) -> Option<Arc<Column>> {
        self.read_slots().get(key).cloned().flatten()
    }

    fn resolved_columns(&self) -> IndexMap<ColumnKey, Arc<Column>> {
        self.read_slots()
            .iter()
            .filter_map(|(key, column)| column.clone().map(|column| (key.clone(), column)))
            .collect()
    }

    /// Waits until setup wired every configured column
    pub async fn wait_ready(&self) {
        let mut ready = self.ready.subscribe();
        // The sender lives as long as `self`, so this only returns once ready.
        let _ = ready.wait_for(|ready| *ready).await;
    }

    /// All columns by logical key, once setup populated them
    pub async fn columns(&self) -> IndexMap<ColumnKey, Arc<Column>> {
        self.wait_ready().await;
        self.resolved_columns()
    }

    /// Provider ids by logical key, once setup populated them
    pub async fn column_ids(&self) -> IndexMap<ColumnKey, ColumnId> {
        self.columns()
            .await
            .into_iter()
            .map(|(key, column)| (key, column.id().clone()))
            .collect()
    }

    async fn wired(&self, key: &ColumnKey) -> Result<Arc<Column>> {
        self.columns()
            .await
            .swap_remove(key)
            .ok_or_else(|| SyncError::ColumnNotFound(key.clone()))
    }

    pub async fn outbound_column(&self) -> Result<Arc<Column>> {
        self.wired(&self.config.outbound).await
    }

    pub async fn target_column(&self) -> Result<Arc<Column>> {
        self.wired(&self.config.target).await
    }

    /// Columns whose cards follow the issue lifecycle
    pub async fn managed_columns(&self) -> Vec<Arc<Column>> {
        self.columns()
            .await
            .into_iter()
            .filter(|(key, _)| self.config.is_managed(key))
            .map(|(_, column)| column)
            .collect()
    }

    /// Creates or refreshes the card for `issue`.
    ///
    /// If another column already holds a card for the issue, that card is
    /// refreshed in place instead, so an issue never has two cards. With
    /// `first_run` set no update is emitted.
    pub async fn add_card(
        &self,
        issue: &Issue,
        column: &Column,
        first_run: bool,
    ) -> Result<Arc<Card>> {
        let _placement = self.placement.lock().await;

        let mut home = None;
        for other in self.resolved_columns().into_values() {
            if other.id() != column.id() && other.has_issue(issue.id).await? {
                home = Some(other);
                break;
            }
        }

        let (card, created) = match &home {
            Some(other) => other.upsert(issue).await?,
            None => column.upsert(issue).await?,
        };
        debug!(issue = %issue.id, column = %card.column(), created, first_run, "placed card");

        if !first_run {
            self.notify_updated();
        }
        Ok(card)
    }

    /// Moves a card to another column on the provider and locally
    pub async fn move_card(&self, card: &Arc<Card>, to: &Column) -> Result<()> {
        let _placement = self.placement.lock().await;

        let from_key = card.column();
        let from = self
            .column(&from_key)
            .ok_or_else(|| SyncError::ColumnNotFound(from_key.clone()))?;
        if from.id() == to.id() {
            return Ok(());
        }

        // Load the target before the provider move so a failed load leaves
        // the card where it is on both sides.
        to.has_issue(card.issue()).await?;
        self.provider.move_card(card.id(), to.id()).await?;
        to.attach(Arc::clone(card)).await?;
        from.release(card).await;
        debug!(issue = %card.issue(), from = %from_key, to = %to.key(), "moved card");

        self.notify_updated();
        Ok(())
    }

    /// Deletes a card from whichever column holds it
    pub async fn remove_card(&self, card: &Card) -> Result<()> {
        let _placement = self.placement.lock().await;

        let key = card.column();
        let column = self
            .column(&key)
            .ok_or_else(|| SyncError::ColumnNotFound(key.clone()))?;
        column.remove_card(card).await?;

        self.notify_updated();
        Ok(())
    }

    /// Re-reads the card sets of `columns` from the provider.
    ///
    /// A card moved on the provider keeps its instance, together with its
    /// content and publish state, and is dropped from the column that held it
    /// before.
    pub async fn sync_cards(&self, columns: &[Arc<Column>]) -> Result<()> {
        let _placement = self.placement.lock().await;

        let resolved = self.resolved_columns();
        let mut known = HashMap::new();
        for column in resolved.values() {
            for card in column.loaded_cards().await {
                known.insert(card.id().clone(), card);
            }
        }

        for column in columns {
            for (previous, card) in column.sync(&known).await? {
                if let Some(previous) = resolved.get(&previous) {
                    if previous.id() != column.id() {
                        previous.release(&card).await;
                    }
                }
                debug!(issue = %card.issue(), column = %column.key(), "card moved on provider");
            }
        }
        Ok(())
    }

    /// Re-derives a card's content from the issue. Returns its validity.
    pub fn refresh_card(&self, card: &Card, issue: &Issue) -> bool {
        let valid = card.refresh(issue);
        self.notify_updated();
        valid
    }

    /// Marks a card published and records the URL on the provider card.
    ///
    /// The local flag is set before the provider call, so a failed
    /// annotation never makes the card eligible again.
    pub async fn card_tweeted(&self, card: &Card, url: &str) -> Result<()> {
        if !card.mark_published(url) {
            debug!(issue = %card.issue(), "card already published");
            return Ok(());
        }
        info!(issue = %card.issue(), url, "card published");

        let note = format!("{PUBLISHED_NOTE_PREFIX}{url}");
        let annotated = self.provider.annotate_card(card.id(), &note).await;
        self.notify_updated();
        annotated
    }
}
