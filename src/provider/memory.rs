//! In-memory collaborators for tests and dry runs.

use crate::{
    domain::{
        BoardId, CardId, ColumnId, ColumnPosition, Issue, IssueEvent, IssueId, RemoteBoard,
        RemoteCard, RemoteColumn,
    },
    error::{Result, SyncError},
    provider::{BoardProvider, IssueTracker, Publisher},
};
use async_trait::async_trait;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug)]
struct StoredBoard {
    owner: String,
    repo: String,
    board: RemoteBoard,
    columns: Vec<RemoteColumn>,
}

#[derive(Debug, Default)]
struct ProviderState {
    boards: Vec<StoredBoard>,
    cards: HashMap<ColumnId, Vec<RemoteCard>>,
    failing: HashSet<String>,
    calls: HashMap<String, usize>,
}

impl ProviderState {
    fn record(&mut self, operation: &str) -> Result<()> {
        *self.calls.entry(operation.to_string()).or_default() += 1;
        if self.failing.contains(operation) {
            return Err(SyncError::provider(operation, "injected failure"));
        }
        Ok(())
    }

    fn board_mut(&mut self, id: &BoardId) -> Result<&mut StoredBoard> {
        self.boards
            .iter_mut()
            .find(|stored| &stored.board.id == id)
            .ok_or_else(|| SyncError::provider("board", format!("no board {id}")))
    }

    fn board_of_column(&mut self, column: &ColumnId) -> Result<&mut StoredBoard> {
        self.boards
            .iter_mut()
            .find(|stored| stored.columns.iter().any(|c| &c.id == column))
            .ok_or_else(|| SyncError::provider("column", format!("no column {column}")))
    }

    fn take_card(&mut self, card: &CardId) -> Result<(ColumnId, RemoteCard)> {
        for (column, cards) in self.cards.iter_mut() {
            if let Some(pos) = cards.iter().position(|c| &c.id == card) {
                return Ok((column.clone(), cards.remove(pos)));
            }
        }
        Err(SyncError::provider("card", format!("no card {card}")))
    }
}

/// Board provider keeping boards, columns and cards in memory.
///
/// Every call is counted per operation name and any operation can be made to
/// fail with [`InMemoryBoardProvider::fail`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryBoardProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl InMemoryBoardProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_id(prefix: &str) -> String {
        format!("{prefix}-{}", Uuid::new_v4().simple())
    }

    /// Seeds a board without counting a call
    pub fn seed_board(&self, owner: &str, repo: &str, name: &str) -> BoardId {
        let board = RemoteBoard {
            id: BoardId::new(Self::next_id("board")),
            name: name.to_string(),
        };
        let id = board.id.clone();
        self.lock().boards.push(StoredBoard {
            owner: owner.to_string(),
            repo: repo.to_string(),
            board,
            columns: Vec::new(),
        });
        id
    }

    /// Seeds a column at the end of a board without counting a call
    pub fn seed_column(&self, board: &BoardId, name: &str) -> Result<ColumnId> {
        let column = RemoteColumn {
            id: ColumnId::new(Self::next_id("column")),
            name: name.to_string(),
        };
        let id = column.id.clone();
        self.lock().board_mut(board)?.columns.push(column);
        Ok(id)
    }

    /// Seeds a card without counting a call
    pub fn seed_card(&self, column: &ColumnId, issue: IssueId, note: Option<&str>) -> CardId {
        let card = RemoteCard {
            id: CardId::new(Self::next_id("card")),
            issue,
            note: note.map(str::to_string),
        };
        let id = card.id.clone();
        self.lock().cards.entry(column.clone()).or_default().push(card);
        id
    }

    /// Makes every later call of `operation` fail
    pub fn fail(&self, operation: &str) {
        self.lock().failing.insert(operation.to_string());
    }

    pub fn recover(&self, operation: &str) {
        self.lock().failing.remove(operation);
    }

    /// Number of calls made to `operation`
    pub fn calls(&self, operation: &str) -> usize {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    pub fn board_count(&self) -> usize {
        self.lock().boards.len()
    }

    /// Column names of the first board named `name`, in visual order
    pub fn column_names(&self, name: &str) -> Vec<String> {
        self.lock()
            .boards
            .iter()
            .find(|stored| stored.board.name == name)
            .map(|stored| stored.columns.iter().map(|c| c.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn cards_in(&self, column: &ColumnId) -> Vec<RemoteCard> {
        self.lock().cards.get(column).cloned().unwrap_or_default()
    }

    /// Total number of cards referencing `issue` on any column
    pub fn cards_for_issue(&self, issue: IssueId) -> usize {
        self.lock()
            .cards
            .values()
            .flatten()
            .filter(|card| card.issue == issue)
            .count()
    }
}

#[async_trait]
impl BoardProvider for InMemoryBoardProvider {
    async fn list_boards(&self, owner: &str, repo: &str) -> Result<Vec<RemoteBoard>> {
        let mut state = self.lock();
        state.record("list_boards")?;
        Ok(state
            .boards
            .iter()
            .filter(|stored| stored.owner == owner && stored.repo == repo)
            .map(|stored| stored.board.clone())
            .collect())
    }

    async fn create_board(
        &self,
        owner: &str,
        repo: &str,
        name: &str,
        _body: &str,
    ) -> Result<RemoteBoard> {
        self.lock().record("create_board")?;
        let id = self.seed_board(owner, repo, name);
        Ok(RemoteBoard {
            id,
            name: name.to_string(),
        })
    }

    async fn list_columns(&self, board: &BoardId) -> Result<Vec<RemoteColumn>> {
        let mut state = self.lock();
        state.record("list_columns")?;
        Ok(state.board_mut(board)?.columns.clone())
    }

    async fn create_column(&self, board: &BoardId, name: &str) -> Result<RemoteColumn> {
        let mut state = self.lock();
        state.record("create_column")?;
        let stored = state.board_mut(board)?;
        if stored.columns.iter().any(|c| c.name == name) {
            return Err(SyncError::provider(
                "create_column",
                format!("column '{name}' already exists"),
            ));
        }
        let column = RemoteColumn {
            id: ColumnId::new(Self::next_id("column")),
            name: name.to_string(),
        };
        stored.columns.push(column.clone());
        Ok(column)
    }

    async fn move_column(&self, column: &ColumnId, position: &ColumnPosition) -> Result<()> {
        let mut state = self.lock();
        state.record("move_column")?;
        let stored = state.board_of_column(column)?;
        let from = stored
            .columns
            .iter()
            .position(|c| &c.id == column)
            .ok_or_else(|| SyncError::provider("move_column", format!("no column {column}")))?;
        let moved = stored.columns.remove(from);
        match position {
            ColumnPosition::First => stored.columns.insert(0, moved),
            ColumnPosition::Last => stored.columns.push(moved),
            ColumnPosition::After(anchor) => {
                match stored.columns.iter().position(|c| &c.id == anchor) {
                    Some(index) => stored.columns.insert(index + 1, moved),
                    None => {
                        stored.columns.insert(from, moved);
                        return Err(SyncError::provider(
                            "move_column",
                            format!("no anchor column {anchor}"),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    async fn list_cards(&self, column: &ColumnId) -> Result<Vec<RemoteCard>> {
        let mut state = self.lock();
        state.record("list_cards")?;
        Ok(state.cards.get(column).cloned().unwrap_or_default())
    }

    async fn create_card(&self, column: &ColumnId, issue: IssueId) -> Result<RemoteCard> {
        let mut state = self.lock();
        state.record("create_card")?;
        state.board_of_column(column)?;
        let card = RemoteCard {
            id: CardId::new(Self::next_id("card")),
            issue,
            note: None,
        };
        state.cards.entry(column.clone()).or_default().push(card.clone());
        Ok(card)
    }

    async fn move_card(&self, card: &CardId, column: &ColumnId) -> Result<()> {
        let mut state = self.lock();
        state.record("move_card")?;
        state.board_of_column(column)?;
        let (_, moved) = state.take_card(card)?;
        state.cards.entry(column.clone()).or_default().push(moved);
        Ok(())
    }

    async fn delete_card(&self, card: &CardId) -> Result<()> {
        let mut state = self.lock();
        state.record("delete_card")?;
        state.take_card(card)?;
        Ok(())
    }

    async fn annotate_card(&self, card: &CardId, note: &str) -> Result<()> {
        let mut state = self.lock();
        state.record("annotate_card")?;
        let stored = state
            .cards
            .values_mut()
            .flatten()
            .find(|c| &c.id == card)
            .ok_or_else(|| SyncError::provider("annotate_card", format!("no card {card}")))?;
        stored.note = Some(note.to_string());
        Ok(())
    }
}

/// A publish call seen by [`InMemoryPublisher`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishedItem {
    Post {
        text: String,
        reply_to: Option<String>,
    },
    Repost {
        target: String,
    },
}

#[derive(Debug, Default)]
struct PublisherState {
    published: Vec<PublishedItem>,
    failing: HashSet<String>,
}

/// Publisher recording every call and answering with sequential URLs
#[derive(Debug, Clone, Default)]
pub struct InMemoryPublisher {
    state: Arc<Mutex<PublisherState>>,
    delay: Option<Duration>,
}

impl InMemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call wait `delay` before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn lock(&self) -> MutexGuard<'_, PublisherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes posts of `text` (or reposts of target `text`) fail
    pub fn fail_on(&self, text: &str) {
        self.lock().failing.insert(text.to_string());
    }

    pub fn published(&self) -> Vec<PublishedItem> {
        self.lock().published.clone()
    }

    pub fn url_for(index: usize) -> String {
        format!("https://example.invalid/status/{index}")
    }

    async fn publish(&self, key: &str, item: PublishedItem) -> Result<String> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if state.failing.contains(key) {
            return Err(SyncError::Publish(format!("rejected '{key}'")));
        }
        state.published.push(item);
        Ok(Self::url_for(state.published.len()))
    }
}

#[async_trait]
impl Publisher for InMemoryPublisher {
    async fn post(&self, text: &str, reply_to: Option<&str>) -> Result<String> {
        let item = PublishedItem::Post {
            text: text.to_string(),
            reply_to: reply_to.map(str::to_string),
        };
        self.publish(text, item).await
    }

    async fn repost(&self, target: &str) -> Result<String> {
        let item = PublishedItem::Repost {
            target: target.to_string(),
        };
        self.publish(target, item).await
    }
}

/// Issue tracker whose issue lists and events are driven by the caller
#[derive(Debug, Clone)]
pub struct InMemoryIssueTracker {
    events: broadcast::Sender<IssueEvent>,
    open: Arc<Mutex<Vec<Issue>>>,
    closed: Arc<Mutex<Vec<Issue>>>,
    first_run: Arc<AtomicBool>,
}

impl Default for InMemoryIssueTracker {
    fn default() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            events,
            open: Arc::default(),
            closed: Arc::default(),
            first_run: Arc::default(),
        }
    }
}

impl InMemoryIssueTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_open(self, issues: impl IntoIterator<Item = Issue>) -> Self {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(issues);
        self
    }

    pub fn with_closed(self, issues: impl IntoIterator<Item = Issue>) -> Self {
        self.closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(issues);
        self
    }

    /// Lists `issue` as open without emitting an event
    pub fn add_open(&self, issue: Issue) {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(issue);
    }

    pub fn set_first_run(&self, first_run: bool) {
        self.first_run.store(first_run, Ordering::SeqCst);
    }

    /// Delivers an event to every subscriber. Returns the number of receivers.
    pub fn emit(&self, event: IssueEvent) -> usize {
        self.events.send(event).unwrap_or(0)
    }
}

#[async_trait]
impl IssueTracker for InMemoryIssueTracker {
    fn subscribe(&self) -> broadcast::Receiver<IssueEvent> {
        self.events.subscribe()
    }

    async fn open_issues(&self) -> Result<Vec<Issue>> {
        Ok(self.open.lock().unwrap_or_else(PoisonError::into_inner).clone())
    }

    async fn closed_issues(&self) -> Result<Vec<Issue>> {
        Ok(self
            .closed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn is_first_run(&self) -> bool {
        self.first_run.load(Ordering::SeqCst)
    }
}
