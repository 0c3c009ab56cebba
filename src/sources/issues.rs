use crate::{
    board::{Board, Column},
    domain::{Card, Issue, IssueEvent, IssueId},
    error::Result,
    provider::IssueTracker,
    sources::SourceHandle,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::{
    sync::{broadcast, broadcast::error::RecvError, mpsc},
    task::JoinSet,
};
use tracing::{debug, error, info, warn};

type Lane = mpsc::UnboundedSender<IssueEvent>;

/// Mirrors the issue lifecycle into card placement on the board.
///
/// Live events are queued per issue. Events for one issue run in delivery
/// order while different issues proceed concurrently, and a lane is retired
/// as soon as its queue runs dry.
pub struct IssueSyncSource {
    board: Arc<Board>,
    tracker: Arc<dyn IssueTracker>,
    lanes: Mutex<HashMap<IssueId, Lane>>,
}

impl IssueSyncSource {
    pub fn new(board: Arc<Board>, tracker: Arc<dyn IssueTracker>) -> Self {
        Self {
            board,
            tracker,
            lanes: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes to the tracker, replays the backlog and then handles live
    /// events until stopped
    pub fn start(self: Arc<Self>) -> SourceHandle {
        let events = self.tracker.subscribe();
        let task = tokio::spawn(async move { self.run(events).await });
        SourceHandle::new("issues", task)
    }

    /// Number of issues with events queued or in progress
    pub fn active_lanes(&self) -> usize {
        self.lanes().len()
    }

    fn lanes(&self) -> MutexGuard<'_, HashMap<IssueId, Lane>> {
        self.lanes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn run(self: Arc<Self>, mut events: broadcast::Receiver<IssueEvent>) {
        self.reconcile().await;

        let mut workers = JoinSet::new();
        loop {
            match events.recv().await {
                Ok(event) => self.dispatch(&mut workers, event),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "issue events dropped, reconciling");
                    self.reconcile().await;
                }
                Err(RecvError::Closed) => break,
            }
            while workers.try_join_next().is_some() {}
        }

        while workers.join_next().await.is_some() {}
    }

    fn dispatch(self: &Arc<Self>, workers: &mut JoinSet<()>, event: IssueEvent) {
        let id = event.issue().id;
        let mut lanes = self.lanes();
        let event = match lanes.get(&id) {
            Some(lane) => match lane.send(event) {
                Ok(()) => return,
                Err(mpsc::error::SendError(event)) => event,
            },
            None => event,
        };

        let (sender, receiver) = mpsc::unbounded_channel();
        let _ = sender.send(event);
        lanes.insert(id, sender);
        drop(lanes);

        let source = Arc::clone(self);
        workers.spawn(async move { source.drain_lane(id, receiver).await });
    }

    /// Handles the queued events of one issue. The lane is removed under the
    /// lanes lock once its queue is empty, so `dispatch` either reaches this
    /// worker or starts a new one.
    async fn drain_lane(&self, id: IssueId, mut receiver: mpsc::UnboundedReceiver<IssueEvent>) {
        loop {
            let event = match receiver.try_recv() {
                Ok(event) => event,
                Err(_) => {
                    let mut lanes = self.lanes();
                    match receiver.try_recv() {
                        Ok(event) => event,
                        Err(_) => {
                            lanes.remove(&id);
                            return;
                        }
                    }
                }
            };
            self.handle_logged(&event).await;
        }
    }

    async fn handle_logged(&self, event: &IssueEvent) {
        if let Err(err) = self.handle_event(event).await {
            warn!(
                issue = %event.issue().id,
                event = event.kind(),
                error = %err,
                "failed to handle issue event"
            );
        }
    }

    /// Applies one tracker event to the board
    pub async fn handle_event(&self, event: &IssueEvent) -> Result<()> {
        match event {
            IssueEvent::Opened(issue) => {
                self.sync_all().await?;
                self.add_issue(issue, self.tracker.is_first_run(), false)
                    .await?;
            }
            IssueEvent::Updated(issue) => {
                let Some(card) = self.managed_card(issue.id).await? else {
                    debug!(issue = %issue.id, "updated issue has no managed card");
                    return Ok(());
                };
                let valid = self.board.refresh_card(&card, issue);
                debug!(issue = %issue.id, valid, "refreshed card");
            }
            IssueEvent::Closed(issue) => {
                if let Some(card) = self.managed_card(issue.id).await? {
                    self.board.remove_card(&card).await?;
                    info!(issue = %issue.id, "removed card of closed issue");
                }
            }
        }
        Ok(())
    }

    /// Replays open issues with `first_run` set, then removes cards of issues
    /// closed while nobody was listening
    pub async fn reconcile(&self) {
        if let Err(err) = self.sync_all().await {
            warn!(error = %err, "failed to sync cards before reconciling");
        }

        match self.tracker.open_issues().await {
            Ok(issues) => {
                for issue in &issues {
                    if let Err(err) = self.add_issue(issue, true, false).await {
                        warn!(issue = %issue.id, error = %err, "failed to load open issue");
                    }
                }
                debug!(count = issues.len(), "loaded open issues");
            }
            Err(err) => error!(error = %err, "failed to list open issues"),
        }

        match self.tracker.closed_issues().await {
            Ok(issues) => {
                for issue in &issues {
                    if let Err(err) = self.reconcile_closed(issue).await {
                        warn!(issue = %issue.id, error = %err, "failed to reconcile closed issue");
                    }
                }
            }
            Err(err) => error!(error = %err, "failed to list closed issues"),
        }

        self.board.notify_updated();
    }

    async fn reconcile_closed(&self, issue: &Issue) -> Result<bool> {
        let Some(card) = self.add_issue(issue, true, true).await? else {
            return Ok(false);
        };
        if !self.board.config().is_managed(&card.column()) {
            return Ok(false);
        }
        self.board.remove_card(&card).await?;
        info!(issue = %issue.id, "removed card of issue closed while offline");
        Ok(true)
    }

    /// Refreshes the card wherever it already is, or places a new one in the
    /// target column. Closed issues never get a new card.
    async fn add_issue(
        &self,
        issue: &Issue,
        first_run: bool,
        is_closed: bool,
    ) -> Result<Option<Arc<Card>>> {
        let columns = self.board.columns().await;
        for column in columns.values() {
            if column.has_issue(issue.id).await? {
                return self.board.add_card(issue, column, first_run).await.map(Some);
            }
        }
        if is_closed {
            return Ok(None);
        }
        let target = self.board.target_column().await?;
        self.board.add_card(issue, &target, first_run).await.map(Some)
    }

    async fn sync_all(&self) -> Result<()> {
        let columns: Vec<_> = self.board.columns().await.into_values().collect();
        self.board.sync_cards(&columns).await
    }

    async fn managed_column(&self, issue: IssueId) -> Result<Option<Arc<Column>>> {
        let managed = self.board.managed_columns().await;
        self.board.sync_cards(&managed).await?;
        for column in managed {
            if column.has_issue(issue).await? {
                return Ok(Some(column));
            }
        }
        Ok(None)
    }

    async fn managed_card(&self, issue: IssueId) -> Result<Option<Arc<Card>>> {
        match self.managed_column(issue).await? {
            Some(column) => column.get_card(issue).await,
            None => Ok(None),
        }
    }
}
