pub mod board;
pub mod card;
pub mod issue;
pub mod remote;

pub use board::{BoardConfig, ColumnKey, ColumnOrder, OrderRule};
pub use card::{Card, CardContent, PublishState};
pub use issue::{Issue, IssueEvent, IssueId, IssueState};
pub use remote::{BoardId, CardId, ColumnId, ColumnPosition, RemoteBoard, RemoteCard, RemoteColumn};
