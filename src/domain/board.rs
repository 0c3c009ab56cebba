use crate::error::{Result, SyncError};
use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize};
use std::{collections::HashSet, fmt, path::Path, str::FromStr};
use tokio::fs;

/// Logical name of a managed column (e.g., `ideas`, `toTweet`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ColumnKey(String);

impl ColumnKey {
    pub const IDEAS: &'static str = "ideas";
    pub const REACTIONS: &'static str = "reactions";
    pub const EVENTS: &'static str = "events";
    pub const TO_TWEET: &'static str = "toTweet";
    pub const TWEETED: &'static str = "tweeted";

    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ColumnKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Placement rule for one logical column, as written in the configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum OrderRule {
    First,
    Last,
    After(ColumnKey),
}

impl FromStr for OrderRule {
    type Err = SyncError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "first" => Ok(Self::First),
            "last" => Ok(Self::Last),
            other => match other.strip_prefix("after:") {
                Some(key) if !key.trim().is_empty() => Ok(Self::After(ColumnKey::new(key.trim()))),
                _ => Err(SyncError::ConfigError(format!(
                    "Invalid column position '{s}'. Valid positions: first, last, after:<column>"
                ))),
            },
        }
    }
}

impl TryFrom<String> for OrderRule {
    type Error = SyncError;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<OrderRule> for String {
    fn from(rule: OrderRule) -> Self {
        rule.to_string()
    }
}

impl fmt::Display for OrderRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::First => write!(f, "first"),
            Self::Last => write!(f, "last"),
            Self::After(key) => write!(f, "after:{key}"),
        }
    }
}

/// One entry of the visual ordering table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnOrder {
    pub column: ColumnKey,
    pub position: OrderRule,
}

impl ColumnOrder {
    pub fn new(column: &str, position: OrderRule) -> Self {
        Self {
            column: ColumnKey::new(column),
            position,
        }
    }
}

/// Configuration for the synchronized board
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BoardConfig {
    pub owner: String,
    pub repo: String,
    pub project_name: String,
    pub project_body: String,
    /// Logical key to display name. Entries from a config file are merged
    /// over the defaults.
    #[serde(deserialize_with = "merge_default_columns")]
    pub columns: IndexMap<ColumnKey, String>,
    /// Applied in declaration order by `Board::arrange_columns`
    pub order: Vec<ColumnOrder>,
    /// Intake column for issues not yet on the board
    pub target: ColumnKey,
    /// Column whose cards get published
    pub outbound: ColumnKey,
    /// Columns left alone by the issue lifecycle
    pub unmanaged: Vec<ColumnKey>,
}

fn default_columns() -> IndexMap<ColumnKey, String> {
    [
        (ColumnKey::IDEAS, "Ideas"),
        (ColumnKey::REACTIONS, "Needs Reaction"),
        (ColumnKey::EVENTS, "Events"),
        (ColumnKey::TO_TWEET, "To Tweet"),
        (ColumnKey::TWEETED, "Tweeted"),
    ]
    .into_iter()
    .map(|(key, name)| (ColumnKey::new(key), name.to_string()))
    .collect()
}

fn default_order() -> Vec<ColumnOrder> {
    vec![
        ColumnOrder::new(ColumnKey::TO_TWEET, OrderRule::Last),
        ColumnOrder::new(ColumnKey::TWEETED, OrderRule::Last),
        ColumnOrder::new(ColumnKey::EVENTS, OrderRule::First),
        ColumnOrder::new(ColumnKey::REACTIONS, OrderRule::First),
        ColumnOrder::new(ColumnKey::IDEAS, OrderRule::First),
    ]
}

fn merge_default_columns<'de, D>(
    deserializer: D,
) -> std::result::Result<IndexMap<ColumnKey, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = IndexMap::<ColumnKey, String>::deserialize(deserializer)?;
    let mut columns = default_columns();
    columns.extend(overrides);
    Ok(columns)
}

impl Default for BoardConfig {
    fn default() -> Self {
        Self {
            owner: String::new(),
            repo: String::new(),
            project_name: "Content Queue".to_string(),
            project_body: "Twitter Content Queue".to_string(),
            columns: default_columns(),
            order: default_order(),
            target: ColumnKey::new(ColumnKey::IDEAS),
            outbound: ColumnKey::new(ColumnKey::TO_TWEET),
            unmanaged: vec![ColumnKey::new(ColumnKey::TWEETED)],
        }
    }
}

impl BoardConfig {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            ..Self::default()
        }
    }

    /// Reads a JSON config file
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).await?;
        let config: Self = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn display_name(&self, key: &ColumnKey) -> Option<&str> {
        self.columns.get(key).map(String::as_str)
    }

    /// Key of the column with the given display name
    pub fn key_for_name(&self, name: &str) -> Option<&ColumnKey> {
        self.columns
            .iter()
            .find(|(_, display)| display.as_str() == name)
            .map(|(key, _)| key)
    }

    pub fn is_managed(&self, key: &ColumnKey) -> bool {
        !self.unmanaged.contains(key)
    }

    /// Checks cross references between the configured keys
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for (key, name) in &self.columns {
            if name.trim().is_empty() {
                return Err(SyncError::ConfigError(format!("Column {key} has an empty name")));
            }
            if !names.insert(name.as_str()) {
                return Err(SyncError::ConfigError(format!(
                    "Column name '{name}' is used by more than one column"
                )));
            }
        }

        let known = |key: &ColumnKey, what: &str| {
            if self.columns.contains_key(key) {
                Ok(())
            } else {
                Err(SyncError::ConfigError(format!("{what} refers to unknown column {key}")))
            }
        };

        known(&self.target, "target")?;
        known(&self.outbound, "outbound")?;
        for key in &self.unmanaged {
            known(key, "unmanaged")?;
        }
        for entry in &self.order {
            known(&entry.column, "order")?;
            if let OrderRule::After(dependency) = &entry.position {
                known(dependency, "order")?;
                if dependency == &entry.column {
                    return Err(SyncError::ConfigError(format!(
                        "Column {} cannot be placed after itself",
                        entry.column
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = BoardConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.columns.len(), 5);
        assert_eq!(config.display_name(&ColumnKey::new("toTweet")), Some("To Tweet"));
        assert!(!config.is_managed(&ColumnKey::new("tweeted")));
        assert!(config.is_managed(&ColumnKey::new("ideas")));
    }

    #[test]
    fn test_order_rule_parsing() {
        assert_eq!("first".parse::<OrderRule>().unwrap(), OrderRule::First);
        assert_eq!("last".parse::<OrderRule>().unwrap(), OrderRule::Last);
        assert_eq!(
            "after:ideas".parse::<OrderRule>().unwrap(),
            OrderRule::After(ColumnKey::new("ideas"))
        );
        assert!("after:".parse::<OrderRule>().is_err());
        assert!("middle".parse::<OrderRule>().is_err());
        assert_eq!(OrderRule::After(ColumnKey::new("events")).to_string(), "after:events");
    }

    #[test]
    fn test_columns_merge_over_defaults() {
        let json = r#"{
        "owner": "octo",
        "repo": "queue",
        "columns": { "ideas": "Backlog", "drafts": "Drafts" },
        "order": [{ "column": "drafts", "position": "after:ideas" }]
    }"#;

        let config: BoardConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.columns.len(), 6);
        assert_eq!(config.display_name(&ColumnKey::new("ideas")), Some("Backlog"));
        assert_eq!(config.display_name(&ColumnKey::new("events")), Some("Events"));
        assert_eq!(config.key_for_name("Drafts"), Some(&ColumnKey::new("drafts")));
        assert_eq!(config.order.len(), 1);
        assert_eq!(config.target, ColumnKey::new("ideas"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_duplicate_names() {
        let mut config = BoardConfig::default();
        config
            .columns
            .insert(ColumnKey::new("reactions"), "Ideas".to_string());
        assert!(matches!(config.validate(), Err(SyncError::ConfigError(_))));
    }

    #[test]
    fn test_validate_rejects_unknown_references() {
        let mut config = BoardConfig::default();
        config.target = ColumnKey::new("inbox");
        assert!(config.validate().is_err());

        let mut config = BoardConfig::default();
        config.order.push(ColumnOrder::new(
            "ideas",
            OrderRule::After(ColumnKey::new("nowhere")),
        ));
        assert!(config.validate().is_err());

        let mut config = BoardConfig::default();
        config
            .order
            .push(ColumnOrder::new("ideas", OrderRule::After(ColumnKey::new("ideas"))));
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("board.json");
        tokio::fs::write(
            &path,
            r#"{ "owner": "octo", "repo": "queue", "project_name": "Tweets" }"#,
        )
        .await
        .unwrap();

        let config = BoardConfig::load(&path).await.unwrap();
        assert_eq!(config.owner, "octo");
        assert_eq!(config.project_name, "Tweets");
        assert_eq!(config.columns, default_columns());
    }

    #[tokio::test]
    async fn test_load_rejects_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("board.json");
        tokio::fs::write(&path, r#"{ "outbound": "nowhere" }"#)
            .await
            .unwrap();

        assert!(matches!(
            BoardConfig::load(&path).await,
            Err(SyncError::ConfigError(_))
        ));

        let missing = temp_dir.path().join("missing.json");
        assert!(matches!(
            BoardConfig::load(&missing).await,
            Err(SyncError::IoError(_))
        ));
    }
}
