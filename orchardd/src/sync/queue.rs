use serde_json::json;

/// FUSE-synchronous work (a blocked `read`) outranks everything else.
pub const PRIORITY_FUSE: i64 = 10;
pub const PRIORITY_INTERACTIVE: i64 = 5;
pub const PRIORITY_BACKGROUND: i64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionType {
    Upload,
    Download,
    DownloadChunk,
    UpdateContent,
    Rename,
    Move,
    Delete,
    ListChildren,
    EnsureLatest,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Upload => "upload",
            ActionType::Download => "download",
            ActionType::DownloadChunk => "download_chunk",
            ActionType::UpdateContent => "update_content",
            ActionType::Rename => "rename",
            ActionType::Move => "move",
            ActionType::Delete => "delete",
            ActionType::ListChildren => "list_children",
            ActionType::EnsureLatest => "ensure_latest",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "upload" => Some(ActionType::Upload),
            "download" => Some(ActionType::Download),
            "download_chunk" => Some(ActionType::DownloadChunk),
            "update_content" => Some(ActionType::UpdateContent),
            "rename" => Some(ActionType::Rename),
            "move" => Some(ActionType::Move),
            "delete" => Some(ActionType::Delete),
            "list_children" => Some(ActionType::ListChildren),
            "ensure_latest" => Some(ActionType::EnsureLatest),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Push,
    Pull,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Push => "push",
            Direction::Pull => "pull",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "push" => Some(Direction::Push),
            "pull" => Some(Direction::Pull),
            _ => None,
        }
    }
}

/// Worker lanes: bulk transfers must not starve short metadata operations,
/// so a dedicated worker claims only the metadata set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Io,
    Meta,
}

impl Lane {
    pub fn matches(&self, action_type: ActionType) -> bool {
        match self {
            Lane::Io => matches!(
                action_type,
                ActionType::Upload
                    | ActionType::Download
                    | ActionType::DownloadChunk
                    | ActionType::UpdateContent
            ),
            Lane::Meta => matches!(
                action_type,
                ActionType::Rename
                    | ActionType::Move
                    | ActionType::Delete
                    | ActionType::ListChildren
                    | ActionType::EnsureLatest
            ),
        }
    }

    pub(crate) fn sql_set(&self) -> &'static str {
        match self {
            Lane::Io => "('upload', 'download', 'download_chunk', 'update_content')",
            Lane::Meta => "('rename', 'move', 'delete', 'list_children', 'ensure_latest')",
        }
    }
}

/// A queued intent, before it gets a row ID.
#[derive(Debug, Clone)]
pub struct NewAction {
    pub action_type: ActionType,
    pub target_id: String,
    pub destination: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub direction: Direction,
    pub priority: i64,
}

impl NewAction {
    pub fn upload(target_id: &str) -> Self {
        Self {
            action_type: ActionType::Upload,
            target_id: target_id.to_string(),
            destination: None,
            metadata: None,
            direction: Direction::Push,
            priority: PRIORITY_INTERACTIVE,
        }
    }

    pub fn update_content(target_id: &str) -> Self {
        Self {
            action_type: ActionType::UpdateContent,
            target_id: target_id.to_string(),
            destination: None,
            metadata: None,
            direction: Direction::Push,
            priority: PRIORITY_INTERACTIVE,
        }
    }

    pub fn download(target_id: &str, priority: i64) -> Self {
        Self {
            action_type: ActionType::Download,
            target_id: target_id.to_string(),
            destination: None,
            metadata: None,
            direction: Direction::Pull,
            priority,
        }
    }

    pub fn download_chunk(target_id: &str, chunk_index: i64, priority: i64) -> Self {
        Self {
            action_type: ActionType::DownloadChunk,
            target_id: target_id.to_string(),
            destination: None,
            metadata: Some(json!({ "chunk_index": chunk_index })),
            direction: Direction::Pull,
            priority,
        }
    }

    pub fn rename(target_id: &str, new_name: &str) -> Self {
        Self {
            action_type: ActionType::Rename,
            target_id: target_id.to_string(),
            destination: Some(new_name.to_string()),
            metadata: None,
            direction: Direction::Push,
            priority: PRIORITY_INTERACTIVE,
        }
    }

    pub fn move_to(target_id: &str, new_parent_id: &str) -> Self {
        Self {
            action_type: ActionType::Move,
            target_id: target_id.to_string(),
            destination: Some(new_parent_id.to_string()),
            metadata: None,
            direction: Direction::Push,
            priority: PRIORITY_INTERACTIVE,
        }
    }

    pub fn delete(target_id: &str, direction: Direction) -> Self {
        Self {
            action_type: ActionType::Delete,
            target_id: target_id.to_string(),
            destination: None,
            metadata: None,
            direction,
            priority: PRIORITY_INTERACTIVE,
        }
    }

    pub fn list_children(target_id: &str, priority: i64) -> Self {
        Self {
            action_type: ActionType::ListChildren,
            target_id: target_id.to_string(),
            destination: None,
            metadata: None,
            direction: Direction::Pull,
            priority,
        }
    }

    pub fn ensure_latest(target_id: &str, priority: i64) -> Self {
        Self {
            action_type: ActionType::EnsureLatest,
            target_id: target_id.to_string(),
            destination: None,
            metadata: None,
            direction: Direction::Pull,
            priority,
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }
}

/// Chunk index carried in a `download_chunk` action's metadata.
pub fn chunk_index_from_metadata(metadata: Option<&str>) -> Option<i64> {
    let raw = metadata?;
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    value.get("chunk_index")?.as_i64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lanes_partition_every_action_type() {
        let all = [
            ActionType::Upload,
            ActionType::Download,
            ActionType::DownloadChunk,
            ActionType::UpdateContent,
            ActionType::Rename,
            ActionType::Move,
            ActionType::Delete,
            ActionType::ListChildren,
            ActionType::EnsureLatest,
        ];
        for action_type in all {
            assert_ne!(
                Lane::Io.matches(action_type),
                Lane::Meta.matches(action_type),
                "{action_type:?} must belong to exactly one lane"
            );
        }
    }

    #[test]
    fn action_type_round_trips_through_strings() {
        for value in [
            "upload",
            "download",
            "download_chunk",
            "update_content",
            "rename",
            "move",
            "delete",
            "list_children",
            "ensure_latest",
        ] {
            let parsed = ActionType::parse(value).unwrap();
            assert_eq!(parsed.as_str(), value);
        }
        assert!(ActionType::parse("defragment").is_none());
    }

    #[test]
    fn chunk_metadata_round_trips() {
        let action = NewAction::download_chunk("file-1", 11, PRIORITY_FUSE);
        let raw = action.metadata.unwrap().to_string();
        assert_eq!(chunk_index_from_metadata(Some(&raw)), Some(11));
        assert_eq!(chunk_index_from_metadata(None), None);
    }
}
