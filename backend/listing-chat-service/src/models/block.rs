use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// Directional "blocker blocks blocked" relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockRelation {
    pub blocker_id: Uuid,
    pub blocked_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Block state between a viewer and a target, seen from the viewer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
pub struct BlockStatus {
    /// viewer blocked target
    pub is_blocking: bool,
    /// target blocked viewer
    pub is_blocked_by: bool,
}

impl BlockStatus {
    /// Either direction silences the pair
    pub fn is_blocked(&self) -> bool {
        self.is_blocking || self.is_blocked_by
    }
}
