use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{BlockRelation, BlockStatus};
use crate::repository::BlockRepository;

/// Directional block relations between users.
///
/// A relation in either direction silences the pair: `is_blocked` is symmetric
/// even though `block`/`unblock` are not.
#[derive(Clone)]
pub struct BlockRegistry {
    repo: Arc<dyn BlockRepository>,
}

impl BlockRegistry {
    pub fn new(repo: Arc<dyn BlockRepository>) -> Self {
        Self { repo }
    }

    /// Idempotent; blocking twice is not an error
    pub async fn block(&self, blocker_id: Uuid, blocked_id: Uuid) -> AppResult<()> {
        if blocker_id == blocked_id {
            return Err(AppError::BadRequest("cannot block yourself".into()));
        }
        let created = self.repo.insert(blocker_id, blocked_id).await?;
        if created {
            info!(blocker_id = %blocker_id, blocked_id = %blocked_id, "user blocked");
        }
        Ok(())
    }

    pub async fn unblock(&self, blocker_id: Uuid, blocked_id: Uuid) -> AppResult<()> {
        if blocker_id == blocked_id {
            return Err(AppError::BadRequest("cannot unblock yourself".into()));
        }
        if self.repo.delete(blocker_id, blocked_id).await? {
            info!(blocker_id = %blocker_id, blocked_id = %blocked_id, "user unblocked");
        }
        Ok(())
    }

    /// True if a relation exists in either direction
    pub async fn is_blocked(&self, a: Uuid, b: Uuid) -> AppResult<bool> {
        if a == b {
            return Ok(false);
        }
        Ok(self.status(a, b).await?.is_blocked())
    }

    pub async fn status(&self, viewer: Uuid, target: Uuid) -> AppResult<BlockStatus> {
        self.repo.status_between(viewer, target).await
    }

    pub async fn blocked_by(&self, blocker_id: Uuid) -> AppResult<Vec<BlockRelation>> {
        self.repo.list_blocked_by(blocker_id).await
    }
}
