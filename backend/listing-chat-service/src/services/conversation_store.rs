use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{Conversation, InsertOutcome, NewConversation, ParticipantPair};
use crate::repository::{ConversationRepository, ListingDirectory};

/// Bounded number of insert/lookup rounds for one get-or-create
const MAX_CREATE_ATTEMPTS: usize = 3;

/// Owns conversation identity, participant pairing, per-participant
/// visibility and the activation flag.
#[derive(Clone)]
pub struct ConversationStore {
    repo: Arc<dyn ConversationRepository>,
    listings: Arc<dyn ListingDirectory>,
}

impl ConversationStore {
    pub fn new(repo: Arc<dyn ConversationRepository>, listings: Arc<dyn ListingDirectory>) -> Self {
        Self { repo, listings }
    }

    pub async fn listing_owner(&self, listing_id: Uuid) -> AppResult<Uuid> {
        self.listings
            .listing_owner(listing_id)
            .await?
            .ok_or(AppError::NotFound("listing"))
    }

    /// Idempotent lookup-or-insert keyed by listing and unordered pair.
    ///
    /// Concurrent first contact from both users yields a single row: the losing
    /// insert reports a conflict and is retried as a lookup.
    pub async fn get_or_create(
        &self,
        listing_id: Uuid,
        user_a: Uuid,
        user_b: Uuid,
    ) -> AppResult<Conversation> {
        let pair = ParticipantPair::new(user_a, user_b)?;
        let owner_id = self.listing_owner(listing_id).await?;
        if !pair.contains(owner_id) {
            return Err(AppError::BadRequest(
                "the listing owner must be one of the participants".into(),
            ));
        }

        for attempt in 1..=MAX_CREATE_ATTEMPTS {
            if let Some(existing) = self.repo.find_by_key(listing_id, pair).await? {
                return Ok(existing);
            }

            let new = NewConversation::new(listing_id, owner_id, pair);
            match self.repo.insert(&new).await? {
                InsertOutcome::Inserted(conversation) => {
                    metrics::record_conversation_event("created");
                    info!(
                        conversation_id = %conversation.id,
                        listing_id = %listing_id,
                        "conversation created"
                    );
                    return Ok(conversation);
                }
                InsertOutcome::Conflict => {
                    metrics::record_conversation_event("conflict_retry");
                    debug!(listing_id = %listing_id, attempt, "lost create race, retrying as lookup");
                }
            }
        }

        warn!(listing_id = %listing_id, "conversation neither found nor created");
        Err(AppError::Internal)
    }

    /// Conversation between `viewer` and the owner of `listing_id`
    pub async fn open_with_owner(&self, viewer: Uuid, listing_id: Uuid) -> AppResult<Conversation> {
        let owner_id = self.listing_owner(listing_id).await?;
        if owner_id == viewer {
            return Err(AppError::BadRequest(
                "cannot start a conversation about your own listing".into(),
            ));
        }
        self.get_or_create(listing_id, viewer, owner_id).await
    }

    pub async fn get(&self, conversation_id: Uuid) -> AppResult<Conversation> {
        self.repo
            .get(conversation_id)
            .await?
            .ok_or(AppError::NotFound("conversation"))
    }

    /// Load a conversation and check that `user_id` takes part in it
    pub async fn get_for_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> AppResult<Conversation> {
        let conversation = self.get(conversation_id).await?;
        if !conversation.is_participant(user_id) {
            return Err(AppError::Forbidden);
        }
        Ok(conversation)
    }

    /// Hide the conversation from one participant's inbox only
    pub async fn hide_for_participant(
        &self,
        conversation_id: Uuid,
        participant_id: Uuid,
    ) -> AppResult<()> {
        self.get_for_participant(conversation_id, participant_id)
            .await?;
        if self.repo.set_hidden(conversation_id, participant_id, true).await? {
            metrics::record_conversation_event("hidden");
            info!(
                conversation_id = %conversation_id,
                user_id = %participant_id,
                "conversation hidden for participant"
            );
        }
        Ok(())
    }

    /// Bring a hidden conversation back into `participant_id`'s inbox
    pub async fn resurface_for(&self, conversation_id: Uuid, participant_id: Uuid) -> AppResult<()> {
        if self
            .repo
            .set_hidden(conversation_id, participant_id, false)
            .await?
        {
            metrics::record_conversation_event("resurfaced");
            debug!(
                conversation_id = %conversation_id,
                user_id = %participant_id,
                "hidden conversation resurfaced by new message"
            );
        }
        Ok(())
    }

    pub async fn record_activity(&self, conversation_id: Uuid, at: DateTime<Utc>) -> AppResult<()> {
        self.repo.touch(conversation_id, at).await
    }

    /// Apply the one-way activation transition when the listing owner has
    /// sent into the conversation. Returns true only for the call that
    /// performed the transition.
    pub async fn activate_on_owner_send(
        &self,
        conversation: &Conversation,
        sender_id: Uuid,
    ) -> AppResult<bool> {
        if !conversation.is_listing_owner(sender_id) || conversation.is_activated() {
            return Ok(false);
        }
        let transitioned = self.repo.activate(conversation.id).await?;
        if transitioned {
            metrics::record_conversation_event("activated");
            info!(conversation_id = %conversation.id, "conversation activated by listing owner");
        }
        Ok(transitioned)
    }

    pub async fn visible_for(&self, user_id: Uuid, limit: i64) -> AppResult<Vec<Conversation>> {
        self.repo.list_visible_for(user_id, limit).await
    }

    pub async fn visible_ids_for(&self, user_id: Uuid) -> AppResult<Vec<Uuid>> {
        self.repo.visible_ids_for(user_id).await
    }

    pub async fn health_check(&self) -> AppResult<()> {
        self.repo.health_check().await
    }
}
