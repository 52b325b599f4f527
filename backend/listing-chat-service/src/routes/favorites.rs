use crate::{error::AppError, middleware::guards::User, state::AppState};
use actix_web::{post, web, HttpResponse};
use uuid::Uuid;

/// POST /listings/{id}/favorite
/// Sends a heart icebreaker to the listing owner unless the pair is blocked
#[post("/listings/{id}/favorite")]
pub async fn favorite_listing(
    state: web::Data<AppState>,
    user: User,
    listing_id: web::Path<Uuid>,
) -> Result<HttpResponse, AppError> {
    let outcome = state
        .chat
        .favorite_listing(user.id, listing_id.into_inner())
        .await?;
    Ok(HttpResponse::Ok().json(outcome))
}
