//! Prometheus metrics for the messaging engine

use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter_vec, register_int_gauge, Encoder, IntCounterVec, IntGauge, TextEncoder,
};

static MESSAGES_APPENDED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "listing_chat_messages_appended_total",
        "Messages appended to conversation logs",
        &["kind"]
    )
    .expect("Failed to register messages appended metric")
});

static SEND_REJECTIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "listing_chat_send_rejections_total",
        "Append attempts rejected before persisting",
        &["reason"]
    )
    .expect("Failed to register send rejections metric")
});

static CONVERSATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "listing_chat_conversation_events_total",
        "Conversation lifecycle events",
        &["event"]
    )
    .expect("Failed to register conversation events metric")
});

static NOTIFICATIONS: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "listing_chat_notifications_total",
        "Notification events handed to sinks",
        &["event", "result"]
    )
    .expect("Failed to register notifications metric")
});

static ACTIVE_SUBSCRIPTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "listing_chat_active_subscriptions",
        "Live realtime subscriptions on this instance"
    )
    .expect("Failed to register active subscriptions metric")
});

pub fn record_append(kind: &str) {
    MESSAGES_APPENDED.with_label_values(&[kind]).inc();
}

pub fn record_rejection(reason: &str) {
    SEND_REJECTIONS.with_label_values(&[reason]).inc();
}

/// `created`, `conflict_retry`, `activated`, `hidden`, `resurfaced`
pub fn record_conversation_event(event: &str) {
    CONVERSATIONS.with_label_values(&[event]).inc();
}

pub fn record_notification(event: &str, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    NOTIFICATIONS.with_label_values(&[event, result]).inc();
}

pub fn subscription_opened() {
    ACTIVE_SUBSCRIPTIONS.inc();
}

pub fn subscription_closed() {
    ACTIVE_SUBSCRIPTIONS.dec();
}

/// `GET /metrics` in the Prometheus text format
pub async fn metrics_handler() -> HttpResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }
    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}
