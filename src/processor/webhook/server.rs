//! Subscription HTTP server.
//!
//! Exposes `POST /webhooks/subscribe` and `POST /webhooks/unsubscribe` so
//! consumers can register delivery URLs at runtime. Any body that fails to
//! bind to a subscription — bad JSON, wrong shape, missing content type —
//! is rejected with 400; a store failure answers 503 so callers retry.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, trace};

use super::subscription::{Subscription, SubscriptionStore};
use crate::Result;

pub struct SubscriptionServer {
    address: String,
    store: Arc<dyn SubscriptionStore>,
}

impl SubscriptionServer {
    pub fn new(address: String, store: Arc<dyn SubscriptionStore>) -> Self {
        Self { address, store }
    }

    /// Serves until the token cancels.
    pub async fn run(self, token: CancellationToken) -> Result<()> {
        info!(address = %self.address, "subscription server listening");
        let listener = tokio::net::TcpListener::bind(&self.address).await?;
        axum::serve(listener, router(self.store))
            .with_graceful_shutdown(token.cancelled_owned())
            .await?;
        Ok(())
    }
}

fn router(store: Arc<dyn SubscriptionStore>) -> Router {
    Router::new()
        .route("/webhooks/subscribe", post(subscribe))
        .route("/webhooks/unsubscribe", post(unsubscribe))
        .with_state(store)
}

async fn subscribe(
    State(store): State<Arc<dyn SubscriptionStore>>,
    subscription: std::result::Result<Json<Subscription>, JsonRejection>,
) -> StatusCode {
    let Ok(Json(subscription)) = subscription else {
        return StatusCode::BAD_REQUEST;
    };

    trace!(url = %subscription.url, "request received on /subscribe endpoint");
    match store.create_subscription(&subscription).await {
        Ok(()) => StatusCode::CREATED,
        Err(e) => {
            error!("creating subscription: {e}");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

async fn unsubscribe(
    State(store): State<Arc<dyn SubscriptionStore>>,
    subscription: std::result::Result<Json<Subscription>, JsonRejection>,
) -> StatusCode {
    let Ok(Json(subscription)) = subscription else {
        return StatusCode::BAD_REQUEST;
    };

    trace!(url = %subscription.url, "request received on /unsubscribe endpoint");
    match store.delete_subscription(&subscription).await {
        Ok(()) => StatusCode::OK,
        Err(e) => {
            error!("deleting subscription: {e}");
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::webhook::subscription::MemorySubscriptionStore;
    use crate::wal::Action;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn store() -> Arc<dyn SubscriptionStore> {
        Arc::new(MemorySubscriptionStore::new())
    }

    fn json_request(path: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_subscribe_created() {
        let store = store();
        let response = router(store.clone())
            .oneshot(json_request(
                "/webhooks/subscribe",
                r#"{"url":"http://localhost:9000/hook","events":[]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let matches = store
            .matching("public", "users", Action::Insert)
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_ok() {
        let store = store();
        let app = router(store.clone());

        let response = app
            .clone()
            .oneshot(json_request(
                "/webhooks/subscribe",
                r#"{"url":"http://localhost:9000/hook"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = app
            .oneshot(json_request(
                "/webhooks/unsubscribe",
                r#"{"url":"http://localhost:9000/hook"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        assert!(store
            .matching("public", "users", Action::Insert)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_invalid_json_is_bad_request() {
        let response = router(store())
            .oneshot(json_request("/webhooks/subscribe", "{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_wrong_shape_is_bad_request() {
        // valid JSON, but no url field
        let response = router(store())
            .oneshot(json_request("/webhooks/subscribe", r#"{"events":[]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_missing_content_type_is_bad_request() {
        let request = Request::builder()
            .method("POST")
            .uri("/webhooks/unsubscribe")
            .body(Body::from(r#"{"url":"http://localhost:9000/hook"}"#))
            .unwrap();
        let response = router(store()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
