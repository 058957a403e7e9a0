//! Producer-side ingestion.
//!
//! Validates notify requests, applies idempotency, and fans the request out
//! into one notification per target. Per-target failures are logged and
//! skipped; the producer sees whatever subset succeeded.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::notification::{NotificationPayload, NotifyRequest, NotifyResponse, NotifyResult};
use crate::repository::{NotificationStore, StoreError};

/// Errors surfaced to the producer path.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The request failed validation; maps to HTTP 400
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The store was unavailable; maps to HTTP 500
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Ingestion service for producer requests.
#[derive(Clone)]
pub struct IngestionService {
    store: Arc<dyn NotificationStore>,
}

impl IngestionService {
    pub fn new(store: Arc<dyn NotificationStore>) -> Self {
        Self { store }
    }

    /// Create one notification per target.
    ///
    /// When `idempotency_key` is present and a cached response exists, that
    /// response is returned verbatim and nothing is created. Otherwise the
    /// request is validated and executed, and the response is cached under
    /// the key; a cache write failure is logged and swallowed.
    pub async fn create_notifications(
        &self,
        req: &NotifyRequest,
        idempotency_key: Option<&str>,
    ) -> Result<NotifyResponse, ServiceError> {
        let token = idempotency_key.filter(|t| !t.is_empty());

        if let Some(token) = token {
            match self.store.idempotent_response(token).await {
                Ok(Some(cached)) => {
                    debug!(idempotency_key = %token, "Returning cached response");
                    return Ok(cached);
                }
                Ok(None) => {}
                Err(e) => {
                    // Treated as a cache miss; the request proceeds
                    warn!(error = %e, idempotency_key = %token, "Idempotency lookup failed");
                }
            }
        }

        validate(req)?;

        let created_at = req.created_at.unwrap_or_else(chrono::Utc::now);
        let mut results = Vec::with_capacity(req.targets.len());

        for target in &req.targets {
            let payload = NotificationPayload {
                notification_id: Uuid::new_v4().to_string(),
                message: req.message.clone(),
                created_at,
                source: req.source.clone(),
                target: target.clone(),
            };

            match self.store.create_notification(&payload).await {
                Ok(stream_id) => {
                    debug!(
                        notification_id = %payload.notification_id,
                        stream_id = %stream_id,
                        target_id = target.id,
                        target_login = %target.login,
                        "Created notification"
                    );
                    results.push(NotifyResult {
                        target: target.clone(),
                        notification_id: payload.notification_id,
                    });
                }
                Err(e) => {
                    // Continue with the remaining targets
                    error!(
                        error = %e,
                        target_id = target.id,
                        target_login = %target.login,
                        "Failed to create notification"
                    );
                }
            }
        }

        let response = NotifyResponse { results };

        if let Some(token) = token {
            if let Err(e) = self.store.save_idempotent_response(token, &response).await {
                warn!(error = %e, idempotency_key = %token, "Failed to cache response");
            }
        }

        info!(
            created = response.results.len(),
            requested = req.targets.len(),
            source = %req.source,
            "Created notifications"
        );

        Ok(response)
    }
}

fn validate(req: &NotifyRequest) -> Result<(), ServiceError> {
    if req.targets.is_empty() {
        return Err(ServiceError::InvalidRequest(
            "target list must not be empty".to_string(),
        ));
    }

    if req.message.is_empty() {
        return Err(ServiceError::InvalidRequest(
            "message must not be empty".to_string(),
        ));
    }

    if req.source.is_empty() {
        return Err(ServiceError::InvalidRequest(
            "source must not be empty".to_string(),
        ));
    }

    for (i, target) in req.targets.iter().enumerate() {
        if target.id <= 0 {
            return Err(ServiceError::InvalidRequest(format!(
                "target {i} must have a positive id"
            )));
        }
        if target.login.is_empty() {
            return Err(ServiceError::InvalidRequest(format!(
                "target {i} must have a non-empty login"
            )));
        }
    }

    Ok(())
}
