use axum::{
    Json,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
};
use subtle::ConstantTimeEq;
use tracing::warn;

use accord_types::api::ProvisioningEvent;

use crate::AppState;
use crate::error::ApiError;

pub const WEBHOOK_SECRET_HEADER: &str = "x-accord-webhook-secret";

fn secrets_match(expected: &str, given: &str) -> bool {
    expected.as_bytes().ct_eq(given.as_bytes()).into()
}

/// Account lifecycle pushed by the identity provider.
pub async fn provisioning_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(event): Json<ProvisioningEvent>,
) -> Result<impl IntoResponse, ApiError> {
    let presented = headers
        .get(WEBHOOK_SECRET_HEADER)
        .and_then(|v| v.to_str().ok());

    match (state.webhook_secret.as_deref(), presented) {
        (Some(expected), Some(given)) if secrets_match(expected, given) => {}
        (None, _) => {
            warn!("Provisioning webhook called but no webhook secret is configured");
            return Ok(StatusCode::NOT_FOUND);
        }
        _ => return Ok(StatusCode::UNAUTHORIZED),
    }

    match event {
        ProvisioningEvent::AccountCreated { id, username }
        | ProvisioningEvent::AccountUpdated { id, username } => {
            state.engine.provision_account(&id, &username).await?;
        }
        ProvisioningEvent::AccountDeleted { id } => {
            if !state.engine.deprovision_account(&id).await? {
                return Ok(StatusCode::NOT_FOUND);
            }
        }
    }

    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_comparison() {
        assert!(secrets_match("hook-secret", "hook-secret"));
        assert!(!secrets_match("hook-secret", "hook-secreT"));
        assert!(!secrets_match("hook-secret", "hook"));
        assert!(!secrets_match("hook-secret", ""));
    }
}
