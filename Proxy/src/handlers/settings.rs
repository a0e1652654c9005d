// handlers/settings.rs

use axum::extract::State;
use axum::http::StatusCode;
use axum::Form;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use crate::services::policy::Policy;
use crate::types::AppState;

/// Form body for `POST /settings`. Any subset of fields may be present.
#[derive(Debug, Deserialize)]
pub struct SettingsForm {
    pub setup: Option<String>,
    pub policy: Option<String>,
    pub prefetch: Option<String>,
}

/// Operator control surface: flips the process-wide policy snapshot.
#[instrument(skip_all)]
pub async fn update_settings(
    State(state): State<AppState>,
    Form(form): Form<SettingsForm>,
) -> StatusCode {
    let mut snapshot = state.policy.read().unwrap().clone();

    if let Some(setup) = form.setup {
        snapshot.setup_mode = setup == "1";
        info!("set setup_mode to {}", snapshot.setup_mode);
    }
    if let Some(name) = form.policy {
        match Policy::parse(&name) {
            Some(policy) => {
                snapshot.policy = policy;
                info!("set policy to {}", policy.name());
            }
            None => warn!("unknown policy '{name}', keeping {}", snapshot.policy.name()),
        }
    }
    if let Some(prefetch) = form.prefetch {
        snapshot.prefetch_off = prefetch == "0";
        info!("set prefetch_off to {}", snapshot.prefetch_off);
    }

    *state.policy.write().unwrap() = snapshot;
    StatusCode::OK
}
