//! Admin endpoints

use axum::extract::State;
use axum::Json;
use kassabot_billing::{InvariantCheckSummary, InvariantChecker};

use crate::error::ApiError;
use crate::state::AppState;

/// Run all billing consistency checks. Read-only.
pub async fn run_invariant_checks(
    State(state): State<AppState>,
) -> Result<Json<InvariantCheckSummary>, ApiError> {
    let summary = InvariantChecker::new(state.pool.clone())
        .run_all_checks()
        .await?;

    if !summary.healthy {
        tracing::warn!(
            violations = summary.violations.len(),
            "Billing invariant violations found"
        );
    }

    Ok(Json(summary))
}
