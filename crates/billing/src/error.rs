//! Billing error types

use thiserror::Error;

/// Errors surfaced by the billing crate.
///
/// Quota denials are not errors; they are a normal [`crate::quota::Verdict`].
#[derive(Debug, Error)]
pub enum BillingError {
    /// Storage failure. Fatal for the current request; the caller must
    /// not assume any mutation occurred.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Could not reach the payment gateway (timeout, connection error,
    /// non-2xx response).
    #[error("gateway transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The gateway answered but declined the request.
    #[error("gateway declined: {code}: {message}")]
    Gateway { code: String, message: String },

    /// Malformed gateway response body.
    #[error("unexpected gateway response: {0}")]
    GatewayResponse(String),

    /// Missing or invalid configuration at construction time.
    #[error("configuration error: {0}")]
    Config(String),
}

pub type BillingResult<T> = Result<T, BillingError>;
