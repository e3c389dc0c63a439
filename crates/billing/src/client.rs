//! T-Kassa gateway client
//!
//! Initiates purchases against the external payment processor and
//! polls payment state. Requests carry a `Token` field: signable field
//! values sorted by field name, concatenated, secret key appended, MD5
//! hex digest of the result. That is the scheme the gateway documents;
//! it is isolated behind [`generate_token`] so a hash change is a
//! one-function swap.

use std::time::Duration;

use md5::{Digest, Md5};
use serde::Deserialize;
use serde_json::json;

use crate::error::{BillingError, BillingResult};

const DEFAULT_API_URL: &str = "https://securepay.tinkoff.ru/v2";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Gateway connection settings, passed in explicitly at construction.
#[derive(Debug, Clone)]
pub struct TKassaConfig {
    /// Terminal (merchant) key issued by the gateway.
    pub terminal_key: String,
    /// Shared secret used for request signing.
    pub secret_key: String,
    pub api_url: String,
    /// Sandbox terminal flag; changes nothing in this client beyond
    /// being logged, the test terminal is selected by `terminal_key`.
    pub test_mode: bool,
}

impl TKassaConfig {
    pub fn from_env() -> BillingResult<Self> {
        let terminal_key = std::env::var("T_KASSA_TERMINAL_KEY")
            .map_err(|_| BillingError::Config("T_KASSA_TERMINAL_KEY must be set".into()))?;
        let secret_key = std::env::var("T_KASSA_SECRET_KEY")
            .map_err(|_| BillingError::Config("T_KASSA_SECRET_KEY must be set".into()))?;
        let api_url = std::env::var("T_KASSA_API_URL")
            .unwrap_or_else(|_| DEFAULT_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();
        let test_mode = std::env::var("T_KASSA_IS_TEST")
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            terminal_key,
            secret_key,
            api_url,
            test_mode,
        })
    }
}

/// Sign a request: drop `Token`, `Receipt`, and null-valued fields,
/// sort the rest lexicographically by field name, concatenate the
/// string values, append the secret, MD5 hex digest.
pub fn generate_token(fields: &[(&str, Option<String>)], secret: &str) -> String {
    let mut signable: Vec<(&str, &str)> = fields
        .iter()
        .filter(|(key, value)| *key != "Token" && *key != "Receipt" && value.is_some())
        .filter_map(|(key, value)| value.as_deref().map(|v| (*key, v)))
        .collect();
    signable.sort_by_key(|(key, _)| *key);

    let mut data = String::new();
    for (_, value) in &signable {
        data.push_str(value);
    }
    data.push_str(secret);

    hex::encode(Md5::digest(data.as_bytes()))
}

/// Successful `/Init` outcome.
#[derive(Debug, Clone)]
pub struct PaymentInit {
    /// Where to send the paying user.
    pub payment_url: String,
    /// Gateway-side payment reference, used by [`TKassaClient::get_state`].
    pub payment_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InitResponse {
    #[serde(rename = "Success", default)]
    success: bool,
    #[serde(rename = "PaymentURL")]
    payment_url: Option<String>,
    #[serde(rename = "PaymentId")]
    payment_id: Option<serde_json::Value>,
    #[serde(rename = "ErrorCode")]
    error_code: Option<String>,
    #[serde(rename = "Message")]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StateResponse {
    #[serde(rename = "Success", default)]
    success: bool,
    #[serde(rename = "Status")]
    status: Option<String>,
    #[serde(rename = "ErrorCode")]
    error_code: Option<String>,
    #[serde(rename = "Message")]
    message: Option<String>,
}

/// The gateway reports `PaymentId` as a string in some responses and a
/// bare number in others.
fn payment_id_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Clone)]
pub struct TKassaClient {
    config: TKassaConfig,
    http: reqwest::Client,
}

impl TKassaClient {
    pub fn new(config: TKassaConfig) -> BillingResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BillingError::Config(format!("failed to build HTTP client: {e}")))?;

        if config.test_mode {
            tracing::info!("T-Kassa client running against a test terminal");
        }

        Ok(Self { config, http })
    }

    pub fn config(&self) -> &TKassaConfig {
        &self.config
    }

    /// Initiate a payment (`/Init`). `amount_kopecks` is in minor
    /// currency units.
    pub async fn init_payment(
        &self,
        amount_kopecks: i64,
        order_id: &str,
        description: &str,
        customer_key: &str,
    ) -> BillingResult<PaymentInit> {
        let fields = [
            ("TerminalKey", Some(self.config.terminal_key.clone())),
            ("Amount", Some(amount_kopecks.to_string())),
            ("OrderId", Some(order_id.to_string())),
            ("Description", Some(description.to_string())),
            ("CustomerKey", Some(customer_key.to_string())),
        ];
        let token = generate_token(&fields, &self.config.secret_key);

        let body = json!({
            "TerminalKey": self.config.terminal_key,
            "Amount": amount_kopecks,
            "OrderId": order_id,
            "Description": description,
            "CustomerKey": customer_key,
            "Token": token,
        });

        let resp: InitResponse = self
            .http
            .post(format!("{}/Init", self.config.api_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !resp.success {
            return Err(BillingError::Gateway {
                code: resp.error_code.unwrap_or_else(|| "unknown".into()),
                message: resp.message.unwrap_or_else(|| "Init declined".into()),
            });
        }

        let payment_url = resp.payment_url.ok_or_else(|| {
            BillingError::GatewayResponse("Init succeeded without a PaymentURL".into())
        })?;
        let payment_id = resp.payment_id.as_ref().and_then(payment_id_to_string);

        tracing::info!(
            order_id = order_id,
            payment_id = ?payment_id,
            "Payment initiated"
        );
        Ok(PaymentInit {
            payment_url,
            payment_id,
        })
    }

    /// Poll payment state (`/GetState`). Returns the raw gateway status
    /// string; mapping to a local transition is the reconciliation
    /// layer's job.
    pub async fn get_state(&self, payment_id: &str) -> BillingResult<String> {
        let fields = [
            ("TerminalKey", Some(self.config.terminal_key.clone())),
            ("PaymentId", Some(payment_id.to_string())),
        ];
        let token = generate_token(&fields, &self.config.secret_key);

        let body = json!({
            "TerminalKey": self.config.terminal_key,
            "PaymentId": payment_id,
            "Token": token,
        });

        let resp: StateResponse = self
            .http
            .post(format!("{}/GetState", self.config.api_url))
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if !resp.success {
            return Err(BillingError::Gateway {
                code: resp.error_code.unwrap_or_else(|| "unknown".into()),
                message: resp.message.unwrap_or_else(|| "GetState declined".into()),
            });
        }

        resp.status
            .ok_or_else(|| BillingError::GatewayResponse("GetState response without Status".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_fields() -> Vec<(&'static str, Option<String>)> {
        vec![
            ("TerminalKey", Some("TestTerminal".into())),
            ("Amount", Some("10000".into())),
            ("OrderId", Some("order-21".into())),
            ("Description", Some("Balance top-up #21".into())),
            ("CustomerKey", Some("12345".into())),
        ]
    }

    #[test]
    fn test_token_is_md5_hex() {
        let token = generate_token(&init_fields(), "secret");
        assert_eq!(token.len(), 32);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(token, token.to_lowercase());
    }

    #[test]
    fn test_token_is_field_order_independent() {
        let mut shuffled = init_fields();
        shuffled.reverse();
        assert_eq!(
            generate_token(&init_fields(), "secret"),
            generate_token(&shuffled, "secret"),
        );
    }

    #[test]
    fn test_token_excludes_token_receipt_and_nulls() {
        let mut extended = init_fields();
        extended.push(("Token", Some("stale-token".into())));
        extended.push(("Receipt", Some("opaque-receipt-blob".into())));
        extended.push(("RedirectDueDate", None));
        assert_eq!(
            generate_token(&init_fields(), "secret"),
            generate_token(&extended, "secret"),
        );
    }

    #[test]
    fn test_token_depends_on_secret() {
        assert_ne!(
            generate_token(&init_fields(), "secret-a"),
            generate_token(&init_fields(), "secret-b"),
        );
    }

    #[test]
    fn test_token_depends_on_amount() {
        let mut other = init_fields();
        other[1] = ("Amount", Some("10001".into()));
        assert_ne!(
            generate_token(&init_fields(), "secret"),
            generate_token(&other, "secret"),
        );
    }

    #[test]
    fn test_payment_id_string_and_number_forms() {
        assert_eq!(
            payment_id_to_string(&serde_json::json!("700001")),
            Some("700001".to_string())
        );
        assert_eq!(
            payment_id_to_string(&serde_json::json!(700001)),
            Some("700001".to_string())
        );
        assert_eq!(payment_id_to_string(&serde_json::json!(null)), None);
    }
}
