//! Payment gateway clients.
//!
//! [`PaymentGateway`] is the seam between the reconciliation service and the outside
//! world. [`HttpGateway`] speaks the gateway's JSON API; [`SimulatedGateway`] stands in for
//! it when `payment.simulation` is set and reports every charge as paid.

use crate::config::settings::PaymentSettings;
use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Failure talking to the gateway.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Network failure, timeout, 429 or 5xx. Worth retrying.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    /// The gateway refused this particular charge
    #[error("gateway rejected the request: {0}")]
    Rejected(String),

    /// Credentials or endpoint are wrong; retrying cannot help
    #[error("gateway configuration error: {0}")]
    Configuration(String),

    /// The gateway answered with a body we could not understand
    #[error("malformed gateway response: {0}")]
    Malformed(String),
}

impl GatewayError {
    /// Whether the same call may succeed if repeated.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Malformed(err.to_string())
        } else if err.is_builder() {
            Self::Configuration(err.to_string())
        } else {
            Self::Unavailable(err.to_string())
        }
    }
}

/// Payment state as reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayStatus {
    /// Money collected
    Paid,
    /// Not yet decided
    Pending,
    /// Payment failed, expired or was closed
    Failed,
}

impl GatewayStatus {
    /// Maps the gateway's free-form status string. Unknown values count as pending.
    #[must_use]
    pub fn from_gateway_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "paid" | "success" | "succeeded" | "completed" => Self::Paid,
            "failed" | "closed" | "cancelled" | "expired" => Self::Failed,
            _ => Self::Pending,
        }
    }
}

/// A charge the gateway accepted.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedCharge {
    /// Gateway-side identifier used for status checks
    pub gateway_charge_id: String,
    /// Where the user completes payment (QR target), if the gateway provides one
    pub payment_url: Option<String>,
    /// Initial status
    pub status: GatewayStatus,
    /// Gateway message for display
    pub message: Option<String>,
}

/// External payment collector.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens a charge of `amount` currency units for our `charge_ref`.
    async fn create_charge(&self, charge_ref: &str, amount: f64)
    -> Result<CreatedCharge, GatewayError>;

    /// Current status of a previously created charge.
    async fn check_charge(&self, gateway_charge_id: &str) -> Result<GatewayStatus, GatewayError>;

    /// Short name for logs.
    fn name(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    amount: f64,
    order_id: &'a str,
    api_key: &'a str,
}

#[derive(Debug, Serialize)]
struct CheckRequest<'a> {
    payment_id: &'a str,
    api_key: &'a str,
}

#[derive(Debug, Deserialize)]
struct CreateResponse {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    payment_id: Option<String>,
    #[serde(default, alias = "qr_code", alias = "pay_url")]
    payment_url: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    #[serde(default)]
    status: Option<String>,
}

/// Maps a non-success HTTP status to a gateway error.
fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    let detail = format!(
        "HTTP {} - {}",
        status,
        body.chars().take(200).collect::<String>()
    );
    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        GatewayError::Unavailable(detail)
    } else if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        GatewayError::Configuration(detail)
    } else {
        GatewayError::Rejected(detail)
    }
}

/// JSON-over-HTTP gateway client.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
    api_key: String,
}

impl HttpGateway {
    /// Builds a client from settings. Fails with [`GatewayError::Configuration`] when the
    /// base URL is missing or unparseable.
    pub fn new(settings: &PaymentSettings) -> Result<Self, GatewayError> {
        let base_url = settings.base_url.trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(GatewayError::Configuration(
                "payment.base_url is not set".to_string(),
            ));
        }
        Url::parse(&base_url)
            .map_err(|e| GatewayError::Configuration(format!("invalid base URL '{base_url}': {e}")))?;

        let client = Client::builder()
            .timeout(settings.request_timeout())
            .build()
            .map_err(|e| GatewayError::Configuration(e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            api_key: settings.api_key.clone(),
        })
    }

    /// POSTs `body` as JSON to `{base}/{path}`; if the gateway answers 405 the call is
    /// repeated once as a GET with the same fields as query parameters.
    async fn call<B, R>(&self, path: &str, body: &B) -> Result<R, GatewayError>
    where
        B: Serialize + Sync,
        R: for<'de> Deserialize<'de>,
    {
        let url = format!("{}/{}", self.base_url, path);
        let mut response = self.client.post(&url).json(body).send().await?;

        if response.status() == StatusCode::METHOD_NOT_ALLOWED {
            debug!("POST {} not allowed, retrying as GET", url);
            response = self.client.get(&url).query(body).send().await?;
        }

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let err = classify_status(status, &text);
            warn!("Gateway call {} failed: {}", url, err);
            return Err(err);
        }

        let text = response.text().await?;
        serde_json::from_str(&text).map_err(|e| GatewayError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn create_charge(
        &self,
        charge_ref: &str,
        amount: f64,
    ) -> Result<CreatedCharge, GatewayError> {
        let response: CreateResponse = self
            .call(
                "create",
                &CreateRequest {
                    amount,
                    order_id: charge_ref,
                    api_key: &self.api_key,
                },
            )
            .await?;

        if response.success == Some(false) {
            return Err(GatewayError::Rejected(
                response
                    .message
                    .unwrap_or_else(|| "charge refused".to_string()),
            ));
        }
        let gateway_charge_id = response
            .payment_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| GatewayError::Malformed("create response has no payment_id".to_string()))?;

        Ok(CreatedCharge {
            gateway_charge_id,
            payment_url: response.payment_url,
            status: response
                .status
                .as_deref()
                .map_or(GatewayStatus::Pending, GatewayStatus::from_gateway_str),
            message: response.message,
        })
    }

    async fn check_charge(&self, gateway_charge_id: &str) -> Result<GatewayStatus, GatewayError> {
        let response: CheckResponse = self
            .call(
                "check",
                &CheckRequest {
                    payment_id: gateway_charge_id,
                    api_key: &self.api_key,
                },
            )
            .await?;

        response
            .status
            .as_deref()
            .map(GatewayStatus::from_gateway_str)
            .ok_or_else(|| GatewayError::Malformed("check response has no status".to_string()))
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// In-process gateway for development. Every charge is accepted and reported paid.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedGateway;

#[async_trait]
impl PaymentGateway for SimulatedGateway {
    async fn create_charge(
        &self,
        charge_ref: &str,
        amount: f64,
    ) -> Result<CreatedCharge, GatewayError> {
        info!("Simulated charge {} for {:.2}", charge_ref, amount);
        Ok(CreatedCharge {
            gateway_charge_id: format!("sim_{charge_ref}"),
            payment_url: None,
            status: GatewayStatus::Pending,
            message: Some("Simulated payment".to_string()),
        })
    }

    async fn check_charge(&self, _gateway_charge_id: &str) -> Result<GatewayStatus, GatewayError> {
        Ok(GatewayStatus::Paid)
    }

    fn name(&self) -> &str {
        "simulated"
    }
}
