//! JSON-over-HTTP collaborator clients.
//!
//! All four clients share one `reqwest::Client` configuration and the same
//! status mapping: connection failures and 5xx are `Unavailable` (retryable),
//! timeouts are `Timeout`, and any other non-success status is `Rejected`.
//!
//! ## Endpoints
//!
//! | Collaborator | Call                                  |
//! |--------------|---------------------------------------|
//! | identity     | `POST {base}/sessions/validate`       |
//! | identity     | `POST {base}/users/{id}/onboarding`   |
//! | vault        | `PUT  {base}/credentials/{account}`   |
//! | vault        | `POST {base}/credentials/{account}/test` |
//! | balance      | `GET  {base}/accounts/{account}/balance` |
//! | execution    | `POST {base}/mode-events`             |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use guard_common::{Platform, UserId};

use super::{
    BalanceProvider, CredentialRef, CredentialVault, ExecutionSink, IdentityError,
    IdentityProvider, IdentityRecord, ProviderError,
};
use crate::broadcast::StatusEvent;

/// Request timeout for collaborator calls. Balance lookups get a tighter
/// per-account timeout on top of this from the ledger.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn build_client(timeout: Duration) -> Result<Client, ProviderError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ProviderError::NotConfigured(format!("HTTP client: {}", e)))
}

fn map_transport(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(REQUEST_TIMEOUT)
    } else {
        ProviderError::Unavailable(err.to_string())
    }
}

/// Turn a non-success response into a `ProviderError`.
async fn check_status(response: Response) -> Result<Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if status.is_server_error() {
        Err(ProviderError::Unavailable(format!("status {}: {}", status.as_u16(), body)))
    } else {
        Err(ProviderError::Rejected(format!("status {}: {}", status.as_u16(), body)))
    }
}

async fn parse_json<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T, ProviderError> {
    response
        .json::<T>()
        .await
        .map_err(|e| ProviderError::Rejected(format!("invalid response body: {}", e)))
}

fn parse_base(base_url: &str) -> Result<Url, ProviderError> {
    let base = Url::parse(base_url)
        .map_err(|e| ProviderError::NotConfigured(format!("base URL {:?}: {}", base_url, e)))?;
    if base.cannot_be_a_base() {
        return Err(ProviderError::NotConfigured(format!(
            "base URL {:?} cannot carry a path",
            base_url
        )));
    }
    Ok(base)
}

/// `base` with `segments` appended, each percent-encoded.
fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

// ============================================================================
// Identity
// ============================================================================

#[derive(Serialize)]
struct ValidateRequest<'a> {
    token: &'a str,
}

#[derive(Serialize)]
struct OnboardingRequest {
    step: u8,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IdentityResponse {
    user_id: String,
    onboarding_step: u8,
    onboarding_completed: bool,
    #[serde(default)]
    token_id: String,
}

impl From<IdentityResponse> for IdentityRecord {
    fn from(r: IdentityResponse) -> Self {
        Self {
            user_id: UserId::new(r.user_id),
            onboarding_step: r.onboarding_step,
            onboarding_completed: r.onboarding_completed,
            token_id: r.token_id,
        }
    }
}

pub struct HttpIdentityProvider {
    http: Client,
    base: Url,
}

impl HttpIdentityProvider {
    pub fn new(base_url: &str) -> Result<Self, ProviderError> {
        Ok(Self {
            http: build_client(REQUEST_TIMEOUT)?,
            base: parse_base(base_url)?,
        })
    }

    async fn identity_call(&self, response: Response) -> Result<IdentityRecord, IdentityError> {
        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                Err(IdentityError::Invalid)
            }
            StatusCode::GONE => Err(IdentityError::Expired),
            StatusCode::BAD_REQUEST => Err(IdentityError::Malformed),
            _ => {
                let response = check_status(response).await?;
                let body: IdentityResponse = parse_json(response).await?;
                Ok(body.into())
            }
        }
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn validate(&self, token: &str) -> Result<IdentityRecord, IdentityError> {
        let url = endpoint(&self.base, &["sessions", "validate"]);
        let response = self
            .http
            .post(url)
            .json(&ValidateRequest { token })
            .send()
            .await
            .map_err(map_transport)?;
        self.identity_call(response).await
    }

    async fn record_onboarding_step(
        &self,
        user_id: &UserId,
        step: u8,
    ) -> Result<IdentityRecord, IdentityError> {
        let url = endpoint(&self.base, &["users", user_id.as_str(), "onboarding"]);
        let response = self
            .http
            .post(url)
            .json(&OnboardingRequest { step })
            .send()
            .await
            .map_err(map_transport)?;
        self.identity_call(response).await
    }
}

// ============================================================================
// Credential vault
// ============================================================================

#[derive(Serialize)]
struct StoreRequest<'a> {
    secret: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreResponse {
    credential_ref: String,
}

#[derive(Deserialize)]
struct TestResponse {
    ok: bool,
}

pub struct HttpCredentialVault {
    http: Client,
    base: Url,
}

impl HttpCredentialVault {
    pub fn new(base_url: &str) -> Result<Self, ProviderError> {
        Ok(Self {
            http: build_client(REQUEST_TIMEOUT)?,
            base: parse_base(base_url)?,
        })
    }
}

#[async_trait]
impl CredentialVault for HttpCredentialVault {
    async fn store(&self, account_id: Uuid, secret: &str) -> Result<CredentialRef, ProviderError> {
        let url = endpoint(&self.base, &["credentials", &account_id.to_string()]);
        let response = self
            .http
            .put(url)
            .json(&StoreRequest { secret })
            .send()
            .await
            .map_err(map_transport)?;
        let body: StoreResponse = parse_json(check_status(response).await?).await?;
        debug!(account_id = %account_id, "Credential stored");
        Ok(CredentialRef::new(body.credential_ref))
    }

    async fn test_connection(&self, account_id: Uuid) -> Result<bool, ProviderError> {
        let url = endpoint(&self.base, &["credentials", &account_id.to_string(), "test"]);
        let response = self.http.post(url).send().await.map_err(map_transport)?;
        let body: TestResponse = parse_json(check_status(response).await?).await?;
        Ok(body.ok)
    }
}

// ============================================================================
// Balances
// ============================================================================

#[derive(Deserialize)]
struct BalanceResponse {
    #[serde(with = "rust_decimal::serde::str")]
    amount: Decimal,
}

/// Balance lookups for one platform.
pub struct HttpBalanceProvider {
    http: Client,
    base: Url,
    platform: Platform,
}

impl HttpBalanceProvider {
    pub fn new(platform: Platform, base_url: &str) -> Result<Self, ProviderError> {
        Ok(Self {
            http: build_client(REQUEST_TIMEOUT)?,
            base: parse_base(base_url)?,
            platform,
        })
    }
}

#[async_trait]
impl BalanceProvider for HttpBalanceProvider {
    fn platform(&self) -> Platform {
        self.platform
    }

    async fn get_balance(&self, account_id: Uuid) -> Result<Decimal, ProviderError> {
        let url = endpoint(&self.base, &["accounts", &account_id.to_string(), "balance"]);
        let response = self.http.get(url).send().await.map_err(map_transport)?;
        let body: BalanceResponse = parse_json(check_status(response).await?).await?;
        Ok(body.amount)
    }
}

// ============================================================================
// Execution engine
// ============================================================================

pub struct HttpExecutionSink {
    http: Client,
    base: Url,
}

impl HttpExecutionSink {
    pub fn new(base_url: &str) -> Result<Self, ProviderError> {
        Ok(Self {
            http: build_client(REQUEST_TIMEOUT)?,
            base: parse_base(base_url)?,
        })
    }
}

#[async_trait]
impl ExecutionSink for HttpExecutionSink {
    async fn deliver(&self, event: &StatusEvent) -> Result<(), ProviderError> {
        let url = endpoint(&self.base, &["mode-events"]);
        let response = self
            .http
            .post(url)
            .json(event)
            .send()
            .await
            .map_err(map_transport)?;
        check_status(response).await?;
        Ok(())
    }
}
