use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use failsafe::futures::CircuitBreaker as FuturesCircuitBreaker;
use failsafe::{backoff, failure_policy, Config, Error as FailsafeError, StateMachine};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::sync::RwLock;

use super::types::{
    AccessToken, AccountDetailsResponse, BalancesResponse, ProviderAccount, Requisition,
    TokenPair, TransactionsResponse,
};
use crate::ports::{ProviderError, ProviderGateway};

/// Tokens are renewed this long before the provider says they expire.
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub base_url: String,
    pub secret_id: String,
    pub secret_key: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_base_delay: Duration,
    pub breaker_failure_threshold: u32,
    pub breaker_reset_timeout: Duration,
}

impl ProviderSettings {
    pub fn new(base_url: String, secret_id: String, secret_key: String) -> Self {
        Self {
            base_url,
            secret_id,
            secret_key,
            timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_base_delay: Duration::from_millis(500),
            breaker_failure_threshold: 5,
            breaker_reset_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    access: String,
    access_expires_at: Instant,
    refresh: Option<String>,
    refresh_expires_at: Instant,
}

impl CachedToken {
    fn access_valid(&self) -> bool {
        Instant::now() + TOKEN_EXPIRY_MARGIN < self.access_expires_at
    }

    fn refresh_token(&self) -> Option<&str> {
        if Instant::now() + TOKEN_EXPIRY_MARGIN < self.refresh_expires_at {
            self.refresh.as_deref()
        } else {
            None
        }
    }
}

/// HTTP client for a GoCardless Bank Account Data style open-banking API.
#[derive(Clone)]
pub struct OpenBankingClient {
    client: Client,
    settings: ProviderSettings,
    token: Arc<RwLock<Option<CachedToken>>>,
    circuit_breaker: StateMachine<failure_policy::ConsecutiveFailures<backoff::EqualJittered>, ()>,
}

impl OpenBankingClient {
    pub fn new(settings: ProviderSettings) -> Self {
        let client = Client::builder()
            .timeout(settings.timeout)
            .build()
            .unwrap_or_default();

        let backoff = backoff::equal_jittered(
            settings.breaker_reset_timeout,
            settings.breaker_reset_timeout * 2,
        );
        let policy = failure_policy::consecutive_failures(settings.breaker_failure_threshold, backoff);
        let circuit_breaker = Config::new().failure_policy(policy).build();

        OpenBankingClient {
            client,
            settings,
            token: Arc::new(RwLock::new(None)),
            circuit_breaker,
        }
    }

    /// Returns the current state of the circuit breaker
    pub fn circuit_state(&self) -> String {
        if self.circuit_breaker.is_call_permitted() {
            "closed".to_string()
        } else {
            "open".to_string()
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.settings.base_url.trim_end_matches('/'), path)
    }

    async fn access_token(&self) -> Result<String, ProviderError> {
        if let Some(token) = self.token.read().await.as_ref() {
            if token.access_valid() {
                return Ok(token.access.clone());
            }
        }

        let mut guard = self.token.write().await;
        // Another task may have renewed it while we waited for the lock.
        if let Some(token) = guard.as_ref() {
            if token.access_valid() {
                return Ok(token.access.clone());
            }
        }

        let refreshed = match guard.as_ref().and_then(|t| t.refresh_token().map(str::to_string)) {
            Some(refresh) => match self.refresh_access(&refresh).await {
                Ok(access) => {
                    if let Some(token) = guard.as_mut() {
                        token.access = access.access.clone();
                        token.access_expires_at =
                            Instant::now() + Duration::from_secs(access.access_expires);
                    }
                    Some(access.access)
                }
                Err(e) => {
                    tracing::warn!("Token refresh failed, requesting a new token: {}", e);
                    None
                }
            },
            None => None,
        };
        if let Some(access) = refreshed {
            return Ok(access);
        }

        let pair = self.new_token().await?;
        let now = Instant::now();
        let access = pair.access.clone();
        *guard = Some(CachedToken {
            access: pair.access,
            access_expires_at: now + Duration::from_secs(pair.access_expires),
            refresh: pair.refresh,
            refresh_expires_at: now + Duration::from_secs(pair.refresh_expires),
        });
        tracing::debug!("Obtained new provider access token");
        Ok(access)
    }

    async fn new_token(&self) -> Result<TokenPair, ProviderError> {
        let response = self
            .client
            .post(self.url("/api/v2/token/new/"))
            .json(&json!({
                "secret_id": self.settings.secret_id,
                "secret_key": self.settings.secret_key,
            }))
            .send()
            .await?;
        decode(response, "token/new").await
    }

    async fn refresh_access(&self, refresh: &str) -> Result<AccessToken, ProviderError> {
        let response = self
            .client
            .post(self.url("/api/v2/token/refresh/"))
            .json(&json!({ "refresh": refresh }))
            .send()
            .await?;
        decode(response, "token/refresh").await
    }

    async fn invalidate_access_token(&self) {
        if let Some(token) = self.token.write().await.as_mut() {
            token.access_expires_at = Instant::now();
        }
    }

    /// GET with retries: transient failures back off exponentially, a 401
    /// forces one token renewal and one retry.
    async fn get_json<T: DeserializeOwned + Send + 'static>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ProviderError> {
        let mut attempt = 0u32;
        let mut renewed = false;

        loop {
            let token = self.access_token().await?;
            match self.get_once::<T>(path, query, &token).await {
                Ok(value) => return Ok(value),
                Err(ProviderError::Unauthorized(reason)) if !renewed => {
                    tracing::info!("Provider returned 401 for {}, renewing token: {}", path, reason);
                    self.invalidate_access_token().await;
                    renewed = true;
                }
                Err(e) if e.is_transient() && attempt < self.settings.max_retries => {
                    let delay = retry_delay(self.settings.retry_base_delay, attempt);
                    attempt += 1;
                    tracing::warn!(
                        "Provider call {} failed (attempt {}): {}. Retrying in {:?}",
                        path,
                        attempt,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn get_once<T: DeserializeOwned + Send + 'static>(
        &self,
        path: &str,
        query: &[(&str, String)],
        token: &str,
    ) -> Result<T, ProviderError> {
        let request = self
            .client
            .get(self.url(path))
            .bearer_auth(token)
            .query(query);
        let label = path.to_string();

        let result = self
            .circuit_breaker
            .call_with(
                |e: &ProviderError| e.is_transient(),
                async move {
                    let response = request.send().await?;
                    decode::<T>(response, &label).await
                },
            )
            .await;

        match result {
            Ok(value) => Ok(value),
            Err(FailsafeError::Rejected) => Err(ProviderError::CircuitBreakerOpen(
                "open-banking provider circuit breaker is open".to_string(),
            )),
            Err(FailsafeError::Inner(e)) => Err(e),
        }
    }
}

const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

/// Exponential backoff `base * 2^attempt`, capped at one minute.
fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base.checked_mul(2u32.saturating_pow(attempt))
        .map_or(MAX_RETRY_DELAY, |delay| delay.min(MAX_RETRY_DELAY))
}

async fn decode<T: DeserializeOwned>(
    response: reqwest::Response,
    label: &str,
) -> Result<T, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("{}: {}", label, e)));
    }

    let body = response.text().await.unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ProviderError::Unauthorized(body),
        StatusCode::NOT_FOUND => ProviderError::NotFound(label.to_string()),
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited(body),
        _ => ProviderError::Server {
            status: status.as_u16(),
            body,
        },
    })
}

#[async_trait]
impl ProviderGateway for OpenBankingClient {
    async fn get_requisition(&self, id: &str) -> Result<Requisition, ProviderError> {
        self.get_json(&format!("/api/v2/requisitions/{}/", id), &[]).await
    }

    async fn get_account(&self, id: &str) -> Result<ProviderAccount, ProviderError> {
        self.get_json(&format!("/api/v2/accounts/{}/", id), &[]).await
    }

    async fn get_account_details(&self, id: &str) -> Result<AccountDetailsResponse, ProviderError> {
        self.get_json(&format!("/api/v2/accounts/{}/details/", id), &[])
            .await
    }

    async fn get_account_balances(&self, id: &str) -> Result<BalancesResponse, ProviderError> {
        self.get_json(&format!("/api/v2/accounts/{}/balances/", id), &[])
            .await
    }

    async fn get_account_transactions(
        &self,
        id: &str,
        date_from: NaiveDate,
        date_to: NaiveDate,
    ) -> Result<TransactionsResponse, ProviderError> {
        let query = [
            ("date_from", date_from.format("%Y-%m-%d").to_string()),
            ("date_to", date_to.format("%Y-%m-%d").to_string()),
        ];
        self.get_json(&format!("/api/v2/accounts/{}/transactions/", id), &query)
            .await
    }
}
