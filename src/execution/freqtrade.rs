use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use parking_lot::RwLock;
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use super::gateway::{EntryRequest, ExecutionGateway, ExitRequest, GatewayFill, TradeSlots};
use crate::config::GatewaySettings;
use crate::error::GatewayError;
use crate::models::{OrderType, Trade};

type GatewayRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

#[derive(Debug, Clone, Default)]
struct Tokens {
    access: String,
    refresh: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    current: u32,
    max: i64, // -1 when unlimited
}

#[derive(Debug, Serialize)]
struct ForceEntryPayload<'a> {
    pair: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    price: Option<f64>, // limit orders only
    ordertype: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    stakeamount: Option<f64>,
    entry_tag: &'a str,
    side: String,
    leverage: u32,
}

#[derive(Debug, Serialize)]
struct ForceExitPayload<'a> {
    tradeid: String,
    ordertype: &'a str,
    amount: Value, // "all" or a number
}

/// REST client for a freqtrade-style trading bot API
///
/// Cloneable; clones share the token pair and the rate limiter.
#[derive(Clone)]
pub struct FreqtradeGateway {
    client: Client,
    base_url: String,
    username: String,
    password: String,
    timeout: Duration,
    tokens: Arc<RwLock<Option<Tokens>>>,
    rate_limiter: Arc<GatewayRateLimiter>,
}

impl FreqtradeGateway {
    pub fn new(settings: &GatewaySettings) -> Result<Self, GatewayError> {
        let timeout = Duration::from_millis(settings.request_timeout_ms);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable(format!("http client: {}", e)))?;

        let rps = NonZeroU32::new(settings.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(rps)));

        Ok(Self {
            client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            timeout,
            tokens: Arc::new(RwLock::new(None)),
            rate_limiter,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn transport_error(&self, err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout(self.timeout)
        } else {
            GatewayError::Unavailable(err.to_string())
        }
    }

    /// Log in with basic auth and store the token pair
    pub async fn login(&self) -> Result<(), GatewayError> {
        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .post(self.url("/api/v1/token/login"))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Unavailable(format!(
                "login failed ({}): {}",
                status, body
            )));
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("login response: {}", e)))?;

        *self.tokens.write() = Some(Tokens {
            access: login.access_token,
            refresh: login.refresh_token,
        });

        tracing::info!(base_url = %self.base_url, "Logged in to execution service");
        Ok(())
    }

    /// Exchange the refresh token for a new access token, logging in again
    /// when there is none or it is refused
    async fn reauthenticate(&self) -> Result<(), GatewayError> {
        let refresh = self.tokens.read().as_ref().and_then(|t| t.refresh.clone());

        let Some(refresh) = refresh else {
            return self.login().await;
        };

        self.rate_limiter.until_ready().await;
        let response = self
            .client
            .post(self.url("/api/v1/token/refresh"))
            .bearer_auth(&refresh)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        if !response.status().is_success() {
            tracing::warn!(status = %response.status(), "Token refresh refused, logging in again");
            return self.login().await;
        }

        let login: LoginResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("refresh response: {}", e)))?;

        {
            let mut tokens = self.tokens.write();
            let refresh = login.refresh_token.or(Some(refresh));
            *tokens = Some(Tokens {
                access: login.access_token,
                refresh,
            });
        }

        tracing::debug!("Refreshed access token");
        Ok(())
    }

    fn access_token(&self) -> Option<String> {
        self.tokens.read().as_ref().map(|t| t.access.clone())
    }

    /// Authenticated request; a 401 triggers one re-authentication and retry
    async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, GatewayError> {
        if self.access_token().is_none() {
            self.login().await?;
        }

        for attempt in 1..=2 {
            let token = self.access_token().unwrap_or_default();

            self.rate_limiter.until_ready().await;
            let mut builder = self
                .client
                .request(method.clone(), self.url(path))
                .bearer_auth(token);
            if let Some(body) = body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(|e| self.transport_error(e))?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED && attempt == 1 {
                tracing::debug!(path, "Access token rejected, re-authenticating");
                self.reauthenticate().await?;
                continue;
            }

            let text = response.text().await.map_err(|e| self.transport_error(e))?;

            if status.is_success() {
                if text.trim().is_empty() {
                    return Ok(Value::Null);
                }
                return serde_json::from_str(&text)
                    .map_err(|e| GatewayError::Unavailable(format!("{} response: {}", path, e)));
            }

            return Err(classify_status(status, &text));
        }

        Err(GatewayError::Unavailable(format!("{}: unauthorized", path)))
    }
}

/// Error for a non-success HTTP status
///
/// 502 is how the service reports a refused RPC call, so it counts as a
/// rejection along with client errors.
fn classify_status(status: StatusCode, body: &str) -> GatewayError {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());
    let message = format!("{}: {}", status.as_u16(), detail);

    if status == StatusCode::BAD_GATEWAY
        || (status.is_client_error() && status != StatusCode::UNAUTHORIZED)
    {
        GatewayError::Rejected(message)
    } else {
        GatewayError::Unavailable(message)
    }
}

fn entry_payload(request: &EntryRequest) -> ForceEntryPayload<'_> {
    ForceEntryPayload {
        pair: &request.pair,
        price: (request.order_type == OrderType::Limit).then_some(request.price),
        ordertype: request.order_type.as_str(),
        stakeamount: request.stake_amount,
        entry_tag: &request.tag,
        side: request.side.to_string(),
        leverage: request.leverage,
    }
}

fn fill_from_response(value: &Value, fallback_price: f64) -> GatewayFill {
    let trade_id = value.get("trade_id").and_then(|v| v.as_u64());
    let order_id = value
        .get("orders")
        .and_then(|o| o.as_array())
        .and_then(|orders| orders.last())
        .and_then(|o| o.get("order_id"))
        .and_then(|id| id.as_str())
        .map(str::to_string);

    GatewayFill {
        trade_id,
        order_id,
        amount: value.get("amount").and_then(|v| v.as_f64()).unwrap_or(0.0),
        price: value
            .get("open_rate")
            .and_then(|v| v.as_f64())
            .unwrap_or(fallback_price),
    }
}

#[async_trait]
impl ExecutionGateway for FreqtradeGateway {
    async fn open_trades(&self) -> Result<Vec<Trade>, GatewayError> {
        let value = self.request(Method::GET, "/api/v1/status", None).await?;
        if value.is_null() {
            return Ok(Vec::new());
        }
        serde_json::from_value(value)
            .map_err(|e| GatewayError::Unavailable(format!("status response: {}", e)))
    }

    async fn trade_slots(&self) -> Result<TradeSlots, GatewayError> {
        let value = self.request(Method::GET, "/api/v1/count", None).await?;
        let count: CountResponse = serde_json::from_value(value)
            .map_err(|e| GatewayError::Unavailable(format!("count response: {}", e)))?;

        let max = if count.max < 0 {
            u32::MAX
        } else {
            u32::try_from(count.max).unwrap_or(u32::MAX)
        };
        Ok(TradeSlots {
            current: count.current,
            max,
        })
    }

    async fn place_entry(&self, request: &EntryRequest) -> Result<GatewayFill, GatewayError> {
        let body = serde_json::to_value(entry_payload(request))
            .map_err(|e| GatewayError::Rejected(format!("payload: {}", e)))?;

        let value = self.request(Method::POST, "/api/v1/forcebuy", Some(&body)).await?;

        tracing::info!(
            pair = %request.pair,
            side = %request.side,
            price = request.price,
            tag = %request.tag,
            "Entry accepted"
        );
        Ok(fill_from_response(&value, request.price))
    }

    async fn close_or_reduce(&self, request: &ExitRequest) -> Result<GatewayFill, GatewayError> {
        let amount = match request.amount {
            Some(amount) => serde_json::json!(amount),
            None => Value::String("all".to_string()),
        };
        let payload = ForceExitPayload {
            tradeid: request.trade_id.to_string(),
            ordertype: request.order_type.as_str(),
            amount,
        };
        let body = serde_json::to_value(&payload)
            .map_err(|e| GatewayError::Rejected(format!("payload: {}", e)))?;

        let value = self.request(Method::POST, "/api/v1/forcesell", Some(&body)).await?;

        tracing::info!(trade_id = request.trade_id, amount = ?request.amount, "Exit accepted");
        Ok(GatewayFill {
            trade_id: Some(request.trade_id),
            order_id: None,
            amount: request.amount.unwrap_or(0.0),
            price: value.get("price").and_then(|v| v.as_f64()).unwrap_or(0.0),
        })
    }
}
