//! Tenant-facing HTTP surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::body::{Body, Bytes};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use tracing::{debug, warn};

use super::channel::ChannelId;
use super::context::TenantContext;
use super::dispatch::{DispatchRequest, RelayBody};
use super::request::ChatRequest;
use super::scrub::message_with_request_id;
use super::settings::GatewaySettings;
use super::store::{StoreError, TenantResolver};
use super::{ErrorBody, GATEWAY_ERROR_TYPE, Gateway, GatewayError, now_millis};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const CHANNEL_OVERRIDE_HEADER: &str = "x-channel-id";

/// Unlimited tokens report this as their limit.
const UNLIMITED_DISPLAY_AMOUNT: f64 = 100_000_000.0;
const SECONDS_PER_DAY: i64 = 86_400;

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Clone)]
pub struct GatewayHttpState {
    gateway: Gateway,
    tenants: Arc<dyn TenantResolver>,
}

impl GatewayHttpState {
    pub fn new(gateway: Gateway, tenants: Arc<dyn TenantResolver>) -> Self {
        Self { gateway, tenants }
    }

    pub fn gateway(&self) -> &Gateway {
        &self.gateway
    }
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Serialize)]
struct SubscriptionResponse {
    object: &'static str,
    has_payment_method: bool,
    soft_limit_usd: f64,
    hard_limit_usd: f64,
    system_hard_limit_usd: f64,
    access_until: i64,
}

#[derive(Debug, Serialize)]
struct UsageResponse {
    object: &'static str,
    total_usage: f64,
}

#[derive(Debug, Deserialize)]
struct UsageQuery {
    start_date: Option<String>,
    end_date: Option<String>,
}

pub fn router(state: GatewayHttpState) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(handle_chat_completions))
        .route("/v1/dashboard/billing/subscription", get(handle_subscription))
        .route("/dashboard/billing/subscription", get(handle_subscription))
        .route("/v1/dashboard/billing/usage", get(handle_usage))
        .route("/dashboard/billing/usage", get(handle_usage))
        .fallback(handle_fallback)
        .with_state(state)
}

fn generate_request_id() -> String {
    let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{}{seq:06}", now_millis())
}

fn request_id_from(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(generate_request_id)
}

fn error_response(status: u16, error: ErrorBody, request_id: &str) -> Response {
    let status = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut response = (status, Json(ErrorResponse { error })).into_response();
    attach_request_id(&mut response, request_id);
    response
}

/// Error raised by the gateway itself before or around dispatch.
fn local_error(status: StatusCode, code: &str, message: &str, request_id: &str) -> Response {
    let body = ErrorBody::new(
        message_with_request_id(message, request_id),
        GATEWAY_ERROR_TYPE,
        code,
    );
    error_response(status.as_u16(), body, request_id)
}

fn gateway_error(err: GatewayError, request_id: &str) -> Response {
    if let GatewayError::Internal { code, message } = &err {
        warn!(request_id, code, error = %message, "request failed");
    }
    let mut body = err.public_body();
    body.message = message_with_request_id(&body.message, request_id);
    error_response(err.status(), body, request_id)
}

fn attach_request_id(response: &mut Response, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
}

fn bearer_key(headers: &HeaderMap) -> Option<&str> {
    let raw = headers.get(header::AUTHORIZATION)?.to_str().ok()?.trim();
    let key = raw
        .strip_prefix("Bearer ")
        .or_else(|| raw.strip_prefix("bearer "))
        .unwrap_or(raw)
        .trim();
    (!key.is_empty()).then_some(key)
}

async fn authenticate(
    state: &GatewayHttpState,
    headers: &HeaderMap,
    request_id: &str,
) -> Result<TenantContext, Response> {
    let Some(key) = bearer_key(headers) else {
        return Err(local_error(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key",
            "missing api key in the Authorization header",
            request_id,
        ));
    };
    match state.tenants.resolve(key).await {
        Ok(Some(tenant)) => Ok(tenant),
        Ok(None) => Err(local_error(
            StatusCode::UNAUTHORIZED,
            "invalid_api_key",
            "invalid or expired api key",
            request_id,
        )),
        Err(err) => Err(gateway_error(err.into(), request_id)),
    }
}

fn pinned_channel(
    headers: &HeaderMap,
    tenant: &TenantContext,
    request_id: &str,
) -> Result<Option<ChannelId>, Response> {
    let Some(raw) = headers.get(CHANNEL_OVERRIDE_HEADER) else {
        return Ok(None);
    };
    if !tenant.can_pin_channel {
        return Err(local_error(
            StatusCode::FORBIDDEN,
            "channel_override_forbidden",
            "this token may not select a service node",
            request_id,
        ));
    }
    raw.to_str()
        .ok()
        .and_then(|value| value.trim().parse::<i64>().ok())
        .map(|id| Some(ChannelId(id)))
        .ok_or_else(|| {
            local_error(
                StatusCode::BAD_REQUEST,
                "invalid_channel_id",
                "Invalid server node ID",
                request_id,
            )
        })
}

async fn handle_chat_completions(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = request_id_from(&headers);
    let tenant = match authenticate(&state, &headers, &request_id).await {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    let pinned = match pinned_channel(&headers, &tenant, &request_id) {
        Ok(pinned) => pinned,
        Err(response) => return response,
    };
    let chat: ChatRequest = match serde_json::from_slice(&body) {
        Ok(chat) => chat,
        Err(err) => {
            debug!(request_id = %request_id, error = %err, "request body rejected");
            return local_error(
                StatusCode::BAD_REQUEST,
                "bind_request_body_failed",
                &format!("invalid request body: {err}"),
                &request_id,
            );
        }
    };

    let outcome = state
        .gateway
        .dispatcher
        .dispatch(DispatchRequest {
            request_id: request_id.clone(),
            tenant,
            pinned_channel: pinned,
            body: chat,
        })
        .await;

    match outcome {
        Ok(success) => {
            let mut response = match success.body {
                RelayBody::Json(value) => (StatusCode::OK, Json(value)).into_response(),
                RelayBody::Stream(stream) => {
                    let mut response = Response::new(Body::from_stream(stream));
                    let headers = response.headers_mut();
                    headers.insert(
                        header::CONTENT_TYPE,
                        HeaderValue::from_static("text/event-stream"),
                    );
                    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));
                    headers.insert("x-accel-buffering", HeaderValue::from_static("no"));
                    response
                }
            };
            attach_request_id(&mut response, &request_id);
            response
        }
        Err(err) => error_response(err.status, err.error, &request_id),
    }
}

fn display_amount(quota: i64, settings: &GatewaySettings) -> f64 {
    let amount = quota as f64;
    if settings.display_in_currency && settings.quota_per_unit > 0.0 {
        amount / settings.quota_per_unit
    } else {
        amount
    }
}

async fn handle_subscription(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
) -> Response {
    let request_id = request_id_from(&headers);
    let tenant = match authenticate(&state, &headers, &request_id).await {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    match subscription(&state, &tenant).await {
        Ok(body) => Json(body).into_response(),
        Err(err) => gateway_error(err.into(), &request_id),
    }
}

async fn subscription(
    state: &GatewayHttpState,
    tenant: &TenantContext,
) -> Result<SubscriptionResponse, StoreError> {
    let settings = state.gateway.settings.current();
    let quota = &state.gateway.quota;
    let (total, access_until) = if settings.display_token_stat {
        let account = quota
            .token_account(tenant.token_id)
            .await?
            .ok_or(StoreError::TokenNotFound(tenant.token_id))?;
        (
            account.remaining_quota + account.used_quota,
            account.expires_at.unwrap_or(0).max(0),
        )
    } else {
        let remaining = quota.tenant_balance(tenant.tenant_id).await?;
        let used = quota.tenant_used_quota(tenant.tenant_id).await?;
        (remaining + used, 0)
    };

    let amount = if tenant.unlimited {
        UNLIMITED_DISPLAY_AMOUNT
    } else {
        display_amount(total, &settings)
    };
    Ok(SubscriptionResponse {
        object: "billing_subscription",
        has_payment_method: true,
        soft_limit_usd: amount,
        hard_limit_usd: amount,
        system_hard_limit_usd: amount,
        access_until,
    })
}

fn parse_day(raw: &str) -> Option<i64> {
    let date = time::Date::parse(raw.trim(), format_description!("[year]-[month]-[day]")).ok()?;
    Some(date.midnight().assume_utc().unix_timestamp())
}

async fn handle_usage(
    State(state): State<GatewayHttpState>,
    headers: HeaderMap,
    Query(query): Query<UsageQuery>,
) -> Response {
    let request_id = request_id_from(&headers);
    let tenant = match authenticate(&state, &headers, &request_id).await {
        Ok(tenant) => tenant,
        Err(response) => return response,
    };
    let settings = state.gateway.settings.current();
    let quota = &state.gateway.quota;

    let used = if settings.display_token_stat {
        let from = match query.start_date.as_deref() {
            None => 0,
            Some(raw) => match parse_day(raw) {
                Some(epoch) => epoch,
                None => {
                    return local_error(
                        StatusCode::BAD_REQUEST,
                        "invalid_start_date",
                        "start_date must be YYYY-MM-DD",
                        &request_id,
                    );
                }
            },
        };
        // The end date is inclusive of the whole day.
        let to = match query.end_date.as_deref() {
            None => (now_millis() / 1000) as i64,
            Some(raw) => match parse_day(raw) {
                Some(epoch) => epoch + SECONDS_PER_DAY - 1,
                None => {
                    return local_error(
                        StatusCode::BAD_REQUEST,
                        "invalid_end_date",
                        "end_date must be YYYY-MM-DD",
                        &request_id,
                    );
                }
            },
        };
        quota.period_quota_sum(tenant.tenant_id, from, to).await
    } else {
        quota.tenant_used_quota(tenant.tenant_id).await
    };

    match used {
        Ok(used) => Json(UsageResponse {
            object: "list",
            total_usage: display_amount(used, &settings) * 100.0,
        })
        .into_response(),
        Err(err) => gateway_error(err.into(), &request_id),
    }
}

async fn handle_fallback(method: Method, uri: Uri) -> Response {
    let request_id = generate_request_id();
    local_error(
        StatusCode::NOT_FOUND,
        "invalid_url",
        &format!("Invalid URL ({method} {})", uri.path()),
        &request_id,
    )
}
