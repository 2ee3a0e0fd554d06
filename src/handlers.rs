//! HTTP endpoints of the relay.
//!
//! Handlers are generic over [`Relay`]; everything they return is JSON. Failures are
//! rendered as `{error, details?}` where `error` is a stable reason code, except for a
//! rate-limited sponsorship which carries `nextDripAvailable`.

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router, response::IntoResponse};
use serde_json::json;
use tracing::instrument;

use crate::error::RelayError;
use crate::relay::Relay;
use crate::types::{
    ErrorResponse, EvmAddress, HexEncodedNonce, RateLimitedResponse, SponsorRequest,
    SubmitRequest,
};

pub fn routes<A>() -> Router<A>
where
    A: Relay + Clone + Send + Sync + 'static,
    A::Error: IntoResponse,
{
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health::<A>))
        .route("/relay/transfer", post(post_transfer::<A>))
        .route("/relay/facilitator", get(get_facilitators::<A>))
        .route("/relay/facilitator/{chain_id}", get(get_facilitator::<A>))
        .route("/gas/sponsor", post(post_sponsor::<A>))
        .route(
            "/authorizations/party/{address}",
            get(get_authorizations_by_party::<A>),
        )
        .route(
            "/authorizations/{chain_id}/{nonce}",
            get(get_authorization::<A>),
        )
        .route(
            "/authorizations/{chain_id}/{nonce}/attempts",
            get(get_attempts::<A>),
        )
        .route(
            "/authorizations/{chain_id}/{nonce}/cancel",
            post(post_cancel::<A>),
        )
}

/// `GET /`: Returns a simple greeting message from the relay.
#[instrument(skip_all)]
pub async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    (StatusCode::OK, format!("Hello from {pkg_name}!"))
}

/// `GET /health`: Lists the chains this relay submits to.
#[instrument(skip_all)]
pub async fn get_health<A>(State(relay): State<A>) -> impl IntoResponse
where
    A: Relay,
    A::Error: IntoResponse,
{
    match relay.facilitators().await {
        Ok(facilitators) => {
            let chains: Vec<u64> = facilitators.iter().map(|f| f.chain_id).collect();
            (StatusCode::OK, Json(json!({ "status": "ok", "chains": chains }))).into_response()
        }
        Err(error) => error.into_response(),
    }
}

/// `POST /relay/transfer`: Submits a signed `transferWithAuthorization` and waits for the
/// outcome. Responds with `{txHash}` once the transfer is confirmed.
#[instrument(skip_all)]
pub async fn post_transfer<A>(
    State(relay): State<A>,
    body: Result<Json<SubmitRequest>, JsonRejection>,
) -> impl IntoResponse
where
    A: Relay,
    A::Error: IntoResponse,
{
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return malformed(rejection.body_text()),
    };
    match relay.submit(&body).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(error) => {
            tracing::warn!(
                error = %error,
                chain_id = body.chain_id,
                user = %body.user_address,
                nonce = %body.nonce,
                "Transfer submission failed"
            );
            error.into_response()
        }
    }
}

/// `GET /relay/facilitator`: The relay account on every configured chain.
#[instrument(skip_all)]
pub async fn get_facilitators<A>(State(relay): State<A>) -> impl IntoResponse
where
    A: Relay,
    A::Error: IntoResponse,
{
    match relay.facilitators().await {
        Ok(facilitators) => (StatusCode::OK, Json(facilitators)).into_response(),
        Err(error) => error.into_response(),
    }
}

#[instrument(skip_all)]
pub async fn get_facilitator<A>(
    State(relay): State<A>,
    chain_id: Result<Path<u64>, PathRejection>,
) -> impl IntoResponse
where
    A: Relay,
    A::Error: IntoResponse,
{
    let Path(chain_id) = match chain_id {
        Ok(path) => path,
        Err(rejection) => return malformed(rejection.body_text()),
    };
    match relay.facilitator(chain_id).await {
        Ok(facilitator) => (StatusCode::OK, Json(facilitator)).into_response(),
        Err(error) => error.into_response(),
    }
}

/// `POST /gas/sponsor`: Drips native gas to an account that cannot pay for its own
/// transactions.
#[instrument(skip_all)]
pub async fn post_sponsor<A>(
    State(relay): State<A>,
    body: Result<Json<SponsorRequest>, JsonRejection>,
) -> impl IntoResponse
where
    A: Relay,
    A::Error: IntoResponse,
{
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return malformed(rejection.body_text()),
    };
    match relay.sponsor(&body).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(error) => error.into_response(),
    }
}

#[instrument(skip_all)]
pub async fn get_authorizations_by_party<A>(
    State(relay): State<A>,
    party: Result<Path<EvmAddress>, PathRejection>,
) -> impl IntoResponse
where
    A: Relay,
    A::Error: IntoResponse,
{
    let Path(party) = match party {
        Ok(path) => path,
        Err(rejection) => return malformed(rejection.body_text()),
    };
    match relay.authorizations_by_party(party).await {
        Ok(records) => (StatusCode::OK, Json(records)).into_response(),
        Err(error) => error.into_response(),
    }
}

#[instrument(skip_all)]
pub async fn get_authorization<A>(
    State(relay): State<A>,
    key: Result<Path<(u64, HexEncodedNonce)>, PathRejection>,
) -> impl IntoResponse
where
    A: Relay,
    A::Error: IntoResponse,
{
    let Path((chain_id, nonce)) = match key {
        Ok(path) => path,
        Err(rejection) => return malformed(rejection.body_text()),
    };
    match relay.authorization(chain_id, nonce).await {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(error) => error.into_response(),
    }
}

/// `GET /authorizations/{chainId}/{nonce}/attempts`: The attempt log for a nonce, including
/// rejections that never created a record.
#[instrument(skip_all)]
pub async fn get_attempts<A>(
    State(relay): State<A>,
    key: Result<Path<(u64, HexEncodedNonce)>, PathRejection>,
) -> impl IntoResponse
where
    A: Relay,
    A::Error: IntoResponse,
{
    let Path((chain_id, nonce)) = match key {
        Ok(path) => path,
        Err(rejection) => return malformed(rejection.body_text()),
    };
    match relay.attempts(chain_id, nonce).await {
        Ok(attempts) => (StatusCode::OK, Json(attempts)).into_response(),
        Err(error) => error.into_response(),
    }
}

/// `POST /authorizations/{chainId}/{nonce}/cancel`: Operator cancellation of a pending
/// authorization. Requires `Authorization: Bearer <token>`.
#[instrument(skip_all)]
pub async fn post_cancel<A>(
    headers: HeaderMap,
    State(relay): State<A>,
    key: Result<Path<(u64, HexEncodedNonce)>, PathRejection>,
) -> impl IntoResponse
where
    A: Relay,
    A::Error: IntoResponse,
{
    let Path((chain_id, nonce)) = match key {
        Ok(path) => path,
        Err(rejection) => return malformed(rejection.body_text()),
    };
    match relay.cancel(chain_id, nonce, bearer_token(&headers)).await {
        Ok(record) => (StatusCode::OK, Json(record)).into_response(),
        Err(error) => error.into_response(),
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
}

fn malformed(message: String) -> Response {
    RelayError::Malformed(message).into_response()
}

impl RelayError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RelayError::UnsupportedChain(_)
            | RelayError::UnsupportedToken { .. }
            | RelayError::Malformed(_)
            | RelayError::InvalidWindow { .. }
            | RelayError::NotYetValid { .. }
            | RelayError::Expired { .. }
            | RelayError::InvalidSignature {
                on_chain: false, ..
            } => StatusCode::BAD_REQUEST,
            RelayError::DuplicateNonce { .. }
            | RelayError::AlreadyUsed { .. }
            | RelayError::Cancelled => StatusCode::CONFLICT,
            RelayError::InsufficientGas { .. } | RelayError::NetworkUnavailable(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            RelayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            RelayError::SimulationReverted(_) | RelayError::Reverted { .. } | RelayError::Chain(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            RelayError::NotFound => StatusCode::NOT_FOUND,
            RelayError::Unauthorized => StatusCode::UNAUTHORIZED,
            RelayError::InvalidSignature { on_chain: true, .. }
            | RelayError::Clock(_)
            | RelayError::Unknown(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Relay error");
        }
        match &self {
            RelayError::RateLimited {
                next_drip_available,
            } => (
                status,
                Json(RateLimitedResponse {
                    error: self.code().to_string(),
                    next_drip_available: *next_drip_available,
                }),
            )
                .into_response(),
            _ => (
                status,
                Json(ErrorResponse {
                    error: self.code().to_string(),
                    details: self.details(),
                }),
            )
                .into_response(),
        }
    }
}
