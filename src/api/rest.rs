//! REST handlers for the command bus.
//!
//! Mutating endpoints read the raw body first so HMAC verification covers
//! exactly the bytes on the wire, then parse JSON themselves. Validation
//! failures come back as 400 with a reason; authority holds come back as
//! 200 with an empty, held command list.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::auth::{signature_from_headers, HmacDenied};
use crate::domain::{AckOutcome, AckReport, NewCommand};
use crate::infra::OutboxError;
use crate::server::AppState;

type ApiError = (StatusCode, Json<Value>);
type ApiResult = Result<Json<Value>, ApiError>;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/commands/pull", post(pull_commands))
        .route("/api/commands/ack", post(ack_command))
        .route("/ops/enqueue", post(ops_enqueue))
}

// ===== Error Shaping =====

fn bad_request(msg: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "ok": false, "error": msg.into() })),
    )
}

fn unauthorized(denied: HmacDenied) -> ApiError {
    warn!(reason = denied.reason(), "rejected request signature");
    (
        StatusCode::UNAUTHORIZED,
        Json(json!({ "ok": false, "error": "unauthorized", "reason": denied.reason() })),
    )
}

fn internal(e: OutboxError) -> ApiError {
    warn!(error = %e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "ok": false, "error": e.to_string() })),
    )
}

fn parse_body<T: DeserializeOwned>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|e| bad_request(format!("invalid JSON body: {e}")))
}

fn check_hmac(state: &AppState, headers: &HeaderMap, body: &[u8], required: bool) -> Result<(), ApiError> {
    if !required {
        return Ok(());
    }
    state
        .hmac
        .verify(body, signature_from_headers(headers))
        .map_err(unauthorized)
}

// ===== Pull =====

#[derive(Debug, Deserialize)]
struct PullRequest {
    agent_id: Option<String>,
    max: Option<u32>,
}

async fn pull_commands(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    check_hmac(&state, &headers, &body, state.require_hmac_pull)?;
    let req: PullRequest = parse_body(&body)?;
    let Some(agent_id) = req.agent_id.filter(|a| !a.trim().is_empty()) else {
        return Err(bad_request("agent_id required"));
    };
    let now = Utc::now();

    let decision = state.authority.evaluate_agent(&agent_id, now).await;
    if !decision.trusted {
        info!(%agent_id, reason = %decision.reason, "pull held by authority gate");
        return Ok(Json(json!({
            "ok": true,
            "commands": [],
            "hold": true,
            "reason": decision.reason,
            "agent_id": agent_id,
            "age_sec": decision.age_sec,
        })));
    }

    let limit = req.max.unwrap_or(10).clamp(1, state.max_pull.max(1));
    let commands = state
        .store
        .pull(&agent_id, limit, state.lease_secs, now)
        .await
        .map_err(internal)?;
    if !commands.is_empty() {
        info!(%agent_id, leased = commands.len(), "leased commands");
    }
    Ok(Json(json!({ "ok": true, "commands": commands })))
}

// ===== Ack =====

#[derive(Debug, Deserialize)]
struct AckRequest {
    agent_id: Option<String>,
    id: Option<i64>,
    ok: Option<bool>,
    status: Option<String>,
    txid: Option<String>,
    message: Option<String>,
    result: Option<Value>,
}

async fn ack_command(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    // Acks terminate commands and write receipts; the signature is not
    // optional here, whatever the pull gate is set to.
    check_hmac(&state, &headers, &body, true)?;
    let req: AckRequest = parse_body(&body)?;
    let Some(agent_id) = req.agent_id.filter(|a| !a.trim().is_empty()) else {
        return Err(bad_request("agent_id required"));
    };
    let Some(cmd_id) = req.id else {
        return Err(bad_request("id required"));
    };
    let Some(ok) = req.ok else {
        return Err(bad_request("ok required"));
    };

    let report = AckReport {
        agent_id: agent_id.clone(),
        cmd_id,
        ok,
        status: req.status,
        txid: req.txid,
        message: req.message,
        result: req.result.unwrap_or_else(|| json!({})),
    };
    let outcome = state
        .store
        .ack(report, Utc::now())
        .await
        .map_err(internal)?;

    match outcome {
        AckOutcome::Applied { status } => {
            info!(%agent_id, cmd_id, status = %status, "command acknowledged");
            Ok(Json(json!({ "ok": true })))
        }
        AckOutcome::AlreadyAcked => Ok(Json(json!({ "ok": true, "already_acked": true }))),
        AckOutcome::Rejected(rejection) => {
            warn!(%agent_id, cmd_id, reason = rejection.reason(), "ack rejected");
            Err((
                StatusCode::CONFLICT,
                Json(json!({ "ok": false, "error": rejection.reason() })),
            ))
        }
    }
}

// ===== Ops Enqueue =====

#[derive(Debug, Deserialize)]
struct OpsEnqueueRequest {
    agent_id: Option<String>,
    agents: Option<String>,
    venue: Option<String>,
    symbol: Option<String>,
    side: Option<String>,
    mode: Option<String>,
    amount: Option<f64>,
    quote_amount: Option<f64>,
    not_before: Option<i64>,
    dedupe_key: Option<String>,
}

fn require_upper(value: Option<String>, field: &str) -> Result<String, ApiError> {
    match value.map(|v| v.trim().to_uppercase()).filter(|v| !v.is_empty()) {
        Some(v) => Ok(v),
        None => Err(bad_request(format!("missing field: {field}"))),
    }
}

async fn ops_enqueue(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult {
    check_hmac(&state, &headers, &body, state.require_hmac_ops)?;
    let req: OpsEnqueueRequest = parse_body(&body)?;

    let agents: Vec<String> = match (&req.agents, &req.agent_id) {
        (Some(csv), _) => csv
            .split(',')
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(String::from)
            .collect(),
        (None, Some(one)) if !one.trim().is_empty() => vec![one.trim().to_string()],
        _ => Vec::new(),
    };
    if agents.is_empty() {
        return Err(bad_request("agent_id or agents required"));
    }

    let venue = require_upper(req.venue, "venue")?;
    let symbol = require_upper(req.symbol, "symbol")?;
    let side = require_upper(req.side, "side")?;
    let mode = req
        .mode
        .map(|m| m.trim().to_uppercase())
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| "SPOT".to_string());

    let mut payload = json!({
        "venue": venue,
        "symbol": symbol,
        "side": side,
        "mode": mode,
    });
    match (req.quote_amount, req.amount) {
        (Some(quote), _) => payload["quote_amount"] = json!(quote),
        (None, Some(amount)) => payload["amount"] = json!(amount),
        (None, None) => return Err(bad_request("amount or quote_amount required")),
    }

    let not_before: Option<DateTime<Utc>> = match req.not_before {
        Some(secs) if secs > 0 => Some(
            DateTime::from_timestamp(secs, 0)
                .ok_or_else(|| bad_request("not_before out of range"))?,
        ),
        _ => None,
    };

    let now = Utc::now();
    let mut results = Vec::with_capacity(agents.len());
    for agent in &agents {
        let outcome = state
            .store
            .enqueue(
                NewCommand {
                    agent_id: agent.clone(),
                    kind: "order.place".to_string(),
                    payload: payload.clone(),
                    not_before,
                    dedupe_key: req.dedupe_key.clone(),
                },
                now,
            )
            .await
            .map_err(internal)?;
        info!(
            %agent,
            cmd_id = outcome.id(),
            duplicate = outcome.is_duplicate(),
            "enqueued command"
        );
        results.push(json!({
            "agent": agent,
            "id": outcome.id(),
            "duplicate": outcome.is_duplicate(),
        }));
    }

    Ok(Json(json!({ "ok": true, "results": results })))
}
