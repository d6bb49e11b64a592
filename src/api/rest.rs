// =============================================================================
// REST Control Surface (§6)
// =============================================================================
//
// Grounded on the teacher's `api/rest.rs`: Axum `Router` construction, a
// permissive dev-mode `CorsLayer`, and the `AuthBearer` extractor gating
// every mutating route. Endpoint surface itself is new — the teacher never
// exposed an order/strategy/risk control plane, only a read-only dashboard
// feed — built directly from §6's endpoint table.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};

use crate::api::auth::AuthBearer;
use crate::context::CoreContext;
use crate::domain::{OrderSide, StrategyConfig, StrategyKind};
use crate::error::EngineError;
use crate::order_manager::BracketOpts;

pub fn router(ctx: Arc<CoreContext>) -> Router {
    let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any);

    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/accounts", get(list_accounts))
        .route("/api/accounts/:id/switch", post(switch_account))
        .route("/api/account", get(selected_account))
        .route("/api/positions", get(list_positions))
        .route("/api/positions/:id/close", post(close_position))
        .route("/api/positions/flatten", post(flatten_all))
        .route("/api/orders", get(list_orders).delete(cancel_all_orders))
        .route("/api/orders/place", post(place_order))
        .route("/api/orders/:id", delete(cancel_order))
        .route("/api/trades", get(list_trades))
        .route("/api/trades/export", get(export_trades_csv))
        .route("/api/historical-data", get(historical_data))
        .route("/api/strategies", get(list_strategies))
        .route("/api/strategies/:name/start", post(start_strategy))
        .route("/api/strategies/:name/stop", post(stop_strategy))
        .route("/api/strategies/:name/config", post(update_strategy_config))
        .route("/api/strategies/:name/stats", get(strategy_stats))
        .route("/api/strategies/:name/verify", get(strategy_verify))
        .route("/api/risk", get(risk_snapshot))
        .route("/api/notifications", get(notifications))
        .route("/api/settings/:scope", get(get_settings))
        .route("/api/settings", post(upsert_setting))
        .route("/api/stream", get(crate::api::stream::stream_handler))
        .layer(cors)
        .with_state(ctx)
}

// -- error envelope (§6) ------------------------------------------------------

#[derive(Serialize)]
struct ErrorEnvelope {
    error: String,
    code: &'static str,
}

fn error_response(err: EngineError) -> (StatusCode, Json<ErrorEnvelope>) {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(ErrorEnvelope { error: err.to_string(), code: err.code() }))
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorEnvelope>)>;

// -- health (public) -----------------------------------------------------------

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    server_time: i64,
}

async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok", server_time: chrono::Utc::now().timestamp_millis() })
}

// -- accounts --------------------------------------------------------------

async fn list_accounts(_auth: AuthBearer, State(ctx): State<Arc<CoreContext>>) -> ApiResult<Vec<crate::domain::Account>> {
    ctx.broker.list_accounts().await.map(Json).map_err(error_response)
}

#[derive(Serialize)]
struct SwitchResponse {
    account_id: String,
}

async fn switch_account(
    _auth: AuthBearer,
    State(ctx): State<Arc<CoreContext>>,
    Path(id): Path<String>,
) -> ApiResult<SwitchResponse> {
    ctx.store.set_setting("session", "active_account_id", &serde_json::json!(id)).ok();
    Ok(Json(SwitchResponse { account_id: id }))
}

async fn selected_account(_auth: AuthBearer, State(ctx): State<Arc<CoreContext>>) -> ApiResult<crate::domain::Account> {
    let account_id = active_account_id(&ctx);
    let accounts = ctx.broker.list_accounts().await.map_err(error_response)?;
    accounts
        .into_iter()
        .find(|a| a.id == account_id)
        .map(Json)
        .ok_or_else(|| error_response(EngineError::NoContract(account_id)))
}

fn active_account_id(ctx: &CoreContext) -> String {
    ctx.store
        .get_setting("session", "active_account_id")
        .ok()
        .flatten()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_else(|| "DEFAULT".to_string())
}

// -- positions ---------------------------------------------------------------

#[derive(Deserialize)]
struct AccountQuery {
    account_id: Option<String>,
}

async fn list_positions(
    _auth: AuthBearer,
    State(ctx): State<Arc<CoreContext>>,
    Query(q): Query<AccountQuery>,
) -> ApiResult<Vec<crate::domain::Position>> {
    let account_id = q.account_id.unwrap_or_else(|| active_account_id(&ctx));
    Ok(Json(ctx.accounts.snapshot(&account_id).positions))
}

#[derive(Deserialize, Default)]
struct ClosePositionRequest {
    account_id: Option<String>,
    #[serde(default)]
    quantity: Option<f64>,
}

#[derive(Serialize)]
struct AckResponse {
    ok: bool,
}

async fn close_position(
    _auth: AuthBearer,
    State(ctx): State<Arc<CoreContext>>,
    Path(symbol): Path<String>,
    body: Option<Json<ClosePositionRequest>>,
) -> ApiResult<AckResponse> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let account_id = req.account_id.unwrap_or_else(|| active_account_id(&ctx));
    let orders = ctx.order_manager_for(&account_id).ok_or_else(|| error_response(EngineError::NoContract(account_id.clone())))?;
    // Partial close by quantity isn't modeled separately from a full flatten
    // in this surface; `quantity` is accepted for schema compatibility but a
    // close always flattens the whole symbol (§4.I only defines a full
    // flatten operation).
    let _ = req.quantity;
    orders.flatten_symbol(&account_id, &symbol).await.map(|_| Json(AckResponse { ok: true })).map_err(error_response)
}

async fn flatten_all(
    _auth: AuthBearer,
    State(ctx): State<Arc<CoreContext>>,
    Query(q): Query<AccountQuery>,
) -> ApiResult<AckResponse> {
    let account_id = q.account_id.unwrap_or_else(|| active_account_id(&ctx));
    let orders = ctx.order_manager_for(&account_id).ok_or_else(|| error_response(EngineError::NoContract(account_id.clone())))?;
    orders.flatten_all(&account_id).await.map(|_| Json(AckResponse { ok: true })).map_err(error_response)
}

// -- orders ------------------------------------------------------------------

async fn list_orders(
    _auth: AuthBearer,
    State(ctx): State<Arc<CoreContext>>,
    Query(q): Query<AccountQuery>,
) -> ApiResult<Vec<crate::domain::Order>> {
    let account_id = q.account_id.unwrap_or_else(|| active_account_id(&ctx));
    ctx.broker.get_orders(&account_id).await.map(Json).map_err(error_response)
}

/// `/api/orders/place` request schema (§6): ticks and price fields are
/// mutually exclusive; stop-entry brackets require absolute prices.
#[derive(Deserialize)]
struct PlaceOrderRequest {
    symbol: String,
    side: String,
    quantity: f64,
    order_type: String,
    #[serde(default)]
    limit_price: Option<f64>,
    #[serde(default)]
    stop_price: Option<f64>,
    #[serde(default)]
    stop_loss_ticks: Option<f64>,
    #[serde(default)]
    take_profit_ticks: Option<f64>,
    #[serde(default)]
    stop_loss_price: Option<f64>,
    #[serde(default)]
    take_profit_price: Option<f64>,
    #[serde(default)]
    enable_bracket: bool,
    #[serde(default)]
    reduce_only: bool,
    #[serde(default = "default_tif")]
    time_in_force: String,
    account_id: String,
}

fn default_tif() -> String {
    "DAY".to_string()
}

async fn place_order(
    _auth: AuthBearer,
    State(ctx): State<Arc<CoreContext>>,
    Json(req): Json<PlaceOrderRequest>,
) -> ApiResult<crate::domain::Order> {
    let side = match req.side.to_uppercase().as_str() {
        "BUY" => OrderSide::Buy,
        "SELL" => OrderSide::Sell,
        other => return Err(error_response(EngineError::InvalidInput(format!("unknown side: {other}")))),
    };
    let order_type = req.order_type.to_lowercase();
    let has_tick_fields = req.stop_loss_ticks.is_some() || req.take_profit_ticks.is_some();
    let has_price_fields = req.stop_loss_price.is_some() || req.take_profit_price.is_some();
    if has_tick_fields && has_price_fields {
        return Err(error_response(EngineError::InvalidInput(
            "stop_loss/take_profit ticks and prices are mutually exclusive".to_string(),
        )));
    }
    if req.quantity < 1.0 {
        return Err(error_response(EngineError::InvalidInput("quantity must be >= 1".to_string())));
    }

    let contract = ctx.broker.get_contract(&req.symbol).await.map_err(error_response)?;
    let orders = ctx
        .order_manager_for(&req.account_id)
        .ok_or_else(|| error_response(EngineError::NoContract(req.account_id.clone())))?;

    let resolve_sl = || {
        req.stop_loss_price
            .or_else(|| req.stop_loss_ticks.map(|t| t * contract.tick_size))
    };
    let resolve_tp = || {
        req.take_profit_price
            .or_else(|| req.take_profit_ticks.map(|t| t * contract.tick_size))
    };

    let opts = BracketOpts {
        stop_loss_price: if req.enable_bracket { resolve_sl() } else { None },
        take_profit_price: if req.enable_bracket { resolve_tp() } else { None },
        reduce_only: req.reduce_only,
        idempotency_key: None,
    };

    let result = match order_type.as_str() {
        "market" => orders.submit_market(&req.account_id, &req.symbol, side, req.quantity, &contract, opts).await,
        "stop" => {
            let Some(stop_price) = req.stop_price else {
                return Err(error_response(EngineError::InvalidInput("stop orders require stop_price".to_string())));
            };
            orders.submit_stop_entry(&req.account_id, &req.symbol, side, req.quantity, stop_price, &contract, opts).await
        }
        "limit" => {
            let Some(limit_price) = req.limit_price else {
                return Err(error_response(EngineError::InvalidInput("limit orders require limit_price".to_string())));
            };
            orders.submit_limit(&req.account_id, &req.symbol, side, req.quantity, limit_price, &contract, opts).await
        }
        other => Err(EngineError::InvalidInput(format!("unknown order_type: {other}"))),
    };
    result.map(Json).map_err(error_response)
}

async fn cancel_order(_auth: AuthBearer, State(ctx): State<Arc<CoreContext>>, Path(id): Path<String>) -> ApiResult<AckResponse> {
    ctx.broker.cancel_order(&id).await.map(|_| Json(AckResponse { ok: true })).map_err(error_response)
}

async fn cancel_all_orders(
    _auth: AuthBearer,
    State(ctx): State<Arc<CoreContext>>,
    Query(q): Query<AccountQuery>,
) -> ApiResult<AckResponse> {
    let account_id = q.account_id.unwrap_or_else(|| active_account_id(&ctx));
    ctx.broker.cancel_all_for_account(&account_id).await.map(|_| Json(AckResponse { ok: true })).map_err(error_response)
}

// -- trades ------------------------------------------------------------------

#[derive(Deserialize)]
struct TradesQuery {
    account_id: Option<String>,
    limit: Option<i64>,
    #[serde(rename = "type")]
    symbol: Option<String>,
}

async fn list_trades(
    _auth: AuthBearer,
    State(ctx): State<Arc<CoreContext>>,
    Query(q): Query<TradesQuery>,
) -> ApiResult<Vec<crate::domain::TradeRecord>> {
    let account_id = q.account_id.unwrap_or_else(|| active_account_id(&ctx));
    let limit = q.limit.unwrap_or(100);
    ctx.store
        .load_trades(&account_id, limit, q.symbol.as_deref())
        .map(Json)
        .map_err(|e| error_response(EngineError::Internal(e.to_string())))
}

async fn export_trades_csv(
    _auth: AuthBearer,
    State(ctx): State<Arc<CoreContext>>,
    Query(q): Query<TradesQuery>,
) -> Result<impl IntoResponse, (StatusCode, Json<ErrorEnvelope>)> {
    let account_id = q.account_id.unwrap_or_else(|| active_account_id(&ctx));
    let limit = q.limit.unwrap_or(1000);
    let trades = ctx
        .store
        .load_trades(&account_id, limit, q.symbol.as_deref())
        .map_err(|e| error_response(EngineError::Internal(e.to_string())))?;

    let mut csv = String::from("id,symbol,side,quantity,entry_price,exit_price,entry_time,exit_time,gross_pnl,fees,net_pnl\n");
    for t in &trades {
        csv.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{},{}\n",
            t.id, t.symbol, t.side, t.quantity, t.entry_price, t.exit_price, t.entry_time, t.exit_time, t.gross_pnl, t.fees, t.net_pnl
        ));
    }
    Ok(([(axum::http::header::CONTENT_TYPE, "text/csv")], csv))
}

// -- historical data -----------------------------------------------------------

#[derive(Deserialize)]
struct HistoricalQuery {
    symbol: String,
    timeframe: String,
    limit: Option<usize>,
    end: Option<i64>,
}

async fn historical_data(
    _auth: AuthBearer,
    State(ctx): State<Arc<CoreContext>>,
    Query(q): Query<HistoricalQuery>,
) -> ApiResult<Vec<crate::domain::Bar>> {
    let tf = parse_timeframe_param(&q.timeframe)
        .ok_or_else(|| error_response(EngineError::InvalidInput(format!("bad timeframe: {}", q.timeframe))))?;
    let end = q.end.unwrap_or_else(|| chrono::Utc::now().timestamp());
    let limit = q.limit.unwrap_or(500);
    let span_secs = tf.seconds().unwrap_or(60) * limit as i64 * 2;
    let start = end - span_secs;
    ctx.historical
        .get_bars(&q.symbol, tf, start, end, false, limit)
        .await
        .map(Json)
        .map_err(error_response)
}

fn parse_timeframe_param(s: &str) -> Option<crate::domain::Timeframe> {
    let (value_str, unit_str) = s.split_at(s.len().checked_sub(1)?);
    let value: u32 = value_str.parse().ok()?;
    use crate::domain::TimeframeUnit;
    Some(match unit_str {
        "s" => crate::domain::Timeframe { value, unit: TimeframeUnit::Second },
        "m" => crate::domain::Timeframe { value, unit: TimeframeUnit::Minute },
        "h" => crate::domain::Timeframe { value, unit: TimeframeUnit::Hour },
        "d" => crate::domain::Timeframe { value, unit: TimeframeUnit::Day },
        _ => return None,
    })
}

// -- strategies ----------------------------------------------------------------

#[derive(Serialize)]
struct StrategySummary {
    name: StrategyKind,
    status: String,
}

async fn list_strategies(_auth: AuthBearer, State(ctx): State<Arc<CoreContext>>) -> ApiResult<Vec<StrategySummary>> {
    let account_id = active_account_id(&ctx);
    let kinds = [StrategyKind::OvernightRange, StrategyKind::MeanReversion, StrategyKind::TrendFollowing];
    let summaries = kinds
        .into_iter()
        .map(|kind| {
            let status = ctx.strategies.snapshot(&account_id, kind).map(|s| s.status.to_string()).unwrap_or_else(|| "DISABLED".to_string());
            StrategySummary { name: kind, status }
        })
        .collect();
    Ok(Json(summaries))
}

fn parse_strategy_kind(name: &str) -> Option<StrategyKind> {
    match name {
        "OvernightRange" => Some(StrategyKind::OvernightRange),
        "MeanReversion" => Some(StrategyKind::MeanReversion),
        "TrendFollowing" => Some(StrategyKind::TrendFollowing),
        _ => None,
    }
}

#[derive(Deserialize, Default)]
struct StrategyStartRequest {
    #[serde(default)]
    symbols: Vec<String>,
    account_id: String,
}

async fn start_strategy(
    _auth: AuthBearer,
    State(ctx): State<Arc<CoreContext>>,
    Path(name): Path<String>,
    Json(req): Json<StrategyStartRequest>,
) -> ApiResult<AckResponse> {
    let Some(kind) = parse_strategy_kind(&name) else {
        return Err(error_response(EngineError::InvalidInput(format!("unknown strategy: {name}"))));
    };
    let mut config = StrategyConfig {
        name: kind,
        account_id: req.account_id.clone(),
        enabled: true,
        symbols: req.symbols,
        position_size: 1.0,
        max_positions: 1,
        params: Default::default(),
    };
    if config.symbols.is_empty() {
        config.symbols = vec!["MNQ".to_string()];
    }
    ctx.store.save_strategy_config(&config).map_err(|e| error_response(EngineError::Internal(e.to_string())))?;
    ctx.strategies.enable(config, chrono::Utc::now()).map_err(error_response)?;
    Ok(Json(AckResponse { ok: true }))
}

#[derive(Deserialize)]
struct AccountOnlyRequest {
    account_id: String,
}

async fn stop_strategy(
    _auth: AuthBearer,
    State(ctx): State<Arc<CoreContext>>,
    Path(name): Path<String>,
    Json(req): Json<AccountOnlyRequest>,
) -> ApiResult<AckResponse> {
    let Some(kind) = parse_strategy_kind(&name) else {
        return Err(error_response(EngineError::InvalidInput(format!("unknown strategy: {name}"))));
    };
    ctx.strategies.disable(&req.account_id, kind);
    Ok(Json(AckResponse { ok: true }))
}

async fn update_strategy_config(
    _auth: AuthBearer,
    State(ctx): State<Arc<CoreContext>>,
    Path(name): Path<String>,
    Json(config): Json<StrategyConfig>,
) -> ApiResult<AckResponse> {
    let Some(kind) = parse_strategy_kind(&name) else {
        return Err(error_response(EngineError::InvalidInput(format!("unknown strategy: {name}"))));
    };
    let account_id = config.account_id.clone();
    ctx.strategies.update_config(&account_id, kind, config).map(|_| Json(AckResponse { ok: true })).map_err(error_response)
}

async fn strategy_stats(
    _auth: AuthBearer,
    State(ctx): State<Arc<CoreContext>>,
    Path(name): Path<String>,
    Query(q): Query<AccountQuery>,
) -> ApiResult<crate::domain::StrategyStats> {
    let Some(kind) = parse_strategy_kind(&name) else {
        return Err(error_response(EngineError::InvalidInput(format!("unknown strategy: {name}"))));
    };
    let account_id = q.account_id.unwrap_or_else(|| active_account_id(&ctx));
    Ok(Json(ctx.strategies.snapshot(&account_id, kind).map(|s| s.stats).unwrap_or_default()))
}

#[derive(Serialize)]
struct VerifyResponse {
    would_trade: bool,
    reason: String,
}

async fn strategy_verify(
    _auth: AuthBearer,
    State(ctx): State<Arc<CoreContext>>,
    Path(name): Path<String>,
    Query(q): Query<AccountQuery>,
) -> ApiResult<VerifyResponse> {
    let Some(kind) = parse_strategy_kind(&name) else {
        return Err(error_response(EngineError::InvalidInput(format!("unknown strategy: {name}"))));
    };
    let account_id = q.account_id.unwrap_or_else(|| active_account_id(&ctx));
    let state = ctx.strategies.snapshot(&account_id, kind);
    let resp = match state {
        Some(s) if s.status == crate::domain::StrategyStatus::EnabledIdle => VerifyResponse {
            would_trade: s.next_execution_at.is_some_and(|t| t <= chrono::Utc::now()),
            reason: "enabled and awaiting its next scheduled window".to_string(),
        },
        Some(s) => VerifyResponse { would_trade: false, reason: format!("strategy is {}", s.status) },
        None => VerifyResponse { would_trade: false, reason: "strategy not configured for this account".to_string() },
    };
    Ok(Json(resp))
}

// -- risk / notifications / settings --------------------------------------

async fn risk_snapshot(
    _auth: AuthBearer,
    State(ctx): State<Arc<CoreContext>>,
    Query(q): Query<AccountQuery>,
) -> ApiResult<crate::domain::RiskSnapshot> {
    let account_id = q.account_id.unwrap_or_else(|| active_account_id(&ctx));
    let start_of_day_balance = ctx.accounts.snapshot(&account_id).account.map(|a| a.start_of_day_balance).unwrap_or(0.0);
    let monitor = ctx.risk_monitor_for(&account_id, start_of_day_balance);
    Ok(Json(monitor.snapshot()))
}

#[derive(Deserialize)]
struct NotificationsQuery {
    account_id: Option<String>,
    limit: Option<i64>,
}

async fn notifications(
    _auth: AuthBearer,
    State(ctx): State<Arc<CoreContext>>,
    Query(q): Query<NotificationsQuery>,
) -> ApiResult<Vec<crate::domain::Notification>> {
    let account_id = q.account_id.unwrap_or_else(|| active_account_id(&ctx));
    let limit = q.limit.unwrap_or(100);
    ctx.store.load_notifications(&account_id, limit).map(Json).map_err(|e| error_response(EngineError::Internal(e.to_string())))
}

#[derive(Serialize)]
struct SettingEntry {
    key: String,
    value: serde_json::Value,
}

async fn get_settings(_auth: AuthBearer, State(ctx): State<Arc<CoreContext>>, Path(scope): Path<String>) -> ApiResult<Vec<SettingEntry>> {
    ctx.store
        .list_settings(&scope)
        .map(|rows| rows.into_iter().map(|(key, value)| SettingEntry { key, value }).collect())
        .map(Json)
        .map_err(|e| error_response(EngineError::Internal(e.to_string())))
}

#[derive(Deserialize)]
struct UpsertSettingRequest {
    scope: String,
    key: String,
    value: serde_json::Value,
}

async fn upsert_setting(
    _auth: AuthBearer,
    State(ctx): State<Arc<CoreContext>>,
    Json(req): Json<UpsertSettingRequest>,
) -> ApiResult<AckResponse> {
    ctx.store
        .set_setting(&req.scope, &req.key, &req.value)
        .map(|_| Json(AckResponse { ok: true }))
        .map_err(|e| error_response(EngineError::Internal(e.to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minute_timeframe() {
        let tf = parse_timeframe_param("5m").unwrap();
        assert_eq!(tf.value, 5);
    }

    #[test]
    fn rejects_malformed_timeframe() {
        assert!(parse_timeframe_param("bogus").is_none());
    }

    #[test]
    fn parse_strategy_kind_rejects_unknown_name() {
        assert!(parse_strategy_kind("NotAStrategy").is_none());
        assert_eq!(parse_strategy_kind("OvernightRange"), Some(StrategyKind::OvernightRange));
    }
}
