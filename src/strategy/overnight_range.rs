// =============================================================================
// Overnight Range Breakout — reference strategy (§4.J)
// =============================================================================
//
// Grounded on the teacher's `StrategyEngine::evaluate_symbol` pipeline shape
// (gather bars -> compute indicators -> derive SL/TP -> submit), with the
// ensemble scorer and insurance/smart-filter gates replaced by this
// strategy's own ATR-zone breakout logic — the teacher's weighted-scoring
// approach doesn't apply to a rules-based range-break system. ATR itself
// reuses the teacher's Wilder smoothing (`indicators/atr.rs`), reimplemented
// here over `domain::Bar` instead of the teacher's `market_data::Candle`.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, TimeZone, Utc};
use chrono_tz::Tz;
use tracing::info;

use crate::domain::{Bar, Contract, OrderSide, StrategyConfig, StrategyKind, Timeframe};
use crate::error::EngineError;
use crate::order_manager::BracketOpts;

use super::{next_daily_occurrence, Strategy, StrategyContext};

pub struct OvernightRangeBreakout;

impl OvernightRangeBreakout {
    pub fn new() -> Self {
        Self
    }
}

impl Default for OvernightRangeBreakout {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Strategy for OvernightRangeBreakout {
    fn kind(&self) -> StrategyKind {
        StrategyKind::OvernightRange
    }

    async fn execute_cycle(&self, ctx: &StrategyContext, config: &StrategyConfig) -> Result<(), EngineError> {
        for symbol in &config.symbols {
            self.run_symbol(ctx, config, symbol).await?;
        }
        Ok(())
    }

    fn next_execution_after(&self, config: &StrategyConfig, tz: Tz, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        next_daily_occurrence(&config.params.market_open_time, tz, now)
    }
}

impl OvernightRangeBreakout {
    async fn run_symbol(&self, ctx: &StrategyContext, config: &StrategyConfig, symbol: &str) -> Result<(), EngineError> {
        let params = &config.params;
        let contract = ctx.broker.get_contract(symbol).await?;
        let intraday_tf = parse_timeframe(&params.atr_timeframe);

        let now = Utc::now();
        let overnight_start = parse_session_bound(&params.overnight_start_time, now)?;
        let overnight_end = parse_session_bound(&params.overnight_end_time, now)?;

        let overnight_bars = ctx
            .historical
            .get_bars(symbol, intraday_tf, overnight_start, overnight_end, false, 2000)
            .await?;

        if overnight_bars.is_empty() {
            info!(symbol, "overnight range: no bars in session window, skipping cycle");
            return Ok(());
        }

        let h_on = overnight_bars.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let l_on = overnight_bars.iter().map(|b| b.low).fold(f64::MAX, f64::min);

        let atr_start = now.timestamp() - (params.atr_period as i64 + 5) * intraday_tf.seconds().unwrap_or(300);
        let atr_bars = ctx
            .historical
            .get_bars(symbol, intraday_tf, atr_start, now.timestamp(), true, params.atr_period as usize + 5)
            .await?;
        let Some(atr) = wilder_atr(&atr_bars, params.atr_period as usize) else {
            info!(symbol, "overnight range: insufficient bars for ATR, skipping cycle");
            return Ok(());
        };

        let o_open = overnight_bars.last().map(|b| b.close).unwrap_or(h_on);

        let half_atr = atr / 2.0;
        let upper = (o_open + half_atr * 0.5, o_open + half_atr * 0.68);
        let lower = (o_open - half_atr * 0.5, o_open - half_atr * 0.68);

        // ATR-derived prices rarely land exactly on a tick boundary; the
        // order manager now rejects any cross-tick price outright (§4.C), so
        // every computed level is snapped here before it ever reaches a
        // submit call.
        let long_entry = contract.round_to_tick(h_on + params.range_break_offset);
        let short_entry = contract.round_to_tick(l_on - params.range_break_offset);

        let long_sl = contract.round_to_tick(long_entry - atr * params.stop_atr_multiplier);
        let short_sl = contract.round_to_tick(short_entry + atr * params.stop_atr_multiplier);

        let long_tp = contract
            .round_to_tick(zone_target_above(long_entry, upper).unwrap_or(long_entry + atr * params.tp_atr_multiplier));
        let short_tp = contract
            .round_to_tick(zone_target_below(short_entry, lower).unwrap_or(short_entry - atr * params.tp_atr_multiplier));

        let qty = config.position_size;
        let long_opts = BracketOpts {
            stop_loss_price: Some(long_sl),
            take_profit_price: Some(long_tp),
            reduce_only: false,
            idempotency_key: None,
        };
        let short_opts = BracketOpts {
            stop_loss_price: Some(short_sl),
            take_profit_price: Some(short_tp),
            reduce_only: false,
            idempotency_key: None,
        };

        let long_order = ctx
            .orders
            .submit_stop_entry(&config.account_id, symbol, OrderSide::Buy, qty, long_entry, &contract, long_opts)
            .await?;
        let short_order = ctx
            .orders
            .submit_stop_entry(&config.account_id, symbol, OrderSide::Sell, qty, short_entry, &contract, short_opts)
            .await?;

        // Tie-break (§4.J): if both fill within the same tick the order whose
        // trigger is closer to O_open wins — expressed generically as an OCO
        // link so whichever fills first cancels the other regardless of
        // which arrives first.
        ctx.orders.link_oco(&config.account_id, &long_order.id, &short_order.id);

        info!(
            symbol,
            h_on, l_on, atr, long_entry, short_entry, long_sl, short_sl, long_tp, short_tp,
            "overnight range breakout entries submitted"
        );

        Ok(())
    }
}

/// The nearer zone boundary strictly above `entry`, or `None` if neither
/// boundary lies beyond it (§4.J step 4).
fn zone_target_above(entry: f64, zone: (f64, f64)) -> Option<f64> {
    let (low, high) = zone;
    [low, high].into_iter().filter(|&b| b > entry).fold(None, |acc, b| match acc {
        Some(best) if best < b => Some(best),
        _ => Some(b),
    })
}

fn zone_target_below(entry: f64, zone: (f64, f64)) -> Option<f64> {
    let (low, high) = zone;
    [low, high].into_iter().filter(|&b| b < entry).fold(None, |acc, b| match acc {
        Some(best) if best > b => Some(best),
        _ => Some(b),
    })
}

/// Wilder's ATR smoothing (teacher's `indicators/atr.rs`), reimplemented over
/// `domain::Bar` rather than `market_data::Candle`.
fn wilder_atr(bars: &[Bar], period: usize) -> Option<f64> {
    if period == 0 || bars.len() < period + 1 {
        return None;
    }
    let mut tr_values = Vec::with_capacity(bars.len() - 1);
    for i in 1..bars.len() {
        let high = bars[i].high;
        let low = bars[i].low;
        let prev_close = bars[i - 1].close;
        let tr = (high - low).max((high - prev_close).abs()).max((low - prev_close).abs());
        tr_values.push(tr);
    }
    if tr_values.len() < period {
        return None;
    }
    let seed: f64 = tr_values[..period].iter().sum::<f64>() / period as f64;
    if !seed.is_finite() {
        return None;
    }
    let period_f = period as f64;
    let mut atr = seed;
    for &tr in &tr_values[period..] {
        atr = (atr * (period_f - 1.0) + tr) / period_f;
        if !atr.is_finite() {
            return None;
        }
    }
    Some(atr)
}

fn parse_timeframe(s: &str) -> Timeframe {
    let (value_str, unit_str) = s.split_at(s.len().saturating_sub(1));
    let value: u32 = value_str.parse().unwrap_or(5);
    match unit_str {
        "s" => Timeframe { value, unit: crate::domain::TimeframeUnit::Second },
        "h" => Timeframe { value, unit: crate::domain::TimeframeUnit::Hour },
        "d" => Timeframe { value, unit: crate::domain::TimeframeUnit::Day },
        _ => Timeframe::minutes(value),
    }
}

/// Resolves an `"HH:MM"` session-boundary string to a unix timestamp on the
/// same exchange-local day as `reference`. Both overnight bounds are
/// expressed in exchange-local time per §4.J.
fn parse_session_bound(hhmm: &str, reference: DateTime<Utc>) -> Result<i64, EngineError> {
    let (h, m) = hhmm
        .split_once(':')
        .ok_or_else(|| EngineError::InvalidInput(format!("bad time string: {hhmm}")))?;
    let hour: u32 = h.parse().map_err(|_| EngineError::InvalidInput(format!("bad hour: {hhmm}")))?;
    let minute: u32 = m.parse().map_err(|_| EngineError::InvalidInput(format!("bad minute: {hhmm}")))?;
    Utc.with_ymd_and_hms(reference.year(), reference.month(), reference.day(), hour, minute, 0)
        .single()
        .map(|dt| dt.timestamp())
        .ok_or_else(|| EngineError::InvalidInput(format!("could not resolve time: {hhmm}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: f64, low: f64, close: f64) -> Bar {
        Bar {
            symbol: "MNQ".into(),
            timeframe: Timeframe::minutes(5),
            open_time: Utc::now(),
            open: close,
            high,
            low,
            close,
            volume: 1.0,
        }
    }

    #[test]
    fn zone_target_above_picks_nearer_boundary() {
        assert_eq!(zone_target_above(100.0, (105.0, 110.0)), Some(105.0));
        assert_eq!(zone_target_above(100.0, (90.0, 95.0)), None);
    }

    #[test]
    fn zone_target_below_picks_nearer_boundary() {
        assert_eq!(zone_target_below(100.0, (90.0, 95.0)), Some(95.0));
        assert_eq!(zone_target_below(100.0, (105.0, 110.0)), None);
    }

    #[test]
    fn wilder_atr_requires_period_plus_one_bars() {
        let bars: Vec<Bar> = (0..5).map(|i| bar(100.0 + i as f64, 99.0 + i as f64, 99.5 + i as f64)).collect();
        assert!(wilder_atr(&bars, 10).is_none());
        assert!(wilder_atr(&bars, 3).is_some());
    }

    #[test]
    fn parse_timeframe_defaults_to_minutes() {
        let tf = parse_timeframe("5m");
        assert_eq!(tf.value, 5);
        assert_eq!(tf.unit, crate::domain::TimeframeUnit::Minute);
    }
}
