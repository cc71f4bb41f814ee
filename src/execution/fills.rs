//! Partial-fill accumulation
//!
//! Folds incremental exchange fill reports into an `OrderContext`, keeping a
//! quantity-weighted average price. Replays of the same trade are no-ops.

use rust_decimal::Decimal;

use crate::domain::{FsmEvent, OrderContext, Trade};
use crate::error::FillError;

/// Result of folding one trade into an order context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillOutcome {
    /// False when the trade had already been applied
    pub applied: bool,
    pub fully_filled: bool,
}

/// Apply one fill to `ctx`. Malformed fills are rejected, never ignored.
pub fn accumulate(
    ctx: &mut OrderContext,
    fill_qty: Decimal,
    fill_price: Decimal,
    fill_fee: Decimal,
    trade_id: &str,
) -> Result<FillOutcome, FillError> {
    if trade_id.trim().is_empty() {
        return Err(FillError::MissingTradeId);
    }

    if ctx.applied_trades.contains(trade_id) {
        return Ok(FillOutcome {
            applied: false,
            fully_filled: ctx.is_fully_filled(),
        });
    }

    if fill_qty <= Decimal::ZERO {
        return Err(FillError::NonPositiveQuantity(fill_qty));
    }
    if fill_price <= Decimal::ZERO {
        return Err(FillError::NonPositivePrice(fill_price));
    }
    if fill_fee < Decimal::ZERO {
        return Err(FillError::NegativeFee(fill_fee));
    }

    let remaining = ctx.remaining_qty();
    if fill_qty > remaining {
        return Err(FillError::ExceedsRemaining {
            fill_qty,
            remaining_qty: remaining,
            requested_qty: ctx.requested_qty,
        });
    }

    let new_filled = ctx.filled_qty + fill_qty;
    let prior_value = ctx.fill_value();
    ctx.avg_fill_price = Some((prior_value + fill_qty * fill_price) / new_filled);
    ctx.filled_qty = new_filled;
    ctx.fees += fill_fee;
    ctx.applied_trades.insert(trade_id.to_string());

    Ok(FillOutcome {
        applied: true,
        fully_filled: ctx.is_fully_filled(),
    })
}

/// Convenience wrapper over [`accumulate`] for a reported trade
pub fn accumulate_trade(ctx: &mut OrderContext, trade: &Trade) -> Result<FillOutcome, FillError> {
    accumulate(ctx, trade.quantity, trade.price, trade.fee, &trade.trade_id)
}

/// Trades in `trades` not yet folded into `ctx`, in report order
pub fn unapplied<'a>(ctx: &OrderContext, trades: &'a [Trade]) -> Vec<&'a Trade> {
    trades
        .iter()
        .filter(|t| !ctx.applied_trades.contains(&t.trade_id))
        .collect()
}

/// Fill events for the unapplied trades of a report. Each is `fill_partial`
/// until the running quantity reaches the request, then `fill_complete`.
pub fn fill_events(ctx: &OrderContext, trades: &[Trade]) -> Vec<FsmEvent> {
    let mut filled = ctx.filled_qty;
    unapplied(ctx, trades)
        .into_iter()
        .map(|trade| {
            filled += trade.quantity;
            if filled >= ctx.requested_qty {
                FsmEvent::fill_complete(trade.clone())
            } else {
                FsmEvent::fill_partial(trade.clone())
            }
        })
        .collect()
}
