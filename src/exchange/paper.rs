//! Paper exchange for dry runs and tests
//!
//! Fills immediately at the order price unless a script says otherwise. Each
//! `place_order` call consumes the next scripted step.

use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info};

use super::traits::{ExchangeClient, ExchangeResult};
use crate::domain::{OrderHandle, OrderRequest, OrderStatus, OrderStatusReport, Trade};
use crate::error::ExchangeError;

/// Scripted behaviour for one placement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaperStep {
    /// Fill the whole order at its limit price
    Fill,
    /// Fill the whole order at a different price
    FillAt(Decimal),
    /// Fill part of the order, leave the rest working
    FillPartial { qty: Decimal, price: Decimal },
    /// Accept the order and never fill it
    Rest,
    /// Fail the placement
    Fail(ExchangeError),
}

struct PaperOrder {
    symbol: String,
    requested: Decimal,
    report: OrderStatusReport,
}

pub struct PaperExchange {
    orders: DashMap<String, PaperOrder>,
    exchange_ids: DashMap<String, String>,
    script: Mutex<VecDeque<PaperStep>>,
    placed: Mutex<Vec<OrderRequest>>,
    fee_rate: Decimal,
    next_id: AtomicU64,
    cancel_error: Mutex<Option<ExchangeError>>,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            orders: DashMap::new(),
            exchange_ids: DashMap::new(),
            script: Mutex::new(VecDeque::new()),
            placed: Mutex::new(Vec::new()),
            fee_rate: Decimal::ZERO,
            next_id: AtomicU64::new(1),
            cancel_error: Mutex::new(None),
        }
    }

    pub fn with_fee_rate(mut self, fee_rate: Decimal) -> Self {
        self.fee_rate = fee_rate;
        self
    }

    pub fn with_script(self, steps: impl IntoIterator<Item = PaperStep>) -> Self {
        if let Ok(mut script) = self.script.lock() {
            script.extend(steps);
        }
        self
    }

    /// Make every later cancel fail with `err`
    pub fn fail_cancels(&self, err: ExchangeError) {
        if let Ok(mut slot) = self.cancel_error.lock() {
            *slot = Some(err);
        }
    }

    /// Every placement request received, in order
    pub fn placed(&self) -> Vec<OrderRequest> {
        self.placed.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Add a fill to a working order, as if it traded after the fact
    pub fn fill_later(&self, client_order_id: &str, qty: Decimal, price: Decimal) -> bool {
        let Some(mut order) = self.orders.get_mut(client_order_id) else {
            return false;
        };
        let remaining = order.requested - order.report.filled_qty;
        if qty <= Decimal::ZERO || qty > remaining {
            return false;
        }
        let fee = qty * price * self.fee_rate;
        let requested = order.requested;
        apply_trade(&mut order.report, qty, price, fee, requested);
        true
    }

    fn next_step(&self) -> PaperStep {
        self.script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or(PaperStep::Fill)
    }

    fn resolve(&self, order_id: &str) -> Option<String> {
        if self.orders.contains_key(order_id) {
            return Some(order_id.to_string());
        }
        self.exchange_ids.get(order_id).map(|c| c.value().clone())
    }

    fn report(&self, order_id: &str) -> Option<OrderStatusReport> {
        let client_id = self.resolve(order_id)?;
        self.orders.get(&client_id).map(|o| o.report.clone())
    }
}

fn apply_trade(report: &mut OrderStatusReport, qty: Decimal, price: Decimal, fee: Decimal, requested: Decimal) {
    let trade_id = format!("{}-t{}", report.exchange_order_id, report.trades.len() + 1);
    let prior_value = report.avg_price.unwrap_or(Decimal::ZERO) * report.filled_qty;
    report.filled_qty += qty;
    report.avg_price = Some((prior_value + qty * price) / report.filled_qty);
    report.trades.push(Trade::new(trade_id, qty, price, fee));
    report.status = if report.filled_qty >= requested {
        OrderStatus::Filled
    } else {
        OrderStatus::PartiallyFilled
    };
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    fn name(&self) -> &'static str {
        "paper"
    }

    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderHandle> {
        if let Ok(mut placed) = self.placed.lock() {
            placed.push(request.clone());
        }

        if self.orders.contains_key(&request.client_order_id) {
            return Err(ExchangeError::Duplicate {
                client_order_id: request.client_order_id.clone(),
            });
        }

        let fill = match self.next_step() {
            PaperStep::Fill => Some((request.quantity, request.limit_price)),
            PaperStep::FillAt(price) => Some((request.quantity, price)),
            PaperStep::FillPartial { qty, price } => Some((qty.min(request.quantity), price)),
            PaperStep::Rest => None,
            PaperStep::Fail(err) => {
                debug!(client_order_id = %request.client_order_id, error = %err, "Paper placement failed");
                return Err(err);
            }
        };

        let exchange_order_id = format!("paper-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut report = OrderStatusReport {
            exchange_order_id: exchange_order_id.clone(),
            client_order_id: request.client_order_id.clone(),
            status: OrderStatus::Open,
            filled_qty: Decimal::ZERO,
            avg_price: None,
            trades: Vec::new(),
        };

        if let Some((qty, price)) = fill {
            apply_trade(&mut report, qty, price, qty * price * self.fee_rate, request.quantity);
        }

        info!(
            client_order_id = %request.client_order_id,
            exchange_order_id = %exchange_order_id,
            symbol = %request.symbol,
            side = %request.side,
            qty = %request.quantity,
            price = %request.limit_price,
            status = ?report.status,
            "Paper order placed"
        );

        self.exchange_ids
            .insert(exchange_order_id.clone(), request.client_order_id.clone());
        self.orders.insert(
            request.client_order_id.clone(),
            PaperOrder {
                symbol: request.symbol.clone(),
                requested: request.quantity,
                report,
            },
        );

        Ok(OrderHandle {
            exchange_order_id,
            client_order_id: request.client_order_id.clone(),
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()> {
        if let Some(err) = self.cancel_error.lock().ok().and_then(|e| e.clone()) {
            return Err(err);
        }
        let client_id = self
            .resolve(order_id)
            .ok_or_else(|| ExchangeError::Permanent(format!("unknown order {}", order_id)))?;
        if let Some(mut order) = self.orders.get_mut(&client_id) {
            if order.symbol != symbol {
                return Err(ExchangeError::Permanent(format!(
                    "order {} is not on {}",
                    order_id, symbol
                )));
            }
            if order.report.status.is_active() {
                order.report.status = OrderStatus::Cancelled;
            }
        }
        Ok(())
    }

    async fn fetch_order(&self, _symbol: &str, order_id: &str) -> ExchangeResult<Option<OrderStatusReport>> {
        Ok(self.report(order_id))
    }

    async fn wait_for_fill(
        &self,
        _symbol: &str,
        order_id: &str,
        timeout_ms: u64,
    ) -> ExchangeResult<OrderStatusReport> {
        let report = self
            .report(order_id)
            .ok_or_else(|| ExchangeError::Permanent(format!("unknown order {}", order_id)))?;

        if report.status.is_active() {
            // Nothing trades on its own on paper; hold the request open until the
            // deadline like a venue would
            tokio::time::sleep(Duration::from_millis(timeout_ms)).await;
            return self
                .report(order_id)
                .ok_or_else(|| ExchangeError::Permanent(format!("unknown order {}", order_id)));
        }
        Ok(report)
    }
}
