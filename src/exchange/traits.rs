use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::{OrderHandle, OrderRequest, OrderStatusReport};
use crate::error::ExchangeError;

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;

/// Venue adapter. Implementations classify every failure as transient,
/// permanent or duplicate before returning it.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn name(&self) -> &'static str;

    /// Place a limit order. A reused `client_order_id` yields `Duplicate`.
    async fn place_order(&self, request: &OrderRequest) -> ExchangeResult<OrderHandle>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<()>;

    /// Look up an order by exchange id or client order id. `None` if unknown.
    async fn fetch_order(&self, symbol: &str, order_id: &str) -> ExchangeResult<Option<OrderStatusReport>>;

    /// Wait up to `timeout_ms` for fills and return the order as it then stands
    async fn wait_for_fill(
        &self,
        symbol: &str,
        order_id: &str,
        timeout_ms: u64,
    ) -> ExchangeResult<OrderStatusReport>;
}

/// Source of reference prices for the slippage guard
#[async_trait]
pub trait PriceOracle: Send + Sync {
    async fn reference_price(&self, symbol: &str) -> Option<Decimal>;
}
