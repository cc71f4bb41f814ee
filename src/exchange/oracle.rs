use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;

use super::traits::PriceOracle;

/// Fixed reference prices, settable at runtime
#[derive(Default)]
pub struct StaticPriceOracle {
    prices: DashMap<String, Decimal>,
}

impl StaticPriceOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(self, symbol: impl Into<String>, price: Decimal) -> Self {
        self.set(symbol, price);
        self
    }

    pub fn set(&self, symbol: impl Into<String>, price: Decimal) {
        self.prices.insert(symbol.into(), price);
    }

    pub fn remove(&self, symbol: &str) {
        self.prices.remove(symbol);
    }
}

#[async_trait]
impl PriceOracle for StaticPriceOracle {
    async fn reference_price(&self, symbol: &str) -> Option<Decimal> {
        self.prices
            .get(symbol)
            .map(|p| *p.value())
            .filter(|p| *p > Decimal::ZERO)
    }
}
