pub mod oracle;
pub mod paper;
mod traits;

pub use oracle::StaticPriceOracle;
pub use paper::{PaperExchange, PaperStep};
pub use traits::{ExchangeClient, ExchangeResult, PriceOracle};

#[cfg(test)]
pub use traits::MockExchangeClient;
