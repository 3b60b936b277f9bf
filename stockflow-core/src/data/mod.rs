//! Market-data providers.

pub mod provider;
pub mod yahoo;

pub use provider::{DataError, PriceProvider, PriceSeries};
pub use yahoo::YahooProvider;
