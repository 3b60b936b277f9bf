//! Domain types shared by every pipeline step.

pub mod record;
pub mod ticker;
pub mod window;

pub use record::{PriceBar, PriceRecord};
pub use ticker::{parse_tickers, Ticker, TickerError};
pub use window::{DownloadWindow, Interval, Period, WindowError};
