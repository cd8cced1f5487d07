pub mod binance;

pub use binance::BinanceMarketData;
