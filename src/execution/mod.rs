// Order placement, the persisted order trail and its housekeeping
pub mod housekeeper;
pub mod order_service;
pub mod pnl;
pub mod store;

pub use housekeeper::{HousekeepingReport, OrderHousekeeper};
pub use order_service::{round_to_step, OrderExecutionService};
pub use pnl::{summarize, PnlSummary};
pub use store::{InMemoryOrderStore, OrderStore};
