//! Read-only dashboard API
//!
//! Provides:
//! - Current and historical batch runs with item counts
//! - Per-item execution logs
//! - Latest results per application with breaches recomputed against the
//!   thresholds currently configured
//! - Alert and threshold overviews

pub mod server;
pub mod views;

pub use server::{ApiError, ApiServer, ApiServerConfig, DashboardState};
pub use views::{AlertView, AppLatest, HistoryPage, ItemSummary, ResultView, RunSummary};
