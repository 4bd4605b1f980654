//! Session state and dashboard aggregation over a Supabase-compatible
//! gateway.

pub mod dashboard;
pub mod format;
pub mod gateway;
pub mod rest_gateway;
pub mod session;
pub mod session_store;

pub use dashboard::{
    DashboardMetrics, DashboardPipeline, DashboardSnapshot, FetchFailed, LoadState,
    TransportShare, TOP_MARKETS,
};
pub use format::{format_currency, format_number};
pub use gateway::{AuthGateway, ViewGateway};
pub use rest_gateway::RestGateway;
pub use session::{AuthFault, Registration, SessionState, SessionStateManager};
pub use session_store::SessionStore;

#[cfg(test)]
#[path = "tests/fakes.rs"]
mod fakes;
