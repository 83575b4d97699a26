//! flagdev server - local flag delivery for LaunchDarkly SDKs.

pub mod config;
pub mod error;
pub mod middleware;
pub mod routes;
pub mod startup;
pub mod state;

pub use config::Config;
pub use routes::create_router;
pub use state::AppState;
