pub mod app_state;
pub mod config;
pub mod error;
pub mod sink;
pub mod types;

pub use app_state::ScoutState;
