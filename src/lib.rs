pub mod core;
pub mod features;
pub mod scraping;
pub mod tools;

// --- Primary core exports ---
pub use crate::core::error::{ErrorClass, Result, ScoutError};
pub use crate::core::types;
pub use crate::core::types::*;
pub use crate::core::ScoutState;

// --- Short module paths ---
pub use features::{antibot, guard};
pub use scraping::{browser_manager, replay, selectors};
pub use tools::{detail, filters, links, orchestrator, search};
