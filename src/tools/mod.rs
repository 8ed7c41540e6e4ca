pub mod detail;
pub mod filters;
pub mod links;
pub mod orchestrator;
pub mod search;
