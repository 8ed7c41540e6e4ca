pub mod browser_manager;
pub mod page;
pub mod replay;
pub mod selectors;
