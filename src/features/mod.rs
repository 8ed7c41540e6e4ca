pub mod antibot;
pub mod guard;
