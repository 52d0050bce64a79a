pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod quote;
pub mod script;
pub mod setup;
pub mod shell;
pub mod ticker;
