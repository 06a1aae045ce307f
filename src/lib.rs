// ABOUTME: Library module for mysql-dumper
// ABOUTME: Exports all core functionality for use in binary and tests

pub mod config;
pub mod filters;
pub mod migration;
pub mod mysql;
pub mod pool;
pub mod session;
pub mod table_rules;
pub mod utils;
pub mod writer;

pub use config::Config;
pub use migration::{Dumper, Loader};
