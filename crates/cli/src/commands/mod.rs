//! CLI subcommands

pub mod config;
pub mod decisions;
pub mod energy;
pub mod inventory;
