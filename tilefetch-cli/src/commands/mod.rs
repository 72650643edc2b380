//! CLI subcommands.

pub mod cleanup;
pub mod common;
pub mod fetch;
pub mod regions;
