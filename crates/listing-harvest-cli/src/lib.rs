//! listing-harvest CLI: browser surface, site flow and session runner for the harvest engine.

pub mod browser;
pub mod config;
pub mod run;
pub mod site;
pub mod targets;
