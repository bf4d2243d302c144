//! Scrape Fleet — orchestrator and worker agent for a distributed scraper fleet.

pub mod agent;
pub mod config;
pub mod error;
pub mod orchestrator;
pub mod protocol;
