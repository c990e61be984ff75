//! Identity core: orchestration, adapters and ambient configuration

pub mod auth;
#[cfg(feature = "postgres")]
pub mod bootstrap;
pub mod config;
#[cfg(feature = "postgres")]
pub mod db;
pub mod logging;
