//! Bot Store. Persistence core for the community bot: relational store with
//! one-time legacy migration and flat-file fallback.

pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod migrate;
pub mod model;
pub mod store;

pub use config::StoreConfig;
pub use controller::Controller;
pub use error::{Error, Result};
