//! Data layer module
//!
//! Handles all data persistence:
//! - Delivery queue rows and their state transitions
//! - Local actor signing keys
//! - Followers collections and saved activities

mod collaborators;
mod database;
mod models;

pub use database::Database;
pub use models::*;
