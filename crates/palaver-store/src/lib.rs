pub mod database;
pub mod keys;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod rooms;

mod error;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
