pub mod audit;
pub mod encryption;
pub mod keymanager;
pub mod messages;
pub mod rooms;
pub mod service;
pub mod stream;
pub mod types;

mod error;

use std::sync::Arc;

use tokio::sync::Mutex;

pub use error::CoreError;
pub use service::ChatService;

/// The store handle shared by the service, key manager and stream sessions.
pub type SharedDb = Arc<Mutex<palaver_store::Database>>;
