pub mod access;
pub mod category;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod lock;
pub mod model;
pub mod principal;
pub mod repository;
pub mod session;
pub mod slot;
pub mod tree;
pub mod version;

pub use config::{DeletePolicy, VaultConfig};
pub use engine::{ContentEngine, MemoryEngine, QueryFilter};
pub use error::{Result, VaultError};
pub use repository::{Repository, SearchHit, SessionInfo};
pub use session::{Credentials, Ticket};
