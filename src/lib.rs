// itemkv - embedded transactional item store
// Snapshot-isolated key-value engine with a thin HTTP front

#![warn(rust_2018_idioms)]

pub mod config;
pub mod context;
pub mod display;
pub mod item;
pub mod repository;
pub mod server;
pub mod storage;
pub mod telemetry;

// Re-exports for convenience
pub use config::{StorageMode, StoreConfig};
pub use context::AppContext;
pub use display::DisplayBuffer;
pub use item::Item;
pub use repository::ItemRepository;
pub use storage::{Sequence, Store};

/// itemkv error types
pub mod error {
    use thiserror::Error;

    #[derive(Error, Debug)]
    pub enum Error {
        #[error("Invalid argument: {0}")]
        InvalidArgument(String),

        #[error("Not found: {0}")]
        NotFound(String),

        #[error("Storage error: {0}")]
        Storage(String),

        #[error("Serialization error: {0}")]
        Serialization(String),

        #[error("Store is closed")]
        Closed,
    }

    /// Coarse classification handed to callers that only care about the
    /// rejected-input / missing / internal-failure split.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ErrorKind {
        Validation,
        NotFound,
        Storage,
    }

    impl Error {
        pub fn kind(&self) -> ErrorKind {
            match self {
                Error::InvalidArgument(_) => ErrorKind::Validation,
                Error::NotFound(_) => ErrorKind::NotFound,
                Error::Storage(_) | Error::Serialization(_) | Error::Closed => ErrorKind::Storage,
            }
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
