pub mod config;
pub mod models;
pub mod persistence;
pub mod registry;
pub mod scope_lock;
pub mod sqlite;

pub use config::RegistryConfig;
pub use registry::VersionedFunctionRegistry;
