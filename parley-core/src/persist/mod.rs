//! Persistence of the session store with versioned migration

pub mod file;
pub mod migration;

pub use file::FileStateStore;
pub use migration::{migrate, MigrationStep, CURRENT_VERSION};
