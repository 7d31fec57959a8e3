//! Memvault Core — shared domain types and configuration.
//!
//! Every other memvault crate depends on this one for the `Memory`
//! domain record and the layered engine configuration.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod types;

pub use config::{
    BatchSettings, ConfigError, EmbeddingSettings, EngineSettings, GraphSettings, IndexSettings,
    SpaceKind, StorageSettings,
};
pub use types::Memory;

/// Get the default memvault data directory (`~/.memvault` equivalent).
pub fn default_data_dir() -> std::path::PathBuf {
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .map(|p| p.join(".memvault"))
        .unwrap_or_else(|| std::path::PathBuf::from(".memvault"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_data_dir() {
        let dir = default_data_dir();
        assert!(dir.to_string_lossy().contains("memvault"));
    }
}
