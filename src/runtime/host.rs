use std::path::{Path, PathBuf};

use tracing::warn;

use super::{HostInfo, SourceLocator};

/// Host facts taken from the running process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemHost;

impl HostInfo for SystemHost {
    fn current_process_id(&self) -> String {
        std::process::id().to_string()
    }

    fn working_directory(&self) -> PathBuf {
        std::env::current_dir().unwrap_or_else(|e| {
            warn!("Cannot read working directory: {}", e);
            PathBuf::from(".")
        })
    }
}

/// Resolves source names against the filesystem.
///
/// Absolute names are returned if they exist; relative names are tried
/// against each search path in order.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsSourceLocator;

impl SourceLocator for FsSourceLocator {
    fn find_source_file(&self, name: &str, search_paths: &[PathBuf]) -> Option<PathBuf> {
        let path = Path::new(name);
        if path.is_absolute() {
            return path.is_file().then(|| path.to_path_buf());
        }
        search_paths
            .iter()
            .map(|dir| dir.join(path))
            .find(|candidate| candidate.is_file())
    }
}
