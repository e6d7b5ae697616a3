use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use tracing::debug;

use crate::error::Result;

pub struct TestboxDirs {
    pub base: PathBuf,
    pub cache: PathBuf,
}

impl TestboxDirs {
    pub fn new() -> Result<Self> {
        let project_dir = ProjectDirs::from("", "", "testbox").expect("Couldn't get project dir");

        // Dir containing persistent data (usually ~/.local/share/testbox/)
        let data_dir = project_dir.data_dir().to_path_buf();
        create_dir("data", &data_dir)?;

        // Dir containing cached directory archives (usually ~/.local/share/testbox/cache/)
        let cache = data_dir.join("cache");
        create_dir("cache", &cache)?;

        Ok(Self {
            base: data_dir,
            cache,
        })
    }
}

pub fn create_dir(purpose: &str, path: &Path) -> Result<()> {
    if !path.exists() {
        debug!("{purpose} dir {path:?} doesn't exist yet, creating");
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Filesystem-safe archive name for a pushed source path.
///
/// Keys are derived from the path string only; two pushes of the same path
/// map to the same cache entry no matter what the directory contains.
pub fn cache_key(path: &Path) -> String {
    path.to_string_lossy()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | ' ' => '_',
            c => c,
        })
        .collect()
}
