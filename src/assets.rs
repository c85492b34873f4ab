use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use crate::error::ScriptError;

/// Source of raw script bytes addressed by logical path.
pub trait ResourceLoader {
    fn load(&self, path: &str) -> Result<Vec<u8>, ScriptError>;

    fn load_text(&self, path: &str) -> Result<String, ScriptError> {
        let bytes = self.load(path)?;
        String::from_utf8(bytes).map_err(|err| ScriptError::InvalidDefinition {
            name: path.to_string(),
            message: format!("source is not valid UTF-8: {err}"),
        })
    }
}

/// Loads scripts from below a root directory. Logical paths may not escape the root.
#[derive(Debug, Clone)]
pub struct FsResourceLoader {
    root: PathBuf,
}

impl FsResourceLoader {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> Option<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
        if escapes {
            return None;
        }
        Some(self.root.join(relative))
    }
}

impl ResourceLoader for FsResourceLoader {
    fn load(&self, path: &str) -> Result<Vec<u8>, ScriptError> {
        let not_found = || ScriptError::ResourceNotFound { path: path.to_string() };
        let full = self.resolve(path).ok_or_else(not_found)?;
        match fs::read(&full) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Err(not_found()),
            Err(err) => Err(ScriptError::InvalidDefinition {
                name: path.to_string(),
                message: format!("reading '{}': {err}", full.display()),
            }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryResourceLoader {
    files: HashMap<String, Vec<u8>>,
}

impl MemoryResourceLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        self.insert(path, contents);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<Vec<u8>>) {
        self.files.insert(path.into(), contents.into());
    }
}

impl ResourceLoader for MemoryResourceLoader {
    fn load(&self, path: &str) -> Result<Vec<u8>, ScriptError> {
        self.files.get(path).cloned().ok_or_else(|| ScriptError::ResourceNotFound { path: path.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fs_loader_reads_below_root() {
        let dir = tempfile::tempdir().expect("temp dir");
        fs::create_dir_all(dir.path().join("battle")).expect("create dir");
        fs::write(dir.path().join("battle/bonus.rhai"), "fn init() {}").expect("write script");
        let loader = FsResourceLoader::new(dir.path());
        assert_eq!(loader.load_text("battle/bonus.rhai").expect("script loads"), "fn init() {}");
    }

    #[test]
    fn fs_loader_reports_missing_and_escaping_paths_as_not_found() {
        let dir = tempfile::tempdir().expect("temp dir");
        let loader = FsResourceLoader::new(dir.path());
        assert!(matches!(loader.load("absent.erm"), Err(ScriptError::ResourceNotFound { .. })));
        assert!(matches!(loader.load("../outside.erm"), Err(ScriptError::ResourceNotFound { .. })));
    }

    #[test]
    fn memory_loader_serves_inserted_files() {
        let loader = MemoryResourceLoader::new().with_file("a.erm", "!?PI;");
        assert_eq!(loader.load("a.erm").expect("present"), b"!?PI;".to_vec());
        assert!(loader.load("b.erm").is_err());
    }
}
