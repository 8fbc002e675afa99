//! Source lookup for coverage rendering
//!
//! Coverage is keyed by source path (`com/acme/Widget.java`); a
//! [`SourceProvider`] turns that path back into the file's text so counts can
//! be shown next to the lines they belong to.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

/// Resolves a source path to its contents
pub trait SourceProvider: Send + Sync {
    /// `Ok(None)` when the provider has no such file
    fn source(&self, path: &str) -> io::Result<Option<String>>;
}

/// Reads sources from a directory tree
#[derive(Debug, Clone)]
pub struct FilesystemSourceProvider {
    root: PathBuf,
}

impl FilesystemSourceProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl SourceProvider for FilesystemSourceProvider {
    fn source(&self, path: &str) -> io::Result<Option<String>> {
        let relative = Path::new(path);
        // Only plain relative paths resolve under the root
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Ok(None);
        }

        let file = self.root.join(relative);
        match fs::metadata(&file) {
            Ok(meta) if meta.is_file() => {}
            Ok(_) => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        }

        let bytes = fs::read(&file)?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Tries each provider in order; the first hit wins
#[derive(Default)]
pub struct ChainedSourceProvider {
    providers: Vec<Box<dyn SourceProvider>>,
}

impl ChainedSourceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider: impl SourceProvider + 'static) -> Self {
        self.providers.push(Box::new(provider));
        self
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl SourceProvider for ChainedSourceProvider {
    fn source(&self, path: &str) -> io::Result<Option<String>> {
        for provider in &self.providers {
            if let Some(text) = provider.source(path)? {
                return Ok(Some(text));
            }
        }
        Ok(None)
    }
}

/// Render source text with a hit-count gutter
///
/// Lines present in `counts` show their count, including zero; other lines
/// get a blank gutter.
pub fn annotate(text: &str, counts: &BTreeMap<u32, u64>) -> String {
    let width = counts
        .values()
        .map(|c| c.to_string().len())
        .max()
        .unwrap_or(1);

    let mut out = String::new();
    for (i, line) in text.lines().enumerate() {
        let number = i as u32 + 1;
        let gutter = counts
            .get(&number)
            .map(|c| c.to_string())
            .unwrap_or_default();
        let _ = writeln!(out, "{gutter:>width$} | {number:>4}  {line}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("com/acme")).unwrap();
        fs::write(
            dir.path().join("com/acme/Widget.java"),
            "class Widget {\n  int x;\n}\n",
        )
        .unwrap();
        dir
    }

    #[test]
    fn test_finds_file() {
        let dir = tree();
        let provider = FilesystemSourceProvider::new(dir.path());
        let text = provider.source("com/acme/Widget.java").unwrap().unwrap();
        assert!(text.starts_with("class Widget"));
    }

    #[test]
    fn test_missing_file_and_directory_are_none() {
        let dir = tree();
        let provider = FilesystemSourceProvider::new(dir.path());
        assert!(provider.source("no/such/Class.java").unwrap().is_none());
        assert!(provider.source("com/acme").unwrap().is_none());
    }

    #[test]
    fn test_escaping_paths_are_none() {
        let dir = tree();
        let provider = FilesystemSourceProvider::new(dir.path().join("com"));
        assert!(provider.source("../com/acme/Widget.java").unwrap().is_none());
        assert!(provider.source("/etc/hostname").unwrap().is_none());
    }

    #[test]
    fn test_invalid_utf8_is_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Bad.java"), [0xff, 0xfe, 0x00]).unwrap();
        let provider = FilesystemSourceProvider::new(dir.path());
        let err = provider.source("Bad.java").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_chain_first_hit_wins() {
        let empty = tempfile::tempdir().unwrap();
        let full = tree();
        let chain = ChainedSourceProvider::new()
            .with(FilesystemSourceProvider::new(empty.path()))
            .with(FilesystemSourceProvider::new(full.path()));
        assert_eq!(chain.len(), 2);
        assert!(chain.source("com/acme/Widget.java").unwrap().is_some());
        assert!(chain.source("Other.java").unwrap().is_none());
        assert!(ChainedSourceProvider::new().source("x").unwrap().is_none());
    }

    #[test]
    fn test_annotate_gutter() {
        let counts = BTreeMap::from([(2, 12), (3, 0)]);
        let out = annotate("a\nb\nc\n", &counts);
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines[0], "   |    1  a");
        assert_eq!(lines[1], "12 |    2  b");
        assert_eq!(lines[2], " 0 |    3  c");
    }
}
