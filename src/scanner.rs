use crate::{
    config::Config,
    error::{Error, Result},
    file::{has_binary_extension, SourceFile},
    filter::PathFilter,
};
use ignore::{DirEntry, WalkBuilder, WalkState};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{debug, trace, warn};

/// Statistics collected during scanning.
#[derive(Debug, Default, Clone)]
pub(crate) struct ScanStats {
    /// Files seen by the walker
    pub total_files: usize,

    /// Files skipped as binary
    pub binary_files: usize,

    /// Errors encountered
    pub errors: usize,
}

/// Discovers pseudo-code inputs below the source root.
pub(crate) struct Scanner {
    root_dir: PathBuf,
    respect_gitignore: bool,
    filter: PathFilter,
}

impl Scanner {
    /// Creates a new scanner from configuration.
    pub(crate) fn new(config: &Config, filter: PathFilter) -> Self {
        Self {
            root_dir: config.root_dir.clone(),
            respect_gitignore: config.respect_gitignore,
            filter,
        }
    }

    /// Scans the root directory and returns a snapshot of every input file.
    ///
    /// Unreadable individual files are logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the root directory itself cannot be read.
    pub(crate) fn scan(&self) -> Result<Vec<SourceFile>> {
        // The walker reports an unreadable root as a per-entry error; surface it as fatal.
        fs::read_dir(&self.root_dir).map_err(|e| Error::io(&self.root_dir, e))?;

        let files = Arc::new(Mutex::new(Vec::new()));
        let stats = Arc::new(Mutex::new(ScanStats::default()));

        debug!("Starting parallel scan of {}", self.root_dir.display());

        let root_for_filter = self.root_dir.clone();
        let entry_filter = self.filter.clone();
        let walker = WalkBuilder::new(&self.root_dir)
            .git_ignore(self.respect_gitignore)
            .git_global(self.respect_gitignore)
            .git_exclude(self.respect_gitignore)
            .require_git(false)
            .hidden(false)
            .follow_links(false)
            .threads(num_cpus::get())
            .filter_entry(move |entry| {
                // Never descend into reserved directories.
                entry.depth() == 0 || {
                    let relative = entry
                        .path()
                        .strip_prefix(&root_for_filter)
                        .unwrap_or(entry.path());
                    entry_filter.should_process(relative)
                }
            })
            .build_parallel();

        walker.run(|| {
            let files = Arc::clone(&files);
            let stats = Arc::clone(&stats);
            let root = self.root_dir.clone();
            Box::new(move |result| {
                match result {
                    Ok(entry) if entry.file_type().is_some_and(|ft| ft.is_file()) => {
                        lock(&stats).total_files += 1;

                        match Self::process_entry(&entry, &root) {
                            Ok(Some(file)) => lock(&files).push(file),
                            Ok(None) => lock(&stats).binary_files += 1,
                            Err(e) => {
                                warn!("Failed to read {}: {}", entry.path().display(), e);
                                lock(&stats).errors += 1;
                            }
                        }
                    }
                    Err(e) => {
                        warn!("Walk error: {}", e);
                        lock(&stats).errors += 1;
                    }
                    _ => {}
                }
                WalkState::Continue
            })
        });

        let mut files = std::mem::take(&mut *lock(&files));
        let stats = lock(&stats).clone();

        debug!(
            "Scan complete: {} total, {} binary, {} errors",
            stats.total_files, stats.binary_files, stats.errors
        );

        if stats.errors > 0 {
            warn!(
                "Encountered {} errors during scanning (non-fatal)",
                stats.errors
            );
        }

        if files.is_empty() {
            warn!("No input files found in {}", self.root_dir.display());
        }

        // Sort for deterministic ordering
        files.sort_by(|a, b| a.path.cmp(&b.path));

        Ok(files)
    }

    /// Reads a single directory entry into a snapshot.
    fn process_entry(entry: &DirEntry, root: &Path) -> Result<Option<SourceFile>> {
        let path = entry.path();

        trace!("Processing file: {}", path.display());

        let relative_path = pathdiff::diff_paths(path, root)
            .unwrap_or_else(|| path.to_path_buf())
            .to_string_lossy()
            .to_string();

        if has_binary_extension(path) {
            debug!("Skipping binary file: {}", relative_path);
            return Ok(None);
        }

        let bytes = fs::read(path).map_err(|e| Error::io(path, e))?;
        let file = SourceFile::from_bytes(relative_path, path.to_path_buf(), bytes)?;
        if file.is_none() {
            debug!("Skipping binary file: {}", path.display());
        }

        Ok(file)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    fn scanner_for(root: &Path) -> Scanner {
        let config = Config::builder().root_dir(root).build().unwrap();
        let filter = PathFilter::new(&config).unwrap();
        Scanner::new(&config, filter)
    }

    #[test]
    fn test_scan_nested_files() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("index.html").write_str("[home page]").unwrap();
        temp.child("blog/post.html").write_str("[a post]").unwrap();

        let files = scanner_for(temp.path()).scan().unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();

        assert_eq!(paths, vec!["blog/post.html", "index.html"]);
        assert_eq!(files[0].name, "post.html");
        assert_eq!(files[0].content, "[a post]");
    }

    #[test]
    fn test_scan_skips_reserved() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("index.html").write_str("[home page]").unwrap();
        temp.child(".jenngen").write_str("Use a blue theme").unwrap();
        temp.child(".dist/index.html").write_str("<html></html>").unwrap();
        temp.child(".jenngen_cache/index.html").write_str("abc").unwrap();
        temp.child("node_modules/x/index.js").write_str("x").unwrap();
        temp.child(".env").write_str("SECRET=1").unwrap();

        let files = scanner_for(temp.path()).scan().unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();

        assert_eq!(paths, vec!["index.html"]);
    }

    #[test]
    fn test_scan_skips_binary() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("index.html").write_str("[home page]").unwrap();
        temp.child("logo.png").write_binary(&[0x89, 0x50, 0x4e, 0x47]).unwrap();
        temp.child("data.bin").write_binary(&[0u8; 32]).unwrap();

        let files = scanner_for(temp.path()).scan().unwrap();

        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path, "index.html");
    }

    #[test]
    fn test_scan_skips_undecodable_files() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("index.html").write_str("[home page]").unwrap();
        temp.child("menu.txt").write_binary(b"caf\xe9 au lait").unwrap();
        temp.child("blob").write_binary(&[0u8; 64]).unwrap();

        let files = scanner_for(temp.path()).scan().unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();

        assert_eq!(paths, vec!["index.html"]);
    }

    #[test]
    fn test_scan_nested_custom_dirs() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("index.html").write_str("[home page]").unwrap();
        temp.child("assets/cache/notes.html").write_str("[notes]").unwrap();
        temp.child("site/index.html").write_str("[site]").unwrap();
        temp.child("build/cache/index.html").write_str("abc").unwrap();
        temp.child("out/site/index.html").write_str("<html></html>").unwrap();

        let config = Config::builder()
            .root_dir(temp.path())
            .cache_dir("build/cache")
            .dist_dir("out/site")
            .build()
            .unwrap();
        let filter = PathFilter::new(&config).unwrap();
        let files = Scanner::new(&config, filter).scan().unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();

        assert_eq!(
            paths,
            vec!["assets/cache/notes.html", "index.html", "site/index.html"]
        );
    }

    #[test]
    fn test_scan_respects_gitignore() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child(".gitignore").write_str("drafts/\n").unwrap();
        temp.child("index.html").write_str("[home page]").unwrap();
        temp.child("drafts/wip.html").write_str("[wip]").unwrap();

        let files = scanner_for(temp.path()).scan().unwrap();
        let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();

        assert_eq!(paths, vec!["index.html"]);
    }

    #[test]
    fn test_scan_empty_root() {
        let temp = assert_fs::TempDir::new().unwrap();
        let files = scanner_for(temp.path()).scan().unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn test_scan_missing_root_is_fatal() {
        let temp = assert_fs::TempDir::new().unwrap();
        let scanner = scanner_for(temp.path());
        temp.close().unwrap();

        assert!(scanner.scan().unwrap_err().is_io());
    }
}
