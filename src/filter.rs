//! Path filtering for scans and change events.
//!
//! Decides which root-relative paths are pseudo-code inputs. The configured
//! output directory, cache directory and instruction file are reserved as
//! root-relative paths; VCS and tooling droppings are reserved by name,
//! wherever they appear in the tree.

use crate::config::Config;
use crate::error::{Error, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

/// Names skipped in addition to the configured output, cache and instruction paths.
const ALWAYS_RESERVED: &[&str] = &[
    "node_modules",
    ".git",
    ".gitignore",
    ".DS_Store",
    ".env",
];

/// Decides whether a root-relative path should be generated.
#[derive(Debug, Clone)]
pub(crate) struct PathFilter {
    reserved_names: HashSet<String>,
    reserved_paths: Vec<PathBuf>,
    exclude: GlobSet,
}

impl PathFilter {
    /// Builds the filter from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if an exclude pattern is not a valid glob.
    pub(crate) fn new(config: &Config) -> Result<Self> {
        let reserved_names = ALWAYS_RESERVED.iter().map(|name| (*name).to_string()).collect();

        let reserved_paths = [&config.dist_dir, &config.cache_dir, &config.instruction_file]
            .into_iter()
            .filter_map(|path| root_relative(&config.root_dir, path))
            .collect();

        Ok(Self {
            reserved_names,
            reserved_paths,
            exclude: Self::build_globset(&config.exclude)?,
        })
    }

    fn build_globset(patterns: &[String]) -> Result<GlobSet> {
        let mut builder = GlobSetBuilder::new();

        for pattern in patterns {
            let glob =
                Glob::new(pattern).map_err(|e| Error::invalid_pattern(pattern, e.to_string()))?;
            builder.add(glob);
        }

        builder
            .build()
            .map_err(|e| Error::config(format!("Failed to build glob set: {e}")))
    }

    /// True if `name` is a reserved file or directory name.
    pub(crate) fn is_reserved_name(&self, name: &OsStr) -> bool {
        name.to_str()
            .map(|name| self.reserved_names.contains(name))
            .unwrap_or(false)
    }

    /// Returns true if the root-relative `path` is a generation input.
    pub(crate) fn should_process(&self, path: &Path) -> bool {
        for component in path.components() {
            match component {
                Component::Normal(name) if self.is_reserved_name(name) => return false,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return false,
                _ => {}
            }
        }

        let normalized = normalize(path);
        if self
            .reserved_paths
            .iter()
            .any(|reserved| normalized.starts_with(reserved))
        {
            return false;
        }

        if self.exclude.is_match(path) {
            return false;
        }

        // Excluding a directory excludes everything below it.
        for ancestor in path.ancestors().skip(1) {
            if !ancestor.as_os_str().is_empty() && self.exclude.is_match(ancestor) {
                return false;
            }
        }

        true
    }
}

/// Keeps only the named components of `path`.
fn normalize(path: &Path) -> PathBuf {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(name) => Some(name),
            _ => None,
        })
        .collect()
}

/// Root-relative form of a configured path; `None` if it lies outside the root.
fn root_relative(root: &Path, path: &Path) -> Option<PathBuf> {
    let relative = if path.is_absolute() {
        path.strip_prefix(root).ok()?
    } else {
        path
    };

    let normalized = normalize(relative);
    (!normalized.as_os_str().is_empty()).then_some(normalized)
}
