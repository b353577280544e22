//! # jenngen
//!
//! Incremental code generation from pseudo-code files with a language model.
//!
//! ## Features
//!
//! - Parallel source scanning with `.gitignore` support
//! - Content fingerprint cache: unchanged files are never regenerated
//! - Streaming output with Markdown code fences stripped on the fly
//! - OpenAI-compatible and Ollama completion backends
//! - Watch mode with refresh notifications
//!
//! ## Quick Start
//!
//! ```no_run
//! use jenngen::{completion, Config, Pipeline};
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let config = Config::builder()
//!     .root_dir("./site")
//!     .build()?;
//!
//! let backend = completion::from_config(&config)?;
//! let stats = Pipeline::new(config, backend).await?.run_batch().await?;
//! stats.print_summary();
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! 1. **Scanner**: discovers pseudo-code files, skipping reserved paths
//! 2. **Fingerprint cache**: decides whether a file needs regenerating
//! 3. **Template**: renders the assistant and user prompts
//! 4. **Completion**: streams text fragments from the model
//! 5. **Sink**: strips code fences and writes the output file

#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    clippy::all,
    clippy::pedantic,
    clippy::nursery
)]
#![allow(clippy::module_name_repetitions)]

mod config;
mod error;
mod file;
mod filter;
mod fingerprint;
mod pipeline;
mod refresh;
mod scanner;
mod sink;
mod template;
mod template_validator;
mod watcher;

pub mod completion;

pub use completion::{CompletionSource, FragmentStream, OllamaCompletion, OpenAiCompletion};
pub use config::{Backend, Config, ConfigBuilder, ModelConfig};
pub use error::{Error, Result};
pub use file::SourceFile;
pub use fingerprint::{cache_key, CacheStore, Fingerprint, FingerprintCache, FsCacheStore, MemoryCacheStore};
pub use pipeline::{BatchStats, Outcome, Pipeline};
pub use refresh::{BroadcastRefresh, RefreshHook};
pub use sink::{FenceSink, FenceStripper, SinkReport, HEAD_THRESHOLD, TAIL_WINDOW};
pub use template::Prompt;
pub use watcher::watch;

/// Builds the configured completion backend and runs one batch.
///
/// # Errors
///
/// Returns an error if the configuration is invalid, the backend cannot be
/// created or the source folder cannot be scanned. Per-file failures are
/// reported in the returned [`BatchStats`].
///
/// # Examples
///
/// ```no_run
/// use jenngen::{run, Config};
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let stats = run(Config::builder().root_dir(".").build()?).await?;
/// assert!(stats.is_success());
/// # Ok(())
/// # }
/// ```
pub async fn run(config: Config) -> Result<BatchStats> {
    let backend = completion::from_config(&config)?;
    Pipeline::new(config, backend).await?.run_batch().await
}
