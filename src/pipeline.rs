use crate::{
    completion::CompletionSource,
    config::Config,
    error::{Error, Result},
    file::SourceFile,
    filter::PathFilter,
    fingerprint::{CacheStore, FingerprintCache, FsCacheStore},
    refresh::RefreshHook,
    scanner::Scanner,
    sink::{FenceSink, SinkReport},
    template::{ExampleLibrary, PromptAssembler},
};
use futures::{stream, StreamExt};
use serde::Serialize;
use std::{
    path::Path,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};
use tracing::{debug, error, info, instrument, warn};

/// Result of one generation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Content and model unchanged since the last successful generation
    Skipped,
    /// Output file rewritten
    Generated(SinkReport),
}

/// Statistics collected during a batch build.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchStats {
    /// Total number of input files discovered
    pub total_files: usize,

    /// Files regenerated
    pub generated: usize,

    /// Files skipped as unchanged
    pub skipped: usize,

    /// Files whose generation failed
    pub failed: usize,

    /// Root-relative paths of the failed files
    pub failed_files: Vec<String>,

    /// Bytes written across all outputs
    pub bytes_written: usize,

    /// Total execution time
    pub duration: Duration,

    /// Output directory path
    pub output_directory: String,
}

impl BatchStats {
    /// Returns true if no file failed.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.failed == 0
    }

    fn record(&mut self, path: String, outcome: Result<Outcome>) {
        match outcome {
            Ok(Outcome::Skipped) => self.skipped += 1,
            Ok(Outcome::Generated(report)) => {
                self.generated += 1;
                self.bytes_written += report.bytes_written;
            }
            Err(e) => {
                error!("Generation failed for {}: {}", path, e);
                self.failed += 1;
                self.failed_files.push(path);
            }
        }
    }

    /// Prints a human-readable summary to stdout.
    pub fn print_summary(&self) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║               Generation Summary                      ║");
        println!("╠═══════════════════════════════════════════════════════╣");
        println!(
            "║ Files Found:          {:>8}                        ║",
            self.total_files
        );
        println!(
            "║   - Generated:        {:>8}                        ║",
            self.generated
        );
        println!(
            "║   - Unchanged:        {:>8}                        ║",
            self.skipped
        );
        println!(
            "║   - Failed:           {:>8}                        ║",
            self.failed
        );
        for path in &self.failed_files {
            println!("║       ✗ {path}");
        }
        println!("║                                                       ║");
        println!(
            "║ Bytes Written:        {:>8}                        ║",
            self.bytes_written
        );
        println!("║ Output Directory:                                     ║");
        println!(
            "║   {}                                              ║",
            self.output_directory
        );
        println!(
            "║ Total Time:           {:>8.2}s                     ║",
            self.duration.as_secs_f64()
        );
        println!("╚═══════════════════════════════════════════════════════╝\n");
    }
}

/// Orchestrates scanning, change detection, prompting and streaming output.
pub struct Pipeline {
    config: Config,
    completion: Arc<dyn CompletionSource>,
    cache: FingerprintCache,
    assembler: PromptAssembler,
    filter: PathFilter,
    refresh: Option<Arc<dyn RefreshHook>>,
    folder_files: Mutex<Vec<String>>,
}

impl Pipeline {
    /// Creates a pipeline generating with `completion`.
    ///
    /// Creates the output and cache directories, reads the instruction file
    /// (absent means no instructions) and loads example pairs.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration validation fails
    /// - The output or cache directory cannot be created
    /// - The instruction file exists but cannot be read
    /// - Templates or examples fail to load
    pub async fn new(config: Config, completion: Arc<dyn CompletionSource>) -> Result<Self> {
        config.validate()?;

        for dir in [config.dist_path(), config.cache_path()] {
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|e| Error::io(&dir, e))?;
        }

        let instructions = read_instructions(&config.instruction_path()).await?;

        let examples = match config.examples_dir {
            Some(ref dir) => ExampleLibrary::load(dir)?,
            None => ExampleLibrary::default(),
        };

        let assembler = PromptAssembler::new(&config, instructions, examples)?;
        let filter = PathFilter::new(&config)?;
        let cache = FingerprintCache::new(Arc::new(FsCacheStore::new(config.cache_path())));

        Ok(Self {
            config,
            completion,
            cache,
            assembler,
            filter,
            refresh: None,
            folder_files: Mutex::new(Vec::new()),
        })
    }

    /// Fires `hook` after every change-triggered regeneration.
    #[must_use]
    pub fn with_refresh_hook(mut self, hook: Arc<dyn RefreshHook>) -> Self {
        self.refresh = Some(hook);
        self
    }

    /// Replaces the fingerprint storage.
    #[must_use]
    pub fn with_cache_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.cache = FingerprintCache::new(store);
        self
    }

    /// The configuration this pipeline runs with.
    #[must_use]
    pub const fn config(&self) -> &Config {
        &self.config
    }

    /// Scans the source folder and generates every changed file.
    ///
    /// Up to `config.concurrency` generations run at once on the calling
    /// task. A failing file is logged and counted; it never cancels the
    /// others.
    ///
    /// # Errors
    ///
    /// Returns an error only if the source folder cannot be scanned.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use jenngen::{completion, Config, Pipeline};
    ///
    /// # async fn build() -> anyhow::Result<()> {
    /// let config = Config::builder().root_dir("./site").build()?;
    /// let source = completion::from_config(&config)?;
    ///
    /// let stats = Pipeline::new(config, source).await?.run_batch().await?;
    /// stats.print_summary();
    /// # Ok(())
    /// # }
    /// ```
    #[instrument(skip(self), fields(root_dir = %self.config.root_dir.display()))]
    pub async fn run_batch(&self) -> Result<BatchStats> {
        let start_time = Instant::now();

        info!("Scanning source folder...");
        let scanner = Scanner::new(&self.config, self.filter.clone());
        let root = self.config.root_dir.clone();
        let files = tokio::task::spawn_blocking(move || scanner.scan())
            .await
            .map_err(|e| Error::io(&root, std::io::Error::other(e.to_string())))??;

        info!("Found {} input files", files.len());
        self.set_folder_files(files.iter().map(|f| f.name.clone()).collect());

        let mut stats = BatchStats {
            total_files: files.len(),
            output_directory: self.config.dist_path().display().to_string(),
            ..BatchStats::default()
        };

        let force = self.config.force;
        let outcomes: Vec<(String, Result<Outcome>)> = stream::iter(files)
            .map(|file| async move {
                let path = file.path.clone();
                (path, self.run_one(file, force, None).await)
            })
            .buffer_unordered(self.config.concurrency)
            .collect()
            .await;

        for (path, outcome) in outcomes {
            stats.record(path, outcome);
        }

        stats.duration = start_time.elapsed();

        info!(
            "✓ Generated {}, unchanged {}, failed {} in {:.2}s",
            stats.generated,
            stats.skipped,
            stats.failed,
            stats.duration.as_secs_f64()
        );

        Ok(stats)
    }

    /// Generates one file unless its fingerprint is unchanged.
    ///
    /// The output is streamed into `dist/<path>`; the refresh hook fires and
    /// the fingerprint is recorded only after the stream completed.
    ///
    /// # Errors
    ///
    /// Returns an error if prompt rendering, the completion request, the
    /// stream or the output file fails. Partial output may remain; the
    /// fingerprint is left untouched.
    #[instrument(skip(self, file, refresh), fields(path = %file.path))]
    pub async fn run_one(
        &self,
        file: SourceFile,
        force: bool,
        refresh: Option<&dyn RefreshHook>,
    ) -> Result<Outcome> {
        if !self
            .cache
            .should_generate(&file, &self.config.model, force)
            .await
        {
            debug!("Unchanged, skipping {}", file.path);
            return Ok(Outcome::Skipped);
        }

        let prompt = self.assembler.assemble(&file, &self.folder_files())?;
        info!("Generating {} ({} chars)", file.path, prompt.len());

        let fragments = self
            .completion
            .complete(&prompt.assistant, &prompt.user)
            .await?;

        let destination = file.output_path(&self.config.dist_path());
        let report = FenceSink::create(&destination)
            .await?
            .pipe(fragments)
            .await?;

        if let Some(hook) = refresh {
            hook.refresh(&file.path);
        }

        if let Err(e) = self.cache.record_generated(&file, &self.config.model).await {
            warn!("Failed to record fingerprint for {}: {}", file.path, e);
        }

        info!("Generated {} ({} bytes)", file.path, report.bytes_written);
        Ok(Outcome::Generated(report))
    }

    /// Regenerates the file at root-relative `relative` after a change.
    ///
    /// Returns `Ok(None)` for reserved or excluded paths, directories,
    /// binary files and paths that no longer exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or its generation fails.
    pub async fn handle_change(&self, relative: &Path) -> Result<Option<Outcome>> {
        if !self.filter.should_process(relative) {
            debug!("Ignoring change to {}", relative.display());
            return Ok(None);
        }

        let absolute = self.config.root_dir.join(relative);
        let metadata = match tokio::fs::metadata(&absolute).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("{} disappeared before it could be read", relative.display());
                return Ok(None);
            }
            Err(e) => return Err(Error::io(&absolute, e)),
        };

        if !metadata.is_file() {
            return Ok(None);
        }

        let Some(file) = SourceFile::read(&self.config.root_dir, relative).await? else {
            debug!("Skipping binary file {}", relative.display());
            return Ok(None);
        };

        self.remember_folder_file(&file.name);

        let outcome = self.run_one(file, false, self.refresh.as_deref()).await?;
        Ok(Some(outcome))
    }

    fn folder_files(&self) -> Vec<String> {
        self.folder_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_folder_files(&self, names: Vec<String>) {
        *self
            .folder_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = names;
    }

    fn remember_folder_file(&self, name: &str) {
        let mut names = self
            .folder_files
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !names.iter().any(|known| known == name) {
            names.push(name.to_string());
        }
    }
}

async fn read_instructions(path: &Path) -> Result<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(instructions) => {
            debug!("Loaded instructions from {}", path.display());
            Ok(instructions)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(Error::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::{FragmentStream, MockCompletionSource};
    use crate::fingerprint::MemoryCacheStore;
    use assert_fs::prelude::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fragments(parts: &[&str]) -> FragmentStream {
        let parts: Vec<Result<String>> = parts.iter().map(|p| Ok((*p).to_string())).collect();
        stream::iter(parts).boxed()
    }

    fn html_mock() -> MockCompletionSource {
        let mut mock = MockCompletionSource::new();
        mock.expect_complete()
            .returning(|_, _| Ok(fragments(&["```html\n", "<p>ok</p>", "\n```"])));
        mock
    }

    async fn pipeline_for(root: &Path, mock: MockCompletionSource) -> Pipeline {
        let config = Config::builder().root_dir(root).build().unwrap();
        Pipeline::new(config, Arc::new(mock)).await.unwrap()
    }

    #[tokio::test]
    async fn test_batch_generates_every_file() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("index.html").write_str("[home]").unwrap();
        temp.child("blog/post.html").write_str("[post]").unwrap();

        let pipeline = pipeline_for(temp.path(), html_mock()).await;
        let stats = pipeline.run_batch().await.unwrap();

        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.generated, 2);
        assert!(stats.is_success());
        temp.child(".dist/index.html").assert("<p>ok</p>\n");
        temp.child(".dist/blog/post.html").assert("<p>ok</p>\n");
        temp.child(".jenngen_cache/blog_post.html")
            .assert(predicates::path::exists());
    }

    #[tokio::test]
    async fn test_second_batch_skips_unchanged() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("index.html").write_str("[home]").unwrap();

        let mut mock = MockCompletionSource::new();
        mock.expect_complete()
            .times(1)
            .returning(|_, _| Ok(fragments(&["<p>once</p>"])));
        let pipeline = pipeline_for(temp.path(), mock).await;

        let first = pipeline.run_batch().await.unwrap();
        let second = pipeline.run_batch().await.unwrap();

        assert_eq!(first.generated, 1);
        assert_eq!(second.generated, 0);
        assert_eq!(second.skipped, 1);
    }

    #[tokio::test]
    async fn test_force_regenerates() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("index.html").write_str("[home]").unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut mock = MockCompletionSource::new();
        mock.expect_complete().returning(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(fragments(&["x"]))
        });

        let config = Config::builder()
            .root_dir(temp.path())
            .force(true)
            .build()
            .unwrap();
        let pipeline = Pipeline::new(config, Arc::new(mock)).await.unwrap();

        pipeline.run_batch().await.unwrap();
        pipeline.run_batch().await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failure_does_not_cancel_siblings() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("good.html").write_str("[good]").unwrap();
        temp.child("bad.html").write_str("[bad]").unwrap();

        let mut mock = MockCompletionSource::new();
        mock.expect_complete().returning(|_, prompt| {
            if prompt.contains("FILE: bad.html") {
                Err(Error::completion("503 Service Unavailable"))
            } else {
                Ok(fragments(&["<p>good</p>"]))
            }
        });
        let pipeline = pipeline_for(temp.path(), mock).await;

        let stats = pipeline.run_batch().await.unwrap();

        assert_eq!(stats.generated, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.failed_files, vec!["bad.html"]);
        temp.child(".dist/good.html").assert("<p>good</p>");
        temp.child(".jenngen_cache/bad.html")
            .assert(predicates::path::missing());
    }

    #[tokio::test]
    async fn test_stream_error_leaves_cache_untouched() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("index.html").write_str("[home]").unwrap();

        let mut mock = MockCompletionSource::new();
        mock.expect_complete().returning(|_, _| {
            let parts = vec![Ok("<p>partial".to_string()), Err(Error::completion("reset"))];
            Ok(stream::iter(parts).boxed())
        });
        let store = MemoryCacheStore::new();
        let pipeline = pipeline_for(temp.path(), mock)
            .await
            .with_cache_store(Arc::new(store.clone()));

        let file = SourceFile::new("index.html", temp.path().join("index.html"), "[home]".into());
        let err = pipeline.run_one(file, false, None).await.unwrap_err();

        assert!(err.is_completion());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_handle_change_ignores_reserved_paths() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child(".dist/index.html").write_str("<p></p>").unwrap();
        temp.child(".jenngen").write_str("be nice").unwrap();

        let mut mock = MockCompletionSource::new();
        mock.expect_complete().never();
        let pipeline = pipeline_for(temp.path(), mock).await;

        assert!(pipeline
            .handle_change(Path::new(".dist/index.html"))
            .await
            .unwrap()
            .is_none());
        assert!(pipeline
            .handle_change(Path::new(".jenngen"))
            .await
            .unwrap()
            .is_none());
        assert!(pipeline
            .handle_change(Path::new("deleted.html"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_handle_change_fires_refresh() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child("about.html").write_str("[about]").unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let hook = move |path: &str| sink.lock().unwrap().push(path.to_string());

        let pipeline = pipeline_for(temp.path(), html_mock())
            .await
            .with_refresh_hook(Arc::new(hook));

        let outcome = pipeline
            .handle_change(Path::new("about.html"))
            .await
            .unwrap();

        assert!(matches!(outcome, Some(Outcome::Generated(_))));
        assert_eq!(*seen.lock().unwrap(), vec!["about.html"]);
        temp.child(".dist/about.html").assert("<p>ok</p>\n");

        // Same content again: skipped, no refresh.
        let outcome = pipeline
            .handle_change(Path::new("about.html"))
            .await
            .unwrap();
        assert_eq!(outcome, Some(Outcome::Skipped));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_instructions_reach_prompt() {
        let temp = assert_fs::TempDir::new().unwrap();
        temp.child(".jenngen").write_str("Use a dark blue theme").unwrap();
        temp.child("index.html").write_str("[home]").unwrap();

        let mut mock = MockCompletionSource::new();
        mock.expect_complete()
            .withf(|assistant, prompt| {
                assistant.contains("Use a dark blue theme")
                    && assistant.contains("index.html")
                    && prompt.ends_with("FILE: index.html\nCONTENTS: [home]")
            })
            .times(1)
            .returning(|_, _| Ok(fragments(&["<p>home</p>"])));
        let pipeline = pipeline_for(temp.path(), mock).await;

        let stats = pipeline.run_batch().await.unwrap();
        assert_eq!(stats.generated, 1);
    }
}
