use crate::error::{Error, Result};
use std::fmt;
use std::path::PathBuf;

const DEFAULT_DIST_DIR: &str = ".dist";
const DEFAULT_CACHE_DIR: &str = ".jenngen_cache";
const DEFAULT_INSTRUCTION_FILE: &str = ".jenngen";
const DEFAULT_OPENAI_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OLLAMA_HOST: &str = "http://localhost:11434";
const DEFAULT_TEMPERATURE: f32 = 0.3;
const DEFAULT_TOP_P: f32 = 1.0;
const DEFAULT_CONCURRENCY: usize = 16;

/// Completion backend serving the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// OpenAI-compatible chat completions API
    OpenAi,
    /// Local Ollama server
    Ollama,
}

impl Backend {
    /// Returns the stable identifier of this backend.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies the backend and model used for a process run.
///
/// Part of every fingerprint, so switching models regenerates everything.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ModelConfig {
    /// Backend serving the model
    pub backend: Backend,
    /// Model name as understood by the backend
    pub model: String,
}

impl ModelConfig {
    /// Creates an OpenAI model configuration.
    #[must_use]
    pub fn openai(model: impl Into<String>) -> Self {
        Self {
            backend: Backend::OpenAi,
            model: model.into(),
        }
    }

    /// Creates an Ollama model configuration.
    #[must_use]
    pub fn ollama(model: impl Into<String>) -> Self {
        Self {
            backend: Backend::Ollama,
            model: model.into(),
        }
    }

    /// Stable string identity fed into fingerprints.
    #[must_use]
    pub fn identity(&self) -> String {
        format!("{}:{}", self.backend, self.model)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self::openai(DEFAULT_OPENAI_MODEL)
    }
}

impl fmt::Display for ModelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity())
    }
}

/// Configuration for the jenngen pipeline.
///
/// Use [`Config::builder()`] to construct a new configuration.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct Config {
    /// Source folder holding the pseudo-code files
    pub root_dir: PathBuf,

    /// Output directory, relative to the root
    pub dist_dir: PathBuf,

    /// Fingerprint cache directory, relative to the root
    pub cache_dir: PathBuf,

    /// Instruction file, relative to the root
    pub instruction_file: PathBuf,

    /// Directory with `prompt/` and `completion/` example pairs
    pub examples_dir: Option<PathBuf>,

    /// Model used for generation
    pub model: ModelConfig,

    /// Base URL of the OpenAI-compatible API
    pub openai_base_url: String,

    /// API key for the OpenAI-compatible API
    pub openai_api_key: Option<String>,

    /// Base URL of the Ollama server
    pub ollama_host: String,

    /// Sampling temperature
    pub temperature: f32,

    /// Nucleus sampling probability mass
    pub top_p: f32,

    /// Regenerate every file regardless of the cache
    pub force: bool,

    /// Maximum number of generations in flight during a batch
    pub concurrency: usize,

    /// Honour `.gitignore` files while scanning
    pub respect_gitignore: bool,

    /// Path to an external assistant prompt template
    pub template_path: Option<PathBuf>,

    /// Extra glob patterns excluded from generation
    pub exclude: Vec<String>,
}

impl Config {
    /// Creates a new configuration builder.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use jenngen::{Config, ModelConfig};
    ///
    /// let config = Config::builder()
    ///     .root_dir("./site")
    ///     .model(ModelConfig::ollama("llama3"))
    ///     .build()
    ///     .expect("valid configuration");
    /// ```
    #[must_use]
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Root directory doesn't exist or is not a directory
    /// - Sampling parameters are out of range
    /// - Concurrency is zero or the model name is empty
    /// - The external template is invalid
    /// - An exclude pattern is not a valid glob
    pub fn validate(&self) -> Result<()> {
        if !self.root_dir.exists() {
            return Err(Error::config(format!(
                "Root directory does not exist: {}",
                self.root_dir.display()
            )));
        }

        if !self.root_dir.is_dir() {
            return Err(Error::config(format!(
                "Root path is not a directory: {}",
                self.root_dir.display()
            )));
        }

        if self.model.model.trim().is_empty() {
            return Err(Error::config("model name must not be empty"));
        }

        if self.concurrency == 0 {
            return Err(Error::config("concurrency must be greater than 0"));
        }

        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(Error::config(format!(
                "temperature ({}) must be between 0.0 and 2.0",
                self.temperature
            )));
        }

        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(Error::config(format!(
                "top_p ({}) must be between 0.0 and 1.0",
                self.top_p
            )));
        }

        for pattern in &self.exclude {
            globset::Glob::new(pattern)
                .map_err(|e| Error::invalid_pattern(pattern, e.to_string()))?;
        }

        if let Some(ref template_path) = self.template_path {
            crate::template_validator::TemplateValidator::validate_template(template_path)?;
        }

        if let Some(ref examples_dir) = self.examples_dir {
            if !examples_dir.is_dir() {
                return Err(Error::config(format!(
                    "Examples directory does not exist: {}",
                    examples_dir.display()
                )));
            }
        }

        if self.model.backend == Backend::OpenAi && self.openai_api_key.is_none() {
            tracing::warn!("No OpenAI API key configured; requests will be sent unauthenticated");
        }

        Ok(())
    }

    /// Absolute location of the output directory.
    #[must_use]
    pub fn dist_path(&self) -> PathBuf {
        self.root_dir.join(&self.dist_dir)
    }

    /// Absolute location of the fingerprint cache directory.
    #[must_use]
    pub fn cache_path(&self) -> PathBuf {
        self.root_dir.join(&self.cache_dir)
    }

    /// Absolute location of the instruction file.
    #[must_use]
    pub fn instruction_path(&self) -> PathBuf {
        self.root_dir.join(&self.instruction_file)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            dist_dir: PathBuf::from(DEFAULT_DIST_DIR),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            instruction_file: PathBuf::from(DEFAULT_INSTRUCTION_FILE),
            examples_dir: None,
            model: ModelConfig::default(),
            openai_base_url: DEFAULT_OPENAI_BASE_URL.to_string(),
            openai_api_key: None,
            ollama_host: DEFAULT_OLLAMA_HOST.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            top_p: DEFAULT_TOP_P,
            force: false,
            concurrency: DEFAULT_CONCURRENCY,
            respect_gitignore: true,
            template_path: None,
            exclude: Vec::new(),
        }
    }
}

/// Builder for creating a [`Config`].
#[derive(Debug, Default)]
pub struct ConfigBuilder {
    root_dir: Option<PathBuf>,
    dist_dir: Option<PathBuf>,
    cache_dir: Option<PathBuf>,
    instruction_file: Option<PathBuf>,
    examples_dir: Option<PathBuf>,
    model: Option<ModelConfig>,
    openai_base_url: Option<String>,
    openai_api_key: Option<String>,
    ollama_host: Option<String>,
    temperature: Option<f32>,
    top_p: Option<f32>,
    force: bool,
    concurrency: Option<usize>,
    respect_gitignore: Option<bool>,
    template_path: Option<PathBuf>,
    exclude: Vec<String>,
}

impl ConfigBuilder {
    /// Sets the source folder.
    #[must_use]
    pub fn root_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(path.into());
        self
    }

    /// Sets the output directory, relative to the root.
    #[must_use]
    pub fn dist_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.dist_dir = Some(path.into());
        self
    }

    /// Sets the fingerprint cache directory, relative to the root.
    #[must_use]
    pub fn cache_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.cache_dir = Some(path.into());
        self
    }

    /// Sets the instruction file, relative to the root.
    #[must_use]
    pub fn instruction_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.instruction_file = Some(path.into());
        self
    }

    /// Sets the directory holding prompt/completion example pairs.
    ///
    /// Files under `prompt/` become input examples and files under
    /// `completion/` become output examples; only examples sharing the
    /// target file's extension are included in a prompt.
    #[must_use]
    pub fn examples_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.examples_dir = Some(path.into());
        self
    }

    /// Sets the model.
    #[must_use]
    pub fn model(mut self, model: ModelConfig) -> Self {
        self.model = Some(model);
        self
    }

    /// Sets the base URL of the OpenAI-compatible API.
    #[must_use]
    pub fn openai_base_url(mut self, url: impl Into<String>) -> Self {
        self.openai_base_url = Some(url.into());
        self
    }

    /// Sets the OpenAI API key.
    #[must_use]
    pub fn openai_api_key(mut self, key: impl Into<String>) -> Self {
        self.openai_api_key = Some(key.into());
        self
    }

    /// Sets the Ollama server URL.
    #[must_use]
    pub fn ollama_host(mut self, host: impl Into<String>) -> Self {
        self.ollama_host = Some(host.into());
        self
    }

    /// Sets the sampling temperature.
    #[must_use]
    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Sets the nucleus sampling probability mass.
    #[must_use]
    pub fn top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Forces regeneration of every file, bypassing the cache.
    #[must_use]
    pub fn force(mut self, enabled: bool) -> Self {
        self.force = enabled;
        self
    }

    /// Sets the maximum number of generations in flight.
    #[must_use]
    pub fn concurrency(mut self, limit: usize) -> Self {
        self.concurrency = Some(limit);
        self
    }

    /// Enables or disables `.gitignore` handling while scanning.
    #[must_use]
    pub fn respect_gitignore(mut self, enabled: bool) -> Self {
        self.respect_gitignore = Some(enabled);
        self
    }

    /// Sets the path to an external assistant prompt template.
    ///
    /// The template must contain valid Tera syntax and reference the
    /// `instructions` variable.
    #[must_use]
    pub fn template_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.template_path = Some(path.into());
        self
    }

    /// Sets extra glob patterns to exclude, matched against root-relative paths.
    #[must_use]
    pub fn exclude(mut self, patterns: Vec<String>) -> Self {
        self.exclude = patterns;
        self
    }

    /// Builds the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn build(self) -> Result<Config> {
        let config = Config {
            root_dir: self.root_dir.unwrap_or_else(|| PathBuf::from(".")),
            dist_dir: self
                .dist_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DIST_DIR)),
            cache_dir: self
                .cache_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR)),
            instruction_file: self
                .instruction_file
                .unwrap_or_else(|| PathBuf::from(DEFAULT_INSTRUCTION_FILE)),
            examples_dir: self.examples_dir,
            model: self.model.unwrap_or_default(),
            openai_base_url: self
                .openai_base_url
                .unwrap_or_else(|| DEFAULT_OPENAI_BASE_URL.to_string()),
            openai_api_key: self.openai_api_key,
            ollama_host: self
                .ollama_host
                .unwrap_or_else(|| DEFAULT_OLLAMA_HOST.to_string()),
            temperature: self.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            top_p: self.top_p.unwrap_or(DEFAULT_TOP_P),
            force: self.force,
            concurrency: self.concurrency.unwrap_or(DEFAULT_CONCURRENCY),
            respect_gitignore: self.respect_gitignore.unwrap_or(true),
            template_path: self.template_path,
            exclude: self.exclude,
        };

        config.validate()?;
        Ok(config)
    }
}
