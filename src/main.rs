use anyhow::Context;
use clap::Parser;
use jenngen::{completion, BroadcastRefresh, Config, ModelConfig, Pipeline};
use std::{future::Future, io, path::PathBuf, sync::Arc};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(
    name = "jenngen",
    version,
    author,
    about = "Generate code from pseudo-code files with a language model",
    long_about = "Generate code from pseudo-code files with a language model.\n\n\
    Every file in the source folder is treated as a plain-language description of \
    the file to produce. Generated files are written to the output directory \
    (.dist by default); unchanged files are skipped using a content fingerprint \
    cache.\n\n\
    USAGE EXAMPLES:\n  \
      # Build the current directory\n  \
      jenngen\n\n  \
      # Build a site and keep regenerating on change\n  \
      jenngen ./site --watch\n\n  \
      # Use a local Ollama model and rebuild everything\n  \
      jenngen ./site --ollama-model llama3 --force"
)]
struct Cli {
    /// Source folder holding the pseudo-code files
    #[arg(default_value = ".", value_name = "PATH")]
    dir: PathBuf,

    /// Regenerate every file, ignoring the cache
    #[arg(short, long)]
    force: bool,

    /// Keep running and regenerate files as they change
    #[arg(short, long)]
    watch: bool,

    /// OpenAI model name
    #[arg(long, env = "JENNGEN_MODEL", default_value = "gpt-3.5-turbo")]
    model: String,

    /// Ollama model name; selects the Ollama backend when set
    #[arg(long, env = "JENNGEN_OLLAMA_MODEL", value_name = "MODEL")]
    ollama_model: Option<String>,

    /// Output directory, relative to the source folder
    #[arg(long, env = "JENNGEN_DIST", value_name = "PATH")]
    dist: Option<PathBuf>,

    /// Cache directory, relative to the source folder
    #[arg(long, env = "JENNGEN_CACHE", value_name = "PATH")]
    cache: Option<PathBuf>,

    /// Instruction file, relative to the source folder
    #[arg(long, env = "JENNGEN_INSTRUCTIONS", value_name = "FILE")]
    instructions: Option<PathBuf>,

    /// Directory with prompt/ and completion/ example pairs
    #[arg(long, env = "JENNGEN_EXAMPLES", value_name = "PATH")]
    examples: Option<PathBuf>,

    /// Path to a custom Tera assistant template
    #[arg(long, env = "JENNGEN_TEMPLATE", value_name = "FILE")]
    template: Option<PathBuf>,

    /// Extra glob patterns to exclude (can be used multiple times)
    #[arg(long, value_name = "GLOB")]
    exclude: Vec<String>,

    /// Also process files matched by .gitignore
    #[arg(long)]
    no_gitignore: bool,

    /// Maximum number of generations in flight
    #[arg(long, env = "JENNGEN_CONCURRENCY")]
    concurrency: Option<usize>,

    /// Sampling temperature
    #[arg(long, env = "JENNGEN_TEMPERATURE")]
    temperature: Option<f32>,

    /// Nucleus sampling probability mass
    #[arg(long, env = "JENNGEN_TOP_P")]
    top_p: Option<f32>,

    /// Base URL of the OpenAI-compatible API
    #[arg(long, env = "JENNGEN_OPENAI_BASE_URL", value_name = "URL")]
    openai_base_url: Option<String>,

    /// API key for the OpenAI-compatible API
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    openai_api_key: Option<String>,

    /// Base URL of the Ollama server
    #[arg(long, env = "JENNGEN_OLLAMA_HOST", value_name = "URL")]
    ollama_host: Option<String>,

    /// Verbose output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<Config> {
        let model = match self.ollama_model {
            Some(name) => ModelConfig::ollama(name),
            None => ModelConfig::openai(self.model),
        };

        let mut builder = Config::builder()
            .root_dir(self.dir)
            .model(model)
            .force(self.force)
            .respect_gitignore(!self.no_gitignore)
            .exclude(self.exclude);

        if let Some(path) = self.dist {
            builder = builder.dist_dir(path);
        }
        if let Some(path) = self.cache {
            builder = builder.cache_dir(path);
        }
        if let Some(path) = self.instructions {
            builder = builder.instruction_file(path);
        }
        if let Some(path) = self.examples {
            builder = builder.examples_dir(path);
        }
        if let Some(path) = self.template {
            builder = builder.template_path(path);
        }
        if let Some(limit) = self.concurrency {
            builder = builder.concurrency(limit);
        }
        if let Some(temperature) = self.temperature {
            builder = builder.temperature(temperature);
        }
        if let Some(top_p) = self.top_p {
            builder = builder.top_p(top_p);
        }
        if let Some(url) = self.openai_base_url {
            builder = builder.openai_base_url(url);
        }
        if let Some(key) = self.openai_api_key {
            builder = builder.openai_api_key(key);
        }
        if let Some(host) = self.ollama_host {
            builder = builder.ollama_host(host);
        }

        builder.build().context("Failed to build configuration")
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    setup_tracing(cli.verbose)?;

    let watch = cli.watch;
    let config = cli.into_config()?;

    let backend = completion::from_config(&config).context("Failed to create completion backend")?;
    let mut pipeline = Pipeline::new(config, backend)
        .await
        .context("Failed to create pipeline")?;

    let stats = pipeline
        .run_batch()
        .await
        .context("Batch generation failed")?;
    stats.print_summary();

    if !watch {
        return Ok(());
    }

    let refresh = BroadcastRefresh::new(64);
    let mut reloads = refresh.subscribe();
    tokio::spawn(async move {
        loop {
            match reloads.recv().await {
                Ok(path) => info!("Reloaded due to change in {}", path),
                Err(RecvError::Lagged(missed)) => warn!("Missed {} reload notification(s)", missed),
                Err(RecvError::Closed) => break,
            }
        }
    });
    pipeline = pipeline.with_refresh_hook(Arc::new(refresh));

    jenngen::watch(Arc::new(pipeline), async {
        wait_for_shutdown(tokio::signal::ctrl_c()).await;
    })
    .await
    .context("Watch mode failed")?;

    Ok(())
}

/// Waits for the shutdown signal. Returns false if it could not be installed.
async fn wait_for_shutdown<F>(signal: F) -> bool
where
    F: Future<Output = io::Result<()>>,
{
    match signal.await {
        Ok(()) => true,
        Err(e) => {
            warn!("Cannot listen for Ctrl-C, stopping watch mode: {}", e);
            false
        }
    }
}

fn setup_tracing(verbosity: u8) -> anyhow::Result<()> {
    let filter = match verbosity {
        0 => EnvFilter::new("jenngen=info"),
        1 => EnvFilter::new("jenngen=debug"),
        _ => EnvFilter::new("jenngen=trace"),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_thread_ids(false))
        .init();

    Ok(())
}
