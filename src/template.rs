use crate::{
    config::Config,
    error::{Error, Result},
    file::{has_binary_extension, SourceFile},
};
use serde::Serialize;
use std::{
    fs,
    path::{Path, PathBuf},
};
use tera::{Context, Tera};
use tracing::{debug, warn};
use walkdir::WalkDir;

const ASSISTANT_TEMPLATE: &str = "assistant";
const FILE_TEMPLATE: &str = "file";

/// Fixed lead-in of every user prompt.
pub(crate) const USER_PROMPT: &str =
    "Based on the provided pseudo-code, generate the corresponding code.\n";

/// Placeholder for the documentation section; retrieval is not supported.
const NO_DOCS: &str = "None";

#[derive(Serialize)]
struct AssistantContext<'a> {
    instructions: &'a str,
    files: &'a [String],
    inputs: Vec<ExampleView<'a>>,
    outputs: Vec<ExampleView<'a>>,
    docs: &'a str,
}

#[derive(Serialize)]
struct ExampleView<'a> {
    path: &'a str,
    contents: &'a str,
}

#[derive(Serialize)]
struct FileContext<'a> {
    name: &'a str,
    contents: &'a str,
}

/// A rendered request: system-style context plus the user turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    /// Assistant context: rules, instructions, folder listing and examples
    pub assistant: String,

    /// User turn carrying the pseudo-code file
    pub user: String,
}

impl Prompt {
    /// Total prompt size in characters.
    #[must_use]
    pub fn len(&self) -> usize {
        self.assistant.chars().count() + self.user.chars().count()
    }

    /// True if both parts are empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.assistant.is_empty() && self.user.is_empty()
    }
}

/// One example file.
#[derive(Debug, Clone)]
pub(crate) struct Example {
    /// Path relative to the examples directory, `/`-separated
    pub path: String,
    pub content: String,
}

impl Example {
    fn matches(&self, target: &SourceFile) -> bool {
        let name = self.path.rsplit('/').next().unwrap_or(&self.path);
        match target.extension() {
            Some(ext) => Path::new(name).extension().and_then(|e| e.to_str()) == Some(ext),
            // Extensionless files (Makefile, Dockerfile) pair up by name.
            None => name == target.name,
        }
    }

    fn view(&self) -> ExampleView<'_> {
        ExampleView {
            path: &self.path,
            contents: &self.content,
        }
    }
}

/// Prompt/completion example pairs loaded once per run.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExampleLibrary {
    prompts: Vec<Example>,
    completions: Vec<Example>,
}

impl ExampleLibrary {
    /// Loads `dir/prompt/**` and `dir/completion/**`.
    ///
    /// Missing subdirectories yield no examples; unreadable files are
    /// skipped with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error if a subdirectory exists but cannot be walked.
    pub(crate) fn load(dir: &Path) -> Result<Self> {
        let library = Self {
            prompts: Self::load_kind(dir, "prompt")?,
            completions: Self::load_kind(dir, "completion")?,
        };

        debug!(
            "Loaded {} prompt and {} completion examples from {}",
            library.prompts.len(),
            library.completions.len(),
            dir.display()
        );

        Ok(library)
    }

    fn load_kind(dir: &Path, kind: &str) -> Result<Vec<Example>> {
        let root = dir.join(kind);
        if !root.is_dir() {
            return Ok(Vec::new());
        }

        let mut examples = Vec::new();
        for entry in WalkDir::new(&root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                let path = e.path().map_or_else(|| root.clone(), Path::to_path_buf);
                Error::io(path, e.into())
            })?;

            if !entry.file_type().is_file() || has_binary_extension(entry.path()) {
                continue;
            }

            match fs::read_to_string(entry.path()) {
                Ok(content) => examples.push(Example {
                    path: relative_display(dir, entry.path()),
                    content,
                }),
                Err(e) => warn!("Skipping example {}: {}", entry.path().display(), e),
            }
        }

        Ok(examples)
    }

    /// Number of loaded examples of both kinds.
    pub(crate) fn len(&self) -> usize {
        self.prompts.len() + self.completions.len()
    }
}

fn relative_display(base: &Path, path: &Path) -> String {
    pathdiff::diff_paths(path, base)
        .unwrap_or_else(|| PathBuf::from(path))
        .to_string_lossy()
        .replace('\\', "/")
}

/// Renders assistant and user prompts for a source file.
pub(crate) struct PromptAssembler {
    tera: Tera,
    instructions: String,
    examples: ExampleLibrary,
}

impl PromptAssembler {
    /// Creates an assembler from configuration.
    ///
    /// `instructions` is the content of the instruction file (empty if there
    /// is none). A configured `template_path` replaces the built-in
    /// assistant template.
    ///
    /// # Errors
    ///
    /// Returns an error if a template fails to parse or the custom template
    /// cannot be read.
    pub(crate) fn new(config: &Config, instructions: String, examples: ExampleLibrary) -> Result<Self> {
        let mut tera = Tera::default();

        Self::register_builtin_templates(&mut tera)?;

        if let Some(ref template_path) = config.template_path {
            Self::register_custom_template(&mut tera, template_path)?;
        }

        Ok(Self {
            tera,
            instructions,
            examples,
        })
    }

    /// Registers the built-in assistant and file templates.
    fn register_builtin_templates(tera: &mut Tera) -> Result<()> {
        tera.add_raw_template(
            ASSISTANT_TEMPLATE,
            include_str!("../templates/assistant.tera"),
        )
        .map_err(|e| Error::template(ASSISTANT_TEMPLATE, e))?;

        tera.add_raw_template(FILE_TEMPLATE, include_str!("../templates/file.tera"))
            .map_err(|e| Error::template(FILE_TEMPLATE, e))?;

        Ok(())
    }

    fn register_custom_template(tera: &mut Tera, path: &Path) -> Result<()> {
        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;

        tera.add_raw_template(ASSISTANT_TEMPLATE, &content)
            .map_err(|e| Error::template(path.display().to_string(), e))?;

        debug!("Using custom assistant template {}", path.display());
        Ok(())
    }

    /// Renders the prompts for `file`; `files` lists the names of every file
    /// in the source folder.
    ///
    /// # Errors
    ///
    /// Returns an error if template rendering fails.
    pub(crate) fn assemble(&self, file: &SourceFile, files: &[String]) -> Result<Prompt> {
        let context = AssistantContext {
            instructions: &self.instructions,
            files,
            inputs: Self::matching(&self.examples.prompts, file),
            outputs: Self::matching(&self.examples.completions, file),
            docs: NO_DOCS,
        };

        let assistant = self.render(ASSISTANT_TEMPLATE, &context)?;
        let user_file = self.render(
            FILE_TEMPLATE,
            &FileContext {
                name: &file.name,
                contents: &file.content,
            },
        )?;

        Ok(Prompt {
            assistant,
            user: format!("{USER_PROMPT}{user_file}"),
        })
    }

    fn matching<'a>(examples: &'a [Example], file: &SourceFile) -> Vec<ExampleView<'a>> {
        examples
            .iter()
            .filter(|example| example.matches(file))
            .map(Example::view)
            .collect()
    }

    fn render<T: Serialize>(&self, template: &str, context: &T) -> Result<String> {
        let mut tera_context = Context::new();
        tera_context.insert("ctx", context);

        self.tera
            .render(template, &tera_context)
            .map_err(|e| Error::template(template, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    fn config_for(root: &Path) -> Config {
        Config::builder().root_dir(root).build().unwrap()
    }

    fn source(path: &str, content: &str) -> SourceFile {
        SourceFile::new(path, PathBuf::from(path), content.to_string())
    }

    #[test]
    fn test_user_prompt() {
        let temp = assert_fs::TempDir::new().unwrap();
        let assembler =
            PromptAssembler::new(&config_for(temp.path()), String::new(), ExampleLibrary::default())
                .unwrap();

        let prompt = assembler
            .assemble(&source("about.html", "[write an about page]"), &[])
            .unwrap();

        assert_eq!(
            prompt.user,
            "Based on the provided pseudo-code, generate the corresponding code.\n\
             FILE: about.html\nCONTENTS: [write an about page]"
        );
    }

    #[test]
    fn test_assistant_prompt_sections() {
        let temp = assert_fs::TempDir::new().unwrap();
        let assembler = PromptAssembler::new(
            &config_for(temp.path()),
            "Use a dark blue theme".to_string(),
            ExampleLibrary::default(),
        )
        .unwrap();
        let files = vec!["index.html".to_string(), "about.html".to_string()];

        let prompt = assembler
            .assemble(&source("about.html", "[about]"), &files)
            .unwrap();

        assert!(prompt.assistant.starts_with("You are JennGen"));
        assert!(prompt.assistant.contains("Use a dark blue theme"));
        assert!(prompt.assistant.contains("index.html\nabout.html\n"));
        assert!(prompt.assistant.ends_with("None\n"));
    }

    #[test]
    fn test_braces_in_content_are_literal() {
        let temp = assert_fs::TempDir::new().unwrap();
        let assembler =
            PromptAssembler::new(&config_for(temp.path()), String::new(), ExampleLibrary::default())
                .unwrap();

        let prompt = assembler
            .assemble(&source("t.html", "<h1>{{ title }}</h1> {% raw %}"), &[])
            .unwrap();

        assert!(prompt.user.ends_with("<h1>{{ title }}</h1> {% raw %}"));
    }

    #[test]
    fn test_examples_filtered_by_extension() {
        let temp = assert_fs::TempDir::new().unwrap();
        let examples = temp.child("examples");
        examples.child("prompt/index.html").write_str("[home]").unwrap();
        examples
            .child("completion/index.html")
            .write_str("<html>home</html>")
            .unwrap();
        examples.child("prompt/app.js").write_str("[clock]").unwrap();
        examples.child("prompt/Dockerfile").write_str("[node image]").unwrap();

        let library = ExampleLibrary::load(examples.path()).unwrap();
        assert_eq!(library.len(), 4);

        let assembler =
            PromptAssembler::new(&config_for(temp.path()), String::new(), library).unwrap();

        let html = assembler.assemble(&source("about.html", "[about]"), &[]).unwrap();
        assert!(html.assistant.contains("FILE: prompt/index.html\nCONTENTS: [home]"));
        assert!(html
            .assistant
            .contains("FILE: completion/index.html\nCONTENTS: <html>home</html>"));
        assert!(!html.assistant.contains("[clock]"));

        let docker = assembler.assemble(&source("Dockerfile", "[api]"), &[]).unwrap();
        assert!(docker.assistant.contains("[node image]"));
        assert!(!docker.assistant.contains("[home]"));
    }

    #[test]
    fn test_missing_example_dirs() {
        let temp = assert_fs::TempDir::new().unwrap();
        let library = ExampleLibrary::load(temp.path()).unwrap();
        assert_eq!(library.len(), 0);
    }

    #[test]
    fn test_custom_template() {
        let temp = assert_fs::TempDir::new().unwrap();
        let template = temp.child("assistant.tera");
        template
            .write_str("Rules: {{ ctx.instructions }} | {{ ctx.files | length }} files")
            .unwrap();

        let config = Config::builder()
            .root_dir(temp.path())
            .template_path(template.path())
            .build()
            .unwrap();
        let assembler =
            PromptAssembler::new(&config, "be terse".to_string(), ExampleLibrary::default())
                .unwrap();

        let prompt = assembler
            .assemble(&source("a.css", "[styles]"), &["a.css".to_string()])
            .unwrap();

        assert_eq!(prompt.assistant, "Rules: be terse | 1 files");
    }
}
