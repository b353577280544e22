use crate::error::{Error, Result};
use regex::Regex;
use std::fs;
use std::path::Path;
use tera::Tera;

/// Maximum template file size (1MB)
const MAX_TEMPLATE_SIZE: u64 = 1024 * 1024;

/// Variables an assistant template must reference
const REQUIRED_VARIABLES: &[&str] = &["instructions"];

/// Variables the built-in template uses; missing ones are only reported
const OPTIONAL_VARIABLES: &[&str] = &["files", "inputs", "outputs", "docs"];

/// Validates external assistant templates
pub(crate) struct TemplateValidator;

impl TemplateValidator {
    /// Validates an external template file
    ///
    /// Performs the following checks:
    /// 1. File exists and is readable
    /// 2. File size is within limits
    /// 3. Template syntax is valid (can be compiled by Tera)
    /// 4. Template references the required variables
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - File doesn't exist or can't be read
    /// - File is too large or empty
    /// - Template has syntax errors
    /// - Template is missing required variables
    pub(crate) fn validate_template(path: &Path) -> Result<()> {
        if !path.exists() {
            return Err(Error::io(
                path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "Template file not found"),
            ));
        }

        if !path.is_file() {
            return Err(Error::template_validation(
                path.to_string_lossy(),
                "Path is not a file",
            ));
        }

        let metadata = fs::metadata(path).map_err(|e| Error::io(path, e))?;
        if metadata.len() > MAX_TEMPLATE_SIZE {
            return Err(Error::template_validation(
                path.to_string_lossy(),
                format!(
                    "Template file too large: {} bytes (max: {} bytes)",
                    metadata.len(),
                    MAX_TEMPLATE_SIZE
                ),
            ));
        }

        let content = fs::read_to_string(path).map_err(|e| Error::io(path, e))?;

        if content.trim().is_empty() {
            return Err(Error::template_validation(
                path.to_string_lossy(),
                "Template file is empty",
            ));
        }

        let mut temp_tera = Tera::default();
        temp_tera
            .add_raw_template("validation", &content)
            .map_err(|e| {
                Error::template_validation(
                    path.to_string_lossy(),
                    format!("Template syntax error: {e}"),
                )
            })?;

        Self::check_required_variables(&content, path)?;
        Self::check_optional_variables(&content)?;

        Ok(())
    }

    /// Matches `ctx.<var>` (or a bare `<var>`) used in an expression,
    /// e.g. `{{ ctx.var }}`, `{{ var | length }}`, `{% for x in ctx.var %}`.
    fn reference_pattern(var: &str) -> Result<Regex> {
        let var = regex::escape(var);
        Regex::new(&format!(
            r"(\{{\{{-?|\{{%-?[^%]*\bin)\s*(ctx\.)?{var}\b|\bctx\.{var}\b"
        ))
        .map_err(|e| Error::invalid_pattern(var, e.to_string()))
    }

    fn references(content: &str, var: &str) -> Result<bool> {
        Ok(Self::reference_pattern(var)?.is_match(content))
    }

    /// Checks that the template references every required variable
    fn check_required_variables(content: &str, path: &Path) -> Result<()> {
        let mut missing = Vec::new();
        for var in REQUIRED_VARIABLES {
            if !Self::references(content, var)? {
                missing.push(*var);
            }
        }

        if !missing.is_empty() {
            return Err(Error::template_validation(
                path.to_string_lossy(),
                format!(
                    "Template may be missing required variables: {}. \n\
                    Assistant templates should use ctx.instructions. \n\
                    See templates/assistant.tera for reference.",
                    missing.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Logs optional variables the template ignores
    fn check_optional_variables(content: &str) -> Result<()> {
        for var in OPTIONAL_VARIABLES {
            if !Self::references(content, var)? {
                tracing::debug!("Template does not use optional variable: {}", var);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_fs::prelude::*;

    #[test]
    fn test_validate_valid_template() {
        let temp = assert_fs::TempDir::new().unwrap();
        let template_file = temp.child("test.tera");
        template_file
            .write_str(
                "Follow: {{ ctx.instructions }}\n\
                {% for name in ctx.files %}{{ name }}\n{% endfor %}",
            )
            .unwrap();

        let result = TemplateValidator::validate_template(template_file.path());
        assert!(result.is_ok());
    }

    #[test]
    fn test_builtin_template_is_valid() {
        let temp = assert_fs::TempDir::new().unwrap();
        let template_file = temp.child("assistant.tera");
        template_file
            .write_str(include_str!("../templates/assistant.tera"))
            .unwrap();

        assert!(TemplateValidator::validate_template(template_file.path()).is_ok());
    }

    #[test]
    fn test_validate_nonexistent_file() {
        let result = TemplateValidator::validate_template(Path::new("/nonexistent/template.tera"));
        assert!(result.is_err());
        assert!(result.unwrap_err().is_io());
    }

    #[test]
    fn test_validate_empty_template() {
        let temp = assert_fs::TempDir::new().unwrap();
        let template_file = temp.child("empty.tera");
        template_file.write_str("   \n  \n  ").unwrap();

        let result = TemplateValidator::validate_template(template_file.path());
        assert!(result.unwrap_err().to_string().contains("empty"));
    }

    #[test]
    fn test_validate_syntax_error() {
        let temp = assert_fs::TempDir::new().unwrap();
        let template_file = temp.child("invalid.tera");
        template_file
            .write_str("{% if ctx.instructions %}\nUnclosed if")
            .unwrap();

        let result = TemplateValidator::validate_template(template_file.path());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Template syntax error"));
    }

    #[test]
    fn test_validate_missing_required_vars() {
        let temp = assert_fs::TempDir::new().unwrap();
        let template_file = temp.child("incomplete.tera");
        template_file
            .write_str("Write good code. The instructions are below.\n{{ ctx.files | length }}")
            .unwrap();

        let result = TemplateValidator::validate_template(template_file.path());
        let err_msg = result.unwrap_err().to_string();
        assert!(err_msg.contains("missing required variables"));
    }

    #[test]
    fn test_reference_forms() {
        for content in [
            "{{ctx.instructions}}",
            "{{- ctx.instructions -}}",
            "{{ instructions | trim }}",
            "{% for line in ctx.instructions | split(pat=\"\\n\") %}{{ line }}{% endfor %}",
            "{% if ctx.instructions %}x{% endif %}",
        ] {
            assert!(
                TemplateValidator::references(content, "instructions").unwrap(),
                "{content}"
            );
        }

        assert!(!TemplateValidator::references("instructions", "instructions").unwrap());
        assert!(!TemplateValidator::references("{{ ctx.instructions_v2 }}", "instructions").unwrap());
    }

    #[test]
    fn test_validate_file_too_large() {
        let temp = assert_fs::TempDir::new().unwrap();
        let template_file = temp.child("large.tera");

        let large_content = "x".repeat((MAX_TEMPLATE_SIZE + 1) as usize);
        template_file.write_str(&large_content).unwrap();

        let result = TemplateValidator::validate_template(template_file.path());
        assert!(result.unwrap_err().to_string().contains("too large"));
    }
}
