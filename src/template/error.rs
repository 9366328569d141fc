//! Template error types

use std::fmt;

/// Errors that can occur while evaluating provisioner templates.
///
/// Every variant is keyed by the path of the string leaf inside the
/// evaluated subtree (e.g. `podTemplate.spec.containers[0].command[2]`), so
/// the same failure always produces the same message.
#[derive(Debug)]
pub enum TemplateError {
    /// Rendering failed (syntax error, undefined variable, filter error)
    Render {
        path: String,
        source: minijinja::Error,
    },
    /// The template set `yaml = true` but its output is not valid YAML
    Reparse { path: String, message: String },
    /// The `yaml` variable was set to a non-boolean value
    YamlFlag { path: String },
}

impl fmt::Display for TemplateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Render { path, source } => {
                write!(f, "template at {path:?}: {source}")
            }
            Self::Reparse { path, message } => {
                write!(f, "template at {path:?}: output is not valid YAML: {message}")
            }
            Self::YamlFlag { path } => {
                write!(f, "template at {path:?}: 'yaml' must be a boolean")
            }
        }
    }
}

impl std::error::Error for TemplateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Render { source, .. } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_errors_name_the_leaf_path() {
        let source = minijinja::Error::new(
            minijinja::ErrorKind::UndefinedError,
            "undefined variable",
        );
        let err = TemplateError::Render {
            path: "capacity".into(),
            source,
        };
        assert!(err.to_string().contains("\"capacity\""));
        assert!(err.to_string().contains("undefined"));
    }

    #[test]
    fn reparse_errors_mention_yaml() {
        let err = TemplateError::Reparse {
            path: "podTemplate.spec".into(),
            message: "mapping values are not allowed".into(),
        };
        assert!(err.to_string().contains("not valid YAML"));
    }
}
