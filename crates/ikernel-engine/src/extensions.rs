//! Sigil-triggered named extensions.
//!
//! A submission starting with the extension sigil bypasses the
//! evaluation machinery entirely: `%name declaration` on the first
//! line, with the remaining lines as the body, dispatches to a
//! registered extension by name.

use serde_json::Value;

use crate::error::{EvalError, EvaluationError};
use crate::shell::Shell;

/// Leading marker that identifies an extension invocation.
pub const EXTENSION_SIGIL: char = '%';

/// A parsed extension invocation.
#[derive(Debug, PartialEq, Eq)]
pub struct ExtensionCall<'a> {
    pub name: &'a str,
    pub declaration: &'a str,
    pub body: &'a str,
}

/// Parse a sigil-prefixed submission into name, declaration and body.
///
/// # Errors
/// Returns [`EvaluationError::Syntax`] when no extension name follows
/// the sigil.
pub fn parse_extension(text: &str) -> Result<ExtensionCall<'_>, EvaluationError> {
    let stripped = text
        .strip_prefix(EXTENSION_SIGIL)
        .ok_or_else(|| EvaluationError::Syntax("Not an extension invocation.".into()))?;

    let (first_line, body) = match stripped.split_once('\n') {
        Some((line, rest)) => (line, rest),
        None => (stripped, ""),
    };

    let first_line = first_line.trim();
    let (name, declaration) = match first_line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (first_line, ""),
    };
    if name.is_empty() {
        return Err(EvaluationError::Syntax("Missing extension name.".into()));
    }

    Ok(ExtensionCall {
        name,
        declaration,
        body,
    })
}

/// A named, pluggable non-code command.
pub trait Extension: Send + Sync {
    /// Evaluate the extension invocation against the shell.
    ///
    /// # Errors
    /// Returns an error for invalid declarations or failed side
    /// effects.
    fn evaluate(
        &self,
        shell: &mut Shell,
        declaration: &str,
        body: &str,
    ) -> Result<Option<Value>, EvalError>;
}

/// `%import name` / `%import static name` - adds to the accumulated
/// import set consumed by future compilations.
pub struct ImportExtension;

impl Extension for ImportExtension {
    fn evaluate(
        &self,
        shell: &mut Shell,
        declaration: &str,
        _body: &str,
    ) -> Result<Option<Value>, EvalError> {
        if declaration.is_empty() {
            return Err(EvaluationError::Syntax("Missing import name.".into()).into());
        }
        match declaration.strip_prefix("static ") {
            Some(name) => shell.add_import(name.trim(), true),
            None => shell.add_import(declaration, false),
        }
        Ok(None)
    }
}

/// `%dependency uri` - resolves an artifact reference and records the
/// resulting local paths for future compilations.
pub struct DependencyExtension;

impl Extension for DependencyExtension {
    fn evaluate(
        &self,
        shell: &mut Shell,
        declaration: &str,
        _body: &str,
    ) -> Result<Option<Value>, EvalError> {
        if declaration.is_empty() {
            return Err(EvaluationError::Syntax("Missing dependency reference.".into()).into());
        }
        shell.resolve_dependency(declaration)?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_name_declaration_body() {
        let call = parse_extension("%import demo.collections.*\nrest of body").unwrap();
        assert_eq!(call.name, "import");
        assert_eq!(call.declaration, "demo.collections.*");
        assert_eq!(call.body, "rest of body");
    }

    #[test]
    fn test_parse_name_only() {
        let call = parse_extension("%reset").unwrap();
        assert_eq!(call.name, "reset");
        assert_eq!(call.declaration, "");
        assert_eq!(call.body, "");
    }

    #[test]
    fn test_parse_missing_name_is_syntax_error() {
        assert!(matches!(
            parse_extension("%"),
            Err(EvaluationError::Syntax(_))
        ));
        assert!(matches!(
            parse_extension("%   "),
            Err(EvaluationError::Syntax(_))
        ));
    }
}
