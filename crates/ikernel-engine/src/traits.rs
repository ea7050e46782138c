//! Collaborator traits at the parse/compile/execute seam.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
};

use serde_json::Value;

use crate::error::{EvalError, EvaluationError};
use crate::snippet::{CompilableUnit, Snippet};

/// Opaque metadata document attached to a submission.
pub type Metadata = serde_json::Map<String, Value>;

/// Evaluates one submission at a time, preserving state across
/// submissions. Not reentrant; the session guarantees a single caller.
pub trait Evaluator: Send {
    /// Evaluate one submission.
    ///
    /// `evaluation_id` is non-zero for record-worthy submissions and
    /// may be used to derive unique names.
    ///
    /// # Errors
    /// Returns [`EvalError::Evaluation`] for pre-execution failures and
    /// [`EvalError::Execution`] for failures raised by the submitted
    /// code while running.
    fn evaluate(
        &mut self,
        text: &str,
        evaluation_id: u64,
        metadata: &Metadata,
    ) -> Result<Option<Value>, EvalError>;
}

/// Classifies raw submission text into a [`Snippet`].
pub trait SnippetParser: Send {
    /// # Errors
    /// Returns [`EvaluationError::Syntax`] for unparseable input.
    fn parse(&self, text: &str, evaluation_id: u64) -> Result<Snippet, EvaluationError>;
}

/// Shell state made available to the rewriter so it can capture
/// referenced variables as fields and re-emit declared methods.
#[derive(Debug, Clone, Default)]
pub struct RewriteContext {
    /// Joined import declarations.
    pub imports: String,
    /// Tracked variables, as field declarations.
    pub variables: Vec<FieldDecl>,
    /// Declared methods as (name, source) pairs.
    pub methods: Vec<(String, String)>,
}

/// Rewrites a snippet into a self-contained compilable unit.
pub trait Rewriter: Send {
    /// # Errors
    /// Returns an error when the snippet cannot be expressed as a
    /// compilable unit.
    fn rewrite(
        &self,
        snippet: &Snippet,
        context: &RewriteContext,
    ) -> Result<CompilableUnit, EvaluationError>;
}

/// Resolves type names to stored bytecode.
pub trait TypeResolver {
    fn resolve_type(&self, name: &str) -> Option<&[u8]>;
}

/// Everything a compilation runs against.
pub struct CompileContext<'a> {
    pub imports: &'a str,
    pub packages: &'a BTreeSet<String>,
    pub dependencies: &'a [PathBuf],
    pub known_types: &'a dyn TypeResolver,
}

/// Output of compiling one unit.
#[derive(Debug, Clone, Default)]
pub struct Compilation {
    /// Bytecode per produced named type.
    pub types: BTreeMap<String, Vec<u8>>,
    /// Packages declared by the unit.
    pub packages: BTreeSet<String>,
    /// Compiler diagnostics; non-empty means the compilation failed.
    pub diagnostics: Vec<String>,
}

impl Compilation {
    #[must_use]
    pub fn has_errors(&self) -> bool {
        !self.diagnostics.is_empty()
    }
}

/// Compiles rewritten units and instantiates their entry points.
pub trait Compiler: Send {
    /// Compile a unit against the current shell state. Failures are
    /// reported through [`Compilation::diagnostics`].
    fn compile(&self, unit: &CompilableUnit, context: &CompileContext<'_>) -> Compilation;

    /// Instantiate the entry unit within the given loading context.
    ///
    /// # Errors
    /// Returns an error when the entry class cannot be linked.
    fn instantiate(
        &self,
        unit: &CompilableUnit,
        compilation: &Compilation,
        types: &dyn TypeResolver,
    ) -> Result<Box<dyn Executable>, EvalError>;
}

/// A field declared by an entry unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDecl {
    pub name: String,
    pub type_descriptor: String,
}

impl FieldDecl {
    #[must_use]
    pub fn new(name: impl Into<String>, type_descriptor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_descriptor: type_descriptor.into(),
        }
    }
}

/// Outcome of a checked field assignment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldAssignment {
    Assigned,
    /// The declared field type does not accept the stored value.
    Incompatible {
        /// The field's declared type descriptor.
        expected: String,
    },
}

/// Result of invoking an entry point once.
pub struct Invocation {
    /// Produced value, for code blocks.
    pub result: Option<Value>,
    /// Distinct nested instance holding declared members, for
    /// class-member snippets; state read-back targets it when present.
    pub members: Option<Box<dyn Executable>>,
}

/// An instantiated entry unit.
pub trait Executable {
    /// Fields the unit declares; injection is limited to these.
    fn declared_fields(&self) -> Vec<FieldDecl>;

    /// Checked assignment of a tracked value into a declared field.
    fn set_field(&mut self, name: &str, value: &Value) -> FieldAssignment;

    /// Read a field back after invocation; `None` when absent.
    fn get_field(&self, name: &str) -> Option<Value>;

    /// Invoke the entry point once.
    ///
    /// # Errors
    /// Returns [`EvalError::Execution`] for failures raised by the
    /// submitted code.
    fn call(&mut self) -> Result<Invocation, EvalError>;
}
