//! Incremental evaluation engine.
//!
//! Makes successive, independently compiled code submissions behave as
//! one continuous program:
//! - `Shell` - the engine; classifies, compiles, links and executes one
//!   submission at a time
//! - `GenerationChain` - immutable, versioned sets of compiled types
//! - `ShellState` - variables tracked across submissions
//! - `eval_io` - redirected stdio for the duration of an evaluation
//!
//! The language-specific pieces (parsing, rewriting, compiling,
//! instantiating) are collaborator traits supplied by the embedder.

pub mod error;
pub mod eval_io;
pub mod extensions;
pub mod generations;
pub mod resolvers;
pub mod shell;
pub mod snippet;
pub mod state;
pub mod traits;

pub use error::{EvalError, EvaluationError};
pub use extensions::{EXTENSION_SIGIL, Extension, ImportExtension};
pub use generations::{GenerationChain, ScopedResolver, TypeGeneration};
pub use resolvers::{DependencyResolver, FileResolver};
pub use shell::Shell;
pub use snippet::{CompilableUnit, MemberDecl, MemberKind, Snippet, SnippetKind};
pub use state::{ShellState, TrackedVariable};
pub use traits::{
    Compilation, CompileContext, Compiler, Evaluator, Executable, FieldAssignment, FieldDecl,
    Invocation, Metadata, RewriteContext, Rewriter, SnippetParser, TypeResolver,
};
