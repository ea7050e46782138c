//! Classified submissions and their compilable form.

/// The three kinds a submission can classify into; classification
/// determines downstream handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnippetKind {
    /// Statements and/or a trailing expression.
    CodeBlock,
    /// Field and method declarations.
    ClassMembers,
    /// One or more whole type declarations.
    CompilationUnit,
}

/// Kind of a declared class member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Field,
    Method,
}

/// A single member declared by a class-members submission.
#[derive(Debug, Clone)]
pub struct MemberDecl {
    pub name: String,
    pub kind: MemberKind,
    /// Declared type, for fields.
    pub type_descriptor: Option<String>,
    /// Source text, for methods.
    pub code: Option<String>,
}

impl MemberDecl {
    /// A field declaration.
    #[must_use]
    pub fn field(name: impl Into<String>, type_descriptor: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MemberKind::Field,
            type_descriptor: Some(type_descriptor.into()),
            code: None,
        }
    }

    /// A method declaration.
    #[must_use]
    pub fn method(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: MemberKind::Method,
            type_descriptor: None,
            code: Some(code.into()),
        }
    }
}

/// A classified submission.
#[derive(Debug, Clone)]
pub struct Snippet {
    pub kind: SnippetKind,
    /// Raw submission text.
    pub source: String,
    /// Name of the entry class the rewritten unit will expose.
    pub class_name: String,
    /// Members declared by a class-members submission.
    pub members: Vec<MemberDecl>,
}

/// A self-contained compilable unit produced by the rewriter, exposing
/// one invocable entry point.
#[derive(Debug, Clone)]
pub struct CompilableUnit {
    pub class_name: String,
    pub source: String,
}
