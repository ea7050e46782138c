//! The evaluation engine.

use std::{
    collections::{BTreeSet, HashMap},
    path::PathBuf,
    sync::Arc,
};

use serde_json::Value;

use crate::error::{EvalError, EvaluationError};
use crate::eval_io;
use crate::extensions::{
    DependencyExtension, EXTENSION_SIGIL, Extension, ImportExtension, parse_extension,
};
use crate::generations::{GenerationChain, ScopedResolver};
use crate::resolvers::{DependencyResolver, FileResolver};
use crate::snippet::{MemberKind, Snippet, SnippetKind};
use crate::state::ShellState;
use crate::traits::{
    Compilation, CompileContext, Compiler, Evaluator, Executable, FieldAssignment, FieldDecl,
    Metadata, RewriteContext, Rewriter, SnippetParser,
};

const ERROR_TYPE_REDECLARED: &str = "The value of the variable '{name}' of type '{declared}' is \
no longer valid. It appears the type of that variable has been redeclared to '{expected}'. \
Please re-run the code to initialize the variable again.";

/// Interactive shell: evaluates submissions incrementally while
/// preserving program state across them.
///
/// The language-specific front end (parser, rewriter, compiler) is
/// supplied at construction; the shell owns everything that persists
/// between submissions.
pub struct Shell {
    parser: Box<dyn SnippetParser>,
    rewriter: Box<dyn Rewriter>,
    compiler: Box<dyn Compiler>,

    extensions: HashMap<String, Arc<dyn Extension>>,
    resolvers: HashMap<String, Arc<dyn DependencyResolver>>,

    imports: BTreeSet<String>,
    static_imports: BTreeSet<String>,
    cached_imports: Option<String>,
    packages: BTreeSet<String>,
    dependencies: Vec<PathBuf>,

    generations: GenerationChain,
    state: ShellState,
}

impl Shell {
    /// Create a shell around a language front end.
    ///
    /// The `import` and `dependency` extensions and the `file`
    /// dependency resolver are registered by default.
    #[must_use]
    pub fn new(
        parser: Box<dyn SnippetParser>,
        rewriter: Box<dyn Rewriter>,
        compiler: Box<dyn Compiler>,
    ) -> Self {
        let mut shell = Self {
            parser,
            rewriter,
            compiler,
            extensions: HashMap::new(),
            resolvers: HashMap::new(),
            imports: BTreeSet::new(),
            static_imports: BTreeSet::new(),
            cached_imports: None,
            packages: BTreeSet::new(),
            dependencies: Vec::new(),
            generations: GenerationChain::new(),
            state: ShellState::new(),
        };
        shell.register_extension("import", Arc::new(ImportExtension));
        shell.register_extension("dependency", Arc::new(DependencyExtension));
        shell.register_resolver("file", Arc::new(FileResolver));
        shell
    }

    /// Register an extension so it may be invoked by name.
    pub fn register_extension(&mut self, name: impl Into<String>, extension: Arc<dyn Extension>) {
        self.extensions.insert(name.into(), extension);
    }

    /// Register a dependency resolver for a uri scheme.
    pub fn register_resolver(
        &mut self,
        scheme: impl Into<String>,
        resolver: Arc<dyn DependencyResolver>,
    ) {
        self.resolvers.insert(scheme.into(), resolver);
    }

    /// Add an import for subsequent compilations.
    pub fn add_import(&mut self, name: impl Into<String>, static_import: bool) {
        if static_import {
            self.static_imports.insert(name.into());
        } else {
            self.imports.insert(name.into());
        }
        self.cached_imports = None;
    }

    /// The joined import declarations consumed by the rewriter and
    /// compiler; recomputed only when the sets change.
    pub fn imports_declaration(&mut self) -> String {
        if let Some(cached) = &self.cached_imports {
            return cached.clone();
        }
        let mut joined = String::new();
        for name in &self.imports {
            joined.push_str(&format!("import {name};"));
        }
        for name in &self.static_imports {
            joined.push_str(&format!("import static {name};"));
        }
        self.cached_imports = Some(joined.clone());
        joined
    }

    /// Resolve an artifact reference through the registered resolver
    /// for its scheme, recording the resulting paths.
    ///
    /// # Errors
    /// Returns an error for an unregistered scheme or a failed
    /// resolution.
    pub fn resolve_dependency(&mut self, uri: &str) -> Result<Vec<PathBuf>, EvalError> {
        let scheme = uri.split(':').next().unwrap_or("");
        let resolver = self.resolvers.get(scheme).cloned().ok_or_else(|| {
            EvaluationError::Dependency(format!(
                "No resolver is registered for the scheme '{scheme}'."
            ))
        })?;

        let paths = resolver.resolve(uri)?;
        for path in &paths {
            if !self.dependencies.contains(path) {
                self.dependencies.push(path.clone());
            }
        }
        Ok(paths)
    }

    /// The current tracked state.
    #[must_use]
    pub fn state(&self) -> &ShellState {
        &self.state
    }

    /// The type generation chain.
    #[must_use]
    pub fn generations(&self) -> &GenerationChain {
        &self.generations
    }

    /// Declared packages accumulated so far.
    #[must_use]
    pub fn packages(&self) -> &BTreeSet<String> {
        &self.packages
    }

    /// Resolved dependency artifacts accumulated so far.
    #[must_use]
    pub fn dependencies(&self) -> &[PathBuf] {
        &self.dependencies
    }

    fn invoke_extension(&mut self, text: &str) -> Result<Option<Value>, EvalError> {
        let call = parse_extension(text)?;
        let extension = self
            .extensions
            .get(call.name)
            .cloned()
            .ok_or_else(|| EvaluationError::UnknownExtension(call.name.to_string()))?;
        extension.evaluate(self, call.declaration, call.body)
    }

    fn record_compilation_unit(&mut self, compilation: &Compilation) {
        self.packages.extend(compilation.packages.iter().cloned());
        let changed = self.generations.absorb(&compilation.types);
        if changed == 0 {
            tracing::debug!("compilation unit matched stored types; no new generation");
        }
    }

    fn run_snippet(
        &mut self,
        snippet: &Snippet,
        instance: &mut Box<dyn Executable>,
    ) -> Result<Option<Value>, EvalError> {
        let declared: BTreeSet<String> = instance
            .declared_fields()
            .into_iter()
            .map(|field| field.name)
            .collect();

        // Initialize the entry unit with current state. A declared type
        // that no longer accepts the stored value marks the variable
        // stale; the whole submission is then abandoned before any code
        // runs rather than executed with partially-initialized state.
        let mut stale = Vec::new();
        for variable in self.state.variables() {
            if !declared.contains(&variable.name) {
                continue;
            }
            match instance.set_field(&variable.name, &variable.value) {
                FieldAssignment::Assigned => {}
                FieldAssignment::Incompatible { expected } => {
                    stale.push((variable.name.clone(), variable.type_descriptor.clone(), expected));
                }
            }
        }
        if !stale.is_empty() {
            let mut variables = Vec::with_capacity(stale.len());
            for (name, declared_type, expected) in stale {
                self.state.undeclare_field(&name);
                let warning = ERROR_TYPE_REDECLARED
                    .replace("{name}", &name)
                    .replace("{declared}", &declared_type)
                    .replace("{expected}", &expected);
                tracing::warn!(variable = %name, "stale tracked variable dropped");
                let _ = eval_io::write_stderr(&format!("{warning}\n"));
                variables.push(name);
            }
            return Err(EvalError::StaleState { variables });
        }

        let invocation = instance.call()?;

        if snippet.kind == SnippetKind::ClassMembers {
            for member in &snippet.members {
                match member.kind {
                    MemberKind::Field => self.state.declare_field(
                        member.name.clone(),
                        member.type_descriptor.clone().unwrap_or_default(),
                    ),
                    MemberKind::Method => self
                        .state
                        .declare_method(member.name.clone(), member.code.clone().unwrap_or_default()),
                }
            }
        }

        // For class members the rewriter nests the declared members in
        // an instance returned by the entry point; read updated state
        // from there, otherwise from the invoked instance itself.
        let read_target: &dyn Executable = invocation.members.as_deref().unwrap_or(&**instance);
        for name in self.state.names() {
            if let Some(value) = read_target.get_field(&name) {
                self.state.set_value(&name, value);
            }
        }

        match snippet.kind {
            // The members shim instance is not meaningful to return.
            SnippetKind::ClassMembers => Ok(None),
            _ => Ok(invocation.result),
        }
    }
}

impl Evaluator for Shell {
    fn evaluate(
        &mut self,
        text: &str,
        evaluation_id: u64,
        _metadata: &Metadata,
    ) -> Result<Option<Value>, EvalError> {
        if text.starts_with(EXTENSION_SIGIL) {
            return self.invoke_extension(text);
        }

        let snippet = self.parser.parse(text, evaluation_id)?;

        let context = RewriteContext {
            imports: self.imports_declaration(),
            variables: self
                .state
                .variables()
                .map(|v| FieldDecl::new(v.name.clone(), v.type_descriptor.clone()))
                .collect(),
            methods: self.state.methods(),
        };
        let unit = self.rewriter.rewrite(&snippet, &context)?;

        let imports = self.imports_declaration();
        let compile_context = CompileContext {
            imports: &imports,
            packages: &self.packages,
            dependencies: &self.dependencies,
            known_types: &self.generations,
        };
        let compilation = self.compiler.compile(&unit, &compile_context);
        if compilation.has_errors() {
            return Err(EvaluationError::Compilation(compilation.diagnostics.join("\n")).into());
        }

        match snippet.kind {
            SnippetKind::CompilationUnit => {
                // Whole type declarations register state; nothing runs.
                self.record_compilation_unit(&compilation);
                Ok(None)
            }
            SnippetKind::CodeBlock | SnippetKind::ClassMembers => {
                let mut instance = {
                    let resolver = ScopedResolver {
                        chain: &self.generations,
                        transient: &compilation.types,
                    };
                    self.compiler.instantiate(&unit, &compilation, &resolver)?
                };
                self.run_snippet(&snippet, &mut instance)
            }
        }
    }
}
