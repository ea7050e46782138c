//! The calculator front end shipped with the kernel.
//!
//! A deliberately small language that still exercises every part of
//! the engine: integers, double-quoted strings, variables, `+ - * /`,
//! parentheses and calls to declared single-expression functions.
//! Submissions classify as:
//! - `type Name ...` - a named type declaration; stored, never run
//! - `fn name(a, b) = expr` - a function declaration
//! - `name = expr` - an assignment, tracked across submissions
//! - anything else - an expression evaluated for its value
//!
//! The declared type of an assignment is inferred from its right-hand
//! side: any string literal makes it `string`, otherwise `int`.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use ikernel_engine::{
    Compilation, CompileContext, Compiler, EvalError, EvaluationError, Executable,
    FieldAssignment, FieldDecl, Invocation, MemberDecl, MemberKind, RewriteContext, Rewriter,
    Snippet, SnippetKind, SnippetParser, TypeResolver,
    snippet::CompilableUnit,
};
use serde_json::{Value, json};

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Int(i64),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
}

fn lex(text: &str) -> Result<Vec<Token>, EvaluationError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '0'..='9' => {
                let mut digits = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() {
                        digits.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let number = digits
                    .parse::<i64>()
                    .map_err(|_| EvaluationError::Syntax("Number is out of range.".into()))?;
                tokens.push(Token::Int(number));
            }
            '"' => {
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some(c) => text.push(c),
                        None => {
                            return Err(EvaluationError::Syntax(
                                "Unterminated string literal.".into(),
                            ));
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&i) = chars.peek() {
                    if i.is_ascii_alphanumeric() || i == '_' {
                        name.push(i);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(name));
            }
            '+' | '-' | '*' | '/' | '(' | ')' | ',' => {
                chars.next();
                tokens.push(match c {
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    _ => Token::Comma,
                });
            }
            other => {
                return Err(EvaluationError::Syntax(format!(
                    "Unexpected character '{other}'."
                )));
            }
        }
    }
    Ok(tokens)
}

#[derive(Debug, Clone, Copy)]
enum Op {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone)]
enum Expr {
    Int(i64),
    Str(String),
    Var(String),
    Binary(Op, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

struct ExprParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ExprParser {
    fn parse(text: &str) -> Result<Expr, EvaluationError> {
        let mut parser = Self {
            tokens: lex(text)?,
            pos: 0,
        };
        let expr = parser.sum()?;
        if parser.pos != parser.tokens.len() {
            return Err(EvaluationError::Syntax(
                "Unexpected trailing input after the expression.".into(),
            ));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn sum(&mut self) -> Result<Expr, EvaluationError> {
        let mut lhs = self.term()?;
        while let Some(op) = match self.peek() {
            Some(Token::Plus) => Some(Op::Add),
            Some(Token::Minus) => Some(Op::Sub),
            _ => None,
        } {
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, EvaluationError> {
        let mut lhs = self.atom()?;
        while let Some(op) = match self.peek() {
            Some(Token::Star) => Some(Op::Mul),
            Some(Token::Slash) => Some(Op::Div),
            _ => None,
        } {
            self.pos += 1;
            let rhs = self.atom()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn atom(&mut self) -> Result<Expr, EvaluationError> {
        match self.next() {
            Some(Token::Int(n)) => Ok(Expr::Int(n)),
            Some(Token::Str(s)) => Ok(Expr::Str(s)),
            Some(Token::Ident(name)) => {
                if self.peek() == Some(&Token::LParen) {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.sum()?);
                            match self.next() {
                                Some(Token::Comma) => {}
                                Some(Token::RParen) => break,
                                _ => {
                                    return Err(EvaluationError::Syntax(
                                        "Unclosed argument list.".into(),
                                    ));
                                }
                            }
                        }
                    } else {
                        self.pos += 1;
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            Some(Token::LParen) => {
                let expr = self.sum()?;
                if self.next() != Some(Token::RParen) {
                    return Err(EvaluationError::Syntax("Unclosed parenthesis.".into()));
                }
                Ok(expr)
            }
            _ => Err(EvaluationError::Syntax("Expected an expression.".into())),
        }
    }
}

fn is_identifier(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Split `name = expr`, honoring quotes on the right-hand side.
fn split_assignment(text: &str) -> Option<(&str, &str)> {
    let mut in_string = false;
    for (index, c) in text.char_indices() {
        match c {
            '"' => in_string = !in_string,
            '=' if !in_string => {
                let lhs = text[..index].trim();
                let rhs = text[index + 1..].trim();
                if is_identifier(lhs) && !rhs.is_empty() {
                    return Some((lhs, rhs));
                }
                return None;
            }
            _ => {}
        }
    }
    None
}

fn contains_string(expr: &Expr) -> bool {
    match expr {
        Expr::Str(_) => true,
        Expr::Int(_) | Expr::Var(_) => false,
        Expr::Binary(_, lhs, rhs) => contains_string(lhs) || contains_string(rhs),
        Expr::Call(_, args) => args.iter().any(contains_string),
    }
}

struct Function {
    name: String,
    params: Vec<String>,
    body: Expr,
}

fn parse_function(decl: &str) -> Result<Function, EvaluationError> {
    let rest = decl
        .strip_prefix("fn ")
        .ok_or_else(|| EvaluationError::Syntax("Not a function declaration.".into()))?;
    let (name, rest) = rest.split_once('(').ok_or_else(|| {
        EvaluationError::Syntax("A function declaration needs a parameter list.".into())
    })?;
    let name = name.trim();
    if !is_identifier(name) {
        return Err(EvaluationError::Syntax(format!(
            "'{name}' is not a valid function name."
        )));
    }
    let (params_text, rest) = rest
        .split_once(')')
        .ok_or_else(|| EvaluationError::Syntax("Unclosed parameter list.".into()))?;
    let mut params = Vec::new();
    for param in params_text.split(',').map(str::trim) {
        if param.is_empty() {
            continue;
        }
        if !is_identifier(param) {
            return Err(EvaluationError::Syntax(format!(
                "'{param}' is not a valid parameter name."
            )));
        }
        params.push(param.to_owned());
    }
    let body_text = rest.trim().strip_prefix('=').ok_or_else(|| {
        EvaluationError::Syntax("A function body follows '='.".into())
    })?;
    Ok(Function {
        name: name.to_owned(),
        params,
        body: ExprParser::parse(body_text)?,
    })
}

/// Classifies calculator submissions.
pub struct CalcParser;

impl SnippetParser for CalcParser {
    fn parse(&self, text: &str, evaluation_id: u64) -> Result<Snippet, EvaluationError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(EvaluationError::Syntax("Empty submission.".into()));
        }
        if let Some(rest) = trimmed.strip_prefix("type ") {
            let name = rest
                .split_whitespace()
                .next()
                .ok_or_else(|| {
                    EvaluationError::Syntax("A type declaration needs a name.".into())
                })?;
            return Ok(Snippet {
                kind: SnippetKind::CompilationUnit,
                source: trimmed.to_owned(),
                class_name: name.to_owned(),
                members: Vec::new(),
            });
        }
        if trimmed.starts_with("fn ") {
            let function = parse_function(trimmed)?;
            return Ok(Snippet {
                kind: SnippetKind::ClassMembers,
                source: trimmed.to_owned(),
                class_name: format!("Eval{evaluation_id}"),
                members: vec![MemberDecl::method(function.name, trimmed)],
            });
        }
        if let Some((name, expr_text)) = split_assignment(trimmed) {
            let expr = ExprParser::parse(expr_text)?;
            let descriptor = if contains_string(&expr) { "string" } else { "int" };
            return Ok(Snippet {
                kind: SnippetKind::ClassMembers,
                source: trimmed.to_owned(),
                class_name: format!("Eval{evaluation_id}"),
                members: vec![MemberDecl::field(name, descriptor)],
            });
        }
        // Surface syntax problems before anything downstream runs.
        ExprParser::parse(trimmed)?;
        Ok(Snippet {
            kind: SnippetKind::CodeBlock,
            source: trimmed.to_owned(),
            class_name: format!("Eval{evaluation_id}"),
            members: Vec::new(),
        })
    }
}

/// Renders a snippet as a line-oriented unit the compiler understands:
/// one `field`, `fn`, `assign` or `expr` statement per line, with the
/// tracked variables and declared functions folded in.
pub struct CalcRewriter;

impl Rewriter for CalcRewriter {
    fn rewrite(
        &self,
        snippet: &Snippet,
        context: &RewriteContext,
    ) -> Result<CompilableUnit, EvaluationError> {
        if snippet.kind == SnippetKind::CompilationUnit {
            return Ok(CompilableUnit {
                class_name: snippet.class_name.clone(),
                source: snippet.source.clone(),
            });
        }

        let assigned = snippet
            .members
            .iter()
            .find(|member| member.kind == MemberKind::Field);
        let declared_fn = snippet
            .members
            .iter()
            .find(|member| member.kind == MemberKind::Method);

        let mut source = String::new();
        for variable in &context.variables {
            // A redeclaration supersedes the tracked descriptor.
            if assigned.is_some_and(|member| member.name == variable.name) {
                continue;
            }
            source.push_str(&format!(
                "field {} {}\n",
                variable.name, variable.type_descriptor
            ));
        }
        if let Some(member) = assigned {
            source.push_str(&format!(
                "field {} {}\n",
                member.name,
                member.type_descriptor.as_deref().unwrap_or("int")
            ));
        }
        for (name, code) in &context.methods {
            if declared_fn.is_some_and(|member| &member.name == name) {
                continue;
            }
            source.push_str(code);
            source.push('\n');
        }

        if let Some(member) = declared_fn {
            source.push_str(member.code.as_deref().unwrap_or_default());
            source.push('\n');
        } else if assigned.is_some() {
            source.push_str(&format!("assign {}\n", snippet.source));
        } else {
            source.push_str(&format!("expr {}\n", snippet.source));
        }

        Ok(CompilableUnit {
            class_name: snippet.class_name.clone(),
            source,
        })
    }
}

enum Body {
    Assign(String, Expr),
    Expr(Expr),
}

struct Program {
    fields: Vec<FieldDecl>,
    functions: HashMap<String, Function>,
    body: Option<Body>,
}

fn parse_program(source: &str) -> Result<Program, EvaluationError> {
    let mut fields = Vec::new();
    let mut functions = HashMap::new();
    let mut body = None;
    for line in source.lines().filter(|line| !line.trim().is_empty()) {
        if let Some(rest) = line.strip_prefix("field ") {
            let (name, descriptor) = rest.split_once(' ').ok_or_else(|| {
                EvaluationError::Syntax(format!("Malformed field line '{line}'."))
            })?;
            fields.push(FieldDecl::new(name, descriptor));
        } else if line.starts_with("fn ") {
            let function = parse_function(line)?;
            functions.insert(function.name.clone(), function);
        } else if let Some(rest) = line.strip_prefix("assign ") {
            let (name, expr_text) = split_assignment(rest).ok_or_else(|| {
                EvaluationError::Syntax(format!("Malformed assignment '{rest}'."))
            })?;
            body = Some(Body::Assign(name.to_owned(), ExprParser::parse(expr_text)?));
        } else if let Some(rest) = line.strip_prefix("expr ") {
            body = Some(Body::Expr(ExprParser::parse(rest)?));
        } else {
            return Err(EvaluationError::Syntax(format!(
                "Unrecognized unit line '{line}'."
            )));
        }
    }
    Ok(Program {
        fields,
        functions,
        body,
    })
}

/// Compiles rewritten units. Type declarations compile to their own
/// source text; everything else is validated and interpreted at
/// instantiation.
pub struct CalcCompiler;

impl Compiler for CalcCompiler {
    fn compile(&self, unit: &CompilableUnit, _context: &CompileContext<'_>) -> Compilation {
        if unit.source.starts_with("type ") {
            let mut types = BTreeMap::new();
            types.insert(unit.class_name.clone(), unit.source.clone().into_bytes());
            let mut packages = BTreeSet::new();
            if let Some((package, _)) = unit.class_name.rsplit_once('.') {
                packages.insert(package.to_owned());
            }
            return Compilation {
                types,
                packages,
                diagnostics: Vec::new(),
            };
        }
        match parse_program(&unit.source) {
            Ok(_) => Compilation::default(),
            Err(e) => Compilation {
                diagnostics: vec![e.to_string()],
                ..Compilation::default()
            },
        }
    }

    fn instantiate(
        &self,
        unit: &CompilableUnit,
        _compilation: &Compilation,
        _types: &dyn TypeResolver,
    ) -> Result<Box<dyn Executable>, EvalError> {
        let program = parse_program(&unit.source)?;
        Ok(Box::new(CalcExecutable {
            program,
            values: HashMap::new(),
        }))
    }
}

fn accepts(descriptor: &str, value: &Value) -> bool {
    match descriptor {
        "int" => value.is_i64() || value.is_u64() || value.is_null(),
        "string" => value.is_string() || value.is_null(),
        _ => true,
    }
}

fn render(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn apply(op: Op, lhs: &Value, rhs: &Value) -> Result<Value, EvalError> {
    if let (Some(a), Some(b)) = (lhs.as_i64(), rhs.as_i64()) {
        let result = match op {
            Op::Add => a.checked_add(b),
            Op::Sub => a.checked_sub(b),
            Op::Mul => a.checked_mul(b),
            Op::Div => {
                if b == 0 {
                    return Err(EvalError::Execution("division by zero".into()));
                }
                a.checked_div(b)
            }
        };
        return result
            .map(|n| json!(n))
            .ok_or_else(|| EvalError::Execution("arithmetic overflow".into()));
    }
    if matches!(op, Op::Add) && (lhs.is_string() || rhs.is_string()) {
        return Ok(json!(format!("{}{}", render(lhs), render(rhs))));
    }
    Err(EvalError::Execution(format!(
        "cannot apply the operator to {lhs} and {rhs}"
    )))
}

fn eval_expr(
    expr: &Expr,
    scope: &HashMap<String, Value>,
    functions: &HashMap<String, Function>,
) -> Result<Value, EvalError> {
    match expr {
        Expr::Int(n) => Ok(json!(n)),
        Expr::Str(s) => Ok(json!(s)),
        Expr::Var(name) => scope
            .get(name)
            .cloned()
            .ok_or_else(|| EvalError::Execution(format!("'{name}' is not defined"))),
        Expr::Binary(op, lhs, rhs) => {
            let lhs = eval_expr(lhs, scope, functions)?;
            let rhs = eval_expr(rhs, scope, functions)?;
            apply(*op, &lhs, &rhs)
        }
        Expr::Call(name, args) => {
            let function = functions
                .get(name)
                .ok_or_else(|| EvalError::Execution(format!("'{name}' is not a function")))?;
            if args.len() != function.params.len() {
                return Err(EvalError::Execution(format!(
                    "'{name}' takes {} arguments, got {}",
                    function.params.len(),
                    args.len()
                )));
            }
            let mut inner = scope.clone();
            for (param, arg) in function.params.iter().zip(args) {
                inner.insert(param.clone(), eval_expr(arg, scope, functions)?);
            }
            eval_expr(&function.body, &inner, functions)
        }
    }
}

struct CalcExecutable {
    program: Program,
    values: HashMap<String, Value>,
}

impl Executable for CalcExecutable {
    fn declared_fields(&self) -> Vec<FieldDecl> {
        self.program.fields.clone()
    }

    fn set_field(&mut self, name: &str, value: &Value) -> FieldAssignment {
        let Some(field) = self.program.fields.iter().find(|field| field.name == name) else {
            return FieldAssignment::Incompatible {
                expected: String::new(),
            };
        };
        if accepts(&field.type_descriptor, value) {
            self.values.insert(name.to_owned(), value.clone());
            FieldAssignment::Assigned
        } else {
            FieldAssignment::Incompatible {
                expected: field.type_descriptor.clone(),
            }
        }
    }

    fn get_field(&self, name: &str) -> Option<Value> {
        self.values.get(name).cloned()
    }

    fn call(&mut self) -> Result<Invocation, EvalError> {
        let result = match &self.program.body {
            Some(Body::Assign(name, expr)) => {
                let value = eval_expr(expr, &self.values, &self.program.functions)?;
                self.values.insert(name.clone(), value);
                None
            }
            Some(Body::Expr(expr)) => {
                Some(eval_expr(expr, &self.values, &self.program.functions)?)
            }
            None => None,
        };
        Ok(Invocation {
            result,
            members: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use ikernel_engine::{Evaluator, Metadata, Shell};

    use super::*;

    fn shell() -> Shell {
        Shell::new(
            Box::new(CalcParser),
            Box::new(CalcRewriter),
            Box::new(CalcCompiler),
        )
    }

    fn eval(shell: &mut Shell, text: &str, id: u64) -> Result<Option<Value>, EvalError> {
        shell.evaluate(text, id, &Metadata::new())
    }

    #[test]
    fn test_assignment_then_expression() {
        let mut shell = shell();

        assert_eq!(eval(&mut shell, "x = 5", 1).unwrap(), None);
        assert_eq!(eval(&mut shell, "x + 1", 2).unwrap(), Some(json!(6)));
    }

    #[test]
    fn test_string_concatenation() {
        let mut shell = shell();

        eval(&mut shell, r#"greeting = "hello, ""#, 1).unwrap();
        assert_eq!(
            eval(&mut shell, r#"greeting + "world""#, 2).unwrap(),
            Some(json!("hello, world"))
        );
    }

    #[test]
    fn test_function_declaration_and_call() {
        let mut shell = shell();

        assert_eq!(eval(&mut shell, "fn double(n) = n + n", 1).unwrap(), None);
        assert_eq!(eval(&mut shell, "double(4)", 2).unwrap(), Some(json!(8)));

        // Functions see tracked variables through their arguments.
        eval(&mut shell, "x = 10", 3).unwrap();
        assert_eq!(
            eval(&mut shell, "double(x) + 1", 4).unwrap(),
            Some(json!(21))
        );
    }

    #[test]
    fn test_redeclared_variable_goes_stale_then_recovers() {
        let mut shell = shell();

        eval(&mut shell, "x = 5", 1).unwrap();

        let error = eval(&mut shell, r#"x = "five""#, 2).unwrap_err();
        assert!(matches!(
            error,
            EvalError::StaleState { ref variables } if variables == &["x".to_string()]
        ));
        assert!(shell.state().get("x").is_none());

        // Re-running initializes the variable under its new type.
        eval(&mut shell, r#"x = "five""#, 2).unwrap();
        assert_eq!(
            eval(&mut shell, r#"x + "!""#, 3).unwrap(),
            Some(json!("five!"))
        );
    }

    #[test]
    fn test_identical_type_declaration_keeps_generation() {
        let mut shell = shell();

        eval(&mut shell, "type Point int int", 1).unwrap();
        assert_eq!(shell.generations().generation_count(), 1);

        eval(&mut shell, "type Point int int", 2).unwrap();
        assert_eq!(shell.generations().generation_count(), 1);

        eval(&mut shell, "type Point int int int", 3).unwrap();
        assert_eq!(shell.generations().generation_count(), 2);
    }

    #[test]
    fn test_dotted_type_name_records_package() {
        let mut shell = shell();
        eval(&mut shell, "type geometry.Point int int", 1).unwrap();
        assert!(shell.packages().contains("geometry"));
    }

    #[test]
    fn test_undefined_variable_is_an_execution_error() {
        let mut shell = shell();
        assert!(matches!(
            eval(&mut shell, "ghost + 1", 1),
            Err(EvalError::Execution(message)) if message.contains("ghost")
        ));
    }

    #[test]
    fn test_arithmetic_overflow_is_an_execution_error() {
        let mut shell = shell();
        assert!(matches!(
            eval(&mut shell, "9223372036854775807 + 1", 1),
            Err(EvalError::Execution(message)) if message == "arithmetic overflow"
        ));
        assert!(matches!(
            eval(&mut shell, "9223372036854775807 * 2", 2),
            Err(EvalError::Execution(message)) if message == "arithmetic overflow"
        ));
    }

    #[test]
    fn test_division_by_zero() {
        let mut shell = shell();
        assert!(matches!(
            eval(&mut shell, "1 / 0", 1),
            Err(EvalError::Execution(message)) if message == "division by zero"
        ));
    }

    #[test]
    fn test_syntax_errors_surface_before_execution() {
        let mut shell = shell();
        assert!(matches!(
            eval(&mut shell, "1 +", 1),
            Err(EvalError::Evaluation(EvaluationError::Syntax(_)))
        ));
        assert!(matches!(
            eval(&mut shell, "@", 1),
            Err(EvalError::Evaluation(EvaluationError::Syntax(_)))
        ));
    }

    #[test]
    fn test_operator_precedence_and_parentheses() {
        let mut shell = shell();
        assert_eq!(eval(&mut shell, "2 + 3 * 4", 1).unwrap(), Some(json!(14)));
        assert_eq!(eval(&mut shell, "(2 + 3) * 4", 2).unwrap(), Some(json!(20)));
    }
}
