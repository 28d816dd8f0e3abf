// File: src/errors.rs
//
// Error handling and reporting for the Fun programming language.
// Provides a structured error type with source location information,
// pretty-printed error messages, and the runtime annotations (source
// file, current line, opcode, instruction pointer) the bytecode VM
// attaches when a program traps at runtime.

use colored::Colorize;
use std::fmt;

/// Source location information for tracking where code appears in a file
#[derive(Debug, Clone, PartialEq)]
pub struct SourceLocation {
    pub line: usize,
    pub column: usize,
    pub file: Option<String>,
}

#[allow(dead_code)]
impl SourceLocation {
    pub fn new(line: usize, column: usize) -> Self {
        Self { line, column, file: None }
    }

    pub fn with_file(line: usize, column: usize, file: String) -> Self {
        Self { line, column, file: Some(file) }
    }

    pub fn unknown() -> Self {
        Self { line: 0, column: 0, file: None }
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(ref file) = self.file {
            write!(f, "{}:{}:{}", file, self.line, self.column)
        } else {
            write!(f, "{}:{}", self.line, self.column)
        }
    }
}

/// Broad category of error, matching the taxonomy the compiler and VM raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(dead_code)]
pub enum ErrorKind {
    ParseError,
    TypeError,
    BoundsError,
    ArithmeticError,
    ResourceError,
    RuntimeError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::ParseError => write!(f, "Parse Error"),
            ErrorKind::TypeError => write!(f, "Type Error"),
            ErrorKind::BoundsError => write!(f, "Bounds Error"),
            ErrorKind::ArithmeticError => write!(f, "Arithmetic Error"),
            ErrorKind::ResourceError => write!(f, "Resource Error"),
            ErrorKind::RuntimeError => write!(f, "Runtime Error"),
        }
    }
}

/// Runtime-only annotation attached to a fatal VM error: the failing
/// instruction's opcode name, its index in the chunk, and the enclosing
/// function/source file, so a diagnostic reads like
/// `(at file:line in fname, op OPNAME @ip N)`.
#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    pub source_file: Option<String>,
    pub function_name: Option<String>,
    pub opcode: Option<String>,
    pub ip: Option<usize>,
}

/// A structured error with location information
#[derive(Debug, Clone)]
pub struct FunError {
    pub kind: ErrorKind,
    pub message: String,
    pub location: SourceLocation,
    pub source_line: Option<String>,
    pub suggestion: Option<String>,
    pub help: Option<String>,
    pub note: Option<String>,
    pub runtime: Option<RuntimeContext>,
}

#[allow(dead_code)]
impl FunError {
    pub fn new(kind: ErrorKind, message: impl Into<String>, location: SourceLocation) -> Self {
        Self {
            kind,
            message: message.into(),
            location,
            source_line: None,
            suggestion: None,
            help: None,
            note: None,
            runtime: None,
        }
    }

    pub fn with_source(mut self, source_line: String) -> Self {
        self.source_line = Some(source_line);
        self
    }

    pub fn with_suggestion(mut self, suggestion: String) -> Self {
        self.suggestion = Some(suggestion);
        self
    }

    pub fn with_help(mut self, help: String) -> Self {
        self.help = Some(help);
        self
    }

    pub fn with_note(mut self, note: String) -> Self {
        self.note = Some(note);
        self
    }

    pub fn with_runtime(mut self, ctx: RuntimeContext) -> Self {
        self.runtime = Some(ctx);
        self
    }

    /// Create a parse (compile-time) error.
    pub fn parse(message: impl Into<String>, location: SourceLocation) -> Self {
        Self::new(ErrorKind::ParseError, message, location)
    }

    /// Create a type error.
    pub fn type_error(message: impl Into<String>, location: SourceLocation) -> Self {
        Self::new(ErrorKind::TypeError, message, location)
    }

    /// Create a bounds error (array/stack/frame/global overflow or index out of range).
    pub fn bounds(message: impl Into<String>, location: SourceLocation) -> Self {
        Self::new(ErrorKind::BoundsError, message, location)
    }

    /// Create an arithmetic error (division or modulo by zero).
    pub fn arithmetic(message: impl Into<String>, location: SourceLocation) -> Self {
        Self::new(ErrorKind::ArithmeticError, message, location)
    }

    /// Create a resource error (file I/O failure).
    pub fn resource(message: impl Into<String>, location: SourceLocation) -> Self {
        Self::new(ErrorKind::ResourceError, message, location)
    }

    /// Create a generic runtime error.
    pub fn runtime(message: impl Into<String>, location: SourceLocation) -> Self {
        Self::new(ErrorKind::RuntimeError, message, location)
    }
}

impl fmt::Display for FunError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kind_str = format!("{}", self.kind);
        writeln!(f, "{}: {}", kind_str.red().bold(), self.message.bold())?;

        let location_str = format!("  --> {}", self.location);
        writeln!(f, "{}", location_str.bright_blue())?;

        if let Some(ref source) = self.source_line {
            let col_num = self.location.column;

            writeln!(f, "   {}", "|".bright_blue())?;
            writeln!(
                f,
                "{} {} {}",
                format!("{:3}", self.location.line).bright_blue(),
                "|".bright_blue(),
                source
            )?;
            writeln!(
                f,
                "   {} {}{}",
                "|".bright_blue(),
                " ".repeat(col_num.saturating_sub(1)),
                "^".red().bold()
            )?;
            writeln!(f, "   {}", "|".bright_blue())?;
        }

        if let Some(ref help) = self.help {
            writeln!(
                f,
                "   {} {}",
                "=".bright_yellow(),
                format!("help: {}", help).bright_yellow()
            )?;
        }

        if let Some(ref suggestion) = self.suggestion {
            writeln!(
                f,
                "   {} {}",
                "=".bright_green(),
                format!("Did you mean '{}'?", suggestion).bright_green()
            )?;
        }

        if let Some(ref note) = self.note {
            writeln!(f, "   {} {}", "=".bright_cyan(), format!("note: {}", note).bright_cyan())?;
        }

        if let Some(rt) = &self.runtime {
            let opname = rt.opcode.as_deref().unwrap_or("?");
            let fname = rt.function_name.as_deref().unwrap_or("<entry>");
            let sfile = rt.source_file.as_deref().unwrap_or("<unknown>");
            writeln!(
                f,
                "   {} {}",
                "=".bright_magenta(),
                format!(
                    "at {}:{} in {}, op {} @ip {}",
                    sfile,
                    self.location.line,
                    fname,
                    opname,
                    rt.ip.map(|i| i as i64).unwrap_or(-1)
                )
                .bright_magenta()
            )?;
        }

        Ok(())
    }
}

impl std::error::Error for FunError {}

pub type FunResult<T> = Result<T, FunError>;

/// Computes the Levenshtein distance between two strings.
/// Used for "Did you mean?" suggestions when a name lookup fails.
pub fn levenshtein_distance(s1: &str, s2: &str) -> usize {
    let len1 = s1.chars().count();
    let len2 = s2.chars().count();

    if len1 == 0 {
        return len2;
    }
    if len2 == 0 {
        return len1;
    }

    let mut matrix = vec![vec![0; len2 + 1]; len1 + 1];

    for (i, row) in matrix.iter_mut().enumerate().take(len1 + 1) {
        row[0] = i;
    }
    for j in 0..=len2 {
        matrix[0][j] = j;
    }

    let s1_chars: Vec<char> = s1.chars().collect();
    let s2_chars: Vec<char> = s2.chars().collect();

    for i in 1..=len1 {
        for j in 1..=len2 {
            let cost = if s1_chars[i - 1] == s2_chars[j - 1] { 0 } else { 1 };
            matrix[i][j] = std::cmp::min(
                std::cmp::min(matrix[i - 1][j] + 1, matrix[i][j - 1] + 1),
                matrix[i - 1][j - 1] + cost,
            );
        }
    }

    matrix[len1][len2]
}

/// Find the closest match from a list of candidates using Levenshtein distance.
/// Returns None if no good match is found (distance > 3).
pub fn find_closest_match<'a>(target: &str, candidates: &'a [String]) -> Option<&'a str> {
    if candidates.is_empty() {
        return None;
    }

    let mut best_match = None;
    let mut best_distance = usize::MAX;

    for candidate in candidates {
        let distance = levenshtein_distance(target, candidate);
        if distance <= 3 && distance < best_distance {
            best_distance = distance;
            best_match = Some(candidate.as_str());
        }
    }

    best_match
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_with_location_arrow() {
        let err = FunError::type_error(
            "ADD expects both ints, both strings, or both arrays, got Number and String",
            SourceLocation::with_file(3, 5, "main.fun".to_string()),
        );
        let rendered = format!("{}", err);
        assert!(rendered.contains("Type Error"));
        assert!(rendered.contains("main.fun:3:5"));
    }

    #[test]
    fn runtime_context_appended() {
        let err = FunError::arithmetic("division by zero", SourceLocation::new(10, 1)).with_runtime(RuntimeContext {
            source_file: Some("main.fun".to_string()),
            function_name: Some("divide".to_string()),
            opcode: Some("OP_DIV".to_string()),
            ip: Some(42),
        });
        let rendered = format!("{}", err);
        assert!(rendered.contains("OP_DIV"));
        assert!(rendered.contains("@ip 42"));
    }

    #[test]
    fn levenshtein_matches_close_names() {
        let candidates = vec!["length".to_string(), "push".to_string()];
        assert_eq!(find_closest_match("lenght", &candidates), Some("length"));
        assert_eq!(find_closest_match("zzzzzzzzzz", &candidates), None);
    }
}
