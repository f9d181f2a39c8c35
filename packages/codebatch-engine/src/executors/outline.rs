//! Line-level source outline
//!
//! The parse executor reduces a Python-shaped source file to this outline:
//! imports, definitions, assignments, name references, and branch points.
//! Downstream executors (analyze, symbols, lint) work from the stored
//! outline instead of re-reading source, which keeps them deterministic
//! over `(config, files, prior_outputs)`.

use serde::{Deserialize, Serialize};

pub const OUTLINE_SCHEMA_NAME: &str = "codebatch.outline";
pub const OUTLINE_SCHEMA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportStmt {
    /// Name the import binds in module scope
    pub name: String,
    pub line: u32,
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDef {
    pub name: String,
    pub line: u32,
    pub column: u32,
    /// `module`, or the enclosing definition's name
    pub scope: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassDef {
    pub name: String,
    pub line: u32,
    pub column: u32,
    pub scope: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub name: String,
    pub line: u32,
    pub column: u32,
    /// Enclosing function name; `None` at module or class level
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameRef {
    pub name: String,
    pub line: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceOutline {
    pub schema_name: String,
    pub schema_version: u32,
    pub path: String,
    pub line_count: u32,
    pub imports: Vec<ImportStmt>,
    pub functions: Vec<FunctionDef>,
    pub classes: Vec<ClassDef>,
    pub assignments: Vec<Assignment>,
    pub references: Vec<NameRef>,
    pub branch_count: u32,
}

impl SourceOutline {
    pub fn is_referenced(&self, name: &str) -> bool {
        self.references.iter().any(|r| r.name == name)
    }
}

const KEYWORDS: &[&str] = &[
    "and", "as", "assert", "async", "await", "break", "case", "class", "continue", "def", "del",
    "elif", "else", "except", "finally", "for", "from", "global", "if", "import", "in", "is",
    "lambda", "match", "nonlocal", "not", "or", "pass", "raise", "return", "try", "while", "with",
    "yield", "None", "True", "False",
];

const BRANCH_KEYWORDS: &[&str] = &["if", "elif", "for", "while", "except", "case"];

fn is_keyword(token: &str) -> bool {
    KEYWORDS.contains(&token)
}

fn is_identifier(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

fn identifier_tokens(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        if c.is_alphanumeric() || c == '_' {
            current.push(c);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
        .into_iter()
        .filter(|t| is_identifier(t) && !is_keyword(t))
        .collect()
}

fn indent_of(line: &str) -> usize {
    line.chars()
        .take_while(|c| *c == ' ' || *c == '\t')
        .count()
}

fn column_of(line: &str, name: &str) -> u32 {
    line.find(name).map_or(1, |idx| idx as u32 + 1)
}

/// Names bound by an `import` / `from … import` statement.
fn import_bindings(trimmed: &str) -> Vec<String> {
    let mut names = Vec::new();
    if let Some(rest) = trimmed.strip_prefix("import ") {
        for part in rest.split(',') {
            let part = part.trim();
            let bound = match part.split_once(" as ") {
                Some((_, alias)) => alias.trim(),
                None => part.split('.').next().unwrap_or(part).trim(),
            };
            if is_identifier(bound) {
                names.push(bound.to_string());
            }
        }
    } else if trimmed.starts_with("from ") {
        if let Some((_, imported)) = trimmed.split_once(" import ") {
            let imported = imported.replace(['(', ')'], "");
            for part in imported.split(',') {
                let part = part.trim();
                if part == "*" {
                    continue;
                }
                let bound = match part.split_once(" as ") {
                    Some((_, alias)) => alias.trim(),
                    None => part,
                };
                if is_identifier(bound) {
                    names.push(bound.to_string());
                }
            }
        }
    }
    names
}

/// Detect a plain `name = expr` binding; returns `(name, rhs)`.
fn split_assignment(trimmed: &str) -> Option<(&str, &str)> {
    let eq = trimmed.find('=')?;
    // not ==, <=, >=, !=, +=, …
    if trimmed[eq + 1..].starts_with('=') {
        return None;
    }
    if eq > 0 {
        let before = trimmed.as_bytes()[eq - 1];
        if !(before.is_ascii_alphanumeric() || before == b'_' || before == b' ') {
            return None;
        }
    }
    let lhs = trimmed[..eq].trim();
    if !is_identifier(lhs) || is_keyword(lhs) {
        return None;
    }
    Some((lhs, &trimmed[eq + 1..]))
}

/// Build the outline of one source file.
pub fn parse_outline(path: &str, source: &str) -> SourceOutline {
    let mut outline = SourceOutline {
        schema_name: OUTLINE_SCHEMA_NAME.to_string(),
        schema_version: OUTLINE_SCHEMA_VERSION,
        path: path.to_string(),
        line_count: 0,
        imports: Vec::new(),
        functions: Vec::new(),
        classes: Vec::new(),
        assignments: Vec::new(),
        references: Vec::new(),
        branch_count: 0,
    };

    // (indent, name, is_function)
    let mut scopes: Vec<(usize, String, bool)> = Vec::new();

    for (idx, raw) in source.lines().enumerate() {
        let line_no = idx as u32 + 1;
        outline.line_count = line_no;

        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let indent = indent_of(raw);
        scopes.retain(|(scope_indent, _, _)| *scope_indent < indent);

        let first_token = trimmed
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .next()
            .unwrap_or("");
        if BRANCH_KEYWORDS.contains(&first_token) {
            outline.branch_count += 1;
        }

        if first_token == "import" || first_token == "from" {
            for name in import_bindings(trimmed) {
                let column = column_of(raw, &name);
                outline.imports.push(ImportStmt {
                    name,
                    line: line_no,
                    column,
                });
            }
            // module names are bindings, not uses
            continue;
        }

        let scope_name = scopes
            .last()
            .map_or_else(|| "module".to_string(), |(_, name, _)| name.clone());
        let enclosing_function = scopes
            .iter()
            .rev()
            .find(|(_, _, is_fn)| *is_fn)
            .map(|(_, name, _)| name.clone());

        if let Some(rest) = trimmed.strip_prefix("def ") {
            if let Some(name) = rest.split(['(', ':']).next().map(str::trim) {
                if is_identifier(name) {
                    outline.functions.push(FunctionDef {
                        name: name.to_string(),
                        line: line_no,
                        column: column_of(raw, name),
                        scope: scope_name,
                    });
                    // parameter defaults may reference names
                    if let Some(params) = rest.split_once('(').map(|(_, p)| p) {
                        for token in identifier_tokens(params) {
                            outline.references.push(NameRef {
                                name: token,
                                line: line_no,
                            });
                        }
                    }
                    scopes.push((indent, name.to_string(), true));
                }
            }
            continue;
        }

        if let Some(rest) = trimmed.strip_prefix("class ") {
            if let Some(name) = rest.split(['(', ':']).next().map(str::trim) {
                if is_identifier(name) {
                    outline.classes.push(ClassDef {
                        name: name.to_string(),
                        line: line_no,
                        column: column_of(raw, name),
                        scope: scope_name,
                    });
                    if let Some(bases) = rest.split_once('(').map(|(_, b)| b) {
                        for token in identifier_tokens(bases) {
                            outline.references.push(NameRef {
                                name: token,
                                line: line_no,
                            });
                        }
                    }
                    scopes.push((indent, name.to_string(), false));
                }
            }
            continue;
        }

        if let Some((name, rhs)) = split_assignment(trimmed) {
            outline.assignments.push(Assignment {
                name: name.to_string(),
                line: line_no,
                column: column_of(raw, name),
                function: enclosing_function,
            });
            for token in identifier_tokens(rhs) {
                outline.references.push(NameRef {
                    name: token,
                    line: line_no,
                });
            }
            continue;
        }

        for token in identifier_tokens(trimmed) {
            outline.references.push(NameRef {
                name: token,
                line: line_no,
            });
        }
    }

    outline
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const FIXTURE: &str = "import sys\ndef f():\n  x=1\n  return 42\n";

    #[test]
    fn test_outline_fixture() {
        let outline = parse_outline("m.py", FIXTURE);
        assert_eq!(outline.line_count, 4);
        assert_eq!(outline.imports.len(), 1);
        assert_eq!(outline.imports[0].name, "sys");
        assert_eq!(outline.imports[0].line, 1);
        assert_eq!(outline.functions.len(), 1);
        assert_eq!(outline.functions[0].name, "f");
        assert_eq!(outline.functions[0].line, 2);
        assert_eq!(outline.assignments.len(), 1);
        assert_eq!(outline.assignments[0].name, "x");
        assert_eq!(outline.assignments[0].line, 3);
        assert_eq!(outline.assignments[0].function.as_deref(), Some("f"));
        assert_eq!(outline.branch_count, 0);
        // neither `sys` nor `x` is ever referenced
        assert!(!outline.is_referenced("sys"));
        assert!(!outline.is_referenced("x"));
    }

    #[test]
    fn test_used_import_is_referenced() {
        let outline = parse_outline("m.py", "import os\nprint(os.getcwd())\n");
        assert!(outline.is_referenced("os"));
    }

    #[test]
    fn test_import_as_binds_alias() {
        let outline = parse_outline("m.py", "import numpy as np\n");
        assert_eq!(outline.imports[0].name, "np");
    }

    #[test]
    fn test_from_import_names() {
        let outline = parse_outline("m.py", "from os.path import join, split as sp\n");
        let names: Vec<&str> = outline.imports.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["join", "sp"]);
    }

    #[test]
    fn test_dotted_import_binds_root() {
        let outline = parse_outline("m.py", "import os.path\n");
        assert_eq!(outline.imports[0].name, "os");
    }

    #[test]
    fn test_branch_count() {
        let source = "def g(n):\n  if n:\n    return 1\n  for i in range(n):\n    pass\n  while n:\n    n -= 1\n";
        let outline = parse_outline("m.py", source);
        assert_eq!(outline.branch_count, 3);
    }

    #[test]
    fn test_module_assignment_has_no_function() {
        let outline = parse_outline("m.py", "TOP = 1\n");
        assert_eq!(outline.assignments[0].function, None);
    }

    #[test]
    fn test_comparison_is_not_assignment() {
        let outline = parse_outline("m.py", "a == b\n");
        assert!(outline.assignments.is_empty());
        assert!(outline.is_referenced("a"));
        assert!(outline.is_referenced("b"));
    }

    #[test]
    fn test_rhs_self_reference_counts_as_use() {
        let outline = parse_outline("m.py", "def f():\n  x = 1\n  x = x + 1\n");
        assert!(outline.is_referenced("x"));
        assert_eq!(outline.assignments.len(), 2);
    }

    #[test]
    fn test_nested_function_scope() {
        let source = "def outer():\n  def inner():\n    y = 2\n";
        let outline = parse_outline("m.py", source);
        assert_eq!(outline.functions.len(), 2);
        assert_eq!(outline.functions[1].scope, "outer");
        assert_eq!(outline.assignments[0].function.as_deref(), Some("inner"));
    }

    #[test]
    fn test_class_method_scope() {
        let source = "class C:\n  def m(self):\n    pass\n";
        let outline = parse_outline("m.py", source);
        assert_eq!(outline.classes[0].name, "C");
        assert_eq!(outline.functions[0].scope, "C");
    }
}
