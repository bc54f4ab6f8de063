//! Static policy scan
//!
//! Parses a script with the tree-sitter Python grammar and walks the syntax
//! tree for imports outside the whitelist, blocked builtins, blocked
//! attributes and reflective dunder access. The scan is deterministic and
//! total: every script yields a report, parse errors included.

use crate::error::SandboxError;
use crate::policy::CompiledPolicy;
use analyst_core::{ExecutionFault, ExecutionOutcome, SandboxPolicy, Violation};
use parking_lot::Mutex;
use std::collections::HashSet;
use tree_sitter::{Node, Parser};

/// First syntax problem found
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyntaxIssue {
    /// 1-based
    pub line: usize,
    pub message: String,
}

/// Result of scanning one script
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanReport {
    /// In source order
    pub violations: Vec<Violation>,
    pub syntax_error: Option<SyntaxIssue>,
}

impl ScanReport {
    /// No violations and no syntax error
    #[inline]
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty() && self.syntax_error.is_none()
    }

    /// Outcome that makes running the script pointless, if any
    ///
    /// Violations take priority over syntax errors.
    #[must_use]
    pub fn blocking_outcome(&self) -> Option<ExecutionOutcome> {
        if let Some(violation) = self.violations.first() {
            return Some(ExecutionOutcome::SandboxViolation(violation.clone()));
        }
        self.syntax_error.as_ref().map(|issue| {
            ExecutionOutcome::ExecutionError(ExecutionFault::new(
                "SyntaxError",
                format!("{} (line {})", issue.message, issue.line),
            ))
        })
    }
}

/// Tree-sitter backed policy scanner
pub struct Scanner {
    policy: CompiledPolicy,
    parser: Mutex<Parser>,
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl Scanner {
    /// Create scanner for `policy`
    ///
    /// # Errors
    /// Returns `SandboxError::Parser` if the grammar cannot be loaded.
    pub fn new(policy: &SandboxPolicy) -> Result<Self, SandboxError> {
        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_python::LANGUAGE.into())
            .map_err(|e| SandboxError::Parser(e.to_string()))?;
        Ok(Self {
            policy: CompiledPolicy::new(policy),
            parser: Mutex::new(parser),
        })
    }

    /// Policy in force
    #[inline]
    #[must_use]
    pub fn policy(&self) -> &CompiledPolicy {
        &self.policy
    }

    /// Scan `code`
    #[must_use]
    pub fn scan(&self, code: &str) -> ScanReport {
        let Some(tree) = self.parser.lock().parse(code, None) else {
            return ScanReport {
                violations: Vec::new(),
                syntax_error: Some(SyntaxIssue {
                    line: 1,
                    message: "unparseable source".into(),
                }),
            };
        };

        let root = tree.root_node();
        let mut report = ScanReport::default();
        let mut bindings = HashSet::new();
        collect_bindings(&root, code.as_bytes(), &mut bindings);
        self.visit(&root, code.as_bytes(), &bindings, &mut report.violations);
        if root.has_error() {
            report.syntax_error = first_error(&root).map(|node| SyntaxIssue {
                line: node.start_position().row + 1,
                message: if node.is_missing() {
                    format!("missing '{}'", node.kind())
                } else {
                    "invalid syntax".into()
                },
            });
        }
        report
    }

    fn visit(
        &self,
        node: &Node,
        source: &[u8],
        bindings: &HashSet<&str>,
        out: &mut Vec<Violation>,
    ) {
        match node.kind() {
            "import_statement" => {
                for i in 0..node.named_child_count() {
                    if let Some(child) = node.named_child(i) {
                        let module = match child.kind() {
                            "aliased_import" => child.child_by_field_name("name"),
                            _ => Some(child),
                        };
                        if let Some(module) = module {
                            self.check_import(&module, source, out);
                        }
                    }
                }
                return;
            }
            "import_from_statement" => {
                if let Some(module) = node.child_by_field_name("module_name") {
                    self.check_import(&module, source, out);
                }
                return;
            }
            "future_import_statement" => return,
            // legacy `exec "code"` form
            "exec_statement" => {
                out.push(violation_at(
                    analyst_core::ViolationCategory::Call,
                    "exec".to_string(),
                    node,
                ));
            }
            "attribute" => {
                if let Some(name) = node.child_by_field_name("attribute") {
                    let attr = text(&name, source);
                    if let Some(category) = self.policy.check_attribute(attr) {
                        out.push(violation_at(category, compact(text(node, source)), node));
                    }
                }
                if let Some(object) = node.child_by_field_name("object") {
                    self.visit(&object, source, bindings, out);
                }
                return;
            }
            "keyword_argument" => {
                if let Some(value) = node.child_by_field_name("value") {
                    self.visit(&value, source, bindings, out);
                }
                return;
            }
            "identifier" => {
                let name = text(node, source);
                // a builtin the script rebinds is its own value; the harness
                // still stubs the real one
                let rebound = bindings.contains(name) && !CompiledPolicy::is_escape_name(name);
                if let Some(category) = self.policy.check_name(name).filter(|_| !rebound) {
                    out.push(violation_at(category, name.to_string(), node));
                }
                return;
            }
            _ => {}
        }

        for i in 0..node.child_count() {
            if let Some(child) = node.child(i) {
                self.visit(&child, source, bindings, out);
            }
        }
    }

    fn check_import(&self, module: &Node, source: &[u8], out: &mut Vec<Violation>) {
        let name = compact(text(module, source));
        let name = if module.kind() == "relative_import" && !name.starts_with('.') {
            format!(".{name}")
        } else {
            name
        };
        if let Some(violation) = self.policy.check_import(&name) {
            out.push(violation.at_line(module.start_position().row + 1));
        }
    }
}

/// Names the script binds itself, in any scope
fn collect_bindings<'s>(node: &Node, source: &'s [u8], out: &mut HashSet<&'s str>) {
    match node.kind() {
        "assignment" | "augmented_assignment" | "for_statement" | "for_in_clause" => {
            if let Some(left) = node.child_by_field_name("left") {
                collect_targets(&left, source, out);
            }
        }
        "function_definition" | "class_definition" | "named_expression" => {
            if let Some(name) = node.child_by_field_name("name") {
                collect_targets(&name, source, out);
            }
        }
        "aliased_import" => {
            if let Some(alias) = node.child_by_field_name("alias") {
                collect_targets(&alias, source, out);
            }
        }
        "as_pattern_target" => collect_targets(node, source, out),
        "parameters" | "lambda_parameters" => {
            for i in 0..node.named_child_count() {
                let Some(param) = node.named_child(i) else { continue };
                let name = match param.kind() {
                    "identifier" => Some(param),
                    "default_parameter" | "typed_default_parameter" => {
                        param.child_by_field_name("name")
                    }
                    // typed and splat parameters lead with their name
                    _ => param.named_child(0),
                };
                if let Some(name) = name {
                    collect_targets(&name, source, out);
                }
            }
        }
        _ => {}
    }

    for i in 0..node.child_count() {
        if let Some(child) = node.child(i) {
            collect_bindings(&child, source, out);
        }
    }
}

fn collect_targets<'s>(node: &Node, source: &'s [u8], out: &mut HashSet<&'s str>) {
    match node.kind() {
        "identifier" => {
            out.insert(text(node, source));
        }
        "pattern_list" | "tuple_pattern" | "list_pattern" | "expression_list" | "tuple"
        | "list" | "parenthesized_expression" | "list_splat_pattern" | "as_pattern_target" => {
            for i in 0..node.named_child_count() {
                if let Some(child) = node.named_child(i) {
                    collect_targets(&child, source, out);
                }
            }
        }
        _ => {}
    }
}

fn text<'s>(node: &Node, source: &'s [u8]) -> &'s str {
    node.utf8_text(source).unwrap_or("")
}

fn compact(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

fn violation_at(
    category: analyst_core::ViolationCategory,
    resource: String,
    node: &Node,
) -> Violation {
    Violation::new(category, resource).at_line(node.start_position().row + 1)
}

fn first_error<'t>(node: &Node<'t>) -> Option<Node<'t>> {
    if node.is_error() || node.is_missing() {
        return Some(*node);
    }
    if !node.has_error() {
        return None;
    }
    for i in 0..node.child_count() {
        if let Some(child) = node.child(i) {
            if let Some(found) = first_error(&child) {
                return Some(found);
            }
        }
    }
    None
}
