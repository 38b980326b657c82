//! Source-to-source normalizer: rewrites bare snippets into a returnable
//! form.
//!
//! Rewrites are span-driven splices of the original text, so whitespace,
//! comments and formatting survive. The parser, not the normalizer, decides
//! what the snippet is; the normalizer only picks which of the rewrite rows
//! applies.

use crate::syntax::{self, Node, NodeKind, NodeType, ParseError};

/// What shape the snippet had before (and after) normalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnippetShape {
    /// A bare expression (possibly rewritten to `return` it).
    Expression,
    /// A statement program whose value is whatever it returns.
    Statements,
    /// The program already contains a top-level `return`.
    AlreadyReturns,
    /// A top-level function declaration; left untouched.
    FunctionDeclaration,
}

/// A normalization outcome: the (possibly rewritten) source plus what
/// happened.
#[derive(Debug, Clone)]
pub struct Normalized {
    /// The source to execute.
    pub code: String,
    /// Whether the source differs from the (trimmed) input.
    pub modified: bool,
    /// Shape classification.
    pub shape: SnippetShape,
}

/// Normalize a snippet so that evaluating it produces a value.
///
/// Returns a parse error only when the snippet fails to parse both as-is and
/// under the permissive `return <source>` retry.
pub fn normalize(source: &str) -> Result<Normalized, ParseError> {
    let trimmed = source.trim();
    if trimmed.is_empty() {
        return Ok(Normalized {
            code: String::new(),
            modified: false,
            shape: SnippetShape::Expression,
        });
    }

    let program = match syntax::parse_program(trimmed) {
        Ok(program) => program,
        Err(first_error) => {
            // Permissive retry: object-literal snippets like `{ a: 1 }` only
            // parse once they sit in expression position.
            let wrapped = format!("return {trimmed}");
            return match syntax::parse_program(&wrapped) {
                Ok(_) => Ok(Normalized {
                    code: wrapped,
                    modified: true,
                    shape: SnippetShape::Expression,
                }),
                Err(_) => Err(first_error),
            };
        }
    };

    let body = match &program.kind {
        NodeKind::Program { body } => body,
        _ => unreachable!("parse_program returns a program node"),
    };

    if body.is_empty() {
        return Ok(Normalized {
            code: trimmed.to_string(),
            modified: false,
            shape: SnippetShape::Expression,
        });
    }

    if body.iter().any(has_top_level_return) {
        return Ok(Normalized {
            code: trimmed.to_string(),
            modified: false,
            shape: SnippetShape::AlreadyReturns,
        });
    }

    let Some(last) = body.last() else {
        // Unreachable: the empty case returned above.
        return Ok(Normalized {
            code: trimmed.to_string(),
            modified: false,
            shape: SnippetShape::Statements,
        });
    };
    match &last.kind {
        NodeKind::ExpressionStatement { expression } => {
            let start = expression.span.start as usize;
            let mut code = format!("{}return {}", &trimmed[..start], &trimmed[start..]);
            if body.len() == 1 {
                // Single expression: also strip the trailing terminator.
                let stripped = code.trim_end();
                let stripped = stripped.strip_suffix(';').unwrap_or(stripped);
                code = stripped.trim_end().to_string();
            }
            Ok(Normalized {
                code,
                modified: true,
                shape: SnippetShape::Expression,
            })
        }
        NodeKind::FunctionDeclaration { .. } => Ok(Normalized {
            code: trimmed.to_string(),
            modified: false,
            shape: SnippetShape::FunctionDeclaration,
        }),
        _ => Ok(Normalized {
            code: trimmed.to_string(),
            modified: false,
            shape: SnippetShape::Statements,
        }),
    }
}

/// Whether a statement contains a `return` that binds at the top level,
/// descending through blocks and control flow but not into functions.
fn has_top_level_return(node: &Node) -> bool {
    match node.node_type() {
        NodeType::ReturnStatement => true,
        t if t.is_function() || t == NodeType::ClassDeclaration || t == NodeType::ClassExpression => {
            false
        }
        _ => {
            let mut found = false;
            node.for_each_child(&mut |child| {
                if !found && has_top_level_return(child) {
                    found = true;
                }
            });
            found
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_is_unchanged() {
        let n = normalize("   \n  ").unwrap();
        assert_eq!(n.code, "");
        assert!(!n.modified);
        assert_eq!(n.shape, SnippetShape::Expression);
    }

    #[test]
    fn single_expression_gets_a_return() {
        let n = normalize("adapters.api.getData()").unwrap();
        assert_eq!(n.code, "return adapters.api.getData()");
        assert!(n.modified);
        assert_eq!(n.shape, SnippetShape::Expression);
    }

    #[test]
    fn trailing_terminator_is_stripped() {
        let n = normalize("adapters.api.getData();").unwrap();
        assert_eq!(n.code, "return adapters.api.getData()");
    }

    #[test]
    fn last_expression_of_many_gets_a_return() {
        let n = normalize("const x = await adapters.api.get(1);\nx.items").unwrap();
        assert_eq!(n.code, "const x = await adapters.api.get(1);\nreturn x.items");
        assert!(n.modified);
    }

    #[test]
    fn existing_return_is_left_alone() {
        let src = "const x = 1;\nreturn x;";
        let n = normalize(src).unwrap();
        assert_eq!(n.code, src);
        assert!(!n.modified);
        assert_eq!(n.shape, SnippetShape::AlreadyReturns);
    }

    #[test]
    fn return_inside_function_does_not_count() {
        let n = normalize("function f() { return 1; }\nf()").unwrap();
        assert_eq!(n.code, "function f() { return 1; }\nreturn f()");
        assert!(n.modified);
    }

    #[test]
    fn lone_function_declaration_is_unchanged() {
        let src = "function handler(x) { return x * 2; }";
        let n = normalize(src).unwrap();
        assert_eq!(n.code, src);
        assert!(!n.modified);
        assert_eq!(n.shape, SnippetShape::FunctionDeclaration);
    }

    #[test]
    fn statement_terminated_program_is_unchanged() {
        let src = "const x = adapters.api.get(1);";
        let n = normalize(src).unwrap();
        assert_eq!(n.code, src);
        assert!(!n.modified);
        assert_eq!(n.shape, SnippetShape::Statements);
    }

    #[test]
    fn object_literal_snippet_uses_the_permissive_retry() {
        // Parses as a block on the first try, so it stays a statement...
        let n = normalize("{ a: 1 }").unwrap();
        assert_eq!(n.shape, SnippetShape::Statements);

        // ...but a snippet that only parses in expression position is
        // wrapped by the retry.
        let n = normalize("{ a: 1, b: 2 }").unwrap();
        assert_eq!(n.code, "return { a: 1, b: 2 }");
        assert!(n.modified);
        assert_eq!(n.shape, SnippetShape::Expression);
    }

    #[test]
    fn parse_failure_reports_the_original_error() {
        let err = normalize("const = 1").unwrap_err();
        assert!(err.message.contains("binding pattern") || err.message.contains("reserved"));
    }

    #[test]
    fn unmodified_output_equals_trimmed_input() {
        for src in ["  const x = 1; ", "return 1", "function f() {}"] {
            let n = normalize(src).unwrap();
            if !n.modified {
                assert_eq!(n.code, src.trim());
            }
        }
    }

    #[test]
    fn normalization_is_idempotent() {
        for src in [
            "adapters.api.getData()",
            "const x = 1;\nx + 1",
            "return 42;",
            "function f() {}",
        ] {
            let once = normalize(src).unwrap();
            let twice = normalize(&once.code).unwrap();
            assert_eq!(once.code, twice.code, "normalizing {src:?} twice diverged");
            assert!(!twice.modified || once.code.is_empty());
        }
    }

    #[test]
    fn comments_and_formatting_survive_the_splice() {
        let src = "// fetch the data\nadapters.api.getData()";
        let n = normalize(src).unwrap();
        assert_eq!(n.code, "// fetch the data\nreturn adapters.api.getData()");
    }
}
