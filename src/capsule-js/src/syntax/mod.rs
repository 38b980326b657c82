//! Source-text syntax support: tokenizer, parser and the node model.
//!
//! The dialect is the permissive script grammar the sandbox executes:
//! ordinary ECMAScript statements and expressions plus top-level `await` and
//! top-level `return`. Module syntax (`import` / `export`) is not part of the
//! snippet surface and does not parse.

pub mod ast;
mod lexer;
mod parser;

pub use ast::{Node, NodeKind, NodeType, Span};
pub use parser::parse_program;

/// A parse failure with its position in the source.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message} (line {line}, column {column})")]
pub struct ParseError {
    /// What went wrong.
    pub message: String,
    /// Byte offset of the failure.
    pub offset: u32,
    /// 1-based line.
    pub line: u32,
    /// 1-based column.
    pub column: u32,
}

impl ParseError {
    /// Build an error positioned at `offset` within `src`.
    pub fn at(src: &str, message: impl Into<String>, offset: u32) -> Self {
        let (line, column) = line_col(src, offset);
        Self {
            message: message.into(),
            offset,
            line,
            column,
        }
    }
}

/// 1-based line and column of a byte offset, computed on demand.
pub fn line_col(src: &str, offset: u32) -> (u32, u32) {
    let offset = (offset as usize).min(src.len());
    let mut line = 1u32;
    let mut column = 1u32;
    for (i, ch) in src.char_indices() {
        if i >= offset {
            break;
        }
        if ch == '\n' {
            line += 1;
            column = 1;
        } else {
            column += 1;
        }
    }
    (line, column)
}

/// Pure syntax predicate: does the snippet parse under the permissive
/// dialect?
pub fn validate(src: &str) -> Result<(), ParseError> {
    parse_program(src).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::ast::*;
    use super::*;

    fn body(src: &str) -> Vec<Node> {
        match parse_program(src).unwrap().kind {
            NodeKind::Program { body } => body,
            _ => unreachable!(),
        }
    }

    #[test]
    fn parses_expression_statement() {
        let stmts = body("adapters.api.getData()");
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].node_type(), NodeType::ExpressionStatement);
        match &stmts[0].kind {
            NodeKind::ExpressionStatement { expression } => {
                assert_eq!(expression.node_type(), NodeType::CallExpression);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn parses_top_level_await_and_return() {
        let stmts = body("return await adapters.api.get(1);");
        assert_eq!(stmts[0].node_type(), NodeType::ReturnStatement);

        let stmts = body("const x = await fetch('https://example.com');\nreturn x;");
        assert_eq!(stmts.len(), 2);
        assert_eq!(stmts[0].node_type(), NodeType::VariableDeclaration);
    }

    #[test]
    fn parses_loops_and_exits() {
        let stmts = body("while (true) { break; }");
        assert_eq!(stmts[0].node_type(), NodeType::WhileStatement);

        let stmts = body("for (const id of [1, 2]) { await adapters.api.get(id); }");
        assert_eq!(stmts[0].node_type(), NodeType::ForOfStatement);

        let stmts = body("for (;;) {}\nfor (let i = 0; i < 3; i++) {}\nfor (const k in obj) {}");
        assert_eq!(stmts[0].node_type(), NodeType::ForStatement);
        assert_eq!(stmts[1].node_type(), NodeType::ForStatement);
        assert_eq!(stmts[2].node_type(), NodeType::ForInStatement);

        let stmts = body("do { x(); } while (true)");
        assert_eq!(stmts[0].node_type(), NodeType::DoWhileStatement);
    }

    #[test]
    fn parses_functions_arrows_and_classes() {
        let stmts = body("function f(a, b = 1, ...rest) { return a; }");
        assert_eq!(stmts[0].node_type(), NodeType::FunctionDeclaration);

        let stmts = body("const f = async (x) => x * 2;");
        match &stmts[0].kind {
            NodeKind::VariableDeclaration { declarations, .. } => match &declarations[0].kind {
                NodeKind::VariableDeclarator { init, .. } => {
                    let init = init.as_ref().unwrap();
                    assert_eq!(init.node_type(), NodeType::ArrowFunctionExpression);
                    match &init.kind {
                        NodeKind::ArrowFunctionExpression { function } => {
                            assert!(function.is_async);
                            assert!(function.is_expression_body);
                        }
                        _ => unreachable!(),
                    }
                }
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }

        let stmts = body("class Point { constructor(x) { this.x = x; } get norm() { return 0; } }");
        assert_eq!(stmts[0].node_type(), NodeType::ClassDeclaration);
    }

    #[test]
    fn parses_destructuring_and_spread() {
        let stmts = body("const { a, b: { c } = {}, ...rest } = obj;");
        assert_eq!(stmts[0].node_type(), NodeType::VariableDeclaration);

        let stmts = body("const [x, , y = 2] = arr; f(...xs);");
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn parses_optional_chaining_and_nullish() {
        let stmts = body("const v = a?.b?.[0] ?? c?.(1);");
        assert_eq!(stmts[0].node_type(), NodeType::VariableDeclaration);
    }

    #[test]
    fn parses_templates_with_nested_expressions() {
        let stmts = body("`total: ${items.map((x) => x.n).join(', ')}`");
        match &stmts[0].kind {
            NodeKind::ExpressionStatement { expression } => match &expression.kind {
                NodeKind::TemplateLiteral { expressions, .. } => {
                    assert_eq!(expressions.len(), 1);
                    assert_eq!(expressions[0].node_type(), NodeType::CallExpression);
                }
                other => panic!("expected template literal, got {other:?}"),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn asi_terminates_statements_at_line_breaks() {
        let stmts = body("const a = 1\nconst b = 2\na + b");
        assert_eq!(stmts.len(), 3);

        // Restricted production: the argument moves to the next statement.
        let stmts = body("return\n1 + 2");
        match &stmts[0].kind {
            NodeKind::ReturnStatement { argument } => assert!(argument.is_none()),
            _ => unreachable!(),
        }
        assert_eq!(stmts.len(), 2);
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse_program("const = 1").is_err());
        assert!(parse_program("function (").is_err());
        assert!(parse_program("if (x {").is_err());
        assert!(parse_program("'unterminated").is_err());
    }

    #[test]
    fn object_literals_and_methods() {
        let stmts = body("x = { a: 1, b, async c() {}, get d() { return 1; }, ['e' + 1]: 2, ...r }");
        match &stmts[0].kind {
            NodeKind::ExpressionStatement { expression } => match &expression.kind {
                NodeKind::AssignmentExpression { right, .. } => match &right.kind {
                    NodeKind::ObjectExpression { properties } => {
                        assert_eq!(properties.len(), 6)
                    }
                    other => panic!("expected object literal, got {other:?}"),
                },
                _ => unreachable!(),
            },
            _ => unreachable!(),
        }
    }

    #[test]
    fn spans_slice_back_to_source() {
        let src = "const x = 1; adapters.api.call()";
        let stmts = body(src);
        let last = &stmts[1];
        assert_eq!(
            &src[last.span.start as usize..last.span.end as usize],
            "adapters.api.call()"
        );
    }

    #[test]
    fn line_col_is_one_based() {
        let src = "a\nbb\nccc";
        assert_eq!(line_col(src, 0), (1, 1));
        assert_eq!(line_col(src, 2), (2, 1));
        assert_eq!(line_col(src, 5), (3, 1));
        assert_eq!(line_col(src, 7), (3, 3));
    }
}
