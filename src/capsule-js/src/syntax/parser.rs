//! Recursive-descent parser for the permissive script dialect.
//!
//! Permissive means: top-level `await` and top-level `return` both parse, and
//! automatic semicolon insertion follows the usual rules (a statement may end
//! at a line break, `}` or end of input; `return`/`throw`/`break`/`continue`
//! and postfix `++`/`--` honor the restricted productions).
//!
//! Arrow functions are recognized by attempting an arrow parse and rewinding
//! the token cursor on failure; the token buffer makes that backtracking a
//! cursor assignment.

use super::ast::*;
use super::lexer::{Lexer, TemplateToken, Token, TokenKind};
use super::ParseError;

/// Words that may not be used as binding identifiers even in sloppy mode.
const RESERVED: &[&str] = &[
    "break", "case", "catch", "class", "const", "continue", "debugger", "default", "delete", "do",
    "else", "enum", "export", "extends", "false", "finally", "for", "function", "if", "import",
    "in", "instanceof", "new", "null", "return", "super", "switch", "this", "throw", "true", "try",
    "typeof", "var", "void", "while", "with",
];

pub struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    /// When set, a bare `in` is not treated as a binary operator (for-heads).
    no_in: bool,
}

/// Parse a full program.
pub fn parse_program(src: &str) -> Result<Node, ParseError> {
    let tokens = Lexer::new(src).tokenize()?;
    let mut parser = Parser {
        src,
        tokens,
        pos: 0,
        no_in: false,
    };
    parser.program()
}

impl<'a> Parser<'a> {
    fn cur(&self) -> &Token {
        &self.tokens[self.pos]
    }

    fn cur_start(&self) -> u32 {
        self.cur().start
    }

    fn prev_end(&self) -> u32 {
        if self.pos == 0 {
            0
        } else {
            self.tokens[self.pos - 1].end
        }
    }

    fn at_eof(&self) -> bool {
        matches!(self.cur().kind, TokenKind::Eof)
    }

    fn bump(&mut self) -> Token {
        let token = self.tokens[self.pos].clone();
        if !self.at_eof() {
            self.pos += 1;
        }
        token
    }

    fn is_punct(&self, p: &str) -> bool {
        self.cur().is_punct(p)
    }

    fn is_word(&self, w: &str) -> bool {
        self.cur().is_ident(w)
    }

    fn nth_is_punct(&self, n: usize, p: &str) -> bool {
        self.tokens.get(self.pos + n).is_some_and(|t| t.is_punct(p))
    }

    fn eat_punct(&mut self, p: &str) -> bool {
        if self.is_punct(p) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn eat_word(&mut self, w: &str) -> bool {
        if self.is_word(w) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect_punct(&mut self, p: &str) -> Result<(), ParseError> {
        if self.eat_punct(p) {
            Ok(())
        } else {
            Err(self.error(format!("Expected '{p}'")))
        }
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::at(self.src, message, self.cur_start())
    }

    /// ASI: a statement ends at `;`, or implicitly before `}` / EOF / a line
    /// break.
    fn expect_semicolon(&mut self) -> Result<(), ParseError> {
        if self.eat_punct(";") {
            return Ok(());
        }
        if self.is_punct("}") || self.at_eof() || self.cur().newline_before {
            return Ok(());
        }
        Err(self.error("Expected ';'"))
    }

    fn span_from(&self, start: u32) -> Span {
        Span::new(start, self.prev_end())
    }

    // ── Program and statements ───────────────────────────────────────────

    fn program(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        let mut body = Vec::new();
        while !self.at_eof() {
            body.push(self.statement()?);
        }
        let end = self.tokens.last().map(|t| t.end).unwrap_or(0);
        Ok(Node::new(Span::new(start, end), NodeKind::Program { body }))
    }

    fn statement(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        if self.is_punct("{") {
            return self.block_statement();
        }
        if self.is_punct(";") {
            self.bump();
            return Ok(Node::new(self.span_from(start), NodeKind::EmptyStatement));
        }

        if let TokenKind::Ident(word) = &self.cur().kind {
            match word.as_str() {
                "var" | "const" => return self.variable_statement(),
                "let" if self.let_starts_declaration() => return self.variable_statement(),
                "function" => return self.function_declaration(false),
                "async"
                    if self.tokens.get(self.pos + 1).is_some_and(|t| {
                        t.is_ident("function") && !t.newline_before
                    }) =>
                {
                    self.bump();
                    return self.function_declaration(true);
                }
                "class" => return self.class_declaration(),
                "if" => return self.if_statement(),
                "while" => return self.while_statement(),
                "do" => return self.do_while_statement(),
                "for" => return self.for_statement(),
                "switch" => return self.switch_statement(),
                "try" => return self.try_statement(),
                "return" => return self.return_statement(),
                "throw" => return self.throw_statement(),
                "break" | "continue" => return self.break_or_continue(),
                "debugger" => {
                    self.bump();
                    self.expect_semicolon()?;
                    return Ok(Node::new(self.span_from(start), NodeKind::DebuggerStatement));
                }
                _ => {
                    // Labeled statement: plain identifier followed by ':'.
                    if self.nth_is_punct(1, ":") && !RESERVED.contains(&word.as_str()) {
                        let label = word.clone();
                        self.bump();
                        self.bump();
                        let body = self.statement()?;
                        return Ok(Node::new(
                            self.span_from(start),
                            NodeKind::LabeledStatement {
                                label,
                                body: Box::new(body),
                            },
                        ));
                    }
                }
            }
        }

        let expression = self.expression()?;
        self.expect_semicolon()?;
        Ok(Node::new(
            self.span_from(start),
            NodeKind::ExpressionStatement {
                expression: Box::new(expression),
            },
        ))
    }

    /// `let` is only a declaration when followed by a binding form.
    fn let_starts_declaration(&self) -> bool {
        match self.tokens.get(self.pos + 1).map(|t| &t.kind) {
            Some(TokenKind::Ident(w)) => !RESERVED.contains(&w.as_str()),
            Some(TokenKind::Punct(p)) => matches!(*p, "[" | "{"),
            _ => false,
        }
    }

    fn block_statement(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        self.expect_punct("{")?;
        let mut body = Vec::new();
        while !self.is_punct("}") {
            if self.at_eof() {
                return Err(self.error("Expected '}'"));
            }
            body.push(self.statement()?);
        }
        self.bump();
        Ok(Node::new(self.span_from(start), NodeKind::BlockStatement { body }))
    }

    fn variable_statement(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        let node = self.variable_declaration()?;
        self.expect_semicolon()?;
        Ok(Node::new(self.span_from(start), node.kind))
    }

    /// The declaration without its terminator, reused by for-heads.
    fn variable_declaration(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        let kind = match self.bump().kind {
            TokenKind::Ident(word) => match word.as_str() {
                "var" => DeclKind::Var,
                "let" => DeclKind::Let,
                "const" => DeclKind::Const,
                _ => return Err(self.error("Expected a declaration keyword")),
            },
            _ => return Err(self.error("Expected a declaration keyword")),
        };
        let mut declarations = Vec::new();
        loop {
            let decl_start = self.cur_start();
            let id = self.binding_pattern()?;
            let init = if self.eat_punct("=") {
                Some(Box::new(self.assignment_expression()?))
            } else {
                None
            };
            declarations.push(Node::new(
                self.span_from(decl_start),
                NodeKind::VariableDeclarator {
                    id: Box::new(id),
                    init,
                },
            ));
            if !self.eat_punct(",") {
                break;
            }
        }
        Ok(Node::new(
            self.span_from(start),
            NodeKind::VariableDeclaration { kind, declarations },
        ))
    }

    fn function_declaration(&mut self, is_async: bool) -> Result<Node, ParseError> {
        let start = self.cur_start();
        let function = self.function_rest(is_async, true)?;
        Ok(Node::new(
            self.span_from(start),
            NodeKind::FunctionDeclaration { function },
        ))
    }

    /// Parses from the `function` keyword onward.
    fn function_rest(&mut self, is_async: bool, require_name: bool) -> Result<FunctionParts, ParseError> {
        if !self.eat_word("function") {
            return Err(self.error("Expected 'function'"));
        }
        let is_generator = self.eat_punct("*");
        let id = match &self.cur().kind {
            TokenKind::Ident(name) if !RESERVED.contains(&name.as_str()) => {
                let name = name.clone();
                self.bump();
                Some(name)
            }
            _ if require_name => return Err(self.error("Expected a function name")),
            _ => None,
        };
        let params = self.parameter_list()?;
        let body = self.block_statement()?;
        Ok(FunctionParts {
            id,
            params,
            body: Box::new(body),
            is_async,
            is_generator,
            is_expression_body: false,
        })
    }

    fn parameter_list(&mut self) -> Result<Vec<Node>, ParseError> {
        self.expect_punct("(")?;
        let mut params = Vec::new();
        while !self.is_punct(")") {
            if self.at_eof() {
                return Err(self.error("Expected ')'"));
            }
            params.push(self.binding_element()?);
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        Ok(params)
    }

    /// A pattern with an optional default, or a rest element.
    fn binding_element(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        if self.eat_punct("...") {
            let argument = self.binding_pattern()?;
            return Ok(Node::new(
                self.span_from(start),
                NodeKind::RestElement {
                    argument: Box::new(argument),
                },
            ));
        }
        let pattern = self.binding_pattern()?;
        if self.eat_punct("=") {
            let default = self.assignment_expression()?;
            return Ok(Node::new(
                self.span_from(start),
                NodeKind::AssignmentPattern {
                    left: Box::new(pattern),
                    right: Box::new(default),
                },
            ));
        }
        Ok(pattern)
    }

    fn binding_pattern(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        match &self.cur().kind {
            TokenKind::Ident(name) => {
                if RESERVED.contains(&name.as_str()) {
                    return Err(self.error(format!("'{name}' is a reserved word")));
                }
                let name = name.clone();
                self.bump();
                Ok(Node::new(self.span_from(start), NodeKind::Identifier { name }))
            }
            TokenKind::Punct("{") => self.object_pattern(),
            TokenKind::Punct("[") => self.array_pattern(),
            _ => Err(self.error("Expected a binding pattern")),
        }
    }

    fn object_pattern(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        self.expect_punct("{")?;
        let mut properties = Vec::new();
        while !self.is_punct("}") {
            if self.at_eof() {
                return Err(self.error("Expected '}'"));
            }
            let prop_start = self.cur_start();
            if self.eat_punct("...") {
                let argument = self.binding_pattern()?;
                properties.push(Node::new(
                    self.span_from(prop_start),
                    NodeKind::RestElement {
                        argument: Box::new(argument),
                    },
                ));
            } else {
                let (key, computed) = self.property_key()?;
                if self.eat_punct(":") {
                    let value = self.binding_element_value()?;
                    properties.push(Node::new(
                        self.span_from(prop_start),
                        NodeKind::Property {
                            key: Box::new(key),
                            value: Box::new(value),
                            computed,
                            shorthand: false,
                            kind: PropertyKind::Init,
                        },
                    ));
                } else {
                    // Shorthand, optionally with a default.
                    let value = if self.eat_punct("=") {
                        let default = self.assignment_expression()?;
                        Node::new(
                            self.span_from(prop_start),
                            NodeKind::AssignmentPattern {
                                left: Box::new(key.clone()),
                                right: Box::new(default),
                            },
                        )
                    } else {
                        key.clone()
                    };
                    properties.push(Node::new(
                        self.span_from(prop_start),
                        NodeKind::Property {
                            key: Box::new(key),
                            value: Box::new(value),
                            computed: false,
                            shorthand: true,
                            kind: PropertyKind::Init,
                        },
                    ));
                }
            }
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct("}")?;
        Ok(Node::new(self.span_from(start), NodeKind::ObjectPattern { properties }))
    }

    /// A pattern value position inside an object pattern: pattern plus
    /// optional default.
    fn binding_element_value(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        let pattern = self.binding_pattern()?;
        if self.eat_punct("=") {
            let default = self.assignment_expression()?;
            return Ok(Node::new(
                self.span_from(start),
                NodeKind::AssignmentPattern {
                    left: Box::new(pattern),
                    right: Box::new(default),
                },
            ));
        }
        Ok(pattern)
    }

    fn array_pattern(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        self.expect_punct("[")?;
        let mut elements = Vec::new();
        while !self.is_punct("]") {
            if self.at_eof() {
                return Err(self.error("Expected ']'"));
            }
            if self.is_punct(",") {
                elements.push(None);
                self.bump();
                continue;
            }
            elements.push(Some(self.binding_element()?));
            if !self.is_punct("]") {
                self.expect_punct(",")?;
            }
        }
        self.bump();
        Ok(Node::new(self.span_from(start), NodeKind::ArrayPattern { elements }))
    }

    fn class_declaration(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        let class = self.class_rest()?;
        Ok(Node::new(self.span_from(start), NodeKind::ClassDeclaration { class }))
    }

    fn class_rest(&mut self) -> Result<ClassParts, ParseError> {
        if !self.eat_word("class") {
            return Err(self.error("Expected 'class'"));
        }
        let id = match &self.cur().kind {
            TokenKind::Ident(name)
                if !RESERVED.contains(&name.as_str()) && !self.is_word("extends") =>
            {
                let name = name.clone();
                self.bump();
                Some(name)
            }
            _ => None,
        };
        let super_class = if self.eat_word("extends") {
            Some(Box::new(self.unary_expression()?))
        } else {
            None
        };
        self.expect_punct("{")?;
        let mut body = Vec::new();
        while !self.is_punct("}") {
            if self.at_eof() {
                return Err(self.error("Expected '}'"));
            }
            if self.eat_punct(";") {
                continue;
            }
            body.push(self.class_member()?);
        }
        self.bump();
        Ok(ClassParts {
            id,
            super_class,
            body,
        })
    }

    fn class_member(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        let mut is_static = false;
        if self.is_word("static") && !self.nth_is_punct(1, "(") && !self.nth_is_punct(1, "=") {
            is_static = true;
            self.bump();
        }

        let mut is_async = false;
        let mut is_generator = false;
        let mut accessor = None;
        if self.is_word("async") && !self.nth_is_punct(1, "(") && !self.nth_is_punct(1, "=") {
            is_async = true;
            self.bump();
        }
        if self.eat_punct("*") {
            is_generator = true;
        }
        if !is_async && !is_generator {
            for kind in ["get", "set"] {
                if self.is_word(kind) && !self.nth_is_punct(1, "(") && !self.nth_is_punct(1, "=") {
                    accessor = Some(kind);
                    self.bump();
                    break;
                }
            }
        }

        let (key, computed) = self.property_key()?;

        if self.is_punct("(") {
            let params = self.parameter_list()?;
            let body = self.block_statement()?;
            let value_span = body.span;
            let function = FunctionParts {
                id: None,
                params,
                body: Box::new(body),
                is_async,
                is_generator,
                is_expression_body: false,
            };
            let kind = match accessor {
                Some("get") => MethodKind::Get,
                Some("set") => MethodKind::Set,
                _ if key.identifier_name() == Some("constructor") => MethodKind::Constructor,
                _ => MethodKind::Method,
            };
            return Ok(Node::new(
                self.span_from(start),
                NodeKind::MethodDefinition {
                    key: Box::new(key),
                    value: Box::new(Node::new(value_span, NodeKind::FunctionExpression { function })),
                    kind,
                    is_static,
                    computed,
                },
            ));
        }

        // Field definition.
        let value = if self.eat_punct("=") {
            Some(Box::new(self.assignment_expression()?))
        } else {
            None
        };
        self.expect_semicolon()?;
        Ok(Node::new(
            self.span_from(start),
            NodeKind::PropertyDefinition {
                key: Box::new(key),
                value,
                is_static,
                computed,
            },
        ))
    }

    /// Property key: identifier, string, number or computed `[expr]`.
    fn property_key(&mut self) -> Result<(Node, bool), ParseError> {
        let start = self.cur_start();
        match self.cur().kind.clone() {
            TokenKind::Ident(name) => {
                self.bump();
                Ok((
                    Node::new(self.span_from(start), NodeKind::Identifier { name }),
                    false,
                ))
            }
            TokenKind::Str(value) => {
                self.bump();
                Ok((
                    Node::new(
                        self.span_from(start),
                        NodeKind::Literal {
                            value: LiteralValue::String(value),
                        },
                    ),
                    false,
                ))
            }
            TokenKind::Num(value) => {
                self.bump();
                Ok((
                    Node::new(
                        self.span_from(start),
                        NodeKind::Literal {
                            value: LiteralValue::Number(value),
                        },
                    ),
                    false,
                ))
            }
            TokenKind::Punct("[") => {
                self.bump();
                let key = self.assignment_expression()?;
                self.expect_punct("]")?;
                Ok((key, true))
            }
            _ => Err(self.error("Expected a property name")),
        }
    }

    fn if_statement(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        self.bump(); // if
        self.expect_punct("(")?;
        let test = self.expression()?;
        self.expect_punct(")")?;
        let consequent = self.statement()?;
        let alternate = if self.eat_word("else") {
            Some(Box::new(self.statement()?))
        } else {
            None
        };
        Ok(Node::new(
            self.span_from(start),
            NodeKind::IfStatement {
                test: Box::new(test),
                consequent: Box::new(consequent),
                alternate,
            },
        ))
    }

    fn while_statement(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        self.bump(); // while
        self.expect_punct("(")?;
        let test = self.expression()?;
        self.expect_punct(")")?;
        let body = self.statement()?;
        Ok(Node::new(
            self.span_from(start),
            NodeKind::WhileStatement {
                test: Box::new(test),
                body: Box::new(body),
            },
        ))
    }

    fn do_while_statement(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        self.bump(); // do
        let body = self.statement()?;
        if !self.eat_word("while") {
            return Err(self.error("Expected 'while'"));
        }
        self.expect_punct("(")?;
        let test = self.expression()?;
        self.expect_punct(")")?;
        self.eat_punct(";");
        Ok(Node::new(
            self.span_from(start),
            NodeKind::DoWhileStatement {
                body: Box::new(body),
                test: Box::new(test),
            },
        ))
    }

    fn for_statement(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        self.bump(); // for
        let is_await = self.eat_word("await");
        self.expect_punct("(")?;

        // Empty init.
        if self.eat_punct(";") {
            return self.for_classic(start, None);
        }

        let is_decl = self.is_word("var")
            || self.is_word("const")
            || (self.is_word("let") && self.let_starts_declaration());

        let left = if is_decl {
            let prev_no_in = std::mem::replace(&mut self.no_in, true);
            let decl = self.variable_declaration();
            self.no_in = prev_no_in;
            decl?
        } else {
            let prev_no_in = std::mem::replace(&mut self.no_in, true);
            let expr = self.expression();
            self.no_in = prev_no_in;
            expr?
        };

        if self.eat_word("in") {
            let right = self.expression()?;
            self.expect_punct(")")?;
            let body = self.statement()?;
            return Ok(Node::new(
                self.span_from(start),
                NodeKind::ForInStatement {
                    left: Box::new(left),
                    right: Box::new(right),
                    body: Box::new(body),
                },
            ));
        }
        if self.eat_word("of") {
            let right = self.assignment_expression()?;
            self.expect_punct(")")?;
            let body = self.statement()?;
            return Ok(Node::new(
                self.span_from(start),
                NodeKind::ForOfStatement {
                    left: Box::new(left),
                    right: Box::new(right),
                    body: Box::new(body),
                    is_await,
                },
            ));
        }

        self.expect_punct(";")?;
        self.for_classic(start, Some(left))
    }

    fn for_classic(&mut self, start: u32, init: Option<Node>) -> Result<Node, ParseError> {
        let test = if self.is_punct(";") {
            None
        } else {
            Some(Box::new(self.expression()?))
        };
        self.expect_punct(";")?;
        let update = if self.is_punct(")") {
            None
        } else {
            Some(Box::new(self.expression()?))
        };
        self.expect_punct(")")?;
        let body = self.statement()?;
        Ok(Node::new(
            self.span_from(start),
            NodeKind::ForStatement {
                init: init.map(Box::new),
                test,
                update,
                body: Box::new(body),
            },
        ))
    }

    fn switch_statement(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        self.bump(); // switch
        self.expect_punct("(")?;
        let discriminant = self.expression()?;
        self.expect_punct(")")?;
        self.expect_punct("{")?;
        let mut cases = Vec::new();
        while !self.is_punct("}") {
            if self.at_eof() {
                return Err(self.error("Expected '}'"));
            }
            let case_start = self.cur_start();
            let test = if self.eat_word("case") {
                let test = self.expression()?;
                Some(Box::new(test))
            } else if self.eat_word("default") {
                None
            } else {
                return Err(self.error("Expected 'case' or 'default'"));
            };
            self.expect_punct(":")?;
            let mut consequent = Vec::new();
            while !self.is_punct("}") && !self.is_word("case") && !self.is_word("default") {
                if self.at_eof() {
                    return Err(self.error("Expected '}'"));
                }
                consequent.push(self.statement()?);
            }
            cases.push(Node::new(
                self.span_from(case_start),
                NodeKind::SwitchCase { test, consequent },
            ));
        }
        self.bump();
        Ok(Node::new(
            self.span_from(start),
            NodeKind::SwitchStatement {
                discriminant: Box::new(discriminant),
                cases,
            },
        ))
    }

    fn try_statement(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        self.bump(); // try
        let block = self.block_statement()?;
        let handler = if self.is_word("catch") {
            let handler_start = self.cur_start();
            self.bump();
            let param = if self.eat_punct("(") {
                let pattern = self.binding_pattern()?;
                self.expect_punct(")")?;
                Some(Box::new(pattern))
            } else {
                None
            };
            let body = self.block_statement()?;
            Some(Box::new(Node::new(
                self.span_from(handler_start),
                NodeKind::CatchClause {
                    param,
                    body: Box::new(body),
                },
            )))
        } else {
            None
        };
        let finalizer = if self.eat_word("finally") {
            Some(Box::new(self.block_statement()?))
        } else {
            None
        };
        if handler.is_none() && finalizer.is_none() {
            return Err(self.error("Missing catch or finally after try"));
        }
        Ok(Node::new(
            self.span_from(start),
            NodeKind::TryStatement {
                block: Box::new(block),
                handler,
                finalizer,
            },
        ))
    }

    fn return_statement(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        self.bump(); // return
        // Restricted production: a line break ends the statement.
        let argument = if self.is_punct(";")
            || self.is_punct("}")
            || self.at_eof()
            || self.cur().newline_before
        {
            None
        } else {
            Some(Box::new(self.expression()?))
        };
        self.expect_semicolon()?;
        Ok(Node::new(
            self.span_from(start),
            NodeKind::ReturnStatement { argument },
        ))
    }

    fn throw_statement(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        self.bump(); // throw
        if self.cur().newline_before {
            return Err(self.error("Illegal newline after 'throw'"));
        }
        let argument = self.expression()?;
        self.expect_semicolon()?;
        Ok(Node::new(
            self.span_from(start),
            NodeKind::ThrowStatement {
                argument: Box::new(argument),
            },
        ))
    }

    fn break_or_continue(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        let is_break = self.is_word("break");
        self.bump();
        let label = match &self.cur().kind {
            TokenKind::Ident(name)
                if !self.cur().newline_before && !RESERVED.contains(&name.as_str()) =>
            {
                let name = name.clone();
                self.bump();
                Some(name)
            }
            _ => None,
        };
        self.expect_semicolon()?;
        let kind = if is_break {
            NodeKind::BreakStatement { label }
        } else {
            NodeKind::ContinueStatement { label }
        };
        Ok(Node::new(self.span_from(start), kind))
    }

    // ── Expressions ──────────────────────────────────────────────────────

    /// Comma-sequence expression.
    fn expression(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        let first = self.assignment_expression()?;
        if !self.is_punct(",") {
            return Ok(first);
        }
        let mut expressions = vec![first];
        while self.eat_punct(",") {
            expressions.push(self.assignment_expression()?);
        }
        Ok(Node::new(
            self.span_from(start),
            NodeKind::SequenceExpression { expressions },
        ))
    }

    fn assignment_expression(&mut self) -> Result<Node, ParseError> {
        if let Some(arrow) = self.try_arrow_function()? {
            return Ok(arrow);
        }
        if self.is_word("yield") {
            return self.yield_expression();
        }

        let start = self.cur_start();
        let left = self.conditional_expression()?;

        const ASSIGN_OPS: &[&str] = &[
            "=", "+=", "-=", "*=", "/=", "%=", "**=", "<<=", ">>=", ">>>=", "&=", "|=", "^=",
            "&&=", "||=", "??=",
        ];
        let op = match &self.cur().kind {
            TokenKind::Punct(p) if ASSIGN_OPS.contains(p) => Some(*p),
            _ => None,
        };
        if let Some(operator) = op {
            self.bump();
            let right = self.assignment_expression()?;
            return Ok(Node::new(
                self.span_from(start),
                NodeKind::AssignmentExpression {
                    operator,
                    left: Box::new(left),
                    right: Box::new(right),
                },
            ));
        }
        Ok(left)
    }

    fn yield_expression(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        self.bump(); // yield
        let delegate = self.eat_punct("*");
        let argument = if self.is_punct(")")
            || self.is_punct("]")
            || self.is_punct("}")
            || self.is_punct(",")
            || self.is_punct(";")
            || self.at_eof()
            || self.cur().newline_before
        {
            None
        } else {
            Some(Box::new(self.assignment_expression()?))
        };
        Ok(Node::new(
            self.span_from(start),
            NodeKind::YieldExpression { argument, delegate },
        ))
    }

    /// Attempt an arrow function; rewind on failure.
    fn try_arrow_function(&mut self) -> Result<Option<Node>, ParseError> {
        let could_start = matches!(&self.cur().kind, TokenKind::Ident(_) | TokenKind::Punct("("));
        if !could_start {
            return Ok(None);
        }
        let save = self.pos;
        match self.arrow_function() {
            Ok(node) => Ok(Some(node)),
            Err(_) => {
                self.pos = save;
                Ok(None)
            }
        }
    }

    fn arrow_function(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        let mut is_async = false;
        if self.is_word("async")
            && self
                .tokens
                .get(self.pos + 1)
                .is_some_and(|t| !t.newline_before && (matches!(&t.kind, TokenKind::Ident(w) if !RESERVED.contains(&w.as_str())) || t.is_punct("(")))
        {
            is_async = true;
            self.bump();
        }

        let params = match &self.cur().kind {
            TokenKind::Ident(name) if !RESERVED.contains(&name.as_str()) => {
                let param_start = self.cur_start();
                let name = name.clone();
                self.bump();
                vec![Node::new(
                    self.span_from(param_start),
                    NodeKind::Identifier { name },
                )]
            }
            TokenKind::Punct("(") => self.parameter_list()?,
            _ => return Err(self.error("Expected arrow parameters")),
        };

        // The arrow must be on the same line as the parameter list.
        if self.cur().newline_before || !self.eat_punct("=>") {
            return Err(self.error("Expected '=>'"));
        }

        let (body, is_expression_body) = if self.is_punct("{") {
            (self.block_statement()?, false)
        } else {
            (self.assignment_expression()?, true)
        };
        let function = FunctionParts {
            id: None,
            params,
            body: Box::new(body),
            is_async,
            is_generator: false,
            is_expression_body,
        };
        Ok(Node::new(
            self.span_from(start),
            NodeKind::ArrowFunctionExpression { function },
        ))
    }

    fn conditional_expression(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        let test = self.binary_expression(0)?;
        if !self.eat_punct("?") {
            return Ok(test);
        }
        let consequent = self.assignment_expression()?;
        self.expect_punct(":")?;
        let alternate = self.assignment_expression()?;
        Ok(Node::new(
            self.span_from(start),
            NodeKind::ConditionalExpression {
                test: Box::new(test),
                consequent: Box::new(consequent),
                alternate: Box::new(alternate),
            },
        ))
    }

    /// Binary operator of the current token: (precedence, logical?, op).
    fn current_binary_op(&self) -> Option<(u8, Option<LogicalOp>, Option<BinaryOp>)> {
        match &self.cur().kind {
            TokenKind::Punct(p) => {
                let entry = match *p {
                    "??" => (1, Some(LogicalOp::Nullish), None),
                    "||" => (2, Some(LogicalOp::Or), None),
                    "&&" => (3, Some(LogicalOp::And), None),
                    "|" => (4, None, Some(BinaryOp::BitOr)),
                    "^" => (5, None, Some(BinaryOp::BitXor)),
                    "&" => (6, None, Some(BinaryOp::BitAnd)),
                    "==" => (7, None, Some(BinaryOp::Eq)),
                    "!=" => (7, None, Some(BinaryOp::NotEq)),
                    "===" => (7, None, Some(BinaryOp::StrictEq)),
                    "!==" => (7, None, Some(BinaryOp::StrictNotEq)),
                    "<" => (8, None, Some(BinaryOp::Lt)),
                    "<=" => (8, None, Some(BinaryOp::LtEq)),
                    ">" => (8, None, Some(BinaryOp::Gt)),
                    ">=" => (8, None, Some(BinaryOp::GtEq)),
                    "<<" => (9, None, Some(BinaryOp::Shl)),
                    ">>" => (9, None, Some(BinaryOp::Shr)),
                    ">>>" => (9, None, Some(BinaryOp::UShr)),
                    "+" => (10, None, Some(BinaryOp::Add)),
                    "-" => (10, None, Some(BinaryOp::Sub)),
                    "*" => (11, None, Some(BinaryOp::Mul)),
                    "/" => (11, None, Some(BinaryOp::Div)),
                    "%" => (11, None, Some(BinaryOp::Mod)),
                    "**" => (12, None, Some(BinaryOp::Exp)),
                    _ => return None,
                };
                Some(entry)
            }
            TokenKind::Ident(w) if w == "instanceof" => Some((8, None, Some(BinaryOp::Instanceof))),
            TokenKind::Ident(w) if w == "in" && !self.no_in => Some((8, None, Some(BinaryOp::In))),
            _ => None,
        }
    }

    fn binary_expression(&mut self, min_prec: u8) -> Result<Node, ParseError> {
        let start = self.cur_start();
        let mut left = self.unary_expression()?;
        while let Some((prec, logical, binary)) = self.current_binary_op() {
            if prec < min_prec {
                break;
            }
            self.bump();
            // `**` is right-associative; everything else is left-associative.
            let next_min = if binary == Some(BinaryOp::Exp) { prec } else { prec + 1 };
            let right = self.binary_expression(next_min)?;
            let kind = if let Some(op) = logical {
                NodeKind::LogicalExpression {
                    operator: op,
                    left: Box::new(left),
                    right: Box::new(right),
                }
            } else {
                NodeKind::BinaryExpression {
                    operator: binary.expect("operator table entry"),
                    left: Box::new(left),
                    right: Box::new(right),
                }
            };
            left = Node::new(self.span_from(start), kind);
        }
        Ok(left)
    }

    fn unary_expression(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        let unary = match &self.cur().kind {
            TokenKind::Punct("!") => Some(UnaryOp::Not),
            TokenKind::Punct("~") => Some(UnaryOp::BitNot),
            TokenKind::Punct("+") => Some(UnaryOp::Plus),
            TokenKind::Punct("-") => Some(UnaryOp::Minus),
            TokenKind::Ident(w) if w == "typeof" => Some(UnaryOp::Typeof),
            TokenKind::Ident(w) if w == "void" => Some(UnaryOp::Void),
            TokenKind::Ident(w) if w == "delete" => Some(UnaryOp::Delete),
            _ => None,
        };
        if let Some(operator) = unary {
            self.bump();
            let argument = self.unary_expression()?;
            return Ok(Node::new(
                self.span_from(start),
                NodeKind::UnaryExpression {
                    operator,
                    argument: Box::new(argument),
                },
            ));
        }
        if self.is_punct("++") || self.is_punct("--") {
            let operator = if self.is_punct("++") {
                UpdateOp::Increment
            } else {
                UpdateOp::Decrement
            };
            self.bump();
            let argument = self.unary_expression()?;
            return Ok(Node::new(
                self.span_from(start),
                NodeKind::UpdateExpression {
                    operator,
                    prefix: true,
                    argument: Box::new(argument),
                },
            ));
        }
        if self.is_word("await") && self.await_is_operator() {
            self.bump();
            let argument = self.unary_expression()?;
            return Ok(Node::new(
                self.span_from(start),
                NodeKind::AwaitExpression {
                    argument: Box::new(argument),
                },
            ));
        }
        self.postfix_expression()
    }

    /// `await` acts as an operator when an expression can follow it.
    fn await_is_operator(&self) -> bool {
        match self.tokens.get(self.pos + 1).map(|t| &t.kind) {
            Some(TokenKind::Ident(w)) => !matches!(
                w.as_str(),
                "in" | "instanceof" | "of"
            ),
            Some(TokenKind::Punct(p)) => {
                matches!(*p, "(" | "[" | "{" | "!" | "~" | "+" | "-" | "++" | "--" | "...")
            }
            Some(TokenKind::Num(_))
            | Some(TokenKind::BigInt(_))
            | Some(TokenKind::Str(_))
            | Some(TokenKind::Template(_))
            | Some(TokenKind::Regex { .. }) => true,
            _ => false,
        }
    }

    fn postfix_expression(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        let argument = self.call_member_expression()?;
        // Restricted production: no line break before postfix ++/--.
        if (self.is_punct("++") || self.is_punct("--")) && !self.cur().newline_before {
            let operator = if self.is_punct("++") {
                UpdateOp::Increment
            } else {
                UpdateOp::Decrement
            };
            self.bump();
            return Ok(Node::new(
                self.span_from(start),
                NodeKind::UpdateExpression {
                    operator,
                    prefix: false,
                    argument: Box::new(argument),
                },
            ));
        }
        Ok(argument)
    }

    fn call_member_expression(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        let base = if self.is_word("new") {
            self.new_expression()?
        } else {
            self.primary_expression()?
        };
        self.member_call_suffixes(start, base, true)
    }

    fn new_expression(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        self.bump(); // new
        // Nested `new new X()` binds innermost-first.
        let callee_start = self.cur_start();
        let callee_base = if self.is_word("new") {
            self.new_expression()?
        } else {
            self.primary_expression()?
        };
        let callee = self.member_call_suffixes(callee_start, callee_base, false)?;
        let arguments = if self.is_punct("(") {
            self.argument_list()?
        } else {
            Vec::new()
        };
        let node = Node::new(
            self.span_from(start),
            NodeKind::NewExpression {
                callee: Box::new(callee),
                arguments,
            },
        );
        Ok(node)
    }

    fn argument_list(&mut self) -> Result<Vec<Node>, ParseError> {
        self.expect_punct("(")?;
        let mut arguments = Vec::new();
        while !self.is_punct(")") {
            if self.at_eof() {
                return Err(self.error("Expected ')'"));
            }
            let arg_start = self.cur_start();
            if self.eat_punct("...") {
                let argument = self.assignment_expression()?;
                arguments.push(Node::new(
                    self.span_from(arg_start),
                    NodeKind::SpreadElement {
                        argument: Box::new(argument),
                    },
                ));
            } else {
                arguments.push(self.assignment_expression()?);
            }
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct(")")?;
        Ok(arguments)
    }

    fn member_call_suffixes(
        &mut self,
        start: u32,
        mut node: Node,
        allow_call: bool,
    ) -> Result<Node, ParseError> {
        loop {
            if self.eat_punct(".") {
                let property = self.member_property_name()?;
                node = Node::new(
                    self.span_from(start),
                    NodeKind::MemberExpression {
                        object: Box::new(node),
                        property: Box::new(property),
                        computed: false,
                        optional: false,
                    },
                );
            } else if self.is_punct("?.") {
                self.bump();
                if self.is_punct("(") {
                    if !allow_call {
                        return Err(self.error("Unexpected optional call"));
                    }
                    let arguments = self.argument_list()?;
                    node = Node::new(
                        self.span_from(start),
                        NodeKind::CallExpression {
                            callee: Box::new(node),
                            arguments,
                            optional: true,
                        },
                    );
                } else if self.eat_punct("[") {
                    let property = self.expression()?;
                    self.expect_punct("]")?;
                    node = Node::new(
                        self.span_from(start),
                        NodeKind::MemberExpression {
                            object: Box::new(node),
                            property: Box::new(property),
                            computed: true,
                            optional: true,
                        },
                    );
                } else {
                    let property = self.member_property_name()?;
                    node = Node::new(
                        self.span_from(start),
                        NodeKind::MemberExpression {
                            object: Box::new(node),
                            property: Box::new(property),
                            computed: false,
                            optional: true,
                        },
                    );
                }
            } else if self.eat_punct("[") {
                let property = self.expression()?;
                self.expect_punct("]")?;
                node = Node::new(
                    self.span_from(start),
                    NodeKind::MemberExpression {
                        object: Box::new(node),
                        property: Box::new(property),
                        computed: true,
                        optional: false,
                    },
                );
            } else if allow_call && self.is_punct("(") {
                let arguments = self.argument_list()?;
                node = Node::new(
                    self.span_from(start),
                    NodeKind::CallExpression {
                        callee: Box::new(node),
                        arguments,
                        optional: false,
                    },
                );
            } else if matches!(self.cur().kind, TokenKind::Template(_)) {
                let quasi = self.template_literal()?;
                node = Node::new(
                    self.span_from(start),
                    NodeKind::TaggedTemplateExpression {
                        tag: Box::new(node),
                        quasi: Box::new(quasi),
                    },
                );
            } else {
                return Ok(node);
            }
        }
    }

    /// A member name after `.` — any word is allowed, including keywords.
    fn member_property_name(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        match self.cur().kind.clone() {
            TokenKind::Ident(name) => {
                self.bump();
                Ok(Node::new(self.span_from(start), NodeKind::Identifier { name }))
            }
            _ => Err(self.error("Expected a property name")),
        }
    }

    fn template_literal(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        let token = self.bump();
        let TokenKind::Template(TemplateToken { quasis, expr_spans }) = token.kind else {
            return Err(self.error("Expected a template literal"));
        };
        let mut expressions = Vec::new();
        for (expr_start, expr_end) in expr_spans {
            expressions.push(parse_subexpression(self.src, expr_start, expr_end)?);
        }
        Ok(Node::new(
            self.span_from(start),
            NodeKind::TemplateLiteral {
                quasis,
                expressions,
            },
        ))
    }

    fn primary_expression(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        match self.cur().kind.clone() {
            TokenKind::Num(value) => {
                self.bump();
                Ok(Node::new(
                    self.span_from(start),
                    NodeKind::Literal {
                        value: LiteralValue::Number(value),
                    },
                ))
            }
            TokenKind::BigInt(digits) => {
                self.bump();
                Ok(Node::new(
                    self.span_from(start),
                    NodeKind::Literal {
                        value: LiteralValue::BigInt(digits),
                    },
                ))
            }
            TokenKind::Str(value) => {
                self.bump();
                Ok(Node::new(
                    self.span_from(start),
                    NodeKind::Literal {
                        value: LiteralValue::String(value),
                    },
                ))
            }
            TokenKind::Regex { pattern, flags } => {
                self.bump();
                Ok(Node::new(
                    self.span_from(start),
                    NodeKind::Literal {
                        value: LiteralValue::Regex { pattern, flags },
                    },
                ))
            }
            TokenKind::Template(_) => self.template_literal(),
            TokenKind::Punct("(") => {
                self.bump();
                let expression = self.expression()?;
                self.expect_punct(")")?;
                Ok(expression)
            }
            TokenKind::Punct("[") => self.array_expression(),
            TokenKind::Punct("{") => self.object_expression(),
            TokenKind::Ident(word) => match word.as_str() {
                "true" | "false" => {
                    self.bump();
                    Ok(Node::new(
                        self.span_from(start),
                        NodeKind::Literal {
                            value: LiteralValue::Boolean(word == "true"),
                        },
                    ))
                }
                "null" => {
                    self.bump();
                    Ok(Node::new(
                        self.span_from(start),
                        NodeKind::Literal {
                            value: LiteralValue::Null,
                        },
                    ))
                }
                "this" => {
                    self.bump();
                    Ok(Node::new(self.span_from(start), NodeKind::ThisExpression))
                }
                "super" => {
                    self.bump();
                    Ok(Node::new(self.span_from(start), NodeKind::SuperExpression))
                }
                "function" => {
                    let function = self.function_rest(false, false)?;
                    Ok(Node::new(
                        self.span_from(start),
                        NodeKind::FunctionExpression { function },
                    ))
                }
                "async"
                    if self.tokens.get(self.pos + 1).is_some_and(|t| {
                        t.is_ident("function") && !t.newline_before
                    }) =>
                {
                    self.bump();
                    let function = self.function_rest(true, false)?;
                    Ok(Node::new(
                        self.span_from(start),
                        NodeKind::FunctionExpression { function },
                    ))
                }
                "class" => {
                    let class = self.class_rest()?;
                    Ok(Node::new(
                        self.span_from(start),
                        NodeKind::ClassExpression { class },
                    ))
                }
                _ => {
                    self.bump();
                    Ok(Node::new(
                        self.span_from(start),
                        NodeKind::Identifier { name: word },
                    ))
                }
            },
            TokenKind::Punct(p) => Err(self.error(format!("Unexpected token '{p}'"))),
            TokenKind::Eof => Err(self.error("Unexpected end of input")),
        }
    }

    fn array_expression(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        self.expect_punct("[")?;
        let mut elements = Vec::new();
        while !self.is_punct("]") {
            if self.at_eof() {
                return Err(self.error("Expected ']'"));
            }
            if self.is_punct(",") {
                elements.push(None);
                self.bump();
                continue;
            }
            let elem_start = self.cur_start();
            if self.eat_punct("...") {
                let argument = self.assignment_expression()?;
                elements.push(Some(Node::new(
                    self.span_from(elem_start),
                    NodeKind::SpreadElement {
                        argument: Box::new(argument),
                    },
                )));
            } else {
                elements.push(Some(self.assignment_expression()?));
            }
            if !self.is_punct("]") {
                self.expect_punct(",")?;
            }
        }
        self.bump();
        Ok(Node::new(
            self.span_from(start),
            NodeKind::ArrayExpression { elements },
        ))
    }

    fn object_expression(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        self.expect_punct("{")?;
        let mut properties = Vec::new();
        while !self.is_punct("}") {
            if self.at_eof() {
                return Err(self.error("Expected '}'"));
            }
            properties.push(self.object_property()?);
            if !self.eat_punct(",") {
                break;
            }
        }
        self.expect_punct("}")?;
        Ok(Node::new(
            self.span_from(start),
            NodeKind::ObjectExpression { properties },
        ))
    }

    fn object_property(&mut self) -> Result<Node, ParseError> {
        let start = self.cur_start();
        if self.eat_punct("...") {
            let argument = self.assignment_expression()?;
            return Ok(Node::new(
                self.span_from(start),
                NodeKind::SpreadElement {
                    argument: Box::new(argument),
                },
            ));
        }

        let mut is_async = false;
        let mut is_generator = false;
        let mut accessor = None;
        if self.is_word("async") && !self.next_ends_property_key() {
            is_async = true;
            self.bump();
        }
        if self.eat_punct("*") {
            is_generator = true;
        }
        if !is_async && !is_generator {
            for kind in ["get", "set"] {
                if self.is_word(kind) && !self.next_ends_property_key() {
                    accessor = Some(kind);
                    self.bump();
                    break;
                }
            }
        }

        let (key, computed) = self.property_key()?;

        if self.is_punct("(") {
            // Shorthand method.
            let params = self.parameter_list()?;
            let body = self.block_statement()?;
            let value_span = body.span;
            let function = FunctionParts {
                id: None,
                params,
                body: Box::new(body),
                is_async,
                is_generator,
                is_expression_body: false,
            };
            let kind = match accessor {
                Some("get") => PropertyKind::Get,
                Some("set") => PropertyKind::Set,
                _ => PropertyKind::Init,
            };
            return Ok(Node::new(
                self.span_from(start),
                NodeKind::Property {
                    key: Box::new(key),
                    value: Box::new(Node::new(value_span, NodeKind::FunctionExpression { function })),
                    computed,
                    shorthand: false,
                    kind,
                },
            ));
        }

        if self.eat_punct(":") {
            let value = self.assignment_expression()?;
            return Ok(Node::new(
                self.span_from(start),
                NodeKind::Property {
                    key: Box::new(key),
                    value: Box::new(value),
                    computed,
                    shorthand: false,
                    kind: PropertyKind::Init,
                },
            ));
        }

        // Shorthand `{ a }` (with cover-grammar tolerance for `{ a = 1 }`).
        let value = if self.eat_punct("=") {
            let default = self.assignment_expression()?;
            Node::new(
                self.span_from(start),
                NodeKind::AssignmentPattern {
                    left: Box::new(key.clone()),
                    right: Box::new(default),
                },
            )
        } else {
            key.clone()
        };
        Ok(Node::new(
            self.span_from(start),
            NodeKind::Property {
                key: Box::new(key),
                value: Box::new(value),
                computed: false,
                shorthand: true,
                kind: PropertyKind::Init,
            },
        ))
    }

    /// After `async`/`get`/`set`, these tokens mean the word itself was the
    /// property key.
    fn next_ends_property_key(&self) -> bool {
        self.nth_is_punct(1, ":")
            || self.nth_is_punct(1, "(")
            || self.nth_is_punct(1, ",")
            || self.nth_is_punct(1, "}")
            || self.nth_is_punct(1, "=")
    }
}

/// Parse an embedded expression slice (template hole) with spans kept
/// relative to the enclosing source.
fn parse_subexpression(src: &str, start: u32, end: u32) -> Result<Node, ParseError> {
    let slice = &src[start as usize..end as usize];
    let mut tokens = Lexer::new(slice)
        .tokenize()
        .map_err(|e| ParseError::at(src, e.message, e.offset + start))?;
    for token in &mut tokens {
        token.start += start;
        token.end += start;
        // Nested template holes carry slice-relative spans of their own.
        if let TokenKind::Template(template) = &mut token.kind {
            for (expr_start, expr_end) in &mut template.expr_spans {
                *expr_start += start;
                *expr_end += start;
            }
        }
    }
    let mut parser = Parser {
        src,
        tokens,
        pos: 0,
        no_in: false,
    };
    let expression = parser.expression()?;
    if !parser.at_eof() {
        return Err(parser.error("Unexpected token in template expression"));
    }
    Ok(expression)
}
