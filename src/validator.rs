//! Structural checks run on a submission before any sandbox is spent on it.
//!
//! The scan is lexical only: it tracks string, template, regular-expression
//! and comment literals well enough to know which brackets are real, and
//! reports the first structural problem with its line and column. Anything
//! subtler is left for the runtime to report as a fault.

use thiserror::Error;

const RESERVED_WORDS: &[&str] = &[
    "await", "break", "case", "catch", "class", "const", "continue", "debugger", "default",
    "delete", "do", "else", "enum", "export", "extends", "false", "finally", "for", "function",
    "if", "implements", "import", "in", "instanceof", "interface", "let", "new", "null",
    "package", "private", "protected", "public", "return", "static", "super", "switch", "this",
    "throw", "true", "try", "typeof", "var", "void", "while", "with", "yield",
];

/// Keywords after which a `/` starts a regular expression rather than a division
const EXPRESSION_KEYWORDS: &[&str] = &[
    "return", "typeof", "instanceof", "in", "of", "new", "delete", "void", "throw", "case", "do",
    "else", "yield", "await",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Source code is empty")]
    Empty,
    #[error("Source code is {size} bytes, the limit is {limit} bytes")]
    TooLarge { size: usize, limit: usize },
    #[error("Entry point `{0}` is not a valid function name")]
    InvalidEntryPoint(String),
    #[error("SyntaxError: {message} (line {line}, column {column})")]
    Syntax {
        message: String,
        line: usize,
        column: usize,
    },
}

#[derive(Debug, Clone)]
pub struct Validator {
    max_source_bytes: usize,
}

impl Validator {
    pub fn new(max_source_bytes: usize) -> Self {
        Self { max_source_bytes }
    }

    pub fn validate(&self, source: &str, entry_point: &str) -> Result<(), ValidationError> {
        if source.trim().is_empty() {
            return Err(ValidationError::Empty);
        }
        if source.len() > self.max_source_bytes {
            return Err(ValidationError::TooLarge {
                size: source.len(),
                limit: self.max_source_bytes,
            });
        }
        if !is_identifier(entry_point) {
            return Err(ValidationError::InvalidEntryPoint(entry_point.to_string()));
        }
        Scanner::new(source).run()
    }
}

/// Whether `name` can be spliced into a script as a bare identifier
pub fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    let head_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_' || c == '$');
    head_ok
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        && !RESERVED_WORDS.contains(&name)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Opener {
    Paren,
    Bracket,
    Brace,
    /// `${` inside a template literal
    Substitution,
}

impl Opener {
    fn symbol(self) -> &'static str {
        match self {
            Opener::Paren => "(",
            Opener::Bracket => "[",
            Opener::Brace => "{",
            Opener::Substitution => "${",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Open {
    opener: Opener,
    line: usize,
    column: usize,
}

/// What the previous significant token was, to tell `/` apart from a regex
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Prev {
    Operand,
    Operator,
}

enum TemplateEnd {
    Closed,
    Substitution,
}

struct Scanner {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    column: usize,
    stack: Vec<Open>,
    prev: Prev,
}

impl Scanner {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            stack: Vec::new(),
            prev: Prev::Operator,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_next(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn error(message: impl Into<String>, line: usize, column: usize) -> ValidationError {
        ValidationError::Syntax {
            message: message.into(),
            line,
            column,
        }
    }

    fn run(mut self) -> Result<(), ValidationError> {
        if self.peek() == Some('#') && self.peek_next() == Some('!') {
            self.skip_line();
        }

        while let Some(c) = self.peek() {
            let (line, column) = (self.line, self.column);
            match c {
                _ if c.is_whitespace() => {
                    self.bump();
                }
                '/' if self.peek_next() == Some('/') => self.skip_line(),
                '/' if self.peek_next() == Some('*') => self.skip_block_comment(line, column)?,
                '/' if self.prev == Prev::Operator => {
                    self.bump();
                    self.skip_regex(line, column)?;
                    self.prev = Prev::Operand;
                }
                '\'' | '"' => {
                    self.bump();
                    self.skip_string(c, line, column)?;
                    self.prev = Prev::Operand;
                }
                '`' => {
                    self.bump();
                    self.continue_template(line, column)?;
                }
                '(' | '[' | '{' => {
                    self.bump();
                    let opener = match c {
                        '(' => Opener::Paren,
                        '[' => Opener::Bracket,
                        _ => Opener::Brace,
                    };
                    self.stack.push(Open {
                        opener,
                        line,
                        column,
                    });
                    self.prev = Prev::Operator;
                }
                ')' | ']' | '}' => {
                    self.bump();
                    self.close(c, line, column)?;
                }
                _ if c.is_alphabetic() || c == '_' || c == '$' => {
                    let word = self.take_word();
                    self.prev = if EXPRESSION_KEYWORDS.contains(&word.as_str()) {
                        Prev::Operator
                    } else {
                        Prev::Operand
                    };
                }
                _ if c.is_ascii_digit() => {
                    self.take_word();
                    self.prev = Prev::Operand;
                }
                // `a++` still ends an operand, while `++a` leaves an operator pending
                '+' | '-' if self.peek_next() == Some(c) => {
                    self.bump();
                    self.bump();
                }
                _ => {
                    self.bump();
                    self.prev = Prev::Operator;
                }
            }
        }

        match self.stack.pop() {
            None => Ok(()),
            Some(open) if open.opener == Opener::Substitution => Err(Self::error(
                "Unterminated template literal",
                open.line,
                open.column,
            )),
            Some(open) => Err(Self::error(
                format!("Unclosed '{}'", open.opener.symbol()),
                open.line,
                open.column,
            )),
        }
    }

    fn close(&mut self, closer: char, line: usize, column: usize) -> Result<(), ValidationError> {
        let expected = match closer {
            ')' => Opener::Paren,
            ']' => Opener::Bracket,
            _ => Opener::Brace,
        };
        let Some(open) = self.stack.pop() else {
            return Err(Self::error(format!("Unexpected token '{closer}'"), line, column));
        };

        match (open.opener, expected) {
            (Opener::Substitution, Opener::Brace) => {
                let (line, column) = (open.line, open.column);
                self.continue_template(line, column)
            }
            (opener, expected) if opener == expected => {
                // `) / x` divides, `} /re/` usually starts a new statement
                self.prev = if closer == '}' {
                    Prev::Operator
                } else {
                    Prev::Operand
                };
                Ok(())
            }
            (opener, _) => Err(Self::error(
                format!(
                    "Mismatched '{closer}' closes '{}' opened at line {}, column {}",
                    opener.symbol(),
                    open.line,
                    open.column
                ),
                line,
                column,
            )),
        }
    }

    fn take_word(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c.is_alphanumeric() || c == '_' || c == '$' || (c == '.' && word_is_number(&word)) {
                word.push(c);
                self.bump();
            } else {
                break;
            }
        }
        word
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.bump();
        }
    }

    fn skip_block_comment(&mut self, line: usize, column: usize) -> Result<(), ValidationError> {
        self.bump();
        self.bump();
        while let Some(c) = self.bump() {
            if c == '*' && self.peek() == Some('/') {
                self.bump();
                return Ok(());
            }
        }
        Err(Self::error("Unterminated comment", line, column))
    }

    fn skip_string(&mut self, quote: char, line: usize, column: usize) -> Result<(), ValidationError> {
        while let Some(c) = self.bump() {
            match c {
                '\\' => {
                    self.bump();
                }
                '\n' => break,
                _ if c == quote => return Ok(()),
                _ => {}
            }
        }
        Err(Self::error("Unterminated string literal", line, column))
    }

    fn skip_regex(&mut self, line: usize, column: usize) -> Result<(), ValidationError> {
        let mut in_class = false;
        while let Some(c) = self.bump() {
            match c {
                '\\' => {
                    if self.peek() == Some('\n') {
                        break;
                    }
                    self.bump();
                }
                '\n' => break,
                '[' => in_class = true,
                ']' => in_class = false,
                '/' if !in_class => {
                    while self.peek().is_some_and(|f| f.is_ascii_alphabetic()) {
                        self.bump();
                    }
                    return Ok(());
                }
                _ => {}
            }
        }
        Err(Self::error("Invalid regular expression: missing /", line, column))
    }

    /// Scans template text up to its closing backtick or the next `${`
    fn continue_template(&mut self, line: usize, column: usize) -> Result<(), ValidationError> {
        match self.scan_template_text() {
            Some(TemplateEnd::Closed) => {
                self.prev = Prev::Operand;
                Ok(())
            }
            Some(TemplateEnd::Substitution) => {
                self.stack.push(Open {
                    opener: Opener::Substitution,
                    line,
                    column,
                });
                self.prev = Prev::Operator;
                Ok(())
            }
            None => Err(Self::error("Unterminated template literal", line, column)),
        }
    }

    fn scan_template_text(&mut self) -> Option<TemplateEnd> {
        while let Some(c) = self.bump() {
            match c {
                '\\' => {
                    self.bump();
                }
                '`' => return Some(TemplateEnd::Closed),
                '$' if self.peek() == Some('{') => {
                    self.bump();
                    return Some(TemplateEnd::Substitution);
                }
                _ => {}
            }
        }
        None
    }
}

fn word_is_number(word: &str) -> bool {
    word.chars().next().is_some_and(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn check(source: &str) -> Result<(), ValidationError> {
        Validator::new(64 * 1024).validate(source, "add")
    }

    fn syntax_message(source: &str) -> String {
        match check(source) {
            Err(ValidationError::Syntax { message, .. }) => message,
            other => panic!("expected a syntax error, got {other:?}"),
        }
    }

    #[test]
    fn accepts_well_formed_functions() {
        check("function add(a,b){return a+b}").unwrap();
        check("function add(a,b){throw new Error(\"boom\")}").unwrap();
        check("while(true){}").unwrap();
        check("const add = (a, b) => { const o = { x: [a, b] }; return o.x[0] + o.x[1]; };")
            .unwrap();
    }

    #[test]
    fn rejects_unbalanced_braces() {
        let err = check("function add(a,b){return a+b").unwrap_err();
        assert_eq!(
            err,
            ValidationError::Syntax {
                message: "Unclosed '{'".to_string(),
                line: 1,
                column: 18,
            }
        );
        assert_eq!(syntax_message("function add(a,b){return a+b}}"), "Unexpected token '}'");
    }

    #[test]
    fn reports_mismatched_closer_with_position() {
        let err = check("function add(a, b) {\n  return [a, b);\n}").unwrap_err();
        assert_eq!(
            err,
            ValidationError::Syntax {
                message: "Mismatched ')' closes '[' opened at line 2, column 10".to_string(),
                line: 2,
                column: 15,
            }
        );
    }

    #[test]
    fn brackets_inside_literals_and_comments_are_ignored() {
        check("function add(a,b){ const s = \"}\"; const t = '(('; return a+b } // {").unwrap();
        check("function add(a,b){ /* ) ] } */ return a+b }").unwrap();
        check("function add(a,b){ return `${a}}{${ {v: b}.v }` }").unwrap();
        check("function add(a,b){ return /[}\\/]+/.test(a) ? a / b / 2 : b }").unwrap();
        check("function add(s){ return s.replace(/\\)/g, '') }").unwrap();
    }

    #[test]
    fn rejects_unterminated_literals() {
        assert_eq!(
            syntax_message("function add(a,b){ return \"abc }"),
            "Unterminated string literal"
        );
        assert_eq!(
            syntax_message("function add(a,b){ return `abc }"),
            "Unterminated template literal"
        );
        assert_eq!(
            syntax_message("function add(a,b){ return `${a` }"),
            "Unterminated template literal"
        );
        assert_eq!(syntax_message("function add(){ /* }"), "Unterminated comment");
        assert_eq!(
            syntax_message("function add(s){ return /abc\n}"),
            "Invalid regular expression: missing /"
        );
    }

    #[test]
    fn rejects_empty_oversized_and_bad_entry_points() {
        let validator = Validator::new(16);
        assert_eq!(validator.validate("  \n", "add"), Err(ValidationError::Empty));
        assert_eq!(
            validator.validate("function add(a,b){return a+b}", "add"),
            Err(ValidationError::TooLarge { size: 29, limit: 16 })
        );
        for name in ["", "1add", "add;process.exit()", "class", "a-b"] {
            assert_eq!(
                check_entry(name),
                Err(ValidationError::InvalidEntryPoint(name.to_string()))
            );
        }
        assert!(check_entry("$add_2").is_ok());
    }

    fn check_entry(name: &str) -> Result<(), ValidationError> {
        Validator::new(1024).validate("function f(){}", name)
    }

    #[test]
    fn numbers_with_decimal_points_are_operands() {
        check("function add(a){ return 1.5 / a / 2.25 }").unwrap();
    }

    #[test]
    fn increments_keep_division_a_division() {
        check("function f(a){ let b = a++ / 2; return b }").unwrap();
        check("function f(a){ let b = a-- / 2 / 3; return b }").unwrap();
        check("function f(a){ return [a++ /2, a-- /3] }").unwrap();
        check("function f(a){ return ++a / --a }").unwrap();
        check("function f(a){ return a + /x/.source.length }").unwrap();
        check("function f(a){ return a++ + /x/.source.length }").unwrap();
    }
}
