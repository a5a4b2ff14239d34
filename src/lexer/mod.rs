use logos::Logos;

// ── Token kinds ──────────────────────────────────────────────────────
//
// `Raw` is the logos-generated matcher; `TokenKind` is what the compiler
// consumes and adds the two synthesized kinds (`Error`, `Eof`) that never
// come out of the matcher itself.

#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq)]
#[logos(skip r"[ \t\r]+")]
#[logos(skip r"\n")]
#[logos(skip r"//[^\n]*")]
enum Raw {
    #[token("(")]
    LeftParen,
    #[token(")")]
    RightParen,
    #[token("{")]
    LeftBrace,
    #[token("}")]
    RightBrace,
    #[token(",")]
    Comma,
    #[token(".")]
    Dot,
    #[token(";")]
    Semicolon,
    #[token(":")]
    Colon,

    // logos picks the longest match, so `+=` never lexes as `+` `=`.
    #[token("-")]
    Minus,
    #[token("+")]
    Plus,
    #[token("/")]
    Slash,
    #[token("*")]
    Star,
    #[token("%")]
    Percent,
    #[token("-=")]
    MinusEqual,
    #[token("+=")]
    PlusEqual,
    #[token("/=")]
    SlashEqual,
    #[token("*=")]
    StarEqual,
    #[token("%=")]
    PercentEqual,

    #[token("!")]
    Bang,
    #[token("!=")]
    BangEqual,
    #[token("=")]
    Equal,
    #[token("==")]
    EqualEqual,
    #[token(">")]
    Greater,
    #[token(">=")]
    GreaterEqual,
    #[token("<")]
    Less,
    #[token("<=")]
    LessEqual,

    #[regex(r"[A-Za-z_][A-Za-z_0-9]*", priority = 1)]
    Identifier,
    // Newlines are permitted inside string literals; no escape sequences.
    #[regex(r#""[^"]*""#)]
    String,
    #[regex(r"[0-9]+(\.[0-9]+)?")]
    Number,

    #[token("and")]
    And,
    #[token("class")]
    Class,
    #[token("else")]
    Else,
    #[token("false")]
    False,
    #[token("fun")]
    Fun,
    #[token("for")]
    For,
    #[token("if")]
    If,
    #[token("nil")]
    Nil,
    #[token("or")]
    Or,
    #[token("print")]
    Print,
    #[token("return")]
    Return,
    #[token("super")]
    Super,
    #[token("this")]
    This,
    #[token("true")]
    True,
    #[token("var")]
    Var,
    #[token("while")]
    While,
    #[token("continue")]
    Continue,
    #[token("break")]
    Break,
    #[token("case")]
    Case,
    #[token("default")]
    Default,
    #[token("switch")]
    Switch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    LeftParen,
    RightParen,
    LeftBrace,
    RightBrace,
    Comma,
    Dot,
    Semicolon,
    Colon,
    Minus,
    Plus,
    Slash,
    Star,
    Percent,
    MinusEqual,
    PlusEqual,
    SlashEqual,
    StarEqual,
    PercentEqual,
    Bang,
    BangEqual,
    Equal,
    EqualEqual,
    Greater,
    GreaterEqual,
    Less,
    LessEqual,
    Identifier,
    String,
    Number,
    And,
    Class,
    Else,
    False,
    Fun,
    For,
    If,
    Nil,
    Or,
    Print,
    Return,
    Super,
    This,
    True,
    Var,
    While,
    Continue,
    Break,
    Case,
    Default,
    Switch,
    /// Scanner failure; the token's lexeme carries the message.
    Error,
    Eof,
}

fn kind_of(raw: Raw) -> TokenKind {
    match raw {
        Raw::LeftParen => TokenKind::LeftParen,
        Raw::RightParen => TokenKind::RightParen,
        Raw::LeftBrace => TokenKind::LeftBrace,
        Raw::RightBrace => TokenKind::RightBrace,
        Raw::Comma => TokenKind::Comma,
        Raw::Dot => TokenKind::Dot,
        Raw::Semicolon => TokenKind::Semicolon,
        Raw::Colon => TokenKind::Colon,
        Raw::Minus => TokenKind::Minus,
        Raw::Plus => TokenKind::Plus,
        Raw::Slash => TokenKind::Slash,
        Raw::Star => TokenKind::Star,
        Raw::Percent => TokenKind::Percent,
        Raw::MinusEqual => TokenKind::MinusEqual,
        Raw::PlusEqual => TokenKind::PlusEqual,
        Raw::SlashEqual => TokenKind::SlashEqual,
        Raw::StarEqual => TokenKind::StarEqual,
        Raw::PercentEqual => TokenKind::PercentEqual,
        Raw::Bang => TokenKind::Bang,
        Raw::BangEqual => TokenKind::BangEqual,
        Raw::Equal => TokenKind::Equal,
        Raw::EqualEqual => TokenKind::EqualEqual,
        Raw::Greater => TokenKind::Greater,
        Raw::GreaterEqual => TokenKind::GreaterEqual,
        Raw::Less => TokenKind::Less,
        Raw::LessEqual => TokenKind::LessEqual,
        Raw::Identifier => TokenKind::Identifier,
        Raw::String => TokenKind::String,
        Raw::Number => TokenKind::Number,
        Raw::And => TokenKind::And,
        Raw::Class => TokenKind::Class,
        Raw::Else => TokenKind::Else,
        Raw::False => TokenKind::False,
        Raw::Fun => TokenKind::Fun,
        Raw::For => TokenKind::For,
        Raw::If => TokenKind::If,
        Raw::Nil => TokenKind::Nil,
        Raw::Or => TokenKind::Or,
        Raw::Print => TokenKind::Print,
        Raw::Return => TokenKind::Return,
        Raw::Super => TokenKind::Super,
        Raw::This => TokenKind::This,
        Raw::True => TokenKind::True,
        Raw::Var => TokenKind::Var,
        Raw::While => TokenKind::While,
        Raw::Continue => TokenKind::Continue,
        Raw::Break => TokenKind::Break,
        Raw::Case => TokenKind::Case,
        Raw::Default => TokenKind::Default,
        Raw::Switch => TokenKind::Switch,
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Token<'src> {
    pub kind: TokenKind,
    pub lexeme: &'src str,
    pub line: u32,
}

// ── Scanning ─────────────────────────────────────────────────────────

struct LineStarts(Vec<usize>);

impl LineStarts {
    fn new(source: &str) -> LineStarts {
        let mut starts = vec![0];
        for (i, byte) in source.bytes().enumerate() {
            if byte == b'\n' {
                starts.push(i + 1);
            }
        }
        LineStarts(starts)
    }

    fn line_of(&self, byte: usize) -> u32 {
        self.0.partition_point(|&start| start <= byte) as u32
    }
}

/// Lex the whole source. Invalid input becomes `Error` tokens whose lexeme
/// is the message; the stream always ends with a single `Eof` token.
pub fn scan(source: &str) -> Vec<Token<'_>> {
    let lines = LineStarts::new(source);
    let mut lexer = Raw::lexer(source);
    let mut tokens = Vec::new();

    while let Some(result) = lexer.next() {
        let span = lexer.span();
        let line = lines.line_of(span.start);
        match result {
            Ok(raw) => tokens.push(Token {
                kind: kind_of(raw),
                lexeme: &source[span],
                line,
            }),
            Err(()) => {
                let message = if source[span].starts_with('"') {
                    "Unterminated string."
                } else {
                    "Unexpected character."
                };
                tokens.push(Token {
                    kind: TokenKind::Error,
                    lexeme: message,
                    line,
                });
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        lexeme: "",
        line: lines.line_of(source.len().saturating_sub(1)),
    });
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        scan(source).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn scan_operators() {
        assert_eq!(
            kinds("+ - * / % ! = == != < <= > >="),
            vec![
                TokenKind::Plus,
                TokenKind::Minus,
                TokenKind::Star,
                TokenKind::Slash,
                TokenKind::Percent,
                TokenKind::Bang,
                TokenKind::Equal,
                TokenKind::EqualEqual,
                TokenKind::BangEqual,
                TokenKind::Less,
                TokenKind::LessEqual,
                TokenKind::Greater,
                TokenKind::GreaterEqual,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scan_compound_assignment_greedily() {
        assert_eq!(
            kinds("+= -= *= /= %="),
            vec![
                TokenKind::PlusEqual,
                TokenKind::MinusEqual,
                TokenKind::StarEqual,
                TokenKind::SlashEqual,
                TokenKind::PercentEqual,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn keywords_beat_identifiers() {
        assert_eq!(
            kinds("var x while switchy"),
            vec![
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::While,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn scan_switch_family_keywords() {
        assert_eq!(
            kinds("switch case default break continue"),
            vec![
                TokenKind::Switch,
                TokenKind::Case,
                TokenKind::Default,
                TokenKind::Break,
                TokenKind::Continue,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn numbers_with_optional_fraction() {
        let tokens = scan("42 3.25 1.");
        assert_eq!(tokens[0].kind, TokenKind::Number);
        assert_eq!(tokens[0].lexeme, "42");
        assert_eq!(tokens[1].lexeme, "3.25");
        // "1." is a number then a dot.
        assert_eq!(tokens[2].kind, TokenKind::Number);
        assert_eq!(tokens[2].lexeme, "1");
        assert_eq!(tokens[3].kind, TokenKind::Dot);
    }

    #[test]
    fn strings_keep_content_and_may_span_lines() {
        let tokens = scan("\"hello\nworld\" x");
        assert_eq!(tokens[0].kind, TokenKind::String);
        assert_eq!(tokens[0].lexeme, "\"hello\nworld\"");
        assert_eq!(tokens[0].line, 1);
        // Identifier after the closing quote sits on line 2.
        assert_eq!(tokens[1].kind, TokenKind::Identifier);
        assert_eq!(tokens[1].line, 2);
    }

    #[test]
    fn comments_and_whitespace_are_skipped() {
        assert_eq!(
            kinds("// a comment\nprint 1; // tail"),
            vec![
                TokenKind::Print,
                TokenKind::Number,
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn line_numbers_advance_per_newline() {
        let tokens = scan("a\nb\n\nc");
        assert_eq!(tokens[0].line, 1);
        assert_eq!(tokens[1].line, 2);
        assert_eq!(tokens[2].line, 4);
    }

    #[test]
    fn unexpected_character_becomes_error_token() {
        let tokens = scan("$");
        assert_eq!(tokens[0].kind, TokenKind::Error);
        assert_eq!(tokens[0].lexeme, "Unexpected character.");
    }

    #[test]
    fn unterminated_string_becomes_error_token() {
        let tokens = scan("\"abc");
        assert_eq!(tokens[0].kind, TokenKind::Error);
        assert_eq!(tokens[0].lexeme, "Unterminated string.");
    }

    #[test]
    fn empty_source_is_just_eof() {
        let tokens = scan("");
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Eof);
        assert_eq!(tokens[0].line, 1);
    }
}
