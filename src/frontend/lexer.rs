use std::{
    collections::{BTreeMap, VecDeque},
    str::Chars,
};

use itertools::{peek_nth, PeekNth};
use once_cell::sync::Lazy;
use strum::EnumString;

use crate::source::{SourceFile, SourcePosition, SourceSpan};

/// Characters an operator token is made of. The exact matches `=` and `=>`
/// are distinguished tokens.
pub const OPERATOR_ALPHABET: &str = "<>=+-*/%&|!?^~";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Token {
    pub tag: TokenTag,
    pub site: SourceSpan,
}

impl Token {
    pub fn text<'a>(&self, source: &'a SourceFile) -> &'a str {
        source.text_of(self.site)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenTag {
    /* Words */
    Name,
    Underscore,
    Keyword(Keyword),

    /* Literals */
    BooleanLiteral,
    IntegerLiteral,
    FloatingPointLiteral,
    StringLiteral,

    /* Operator shapes */
    Assign,     // =
    ThickArrow, // =>
    Operator,   // any other run of the operator alphabet

    /* Punctuation */
    Comma,
    Dot,
    Colon,
    Semicolon,
    At,
    Backslash,

    /* Delimiters */
    LeftBracket,
    RightBracket,
    LeftParenthesis,
    RightParenthesis,

    /* Layout */
    Indentation,
    Dedentation,

    /* Errors */
    Error,
    UnterminatedBackquotedIdentifier,
    UnterminatedStringLiteral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Keyword {
    As,
    Break,
    Case,
    Catch,
    Continue,
    Defer,
    Do,
    Else,
    For,
    Fun,
    If,
    Import,
    In,
    Infix,
    Inout,
    Is,
    Let,
    Match,
    Postfix,
    Prefix,
    Return,
    Struct,
    Subscript,
    Throw,
    Trait,
    Try,
    Var,
    Where,
    While,
    Yield,
}

impl core::fmt::Display for TokenTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenTag::Name => f.write_str("name"),
            TokenTag::Underscore => f.write_str("_"),
            TokenTag::Keyword(keyword) => write!(f, "{keyword}"),
            TokenTag::BooleanLiteral => f.write_str("boolean literal"),
            TokenTag::IntegerLiteral => f.write_str("integer literal"),
            TokenTag::FloatingPointLiteral => f.write_str("floating-point literal"),
            TokenTag::StringLiteral => f.write_str("string literal"),
            TokenTag::Assign => f.write_str("="),
            TokenTag::ThickArrow => f.write_str("=>"),
            TokenTag::Operator => f.write_str("operator"),
            TokenTag::Comma => f.write_str(","),
            TokenTag::Dot => f.write_str("."),
            TokenTag::Colon => f.write_str(":"),
            TokenTag::Semicolon => f.write_str(";"),
            TokenTag::At => f.write_str("@"),
            TokenTag::Backslash => f.write_str("\\"),
            TokenTag::LeftBracket => f.write_str("["),
            TokenTag::RightBracket => f.write_str("]"),
            TokenTag::LeftParenthesis => f.write_str("("),
            TokenTag::RightParenthesis => f.write_str(")"),
            TokenTag::Indentation => f.write_str("indentation"),
            TokenTag::Dedentation => f.write_str("dedentation"),
            TokenTag::Error => f.write_str("error"),
            TokenTag::UnterminatedBackquotedIdentifier => {
                f.write_str("unterminated backquoted identifier")
            }
            TokenTag::UnterminatedStringLiteral => f.write_str("unterminated string literal"),
        }
    }
}

/// Table of single char tokens (matched after longer sequences are checked for)
static PUNCTUATION: Lazy<BTreeMap<char, TokenTag>> = Lazy::new(|| {
    BTreeMap::from([
        (',', TokenTag::Comma),
        ('.', TokenTag::Dot),
        (':', TokenTag::Colon),
        (';', TokenTag::Semicolon),
        ('@', TokenTag::At),
        ('\\', TokenTag::Backslash),
        ('[', TokenTag::LeftBracket),
        (']', TokenTag::RightBracket),
        ('(', TokenTag::LeftParenthesis),
        (')', TokenTag::RightParenthesis),
    ])
});

/// A token stream over one source file.
///
/// The lexer is indentation-aware: at the start of each line that holds
/// content it compares the line's whitespace prefix with the current logical
/// indentation and queues one `Indentation` token per extra character, or as
/// many empty-span `Dedentation` tokens as levels were closed. The queued
/// layout tokens are handed out by subsequent `next` calls before scanning
/// resumes.
#[derive(Debug)]
pub struct Lexer<'source> {
    source: &'source SourceFile,
    chars: PeekNth<Chars<'source>>,
    position: u32,
    indentation: u32,
    at_line_start: bool,
    queue: VecDeque<Token>,
    drained: bool,
}

impl<'source> Lexer<'source> {
    pub fn new(source: &'source SourceFile) -> Self {
        Self {
            source,
            chars: peek_nth(source.contents.chars()),
            position: 0,
            indentation: 0,
            at_line_start: true,
            queue: VecDeque::new(),
            drained: false,
        }
    }

    pub fn source(&self) -> &SourceFile {
        self.source
    }

    /// The position immediately after the last consumed character.
    pub fn position(&self) -> SourcePosition {
        SourcePosition {
            source: self.source.id,
            index: self.position,
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn peek_nth(&mut self, n: usize) -> Option<char> {
        self.chars.peek_nth(n).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.chars.next()?;
        self.position += c.len_utf8() as u32;
        Some(c)
    }

    fn new_span(&self, start: u32) -> SourceSpan {
        SourceSpan::new(self.source.id, start, self.position)
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.advance();
        }
    }

    /// Measures the whitespace prefix of the line about to be scanned and
    /// reconciles it with the current indentation. Blank lines and lines
    /// holding only a comment produce no layout tokens.
    fn handle_line_start(&mut self) {
        let mut prefix: Vec<SourceSpan> = Vec::new();

        while let Some(c) = self.peek() {
            if c == '\n' || !c.is_whitespace() {
                break;
            }
            let start = self.position;
            self.advance();
            prefix.push(self.new_span(start));
        }

        match self.peek() {
            None => {
                // Trailing dedents are produced when the caller hits EOF
                self.at_line_start = false;
            }
            Some('\n') => {
                self.advance();
            }
            Some('#') => {
                self.skip_line();
            }
            Some(_) => {
                let depth = prefix.len() as u32;

                if depth > self.indentation {
                    for span in &prefix[self.indentation as usize..] {
                        self.queue.push_back(Token {
                            tag: TokenTag::Indentation,
                            site: *span,
                        });
                    }
                } else if depth < self.indentation {
                    let site = SourceSpan::empty_at(Lexer::position(self));
                    for _ in depth..self.indentation {
                        self.queue.push_back(Token {
                            tag: TokenTag::Dedentation,
                            site,
                        });
                    }
                }

                self.indentation = depth;
                self.at_line_start = false;
            }
        }
    }

    fn drain_trailing_dedents(&mut self) {
        let site = SourceSpan::empty_at(Lexer::position(self));
        for _ in 0..self.indentation {
            self.queue.push_back(Token {
                tag: TokenTag::Dedentation,
                site,
            });
        }
        self.indentation = 0;
        self.drained = true;
    }

    // Keyword, identifier, underscore, or boolean literal
    fn read_word(&mut self) -> Token {
        let start = self.position;

        while let Some(c) = self.peek() {
            if !(c.is_alphanumeric() || c == '_') {
                break;
            }
            self.advance();
        }

        let site = self.new_span(start);
        let text = self.source.text_of(site);

        let tag = if text == "_" {
            TokenTag::Underscore
        } else if let Ok(keyword) = text.parse() {
            TokenTag::Keyword(keyword)
        } else {
            match text {
                "true" | "false" => TokenTag::BooleanLiteral,
                _ => TokenTag::Name,
            }
        };

        Token { tag, site }
    }

    // `identifier with arbitrary characters`
    fn read_backquoted(&mut self) -> Token {
        let start = self.position;
        self.advance();

        let mut length = 0usize;
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.advance();

            if c == '`' {
                let tag = if length == 0 {
                    TokenTag::Error
                } else {
                    TokenTag::Name
                };
                return Token {
                    tag,
                    site: self.new_span(start),
                };
            }

            length += 1;
        }

        Token {
            tag: TokenTag::UnterminatedBackquotedIdentifier,
            site: self.new_span(start),
        }
    }

    fn eat_digits(&mut self, is_digit: impl Fn(char) -> bool) -> usize {
        let mut count = 0;
        while let Some(c) = self.peek() {
            if is_digit(c) {
                count += 1;
            } else if c != '_' {
                break;
            }
            self.advance();
        }
        count
    }

    /// Decimal, hexadecimal, octal, or binary literals, with `_` separators
    /// and a decimal exponent. A `.` that is not followed by a digit is left
    /// for the next token.
    fn read_number(&mut self) -> Token {
        let start = self.position;

        if self.peek() == Some('-') {
            self.advance();
        }

        if self.peek() == Some('0') {
            let radix = match self.peek_nth(1) {
                Some('x') => Some(16),
                Some('o') => Some(8),
                Some('b') => Some(2),
                _ => None,
            };

            if let Some(radix) = radix {
                self.advance();
                self.advance();

                let tag = if self.eat_digits(|c| c.is_digit(radix)) == 0 {
                    TokenTag::Error
                } else {
                    TokenTag::IntegerLiteral
                };
                return Token {
                    tag,
                    site: self.new_span(start),
                };
            }
        }

        let mut tag = TokenTag::IntegerLiteral;
        self.eat_digits(|c| c.is_ascii_digit());

        if self.peek() == Some('.') && self.peek_nth(1).is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
            self.eat_digits(|c| c.is_ascii_digit());
            tag = TokenTag::FloatingPointLiteral;
        }

        if matches!(self.peek(), Some('e' | 'E')) {
            let after_sign = match self.peek_nth(1) {
                Some('+' | '-') => 2,
                _ => 1,
            };
            if self.peek_nth(after_sign).is_some_and(|c| c.is_ascii_digit()) {
                self.advance();
                for _ in 1..after_sign {
                    self.advance();
                }
                self.eat_digits(|c| c.is_ascii_digit());
                tag = TokenTag::FloatingPointLiteral;
            }
        }

        Token {
            tag,
            site: self.new_span(start),
        }
    }

    // "text with \" and \\ escapes", never spanning a line break
    fn read_string(&mut self) -> Token {
        let start = self.position;
        self.advance();

        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.advance();

            match c {
                '"' => {
                    return Token {
                        tag: TokenTag::StringLiteral,
                        site: self.new_span(start),
                    }
                }
                '\\' => {
                    if self.peek().is_some_and(|c| c != '\n') {
                        self.advance();
                    }
                }
                _ => {}
            }
        }

        Token {
            tag: TokenTag::UnterminatedStringLiteral,
            site: self.new_span(start),
        }
    }

    // Longest run of the operator alphabet; `=` and `=>` get their own tags
    fn read_operator(&mut self) -> Token {
        let start = self.position;

        while let Some(c) = self.peek() {
            if !OPERATOR_ALPHABET.contains(c) {
                break;
            }
            self.advance();
        }

        let site = self.new_span(start);
        let tag = match self.source.text_of(site) {
            "=" => TokenTag::Assign,
            "=>" => TokenTag::ThickArrow,
            _ => TokenTag::Operator,
        };

        Token { tag, site }
    }

    fn read_single(&mut self, tag: TokenTag) -> Token {
        let start = self.position;
        self.advance();

        Token {
            tag,
            site: self.new_span(start),
        }
    }
}

impl<'source> Iterator for Lexer<'source> {
    type Item = Token;

    fn next(&mut self) -> Option<Token> {
        loop {
            if let Some(token) = self.queue.pop_front() {
                return Some(token);
            }

            if self.at_line_start {
                self.handle_line_start();
                continue;
            }

            let Some(c) = self.peek() else {
                if self.drained {
                    return None;
                }
                self.drain_trailing_dedents();
                continue;
            };

            let token = match c {
                '\n' => {
                    self.advance();
                    self.at_line_start = true;
                    continue;
                }
                c if c.is_whitespace() => {
                    self.advance();
                    continue;
                }
                '#' => {
                    self.skip_line();
                    continue;
                }

                c if c.is_alphabetic() || c == '_' => self.read_word(),
                '`' => self.read_backquoted(),
                n if n.is_ascii_digit() => self.read_number(),

                // A leading minus is part of a numeric literal only when it
                // directly precedes digits
                '-' if self.peek_nth(1).is_some_and(|c| c.is_ascii_digit()) => self.read_number(),

                '"' => self.read_string(),

                c if OPERATOR_ALPHABET.contains(c) => self.read_operator(),

                c => match PUNCTUATION.get(&c) {
                    Some(tag) => self.read_single(*tag),
                    None => self.read_single(TokenTag::Error),
                },
            };

            return Some(token);
        }
    }
}

/// Resolves the `\"` and `\\` escapes of a string literal's source text
/// (delimiting quotes included) into the denoted string.
pub fn unescape_string_literal(text: &str) -> String {
    let inner = text
        .strip_prefix('"')
        .unwrap_or(text)
        .strip_suffix('"')
        .unwrap_or(text);

    let mut value = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => value.push('\n'),
                Some('t') => value.push('\t'),
                Some(escaped) => value.push(escaped),
                None => value.push('\\'),
            }
        } else {
            value.push(c);
        }
    }
    value
}
