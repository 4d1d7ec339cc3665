use crate::error::{LexError, LexErrorKind};
use crate::token::{Token, TokenKind};
use tracing::debug;

pub struct Lexer<'a> {
    program: &'a str,
    cursor: usize,
    line: usize,
    column: usize,
}

type LResult = Result<Option<Token>, LexError>;

/// Tokenize the whole program. The returned tokens always end with [`TokenKind::Eof`].
pub fn tokenize(source: &str) -> Result<Vec<Token>, LexError> {
    let mut lexer = Lexer::new(source);
    let mut tokens = Vec::new();

    while let Some(token) = lexer.next_token()? {
        tokens.push(token);
    }
    tokens.push(Token::new(TokenKind::Eof, "", lexer.line, lexer.column));

    debug!(tokens = tokens.len(), "tokenized source");
    Ok(tokens)
}

impl<'a> Lexer<'a> {
    pub fn new(program: &'a str) -> Self {
        Lexer {
            program,
            cursor: 0,
            line: 1,
            column: 1,
        }
    }

    /// Get the next token. This consumes the tokens.
    pub fn next_token(&mut self) -> LResult {
        self.trim();

        let (line, column) = (self.line, self.column);
        let ch = match self.next_char(false) {
            Some(ch) => ch,
            None => return Ok(None),
        };

        let kind = match ch {
            '"' => return self.read_str_literal(line, column).map(Some),
            '0'..='9' => return self.read_number(line, column).map(Some),
            c if c.is_alphabetic() || c == '_' => return Ok(Some(self.read_word(line, column))),
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '%' => TokenKind::Percent,
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            '{' => TokenKind::LBrace,
            '}' => TokenKind::RBrace,
            ',' => TokenKind::Comma,
            ':' => TokenKind::Colon,
            ';' => TokenKind::Semicolon,
            '.' => TokenKind::Dot,
            '=' => self.either('=', TokenKind::EqEq, TokenKind::Assign),
            '!' => self.either('=', TokenKind::NotEq, TokenKind::Bang),
            '<' => self.either('=', TokenKind::LessEq, TokenKind::Less),
            '>' => self.either('=', TokenKind::GreaterEq, TokenKind::Greater),
            '&' if self.next_char(true) == Some('&') => {
                self.next_char(false);
                TokenKind::AndAnd
            }
            '|' if self.next_char(true) == Some('|') => {
                self.next_char(false);
                TokenKind::OrOr
            }
            other => return Err(self.error(LexErrorKind::UnknownChar(other), line, column)),
        };

        let lexeme = &self.program[self.offset_of(line, column)..self.cursor];
        Ok(Some(Token::new(kind, lexeme, line, column)))
    }

    /// Trim whitespaces, tabs, carriage returns, newlines and `//` comments
    fn trim(&mut self) {
        while let Some(ch) = self.next_char(true) {
            if ch.is_whitespace() {
                self.next_char(false);
            } else if self.program[self.cursor..].starts_with("//") {
                while let Some(ch) = self.next_char(true) {
                    if ch == '\n' {
                        break;
                    }
                    self.next_char(false);
                }
            } else {
                break;
            }
        }
    }

    /// Two-character operator if the next char is `second`, otherwise the single one.
    fn either(&mut self, second: char, double: TokenKind, single: TokenKind) -> TokenKind {
        if self.next_char(true) == Some(second) {
            self.next_char(false);
            double
        } else {
            single
        }
    }

    /// Read a decimal integer or float. The first digit is already consumed.
    fn read_number(&mut self, line: usize, column: usize) -> Result<Token, LexError> {
        let start_pos = self.cursor - 1;
        let mut is_float = false;

        while let Some(ch) = self.next_char(true) {
            if ch.is_ascii_digit() {
                self.next_char(false);
            } else if ch == '.' && !self.peek_second().is_some_and(|c| c.is_ascii_digit()) {
                break;
            } else if ch == '.' && !is_float {
                is_float = true;
                self.next_char(false);
            } else if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                // Eg. "12ab" or "1.2.3"
                while let Some(ch) = self.next_char(true) {
                    if !ch.is_alphanumeric() && ch != '_' && ch != '.' {
                        break;
                    }
                    self.next_char(false);
                }
                let text = self.program[start_pos..self.cursor].to_string();
                return Err(self.error(LexErrorKind::InvalidNumber(text), line, column));
            } else {
                break;
            }
        }

        let text = &self.program[start_pos..self.cursor];
        let kind = if is_float {
            TokenKind::Float
        } else {
            // One past `i64::MAX` is accepted for `-9223372036854775808`
            if !text.parse::<u64>().is_ok_and(|n| n <= i64::MIN.unsigned_abs()) {
                let kind = LexErrorKind::InvalidNumber(text.to_string());
                return Err(self.error(kind, line, column));
            }
            TokenKind::Integer
        };

        Ok(Token::new(kind, text, line, column))
    }

    /// Read a string literal that starts and ends with '"'. The opening quote is
    /// already consumed and escapes are resolved into the lexeme.
    fn read_str_literal(&mut self, line: usize, column: usize) -> Result<Token, LexError> {
        let mut value = String::new();

        loop {
            let (esc_line, esc_column) = (self.line, self.column);
            match self.next_char(false) {
                // Strings cannot continue from next line
                None | Some('\n') => {
                    return Err(self.error(LexErrorKind::UnterminatedString, line, column))
                }
                Some('"') => break,
                Some('\\') => {
                    let escaped = match self.next_char(false) {
                        Some('n') => '\n',
                        Some('t') => '\t',
                        Some('r') => '\r',
                        Some('0') => '\0',
                        Some('\\') => '\\',
                        Some('"') => '"',
                        None | Some('\n') => {
                            return Err(self.error(LexErrorKind::UnterminatedString, line, column))
                        }
                        Some(other) => {
                            return Err(self.error(
                                LexErrorKind::InvalidEscape(other),
                                esc_line,
                                esc_column,
                            ))
                        }
                    };
                    value.push(escaped);
                }
                Some(ch) => value.push(ch),
            }
        }

        Ok(Token::new(TokenKind::Str, value, line, column))
    }

    /// Read an identifier or keyword
    fn read_word(&mut self, line: usize, column: usize) -> Token {
        let first_len = self.program[..self.cursor]
            .chars()
            .last()
            .map_or(0, char::len_utf8);
        let start_pos = self.cursor - first_len;
        while let Some(ch) = self.next_char(true) {
            // Only alphanumeric characters and '_'
            if !ch.is_alphanumeric() && ch != '_' {
                break;
            }
            self.next_char(false);
        }

        let word = &self.program[start_pos..self.cursor];
        let kind = TokenKind::keyword(word).unwrap_or(TokenKind::Identifier);
        Token::new(kind, word, line, column)
    }

    /// Get the next char and advance the cursor if `peek` is false
    fn next_char(&mut self, peek: bool) -> Option<char> {
        let ch = self.program[self.cursor..].chars().next()?;
        if !peek {
            self.cursor += ch.len_utf8();
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        Some(ch)
    }

    /// The char after the next one, without consuming anything
    fn peek_second(&self) -> Option<char> {
        let mut chars = self.program[self.cursor..].chars();
        chars.next();
        chars.next()
    }

    /// Byte offset of a token that started at `line:column` and ends at the cursor.
    /// Only used for ASCII operators, so the column distance is the byte distance.
    fn offset_of(&self, line: usize, column: usize) -> usize {
        debug_assert_eq!(line, self.line);
        self.cursor - (self.column - column)
    }

    fn error(&self, kind: LexErrorKind, line: usize, column: usize) -> LexError {
        LexError { kind, line, column }
    }
}
