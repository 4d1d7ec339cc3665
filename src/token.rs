//! Tokens of NexusLang source text

use std::fmt;

/// Every kind of token the lexer can produce.
/// ***Note that `say` and `listen` are not reserved keywords***
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub enum TokenKind {
    // Literals
    Integer,
    Float,
    Str,
    Identifier,

    // Keywords
    Fn,
    Let,
    If,
    Else,
    While,
    Return,
    Print,
    True,
    False,
    Nil,

    // Domain keywords
    Personality,
    Knowledge,
    Voice,
    Trait,

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    EqEq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    Bang,
    AndAnd,
    OrOr,

    // Punctuation
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Semicolon,
    Dot,

    Eof,
}

impl TokenKind {
    /// Resolve an identifier-like word to its keyword, if it is one.
    pub fn keyword(word: &str) -> Option<Self> {
        let kind = match word {
            "fn" => TokenKind::Fn,
            "let" => TokenKind::Let,
            "if" => TokenKind::If,
            "else" => TokenKind::Else,
            "while" => TokenKind::While,
            "return" => TokenKind::Return,
            "print" => TokenKind::Print,
            "true" => TokenKind::True,
            "false" => TokenKind::False,
            "nil" => TokenKind::Nil,
            "personality" => TokenKind::Personality,
            "knowledge" => TokenKind::Knowledge,
            "voice" => TokenKind::Voice,
            "trait" => TokenKind::Trait,
            _ => return None,
        };
        Some(kind)
    }

    /// How the token kind is spelled in diagnostics.
    pub fn describe(self) -> &'static str {
        match self {
            TokenKind::Integer => "integer",
            TokenKind::Float => "float",
            TokenKind::Str => "string",
            TokenKind::Identifier => "identifier",
            TokenKind::Fn => "'fn'",
            TokenKind::Let => "'let'",
            TokenKind::If => "'if'",
            TokenKind::Else => "'else'",
            TokenKind::While => "'while'",
            TokenKind::Return => "'return'",
            TokenKind::Print => "'print'",
            TokenKind::True => "'true'",
            TokenKind::False => "'false'",
            TokenKind::Nil => "'nil'",
            TokenKind::Personality => "'personality'",
            TokenKind::Knowledge => "'knowledge'",
            TokenKind::Voice => "'voice'",
            TokenKind::Trait => "'trait'",
            TokenKind::Plus => "'+'",
            TokenKind::Minus => "'-'",
            TokenKind::Star => "'*'",
            TokenKind::Slash => "'/'",
            TokenKind::Percent => "'%'",
            TokenKind::Assign => "'='",
            TokenKind::EqEq => "'=='",
            TokenKind::NotEq => "'!='",
            TokenKind::Less => "'<'",
            TokenKind::LessEq => "'<='",
            TokenKind::Greater => "'>'",
            TokenKind::GreaterEq => "'>='",
            TokenKind::Bang => "'!'",
            TokenKind::AndAnd => "'&&'",
            TokenKind::OrOr => "'||'",
            TokenKind::LParen => "'('",
            TokenKind::RParen => "')'",
            TokenKind::LBrace => "'{'",
            TokenKind::RBrace => "'}'",
            TokenKind::Comma => "','",
            TokenKind::Colon => "':'",
            TokenKind::Semicolon => "';'",
            TokenKind::Dot => "'.'",
            TokenKind::Eof => "end of input",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.describe())
    }
}

/// A single token with the position of its first character.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    /// Source text of the token. For string literals this is the unescaped value.
    pub lexeme: String,
    pub line: usize,
    pub column: usize,
}

impl Token {
    pub fn new(kind: TokenKind, lexeme: impl Into<String>, line: usize, column: usize) -> Self {
        Token {
            kind,
            lexeme: lexeme.into(),
            line,
            column,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domain_keywords() {
        assert_eq!(TokenKind::keyword("personality"), Some(TokenKind::Personality));
        assert_eq!(TokenKind::keyword("knowledge"), Some(TokenKind::Knowledge));
        assert_eq!(TokenKind::keyword("voice"), Some(TokenKind::Voice));
        assert_eq!(TokenKind::keyword("trait"), Some(TokenKind::Trait));
        assert_eq!(TokenKind::keyword("say"), None);
    }
}
