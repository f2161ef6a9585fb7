//! Tokenizer for the Meson description language.
//!
//! Newlines end statements, except inside brackets where they are ignored.
//! `#` starts a comment running to the end of the line.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    True,
    False,
    If,
    Elif,
    Else,
    Endif,
    Foreach,
    Endforeach,
    Break,
    Continue,
    And,
    Or,
    Not,
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Colon,
    Dot,
    Question,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Assign,
    PlusAssign,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Newline,
    Eof,
}

/// A token and the 1-based line it starts on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spanned {
    pub token: Token,
    pub line: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("line {line}: {message}")]
pub struct LexError {
    pub line: usize,
    pub message: String,
}

pub fn tokenize(source: &str) -> Result<Vec<Spanned>, LexError> {
    Lexer {
        chars: source.chars().collect(),
        pos: 0,
        line: 1,
        depth: 0,
        tokens: Vec::new(),
    }
    .run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    /// Bracket nesting; newlines are insignificant while positive.
    depth: usize,
    tokens: Vec<Spanned>,
}

impl Lexer {
    fn run(mut self) -> Result<Vec<Spanned>, LexError> {
        while let Some(c) = self.peek(0) {
            match c {
                ' ' | '\t' | '\r' => self.pos += 1,
                '\\' if self.peek(1) == Some('\n') => {
                    self.pos += 2;
                    self.line += 1;
                }
                '#' => {
                    while self.peek(0).is_some_and(|c| c != '\n') {
                        self.pos += 1;
                    }
                }
                '\n' => {
                    if self.depth == 0 {
                        self.push(Token::Newline);
                    }
                    self.pos += 1;
                    self.line += 1;
                }
                '\'' => {
                    let s = self.string()?;
                    self.push(Token::Str(s));
                }
                'f' if self.peek(1) == Some('\'') => {
                    // Format strings are kept verbatim.
                    self.pos += 1;
                    let s = self.string()?;
                    self.push(Token::Str(s));
                }
                c if c.is_ascii_digit() => {
                    let n = self.number()?;
                    self.push(Token::Int(n));
                }
                c if c.is_alphabetic() || c == '_' => {
                    let word = self.word();
                    self.push(keyword(&word).unwrap_or(Token::Ident(word)));
                }
                _ => {
                    let token = self.punct()?;
                    self.push(token);
                }
            }
        }
        self.push(Token::Eof);
        Ok(self.tokens)
    }

    fn peek(&self, ahead: usize) -> Option<char> {
        self.chars.get(self.pos + ahead).copied()
    }

    fn push(&mut self, token: Token) {
        self.tokens.push(Spanned {
            token,
            line: self.line,
        });
    }

    fn error(&self, message: impl Into<String>) -> LexError {
        LexError {
            line: self.line,
            message: message.into(),
        }
    }

    fn string(&mut self) -> Result<String, LexError> {
        if self.peek(1) == Some('\'') && self.peek(2) == Some('\'') {
            return self.multiline_string();
        }
        let start_line = self.line;
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek(0) {
                None | Some('\n') => {
                    return Err(LexError {
                        line: start_line,
                        message: "unterminated string".to_string(),
                    })
                }
                Some('\'') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some('\\') => {
                    let escaped = self.peek(1).ok_or_else(|| self.error("dangling escape"))?;
                    let unescaped = match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        '\\' => '\\',
                        '\'' => '\'',
                        other => {
                            out.push('\\');
                            other
                        }
                    };
                    out.push(unescaped);
                    self.pos += 2;
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn multiline_string(&mut self) -> Result<String, LexError> {
        let start_line = self.line;
        self.pos += 3;
        let mut out = String::new();
        loop {
            match self.peek(0) {
                None => {
                    return Err(LexError {
                        line: start_line,
                        message: "unterminated multiline string".to_string(),
                    })
                }
                Some('\'') if self.peek(1) == Some('\'') && self.peek(2) == Some('\'') => {
                    self.pos += 3;
                    return Ok(out);
                }
                Some(c) => {
                    if c == '\n' {
                        self.line += 1;
                    }
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn number(&mut self) -> Result<i64, LexError> {
        let radix = match (self.peek(0), self.peek(1)) {
            (Some('0'), Some('x' | 'X')) => 16,
            (Some('0'), Some('o' | 'O')) => 8,
            (Some('0'), Some('b' | 'B')) => 2,
            _ => 10,
        };
        if radix != 10 {
            self.pos += 2;
        }
        let start = self.pos;
        while self.peek(0).is_some_and(|c| c.is_ascii_alphanumeric()) {
            self.pos += 1;
        }
        let digits: String = self.chars[start..self.pos].iter().collect();
        i64::from_str_radix(&digits, radix)
            .map_err(|_| self.error(format!("invalid number '{digits}'")))
    }

    fn word(&mut self) -> String {
        let start = self.pos;
        while self
            .peek(0)
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn punct(&mut self) -> Result<Token, LexError> {
        let c = self.peek(0).ok_or_else(|| self.error("unexpected end of input"))?;
        let next = self.peek(1);
        let (token, width) = match (c, next) {
            ('=', Some('=')) => (Token::Eq, 2),
            ('!', Some('=')) => (Token::Ne, 2),
            ('<', Some('=')) => (Token::Le, 2),
            ('>', Some('=')) => (Token::Ge, 2),
            ('+', Some('=')) => (Token::PlusAssign, 2),
            ('=', _) => (Token::Assign, 1),
            ('<', _) => (Token::Lt, 1),
            ('>', _) => (Token::Gt, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('?', _) => (Token::Question, 1),
            (':', _) => (Token::Colon, 1),
            (',', _) => (Token::Comma, 1),
            ('.', _) => (Token::Dot, 1),
            ('(', _) => (Token::LParen, 1),
            ('[', _) => (Token::LBracket, 1),
            ('{', _) => (Token::LBrace, 1),
            (')', _) => (Token::RParen, 1),
            (']', _) => (Token::RBracket, 1),
            ('}', _) => (Token::RBrace, 1),
            (other, _) => return Err(self.error(format!("unexpected character '{other}'"))),
        };
        match token {
            Token::LParen | Token::LBracket | Token::LBrace => self.depth += 1,
            Token::RParen | Token::RBracket | Token::RBrace => {
                self.depth = self.depth.saturating_sub(1)
            }
            _ => {}
        }
        self.pos += width;
        Ok(token)
    }
}

fn keyword(word: &str) -> Option<Token> {
    Some(match word {
        "true" => Token::True,
        "false" => Token::False,
        "if" => Token::If,
        "elif" => Token::Elif,
        "else" => Token::Else,
        "endif" => Token::Endif,
        "foreach" => Token::Foreach,
        "endforeach" => Token::Endforeach,
        "break" => Token::Break,
        "continue" => Token::Continue,
        "and" => Token::And,
        "or" => Token::Or,
        "not" => Token::Not,
        "in" => Token::In,
        _ => return None,
    })
}
