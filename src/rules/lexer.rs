//! Tokenizer for rule files.

use super::{Location, RuleError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    Word(String),
    /// A double-quoted string, escapes already processed.
    Quoted(String),
    LParen,
    RParen,
    Semicolon,
    /// End of a logical line.
    Eol,
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lexed {
    pub token: Token,
    pub line: usize,
}

struct Lexer<'a> {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    file: &'a str,
}

impl<'a> Lexer<'a> {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn error(&self, line: usize, message: impl Into<String>) -> RuleError {
        RuleError::Lex {
            location: Location {
                file: self.file.to_string(),
                line,
            },
            message: message.into(),
        }
    }

    // A backslash followed by nothing but blanks up to the end of the line.
    // Returns the position just past the newline.
    fn continuation_at(&self, pos: usize) -> Option<usize> {
        if self.chars.get(pos) != Some(&'\\') {
            return None;
        }
        let mut p = pos + 1;
        loop {
            match self.chars.get(p) {
                Some(' ' | '\t' | '\r') => p += 1,
                Some('\n') => return Some(p + 1),
                None => return Some(p),
                Some(_) => return None,
            }
        }
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    fn quoted(&mut self) -> Result<String, RuleError> {
        let start = self.line;
        self.pos += 1;
        let mut text = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error(start, "unterminated quoted string")),
                Some('"') => {
                    self.pos += 1;
                    return Ok(text);
                }
                Some('\\') => match self.chars.get(self.pos + 1) {
                    Some(c @ ('"' | '\\')) => {
                        text.push(*c);
                        self.pos += 2;
                    }
                    _ => {
                        text.push('\\');
                        self.pos += 1;
                    }
                },
                Some(c) => {
                    if c == '\n' {
                        self.line += 1;
                    }
                    text.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn word(&mut self) -> Result<String, RuleError> {
        let mut text = String::new();
        while let Some(c) = self.peek() {
            match c {
                ' ' | '\t' | '\r' | '\n' | '(' | ')' | ';' => break,
                '\\' if self.continuation_at(self.pos).is_some() => break,
                '"' => return Err(self.error(self.line, format!("quote in the middle of '{text}\"'"))),
                _ => {
                    text.push(c);
                    self.pos += 1;
                }
            }
        }
        Ok(text)
    }

    fn next_token(&mut self) -> Result<Lexed, RuleError> {
        loop {
            let line = self.line;
            let Some(c) = self.peek() else {
                return Ok(Lexed {
                    token: Token::Eof,
                    line,
                });
            };
            let token = match c {
                ' ' | '\t' | '\r' => {
                    self.pos += 1;
                    continue;
                }
                '#' => {
                    self.skip_comment();
                    continue;
                }
                '\\' if self.continuation_at(self.pos).is_some() => {
                    if let Some(next) = self.continuation_at(self.pos) {
                        if self.chars.get(next - 1) == Some(&'\n') {
                            self.line += 1;
                        }
                        self.pos = next;
                    }
                    continue;
                }
                '\n' => {
                    self.pos += 1;
                    self.line += 1;
                    Token::Eol
                }
                '(' => {
                    self.pos += 1;
                    Token::LParen
                }
                ')' => {
                    self.pos += 1;
                    Token::RParen
                }
                ';' => {
                    self.pos += 1;
                    Token::Semicolon
                }
                '"' => Token::Quoted(self.quoted()?),
                _ => Token::Word(self.word()?),
            };
            return Ok(Lexed { token, line });
        }
    }
}

/// Split rule file text into tokens, ending with `Eof`.
pub fn tokenize(text: &str, file: &str) -> Result<Vec<Lexed>, RuleError> {
    let mut lexer = Lexer {
        chars: text.chars().collect(),
        pos: 0,
        line: 1,
        file,
    };
    let mut tokens = Vec::new();
    loop {
        let lexed = lexer.next_token()?;
        let done = lexed.token == Token::Eof;
        tokens.push(lexed);
        if done {
            return Ok(tokens);
        }
    }
}

/// Double-quote a string, escaping quotes and backslashes.
pub fn quote(text: &str) -> String {
    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push('"');
    for c in text.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

/// Render an argument so that it lexes back to a single identical token.
pub fn render_arg(text: &str) -> String {
    let plain = !text.is_empty()
        && !text.starts_with('#')
        && !text
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '"' | '\\' | '(' | ')' | ';' | '#'));
    if plain {
        text.to_string()
    } else {
        quote(text)
    }
}
