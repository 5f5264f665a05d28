//! S-expression values exchanged with the editor.
//!
//! Every protocol message is a single s-expression printed as text. The
//! reader here understands the subset the editor emits: lists, strings with
//! backslash escapes, integers, keywords, symbols, `nil`, `t`, `'` quoting
//! and `;` line comments.

use std::fmt;

use thiserror::Error;

use super::constants::MAX_DEPTH;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sexp {
    Nil,
    T,
    Int(i64),
    Str(String),
    Symbol(String),
    /// Keyword name without the leading colon.
    Keyword(String),
    List(Vec<Sexp>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SexpError {
    #[error("empty input")]
    Empty,
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("unexpected '{ch}' at line {line}")]
    Unexpected { ch: char, line: usize },
    #[error("unterminated string starting at line {line}")]
    UnterminatedString { line: usize },
    #[error("trailing input at line {line}")]
    Trailing { line: usize },
    #[error("nesting deeper than {MAX_DEPTH} at line {line}")]
    TooDeep { line: usize },
}

impl Sexp {
    pub fn list(items: impl IntoIterator<Item = Sexp>) -> Self {
        Sexp::List(items.into_iter().collect())
    }

    pub fn symbol(name: impl Into<String>) -> Self {
        Sexp::Symbol(name.into())
    }

    pub fn keyword(name: impl Into<String>) -> Self {
        Sexp::Keyword(name.into())
    }

    pub fn string(text: impl Into<String>) -> Self {
        Sexp::Str(text.into())
    }

    pub fn bool(value: bool) -> Self {
        if value {
            Sexp::T
        } else {
            Sexp::Nil
        }
    }

    /// List elements; `nil` is the empty list.
    pub fn as_list(&self) -> Option<&[Sexp]> {
        match self {
            Sexp::List(items) => Some(items),
            Sexp::Nil => Some(&[]),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Sexp::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Sexp::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_symbol(&self) -> Option<&str> {
        match self {
            Sexp::Symbol(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_keyword(&self) -> Option<&str> {
        match self {
            Sexp::Keyword(k) => Some(k),
            _ => None,
        }
    }

    pub fn is_truthy(&self) -> bool {
        !matches!(self, Sexp::Nil)
    }

    /// Keyword in head position, e.g. `emacs-rex` for `(:emacs-rex ...)`.
    pub fn head_keyword(&self) -> Option<&str> {
        match self {
            Sexp::List(items) => items.first().and_then(Sexp::as_keyword),
            _ => None,
        }
    }

    /// Human-facing rendering: strings print without quotes.
    pub fn display_value(&self) -> String {
        match self {
            Sexp::Str(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl fmt::Display for Sexp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sexp::Nil => f.write_str("nil"),
            Sexp::T => f.write_str("t"),
            Sexp::Int(n) => write!(f, "{n}"),
            Sexp::Str(s) => {
                f.write_str("\"")?;
                for ch in s.chars() {
                    match ch {
                        '"' => f.write_str("\\\"")?,
                        '\\' => f.write_str("\\\\")?,
                        other => write!(f, "{other}")?,
                    }
                }
                f.write_str("\"")
            }
            Sexp::Symbol(s) => f.write_str(s),
            Sexp::Keyword(k) => write!(f, ":{k}"),
            Sexp::List(items) => {
                f.write_str("(")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// Parse exactly one form; surrounding whitespace and comments are allowed.
pub fn parse(text: &str) -> Result<Sexp, SexpError> {
    let mut reader = Reader::new(text);
    reader.skip_trivia();
    if reader.at_end() {
        return Err(SexpError::Empty);
    }
    let form = reader.read()?;
    reader.skip_trivia();
    if !reader.at_end() {
        return Err(SexpError::Trailing { line: reader.line });
    }
    Ok(form)
}

/// Parse every top-level form, paired with the line it starts on (1-based).
pub fn parse_all(text: &str) -> Result<Vec<(usize, Sexp)>, SexpError> {
    let mut reader = Reader::new(text);
    let mut forms = Vec::new();
    loop {
        reader.skip_trivia();
        if reader.at_end() {
            return Ok(forms);
        }
        let line = reader.line;
        forms.push((line, reader.read()?));
    }
}

struct Reader {
    chars: Vec<char>,
    pos: usize,
    line: usize,
    depth: usize,
}

impl Reader {
    fn new(text: &str) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            line: 1,
            depth: 0,
        }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.chars.len()
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let ch = self.peek()?;
        self.pos += 1;
        if ch == '\n' {
            self.line += 1;
        }
        Some(ch)
    }

    fn skip_trivia(&mut self) {
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() {
                self.bump();
            } else if ch == ';' {
                while let Some(c) = self.bump() {
                    if c == '\n' {
                        break;
                    }
                }
            } else {
                break;
            }
        }
    }

    fn read(&mut self) -> Result<Sexp, SexpError> {
        self.skip_trivia();
        match self.peek() {
            None => Err(SexpError::UnexpectedEof),
            Some('(') => self.nested(Self::read_list),
            Some(')') => Err(SexpError::Unexpected {
                ch: ')',
                line: self.line,
            }),
            Some('"') => self.read_string(),
            Some('\'') => self.nested(|reader| {
                reader.bump();
                let quoted = reader.read()?;
                Ok(Sexp::List(vec![Sexp::symbol("quote"), quoted]))
            }),
            Some(_) => Ok(self.read_atom()),
        }
    }

    /// Run `read_inner` one nesting level down, refusing past [`MAX_DEPTH`].
    fn nested(
        &mut self,
        read_inner: impl FnOnce(&mut Self) -> Result<Sexp, SexpError>,
    ) -> Result<Sexp, SexpError> {
        if self.depth >= MAX_DEPTH {
            return Err(SexpError::TooDeep { line: self.line });
        }
        self.depth += 1;
        let form = read_inner(self);
        self.depth -= 1;
        form
    }

    fn read_list(&mut self) -> Result<Sexp, SexpError> {
        self.bump();
        let mut items = Vec::new();
        loop {
            self.skip_trivia();
            match self.peek() {
                None => return Err(SexpError::UnexpectedEof),
                Some(')') => {
                    self.bump();
                    return Ok(Sexp::List(items));
                }
                Some(_) => items.push(self.read()?),
            }
        }
    }

    fn read_string(&mut self) -> Result<Sexp, SexpError> {
        let start = self.line;
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(SexpError::UnterminatedString { line: start }),
                Some('"') => return Ok(Sexp::Str(out)),
                Some('\\') => match self.bump() {
                    None => return Err(SexpError::UnterminatedString { line: start }),
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some(other) => out.push(other),
                },
                Some(ch) => out.push(ch),
            }
        }
    }

    fn read_atom(&mut self) -> Sexp {
        let mut token = String::new();
        while let Some(ch) = self.peek() {
            if ch.is_whitespace() || matches!(ch, '(' | ')' | '"' | ';') {
                break;
            }
            token.push(ch);
            self.bump();
        }
        atom(&token)
    }
}

fn atom(token: &str) -> Sexp {
    match token {
        "nil" => return Sexp::Nil,
        "t" => return Sexp::T,
        _ => {}
    }
    if let Some(name) = token.strip_prefix(':') {
        if !name.is_empty() {
            return Sexp::Keyword(name.to_string());
        }
    }
    match token.parse::<i64>() {
        Ok(n) => Sexp::Int(n),
        Err(_) => Sexp::Symbol(token.to_string()),
    }
}
