//! Line tokenizer and parser.
//!
//! A command line is split into one argument vector per pipeline stage. The parser is a
//! small finite state machine over the characters of the line, honoring quotes,
//! backslash escapes, the pipe operator `|` and a single trailing redirection (`>` or
//! `>>`). The same state machine also runs in a mode where `|` and `>` are ordinary
//! characters, used for already-isolated argument lists.

use std::borrow::Cow;
use std::fmt;

use crate::error::ParseError;

/// One pipeline stage: element 0 is the command name, the rest are its arguments.
pub type ArgumentVector = Vec<String>;

/// How a redirect target is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedirectMode {
    /// `>`: start from an empty sink.
    Truncate,
    /// `>>`: keep what the sink already holds.
    Append,
}

impl RedirectMode {
    /// The operator text, which is also the name the redirect command is registered under.
    pub fn operator(self) -> &'static str {
        match self {
            RedirectMode::Truncate => ">",
            RedirectMode::Append => ">>",
        }
    }
}

/// Optional trailing `> target` / `>> target` of a line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectionSpec {
    pub mode: RedirectMode,
    pub target: String,
}

/// Result of parsing one non-empty line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedLine {
    /// Argument vectors in pipeline order. Never empty, and no vector is empty.
    pub stages: Vec<ArgumentVector>,
    /// Redirection of the last stage's output, if any.
    pub redirect: Option<RedirectionSpec>,
}

impl ParsedLine {
    /// Flatten into the stage list the executor runs. A redirect becomes a synthetic
    /// final stage `[operator, target]`.
    pub fn into_stages(self) -> Vec<ArgumentVector> {
        let mut stages = self.stages;
        if let Some(redirect) = self.redirect {
            stages.push(vec![redirect.mode.operator().to_string(), redirect.target]);
        }
        stages
    }
}

impl fmt::Display for ParsedLine {
    /// Re-serialize with minimal quoting. Parsing the output yields the same value.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, stage) in self.stages.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            f.write_str(&join_arguments(stage))?;
        }
        if let Some(redirect) = &self.redirect {
            write!(
                f,
                " {} {}",
                redirect.mode.operator(),
                quote_argument(&redirect.target)
            )?;
        }
        Ok(())
    }
}

/// Characters that end or alter a plain argument.
fn is_special(c: char) -> bool {
    c.is_whitespace() || matches!(c, '|' | '>' | '\\' | '\'' | '"')
}

/// Quote a single argument so that the parser reads it back unchanged.
///
/// Plain arguments are returned as-is. Otherwise the argument is wrapped in single
/// quotes, or double quotes when it contains a single quote, or finally escaped
/// character by character when it contains both.
pub fn quote_argument(arg: &str) -> Cow<'_, str> {
    if arg.is_empty() {
        return Cow::Borrowed("''");
    }
    if !arg.starts_with('#') && !arg.chars().any(is_special) {
        return Cow::Borrowed(arg);
    }
    if !arg.contains('\'') {
        return Cow::Owned(format!("'{arg}'"));
    }
    if !arg.contains('"') {
        return Cow::Owned(format!("\"{arg}\""));
    }
    let mut escaped = String::with_capacity(arg.len() * 2);
    for c in arg.chars() {
        if is_special(c) || c == '#' {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    Cow::Owned(escaped)
}

/// Join an argument vector into a line fragment using [`quote_argument`].
pub fn join_arguments(args: &[String]) -> String {
    args.iter()
        .map(|a| quote_argument(a))
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexingState {
    /// Between arguments.
    Plain,
    /// Inside an unquoted argument (or right after a closing quote).
    InArgument,
    /// Inside a quoted region delimited by the given character.
    InQuote(char),
}

#[derive(Debug)]
struct PendingRedirect {
    mode: RedirectMode,
    /// Position in the last stage's argument list where the target is expected.
    arg_index: usize,
}

struct LexingFSM {
    input: Vec<char>,
    pos: usize,
    state: LexingState,
    pipes_and_redirects: bool,
    stages: Vec<ArgumentVector>,
    current: ArgumentVector,
    buffer: String,
    redirect: Option<PendingRedirect>,
    /// True while the previous character was a redirect operator.
    after_operator: bool,
}

impl LexingFSM {
    fn new(line: &str, pipes_and_redirects: bool) -> Self {
        LexingFSM {
            input: line.chars().collect(),
            pos: 0,
            state: LexingState::Plain,
            pipes_and_redirects,
            stages: Vec::new(),
            current: Vec::new(),
            buffer: String::new(),
            redirect: None,
            after_operator: false,
        }
    }

    fn read_char(&mut self) -> Option<char> {
        let ch = self.input.get(self.pos).copied();
        if ch.is_some() {
            self.pos += 1;
        }
        ch
    }

    fn run(mut self) -> Result<Option<ParsedLine>, ParseError> {
        while let Some(ch) = self.read_char() {
            let after_operator = std::mem::replace(&mut self.after_operator, false);
            match self.state {
                LexingState::InQuote(quote) => self.handle_quote(ch, quote),
                LexingState::Plain | LexingState::InArgument => {
                    self.handle_text(ch, after_operator)?
                }
            }
        }

        if let LexingState::InQuote(_) = self.state {
            return Err(ParseError::UnexpectedEndOfLine);
        }
        self.finish_argument();

        let redirect = match self.redirect.take() {
            Some(pending) => {
                if pending.arg_index >= self.current.len() {
                    return Err(ParseError::NoRedirectTarget);
                }
                let target = self.current.remove(pending.arg_index);
                Some(RedirectionSpec {
                    mode: pending.mode,
                    target,
                })
            }
            None => None,
        };

        if self.current.is_empty() {
            if self.stages.is_empty() && redirect.is_none() {
                return Ok(None);
            }
            return Err(ParseError::EmptyCommand);
        }
        self.stages.push(std::mem::take(&mut self.current));

        Ok(Some(ParsedLine {
            stages: self.stages,
            redirect,
        }))
    }

    fn handle_quote(&mut self, ch: char, quote: char) {
        if ch == quote {
            self.state = LexingState::InArgument;
        } else {
            self.buffer.push(ch);
        }
    }

    fn handle_text(&mut self, ch: char, after_operator: bool) -> Result<(), ParseError> {
        match ch {
            c if c.is_whitespace() => self.finish_argument(),
            '\\' => {
                let escaped = self.read_char().ok_or(ParseError::UnexpectedEndOfLine)?;
                self.buffer.push(escaped);
                self.state = LexingState::InArgument;
            }
            '\'' | '"' => self.state = LexingState::InQuote(ch),
            '|' if self.pipes_and_redirects => {
                if self.redirect.is_some() {
                    return Err(ParseError::PipeAfterRedirect);
                }
                self.finish_argument();
                if self.current.is_empty() {
                    return Err(ParseError::EmptyCommand);
                }
                self.stages.push(std::mem::take(&mut self.current));
            }
            '>' if self.pipes_and_redirects => {
                self.finish_argument();
                match &mut self.redirect {
                    Some(pending) if after_operator && pending.mode == RedirectMode::Truncate => {
                        pending.mode = RedirectMode::Append;
                    }
                    Some(_) => return Err(ParseError::RedirectedTwice),
                    None => {
                        self.redirect = Some(PendingRedirect {
                            mode: RedirectMode::Truncate,
                            arg_index: self.current.len(),
                        });
                    }
                }
                self.after_operator = true;
            }
            c => {
                self.buffer.push(c);
                self.state = LexingState::InArgument;
            }
        }
        Ok(())
    }

    fn finish_argument(&mut self) {
        if self.state == LexingState::InArgument {
            self.current.push(std::mem::take(&mut self.buffer));
            self.state = LexingState::Plain;
        }
    }
}

/// Line parser with an explicit switch for pipe and redirect handling.
///
/// With `pipes_and_redirects` disabled the same text is read as a single argument
/// vector and `|` / `>` are ordinary characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parser {
    pipes_and_redirects: bool,
}

impl Parser {
    pub fn new(pipes_and_redirects: bool) -> Self {
        Self {
            pipes_and_redirects,
        }
    }

    /// Parse one raw line.
    ///
    /// Returns `Ok(None)` for blank lines and comments (first non-blank character `#`).
    pub fn parse(&self, line: &str) -> Result<Option<ParsedLine>, ParseError> {
        if line.trim_start().starts_with('#') {
            return Ok(None);
        }
        LexingFSM::new(line, self.pipes_and_redirects).run()
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Parse a command line with pipes and redirection.
pub fn parse_line(line: &str) -> Result<Option<ParsedLine>, ParseError> {
    Parser::new(true).parse(line)
}

/// Parse a single argument vector; `|` and `>` are not operators.
pub fn parse_arguments(line: &str) -> Result<ArgumentVector, ParseError> {
    let parsed = Parser::new(false).parse(line)?;
    Ok(parsed
        .and_then(|p| p.stages.into_iter().next())
        .unwrap_or_default())
}
