//! Restartable IMAP command tokenizer
//!
//! The parser consumes bytes from the connection's input buffer and yields
//! IMAP tokens: atoms, quoted strings, synchronizing literals and
//! parenthesized lists. It keeps enough state that a partial read can be
//! resumed after more bytes arrive without re-scanning completed tokens.

use bytes::{Buf, BytesMut};

/// Maximum length for one IMAP command line. Exceeding it is unrecoverable.
pub const MAX_IMAP_LINE: usize = 8192;

/// Maximum size of a single literal argument.
pub const MAX_LITERAL_SIZE: usize = 4096;

/// One parsed command argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arg {
    Atom(String),
    Quoted(String),
    Literal(Vec<u8>),
    List(Vec<Arg>),
}

impl Arg {
    /// String view of an atom, quoted string or UTF-8 literal.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Arg::Atom(s) | Arg::Quoted(s) => Some(s),
            Arg::Literal(bytes) => std::str::from_utf8(bytes).ok(),
            Arg::List(_) => None,
        }
    }

    /// Raw bytes of an atom, quoted string or literal.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Arg::Atom(s) | Arg::Quoted(s) => Some(s.as_bytes()),
            Arg::Literal(bytes) => Some(bytes),
            Arg::List(_) => None,
        }
    }
}

/// Parse failure. A recoverable error leaves the input positioned inside the
/// offending line; the caller must skip to the next LF before parsing again.
/// A fatal error means the stream cannot be resynchronized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    Recoverable(&'static str),
    Fatal(&'static str),
}

impl ParseError {
    pub fn message(&self) -> &'static str {
        match self {
            ParseError::Recoverable(msg) | ParseError::Fatal(msg) => msg,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, ParseError::Fatal(_))
    }
}

#[derive(Debug)]
enum TokenState {
    /// Between arguments, skipping spaces.
    Spaces,
    Atom {
        value: Vec<u8>,
    },
    Quoted {
        value: Vec<u8>,
        escaped: bool,
    },
    /// Inside `{N`, accumulating size digits.
    LiteralSize {
        digits: String,
        nonsync: bool,
    },
    /// Size parsed, waiting for the CRLF that ends the literal prefix.
    LiteralNewline {
        size: usize,
        nonsync: bool,
        seen_cr: bool,
    },
    LiteralBytes {
        data: Vec<u8>,
        remaining: usize,
    },
}

/// Restartable parser for one IMAP command line.
pub struct ImapParser {
    args: Vec<Arg>,
    list_stack: Vec<Vec<Arg>>,
    state: TokenState,
    line_len: usize,
    error: Option<ParseError>,
    /// A synchronizing literal was announced and its octets are still owed;
    /// the connection must send a `+ OK` continuation request.
    want_continuation: bool,
}

impl Default for ImapParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ImapParser {
    pub fn new() -> Self {
        Self {
            args: Vec::new(),
            list_stack: Vec::new(),
            state: TokenState::Spaces,
            line_len: 0,
            error: None,
            want_continuation: false,
        }
    }

    /// Forget all state, ready for the next command line.
    pub fn reset(&mut self) {
        self.args.clear();
        self.list_stack.clear();
        self.state = TokenState::Spaces;
        self.line_len = 0;
        self.error = None;
        self.want_continuation = false;
    }

    /// True once if a `+ OK` continuation request should be sent to the
    /// client for a pending synchronizing literal.
    pub fn take_continuation_request(&mut self) -> bool {
        std::mem::take(&mut self.want_continuation)
    }

    /// Read one space-delimited word (used for the tag and command name).
    /// Returns `None` when the terminator has not arrived yet. The word may
    /// be empty if the line ends immediately.
    pub fn read_word(&mut self, input: &mut BytesMut) -> Option<String> {
        // leading spaces
        let mut start = 0;
        while start < input.len() && input[start] == b' ' {
            start += 1;
        }

        let mut end = start;
        while end < input.len() {
            match input[end] {
                b' ' | b'\r' | b'\n' => {
                    let word = String::from_utf8_lossy(&input[start..end]).into_owned();
                    let consume = if input[end] == b' ' { end + 1 } else { end };
                    input.advance(consume);
                    self.line_len += consume;
                    return Some(word);
                }
                _ => end += 1,
            }
        }

        None
    }

    /// Read the argument list up to (but not including) the line terminator.
    /// `Ok(None)` means more input is needed; the internal state is kept so
    /// the call can be repeated once bytes arrive.
    pub fn read_args(&mut self, input: &mut BytesMut) -> Result<Option<Vec<Arg>>, ParseError> {
        if let Some(err) = &self.error {
            return Err(err.clone());
        }

        loop {
            match self.step(input) {
                StepOutcome::Continue => {}
                StepOutcome::NeedMore => return Ok(None),
                StepOutcome::Done => return Ok(Some(std::mem::take(&mut self.args))),
                StepOutcome::Error(err) => {
                    self.error = Some(err.clone());
                    return Err(err);
                }
            }
        }
    }

    fn consume(&mut self, input: &mut BytesMut, n: usize) -> Result<(), ParseError> {
        input.advance(n);
        self.line_len += n;
        if self.line_len > MAX_IMAP_LINE {
            return Err(ParseError::Fatal("Too long argument"));
        }
        Ok(())
    }

    fn push_arg(&mut self, arg: Arg) {
        match self.list_stack.last_mut() {
            Some(list) => list.push(arg),
            None => self.args.push(arg),
        }
    }

    fn step(&mut self, input: &mut BytesMut) -> StepOutcome {
        let byte = match input.first() {
            Some(b) => *b,
            None => return StepOutcome::NeedMore,
        };

        match &mut self.state {
            TokenState::Spaces => match byte {
                b' ' => {
                    if let Err(e) = self.consume(input, 1) {
                        return StepOutcome::Error(e);
                    }
                    StepOutcome::Continue
                }
                b'\r' | b'\n' => {
                    // end of line; the terminator itself is left for the
                    // caller's skip-line pass
                    if !self.list_stack.is_empty() {
                        return StepOutcome::Error(ParseError::Recoverable("Missing ')'"));
                    }
                    StepOutcome::Done
                }
                b'(' => {
                    if let Err(e) = self.consume(input, 1) {
                        return StepOutcome::Error(e);
                    }
                    self.list_stack.push(Vec::new());
                    StepOutcome::Continue
                }
                b')' => {
                    match self.list_stack.pop() {
                        Some(list) => {
                            if let Err(e) = self.consume(input, 1) {
                                return StepOutcome::Error(e);
                            }
                            self.push_arg(Arg::List(list));
                            StepOutcome::Continue
                        }
                        None => StepOutcome::Error(ParseError::Recoverable("Unexpected ')'")),
                    }
                }
                b'"' => {
                    if let Err(e) = self.consume(input, 1) {
                        return StepOutcome::Error(e);
                    }
                    self.state = TokenState::Quoted {
                        value: Vec::new(),
                        escaped: false,
                    };
                    StepOutcome::Continue
                }
                b'{' => {
                    if let Err(e) = self.consume(input, 1) {
                        return StepOutcome::Error(e);
                    }
                    self.state = TokenState::LiteralSize {
                        digits: String::new(),
                        nonsync: false,
                    };
                    StepOutcome::Continue
                }
                _ => {
                    if let Err(e) = self.consume(input, 1) {
                        return StepOutcome::Error(e);
                    }
                    self.state = TokenState::Atom { value: vec![byte] };
                    StepOutcome::Continue
                }
            },

            TokenState::Atom { value } => match byte {
                b' ' | b'\r' | b'\n' | b')' => {
                    let atom = String::from_utf8_lossy(value).into_owned();
                    self.state = TokenState::Spaces;
                    if byte == b' ' {
                        if let Err(e) = self.consume(input, 1) {
                            return StepOutcome::Error(e);
                        }
                    }
                    self.push_arg(Arg::Atom(atom));
                    StepOutcome::Continue
                }
                _ => {
                    value.push(byte);
                    if let Err(e) = self.consume(input, 1) {
                        return StepOutcome::Error(e);
                    }
                    StepOutcome::Continue
                }
            },

            TokenState::Quoted { value, escaped } => match byte {
                b'\r' | b'\n' => StepOutcome::Error(ParseError::Recoverable("Missing '\"'")),
                _ => {
                    if *escaped {
                        *escaped = false;
                        value.push(byte);
                    } else if byte == b'\\' {
                        *escaped = true;
                    } else if byte == b'"' {
                        let quoted = String::from_utf8_lossy(value).into_owned();
                        self.state = TokenState::Spaces;
                        if let Err(e) = self.consume(input, 1) {
                            return StepOutcome::Error(e);
                        }
                        self.push_arg(Arg::Quoted(quoted));
                        return StepOutcome::Continue;
                    } else {
                        value.push(byte);
                    }
                    if let Err(e) = self.consume(input, 1) {
                        return StepOutcome::Error(e);
                    }
                    StepOutcome::Continue
                }
            },

            TokenState::LiteralSize { digits, nonsync } => match byte {
                b'0'..=b'9' => {
                    digits.push(byte as char);
                    if let Err(e) = self.consume(input, 1) {
                        return StepOutcome::Error(e);
                    }
                    StepOutcome::Continue
                }
                b'+' if !*nonsync && !digits.is_empty() => {
                    *nonsync = true;
                    if let Err(e) = self.consume(input, 1) {
                        return StepOutcome::Error(e);
                    }
                    StepOutcome::Continue
                }
                b'}' => {
                    let size: usize = match digits.parse() {
                        Ok(n) => n,
                        Err(_) => {
                            return StepOutcome::Error(ParseError::Recoverable(
                                "Invalid literal size",
                            ))
                        }
                    };
                    if size > MAX_LITERAL_SIZE {
                        return StepOutcome::Error(ParseError::Recoverable(
                            "Literal size too large",
                        ));
                    }
                    let nonsync = *nonsync;
                    self.state = TokenState::LiteralNewline {
                        size,
                        nonsync,
                        seen_cr: false,
                    };
                    if let Err(e) = self.consume(input, 1) {
                        return StepOutcome::Error(e);
                    }
                    StepOutcome::Continue
                }
                _ => StepOutcome::Error(ParseError::Recoverable("Invalid literal size")),
            },

            TokenState::LiteralNewline {
                size,
                nonsync,
                seen_cr,
            } => match byte {
                b'\r' if !*seen_cr => {
                    *seen_cr = true;
                    if let Err(e) = self.consume(input, 1) {
                        return StepOutcome::Error(e);
                    }
                    StepOutcome::Continue
                }
                b'\n' => {
                    let size = *size;
                    let nonsync = *nonsync;
                    if let Err(e) = self.consume(input, 1) {
                        return StepOutcome::Error(e);
                    }
                    if size == 0 {
                        self.state = TokenState::Spaces;
                        self.push_arg(Arg::Literal(Vec::new()));
                    } else {
                        self.state = TokenState::LiteralBytes {
                            data: Vec::with_capacity(size),
                            remaining: size,
                        };
                        if !nonsync {
                            self.want_continuation = true;
                        }
                    }
                    StepOutcome::Continue
                }
                _ => StepOutcome::Error(ParseError::Recoverable("Missing newline after literal")),
            },

            TokenState::LiteralBytes { data, remaining } => {
                let take = (*remaining).min(input.len());
                data.extend_from_slice(&input[..take]);
                *remaining -= take;
                let done = *remaining == 0;
                if done {
                    let literal = std::mem::take(data);
                    self.state = TokenState::Spaces;
                    self.want_continuation = false;
                    if let Err(e) = self.consume(input, take) {
                        return StepOutcome::Error(e);
                    }
                    self.push_arg(Arg::Literal(literal));
                } else if let Err(e) = self.consume(input, take) {
                    return StepOutcome::Error(e);
                }
                StepOutcome::Continue
            }
        }
    }
}

enum StepOutcome {
    Continue,
    NeedMore,
    Done,
    Error(ParseError),
}
