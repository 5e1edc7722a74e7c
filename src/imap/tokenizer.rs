//-
// Copyright (c) 2020, 2021, Jason Lingle
//
// This file is part of Maildepot.
//
// Maildepot is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Maildepot is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Maildepot. If not, see <http://www.gnu.org/licenses/>.

//! The incremental IMAP command tokenizer.
//!
//! A command arrives as a line (tag already stripped, newline already
//! removed), possibly followed by string-literal payloads and continuation
//! lines. The tokenizer turns this stream into a flat argument vector in
//! which parentheses and square brackets are stand-alone tokens:
//!
//! ```text
//! (body [all header])  →  ( body [ all header ] )
//! ```
//!
//! Quoted strings lose their quotes but keep their bytes verbatim;
//! grouping characters lose their meaning inside quotes. A `{n}` or
//! `{n+}` at the end of a line suspends tokenization until exactly `n`
//! bytes (and then the rest of the command line) arrive — the caller is
//! told whether it must send a continuation prompt first.
//!
//! After a bare `LOGIN` — and after `AUTHENTICATE CRAM-MD5` — subsequent
//! lines are base64-decoded straight into argument slots instead of being
//! tokenized.

use encoding_rs::mem::decode_latin1;
use lazy_static::lazy_static;
use regex::Regex;

use crate::support::error::Error;

lazy_static! {
    static ref LITERAL_AT_END: Regex =
        Regex::new(r"^\{([0-9]+)(\+?)\}$").unwrap();
}

/// What the tokenizer needs next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The command is complete.
    Ready(Vec<String>),
    /// A string literal of exactly `size` bytes must be fed through
    /// [`Tokenizer::push_literal`]. If `plus` (the non-synchronizing
    /// form), the payload follows immediately; otherwise the caller must
    /// send a `+` continuation first.
    NeedLiteral { size: u64, plus: bool },
    /// An authentication continuation line is expected; `prompt` is the
    /// text to send (base64-encoded) as the challenge.
    NeedAuthLine { prompt: &'static str },
    /// A literal payload was consumed; the rest of the command line is
    /// still outstanding.
    Continue,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Group {
    Paren,
    Bracket,
}

struct PendingLiteral {
    size: u64,
    plus: bool,
}

pub struct Tokenizer {
    max_args: usize,
    max_line: usize,
    consumed: usize,
    args: Vec<String>,
    groups: Vec<Group>,
    pending: Option<PendingLiteral>,
    auth_continuation: bool,
}

impl Tokenizer {
    pub fn new(max_args: usize, max_line: usize) -> Self {
        Tokenizer {
            max_args,
            max_line,
            consumed: 0,
            args: Vec::new(),
            groups: Vec::new(),
            pending: None,
            auth_continuation: false,
        }
    }

    /// Discard any partially-assembled command.
    pub fn reset(&mut self) {
        self.consumed = 0;
        self.args.clear();
        self.groups.clear();
        self.pending = None;
        self.auth_continuation = false;
    }

    /// Whether a command is partially assembled (more input belongs to the
    /// current command rather than starting a new one).
    pub fn in_progress(&self) -> bool {
        !self.args.is_empty()
            || self.pending.is_some()
            || self.auth_continuation
    }

    /// Feed one newline-stripped line.
    pub fn push_line(&mut self, line: &str) -> Result<Outcome, Error> {
        if self.pending.is_some() {
            return Err(Error::ProtocolSyntax(
                "literal payload expected".to_owned(),
            ));
        }

        self.consume_len(line.len())?;

        if self.auth_continuation {
            self.auth_continuation = false;
            let decoded = base64::decode(line.trim())
                .map_err(|_| {
                    Error::ProtocolSyntax("bad base64".to_owned())
                })?;
            self.push_arg(decode_bytes(&decoded))?;
            return self.finalize();
        }

        let bytes = line.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            let b = bytes[i];

            if b'"' == b {
                let (arg, end) = scan_quoted(bytes, i)?;
                self.push_arg(arg)?;
                i = end;
                continue;
            }

            match b {
                b'(' => {
                    self.groups.push(Group::Paren);
                    self.push_arg("(".to_owned())?;
                    i += 1;
                    continue;
                },
                b'[' => {
                    self.groups.push(Group::Bracket);
                    self.push_arg("[".to_owned())?;
                    i += 1;
                    continue;
                },
                b')' => {
                    if self.groups.pop() != Some(Group::Paren) {
                        return Err(Error::UnbalancedGrouping);
                    }
                    self.push_arg(")".to_owned())?;
                    i += 1;
                    continue;
                },
                b']' => {
                    if self.groups.pop() != Some(Group::Bracket) {
                        return Err(Error::UnbalancedGrouping);
                    }
                    self.push_arg("]".to_owned())?;
                    i += 1;
                    continue;
                },
                b' ' => {
                    i += 1;
                    continue;
                },
                _ => (),
            }

            if b'{' == b {
                if let Some(caps) = LITERAL_AT_END.captures(&line[i..]) {
                    let size = caps[1]
                        .parse::<u64>()
                        .map_err(|_| Error::BadLiteral)?;
                    self.consume_len(size as usize)?;
                    let plus = !caps[2].is_empty();
                    self.pending = Some(PendingLiteral { size, plus });
                    return Ok(Outcome::NeedLiteral { size, plus });
                }
            }

            // At an argument start; walk to the next delimiter.
            let start = i;
            while i < bytes.len() {
                match bytes[i] {
                    b' ' | b'[' | b']' | b'(' | b')' => break,
                    b'"' if i > start
                        && b'\\' != bytes[i - 1] => break,
                    _ => i += 1,
                }
            }
            self.push_arg(
                String::from_utf8_lossy(&bytes[start..i]).into_owned(),
            )?;
        }

        self.finalize()
    }

    /// Feed the payload of the literal previously announced by
    /// [`Outcome::NeedLiteral`]. Must be exactly the announced size.
    pub fn push_literal(&mut self, payload: &[u8]) -> Result<Outcome, Error> {
        let pending = self
            .pending
            .take()
            .ok_or(Error::BadLiteral)?;
        if payload.len() as u64 != pending.size {
            return Err(Error::BadLiteral);
        }

        self.push_arg(decode_bytes(payload))?;
        Ok(Outcome::Continue)
    }

    fn finalize(&mut self) -> Result<Outcome, Error> {
        if !self.groups.is_empty() {
            return Err(Error::UnbalancedGrouping);
        }

        if 1 == self.args.len()
            && self.args[0].eq_ignore_ascii_case("LOGIN")
        {
            self.auth_continuation = true;
            return Ok(Outcome::NeedAuthLine { prompt: "username" });
        }
        if 2 == self.args.len()
            && self.args[0].eq_ignore_ascii_case("LOGIN")
        {
            self.auth_continuation = true;
            return Ok(Outcome::NeedAuthLine { prompt: "password" });
        }
        if 2 == self.args.len()
            && self.args[0].eq_ignore_ascii_case("AUTHENTICATE")
            && self.args[1].eq_ignore_ascii_case("CRAM-MD5")
        {
            self.auth_continuation = true;
            return Ok(Outcome::NeedAuthLine { prompt: "" });
        }

        self.consumed = 0;
        Ok(Outcome::Ready(std::mem::take(&mut self.args)))
    }

    fn push_arg(&mut self, arg: String) -> Result<(), Error> {
        if self.args.len() >= self.max_args {
            return Err(Error::TooManyArguments);
        }
        self.args.push(arg);
        Ok(())
    }

    fn consume_len(&mut self, len: usize) -> Result<(), Error> {
        self.consumed = self.consumed.saturating_add(len);
        if self.consumed > self.max_line {
            Err(Error::CommandLineTooLong)
        } else {
            Ok(())
        }
    }
}

/// Scan a quoted string starting at the `"` at `bytes[start]`, returning
/// the content (quotes removed, escapes kept verbatim) and the index past
/// the closing quote.
fn scan_quoted(bytes: &[u8], start: usize) -> Result<(String, usize), Error> {
    let mut i = start + 1;
    while i < bytes.len() {
        if b'"' == bytes[i] && b'\\' != bytes[i - 1] {
            let content =
                String::from_utf8_lossy(&bytes[start + 1..i]).into_owned();
            return Ok((content, i + 1));
        }
        i += 1;
    }

    Err(Error::ProtocolSyntax("unterminated quoted string".to_owned()))
}

fn decode_bytes(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_owned(),
        // Legacy clients still send ISO-8859-1 literals.
        Err(_) => decode_latin1(bytes).into_owned(),
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn tokenizer() -> Tokenizer {
        Tokenizer::new(512, 65536)
    }

    fn ready(outcome: Outcome) -> Vec<String> {
        match outcome {
            Outcome::Ready(args) => args,
            other => panic!("expected Ready, got {:?}", other),
        }
    }

    fn tokenize(line: &str) -> Vec<String> {
        ready(tokenizer().push_line(line).unwrap())
    }

    #[test]
    fn splits_groups_into_tokens() {
        assert_eq!(
            vec!["(", "body", "[", "all", "header", "]", ")"],
            tokenize("(body [all header])")
        );
    }

    #[test]
    fn balanced_parens_round_trip() {
        assert_eq!(
            vec!["(", "foo", "(", "bar", ")", "baz", ")"],
            tokenize("(foo (bar) baz)")
        );
    }

    #[test]
    fn unbalanced_parens_error() {
        assert!(matches!(
            tokenizer().push_line("(foo (bar) baz"),
            Err(Error::UnbalancedGrouping)
        ));
        assert!(matches!(
            tokenizer().push_line("foo)"),
            Err(Error::UnbalancedGrouping)
        ));
        assert!(matches!(
            tokenizer().push_line("[foo)"),
            Err(Error::UnbalancedGrouping)
        ));
    }

    #[test]
    fn quoted_strings_lose_quotes_only() {
        assert_eq!(
            vec!["say", "hello world", "now"],
            tokenize("say \"hello world\" now")
        );
        // Escaped quotes do not terminate; escapes are kept verbatim
        assert_eq!(vec!["a\\\"b"], tokenize("\"a\\\"b\""));
        // Grouping characters are plain text inside quotes
        assert_eq!(vec!["(x)"], tokenize("\"(x)\""));
    }

    #[test]
    fn unterminated_quote_errors() {
        assert!(tokenizer().push_line("\"never closed").is_err());
    }

    #[test]
    fn literal_across_chunks() {
        let mut t = tokenizer();
        assert_eq!(
            Outcome::NeedLiteral { size: 5, plus: false },
            t.push_line("a {5}").unwrap()
        );
        assert_eq!(Outcome::Continue, t.push_literal(b"hello").unwrap());
        assert_eq!(vec!["a", "hello", "b"], ready(t.push_line(" b").unwrap()));
    }

    #[test]
    fn non_sync_literal() {
        let mut t = tokenizer();
        assert_eq!(
            Outcome::NeedLiteral { size: 3, plus: true },
            t.push_line("a {3+}").unwrap()
        );
        assert_eq!(Outcome::Continue, t.push_literal(b"xyz").unwrap());
        assert_eq!(vec!["a", "xyz"], ready(t.push_line("").unwrap()));
    }

    #[test]
    fn zero_length_literal_is_empty_arg() {
        let mut t = tokenizer();
        assert_eq!(
            Outcome::NeedLiteral { size: 0, plus: false },
            t.push_line("a {0}").unwrap()
        );
        assert_eq!(Outcome::Continue, t.push_literal(b"").unwrap());
        assert_eq!(vec!["a", ""], ready(t.push_line("").unwrap()));
    }

    #[test]
    fn wrong_literal_size_is_error() {
        let mut t = tokenizer();
        t.push_line("a {5}").unwrap();
        assert!(t.push_literal(b"hi").is_err());
    }

    #[test]
    fn brace_not_at_end_is_an_atom() {
        assert_eq!(vec!["a", "{5}x"], tokenize("a {5}x"));
    }

    #[test]
    fn login_continuation_decodes_base64() {
        let mut t = tokenizer();
        assert_eq!(
            Outcome::NeedAuthLine { prompt: "username" },
            t.push_line("LOGIN").unwrap()
        );
        assert_eq!(
            Outcome::NeedAuthLine { prompt: "password" },
            t.push_line(&base64::encode("jsmith")).unwrap()
        );
        assert_eq!(
            vec!["LOGIN", "jsmith", "hunter2"],
            ready(t.push_line(&base64::encode("hunter2")).unwrap())
        );
    }

    #[test]
    fn cram_md5_expects_one_response() {
        let mut t = tokenizer();
        assert_eq!(
            Outcome::NeedAuthLine { prompt: "" },
            t.push_line("AUTHENTICATE CRAM-MD5").unwrap()
        );
        let reply = base64::encode("jsmith 0123456789abcdef");
        assert_eq!(
            vec!["AUTHENTICATE", "CRAM-MD5", "jsmith 0123456789abcdef"],
            ready(t.push_line(&reply).unwrap())
        );
    }

    #[test]
    fn argument_limit_enforced() {
        let mut t = Tokenizer::new(4, 65536);
        assert!(matches!(
            t.push_line("a b c d e"),
            Err(Error::TooManyArguments)
        ));
    }

    #[test]
    fn line_length_limit_enforced() {
        let mut t = Tokenizer::new(512, 16);
        assert!(matches!(
            t.push_line("aaaaaaaaaaaaaaaaaaaaaaaa"),
            Err(Error::CommandLineTooLong)
        ));

        // Literal sizes count against the limit too
        let mut t = Tokenizer::new(512, 64);
        assert!(matches!(
            t.push_line("a {4096}"),
            Err(Error::CommandLineTooLong)
        ));
    }

    #[test]
    fn empty_line_is_empty_command() {
        assert_eq!(Vec::<String>::new(), tokenize(""));
    }

    #[test]
    fn reset_discards_partial_state() {
        let mut t = tokenizer();
        t.push_line("a {5}").unwrap();
        assert!(t.in_progress());
        t.reset();
        assert!(!t.in_progress());
        assert_eq!(vec!["x"], ready(t.push_line("x").unwrap()));
    }

    proptest! {
        /// Re-joining produced args with spaces and re-tokenizing is
        /// idempotent for atom-only inputs.
        #[test]
        fn atom_round_trip(
            words in proptest::collection::vec("[b-df-hj-np-tv-z0-9.:*-]{1,8}", 1..8)
        ) {
            let line = words.join(" ");
            let args = tokenize(&line);
            let rejoined = args.join(" ");
            prop_assert_eq!(args, tokenize(&rejoined));
        }
    }
}
