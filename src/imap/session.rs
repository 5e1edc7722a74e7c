//-
// Copyright (c) 2020, 2021, 2023, Jason Lingle
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

//! Per-connection session state.
//!
//! The host's event loop feeds the session complete lines (newline
//! stripped) through [`Session::receive_line`]; when a command announces a
//! string literal, [`Session::pending_literal`] tells the host how many
//! raw bytes to collect for [`Session::receive_literal`]. Responses
//! accumulate in an output buffer that is flushed to the [`ResponseSink`]
//! at command boundaries, or mid-command once it outgrows the configured
//! threshold (the backpressure mechanism for large FETCHes).
//!
//! One session is driven by one thread at a time. Command execution may be
//! offloaded (see `support::offload`), but the session object itself is
//! never mutated concurrently.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};

use super::tokenizer::{Outcome, Tokenizer};
use crate::mailbox::view::{MailboxNotice, MailboxView};
use crate::store::auth::Authenticator;
use crate::store::cache::Cache;
use crate::store::message::MessageSource;
use crate::store::query::Store;
use crate::support::config::ImapConfig;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

/// Where response bytes go. The host wires this to its connection
/// (write/cork/flush); `Vec<u8>` is accepted directly for tests.
pub trait ResponseSink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
}

impl ResponseSink for Vec<u8> {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    NotAuthenticated,
    Authenticated,
    Selected,
    /// Inside the IDLE loop; left by the client's `DONE`.
    Idle,
    Logout,
    /// Terminal: all further input is ignored until the host closes.
    Error,
    /// Pending output is drained, then the host closes.
    QuitQueued,
}

/// Whether newly arrived bytes continue the current command or start a
/// new one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CommandPhase {
    NewCommand,
    InCommand,
    IdleLoop,
}

pub struct Session<S> {
    pub(super) store: Arc<dyn Store>,
    pub(super) source: Arc<dyn MessageSource>,
    pub(super) auth: Arc<dyn Authenticator>,
    pub(super) cache: Arc<Cache>,
    pub(super) config: Arc<ImapConfig>,
    pub(super) log_prefix: LogPrefix,
    pub(super) peer: String,

    sink: S,
    out: Vec<u8>,

    pub(super) state: SessionState,
    phase: CommandPhase,
    tokenizer: Tokenizer,
    pending_literal: Option<u64>,
    pub(super) tag: String,
    pub(super) user_id: Option<u64>,
    pub(super) selected: Option<MailboxView>,
    pub(super) cram_challenge: Option<String>,
    error_count: u32,
}

impl<S: ResponseSink> Session<S> {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn MessageSource>,
        auth: Arc<dyn Authenticator>,
        cache: Arc<Cache>,
        config: Arc<ImapConfig>,
        peer: String,
        sink: S,
    ) -> Self {
        let tokenizer =
            Tokenizer::new(config.max_args, config.max_command_line);
        Session {
            store,
            source,
            auth,
            cache,
            config,
            log_prefix: LogPrefix::new(peer.clone()),
            peer,
            sink,
            out: Vec::new(),
            state: SessionState::NotAuthenticated,
            phase: CommandPhase::NewCommand,
            tokenizer,
            pending_literal: None,
            tag: String::new(),
            user_id: None,
            selected: None,
            cram_challenge: None,
            error_count: 0,
        }
    }

    /// Send the greeting. Called once, before any input.
    pub fn greet(&mut self) -> Result<(), Error> {
        self.emit(
            format!(
                "* OK maildepot {} ready\r\n",
                env!("CARGO_PKG_VERSION")
            )
            .as_bytes(),
        )?;
        self.flush()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// If a string literal is outstanding, the exact byte count the host
    /// must deliver to [`Session::receive_literal`] next.
    pub fn pending_literal(&self) -> Option<u64> {
        self.pending_literal
    }

    /// The idle timeout the host should arm, which lengthens once the
    /// session authenticates.
    pub fn idle_duration(&self) -> Duration {
        if self.user_id.is_some() {
            Duration::from_secs(self.config.auth_timeout_secs)
        } else {
            Duration::from_secs(self.config.preauth_timeout_secs)
        }
    }

    /// Handle the idle timer firing. Inside IDLE this is a keep-alive;
    /// anywhere else it ends the session.
    pub fn on_timeout(&mut self) -> Result<(), Error> {
        match self.state {
            SessionState::Idle => {
                self.emit(b"* OK still here\r\n")?;
                self.flush()
            },
            SessionState::Error
            | SessionState::Logout
            | SessionState::QuitQueued => Ok(()),
            _ => {
                warn!("{} connection timed out", self.log_prefix);
                self.emit(b"* BYE Connection timed out\r\n")?;
                self.state = SessionState::Error;
                self.flush()
            },
        }
    }

    /// Feed one newline-stripped input line.
    pub fn receive_line(&mut self, line: &str) -> Result<(), Error> {
        match self.state {
            SessionState::Error
            | SessionState::Logout
            | SessionState::QuitQueued => return Ok(()),
            _ => (),
        }

        if CommandPhase::IdleLoop == self.phase {
            return self.receive_idle_line(line);
        }

        let outcome = if CommandPhase::NewCommand == self.phase {
            let (tag, rest) = match split_tag(line) {
                Some(split) => split,
                None => {
                    self.emit(b"* BAD Invalid tag\r\n")?;
                    return self.command_failed();
                },
            };
            self.tag = tag.to_owned();
            self.phase = CommandPhase::InCommand;
            self.tokenizer.push_line(rest)
        } else {
            self.tokenizer.push_line(line)
        };

        self.handle_outcome(outcome)
    }

    /// Feed the raw payload of a previously announced literal.
    pub fn receive_literal(&mut self, payload: &[u8]) -> Result<(), Error> {
        match self.state {
            SessionState::Error
            | SessionState::Logout
            | SessionState::QuitQueued => return Ok(()),
            _ => (),
        }

        self.pending_literal = None;
        let outcome = self.tokenizer.push_literal(payload);
        self.handle_outcome(outcome)
    }

    fn handle_outcome(
        &mut self,
        outcome: Result<Outcome, Error>,
    ) -> Result<(), Error> {
        match outcome {
            Ok(Outcome::Ready(args)) => {
                self.phase = CommandPhase::NewCommand;
                self.dispatch(args)
            },
            Ok(Outcome::NeedLiteral { size, plus }) => {
                self.pending_literal = Some(size);
                if !plus {
                    self.emit(b"+ OK gimme that string\r\n")?;
                    self.flush()?;
                }
                Ok(())
            },
            Ok(Outcome::NeedAuthLine { prompt }) => {
                let challenge = if prompt.is_empty() {
                    let challenge = self.make_cram_challenge();
                    let encoded = base64::encode(&challenge);
                    self.cram_challenge = Some(challenge);
                    encoded
                } else {
                    base64::encode(prompt)
                };
                self.emit(format!("+ {}\r\n", challenge).as_bytes())?;
                self.flush()
            },
            Ok(Outcome::Continue) => Ok(()),
            Err(e) => {
                let text = e.to_string();
                self.tokenizer.reset();
                self.pending_literal = None;
                self.phase = CommandPhase::NewCommand;
                if self.tag.is_empty() {
                    self.emit(
                        format!("* BAD {}\r\n", text).as_bytes(),
                    )?;
                } else {
                    self.respond("BAD", &text)?;
                }
                self.command_failed()
            },
        }
    }

    fn receive_idle_line(&mut self, line: &str) -> Result<(), Error> {
        if line.trim().eq_ignore_ascii_case("DONE") {
            self.phase = CommandPhase::NewCommand;
            self.state = if self.selected.is_some() {
                SessionState::Selected
            } else {
                SessionState::Authenticated
            };
            self.poll_selected()?;
            self.respond("OK", "IDLE terminated")?;
            self.command_done()
        } else {
            self.emit(b"+ expected DONE\r\n")?;
            self.flush()
        }
    }

    /// Enter the IDLE loop; left again when the client sends `DONE`.
    pub(super) fn enter_idle(&mut self) {
        self.phase = CommandPhase::IdleLoop;
        self.state = SessionState::Idle;
    }

    /// The challenge text for CRAM-MD5, unique per session attempt.
    fn make_cram_challenge(&self) -> String {
        let stamp = chrono::Utc::now().timestamp();
        format!("<{}.{}@maildepot>", self.peer.len(), stamp)
    }

    /// Refresh the selected mailbox from the store and emit the resulting
    /// unsolicited responses (EXPUNGE strictly before EXISTS).
    pub(super) fn poll_selected(&mut self) -> Result<(), Error> {
        let mut view = match self.selected.take() {
            Some(view) => view,
            None => return Ok(()),
        };

        let result = self
            .store
            .poll_mailbox(view.id)
            .map(|data| view.refresh(data));
        let notices = match result {
            Ok(notices) => notices,
            Err(e) => {
                self.selected = Some(view);
                return Err(e);
            },
        };

        self.selected = Some(view);
        self.emit_notices(&notices)
    }

    pub(super) fn emit_notices(
        &mut self,
        notices: &[MailboxNotice],
    ) -> Result<(), Error> {
        for notice in notices {
            let line = match *notice {
                MailboxNotice::Expunge(msn) => {
                    format!("* {} EXPUNGE\r\n", msn)
                },
                MailboxNotice::Exists(n) => format!("* {} EXISTS\r\n", n),
                MailboxNotice::Recent(n) => format!("* {} RECENT\r\n", n),
            };
            self.emit(line.as_bytes())?;
        }
        Ok(())
    }

    /// Append to the output buffer, flushing mid-command once it exceeds
    /// the configured threshold.
    pub(super) fn emit(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.out.extend_from_slice(bytes);
        if self.out.len() > self.config.output_flush_threshold {
            self.flush()?;
        }
        Ok(())
    }

    pub(super) fn flush(&mut self) -> Result<(), Error> {
        if !self.out.is_empty() {
            self.sink.write_all(&self.out)?;
            self.out.clear();
        }
        self.sink.flush()?;
        Ok(())
    }

    /// Write the tagged final response for the current command.
    pub(super) fn respond(
        &mut self,
        cond: &str,
        text: &str,
    ) -> Result<(), Error> {
        let line = format!("{} {} {}\r\n", self.tag, cond, text);
        self.emit(line.as_bytes())
    }

    /// A command completed successfully: reset the error budget and drain
    /// output.
    pub(super) fn command_done(&mut self) -> Result<(), Error> {
        self.error_count = 0;
        self.flush()
    }

    /// A command failed at the protocol level. Too many of these in a row
    /// and the client is cut off.
    pub(super) fn command_failed(&mut self) -> Result<(), Error> {
        self.error_count += 1;
        if self.error_count >= self.config.max_consecutive_errors {
            info!(
                "{} dropping connection after {} consecutive errors",
                self.log_prefix, self.error_count
            );
            self.emit(b"* BYE Too many invalid commands\r\n")?;
            self.state = SessionState::Error;
        }
        self.flush()
    }

    /// Unrecoverable failure: report, then refuse further work.
    pub(super) fn fatal(&mut self, text: &str) -> Result<(), Error> {
        self.emit(format!("* BYE {}\r\n", text).as_bytes())?;
        self.state = SessionState::Error;
        self.flush()
    }
}

fn split_tag(line: &str) -> Option<(&str, &str)> {
    let line = line.trim_start();
    let split = line.find(' ')?;
    let (tag, rest) = line.split_at(split);
    if tag.is_empty()
        || !tag.bytes().all(|b| {
            b.is_ascii_alphanumeric()
                || matches!(b, b'.' | b'-' | b'_' | b'+' | b'*' | b'!')
        })
    {
        return None;
    }

    Some((tag, &rest[1..]))
}
