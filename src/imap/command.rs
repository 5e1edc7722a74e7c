//-
// Copyright (c) 2020, 2021, 2022, Jason Lingle
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

//! Command dispatch and the individual command handlers.
//!
//! Handlers receive the tokenized argument vector (`args[0]` is the
//! command, or the subcommand for `UID`) and are responsible for writing
//! their own tagged completion response. A handler returning `Err` has
//! written nothing final; the dispatcher turns the error into `BAD`
//! (syntax), `NO` (semantic), or `* BYE` plus the Error state (backend
//! failure), matching the taxonomy the original daemon used.

use std::sync::Arc;

use chrono::DateTime;
use log::{info, warn};

use super::fetch::FetchResponseBuilder;
use super::fetch_items::{FetchItems, SimpleItems};
use super::lex::LexWriter;
use super::session::{ResponseSink, Session, SessionState};
use crate::mailbox::model::{Flag, FlagsMode, Uid};
use crate::mailbox::search::SearchEngine;
use crate::mailbox::search_tree::{SearchOrder, SearchTree};
use crate::mailbox::view::MailboxView;
use crate::store::auth::{AuthContext, AuthOutcome};
use crate::store::message::crlf_normalize;
use crate::support::error::Error;

static PRE_AUTH_CAPABILITIES: &str =
    "IMAP4rev1 AUTH=LOGIN AUTH=CRAM-MD5 LITERAL+ CHILDREN";

static POST_AUTH_CAPABILITIES: &str =
    "IMAP4rev1 LITERAL+ CHILDREN ACL NAMESPACE SORT UNSELECT IDLE";

impl<S: ResponseSink> Session<S> {
    pub(super) fn dispatch(&mut self, args: Vec<String>) -> Result<(), Error> {
        if args.is_empty() {
            self.respond("BAD", "Null command")?;
            return self.command_failed();
        }

        let mut idx = 0;
        let mut uid_command = false;
        if args[0].eq_ignore_ascii_case("UID") {
            uid_command = true;
            idx = 1;
            if args.len() < 2 {
                self.respond("BAD", "UID without a command")?;
                return self.command_failed();
            }
        }

        let command = args[idx].to_ascii_uppercase();
        idx += 1;

        let result = match command.as_str() {
            "CAPABILITY" => self.cmd_capability(),
            "NOOP" => self.cmd_poll("NOOP"),
            "CHECK" => self.cmd_poll("CHECK"),
            "LOGOUT" => self.cmd_logout(),
            "LOGIN" => self.cmd_login(&args, idx),
            "AUTHENTICATE" => self.cmd_authenticate(&args, idx),
            "SELECT" => self.cmd_select(&args, idx, false),
            "EXAMINE" => self.cmd_select(&args, idx, true),
            "CLOSE" => self.cmd_close(),
            "UNSELECT" => self.cmd_unselect(),
            "EXPUNGE" => self.cmd_expunge(),
            "SEARCH" => {
                self.cmd_search(&args, idx, uid_command, SearchOrder::Unordered)
            },
            "SORT" => {
                self.cmd_search(&args, idx, uid_command, SearchOrder::Sorted)
            },
            "FETCH" => self.cmd_fetch(&args, idx, uid_command),
            "STORE" => self.cmd_store(&args, idx, uid_command),
            "COPY" => self.cmd_copy(&args, idx, uid_command),
            "LIST" => self.cmd_list(&args, idx, false),
            "LSUB" => self.cmd_list(&args, idx, true),
            "STATUS" => self.cmd_status(&args, idx),
            "CREATE" | "DELETE" | "RENAME" | "SUBSCRIBE" | "UNSUBSCRIBE" => {
                self.cmd_mailbox_admin(&command, &args, idx)
            },
            "APPEND" => self.cmd_append(&args, idx),
            "IDLE" => self.cmd_idle(),
            _ => Err(Error::UnknownCommand),
        };

        match result {
            Ok(()) => self.command_done(),
            Err(e) => self.command_error(e),
        }
    }

    fn command_error(&mut self, e: Error) -> Result<(), Error> {
        if e.is_syntax() {
            self.respond("BAD", &e.to_string())?;
            return self.command_failed();
        }

        match e {
            Error::Storage(ref text) => {
                warn!("{} storage failure: {}", self.log_prefix, text);
                self.fatal("Internal database error")
            },
            Error::MessageRender(ref text) => {
                warn!("{} message render failure: {}", self.log_prefix, text);
                self.fatal("Error fetching message")
            },
            Error::Io(e) => Err(Error::Io(e)),
            Error::SessionDead => {
                self.state = SessionState::Error;
                Ok(())
            },
            other => {
                self.respond("NO", &other.to_string())?;
                self.command_done()
            },
        }
    }

    fn require_auth(&self) -> Result<u64, Error> {
        self.user_id.ok_or(Error::BadState)
    }

    fn take_selected(&mut self) -> Result<MailboxView, Error> {
        self.selected.take().ok_or(Error::BadState)
    }

    fn auth_context(&self) -> AuthContext {
        AuthContext {
            peer: self.peer.clone(),
            secure: false,
        }
    }

    fn arg<'a>(&self, args: &'a [String], ix: usize) -> Result<&'a str, Error> {
        args.get(ix).map(String::as_str).ok_or_else(|| {
            Error::ProtocolSyntax("missing argument".to_owned())
        })
    }

    fn cmd_capability(&mut self) -> Result<(), Error> {
        let caps = if self.user_id.is_some() {
            POST_AUTH_CAPABILITIES
        } else {
            PRE_AUTH_CAPABILITIES
        };
        self.emit(format!("* CAPABILITY {}\r\n", caps).as_bytes())?;
        self.respond("OK", "CAPABILITY completed")
    }

    fn cmd_poll(&mut self, label: &str) -> Result<(), Error> {
        self.poll_selected()?;
        self.respond("OK", &format!("{} completed", label))
    }

    fn cmd_logout(&mut self) -> Result<(), Error> {
        self.emit(b"* BYE maildepot logging out\r\n")?;
        self.respond("OK", "LOGOUT completed")?;
        self.state = SessionState::Logout;
        Ok(())
    }

    fn cmd_login(&mut self, args: &[String], idx: usize) -> Result<(), Error> {
        if SessionState::NotAuthenticated != self.state {
            return Err(Error::BadState);
        }

        let user = self.arg(args, idx)?.to_owned();
        let pass = self.arg(args, idx + 1)?.to_owned();

        match self.auth.validate(&self.auth_context(), &user, &pass)? {
            AuthOutcome::Accepted { user_id } => {
                self.finish_login(user_id, &user)?;
                self.respond("OK", "LOGIN completed")
            },
            AuthOutcome::Rejected => {
                info!("{} failed login for {}", self.log_prefix, user);
                self.respond("NO", "Authentication failed")
            },
        }
    }

    fn cmd_authenticate(
        &mut self,
        args: &[String],
        idx: usize,
    ) -> Result<(), Error> {
        if SessionState::NotAuthenticated != self.state {
            return Err(Error::BadState);
        }

        let mechanism = self.arg(args, idx)?.to_ascii_uppercase();
        if "CRAM-MD5" != mechanism {
            return self
                .respond("NO", "Authentication mechanism not available");
        }

        let response = self.arg(args, idx + 1)?.to_owned();
        let challenge = self
            .cram_challenge
            .take()
            .ok_or(Error::BadState)?;

        // Response is "username digest"; user names cannot contain
        // spaces, the digest certainly doesn't.
        let mut halves = response.rsplitn(2, ' ');
        let digest = halves.next().unwrap_or("");
        let user = halves.next().unwrap_or("").to_owned();
        if user.is_empty() {
            return Err(Error::ProtocolSyntax(
                "malformed CRAM-MD5 response".to_owned(),
            ));
        }

        match self.auth.validate_digest(
            &self.auth_context(),
            &challenge,
            &user,
            digest,
        )? {
            AuthOutcome::Accepted { user_id } => {
                self.finish_login(user_id, &user)?;
                self.respond("OK", "AUTHENTICATE completed")
            },
            AuthOutcome::Rejected => {
                info!("{} failed CRAM-MD5 for {}", self.log_prefix, user);
                self.respond("NO", "Authentication failed")
            },
        }
    }

    fn finish_login(&mut self, user_id: u64, user: &str) -> Result<(), Error> {
        self.user_id = Some(user_id);
        self.state = SessionState::Authenticated;
        self.log_prefix.set_user(user.to_owned());
        info!("{} authenticated", self.log_prefix);
        // The capability set changes on authentication; volunteer the new
        // one so clients need not ask again.
        self.emit(
            format!("* CAPABILITY {}\r\n", POST_AUTH_CAPABILITIES)
                .as_bytes(),
        )
    }

    fn cmd_select(
        &mut self,
        args: &[String],
        idx: usize,
        examine: bool,
    ) -> Result<(), Error> {
        let user = self.require_auth()?;
        let name = self.arg(args, idx)?.to_owned();

        // A failed SELECT leaves nothing selected.
        self.selected = None;
        self.state = SessionState::Authenticated;
        self.log_prefix.set_mailbox(None);

        let data = self
            .store
            .load_mailbox(user, &name)?
            .ok_or(Error::NxMailbox)?;
        let mut view = MailboxView::from_data(data);
        if examine {
            view.writable = false;
        }

        self.emit(format!("* {} EXISTS\r\n", view.exists()).as_bytes())?;
        self.emit(format!("* {} RECENT\r\n", view.recent).as_bytes())?;
        if let Some(first_unseen) = view.first_unseen {
            self.emit(
                format!(
                    "* OK [UNSEEN {}] first unseen message\r\n",
                    first_unseen
                )
                .as_bytes(),
            )?;
        }
        self.emit(
            format!("* OK [UIDVALIDITY {}] UID validity\r\n", view.uidvalidity)
                .as_bytes(),
        )?;
        self.emit(
            format!("* OK [UIDNEXT {}] predicted next UID\r\n", view.uidnext)
                .as_bytes(),
        )?;

        let mut flags = String::from(
            "\\Seen \\Answered \\Flagged \\Deleted \\Draft \\Recent",
        );
        for keyword in &view.keywords {
            flags.push(' ');
            flags.push_str(keyword);
        }
        self.emit(format!("* FLAGS ({})\r\n", flags).as_bytes())?;
        if view.writable {
            self.emit(
                format!(
                    "* OK [PERMANENTFLAGS ({} \\*)] flags allowed\r\n",
                    flags.replace(" \\Recent", "")
                )
                .as_bytes(),
            )?;
        } else {
            self.emit(b"* OK [PERMANENTFLAGS ()] read-only\r\n")?;
        }

        let access = if view.writable {
            "[READ-WRITE]"
        } else {
            "[READ-ONLY]"
        };
        let label = if examine { "EXAMINE" } else { "SELECT" };
        self.log_prefix.set_mailbox(Some(name));
        self.selected = Some(view);
        self.state = SessionState::Selected;
        self.respond("OK", &format!("{} {} completed", access, label))
    }

    fn cmd_close(&mut self) -> Result<(), Error> {
        let view = self.take_selected()?;
        if view.writable {
            // CLOSE expunges silently.
            let uids: Vec<Uid> = view.uids.keys().collect();
            self.store.expunge(view.id, &uids)?;
        }

        self.state = SessionState::Authenticated;
        self.log_prefix.set_mailbox(None);
        self.respond("OK", "CLOSE completed")
    }

    fn cmd_unselect(&mut self) -> Result<(), Error> {
        self.take_selected()?;
        self.state = SessionState::Authenticated;
        self.log_prefix.set_mailbox(None);
        self.respond("OK", "UNSELECT completed")
    }

    fn cmd_expunge(&mut self) -> Result<(), Error> {
        let mut view = self.take_selected()?;
        if !view.writable {
            self.selected = Some(view);
            return Err(Error::MailboxReadOnly);
        }

        let uids: Vec<Uid> = view.uids.keys().collect();
        let result = self.store.expunge(view.id, &uids);
        let expunged = match result {
            Ok(expunged) => expunged,
            Err(e) => {
                self.selected = Some(view);
                return Err(e);
            },
        };

        for uid in expunged {
            if let Some(msn) = view.remove(uid) {
                self.emit(format!("* {} EXPUNGE\r\n", msn).as_bytes())?;
            }
        }

        self.selected = Some(view);
        self.respond("OK", "EXPUNGE completed")
    }

    fn cmd_search(
        &mut self,
        args: &[String],
        idx: usize,
        uid_command: bool,
        order: SearchOrder,
    ) -> Result<(), Error> {
        let view = self.take_selected()?;
        let result = self.search_inner(args, idx, uid_command, order, &view);
        self.selected = Some(view);

        let (label, ids) = result?;
        let mut line = format!("* {}", label);
        for id in ids {
            line.push(' ');
            line.push_str(&id);
        }
        line.push_str("\r\n");
        self.emit(line.as_bytes())?;
        self.respond("OK", &format!("{} completed", label))
    }

    fn search_inner(
        &mut self,
        args: &[String],
        idx: usize,
        uid_command: bool,
        order: SearchOrder,
        view: &MailboxView,
    ) -> Result<(&'static str, Vec<String>), Error> {
        let mut tree = SearchTree::new(uid_command);
        let mut cursor = idx;
        tree.build(args, &mut cursor, order)?;

        let store = Arc::clone(&self.store);
        let prefix = self.config.table_prefix.clone();
        let engine = SearchEngine::new(&*store, view, &prefix);
        let found = engine.search(&mut tree)?;

        let ids = if SearchOrder::Sorted == order {
            let sorted = engine.sort(&mut tree, &found)?;
            sorted
                .into_iter()
                .map(|uid| {
                    if uid_command {
                        uid.to_string()
                    } else {
                        view.uid_to_msn(uid)
                            .map(|msn| msn.to_string())
                            .unwrap_or_default()
                    }
                })
                .collect()
        } else {
            found
                .iter()
                .map(|(uid, msn)| {
                    if uid_command {
                        uid.to_string()
                    } else {
                        msn.to_string()
                    }
                })
                .collect()
        };

        let label = if SearchOrder::Sorted == order {
            "SORT"
        } else {
            "SEARCH"
        };
        Ok((label, ids))
    }

    fn cmd_fetch(
        &mut self,
        args: &[String],
        idx: usize,
        uid_command: bool,
    ) -> Result<(), Error> {
        let user = self.require_auth()?;
        let view = self.take_selected()?;
        let result =
            self.fetch_inner(args, idx, uid_command, user, &view);
        self.selected = Some(view);
        result?;
        self.respond("OK", "FETCH completed")
    }

    fn fetch_inner(
        &mut self,
        args: &[String],
        idx: usize,
        uid_command: bool,
        user: u64,
        view: &MailboxView,
    ) -> Result<(), Error> {
        let set = self.arg(args, idx)?;
        let batch = view.resolve_set(set, uid_command)?;

        let mut cursor = idx + 1;
        let mut items = FetchItems::parse(args, &mut cursor)?;
        if uid_command {
            items.simple |= SimpleItems::UID;
        }

        let store = Arc::clone(&self.store);
        let source = Arc::clone(&self.source);
        let cache = Arc::clone(&self.cache);
        let prefix = self.config.table_prefix.clone();
        let uids: Vec<Uid> = batch.keys().collect();
        let builder = FetchResponseBuilder::new(
            &*store,
            &*source,
            &cache,
            view,
            &prefix,
            user,
            uid_command,
            uids.clone(),
        );

        // Responses go out in ascending sequence order; the buffer is
        // drained after every message to bound its growth.
        for uid in uids {
            let mut chunk = Vec::new();
            if builder.fetch_message(&mut items, uid, &mut chunk)? {
                self.emit(&chunk)?;
                self.flush()?;
            }
        }

        Ok(())
    }

    fn cmd_store(
        &mut self,
        args: &[String],
        idx: usize,
        uid_command: bool,
    ) -> Result<(), Error> {
        let view = self.take_selected()?;
        let result = self.store_inner(args, idx, uid_command, &view);
        self.selected = Some(view);
        result?;
        self.respond("OK", "STORE completed")
    }

    fn store_inner(
        &mut self,
        args: &[String],
        idx: usize,
        uid_command: bool,
        view: &MailboxView,
    ) -> Result<(), Error> {
        if !view.writable {
            return Err(Error::MailboxReadOnly);
        }

        let set = self.arg(args, idx)?;
        let batch = view.resolve_set(set, uid_command)?;

        let action = self.arg(args, idx + 1)?.to_ascii_uppercase();
        let silent = action.ends_with(".SILENT");
        let base = action.trim_end_matches(".SILENT");
        let mode = match base {
            "FLAGS" => FlagsMode::Replace,
            "+FLAGS" => FlagsMode::Add,
            "-FLAGS" => FlagsMode::Remove,
            _ => {
                return Err(Error::ProtocolSyntax(format!(
                    "bad STORE action {}",
                    action
                )))
            },
        };

        let mut flags = Vec::new();
        for token in &args[idx + 2..] {
            if "(" == token || ")" == token {
                continue;
            }
            flags.push(token.parse::<Flag>()?);
        }

        let store = Arc::clone(&self.store);
        for (uid, msn) in batch.iter() {
            let new_flags = store.set_flags(view.id, uid, &flags, mode)?;
            if !silent {
                let mut w = LexWriter::new(Vec::<u8>::new());
                w.verbatim(&format!("* {} FETCH (FLAGS ", msn))?;
                w.flags(&new_flags)?;
                if uid_command {
                    w.verbatim(&format!(" UID {}", uid))?;
                }
                w.verbatim(")\r\n")?;
                let line = w.into_inner();
                self.emit(&line)?;
            }
        }

        Ok(())
    }

    fn cmd_copy(
        &mut self,
        args: &[String],
        idx: usize,
        uid_command: bool,
    ) -> Result<(), Error> {
        let user = self.require_auth()?;
        let view = self.take_selected()?;

        let result = (|| {
            let set = self.arg(args, idx)?;
            let batch = view.resolve_set(set, uid_command)?;
            let destination = self.arg(args, idx + 1)?;
            let uids: Vec<Uid> = batch.keys().collect();
            self.store.copy_messages(view.id, &uids, user, destination)
        })();

        self.selected = Some(view);
        result?;
        self.respond("OK", "COPY completed")
    }

    fn cmd_list(
        &mut self,
        args: &[String],
        idx: usize,
        lsub: bool,
    ) -> Result<(), Error> {
        let user = self.require_auth()?;
        let reference = self.arg(args, idx)?;
        let pattern = self.arg(args, idx + 1)?;
        let label = if lsub { "LSUB" } else { "LIST" };

        if pattern.is_empty() {
            // The client is asking for the hierarchy delimiter.
            self.emit(
                format!("* {} (\\Noselect) \"/\" \"\"\r\n", label)
                    .as_bytes(),
            )?;
            return self.respond("OK", &format!("{} completed", label));
        }

        let full_pattern = format!("{}{}", reference, pattern);
        let listings =
            self.store.list_mailboxes(user, &full_pattern, lsub)?;
        for listing in listings {
            let mut attributes = Vec::new();
            if !listing.selectable {
                attributes.push("\\Noselect");
            }
            attributes.push(if listing.has_children {
                "\\HasChildren"
            } else {
                "\\HasNoChildren"
            });

            let mut w = LexWriter::new(Vec::<u8>::new());
            w.verbatim(&format!(
                "* {} ({}) \"/\" ",
                label,
                attributes.join(" ")
            ))?;
            w.astring(&listing.name)?;
            w.verbatim("\r\n")?;
            let line = w.into_inner();
            self.emit(&line)?;
        }

        self.respond("OK", &format!("{} completed", label))
    }

    fn cmd_status(&mut self, args: &[String], idx: usize) -> Result<(), Error> {
        let user = self.require_auth()?;
        let name = self.arg(args, idx)?.to_owned();

        let status = self
            .store
            .mailbox_status(user, &name)?
            .ok_or(Error::NxMailbox)?;

        let mut parts = Vec::new();
        for token in &args[idx + 1..] {
            let item = token.to_ascii_uppercase();
            match item.as_str() {
                "(" | ")" => continue,
                "MESSAGES" => {
                    parts.push(format!("MESSAGES {}", status.messages))
                },
                "RECENT" => parts.push(format!("RECENT {}", status.recent)),
                "UIDNEXT" => {
                    parts.push(format!("UIDNEXT {}", status.uidnext))
                },
                "UIDVALIDITY" => parts
                    .push(format!("UIDVALIDITY {}", status.uidvalidity)),
                "UNSEEN" => parts.push(format!("UNSEEN {}", status.unseen)),
                _ => {
                    return Err(Error::ProtocolSyntax(format!(
                        "unknown STATUS item {}",
                        token
                    )))
                },
            }
        }

        let mut w = LexWriter::new(Vec::<u8>::new());
        w.verbatim("* STATUS ")?;
        w.astring(&name)?;
        w.verbatim(&format!(" ({})\r\n", parts.join(" ")))?;
        let line = w.into_inner();
        self.emit(&line)?;
        self.respond("OK", "STATUS completed")
    }

    fn cmd_mailbox_admin(
        &mut self,
        command: &str,
        args: &[String],
        idx: usize,
    ) -> Result<(), Error> {
        let user = self.require_auth()?;
        let name = self.arg(args, idx)?;

        match command {
            "CREATE" => self.store.create_mailbox(user, name)?,
            "DELETE" => self.store.delete_mailbox(user, name)?,
            "RENAME" => {
                let to = self.arg(args, idx + 1)?;
                self.store.rename_mailbox(user, name, to)?
            },
            "SUBSCRIBE" => self.store.set_subscribed(user, name, true)?,
            "UNSUBSCRIBE" => {
                self.store.set_subscribed(user, name, false)?
            },
            _ => unreachable!(),
        }

        self.respond("OK", &format!("{} completed", command))
    }

    fn cmd_append(&mut self, args: &[String], idx: usize) -> Result<(), Error> {
        let user = self.require_auth()?;
        let mailbox = self.arg(args, idx)?.to_owned();
        let mut cursor = idx + 1;

        let mut flags = Vec::new();
        if args.get(cursor).map(String::as_str) == Some("(") {
            cursor += 1;
            while cursor < args.len() && ")" != args[cursor] {
                flags.push(args[cursor].parse::<Flag>()?);
                cursor += 1;
            }
            if cursor >= args.len() {
                return Err(Error::ProtocolSyntax(
                    "unterminated flag list".to_owned(),
                ));
            }
            cursor += 1;
        }

        // An optional datetime precedes the content literal.
        let mut internal_date = None;
        if cursor + 1 < args.len() {
            if let Ok(parsed) = DateTime::parse_from_str(
                args[cursor].trim_matches('"'),
                "%d-%b-%Y %H:%M:%S %z",
            ) {
                internal_date = Some(parsed);
                cursor += 1;
            }
        }

        if cursor + 1 != args.len() {
            return Err(Error::ProtocolSyntax(
                "APPEND expects exactly one message literal".to_owned(),
            ));
        }

        let content = crlf_normalize(args[cursor].as_bytes());
        let uid =
            self.store
                .append_message(user, &mailbox, &flags, internal_date, &content)?;
        info!(
            "{} appended message {} to {}",
            self.log_prefix, uid, mailbox
        );

        self.poll_selected()?;
        self.respond("OK", "APPEND completed")
    }

    fn cmd_idle(&mut self) -> Result<(), Error> {
        self.require_auth()?;
        self.emit(b"+ idling\r\n")?;
        self.flush()?;
        self.enter_idle();
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::rc::Rc;
    use std::time::Duration;

    use chrono::prelude::*;

    use super::*;
    use crate::mailbox::model::{
        AclRight, MailboxData, MailboxListing, MailboxStatus, MessageMeta,
    };
    use crate::store::cache::Cache;
    use crate::store::message::{Message, MessagePart, MessageSource};
    use crate::store::query::{Param, Rows, Store};
    use crate::support::config::ImapConfig;

    #[derive(Clone)]
    struct SharedSink(Rc<RefCell<Vec<u8>>>);

    impl ResponseSink for SharedSink {
        fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
            self.0.borrow_mut().extend_from_slice(bytes);
            Ok(())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct TestStore {
        mailbox: MailboxData,
        metas: HashMap<u64, MessageMeta>,
    }

    impl TestStore {
        fn new() -> Self {
            let mut metas = HashMap::new();
            for (uid, flags) in &[
                (10u64, vec![Flag::Seen]),
                (11, vec![Flag::Seen]),
                (12, vec![]),
            ] {
                metas.insert(
                    *uid,
                    MessageMeta {
                        uid: *uid,
                        internal_date: FixedOffset::east(0)
                            .ymd(2020, 3, 14)
                            .and_hms(9, 26, 53),
                        rfc_size: 100 * uid,
                        flags: flags.clone(),
                    },
                );
            }

            TestStore {
                mailbox: MailboxData {
                    id: 5,
                    name: "INBOX".to_owned(),
                    uids: vec![10, 11, 12],
                    uidnext: 13,
                    uidvalidity: 9,
                    recent: 1,
                    unseen: 1,
                    first_unseen: Some(12),
                    keywords: vec![],
                    writable: true,
                },
                metas,
            }
        }
    }

    struct NoRows;

    impl Rows for NoRows {
        fn next(&mut self) -> Result<bool, Error> {
            Ok(false)
        }

        fn get_u64(&self, _col: usize) -> Result<u64, Error> {
            unimplemented!()
        }

        fn get_str(&self, _col: usize) -> Result<String, Error> {
            unimplemented!()
        }

        fn get_blob(&self, _col: usize) -> Result<Vec<u8>, Error> {
            unimplemented!()
        }
    }

    impl Store for TestStore {
        fn query<'a>(
            &'a self,
            _sql: &str,
            _params: &[Param<'_>],
        ) -> Result<Box<dyn Rows + 'a>, Error> {
            Ok(Box::new(NoRows))
        }

        fn execute(
            &self,
            _sql: &str,
            _params: &[Param<'_>],
        ) -> Result<u64, Error> {
            Ok(0)
        }

        fn load_mailbox(
            &self,
            _user_id: u64,
            name: &str,
        ) -> Result<Option<MailboxData>, Error> {
            Ok(if name.eq_ignore_ascii_case("INBOX") {
                Some(self.mailbox.clone())
            } else {
                None
            })
        }

        fn poll_mailbox(
            &self,
            _mailbox_id: u64,
        ) -> Result<MailboxData, Error> {
            Ok(self.mailbox.clone())
        }

        fn list_mailboxes(
            &self,
            _user_id: u64,
            _pattern: &str,
            _subscribed_only: bool,
        ) -> Result<Vec<MailboxListing>, Error> {
            Ok(vec![MailboxListing {
                name: "INBOX".to_owned(),
                has_children: false,
                selectable: true,
                subscribed: true,
            }])
        }

        fn mailbox_status(
            &self,
            _user_id: u64,
            name: &str,
        ) -> Result<Option<MailboxStatus>, Error> {
            Ok(if name.eq_ignore_ascii_case("INBOX") {
                Some(MailboxStatus {
                    messages: 3,
                    recent: 1,
                    uidnext: 13,
                    uidvalidity: 9,
                    unseen: 1,
                })
            } else {
                None
            })
        }

        fn create_mailbox(
            &self,
            _user_id: u64,
            _name: &str,
        ) -> Result<(), Error> {
            Ok(())
        }

        fn delete_mailbox(
            &self,
            _user_id: u64,
            _name: &str,
        ) -> Result<(), Error> {
            Ok(())
        }

        fn rename_mailbox(
            &self,
            _user_id: u64,
            _from: &str,
            _to: &str,
        ) -> Result<(), Error> {
            Ok(())
        }

        fn set_subscribed(
            &self,
            _user_id: u64,
            _name: &str,
            _subscribed: bool,
        ) -> Result<(), Error> {
            Ok(())
        }

        fn append_message(
            &self,
            _user_id: u64,
            _mailbox: &str,
            _flags: &[Flag],
            _internal_date: Option<DateTime<FixedOffset>>,
            _content: &[u8],
        ) -> Result<u64, Error> {
            Ok(13)
        }

        fn copy_messages(
            &self,
            _mailbox_id: u64,
            _uids: &[Uid],
            _user_id: u64,
            _destination: &str,
        ) -> Result<(), Error> {
            Ok(())
        }

        fn message_meta(
            &self,
            _mailbox_id: u64,
            uid: Uid,
        ) -> Result<Option<MessageMeta>, Error> {
            Ok(self.metas.get(&uid.0.get()).cloned())
        }

        fn set_flags(
            &self,
            _mailbox_id: u64,
            uid: Uid,
            flags: &[Flag],
            mode: FlagsMode,
        ) -> Result<Vec<Flag>, Error> {
            let mut new = self
                .metas
                .get(&uid.0.get())
                .map(|m| m.flags.clone())
                .unwrap_or_default();
            match mode {
                FlagsMode::Replace => new = flags.to_vec(),
                FlagsMode::Add => {
                    for flag in flags {
                        if !new.contains(flag) {
                            new.push(flag.clone());
                        }
                    }
                },
                FlagsMode::Remove => {
                    new.retain(|f| !flags.contains(f));
                },
            }
            Ok(new)
        }

        fn expunge(
            &self,
            _mailbox_id: u64,
            uids: &[Uid],
        ) -> Result<Vec<Uid>, Error> {
            // Only message 12 carries \Deleted in this fixture.
            Ok(uids
                .iter()
                .copied()
                .filter(|uid| 12 == uid.0.get())
                .collect())
        }

        fn acl_has_right(
            &self,
            _mailbox_id: u64,
            _user_id: u64,
            _right: AclRight,
        ) -> Result<bool, Error> {
            Ok(true)
        }
    }

    struct TestMessage;

    impl Message for TestMessage {
        fn structure(&self, _extensions: bool) -> Result<String, Error> {
            Ok("(\"text\" \"plain\")".to_owned())
        }

        fn envelope(&self) -> Result<String, Error> {
            Ok("(NIL NIL NIL NIL NIL NIL NIL NIL NIL NIL)".to_owned())
        }

        fn part(
            &self,
            _partspec: &str,
        ) -> Result<Option<Box<dyn MessagePart + '_>>, Error> {
            Ok(None)
        }

        fn to_wire(&self) -> Result<Vec<u8>, Error> {
            Ok(b"Subject: t\n\nhello\n".to_vec())
        }
    }

    struct TestSource;

    impl MessageSource for TestSource {
        fn load(
            &self,
            _mailbox_id: u64,
            _uid: Uid,
        ) -> Result<Box<dyn Message>, Error> {
            Ok(Box::new(TestMessage))
        }
    }

    struct TestAuth;

    impl crate::store::auth::Authenticator for TestAuth {
        fn validate(
            &self,
            _ctx: &AuthContext,
            user: &str,
            pass: &str,
        ) -> Result<AuthOutcome, Error> {
            Ok(if "jsmith" == user && "secret" == pass {
                AuthOutcome::Accepted { user_id: 42 }
            } else {
                AuthOutcome::Rejected
            })
        }

        fn validate_digest(
            &self,
            _ctx: &AuthContext,
            challenge: &str,
            user: &str,
            digest: &str,
        ) -> Result<AuthOutcome, Error> {
            Ok(
                if "jsmith" == user
                    && !challenge.is_empty()
                    && "d1gest" == digest
                {
                    AuthOutcome::Accepted { user_id: 42 }
                } else {
                    AuthOutcome::Rejected
                },
            )
        }
    }

    struct Fixture {
        session: Session<SharedSink>,
        sink: Rc<RefCell<Vec<u8>>>,
    }

    impl Fixture {
        fn new() -> Self {
            let sink = Rc::new(RefCell::new(Vec::new()));
            let session = Session::new(
                Arc::new(TestStore::new()),
                Arc::new(TestSource),
                Arc::new(TestAuth),
                Arc::new(Cache::new(
                    Duration::from_secs(60),
                    Duration::from_secs(3600),
                )),
                Arc::new(ImapConfig::default()),
                "10.0.0.9".to_owned(),
                SharedSink(Rc::clone(&sink)),
            );
            Fixture { session, sink }
        }

        fn line(&mut self, line: &str) -> String {
            self.sink.borrow_mut().clear();
            self.session.receive_line(line).unwrap();
            String::from_utf8(self.sink.borrow().clone()).unwrap()
        }

        fn login(&mut self) {
            let out = self.line("a0 LOGIN jsmith secret");
            assert!(out.contains("a0 OK"), "login failed: {}", out);
        }

        fn select(&mut self) {
            self.login();
            let out = self.line("s0 SELECT INBOX");
            assert!(out.contains("s0 OK"), "select failed: {}", out);
        }
    }

    #[test]
    fn login_and_capability_swap() {
        let mut fx = Fixture::new();
        let out = fx.line("c1 CAPABILITY");
        assert!(out.contains("AUTH=CRAM-MD5"));
        assert!(!out.contains(" IDLE"));

        let out = fx.line("a1 LOGIN jsmith secret");
        assert!(out.contains("* CAPABILITY"));
        assert!(out.contains(" IDLE"));
        assert!(!out.contains("AUTH="));
        assert!(out.ends_with("a1 OK LOGIN completed\r\n"));
        assert_eq!(SessionState::Authenticated, fx.session.state());
    }

    #[test]
    fn bad_login_is_no() {
        let mut fx = Fixture::new();
        let out = fx.line("a1 LOGIN jsmith wrong");
        assert!(out.ends_with("a1 NO Authentication failed\r\n"));
        assert_eq!(SessionState::NotAuthenticated, fx.session.state());
    }

    #[test]
    fn login_via_continuation() {
        let mut fx = Fixture::new();
        let out = fx.line("a1 LOGIN");
        assert_eq!(format!("+ {}\r\n", base64::encode("username")), out);
        let out = fx.line(&base64::encode("jsmith"));
        assert_eq!(format!("+ {}\r\n", base64::encode("password")), out);
        let out = fx.line(&base64::encode("secret"));
        assert!(out.ends_with("a1 OK LOGIN completed\r\n"), "{}", out);
    }

    #[test]
    fn cram_md5_round_trip() {
        let mut fx = Fixture::new();
        let out = fx.line("a1 AUTHENTICATE CRAM-MD5");
        assert!(out.starts_with("+ "));
        let challenge = String::from_utf8(
            base64::decode(out.trim_start_matches("+ ").trim()).unwrap(),
        )
        .unwrap();
        assert!(challenge.starts_with('<') && challenge.ends_with('>'));

        let out = fx.line(&base64::encode("jsmith d1gest"));
        assert!(out.ends_with("a1 OK AUTHENTICATE completed\r\n"), "{}", out);
    }

    #[test]
    fn select_reports_mailbox_state() {
        let mut fx = Fixture::new();
        fx.login();
        let out = fx.line("a2 SELECT INBOX");
        assert!(out.contains("* 3 EXISTS\r\n"));
        assert!(out.contains("* 1 RECENT\r\n"));
        assert!(out.contains("[UIDVALIDITY 9]"));
        assert!(out.contains("[UIDNEXT 13]"));
        assert!(out.contains("[UNSEEN 3]"));
        assert!(out.ends_with("a2 OK [READ-WRITE] SELECT completed\r\n"));
        assert_eq!(SessionState::Selected, fx.session.state());

        let out = fx.line("a3 SELECT nosuch");
        assert!(out.contains("a3 NO"));
        assert_eq!(SessionState::Authenticated, fx.session.state());
    }

    #[test]
    fn select_requires_auth() {
        let mut fx = Fixture::new();
        let out = fx.line("a1 SELECT INBOX");
        assert!(out.contains("a1 NO"));
    }

    #[test]
    fn uid_search_and_fetch_end_to_end() {
        let mut fx = Fixture::new();
        fx.select();

        let out = fx.line("a3 UID SEARCH 11:*");
        assert!(out.contains("* SEARCH 11 12\r\n"), "{}", out);
        assert!(out.ends_with("a3 OK SEARCH completed\r\n"));

        let out = fx.line("a4 FETCH 2 (UID FLAGS)");
        assert!(
            out.contains("* 2 FETCH (FLAGS (\\Seen) UID 11)\r\n"),
            "{}",
            out
        );
        assert!(out.ends_with("a4 OK FETCH completed\r\n"));
    }

    #[test]
    fn seqnum_search_reports_msns() {
        let mut fx = Fixture::new();
        fx.select();
        let out = fx.line("a3 SEARCH 2:3");
        assert!(out.contains("* SEARCH 2 3\r\n"), "{}", out);
    }

    #[test]
    fn fetch_via_literal_continuation() {
        let mut fx = Fixture::new();
        fx.select();

        // Deliver "a4 FETCH 2 (UID FLAGS)" with the set as a literal
        let out = fx.line("a4 FETCH {1}");
        assert_eq!("+ OK gimme that string\r\n", out);
        assert_eq!(Some(1), fx.session.pending_literal());

        fx.sink.borrow_mut().clear();
        fx.session.receive_literal(b"2").unwrap();
        let out = fx.line(" (UID FLAGS)");
        assert!(out.contains("UID 11"), "{}", out);
    }

    #[test]
    fn store_updates_and_reports_flags() {
        let mut fx = Fixture::new();
        fx.select();

        let out = fx.line("a5 STORE 3 +FLAGS ( \\Flagged )");
        assert!(
            out.contains("* 3 FETCH (FLAGS (\\Flagged))\r\n"),
            "{}",
            out
        );
        assert!(out.ends_with("a5 OK STORE completed\r\n"));

        let out = fx.line("a6 STORE 3 +FLAGS.SILENT ( \\Flagged )");
        assert!(!out.contains("* 3 FETCH"));
        assert!(out.ends_with("a6 OK STORE completed\r\n"));
    }

    #[test]
    fn expunge_renumbers() {
        let mut fx = Fixture::new();
        fx.select();
        let out = fx.line("a5 EXPUNGE");
        assert!(out.contains("* 3 EXPUNGE\r\n"), "{}", out);
        assert!(out.ends_with("a5 OK EXPUNGE completed\r\n"));
    }

    #[test]
    fn idle_loop() {
        let mut fx = Fixture::new();
        fx.select();

        let out = fx.line("a6 IDLE");
        assert_eq!("+ idling\r\n", out);
        assert_eq!(SessionState::Idle, fx.session.state());

        fx.sink.borrow_mut().clear();
        fx.session.on_timeout().unwrap();
        assert!(String::from_utf8(fx.sink.borrow().clone())
            .unwrap()
            .contains("* OK still here"));

        let out = fx.line("DONE");
        assert!(out.ends_with("a6 OK IDLE terminated\r\n"), "{}", out);
        assert_eq!(SessionState::Selected, fx.session.state());
    }

    #[test]
    fn error_budget_disconnects() {
        let mut fx = Fixture::new();
        let max = ImapConfig::default().max_consecutive_errors;
        let mut out = String::new();
        for n in 0..max {
            out = fx.line(&format!("t{} FROBNICATE", n));
        }
        assert!(out.contains("* BYE Too many invalid commands"), "{}", out);
        assert_eq!(SessionState::Error, fx.session.state());

        // Input after the fatal error is ignored
        assert_eq!("", fx.line("t9 NOOP"));
    }

    #[test]
    fn timeout_outside_idle_is_fatal() {
        let mut fx = Fixture::new();
        fx.session.on_timeout().unwrap();
        assert!(String::from_utf8(fx.sink.borrow().clone())
            .unwrap()
            .contains("* BYE Connection timed out"));
        assert_eq!(SessionState::Error, fx.session.state());
    }

    #[test]
    fn timeout_lengthens_after_login() {
        let mut fx = Fixture::new();
        let pre = fx.session.idle_duration();
        fx.login();
        assert!(fx.session.idle_duration() > pre);
    }

    #[test]
    fn logout_says_bye() {
        let mut fx = Fixture::new();
        let out = fx.line("a1 LOGOUT");
        assert!(out.starts_with("* BYE"));
        assert!(out.ends_with("a1 OK LOGOUT completed\r\n"));
        assert_eq!(SessionState::Logout, fx.session.state());
    }

    #[test]
    fn status_and_list() {
        let mut fx = Fixture::new();
        fx.login();

        let out = fx.line("a2 STATUS INBOX ( MESSAGES UIDNEXT )");
        assert!(
            out.contains("* STATUS INBOX (MESSAGES 3 UIDNEXT 13)\r\n"),
            "{}",
            out
        );

        let out = fx.line("a3 LIST \"\" *");
        assert!(
            out.contains("* LIST (\\HasNoChildren) \"/\" INBOX\r\n"),
            "{}",
            out
        );
    }

    #[test]
    fn append_accepts_literal_message() {
        let mut fx = Fixture::new();
        fx.login();

        let message = "Subject: hi\r\n\r\nbody\r\n";
        let out = fx.line(&format!("a2 APPEND INBOX {{{}}}", message.len()));
        assert_eq!("+ OK gimme that string\r\n", out);
        fx.sink.borrow_mut().clear();
        fx.session.receive_literal(message.as_bytes()).unwrap();
        let out = fx.line("");
        assert!(out.ends_with("a2 OK APPEND completed\r\n"), "{}", out);
    }
}
