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

//! The storage collaborator.
//!
//! The engine issues parameterized queries only. Search terms, header
//! values, and anything else of client origin are always bound through
//! [`Param`]; the only string interpolation into SQL is the table-name
//! prefix and column names, which are trusted configuration.

use chrono::{DateTime, FixedOffset};

use crate::mailbox::model::{
    AclRight, Flag, FlagsMode, MailboxData, MailboxListing, MailboxStatus,
    MessageMeta, Uid,
};
use crate::support::error::Error;

/// A value bound to a statement placeholder.
#[derive(Clone, Copy, Debug)]
pub enum Param<'a> {
    U64(u64),
    I64(i64),
    Str(&'a str),
    Bytes(&'a [u8]),
}

/// Forward-only iteration over a query result.
pub trait Rows {
    /// Advance to the next row; `false` once exhausted.
    fn next(&mut self) -> Result<bool, Error>;
    fn get_u64(&self, col: usize) -> Result<u64, Error>;
    fn get_str(&self, col: usize) -> Result<String, Error>;
    fn get_blob(&self, col: usize) -> Result<Vec<u8>, Error>;
}

/// The mail store.
///
/// `query`/`execute` are the raw surface the search engine and header
/// prefetch build their statements against; the remaining operations are
/// the store-side halves of individual commands.
pub trait Store: Send + Sync {
    fn query<'a>(
        &'a self,
        sql: &str,
        params: &[Param<'_>],
    ) -> Result<Box<dyn Rows + 'a>, Error>;

    /// Run a statement that returns no rows; yields the affected row
    /// count.
    fn execute(&self, sql: &str, params: &[Param<'_>]) -> Result<u64, Error>;

    fn load_mailbox(
        &self,
        user_id: u64,
        name: &str,
    ) -> Result<Option<MailboxData>, Error>;

    /// Reload the current state of an already-open mailbox.
    fn poll_mailbox(&self, mailbox_id: u64) -> Result<MailboxData, Error>;

    fn list_mailboxes(
        &self,
        user_id: u64,
        pattern: &str,
        subscribed_only: bool,
    ) -> Result<Vec<MailboxListing>, Error>;

    fn mailbox_status(
        &self,
        user_id: u64,
        name: &str,
    ) -> Result<Option<MailboxStatus>, Error>;

    fn create_mailbox(&self, user_id: u64, name: &str) -> Result<(), Error>;

    fn delete_mailbox(&self, user_id: u64, name: &str) -> Result<(), Error>;

    fn rename_mailbox(
        &self,
        user_id: u64,
        from: &str,
        to: &str,
    ) -> Result<(), Error>;

    fn set_subscribed(
        &self,
        user_id: u64,
        name: &str,
        subscribed: bool,
    ) -> Result<(), Error>;

    /// Deliver `content` into `mailbox`, returning the new message's UID.
    fn append_message(
        &self,
        user_id: u64,
        mailbox: &str,
        flags: &[Flag],
        internal_date: Option<DateTime<FixedOffset>>,
        content: &[u8],
    ) -> Result<u64, Error>;

    fn copy_messages(
        &self,
        mailbox_id: u64,
        uids: &[Uid],
        user_id: u64,
        destination: &str,
    ) -> Result<(), Error>;

    fn message_meta(
        &self,
        mailbox_id: u64,
        uid: Uid,
    ) -> Result<Option<MessageMeta>, Error>;

    /// Apply a flags change and return the resulting flag set.
    fn set_flags(
        &self,
        mailbox_id: u64,
        uid: Uid,
        flags: &[Flag],
        mode: FlagsMode,
    ) -> Result<Vec<Flag>, Error>;

    /// Remove the `\Deleted` messages in `uids`; returns those actually
    /// expunged, ascending.
    fn expunge(
        &self,
        mailbox_id: u64,
        uids: &[Uid],
    ) -> Result<Vec<Uid>, Error>;

    fn acl_has_right(
        &self,
        mailbox_id: u64,
        user_id: u64,
        right: AclRight,
    ) -> Result<bool, Error>;
}
