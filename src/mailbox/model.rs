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

//! Model types shared between the mailbox engine, the store collaborators,
//! and the IMAP session.

use std::fmt;
use std::num::{NonZeroU32, NonZeroU64};
use std::str::FromStr;

use chrono::prelude::*;

use crate::support::error::Error;

/// A message's mailbox-stable unique identifier.
///
/// UIDs are never reused within a mailbox. The store assigns them strictly
/// ascending; `uidnext` is always greater than every UID ever handed out.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Uid(pub NonZeroU64);

impl Uid {
    // Unsafe because new() isn't const for some reason
    pub const MIN: Self = unsafe { Uid(NonZeroU64::new_unchecked(1)) };

    pub fn of(uid: u64) -> Option<Self> {
        NonZeroU64::new(uid).map(Uid)
    }

    pub fn u(uid: u64) -> Self {
        Uid::of(uid).expect("Uid::u(0)")
    }
}

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", self.0.get())
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

/// A message sequence number: the 1-based position of a message among the
/// currently visible messages of a mailbox view.
///
/// Sequence numbers shift on expunge; they are only meaningful relative to
/// one session's snapshot.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Msn(pub NonZeroU32);

impl Msn {
    // Unsafe because new() isn't const for some reason
    pub const MIN: Self = unsafe { Msn(NonZeroU32::new_unchecked(1)) };

    pub fn of(msn: u32) -> Option<Self> {
        NonZeroU32::new(msn).map(Msn)
    }

    pub fn u(msn: u32) -> Self {
        Msn::of(msn).expect("Msn::u(0)")
    }

    pub fn from_index(ix: usize) -> Self {
        Msn::of((ix + 1) as u32).unwrap()
    }
}

impl fmt::Debug for Msn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Msn({})", self.0.get())
    }
}

impl fmt::Display for Msn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0.get())
    }
}

/// A message flag.
///
/// System flags are represented as top-level enum values. Keywords are in
/// the `Keyword` case.
///
/// The `Display` format of this type is the exact string value sent over
/// the wire. `FromStr` does the reverse conversion and also understands
/// non-standard casing of the system flags.
#[derive(Clone)]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Recent,
    Seen,
    Keyword(String),
}

impl Flag {
    /// The trusted store column holding this flag, if it is a system flag.
    pub fn column(&self) -> Option<&'static str> {
        match *self {
            Flag::Answered => Some("answered_flag"),
            Flag::Deleted => Some("deleted_flag"),
            Flag::Draft => Some("draft_flag"),
            Flag::Flagged => Some("flagged_flag"),
            Flag::Recent => Some("recent_flag"),
            Flag::Seen => Some("seen_flag"),
            Flag::Keyword(_) => None,
        }
    }
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            &Flag::Answered => write!(f, "\\Answered"),
            &Flag::Deleted => write!(f, "\\Deleted"),
            &Flag::Draft => write!(f, "\\Draft"),
            &Flag::Flagged => write!(f, "\\Flagged"),
            &Flag::Recent => write!(f, "\\Recent"),
            &Flag::Seen => write!(f, "\\Seen"),
            &Flag::Keyword(ref kw) => write!(f, "{}", kw),
        }
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Flag as fmt::Display>::fmt(self, f)
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("\\answered") {
            Ok(Flag::Answered)
        } else if s.eq_ignore_ascii_case("\\deleted") {
            Ok(Flag::Deleted)
        } else if s.eq_ignore_ascii_case("\\draft") {
            Ok(Flag::Draft)
        } else if s.eq_ignore_ascii_case("\\flagged") {
            Ok(Flag::Flagged)
        } else if s.eq_ignore_ascii_case("\\recent") {
            Ok(Flag::Recent)
        } else if s.eq_ignore_ascii_case("\\seen") {
            Ok(Flag::Seen)
        } else if s.starts_with('\\') {
            Err(Error::ProtocolSyntax(format!("unknown system flag {}", s)))
        } else if !s.is_empty()
            && s.as_bytes().iter().copied().all(is_atom_char)
        {
            Ok(Flag::Keyword(s.to_owned()))
        } else {
            Err(Error::ProtocolSyntax(format!("malformed flag {}", s)))
        }
    }
}

fn is_atom_char(ch: u8) -> bool {
    match ch {
        0..=b' ' => false,
        127..=255 => false,
        b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' | b']' => false,
        _ => true,
    }
}

impl PartialEq for Flag {
    fn eq(&self, other: &Flag) -> bool {
        match (self, other) {
            (&Flag::Answered, &Flag::Answered) => true,
            (&Flag::Deleted, &Flag::Deleted) => true,
            (&Flag::Draft, &Flag::Draft) => true,
            (&Flag::Flagged, &Flag::Flagged) => true,
            (&Flag::Recent, &Flag::Recent) => true,
            (&Flag::Seen, &Flag::Seen) => true,
            // Keywords compare ASCII-case-insensitively, which is what
            // clients in the wild expect even though RFC 3501 is silent.
            (&Flag::Keyword(ref a), &Flag::Keyword(ref b)) => {
                a.eq_ignore_ascii_case(b)
            },
            _ => false,
        }
    }
}

impl Eq for Flag {}

/// How a STORE command combines the given flags with the present ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FlagsMode {
    Replace,
    Add,
    Remove,
}

/// ACL rights the engine itself needs to check. The full rights string
/// lives in the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AclRight {
    Read,
    Seen,
    Write,
    Insert,
    DeleteMessages,
}

/// Point-in-time mailbox data as loaded from the store, from which a
/// session builds its [`MailboxView`](crate::mailbox::view::MailboxView).
///
/// `uids` is sorted ascending; sequence numbers are derived from position.
#[derive(Clone, Debug, Default)]
pub struct MailboxData {
    pub id: u64,
    pub name: String,
    pub uids: Vec<u64>,
    pub uidnext: u64,
    pub uidvalidity: u32,
    pub recent: u32,
    pub unseen: u32,
    pub first_unseen: Option<u64>,
    pub keywords: Vec<String>,
    pub writable: bool,
}

/// One row of a LIST/LSUB response.
#[derive(Clone, Debug)]
pub struct MailboxListing {
    pub name: String,
    pub has_children: bool,
    pub selectable: bool,
    pub subscribed: bool,
}

/// Counters for a STATUS response.
#[derive(Clone, Copy, Debug, Default)]
pub struct MailboxStatus {
    pub messages: u32,
    pub recent: u32,
    pub uidnext: u64,
    pub uidvalidity: u32,
    pub unseen: u32,
}

/// Per-message metadata consulted by the fetch response builder without
/// parsing the message itself.
#[derive(Clone, Debug)]
pub struct MessageMeta {
    pub uid: u64,
    pub internal_date: DateTime<FixedOffset>,
    pub rfc_size: u64,
    pub flags: Vec<Flag>,
}
