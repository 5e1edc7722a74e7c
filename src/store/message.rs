//-
// Copyright (c) 2020, Jason Lingle
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

//! The MIME collaborator.
//!
//! Parsing and rendering of message structure is black-box: the engine asks
//! for BODYSTRUCTURE/ENVELOPE wire strings, body parts by part
//! specification, and full wire bytes, and never looks inside.

use memchr::memchr_iter;

use crate::mailbox::model::Uid;
use crate::support::error::Error;

/// Which logical rendition of a part is wanted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartKind {
    /// The entire part, headers and body.
    Full,
    /// Body only.
    Text,
    /// The part's RFC 822 header block.
    Header,
    /// The part's MIME header block.
    Mime,
}

pub trait MessagePart {
    fn render(&self, kind: PartKind) -> Result<Vec<u8>, Error>;
}

pub trait Message {
    /// BODYSTRUCTURE (or BODY, without `extensions`) in wire-format
    /// parenthesized-list form.
    fn structure(&self, extensions: bool) -> Result<String, Error>;

    /// ENVELOPE in wire format: date, subject, from, sender, reply-to, to,
    /// cc, bcc, in-reply-to, message-id.
    fn envelope(&self) -> Result<String, Error>;

    /// Resolve a dotted part specification (`1.2.3`). The empty partspec
    /// resolves to the whole message.
    fn part(&self, partspec: &str)
        -> Result<Option<Box<dyn MessagePart + '_>>, Error>;

    /// The complete message as stored, not yet CRLF-normalized.
    fn to_wire(&self) -> Result<Vec<u8>, Error>;
}

pub trait MessageSource: Send + Sync {
    fn load(&self, mailbox_id: u64, uid: Uid)
        -> Result<Box<dyn Message>, Error>;
}

/// Normalize line endings to CRLF for the wire.
///
/// Lone `\n` becomes `\r\n`; existing `\r\n` pairs pass through.
pub fn crlf_normalize(src: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(src.len() + src.len() / 16);
    let mut start = 0;
    for nl in memchr_iter(b'\n', src) {
        out.extend_from_slice(&src[start..nl]);
        if !out.ends_with(b"\r") {
            out.push(b'\r');
        }
        out.push(b'\n');
        start = nl + 1;
    }
    out.extend_from_slice(&src[start..]);
    out
}
