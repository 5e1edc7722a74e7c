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

//! Rendering of untagged FETCH responses.
//!
//! Items are emitted in a canonical order fixed by the descriptor, not by
//! the order the client happened to request them: FLAGS, INTERNALDATE,
//! RFC822.SIZE, UID, ENVELOPE, BODYSTRUCTURE, BODY, the RFC822 variants,
//! then the `BODY[...]` sections.
//!
//! Whole-message renderings go through the shared content [`Cache`];
//! `HEADER.FIELDS` sections are served from a batch prefetch that pulls
//! headers for up to [`QUERY_BATCHSIZE`] upcoming messages in one query,
//! tracked by an advancing ceiling watermark.

use std::sync::Arc;

use log::warn;

use super::fetch_items::{BodyFetch, FetchItems, ItemType, SimpleItems};
use super::lex::LexWriter;
use crate::mailbox::model::{AclRight, Flag, FlagsMode, Uid};
use crate::mailbox::view::MailboxView;
use crate::store::cache::Cache;
use crate::store::message::{crlf_normalize, Message, MessageSource, PartKind};
use crate::store::query::{Param, Store};
use crate::support::error::Error;

/// How many upcoming messages one header prefetch covers.
const QUERY_BATCHSIZE: usize = 2000;

pub struct FetchResponseBuilder<'a> {
    store: &'a dyn Store,
    source: &'a dyn MessageSource,
    cache: &'a Cache,
    view: &'a MailboxView,
    prefix: &'a str,
    user_id: u64,
    uid_command: bool,
    /// The ascending uid list of this FETCH command's batch; drives the
    /// header prefetch window.
    batch: Vec<Uid>,
}

impl<'a> FetchResponseBuilder<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: &'a dyn Store,
        source: &'a dyn MessageSource,
        cache: &'a Cache,
        view: &'a MailboxView,
        prefix: &'a str,
        user_id: u64,
        uid_command: bool,
        batch: Vec<Uid>,
    ) -> Self {
        FetchResponseBuilder {
            store,
            source,
            cache,
            view,
            prefix,
            user_id,
            uid_command,
            batch,
        }
    }

    /// Render the untagged FETCH response for one message into `out`.
    ///
    /// Returns `false` (emitting nothing) if the message vanished from the
    /// store meanwhile. Storage failures abort the current message; bytes
    /// already emitted for earlier messages are unaffected.
    pub fn fetch_message(
        &self,
        items: &mut FetchItems,
        uid: Uid,
        out: &mut Vec<u8>,
    ) -> Result<bool, Error> {
        let msn = match self.view.uid_to_msn(uid) {
            Some(msn) => msn,
            None => return Ok(false),
        };
        let meta = match self.store.message_meta(self.view.id, uid)? {
            Some(meta) => meta,
            None => {
                warn!("no metadata for uid {}; skipped", uid);
                return Ok(false);
            },
        };

        let message = if items.needs_message() {
            Some(self.source.load(self.view.id, uid)?)
        } else {
            None
        };

        let mut w = LexWriter::new(Vec::<u8>::new());
        let mut first = true;
        w.verbatim(&format!("* {} FETCH (", msn))?;

        macro_rules! space {
            () => {
                if first {
                    first = false;
                } else {
                    w.verbatim(" ")?;
                }
            };
        }

        if items.simple.contains(SimpleItems::FLAGS) {
            space!();
            w.verbatim("FLAGS ")?;
            w.flags(&meta.flags)?;
        }
        if items.simple.contains(SimpleItems::INTERNALDATE) {
            space!();
            w.verbatim("INTERNALDATE ")?;
            w.datetime(&meta.internal_date)?;
        }
        if items.simple.contains(SimpleItems::RFC822_SIZE) {
            space!();
            w.verbatim("RFC822.SIZE ")?;
            w.num_u64(meta.rfc_size)?;
        }
        if items.simple.contains(SimpleItems::UID) {
            space!();
            w.verbatim("UID ")?;
            w.num_u64(uid.0.get())?;
        }
        if items.simple.contains(SimpleItems::ENVELOPE) {
            space!();
            w.verbatim("ENVELOPE ")?;
            w.verbatim(&message.as_ref().expect("descriptor requires parsed message").envelope()?)?;
        }
        if items.simple.contains(SimpleItems::BODYSTRUCTURE) {
            space!();
            w.verbatim("BODYSTRUCTURE ")?;
            w.verbatim(&message.as_ref().expect("descriptor requires parsed message").structure(true)?)?;
        }
        if items.simple.contains(SimpleItems::BODY) {
            space!();
            w.verbatim("BODY ")?;
            w.verbatim(&message.as_ref().expect("descriptor requires parsed message").structure(false)?)?;
        }
        if items.simple.contains(SimpleItems::RFC822) {
            space!();
            w.verbatim("RFC822 ")?;
            let bytes =
                self.cached_wire(uid, message.as_deref().expect("descriptor requires parsed message"))?;
            let result = w.literal(&bytes);
            self.cache.unref_mem(uid.0.get());
            result?;
        }
        if items.simple.contains(SimpleItems::RFC822_HEADER) {
            space!();
            w.verbatim("RFC822.HEADER ")?;
            let bytes = self.logical_part(
                message.as_deref().expect("descriptor requires parsed message"),
                "",
                PartKind::Header,
            )?;
            w.literal(&bytes)?;
        }
        if items.simple.contains(SimpleItems::RFC822_TEXT) {
            space!();
            w.verbatim("RFC822.TEXT ")?;
            let bytes = self.logical_part(
                message.as_deref().expect("descriptor requires parsed message"),
                "",
                PartKind::Text,
            )?;
            w.literal(&bytes)?;
        }

        for bf in &mut items.body_fetches {
            space!();
            self.body_section(&mut w, bf, uid, message.as_deref())?;
        }

        // Implicit \Seen, gated on the ACL; reported as one redundant
        // untagged FETCH carrying only the new FLAGS (and UID under UID
        // FETCH).
        let mut report_flags = None;
        if items.sets_seen()
            && self.view.writable
            && !meta.flags.contains(&Flag::Seen)
            && self.store.acl_has_right(
                self.view.id,
                self.user_id,
                AclRight::Seen,
            )?
        {
            report_flags = Some(self.store.set_flags(
                self.view.id,
                uid,
                &[Flag::Seen],
                FlagsMode::Add,
            )?);
        }

        w.verbatim(")\r\n")?;

        if let Some(flags) = report_flags {
            w.verbatim(&format!("* {} FETCH (", msn))?;
            if self.uid_command {
                w.verbatim(&format!("UID {} ", uid))?;
            }
            w.verbatim("FLAGS ")?;
            w.flags(&flags)?;
            w.verbatim(")\r\n")?;
        }

        out.extend_from_slice(&w.into_inner());
        Ok(true)
    }

    /// Render one `BODY[...]` item.
    fn body_section(
        &self,
        w: &mut LexWriter<Vec<u8>>,
        bf: &mut BodyFetch,
        uid: Uid,
        message: Option<&dyn Message>,
    ) -> Result<(), Error> {
        let mut label = bf.section_label();
        if matches!(
            bf.item_type,
            ItemType::HeaderFields | ItemType::HeaderFieldsNot
        ) {
            label = format!("{} ({})", label, bf.field_names.join(" "));
        }
        w.verbatim("BODY[")?;
        w.verbatim(&label)?;
        w.verbatim("]")?;

        let content: Option<Vec<u8>> = match bf.item_type {
            ItemType::HeaderFields | ItemType::HeaderFieldsNot
                if bf.partspec.is_empty() =>
            {
                self.prefetch_headers(bf, uid)?;
                let mut bytes = crlf_normalize(
                    bf.headers
                        .get(&uid.0.get())
                        .map(String::as_bytes)
                        .unwrap_or_default(),
                );
                bytes.extend_from_slice(b"\r\n");
                Some(bytes)
            },

            ItemType::TextSilent if bf.partspec.is_empty() => {
                let bytes = self.cached_wire(
                    uid,
                    message.expect("body fetch without message"),
                )?;
                let result = emit_section_body(w, &bytes, bf.octet_range);
                self.cache.unref_mem(uid.0.get());
                return result;
            },

            _ => {
                let message = message.expect("body fetch without message");
                let kind = match bf.item_type {
                    ItemType::Text => PartKind::Text,
                    ItemType::Header => PartKind::Header,
                    ItemType::Mime => PartKind::Mime,
                    ItemType::TextSilent => PartKind::Full,
                    // Nested HEADER.FIELDS renders the part's headers and
                    // filters locally; the SQL prefetch only covers the
                    // top-level header table.
                    ItemType::HeaderFields | ItemType::HeaderFieldsNot => {
                        PartKind::Header
                    },
                };

                match message.part(&bf.partspec)? {
                    None => None,
                    Some(part) => {
                        let mut bytes =
                            crlf_normalize(&part.render(kind)?);
                        if matches!(
                            bf.item_type,
                            ItemType::HeaderFields
                                | ItemType::HeaderFieldsNot
                        ) {
                            bytes = filter_header_fields(
                                &bytes,
                                &bf.field_names,
                                ItemType::HeaderFieldsNot == bf.item_type,
                            );
                        }
                        Some(bytes)
                    },
                }
            },
        };

        match content {
            None => w.verbatim(" NIL").map_err(Error::from),
            Some(bytes) => emit_section_body(w, &bytes, bf.octet_range),
        }
    }

    /// Load the header cache window covering `uid` for this body fetch,
    /// issuing at most one storage query per [`QUERY_BATCHSIZE`] messages.
    fn prefetch_headers(
        &self,
        bf: &mut BodyFetch,
        uid: Uid,
    ) -> Result<(), Error> {
        if uid.0.get() <= bf.ceiling {
            return Ok(());
        }

        let hi = self
            .batch
            .get(bf.lo + QUERY_BATCHSIZE)
            .or_else(|| self.batch.last())
            .copied()
            .unwrap_or(uid);
        let hi = hi.0.get().max(uid.0.get());

        let names: Vec<String> = bf
            .field_names
            .iter()
            .map(|n| n.to_ascii_lowercase())
            .collect();
        let placeholders = vec!["?"; names.len().max(1)].join(",");
        let negate = if ItemType::HeaderFieldsNot == bf.item_type {
            "NOT "
        } else {
            ""
        };

        let sql = format!(
            "SELECT m.message_idnr, n.headername, v.headervalue \
             FROM {p}header h \
             LEFT JOIN {p}messages m ON h.physmessage_id=m.physmessage_id \
             LEFT JOIN {p}headername n ON h.headername_id=n.id \
             LEFT JOIN {p}headervalue v ON h.headervalue_id=v.id \
             WHERE n.headername {negate}IN ({placeholders}) \
             AND m.mailbox_idnr = ? \
             AND m.message_idnr BETWEEN ? AND ? \
             AND m.status < ? \
             ORDER BY m.message_idnr",
            p = self.prefix,
            negate = negate,
            placeholders = placeholders
        );

        let mut params: Vec<Param<'_>> =
            names.iter().map(|n| Param::Str(n)).collect();
        params.push(Param::U64(self.view.id));
        params.push(Param::U64(uid.0.get()));
        params.push(Param::U64(hi));
        params.push(Param::I64(2));

        let mut rows = self.store.query(&sql, &params)?;
        while rows.next()? {
            let id = rows.get_u64(0)?;
            if self
                .view
                .uids
                .get(&match Uid::of(id) {
                    Some(uid) => uid,
                    None => continue,
                })
                .is_none()
            {
                continue;
            }

            let mut field = rows.get_str(1)?;
            let value = rows.get_str(2)?;
            if let Some(head) = field.get_mut(0..1) {
                head.make_ascii_uppercase();
            }

            let entry = bf.headers.entry(id).or_default();
            entry.push_str(&field);
            entry.push_str(": ");
            entry.push_str(&value);
            entry.push('\n');
        }

        bf.lo += QUERY_BATCHSIZE;
        bf.ceiling = hi;
        Ok(())
    }

    /// The CRLF-normalized whole-message rendering, by way of the shared
    /// cache. The returned bytes carry a cache reference the caller must
    /// release with `unref_mem`.
    fn cached_wire(
        &self,
        uid: Uid,
        message: &dyn Message,
    ) -> Result<Arc<Vec<u8>>, Error> {
        let id = uid.0.get();
        self.cache
            .update_with(id, || Ok(crlf_normalize(&message.to_wire()?)))?;
        self.cache
            .get_mem(id)
            .ok_or_else(|| Error::Storage("cache entry vanished".to_owned()))
    }

    fn logical_part(
        &self,
        message: &dyn Message,
        partspec: &str,
        kind: PartKind,
    ) -> Result<Vec<u8>, Error> {
        match message.part(partspec)? {
            Some(part) => Ok(crlf_normalize(&part.render(kind)?)),
            None => Ok(Vec::new()),
        }
    }
}

/// Write a section's literal, applying the optional `<start.count>` slice
/// (the `<start>` echo appears in the label when sliced).
fn emit_section_body(
    w: &mut LexWriter<Vec<u8>>,
    bytes: &[u8],
    octet_range: Option<(u64, u64)>,
) -> Result<(), Error> {
    match octet_range {
        None => {
            w.verbatim(" ")?;
            w.literal(bytes)?;
        },
        Some((start, count)) => {
            let sliced = slice_octets(bytes, start, count);
            w.verbatim(&format!("<{}> ", start))?;
            w.literal(sliced)?;
        },
    }

    Ok(())
}

fn slice_octets(bytes: &[u8], start: u64, count: u64) -> &[u8] {
    if start >= bytes.len() as u64 {
        return &[];
    }
    let start = start as usize;
    let end = start.saturating_add(count as usize).min(bytes.len());
    &bytes[start..end]
}

/// Keep (or drop, for the NOT form) exactly the named fields of a header
/// block. Continuation lines follow their field's fate.
fn filter_header_fields(
    block: &[u8],
    fields: &[String],
    negate: bool,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(block.len());
    let mut keeping = false;

    for line in block.split_inclusive(|&b| b'\n' == b) {
        let is_continuation =
            line.first().map_or(false, |&b| b' ' == b || b'\t' == b);
        if !is_continuation {
            let name = line
                .split(|&b| b':' == b)
                .next()
                .map(String::from_utf8_lossy)
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase();
            let listed =
                fields.iter().any(|f| f.eq_ignore_ascii_case(&name));
            keeping = listed != negate && !name.is_empty();
        }
        if keeping {
            out.extend_from_slice(line);
        }
    }

    out
}
