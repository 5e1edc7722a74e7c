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

//! The FETCH items descriptor, parsed from the tokenized argument vector.
//!
//! One descriptor exists per FETCH command invocation. The `BodyFetch`
//! header caches deliberately persist across the messages of that one
//! command so the header prefetch (see `imap::fetch`) can amortize its
//! query over the batch.

use std::collections::HashMap;

use nom::{
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res},
    multi::separated_nonempty_list,
    sequence::{delimited, separated_pair},
    IResult,
};

use crate::support::error::Error;

bitflags! {
    /// The independent, order-stable FETCH items.
    pub struct SimpleItems: u32 {
        const FLAGS         = 1 << 0;
        const INTERNALDATE  = 1 << 1;
        const RFC822_SIZE   = 1 << 2;
        const UID           = 1 << 3;
        const ENVELOPE      = 1 << 4;
        /// BODYSTRUCTURE without extension data.
        const BODY          = 1 << 5;
        const BODYSTRUCTURE = 1 << 6;
        const RFC822        = 1 << 7;
        const RFC822_HEADER = 1 << 8;
        const RFC822_TEXT   = 1 << 9;
    }
}

/// Which rendition of the addressed part a `BODY[...]` item wants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ItemType {
    Text,
    Header,
    Mime,
    HeaderFields,
    HeaderFieldsNot,
    /// The bare part (or whole message for an empty partspec), emitted
    /// without a section keyword in the label.
    TextSilent,
}

#[derive(Debug)]
pub struct BodyFetch {
    /// Dotted numeric part path; empty addresses the whole message.
    pub partspec: String,
    pub item_type: ItemType,
    /// Field names for `HEADER.FIELDS` / `HEADER.FIELDS.NOT`.
    pub field_names: Vec<String>,
    /// `<start.count>` octet slicing of the rendered bytes.
    pub octet_range: Option<(u64, u64)>,
    pub peek: bool,
    /// uid → rendered header block, filled by the batch prefetch. Lives
    /// for the duration of one FETCH command.
    pub headers: HashMap<u64, String>,
    /// Highest uid already covered by the prefetch.
    pub ceiling: u64,
    /// Index into the fetch batch where the next prefetch window starts.
    pub lo: usize,
}

impl BodyFetch {
    /// The section text as echoed inside `BODY[...]` in the response.
    pub fn section_label(&self) -> String {
        let keyword = match self.item_type {
            ItemType::Text => "TEXT",
            ItemType::Header => "HEADER",
            ItemType::Mime => "MIME",
            ItemType::HeaderFields => "HEADER.FIELDS",
            ItemType::HeaderFieldsNot => "HEADER.FIELDS.NOT",
            ItemType::TextSilent => "",
        };

        match (self.partspec.is_empty(), keyword.is_empty()) {
            (true, true) => String::new(),
            (true, false) => keyword.to_owned(),
            (false, true) => self.partspec.clone(),
            (false, false) => format!("{}.{}", self.partspec, keyword),
        }
    }
}

#[derive(Debug, Default)]
pub struct FetchItems {
    pub simple: SimpleItems,
    pub body_fetches: Vec<BodyFetch>,
}

impl Default for SimpleItems {
    fn default() -> Self {
        SimpleItems::empty()
    }
}

impl FetchItems {
    /// Whether any requested item needs the parsed message (as opposed to
    /// stored metadata).
    pub fn needs_message(&self) -> bool {
        self.simple.intersects(
            SimpleItems::ENVELOPE
                | SimpleItems::BODY
                | SimpleItems::BODYSTRUCTURE
                | SimpleItems::RFC822
                | SimpleItems::RFC822_HEADER
                | SimpleItems::RFC822_TEXT,
        ) || !self.body_fetches.is_empty()
    }

    /// Whether a successful fetch implicitly sets `\Seen` (some item
    /// touched the body and was not a PEEK variant).
    pub fn sets_seen(&self) -> bool {
        self.simple
            .intersects(SimpleItems::RFC822 | SimpleItems::RFC822_TEXT)
            || self.body_fetches.iter().any(|bf| !bf.peek)
    }

    /// Parse fetch items from `args` starting at `*idx`, consuming to the
    /// end of the vector.
    pub fn parse(args: &[String], idx: &mut usize) -> Result<Self, Error> {
        if *idx >= args.len() {
            return Err(Error::ProtocolSyntax(
                "FETCH items missing".to_owned(),
            ));
        }

        let mut items = FetchItems::default();
        while *idx < args.len() {
            let token = args[*idx].to_ascii_lowercase();
            match token.as_str() {
                "(" | ")" => {
                    *idx += 1;
                },

                "all" => {
                    items.simple |= SimpleItems::FLAGS
                        | SimpleItems::INTERNALDATE
                        | SimpleItems::RFC822_SIZE
                        | SimpleItems::ENVELOPE;
                    *idx += 1;
                },
                "fast" => {
                    items.simple |= SimpleItems::FLAGS
                        | SimpleItems::INTERNALDATE
                        | SimpleItems::RFC822_SIZE;
                    *idx += 1;
                },
                "full" => {
                    items.simple |= SimpleItems::FLAGS
                        | SimpleItems::INTERNALDATE
                        | SimpleItems::RFC822_SIZE
                        | SimpleItems::ENVELOPE
                        | SimpleItems::BODY;
                    *idx += 1;
                },

                "flags" => {
                    items.simple |= SimpleItems::FLAGS;
                    *idx += 1;
                },
                "internaldate" => {
                    items.simple |= SimpleItems::INTERNALDATE;
                    *idx += 1;
                },
                "rfc822.size" => {
                    items.simple |= SimpleItems::RFC822_SIZE;
                    *idx += 1;
                },
                "uid" => {
                    items.simple |= SimpleItems::UID;
                    *idx += 1;
                },
                "envelope" => {
                    items.simple |= SimpleItems::ENVELOPE;
                    *idx += 1;
                },
                "bodystructure" => {
                    items.simple |= SimpleItems::BODYSTRUCTURE;
                    *idx += 1;
                },
                "rfc822" => {
                    items.simple |= SimpleItems::RFC822;
                    *idx += 1;
                },
                "rfc822.header" => {
                    items.simple |= SimpleItems::RFC822_HEADER;
                    *idx += 1;
                },
                "rfc822.text" => {
                    items.simple |= SimpleItems::RFC822_TEXT;
                    *idx += 1;
                },

                "body" | "body.peek" => {
                    let peek = "body.peek" == token;
                    if *idx + 1 < args.len() && "[" == args[*idx + 1] {
                        *idx += 2;
                        parse_section(args, idx, peek, &mut items)?;
                    } else if peek {
                        return Err(Error::ProtocolSyntax(
                            "BODY.PEEK requires a section".to_owned(),
                        ));
                    } else {
                        items.simple |= SimpleItems::BODY;
                        *idx += 1;
                    }
                },

                _ => {
                    return Err(Error::ProtocolSyntax(format!(
                        "unknown fetch item {}",
                        args[*idx]
                    )))
                },
            }
        }

        Ok(items)
    }
}

/// Parse one `BODY[...]` section, positioned just past the `[`.
fn parse_section(
    args: &[String],
    idx: &mut usize,
    peek: bool,
    items: &mut FetchItems,
) -> Result<(), Error> {
    if *idx >= args.len() {
        return Err(Error::ProtocolSyntax(
            "unterminated body section".to_owned(),
        ));
    }

    let (partspec, item_type) = if "]" == args[*idx] {
        (String::new(), ItemType::TextSilent)
    } else {
        let parsed = split_section_token(&args[*idx]).ok_or_else(|| {
            Error::ProtocolSyntax(format!(
                "bad body section {}",
                args[*idx]
            ))
        })?;
        *idx += 1;
        parsed
    };

    if ItemType::Mime == item_type && partspec.is_empty() {
        return Err(Error::ProtocolSyntax(
            "MIME requires a part".to_owned(),
        ));
    }

    let mut field_names = Vec::new();
    if matches!(item_type, ItemType::HeaderFields | ItemType::HeaderFieldsNot)
    {
        if *idx >= args.len() || "(" != args[*idx] {
            return Err(Error::ProtocolSyntax(
                "HEADER.FIELDS needs a field list".to_owned(),
            ));
        }
        *idx += 1;
        while *idx < args.len() && ")" != args[*idx] {
            field_names.push(args[*idx].clone());
            *idx += 1;
        }
        if *idx >= args.len() || field_names.is_empty() {
            return Err(Error::ProtocolSyntax(
                "HEADER.FIELDS needs a field list".to_owned(),
            ));
        }
        *idx += 1; // the ')'
    }

    if *idx >= args.len() || "]" != args[*idx] {
        return Err(Error::ProtocolSyntax(
            "unterminated body section".to_owned(),
        ));
    }
    *idx += 1;

    let mut octet = None;
    if *idx < args.len() && args[*idx].starts_with('<') {
        octet = Some(parse_octet_range(&args[*idx]).ok_or_else(|| {
            Error::ProtocolSyntax(format!(
                "bad octet range {}",
                args[*idx]
            ))
        })?);
        *idx += 1;
    }

    items.body_fetches.push(BodyFetch {
        partspec,
        item_type,
        field_names,
        octet_range: octet,
        peek,
        headers: HashMap::new(),
        ceiling: 0,
        lo: 0,
    });

    Ok(())
}

fn part_path(input: &str) -> IResult<&str, Vec<u32>> {
    separated_nonempty_list(
        char('.'),
        map_res(digit1, str::parse::<u32>),
    )(input)
}

fn octet_pair(input: &str) -> IResult<&str, (u64, u64)> {
    all_consuming(delimited(
        char('<'),
        separated_pair(
            map_res(digit1, str::parse::<u64>),
            char('.'),
            map_res(digit1, str::parse::<u64>),
        ),
        char('>'),
    ))(input)
}

pub fn parse_octet_range(token: &str) -> Option<(u64, u64)> {
    octet_pair(token).ok().map(|(_, pair)| pair)
}

/// Split a section token into its numeric part path and item keyword:
/// `1.2.TEXT` → (`1.2`, Text), `HEADER.FIELDS` → (``, HeaderFields),
/// `1.2.3` → (`1.2.3`, TextSilent).
fn split_section_token(token: &str) -> Option<(String, ItemType)> {
    let segments: Vec<&str> = token.split('.').collect();
    let mut numeric = 0;
    while numeric < segments.len()
        && !segments[numeric].is_empty()
        && segments[numeric].bytes().all(|b| b.is_ascii_digit())
    {
        numeric += 1;
    }

    let partspec = segments[..numeric].join(".");
    if !partspec.is_empty()
        && all_consuming(part_path)(partspec.as_str()).is_err()
    {
        return None;
    }

    let keyword = segments[numeric..].join(".").to_ascii_uppercase();
    let item_type = match keyword.as_str() {
        "" => ItemType::TextSilent,
        "TEXT" => ItemType::Text,
        "HEADER" => ItemType::Header,
        "MIME" => ItemType::Mime,
        "HEADER.FIELDS" => ItemType::HeaderFields,
        "HEADER.FIELDS.NOT" => ItemType::HeaderFieldsNot,
        _ => return None,
    };

    Some((partspec, item_type))
}
