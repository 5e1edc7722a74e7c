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

//! Utilities for *writing* values under IMAP's "lexical rules".
//!
//! This is write-only since IMAP's lexical syntax is not separable from its
//! grammar. The code here decides which form to use to encode strings
//! (atom, quoted string, or literal) so that response builders don't have
//! to.
//!
//! We're conservative: a string is written as an atom only if every
//! character is in a known-safe set and it isn't "NIL"; a quoted string is
//! used only for short strings free of controls, backslash, and
//! double-quote; everything else goes out as a literal.

use std::io::{self, Write};

use chrono::prelude::*;

use crate::mailbox::model::Flag;

#[derive(Debug)]
pub struct LexWriter<W> {
    writer: W,
}

impl<W: Write> LexWriter<W> {
    pub fn new(writer: W) -> Self {
        LexWriter { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn verbatim(&mut self, s: &str) -> io::Result<()> {
        self.writer.write_all(s.as_bytes())
    }

    pub fn nil(&mut self) -> io::Result<()> {
        self.verbatim("NIL")
    }

    pub fn astring(&mut self, s: &str) -> io::Result<()> {
        if is_conservative_atom(s) {
            write!(self.writer, "{}", s)?;
        } else {
            self.string(s)?;
        }

        Ok(())
    }

    pub fn nstring(&mut self, s: &Option<impl AsRef<str>>) -> io::Result<()> {
        match s.as_ref() {
            None => self.nil(),
            Some(s) => self.string(s.as_ref()),
        }
    }

    pub fn string(&mut self, s: &str) -> io::Result<()> {
        if is_quotable(s) {
            write!(self.writer, "\"{}\"", s)?;
        } else {
            self.literal(s.as_bytes())?;
        }

        Ok(())
    }

    pub fn literal(&mut self, data: &[u8]) -> io::Result<()> {
        write!(self.writer, "{{{}}}\r\n", data.len())?;
        self.writer.write_all(data)
    }

    pub fn flag(&mut self, flag: &Flag) -> io::Result<()> {
        write!(self.writer, "{}", flag)
    }

    pub fn flags(&mut self, flags: &[Flag]) -> io::Result<()> {
        self.verbatim("(")?;
        for (ix, flag) in flags.iter().enumerate() {
            if ix != 0 {
                self.verbatim(" ")?;
            }
            self.flag(flag)?;
        }
        self.verbatim(")")
    }

    pub fn date(&mut self, date: &NaiveDate) -> io::Result<()> {
        write!(self.writer, "\"{}\"", date.format("%-d-%b-%Y"))
    }

    pub fn datetime(
        &mut self,
        datetime: &DateTime<FixedOffset>,
    ) -> io::Result<()> {
        write!(
            self.writer,
            "\"{}\"",
            datetime.format("%_d-%b-%Y %H:%M:%S %z")
        )
    }

    pub fn num_u32(&mut self, value: u32) -> io::Result<()> {
        write!(self.writer, "{}", value)
    }

    pub fn num_u64(&mut self, value: u64) -> io::Result<()> {
        write!(self.writer, "{}", value)
    }
}

fn is_conservative_atom(s: &str) -> bool {
    !"nil".eq_ignore_ascii_case(s)
        && !s.is_empty()
        && s.as_bytes().iter().copied().all(|b| {
            matches!(
            b,
            b'a'..=b'z'
            | b'A'..=b'Z'
            | b'0'..=b'9'
            | b'='
            | b'?'
            | b'/'
            | b'+'
            | b'_'
            | b'.'
                | b'-')
        })
}

fn is_quotable(s: &str) -> bool {
    s.len() < 100
        && s.as_bytes()
            .iter()
            .copied()
            .all(|b| !matches!(b, 0..=31 | 127 | b'\\' | b'"'))
}

#[cfg(test)]
mod test {
    use super::*;

    fn to_str(l: LexWriter<Vec<u8>>) -> String {
        String::from_utf8(l.into_inner()).unwrap()
    }

    #[test]
    fn astring_forms() {
        let mut l = LexWriter::new(Vec::<u8>::new());
        l.astring("foo").unwrap();
        l.verbatim(" ").unwrap();
        l.astring("nil").unwrap();
        l.verbatim(" ").unwrap();
        l.astring("NIL").unwrap();
        l.verbatim(" ").unwrap();
        l.astring("foo bar").unwrap();
        l.verbatim(" ").unwrap();
        l.astring("foo\\ bar").unwrap();

        assert_eq!(
            "foo \"nil\" \"NIL\" \"foo bar\" {8}\r\nfoo\\ bar",
            to_str(l),
        );
    }

    #[test]
    fn nstring_nil() {
        let mut l = LexWriter::new(Vec::<u8>::new());
        l.nstring(&None::<&str>).unwrap();
        l.verbatim(" ").unwrap();
        l.nstring(&Some("x")).unwrap();
        assert_eq!("NIL \"x\"", to_str(l));
    }

    #[test]
    fn flag_list() {
        let mut l = LexWriter::new(Vec::<u8>::new());
        l.flags(&[Flag::Seen, Flag::Keyword("foo".to_owned())])
            .unwrap();
        assert_eq!("(\\Seen foo)", to_str(l));

        let mut l = LexWriter::new(Vec::<u8>::new());
        l.flags(&[]).unwrap();
        assert_eq!("()", to_str(l));
    }

    #[test]
    fn dates() {
        let mut l = LexWriter::new(Vec::<u8>::new());
        l.date(&NaiveDate::from_ymd(2020, 2, 1)).unwrap();
        assert_eq!("\"1-Feb-2020\"", to_str(l));

        let mut l = LexWriter::new(Vec::<u8>::new());
        l.datetime(
            &FixedOffset::east(3600)
                .ymd(2020, 12, 25)
                .and_hms(13, 59, 0),
        )
        .unwrap();
        assert_eq!("\"25-Dec-2020 13:59:00 +0100\"", to_str(l));
    }

    #[test]
    fn long_strings_become_literals() {
        let long = "x".repeat(150);
        let mut l = LexWriter::new(Vec::<u8>::new());
        l.string(&long).unwrap();
        assert_eq!(format!("{{150}}\r\n{}", long), to_str(l));
    }
}
