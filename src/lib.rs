//-
// Copyright (c) 2020, 2023, Jason Lingle
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

//! Maildepot is an IMAP4rev1 server engine for SQL-backed mail stores.
//!
//! The crate provides the protocol-facing machinery — the incremental
//! command tokenizer, the SEARCH/SORT evaluation engine, the per-connection
//! message content cache, and the session state machine — while consuming
//! storage, MIME parsing, and authentication through narrow collaborator
//! traits defined in [`store`]. The host process owns the network event
//! loop and drives each [`imap::Session`] with complete lines and literal
//! payloads.

#![allow(clippy::needless_range_loop)]

#[macro_use]
extern crate bitflags;

pub mod support;

pub mod store;

pub mod mailbox;

pub mod imap;
