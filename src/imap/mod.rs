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

//! The protocol-facing half of the engine: tokenization, response
//! lexing, the fetch machinery, and the per-connection session driver.

mod command;
pub mod fetch;
pub mod fetch_items;
pub mod lex;
pub mod session;
pub mod tokenizer;

pub use session::{ResponseSink, Session, SessionState};
