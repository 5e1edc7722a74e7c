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

//! The collaborator boundary.
//!
//! Everything the engine needs from the outside world — parameterized SQL
//! against the mail store, MIME rendering, credential validation — comes
//! through the traits in this module. The engine never assumes a concrete
//! storage backend.

pub mod auth;
pub mod cache;
pub mod message;
pub mod query;
