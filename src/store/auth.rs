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

//! The authentication collaborator.
//!
//! Credential storage and verification live behind this trait (SQL- or
//! directory-backed; the engine does not care). For CRAM-MD5 the engine
//! generates and transmits the challenge, but digest verification is the
//! backend's job since only it can see the shared secret.

use crate::support::error::Error;

/// Connection facts an auth backend may want for logging or policy.
#[derive(Clone, Debug)]
pub struct AuthContext {
    pub peer: String,
    pub secure: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthOutcome {
    Accepted { user_id: u64 },
    Rejected,
}

pub trait Authenticator: Send + Sync {
    /// Plaintext validation (LOGIN and the LOGIN/PLAIN continuations).
    fn validate(
        &self,
        ctx: &AuthContext,
        user: &str,
        pass: &str,
    ) -> Result<AuthOutcome, Error>;

    /// CRAM-MD5 validation. `challenge` is the exact string previously
    /// sent (before base64); `user` and `digest` are the two halves of the
    /// decoded client response.
    fn validate_digest(
        &self,
        ctx: &AuthContext,
        challenge: &str,
        user: &str,
        digest: &str,
    ) -> Result<AuthOutcome, Error>;
}
