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

use serde::{Deserialize, Serialize};

/// Engine configuration, typically the `[imap]` section of the host's
/// TOML configuration file.
///
/// All fields have defaults that are reasonable for most installations.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ImapConfig {
    /// Idle timeout, in seconds, applied before a connection has
    /// authenticated.
    pub preauth_timeout_secs: u64,
    /// Idle timeout, in seconds, applied once a connection has
    /// authenticated.
    pub auth_timeout_secs: u64,
    /// How many consecutive faulty (`BAD`) commands a client may send
    /// before it is forcibly disconnected.
    pub max_consecutive_errors: u32,
    /// Maximum number of tokens accepted for one command.
    pub max_args: usize,
    /// Maximum accepted command line length, in bytes. String literals
    /// count against this as well.
    pub max_command_line: usize,
    /// Time-to-live for entries in the message content cache, in seconds.
    pub cache_ttl_secs: u64,
    /// Interval between cache sweep runs, in seconds.
    pub cache_sweep_secs: u64,
    /// Prefix prepended to all mail store table names. Trusted
    /// configuration; never derived from client input.
    pub table_prefix: String,
    /// Output buffer size at which a mid-command flush is forced.
    pub output_flush_threshold: usize,
}

impl Default for ImapConfig {
    fn default() -> Self {
        ImapConfig {
            preauth_timeout_secs: 60,
            auth_timeout_secs: 1800,
            max_consecutive_errors: 8,
            max_args: 512,
            max_command_line: 65536,
            cache_ttl_secs: 1800,
            cache_sweep_secs: 60,
            table_prefix: "dm_".to_owned(),
            output_flush_threshold: 65536,
        }
    }
}

impl ImapConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }
}
