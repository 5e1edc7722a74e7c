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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The client sent something the tokenizer or a command parser could
    /// not make sense of. Reported to the client as a tagged `BAD`.
    #[error("Protocol syntax error: {0}")]
    ProtocolSyntax(String),
    #[error("Unbalanced parenthesis or bracket")]
    UnbalancedGrouping,
    #[error("Malformed string literal")]
    BadLiteral,
    #[error("Command line too long")]
    CommandLineTooLong,
    #[error("Too many command arguments")]
    TooManyArguments,
    #[error("Unparsable sequence set")]
    BadSequenceSet,
    #[error("Unsupported charset")]
    BadCharset,
    #[error("Unknown command")]
    UnknownCommand,

    /// Semantic failures reported as a tagged `NO`.
    #[error("No such mailbox")]
    NxMailbox,
    #[error("No such message")]
    NxMessage,
    #[error("Mailbox is read-only")]
    MailboxReadOnly,
    #[error("Operation not permitted by ACL")]
    AclDenied,
    #[error("Bad credentials")]
    AuthenticationRejected,
    #[error("Command invalid in current state")]
    BadState,

    /// Backend failures. Depending on where they strike, these surface as
    /// a tagged `NO` or as `* BYE` plus disconnect.
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Message render error: {0}")]
    MessageRender(String),
    #[error("Authentication backend error: {0}")]
    AuthBackend(String),

    /// The session state machine was driven into a state from which it
    /// cannot continue; fatal to the connection.
    #[error("Session in unrecoverable error state")]
    SessionDead,

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error is a protocol syntax error (client's fault,
    /// answered with `BAD` and counted against the error budget).
    pub fn is_syntax(&self) -> bool {
        matches!(
            self,
            Error::ProtocolSyntax(_)
                | Error::UnbalancedGrouping
                | Error::BadLiteral
                | Error::CommandLineTooLong
                | Error::TooManyArguments
                | Error::BadSequenceSet
                | Error::BadCharset
                | Error::UnknownCommand
        )
    }
}
