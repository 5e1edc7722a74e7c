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

use std::fmt;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement
/// for one connection.
///
/// Clones of a `LogPrefix` share the same underlying data, so the session
/// can fill in the user and selected mailbox as they become known and every
/// holder of the prefix picks the change up.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    peer: String,
    user: Option<String>,
    mailbox: Option<String>,
}

impl LogPrefix {
    pub fn new(peer: String) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                peer,
                user: None,
                mailbox: None,
            })),
        }
    }

    pub fn set_user(&self, user: String) {
        self.inner.lock().unwrap().user = Some(sanitise(user));
    }

    pub fn set_mailbox(&self, mailbox: Option<String>) {
        self.inner.lock().unwrap().mailbox = mailbox.map(sanitise);
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "imap:{}", inner.peer)?;
        if let Some(ref user) = inner.user {
            write!(f, "[{}", user)?;
            if let Some(ref mailbox) = inner.mailbox {
                write!(f, " {}", mailbox)?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}

fn sanitise(mut s: String) -> String {
    s.retain(|c| !c.is_control());
    if let Some((truncate_len, _)) = s.char_indices().nth(64) {
        s.truncate(truncate_len);
    }

    s
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn formats_incrementally() {
        let prefix = LogPrefix::new("10.0.0.1".to_owned());
        assert_eq!("imap:10.0.0.1", prefix.to_string());

        prefix.set_user("jsmith".to_owned());
        assert_eq!("imap:10.0.0.1[jsmith]", prefix.to_string());

        prefix.set_mailbox(Some("INBOX".to_owned()));
        assert_eq!("imap:10.0.0.1[jsmith INBOX]", prefix.to_string());

        prefix.set_mailbox(None);
        assert_eq!("imap:10.0.0.1[jsmith]", prefix.to_string());
    }

    #[test]
    fn sanitises_control_characters() {
        let prefix = LogPrefix::new("peer".to_owned());
        prefix.set_user("a\r\nb".to_owned());
        assert_eq!("imap:peer[ab]", prefix.to_string());
    }
}
