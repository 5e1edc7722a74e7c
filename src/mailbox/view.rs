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

//! A session's point-in-time snapshot of its selected mailbox.

use log::warn;

use super::model::{MailboxData, Msn, Uid};
use super::ordered_set::{MergeOp, OrderedSet};
use crate::support::error::Error;

/// The canonical uid→msn mapping.
pub type IdSet = OrderedSet<Uid, Msn>;

/// Unsolicited responses produced by [`MailboxView::refresh`].
///
/// Expunges are reported before the new EXISTS value; EXISTS as seen by the
/// client therefore never decreases without intervening EXPUNGEs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MailboxNotice {
    Expunge(Msn),
    Exists(u32),
    Recent(u32),
}

pub struct MailboxView {
    pub id: u64,
    pub name: String,
    /// Ascending uid→msn map. Invariant: msn values are exactly 1..=len in
    /// ascending uid order (strict order isomorphism).
    pub uids: IdSet,
    pub uidnext: u64,
    pub uidvalidity: u32,
    pub recent: u32,
    pub unseen: u32,
    pub first_unseen: Option<Msn>,
    pub keywords: Vec<String>,
    pub writable: bool,
}

impl MailboxView {
    pub fn from_data(data: MailboxData) -> Self {
        let uids = id_set(&data.uids);
        let first_unseen = data
            .first_unseen
            .and_then(Uid::of)
            .and_then(|uid| uids.get(&uid));

        MailboxView {
            id: data.id,
            name: data.name,
            uids,
            uidnext: data.uidnext.max(1),
            uidvalidity: data.uidvalidity,
            recent: data.recent,
            unseen: data.unseen,
            first_unseen,
            keywords: data.keywords,
            writable: data.writable,
        }
    }

    pub fn exists(&self) -> u32 {
        self.uids.len() as u32
    }

    /// The inverted msn→uid map.
    pub fn msns(&self) -> OrderedSet<Msn, Uid> {
        self.uids.invert()
    }

    pub fn uid_to_msn(&self, uid: Uid) -> Option<Msn> {
        self.uids.get(&uid)
    }

    pub fn msn_to_uid(&self, msn: Msn) -> Option<Uid> {
        self.uids
            .iter()
            .nth(msn.0.get() as usize - 1)
            .map(|(uid, _)| uid)
    }

    /// Resolve an IMAP sequence set to a uid→msn subset of this view.
    ///
    /// `uid_addressed` selects whether the numbers in `set` are UIDs or
    /// sequence numbers. All bounds are clamped to the view's lowest and
    /// highest id, `*` means the highest id, and the 32-bit-max sentinel is
    /// treated as `*` (a workaround for a historical client bug, applied to
    /// exactly that value). A `*` element against an empty mailbox resolves
    /// to a singleton anchored at `uidnext` so that `UID SEARCH *` and
    /// `UID FETCH *` behave on empty mailboxes.
    pub fn resolve_set(
        &self,
        set: &str,
        uid_addressed: bool,
    ) -> Result<IdSet, Error> {
        if set.is_empty() {
            return Err(Error::BadSequenceSet);
        }

        let empty = self.uids.is_empty();
        let (lo, hi) = if uid_addressed {
            match (self.uids.first(), self.uids.last()) {
                (Some((lo, _)), Some((hi, _))) => (lo.0.get(), hi.0.get()),
                _ => (0, 0),
            }
        } else {
            if empty {
                return Err(Error::BadSequenceSet);
            }
            let exists = self.uids.len() as u64;
            if self.uidnext <= exists {
                warn!(
                    "mailbox {} info out of sync: uidnext {} exists {}",
                    self.id, self.uidnext, exists
                );
            }
            (1, exists)
        };

        let mut result = IdSet::new();
        for part in set.split(',') {
            if part.is_empty() {
                break;
            }

            if empty {
                if part.starts_with('*') {
                    result.insert(
                        Uid::of(self.uidnext).unwrap_or(Uid::MIN),
                        Msn::MIN,
                    );
                    continue;
                }
                return Err(Error::BadSequenceSet);
            }

            let mut bounds = part.splitn(2, ':');
            let l = parse_bound(bounds.next().unwrap_or(""), hi)?.max(lo);
            let r = match bounds.next() {
                Some(raw) => parse_bound(raw, hi)?.min(hi).max(lo),
                None => l,
            };

            let (start, end) = (l.min(r), l.max(r));
            let range = if uid_addressed {
                self.uids
                    .filter_range(Uid::u(start.max(1)), Uid::u(end.max(1)))
            } else {
                self.msns()
                    .filter_range(Msn::u(start as u32), Msn::u(end as u32))
                    .invert()
            };

            result.merge(range, MergeOp::Or);
        }

        Ok(result)
    }

    /// Drop `uid` from the snapshot, renumbering the messages after it.
    ///
    /// Returns the sequence number the message had, for the EXPUNGE
    /// response. Callers removing several messages process them one at a
    /// time so each response reflects the renumbered state.
    pub fn remove(&mut self, uid: Uid) -> Option<Msn> {
        let msn = self.uids.get(&uid)?;
        let remaining: Vec<u64> = self
            .uids
            .keys()
            .filter(|&k| k != uid)
            .map(|k| k.0.get())
            .collect();
        self.uids = id_set(&remaining);
        Some(msn)
    }

    /// Replace this snapshot with fresh store data, reporting the
    /// transition as notices: expunges first (descending msn, so earlier
    /// notices do not renumber later ones), then the new EXISTS if the
    /// message set changed, then RECENT if it changed.
    pub fn refresh(&mut self, data: MailboxData) -> Vec<MailboxNotice> {
        let new_uids = id_set(&data.uids);
        let mut notices = Vec::new();

        let mut expunged = self
            .uids
            .iter()
            .filter(|(uid, _)| !new_uids.contains(uid))
            .map(|(_, msn)| msn)
            .collect::<Vec<_>>();
        expunged.sort_unstable_by(|a, b| b.cmp(a));
        let had_expunges = !expunged.is_empty();
        notices.extend(expunged.into_iter().map(MailboxNotice::Expunge));

        if had_expunges || new_uids.len() != self.uids.len() {
            notices.push(MailboxNotice::Exists(new_uids.len() as u32));
        }
        if data.recent != self.recent {
            notices.push(MailboxNotice::Recent(data.recent));
        }

        self.uids = new_uids;
        self.uidnext = data.uidnext.max(1);
        self.recent = data.recent;
        self.unseen = data.unseen;
        self.first_unseen = data
            .first_unseen
            .and_then(Uid::of)
            .and_then(|uid| self.uids.get(&uid));

        notices
    }
}

fn id_set(uids: &[u64]) -> IdSet {
    uids.iter()
        .filter_map(|&raw| Uid::of(raw))
        .enumerate()
        .map(|(ix, uid)| (uid, Msn::from_index(ix)))
        .collect()
}

fn parse_bound(raw: &str, hi: u64) -> Result<u64, Error> {
    if "*" == raw {
        return Ok(hi);
    }

    let v = raw.parse::<u64>().map_err(|_| Error::BadSequenceSet)?;
    if 0 == v {
        Err(Error::BadSequenceSet)
    } else if 0xffff_ffff == v {
        // Some clients send 2^32-1 to mean "highest". Preserved for exactly
        // this value.
        Ok(hi)
    } else {
        Ok(v)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn view(uids: &[u64], uidnext: u64) -> MailboxView {
        MailboxView::from_data(MailboxData {
            id: 7,
            name: "INBOX".to_owned(),
            uids: uids.to_vec(),
            uidnext,
            uidvalidity: 1,
            recent: 0,
            unseen: 0,
            first_unseen: None,
            keywords: vec![],
            writable: true,
        })
    }

    fn uids_of(set: &IdSet) -> Vec<u64> {
        set.keys().map(|uid| uid.0.get()).collect()
    }

    #[test]
    fn msn_addressed_range() {
        let view = view(&[1, 3, 7, 9], 10);
        let set = view.resolve_set("2:*", false).unwrap();
        assert_eq!(vec![3, 7, 9], uids_of(&set));
    }

    #[test]
    fn uid_addressed_list() {
        let view = view(&[1, 3, 7, 9], 10);
        let set = view.resolve_set("1,*", true).unwrap();
        assert_eq!(vec![1, 9], uids_of(&set));
    }

    #[test]
    fn splat_on_empty_mailbox_anchors_at_uidnext() {
        let view = view(&[], 42);
        let set = view.resolve_set("*", true).unwrap();
        assert_eq!(vec![42], uids_of(&set));
        assert_eq!(Some(Msn::MIN), set.get(&Uid::u(42)));

        assert!(view.resolve_set("1:2", true).is_err());
        assert!(view.resolve_set("*", false).is_err());
    }

    #[test]
    fn outlook_sentinel_means_highest() {
        let view = view(&[1, 3, 7, 9], 10);
        let set = view.resolve_set("4294967295", true).unwrap();
        assert_eq!(vec![9], uids_of(&set));
    }

    #[test]
    fn bounds_clamp_and_swap() {
        let view = view(&[1, 3, 7, 9], 10);
        // Endpoints may come in either order
        assert_eq!(
            vec![3, 7],
            uids_of(&view.resolve_set("8:2", true).unwrap())
        );
        // Out-of-range bounds clamp to the existing ids
        assert_eq!(
            vec![1, 3, 7, 9],
            uids_of(&view.resolve_set("1:100", true).unwrap())
        );
    }

    #[test]
    fn garbage_is_rejected() {
        let view = view(&[1, 3], 4);
        assert!(view.resolve_set("x", true).is_err());
        assert!(view.resolve_set("0", true).is_err());
        assert!(view.resolve_set("1:2:3", true).is_err());
    }

    #[test]
    fn msn_uid_isomorphism() {
        let view = view(&[5, 8, 13], 14);
        assert_eq!(Some(Msn::u(2)), view.uid_to_msn(Uid::u(8)));
        assert_eq!(Some(Uid::u(13)), view.msn_to_uid(Msn::u(3)));
        assert_eq!(None, view.uid_to_msn(Uid::u(6)));
        assert_eq!(None, view.msn_to_uid(Msn::u(4)));
    }

    #[test]
    fn refresh_orders_expunge_before_exists() {
        let mut view = view(&[1, 3, 7, 9], 10);
        let notices = view.refresh(MailboxData {
            id: 7,
            name: "INBOX".to_owned(),
            uids: vec![1, 9, 11],
            uidnext: 12,
            uidvalidity: 1,
            recent: 1,
            unseen: 0,
            first_unseen: None,
            keywords: vec![],
            writable: true,
        });

        assert_eq!(
            vec![
                MailboxNotice::Expunge(Msn::u(3)),
                MailboxNotice::Expunge(Msn::u(2)),
                MailboxNotice::Exists(3),
                MailboxNotice::Recent(1),
            ],
            notices
        );
        assert_eq!(Some(Msn::u(3)), view.uid_to_msn(Uid::u(11)));
    }

    #[test]
    fn refresh_without_changes_is_silent() {
        let mut view = view(&[1, 3], 4);
        let notices = view.refresh(MailboxData {
            id: 7,
            name: "INBOX".to_owned(),
            uids: vec![1, 3],
            uidnext: 4,
            uidvalidity: 1,
            recent: 0,
            unseen: 0,
            first_unseen: None,
            keywords: vec![],
            writable: true,
        });
        assert!(notices.is_empty());
    }
}
