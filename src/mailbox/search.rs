//-
// Copyright (c) 2020, 2021, 2022, Jason Lingle
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

//! Evaluation of a built [`SearchTree`] against a mailbox view.
//!
//! Search runs in three traversals:
//!
//! 1. A pre-scan over the top two tree levels that resolves plain
//!    sequence-set leaves and ANDs them straight into the working
//!    universe, shrinking it before any storage query runs. Purely an
//!    optimization; the evaluation latch makes re-visiting safe.
//! 2. The main pass, which evaluates every remaining leaf against the
//!    store (constrained by an explicit `IN (...)` when the working set is
//!    small) and gives interior nodes an empty result to merge into.
//! 3. The merge pass, which folds children into parents with the
//!    ordered-set algebra. Child sets are consumed as they are folded;
//!    no child's result outlives its use.
//!
//! A storage failure anywhere aborts the whole command; partial results
//! are never returned.

use std::collections::HashSet;

use log::{debug, warn};

use super::model::Uid;
use super::ordered_set::MergeOp;
use super::search_tree::{
    DateCmp, NodeState, SearchKey, SearchTree, SortSpec,
};
use super::view::{IdSet, MailboxView};
use crate::store::query::{Param, Store};
use crate::support::error::Error;

/// Working sets at or under this size are inlined into leaf queries as an
/// `id IN (...)` constraint.
const INSET_THRESHOLD: usize = 200;

/// Message status values the engine considers visible.
const STATUS_NEW: i64 = 0;
const STATUS_SEEN: i64 = 1;

pub struct SearchEngine<'a> {
    store: &'a dyn Store,
    view: &'a MailboxView,
    prefix: &'a str,
}

impl<'a> SearchEngine<'a> {
    pub fn new(
        store: &'a dyn Store,
        view: &'a MailboxView,
        prefix: &'a str,
    ) -> Self {
        SearchEngine {
            store,
            view,
            prefix,
        }
    }

    /// Evaluate `tree`, returning the matching uid→msn set.
    pub fn search(&self, tree: &mut SearchTree) -> Result<IdSet, Error> {
        let mut found = self.view.uids.clone();
        if tree.root().is_none() || self.view.uids.is_empty() {
            return Ok(found);
        }

        self.prescan(tree, &mut found)?;
        self.eval_pass(tree, &found)?;
        // Pre-order over the arena; interior nodes recurse into their
        // children and the latch keeps them from being folded twice.
        for ix in 0..tree.nodes.len() {
            self.merge_node(tree, ix, &mut found)?;
        }

        debug!("search matched {} of {} ids", found.len(), self.view.exists());
        Ok(found)
    }

    /// Run the query of the tree's Sort node, returning `found` in sorted
    /// order. Uids outside `found` are skipped.
    pub fn sort(
        &self,
        tree: &mut SearchTree,
        found: &IdSet,
    ) -> Result<Vec<Uid>, Error> {
        let sort_ix = tree.nodes.iter().position(|n| {
            matches!(n.key, SearchKey::Sort(_))
                && NodeState::Unevaluated == n.state
        });
        let sort_ix = match sort_ix {
            Some(ix) => ix,
            None => return Ok(found.keys().collect()),
        };

        let spec = match tree.nodes[sort_ix].key {
            SearchKey::Sort(ref spec) => spec.clone(),
            _ => unreachable!(),
        };

        let sql = self.sort_sql(&spec);
        let mut rows = self.store.query(
            &sql,
            &[
                Param::U64(self.view.id),
                Param::I64(STATUS_NEW),
                Param::I64(STATUS_SEEN),
            ],
        )?;

        let mut seen = HashSet::new();
        let mut sorted = Vec::with_capacity(found.len());
        while rows.next()? {
            let raw = rows.get_u64(0)?;
            let uid = match Uid::of(raw) {
                Some(uid) => uid,
                None => continue,
            };
            if found.contains(&uid) && seen.insert(uid) {
                sorted.push(uid);
            }
        }

        tree.nodes[sort_ix].state = NodeState::Evaluated;
        Ok(sorted)
    }

    fn sort_sql(&self, spec: &SortSpec) -> String {
        let p = self.prefix;
        let mut joins = String::new();
        for table in &spec.joins {
            joins.push_str(&format!(
                "LEFT JOIN {p}{t} ON m.physmessage_id={p}{t}.physmessage_id ",
                p = p,
                t = table
            ));
        }

        let mut order = String::new();
        for term in &spec.order {
            order.push_str(term.field);
            if term.reverse {
                order.push_str(" DESC");
            }
            order.push(',');
        }

        format!(
            "SELECT message_idnr FROM {p}messages m \
             LEFT JOIN {p}physmessage p ON m.physmessage_id=p.id \
             {joins}\
             WHERE m.mailbox_idnr = ? AND m.status IN (?,?) \
             ORDER BY {order}message_idnr",
            p = p,
            joins = joins,
            order = order
        )
    }

    /// Breadth-first over the top two levels: resolve sequence-set leaves
    /// and AND them into the universe before the expensive leaves run.
    fn prescan(
        &self,
        tree: &mut SearchTree,
        found: &mut IdSet,
    ) -> Result<(), Error> {
        let mut candidates = vec![0];
        candidates.extend(tree.nodes[0].children.iter().copied());

        for ix in candidates {
            if NodeState::Unevaluated != tree.nodes[ix].state {
                continue;
            }

            let set = match tree.nodes[ix].key {
                SearchKey::Set(ref raw) => {
                    self.view.resolve_set(raw, false)?
                },
                SearchKey::UidSet(ref raw) => {
                    self.view.resolve_set(raw, true)?
                },
                _ => continue,
            };

            found.merge(set, MergeOp::And);
            tree.nodes[ix].state = NodeState::Merged;
        }

        Ok(())
    }

    /// Evaluate every unvisited node. Arena order is construction order,
    /// so this is a pre-order walk; leaves are independent of each other
    /// and interior nodes merely allocate the set the merge pass fills.
    fn eval_pass(
        &self,
        tree: &mut SearchTree,
        found: &IdSet,
    ) -> Result<(), Error> {
        for ix in 0..tree.nodes.len() {
            if NodeState::Unevaluated != tree.nodes[ix].state {
                continue;
            }

            let key = tree.nodes[ix].key.clone();
            let result = match key {
                SearchKey::Sort(_) => continue,
                SearchKey::Set(ref raw) => {
                    self.view.resolve_set(raw, false)?
                },
                SearchKey::UidSet(ref raw) => {
                    self.view.resolve_set(raw, true)?
                },
                SearchKey::SubsearchAnd
                | SearchKey::SubsearchOr
                | SearchKey::SubsearchNot => IdSet::new(),
                ref leaf => self.leaf_query(leaf, found)?,
            };

            tree.nodes[ix].found = Some(result);
            tree.nodes[ix].state = NodeState::Evaluated;
        }

        Ok(())
    }

    /// Fold the subtree at `ix` into `found`.
    fn merge_node(
        &self,
        tree: &mut SearchTree,
        ix: usize,
        found: &mut IdSet,
    ) -> Result<(), Error> {
        if matches!(tree.nodes[ix].key, SearchKey::Sort(_))
            || NodeState::Merged == tree.nodes[ix].state
        {
            return Ok(());
        }

        let children = tree.nodes[ix].children.clone();
        match tree.nodes[ix].key {
            SearchKey::SubsearchAnd => {
                for child in children {
                    self.merge_node(tree, child, found)?;
                }
                tree.nodes[ix].found = None;
                tree.nodes[ix].state = NodeState::Merged;
            },
            SearchKey::SubsearchNot => {
                // Children AND into a copy of the parent universe; what
                // remains is subtracted from the parent.
                let mut mine = found.clone();
                for child in children {
                    self.merge_node(tree, child, &mut mine)?;
                }
                found.merge(mine, MergeOp::Not);
                tree.nodes[ix].found = None;
                tree.nodes[ix].state = NodeState::Merged;
            },
            SearchKey::SubsearchOr => {
                if 2 != children.len() {
                    return Err(Error::ProtocolSyntax(
                        "OR needs two operands".to_owned(),
                    ));
                }

                // Each branch expands against the parent universe, then
                // the union is ANDed back in.
                let mut a = self.or_branch(tree, children[0], found)?;
                let b = self.or_branch(tree, children[1], found)?;
                a.merge(b, MergeOp::Or);
                found.merge(a, MergeOp::And);
                tree.nodes[ix].found = None;
                tree.nodes[ix].state = NodeState::Merged;
            },
            _ => {
                let mine =
                    tree.nodes[ix].found.take().unwrap_or_default();
                found.merge(mine, MergeOp::And);
                tree.nodes[ix].state = NodeState::Merged;
            },
        }

        Ok(())
    }

    fn or_branch(
        &self,
        tree: &mut SearchTree,
        ix: usize,
        universe: &IdSet,
    ) -> Result<IdSet, Error> {
        let mut mine = universe.clone();
        self.merge_node(tree, ix, &mut mine)?;
        Ok(mine)
    }

    /// Resolve one storage-backed leaf to the subset of the view it
    /// matches.
    fn leaf_query(
        &self,
        key: &SearchKey,
        found: &IdSet,
    ) -> Result<IdSet, Error> {
        let inset = if !found.is_empty() && found.len() <= INSET_THRESHOLD {
            format!("AND m.message_idnr IN ({}) ", found.join_keys(","))
        } else {
            String::new()
        };

        let p = self.prefix;
        let mailbox = Param::U64(self.view.id);
        let status = [Param::I64(STATUS_NEW), Param::I64(STATUS_SEEN)];

        let mut like_term = String::new();
        let mut date_term = String::new();

        let (sql, params): (String, Vec<Param<'_>>) = match *key {
            SearchKey::Flag(cond) => (
                format!(
                    "SELECT message_idnr FROM {p}messages m \
                     WHERE mailbox_idnr = ? AND status IN (?,?) \
                     {inset}AND {cond} ORDER BY message_idnr",
                    p = p,
                    inset = inset,
                    cond = cond
                ),
                vec![mailbox, status[0], status[1]],
            ),

            SearchKey::Header { ref field, ref term } => {
                like_term = format!("%{}%", term);
                (
                    format!(
                        "SELECT message_idnr FROM {p}messages m \
                         LEFT JOIN {p}header h USING (physmessage_id) \
                         LEFT JOIN {p}headername n ON h.headername_id = n.id \
                         LEFT JOIN {p}headervalue v ON h.headervalue_id = v.id \
                         WHERE mailbox_idnr = ? AND status IN (?,?) \
                         {inset}AND n.headername = ? AND v.headervalue LIKE ? \
                         ORDER BY message_idnr",
                        p = p,
                        inset = inset
                    ),
                    vec![
                        mailbox,
                        status[0],
                        status[1],
                        Param::Str(field),
                        Param::Str(&like_term),
                    ],
                )
            },

            SearchKey::HeaderDate { cmp, date } => {
                date_term = date.format("%Y-%m-%d").to_string();
                let op = date_op(cmp);
                (
                    format!(
                        "SELECT message_idnr FROM {p}messages m \
                         LEFT JOIN {p}header h USING (physmessage_id) \
                         LEFT JOIN {p}headername n ON h.headername_id = n.id \
                         LEFT JOIN {p}headervalue v ON h.headervalue_id = v.id \
                         WHERE mailbox_idnr = ? AND status IN (?,?) \
                         {inset}AND n.headername = 'date' \
                         AND DATE(v.headervalue) {op} ? \
                         ORDER BY message_idnr",
                        p = p,
                        inset = inset,
                        op = op
                    ),
                    vec![mailbox, status[0], status[1], Param::Str(&date_term)],
                )
            },

            SearchKey::InternalDate { cmp, date } => {
                date_term = date.format("%Y-%m-%d").to_string();
                let cond = match cmp {
                    DateCmp::Before => "p.internal_date < ?",
                    DateCmp::On => "DATE(p.internal_date) = ?",
                    DateCmp::Since => "p.internal_date >= ?",
                };
                (
                    format!(
                        "SELECT message_idnr FROM {p}messages m \
                         LEFT JOIN {p}physmessage p ON m.physmessage_id=p.id \
                         WHERE mailbox_idnr = ? AND status IN (?,?) \
                         {inset}AND {cond} ORDER BY message_idnr",
                        p = p,
                        inset = inset,
                        cond = cond
                    ),
                    vec![mailbox, status[0], status[1], Param::Str(&date_term)],
                )
            },

            SearchKey::Size { larger, threshold } => (
                format!(
                    "SELECT m.message_idnr FROM {p}messages m \
                     LEFT JOIN {p}physmessage p ON m.physmessage_id = p.id \
                     WHERE m.mailbox_idnr = ? AND m.status IN (?,?) \
                     {inset}AND p.rfcsize {op} ? ORDER BY message_idnr",
                    p = p,
                    inset = inset,
                    op = if larger { ">" } else { "<" }
                ),
                vec![mailbox, status[0], status[1], Param::U64(threshold)],
            ),

            SearchKey::Keyword(ref kw) | SearchKey::Unkeyword(ref kw) => (
                format!(
                    "SELECT m.message_idnr FROM {p}messages m \
                     JOIN {p}keywords k ON m.message_idnr=k.message_idnr \
                     WHERE mailbox_idnr = ? AND status IN (?,?) \
                     {inset}AND k.keyword = ? ORDER BY message_idnr",
                    p = p,
                    inset = inset
                ),
                vec![mailbox, status[0], status[1], Param::Str(kw)],
            ),

            SearchKey::Body(ref term) => {
                like_term = format!("%{}%", term);
                (
                    format!(
                        "SELECT DISTINCT m.message_idnr FROM {p}mimeparts q \
                         LEFT JOIN {p}partlists l ON q.id=l.part_id \
                         LEFT JOIN {p}physmessage s ON l.physmessage_id=s.id \
                         LEFT JOIN {p}messages m ON m.physmessage_id=s.id \
                         WHERE m.mailbox_idnr = ? AND m.status IN (?,?) \
                         {inset}AND (l.part_key > 1 OR l.is_header=0) \
                         AND q.data LIKE ? ORDER BY m.message_idnr",
                        p = p,
                        inset = inset
                    ),
                    vec![mailbox, status[0], status[1], Param::Str(&like_term)],
                )
            },

            SearchKey::Text(ref term) => {
                like_term = format!("%{}%", term);
                (
                    format!(
                        "SELECT DISTINCT m.message_idnr FROM {p}mimeparts q \
                         LEFT JOIN {p}partlists l ON q.id=l.part_id \
                         LEFT JOIN {p}physmessage s ON l.physmessage_id=s.id \
                         LEFT JOIN {p}header h ON h.physmessage_id=s.id \
                         LEFT JOIN {p}headervalue v ON h.headervalue_id=v.id \
                         LEFT JOIN {p}messages m ON m.physmessage_id=s.id \
                         WHERE m.mailbox_idnr = ? AND m.status IN (?,?) \
                         {inset}AND (v.headervalue LIKE ? OR q.data LIKE ?) \
                         ORDER BY m.message_idnr",
                        p = p,
                        inset = inset
                    ),
                    vec![
                        mailbox,
                        status[0],
                        status[1],
                        Param::Str(&like_term),
                        Param::Str(&like_term),
                    ],
                )
            },

            ref other => {
                return Err(Error::Storage(format!(
                    "unexpected leaf {:?}",
                    other
                )))
            },
        };

        let mut rows = self.store.query(&sql, &params)?;
        let mut result = IdSet::new();
        while rows.next()? {
            let raw = rows.get_u64(0)?;
            let uid = match Uid::of(raw) {
                Some(uid) => uid,
                None => continue,
            };
            match self.view.uids.get(&uid) {
                Some(msn) => {
                    result.insert(uid, msn);
                },
                // Stale row; the view simply doesn't know this id.
                None => warn!("id {} missing from mailbox view", raw),
            }
        }

        if let SearchKey::Unkeyword(_) = *key {
            // Complement against the whole view. O(exists) per UNKEYWORD
            // predicate; tolerable until mailboxes get very large.
            let mut inverted = self.view.uids.clone();
            inverted.merge(result, MergeOp::Not);
            return Ok(inverted);
        }

        Ok(result)
    }
}

fn date_op(cmp: DateCmp) -> &'static str {
    match cmp {
        DateCmp::Before => "<",
        DateCmp::On => "=",
        DateCmp::Since => ">=",
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashMap;

    use super::*;
    use crate::mailbox::model::MailboxData;
    use crate::mailbox::search_tree::SearchOrder;
    use crate::store::query::Rows;

    /// An in-memory store understanding exactly the statements the engine
    /// issues.
    #[derive(Default)]
    struct MockStore {
        flags: HashMap<u64, Vec<&'static str>>,
        sizes: HashMap<u64, u64>,
        keywords: HashMap<u64, Vec<&'static str>>,
        text: HashMap<u64, &'static str>,
        fail: bool,
    }

    struct MockRows {
        uids: Vec<u64>,
        pos: Option<usize>,
    }

    impl Rows for MockRows {
        fn next(&mut self) -> Result<bool, Error> {
            let next = self.pos.map_or(0, |p| p + 1);
            self.pos = Some(next);
            Ok(next < self.uids.len())
        }

        fn get_u64(&self, _col: usize) -> Result<u64, Error> {
            Ok(self.uids[self.pos.unwrap()])
        }

        fn get_str(&self, _col: usize) -> Result<String, Error> {
            unimplemented!()
        }

        fn get_blob(&self, _col: usize) -> Result<Vec<u8>, Error> {
            unimplemented!()
        }
    }

    impl MockStore {
        fn matching(&self, sql: &str, params: &[Param<'_>]) -> Vec<u64> {
            let mut uids: Vec<u64> =
                self.flags.keys().copied().collect();
            uids.sort_unstable();

            let term = params.iter().rev().find_map(|p| match *p {
                Param::Str(s) => {
                    Some(s.trim_matches('%').to_owned())
                },
                _ => None,
            });
            let size = params.iter().rev().find_map(|p| match *p {
                Param::U64(s) => Some(s),
                _ => None,
            });

            uids.retain(|uid| {
                if let Some(cond) = extract_flag_cond(sql) {
                    let (flag, want) = cond;
                    let has =
                        self.flags.get(uid).map_or(false, |f| {
                            f.contains(&flag)
                        });
                    return has == want;
                }

                if sql.contains("k.keyword") {
                    return self.keywords.get(uid).map_or(false, |k| {
                        k.contains(&term.as_deref().unwrap())
                    });
                }

                if sql.contains("rfcsize >") {
                    return self.sizes.get(uid).copied().unwrap_or(0)
                        > size.unwrap();
                }
                if sql.contains("rfcsize <") {
                    return self.sizes.get(uid).copied().unwrap_or(0)
                        < size.unwrap();
                }

                if sql.contains("q.data LIKE") {
                    return self.text.get(uid).map_or(false, |t| {
                        t.contains(term.as_deref().unwrap())
                    });
                }

                false
            });

            uids
        }
    }

    fn extract_flag_cond(sql: &str) -> Option<(&'static str, bool)> {
        for flag in
            &["answered", "deleted", "flagged", "recent", "seen", "draft"]
        {
            for &(suffix, want) in &[("=1", true), ("=0", false)] {
                let cond = format!("{}_flag{}", flag, suffix);
                if sql.contains(&cond) {
                    let name: &'static str = match *flag {
                        "answered" => "answered",
                        "deleted" => "deleted",
                        "flagged" => "flagged",
                        "recent" => "recent",
                        "seen" => "seen",
                        _ => "draft",
                    };
                    return Some((name, want));
                }
            }
        }
        None
    }

    impl Store for MockStore {
        fn query<'a>(
            &'a self,
            sql: &str,
            params: &[Param<'_>],
        ) -> Result<Box<dyn Rows + 'a>, Error> {
            if self.fail {
                return Err(Error::Storage("injected failure".to_owned()));
            }

            let uids = if sql.contains("ORDER BY messagesize") {
                let mut uids: Vec<u64> =
                    self.sizes.keys().copied().collect();
                uids.sort_by_key(|uid| self.sizes[uid]);
                uids
            } else {
                self.matching(sql, params)
            };

            Ok(Box::new(MockRows { uids, pos: None }))
        }

        fn execute(
            &self,
            _sql: &str,
            _params: &[Param<'_>],
        ) -> Result<u64, Error> {
            unimplemented!()
        }

        fn load_mailbox(
            &self,
            _user_id: u64,
            _name: &str,
        ) -> Result<Option<MailboxData>, Error> {
            unimplemented!()
        }

        fn poll_mailbox(
            &self,
            _mailbox_id: u64,
        ) -> Result<MailboxData, Error> {
            unimplemented!()
        }

        fn list_mailboxes(
            &self,
            _user_id: u64,
            _pattern: &str,
            _subscribed_only: bool,
        ) -> Result<Vec<crate::mailbox::model::MailboxListing>, Error>
        {
            unimplemented!()
        }

        fn mailbox_status(
            &self,
            _user_id: u64,
            _name: &str,
        ) -> Result<Option<crate::mailbox::model::MailboxStatus>, Error>
        {
            unimplemented!()
        }

        fn create_mailbox(
            &self,
            _user_id: u64,
            _name: &str,
        ) -> Result<(), Error> {
            unimplemented!()
        }

        fn delete_mailbox(
            &self,
            _user_id: u64,
            _name: &str,
        ) -> Result<(), Error> {
            unimplemented!()
        }

        fn rename_mailbox(
            &self,
            _user_id: u64,
            _from: &str,
            _to: &str,
        ) -> Result<(), Error> {
            unimplemented!()
        }

        fn set_subscribed(
            &self,
            _user_id: u64,
            _name: &str,
            _subscribed: bool,
        ) -> Result<(), Error> {
            unimplemented!()
        }

        fn append_message(
            &self,
            _user_id: u64,
            _mailbox: &str,
            _flags: &[crate::mailbox::model::Flag],
            _internal_date: Option<
                chrono::DateTime<chrono::FixedOffset>,
            >,
            _content: &[u8],
        ) -> Result<u64, Error> {
            unimplemented!()
        }

        fn copy_messages(
            &self,
            _mailbox_id: u64,
            _uids: &[Uid],
            _user_id: u64,
            _destination: &str,
        ) -> Result<(), Error> {
            unimplemented!()
        }

        fn message_meta(
            &self,
            _mailbox_id: u64,
            _uid: Uid,
        ) -> Result<Option<crate::mailbox::model::MessageMeta>, Error>
        {
            unimplemented!()
        }

        fn set_flags(
            &self,
            _mailbox_id: u64,
            _uid: Uid,
            _flags: &[crate::mailbox::model::Flag],
            _mode: crate::mailbox::model::FlagsMode,
        ) -> Result<Vec<crate::mailbox::model::Flag>, Error> {
            unimplemented!()
        }

        fn expunge(
            &self,
            _mailbox_id: u64,
            _uids: &[Uid],
        ) -> Result<Vec<Uid>, Error> {
            unimplemented!()
        }

        fn acl_has_right(
            &self,
            _mailbox_id: u64,
            _user_id: u64,
            _right: crate::mailbox::model::AclRight,
        ) -> Result<bool, Error> {
            unimplemented!()
        }
    }

    fn store() -> MockStore {
        let mut store = MockStore::default();
        // Three messages: 10 (seen, small, "hello"), 11 (flagged,
        // medium, "world"), 12 (plain, large, "hello world")
        store.flags.insert(10, vec!["seen"]);
        store.flags.insert(11, vec!["flagged"]);
        store.flags.insert(12, vec![]);
        store.sizes.insert(10, 100);
        store.sizes.insert(11, 2000);
        store.sizes.insert(12, 50000);
        store.keywords.insert(11, vec!["$Important"]);
        store.text.insert(10, "hello");
        store.text.insert(11, "world");
        store.text.insert(12, "hello world");
        store
    }

    fn view() -> MailboxView {
        MailboxView::from_data(MailboxData {
            id: 3,
            name: "INBOX".to_owned(),
            uids: vec![10, 11, 12],
            uidnext: 13,
            uidvalidity: 1,
            recent: 0,
            unseen: 2,
            first_unseen: Some(11),
            keywords: vec![],
            writable: true,
        })
    }

    fn run(store: &MockStore, view: &MailboxView, query: &str) -> Vec<u64> {
        run_uid(store, view, query, false)
    }

    fn run_uid(
        store: &MockStore,
        view: &MailboxView,
        query: &str,
        uid: bool,
    ) -> Vec<u64> {
        let mut tree = SearchTree::new(uid);
        let args: Vec<String> =
            query.split_whitespace().map(str::to_owned).collect();
        let mut idx = 0;
        tree.build(&args, &mut idx, SearchOrder::Unordered).unwrap();

        let engine = SearchEngine::new(store, view, "dm_");
        engine
            .search(&mut tree)
            .unwrap()
            .keys()
            .map(|uid| uid.0.get())
            .collect()
    }

    #[test]
    fn implicit_and_explicit_all_agree() {
        let (store, view) = (store(), view());
        assert_eq!(
            run(&store, &view, "flagged"),
            run(&store, &view, "1:* flagged")
        );
        assert_eq!(vec![11], run(&store, &view, "flagged"));
    }

    #[test]
    fn uid_set_prescan_narrows() {
        let (store, view) = (store(), view());
        assert_eq!(vec![11, 12], run_uid(&store, &view, "11:*", true));
    }

    #[test]
    fn text_partition_is_exhaustive_and_disjoint() {
        let (store, view) = (store(), view());
        let hits = run(&store, &view, "1:* text hello");
        let misses = run(&store, &view, "1:* not text hello");

        assert_eq!(vec![10, 12], hits);
        assert_eq!(vec![11], misses);

        let mut all = hits;
        all.extend(&misses);
        all.sort_unstable();
        assert_eq!(vec![10, 11, 12], all);
    }

    #[test]
    fn or_unions_branches() {
        let (store, view) = (store(), view());
        assert_eq!(
            vec![10, 11],
            run(&store, &view, "or seen keyword $Important")
        );
    }

    #[test]
    fn or_with_not_branch() {
        let (store, view) = (store(), view());
        // NOT TEXT hello = {11}; LARGER 40000 = {12}; union = {11,12}
        assert_eq!(
            vec![11, 12],
            run(&store, &view, "or not text hello larger 40000")
        );
    }

    #[test]
    fn unkeyword_is_complement() {
        let (store, view) = (store(), view());
        assert_eq!(
            vec![10, 12],
            run(&store, &view, "unkeyword $Important")
        );
    }

    #[test]
    fn group_restricts_conjunctively() {
        let (store, view) = (store(), view());
        assert_eq!(
            vec![12],
            run(&store, &view, "( text hello larger 40000 )")
        );
    }

    #[test]
    fn sort_by_size() {
        let (store, view) = (store(), view());
        let mut tree = SearchTree::new(false);
        let args: Vec<String> = "( size ) utf-8 all"
            .split_whitespace()
            .map(str::to_owned)
            .collect();
        let mut idx = 0;
        tree.build(&args, &mut idx, SearchOrder::Sorted).unwrap();

        let engine = SearchEngine::new(&store, &view, "dm_");
        let found = engine.search(&mut tree).unwrap();
        let sorted = engine.sort(&mut tree, &found).unwrap();
        assert_eq!(
            vec![Uid::u(10), Uid::u(11), Uid::u(12)],
            sorted
        );
    }

    #[test]
    fn storage_failure_aborts() {
        let mut store = store();
        store.fail = true;
        let view = view();

        let mut tree = SearchTree::new(false);
        let args = vec!["text".to_owned(), "x".to_owned()];
        let mut idx = 0;
        tree.build(&args, &mut idx, SearchOrder::Unordered).unwrap();

        let engine = SearchEngine::new(&store, &view, "dm_");
        assert!(engine.search(&mut tree).is_err());
    }

    #[test]
    fn node_latches_prevent_reevaluation() {
        let (store, view) = (store(), view());
        let mut tree = SearchTree::new(false);
        let args = vec!["seen".to_owned()];
        let mut idx = 0;
        tree.build(&args, &mut idx, SearchOrder::Unordered).unwrap();

        let engine = SearchEngine::new(&store, &view, "dm_");
        engine.search(&mut tree).unwrap();
        assert!(tree
            .nodes
            .iter()
            .all(|n| NodeState::Merged == n.state));
        assert!(tree.nodes.iter().all(|n| n.found.is_none()));
    }
}
