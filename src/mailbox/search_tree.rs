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

//! The SEARCH/SORT predicate tree and its recursive-descent builder.
//!
//! The tree is an arena of nodes addressed by index. During construction
//! the builder tracks a "current insertion point" index and descends into
//! interior nodes (`NOT`, `OR`, parenthesized groups), popping back to the
//! parent when the group closes. Evaluation state is a single latch enum so
//! that a node cannot be merged without having been evaluated.

use chrono::NaiveDate;
use encoding_rs::Encoding;
use log::debug;

use super::view::IdSet;
use crate::support::error::Error;

/// How the surrounding command wants the results ordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchOrder {
    Unordered,
    Sorted,
    ThreadOrderedSubject,
    ThreadReferences,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DateCmp {
    Before,
    On,
    Since,
}

/// One sort field plus direction, in store column terms.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortTerm {
    pub field: &'static str,
    pub reverse: bool,
}

/// The ordered field list of a SORT command, along with the header tables
/// the sort query must join to see those fields.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SortSpec {
    pub joins: Vec<&'static str>,
    pub order: Vec<SortTerm>,
}

/// A search predicate. Leaf variants resolve against the store; the
/// `Subsearch*` variants are interior nodes whose children carry the
/// operands.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchKey {
    /// Sequence set over message sequence numbers, kept raw until
    /// evaluation resolves it against the live view.
    Set(String),
    /// Sequence set over UIDs.
    UidSet(String),
    /// A flag predicate as a trusted SQL condition over the flag columns,
    /// e.g. `answered_flag=1`. Only ever built from static strings.
    Flag(&'static str),
    Header { field: String, term: String },
    HeaderDate { cmp: DateCmp, date: NaiveDate },
    InternalDate { cmp: DateCmp, date: NaiveDate },
    Size { larger: bool, threshold: u64 },
    Keyword(String),
    Unkeyword(String),
    Body(String),
    Text(String),
    SubsearchAnd,
    SubsearchOr,
    SubsearchNot,
    Sort(SortSpec),
}

impl SearchKey {
    pub fn is_interior(&self) -> bool {
        matches!(
            self,
            SearchKey::SubsearchAnd
                | SearchKey::SubsearchOr
                | SearchKey::SubsearchNot
        )
    }
}

/// Evaluation lifecycle of one node. `Merged` implies `Evaluated`; the
/// single enum makes merged-without-evaluated unrepresentable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    Unevaluated,
    Evaluated,
    Merged,
}

pub struct Node {
    pub key: SearchKey,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
    pub state: NodeState,
    /// Evaluation result, present from `Evaluated` until the merge pass
    /// consumes it.
    pub found: Option<IdSet>,
}

/// Outcome of one grammar step. `Close` means a `)` was consumed (or the
/// arguments ran out): pop up one level, not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildStep {
    More,
    Close,
}

enum SortStep {
    More,
    Done,
    Abort,
}

const CHARSETS: &[&str] = &["utf-8", "us-ascii", "iso-8859-1"];

pub struct SearchTree {
    pub nodes: Vec<Node>,
    current: Option<usize>,
    /// Whether bare message sets address UIDs (`UID SEARCH`) rather than
    /// sequence numbers.
    uid: bool,
    pub charset: Option<String>,
}

impl SearchTree {
    pub fn new(uid: bool) -> Self {
        SearchTree {
            nodes: Vec::new(),
            current: None,
            uid,
            charset: None,
        }
    }

    pub fn root(&self) -> Option<usize> {
        if self.nodes.is_empty() {
            None
        } else {
            Some(0)
        }
    }

    fn append(&mut self, key: SearchKey, descend: bool) -> usize {
        let ix = self.nodes.len();
        let parent = self.current;
        self.nodes.push(Node {
            key,
            parent,
            children: Vec::new(),
            state: NodeState::Unevaluated,
            found: None,
        });

        if let Some(parent) = parent {
            self.nodes[parent].children.push(ix);
        }
        if descend || parent.is_none() {
            self.current = Some(ix);
        }

        ix
    }

    fn pop(&mut self) {
        if let Some(parent) =
            self.current.and_then(|cur| self.nodes[cur].parent)
        {
            self.current = Some(parent);
        }
    }

    fn message_set(&self, raw: &str) -> SearchKey {
        if self.uid {
            SearchKey::UidSet(raw.to_owned())
        } else {
            SearchKey::Set(raw.to_owned())
        }
    }

    /// Parse search keys from `args` starting at `*idx`, appending to this
    /// tree. The root's children are ANDed together.
    ///
    /// An optional leading message set is consumed (defaulting to `1:*`);
    /// under [`SearchOrder::Sorted`] the parenthesized sort-key list and
    /// its charset terminator come next; the Thread orders consume only the
    /// charset. The cursor is always advanced past consumed tokens.
    pub fn build(
        &mut self,
        args: &[String],
        idx: &mut usize,
        order: SearchOrder,
    ) -> Result<BuildStep, Error> {
        if *idx >= args.len() {
            return Ok(BuildStep::Close);
        }

        // Every (sub)program is implicitly ANDed with a message set; an
        // explicit leading set replaces the 1:* default.
        if is_msg_set(&args[*idx]) {
            let key = self.message_set(&args[*idx]);
            *idx += 1;
            self.append(key, false);
        } else {
            self.append(self.message_set("1:*"), false);
        }

        match order {
            SearchOrder::Sorted => {
                let mut spec = SortSpec::default();
                let mut step = SortStep::More;
                while *idx < args.len()
                    && matches!(step, SortStep::More)
                {
                    step = self.sort_step(args, idx, &mut spec)?;
                }
                match step {
                    SortStep::Done => {
                        self.append(SearchKey::Sort(spec), false);
                    },
                    // An unparsable sort program drops the sort node; the
                    // remaining tokens still parse as search keys.
                    SortStep::Abort | SortStep::More => {
                        debug!("dropping unterminated sort specification");
                    },
                }
            },
            SearchOrder::ThreadOrderedSubject
            | SearchOrder::ThreadReferences => {
                if *idx >= args.len()
                    || !CHARSETS
                        .iter()
                        .any(|cs| args[*idx].eq_ignore_ascii_case(cs))
                {
                    return Err(Error::BadCharset);
                }
                *idx += 1;
            },
            SearchOrder::Unordered => (),
        }

        let mut step = BuildStep::More;
        while *idx < args.len() && BuildStep::More == step {
            step = self.search_key(args, idx)?;
        }

        Ok(step)
    }

    fn sort_step(
        &mut self,
        args: &[String],
        idx: &mut usize,
        spec: &mut SortSpec,
    ) -> Result<SortStep, Error> {
        let mut reverse = false;
        let mut key = args[*idx].as_str();

        if key.eq_ignore_ascii_case("reverse") {
            reverse = true;
            *idx += 1;
            if *idx >= args.len() {
                return Ok(SortStep::Abort);
            }
            key = args[*idx].as_str();
        }

        let field = |f| SortTerm { field: f, reverse };

        if key.eq_ignore_ascii_case("arrival") {
            spec.order.push(field("internal_date"));
        } else if key.eq_ignore_ascii_case("size") {
            spec.order.push(field("messagesize"));
        } else if key.eq_ignore_ascii_case("from") {
            spec.joins.push("fromfield");
            spec.order.push(field("fromfield"));
        } else if key.eq_ignore_ascii_case("subject") {
            spec.joins.push("subjectfield");
            spec.order.push(field("subjectfield"));
        } else if key.eq_ignore_ascii_case("cc") {
            spec.joins.push("ccfield");
            spec.order.push(field("ccfield"));
        } else if key.eq_ignore_ascii_case("to") {
            spec.joins.push("tofield");
            spec.order.push(field("tofield"));
        } else if key.eq_ignore_ascii_case("date") {
            spec.joins.push("datefield");
            spec.order.push(field("datefield"));
        } else if "(" == key || ")" == key {
            // grouping of the sort-key list carries no meaning
        } else if CHARSETS.iter().any(|cs| key.eq_ignore_ascii_case(cs)) {
            self.set_charset(key)?;
            *idx += 1;
            return Ok(SortStep::Done);
        } else {
            return Ok(SortStep::Abort);
        }

        *idx += 1;
        Ok(SortStep::More)
    }

    fn search_key(
        &mut self,
        args: &[String],
        idx: &mut usize,
    ) -> Result<BuildStep, Error> {
        let key = args[*idx].as_str();
        let lower = key.to_ascii_lowercase();

        macro_rules! flag {
            ($cond:expr) => {{
                *idx += 1;
                self.append(SearchKey::Flag($cond), false);
            }};
        }

        match lower.as_str() {
            "all" => {
                *idx += 1;
                self.append(SearchKey::UidSet("1:*".to_owned()), false);
            },
            "uid" => {
                let set = self.next_term(args, idx)?;
                if !is_msg_set(&set) {
                    return Err(Error::BadSequenceSet);
                }
                self.append(SearchKey::UidSet(set), false);
            },

            "answered" => flag!("answered_flag=1"),
            "deleted" => flag!("deleted_flag=1"),
            "flagged" => flag!("flagged_flag=1"),
            "recent" => flag!("recent_flag=1"),
            "seen" => flag!("seen_flag=1"),
            "draft" => flag!("draft_flag=1"),
            "new" => flag!("(seen_flag=0 AND recent_flag=1)"),
            "old" => flag!("recent_flag=0"),
            "unanswered" => flag!("answered_flag=0"),
            "undeleted" => flag!("deleted_flag=0"),
            "unflagged" => flag!("flagged_flag=0"),
            "unseen" => flag!("seen_flag=0"),
            "undraft" => flag!("draft_flag=0"),

            "keyword" => {
                let term = self.next_term(args, idx)?;
                self.append(SearchKey::Keyword(term), false);
            },
            "unkeyword" => {
                let term = self.next_term(args, idx)?;
                self.append(SearchKey::Unkeyword(term), false);
            },

            "bcc" | "cc" | "from" | "to" | "subject" => {
                let term = self.next_term(args, idx)?;
                self.append(
                    SearchKey::Header { field: lower, term },
                    false,
                );
            },
            "header" => {
                if *idx + 2 >= args.len() {
                    return Err(Error::ProtocolSyntax(
                        "HEADER needs a field and a value".to_owned(),
                    ));
                }
                let field = args[*idx + 1].to_ascii_lowercase();
                let term = args[*idx + 2].clone();
                *idx += 3;
                self.append(SearchKey::Header { field, term }, false);
            },

            "sentbefore" | "senton" | "sentsince" => {
                let cmp = match lower.as_str() {
                    "sentbefore" => DateCmp::Before,
                    "senton" => DateCmp::On,
                    _ => DateCmp::Since,
                };
                let date = parse_imap_date(&self.next_arg(args, idx)?)?;
                self.append(SearchKey::HeaderDate { cmp, date }, false);
            },
            "before" | "on" | "since" => {
                let cmp = match lower.as_str() {
                    "before" => DateCmp::Before,
                    "on" => DateCmp::On,
                    _ => DateCmp::Since,
                };
                let date = parse_imap_date(&self.next_arg(args, idx)?)?;
                self.append(SearchKey::InternalDate { cmp, date }, false);
            },

            "body" => {
                let term = self.next_term(args, idx)?;
                self.append(SearchKey::Body(term), false);
            },
            "text" => {
                let term = self.next_term(args, idx)?;
                self.append(SearchKey::Text(term), false);
            },

            "larger" | "smaller" => {
                let larger = "larger" == lower;
                let threshold = self
                    .next_arg(args, idx)?
                    .parse::<u64>()
                    .map_err(|_| {
                        Error::ProtocolSyntax(
                            "bad size threshold".to_owned(),
                        )
                    })?;
                self.append(SearchKey::Size { larger, threshold }, false);
            },

            "not" => {
                if *idx + 1 >= args.len() {
                    return Err(Error::ProtocolSyntax(
                        "NOT without operand".to_owned(),
                    ));
                }

                // Simple single-column flags negate in place; anything
                // else gets a real NOT subtree.
                if let Some(negated) = negated_flag(&args[*idx + 1]) {
                    *idx += 2;
                    self.append(SearchKey::Flag(negated), false);
                } else {
                    *idx += 1;
                    self.append(SearchKey::SubsearchNot, true);
                    let step = self.search_key(args, idx)?;
                    self.pop();
                    if BuildStep::Close == step {
                        return Err(Error::ProtocolSyntax(
                            "NOT without operand".to_owned(),
                        ));
                    }
                }
            },
            "or" => {
                *idx += 1;
                self.append(SearchKey::SubsearchOr, true);
                for _ in 0..2 {
                    if *idx >= args.len() {
                        return Err(Error::ProtocolSyntax(
                            "OR needs two operands".to_owned(),
                        ));
                    }
                    if BuildStep::Close == self.search_key(args, idx)? {
                        return Err(Error::ProtocolSyntax(
                            "OR needs two operands".to_owned(),
                        ));
                    }
                }
                self.pop();
            },
            "(" => {
                *idx += 1;
                self.append(SearchKey::SubsearchAnd, true);
                while BuildStep::More
                    == self.build(args, idx, SearchOrder::Unordered)?
                {}
                self.pop();
            },
            ")" => {
                *idx += 1;
                return Ok(BuildStep::Close);
            },

            "charset" => {
                let label = self.next_arg(args, idx)?;
                self.set_charset(&label)?;
            },

            _ => {
                if is_msg_set(key) {
                    let key = self.message_set(key);
                    *idx += 1;
                    self.append(key, false);
                } else {
                    debug!("unknown search key [{}]", key);
                    return Err(Error::ProtocolSyntax(format!(
                        "unknown search key {}",
                        key
                    )));
                }
            },
        }

        Ok(BuildStep::More)
    }

    /// Consume the keyword at `*idx` and return the argument after it,
    /// advancing past both.
    fn next_arg(
        &self,
        args: &[String],
        idx: &mut usize,
    ) -> Result<String, Error> {
        if *idx + 1 >= args.len() {
            return Err(Error::ProtocolSyntax(format!(
                "{} without argument",
                args[*idx]
            )));
        }

        *idx += 2;
        Ok(args[*idx - 1].clone())
    }

    /// Like `next_arg`, for free-form terms subject to the session
    /// charset.
    fn next_term(
        &self,
        args: &[String],
        idx: &mut usize,
    ) -> Result<String, Error> {
        // Terms were normalized to UTF-8 when tokenized, so the recorded
        // charset needs no further transcoding here; it has already been
        // validated against the supported set.
        self.next_arg(args, idx)
    }

    fn set_charset(&mut self, label: &str) -> Result<(), Error> {
        if Encoding::for_label(label.as_bytes()).is_none()
            || !CHARSETS.iter().any(|cs| label.eq_ignore_ascii_case(cs))
        {
            return Err(Error::BadCharset);
        }

        self.charset = Some(label.to_ascii_lowercase());
        Ok(())
    }
}

/// Whether `s` is lexically a message set (`2`, `4:*`, `1,3:9`, ...).
pub fn is_msg_set(s: &str) -> bool {
    !s.is_empty()
        && s.bytes().all(|b| b.is_ascii_digit() || matches!(b, b':' | b',' | b'*'))
        && s.bytes().next().map_or(false, |b| b.is_ascii_digit() || b'*' == b)
}

fn negated_flag(key: &str) -> Option<&'static str> {
    let lower = key.to_ascii_lowercase();
    match lower.as_str() {
        "answered" => Some("answered_flag=0"),
        "deleted" => Some("deleted_flag=0"),
        "flagged" => Some("flagged_flag=0"),
        "recent" => Some("recent_flag=0"),
        "seen" => Some("seen_flag=0"),
        "draft" => Some("draft_flag=0"),
        "unanswered" => Some("answered_flag=1"),
        "undeleted" => Some("deleted_flag=1"),
        "unflagged" => Some("flagged_flag=1"),
        "unseen" => Some("seen_flag=1"),
        "undraft" => Some("draft_flag=1"),
        _ => None,
    }
}

/// Parse an IMAP wire date (`1-Feb-1994` or `01-Feb-1994`).
pub fn parse_imap_date(raw: &str) -> Result<NaiveDate, Error> {
    let raw = raw.trim_matches('"');
    NaiveDate::parse_from_str(raw, "%d-%b-%Y").map_err(|_| {
        Error::ProtocolSyntax(format!("unparsable date {}", raw))
    })
}

#[cfg(test)]
mod test {
    use super::*;

    fn args(raw: &str) -> Vec<String> {
        raw.split_whitespace().map(str::to_owned).collect()
    }

    fn build(raw: &str) -> SearchTree {
        let mut tree = SearchTree::new(false);
        let mut idx = 0;
        tree.build(&args(raw), &mut idx, SearchOrder::Unordered)
            .unwrap();
        tree
    }

    fn keys(tree: &SearchTree) -> Vec<&SearchKey> {
        tree.nodes.iter().map(|n| &n.key).collect()
    }

    #[test]
    fn default_set_is_one_to_splat() {
        let implicit = build("flagged");
        let explicit = build("1:* flagged");
        assert_eq!(keys(&implicit), keys(&explicit));
        assert_eq!(
            &SearchKey::Set("1:*".to_owned()),
            &implicit.nodes[0].key
        );
    }

    #[test]
    fn uid_mode_changes_bare_sets() {
        let mut tree = SearchTree::new(true);
        let mut idx = 0;
        tree.build(&args("11:* flagged"), &mut idx, SearchOrder::Unordered)
            .unwrap();
        assert_eq!(
            &SearchKey::UidSet("11:*".to_owned()),
            &tree.nodes[0].key
        );
    }

    #[test]
    fn not_simple_flag_pre_negates() {
        let tree = build("not seen");
        assert!(tree
            .nodes
            .iter()
            .any(|n| SearchKey::Flag("seen_flag=0") == n.key));
        assert!(!tree
            .nodes
            .iter()
            .any(|n| SearchKey::SubsearchNot == n.key));
    }

    #[test]
    fn not_complex_key_builds_subtree() {
        let tree = build("not text foo");
        let not_ix = tree
            .nodes
            .iter()
            .position(|n| SearchKey::SubsearchNot == n.key)
            .unwrap();
        assert_eq!(1, tree.nodes[not_ix].children.len());
        let child = tree.nodes[not_ix].children[0];
        assert_eq!(SearchKey::Text("foo".to_owned()), tree.nodes[child].key);
    }

    #[test]
    fn or_has_exactly_two_children() {
        let tree = build("or seen deleted");
        let or_ix = tree
            .nodes
            .iter()
            .position(|n| SearchKey::SubsearchOr == n.key)
            .unwrap();
        assert_eq!(2, tree.nodes[or_ix].children.len());

        let mut idx = 0;
        assert!(SearchTree::new(false)
            .build(&args("or seen"), &mut idx, SearchOrder::Unordered)
            .is_err());
    }

    #[test]
    fn group_opens_and_subtree() {
        let tree = build("( seen deleted ) flagged");
        let and_ix = tree
            .nodes
            .iter()
            .position(|n| SearchKey::SubsearchAnd == n.key)
            .unwrap();
        // Group gets its own implicit 1:* plus the two flags
        assert_eq!(3, tree.nodes[and_ix].children.len());
        // The ')' must not have terminated the outer program
        assert!(tree
            .nodes
            .iter()
            .any(|n| SearchKey::Flag("flagged_flag=1") == n.key));
    }

    #[test]
    fn unknown_key_is_syntax_error() {
        let mut tree = SearchTree::new(false);
        let mut idx = 0;
        assert!(tree
            .build(&args("frobnicate"), &mut idx, SearchOrder::Unordered)
            .is_err());
    }

    #[test]
    fn header_and_date_keys() {
        let tree = build("header x-spam yes sentbefore 1-Feb-1994");
        assert!(tree.nodes.iter().any(|n| {
            SearchKey::Header {
                field: "x-spam".to_owned(),
                term: "yes".to_owned(),
            } == n.key
        }));
        assert!(tree.nodes.iter().any(|n| {
            SearchKey::HeaderDate {
                cmp: DateCmp::Before,
                date: NaiveDate::from_ymd(1994, 2, 1),
            } == n.key
        }));
    }

    #[test]
    fn sort_program_records_joins_and_order() {
        let mut tree = SearchTree::new(false);
        let mut idx = 0;
        tree.build(
            &args("( reverse size from ) utf-8 seen"),
            &mut idx,
            SearchOrder::Sorted,
        )
        .unwrap();

        let sort = tree
            .nodes
            .iter()
            .find_map(|n| match n.key {
                SearchKey::Sort(ref spec) => Some(spec),
                _ => None,
            })
            .unwrap();
        assert_eq!(
            vec![
                SortTerm { field: "messagesize", reverse: true },
                SortTerm { field: "fromfield", reverse: false },
            ],
            sort.order
        );
        assert_eq!(vec!["fromfield"], sort.joins);
        assert_eq!(Some("utf-8".to_owned()), tree.charset);
        // The trailing key still parsed
        assert!(tree
            .nodes
            .iter()
            .any(|n| SearchKey::Flag("seen_flag=1") == n.key));
    }

    #[test]
    fn charset_validation() {
        let mut tree = SearchTree::new(false);
        let mut idx = 0;
        assert!(matches!(
            tree.build(
                &args("charset koi8-r seen"),
                &mut idx,
                SearchOrder::Unordered
            ),
            Err(Error::BadCharset)
        ));
    }

    #[test]
    fn msg_set_lexing() {
        assert!(is_msg_set("1"));
        assert!(is_msg_set("1:*"));
        assert!(is_msg_set("*"));
        assert!(is_msg_set("1,3:9,12"));
        assert!(!is_msg_set("seen"));
        assert!(!is_msg_set(""));
        assert!(!is_msg_set(":1"));
    }
}
