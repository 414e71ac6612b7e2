//! Offline view over saved reports.
//!
//! A [`Profile`] merges the rows of any number of reports, possibly from different processes,
//! keying each row by its symbolized frames rather than by stack id, so the same call stack
//! seen in several reports collapses into one entry.

use std::{collections::HashMap, fmt};

use num_format::{Locale, ToFormattedString};
use radix_trie::{iter::Children, SubTrie, Trie, TrieCommon, TrieKey};

use crate::{
    filter::{base_name, SELF_LIBRARY},
    report::{Report, ResolvedFrame},
};

// Interned frame labels, innermost frame first.
type CallPath = Vec<u64>;

/// Group for stacks that no library owns.
pub const EXTRAS: &str = "extras";

/// Libraries that own a stack only if no application library appears in it.
const SYSTEM_GROUP: &[&str] = &[
    "libhwui.so",
    "libsqlite.so",
    "libstagefright.so",
    "libcamera_client.so",
    "libandroid_runtime.so",
    "libstdc++.so.6",
    "libc++.so",
];

const SYSTEM_DIRS: &[&str] = &["/system/", "/apex/", "/vendor/", "/usr/", "/lib/", "/lib64/"];

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Totals {
    pub bytes: i64,
    pub count: i64,
}

impl Totals {
    fn merge(&mut self, other: &Totals) {
        self.bytes += other.bytes;
        self.count += other.count;
    }

    fn format<W: fmt::Write>(&self, f: &mut W) -> fmt::Result {
        write!(
            f,
            "{}B in {} allocations",
            self.bytes.to_formatted_string(&Locale::en),
            self.count.to_formatted_string(&Locale::en)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MergedStack {
    pub totals: Totals,
    pub frames: Vec<ResolvedFrame>,
}

#[derive(Debug, Default)]
pub struct Profile {
    labels: HashMap<String, u64>,
    frames: Vec<ResolvedFrame>,
    stacks: HashMap<CallPath, Totals>,
}

// Identity of a frame across processes: module-relative address when known.
fn label(frame: &ResolvedFrame) -> String {
    match (&frame.module, frame.rel_pc) {
        (Some(module), Some(rel_pc)) => format!("{}+{:#x}", module, rel_pc),
        _ => format!("{:#x}", frame.pc),
    }
}

fn is_system(path: &str) -> bool {
    SYSTEM_DIRS.iter().any(|dir| path.starts_with(dir))
}

fn is_library(name: &str) -> bool {
    name.ends_with(".so") || name.contains(".so.") || name.ends_with(".apk") || name.ends_with(".oat")
}

/// Library a stack is attributed to: the first application library on it, else the first
/// library from the system group, else [`EXTRAS`].
pub fn owner(frames: &[ResolvedFrame]) -> String {
    let mut fallback = None;
    for module in frames.iter().filter_map(|frame| frame.module.as_deref()) {
        let name = base_name(module);
        if !is_library(name) || name == SELF_LIBRARY {
            continue;
        }
        if !is_system(module) {
            return name.to_string();
        }
        if fallback.is_none() && SYSTEM_GROUP.contains(&name) {
            fallback = Some(name);
        }
    }
    fallback.unwrap_or(EXTRAS).to_string()
}

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, frame: &ResolvedFrame) -> u64 {
        let next = self.frames.len() as u64;
        let id = *self.labels.entry(label(frame)).or_insert(next);
        if id == next {
            self.frames.push(frame.clone());
        }
        id
    }

    /// Fold every row of `report` into the profile.
    pub fn add(&mut self, report: &Report) {
        for row in &report.rows {
            let path: CallPath = row.frames.iter().map(|frame| self.intern(frame)).collect();
            self.stacks.entry(path).or_default().merge(&Totals {
                bytes: row.bytes,
                count: row.count,
            });
        }
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    pub fn total(&self) -> Totals {
        let mut total = Totals::default();
        for totals in self.stacks.values() {
            total.merge(totals);
        }
        total
    }

    fn resolve(&self, path: &[u64]) -> Vec<ResolvedFrame> {
        path.iter().map(|id| self.frames[*id as usize].clone()).collect()
    }

    /// Merged stacks, largest first.
    pub fn stacks(&self) -> Vec<MergedStack> {
        let mut stacks: Vec<_> = self.stacks.iter().collect();
        stacks.sort_by(|(a_path, a), (b_path, b)| {
            b.bytes
                .cmp(&a.bytes)
                .then(b.count.cmp(&a.count))
                .then(a_path.cmp(b_path))
        });
        stacks
            .into_iter()
            .map(|(path, totals)| MergedStack {
                totals: *totals,
                frames: self.resolve(path),
            })
            .collect()
    }

    /// Totals per owning library, largest first with [`EXTRAS`] last.
    pub fn libraries(&self) -> Vec<(String, Totals)> {
        let mut groups: HashMap<String, Totals> = HashMap::new();
        for (path, totals) in &self.stacks {
            groups
                .entry(owner(&self.resolve(path)))
                .or_default()
                .merge(totals);
        }
        let mut groups: Vec<_> = groups.into_iter().collect();
        groups.sort_by(|(a_name, a), (b_name, b)| {
            (a_name.as_str() == EXTRAS)
                .cmp(&(b_name.as_str() == EXTRAS))
                .then(b.bytes.cmp(&a.bytes))
                .then(a_name.cmp(b_name))
        });
        groups
    }

    pub fn fmt_libraries<W: fmt::Write>(&self, f: &mut W) -> fmt::Result {
        writeln!(
            f,
            "{:>13}\ttotals",
            self.total().bytes.to_formatted_string(&Locale::en)
        )?;
        for (name, totals) in self.libraries() {
            writeln!(f, "{:>13}\t{}", totals.bytes.to_formatted_string(&Locale::en), name)?;
        }
        Ok(())
    }

    pub fn fmt_stacks<W: fmt::Write>(&self, f: &mut W) -> fmt::Result {
        for (rank, stack) in self.stacks().iter().enumerate() {
            write!(f, "\n#{} ", rank + 1)?;
            stack.totals.format(f)?;
            writeln!(f)?;
            for frame in &stack.frames {
                writeln!(f, "    {}", frame)?;
            }
        }
        Ok(())
    }

    fn summarize(&self) -> Trie<CallPath, Totals> {
        let mut all_paths = Trie::new();
        for (path, totals) in self.stacks.iter().filter(|(path, _)| !path.is_empty()) {
            all_paths.insert(path.clone(), *totals);
            for len in 1..path.len() {
                let prefix = path[..len].to_vec();
                if all_paths.get(&prefix).is_none() {
                    all_paths.insert(prefix, Totals::default());
                }
            }
        }
        let mut summary = Trie::new();
        Self::aggregate(&mut summary, &all_paths);
        summary
    }

    // Store in every keyed node the totals of its whole subtree.
    fn aggregate<'a, T: Clone + TrieCommon<'a, CallPath, Totals>>(
        summary: &mut Trie<CallPath, Totals>,
        node: T,
    ) -> Totals {
        let mut totals = node.clone().value().copied().unwrap_or_default();
        for child in node.clone().children() {
            let child_totals = Self::aggregate(summary, &child);
            totals.merge(&child_totals);
        }
        if let (Some(key), Some(_)) = (node.clone().key(), node.clone().value()) {
            summary.insert(key.clone(), totals);
        }
        totals
    }

    /// Tree of call paths from the allocation site outwards.  Subtrees holding less than
    /// `threshold` percent of all bytes are folded into one line.
    pub fn fmt_tree<W: fmt::Write>(&self, threshold: f64, f: &mut W) -> fmt::Result {
        let summary = self.summarize();
        let total = self.total().bytes.unsigned_abs();
        self.format_summary(&summary, total, threshold, "", f)?;
        writeln!(f)
    }

    fn format_summary<'a, T: Clone + TrieCommon<'a, CallPath, Totals>, W: fmt::Write>(
        &self,
        node: T,
        total: u64,
        threshold: f64,
        prefix: &str,
        f: &mut W,
    ) -> fmt::Result {
        if let (Some(key), Some(totals)) = (node.clone().key(), node.clone().value()) {
            f.write_str("\n")?;
            f.write_str(prefix)?;
            f.write_str("->")?;
            totals.format(f)?;
            f.write_str(": ")?;
            if let Some(id) = key.last() {
                write!(f, "{}", self.frames[*id as usize])?;
            }
        }

        let mut children: Vec<_> = trie_children_with_keys(node).collect();
        let nchildren = children.len();
        children.sort_by(|c1, c2| {
            let b1 = c1.value().map(|t| t.bytes).unwrap_or(0);
            let b2 = c2.value().map(|t| t.bytes).unwrap_or(0);
            b2.cmp(&b1)
        });

        let mut below_threshold = Totals::default();
        for (idx, child) in children.iter().enumerate() {
            let totals = child.value().copied().unwrap_or_default();
            if total > 0 && 100.0 * (totals.bytes.unsigned_abs() as f64) / (total as f64) < threshold {
                below_threshold.merge(&totals);
                continue;
            }
            let indent = if idx == nchildren - 1 {
                format!("{}  ", prefix)
            } else {
                format!("{} |", prefix)
            };
            self.format_summary(child, total, threshold, &indent, f)?;
        }

        if below_threshold != Totals::default() {
            write!(f, "\n{}  ->", prefix)?;
            below_threshold.format(f)?;
            write!(f, " in places below threshold ({}%)", threshold)?;
        }
        Ok(())
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_libraries(f)?;
        self.fmt_stacks(f)
    }
}

// Iterate through the nearest descendants that have keys.
struct ChildrenWithKey<'a, K, V> {
    stack: Vec<Children<'a, K, V>>,
}

impl<'a, K, V> ChildrenWithKey<'a, K, V> {
    fn new<T>(trie: T) -> Self
    where
        T: TrieCommon<'a, K, V>,
        K: TrieKey,
    {
        ChildrenWithKey {
            stack: vec![trie.children()],
        }
    }
}

impl<'a, K, V> Iterator for ChildrenWithKey<'a, K, V>
where
    K: TrieKey,
{
    type Item = SubTrie<'a, K, V>;

    fn next(&mut self) -> Option<SubTrie<'a, K, V>> {
        loop {
            let child = match self.stack.last_mut()?.next() {
                Some(child) => child,
                None => {
                    self.stack.pop();
                    continue;
                }
            };
            if child.key().is_some() {
                return Some(child);
            }
            self.stack.push(child.children());
        }
    }
}

fn trie_children_with_keys<'a, K, V, T>(trie: T) -> ChildrenWithKey<'a, K, V>
where
    T: Clone + TrieCommon<'a, K, V>,
    K: TrieKey,
{
    ChildrenWithKey::new(trie)
}
