//! `/proc/<pid>/maps` parsing and per-category summaries of mapped address space.

use std::{collections::HashMap, fmt, fs, io, path::Path};

use num_format::{Locale, ToFormattedString};

/// One line of a maps file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MapEntry {
    pub start: u64,
    pub end: u64,
    pub perms: String,
    pub offset: u64,
    pub inode: u64,
    pub name: String,
}

impl MapEntry {
    /// Parse `6f000000-6f01e000 rwxp 00000000 00:0c 16389419   /system/lib/libfoo.so`.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let range = fields.next()?;
        let perms = fields.next()?;
        let offset = fields.next()?;
        let _dev = fields.next()?;
        let inode = fields.next()?;
        let name = fields.collect::<Vec<_>>().join(" ");
        let (start, end) = range.split_once('-')?;
        Some(MapEntry {
            start: u64::from_str_radix(start, 16).ok()?,
            end: u64::from_str_radix(end, 16).ok()?,
            perms: perms.to_string(),
            offset: u64::from_str_radix(offset, 16).ok()?,
            inode: inode.parse().ok()?,
            name,
        })
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn category(&self) -> &'static str {
        categorize(&self.name)
    }
}

const EXTRAS: &str = "extras";

/// Bucket a mapping name into a coarse category.
pub fn categorize(name: &str) -> &'static str {
    const SUFFIXES: &[(&str, &str)] = &[
        (".so", "native"),
        (".art", "library"),
        (".oat", "library"),
        (".apk", "library"),
        (".jar", "library"),
        ("dex", "library"),
        (".otf", "otf"),
        (".ttf", "ttf"),
    ];
    const PREFIXES: &[(&str, &str)] = &[
        ("/dev/ashmem/dalvik-large object", "dalvik-large-object"),
        ("/dev/ashmem/dalvik-thread local", "dalvik-thread-local"),
        ("/dev/ashmem/dalvik-indirect ref", "dalvik-indirect-ref"),
        ("/dev/ashmem/dalvik-main space", "dalvik-main-space"),
        ("/dev/ashmem/dalvik", "dalvik"),
        ("[stack", "thread"),
        ("[anon:thread", "thread"),
        ("[anon:bionic TLS", "thread"),
        ("[anon:linker_alloc", "linker"),
        ("/dev/ashmem/", "ashmem"),
        ("/dev/__properties__/", "object"),
    ];
    const EXACT: &[(&str, &str)] = &[
        ("[anon:libc_malloc]", "malloc"),
        ("[heap]", "malloc"),
        ("anon_inode:dmabuf", "dmabuf"),
        ("/dev/kgsl-3d0", "kgsl-3d0"),
        ("/dev/mali0", "mali0"),
        ("/dev/dri/renderD128", "renderD128"),
        ("[anon:.bss]", "bss"),
        ("[anon:atexit handlers]", "atexit"),
    ];

    if name.is_empty() {
        return "unknown";
    }
    if let Some((_, category)) = EXACT.iter().find(|(exact, _)| name == *exact) {
        return *category;
    }
    if let Some((_, category)) = PREFIXES.iter().find(|(prefix, _)| name.starts_with(prefix)) {
        return *category;
    }
    if name.contains(".so.") {
        return "native";
    }
    if let Some((_, category)) = SUFFIXES.iter().find(|(suffix, _)| name.ends_with(suffix)) {
        return *category;
    }
    EXTRAS
}

/// Mapped bytes per category, largest first with `extras` always last.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MapsSummary {
    pub total: u64,
    pub categories: Vec<(String, u64)>,
}

impl MapsSummary {
    pub fn from_entries<'a, I: IntoIterator<Item = &'a MapEntry>>(entries: I) -> Self {
        let mut totals: HashMap<&'static str, u64> = HashMap::new();
        let mut total = 0;
        for entry in entries {
            *totals.entry(entry.category()).or_default() += entry.len();
            total += entry.len();
        }
        let mut categories: Vec<(String, u64)> = totals
            .into_iter()
            .map(|(name, bytes)| (name.to_string(), bytes))
            .collect();
        categories.sort_by(|(a_name, a), (b_name, b)| {
            (a_name == EXTRAS)
                .cmp(&(b_name == EXTRAS))
                .then(b.cmp(a))
                .then(a_name.cmp(b_name))
        });
        MapsSummary { total, categories }
    }
}

impl fmt::Display for MapsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:>13}\ttotals", self.total.to_formatted_string(&Locale::en))?;
        for (name, bytes) in &self.categories {
            writeln!(f, "{:>13}\t{}", bytes.to_formatted_string(&Locale::en), name)?;
        }
        Ok(())
    }
}

/// Parse every well-formed line of `contents`.
pub fn parse(contents: &str) -> Vec<MapEntry> {
    contents.lines().filter_map(MapEntry::parse).collect()
}

pub fn read(path: &Path) -> io::Result<Vec<MapEntry>> {
    Ok(parse(&fs::read_to_string(path)?))
}

/// Copy this process's maps into `target`.
pub fn dump_self(target: &Path) -> io::Result<()> {
    fs::copy("/proc/self/maps", target).map(|_| ())
}
