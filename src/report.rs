//! Ranked, human-readable reports of outstanding memory by call stack.

use std::{
    collections::HashMap,
    ffi::CStr,
    fmt::{self, Display, Formatter},
    mem::MaybeUninit,
};

use backtrace::SymbolName;
use libc::c_void;
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};

use crate::{
    ledger::LedgerCounters,
    snapshot::{Snapshot, SnapshotDiff},
    stack::{StackId, StackTable},
};

/// One symbolized return address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedFrame {
    /// Absolute address.
    pub pc: u64,
    /// Address relative to the containing module, when it is known.
    pub rel_pc: Option<u64>,
    pub module: Option<String>,
    pub symbol: Option<String>,
    /// Distance from the start of `symbol`.
    pub symbol_offset: Option<u64>,
}

impl ResolvedFrame {
    pub fn unknown(pc: usize) -> Self {
        ResolvedFrame {
            pc: pc as u64,
            rel_pc: None,
            module: None,
            symbol: None,
            symbol_offset: None,
        }
    }
}

impl Display for ResolvedFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let (rel_pc, module) = match (self.rel_pc, &self.module) {
            (Some(rel_pc), Some(module)) => (rel_pc, module),
            _ => return write!(f, "0x{:016x} <unknown>", self.pc),
        };
        match (&self.symbol, self.symbol_offset) {
            (None, _) => write!(f, "0x{:016x} {} (unknown)", rel_pc, module),
            (Some(symbol), None) => write!(f, "0x{:016x} {} ({} + ?)", rel_pc, module, symbol),
            (Some(symbol), Some(offset)) => {
                write!(f, "0x{:016x} {} ({} + {})", rel_pc, module, symbol, offset)
            }
        }
    }
}

/// Turns return addresses into printable frames.
pub trait FrameResolver {
    fn resolve(&mut self, pc: usize) -> ResolvedFrame;
}

impl<F: FnMut(usize) -> ResolvedFrame> FrameResolver for F {
    fn resolve(&mut self, pc: usize) -> ResolvedFrame {
        self(pc)
    }
}

/// Resolves through the dynamic linker (`dladdr`) for the module and `backtrace` for
/// demangled symbol names.  Results are cached for the lifetime of the resolver.
#[derive(Debug, Default)]
pub struct SystemResolver {
    cache: HashMap<usize, ResolvedFrame>,
}

impl SystemResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn lookup(pc: usize) -> ResolvedFrame {
        let mut info = MaybeUninit::<libc::Dl_info>::zeroed();
        // SAFETY: dladdr only reads `pc` as an address and fills `info`.
        let found = unsafe { libc::dladdr(pc as *const c_void, info.as_mut_ptr()) } != 0;
        if !found {
            return ResolvedFrame::unknown(pc);
        }
        // SAFETY: initialised by the successful dladdr call above.
        let info = unsafe { info.assume_init() };
        let base = info.dli_fbase as usize;
        if base > pc {
            return ResolvedFrame::unknown(pc);
        }
        let module = if info.dli_fname.is_null() {
            String::new()
        } else {
            // SAFETY: dli_fname is a NUL-terminated string owned by the loader.
            unsafe { CStr::from_ptr(info.dli_fname) }
                .to_string_lossy()
                .into_owned()
        };
        let module = if module.is_empty() {
            format!("<anonymous:{:016x}>", base)
        } else {
            module
        };

        let mut symbol = None;
        // SAFETY: resolving an address does not dereference it.
        unsafe {
            backtrace::resolve_unsynchronized(pc as *mut c_void, |s| {
                if symbol.is_none() {
                    symbol = s.name().map(|name: SymbolName<'_>| name.to_string());
                }
            });
        }
        if symbol.is_none() && !info.dli_sname.is_null() {
            // SAFETY: dli_sname is a NUL-terminated string owned by the loader.
            let name = unsafe { CStr::from_ptr(info.dli_sname) }.to_string_lossy();
            symbol = Some(SymbolName::new(name.as_bytes()).to_string());
        }
        let saddr = info.dli_saddr as usize;
        let symbol_offset = if symbol.is_some() && saddr != 0 && saddr <= pc {
            Some((pc - saddr) as u64)
        } else {
            None
        };
        ResolvedFrame {
            pc: pc as u64,
            rel_pc: Some((pc - base) as u64),
            module: Some(module),
            symbol,
            symbol_offset,
        }
    }
}

impl FrameResolver for SystemResolver {
    fn resolve(&mut self, pc: usize) -> ResolvedFrame {
        self.cache
            .entry(pc)
            .or_insert_with(|| Self::lookup(pc))
            .clone()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportKind {
    /// Everything outstanding at the cut.
    Live,
    /// Change since the snapshot taken at sequence `from`.
    Delta { from: u64 },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportRow {
    pub rank: usize,
    pub stack: u32,
    pub hash: u64,
    pub bytes: i64,
    pub count: i64,
    pub frames: Vec<ResolvedFrame>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub kind: ReportKind,
    pub sequence: u64,
    pub total_bytes: i64,
    pub total_count: i64,
    pub counters: LedgerCounters,
    pub rows: Vec<ReportRow>,
}

/// Order rows by descending bytes, then descending count, then ascending stack id.
pub fn rank<T>(rows: &mut [T], key: impl Fn(&T) -> (i64, i64, StackId)) {
    rows.sort_by(|a, b| {
        let (a_bytes, a_count, a_id) = key(a);
        let (b_bytes, b_count, b_id) = key(b);
        b_bytes
            .cmp(&a_bytes)
            .then(b_count.cmp(&a_count))
            .then(a_id.cmp(&b_id))
    });
}

impl Report {
    /// Ranking of every stack with outstanding memory in `snapshot`.
    pub fn live<R: FrameResolver>(
        snapshot: &Snapshot,
        stacks: &StackTable,
        counters: LedgerCounters,
        resolver: &mut R,
    ) -> Self {
        let rows = snapshot
            .stacks
            .iter()
            .map(|(id, totals)| (*id, totals.bytes as i64, totals.count as i64))
            .collect();
        Report {
            kind: ReportKind::Live,
            sequence: snapshot.sequence,
            total_bytes: snapshot.total_bytes as i64,
            total_count: snapshot.total_count as i64,
            counters,
            rows: Self::build_rows(rows, stacks, resolver),
        }
    }

    /// Ranking of every stack whose totals changed in `diff`.
    pub fn delta<R: FrameResolver>(
        diff: &SnapshotDiff,
        stacks: &StackTable,
        counters: LedgerCounters,
        resolver: &mut R,
    ) -> Self {
        let rows = diff
            .stacks
            .iter()
            .map(|(id, delta)| (*id, delta.bytes, delta.count))
            .collect();
        Report {
            kind: ReportKind::Delta { from: diff.from },
            sequence: diff.to,
            total_bytes: diff.total.bytes,
            total_count: diff.total.count,
            counters,
            rows: Self::build_rows(rows, stacks, resolver),
        }
    }

    fn build_rows<R: FrameResolver>(
        mut rows: Vec<(StackId, i64, i64)>,
        stacks: &StackTable,
        resolver: &mut R,
    ) -> Vec<ReportRow> {
        rank(&mut rows, |row| (row.1, row.2, row.0));
        rows.into_iter()
            .enumerate()
            .map(|(i, (id, bytes, count))| ReportRow {
                rank: i + 1,
                stack: id.0,
                hash: stacks.hash(id).unwrap_or_default(),
                bytes,
                count,
                frames: stacks
                    .frames(id)
                    .map(|frames| frames.as_slice().iter().map(|pc| resolver.resolve(*pc)).collect())
                    .unwrap_or_default(),
            })
            .collect()
    }

    /// Keep only the first `n` rows.
    pub fn truncate(&mut self, n: usize) {
        self.rows.truncate(n);
    }

    pub fn lines(&self) -> Vec<String> {
        self.to_string().lines().map(str::to_string).collect()
    }
}

fn format_signed(value: i64, signed: bool) -> String {
    let formatted = value.to_formatted_string(&Locale::en);
    if signed && value > 0 {
        format!("+{}", formatted)
    } else {
        formatted
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let signed = matches!(self.kind, ReportKind::Delta { .. });
        match self.kind {
            ReportKind::Live => write!(f, "live at seq {}: ", self.sequence)?,
            ReportKind::Delta { from } => write!(f, "delta seq {}..{}: ", from, self.sequence)?,
        }
        writeln!(
            f,
            "{} bytes in {} allocations ({} stacks, {} reconciled, {} unmatched frees, {} dropped)",
            format_signed(self.total_bytes, signed),
            format_signed(self.total_count, signed),
            self.rows.len(),
            self.counters.reconciled,
            self.counters.unmatched_frees,
            self.counters.dropped
        )?;
        for row in &self.rows {
            writeln!(
                f,
                "#{} {} bytes, {} allocations, stack {:016x}",
                row.rank,
                format_signed(row.bytes, signed),
                format_signed(row.count, signed),
                row.hash
            )?;
            for frame in &row.frames {
                writeln!(f, "    {}", frame)?;
            }
        }
        Ok(())
    }
}

/// Name of the report artifact in the storage directory.
pub const REPORT_FILE: &str = "report.yaml";

/// Everything written by one `print`: the live ranking and, with the diff cache on, the
/// change since the previous print.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportDocument {
    pub pid: u32,
    /// Configuration word the session was started with.
    pub config: u32,
    pub live: Report,
    #[serde(default)]
    pub delta: Option<Report>,
}

impl ReportDocument {
    pub fn lines(&self) -> Vec<String> {
        let mut lines = self.live.lines();
        if let Some(delta) = &self.delta {
            lines.extend(delta.lines());
        }
        lines
    }
}

/// Render `snapshot` as a ranked report.
pub fn render<R: FrameResolver>(snapshot: &Snapshot, stacks: &StackTable, resolver: &mut R) -> String {
    Report::live(snapshot, stacks, LedgerCounters::default(), resolver).to_string()
}

/// Render `diff` as a ranked report of changes.
pub fn render_diff<R: FrameResolver>(diff: &SnapshotDiff, stacks: &StackTable, resolver: &mut R) -> String {
    Report::delta(diff, stacks, LedgerCounters::default(), resolver).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{snapshot::diff, stack::Frames};

    fn named(pc: usize) -> ResolvedFrame {
        ResolvedFrame {
            pc: pc as u64,
            rel_pc: Some(pc as u64 - 0x1000),
            module: Some("libfoo.so".to_string()),
            symbol: Some(format!("fn_{:x}", pc)),
            symbol_offset: Some(4),
        }
    }

    fn table() -> (StackTable, StackId, StackId) {
        let stacks = StackTable::new();
        let x = stacks.intern(&Frames::from_slice(&[0x1100, 0x1200]));
        let y = stacks.intern(&Frames::from_slice(&[0x1300]));
        (stacks, x, y)
    }

    #[test]
    fn larger_stack_ranks_first() {
        let (stacks, x, y) = table();
        let snapshot = Snapshot::from_records(3, vec![(x, 50), (x, 50), (y, 150)]);
        let report = Report::live(&snapshot, &stacks, LedgerCounters::default(), &mut named);
        let order: Vec<u32> = report.rows.iter().map(|row| row.stack).collect();
        assert_eq!(order, vec![y.0, x.0]);
        assert_eq!(report.rows[0].rank, 1);
        assert_eq!(report.rows[1].bytes, 100);
        assert_eq!(report.rows[1].count, 2);

        let text = render(&snapshot, &stacks, &mut named);
        let y_pos = text.find("#1 150 bytes, 1 allocations").unwrap();
        let x_pos = text.find("#2 100 bytes, 2 allocations").unwrap();
        assert!(y_pos < x_pos);
        assert!(text.contains("    0x0000000000000300 libfoo.so (fn_1300 + 4)"));
    }

    #[test]
    fn ties_break_on_count_then_id() {
        let stacks = StackTable::new();
        let a = stacks.intern(&Frames::from_slice(&[1]));
        let b = stacks.intern(&Frames::from_slice(&[2]));
        let c = stacks.intern(&Frames::from_slice(&[3]));
        let snapshot = Snapshot::from_records(0, vec![(c, 100), (b, 50), (b, 50), (a, 100)]);
        let report = Report::live(&snapshot, &stacks, LedgerCounters::default(), &mut ResolvedFrame::unknown);
        let order: Vec<u32> = report.rows.iter().map(|row| row.stack).collect();
        assert_eq!(order, vec![b.0, a.0, c.0]);
    }

    #[test]
    fn delta_rows_are_signed() {
        let (stacks, x, y) = table();
        let s1 = Snapshot::from_records(1, vec![(x, 100), (y, 10)]);
        let s2 = Snapshot::from_records(3, vec![(x, 100), (x, 50), (x, 50)]);
        let text = render_diff(&diff(&s1, &s2), &stacks, &mut named);
        assert!(text.starts_with("delta seq 1..3: +90 bytes in +1 allocations"));
        assert!(text.contains("#1 +100 bytes, +2 allocations"));
        assert!(text.contains("#2 -10 bytes, -1 allocations"));
    }

    #[test]
    fn frame_formats() {
        assert_eq!(ResolvedFrame::unknown(0x42).to_string(), "0x0000000000000042 <unknown>");
        let mut frame = named(0x1100);
        frame.symbol_offset = None;
        assert_eq!(frame.to_string(), "0x0000000000000100 libfoo.so (fn_1100 + ?)");
        frame.symbol = None;
        assert_eq!(frame.to_string(), "0x0000000000000100 libfoo.so (unknown)");
    }

    #[test]
    fn system_resolver_finds_own_code() {
        let mut resolver = SystemResolver::new();
        let pc = system_resolver_finds_own_code as usize;
        let frame = resolver.resolve(pc);
        assert_eq!(frame.pc, pc as u64);
        assert_eq!(resolver.resolve(pc), frame);
    }

    #[test]
    fn rendering_is_read_only() {
        let (stacks, x, _) = table();
        let snapshot = Snapshot::from_records(1, vec![(x, 1)]);
        let before = snapshot.clone();
        let _ = render(&snapshot, &stacks, &mut named);
        assert_eq!(snapshot, before);
        assert_eq!(stacks.len(), 2);
    }
}
