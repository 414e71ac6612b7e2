use std::{fs, sync::Arc};

use malloc_attrib::{
    config::ALLOC_MODE,
    ledger::AllocKind,
    report::{render, render_diff, Report, ReportDocument, ResolvedFrame, REPORT_FILE},
    snapshot::{diff, Snapshot},
    stack::{Frames, StackTable},
    Config, EngineOptions, LibraryFilter, Ledger, Profile, Tracker,
};

fn fake_frame(pc: usize) -> ResolvedFrame {
    ResolvedFrame {
        pc: pc as u64,
        rel_pc: Some(pc as u64 & 0xffff),
        module: Some("/data/app/libdemo.so".to_string()),
        symbol: Some(format!("fn_{:x}", pc)),
        symbol_offset: Some(4),
    }
}

#[test]
fn larger_stack_is_listed_first() {
    let stacks = StackTable::new();
    let x = stacks.intern(&Frames::from_slice(&[0x1100, 0x1200]));
    let y = stacks.intern(&Frames::from_slice(&[0x2100]));
    let snapshot = Snapshot::from_records(3, vec![(x, 50), (x, 50), (y, 150)]);

    let mut resolver = fake_frame;
    let report = Report::live(&snapshot, &stacks, Default::default(), &mut resolver);
    assert_eq!(report.rows[0].stack, y.0);
    assert_eq!(report.rows[0].bytes, 150);
    assert_eq!(report.rows[1].stack, x.0);
    assert_eq!(report.rows[1].count, 2);

    let text = render(&snapshot, &stacks, &mut resolver);
    let y_at = text.find("fn_2100").unwrap();
    let x_at = text.find("fn_1100").unwrap();
    assert!(y_at < x_at);
}

#[test]
fn growth_shows_up_in_the_diff() {
    let stacks = Arc::new(StackTable::new());
    let x = stacks.intern(&Frames::from_slice(&[0x1100]));
    let ledger = Ledger::on_heap(256, 4, stacks.clone());
    ledger.on_allocate(0x10, 100, AllocKind::Heap, x);
    let s1 = ledger.snapshot();
    ledger.on_allocate(0x20, 50, AllocKind::Heap, x);
    ledger.on_allocate(0x30, 50, AllocKind::Heap, x);
    let s2 = ledger.snapshot();
    assert_eq!(s2.get(x).bytes, 200);

    let delta = diff(&s1, &s2);
    assert_eq!(delta.get(x).bytes, 100);
    assert_eq!(delta.get(x).count, 2);
    let text = render_diff(&delta, &stacks, &mut fake_frame);
    assert!(text.contains("+100 bytes, +2 allocations"), "{}", text);
}

#[test]
fn filter_matches_base_names() {
    let filter = LibraryFilter::new(Some(r".*libfoo\.so$")).unwrap();
    assert!(filter.is_eligible("/system/lib/libfoo.so"));
    assert!(!filter.is_eligible("/system/lib/libbar.so"));
    let all = LibraryFilter::new(Some("")).unwrap();
    assert!(all.is_eligible("/system/lib/libfoo.so"));
    assert!(all.is_eligible("/system/lib/libbar.so"));
}

#[test]
fn saved_reports_merge_in_the_viewer() {
    let dir = tempfile::tempdir().unwrap();
    let options = EngineOptions {
        ledger_capacity: 1024,
        shards: 4,
        ..Default::default()
    };
    let tracker = Tracker::new(Config::from_bits(ALLOC_MODE), options, Some(dir.path())).unwrap();
    for i in 0..4 {
        tracker.on_heap_alloc(0x1000 + i * 0x100, 256);
    }
    tracker.print();

    let text = fs::read_to_string(dir.path().join(REPORT_FILE)).unwrap();
    let document: ReportDocument = serde_yaml::from_str(&text).unwrap();
    assert_eq!(document.pid, std::process::id());
    assert_eq!(document.live.total_bytes, 1024);

    let mut profile = Profile::new();
    profile.add(&document.live);
    profile.add(&document.live);
    assert_eq!(profile.total().bytes, 2048);
    // Same stacks from two reports collapse.
    assert_eq!(profile.len(), document.live.rows.len());

    let mut out = String::new();
    profile.fmt_libraries(&mut out).unwrap();
    assert!(out.lines().next().unwrap().trim_start().starts_with("2,048"));
}
