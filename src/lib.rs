//! `malloc_attrib` attributes the native memory a process holds to the call stacks that
//! allocated it.  It helps find the code paths responsible for memory growth and leaks in
//! long-running programs, including ones built from a mix of Rust, C and C++ libraries.
//!
//! Unlike preload-based profilers, `malloc_attrib` attaches to an already running process: at
//! [`Session::start`] it rewrites the import tables (GOT) of the shared libraries you select so
//! that their `malloc`, `calloc`, `realloc`, `memalign`, `free`, `mmap`, `mmap64` and `munmap`
//! calls go through the engine.  Every allocation is recorded with its size and call stack
//! until it is freed, so at any point the engine can report which stacks hold how much memory.
//! [`Session::stop`] restores the original entries.
//!
//! Only outstanding memory is tracked: short-lived allocations that are freed before a report
//! do not show up in it.
//!
//! ## Starting a session
//!
//! The configuration is a packed `u32` (see [`config`]): which kinds of calls to record, the
//! unwind depth and a minimum allocation size.  An optional regular expression selects
//! libraries by base name; an optional storage directory receives the report artifacts (and,
//! in large-map mode, the ledger itself).
//!
//! ```no_run
//! use malloc_attrib::{config, GotBackend, Session};
//!
//! let session = Session::new(GotBackend::new());
//! let configs = config::ALLOC_MODE | config::DIFF_CACHE | 0x000F_0000 | 1024;
//! session
//!     .start(configs, Some("/data/local/tmp/attrib".as_ref()), Some(r"libgame\.so"))
//!     .unwrap();
//! // ... run the workload ...
//! session.print().unwrap();
//! session.stop().unwrap();
//! ```
//!
//! Native hosts that cannot link Rust use the companion `lib_malloc_attrib` crate, which wraps
//! one process-wide session in a C ABI (`malloc_attrib_start`, `malloc_attrib_stop`,
//! `malloc_attrib_print`).
//!
//! ## Reports
//!
//! [`Session::print`] logs the ranking of call stacks by outstanding bytes under the
//! `malloc_attrib::report` target and, with a storage directory, writes it to `report.yaml`
//! next to a copy of the process's memory maps.  To view saved reports, use the `ma_print`
//! tool from this crate:
//!
//! ```bash
//! ma_print --dir /data/local/tmp/attrib --tree --threshold 1
//! ```

pub mod arena;
pub mod config;
pub mod error;
pub mod filter;
pub mod guard;
pub mod hook;
pub mod ledger;
pub mod maps;
pub mod profile;
pub mod report;
pub mod session;
pub mod snapshot;
pub mod stack;
pub mod tracker;

pub use config::{Config, EngineOptions};
pub use error::{Error, Result};
pub use filter::LibraryFilter;
pub use hook::{GotBackend, HookBackend, HookInstaller};
pub use ledger::{AllocKind, AllocationRecord, Ledger};
pub use profile::Profile;
pub use report::{Report, ReportDocument};
pub use session::{Session, State};
pub use snapshot::{Snapshot, SnapshotDiff};
pub use stack::{StackId, StackTable};
pub use tracker::Tracker;
