use std::{fs, path::PathBuf};

use args::Args;
use getopts::Occur;
use glob::glob;
use malloc_attrib::{maps, profile::Profile, ReportDocument};
use tracing_subscriber::EnvFilter;

const PROGRAM_DESC: &str = "Summarize malloc_attrib reports";
const PROGRAM_NAME: &str = "ma_print";

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("MALLOC_ATTRIB_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args = Args::new(PROGRAM_NAME, PROGRAM_DESC);
    args.option(
        "d",
        "dir",
        "Directory that stores report.yaml files",
        "DIR",
        Occur::Optional,
        None,
    );
    args.option(
        "m",
        "maps",
        "Summarize a saved /proc/<pid>/maps file",
        "FILE",
        Occur::Optional,
        None,
    );
    args.option(
        "t",
        "threshold",
        "Fold call paths holding less than this percentage of bytes (with --tree)",
        "PERCENT",
        Occur::Optional,
        Some("0".to_string()),
    );
    args.flag("", "tree", "Print a tree of call paths instead of a flat list");
    args.flag("", "delta", "Use the delta section of each report instead of live memory");

    args.parse_from_cli()?;

    let dir: Option<String> = args.optional_value_of("dir")?;
    let maps_file: Option<String> = args.optional_value_of("maps")?;
    if dir.is_none() && maps_file.is_none() {
        anyhow::bail!("nothing to do, pass --dir and/or --maps\n{}", args.full_usage());
    }

    if let Some(dir) = dir {
        let threshold: f64 = args.value_of("threshold")?;
        let tree: bool = args.value_of("tree")?;
        let delta: bool = args.value_of("delta")?;
        let wildcard = format!("{}/report*.yaml", dir);

        let mut profile = Profile::new();
        for path in glob(wildcard.as_str())? {
            let path = path?;
            tracing::info!("found report in {}", path.display());
            let document: ReportDocument = serde_yaml::from_slice(&fs::read(&path)?)?;
            let report = if delta {
                match &document.delta {
                    Some(report) => report,
                    None => {
                        tracing::warn!("{} has no delta section", path.display());
                        continue;
                    }
                }
            } else {
                &document.live
            };
            profile.add(report);
        }

        let mut out = String::new();
        profile.fmt_libraries(&mut out)?;
        if tree {
            profile.fmt_tree(threshold, &mut out)?;
        } else {
            profile.fmt_stacks(&mut out)?;
        }
        print!("{}", out);
    }

    if let Some(file) = maps_file {
        let entries = maps::read(&PathBuf::from(file))?;
        print!("{}", maps::MapsSummary::from_entries(&entries));
    }

    Ok(())
}
