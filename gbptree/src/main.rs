//! `gbptree` inspects tree and log files.
//!
//! ```text
//! gbptree <tree-file> [--dump] [--check]
//! gbptree --log <log-file>
//! ```
//!
//! Configuration comes from the `GBPTREE_*` environment variables, log
//! output is filtered through `RUST_LOG`.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use gbptree::bootstrap::DefaultLayoutBootstrapper;
use gbptree::fs::{DefaultFileSystem, FileSystem, OpenMode};
use gbptree::wal::{LogEntry, PhysicalLogChannel, VersionAwareLogEntryReader};
use gbptree::{GBPTreeBootstrapper, PageCache, TreeConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: gbptree <tree-file> [--dump] [--check]\n       gbptree --log <log-file>";

#[derive(Debug)]
enum Command {
    Tree {
        path: PathBuf,
        dump: bool,
        check: bool,
    },
    Log {
        path: PathBuf,
    },
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Command, String> {
    let mut path = None;
    let mut dump = false;
    let mut check = false;
    let mut log = false;
    for arg in args {
        match arg.as_str() {
            "--dump" => dump = true,
            "--check" => check = true,
            "--log" => log = true,
            flag if flag.starts_with("--") => return Err(format!("unknown flag {flag}")),
            _ if path.is_some() => return Err(format!("unexpected argument {arg}")),
            _ => path = Some(PathBuf::from(arg)),
        }
    }
    let path = path.ok_or_else(|| "missing file argument".to_string())?;
    if log {
        if dump || check {
            return Err("--log cannot be combined with --dump or --check".to_string());
        }
        return Ok(Command::Log { path });
    }
    Ok(Command::Tree { path, dump, check })
}

fn inspect_tree(
    config: &TreeConfig,
    fs: Arc<dyn FileSystem>,
    path: &Path,
    dump: bool,
    check: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let page_cache = PageCache::new(fs, config.page_cache_pages);
    let layouts = Arc::new(DefaultLayoutBootstrapper::with_bytewise_fallback());
    let bootstrap = GBPTreeBootstrapper::new(page_cache, layouts).bootstrap_tree(path);
    if let Some(cause) = bootstrap.cause() {
        return Err(format!("cannot open {}: {cause}", path.display()).into());
    }

    let meta = bootstrap.meta()?;
    let state = &bootstrap.state()?.state;
    let tree = bootstrap.tree()?;
    println!("file:        {}", path.display());
    println!(
        "layout:      {:#018x} v{}.{}",
        meta.layout_identifier, meta.layout_major_version, meta.layout_minor_version
    );
    println!("page size:   {}", meta.page_size);
    println!("state slot:  {}", state.slot);
    println!(
        "generation:  stable {} unstable {}",
        state.stable_generation, state.unstable_generation
    );
    println!("clean:       {}", state.clean);
    println!("root:        {} (generation {})", state.root_id, state.root_generation);
    println!("last id:     {}", state.last_id);
    println!("free pages:  {}", state.free_list_count);
    println!("entries:     {}", tree.count_entries()?);

    if dump {
        let mut cursor = tree.seek_raw(None, None)?;
        while let Some(entry) = cursor.next_raw()? {
            println!("{} => {}", hex(&entry.key), hex(&entry.value));
        }
    }
    let mut consistent = true;
    if check {
        let report = tree.check_consistency()?;
        println!(
            "consistency: {} tree pages, {} leaves, depth {}",
            report.tree_pages, report.leaves, report.depth
        );
        for violation in &report.violations {
            println!("  violation: {violation}");
        }
        consistent = report.is_consistent();
    }
    bootstrap.close()?;
    if !consistent {
        return Err(format!("{} is inconsistent", path.display()).into());
    }
    Ok(())
}

fn scan_log(
    config: &TreeConfig,
    fs: &dyn FileSystem,
    path: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let channel = PhysicalLogChannel::open(fs, path, OpenMode::Read)?;
    let mut reader = VersionAwareLogEntryReader::new(channel)
        .verify_checksum_chain(config.verify_checksum_chain);
    let (mut transactions, mut commands, mut checkpoints) = (0u64, 0u64, 0u64);
    while let Some(entry) = reader.read_log_entry()? {
        match entry {
            LogEntry::Start(_) => {}
            LogEntry::Command(_) => commands += 1,
            LogEntry::Commit(commit) => {
                transactions += 1;
                if reader.last_computed_checksum() != Some(commit.checksum) {
                    println!("transaction {}: checksum mismatch", commit.tx_id);
                }
            }
            LogEntry::CheckPoint(check_point) => {
                checkpoints += 1;
                println!(
                    "checkpoint at transaction {} ({})",
                    check_point.last_tx_id,
                    if check_point.reason.is_empty() {
                        "no reason"
                    } else {
                        &check_point.reason
                    }
                );
            }
        }
    }
    println!("file:          {}", path.display());
    println!("transactions:  {transactions}");
    println!("commands:      {commands}");
    println!("checkpoints:   {checkpoints}");
    println!("end position:  {}", reader.last_position());
    if let Some(version) = reader.version() {
        println!("last version:  {version}");
    }
    Ok(())
}

fn hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}

fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gbptree=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match TreeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };
    let command = match parse_args(std::env::args().skip(1)) {
        Ok(command) => command,
        Err(e) => {
            tracing::error!("{e}");
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    let fs: Arc<dyn FileSystem> = Arc::new(DefaultFileSystem);
    let result = match &command {
        Command::Tree { path, dump, check } => inspect_tree(&config, fs, path, *dump, *check),
        Command::Log { path } => scan_log(&config, fs.as_ref(), path),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{e}");
            ExitCode::FAILURE
        }
    }
}
