use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result, anyhow, bail};
use clap::{ArgAction, Parser, ValueHint};
use globset::{Glob, GlobSet, GlobSetBuilder};
use walkdir::WalkDir;

mod perms;
mod rewrite;
mod walker;

use perms::ensure_writable;
use rewrite::UrlRewriter;
use walker::Normalizer;

#[derive(Debug, Parser)]
#[command(
    name = "linklower",
    version,
    about = "Recursively lowercase file names and the urls inside html files"
)]
struct Cli {
    #[arg(value_name = "DIR", value_hint = ValueHint::DirPath)]
    target: PathBuf,
    #[arg(long = "yes", action = ArgAction::SetTrue)]
    assume_yes: bool,
    #[arg(long = "dry-run", action = ArgAction::SetTrue)]
    dry_run: bool,
    #[arg(long, action = ArgAction::SetTrue)]
    json: bool,
    #[arg(long = "exclude", value_name = "GLOB")]
    exclude: Vec<String>,
    #[arg(long, value_name = "ENCODING")]
    encoding: Option<String>,
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            // usage problems exit 1, not clap's default 2
            let _ = err.print();
            return ExitCode::FAILURE;
        }
    };

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            println!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<()> {
    let target = fs::canonicalize(&cli.target)
        .with_context(|| format!("resolving {}", cli.target.display()))?;
    let metadata = fs::metadata(&target)
        .with_context(|| format!("reading metadata for {}", target.display()))?;
    if !metadata.is_dir() {
        bail!("{} is not a directory", target.display());
    }

    let exclude = build_exclude_globs(&cli.exclude)?;
    let rewriter = UrlRewriter::new(cli.encoding.as_deref())?;
    let apply = !cli.dry_run;

    let counts = scan_target(&target, exclude.as_ref());
    print_summary(&cli, &target, &counts);

    let root_guard = if apply {
        Some(ensure_writable(&target).context("target directory is not writable")?)
    } else {
        None
    };
    if root_guard.as_ref().is_some_and(|guard| guard.repaired()) {
        println!("target directory was read-only; made writable for the run.");
    }

    if apply && !cli.assume_yes && !confirm()? {
        println!("ok, nothing changed.");
        return Ok(());
    }

    if apply {
        println!("processing...");
    }

    let mut normalizer = Normalizer::new(target, exclude.as_ref(), &rewriter, apply, cli.json);
    normalizer.run()?;
    normalizer.stats.print(apply);
    if apply {
        println!("all done.");
    }
    Ok(())
}

#[derive(Debug, Default)]
struct ScanCounts {
    dirs: usize,
    files: usize,
    html: usize,
}

fn scan_target(root: &Path, exclude: Option<&GlobSet>) -> ScanCounts {
    let mut counts = ScanCounts::default();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| !entry_is_excluded(root, entry.path(), exclude));

    for entry in walker.flatten() {
        if entry.file_type().is_dir() {
            counts.dirs += 1;
        } else {
            counts.files += 1;
            let name = entry.file_name().to_string_lossy().to_lowercase();
            if name.ends_with(".htm") || name.ends_with(".html") {
                counts.html += 1;
            }
        }
    }

    counts
}

fn entry_is_excluded(root: &Path, path: &Path, exclude: Option<&GlobSet>) -> bool {
    let Some(set) = exclude else {
        return false;
    };
    let rel = path.strip_prefix(root).unwrap_or(path);
    let candidate = rel.to_string_lossy().replace('\\', "/");
    set.is_match(candidate.as_str())
}

fn print_summary(cli: &Cli, target: &Path, counts: &ScanCounts) {
    println!("linklower");
    println!("every file and directory name under the target will be renamed to");
    println!("its lowercase form, and urls inside html files rewritten to match.");
    println!("read-only entries are made writable for the duration (755 for");
    println!("directories, 644 for files) and their original modes put back.");
    println!();
    println!(
        "target: {} ({} directories, {} files, {} html)",
        target.display(),
        counts.dirs,
        counts.files,
        counts.html
    );
    if !cli.exclude.is_empty() {
        println!("excluding: {}", cli.exclude.join(", "));
    }
    if let Some(encoding) = &cli.encoding {
        println!("encoding override: {encoding}");
    }
    if cli.dry_run {
        println!("dry-run: nothing will be changed.");
    }
    println!();
}

fn confirm() -> Result<bool> {
    print!("proceed? [y/n]: ");
    io::stdout().flush()?;
    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    parse_confirmation(input.trim())
}

fn parse_confirmation(input: &str) -> Result<bool> {
    match input.to_lowercase().as_str() {
        "y" => Ok(true),
        "n" => Ok(false),
        other => bail!("expected y or n, got '{other}'"),
    }
}

fn build_exclude_globs(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }

    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob =
            Glob::new(pattern).map_err(|err| anyhow!("invalid exclude glob '{pattern}': {err}"))?;
        builder.add(glob);
    }

    builder
        .build()
        .map(Some)
        .map_err(|err| anyhow!("unable to build exclude globs: {err}"))
}
