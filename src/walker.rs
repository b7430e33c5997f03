use std::collections::{HashMap, HashSet};
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use globset::GlobSet;
use serde::Serialize;

use crate::perms::ensure_writable;
use crate::rewrite::UrlRewriter;

#[derive(Debug, Default)]
pub struct RunStats {
    pub dirs_renamed: usize,
    pub files_renamed: usize,
    pub html_updated: usize,
    pub urls_lowered: usize,
    pub skipped: usize,
}

impl RunStats {
    pub fn print(&self, apply: bool) {
        let prefix = if apply { "done" } else { "dry-run" };
        println!(
            "{prefix}: {} directories renamed, {} files renamed, {} html files updated ({} urls), {} entries skipped",
            self.dirs_renamed, self.files_renamed, self.html_updated, self.urls_lowered, self.skipped
        );
    }
}

#[derive(Serialize)]
struct RenameEvent<'a> {
    event: &'static str,
    kind: &'static str,
    from: &'a str,
    to: &'a str,
    applied: bool,
}

#[derive(Serialize)]
struct RewriteEvent<'a> {
    event: &'static str,
    path: &'a str,
    urls: usize,
    applied: bool,
}

pub struct Normalizer<'a> {
    root: PathBuf,
    exclude: Option<&'a GlobSet>,
    rewriter: &'a UrlRewriter,
    apply: bool,
    json: bool,
    renamed: HashSet<PathBuf>,
    pub stats: RunStats,
}

struct EntrySnapshot {
    name: OsString,
    is_dir: bool,
    is_file: bool,
}

impl<'a> Normalizer<'a> {
    pub fn new(
        root: PathBuf,
        exclude: Option<&'a GlobSet>,
        rewriter: &'a UrlRewriter,
        apply: bool,
        json: bool,
    ) -> Self {
        Self {
            root,
            exclude,
            rewriter,
            apply,
            json,
            renamed: HashSet::new(),
            stats: RunStats::default(),
        }
    }

    pub fn run(&mut self) -> Result<()> {
        let root = self.root.clone();
        self.normalize_dir(&root)
    }

    fn normalize_dir(&mut self, dir: &Path) -> Result<()> {
        let entries = read_sorted_entries(dir)?;
        check_case_collisions(dir, &entries)?;

        for entry in entries {
            let Some(name) = entry.name.to_str().map(str::to_owned) else {
                println!(
                    "skipping {} (name is not valid utf-8)",
                    dir.join(&entry.name).display()
                );
                self.stats.skipped += 1;
                continue;
            };
            let path = dir.join(&name);
            if self.is_excluded(&path) {
                self.stats.skipped += 1;
                continue;
            }

            if entry.is_dir {
                self.process_dir(dir, &name)
                    .with_context(|| format!("processing {}", path.display()))?;
            } else {
                if self.renamed.contains(&path) {
                    continue;
                }
                self.process_file(dir, &name, entry.is_file)
                    .with_context(|| format!("processing {}", path.display()))?;
            }
        }

        Ok(())
    }

    fn process_dir(&mut self, dir: &Path, name: &str) -> Result<()> {
        let path = dir.join(name);
        let mut guard = if self.apply {
            Some(ensure_writable(&path)?)
        } else {
            None
        };

        // Children first: renaming this directory before its subtree is done
        // would invalidate every path below it.
        self.normalize_dir(&path)?;

        let lowered = name.to_lowercase();
        if lowered == name {
            self.renamed.insert(path);
            return Ok(());
        }

        let target = dir.join(&lowered);
        if self.apply {
            fs::rename(&path, &target).with_context(|| {
                format!("renaming {} -> {}", path.display(), target.display())
            })?;
            if let Some(guard) = guard.as_mut() {
                guard.retarget(target.clone());
            }
        }
        self.report_rename("dir", &path, &target)?;
        self.stats.dirs_renamed += 1;
        self.renamed.insert(target);
        Ok(())
    }

    fn process_file(&mut self, dir: &Path, name: &str, is_regular: bool) -> Result<()> {
        let path = dir.join(name);
        let lowered = name.to_lowercase();
        let target = dir.join(&lowered);
        self.renamed.insert(target.clone());

        if lowered != name {
            if self.apply {
                fs::rename(&path, &target).with_context(|| {
                    format!("renaming {} -> {}", path.display(), target.display())
                })?;
            }
            self.report_rename("file", &path, &target)?;
            self.stats.files_renamed += 1;
        }

        if is_regular && has_html_extension(&lowered) {
            let live = if self.apply { &target } else { &path };
            let urls = self
                .rewriter
                .rewrite_file(live, self.apply)
                .with_context(|| format!("rewriting urls in {}", live.display()))?;
            if urls > 0 {
                self.stats.html_updated += 1;
                self.stats.urls_lowered += urls;
                self.report_rewrite(live, urls)?;
            }
        }

        Ok(())
    }

    fn is_excluded(&self, path: &Path) -> bool {
        let Some(set) = self.exclude else {
            return false;
        };
        let rel = path.strip_prefix(&self.root).unwrap_or(path);
        let candidate = rel.to_string_lossy().replace('\\', "/");
        set.is_match(candidate.as_str())
    }

    fn display_rel(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .display()
            .to_string()
    }

    fn report_rename(&self, kind: &'static str, from: &Path, to: &Path) -> Result<()> {
        let from = self.display_rel(from);
        let to = self.display_rel(to);
        if self.json {
            let event = RenameEvent {
                event: "rename",
                kind,
                from: &from,
                to: &to,
                applied: self.apply,
            };
            println!("{}", serde_json::to_string(&event)?);
        } else if self.apply {
            println!("renamed {from} -> {to}");
        } else {
            println!("would rename {from} -> {to}");
        }
        Ok(())
    }

    fn report_rewrite(&self, path: &Path, urls: usize) -> Result<()> {
        let rel = self.display_rel(path);
        if self.json {
            let event = RewriteEvent {
                event: "rewrite",
                path: &rel,
                urls,
                applied: self.apply,
            };
            println!("{}", serde_json::to_string(&event)?);
        } else if self.apply {
            println!("rewrote {urls} urls in {rel}");
        } else {
            println!("would rewrite {urls} urls in {rel}");
        }
        Ok(())
    }
}

fn read_sorted_entries(dir: &Path) -> Result<Vec<EntrySnapshot>> {
    let reader =
        fs::read_dir(dir).with_context(|| format!("reading directory {}", dir.display()))?;
    let mut entries = Vec::new();
    for entry in reader {
        let entry = entry.with_context(|| format!("reading directory {}", dir.display()))?;
        let file_type = entry
            .file_type()
            .with_context(|| format!("reading type of {}", entry.path().display()))?;
        entries.push(EntrySnapshot {
            name: entry.file_name(),
            is_dir: file_type.is_dir(),
            is_file: file_type.is_file(),
        });
    }
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}

fn check_case_collisions(dir: &Path, entries: &[EntrySnapshot]) -> Result<()> {
    let mut seen: HashMap<String, &str> = HashMap::new();
    for entry in entries {
        let Some(name) = entry.name.to_str() else {
            continue;
        };
        let lowered = name.to_lowercase();
        if let Some(first) = seen.get(lowered.as_str()) {
            bail!(
                "case collision in {}: '{first}' and '{name}' both lowercase to '{lowered}'",
                dir.display()
            );
        }
        seen.insert(lowered, name);
    }
    Ok(())
}

fn has_html_extension(lowered_name: &str) -> bool {
    matches!(
        Path::new(lowered_name).extension().and_then(|ext| ext.to_str()),
        Some("htm" | "html")
    )
}
