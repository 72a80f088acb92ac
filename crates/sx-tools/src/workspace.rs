//! The target repository on disk and its metadata directory.
//!
//! Layout under the metadata directory (default `.sanaa/`):
//!
//! ```text
//! journal.md        human-readable log of every run
//! history.jsonl     one JSON event per line
//! index.json        last file listing
//! last_patch.diff   most recent candidate patch
//! patches/          every candidate patch, by label
//! memory.md         notes carried into later prompts
//! ```

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use ignore::WalkBuilder;
use serde::Serialize;
use tracing::{debug, warn};

use sx_core::Error;

use crate::git::GitCli;

pub const DEFAULT_META_DIR: &str = ".sanaa";

/// Markers in a reply that mark a line worth remembering.
const MEMORY_MARKERS: &[&str] = &["Decision:", "Summary:"];

#[derive(Debug, Clone)]
pub struct MetaPaths {
    pub dir: PathBuf,
    pub journal: PathBuf,
    pub history: PathBuf,
    pub index: PathBuf,
    pub last_patch: PathBuf,
    pub patches: PathBuf,
    pub memory: PathBuf,
}

impl MetaPaths {
    fn new(dir: PathBuf) -> Self {
        Self {
            journal: dir.join("journal.md"),
            history: dir.join("history.jsonl"),
            index: dir.join("index.json"),
            last_patch: dir.join("last_patch.diff"),
            patches: dir.join("patches"),
            memory: dir.join("memory.md"),
            dir,
        }
    }
}

/// Sorted, capped listing of repository files.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FileListing {
    pub files: Vec<String>,
    /// Number of files found before the cap was applied.
    pub total: usize,
}

impl FileListing {
    pub fn truncated(&self) -> bool {
        self.total > self.files.len()
    }
}

#[derive(Debug, Serialize)]
struct HistoryEntry {
    timestamp: String,
    event: String,
    data: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
    meta_name: String,
    meta: MetaPaths,
}

impl Workspace {
    /// Open an existing directory as a workspace and create its metadata directory.
    pub fn open(root: impl AsRef<Path>, meta_dir: &str) -> Result<Self, Error> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(Error::workspace(format!(
                "'{}' is not a directory",
                root.display()
            )));
        }
        let meta_path = Path::new(meta_dir);
        if meta_dir.is_empty()
            || meta_path.components().count() != 1
            || !matches!(meta_path.components().next(), Some(Component::Normal(_)))
        {
            return Err(Error::config(format!(
                "metadata directory must be a single relative name, got '{}'",
                meta_dir
            )));
        }

        let root = root.canonicalize()?;
        let meta = MetaPaths::new(root.join(meta_dir));
        std::fs::create_dir_all(&meta.patches)?;
        debug!(root = %root.display(), meta = %meta.dir.display(), "Opened workspace");

        Ok(Self {
            root,
            meta_name: meta_dir.to_string(),
            meta,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta(&self) -> &MetaPaths {
        &self.meta
    }

    pub fn meta_name(&self) -> &str {
        &self.meta_name
    }

    pub fn git(&self) -> GitCli {
        GitCli::new(&self.root)
    }

    /// Resolve a repository-relative path, refusing anything that lands outside the root.
    pub fn resolve(&self, rel: &str) -> Result<PathBuf, Error> {
        resolve_within(&self.root, rel)
    }

    /// Read a repository-relative file.
    pub fn read_rel(&self, rel: &str) -> Result<String, Error> {
        let path = self.resolve(rel)?;
        Ok(std::fs::read_to_string(path)?)
    }

    /// Files under the root, honoring ignore files, skipping `.git` and the
    /// metadata directory. Sorted, at most `limit` entries.
    pub fn file_listing(&self, limit: usize) -> FileListing {
        let meta_dir = self.meta.dir.clone();
        let walker = WalkBuilder::new(&self.root)
            .hidden(false)
            .git_ignore(true)
            .git_global(false)
            .git_exclude(false)
            .require_git(false)
            .filter_entry(move |entry| {
                let name = entry.file_name();
                name != ".git" && entry.path() != meta_dir
            })
            .build();

        let mut files: Vec<String> = walker
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| {
                entry
                    .path()
                    .strip_prefix(&self.root)
                    .ok()
                    .map(|p| p.to_string_lossy().replace('\\', "/"))
            })
            .collect();
        files.sort();

        let total = files.len();
        files.truncate(limit);
        FileListing { files, total }
    }

    /// Recompute the listing and persist it to `index.json`.
    pub fn refresh_index(&self, limit: usize) -> Result<FileListing, Error> {
        let listing = self.file_listing(limit);
        let json = serde_json::to_string_pretty(&listing)?;
        std::fs::write(&self.meta.index, json)?;
        Ok(listing)
    }

    /// Append a titled section to the journal.
    pub fn append_journal(&self, title: &str, body: &str) -> Result<(), Error> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.meta.journal)?;
        writeln!(
            file,
            "\n## {} ({})\n\n{}\n",
            title,
            Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            body.trim_end()
        )?;
        Ok(())
    }

    /// Append one structured event to `history.jsonl`. Failures are logged, not raised.
    pub fn append_history<T: Serialize>(&self, event: &str, data: T) {
        let entry = HistoryEntry {
            timestamp: Utc::now().to_rfc3339(),
            event: event.to_string(),
            data: serde_json::to_value(data).unwrap_or_default(),
        };
        let result = serde_json::to_string(&entry)
            .map_err(Error::from)
            .and_then(|line| {
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.meta.history)?;
                writeln!(file, "{}", line)?;
                Ok(())
            });
        if let Err(e) = result {
            warn!(error = %e, event = %event, "Failed to write history entry");
        }
    }

    /// Save a candidate patch as `last_patch.diff` and under `patches/<label>.diff`.
    pub fn write_patch(&self, label: &str, text: &str) -> Result<PathBuf, Error> {
        std::fs::write(&self.meta.last_patch, text)?;
        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let archived = self
            .meta
            .patches
            .join(format!("{}-{}.diff", stamp, sanitize_label(label)));
        std::fs::write(&archived, text)?;
        Ok(self.meta.last_patch.clone())
    }

    /// Contents of `memory.md`, empty if none.
    pub fn memory(&self) -> String {
        std::fs::read_to_string(&self.meta.memory).unwrap_or_default()
    }

    /// Append lines of `reply` tagged with a memory marker. Returns how many were kept.
    pub fn remember(&self, reply: &str) -> Result<usize, Error> {
        let notes = memory_notes(reply);
        if notes.is_empty() {
            return Ok(0);
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.meta.memory)?;
        for note in &notes {
            writeln!(file, "- {}", note)?;
        }
        Ok(notes.len())
    }
}

/// Lines carrying a memory marker, trimmed of list bullets.
pub fn memory_notes(reply: &str) -> Vec<String> {
    reply
        .lines()
        .map(|l| l.trim().trim_start_matches(['-', '*']).trim())
        .filter(|l| MEMORY_MARKERS.iter().any(|m| l.contains(m)))
        .map(str::to_string)
        .collect()
}

fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "patch".to_string()
    } else {
        cleaned
    }
}

/// True when `rel` stays inside its base after lexical normalization.
/// Absolute paths and drive prefixes never qualify.
pub fn is_contained(rel: &str) -> bool {
    let mut depth: usize = 0;
    for component in Path::new(rel).components() {
        match component {
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return false;
                }
                depth -= 1;
            }
            Component::RootDir | Component::Prefix(_) => return false,
        }
    }
    true
}

/// Join `rel` onto `root` and verify the result, after resolving symlinks,
/// is still under `root`.
pub fn resolve_within(root: &Path, rel: &str) -> Result<PathBuf, Error> {
    if !is_contained(rel) {
        return Err(Error::path_escape(rel));
    }
    let root = root.canonicalize()?;
    let joined = root.join(rel);

    // Canonicalize the deepest existing ancestor so links are followed even
    // when the target itself does not exist yet.
    let mut existing = joined.as_path();
    let mut rest: Vec<&std::ffi::OsStr> = Vec::new();
    let canonical = loop {
        match existing.canonicalize() {
            Ok(c) => break c,
            Err(_) => match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    rest.push(name);
                    existing = parent;
                }
                _ => return Err(Error::path_escape(rel)),
            },
        }
    };
    let resolved = rest.iter().rev().fold(canonical, |acc, part| acc.join(part));

    if !resolved.starts_with(&root) {
        return Err(Error::path_escape(rel));
    }
    Ok(resolved)
}
