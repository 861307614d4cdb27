//! Flat-file persistence for run state.
//!
//! Every persisted table is a tab-separated file with one record per line.
//! Writes go through [`write_atomic`] (temp file in the destination directory,
//! then rename) so a concurrently starting run never reads a half-written file.
//!
//! Layout under the state directory:
//!
//! ```text
//! snapshot.tsv        previous run's snapshot
//! ledger.tsv          notification ledger (event key -> discriminator)
//! mentioned.tsv       PR identities from the previous "mentioned" query
//! merge_queue.tsv     PR identities in the merge queue last run
//! unprimed.tsv        sections that have not completed since state was seeded
//! enrich/             per-PR enrichment cache entries
//! avatars/            cached author avatars
//! ```

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};

use color_eyre::eyre::{Result, WrapErr};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::snapshot::{PrId, SectionKind};

/// Paths of every file the plugin persists, rooted at one state directory.
#[derive(Debug, Clone)]
pub struct StateLayout {
    root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn snapshot(&self) -> PathBuf {
        self.root.join("snapshot.tsv")
    }

    pub fn ledger(&self) -> PathBuf {
        self.root.join("ledger.tsv")
    }

    pub fn mentioned(&self) -> PathBuf {
        self.root.join("mentioned.tsv")
    }

    pub fn merge_queue(&self) -> PathBuf {
        self.root.join("merge_queue.tsv")
    }

    pub fn unprimed(&self) -> PathBuf {
        self.root.join("unprimed.tsv")
    }

    pub fn enrich_dir(&self) -> PathBuf {
        self.root.join("enrich")
    }

    pub fn avatar_dir(&self) -> PathBuf {
        self.root.join("avatars")
    }

    /// Create the state directory and its cache subdirectories.
    pub fn ensure(&self) -> Result<()> {
        for dir in [self.root.clone(), self.enrich_dir(), self.avatar_dir()] {
            std::fs::create_dir_all(&dir)
                .wrap_err_with(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Remove the previous-run tables so the next run primes from scratch.
    /// Caches are left alone.
    pub fn reset(&self) -> Result<usize> {
        let mut removed = 0;
        for path in [
            self.snapshot(),
            self.ledger(),
            self.mentioned(),
            self.merge_queue(),
            self.unprimed(),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).wrap_err_with(|| format!("failed to remove {}", path.display()));
                }
            }
        }
        Ok(removed)
    }
}

/// Write `contents` to `path` atomically: temp file in the same directory,
/// fsync, then rename over the destination.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir)
        .wrap_err_with(|| format!("failed to create {}", dir.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .wrap_err_with(|| format!("failed to create temp file in {}", dir.display()))?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .wrap_err_with(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

/// Load a JSON document, returning `None` when the file is missing or unreadable.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let contents = std::fs::read_to_string(path).ok()?;
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(target: "state", "ignoring corrupt {}: {e}", path.display());
            None
        }
    }
}

/// Serialize `value` as JSON and write it atomically.
pub fn save_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &json)
}

/// Escape a field for a TSV cell.
pub fn escape_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            other => out.push(other),
        }
    }
    out
}

/// Reverse [`escape_field`]. Unknown escapes are kept verbatim.
pub fn unescape_field(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(ch) = chars.next() {
        if ch != '\\' {
            out.push(ch);
            continue;
        }
        match chars.next() {
            Some('\\') => out.push('\\'),
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

/// Join already-unescaped fields into one TSV line (without trailing newline).
pub fn join_row<S: AsRef<str>>(fields: &[S]) -> String {
    fields
        .iter()
        .map(|f| escape_field(f.as_ref()))
        .collect::<Vec<_>>()
        .join("\t")
}

/// Split a TSV line into unescaped fields.
pub fn split_row(line: &str) -> Vec<String> {
    line.split('\t').map(unescape_field).collect()
}

/// Read a TSV table. Returns `None` when the file does not exist, so callers
/// can tell "first run" apart from "empty table".
pub fn read_table(path: &Path) -> Result<Option<Vec<Vec<String>>>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).wrap_err_with(|| format!("failed to read {}", path.display())),
    };

    let rows = contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(split_row)
        .collect();
    Ok(Some(rows))
}

/// Write a TSV table atomically.
pub fn write_table<I, R, S>(path: &Path, rows: I) -> Result<()>
where
    I: IntoIterator<Item = R>,
    R: AsRef<[S]>,
    S: AsRef<str>,
{
    let mut body = String::new();
    for row in rows {
        body.push_str(&join_row(row.as_ref()));
        body.push('\n');
    }
    write_atomic(path, body.as_bytes())
}

/// Load a set of PR identities (`repo \t number` lines). Missing file → `None`.
pub fn load_id_set(path: &Path) -> Result<Option<BTreeSet<PrId>>> {
    let Some(rows) = read_table(path)? else {
        return Ok(None);
    };

    let mut set = BTreeSet::new();
    for row in rows {
        match row.as_slice() {
            [repo, number, ..] => match number.parse() {
                Ok(number) => {
                    set.insert(PrId::new(repo.clone(), number));
                }
                Err(_) => {
                    tracing::warn!(target: "state", "skipping bad row in {}: {row:?}", path.display())
                }
            },
            _ => tracing::warn!(target: "state", "skipping short row in {}: {row:?}", path.display()),
        }
    }
    Ok(Some(set))
}

/// Persist a set of PR identities.
pub fn save_id_set<'a>(path: &Path, ids: impl IntoIterator<Item = &'a PrId>) -> Result<()> {
    let rows: Vec<[String; 2]> = ids
        .into_iter()
        .map(|id| [id.repo.clone(), id.number.to_string()])
        .collect();
    write_table(path, rows)
}

/// Load a set of section slugs. Missing file or unknown slugs → left out.
pub fn load_section_set(path: &Path) -> Result<BTreeSet<SectionKind>> {
    let Some(rows) = read_table(path)? else {
        return Ok(BTreeSet::new());
    };
    let mut set = BTreeSet::new();
    for row in rows {
        match row.first().and_then(|slug| SectionKind::from_slug(slug)) {
            Some(kind) => {
                set.insert(kind);
            }
            None => tracing::warn!(target: "state", "skipping bad row in {}: {row:?}", path.display()),
        }
    }
    Ok(set)
}

/// Persist a set of sections, one slug per line.
pub fn save_section_set(path: &Path, kinds: &BTreeSet<SectionKind>) -> Result<()> {
    let rows: Vec<[&str; 1]> = kinds.iter().map(|k| [k.slug()]).collect();
    write_table(path, rows)
}
