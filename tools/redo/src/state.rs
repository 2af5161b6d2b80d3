//! Persistent dependency state, shared by every redo process under a build root.
//!
//! Each target owns a few small files in `<base>/.redo/`, named
//! `<kind>^<escaped key>`:
//!
//! - `stamp^…`: JSON [`Stamp`], always replaced atomically (tmp + rename)
//! - `dep^…`: append-only dependency edges, one `<kind> <key>` per line
//! - `gen^…`: empty marker, present once the engine has built the target
//!
//! No file is ever rewritten in place, so concurrent processes only ever see
//! a whole record or no record.

use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::SystemTime;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::target::Target;
use crate::verbose::{ddprintln, dprintln};

/// Control directory name at the build root.
pub const CONTROL_DIR: &str = ".redo";

/// Current stamp schema version. Bump when the stamp format changes.
const STAMP_VERSION: u32 = 1;

/// Distinguishes temp files written concurrently by threads of one process.
static TMP_SEQ: AtomicUsize = AtomicUsize::new(0);

/// Kind of a recorded dependency edge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DepKind {
    /// The target depends on the contents of an existing file.
    Matched,
    /// The target depends on a file *not* existing.
    Candidate,
}

impl DepKind {
    fn as_char(self) -> char {
        match self {
            Self::Matched => 'm',
            Self::Candidate => 'c',
        }
    }

    fn from_char(c: char) -> Option<Self> {
        match c {
            'm' => Some(Self::Matched),
            'c' => Some(Self::Candidate),
            _ => None,
        }
    }
}

/// One recorded edge: the owning target depends on `dep` with `kind`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepEdge {
    pub kind: DepKind,
    /// Dependency key, relative to the build root.
    pub dep: String,
}

/// Freshness record written after a successful build.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stamp {
    /// Schema version for forward compatibility.
    pub version: u32,
    /// State of the target file when stamped; `None` if no file existed.
    pub file: Option<FileRecord>,
    /// Wall-clock time of stamping, in nanoseconds since the Unix epoch.
    pub stamped_at: u64,
}

/// Recorded state of a target file.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub mtime_nanos: u64,
    pub size: u64,
    /// SHA-256 of the contents; `None` for directories and other non-files.
    pub content_hash: Option<String>,
}

impl Stamp {
    /// Capture the current state of `path`.
    fn capture(path: &Path) -> Result<Self> {
        let file = match fs::metadata(path) {
            Ok(meta) => {
                let content_hash = if meta.is_file() {
                    Some(hash_file(path)?)
                } else {
                    None
                };
                Some(FileRecord {
                    mtime_nanos: mtime_nanos(&meta).unwrap_or(0),
                    size: meta.len(),
                    content_hash,
                })
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("failed to stat {}", path.display()));
            }
        };
        Ok(Self {
            version: STAMP_VERSION,
            file,
            stamped_at: now_nanos(),
        })
    }

    /// Whether `path` still looks the way it did when stamped.
    ///
    /// Unchanged mtime and size are trusted outright; otherwise the content
    /// hash decides.
    pub fn matches(&self, path: &Path) -> bool {
        match (&self.file, fs::metadata(path)) {
            (None, Err(_)) => true,
            (None, Ok(_)) | (Some(_), Err(_)) => false,
            (Some(record), Ok(meta)) => {
                if mtime_nanos(&meta) == Some(record.mtime_nanos) && meta.len() == record.size {
                    return true;
                }
                match &record.content_hash {
                    Some(expected) if meta.is_file() => {
                        hash_file(path).is_ok_and(|current| &current == expected)
                    }
                    _ => false,
                }
            }
        }
    }
}

/// Handle on the dependency state of one build root.
#[derive(Clone, Debug)]
pub struct StateStore {
    base: PathBuf,
    dir: PathBuf,
}

impl StateStore {
    /// Open (creating if needed) the store under `base/.redo`.
    pub fn open(base: &Path) -> Result<Self> {
        let dir = base.join(CONTROL_DIR);
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        Ok(Self {
            base: base.to_path_buf(),
            dir,
        })
    }

    /// The build root this store belongs to.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// The control directory holding all records.
    pub fn control_dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the `kind` record for `target`.
    pub fn record_path(&self, kind: &str, target: &Target) -> PathBuf {
        self.dir.join(format!("{kind}^{}", escape_key(target.key())))
    }

    /// Claim file for the implicit job token of `target`'s recipe. Only
    /// meaningful while that recipe runs.
    pub fn claim_path(&self, target: &Target) -> PathBuf {
        self.record_path("claim", target)
    }

    // -----------------------------------------------------------------------
    // Dependency edges
    // -----------------------------------------------------------------------

    /// Append a dependency edge to `target`'s edge list.
    pub fn add_dep(&self, target: &Target, kind: DepKind, dep: &Target) -> Result<()> {
        let path = self.record_path("dep", target);
        ddprintln!("add-dep: {target} < {} {dep}", kind.as_char());
        let line = format!("{} {}\n", kind.as_char(), dep.key());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        file.write_all(line.as_bytes())
            .with_context(|| format!("failed to append to {}", path.display()))
    }

    /// The recorded edges of `target`, in recording order.
    pub fn deps(&self, target: &Target) -> Result<Vec<DepEdge>> {
        let path = self.record_path("dep", target);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        Ok(content.lines().filter_map(parse_dep_line).collect())
    }

    // -----------------------------------------------------------------------
    // Stamps
    // -----------------------------------------------------------------------

    /// Mark `target` as up to date in its current on-disk state.
    ///
    /// A still-valid stamp is left alone so that its time keeps ordering it
    /// against the targets that depend on it.
    pub fn stamp(&self, target: &Target) -> Result<()> {
        if let Some(existing) = self.read_stamp(target)? {
            if existing.matches(target.path()) {
                ddprintln!("{target}: stamp unchanged");
                return Ok(());
            }
        }
        let stamp = Stamp::capture(target.path())?;
        let json = serde_json::to_vec(&stamp).context("failed to serialize stamp")?;
        self.write_atomic(&self.record_path("stamp", target), &json)
    }

    /// Forget `target`'s stamp and its recorded edges.
    pub fn unstamp(&self, target: &Target) -> Result<()> {
        remove_if_exists(&self.record_path("stamp", target))?;
        remove_if_exists(&self.record_path("dep", target))
    }

    /// The stamp of `target`, if it has one that still matches the file.
    pub fn stamped(&self, target: &Target) -> Result<Option<Stamp>> {
        Ok(self
            .read_stamp(target)?
            .filter(|stamp| stamp.matches(target.path())))
    }

    fn read_stamp(&self, target: &Target) -> Result<Option<Stamp>> {
        let path = self.record_path("stamp", target);
        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        // A corrupt or outdated stamp is the same as no stamp.
        Ok(serde_json::from_slice::<Stamp>(&data)
            .ok()
            .filter(|s| s.version == STAMP_VERSION))
    }

    // -----------------------------------------------------------------------
    // Generated marker
    // -----------------------------------------------------------------------

    /// Whether the engine has ever started building `target`.
    pub fn is_generated(&self, target: &Target) -> bool {
        self.record_path("gen", target).exists()
    }

    /// Record that `target` is produced by a recipe, not written by hand.
    pub fn mark_generated(&self, target: &Target) -> Result<()> {
        let path = self.record_path("gen", target);
        fs::File::create(&path)
            .map(drop)
            .with_context(|| format!("failed to create {}", path.display()))
    }

    // -----------------------------------------------------------------------
    // Staleness
    // -----------------------------------------------------------------------

    /// Whether `target` must be rebuilt, judged from its recorded state.
    pub fn is_dirty(&self, target: &Target) -> Result<bool> {
        let mut visiting = HashSet::new();
        self.is_dirty_inner(target, &mut visiting)
    }

    fn is_dirty_inner(&self, target: &Target, visiting: &mut HashSet<String>) -> Result<bool> {
        // Recorded edges can form a cycle; a revisit adds no information.
        if !visiting.insert(target.key().to_string()) {
            return Ok(false);
        }

        let Some(stamp) = self.stamped(target)? else {
            dprintln!("{target}: dirty (no valid stamp)");
            return Ok(true);
        };

        for edge in self.deps(target)? {
            let dep = Target::from_key(&self.base, &edge.dep);
            match edge.kind {
                DepKind::Candidate => {
                    if dep.exists() {
                        dprintln!("{target}: dirty ({dep} was created)");
                        return Ok(true);
                    }
                }
                DepKind::Matched => {
                    if self.is_dirty_inner(&dep, visiting)? {
                        dprintln!("{target}: dirty ({dep} is dirty)");
                        return Ok(true);
                    }
                    if let Some(dep_stamp) = self.stamped(&dep)? {
                        if dep_stamp.stamped_at > stamp.stamped_at {
                            dprintln!("{target}: dirty ({dep} is newer)");
                            return Ok(true);
                        }
                    }
                }
            }
        }

        ddprintln!("{target}: clean");
        Ok(false)
    }

    /// Write `data` to `path` via a uniquely named temp file and a rename.
    fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(format!(".{}.{seq}.tmp", std::process::id()));
        let tmp_path = PathBuf::from(tmp_name);

        fs::write(&tmp_path, data)
            .with_context(|| format!("failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to atomically replace {}", path.display()))
    }
}

/// Escape a target key into a single reversible file-name component.
pub fn escape_key(key: &str) -> String {
    key.replace('%', "%25").replace('/', "%2F")
}

fn parse_dep_line(line: &str) -> Option<DepEdge> {
    let mut chars = line.chars();
    let kind = DepKind::from_char(chars.next()?)?;
    let dep = chars.as_str().strip_prefix(' ')?;
    if dep.is_empty() {
        return None;
    }
    Some(DepEdge {
        kind,
        dep: dep.to_string(),
    })
}

/// Remove a file, treating "already gone" as success.
pub fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
    }
}

fn mtime_nanos(meta: &fs::Metadata) -> Option<u64> {
    let mtime = meta.modified().ok()?;
    let duration = mtime.duration_since(SystemTime::UNIX_EPOCH).ok()?;
    u64::try_from(duration.as_nanos()).ok()
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .ok()
        .and_then(|d| u64::try_from(d.as_nanos()).ok())
        .unwrap_or(0)
}

/// SHA-256 hash of a file's contents, returned as a hex string.
fn hash_file(path: &Path) -> Result<String> {
    let data = fs::read(path)
        .with_context(|| format!("failed to read file for hashing: {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&data);
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, StateStore) {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().canonicalize().unwrap();
        let store = StateStore::open(&base).unwrap();
        (dir, store)
    }

    fn target(store: &StateStore, key: &str) -> Target {
        Target::from_key(store.base(), key)
    }

    #[test]
    fn keys_escape_reversibly() {
        assert_eq!(escape_key("a/b%c/d"), "a%2Fb%25c%2Fd");
        assert_ne!(escape_key("a/b"), escape_key("a%2Fb"));
    }

    #[test]
    fn deps_round_trip_and_reset_on_unstamp() {
        let (_dir, store) = setup();
        let t = target(&store, "out/x.o");
        store.add_dep(&t, DepKind::Candidate, &target(&store, "out/x.o.do")).unwrap();
        store.add_dep(&t, DepKind::Matched, &target(&store, "out/default.o.do")).unwrap();

        let deps = store.deps(&t).unwrap();
        assert_eq!(
            deps,
            vec![
                DepEdge { kind: DepKind::Candidate, dep: "out/x.o.do".into() },
                DepEdge { kind: DepKind::Matched, dep: "out/default.o.do".into() },
            ]
        );

        store.unstamp(&t).unwrap();
        assert!(store.deps(&t).unwrap().is_empty());
    }

    #[test]
    fn malformed_dep_lines_are_skipped() {
        assert_eq!(parse_dep_line("x foo"), None);
        assert_eq!(parse_dep_line("m"), None);
        assert_eq!(parse_dep_line("mfoo"), None);
        assert_eq!(
            parse_dep_line("m dir/with space"),
            Some(DepEdge { kind: DepKind::Matched, dep: "dir/with space".into() })
        );
    }

    #[test]
    fn stamp_tracks_content_changes() {
        let (_dir, store) = setup();
        let t = target(&store, "hello.txt");
        fs::write(t.path(), "one").unwrap();

        assert!(store.stamped(&t).unwrap().is_none());
        store.stamp(&t).unwrap();
        assert!(store.stamped(&t).unwrap().is_some());

        fs::write(t.path(), "two!").unwrap();
        assert!(store.stamped(&t).unwrap().is_none());

        store.unstamp(&t).unwrap();
        fs::write(t.path(), "one").unwrap();
        store.stamp(&t).unwrap();
        assert!(store.stamped(&t).unwrap().is_some());
    }

    #[test]
    fn restamping_unchanged_file_keeps_stamp_time() {
        let (_dir, store) = setup();
        let t = target(&store, "src.c");
        fs::write(t.path(), "int x;").unwrap();
        store.stamp(&t).unwrap();
        let first = store.stamped(&t).unwrap().unwrap();
        store.stamp(&t).unwrap();
        let second = store.stamped(&t).unwrap().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn stamp_of_missing_output_matches_only_while_missing() {
        let (_dir, store) = setup();
        let t = target(&store, "phony");
        store.stamp(&t).unwrap();
        assert!(store.stamped(&t).unwrap().is_some());
        fs::write(t.path(), "surprise").unwrap();
        assert!(store.stamped(&t).unwrap().is_none());
    }

    #[test]
    fn generated_marker() {
        let (_dir, store) = setup();
        let t = target(&store, "gen.h");
        assert!(!store.is_generated(&t));
        store.mark_generated(&t).unwrap();
        assert!(store.is_generated(&t));
    }

    #[test]
    fn dirty_when_unstamped_or_candidate_created() {
        let (_dir, store) = setup();
        let t = target(&store, "x");
        assert!(store.is_dirty(&t).unwrap());

        store.stamp(&t).unwrap();
        let candidate = target(&store, "x.do");
        store.add_dep(&t, DepKind::Candidate, &candidate).unwrap();
        assert!(!store.is_dirty(&t).unwrap());

        fs::write(candidate.path(), "echo hi").unwrap();
        assert!(store.is_dirty(&t).unwrap());
    }

    #[test]
    fn dirty_when_matched_dependency_changes() {
        let (_dir, store) = setup();
        let src = target(&store, "a.c");
        let out = target(&store, "a.o");
        fs::write(src.path(), "v1").unwrap();
        fs::write(out.path(), "obj").unwrap();
        store.stamp(&src).unwrap();
        store.stamp(&out).unwrap();
        store.add_dep(&out, DepKind::Matched, &src).unwrap();
        assert!(!store.is_dirty(&out).unwrap());

        fs::write(src.path(), "v2 changed").unwrap();
        assert!(store.is_dirty(&out).unwrap());
    }

    #[test]
    fn dirty_when_dependency_stamped_later() {
        let (_dir, store) = setup();
        let dep = target(&store, "lib.a");
        let out = target(&store, "app");
        store.stamp(&out).unwrap();
        store.add_dep(&out, DepKind::Matched, &dep).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        fs::write(dep.path(), "archive").unwrap();
        store.stamp(&dep).unwrap();
        assert!(store.is_dirty(&out).unwrap());
    }

    #[test]
    fn dependency_cycles_terminate() {
        let (_dir, store) = setup();
        let a = target(&store, "a");
        let b = target(&store, "b");
        store.stamp(&a).unwrap();
        store.stamp(&b).unwrap();
        store.add_dep(&a, DepKind::Matched, &b).unwrap();
        store.add_dep(&b, DepKind::Matched, &a).unwrap();
        // One side of a cycle is always stamped later than the other, so
        // only termination is guaranteed here.
        assert!(store.is_dirty(&a).is_ok());
        assert!(store.is_dirty(&b).is_ok());
    }
}
