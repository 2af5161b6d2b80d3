//! Per-target locks shared between unrelated redo processes.
//!
//! A lock is the file `<base>/.redo/lock^<key>`, acquired by exclusive
//! create. Whoever creates it owns the target until it removes the file.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::state::{StateStore, remove_if_exists};
use crate::target::Target;
use crate::verbose::ddprintln;

/// How often [`TargetLock::wait`] re-checks a held lock.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Lock file name prefix inside the control directory.
const LOCK_PREFIX: &str = "lock^";

/// Advisory lock on one target.
pub struct TargetLock {
    path: PathBuf,
    owned: bool,
}

impl TargetLock {
    /// Prepare the lock for `target`. Nothing is acquired yet.
    pub fn new(store: &StateStore, target: &Target) -> Self {
        Self {
            path: store.record_path("lock", target),
            owned: false,
        }
    }

    /// Try to take the lock without blocking. Check [`owned`](Self::owned)
    /// for the outcome.
    pub fn lock(&mut self) -> Result<()> {
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                self.owned = true;
                // Holder pid is only informational.
                let _ = writeln!(file, "{}", std::process::id());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                ddprintln!("lock held elsewhere: {}", self.path.display());
                Ok(())
            }
            Err(e) => Err(e).with_context(|| format!("failed to lock {}", self.path.display())),
        }
    }

    /// Whether this handle holds the lock.
    pub fn owned(&self) -> bool {
        self.owned
    }

    /// Release the lock. Does nothing if it was never taken.
    pub fn unlock(&mut self) -> Result<()> {
        if self.owned {
            self.owned = false;
            remove_if_exists(&self.path)?;
        }
        Ok(())
    }

    /// Block until nobody holds the lock, calling `between_polls` each time
    /// it is found still held.
    pub fn wait(&self, mut between_polls: impl FnMut()) {
        while self.path.symlink_metadata().is_ok() {
            between_polls();
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        let _ = self.unlock();
    }
}

/// Remove every lock under the build root.
///
/// Only the top-level process calls this. A lock left over from a crashed run
/// would otherwise wedge its target forever; the cost is that two top-level
/// runs started on the same tree can break each other's locks.
pub fn clear_all(store: &StateStore) -> Result<usize> {
    let dir = store.control_dir();
    let entries =
        fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;

    let mut removed = 0;
    for entry in entries.flatten() {
        if entry.file_name().to_string_lossy().starts_with(LOCK_PREFIX) {
            remove_if_exists(&entry.path())?;
            removed += 1;
        }
    }
    ddprintln!("cleared {removed} stale lock(s)");
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn setup() -> (tempfile::TempDir, StateStore, Target) {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).unwrap();
        let target = Target::from_key(store.base(), "out/thing");
        (dir, store, target)
    }

    #[test]
    fn second_locker_is_denied() {
        let (_dir, store, target) = setup();
        let mut first = TargetLock::new(&store, &target);
        let mut second = TargetLock::new(&store, &target);

        first.lock().unwrap();
        second.lock().unwrap();
        assert!(first.owned());
        assert!(!second.owned());

        first.unlock().unwrap();
        second.lock().unwrap();
        assert!(second.owned());
    }

    #[test]
    fn unlock_without_ownership_is_harmless() {
        let (_dir, store, target) = setup();
        let mut holder = TargetLock::new(&store, &target);
        holder.lock().unwrap();

        let mut bystander = TargetLock::new(&store, &target);
        bystander.unlock().unwrap();
        assert!(store.record_path("lock", &target).exists());
    }

    #[test]
    fn drop_releases_lock() {
        let (_dir, store, target) = setup();
        {
            let mut lock = TargetLock::new(&store, &target);
            lock.lock().unwrap();
            assert!(lock.owned());
        }
        let mut again = TargetLock::new(&store, &target);
        again.lock().unwrap();
        assert!(again.owned());
    }

    #[test]
    fn wait_returns_once_released() {
        let (_dir, store, target) = setup();
        let mut holder = TargetLock::new(&store, &target);
        holder.lock().unwrap();

        let released = Arc::new(AtomicBool::new(false));
        let waiter = {
            let store = store.clone();
            let target = target.clone();
            let released = Arc::clone(&released);
            thread::spawn(move || {
                let mut polls = 0;
                TargetLock::new(&store, &target).wait(|| polls += 1);
                assert!(released.load(Ordering::SeqCst));
                assert!(polls > 0);
            })
        };

        thread::sleep(Duration::from_millis(250));
        released.store(true, Ordering::SeqCst);
        holder.unlock().unwrap();
        waiter.join().unwrap();
    }

    #[test]
    fn clear_all_removes_only_locks() {
        let (_dir, store, target) = setup();
        let mut lock = TargetLock::new(&store, &target);
        lock.lock().unwrap();
        std::mem::forget(lock);
        store.mark_generated(&target).unwrap();

        assert_eq!(clear_all(&store).unwrap(), 1);
        assert!(!store.record_path("lock", &target).exists());
        assert!(store.is_generated(&target));
    }
}
