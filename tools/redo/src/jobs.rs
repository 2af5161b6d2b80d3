//! Job tokens shared by the whole redo process tree.
//!
//! Recipes may run `redo-ifchange`, which starts another redo process, which
//! runs more recipes. A per-process limit would multiply with every level of
//! nesting, so every process draws from the same GNU-make-style jobserver
//! pool instead.
//!
//! - The top-level process creates a pool of exactly `j` tokens and runs each
//!   job under a token taken from it.
//! - A child process connects to the inherited pool. It may also use the
//!   *implicit* token: the one its parent is holding for the recipe that
//!   started it. That keeps nested builds moving even with `-j1`.
//!
//! A recipe can start several redo processes at once (`redo-ifchange a &
//! redo-ifchange b &`), and they all share the one implicit token. It is
//! represented by a claim file per recipe; a process holds the token while
//! it holds an exclusive `flock` on that file. The kernel drops the lock
//! when a process dies, so a crashed sibling cannot take the token with it.
//!
//! Every job runs on its own thread. Its token goes back when the job
//! function returns, or unwinds.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use jobserver::{Acquired, Client, HelperThread};

use crate::verbose::ddprintln;

/// How often a waiting process retries the implicit token. Siblings release
/// it without telling anyone.
const CLAIM_POLL: Duration = Duration::from_millis(50);

/// Message from the token helper thread or a finishing job.
enum Event {
    /// The helper acquired a token from the shared pool.
    Token(io::Result<Acquired>),
    /// A job finished and gave back its token.
    Finished,
}

/// The implicit token, as seen by one process.
struct ImplicitSlot {
    claim: File,
    // flock is per open file, so threads of this process must not both
    // think they hold it.
    in_use: AtomicBool,
}

impl ImplicitSlot {
    fn open(path: &Path) -> Result<Self> {
        let claim = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            claim,
            in_use: AtomicBool::new(false),
        })
    }

    /// Take the token if neither this process nor a sibling is using it.
    fn try_claim(&self) -> Result<bool> {
        if self.in_use.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        // SAFETY: `claim` is an open file owned by this slot.
        let rc = unsafe { libc::flock(self.claim.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == 0 {
            return Ok(true);
        }
        self.in_use.store(false, Ordering::Release);
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(false),
            _ => Err(err).context("failed to claim the implicit job token"),
        }
    }

    fn release(&self) {
        // SAFETY: as in `try_claim`.
        unsafe { libc::flock(self.claim.as_raw_fd(), libc::LOCK_UN) };
        self.in_use.store(false, Ordering::Release);
    }
}

/// Permission to run one job.
enum Token {
    /// The token the parent holds for our recipe.
    Implicit(Arc<ImplicitSlot>),
    /// A token taken from the shared pool. Never read: dropping it is what
    /// writes it back to the pool.
    Pool(#[allow(dead_code)] Acquired),
}

impl Drop for Token {
    fn drop(&mut self) {
        if let Self::Implicit(slot) = self {
            slot.release();
        }
    }
}

/// Returns a job's token and wakes the scheduler, however the job ends.
struct FinishGuard {
    token: Option<Token>,
    events: Sender<Event>,
}

impl Drop for FinishGuard {
    fn drop(&mut self) {
        drop(self.token.take());
        let _ = self.events.send(Event::Finished);
    }
}

/// Token-bounded job runner for one redo process.
pub struct JobServer {
    client: Client,
    // Declared before `events` so the helper is joined while the receiver
    // still exists; a token it delivers late is then dropped (released)
    // along with the channel.
    helper: HelperThread,
    events: Receiver<Event>,
    events_tx: Sender<Event>,
    implicit: Option<Arc<ImplicitSlot>>,
    spare: Vec<Acquired>,
    requested: usize,
    running: Vec<(String, JoinHandle<i32>)>,
}

impl JobServer {
    /// Create the pool (top level, `claim` is `None`) or join the inherited
    /// one (child, `claim` names the calling recipe's claim file).
    ///
    /// A child that finds no inherited pool creates its own with `jobs` tokens.
    pub fn setup(jobs: usize, claim: Option<&Path>) -> Result<Self> {
        let inherited = match claim {
            Some(claim) => {
                // SAFETY: called once at startup, before this process opens
                // any file descriptor that could be mistaken for the
                // inherited pipe.
                let client = unsafe { Client::from_env() };
                client.map(|client| (client, claim))
            }
            None => None,
        };

        match inherited {
            Some((client, claim)) => {
                ddprintln!("joined inherited job token pool");
                Self::with_client(client, Some(claim))
            }
            None => {
                ddprintln!("created job token pool with {jobs} token(s)");
                let client = Client::new(jobs).context("failed to create job token pool")?;
                Self::with_client(client, None)
            }
        }
    }

    fn with_client(client: Client, claim: Option<&Path>) -> Result<Self> {
        let implicit = claim.map(ImplicitSlot::open).transpose()?.map(Arc::new);

        let (events_tx, events) = mpsc::channel();
        let helper_tx = events_tx.clone();
        let helper = client
            .clone()
            .into_helper_thread(move |token| {
                let _ = helper_tx.send(Event::Token(token));
            })
            .context("failed to create helper thread for job tokens")?;

        Ok(Self {
            client,
            helper,
            events,
            events_tx,
            implicit,
            spare: Vec::new(),
            requested: 0,
            running: Vec::new(),
        })
    }

    /// Handle for passing the pool on to recipe processes.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Wait for a token, then run `job` on its own thread.
    ///
    /// `job` returns the job's exit status.
    pub fn start_job<F>(&mut self, target: &str, job: F) -> Result<()>
    where
        F: FnOnce() -> i32 + Send + 'static,
    {
        let token = self.acquire()?;
        let guard = FinishGuard {
            token: Some(token),
            events: self.events_tx.clone(),
        };
        let handle = thread::Builder::new()
            .name(format!("job {target}"))
            .spawn(move || {
                let _guard = guard;
                job()
            })
            .with_context(|| format!("failed to start job for {target}"))?;
        self.running.push((target.to_string(), handle));
        Ok(())
    }

    /// Block until every started job has finished.
    ///
    /// Returns `(target, status)` in start order. A job that panicked reports
    /// status 1. No more jobs start after this, so tokens that are idle or
    /// still arriving go straight back to the pool.
    pub fn wait_all(&mut self) -> Vec<(String, i32)> {
        self.return_spare_tokens();
        while self.running.iter().any(|(_, handle)| !handle.is_finished()) {
            match self.events.recv_timeout(CLAIM_POLL) {
                Ok(Event::Token(token)) => {
                    self.requested = self.requested.saturating_sub(1);
                    drop(token);
                }
                Ok(Event::Finished) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        let results = self
            .running
            .drain(..)
            .map(|(target, handle)| (target, handle.join().unwrap_or(1)))
            .collect();
        self.return_spare_tokens();
        results
    }

    /// Give every pool token this process is not using back to the pool.
    ///
    /// Call before exiting early: `process::exit` skips destructors, and a
    /// token that is never written back is lost to the whole tree. Also call
    /// while blocked on something other than a token.
    pub fn force_return_tokens(&mut self) {
        self.return_spare_tokens();
    }

    fn return_spare_tokens(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            if let Event::Token(token) = event {
                self.requested = self.requested.saturating_sub(1);
                drop(token);
            }
        }
        if !self.spare.is_empty() {
            ddprintln!("returning {} spare token(s)", self.spare.len());
        }
        self.spare.clear();
    }

    fn acquire(&mut self) -> Result<Token> {
        loop {
            if let Some(token) = self.spare.pop() {
                return Ok(Token::Pool(token));
            }
            if let Some(slot) = &self.implicit {
                if slot.try_claim()? {
                    return Ok(Token::Implicit(Arc::clone(slot)));
                }
            }
            if self.requested == 0 {
                self.helper.request_token();
                self.requested += 1;
            }
            let event = if self.implicit.is_some() {
                match self.events.recv_timeout(CLAIM_POLL) {
                    Ok(event) => event,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => {
                        bail!("job token channel closed unexpectedly")
                    }
                }
            } else {
                match self.events.recv() {
                    Ok(event) => event,
                    Err(_) => bail!("job token channel closed unexpectedly"),
                }
            };
            match event {
                Event::Token(token) => {
                    self.requested = self.requested.saturating_sub(1);
                    self.spare
                        .push(token.context("failed to acquire job token")?);
                }
                // Loop around: the finished job may have freed the implicit token.
                Event::Finished => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// A job that records how many jobs were running alongside it.
    fn counting_job(active: Arc<AtomicUsize>, peak: Arc<AtomicUsize>) -> impl FnOnce() -> i32 {
        move || {
            let now = active.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(30));
            active.fetch_sub(1, Ordering::SeqCst);
            0
        }
    }

    #[test]
    fn concurrency_never_exceeds_pool_size() {
        let mut jobs = JobServer::setup(2, None).unwrap();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        for i in 0..8 {
            jobs.start_job(&format!("t{i}"), counting_job(Arc::clone(&active), Arc::clone(&peak)))
                .unwrap();
        }

        let results = jobs.wait_all();
        assert_eq!(results.len(), 8);
        assert!(results.iter().all(|(_, status)| *status == 0));
        let peak = peak.load(Ordering::SeqCst);
        assert!((1..=2).contains(&peak), "peak concurrency was {peak}");
    }

    #[test]
    fn statuses_are_reported_in_start_order() {
        let mut jobs = JobServer::setup(3, None).unwrap();
        jobs.start_job("ok", || 0).unwrap();
        jobs.start_job("fails", || 1).unwrap();
        jobs.start_job("locked", || 199).unwrap();
        assert_eq!(
            jobs.wait_all(),
            vec![
                ("ok".to_string(), 0),
                ("fails".to_string(), 1),
                ("locked".to_string(), 199),
            ]
        );
    }

    #[test]
    fn panicking_job_fails_and_returns_its_token() {
        let mut jobs = JobServer::setup(1, None).unwrap();
        jobs.start_job("boom", || panic!("recipe exploded")).unwrap();
        jobs.start_job("after", || 0).unwrap();
        let results = jobs.wait_all();
        assert_eq!(results[0], ("boom".to_string(), 1));
        assert_eq!(results[1], ("after".to_string(), 0));
    }

    #[test]
    fn tokens_are_reusable_after_wait_all() {
        let mut jobs = JobServer::setup(1, None).unwrap();
        for round in 0..3 {
            jobs.start_job(&format!("r{round}a"), || 0).unwrap();
            jobs.start_job(&format!("r{round}b"), || 0).unwrap();
            assert_eq!(jobs.wait_all().len(), 2);
        }
        jobs.force_return_tokens();
    }

    #[test]
    fn siblings_share_one_implicit_token() {
        let dir = tempfile::tempdir().unwrap();
        let claim = dir.path().join("claim");
        let pool = Client::new(1).unwrap();
        // The calling recipe's token: the pool itself is empty.
        let _held = pool.acquire().unwrap();

        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let siblings: Vec<_> = (0..3)
            .map(|i| {
                let mut jobs = JobServer::with_client(pool.clone(), Some(&claim)).unwrap();
                let job = counting_job(Arc::clone(&active), Arc::clone(&peak));
                thread::spawn(move || {
                    jobs.start_job(&format!("s{i}"), job).unwrap();
                    jobs.wait_all()
                })
            })
            .collect();

        for sibling in siblings {
            assert_eq!(sibling.join().unwrap().len(), 1);
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn late_pool_token_is_not_kept_idle() {
        let dir = tempfile::tempdir().unwrap();
        let claim = dir.path().join("claim");
        let pool = Client::new(1).unwrap();
        let held = pool.acquire().unwrap();

        let mut jobs = JobServer::with_client(pool.clone(), Some(&claim)).unwrap();
        let other = JobServer::with_client(pool.clone(), Some(&claim)).unwrap();
        // A sibling holds the implicit token, so starting a job requests a
        // pool token, then settles for the implicit one once it is let go.
        let sibling = other.implicit.clone().unwrap();
        assert!(sibling.try_claim().unwrap());
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            sibling.release();
        });

        // The job runs until some other process gets hold of the pool token.
        let handed_on = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&handed_on);
        jobs.start_job("first", move || {
            for _ in 0..100 {
                if seen.load(Ordering::SeqCst) {
                    return 0;
                }
                thread::sleep(Duration::from_millis(20));
            }
            1
        })
        .unwrap();
        releaser.join().unwrap();

        // The requested pool token arrives while nothing is waiting for it.
        drop(held);
        thread::sleep(Duration::from_millis(50));
        let other_process = {
            let pool = pool.clone();
            thread::spawn(move || {
                let token = pool.acquire().unwrap();
                handed_on.store(true, Ordering::SeqCst);
                drop(token);
            })
        };
        assert_eq!(jobs.wait_all(), vec![("first".to_string(), 0)]);
        other_process.join().unwrap();
    }
}
