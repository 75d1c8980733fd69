//! Content precache
//!
//! Each (user, kind) pair has a queue of single-use generated items. A fetch
//! claims the oldest unused item and asks the background workers for a
//! replacement; when the queue is empty the item is generated on the spot.
//! Background jobs only ever add rows, so a slow or failed job just means the
//! next fetch generates synchronously again.

use crate::db::{Database, Result};
use crate::generator::{ContentGenerator, ContentKind, ContentPayload, OfflineGenerator};
use chrono::Utc;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of threads draining a shared job channel
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let (tx, rx) = mpsc::channel::<Job>();
        let rx = Arc::new(Mutex::new(rx));
        let mut workers = Vec::with_capacity(size);

        for i in 0..size {
            let rx = Arc::clone(&rx);
            let spawned = thread::Builder::new()
                .name(format!("pecunia-precache-{}", i))
                .spawn(move || loop {
                    let next = match rx.lock() {
                        Ok(guard) => guard.recv(),
                        Err(_) => break,
                    };
                    match next {
                        Ok(job) => {
                            if catch_unwind(AssertUnwindSafe(job)).is_err() {
                                warn!("precache job panicked");
                            }
                        }
                        Err(_) => break,
                    }
                });
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => warn!(error = %e, "could not start precache worker"),
            }
        }

        WorkerPool {
            sender: Mutex::new(Some(tx)),
            workers,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue a job. Never blocks; returns false once the pool is shut down.
    pub fn submit(&self, job: Job) -> bool {
        let Ok(guard) = self.sender.lock() else {
            return false;
        };
        match guard.as_ref() {
            Some(tx) => tx.send(job).is_ok(),
            None => false,
        }
    }

    /// Stop accepting jobs, let queued ones finish and join the workers
    pub fn shutdown(&mut self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                warn!("precache worker exited abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Where a fetched item came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Cache,
    Generated,
    Fallback,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Fetched {
    pub payload: ContentPayload,
    pub source: Source,
}

pub struct ContentPrecacheManager {
    db: Database,
    generator: Arc<dyn ContentGenerator>,
    fallback: OfflineGenerator,
    pool: Option<WorkerPool>,
}

impl ContentPrecacheManager {
    /// `workers == 0` disables background generation
    pub fn new(db: Database, generator: Arc<dyn ContentGenerator>, workers: usize) -> Self {
        let pool = (workers > 0).then(|| WorkerPool::new(workers));
        if let Some(pool) = &pool {
            debug!(workers = pool.size(), "precache workers started");
        }
        ContentPrecacheManager {
            db,
            generator,
            fallback: OfflineGenerator::new(),
            pool,
        }
    }

    /// Claim the oldest cached item or generate one now.
    ///
    /// Either way a replacement is queued for background generation.
    /// Generation failures are absorbed by the offline fallback; only store
    /// errors are returned.
    pub fn fetch_or_generate(&self, user_id: i32, kind: ContentKind) -> Result<Fetched> {
        let fetched = match self.take_cached(user_id, kind)? {
            Some(payload) => {
                info!(user_id, kind = %kind, "precache hit");
                Fetched {
                    payload,
                    source: Source::Cache,
                }
            }
            None => {
                info!(user_id, kind = %kind, "precache miss, generating synchronously");
                self.generate_now(kind)
            }
        };
        self.schedule(user_id, kind);
        Ok(fetched)
    }

    /// Skips (and consumes) items whose stored payload no longer decodes
    fn take_cached(&self, user_id: i32, kind: ContentKind) -> Result<Option<ContentPayload>> {
        while let Some(item) = self.db.take_precached(user_id, kind.as_str(), Utc::now())? {
            match serde_json::from_str::<ContentPayload>(&item.payload_json) {
                Ok(payload) if payload.kind() == kind => return Ok(Some(payload)),
                Ok(_) => warn!(item_id = item.id, "precached item has the wrong kind"),
                Err(e) => warn!(item_id = item.id, error = %e, "discarding undecodable precached item"),
            }
        }
        Ok(None)
    }

    fn generate_now(&self, kind: ContentKind) -> Fetched {
        match self.generator.generate(kind).and_then(|p| p.validate().map(|_| p)) {
            Ok(payload) => Fetched {
                payload,
                source: Source::Generated,
            },
            Err(e) => {
                warn!(kind = %kind, error = %e, "generation failed, using offline content");
                Fetched {
                    payload: self.fallback.produce(kind),
                    source: Source::Fallback,
                }
            }
        }
    }

    /// Queue one background generation for (user, kind)
    pub fn schedule(&self, user_id: i32, kind: ContentKind) {
        let Some(pool) = &self.pool else {
            return;
        };
        let db = self.db.clone();
        let generator = Arc::clone(&self.generator);

        let queued = pool.submit(Box::new(move || {
            if let Err(e) = generate_and_store(&db, generator.as_ref(), user_id, kind) {
                warn!(user_id, kind = %kind, error = %e, "background generation dropped");
            }
        }));
        if !queued {
            debug!(user_id, kind = %kind, "precache pool closed, nothing scheduled");
        }
    }

    /// Items waiting for (user, kind)
    pub fn pending(&self, user_id: i32, kind: ContentKind) -> Result<i64> {
        self.db.count_unused_precached(user_id, kind.as_str())
    }

    /// Wait for queued background work to finish
    pub fn shutdown(mut self) {
        if let Some(mut pool) = self.pool.take() {
            pool.shutdown();
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum BackgroundError {
    #[error(transparent)]
    Generation(#[from] crate::generator::GenerationError),
    #[error(transparent)]
    Store(#[from] crate::db::DbError),
    #[error("encode: {0}")]
    Encode(#[from] serde_json::Error),
}

fn generate_and_store(
    db: &Database,
    generator: &dyn ContentGenerator,
    user_id: i32,
    kind: ContentKind,
) -> std::result::Result<(), BackgroundError> {
    let payload = generator.generate(kind)?;
    payload.validate()?;
    let json = serde_json::to_string(&payload)?;
    let id = db.insert_precached(user_id, kind.as_str(), &json, Utc::now())?;
    debug!(user_id, kind = %kind, item_id = id, "precached item stored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{GenerationError, Phrase};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    struct Failing;

    impl ContentGenerator for Failing {
        fn generate(&self, _kind: ContentKind) -> std::result::Result<ContentPayload, GenerationError> {
            Err(GenerationError::Transport("connection refused".into()))
        }
    }

    struct Slow(Duration);

    impl ContentGenerator for Slow {
        fn generate(&self, _kind: ContentKind) -> std::result::Result<ContentPayload, GenerationError> {
            thread::sleep(self.0);
            Ok(ContentPayload::Phrase(Phrase {
                sentence: "Liquidity is how fast an asset turns into cash".into(),
                keyword: "Liquidity".into(),
            }))
        }
    }

    struct Numbered(AtomicUsize);

    impl ContentGenerator for Numbered {
        fn generate(&self, _kind: ContentKind) -> std::result::Result<ContentPayload, GenerationError> {
            let n = self.0.fetch_add(1, Ordering::SeqCst);
            Ok(ContentPayload::Phrase(Phrase {
                sentence: format!("Term{} is a finance word", n),
                keyword: format!("Term{}", n),
            }))
        }
    }

    fn setup() -> (TempDir, Database, i32) {
        let dir = TempDir::new().unwrap();
        let db = Database::open_at(dir.path().join("precache.db")).unwrap();
        let user = db.create_user("ana@example.com", "Ana").unwrap();
        (dir, db, user)
    }

    #[test]
    fn test_pool_runs_queued_jobs_before_shutdown() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new(2);
        assert_eq!(pool.size(), 2);
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            assert!(pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })));
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
        assert!(!pool.submit(Box::new(|| {})));
    }

    #[test]
    fn test_pool_survives_panicking_job() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerPool::new(1);
        pool.submit(Box::new(|| panic!("boom")));
        let c = Arc::clone(&counter);
        pool.submit(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }));
        pool.shutdown();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_cache_falls_back_without_error() {
        let (_dir, db, user) = setup();
        let manager = ContentPrecacheManager::new(db, Arc::new(Failing), 0);
        let fetched = manager.fetch_or_generate(user, ContentKind::Phrase).unwrap();
        assert_eq!(fetched.source, Source::Fallback);
        fetched.payload.validate().unwrap();
    }

    #[test]
    fn test_background_fills_queue_for_next_fetch() {
        let (_dir, db, user) = setup();
        let manager = ContentPrecacheManager::new(db.clone(), Arc::new(Numbered(AtomicUsize::new(0))), 1);

        let first = manager.fetch_or_generate(user, ContentKind::Phrase).unwrap();
        assert_eq!(first.source, Source::Generated);
        manager.shutdown();
        assert_eq!(db.count_unused_precached(user, "phrase").unwrap(), 1);

        let manager = ContentPrecacheManager::new(db.clone(), Arc::new(Numbered(AtomicUsize::new(100))), 0);
        let second = manager.fetch_or_generate(user, ContentKind::Phrase).unwrap();
        assert_eq!(second.source, Source::Cache);
        assert_ne!(first.payload, second.payload);
        assert_eq!(manager.pending(user, ContentKind::Phrase).unwrap(), 0);
    }

    #[test]
    fn test_cache_hit_returns_before_refill_finishes() {
        let (_dir, db, user) = setup();
        let cached = ContentPayload::Phrase(Phrase {
            sentence: "Inflation erodes the value of savings".into(),
            keyword: "Inflation".into(),
        });
        db.insert_precached(user, "phrase", &serde_json::to_string(&cached).unwrap(), Utc::now())
            .unwrap();
        let manager = ContentPrecacheManager::new(db.clone(), Arc::new(Slow(Duration::from_millis(1500))), 1);

        let started = Instant::now();
        let fetched = manager.fetch_or_generate(user, ContentKind::Phrase).unwrap();
        let waited = started.elapsed();
        assert_eq!(fetched.source, Source::Cache);
        assert_eq!(fetched.payload, cached);
        assert!(waited < Duration::from_millis(1000), "fetch blocked for {:?}", waited);
        // replacement still being generated
        assert_eq!(db.count_unused_precached(user, "phrase").unwrap(), 0);

        manager.shutdown();
        assert!(started.elapsed() >= Duration::from_millis(1500));
        assert_eq!(db.count_unused_precached(user, "phrase").unwrap(), 1);
    }

    #[test]
    fn test_undecodable_items_are_skipped() {
        let (_dir, db, user) = setup();
        db.insert_precached(user, "phrase", "{broken", Utc::now()).unwrap();
        let manager = ContentPrecacheManager::new(db.clone(), Arc::new(Numbered(AtomicUsize::new(0))), 0);
        let fetched = manager.fetch_or_generate(user, ContentKind::Phrase).unwrap();
        assert_eq!(fetched.source, Source::Generated);
        assert_eq!(db.count_unused_precached(user, "phrase").unwrap(), 0);
    }
}
