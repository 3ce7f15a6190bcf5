//! Integration tests for the lock manager over the shared-table backend.
//!
//! These tests exercise the public API end to end: several execution units,
//! each with its own manager, sharing one table.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use rand::Rng;

use stacklock::backend::{Backend, SharedTable, SharedTableBackend};
use stacklock::core::errors::{LockError, UnavailableReason};
use stacklock::core::level::LockLevel;
use stacklock::core::owner::OwnerId;
use stacklock::manager::{current_manager, LockContext, LockDefaults, LockManager};

// =============================================================================
// Test Fixtures
// =============================================================================

const HOLD: Duration = Duration::from_secs(30);
const WAIT_STEP: Duration = Duration::from_millis(1);

/// One shared table plus a way to hand out units attached to it.
struct Fixture {
    backend: Arc<SharedTableBackend>,
}

impl Fixture {
    fn new() -> Self {
        Self::with_capacity(64, 1024)
    }

    fn with_capacity(capacity: usize, row_size: usize) -> Self {
        let backend = SharedTableBackend::new(capacity, row_size).with_wait_step(WAIT_STEP);
        Self {
            backend: Arc::new(backend),
        }
    }

    /// A fresh execution unit with the given wait budget.
    fn unit(&self, wait: Duration) -> Arc<LockManager> {
        LockManager::new(self.backend.clone(), LockDefaults { hold: HOLD, wait })
    }

    fn table(&self) -> &Arc<SharedTable> {
        self.backend.table()
    }

    fn stored_level(&self, resource: &str, owner: OwnerId) -> Option<LockLevel> {
        self.backend
            .holders(resource)
            .expect("decodable record")
            .iter()
            .find(|h| h.owner == owner)
            .map(|h| h.level)
    }
}

// =============================================================================
// Round trip, reentrancy, escalation
// =============================================================================

#[tokio::test]
async fn acquire_release_leaves_no_record() {
    let fx = Fixture::new();
    let unit = fx.unit(Duration::from_millis(50));

    for level in LockLevel::ALL {
        let guard = unit.acquire_lock("orders", level).await.unwrap();
        assert!(fx.table().contains_key("orders"));
        guard.release().await.unwrap();
        assert!(!fx.table().contains_key("orders"), "record left after {}", level);
    }
}

#[tokio::test]
async fn read_then_nested_write_restores_read() {
    let fx = Fixture::new();
    let unit = fx.unit(Duration::from_millis(50));
    let owner = unit.owner();

    let outer = unit.acquire_lock("orders", LockLevel::READ).await.unwrap();
    let inner = unit.acquire_lock("orders", LockLevel::WRITE).await.unwrap();
    assert_eq!(unit.effective_level("orders"), Some(LockLevel::WRITE));
    assert_eq!(fx.stored_level("orders", owner), Some(LockLevel::WRITE));

    inner.release().await.unwrap();
    assert_eq!(unit.effective_level("orders"), Some(LockLevel::READ));
    assert_eq!(fx.stored_level("orders", owner), Some(LockLevel::READ));

    outer.release().await.unwrap();
    assert!(!fx.table().contains_key("orders"));
}

/// Regression: escalation goes towards more exclusive levels, never fewer,
/// and a deeper stack keeps every enclosing frame's guarantee.
#[tokio::test]
async fn escalation_direction_is_towards_exclusive() {
    let fx = Fixture::new();
    let unit = fx.unit(Duration::from_millis(50));

    let _a = unit.acquire_lock("r", LockLevel::WRITE).await.unwrap();
    let b = unit.acquire_lock("r", LockLevel::ConcurrentRead).await.unwrap();
    assert_eq!(unit.effective_level("r"), Some(LockLevel::WRITE));

    let c = unit.acquire_lock("r", LockLevel::Exclusive).await.unwrap();
    assert_eq!(unit.effective_level("r"), Some(LockLevel::Exclusive));
    assert_eq!(
        unit.requested_levels("r"),
        vec![LockLevel::WRITE, LockLevel::ConcurrentRead, LockLevel::Exclusive]
    );

    c.release().await.unwrap();
    assert_eq!(unit.effective_level("r"), Some(LockLevel::WRITE));
    assert_eq!(fx.stored_level("r", unit.owner()), Some(LockLevel::WRITE));

    b.release().await.unwrap();
    assert_eq!(unit.effective_level("r"), Some(LockLevel::WRITE));
}

#[tokio::test]
async fn out_of_order_release_is_logic_error() {
    let fx = Fixture::new();
    let unit = fx.unit(Duration::from_millis(50));

    let err = unit.release_lock("never-acquired").await.unwrap_err();
    assert!(matches!(err, LockError::Logic(_)));

    let guard = unit.acquire_lock("r", LockLevel::READ).await.unwrap();
    unit.release_lock("r").await.unwrap();
    // The guard's own release now has nothing to pop; it only logs.
    drop(guard);
    assert_eq!(unit.depth("r"), 0);
}

// =============================================================================
// Expiry, self-reacquire, timeout
// =============================================================================

#[tokio::test]
async fn expired_holder_does_not_block() {
    let fx = Fixture::new();
    let crashed = fx.unit(Duration::from_millis(50));
    let next = fx.unit(Duration::from_millis(50));

    let stale = crashed
        .acquire_unscoped("r", LockLevel::Exclusive, Duration::ZERO, Duration::from_millis(50))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(2)).await;

    let started = Instant::now();
    let guard = next.acquire_lock("r", LockLevel::Exclusive).await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(50));
    assert_eq!(fx.backend.holders("r").unwrap().len(), 1);

    guard.release().await.unwrap();
    assert!(stale.is_acquired());
    assert!(!stale.is_valid());
}

#[tokio::test]
async fn reacquire_never_waits_on_self() {
    let fx = Fixture::new();
    let unit = fx.unit(Duration::ZERO);

    let _outer = unit.acquire_lock("r", LockLevel::Exclusive).await.unwrap();
    // A zero wait budget allows a single attempt; it must succeed.
    let _inner = unit.acquire_lock("r", LockLevel::Exclusive).await.unwrap();
    assert_eq!(unit.depth("r"), 2);
    assert_eq!(fx.backend.holders("r").unwrap().len(), 1);
}

#[tokio::test]
async fn timeout_respects_wait_budget() {
    let fx = Fixture::new();
    let holder = fx.unit(Duration::from_millis(50));
    let waiter = fx.unit(Duration::from_millis(50));

    let _held = holder.acquire_lock("r", LockLevel::WRITE).await.unwrap();
    let before = fx.table().get("r");

    let wait = Duration::from_micros(5000);
    let started = Instant::now();
    let err = waiter
        .acquire_lock_with("r", LockLevel::WRITE, HOLD, wait)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    match err {
        LockError::Unavailable {
            reason: UnavailableReason::Timeout { waited },
            ..
        } => assert!(waited >= wait),
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(elapsed >= wait, "gave up early after {:?}", elapsed);
    // Scheduler slack on top of the final wait step.
    assert!(elapsed < wait + WAIT_STEP + Duration::from_millis(50));
    assert_eq!(fx.table().get("r"), before, "failed attempt left a trace");
    assert_eq!(waiter.depth("r"), 0);
}

// =============================================================================
// Corruption and capacity
// =============================================================================

#[tokio::test]
async fn corrupted_record_fails_once_and_heals() {
    let fx = Fixture::new();
    let unit = fx.unit(Duration::from_secs(1));
    fx.table().set("r", b"\xde\xad\xbe\xef").unwrap();

    let err = unit.acquire_lock("r", LockLevel::READ).await.unwrap_err();
    assert!(matches!(
        err,
        LockError::Unavailable {
            reason: UnavailableReason::CorruptedRecord,
            ..
        }
    ));
    assert!(err.is_transient());
    assert_eq!(fx.backend.stats().corrupted, 1);
    assert!(!fx.table().contains_key("r"));

    let guard = unit.acquire_lock("r", LockLevel::READ).await.unwrap();
    guard.release().await.unwrap();
    assert_eq!(fx.backend.stats().corrupted, 1);
}

#[tokio::test]
async fn full_table_is_resource_exhausted() {
    let fx = Fixture::with_capacity(2, 1024);
    let unit = fx.unit(Duration::from_millis(50));

    let _a = unit.acquire_lock("a", LockLevel::READ).await.unwrap();
    let _b = unit.acquire_lock("b", LockLevel::READ).await.unwrap();
    let snapshot = (fx.table().get("a"), fx.table().get("b"));

    let err = unit.acquire_lock("c", LockLevel::READ).await.unwrap_err();
    assert_eq!(err, LockError::ResourceExhausted { capacity: 2 });
    assert_eq!((fx.table().get("a"), fx.table().get("b")), snapshot);
    assert_eq!(unit.depth("c"), 0);
}

#[tokio::test]
async fn oversized_record_is_capacity_exceeded() {
    let fx = Fixture::with_capacity(4, 64);
    let first = fx.unit(Duration::from_millis(50));
    let second = fx.unit(Duration::from_millis(50));

    let _shared = first.acquire_lock("r", LockLevel::ConcurrentRead).await.unwrap();
    let err = second
        .acquire_lock("r", LockLevel::ConcurrentRead)
        .await
        .unwrap_err();
    assert!(matches!(err, LockError::CapacityExceeded { limit: 64, .. }));
    assert_eq!(fx.backend.holders("r").unwrap().len(), 1);
}

// =============================================================================
// Mutual exclusion under contention
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exclusive_contention_between_tasks() {
    const UNITS: usize = 8;
    const ROUNDS: usize = 5;

    let fx = Fixture::new();
    let context = LockContext::new(
        fx.backend.clone(),
        LockDefaults {
            hold: HOLD,
            wait: Duration::from_secs(20),
        },
    );
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..UNITS)
        .map(|_| {
            let (active, peak, done) = (active.clone(), peak.clone(), done.clone());
            context.spawn(async move {
                let manager = current_manager().expect("bound to unit");
                for _ in 0..ROUNDS {
                    let guard = manager
                        .acquire_lock("hot", LockLevel::Exclusive)
                        .await
                        .expect("acquire");
                    let inside = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(inside, Ordering::SeqCst);
                    let pause = rand::rng().random_range(0..500u64);
                    tokio::time::sleep(Duration::from_micros(pause)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    guard.release().await.expect("release");
                    done.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.await.expect("task");
    }

    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert_eq!(done.load(Ordering::SeqCst), UNITS * ROUNDS);
    assert!(fx.table().is_empty());
}

#[test]
fn exclusive_contention_between_threads() {
    const UNITS: usize = 6;
    const ROUNDS: usize = 5;

    let fx = Fixture::new();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = (0..UNITS)
        .map(|_| {
            let unit = fx.unit(Duration::from_secs(20));
            let (active, peak) = (active.clone(), peak.clone());
            thread::spawn(move || {
                for _ in 0..ROUNDS {
                    let guard = unit
                        .acquire_lock_blocking("hot", LockLevel::Exclusive)
                        .expect("acquire");
                    let inside = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(inside, Ordering::SeqCst);
                    thread::sleep(Duration::from_micros(rand::rng().random_range(0..300u64)));
                    active.fetch_sub(1, Ordering::SeqCst);
                    drop(guard);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("thread");
    }
    assert_eq!(peak.load(Ordering::SeqCst), 1);
    assert!(fx.table().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_share_writers_wait() {
    let fx = Fixture::new();
    let reader_a = fx.unit(Duration::from_millis(20));
    let reader_b = fx.unit(Duration::from_millis(20));
    let writer = fx.unit(Duration::from_millis(20));

    let a = reader_a.acquire_lock("doc", LockLevel::READ).await.unwrap();
    let b = reader_b.acquire_lock("doc", LockLevel::READ).await.unwrap();
    assert_eq!(fx.backend.holders("doc").unwrap().len(), 2);

    let err = writer.acquire_lock("doc", LockLevel::WRITE).await.unwrap_err();
    assert!(err.is_timeout());

    a.release().await.unwrap();
    b.release().await.unwrap();
    let w = writer.acquire_lock("doc", LockLevel::WRITE).await.unwrap();
    w.release().await.unwrap();
}

// =============================================================================
// execute_with_lock, release_all_own_locks, contexts
// =============================================================================

#[tokio::test]
async fn execute_with_lock_returns_work_output() {
    let fx = Fixture::new();
    let unit = fx.unit(Duration::from_millis(50));
    let table = fx.table().clone();

    let seen = unit
        .execute_with_lock(LockLevel::WRITE, || async move { table.len() })
        .await
        .unwrap();
    assert_eq!(seen, 1);
    assert!(fx.table().is_empty());
}

#[tokio::test]
async fn execute_with_lock_propagates_work_failure() {
    let fx = Fixture::new();
    let unit = fx.unit(Duration::from_millis(50));

    let outcome: Result<Result<(), String>, LockError> = unit
        .execute_with_lock_on("job", LockLevel::WRITE, || async { Err("boom".to_string()) })
        .await;
    assert_eq!(outcome.unwrap(), Err("boom".to_string()));
    assert!(fx.table().is_empty());
}

#[test]
fn execute_with_lock_releases_on_panic() {
    let fx = Fixture::new();
    let unit = fx.unit(Duration::from_millis(50));

    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        unit.execute_with_lock_blocking(LockLevel::Exclusive, || panic!("work failed"))
    }));
    assert!(result.is_err());
    assert!(fx.table().is_empty());
    assert!(unit.held_resources().is_empty());
}

#[test]
fn same_work_type_serializes_across_units() {
    fn job() -> usize {
        7
    }

    let fx = Fixture::new();
    let holder = fx.unit(Duration::from_millis(50));
    let other = fx.unit(Duration::from_millis(5));

    let resource = stacklock::manager::work_resource::<fn() -> usize>();
    let _held = holder
        .acquire_lock_blocking(&resource, LockLevel::Exclusive)
        .unwrap();

    let err = other
        .execute_with_lock_blocking(LockLevel::Exclusive, job as fn() -> usize)
        .unwrap_err();
    assert!(err.is_timeout());
}

#[tokio::test]
async fn release_all_own_locks_only_touches_own() {
    let fx = Fixture::new();
    let mine = fx.unit(Duration::from_millis(50));
    let theirs = fx.unit(Duration::from_millis(50));

    let _keep = theirs.acquire_lock("shared", LockLevel::READ).await.unwrap();
    let _a = mine.acquire_lock("shared", LockLevel::READ).await.unwrap();
    let _b = mine.acquire_lock("private", LockLevel::Exclusive).await.unwrap();

    assert_eq!(mine.release_all_own_locks(), 2);
    assert!(!fx.table().contains_key("private"));
    let holders = fx.backend.holders("shared").unwrap();
    assert_eq!(holders.len(), 1);
    assert_eq!(holders[0].owner, theirs.owner());
}

#[tokio::test]
async fn panicking_unit_releases_its_locks() {
    let fx = Fixture::new();
    let context = LockContext::new(
        fx.backend.clone(),
        LockDefaults {
            hold: HOLD,
            wait: Duration::from_millis(50),
        },
    );

    let handle = context.spawn(async {
        let manager = current_manager().expect("bound");
        let defaults = manager.defaults();
        let _lock = manager
            .acquire_unscoped("r", LockLevel::Exclusive, defaults.hold, defaults.wait)
            .await
            .expect("acquire");
        panic!("unit crashed");
    });
    assert!(handle.await.is_err());
    assert!(fx.table().is_empty());
}

#[test]
fn backends_attached_to_one_table_see_each_other() {
    let table = Arc::new(SharedTable::new(16, 1024));
    let left = SharedTableBackend::attach(table.clone());
    let right = SharedTableBackend::attach(table.clone());
    let (a, b) = (OwnerId::next(), OwnerId::next());

    left.acquire_lock_blocking(a, "r", LockLevel::WRITE, HOLD, Duration::ZERO)
        .unwrap();
    let err = right
        .acquire_lock_blocking(b, "r", LockLevel::WRITE, HOLD, Duration::from_millis(3))
        .unwrap_err();
    assert!(err.is_timeout());

    left.release_lock(a, "r").unwrap();
    right
        .acquire_lock_blocking(b, "r", LockLevel::WRITE, HOLD, Duration::ZERO)
        .unwrap();
}
