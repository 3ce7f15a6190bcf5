//! contend command - Concurrent units fighting over one resource

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};
use serde::Serialize;

use crate::backend::{SharedTableBackend, StatsSnapshot};
use crate::cli::Context;
use crate::core::config::LockConfig;
use crate::core::errors::LockError;
use crate::core::level::LockLevel;
use crate::manager::{current_manager, LockContext, LockDefaults};

/// Resource every unit competes for.
const RESOURCE: &str = "contend";

/// Parameters of a contention run.
#[derive(Debug, Clone)]
pub struct ContendOptions {
    pub workers: usize,
    pub iterations: usize,
    pub level: LockLevel,
    pub hold: Duration,
    pub wait: Duration,
    pub work: Duration,
}

/// Outcome of a contention run.
#[derive(Debug, Clone, Serialize)]
pub struct ContentionReport {
    pub workers: usize,
    pub iterations: usize,
    pub level: String,
    pub acquired: usize,
    pub timed_out: usize,
    /// Largest number of units seen inside the critical section at once.
    pub peak_holders: usize,
    pub elapsed_ms: u64,
    pub stats: StatsSnapshot,
}

/// Run the contention benchmark and print its report.
pub fn contend(ctx: &Context, opts: &ContendOptions, json: bool) -> Result<()> {
    if ctx.debug {
        eprintln!(
            "[debug] contend: {} workers x {} iterations at {}",
            opts.workers, opts.iterations, opts.level
        );
    }

    let rt = tokio::runtime::Runtime::new()?;
    let report = rt.block_on(run_contention(&ctx.config, opts))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!(
        "{} workers x {} iterations at {}",
        report.workers, report.iterations, report.level
    );
    println!("  acquired:      {}", report.acquired);
    println!("  timed out:     {}", report.timed_out);
    println!("  peak holders:  {}", report.peak_holders);
    println!("  elapsed:       {}ms", report.elapsed_ms);
    println!(
        "  backend:       {} granted, {} contended, {} lost races, {} expired swept",
        report.stats.granted,
        report.stats.contended,
        report.stats.lost_races,
        report.stats.expired_swept
    );
    Ok(())
}

/// Spawn `opts.workers` execution units that each acquire one shared
/// resource `opts.iterations` times through a fresh shared-table backend.
///
/// # Errors
///
/// Returns an error for invalid configuration, a failed task, or any lock
/// error other than a timeout.
pub async fn run_contention(config: &LockConfig, opts: &ContendOptions) -> Result<ContentionReport> {
    let backend = Arc::new(SharedTableBackend::from_config(config).context("Invalid config")?);
    let context = LockContext::new(
        backend.clone(),
        LockDefaults {
            hold: opts.hold,
            wait: opts.wait,
        },
    );

    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let started = Instant::now();

    let handles: Vec<_> = (0..opts.workers)
        .map(|_| {
            let active = Arc::clone(&active);
            let peak = Arc::clone(&peak);
            let (iterations, level, work) = (opts.iterations, opts.level, opts.work);
            context.spawn(async move {
                let manager = current_manager()?;
                let (mut acquired, mut timed_out) = (0, 0);
                for _ in 0..iterations {
                    match manager.acquire_lock(RESOURCE, level).await {
                        Ok(guard) => {
                            let inside = active.fetch_add(1, Ordering::SeqCst) + 1;
                            peak.fetch_max(inside, Ordering::SeqCst);
                            tokio::time::sleep(work).await;
                            active.fetch_sub(1, Ordering::SeqCst);
                            guard.release().await?;
                            acquired += 1;
                        }
                        Err(e) if e.is_timeout() => timed_out += 1,
                        Err(e) => return Err(e),
                    }
                }
                Ok::<_, LockError>((acquired, timed_out))
            })
        })
        .collect();

    let (mut acquired, mut timed_out) = (0, 0);
    for handle in handles {
        let (a, t) = handle.await.context("Worker task failed")??;
        acquired += a;
        timed_out += t;
    }

    Ok(ContentionReport {
        workers: opts.workers,
        iterations: opts.iterations,
        level: opts.level.to_string(),
        acquired,
        timed_out,
        peak_holders: peak.load(Ordering::SeqCst),
        elapsed_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        stats: backend.stats(),
    })
}
