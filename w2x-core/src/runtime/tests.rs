use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::config::{QueueStrategy, SharedConfig};
use crate::error::CoreError;
use crate::runtime::{Scheduler, SchedulerStats};

fn config(concurrency: usize, strategy: QueueStrategy) -> Arc<SharedConfig> {
    let config = SharedConfig::default();
    config.update(|s| {
        s.scheduler.concurrency = concurrency;
        s.scheduler.strategy = strategy;
    });
    Arc::new(config)
}

/// Poll until the scheduler has neither pending nor active jobs.
async fn wait_idle(scheduler: &Scheduler) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while scheduler.stats() != SchedulerStats::default() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("scheduler did not drain");
}

/// Adds a job that holds its slot until `gate` gets a permit.
fn add_blocker(scheduler: &Scheduler, gate: &Arc<Semaphore>) {
    let gate = Arc::clone(gate);
    scheduler.add("blocker", async move {
        let _permit = gate.acquire().await.expect("gate open");
        Ok(())
    });
}

fn add_recorder(scheduler: &Scheduler, order: &Arc<Mutex<Vec<u32>>>, n: u32) {
    let order = Arc::clone(order);
    scheduler.add(format!("job-{n}"), async move {
        order.lock().unwrap().push(n);
        Ok(())
    });
}

// ── Ordering ──────────────────────────────────────────────────────────────────

#[tokio::test]
async fn fifo_runs_in_submission_order() {
    let scheduler = Scheduler::new(config(1, QueueStrategy::Fifo));
    let gate = Arc::new(Semaphore::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    add_blocker(&scheduler, &gate);
    for n in 1..=4 {
        add_recorder(&scheduler, &order, n);
    }
    assert_eq!(scheduler.stats(), SchedulerStats { pending: 4, active: 1 });

    gate.add_permits(1);
    wait_idle(&scheduler).await;
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn lifo_runs_latest_waiting_job_first() {
    let scheduler = Scheduler::new(config(1, QueueStrategy::Lifo));
    let gate = Arc::new(Semaphore::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    add_blocker(&scheduler, &gate);
    for n in 1..=4 {
        add_recorder(&scheduler, &order, n);
    }

    gate.add_permits(1);
    wait_idle(&scheduler).await;
    assert_eq!(*order.lock().unwrap(), vec![4, 3, 2, 1]);
}

#[tokio::test]
async fn lifo_does_not_preempt_started_jobs() {
    let scheduler = Scheduler::new(config(1, QueueStrategy::Lifo));
    let first_gate = Arc::new(Semaphore::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    // The first job starts immediately; later arrivals wait behind it.
    {
        let gate = Arc::clone(&first_gate);
        let order = Arc::clone(&order);
        scheduler.add("first", async move {
            let _permit = gate.acquire().await.expect("gate open");
            order.lock().unwrap().push(0);
            Ok(())
        });
    }
    add_recorder(&scheduler, &order, 1);
    add_recorder(&scheduler, &order, 2);

    first_gate.add_permits(1);
    wait_idle(&scheduler).await;
    assert_eq!(*order.lock().unwrap(), vec![0, 2, 1]);
}

// ── Concurrency ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn never_exceeds_concurrency_limit() {
    let scheduler = Scheduler::new(config(2, QueueStrategy::Fifo));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    for n in 0..6 {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        scheduler.add(format!("job-{n}"), async move {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            running.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        });
    }
    assert_eq!(scheduler.stats(), SchedulerStats { pending: 4, active: 2 });

    wait_idle(&scheduler).await;
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn raised_concurrency_applies_on_next_add() {
    let config = config(1, QueueStrategy::Fifo);
    let scheduler = Scheduler::new(config.clone());
    let gate = Arc::new(Semaphore::new(0));

    for _ in 0..3 {
        add_blocker(&scheduler, &gate);
    }
    assert_eq!(scheduler.stats(), SchedulerStats { pending: 2, active: 1 });

    config.update(|s| s.scheduler.concurrency = 3);
    add_blocker(&scheduler, &gate);
    assert_eq!(scheduler.concurrency(), 3);
    assert_eq!(scheduler.stats(), SchedulerStats { pending: 1, active: 3 });

    gate.add_permits(4);
    wait_idle(&scheduler).await;
}

#[tokio::test]
async fn refresh_dispatches_newly_allowed_jobs() {
    let config = config(1, QueueStrategy::Fifo);
    let scheduler = Scheduler::new(config.clone());
    let gate = Arc::new(Semaphore::new(0));

    for _ in 0..3 {
        add_blocker(&scheduler, &gate);
    }
    config.update(|s| s.scheduler.concurrency = 2);
    scheduler.refresh();
    assert_eq!(scheduler.stats(), SchedulerStats { pending: 1, active: 2 });

    gate.add_permits(3);
    wait_idle(&scheduler).await;
}

#[tokio::test]
async fn lowered_concurrency_holds_back_dispatch() {
    let config = config(2, QueueStrategy::Fifo);
    let scheduler = Scheduler::new(config.clone());
    let gate = Arc::new(Semaphore::new(0));

    add_blocker(&scheduler, &gate);
    add_blocker(&scheduler, &gate);
    config.update(|s| s.scheduler.concurrency = 1);
    add_blocker(&scheduler, &gate);

    // Running jobs keep their slots; the new one waits.
    assert_eq!(scheduler.stats(), SchedulerStats { pending: 1, active: 2 });

    gate.add_permits(3);
    wait_idle(&scheduler).await;
}

// ── Failure isolation ─────────────────────────────────────────────────────────

async fn explode() -> Result<(), CoreError> {
    panic!("job exploded")
}

#[tokio::test]
async fn failing_and_panicking_jobs_do_not_block_the_queue() {
    let scheduler = Scheduler::new(config(1, QueueStrategy::Fifo));
    let ran = Arc::new(AtomicUsize::new(0));

    scheduler.add("fails", async { Err(CoreError::Validation("boom".into())) });
    scheduler.add("panics", explode());
    {
        let ran = Arc::clone(&ran);
        scheduler.add("succeeds", async move {
            ran.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
    }

    wait_idle(&scheduler).await;
    assert_eq!(ran.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.stats(), SchedulerStats::default());
}

#[tokio::test]
async fn stats_account_for_every_job_exactly_once() {
    let scheduler = Scheduler::new(config(3, QueueStrategy::Lifo));
    let gate = Arc::new(Semaphore::new(0));

    for added in 1..=7 {
        add_blocker(&scheduler, &gate);
        let stats = scheduler.stats();
        assert_eq!(stats.total(), added);
        assert!(stats.active <= 3);
    }

    gate.add_permits(7);
    wait_idle(&scheduler).await;
}
