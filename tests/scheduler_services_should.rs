use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tvgate::server::services::scheduler_services::{Scheduler, TaskFn, task};

fn counting_task(counter: Arc<AtomicU32>) -> TaskFn {
    task(move || {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    })
}

#[tokio::test]
async fn test_double_registration_keeps_one_timer() {
    let scheduler = Scheduler::new();
    let counter = Arc::new(AtomicU32::new(0));

    assert!(scheduler.add("epg", Duration::from_millis(50), counting_task(counter.clone())));
    assert!(!scheduler.add("epg", Duration::from_millis(50), counting_task(counter.clone())));
    assert_eq!(scheduler.pending_count(), 1);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_one_shot_frees_its_id() {
    let scheduler = Scheduler::new();
    let counter = Arc::new(AtomicU32::new(0));

    scheduler.add("once", Duration::from_millis(10), counting_task(counter.clone()));
    assert!(scheduler.is_pending("once"));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(!scheduler.is_pending("once"));
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    // free again, so it can be added a second time
    assert!(scheduler.add("once", Duration::from_millis(10), counting_task(counter.clone())));
}

#[tokio::test]
async fn test_cancel_prevents_the_run() {
    let scheduler = Scheduler::new();
    let counter = Arc::new(AtomicU32::new(0));

    scheduler.add("cancel-me", Duration::from_millis(50), counting_task(counter.clone()));
    assert!(scheduler.cancel("cancel-me"));
    assert!(!scheduler.cancel("cancel-me"));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_stop_cancels_and_refuses_new_tasks() {
    let scheduler = Scheduler::new();
    let counter = Arc::new(AtomicU32::new(0));

    scheduler.add("a", Duration::from_millis(50), counting_task(counter.clone()));
    scheduler.add_recurring("b", Duration::from_millis(20), counting_task(counter.clone()));
    scheduler.stop();

    assert_eq!(scheduler.pending_count(), 0);
    assert!(!scheduler.add("c", Duration::ZERO, counting_task(counter.clone())));

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_task_can_schedule_itself_again() {
    let scheduler = Scheduler::new();
    let runs = Arc::new(AtomicU32::new(0));

    fn rearming(scheduler: Scheduler, runs: Arc<AtomicU32>) -> TaskFn {
        task(move || {
            let scheduler = scheduler.clone();
            let runs = runs.clone();
            async move {
                if runs.fetch_add(1, Ordering::SeqCst) < 2 {
                    let next = rearming(scheduler.clone(), runs.clone());
                    assert!(scheduler.add("daily", Duration::from_millis(10), next));
                }
                Ok(())
            }
        })
    }

    scheduler.add("daily", Duration::from_millis(10), rearming(scheduler.clone(), runs.clone()));

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(runs.load(Ordering::SeqCst), 3);
    assert!(!scheduler.is_pending("daily"));
}

#[tokio::test]
async fn test_recurring_runs_until_cancelled() {
    let scheduler = Scheduler::new();
    let counter = Arc::new(AtomicU32::new(0));

    assert!(scheduler.add_recurring("refresh", Duration::from_millis(20), counting_task(counter.clone())));
    tokio::time::sleep(Duration::from_millis(150)).await;

    assert!(scheduler.is_pending("refresh"));
    assert!(counter.load(Ordering::SeqCst) >= 2);

    scheduler.cancel("refresh");
    let seen = counter.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counter.load(Ordering::SeqCst), seen);
}

#[tokio::test]
async fn test_failing_task_does_not_poison_the_scheduler() {
    let scheduler = Scheduler::new();
    let counter = Arc::new(AtomicU32::new(0));

    scheduler.add(
        "broken",
        Duration::from_millis(10),
        task(|| async { Err(anyhow::anyhow!("upstream down")) }),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!scheduler.is_pending("broken"));
    assert!(scheduler.add("broken", Duration::from_millis(10), counting_task(counter.clone())));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}
