use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dramatiq_broker::{
    MaxTasksPerChild, Outcome, RestartOnRequest, WorkerBuilder, EXIT_RESTART_REQUESTED,
};

use crate::common::make_test_broker;

#[tokio::test]
async fn max_tasks_per_child_recycles_the_process() {
    let (broker, _guard) = make_test_broker("q").await;
    for i in 0..10 {
        broker
            .enqueue("q", &format!("t{i}"), b"payload", Some(0))
            .await
            .unwrap();
    }

    let processed = Arc::new(AtomicUsize::new(0));
    let worker = WorkerBuilder::new(broker.clone())
        .executors(1)
        .queue("q")
        .middleware(MaxTasksPerChild::new(3))
        .build();

    let counter = processed.clone();
    let code = tokio::time::timeout(
        Duration::from_secs(5),
        worker.run(move |_message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Outcome::Success
            }
        }),
    )
    .await
    .expect("first worker should hit its task limit and exit on its own");

    assert_eq!(code, EXIT_RESTART_REQUESTED);
    assert_eq!(processed.load(Ordering::SeqCst), 3);

    // A relaunched worker, given a limit matching the remaining backlog
    // exactly, processes the rest and then recycles itself again.
    let worker = WorkerBuilder::new(broker.clone())
        .executors(1)
        .queue("q")
        .middleware(MaxTasksPerChild::new(7))
        .build();
    let counter = processed.clone();
    let code = tokio::time::timeout(
        Duration::from_secs(5),
        worker.run(move |_message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Outcome::Success
            }
        }),
    )
    .await
    .expect("relaunched worker should drain the remaining backlog and exit");

    assert_eq!(code, EXIT_RESTART_REQUESTED);
    assert_eq!(processed.load(Ordering::SeqCst), 10);
}

#[tokio::test]
async fn restart_requested_from_task_recycles_the_process() {
    let (broker, _guard) = make_test_broker("q").await;
    broker.enqueue("q", "restart-me", b"R", Some(0)).await.unwrap();
    broker.enqueue("q", "plain", b"P", Some(1)).await.unwrap();

    let processed = Arc::new(AtomicUsize::new(0));
    let worker = WorkerBuilder::new(broker.clone())
        .executors(1)
        .queue("q")
        .middleware(RestartOnRequest)
        .build();

    let counter = processed.clone();
    let code = tokio::time::timeout(
        Duration::from_secs(5),
        worker.run(move |message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                if message.id == "restart-me" {
                    Outcome::RestartRequested
                } else {
                    Outcome::Success
                }
            }
        }),
    )
    .await
    .expect("worker should exit as soon as the restart-requesting task runs");

    assert_eq!(code, EXIT_RESTART_REQUESTED);
    assert_eq!(processed.load(Ordering::SeqCst), 1);

    // The relaunched worker processes the remaining plain task. It has
    // nothing left to request a restart over, so it is driven to an
    // explicit restart from outside once the backlog is drained, the way an
    // external supervisor would signal it after confirming progress.
    let worker = WorkerBuilder::new(broker.clone())
        .executors(1)
        .queue("q")
        .build();
    let handle = worker.handle();
    let counter = processed.clone();
    let watchdog = tokio::spawn(async move {
        while counter.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.request_restart();
    });

    let counter = processed.clone();
    let code = tokio::time::timeout(
        Duration::from_secs(5),
        worker.run(move |message| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                assert_eq!(message.id, "plain");
                Outcome::Success
            }
        }),
    )
    .await
    .expect("relaunched worker should exit once the watchdog requests a restart");

    watchdog.await.unwrap();
    assert_eq!(code, EXIT_RESTART_REQUESTED);
    assert_eq!(processed.load(Ordering::SeqCst), 2);
}
