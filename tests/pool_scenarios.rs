//! Pool manager behaviour against in-process workers.

mod common;

use std::time::Duration;

use agent_pool::error::PoolError;
use agent_pool::pool::{JobEvent, JobEventKind, PoolHandle, ShutdownReport};
use agent_pool::protocol::{JobOptions, JobRequest, TerminalStatus};
use agent_pool::worker::WorkerState;
use tokio::sync::mpsc;

use common::{InProcessLauncher, TEST_TIMEOUT, collect_finished, test_config, wait_for};

fn request(session: &str, prompt: &str) -> JobRequest {
    JobRequest::new(session, prompt, JobOptions::default())
}

/// Start a pool and register one listener for every given session.
async fn started_pool(
    pool_size: usize,
    sessions: &[&str],
) -> (
    PoolHandle,
    std::sync::Arc<InProcessLauncher>,
    mpsc::UnboundedReceiver<JobEvent>,
) {
    let launcher = InProcessLauncher::new();
    let pool = PoolHandle::spawn(&test_config(pool_size), launcher.clone());
    tokio::time::timeout(TEST_TIMEOUT, pool.start())
        .await
        .expect("start timed out")
        .expect("pool failed to start");

    let (tx, rx) = mpsc::unbounded_channel();
    for session in sessions {
        pool.register_listener(*session, tx.clone());
    }
    (pool, launcher, rx)
}

fn started_worker(event: &JobEvent) -> Option<usize> {
    match event.kind {
        JobEventKind::Started { worker_id } => Some(worker_id),
        _ => None,
    }
}

async fn wait_until_usable(pool: &PoolHandle, count: usize) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        loop {
            if pool.status().await.unwrap().usable_workers() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("pool capacity was not restored");
}

#[tokio::test]
async fn queued_job_takes_the_first_freed_worker() {
    let (pool, _launcher, mut rx) = started_pool(2, &["x", "y", "z"]).await;

    let x = pool.dispatch(request("x", "items=1 delay=200")).unwrap();
    let y = pool.dispatch(request("y", "items=1 delay=5000")).unwrap();
    let z = pool.dispatch(request("z", "items=1")).unwrap();

    let first = wait_for(&mut rx, |e| e.job_id == x && started_worker(e).is_some()).await;
    wait_for(&mut rx, |e| e.job_id == y && started_worker(e).is_some()).await;

    let status = pool.status().await.unwrap();
    assert_eq!(status.running, 2);
    assert_eq!(status.queued, 1);

    let events = collect_finished(&mut rx, 1).await;
    assert_eq!(
        events.last().map(|e| (e.job_id, e.kind.clone())),
        Some((x, JobEventKind::Finished(TerminalStatus::Success)))
    );

    let z_started = wait_for(&mut rx, |e| e.job_id == z && started_worker(e).is_some()).await;
    assert_eq!(started_worker(&z_started), started_worker(&first));

    pool.abort("y");
    let rest = collect_finished(&mut rx, 2).await;
    assert!(rest.iter().any(|e| e.job_id == y
        && e.kind == JobEventKind::Finished(TerminalStatus::Cancelled)));
    assert!(rest.iter().any(|e| e.job_id == z
        && e.kind == JobEventKind::Finished(TerminalStatus::Success)));
}

#[tokio::test]
async fn empty_prompt_never_reaches_a_worker() {
    let (pool, launcher, _rx) = started_pool(1, &["s"]).await;

    let err = pool.dispatch(request("s", "")).unwrap_err();
    assert!(matches!(err, PoolError::Validation(_)));
    assert!(err.to_string().contains("prompt"));

    let err = pool.dispatch(request(" ", "hello")).unwrap_err();
    assert!(err.to_string().contains("session_id"));

    let status = pool.status().await.unwrap();
    assert_eq!(status.queued + status.running, 0);
    assert!(launcher.calls().is_empty());
}

#[tokio::test]
async fn abort_without_a_job_is_a_no_op() {
    let (pool, _launcher, mut rx) = started_pool(1, &["busy"]).await;

    let job = pool.dispatch(request("busy", "items=3 delay=20")).unwrap();
    pool.abort("nobody");

    let events = collect_finished(&mut rx, 1).await;
    assert_eq!(
        events.last().map(|e| (e.job_id, e.kind.clone())),
        Some((job, JobEventKind::Finished(TerminalStatus::Success)))
    );
    let messages = events
        .iter()
        .filter(|e| matches!(e.kind, JobEventKind::Message(_)))
        .count();
    assert_eq!(messages, 3);
}

#[tokio::test]
async fn abort_cancels_a_running_job() {
    let (pool, _launcher, mut rx) = started_pool(1, &["s"]).await;

    let job = pool.dispatch(request("s", "items=50 delay=100")).unwrap();
    wait_for(&mut rx, |e| matches!(e.kind, JobEventKind::Message(_))).await;
    pool.abort("s");

    let events = collect_finished(&mut rx, 1).await;
    assert!(!events.iter().any(|e| matches!(e.kind, JobEventKind::Failed(_))));
    assert_eq!(
        common::finished_status(&events, job),
        vec![JobEventKind::Finished(TerminalStatus::Cancelled)]
    );

    // The worker is free again.
    let next = pool.dispatch(request("s", "items=1")).unwrap();
    let events = collect_finished(&mut rx, 1).await;
    assert_eq!(
        common::finished_status(&events, next),
        vec![JobEventKind::Finished(TerminalStatus::Success)]
    );
}

#[tokio::test]
async fn abort_removes_a_queued_job_without_contacting_a_worker() {
    let (pool, launcher, mut rx) = started_pool(1, &["running", "queued"]).await;

    let running = pool.dispatch(request("running", "items=1 delay=300")).unwrap();
    let queued = pool.dispatch(request("queued", "never-run")).unwrap();
    wait_for(&mut rx, |e| e.job_id == running && started_worker(e).is_some()).await;

    pool.abort("queued");
    let cancelled = wait_for(&mut rx, |e| e.job_id == queued).await;
    assert_eq!(
        cancelled.kind,
        JobEventKind::Finished(TerminalStatus::Cancelled)
    );

    collect_finished(&mut rx, 1).await;
    let prompts: Vec<_> = launcher.calls().into_iter().map(|c| c.prompt).collect();
    assert_eq!(prompts, ["items=1 delay=300"]);
}

#[tokio::test]
async fn worker_crash_fails_the_job_and_restores_capacity() {
    let (pool, launcher, mut rx) = started_pool(1, &["s"]).await;

    let job = pool.dispatch(request("s", "crash")).unwrap();
    let events = collect_finished(&mut rx, 1).await;

    let terminal: Vec<_> = events
        .iter()
        .filter(|e| e.job_id == job)
        .filter(|e| matches!(e.kind, JobEventKind::Failed(_) | JobEventKind::Finished(_)))
        .map(|e| e.kind.clone())
        .collect();
    assert_eq!(terminal.len(), 2);
    match &terminal[0] {
        JobEventKind::Failed(reason) => assert!(reason.contains("exited unexpectedly"), "{reason}"),
        other => panic!("expected a failure first, got {other:?}"),
    }
    assert_eq!(terminal[1], JobEventKind::Finished(TerminalStatus::Error));

    wait_until_usable(&pool, 1).await;
    let status = pool.status().await.unwrap();
    assert_eq!(status.workers[0].restarts, 1);
    assert_eq!(launcher.launches(), 2);

    let next = pool.dispatch(request("s", "items=1")).unwrap();
    let events = collect_finished(&mut rx, 1).await;
    assert_eq!(
        common::finished_status(&events, next),
        vec![JobEventKind::Finished(TerminalStatus::Success)]
    );
}

#[tokio::test]
async fn unreadable_output_fails_the_job_and_replaces_the_worker() {
    let (pool, launcher, mut rx) = started_pool(1, &["s"]).await;

    let job = pool.dispatch(request("s", "oversize items=1")).unwrap();
    let events = collect_finished(&mut rx, 1).await;

    let terminal: Vec<_> = events
        .iter()
        .filter(|e| e.job_id == job)
        .filter(|e| matches!(e.kind, JobEventKind::Failed(_) | JobEventKind::Finished(_)))
        .map(|e| e.kind.clone())
        .collect();
    assert_eq!(terminal.len(), 2);
    match &terminal[0] {
        JobEventKind::Failed(reason) => assert!(reason.contains("unreadable output"), "{reason}"),
        other => panic!("expected a failure first, got {other:?}"),
    }
    assert_eq!(terminal[1], JobEventKind::Finished(TerminalStatus::Error));
    assert!(
        !events
            .iter()
            .any(|e| e.job_id == job && matches!(e.kind, JobEventKind::Message(_)))
    );

    wait_until_usable(&pool, 1).await;
    assert_eq!(launcher.launches(), 2);
    let status = pool.status().await.unwrap();
    assert_eq!(status.running, 0);

    let next = pool.dispatch(request("s", "items=1")).unwrap();
    let events = collect_finished(&mut rx, 1).await;
    assert_eq!(
        common::finished_status(&events, next),
        vec![JobEventKind::Finished(TerminalStatus::Success)]
    );
}

#[tokio::test]
async fn engine_failures_end_in_a_single_error() {
    let (pool, _launcher, mut rx) = started_pool(2, &["early", "late", "panics"]).await;

    let early = pool.dispatch(request("early", "fail")).unwrap();
    let late = pool.dispatch(request("late", "items=2 fail-late")).unwrap();
    let panics = pool.dispatch(request("panics", "panic")).unwrap();
    let events = collect_finished(&mut rx, 3).await;

    for job in [early, late, panics] {
        assert_eq!(
            common::finished_status(&events, job),
            vec![JobEventKind::Finished(TerminalStatus::Error)]
        );
        assert!(
            events
                .iter()
                .any(|e| e.job_id == job && matches!(e.kind, JobEventKind::Failed(_)))
        );
    }

    let late_messages = events
        .iter()
        .filter(|e| e.job_id == late && matches!(e.kind, JobEventKind::Message(_)))
        .count();
    assert_eq!(late_messages, 2);

    let panic_reason = events.iter().find_map(|e| match &e.kind {
        JobEventKind::Failed(reason) if e.job_id == panics => Some(reason.clone()),
        _ => None,
    });
    assert!(panic_reason.unwrap().contains("scripted engine panic"));

    // Workers survive engine failures.
    assert_eq!(pool.status().await.unwrap().usable_workers(), 2);
}

#[tokio::test]
async fn one_running_job_per_session() {
    let (pool, _launcher, mut rx) = started_pool(2, &["s"]).await;

    let first = pool.dispatch(request("s", "items=2 delay=50")).unwrap();
    let second = pool.dispatch(request("s", "items=1")).unwrap();
    let events = collect_finished(&mut rx, 2).await;

    let position = |job, pred: fn(&JobEventKind) -> bool| {
        events
            .iter()
            .position(|e| e.job_id == job && pred(&e.kind))
            .unwrap()
    };
    let first_finished = position(first, |k| matches!(k, JobEventKind::Finished(_)));
    let second_started = position(second, |k| matches!(k, JobEventKind::Started { .. }));
    assert!(first_finished < second_started);
}

#[tokio::test]
async fn at_most_pool_size_jobs_run_in_fifo_order() {
    let sessions = ["a", "b", "c", "d", "e"];
    let (pool, _launcher, mut rx) = started_pool(2, &sessions).await;

    let jobs: Vec<_> = sessions
        .iter()
        .map(|s| pool.dispatch(request(s, "items=2 delay=20")).unwrap())
        .collect();
    let events = collect_finished(&mut rx, jobs.len()).await;

    let mut running = 0usize;
    let mut started_order = Vec::new();
    for event in &events {
        match event.kind {
            JobEventKind::Started { .. } => {
                running += 1;
                assert!(running <= 2, "more jobs running than workers");
                started_order.push(event.job_id);
            }
            JobEventKind::Finished(status) => {
                running -= 1;
                assert_eq!(status, TerminalStatus::Success);
            }
            _ => {}
        }
    }
    assert_eq!(started_order, jobs);
}

#[tokio::test]
async fn stop_during_a_job_ends_it_and_rejects_new_work() {
    let (pool, _launcher, mut rx) = started_pool(2, &["s"]).await;

    let job = pool.dispatch(request("s", "items=50 delay=100")).unwrap();
    wait_for(&mut rx, |e| matches!(e.kind, JobEventKind::Message(_))).await;

    let report = tokio::time::timeout(TEST_TIMEOUT, pool.stop())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report, ShutdownReport { acknowledged: 2, killed: 0 });

    let events = collect_finished(&mut rx, 1).await;
    assert_eq!(
        common::finished_status(&events, job),
        vec![JobEventKind::Finished(TerminalStatus::Cancelled)]
    );

    assert!(matches!(
        pool.dispatch(request("s", "again")),
        Err(PoolError::ShuttingDown)
    ));
    let status = pool.status().await.unwrap();
    assert!(status.workers.iter().all(|w| w.state == WorkerState::Terminated));
}

#[tokio::test]
async fn stop_kills_a_worker_that_ignores_shutdown() {
    let launcher = InProcessLauncher::new();
    let mut config = test_config(2);
    config.shutdown_timeout = Duration::from_millis(300);
    let pool = PoolHandle::spawn(&config, launcher.clone());
    pool.start().await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    pool.register_listener("stuck", tx);
    let job = pool.dispatch(request("stuck", "stuck")).unwrap();
    wait_for(&mut rx, |e| started_worker(e).is_some()).await;

    let report = tokio::time::timeout(TEST_TIMEOUT, pool.stop())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report, ShutdownReport { acknowledged: 1, killed: 1 });

    let events = collect_finished(&mut rx, 1).await;
    assert!(events
        .iter()
        .any(|e| e.job_id == job && matches!(e.kind, JobEventKind::Failed(_))));
    assert_eq!(
        common::finished_status(&events, job),
        vec![JobEventKind::Finished(TerminalStatus::Error)]
    );
}

#[tokio::test]
async fn queued_jobs_are_cancelled_by_stop() {
    let (pool, launcher, mut rx) = started_pool(1, &["a", "b"]).await;

    let a = pool.dispatch(request("a", "items=20 delay=100")).unwrap();
    let b = pool.dispatch(request("b", "items=1")).unwrap();
    wait_for(&mut rx, |e| e.job_id == a && started_worker(e).is_some()).await;

    pool.stop().await.unwrap();
    let events = collect_finished(&mut rx, 2).await;
    assert_eq!(
        common::finished_status(&events, b),
        vec![JobEventKind::Finished(TerminalStatus::Cancelled)]
    );
    assert!(!events.iter().any(|e| e.job_id == b && started_worker(e).is_some()));
    assert_eq!(launcher.calls().len(), 1);
}
