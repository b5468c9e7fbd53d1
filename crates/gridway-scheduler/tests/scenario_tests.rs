//! End-to-end scenario: a permission grant becomes a live claim, the
//! claim becomes a running shadow, and the reaper flushes the job when
//! the shadow exits cleanly.
//!
//! The authority and the execution host are both played by this test
//! over real sockets; the shadow is a shell script that lingers briefly
//! and exits with the success code.

use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::sleep;

use gridway_scheduler::{Scheduler, SchedulerConfig};
use gridway_state::{JobId, JobRecord, JobStatus, JobStore, Universe};
use gridway_wire::{connect, ActivationReply, FrameStream, Message};

/// Poll until `check` passes or ~15 seconds elapse.
async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..150 {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test]
async fn grant_becomes_claim_becomes_shadow_and_completes() {
    // A stand-in shadow: linger so the Running state is observable, then
    // exit 0 (= success in the exit-code taxonomy).
    let dir = tempfile::tempdir().unwrap();
    let shadow = dir.path().join("shadow.sh");
    std::fs::write(&shadow, "#!/bin/sh\nsleep 1\nexit 0\n").unwrap();
    std::fs::set_permissions(&shadow, std::fs::Permissions::from_mode(0o755)).unwrap();

    // The execution host: accept one activation, say OK.
    let startd = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let startd_addr = startd.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (stream, _) = startd.accept().await.unwrap();
        let mut stream = FrameStream::new(stream);
        match stream.expect().await.unwrap() {
            Message::ActivateClaim { token, .. } => assert_eq!(token, "T#cap"),
            other => panic!("expected ActivateClaim, got {other:?}"),
        }
        stream
            .send(&Message::Activation {
                reply: ActivationReply::Ok,
            })
            .await
            .unwrap();
    });

    let store = JobStore::open_in_memory().unwrap();
    let mut job = JobRecord::new(JobId::new(10, 0), "alice", Universe::Vanilla);
    job.status = JobStatus::Idle;
    job.priority = 5;
    store.put_job(&job).unwrap();

    let config = SchedulerConfig {
        shadow_path: shadow,
        // Fail ad publication fast; nothing listens there.
        authority_addr: "127.0.0.1:1".to_string(),
        job_start_delay_ms: 10,
        dispatch_debounce_ms: 10,
        reap_interval_secs: 1,
        ..SchedulerConfig::default()
    };

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let sched_addr = listener.local_addr().unwrap().to_string();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sched = Scheduler::new(config, store.clone(), sched_addr.clone());
    let daemon = tokio::spawn(sched.run(listener, shutdown_rx));

    // The authority drives one round.
    let mut auth = connect(&sched_addr, Duration::from_secs(5)).await.unwrap();
    auth.send(&Message::Owner {
        name: "alice".to_string(),
        pool: None,
    })
    .await
    .unwrap();
    auth.send(&Message::SendJobInfo).await.unwrap();
    match auth.expect().await.unwrap() {
        Message::JobInfo { ad } => {
            assert_eq!(ad["id"]["cluster"], 10);
            assert_eq!(ad["priority"], 5);
        }
        other => panic!("expected JobInfo, got {other:?}"),
    }
    auth.send(&Message::Permission {
        grant: format!("<{startd_addr}> T#cap"),
    })
    .await
    .unwrap();
    match auth.expect().await.unwrap() {
        Message::NoMoreJobs => {}
        other => panic!("expected NoMoreJobs, got {other:?}"),
    }
    drop(auth);

    // Activation, dispatch, spawn: the job record reaches Running.
    let ran = wait_for(|| {
        store
            .get_job(JobId::new(10, 0))
            .unwrap()
            .map(|j| j.status == JobStatus::Running)
            .unwrap_or(false)
    })
    .await;
    assert!(ran, "job never reached Running");

    // The shadow exits 0; the reaper flushes the completed record.
    let flushed = wait_for(|| store.get_job(JobId::new(10, 0)).unwrap().is_none()).await;
    assert!(flushed, "job record was not flushed after success");

    shutdown_tx.send(true).unwrap();
    daemon.await.unwrap().unwrap();
}

#[tokio::test]
async fn activation_refusal_voids_the_claim_without_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let shadow = dir.path().join("shadow.sh");
    std::fs::write(&shadow, "#!/bin/sh\nexit 0\n").unwrap();
    std::fs::set_permissions(&shadow, std::fs::Permissions::from_mode(0o755)).unwrap();

    // This host refuses the activation.
    let startd = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let startd_addr = startd.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (stream, _) = startd.accept().await.unwrap();
        let mut stream = FrameStream::new(stream);
        let _ = stream.expect().await.unwrap();
        stream
            .send(&Message::Activation {
                reply: ActivationReply::NotOk,
            })
            .await
            .unwrap();
    });

    let store = JobStore::open_in_memory().unwrap();
    let mut job = JobRecord::new(JobId::new(4, 0), "bob", Universe::Vanilla);
    job.status = JobStatus::Idle;
    store.put_job(&job).unwrap();

    let config = SchedulerConfig {
        shadow_path: shadow,
        authority_addr: "127.0.0.1:1".to_string(),
        dispatch_debounce_ms: 10,
        ..SchedulerConfig::default()
    };
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let sched_addr = listener.local_addr().unwrap().to_string();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sched = Scheduler::new(config, store.clone(), sched_addr.clone());
    let daemon = tokio::spawn(sched.run(listener, shutdown_rx));

    let mut auth = connect(&sched_addr, Duration::from_secs(5)).await.unwrap();
    auth.send(&Message::Owner {
        name: "bob".to_string(),
        pool: None,
    })
    .await
    .unwrap();
    auth.send(&Message::SendJobInfo).await.unwrap();
    let _ = auth.expect().await.unwrap();
    auth.send(&Message::Permission {
        grant: format!("<{startd_addr}> R#cap"),
    })
    .await
    .unwrap();
    let _ = auth.expect().await.unwrap(); // NoMoreJobs
    drop(auth);

    // Give activation time to be refused; the job must stay Idle and
    // never start.
    sleep(Duration::from_secs(2)).await;
    let job = store.get_job(JobId::new(4, 0)).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Idle);

    shutdown_tx.send(true).unwrap();
    daemon.await.unwrap().unwrap();
}
