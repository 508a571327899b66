//! End-to-end tests speaking raw Gearman wire bytes against a server
//! bound to an ephemeral port.


use std::time::Duration;

use gearmand_lite::protocol::{split_args, Command};
use test_harness::{assert_eventually, GearmanConn, TestServer};

/// Wait until `count` workers are on the roster for `func`.
async fn wait_for_roster(server: &TestServer, func: &str, count: usize) {
    assert_eventually(
        || async {
            server
                .snapshot()
                .await
                .funcs
                .iter()
                .any(|f| f.func_name == func && f.workers.len() == count)
        },
        Duration::from_secs(2),
        "worker roster populated",
    )
    .await;
}

/// Worker registers, sleeps, is woken, grabs, completes; the client
/// sees JOB_CREATED and the echoed WORK_COMPLETE.
#[tokio::test]
async fn test_reverse_round_trip() {
    let server = TestServer::spawn(0).await;
    let mut worker = GearmanConn::connect(server.addr).await;
    let mut client = GearmanConn::connect(server.addr).await;

    worker.send(Command::CanDo, &[b"reverse"]).await;
    worker.send(Command::GrabJob, &[]).await;
    worker.expect_packet(Command::NoJob).await;
    worker.send(Command::PreSleep, &[]).await;
    assert_eventually(
        || async {
            server
                .snapshot()
                .await
                .workers
                .iter()
                .any(|w| w.status == "sleep")
        },
        Duration::from_secs(2),
        "worker asleep before the submit",
    )
    .await;

    client
        .send(Command::SubmitJob, &[b"reverse", b"u1", b"hello"])
        .await;
    let created = client.expect_packet(Command::JobCreated).await;
    let handle = String::from_utf8(created).expect("utf8 handle");
    assert!(handle.starts_with("H:"), "handle {} has broker shape", handle);
    assert!(handle.ends_with(":1"), "first handle of this broker");

    worker.expect_packet(Command::Noop).await;
    worker.send(Command::GrabJob, &[]).await;
    let assign = worker.expect_packet(Command::JobAssign).await;
    let args = split_args(&assign, 3);
    assert_eq!(args[0], handle.as_bytes());
    assert_eq!(args[1], b"reverse");
    assert_eq!(args[2], b"hello");

    worker
        .send(Command::WorkComplete, &[handle.as_bytes(), b"olleh"])
        .await;
    let complete = client.expect_packet(Command::WorkComplete).await;
    let args = split_args(&complete, 2);
    assert_eq!(args[0], handle.as_bytes());
    assert_eq!(args[1], b"olleh");

    let snapshot = server.snapshot().await;
    assert_eq!(snapshot.working, 0);
}

/// A background submit gets JOB_CREATED and nothing else, ever.
#[tokio::test]
async fn test_background_submit_gets_only_job_created() {
    let server = TestServer::spawn(0).await;
    let mut worker = GearmanConn::connect(server.addr).await;
    let mut client = GearmanConn::connect(server.addr).await;

    worker.send(Command::CanDo, &[b"reverse"]).await;
    wait_for_roster(&server, "reverse", 1).await;
    client
        .send(Command::SubmitJobLowBg, &[b"reverse", b"u1", b"hello"])
        .await;
    let created = client.expect_packet(Command::JobCreated).await;
    let handle = String::from_utf8(created).expect("utf8 handle");

    worker.expect_packet(Command::Noop).await;
    worker.send(Command::GrabJob, &[]).await;
    let assign = worker.expect_packet(Command::JobAssign).await;
    assert_eq!(split_args(&assign, 3)[2], b"hello");

    worker
        .send(Command::WorkComplete, &[handle.as_bytes(), b"olleh"])
        .await;

    assert_eventually(
        || async { server.snapshot().await.working == 0 },
        Duration::from_secs(2),
        "background job finishes",
    )
    .await;
    client.expect_silence(Duration::from_millis(300)).await;
}

/// Two functions, two queued jobs: two grabs serve both, a third gets
/// NO_JOB.
#[tokio::test]
async fn test_two_functions_two_jobs_then_empty() {
    let server = TestServer::spawn(0).await;
    let mut worker = GearmanConn::connect(server.addr).await;
    let mut client = GearmanConn::connect(server.addr).await;

    worker.send(Command::CanDo, &[b"a"]).await;
    worker.send(Command::CanDo, &[b"b"]).await;

    client.send(Command::SubmitJob, &[b"a", b"u1", b"1"]).await;
    client.expect_packet(Command::JobCreated).await;
    client.send(Command::SubmitJob, &[b"b", b"u2", b"2"]).await;
    client.expect_packet(Command::JobCreated).await;

    let mut served = Vec::new();
    for _ in 0..2 {
        worker.send(Command::GrabJob, &[]).await;
        // Wakeup NOOPs may interleave ahead of the assignment.
        loop {
            let (cmd, payload) = worker.read_packet().await;
            if cmd == Command::Noop {
                continue;
            }
            assert_eq!(cmd, Command::JobAssign);
            served.push(split_args(&payload, 3)[1].clone());
            break;
        }
    }
    served.sort();
    assert_eq!(served, vec![b"a".to_vec(), b"b".to_vec()]);

    worker.send(Command::GrabJob, &[]).await;
    loop {
        let (cmd, _) = worker.read_packet().await;
        if cmd == Command::Noop {
            continue;
        }
        assert_eq!(cmd, Command::NoJob);
        break;
    }
}

/// CAN_DO_TIMEOUT with a 1-second deadline: the never-served job comes
/// back as WORK_FAIL("job timeout") and leaves the broker tables.
#[tokio::test]
async fn test_job_timeout_delivers_work_fail() {
    let server = TestServer::spawn(0).await;
    let mut worker = GearmanConn::connect(server.addr).await;
    let mut client = GearmanConn::connect(server.addr).await;

    worker.send(Command::CanDoTimeout, &[b"slow", b"1"]).await;
    assert_eventually(
        || async {
            server
                .snapshot()
                .await
                .funcs
                .iter()
                .any(|f| f.func_name == "slow" && f.timeout_secs == 1)
        },
        Duration::from_secs(2),
        "function timeout configured",
    )
    .await;
    client.send(Command::SubmitJob, &[b"slow", b"u1", b"x"]).await;
    client.expect_packet(Command::JobCreated).await;

    let fail = client.expect_packet(Command::WorkFail).await;
    assert_eq!(fail, b"job timeout");

    let snapshot = server.snapshot().await;
    assert_eq!(snapshot.working, 0);
    assert_eq!(
        snapshot
            .queues
            .iter()
            .find(|q| q.func_name == "slow")
            .map(|q| q.waiting),
        Some(0)
    );
}

/// A worker that disconnects disappears from the roster; later submits
/// just queue.
#[tokio::test]
async fn test_disconnected_worker_leaves_roster() {
    let server = TestServer::spawn(0).await;

    {
        let mut worker = GearmanConn::connect(server.addr).await;
        worker.send(Command::CanDo, &[b"x"]).await;
        assert_eventually(
            || async {
                server
                    .snapshot()
                    .await
                    .funcs
                    .iter()
                    .any(|f| f.func_name == "x" && f.workers.len() == 1)
            },
            Duration::from_secs(2),
            "worker registered",
        )
        .await;
    } // drop closes the socket

    assert_eventually(
        || async {
            server
                .snapshot()
                .await
                .funcs
                .iter()
                .all(|f| f.workers.is_empty())
        },
        Duration::from_secs(2),
        "worker removed from roster on disconnect",
    )
    .await;

    let mut client = GearmanConn::connect(server.addr).await;
    client.send(Command::SubmitJob, &[b"x", b"u1", b"y"]).await;
    client.expect_packet(Command::JobCreated).await;

    let snapshot = server.snapshot().await;
    assert_eq!(
        snapshot.queues.iter().find(|q| q.func_name == "x").map(|q| q.waiting),
        Some(1),
        "job queued with no workers to wake"
    );
}

/// A session that goes silent past the keepalive window is closed by
/// the broker and its worker registration dropped, exactly as if the
/// peer had disconnected.
#[tokio::test]
async fn test_idle_session_reaped_by_keepalive() {
    let server = TestServer::spawn_with_keepalive_ms(0, 1000).await;
    let worker = {
        let mut worker = GearmanConn::connect(server.addr).await;
        worker.send(Command::CanDo, &[b"x"]).await;
        wait_for_roster(&server, "x", 1).await;
        worker
    };

    // Send nothing further; the idle window expires server-side.
    assert_eventually(
        || async {
            server
                .snapshot()
                .await
                .funcs
                .iter()
                .all(|f| f.workers.is_empty())
        },
        Duration::from_secs(4),
        "idle worker reaped from roster",
    )
    .await;
    worker.expect_closed().await;

    // The broker keeps serving new connections afterwards.
    let mut client = GearmanConn::connect(server.addr).await;
    client.send(Command::SubmitJob, &[b"x", b"u1", b"y"]).await;
    client.expect_packet(Command::JobCreated).await;
}

/// With trytime=1 only the first-registered sleeper is woken.
#[tokio::test]
async fn test_try_times_one_wakes_first_worker_only() {
    let server = TestServer::spawn(1).await;
    let mut w1 = GearmanConn::connect(server.addr).await;
    let mut w2 = GearmanConn::connect(server.addr).await;
    let mut w3 = GearmanConn::connect(server.addr).await;
    let mut client = GearmanConn::connect(server.addr).await;

    // Register one at a time so the roster insertion order is fixed.
    for (i, worker) in [&mut w1, &mut w2, &mut w3].into_iter().enumerate() {
        worker.send(Command::CanDo, &[b"f"]).await;
        wait_for_roster(&server, "f", i + 1).await;
        worker.send(Command::PreSleep, &[]).await;
    }
    assert_eventually(
        || async {
            server
                .snapshot()
                .await
                .workers
                .iter()
                .all(|w| w.status == "sleep")
        },
        Duration::from_secs(2),
        "all three workers asleep",
    )
    .await;

    client.send(Command::SubmitJob, &[b"f", b"u1", b"x"]).await;
    client.expect_packet(Command::JobCreated).await;

    w1.expect_packet(Command::Noop).await;
    w2.expect_silence(Duration::from_millis(300)).await;
    w3.expect_silence(Duration::from_millis(300)).await;
}

/// GRAB_JOB_UNIQ returns the client-supplied unique id in the
/// assignment.
#[tokio::test]
async fn test_grab_job_uniq_carries_unique_id() {
    let server = TestServer::spawn(0).await;
    let mut worker = GearmanConn::connect(server.addr).await;
    let mut client = GearmanConn::connect(server.addr).await;

    worker.send(Command::CanDo, &[b"reverse"]).await;
    wait_for_roster(&server, "reverse", 1).await;
    client
        .send(Command::SubmitJob, &[b"reverse", b"uniq-7", b"hello"])
        .await;
    let created = client.expect_packet(Command::JobCreated).await;

    worker.expect_packet(Command::Noop).await;
    worker.send(Command::GrabJobUniq, &[]).await;
    let assign = worker.expect_packet(Command::JobAssignUniq).await;
    let args = split_args(&assign, 4);
    assert_eq!(args[0], created);
    assert_eq!(args[1], b"reverse");
    assert_eq!(args[2], b"uniq-7");
    assert_eq!(args[3], b"hello");
}

/// WORK_STATUS is forwarded to the submitting client without removing
/// the job; a later WORK_COMPLETE still arrives.
#[tokio::test]
async fn test_status_then_complete_both_forwarded() {
    let server = TestServer::spawn(0).await;
    let mut worker = GearmanConn::connect(server.addr).await;
    let mut client = GearmanConn::connect(server.addr).await;

    worker.send(Command::CanDo, &[b"count"]).await;
    wait_for_roster(&server, "count", 1).await;
    client.send(Command::SubmitJob, &[b"count", b"u1", b"x"]).await;
    let handle = client.expect_packet(Command::JobCreated).await;

    worker.expect_packet(Command::Noop).await;
    worker.send(Command::GrabJob, &[]).await;
    worker.expect_packet(Command::JobAssign).await;

    worker
        .send(Command::WorkStatus, &[handle.as_slice(), b"5", b"10"])
        .await;
    let status = client.expect_packet(Command::WorkStatus).await;
    let args = split_args(&status, 3);
    assert_eq!(args[1], b"5");
    assert_eq!(args[2], b"10");

    worker
        .send(Command::WorkComplete, &[handle.as_slice(), b"done"])
        .await;
    let complete = client.expect_packet(Command::WorkComplete).await;
    assert_eq!(split_args(&complete, 2)[1], b"done");
}

/// Unknown commands are ignored without dropping the session.
#[tokio::test]
async fn test_unknown_command_keeps_session_alive() {
    let server = TestServer::spawn(0).await;
    let mut client = GearmanConn::connect(server.addr).await;

    // ECHO_REQ (16) is not in the handled subset.
    let mut raw = Vec::new();
    raw.extend_from_slice(b"\0REQ");
    raw.extend_from_slice(&16u32.to_be_bytes());
    raw.extend_from_slice(&4u32.to_be_bytes());
    raw.extend_from_slice(b"ping");
    client.send_raw(&raw).await;

    client.send(Command::SubmitJob, &[b"f", b"u1", b"x"]).await;
    client.expect_packet(Command::JobCreated).await;
}
