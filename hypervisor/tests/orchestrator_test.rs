//! Orchestrator tests against in-process sandboxes
//!
//! Every "sandbox" runs the real worker loop over a scripted backend, so
//! these cover the host/worker protocol end to end:
//! - first turn launches, follow-ups go through the mailbox
//! - session ids from frames land in the registry and are resumed
//! - round and lifetime timeouts, crashes, malformed output
//! - close, idle close, shutdown and the concurrency cap
//! - every accepted turn gets an outcome, including turns caught by a
//!   close, a failed launch or a worker exit

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Harness, SandboxMode, WAIT};
use hypervisor::orchestrator::{Dispatch, OrchestratorError, Outcome, Turn};
use hypervisor::sandbox::{mailbox_dir_name, LaunchError};
use sandbox::backend::ScriptedReply;
use shared_types::{encode_frame, ConversationId, Mailbox, ResultFrame, RuntimeSelection};

fn conv(id: &str) -> ConversationId {
    ConversationId::from(id)
}

fn text_of(outcome: &Outcome) -> &str {
    match outcome {
        Outcome::Success { text } => text,
        other => panic!("expected success, got {other:?}"),
    }
}

fn frame_lines(frame: &ResultFrame) -> Vec<String> {
    encode_frame(frame)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

#[tokio::test]
async fn test_first_turn_launches_and_records_session() {
    let h = Harness::new().await;
    let g1 = conv("g1");

    let dispatch = h.orchestrator.send(&g1, Turn::new("hello")).await.unwrap();
    assert!(matches!(dispatch, Dispatch::Launched { ref instance } if instance.starts_with("agent-sandbox-g1-")));

    let reply = h.replies.next().await;
    assert_eq!(reply.conversation_id, g1);
    assert_eq!(text_of(&reply.outcome), "re: hello");
    assert_eq!(reply.session_id.as_deref(), Some("s1"));

    let record = h.registry.get(&g1).await.unwrap().unwrap();
    assert_eq!(record.session_id.as_deref(), Some("s1"));

    let envelopes = h.runtime.envelopes();
    assert_eq!(envelopes.len(), 1);
    assert_eq!(envelopes[0].prompt, "hello");
    assert!(envelopes[0].session_id.is_none());
    assert_eq!(envelopes[0].secrets.get("API_TOKEN").map(String::as_str), Some("tok-1"));
    assert_eq!(envelopes[0].limits.poll_interval_ms, 10);
}

#[tokio::test]
async fn test_follow_up_is_queued_into_live_worker() {
    let h = Harness::new().await;
    let g1 = conv("g1");

    h.orchestrator.send(&g1, Turn::new("hello")).await.unwrap();
    h.replies.next().await;

    let dispatch = h.orchestrator.send(&g1, Turn::new("again")).await.unwrap();
    assert_eq!(dispatch, Dispatch::Queued);
    let reply = h.replies.next().await;
    assert_eq!(text_of(&reply.outcome), "re: again");

    assert_eq!(h.runtime.launched().len(), 1);
    assert_eq!(
        h.backend.prompts(),
        vec![
            ("s1".to_string(), "hello".to_string()),
            ("s1".to_string(), "again".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_close_then_next_turn_resumes_session() {
    let h = Harness::new().await;
    let g1 = conv("g1");

    h.orchestrator.send(&g1, Turn::new("hello")).await.unwrap();
    h.replies.next().await;

    assert!(h.orchestrator.close(&g1).await.unwrap());
    h.wait_gone(&g1).await;
    assert!(h.runtime.stopped().is_empty(), "worker should exit on its own");
    h.replies.assert_quiet(Duration::from_millis(100)).await;

    let dispatch = h.orchestrator.send(&g1, Turn::new("back")).await.unwrap();
    assert!(matches!(dispatch, Dispatch::Launched { .. }));
    let reply = h.replies.next().await;
    assert_eq!(text_of(&reply.outcome), "re: back");
    assert_eq!(reply.session_id.as_deref(), Some("s1"));

    let envelopes = h.runtime.envelopes();
    assert_eq!(envelopes[1].session_id.as_deref(), Some("s1"));
    assert_eq!(h.backend.sessions_created(), 1);
}

#[tokio::test]
async fn test_close_without_worker_is_a_no_op() {
    let h = Harness::new().await;
    assert!(!h.orchestrator.close(&conv("nobody")).await.unwrap());
}

#[tokio::test]
async fn test_round_timeout_then_relaunch_resumes() {
    let h = Harness::with_settings(|s| s.limits.round_timeout_ms = 200).await;
    let g1 = conv("g1");
    h.backend.push_reply(ScriptedReply::Hang);

    h.orchestrator.send(&g1, Turn::new("slow")).await.unwrap();
    let reply = h.replies.next().await;
    match &reply.outcome {
        Outcome::Error { message } => assert!(message.contains("timed out"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }
    h.wait_gone(&g1).await;
    assert_eq!(
        h.registry.get(&g1).await.unwrap().unwrap().session_id.as_deref(),
        Some("s1")
    );

    h.orchestrator.send(&g1, Turn::new("retry")).await.unwrap();
    let reply = h.replies.next().await;
    assert_eq!(text_of(&reply.outcome), "re: retry");
    assert_eq!(h.runtime.envelopes()[1].session_id.as_deref(), Some("s1"));
    assert_eq!(h.backend.sessions_created(), 1);
}

#[tokio::test]
async fn test_lifetime_timeout_stops_sandbox() {
    let h = Harness::with_settings(|s| s.worker_timeout = Duration::from_millis(300)).await;
    let g1 = conv("g1");
    h.backend.push_reply(ScriptedReply::Hang);

    let Dispatch::Launched { instance } = h.orchestrator.send(&g1, Turn::new("forever")).await.unwrap() else {
        panic!("expected a launch");
    };
    let reply = h.replies.next().await;
    match &reply.outcome {
        Outcome::Timeout { message } => assert!(message.contains(&instance), "{message}"),
        other => panic!("expected timeout, got {other:?}"),
    }
    h.wait_gone(&g1).await;
    assert_eq!(h.runtime.stopped(), vec![instance]);
    // No frame was produced, so nothing was recorded.
    assert!(h.registry.get(&g1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_backend_error_keeps_worker_alive() {
    let h = Harness::new().await;
    let g1 = conv("g1");
    h.backend.push_reply(ScriptedReply::Fail("quota exceeded".to_string()));

    h.orchestrator.send(&g1, Turn::new("hello")).await.unwrap();
    let reply = h.replies.next().await;
    match &reply.outcome {
        Outcome::Error { message } => assert!(message.contains("quota exceeded")),
        other => panic!("expected error, got {other:?}"),
    }
    assert_eq!(reply.session_id.as_deref(), Some("s1"));

    assert_eq!(
        h.orchestrator.send(&g1, Turn::new("again")).await.unwrap(),
        Dispatch::Queued
    );
    assert_eq!(text_of(&h.replies.next().await.outcome), "re: again");
}

#[tokio::test]
async fn test_worker_exit_without_frame_reports_error() {
    let h = Harness::new().await;
    let g1 = conv("g1");
    h.runtime.set_mode(SandboxMode::Crash);

    h.orchestrator.send(&g1, Turn::new("hello")).await.unwrap();
    let reply = h.replies.next().await;
    match &reply.outcome {
        Outcome::Error { message } => {
            assert!(message.contains("exited"), "{message}");
            assert!(message.contains("backend exploded"), "{message}");
        }
        other => panic!("expected error, got {other:?}"),
    }
    h.wait_gone(&g1).await;
    assert!(h.registry.get(&g1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_launch_failure_frees_conversation() {
    let h = Harness::new().await;
    let g1 = conv("g1");
    h.runtime.set_mode(SandboxMode::FailLaunch);

    let err = h.orchestrator.send(&g1, Turn::new("hello")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Launch(LaunchError::ImageMissing(_))));
    assert!(!h.orchestrator.is_running(&g1).await);

    h.runtime.set_mode(SandboxMode::Worker);
    let dispatch = h.orchestrator.send(&g1, Turn::new("hello")).await.unwrap();
    assert!(matches!(dispatch, Dispatch::Launched { .. }));
    assert_eq!(text_of(&h.replies.next().await.outcome), "re: hello");
}

#[tokio::test]
async fn test_malformed_frames_and_diagnostics_are_skipped() {
    let h = Harness::new().await;
    let g1 = conv("g1");

    let mut lines = vec![
        "booting agent".to_string(),
        shared_types::OUTPUT_START_MARKER.to_string(),
        "{not json".to_string(),
        shared_types::OUTPUT_END_MARKER.to_string(),
        "more noise".to_string(),
    ];
    lines.extend(frame_lines(&ResultFrame::success(
        Some("ok".to_string()),
        Some("s9".to_string()),
    )));
    h.runtime.set_mode(SandboxMode::Raw(lines));

    h.orchestrator.send(&g1, Turn::new("hello")).await.unwrap();
    let reply = h.replies.next().await;
    assert_eq!(text_of(&reply.outcome), "ok");

    h.wait_gone(&g1).await;
    h.replies.assert_quiet(Duration::from_millis(100)).await;
    assert_eq!(
        h.registry.get(&g1).await.unwrap().unwrap().session_id.as_deref(),
        Some("s9")
    );
}

#[tokio::test]
async fn test_session_only_frame_records_without_reply() {
    let h = Harness::new().await;
    let g1 = conv("g1");
    h.runtime
        .set_mode(SandboxMode::Raw(frame_lines(&ResultFrame::success(None, Some("s7".to_string())))));

    h.orchestrator.send(&g1, Turn::new("hello")).await.unwrap();
    h.wait_gone(&g1).await;
    h.replies.assert_quiet(Duration::from_millis(200)).await;
    assert_eq!(
        h.registry.get(&g1).await.unwrap().unwrap().session_id.as_deref(),
        Some("s7")
    );
}

#[tokio::test]
async fn test_idle_worker_is_closed() {
    let h = Harness::with_settings(|s| s.idle_timeout = Duration::from_millis(200)).await;
    let g1 = conv("g1");
    tokio::spawn(Arc::clone(&h.orchestrator).run_idle_watchdog());

    h.orchestrator.send(&g1, Turn::new("hello")).await.unwrap();
    h.replies.next().await;

    h.wait_gone(&g1).await;
    assert!(h.runtime.stopped().is_empty());
    h.replies.assert_quiet(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_stale_mailbox_is_reset_before_launch() {
    let h = Harness::new().await;
    let g1 = conv("g1");
    let stale = Mailbox::new(h.mailbox_root.join(mailbox_dir_name(&g1)));
    stale.publish("left over").await.unwrap();
    stale.request_close().await.unwrap();

    h.orchestrator.send(&g1, Turn::new("fresh")).await.unwrap();
    assert_eq!(text_of(&h.replies.next().await.outcome), "re: fresh");
    assert_eq!(
        h.backend.prompts(),
        vec![("s1".to_string(), "fresh".to_string())]
    );
    // The stale sentinel did not close the new worker.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.orchestrator.is_running(&g1).await);
}

#[tokio::test]
async fn test_pinned_runtime_goes_into_envelope() {
    let h = Harness::new().await;
    let g1 = conv("g1");
    let pinned = RuntimeSelection::Opencode {
        provider: "openai".to_string(),
        model: "gpt-5".to_string(),
        credential: None,
    };
    h.registry.set_runtime(&g1, &pinned).await.unwrap();

    h.orchestrator.send(&g1, Turn::new("hello")).await.unwrap();
    h.replies.next().await;
    assert_eq!(h.runtime.envelopes()[0].runtime, pinned);
}

#[tokio::test]
async fn test_concurrency_cap_holds_launches() {
    let h = Harness::with_settings(|s| s.max_concurrent = 1).await;
    let a = conv("a");
    let b = conv("b");

    h.orchestrator.send(&a, Turn::new("first")).await.unwrap();
    h.replies.next().await;

    let orchestrator = Arc::clone(&h.orchestrator);
    let b_clone = b.clone();
    let pending = tokio::spawn(async move { orchestrator.send(&b_clone, Turn::new("second")).await });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!pending.is_finished());
    assert_eq!(h.runtime.launched().len(), 1);

    h.orchestrator.close(&a).await.unwrap();
    let dispatch = tokio::time::timeout(WAIT, pending).await.unwrap().unwrap().unwrap();
    assert!(matches!(dispatch, Dispatch::Launched { .. }));
    let reply = h.replies.next().await;
    assert_eq!(reply.conversation_id, b);
    assert_eq!(text_of(&reply.outcome), "re: second");
}

#[tokio::test]
async fn test_shutdown_closes_workers_and_refuses_launches() {
    let h = Harness::new().await;
    for id in ["a", "b"] {
        h.orchestrator.send(&conv(id), Turn::new("hi")).await.unwrap();
        h.replies.next().await;
    }
    assert_eq!(h.orchestrator.snapshot().await.len(), 2);

    h.orchestrator.shutdown(WAIT).await;
    assert!(h.orchestrator.snapshot().await.is_empty());

    let err = h.orchestrator.send(&conv("c"), Turn::new("late")).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::ShuttingDown));
    assert!(!h.orchestrator.is_running(&conv("c")).await);
}

#[tokio::test]
async fn test_snapshot_reports_live_workers() {
    let h = Harness::new().await;
    let g1 = conv("g1");
    h.orchestrator.send(&g1, Turn::new("hello")).await.unwrap();
    h.replies.next().await;

    let snapshot = h.orchestrator.snapshot().await;
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].conversation_id, g1);
    assert!(snapshot[0].instance.is_some());
    assert!(!snapshot[0].awaiting_reply);
    assert_eq!(snapshot[0].pending_inputs, 0);
    assert!(!snapshot[0].closing);
}

#[tokio::test]
async fn test_close_mid_round_reports_unanswered_turn() {
    let h = Harness::new().await;
    let g1 = conv("g1");
    h.backend.push_reply(ScriptedReply::Delayed(
        Duration::from_secs(3),
        "too late".to_string(),
    ));

    let Dispatch::Launched { instance } = h.orchestrator.send(&g1, Turn::new("hello")).await.unwrap() else {
        panic!("expected a launch");
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(h.orchestrator.close(&g1).await.unwrap());

    // The round outlives the grace period, so the sandbox is stopped.
    let reply = h.replies.next().await;
    assert_eq!(reply.conversation_id, g1);
    match &reply.outcome {
        Outcome::Error { message } => assert!(message.contains("exited"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }
    h.wait_gone(&g1).await;
    assert_eq!(h.runtime.stopped(), vec![instance]);
    h.replies.assert_quiet(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_follow_up_during_round_outlives_idle_timeout() {
    let h = Harness::with_settings(|s| s.idle_timeout = Duration::from_millis(300)).await;
    let g1 = conv("g1");
    tokio::spawn(Arc::clone(&h.orchestrator).run_idle_watchdog());
    h.backend.push_reply(ScriptedReply::Delayed(
        Duration::from_millis(300),
        "A".to_string(),
    ));
    h.backend.push_reply(ScriptedReply::Delayed(
        Duration::from_millis(1500),
        "B".to_string(),
    ));

    h.orchestrator.send(&g1, Turn::new("a")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        h.orchestrator.send(&g1, Turn::new("b")).await.unwrap(),
        Dispatch::Queued
    );

    assert_eq!(text_of(&h.replies.next().await.outcome), "A");
    // "b" is still unanswered while its round runs past the idle timeout.
    assert_eq!(text_of(&h.replies.next().await.outcome), "B");

    h.wait_gone(&g1).await;
    assert!(h.runtime.stopped().is_empty(), "idle close must wait for the round");
    assert_eq!(
        h.backend.prompts(),
        vec![
            ("s1".to_string(), "a".to_string()),
            ("s1".to_string(), "b".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_launch_failure_fails_turns_queued_behind_it() {
    let h = Harness::with_settings(|s| s.max_concurrent = 1).await;
    let a = conv("a");
    let g1 = conv("g1");

    h.orchestrator.send(&a, Turn::new("hold")).await.unwrap();
    assert_eq!(text_of(&h.replies.next().await.outcome), "re: hold");

    h.runtime.set_mode(SandboxMode::FailLaunch);
    let orchestrator = Arc::clone(&h.orchestrator);
    let g1_clone = g1.clone();
    let first = tokio::spawn(async move { orchestrator.send(&g1_clone, Turn::new("first")).await });

    // The launch waits for a slot; the next turn is accepted meanwhile.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!first.is_finished());
    assert_eq!(
        h.orchestrator.send(&g1, Turn::new("second")).await.unwrap(),
        Dispatch::Queued
    );

    h.orchestrator.close(&a).await.unwrap();
    let err = tokio::time::timeout(WAIT, first).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(err, OrchestratorError::Launch(LaunchError::ImageMissing(_))));

    let reply = h.replies.next().await;
    assert_eq!(reply.conversation_id, g1);
    match &reply.outcome {
        Outcome::Error { message } => assert!(message.contains("launch failed"), "{message}"),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(!h.orchestrator.is_running(&g1).await);
    let mailbox = Mailbox::new(h.mailbox_root.join(mailbox_dir_name(&g1)));
    assert!(mailbox.drain().await.unwrap().is_empty());
    h.replies.assert_quiet(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_undrained_follow_ups_are_relaunched() {
    let h = Harness::new().await;
    let g1 = conv("g1");
    h.runtime.set_mode(SandboxMode::Linger(
        Duration::from_millis(300),
        frame_lines(&ResultFrame::success(
            Some("done".to_string()),
            Some("s1".to_string()),
        )),
    ));

    h.orchestrator.send(&g1, Turn::new("first")).await.unwrap();
    assert_eq!(text_of(&h.replies.next().await.outcome), "done");

    // Published while the sandbox lingers; it exits without reading it.
    assert_eq!(
        h.orchestrator.send(&g1, Turn::new("second")).await.unwrap(),
        Dispatch::Queued
    );
    h.runtime.set_mode(SandboxMode::Worker);

    let reply = h.replies.next().await;
    assert_eq!(text_of(&reply.outcome), "re: second");
    assert_eq!(h.runtime.launched().len(), 2);
    let envelopes = h.runtime.envelopes();
    assert_eq!(envelopes[1].prompt, "second");
    assert_eq!(envelopes[1].session_id.as_deref(), Some("s1"));
    h.replies.assert_quiet(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_shutdown_reports_rounds_cut_short() {
    let h = Harness::new().await;
    let g1 = conv("g1");
    h.backend.push_reply(ScriptedReply::Hang);

    h.orchestrator.send(&g1, Turn::new("hello")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.orchestrator.shutdown(WAIT).await;

    let reply = h.replies.next().await;
    assert!(matches!(reply.outcome, Outcome::Error { .. }));
    assert!(!h.orchestrator.is_running(&g1).await);
}
