//! Drain semantics: intents act only once the host empties, and a full
//! unlock rescinds them.


use std::time::Duration;

use rqd::machine::{ExitAction, Intent};
use test_harness::TestAgent;

#[tokio::test]
async fn idle_host_shuts_down_immediately() {
    let agent = TestAgent::start().await;
    agent.machine.shutdown_idle();
    let action = tokio::time::timeout(Duration::from_secs(5), agent.machine.clone().run())
        .await
        .expect("run loop should exit");
    assert_eq!(action, Some(ExitAction::Shutdown));
}

#[tokio::test]
async fn shutdown_waits_for_running_frame() {
    let agent = TestAgent::start().await;
    agent.machine.launch(agent.frame_request("sleep 1")).unwrap();
    agent.machine.shutdown_idle();
    assert_eq!(agent.machine.intent(), Intent::Shutdown);

    let action = tokio::time::timeout(Duration::from_secs(15), agent.machine.clone().run())
        .await
        .expect("run loop should exit after the frame drains");
    assert_eq!(action, Some(ExitAction::Shutdown));
    assert!(agent.machine.cache.is_empty());
}

#[tokio::test]
async fn shutdown_now_kills_and_exits() {
    let agent = TestAgent::start().await;
    let request = agent.frame_request("sleep 30");
    agent.machine.launch(request).unwrap();
    // Let the child spawn before killing it.
    tokio::time::sleep(Duration::from_millis(500)).await;

    agent.machine.shutdown_now();
    let action = tokio::time::timeout(Duration::from_secs(15), agent.machine.clone().run())
        .await
        .expect("run loop should exit");
    assert_eq!(action, Some(ExitAction::Shutdown));
}

#[tokio::test]
async fn restart_intent_returns_restart_action() {
    let agent = TestAgent::start().await;
    agent.machine.restart_idle();
    let action = tokio::time::timeout(Duration::from_secs(5), agent.machine.clone().run())
        .await
        .expect("run loop should exit");
    assert_eq!(action, Some(ExitAction::Restart));
}

#[tokio::test]
async fn unlock_all_rescinds_a_pending_intent() {
    let agent = TestAgent::start().await;
    agent.machine.shutdown_idle();
    agent.machine.unlock_all();
    assert_eq!(agent.machine.intent(), Intent::None);

    let run = tokio::spawn(agent.machine.clone().run());
    // With the intent gone the loop keeps running.
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!run.is_finished());

    agent.token.cancel();
    let action = tokio::time::timeout(Duration::from_secs(5), run)
        .await
        .expect("run loop should exit on cancellation")
        .unwrap();
    assert_eq!(action, None);
}
