//! Report delivery: boot first, periodic status, frame-complete retries.


use std::time::Duration;

use serde_json::json;
use test_harness::TestAgent;

#[tokio::test]
async fn boot_report_arrives_first_with_host_facts() {
    let agent = TestAgent::start().await;
    agent
        .collector
        .wait_for("boot", 1, Duration::from_secs(5))
        .await;
    assert_eq!(agent.collector.kinds()[0], "boot");

    let boot = &agent.collector.of_kind("boot")[0];
    assert_eq!(boot["cores"]["total_cores"], json!(800));
    assert_eq!(boot["host"]["hardware_state"], json!("Up"));
    assert!(boot["host"]["total_mem_kb"].as_u64().unwrap() > 0);
    assert!(!boot["host"]["name"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn status_reports_carry_running_frames() {
    let agent = TestAgent::start().await;
    let machine = agent.machine.clone();
    let run = tokio::spawn(machine.run());

    let request = agent.frame_request("sleep 30");
    let id = request.frame_id;
    agent.machine.launch(request).unwrap();

    // Ping interval is 5s in the harness.
    agent
        .collector
        .wait_for("status", 1, Duration::from_secs(10))
        .await;
    let has_frame = agent.collector.of_kind("status").iter().any(|s| {
        s["frames"]
            .as_array()
            .unwrap()
            .iter()
            .any(|f| f["frame_id"] == json!(id))
    });
    // The frame runs for 30s, so at least one status must list it.
    if !has_frame {
        agent
            .collector
            .wait_for("status", 2, Duration::from_secs(10))
            .await;
        assert!(agent.collector.of_kind("status").iter().any(|s| {
            s["frames"]
                .as_array()
                .unwrap()
                .iter()
                .any(|f| f["frame_id"] == json!(id))
        }));
    }

    agent.token.cancel();
    let _ = run.await;
}

#[tokio::test]
async fn frame_complete_is_retried_until_accepted() {
    let agent = TestAgent::start().await;
    agent.collector.fail_next_completes(2);

    agent
        .machine
        .launch(agent.frame_request("echo done"))
        .unwrap();

    // Two failures then success; retry delay is zero in the harness.
    agent
        .collector
        .wait_for("frame-complete", 1, Duration::from_secs(20))
        .await;
    assert_eq!(agent.collector.of_kind("frame-complete").len(), 1);
}

#[tokio::test]
async fn undeliverable_complete_is_spooled_and_redelivered() {
    use test_harness::assert_eventually;

    let first = TestAgent::start().await;
    // More failures than the retry ceiling: delivery gives up entirely.
    first.collector.fail_next_completes(100);

    let request = first.frame_request("true");
    let id = request.frame_id;
    first.machine.launch(request).unwrap();

    // The report must land in the on-disk spool, not vanish.
    let spool = first.snapshot_path.with_file_name("pending-reports.json");
    let probe_path = spool.clone();
    assert_eventually(Duration::from_secs(20), "spooled report", move || {
        let path = probe_path.clone();
        async move {
            std::fs::read_to_string(&path)
                .map(|s| s.contains(&id.to_string()))
                .unwrap_or(false)
        }
    })
    .await;
    assert!(first.collector.of_kind("frame-complete").is_empty());

    // The next incarnation re-sends the spooled completion on startup.
    let snapshot = first.snapshot_path.clone();
    let second = TestAgent::start_with(move |c| {
        c.backup_cache_path = Some(snapshot);
    })
    .await;
    second
        .collector
        .wait_for("frame-complete", 1, Duration::from_secs(10))
        .await;
    let complete = &second.collector.of_kind("frame-complete")[0];
    assert_eq!(complete["frame"]["frame_id"], json!(id));
    assert!(!spool.exists());
}

#[tokio::test]
async fn completion_reports_preserve_order() {
    let agent = TestAgent::start().await;
    let first = agent.frame_request("echo one");
    let second = agent.frame_request("sleep 1");
    let first_id = first.frame_id;
    let second_id = second.frame_id;

    agent.machine.launch(first).unwrap();
    agent.machine.launch(second).unwrap();

    agent
        .collector
        .wait_for("frame-complete", 2, Duration::from_secs(20))
        .await;
    let completes = agent.collector.of_kind("frame-complete");
    // The echo finishes well before the sleep; FIFO delivery keeps that order.
    assert_eq!(completes[0]["frame"]["frame_id"], json!(first_id));
    assert_eq!(completes[1]["frame"]["frame_id"], json!(second_id));
}
