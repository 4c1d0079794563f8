use agency::*;
use agency_tests::*;
use anyhow::Result;
use serde_json::json;
use serial_test::serial;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

async fn compacted_cluster() -> Result<Cluster> {
    Cluster::builder()
        .configure(|config| {
            config.compaction_step_size = 100;
            config.compaction_keep_size = 10;
        })
        .build(3)
        .await
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn lagging_follower_gets_snapshot() -> Result<()> {
    let mut cluster = compacted_cluster().await?;
    cluster.elect(0, 1).await?;
    cluster.env().disconnect(2);

    let mut last = 0;
    for i in 0..120 {
        last = cluster.put(0, &format!("k{i}"), json!(i)).await?;
    }
    assert_eq!(cluster.agent(0).wait_for(last, TIMEOUT).await, WaitResult::Ok);

    let log = cluster.log(0);
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    let snapshot = loop {
        if let Some(snapshot) = log.load_latest_snapshot().await? {
            break snapshot;
        }
        assert!(tokio::time::Instant::now() < deadline, "never compacted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert!(snapshot.index >= 100);
    // Keep 10 entries below the compaction point.
    assert_eq!(log.first_index().await?, snapshot.index - 10 + 1);

    // Agent 2 acknowledged nothing the leader still has.
    cluster.env().connect(2);
    cluster.wait_commit(2, last, TIMEOUT).await?;
    let follower = cluster.log(2);
    for i in [0, 50, 119] {
        assert_eq!(follower.get(&format!("k{i}")), Some(json!(i)));
    }
    assert!(follower.load_latest_snapshot().await?.is_some());
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn poll_below_first_index_returns_state() -> Result<()> {
    let cluster = compacted_cluster().await?;
    cluster.elect(0, 1).await?;

    let mut last = 0;
    for i in 0..110 {
        last = cluster.put(0, &format!("k{i}"), json!(i)).await?;
    }
    assert_eq!(cluster.agent(0).wait_for(last, TIMEOUT).await, WaitResult::Ok);

    let log = cluster.log(0);
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    while log.first_index().await? <= 2 {
        assert!(tokio::time::Instant::now() < deadline, "never compacted");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let first_index = log.first_index().await?;

    match cluster.agent(0).poll(2, Duration::from_secs(1)).await? {
        PollResult::State {
            state,
            first_index: first,
            commit_index,
        } => {
            assert_eq!(first, first_index);
            assert_eq!(commit_index, last);
            assert_eq!(state["k0"], json!(0));
            assert_eq!(state["k109"], json!(109));
        }
        r => panic!("unexpected {r:?}"),
    }

    // Retained history comes as a log slice.
    match cluster.agent(0).poll(last, Duration::from_secs(1)).await? {
        PollResult::Log {
            entries,
            commit_index,
        } => {
            assert_eq!(commit_index, last);
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].index, last);
        }
        r => panic!("unexpected {r:?}"),
    }
    Ok(())
}
