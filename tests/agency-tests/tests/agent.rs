use agency::*;
use agency_tests::*;
use anyhow::Result;
use serde_json::json;
use serial_test::serial;
use std::time::Duration;

const TIMEOUT: Duration = Duration::from_secs(10);

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn inquire_by_client_id() -> Result<()> {
    let cluster = Cluster::new(3).await?;
    cluster.elect(0, 1).await?;

    let leader = cluster.agent(0);
    let resp = leader
        .write(vec![
            request::Transaction::new(json!({ "a": 1 })).with_client_id("c-1"),
            request::Transaction::new(json!({ "b": 1 })),
            request::Transaction::new(json!({ "a": 2 })).with_client_id("c-1"),
        ])
        .await?;
    assert!(resp.accepted);
    assert_eq!(leader.wait_for(resp.indices[2], TIMEOUT).await, WaitResult::Ok);

    let found = leader
        .inquire(&["c-1".to_string(), "c-2".to_string()])
        .await?;
    assert_eq!(found["c-1"], vec![resp.indices[0], resp.indices[2]]);
    assert!(found["c-2"].is_empty());

    assert!(cluster.agent(1).inquire(&["c-1".to_string()]).await.is_err());
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn applied_entries_are_broadcast_in_order() -> Result<()> {
    let cluster = Cluster::new(3).await?;
    let mut leader_rx = cluster.agent(0).subscribe_applied();
    let mut follower_rx = cluster.agent(2).subscribe_applied();
    cluster.elect(0, 1).await?;

    let mut last = 0;
    for i in 0..30 {
        last = cluster.put(0, "n", json!(i)).await?;
    }
    cluster.wait_commit(2, last, TIMEOUT).await?;

    for rx in [&mut leader_rx, &mut follower_rx] {
        let mut expected = 1;
        while expected <= last {
            let batch = rx.recv().await?;
            for e in batch.iter() {
                assert_eq!(e.index, expected);
                expected += 1;
            }
        }
    }
    assert_eq!(cluster.log(2).get("n"), Some(json!(29)));
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn read_waits_for_readiness() -> Result<()> {
    let mut cluster = Cluster::builder()
        .configure(|config| config.max_ping = Duration::from_secs(1))
        .build(3)
        .await?;
    cluster.env().disconnect(1);
    cluster.env().disconnect(2);
    cluster.elect(0, 1).await?;

    // The entry of taking office can't be committed without a quorum.
    let e = cluster.agent(0).read(json!("a")).await.unwrap_err();
    assert!(matches!(e.downcast_ref::<Error>(), Some(Error::NotReady)));

    cluster.env().connect(1);
    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        match cluster.agent(0).read(json!("a")).await {
            Ok(resp) => {
                assert!(resp.accepted);
                break;
            }
            Err(e) => {
                assert!(matches!(e.downcast_ref::<Error>(), Some(Error::NotReady)));
                assert!(tokio::time::Instant::now() < deadline, "never ready");
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        }
    }
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn progress_report() -> Result<()> {
    let mut cluster = Cluster::new(3).await?;
    cluster.elect(0, 1).await?;
    cluster.env().disconnect(2);

    let index = cluster.put(0, "a", json!(1)).await?;
    assert_eq!(cluster.agent(0).wait_for(index, TIMEOUT).await, WaitResult::Ok);

    let report = cluster.agent(0).progress_report();
    assert_eq!(report.len(), 2);
    assert_eq!(report[0].member, member_id(1));
    assert_eq!(report[0].last_acked_index, index);
    assert!(report[0].since_last_send.is_some());
    assert_eq!(report[1].member, member_id(2));
    assert!(report[1].last_acked_index < index);
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn shrink_membership() -> Result<()> {
    let mut cluster = Cluster::new(3).await?;
    cluster.elect(0, 1).await?;
    cluster.env().disconnect(2);
    cluster.env().disconnect(1);

    // 2 of 3 are gone. With a single member left the leader commits alone.
    cluster.agent(0).set_active_members(&[member_id(0)]);
    let index = cluster.put(0, "a", json!(1)).await?;
    assert_eq!(cluster.agent(0).wait_for(index, TIMEOUT).await, WaitResult::Ok);
    assert!(cluster.agent(0).progress_report().is_empty());
    Ok(())
}

#[serial]
#[tokio::test(flavor = "multi_thread")]
async fn resign_releases_waiters() -> Result<()> {
    let mut cluster = Cluster::new(3).await?;
    cluster.elect(0, 1).await?;
    cluster.env().disconnect(1);
    cluster.env().disconnect(2);

    let leader = cluster.agent(0);
    let index = cluster.put(0, "a", json!(1)).await?;
    let waiter = {
        let leader = leader.clone();
        tokio::spawn(async move { leader.wait_for(index, Duration::from_secs(3600)).await })
    };
    let poller = {
        let leader = leader.clone();
        tokio::spawn(async move { leader.poll(index, Duration::from_secs(3600)).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    leader.resign().await;

    assert_eq!(waiter.await?, WaitResult::Unknown);
    assert!(poller.await?.is_err());
    assert!(!leader.is_leading());
    Ok(())
}
