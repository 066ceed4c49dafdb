use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use netmarshal::store::types::{
    ProtocolKind, RoleOutcome, ScheduleEntry, StationProfile, StationRole, Trigger,
};
use netmarshal::store::ScheduleStore;
use netmarshal::{EngineError, Orchestrator};

/// Fake rig-control daemon: answers `f` probes and acknowledges set frames.
async fn spawn_rig_daemon() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let reply = if line.trim() == "f" {
                        "14070000"
                    } else {
                        "RPRT 0"
                    };
                    if write
                        .write_all(format!("{}\n", reply).as_bytes())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }
    });
    addr
}

fn rig_profile(addr: std::net::SocketAddr) -> StationProfile {
    StationProfile {
        role: StationRole::Rig,
        protocol: ProtocolKind::RigSocket,
        host: addr.ip().to_string(),
        port: addr.port(),
        path: None,
        timeout_ms: Some(1000),
    }
}

fn file_profile(role: StationRole, dir: &std::path::Path, name: &str) -> StationProfile {
    StationProfile {
        role,
        protocol: ProtocolKind::FileWatch,
        host: String::new(),
        port: 0,
        path: Some(dir.join(name)),
        timeout_ms: None,
    }
}

#[tokio::test]
async fn one_shot_fires_on_time_and_leaves_the_schedule() {
    let daemon = spawn_rig_daemon().await;
    let orchestrator = Orchestrator::new(ScheduleStore::open_in_memory().unwrap());
    orchestrator
        .configure_station(rig_profile(daemon))
        .await
        .unwrap();

    let mut entry = ScheduleEntry::new(
        Trigger::Once {
            at: Utc::now() + chrono::Duration::seconds(2),
        },
        vec![StationRole::Rig],
    );
    entry.frequency_hz = Some(14_070_000);
    let id = orchestrator.schedule(entry).await.unwrap();

    let shutdown = CancellationToken::new();
    let scheduler = orchestrator.spawn_scheduler(shutdown.clone());

    // Not fired yet.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(orchestrator.last_result(id).await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(3000)).await;
    let result = orchestrator.last_result(id).await.unwrap().unwrap();
    assert_eq!(result.outcomes[&StationRole::Rig], RoleOutcome::Succeeded);
    assert!(orchestrator.list_schedule().await.unwrap().is_empty());

    shutdown.cancel();
    scheduler.await.unwrap().unwrap();
}

#[tokio::test]
async fn schedule_edit_interrupts_the_sleep_for_near_term_entries() {
    let dir = tempfile::tempdir().unwrap();
    let orchestrator = Orchestrator::new(ScheduleStore::open_in_memory().unwrap());
    orchestrator
        .configure_station(file_profile(StationRole::NetTool, dir.path(), "NETCTL.TXT"))
        .await
        .unwrap();

    // Scheduler starts with an empty schedule and parks on the notifier.
    let shutdown = CancellationToken::new();
    let scheduler = orchestrator.spawn_scheduler(shutdown.clone());
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut entry = ScheduleEntry::new(
        Trigger::Once {
            at: Utc::now() + chrono::Duration::seconds(1),
        },
        vec![StationRole::NetTool],
    );
    entry.message = Some("late add fires anyway".to_string());
    let id = orchestrator.schedule(entry).await.unwrap();

    tokio::time::sleep(Duration::from_millis(2500)).await;
    let result = orchestrator.last_result(id).await.unwrap().unwrap();
    assert!(result.all_succeeded());

    shutdown.cancel();
    scheduler.await.unwrap().unwrap();
}

/// Daemon that talks gibberish: the reachability probe fails permanently.
async fn spawn_confused_daemon() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(_)) = lines.next_line().await {
                    if write.write_all(b"ERR\n").await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn unreachable_role_does_not_drag_down_its_siblings() {
    let confused = spawn_confused_daemon().await;
    let dir = tempfile::tempdir().unwrap();

    let orchestrator = Orchestrator::new(ScheduleStore::open_in_memory().unwrap());
    orchestrator
        .configure_station(rig_profile(confused))
        .await
        .unwrap();
    orchestrator
        .configure_station(file_profile(
            StationRole::Messenger,
            dir.path(),
            "MSG.TXT",
        ))
        .await
        .unwrap();
    orchestrator
        .configure_station(file_profile(StationRole::NetTool, dir.path(), "NETCTL.TXT"))
        .await
        .unwrap();

    let mut entry = ScheduleEntry::new(
        Trigger::Once {
            at: Utc::now() + chrono::Duration::hours(1),
        },
        vec![
            StationRole::Rig,
            StationRole::Messenger,
            StationRole::NetTool,
        ],
    );
    entry.frequency_hz = Some(7_078_000);
    entry.message = Some("net starting".to_string());
    let id = orchestrator.schedule(entry).await.unwrap();

    let result = orchestrator.force_fire_now(id).await.unwrap();
    assert_eq!(
        result.outcomes[&StationRole::Rig],
        RoleOutcome::SkippedUnreachable
    );
    assert_eq!(
        result.outcomes[&StationRole::Messenger],
        RoleOutcome::Succeeded
    );
    assert_eq!(
        result.outcomes[&StationRole::NetTool],
        RoleOutcome::Succeeded
    );

    // Partial success parks the one-shot disabled instead of removing it.
    let listed = orchestrator.list_schedule().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].enabled);

    // Both drop files really got their lines.
    let msg = std::fs::read_to_string(dir.path().join("MSG.TXT")).unwrap();
    assert!(msg.contains("QSY 7078000"));
    assert!(msg.contains("MSG net starting"));
}

/// Daemon that answers the `f` probe but rejects every set command,
/// counting the rejections.
async fn spawn_rejecting_daemon(command_attempts: Arc<AtomicUsize>) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let attempts = command_attempts.clone();
            tokio::spawn(async move {
                let (read, mut write) = stream.into_split();
                let mut lines = BufReader::new(read).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let reply = if line.trim() == "f" {
                        "14070000"
                    } else {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        "RPRT -1"
                    };
                    if write
                        .write_all(format!("{}\n", reply).as_bytes())
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }
    });
    addr
}

#[tokio::test]
async fn failed_one_shot_is_parked_not_refired() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let daemon = spawn_rejecting_daemon(attempts.clone()).await;

    let orchestrator = Orchestrator::new(ScheduleStore::open_in_memory().unwrap());
    orchestrator
        .configure_station(rig_profile(daemon))
        .await
        .unwrap();

    let mut entry = ScheduleEntry::new(
        Trigger::Once {
            at: Utc::now() + chrono::Duration::seconds(1),
        },
        vec![StationRole::Rig],
    );
    entry.frequency_hz = Some(14_070_000);
    let id = orchestrator.schedule(entry).await.unwrap();

    let shutdown = CancellationToken::new();
    let scheduler = orchestrator.spawn_scheduler(shutdown.clone());

    // The rejection is permanent, so one attempt total, no matter how long
    // the loop keeps running afterwards.
    tokio::time::sleep(Duration::from_millis(3000)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);

    let result = orchestrator.last_result(id).await.unwrap().unwrap();
    assert!(matches!(
        result.outcomes[&StationRole::Rig],
        RoleOutcome::Failed { .. }
    ));
    let listed = orchestrator.list_schedule().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert!(!listed[0].enabled);

    shutdown.cancel();
    scheduler.await.unwrap().unwrap();
}

#[tokio::test]
async fn cancel_before_the_trigger_prevents_the_fire() {
    let daemon = spawn_rig_daemon().await;
    let orchestrator = Orchestrator::new(ScheduleStore::open_in_memory().unwrap());
    orchestrator
        .configure_station(rig_profile(daemon))
        .await
        .unwrap();

    let mut entry = ScheduleEntry::new(
        Trigger::Once {
            at: Utc::now() + chrono::Duration::seconds(2),
        },
        vec![StationRole::Rig],
    );
    entry.frequency_hz = Some(14_070_000);
    let id = orchestrator.schedule(entry).await.unwrap();

    let shutdown = CancellationToken::new();
    let scheduler = orchestrator.spawn_scheduler(shutdown.clone());

    tokio::time::sleep(Duration::from_millis(500)).await;
    orchestrator.cancel(id).await.unwrap();

    // Well past the original trigger time: nothing fired, nothing recorded.
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert!(orchestrator.last_result(id).await.unwrap().is_none());
    assert!(orchestrator.list_schedule().await.unwrap().is_empty());

    shutdown.cancel();
    scheduler.await.unwrap().unwrap();
}

#[tokio::test]
async fn a_persistence_failure_halts_the_loop() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sched.db");
    let orchestrator = Orchestrator::new(ScheduleStore::open(&path).unwrap());

    let mut entry = ScheduleEntry::new(
        Trigger::Once {
            at: Utc::now() + chrono::Duration::seconds(1),
        },
        vec![StationRole::Rig],
    );
    entry.frequency_hz = Some(14_070_000);
    orchestrator.schedule(entry).await.unwrap();

    let shutdown = CancellationToken::new();
    let scheduler = orchestrator.spawn_scheduler(shutdown.clone());
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Pull the schema out from under the sleeping loop; its next query
    // must surface the error instead of dropping schedules silently.
    let raze = rusqlite::Connection::open(&path).unwrap();
    raze.execute("DROP TABLE schedule_entries", []).unwrap();

    let halted = tokio::time::timeout(Duration::from_secs(5), scheduler)
        .await
        .expect("loop should halt on its own")
        .unwrap();
    assert!(matches!(halted, Err(EngineError::Persistence(_))));
}

#[tokio::test]
async fn recurring_entry_advances_and_stays_listed() {
    let dir = tempfile::tempdir().unwrap();
    let store = ScheduleStore::open_in_memory().unwrap();
    let orchestrator = Orchestrator::new(store);
    orchestrator
        .configure_station(file_profile(StationRole::NetTool, dir.path(), "NETCTL.TXT"))
        .await
        .unwrap();

    let mut entry = ScheduleEntry::new(
        Trigger::Daily { hour: 0, minute: 0 },
        vec![StationRole::NetTool],
    );
    entry.message = Some("daily net".to_string());
    let id = orchestrator.schedule(entry).await.unwrap();

    let result = orchestrator.force_fire_now(id).await.unwrap();
    assert!(result.all_succeeded());

    // Recurring entries are never auto-removed, even on full success.
    let listed = orchestrator.list_schedule().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, id);
}
