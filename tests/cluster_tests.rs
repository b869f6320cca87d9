//! Integration tests for supervisor-side cleanup

use proxiable::cluster::protocol::{frame_message, write_frame};
use proxiable::cluster::{worker_id, Coordinator, WorkerNotice};
use proxiable::exit::ExitRegistry;
use proxiable::ListenAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::{sleep, timeout};
use uuid::Uuid;

fn listening(address: ListenAddr) -> WorkerNotice {
    WorkerNotice::Listening {
        worker_id: Uuid::new_v4(),
        address,
    }
}

#[test]
fn test_test_process_is_not_a_worker() {
    assert_eq!(worker_id(), None);
}

#[tokio::test]
async fn test_coordinator_unlinks_announced_socket() {
    let temp_dir = tempdir().unwrap();
    let socket_path = temp_dir.path().join("worker.sock");
    // The handle lives "in the worker"; the coordinator never holds it
    let _worker_listener = std::os::unix::net::UnixListener::bind(&socket_path).unwrap();

    let exits = Arc::new(ExitRegistry::new());
    let coordinator = Coordinator::with_exit_registry(Arc::clone(&exits));

    let (mut tx, rx) = tokio::io::duplex(1024);
    write_frame(&mut tx, &listening(ListenAddr::Path(socket_path.clone())))
        .await
        .unwrap();
    drop(tx);

    coordinator.watch(rx).await.unwrap();
    assert_eq!(coordinator.tracked_paths(), vec![socket_path.clone()]);
    assert_eq!(exits.pending(), 1);

    exits.run();
    assert!(!socket_path.exists());
}

#[tokio::test]
async fn test_coordinator_registers_each_path_once() {
    let temp_dir = tempdir().unwrap();
    let socket_path = temp_dir.path().join("shared.sock");
    let _listener = std::os::unix::net::UnixListener::bind(&socket_path).unwrap();

    let exits = Arc::new(ExitRegistry::new());
    let coordinator = Coordinator::with_exit_registry(Arc::clone(&exits));

    let address = ListenAddr::Path(socket_path.clone());
    assert!(coordinator.observe(&listening(address.clone())).await);
    assert!(!coordinator.observe(&listening(address)).await);
    assert_eq!(exits.pending(), 1);
}

#[tokio::test]
async fn test_coordinator_ignores_tcp_and_non_sockets() {
    let temp_dir = tempdir().unwrap();
    let regular = temp_dir.path().join("regular.sock");
    std::fs::write(&regular, b"").unwrap();

    let exits = Arc::new(ExitRegistry::new());
    let coordinator = Coordinator::with_exit_registry(Arc::clone(&exits));

    assert!(
        !coordinator
            .observe(&listening("127.0.0.1:8080".parse().unwrap()))
            .await
    );
    assert!(!coordinator.observe(&listening(ListenAddr::Path(regular.clone()))).await);
    assert!(
        !coordinator
            .observe(&listening(ListenAddr::Path(temp_dir.path().join("none.sock"))))
            .await
    );
    assert_eq!(exits.pending(), 0);
    assert!(regular.exists());
}

#[tokio::test]
async fn test_watch_skips_garbage_frames() {
    let temp_dir = tempdir().unwrap();
    let socket_path = temp_dir.path().join("after-garbage.sock");
    let _listener = std::os::unix::net::UnixListener::bind(&socket_path).unwrap();

    let exits = Arc::new(ExitRegistry::new());
    let coordinator = Coordinator::with_exit_registry(Arc::clone(&exits));

    let (mut tx, rx) = tokio::io::duplex(1024);
    tx.write_all(&frame_message(&[0xc1, 0xc1])).await.unwrap();
    write_frame(&mut tx, &listening(ListenAddr::Path(socket_path.clone())))
        .await
        .unwrap();
    drop(tx);

    coordinator.watch(rx).await.unwrap();
    assert_eq!(coordinator.tracked_paths(), vec![socket_path]);
}

async fn wait_for_tracked(coordinator: &Coordinator, socket_path: &Path) {
    let tracked = timeout(Duration::from_secs(10), async {
        while !coordinator
            .tracked_paths()
            .iter()
            .any(|p| p == socket_path)
        {
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(tracked.is_ok(), "worker never announced {:?}", socket_path);
}

#[tokio::test]
async fn test_spawned_worker_socket_is_cleaned_by_coordinator() {
    let temp_dir = tempdir().unwrap();
    let socket_path = temp_dir.path().join("spawned.sock");

    let exits = Arc::new(ExitRegistry::new());
    let coordinator = Arc::new(Coordinator::with_exit_registry(Arc::clone(&exits)));

    let mut command = Command::new(env!("CARGO_BIN_EXE_proxiable"));
    command
        .arg("serve")
        .arg(&socket_path)
        .kill_on_drop(true);
    let mut worker = coordinator.spawn_worker(command).unwrap();

    wait_for_tracked(&coordinator, &socket_path).await;

    // A worker killed outright cannot clean up after itself
    worker.child.start_kill().unwrap();
    worker.child.wait().await.unwrap();
    assert!(socket_path.exists());

    exits.run();
    assert!(!socket_path.exists());
}
