use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use kiln_core::{Task, TaskState};
use kiln_link::split;
use kiln_master::{Master, MasterConfig, MasterHandle};
use kiln_protocol::{BinaryFile, Letter, PropertyNotify, Response, ResponseState};
use kiln_store::{MemoryStore, Storage};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

fn config(dir: &TempDir) -> MasterConfig {
    let raw = format!(
        "Address: 127.0.0.1\nPort: 0\nLogDir: {logs}\nResultDir: {results}\nBuild:\n  cmd: [\"make\"]\n  output: ./out/fw.bin\n",
        logs = dir.path().join("logs").display(),
        results = dir.path().join("results").display(),
    );
    MasterConfig::from_yaml(&raw).expect("master config")
}

async fn start(dir: &TempDir, store: &MemoryStore) -> MasterHandle {
    Master::new(config(dir))
        .with_storage(Arc::new(store.clone()))
        .start()
        .await
        .expect("master starts")
}

/// A worker that "builds" every task it gets by streaming back a small file.
async fn spawn_worker(addr: SocketAddr, ident: &'static str, max: usize) -> JoinHandle<Vec<String>> {
    let stream = TcpStream::connect(addr).await.expect("connect to master");
    let (mut reader, mut writer) = split(stream);
    writer
        .send(Letter::from(PropertyNotify::new(ident, max, 0)))
        .await
        .expect("send notify");

    tokio::spawn(async move {
        let mut built = Vec::new();
        while let Some(Ok(frame)) = reader.next().await {
            let task = match Letter::parse(&frame).expect("parse letter") {
                Letter::NewTask(task) => task,
                _ => continue,
            };
            let tid = task.tid().to_string();
            writer
                .send(Letter::from(Response::new(ident, &tid, None, ResponseState::InProc)))
                .await
                .expect("in-proc response");
            tokio::time::sleep(Duration::from_millis(20)).await;

            let chunk = BinaryFile::chunk(&tid, "./out/fw.bin", Bytes::from(format!("built {tid}")));
            let last = chunk.terminator();
            writer.send(Letter::from(chunk)).await.expect("chunk");
            writer.send(Letter::from(last)).await.expect("terminator");
            writer
                .send(Letter::from(Response::new(ident, &tid, None, ResponseState::Finished)))
                .await
                .expect("finished response");
            built.push(tid);
        }
        built
    })
}

async fn wait_for(what: &str, mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn four_tasks_on_two_single_slot_workers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = MemoryStore::new();
    let master = start(&dir, &store).await;
    let addr = master.local_addr();

    let w1 = spawn_worker(addr, "w1", 1).await;
    let w2 = spawn_worker(addr, "w2", 1).await;
    wait_for("workers online", || master.room().online_count() == 2).await;

    let dispatcher = Arc::clone(master.dispatcher());
    let tids = ["fw-1", "fw-2", "fw-3", "fw-4"];
    for tid in tids {
        dispatcher
            .dispatch(Task::new(tid, "SN100", "v2.1").expect("task"))
            .await
            .expect("dispatch");
    }

    wait_for("all tasks finished", || {
        tids.iter()
            .all(|tid| dispatcher.state_of(tid) == Some(TaskState::Finished))
    })
    .await;

    for tid in tids {
        assert!(store.exists(tid, "fw.bin").await.expect("exists"), "{tid} stored");
        assert_eq!(
            dispatcher.retrieve(tid).await,
            Some(format!("{tid}/fw.bin"))
        );
        let copied = dir.path().join("results").join(tid).join("fw.bin");
        assert_eq!(
            std::fs::read_to_string(copied).expect("copied result"),
            format!("built {tid}")
        );
    }
    assert_eq!(store.len(), 4);
    assert!(master.room().in_proc_of("w1").is_empty());
    assert!(master.room().in_proc_of("w2").is_empty());

    master.shutdown().await;
    let mut built = w1.await.expect("w1 task");
    built.extend(w2.await.expect("w2 task"));
    built.sort();
    assert_eq!(built, tids);
}

#[tokio::test]
async fn task_waits_until_a_worker_arrives() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = MemoryStore::new();
    let master = start(&dir, &store).await;
    let dispatcher = Arc::clone(master.dispatcher());
    let mut events = dispatcher.subscribe();

    dispatcher
        .dispatch(Task::new("late", "SN1", "v1").expect("task"))
        .await
        .expect("dispatch");
    assert_eq!(dispatcher.state_of("late"), Some(TaskState::Prepare));
    assert_eq!(dispatcher.waiting(), vec!["late"]);

    let worker = spawn_worker(master.local_addr(), "w1", 2).await;
    wait_for("late task finished", || {
        dispatcher.state_of("late") == Some(TaskState::Finished)
    })
    .await;

    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event.state);
    }
    assert_eq!(
        seen,
        vec![TaskState::Prepare, TaskState::InProc, TaskState::Finished]
    );

    master.shutdown().await;
    assert_eq!(worker.await.expect("worker task"), vec!["late"]);
}
