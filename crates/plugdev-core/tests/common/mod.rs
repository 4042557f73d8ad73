//! Scripted remote-control server for integration tests.

#![allow(dead_code)]

use bytes::BytesMut;
use plugdev_core::protocol::{encode_frame, try_read_frame};
use plugdev_core::Packet;
use serde_json::{json, Value};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub const ADDONS_ACTOR: &str = "server1.conn0.addonsActor2";

/// Actor whose replies are delayed.
pub const SLOW_ACTOR: &str = "slow";
pub const SLOW_DELAY: Duration = Duration::from_millis(100);

/// A fake target speaking the remote-control protocol.
///
/// Every accepted connection is greeted by the root actor. Inbound packets are
/// logged as `recv <to> <type>` as soon as they are read; replies are logged as
/// `reply <to> <type>` when written, so the log shows what was on the wire
/// when.
pub struct FakeRemote {
    pub port: u16,
    pub log: Arc<Mutex<Vec<String>>>,
    pub received: Arc<Mutex<Vec<Packet>>>,
    /// Directory names whose install fails.
    pub failing_installs: Arc<Mutex<HashSet<String>>>,
    hang_up: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl FakeRemote {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        let received: Arc<Mutex<Vec<Packet>>> = Arc::default();
        let failing_installs: Arc<Mutex<HashSet<String>>> = Arc::default();
        let (hang_up, hang_up_rx) = watch::channel(false);

        let state = Shared {
            log: Arc::clone(&log),
            received: Arc::clone(&received),
            failing_installs: Arc::clone(&failing_installs),
            hang_up: hang_up_rx,
        };
        let task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(serve(stream, state.clone()));
            }
        });

        Self {
            port,
            log,
            received,
            failing_installs,
            hang_up,
            task,
        }
    }

    /// Close every open connection from the server side.
    pub fn hang_up(&self) {
        self.hang_up.send_replace(true);
    }

    pub fn fail_install(&self, dir_name: &str) {
        self.failing_installs
            .lock()
            .unwrap()
            .insert(dir_name.to_string());
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    /// Types of the received packets, in arrival order.
    pub fn received_kinds(&self) -> Vec<String> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|p| p.kind().unwrap_or_default().to_string())
            .collect()
    }

    pub fn received(&self) -> Vec<Packet> {
        self.received.lock().unwrap().clone()
    }
}

impl Drop for FakeRemote {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Clone)]
struct Shared {
    log: Arc<Mutex<Vec<String>>>,
    received: Arc<Mutex<Vec<Packet>>>,
    failing_installs: Arc<Mutex<HashSet<String>>>,
    hang_up: watch::Receiver<bool>,
}

async fn serve(stream: tokio::net::TcpStream, mut state: Shared) {
    let (mut reader, mut writer) = stream.into_split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<(String, Packet)>();

    let log = Arc::clone(&state.log);
    let writer_task = tokio::spawn(async move {
        let greeting = packet(json!({
            "from": "root",
            "applicationType": "browser",
            "traits": {"sources": true}
        }));
        if writer
            .write_all(&encode_frame(&greeting).unwrap())
            .await
            .is_err()
        {
            return;
        }
        while let Some((label, reply)) = reply_rx.recv().await {
            log.lock().unwrap().push(format!("reply {}", label));
            if writer
                .write_all(&encode_frame(&reply).unwrap())
                .await
                .is_err()
            {
                return;
            }
        }
    });

    let mut buf = BytesMut::new();
    loop {
        while let Ok(Some(request)) = try_read_frame(&mut buf) {
            let to = request.target().unwrap_or_default().to_string();
            let kind = request.kind().unwrap_or_default().to_string();
            let label = format!("{} {}", to, kind);
            state.log.lock().unwrap().push(format!("recv {}", label));
            state.received.lock().unwrap().push(request.clone());

            let reply = respond(&request, &state);
            let delay = if to == SLOW_ACTOR {
                SLOW_DELAY
            } else {
                Duration::ZERO
            };
            let reply_tx = reply_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = reply_tx.send((label, reply));
            });
        }
        tokio::select! {
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
            _ = state.hang_up.wait_for(|hung_up| *hung_up) => {
                writer_task.abort();
                return;
            }
        }
    }

    drop(reply_tx);
    let _ = writer_task.await;
}

fn respond(request: &Packet, state: &Shared) -> Packet {
    let to = request.target().unwrap_or_default();
    let kind = request.kind().unwrap_or_default();

    match (to, kind) {
        ("root", "getRoot") => packet(json!({
            "from": "root",
            "addonsActor": ADDONS_ACTOR,
            "deviceActor": "server1.conn0.deviceActor1"
        })),
        ("root", "quit") => packet(json!({"from": "root"})),
        (ADDONS_ACTOR, "installTemporaryAddon") => {
            let path = PathBuf::from(request.get_str("addonPath").unwrap_or_default());
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if state.failing_installs.lock().unwrap().contains(&name) {
                packet(json!({
                    "from": ADDONS_ACTOR,
                    "error": "installError",
                    "message": format!("Could not install add-on at '{}'", path.display())
                }))
            } else {
                packet(json!({
                    "from": ADDONS_ACTOR,
                    "addon": {"id": format!("{}@fake", name), "actor": false}
                }))
            }
        }
        (ADDONS_ACTOR, "uninstallAddon") => packet(json!({"from": ADDONS_ACTOR})),
        (actor, "echo") => packet(json!({
            "from": actor,
            "echo": request.get("value").cloned().unwrap_or(Value::Null)
        })),
        (actor, other) => packet(json!({
            "from": actor,
            "error": "unrecognizedPacketType",
            "message": format!("Actor {} does not recognize the packet type {}", actor, other)
        })),
    }
}

pub fn packet(value: Value) -> Packet {
    Packet::from(value.as_object().cloned().unwrap())
}

/// Write an executable shell script usable as a fake target binary.
///
/// The script answers `--check` immediately; this helper waits until the
/// script can be executed so a concurrently forking test cannot make the
/// real spawn fail with ETXTBSY.
#[cfg(unix)]
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    let script = format!(
        "#!/bin/sh\n[ \"$1\" = \"--check\" ] && exit 0\n{}\n",
        body
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    for _ in 0..100 {
        match std::process::Command::new(&path).arg("--check").status() {
            Ok(_) => return path,
            Err(e) if e.raw_os_error() == Some(26) => {
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => panic!("cannot run {}: {}", path.display(), e),
        }
    }
    panic!("{} stayed busy", path.display());
}
