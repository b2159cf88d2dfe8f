//! End-to-end worker scenarios from the testable-properties list: spawn+invoke and
//! crash recovery. Uses a tiny python3 HTTP worker as the subprocess under test since
//! the supervisor only cares about the process/port/HTTP contract, not the language
//! tenant code happens to be written in. Skips (rather than fails) if python3 is not
//! on PATH in the executing environment.

use core_content_store::{ContentStoreClient, MemoryBackend, UploadOptions};
use core_runtime::{HttpEvent, NewFunction, PortAllocator, PortRange, WorkerSupervisor, WorkerSupervisorConfig};
use core_common::ids::OwnerId;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const WORKER_SCRIPT: &str = r#"#!/usr/bin/env python3
import http.server, os, socketserver

port = int(os.environ["WORKER_PORT"])
pid = os.getpid()

class Handler(http.server.BaseHTTPRequestHandler):
    def do_GET(self):
        if self.path == "/health":
            self.send_response(200)
            self.end_headers()
            return
        body = ("hello:%d" % pid).encode()
        self.send_response(200)
        self.send_header("Content-Length", str(len(body)))
        self.end_headers()
        self.wfile.write(body)

    def log_message(self, *args):
        pass

class Server(socketserver.TCPServer):
    allow_reuse_address = True

with Server(("127.0.0.1", port), Handler) as httpd:
    httpd.serve_forever()
"#;

fn python3_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

async fn deploy_test_function(supervisor: &WorkerSupervisor, content_store: &ContentStoreClient) -> core_common::ids::FunctionId {
    let upload = content_store
        .upload(
            WORKER_SCRIPT.as_bytes(),
            &UploadOptions {
                filename: "worker.py".to_string(),
                permanent: false,
            },
        )
        .await
        .unwrap();

    let function = supervisor
        .deploy_function(NewFunction {
            name: "hello-worker".to_string(),
            owner: OwnerId("tenant-1".to_string()),
            code_cid: upload.cid,
            entry_point: "main".to_string(),
            memory_limit_mb: 128,
            timeout_ms: 5_000,
            env: HashMap::new(),
        })
        .await
        .unwrap();
    function.id
}

#[tokio::test]
async fn worker_spawn_and_invoke_reuses_same_instance() {
    if !python3_available() {
        eprintln!("skipping: python3 not available");
        return;
    }

    let content_store = Arc::new(ContentStoreClient::new(Arc::new(MemoryBackend::new())));
    let ports = Arc::new(PortAllocator::new(PortRange { min: 33000, max: 33099 }));
    let work_root = tempfile::tempdir().unwrap();
    let supervisor = WorkerSupervisor::new(
        WorkerSupervisorConfig {
            work_root: work_root.path().to_path_buf(),
            ..Default::default()
        },
        content_store.clone(),
        ports,
    );

    let function_id = deploy_test_function(&supervisor, &content_store).await;

    let first = supervisor
        .invoke_http(
            function_id,
            HttpEvent {
                method: "GET".to_string(),
                path: "/".to_string(),
                query: None,
                headers: HashMap::new(),
                body: Vec::new(),
            },
        )
        .await
        .unwrap();
    assert_eq!(first.status, 200);
    let first_body = String::from_utf8(first.body).unwrap();
    assert!(first_body.starts_with("hello:"));

    let second = supervisor
        .invoke_http(
            function_id,
            HttpEvent {
                method: "GET".to_string(),
                path: "/".to_string(),
                query: None,
                headers: HashMap::new(),
                body: Vec::new(),
            },
        )
        .await
        .unwrap();
    let second_body = String::from_utf8(second.body).unwrap();
    assert_eq!(first_body, second_body, "second invocation should reuse the same warm instance");
}

fn pid_from_hello_body(body: &[u8]) -> u32 {
    let text = String::from_utf8(body.to_vec()).unwrap();
    text.strip_prefix("hello:").unwrap().parse().unwrap()
}

#[tokio::test]
async fn worker_crash_is_reaped_and_next_invoke_spawns_fresh_instance() {
    if !python3_available() {
        eprintln!("skipping: python3 not available");
        return;
    }

    let content_store = Arc::new(ContentStoreClient::new(Arc::new(MemoryBackend::new())));
    let ports = Arc::new(PortAllocator::new(PortRange { min: 33100, max: 33199 }));
    let work_root = tempfile::tempdir().unwrap();
    let supervisor = WorkerSupervisor::new(
        WorkerSupervisorConfig {
            work_root: work_root.path().to_path_buf(),
            max_warm_instances: 1,
            ..Default::default()
        },
        content_store.clone(),
        ports,
    );

    let function_id = deploy_test_function(&supervisor, &content_store).await;

    let first = supervisor
        .invoke_http(
            function_id,
            HttpEvent {
                method: "GET".to_string(),
                path: "/".to_string(),
                query: None,
                headers: HashMap::new(),
                body: Vec::new(),
            },
        )
        .await
        .unwrap();
    let first_pid = pid_from_hello_body(&first.body);

    // The bootstrap shim execs the entry point in place of the /bin/sh it is spawned
    // as, so the worker's own reported pid is the pid of the direct child process.
    // Killing it here genuinely crashes the instance rather than merely simulating it.
    let status = std::process::Command::new("kill")
        .arg("-9")
        .arg(first_pid.to_string())
        .status()
        .unwrap();
    assert!(status.success(), "kill -9 {first_pid} failed to run");

    tokio::time::sleep(Duration::from_millis(200)).await;
    supervisor.reap().await;

    let second = supervisor
        .invoke_http(
            function_id,
            HttpEvent {
                method: "GET".to_string(),
                path: "/".to_string(),
                query: None,
                headers: HashMap::new(),
                body: Vec::new(),
            },
        )
        .await
        .unwrap();
    assert_eq!(second.status, 200);
    let second_pid = pid_from_hello_body(&second.body);
    assert_ne!(second_pid, first_pid, "reap should have spawned a genuinely fresh process");
}
