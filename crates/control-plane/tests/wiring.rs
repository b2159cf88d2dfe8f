//! Verifies the cron scheduler's invoker capability is actually wired to the worker
//! supervisor's `invoke`, using a deployed function whose artifact is a tiny python3
//! HTTP worker. Skips if python3 is not on PATH.

use control_plane::app::App;
use control_plane::config::ControlPlaneConfig;
use core_common::ids::OwnerId;
use core_content_store::UploadOptions;
use core_cron::{NewSchedule, ScheduleStatus};
use core_runtime::NewFunction;
use std::collections::HashMap;
use std::time::Duration;

const WORKER_SCRIPT: &str = r#"#!/usr/bin/env python3
import http.server, os, socketserver

port = int(os.environ["WORKER_PORT"])

class Handler(http.server.BaseHTTPRequestHandler):
    def do_GET(self):
        self.send_response(200)
        self.end_headers()
        self.wfile.write(b"ok")

    def do_POST(self):
        self.do_GET()

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

#[tokio::test]
async fn cron_trigger_drives_worker_invocation() {
    if !python3_available() {
        eprintln!("skipping: python3 not available");
        return;
    }

    let mut config = ControlPlaneConfig::default();
    let work_root = tempfile::tempdir().unwrap();
    config.worker.work_root = work_root.path().to_path_buf();
    config.ports.min = 34000;
    config.ports.max = 34099;

    let app = App::new(config);

    let upload = app
        .content_store
        .upload(
            WORKER_SCRIPT.as_bytes(),
            &UploadOptions {
                filename: "worker.py".to_string(),
                permanent: false,
            },
        )
        .await
        .unwrap();

    let function = app
        .worker_supervisor
        .deploy_function(NewFunction {
            name: "cron-target".to_string(),
            owner: OwnerId("tenant-1".to_string()),
            code_cid: upload.cid,
            entry_point: "main".to_string(),
            memory_limit_mb: 128,
            timeout_ms: 5_000,
            env: HashMap::new(),
        })
        .await
        .unwrap();

    let schedule = app
        .cron_scheduler
        .create_schedule(
            OwnerId("tenant-1".to_string()),
            NewSchedule {
                function_id: function.id,
                name: "cron-target-schedule".to_string(),
                cron_expression: "* * * * *".to_string(),
                timezone: "UTC".to_string(),
                timeout: Duration::from_secs(5),
                max_retries: 0,
                retry_delay: Duration::from_millis(10),
            },
        )
        .unwrap();

    app.cron_scheduler
        .trigger_manually(schedule.id, &OwnerId("tenant-1".to_string()))
        .await
        .unwrap();

    let updated = app.cron_scheduler.get(schedule.id).unwrap();
    assert_eq!(updated.status, ScheduleStatus::Active);
    assert_eq!(updated.successful_runs, 1);
}
