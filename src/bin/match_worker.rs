//! Template-match worker process.
//!
//! Reads one JSON [`WorkRequest`] per stdin line, executes it, writes one
//! JSON [`WorkerReply`] per stdout line. Exits on a shutdown sentinel, a
//! closed stdin, or after the idle timeout without work.

use screen_scanner::worker_pool::{execute_request, WorkKind, WorkRequest};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 30;

fn idle_timeout_from_args() -> Duration {
    let args: Vec<String> = std::env::args().collect();
    let secs = args
        .windows(2)
        .find(|pair| pair[0] == "--idle-timeout-secs")
        .and_then(|pair| pair[1].parse().ok())
        .unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS);
    Duration::from_secs(secs.max(1))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let idle_timeout = idle_timeout_from_args();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    loop {
        let line = match tokio::time::timeout(idle_timeout, lines.next_line()).await {
            // Idle too long, free the slot; the pool respawns on demand
            Err(_) => break,
            Ok(Ok(Some(line))) => line,
            Ok(Ok(None)) => break, // stdin closed
            Ok(Err(_)) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: WorkRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                eprintln!("unparseable request: {e}");
                continue;
            }
        };

        if matches!(request.kind, WorkKind::Shutdown) {
            break;
        }

        let reply = execute_request(&request);
        let json = match serde_json::to_string(&reply) {
            Ok(json) => json,
            Err(e) => {
                eprintln!("unserializable reply for {}: {e}", reply.task_id);
                continue;
            }
        };

        if stdout.write_all(json.as_bytes()).await.is_err()
            || stdout.write_all(b"\n").await.is_err()
            || stdout.flush().await.is_err()
        {
            break;
        }
    }
}
