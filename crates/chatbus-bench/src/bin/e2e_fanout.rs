//! End-to-end fan-out benchmark for chatbus.
//!
//! Every client subscribes to one channel and publishes in a closed loop,
//! sending its next message once the previous one is acknowledged. The
//! reported figure is messages delivered to subscribers per second.

use chatbus_protocol::ServerFrame;
use chatbus_transport::{ClientSession, SessionConfig, WebSocketConnector};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;

const SERVER_URL: &str = "ws://127.0.0.1:3001/ws";
const CHANNEL: &str = "benchmark";
const WARMUP_SECS: u64 = 2;
const BENCH_SECS: u64 = 10;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let num_clients = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(16);
    let url = args.get(2).cloned().unwrap_or_else(|| SERVER_URL.to_string());

    println!("chatbus end-to-end fan-out benchmark");
    println!("  server:  {url}");
    println!("  channel: {CHANNEL} (create it first:");
    println!(
        "           curl -X POST localhost:3001/api/channels -H 'content-type: application/json' \\"
    );
    println!("                -d '{{\"name\":\"{CHANNEL}\",\"createdBy\":\"bench\"}}')");
    println!();

    run_fanout_benchmark(num_clients, url).await;
}

async fn run_fanout_benchmark(num_clients: usize, url: String) {
    println!("Fan-out benchmark: {num_clients} clients");
    println!("  warmup {WARMUP_SECS}s, measurement {BENCH_SECS}s");

    let delivered = Arc::new(AtomicU64::new(0));
    let barrier = Arc::new(Barrier::new(num_clients + 1));

    let handles: Vec<_> = (0..num_clients)
        .map(|client_id| {
            let delivered = Arc::clone(&delivered);
            let barrier = Arc::clone(&barrier);
            let url = url.clone();

            tokio::spawn(async move {
                if let Err(e) = run_client(client_id, url, delivered, barrier).await {
                    eprintln!("client {client_id} error: {e}");
                }
            })
        })
        .collect();

    barrier.wait().await;
    println!("All {num_clients} clients subscribed");

    tokio::time::sleep(Duration::from_secs(WARMUP_SECS)).await;

    delivered.store(0, Ordering::SeqCst);
    let start = Instant::now();
    tokio::time::sleep(Duration::from_secs(BENCH_SECS)).await;

    let elapsed = start.elapsed();
    let total = delivered.load(Ordering::SeqCst);
    let per_sec = total as f64 / elapsed.as_secs_f64();

    println!();
    println!("Results");
    println!("  clients:    {num_clients:>10}");
    println!("  duration:   {:>10.2}s", elapsed.as_secs_f64());
    println!("  delivered:  {total:>10}");
    println!("  throughput: {per_sec:>10.0} msg/s");
    println!("  per client: {:>10.0} msg/s", per_sec / num_clients as f64);

    for handle in handles {
        handle.abort();
    }
}

async fn run_client(
    client_id: usize,
    url: String,
    delivered: Arc<AtomicU64>,
    barrier: Arc<Barrier>,
) -> Result<(), BoxError> {
    let username = format!("bench-{client_id}");
    let mut session = ClientSession::spawn(
        WebSocketConnector::new(url),
        username,
        SessionConfig::default(),
    );

    session.subscribe(CHANNEL).await?;
    loop {
        match session.next_event().await {
            Some(ServerFrame::Subscribed { .. }) => break,
            Some(ServerFrame::Error { message }) => return Err(message.into()),
            Some(_) => {}
            None => return Err("session stopped before subscribing".into()),
        }
    }

    barrier.wait().await;

    let text = "x".repeat(64);
    session.publish(CHANNEL, text.as_str()).await?;

    while let Some(frame) = session.next_event().await {
        match frame {
            ServerFrame::NewMessage { .. } => {
                delivered.fetch_add(1, Ordering::Relaxed);
            }
            ServerFrame::MessageSent { .. } => {
                session.publish(CHANNEL, text.as_str()).await?;
            }
            ServerFrame::Error { message } => return Err(message.into()),
            _ => {}
        }
    }

    Ok(())
}
