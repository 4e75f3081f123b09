#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use leasehold::codec::encode_schedule_state;
use leasehold::coordinator::{CoordinatorOptions, ScheduleCoordinator};
use leasehold::keys::schedule_key;
use leasehold::kv::MemoryStore;
use leasehold::schedule::ScheduleState;
use leasehold::settings::JobConfig;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const PREFIX: &str = "test";

pub const SECOND: i64 = 1_000;

/// `Cleanup` every 10s, leased for 30s (20s execution + 10s margin).
pub fn cleanup_job() -> JobConfig {
    JobConfig::cloud("Cleanup", 10 * SECOND, 20 * SECOND).with_lease_safety_margin_ms(10 * SECOND)
}

pub fn coordinator(store: &MemoryStore, worker: &str, job: JobConfig) -> Arc<ScheduleCoordinator> {
    Arc::new(
        ScheduleCoordinator::new(
            Arc::new(store.clone()),
            job,
            CoordinatorOptions::new(worker, PREFIX),
        )
        .expect("valid job"),
    )
}

pub async fn seed_state(store: &MemoryStore, job: &str, state: &ScheduleState) {
    store
        .put_unconditional(
            &schedule_key(PREFIX, job),
            Bytes::from(encode_schedule_state(state).expect("encode")),
        )
        .await;
}

pub fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

pub async fn scrape(addr: SocketAddr) -> String {
    for _ in 0..50 {
        if let Ok(mut stream) = TcpStream::connect(addr).await {
            stream
                .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .await
                .unwrap();
            let mut response = String::new();
            stream.read_to_string(&mut response).await.unwrap();
            return response;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("metrics server never accepted a connection");
}
