// spout - a pub/sub pipeline for influx line protocol metrics
// Copyright The Spout Authors. All rights reserved.
//
// Use of this source code is governed by the Apache License, Version 2.0,
// which can be found at:
// https://www.apache.org/licenses/LICENSE-2.0

use super::*;
use crate::config::{Config, Mode};
use crate::test::{InMemoryBus, LONG_WAIT, TEST_STATS_INTERVAL, wait_for_stats};
use axum::Router;
use axum::extract::{RawQuery, State};
use axum::http::StatusCode;
use axum::routing::post;

// One captured write request: the query string and the body.
type CapturedWrite = (String, String);

#[derive(Clone)]
struct FakeInfluxState {
  tx: mpsc::Sender<CapturedWrite>,
  status: StatusCode,
}

async fn fake_write_handler(
  State(state): State<FakeInfluxState>,
  RawQuery(query): RawQuery,
  body: String,
) -> StatusCode {
  let _ = state.tx.send((query.unwrap_or_default(), body)).await;
  state.status
}

// A minimal stand-in for the InfluxDB /write endpoint that records every
// request it sees.
async fn start_fake_influx(status: StatusCode) -> (u16, mpsc::Receiver<CapturedWrite>) {
  let (tx, rx) = mpsc::channel(16);
  let router = Router::new()
    .route("/write", post(fake_write_handler))
    .with_state(FakeInfluxState { tx, status });
  let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  tokio::spawn(async move {
    let _ = axum::serve(listener, router).await;
  });
  (port, rx)
}

fn test_config(influxdb_port: u16) -> Config {
  Config {
    name: "writer".to_string(),
    mode: Mode::Writer,
    port: 0,
    nats_address: String::new(),
    nats_subject: vec!["writer-test".to_string()],
    nats_subject_monitor: "writer-test-monitor".to_string(),
    nats_subject_junkyard: "spout-junk".to_string(),
    influxdb_address: "127.0.0.1".to_string(),
    influxdb_port,
    influxdb_dbname: "metrics".to_string(),
    batch: 2,
    batch_max_mb: 10,
    batch_max_secs: 300,
    workers: 1,
    write_timeout_secs: 5,
    read_buffer_bytes: 4 * 1024 * 1024,
    nats_pending_max_mb: 200,
    listener_batch_bytes: 1024 * 1024,
    max_time_delta_secs: 600,
    debug: false,
    rule: Vec::new(),
  }
}

async fn recv_write(rx: &mut mpsc::Receiver<CapturedWrite>) -> CapturedWrite {
  tokio::time::timeout(LONG_WAIT, rx.recv())
    .await
    .expect("timed out waiting for a write")
    .expect("fake influxd went away")
}

#[tokio::test]
async fn batched_write() {
  let (port, mut writes) = start_fake_influx(StatusCode::NO_CONTENT).await;
  let config = test_config(port);
  let bus = InMemoryBus::new();
  let writer = start_writer(&config, bus.clone(), TEST_STATS_INTERVAL)
    .await
    .unwrap();
  let mut monitor_rx = bus.subscribe(&config.nats_subject_monitor).await.unwrap();

  // Filter output arrives as bare lines; the writer restores the newline
  // framing before posting.
  bus
    .publish(&config.nats_subject[0], Bytes::from_static(b"cpu,host=a user=1"))
    .await
    .unwrap();
  bus
    .publish(&config.nats_subject[0], Bytes::from_static(b"cpu,host=b user=2\n"))
    .await
    .unwrap();

  let (query, body) = recv_write(&mut writes).await;
  assert_eq!("db=metrics", query);
  assert_eq!("cpu,host=a user=1\ncpu,host=b user=2\n", body);

  wait_for_stats(
    &mut monitor_rx,
    "spout_stat_writer received=2,sent=1,write_errors=0\n",
  )
  .await;

  writer.stop().await;
}

#[tokio::test]
async fn age_flush() {
  let (port, mut writes) = start_fake_influx(StatusCode::NO_CONTENT).await;
  let mut config = test_config(port);
  // Count never trips; only the age deadline can.
  config.batch = 99999;
  config.batch_max_secs = 1;

  let bus = InMemoryBus::new();
  let writer = start_writer(&config, bus.clone(), TEST_STATS_INTERVAL)
    .await
    .unwrap();

  bus
    .publish(&config.nats_subject[0], Bytes::from_static(b"mem used=1\n"))
    .await
    .unwrap();

  let (_, body) = recv_write(&mut writes).await;
  assert_eq!("mem used=1\n", body);

  writer.stop().await;
}

#[tokio::test]
async fn pending_batch_flushes_on_stop() {
  let (port, mut writes) = start_fake_influx(StatusCode::NO_CONTENT).await;
  let mut config = test_config(port);
  config.batch = 99999;

  let bus = InMemoryBus::new();
  let writer = start_writer(&config, bus.clone(), TEST_STATS_INTERVAL)
    .await
    .unwrap();
  let mut monitor_rx = bus.subscribe(&config.nats_subject_monitor).await.unwrap();

  bus
    .publish(&config.nats_subject[0], Bytes::from_static(b"disk free=9\n"))
    .await
    .unwrap();
  wait_for_stats(
    &mut monitor_rx,
    "spout_stat_writer received=1,sent=0,write_errors=0\n",
  )
  .await;

  writer.stop().await;
  let (_, body) = recv_write(&mut writes).await;
  assert_eq!("disk free=9\n", body);
}

#[tokio::test]
async fn failed_writes_are_counted_and_dropped() {
  let (port, mut writes) = start_fake_influx(StatusCode::INTERNAL_SERVER_ERROR).await;
  let config = test_config(port);

  let bus = InMemoryBus::new();
  let writer = start_writer(&config, bus.clone(), TEST_STATS_INTERVAL)
    .await
    .unwrap();
  let mut monitor_rx = bus.subscribe(&config.nats_subject_monitor).await.unwrap();

  bus
    .publish(&config.nats_subject[0], Bytes::from_static(b"cpu user=1\n"))
    .await
    .unwrap();
  bus
    .publish(&config.nats_subject[0], Bytes::from_static(b"cpu user=2\n"))
    .await
    .unwrap();

  // The request reached the server but failed; nothing is retried.
  let _ = recv_write(&mut writes).await;
  wait_for_stats(
    &mut monitor_rx,
    "spout_stat_writer received=2,sent=0,write_errors=1\n",
  )
  .await;

  writer.stop().await;
}

#[tokio::test]
async fn stop_is_idempotent() {
  let (port, _writes) = start_fake_influx(StatusCode::NO_CONTENT).await;
  let config = test_config(port);
  let bus = InMemoryBus::new();
  let writer = start_writer(&config, bus, TEST_STATS_INTERVAL).await.unwrap();
  writer.stop().await;
  writer.stop().await;
}
