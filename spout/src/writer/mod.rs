// spout - a pub/sub pipeline for influx line protocol metrics
// Copyright The Spout Authors. All rights reserved.
//
// Use of this source code is governed by the Apache License, Version 2.0,
// which can be found at:
// https://www.apache.org/licenses/LICENSE-2.0

#[cfg(test)]
#[path = "./mod_test.rs"]
mod mod_test;

use crate::bus::{Bus, BusMessage};
use crate::config::Config;
use crate::stats::run_statistician;
use bytes::{Bytes, BytesMut};
use http_body_util::Full;
use hyper::{Method, Request};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use log::{info, warn};
use parking_lot::Mutex;
use spout_common::shutdown::{ComponentShutdown, ComponentShutdownTrigger};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

const WORKER_QUEUE_DEPTH: usize = 64;

type HttpClient = Client<HttpConnector, Full<Bytes>>;

//
// WriterStats
//

#[derive(Default)]
struct WriterStats {
  received: AtomicU64,
  sent: AtomicU64,
  write_errors: AtomicU64,
}

impl WriterStats {
  fn report(&self) -> Bytes {
    Bytes::from(format!(
      "spout_stat_writer received={},sent={},write_errors={}\n",
      self.received.load(Ordering::Relaxed),
      self.sent.load(Ordering::Relaxed),
      self.write_errors.load(Ordering::Relaxed),
    ))
  }
}

// Flush thresholds for one worker's pending buffer.
#[derive(Clone)]
struct BatchLimits {
  max_messages: usize,
  max_bytes: usize,
  max_age: Duration,
}

//
// Writer
//

/// The writer stage: drains the configured bus subjects and POSTs batched
/// line protocol to the InfluxDB write endpoint through a worker pool.
pub struct Writer {
  shutdown_trigger: Mutex<Option<ComponentShutdownTrigger>>,
}

impl Writer {
  /// Idempotent; workers flush their pending batches before exiting.
  pub async fn stop(&self) {
    let trigger = self.shutdown_trigger.lock().take();
    if let Some(trigger) = trigger {
      trigger.shutdown().await;
    }
  }
}

pub async fn start_writer(
  config: &Config,
  bus: Arc<dyn Bus>,
  stats_interval: Duration,
) -> anyhow::Result<Writer> {
  let url = format!(
    "http://{}:{}/write?db={}",
    config.influxdb_address, config.influxdb_port, config.influxdb_dbname
  );
  let client: HttpClient = Client::builder(TokioExecutor::new()).build_http();
  let stats = Arc::new(WriterStats::default());
  let limits = BatchLimits {
    max_messages: config.batch.max(1),
    max_bytes: config.batch_max_mb.max(1) * 1024 * 1024,
    max_age: Duration::from_secs(config.batch_max_secs.max(1)),
  };
  let write_timeout = Duration::from_secs(config.write_timeout_secs.max(1));
  let trigger = ComponentShutdownTrigger::default();

  let num_workers = config.workers.max(1);
  let mut senders = Vec::with_capacity(num_workers);
  for _ in 0 .. num_workers {
    let (tx, rx) = mpsc::channel::<BusMessage>(WORKER_QUEUE_DEPTH);
    tokio::spawn(write_worker(
      rx,
      client.clone(),
      url.clone(),
      limits.clone(),
      write_timeout,
      stats.clone(),
      trigger.make_shutdown(),
    ));
    senders.push(tx);
  }

  let next_worker = Arc::new(AtomicUsize::new(0));
  for subject in &config.nats_subject {
    let receiver = bus.subscribe(subject).await?;
    tokio::spawn(dispatch_loop(
      receiver,
      senders.clone(),
      next_worker.clone(),
      stats.clone(),
      trigger.make_shutdown(),
    ));
  }
  info!(
    "writer running: {} workers posting to {}, inputs {:?}",
    num_workers, url, config.nats_subject
  );

  let cloned_stats = stats.clone();
  tokio::spawn(run_statistician(
    bus,
    config.nats_subject_monitor.clone(),
    stats_interval,
    trigger.make_shutdown(),
    move || vec![cloned_stats.report()],
  ));

  Ok(Writer {
    shutdown_trigger: Mutex::new(Some(trigger)),
  })
}

async fn dispatch_loop(
  mut receiver: mpsc::Receiver<BusMessage>,
  senders: Vec<mpsc::Sender<BusMessage>>,
  next_worker: Arc<AtomicUsize>,
  stats: Arc<WriterStats>,
  shutdown: ComponentShutdown,
) {
  loop {
    tokio::select! {
      message = receiver.recv() => match message {
        Some(message) => {
          stats.received.fetch_add(1, Ordering::Relaxed);
          let index = next_worker.fetch_add(1, Ordering::Relaxed) % senders.len();
          if senders[index].send(message).await.is_err() {
            break;
          }
        },
        None => break,
      },
      () = shutdown.cancelled() => break,
    }
  }
  drop(shutdown);
}

async fn write_worker(
  mut receiver: mpsc::Receiver<BusMessage>,
  client: HttpClient,
  url: String,
  limits: BatchLimits,
  write_timeout: Duration,
  stats: Arc<WriterStats>,
  shutdown: ComponentShutdown,
) {
  let mut batch = BytesMut::new();
  let mut count = 0_usize;
  let mut deadline: Option<Instant> = None;

  loop {
    tokio::select! {
      message = receiver.recv() => match message {
        Some(message) => {
          batch.extend_from_slice(&message.payload);
          // Filter output is single lines with no separator; keep the batch
          // newline-delimited.
          if !message.payload.ends_with(b"\n") {
            batch.extend_from_slice(b"\n");
          }
          count += 1;
          if deadline.is_none() {
            deadline = Some(Instant::now() + limits.max_age);
          }
          if count >= limits.max_messages || batch.len() >= limits.max_bytes {
            flush(&client, &url, &mut batch, &mut count, &mut deadline, write_timeout, &stats)
              .await;
          }
        },
        None => break,
      },
      () = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
          if deadline.is_some() => {
        flush(&client, &url, &mut batch, &mut count, &mut deadline, write_timeout, &stats).await;
      },
    }
  }

  // Channel closed: flush whatever is pending and exit.
  flush(&client, &url, &mut batch, &mut count, &mut deadline, write_timeout, &stats).await;
  drop(shutdown);
}

async fn flush(
  client: &HttpClient,
  url: &str,
  batch: &mut BytesMut,
  count: &mut usize,
  deadline: &mut Option<Instant>,
  write_timeout: Duration,
  stats: &WriterStats,
) {
  *count = 0;
  *deadline = None;
  if batch.is_empty() {
    return;
  }
  let payload = batch.split().freeze();

  let request = Request::builder()
    .method(Method::POST)
    .uri(url)
    .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
    .body(Full::new(payload));
  let request = match request {
    Ok(request) => request,
    Err(e) => {
      warn!("dropping batch, request build failed: {e}");
      stats.write_errors.fetch_add(1, Ordering::Relaxed);
      return;
    },
  };

  match tokio::time::timeout(write_timeout, client.request(request)).await {
    Ok(Ok(response)) if response.status().is_success() => {
      stats.sent.fetch_add(1, Ordering::Relaxed);
    },
    Ok(Ok(response)) => {
      warn!("dropping batch, write to {url} returned {}", response.status());
      stats.write_errors.fetch_add(1, Ordering::Relaxed);
    },
    Ok(Err(e)) => {
      warn!("dropping batch, write to {url} failed: {e}");
      stats.write_errors.fetch_add(1, Ordering::Relaxed);
    },
    Err(_) => {
      warn!("dropping batch, write to {url} timed out");
      stats.write_errors.fetch_add(1, Ordering::Relaxed);
    },
  }
}
