// spout - a pub/sub pipeline for influx line protocol metrics
// Copyright The Spout Authors. All rights reserved.
//
// Use of this source code is governed by the Apache License, Version 2.0,
// which can be found at:
// https://www.apache.org/licenses/LICENSE-2.0


pub mod http;

use crate::bus::Bus;
use crate::config::Config;
use crate::stats::run_statistician;
use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
use log::{info, warn};
use parking_lot::Mutex;
use spout_common::bind_resolver::BindResolver;
use spout_common::shutdown::{ComponentShutdown, ComponentShutdownTrigger};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;

// Largest UDP payload we can be handed in one datagram.
const MAX_UDP_DATAGRAM: usize = 65536;

const FINAL_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

//
// ListenerStats
//

#[derive(Default)]
pub(crate) struct ListenerStats {
  received: AtomicU64,
  sent: AtomicU64,
  read_errors: AtomicU64,
}

impl ListenerStats {
  fn report(&self) -> Bytes {
    Bytes::from(format!(
      "spout_stat_listener received={},sent={},read_errors={}\n",
      self.received.load(Ordering::Relaxed),
      self.sent.load(Ordering::Relaxed),
      self.read_errors.load(Ordering::Relaxed),
    ))
  }
}

//
// Batcher
//

// Accumulates incoming payloads into one bus message. A payload is appended
// first and the fullness test runs after, so a payload larger than the batch
// buffer still goes out (alone).
pub(crate) struct Batcher {
  buf: BytesMut,
  count: usize,
  max_messages: usize,
  max_bytes: usize,
}

impl Batcher {
  pub(crate) fn new(max_messages: usize, max_bytes: usize) -> Self {
    Self {
      buf: BytesMut::with_capacity(max_bytes),
      count: 0,
      max_messages: max_messages.max(1),
      max_bytes: max_bytes.max(1),
    }
  }

  // Append one payload; when the message count or buffer fullness threshold
  // is reached the finished batch is returned and the batcher resets.
  pub(crate) fn append(&mut self, payload: &[u8]) -> Option<Bytes> {
    self.buf.extend_from_slice(payload);
    self.count += 1;
    if self.count >= self.max_messages || self.buf.len() >= self.max_bytes {
      return Some(self.take());
    }
    None
  }

  pub(crate) fn take(&mut self) -> Bytes {
    self.count = 0;
    self.buf.split().freeze()
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.buf.is_empty()
  }
}

//
// Listener
//

/// The UDP listener stage: datagrams in, batches out on a single bus
/// subject, plus a periodic counter report on the monitor subject.
pub struct Listener {
  shutdown_trigger: Mutex<Option<ComponentShutdownTrigger>>,
  ready: watch::Receiver<bool>,
  local_addr: SocketAddr,
}

impl Listener {
  pub async fn start(
    config: &Config,
    bus: Arc<dyn Bus>,
    bind_resolver: &dyn BindResolver,
    stats_interval: Duration,
  ) -> anyhow::Result<Self> {
    let subject = config
      .nats_subject
      .first()
      .ok_or_else(|| anyhow!("no nats_subject configured"))?
      .clone();
    let socket = bind_resolver
      .resolve_udp(
        &format!("0.0.0.0:{}", config.port),
        Some(config.read_buffer_bytes),
      )
      .await?;
    let local_addr = socket.local_addr()?;

    let stats = Arc::new(ListenerStats::default());
    let trigger = ComponentShutdownTrigger::default();
    let (ready_tx, ready_rx) = watch::channel(false);

    tokio::spawn(read_loop(
      socket,
      Batcher::new(config.batch, config.listener_batch_bytes),
      bus.clone(),
      subject,
      stats.clone(),
      trigger.make_shutdown(),
      ready_tx,
    ));

    let monitor_subject = config.nats_subject_monitor.clone();
    let cloned_stats = stats.clone();
    tokio::spawn(run_statistician(
      bus,
      monitor_subject,
      stats_interval,
      trigger.make_shutdown(),
      move || vec![cloned_stats.report()],
    ));

    info!("udp listener running on {local_addr}");
    Ok(Self {
      shutdown_trigger: Mutex::new(Some(trigger)),
      ready: ready_rx,
      local_addr,
    })
  }

  /// Resolves once the socket is bound and the read loop is accepting
  /// datagrams. Fires exactly once per listener.
  pub async fn ready(&self) {
    let mut ready = self.ready.clone();
    while !*ready.borrow() {
      if ready.changed().await.is_err() {
        return;
      }
    }
  }

  #[must_use]
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Idempotent; drains the read loop and statistician before returning.
  pub async fn stop(&self) {
    let trigger = self.shutdown_trigger.lock().take();
    if let Some(trigger) = trigger {
      trigger.shutdown().await;
    }
  }
}

async fn read_loop(
  socket: UdpSocket,
  mut batcher: Batcher,
  bus: Arc<dyn Bus>,
  subject: String,
  stats: Arc<ListenerStats>,
  shutdown: ComponentShutdown,
  ready_tx: watch::Sender<bool>,
) {
  let mut scratch = vec![0_u8; MAX_UDP_DATAGRAM];
  let _ = ready_tx.send(true);
  loop {
    tokio::select! {
      result = socket.recv_from(&mut scratch) => match result {
        Ok((len, _peer)) => {
          stats.received.fetch_add(1, Ordering::Relaxed);
          if let Some(batch) = batcher.append(&scratch[.. len]) {
            publish_batch(bus.as_ref(), &subject, batch, &stats).await;
          }
        },
        Err(e) => {
          warn!("udp read error: {e}");
          stats.read_errors.fetch_add(1, Ordering::Relaxed);
        },
      },
      () = shutdown.cancelled() => break,
    }
  }

  // Best effort flush of a partial batch on the way out.
  if !batcher.is_empty() {
    let batch = batcher.take();
    let _ = tokio::time::timeout(
      FINAL_FLUSH_TIMEOUT,
      publish_batch(bus.as_ref(), &subject, batch, &stats),
    )
    .await;
  }
  info!("terminated udp listener on {subject}");
  drop(shutdown);
}

pub(crate) async fn publish_batch(
  bus: &dyn Bus,
  subject: &str,
  batch: Bytes,
  stats: &ListenerStats,
) {
  match bus.publish(subject, batch).await {
    Ok(()) => {
      stats.sent.fetch_add(1, Ordering::Relaxed);
    },
    Err(e) => {
      warn!("dropping batch, publish to {subject} failed: {e}");
    },
  }
}
