// spout - a pub/sub pipeline for influx line protocol metrics
// Copyright The Spout Authors. All rights reserved.
//
// Use of this source code is governed by the Apache License, Version 2.0,
// which can be found at:
// https://www.apache.org/licenses/LICENSE-2.0

#[cfg(test)]
#[path = "./http_test.rs"]
mod http_test;

use super::{Batcher, FINAL_FLUSH_TIMEOUT, ListenerStats, publish_batch};
use crate::bus::Bus;
use crate::config::Config;
use crate::stats::run_statistician;
use anyhow::anyhow;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use bytes::Bytes;
use log::info;
use parking_lot::Mutex;
use spout_common::bind_resolver::BindResolver;
use spout_common::shutdown::ComponentShutdownTrigger;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::watch;

struct Shared {
  batcher: Mutex<Batcher>,
  bus: Arc<dyn Bus>,
  subject: String,
  stats: Arc<ListenerStats>,
}

//
// HttpListener
//

/// The HTTP listener stage: each `POST /write` body plays the role of one
/// UDP datagram, with the same batching discipline as [super::Listener].
pub struct HttpListener {
  shutdown_trigger: Mutex<Option<ComponentShutdownTrigger>>,
  ready: watch::Receiver<bool>,
  local_addr: SocketAddr,
}

impl HttpListener {
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
      .resolve_tcp(&format!("0.0.0.0:{}", config.port))
      .await?;
    let local_addr = socket.local_addr();

    let stats = Arc::new(ListenerStats::default());
    let trigger = ComponentShutdownTrigger::default();
    let (ready_tx, ready_rx) = watch::channel(false);

    let shared = Arc::new(Shared {
      batcher: Mutex::new(Batcher::new(config.batch, config.listener_batch_bytes)),
      bus: bus.clone(),
      subject: subject.clone(),
      stats: stats.clone(),
    });
    let router = Router::new()
      .route("/write", post(write_handler))
      .with_state(shared.clone());

    let listener = socket.listen();
    let _ = ready_tx.send(true);
    let serve_shutdown = trigger.make_shutdown();
    let signal_shutdown = trigger.make_shutdown();
    tokio::spawn(async move {
      let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
          signal_shutdown.cancelled().await;
        })
        .await;
      if let Err(e) = result {
        log::warn!("http listener server error: {e}");
      }

      let batch = {
        let mut batcher = shared.batcher.lock();
        (!batcher.is_empty()).then(|| batcher.take())
      };
      if let Some(batch) = batch {
        let _ = tokio::time::timeout(
          FINAL_FLUSH_TIMEOUT,
          publish_batch(shared.bus.as_ref(), &shared.subject, batch, &shared.stats),
        )
        .await;
      }
      info!("terminated http listener on {}", shared.subject);
      drop(serve_shutdown);
    });

    let monitor_subject = config.nats_subject_monitor.clone();
    let cloned_stats = stats.clone();
    tokio::spawn(run_statistician(
      bus,
      monitor_subject,
      stats_interval,
      trigger.make_shutdown(),
      move || vec![cloned_stats.report()],
    ));

    info!("http listener running on {local_addr}");
    Ok(Self {
      shutdown_trigger: Mutex::new(Some(trigger)),
      ready: ready_rx,
      local_addr,
    })
  }

  /// Resolves once the socket is bound and listening.
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

  /// Idempotent; waits for in-flight requests to finish.
  pub async fn stop(&self) {
    let trigger = self.shutdown_trigger.lock().take();
    if let Some(trigger) = trigger {
      trigger.shutdown().await;
    }
  }
}

async fn write_handler(State(shared): State<Arc<Shared>>, body: Bytes) -> StatusCode {
  shared.stats.received.fetch_add(1, Ordering::Relaxed);
  // The lock covers only the append; publishing happens outside it.
  let batch = shared.batcher.lock().append(&body);
  if let Some(batch) = batch {
    publish_batch(shared.bus.as_ref(), &shared.subject, batch, &shared.stats).await;
  }
  StatusCode::NO_CONTENT
}
