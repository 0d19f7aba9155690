// spout - a pub/sub pipeline for influx line protocol metrics
// Copyright The Spout Authors. All rights reserved.
//
// Use of this source code is governed by the Apache License, Version 2.0,
// which can be found at:
// https://www.apache.org/licenses/LICENSE-2.0

use crate::bus::Bus;
use bytes::Bytes;
use log::warn;
use spout_common::shutdown::ComponentShutdown;
use std::sync::Arc;
use std::time::Duration;

// Bound on the final snapshot publish during shutdown so an unreachable bus
// cannot stall the stage.
const FINAL_PUBLISH_TIMEOUT: Duration = Duration::from_secs(1);

/// Drive one stage's statistician: every `tick_interval`, publish the
/// payloads produced by `snapshot` to the monitor subject. On shutdown a
/// final snapshot goes out best effort.
pub(crate) async fn run_statistician(
  bus: Arc<dyn Bus>,
  monitor_subject: String,
  tick_interval: Duration,
  shutdown: ComponentShutdown,
  snapshot: impl Fn() -> Vec<Bytes> + Send,
) {
  let mut ticker = tokio::time::interval(tick_interval);
  ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
  // The first tick resolves immediately; the first report should wait a full
  // interval.
  ticker.tick().await;

  loop {
    tokio::select! {
      _ = ticker.tick() => {
        publish_snapshot(bus.as_ref(), &monitor_subject, &snapshot).await;
      },
      () = shutdown.cancelled() => break,
    }
  }

  let _ = tokio::time::timeout(
    FINAL_PUBLISH_TIMEOUT,
    publish_snapshot(bus.as_ref(), &monitor_subject, &snapshot),
  )
  .await;
  drop(shutdown);
}

async fn publish_snapshot(bus: &dyn Bus, monitor_subject: &str, snapshot: &impl Fn() -> Vec<Bytes>) {
  for payload in snapshot() {
    if let Err(e) = bus.publish(monitor_subject, payload).await {
      warn!("stats publish to {monitor_subject} failed: {e}");
    }
  }
}
