// spout - a pub/sub pipeline for influx line protocol metrics
// Copyright The Spout Authors. All rights reserved.
//
// Use of this source code is governed by the Apache License, Version 2.0,
// which can be found at:
// https://www.apache.org/licenses/LICENSE-2.0


pub mod rules;
pub mod worker;

use self::rules::RuleSet;
use self::worker::{FilterStats, Worker};
use crate::bus::{Bus, BusMessage};
use crate::config::Config;
use crate::stats::run_statistician;
use crate::time::TimeProvider;
use bytes::Bytes;
use futures::FutureExt;
use log::{error, info};
use parking_lot::Mutex;
use spout_common::shutdown::{ComponentShutdown, ComponentShutdownTrigger};
use std::fmt::Write;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

// Per-worker queue depth between the bus subscriptions and the pool.
const WORKER_QUEUE_DEPTH: usize = 64;

//
// Filter
//

/// Handle to a running filter stage: a shared rule set, a counter table, a
/// worker pool fed from the configured input subjects, and a statistician.
pub struct Filter {
  shutdown_trigger: Mutex<Option<ComponentShutdownTrigger>>,
}

impl Filter {
  /// Idempotent. Stops the intake, lets workers drain their queues, emits a
  /// final counter snapshot, and returns once everything has exited.
  pub async fn stop(&self) {
    let trigger = self.shutdown_trigger.lock().take();
    if let Some(trigger) = trigger {
      trigger.shutdown().await;
    }
  }
}

/// Start the filter stage. Fails synchronously on an invalid rule set or an
/// unreachable input subject.
pub async fn start_filter(
  config: &Config,
  bus: Arc<dyn Bus>,
  time_provider: Arc<dyn TimeProvider>,
  stats_interval: Duration,
) -> anyhow::Result<Filter> {
  let rules = Arc::new(RuleSet::from_config(&config.rule)?);
  let stats = Arc::new(FilterStats::new(rules.count()));
  let trigger = ComponentShutdownTrigger::default();

  let num_workers = config.workers.max(1);
  let mut senders = Vec::with_capacity(num_workers);
  for _ in 0 .. num_workers {
    let (tx, rx) = mpsc::channel::<BusMessage>(WORKER_QUEUE_DEPTH);
    let worker = Worker::new(
      rules.clone(),
      stats.clone(),
      bus.clone(),
      config.nats_subject_junkyard.clone(),
      config.max_time_delta_secs,
      time_provider.clone(),
    );
    tokio::spawn(worker_loop(worker, rx, trigger.make_shutdown()));
    senders.push(tx);
  }

  // One subscription per input subject; each feeds the shared pool
  // round-robin so a batch lands on exactly one worker.
  let next_worker = Arc::new(AtomicUsize::new(0));
  for subject in &config.nats_subject {
    let receiver = bus.subscribe(subject).await?;
    tokio::spawn(dispatch_loop(
      receiver,
      senders.clone(),
      next_worker.clone(),
      trigger.make_shutdown(),
    ));
  }
  info!(
    "filter {} running: {} rules, {} workers, inputs {:?}",
    config.name,
    rules.count(),
    num_workers,
    config.nats_subject,
  );

  let snapshot = make_stats_snapshot(config.name.clone(), rules.clone(), stats);
  tokio::spawn(run_statistician(
    bus,
    config.nats_subject_monitor.clone(),
    stats_interval,
    trigger.make_shutdown(),
    snapshot,
  ));

  Ok(Filter {
    shutdown_trigger: Mutex::new(Some(trigger)),
  })
}

async fn dispatch_loop(
  mut receiver: mpsc::Receiver<BusMessage>,
  senders: Vec<mpsc::Sender<BusMessage>>,
  next_worker: Arc<AtomicUsize>,
  shutdown: ComponentShutdown,
) {
  loop {
    tokio::select! {
      message = receiver.recv() => match message {
        Some(message) => {
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

async fn worker_loop(
  worker: Worker,
  mut receiver: mpsc::Receiver<BusMessage>,
  shutdown: ComponentShutdown,
) {
  // No cancellation check here: the intake stops on shutdown, the queue
  // drains, and recv() returns None once the senders are gone.
  while let Some(message) = receiver.recv().await {
    let result = AssertUnwindSafe(worker.process_batch(&message.payload))
      .catch_unwind()
      .await;
    if result.is_err() {
      error!("filter worker panicked processing a batch; continuing");
    }
  }
  drop(shutdown);
}

// Two monitor messages per tick: the stage counters, then one line per rule.
// Snapshot reads; a torn read across the two is acceptable.
fn make_stats_snapshot(
  name: String,
  rules: Arc<RuleSet>,
  stats: Arc<FilterStats>,
) -> impl Fn() -> Vec<Bytes> + Send {
  move || {
    let mut messages = Vec::with_capacity(2);
    messages.push(Bytes::from(format!(
      "spout_stat_filter,filter={} passed={},processed={},rejected={},invalid-time={}\n",
      name,
      stats.passed.load(Ordering::Relaxed),
      stats.processed.load(Ordering::Relaxed),
      stats.rejected.load(Ordering::Relaxed),
      stats.invalid_time.load(Ordering::Relaxed),
    )));

    if rules.count() > 0 {
      let mut rule_lines = String::new();
      for (index, subject) in rules.subjects().iter().enumerate() {
        let _ = writeln!(
          rule_lines,
          "spout_stat_filter_rule,filter={},rule={} triggered={}",
          name,
          subject,
          stats.triggered[index].load(Ordering::Relaxed),
        );
      }
      messages.push(Bytes::from(rule_lines));
    }
    messages
  }
}
