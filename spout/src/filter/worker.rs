// spout - a pub/sub pipeline for influx line protocol metrics
// Copyright The Spout Authors. All rights reserved.
//
// Use of this source code is governed by the Apache License, Version 2.0,
// which can be found at:
// https://www.apache.org/licenses/LICENSE-2.0

#[cfg(test)]
#[path = "./worker_test.rs"]
mod worker_test;

use super::rules::RuleSet;
use crate::bus::Bus;
use crate::protos::influx::extract_timestamp;
use crate::time::TimeProvider;
use bytes::Bytes;
use log::warn;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const NANOS_PER_SEC: i64 = 1_000_000_000;

//
// FilterStats
//

/// The filter's counter table: flat atomics, one `triggered` slot per rule,
/// same order as the rule set. Workers add, the statistician reads
/// snapshots; nothing locks.
pub struct FilterStats {
  pub processed: AtomicU64,
  pub passed: AtomicU64,
  pub rejected: AtomicU64,
  pub invalid_time: AtomicU64,
  pub triggered: Vec<AtomicU64>,
}

impl FilterStats {
  #[must_use]
  pub fn new(num_rules: usize) -> Self {
    Self {
      processed: AtomicU64::new(0),
      passed: AtomicU64::new(0),
      rejected: AtomicU64::new(0),
      invalid_time: AtomicU64::new(0),
      triggered: (0 .. num_rules).map(|_| AtomicU64::new(0)).collect(),
    }
  }
}

//
// Worker
//

/// One member of the filter's worker pool. Each worker processes whole
/// batches serially; lines within a batch keep their order on the way out.
pub(crate) struct Worker {
  rules: Arc<RuleSet>,
  stats: Arc<FilterStats>,
  bus: Arc<dyn Bus>,
  junk_subject: String,
  // 0 disables the timestamp window.
  max_time_delta_nanos: i64,
  time_provider: Arc<dyn TimeProvider>,
}

impl Worker {
  pub(crate) fn new(
    rules: Arc<RuleSet>,
    stats: Arc<FilterStats>,
    bus: Arc<dyn Bus>,
    junk_subject: String,
    max_time_delta_secs: u64,
    time_provider: Arc<dyn TimeProvider>,
  ) -> Self {
    Self {
      rules,
      stats,
      bus,
      junk_subject,
      max_time_delta_nanos: i64::try_from(max_time_delta_secs)
        .unwrap_or(i64::MAX / NANOS_PER_SEC)
        .saturating_mul(NANOS_PER_SEC),
      time_provider,
    }
  }

  /// Classify and forward every line of one batch. One clock read covers the
  /// whole batch.
  pub(crate) async fn process_batch(&self, batch: &Bytes) {
    let now_nanos = self.time_provider.unix_nanos();
    for line in batch.split(|&b| b == b'\n') {
      // A trailing newline produces one empty slice.
      if line.is_empty() {
        continue;
      }
      self.process_line(batch, line, now_nanos).await;
    }
  }

  async fn process_line(&self, batch: &Bytes, line: &[u8], now_nanos: i64) {
    self.stats.processed.fetch_add(1, Ordering::Relaxed);

    if self.max_time_delta_nanos > 0 {
      // Lines without a parseable timestamp take `now_nanos` and always
      // pass the window.
      let timestamp = extract_timestamp(line, now_nanos);
      if (timestamp - now_nanos).saturating_abs() > self.max_time_delta_nanos {
        self.stats.invalid_time.fetch_add(1, Ordering::Relaxed);
        return;
      }
    }

    let (subject, counted) = match self.rules.lookup(line) {
      Some(index) => {
        self.stats.triggered[index].fetch_add(1, Ordering::Relaxed);
        self.stats.passed.fetch_add(1, Ordering::Relaxed);
        (self.rules.subject(index), "passed")
      },
      None => {
        self.stats.rejected.fetch_add(1, Ordering::Relaxed);
        (self.junk_subject.as_str(), "rejected")
      },
    };

    // The published line aliases the batch buffer; no newline, no copy.
    if let Err(e) = self.bus.publish(subject, batch.slice_ref(line)).await {
      // Counters stay as they are: the line was classified, delivery failed.
      warn!("dropping {counted} line, publish to {subject} failed: {e}");
    }
  }
}
