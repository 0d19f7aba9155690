// spout - a pub/sub pipeline for influx line protocol metrics
// Copyright The Spout Authors. All rights reserved.
//
// Use of this source code is governed by the Apache License, Version 2.0,
// which can be found at:
// https://www.apache.org/licenses/LICENSE-2.0

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

//
// TimeProvider
//

/// Wall clock access for the timestamp window check, injected so tests can
/// pin the clock.
pub trait TimeProvider: Send + Sync + 'static {
  /// Nanoseconds since the Unix epoch.
  fn unix_nanos(&self) -> i64;
}

//
// RealTimeProvider
//

pub struct RealTimeProvider {}

impl TimeProvider for RealTimeProvider {
  fn unix_nanos(&self) -> i64 {
    SystemTime::now()
      .duration_since(UNIX_EPOCH)
      .map_or(0, |d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
  }
}

//
// TestTimeProvider
//

#[derive(Default)]
pub struct TestTimeProvider {
  pub nanos: Arc<AtomicI64>,
}

impl TimeProvider for TestTimeProvider {
  fn unix_nanos(&self) -> i64 {
    self.nanos.load(Ordering::SeqCst)
  }
}
