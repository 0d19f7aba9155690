// spout - a pub/sub pipeline for influx line protocol metrics
// Copyright The Spout Authors. All rights reserved.
//
// Use of this source code is governed by the Apache License, Version 2.0,
// which can be found at:
// https://www.apache.org/licenses/LICENSE-2.0

#[cfg(test)]
#[path = "./influx_test.rs"]
mod influx_test;

use memchr::memrchr;

// Nanosecond timestamps are at most 19 decimal digits. Anything longer is
// rejected outright, even if the numeric value would fit.
const MAX_TIMESTAMP_LEN: usize = 19;

/// Return the measurement name portion of a line: the prefix up to (but not
/// including) the first unescaped space or comma, or the whole line if there
/// is none. The result aliases the input and keeps any escape sequences
/// as-is.
///
/// A backslash suppresses the delimiter role of the byte that follows it; a
/// lone trailing backslash is literal. Bytes above 0x7F pass through
/// untouched since the delimiter test is a byte test.
#[must_use]
pub fn measurement_name(line: &[u8]) -> &[u8] {
  let mut escaped = false;
  for (i, &b) in line.iter().enumerate() {
    if escaped {
      escaped = false;
      continue;
    }
    match b {
      b'\\' => escaped = true,
      b' ' | b',' => return &line[.. i],
      _ => (),
    }
  }
  line
}

/// Escape a measurement name the way it appears on the wire: spaces and
/// commas get a leading backslash. Basic rules store their operand in this
/// form so lookup can compare against the raw line without unescaping.
#[must_use]
pub fn escape_measurement(name: &str) -> Vec<u8> {
  let mut out = Vec::with_capacity(name.len());
  for &b in name.as_bytes() {
    if b == b' ' || b == b',' {
      out.push(b'\\');
    }
    out.push(b);
  }
  out
}

/// Parse an unsigned decimal integer that fits in an i64. Returns None for
/// empty input, any non-digit byte (including signs and whitespace), or
/// overflow past i64::MAX. This is the hot path replacement for a full
/// integer parser; lines carry at most one such token.
#[must_use]
pub fn fast_parse_int(input: &[u8]) -> Option<i64> {
  if input.is_empty() {
    return None;
  }
  let mut value: i64 = 0;
  for &b in input {
    if !b.is_ascii_digit() {
      return None;
    }
    value = value
      .checked_mul(10)?
      .checked_add(i64::from(b - b'0'))?;
  }
  Some(value)
}

/// Extract the nanosecond timestamp from the last whitespace-separated token
/// of a line, or return `default` when the line does not end in a plausible
/// timestamp. A single trailing newline is stripped before the lookup.
///
/// The tail only counts as a timestamp when a space precedes it and it is
/// 1-19 decimal digits: a line that is nothing but a number has no timestamp,
/// and a trailing space leaves an empty (invalid) tail.
#[must_use]
pub fn extract_timestamp(line: &[u8], default: i64) -> i64 {
  let line = if line.ends_with(b"\n") {
    &line[.. line.len() - 1]
  } else {
    line
  };
  let Some(space) = memrchr(b' ', line) else {
    return default;
  };
  let tail = &line[space + 1 ..];
  if tail.is_empty() || tail.len() > MAX_TIMESTAMP_LEN {
    return default;
  }
  fast_parse_int(tail).unwrap_or(default)
}
