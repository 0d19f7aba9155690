// spout - a pub/sub pipeline for influx line protocol metrics
// Copyright The Spout Authors. All rights reserved.
//
// Use of this source code is governed by the Apache License, Version 2.0,
// which can be found at:
// https://www.apache.org/licenses/LICENSE-2.0

use super::*;
use quickcheck::TestResult;
use quickcheck_macros::quickcheck;

#[test]
fn measurement_names() {
  let check = |input: &str, expected: &str| {
    assert_eq!(
      expected.as_bytes(),
      measurement_name(input.as_bytes()),
      "measurement_name({input:?})"
    );
  };

  check("", "");
  check("h", "h");
  check("日", "日");
  check("hello", "hello");
  check("日本語", "日本語");
  check(" ", "");
  check(",", "");
  check("h world", "h");
  check("h,world", "h");
  check("hello world", "hello");
  check("hello,world", "hello");
  check(r"hello\ world", r"hello\ world");
  check(r"hello\,world", r"hello\,world");
  check(r"hello\ world more", r"hello\ world");
  check(r"hello\,world,more", r"hello\,world");
  check(r"hello\ 日本語 more", r"hello\ 日本語");
  check(r"hello\,日本語 more", r"hello\,日本語");
  check(r"日本語\ hello more", r"日本語\ hello");
  check(r"日本語\,hello more", r"日本語\,hello");
  check(r"\ ", r"\ ");
  check(r"\,", r"\,");
  check(r"\", r"\");
  check(r"h\", r"h\");
  check(r"hello\", r"hello\");
}

#[quickcheck]
fn measurement_name_is_idempotent(line: Vec<u8>) -> bool {
  let first = measurement_name(&line);
  measurement_name(first) == first
}

#[test]
fn escape_measurements() {
  assert_eq!(b"hello".to_vec(), escape_measurement("hello"));
  assert_eq!(br"hell\ o".to_vec(), escape_measurement("hell o"));
  assert_eq!(br"hell\,o".to_vec(), escape_measurement("hell,o"));
  assert_eq!(br"a\ b\,c".to_vec(), escape_measurement("a b,c"));
  assert_eq!(b"".to_vec(), escape_measurement(""));
}

#[test]
fn fast_parse_int_valid() {
  let check = |input: &str, expected: i64| {
    assert_eq!(
      Some(expected),
      fast_parse_int(input.as_bytes()),
      "fast_parse_int({input:?})"
    );
  };

  check("0", 0);
  check("1", 1);
  check("9", 9);
  check("10", 10);
  check("99", 99);
  check("101", 101);
  check("007", 7);
  check("9223372036854775807", i64::MAX);
}

#[test]
fn fast_parse_int_invalid() {
  let check = |input: &str| {
    assert_eq!(None, fast_parse_int(input.as_bytes()), "fast_parse_int({input:?})");
  };

  check("");
  check("9223372036854775808"); // i64::MAX + 1
  check("99999999999999999999");
  check("-1");
  check("+1");
  check(" 1");
  check("1 ");
  check("x");
  check("1x2");
  check("0x10");
}

#[quickcheck]
fn fast_parse_int_round_trips(value: i64) -> TestResult {
  if value < 0 {
    return TestResult::discard();
  }
  TestResult::from_bool(fast_parse_int(value.to_string().as_bytes()) == Some(value))
}

const DEFAULT_TS: i64 = 12345;

#[test]
fn extract_timestamps() {
  let ts: i64 = 865_483_382_000_000_001;
  let ts_str = ts.to_string();

  let check = |input: String, expected: i64| {
    assert_eq!(
      expected,
      extract_timestamp(input.as_bytes(), DEFAULT_TS),
      "extract_timestamp({input:?})"
    );
  };

  check(String::new(), DEFAULT_TS);
  check(" ".to_string(), DEFAULT_TS);
  check("weather temp=99".to_string(), DEFAULT_TS);
  check("weather,city=paris temp=60".to_string(), DEFAULT_TS);
  check("weather,city=paris temp=99,humidity=100".to_string(), DEFAULT_TS);
  check(format!("weather temp=99 {ts_str}"), ts);
  check(format!("weather temp=99 {ts_str}\n"), ts);
  check(format!("weather,city=paris temp=60 {ts_str}"), ts);
  check(format!("weather,city=paris temp=60,humidity=100 {ts_str}"), ts);
  check(format!("weather,city=paris temp=60,humidity=100 {ts_str}\n"), ts);
}

#[test]
fn extract_timestamp_rejects_bad_tails() {
  let ts_str = "865483382000000001";

  let check = |input: String| {
    assert_eq!(
      DEFAULT_TS,
      extract_timestamp(input.as_bytes(), DEFAULT_TS),
      "extract_timestamp({input:?})"
    );
  };

  // A trailing space leaves an empty tail token.
  check(format!("weather temp=99 {ts_str} "));
  check("weather temp=99 xxxxxxxxxxxxxxxxxxx".to_string());
  // Non-digit embedded.
  check("weather temp=99 152076148x803180202".to_string());
  // 20 digits, even though the value itself is small.
  check("weather temp=99 00000000000000000001".to_string());
  check("weather temp=99 11520761485803180202".to_string());
  check(format!("weather temp=99 -{ts_str}"));
  // A bare number is not a timestamp: no preceding space.
  check(ts_str.to_string());
}

#[quickcheck]
fn extract_timestamp_round_trips(value: i64) -> TestResult {
  if value < 0 {
    return TestResult::discard();
  }
  let line = format!("weather temp=99 {value}");
  let with_newline = format!("{line}\n");
  TestResult::from_bool(
    extract_timestamp(line.as_bytes(), DEFAULT_TS) == value
      && extract_timestamp(with_newline.as_bytes(), DEFAULT_TS) == value,
  )
}
