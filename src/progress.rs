// Copyright (c) 2022-2023, The rastack contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{ProcessingError, Result};

/// Progress report states, beyond a plain completion fraction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Progress {
  Fraction(f32),
  Reset,
  Done,
  Pulsate,
}

/// Progress callback. Invoked from the master thread for milestones and from
/// workers (through `ProgressCounter`) for per-frame numerators.
pub type ProgressSink = Arc<dyn Fn(&str, Progress) + Send + Sync>;

pub fn null_progress() -> ProgressSink {
  Arc::new(|_, _| {})
}

#[inline]
pub fn report(sink: &ProgressSink, message: &str, progress: Progress) {
  (**sink)(message, progress);
}

/// Shared numerator for worker progress updates.
pub struct ProgressCounter {
  label: String,
  done: AtomicU32,
  total: u32,
  sink: ProgressSink,
}

impl ProgressCounter {
  pub fn new(label: impl Into<String>, total: u32, sink: ProgressSink) -> Self {
    Self { label: label.into(), done: AtomicU32::new(0), total, sink }
  }

  /// Record one completed unit and report the new fraction.
  pub fn tick(&self) {
    let done = self.done.fetch_add(1, Ordering::AcqRel) + 1;
    let frac = if self.total == 0 { 1.0 } else { done as f32 / self.total as f32 };
    report(&self.sink, &self.label, Progress::Fraction(frac));
  }

  #[inline]
  pub fn done(&self) -> u32 {
    self.done.load(Ordering::Acquire)
  }
}

/// Caller-settable cancellation flag, observed by workers at loop top and at
/// suspension points.
#[derive(Clone, Default)]
pub struct CancelToken {
  flag: Arc<AtomicBool>,
}

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn cancel(&self) {
    self.flag.store(true, Ordering::Release);
  }

  #[inline]
  pub fn is_cancelled(&self) -> bool {
    self.flag.load(Ordering::Acquire)
  }

  /// `Err(Cancelled)` once the flag is set; usable with `?` at suspension
  /// points.
  #[inline]
  pub fn check(&self) -> Result<()> {
    if self.is_cancelled() {
      Err(ProcessingError::Cancelled)
    } else {
      Ok(())
    }
  }
}

/// Engine/stacker job lifecycle.
///
/// `Cancelling` is entered once workers have observed the cancel flag;
/// `Finalizing` always runs, whatever the path taken to reach it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
  Idle,
  Preparing,
  Running,
  Cancelling,
  Finalizing,
  Done,
}

/// Only one processing job may run per process. The source guarded this with
/// a mutex and a boolean; here owning the guard IS the right to run.
static PROCESSING_BUSY: AtomicBool = AtomicBool::new(false);

pub struct JobGuard(());

impl JobGuard {
  pub fn acquire() -> Result<JobGuard> {
    if PROCESSING_BUSY
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_ok()
    {
      Ok(JobGuard(()))
    } else {
      Err(ProcessingError::Busy)
    }
  }
}

impl Drop for JobGuard {
  fn drop(&mut self) {
    PROCESSING_BUSY.store(false, Ordering::Release);
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn cancel_token_flags_and_checks() {
    let token = CancelToken::new();
    assert!(token.check().is_ok());
    let clone = token.clone();
    clone.cancel();
    assert!(token.is_cancelled());
    assert!(matches!(token.check(), Err(ProcessingError::Cancelled)));
  }

  #[test]
  fn busy_guard_is_exclusive() {
    let guard = JobGuard::acquire().unwrap();
    assert!(matches!(JobGuard::acquire(), Err(ProcessingError::Busy)));
    drop(guard);
    assert!(JobGuard::acquire().is_ok());
  }

  #[test]
  fn progress_counter_reports_fractions() {
    use std::sync::Mutex;
    let seen: Arc<Mutex<Vec<f32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = Arc::clone(&seen);
    let sink: ProgressSink = Arc::new(move |_, p| {
      if let Progress::Fraction(f) = p {
        sink_seen.lock().unwrap().push(f);
      }
    });
    let counter = ProgressCounter::new("test", 4, sink);
    for _ in 0..4 {
      counter.tick();
    }
    assert_eq!(*seen.lock().unwrap(), vec![0.25, 0.5, 0.75, 1.0]);
    assert_eq!(counter.done(), 4);
  }
}
