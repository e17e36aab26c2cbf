// Copyright (c) 2022-2023, The rastack contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use thiserror::Error;

/// Failure taxonomy of the processing core.
///
/// Frame-level kinds (`FrameReadFailed`, `FrameProcessingFailed`) may be
/// recovered by the engine depending on its error policy; every other kind is
/// fatal to the job that raised it.
#[derive(Debug, Error)]
pub enum ProcessingError {
  #[error("preparation failed: {0}")]
  PreparationFailed(String),

  #[error("frame {index} could not be read")]
  FrameReadFailed { index: u32 },

  #[error("processing frame {index} failed")]
  FrameProcessingFailed { index: u32 },

  #[error("write failed: {0}")]
  WriteFailed(String),

  #[error("incompatible frame: {0}")]
  Incompatible(String),

  #[error("not enough disk space: need {needed} bytes, {available} available")]
  OutOfSpace { needed: u64, available: u64 },

  #[error("out of memory: {0}")]
  OutOfMemory(String),

  #[error("processing was cancelled")]
  Cancelled,

  #[error("another processing job is already running")]
  Busy,

  #[error("internal error: {0}")]
  InternalError(String),

  #[error("i/o error: {0}")]
  Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ProcessingError>;

/// First-error-wins slot shared between workers.
///
/// The first fatal error becomes the job retval; later errors are logged and
/// dropped. The `fatal` flag is readable without taking the lock so workers
/// can bail out cheaply at loop top.
#[derive(Debug, Default)]
pub struct ErrorSlot {
  fatal: AtomicBool,
  first: Mutex<Option<ProcessingError>>,
}

impl ErrorSlot {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set(&self, err: ProcessingError) {
    let mut slot = self.first.lock().unwrap();
    if slot.is_none() {
      *slot = Some(err);
      self.fatal.store(true, Ordering::Release);
    } else {
      tracing::warn!(error = %err, "error dropped, an earlier one wins");
    }
  }

  #[inline]
  pub fn is_set(&self) -> bool {
    self.fatal.load(Ordering::Acquire)
  }

  pub fn take(&self) -> Option<ProcessingError> {
    self.first.lock().unwrap().take()
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn first_error_wins() {
    let slot = ErrorSlot::new();
    assert!(!slot.is_set());
    slot.set(ProcessingError::Cancelled);
    slot.set(ProcessingError::Busy);
    assert!(slot.is_set());
    match slot.take() {
      Some(ProcessingError::Cancelled) => {}
      other => panic!("expected first error, got {:?}", other),
    }
  }
}
