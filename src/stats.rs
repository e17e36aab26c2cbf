// Copyright (c) 2022-2023, The rastack contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

//! Robust statistics for normalization and rejection. Accumulation happens in
//! `f64` whatever the storage type, so both pixel paths share one numerical
//! behavior.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde_derive::{Deserialize, Serialize};

use crate::error::{ProcessingError, Result};
use crate::util::Pixel;

/// Median of a scratch slice; the slice is reordered. Even-length input
/// yields the mean of the two middle order statistics.
pub fn median(values: &mut [f32]) -> f32 {
  assert!(!values.is_empty());
  values.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
  let n = values.len();
  if n % 2 == 1 {
    values[n / 2]
  } else {
    (values[n / 2 - 1] + values[n / 2]) / 2.0
  }
}

pub fn mean(values: &[f32]) -> f32 {
  if values.is_empty() {
    return 0.0;
  }
  let sum: f64 = values.iter().map(|&v| f64::from(v)).sum();
  (sum / values.len() as f64) as f32
}

/// Sample standard deviation (n-1 denominator) about the mean.
pub fn sample_std(values: &[f32]) -> f32 {
  if values.len() < 2 {
    return 0.0;
  }
  let m = f64::from(mean(values));
  let ss: f64 = values.iter().map(|&v| (f64::from(v) - m).powi(2)).sum();
  ((ss / (values.len() - 1) as f64).sqrt()) as f32
}

/// Mean absolute deviation about `center`, the robust spread estimate used by
/// the sigma-style rejections.
pub fn abs_dev(values: &[f32], center: f32) -> f32 {
  if values.is_empty() {
    return 0.0;
  }
  let c = f64::from(center);
  let sum: f64 = values.iter().map(|&v| (f64::from(v) - c).abs()).sum();
  (sum / values.len() as f64) as f32
}

/// Robust per-channel location and scale of one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocScale {
  pub location: f64,
  pub scale: f64,
}

/// Iterative k-sigma clipped mean (k = 3, seeded at the median) for the
/// location; mean absolute deviation about it for the scale.
pub fn ksigma_loc_scale<T: Pixel>(samples: &[T]) -> LocScale {
  assert!(!samples.is_empty());
  let mut values: Vec<f64> = samples.iter().map(|v| v.as_f64()).collect();
  values.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
  let n = values.len();
  let mut location = if n % 2 == 1 {
    values[n / 2]
  } else {
    (values[n / 2 - 1] + values[n / 2]) / 2.0
  };

  for _ in 0..10 {
    let spread = {
      let ss: f64 = values.iter().map(|&v| (v - location).powi(2)).sum();
      (ss / n as f64).sqrt()
    };
    if spread == 0.0 {
      break;
    }
    let (lo, hi) = (location - 3.0 * spread, location + 3.0 * spread);
    let mut sum = 0.0;
    let mut kept = 0usize;
    for &v in &values {
      if v >= lo && v <= hi {
        sum += v;
        kept += 1;
      }
    }
    if kept == 0 {
      break;
    }
    let next = sum / kept as f64;
    let done = (next - location).abs() <= 1e-7 * spread;
    location = next;
    if done {
      break;
    }
  }

  let scale =
    values.iter().map(|&v| (v - location).abs()).sum::<f64>() / n as f64;
  LocScale { location, scale }
}

/// Cache of per-(frame, channel) statistics. Normalization pre-passes over a
/// sequence are expensive; stacking the same sequence twice should not pay
/// twice.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StatsCache {
  entries: HashMap<(u32, u32), LocScale>,
}

impl StatsCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn load(path: &Path) -> Result<StatsCache> {
    let file = File::open(path)?;
    bincode::deserialize_from(BufReader::new(file))
      .map_err(|e| ProcessingError::InternalError(format!("stats cache: {}", e)))
  }

  pub fn save(&self, path: &Path) -> Result<()> {
    let file = File::create(path)?;
    bincode::serialize_into(BufWriter::new(file), self)
      .map_err(|e| ProcessingError::InternalError(format!("stats cache: {}", e)))
  }

  pub fn get(&self, frame: u32, channel: usize) -> Option<LocScale> {
    self.entries.get(&(frame, channel as u32)).copied()
  }

  pub fn insert(&mut self, frame: u32, channel: usize, stats: LocScale) {
    self.entries.insert((frame, channel as u32), stats);
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
}
