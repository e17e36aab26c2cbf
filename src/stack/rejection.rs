// Copyright (c) 2022-2023, The rastack contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

//! Outlier rejection over the per-pixel sample vector. Every variant works
//! on normalized samples, keeps at least four, and tallies low/high drops.

#[allow(unused_imports)]
use crate::stats::{abs_dev, mean, median, sample_std};

/// Rejection variants for mean stacking.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rejection {
  None,
  /// Single pass, relative deviation from the median.
  Percentile { low: f32, high: f32 },
  /// Iterated clipping about the median.
  Sigma { low: f32, high: f32 },
  /// As `Sigma`, but rejected samples are replaced by the median so the
  /// sample count stays constant.
  SigmaMedian { low: f32, high: f32 },
  /// Clipping with a Winsorized spread estimate.
  Winsorized { low: f32, high: f32 },
  /// Residuals to the best-fit line through the sorted samples.
  LinearFit { low: f32, high: f32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RejectionTally {
  pub low: u64,
  pub high: u64,
}

impl RejectionTally {
  pub fn add(&mut self, other: RejectionTally) {
    self.low += other.low;
    self.high += other.high;
  }
}

/// Rejection floor: below this many samples nothing is rejected.
const MIN_KEPT: usize = 4;

/// Iteration cap guarding the replace-with-median and Winsorized loops.
const MAX_PASSES: usize = 100;

/// Apply `mode` to `samples` in place. The surviving samples (or, for
/// sigma-median, the constant-size repaired vector) are what remains.
pub fn reject(samples: &mut Vec<f32>, mode: Rejection) -> RejectionTally {
  if samples.len() < MIN_KEPT {
    return RejectionTally::default();
  }
  // The sigma, sigma-median and linear-fit variants measure spread as the
  // mean absolute deviation about their center, not the sample standard
  // deviation: a lone outlier inflates the standard deviation enough to
  // shelter itself from a 3-sigma clip.
  match mode {
    Rejection::None => RejectionTally::default(),
    Rejection::Percentile { low, high } => percentile_clip(samples, low, high),
    Rejection::Sigma { low, high } => sigma_clip(samples, low, high),
    Rejection::SigmaMedian { low, high } => sigma_median_clip(samples, low, high),
    Rejection::Winsorized { low, high } => winsorized_clip(samples, low, high),
    Rejection::LinearFit { low, high } => linear_fit_clip(samples, low, high),
  }
}

fn percentile_clip(samples: &mut Vec<f32>, low: f32, high: f32) -> RejectionTally {
  let mut tally = RejectionTally::default();
  let m = median(&mut samples.clone());
  if m == 0.0 {
    return tally;
  }
  samples.retain(|&p| {
    if p < m && (m - p) / m > low {
      tally.low += 1;
      false
    } else if p > m && (p - m) / m > high {
      tally.high += 1;
      false
    } else {
      true
    }
  });
  tally
}

fn sigma_clip(samples: &mut Vec<f32>, low: f32, high: f32) -> RejectionTally {
  let mut tally = RejectionTally::default();
  loop {
    let m = median(&mut samples.clone());
    let dev = abs_dev(samples, m);
    if dev == 0.0 {
      break;
    }
    let before = samples.len();
    samples.retain(|&p| {
      if p < m - dev * low {
        tally.low += 1;
        false
      } else if p > m + dev * high {
        tally.high += 1;
        false
      } else {
        true
      }
    });
    if samples.len() == before || samples.len() <= MIN_KEPT - 1 {
      break;
    }
  }
  tally
}

fn sigma_median_clip(samples: &mut Vec<f32>, low: f32, high: f32) -> RejectionTally {
  let mut tally = RejectionTally::default();
  for _ in 0..MAX_PASSES {
    let m = median(&mut samples.clone());
    let dev = abs_dev(samples, m);
    if dev == 0.0 {
      break;
    }
    let mut replaced = 0;
    for p in samples.iter_mut() {
      if *p < m - dev * low {
        *p = m;
        tally.low += 1;
        replaced += 1;
      } else if *p > m + dev * high {
        *p = m;
        tally.high += 1;
        replaced += 1;
      }
    }
    if replaced == 0 {
      break;
    }
  }
  tally
}

/// Winsorized location and spread: clip to `median ± 1.5 sigma`, take the
/// median and the 1.134-corrected standard deviation of the clipped set,
/// iterate until the spread is stable within 0.05 %.
fn winsorized_loc_sigma(samples: &[f32]) -> (f32, f32) {
  let mut m = median(&mut samples.to_vec());
  let mut sigma = sample_std(samples);
  for _ in 0..MAX_PASSES {
    let (lo, hi) = (m - 1.5 * sigma, m + 1.5 * sigma);
    let mut clipped: Vec<f32> =
      samples.iter().map(|&p| p.max(lo).min(hi)).collect();
    let new_sigma = 1.134 * sample_std(&clipped);
    let new_m = median(&mut clipped);
    let done = new_sigma == 0.0
      || (sigma > 0.0 && ((new_sigma - sigma).abs() / sigma) < 0.0005);
    m = new_m;
    sigma = new_sigma;
    if done {
      break;
    }
  }
  (m, sigma)
}

fn winsorized_clip(samples: &mut Vec<f32>, low: f32, high: f32) -> RejectionTally {
  let mut tally = RejectionTally::default();
  loop {
    let (m, sigma) = winsorized_loc_sigma(samples);
    let before = samples.len();
    samples.retain(|&p| {
      if p < m - sigma * low {
        tally.low += 1;
        false
      } else if p > m + sigma * high {
        tally.high += 1;
        false
      } else {
        true
      }
    });
    if samples.len() == before || samples.len() <= MIN_KEPT - 1 {
      break;
    }
  }
  tally
}

/// Least-squares line through the sorted samples; `(slope, intercept)`.
fn fit_line(sorted: &[f32]) -> (f64, f64) {
  let n = sorted.len() as f64;
  let sum_x = (n - 1.0) * n / 2.0;
  let sum_x2 = (n - 1.0) * n * (2.0 * n - 1.0) / 6.0;
  let mut sum_y = 0.0f64;
  let mut sum_xy = 0.0f64;
  for (x, &y) in sorted.iter().enumerate() {
    sum_y += f64::from(y);
    sum_xy += x as f64 * f64::from(y);
  }
  let den = n * sum_x2 - sum_x * sum_x;
  if den == 0.0 {
    return (0.0, sum_y / n);
  }
  let a = (n * sum_xy - sum_x * sum_y) / den;
  let b = (sum_y - a * sum_x) / n;
  (a, b)
}

fn linear_fit_clip(samples: &mut Vec<f32>, low: f32, high: f32) -> RejectionTally {
  let mut tally = RejectionTally::default();
  loop {
    samples
      .sort_unstable_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let (a, b) = fit_line(samples);
    let residuals: Vec<f32> = samples
      .iter()
      .enumerate()
      .map(|(x, &y)| (f64::from(y) - (a * x as f64 + b)) as f32)
      .collect();
    let dev = abs_dev(&residuals, 0.0);
    if dev == 0.0 {
      break;
    }
    let before = samples.len();
    let mut keep = residuals.iter().map(|&r| {
      if r < -dev * low {
        tally.low += 1;
        false
      } else if r > dev * high {
        tally.high += 1;
        false
      } else {
        true
      }
    });
    samples.retain(|_| keep.next().unwrap());
    if samples.len() == before || samples.len() <= MIN_KEPT - 1 {
      break;
    }
  }
  tally
}

#[cfg(test)]
mod test {
  use super::*;

  const ALL_MODES: [Rejection; 5] = [
    Rejection::Percentile { low: 0.2, high: 0.2 },
    Rejection::Sigma { low: 3.0, high: 3.0 },
    Rejection::SigmaMedian { low: 3.0, high: 3.0 },
    Rejection::Winsorized { low: 3.0, high: 3.0 },
    Rejection::LinearFit { low: 3.0, high: 3.0 },
  ];

  #[test]
  fn equal_samples_are_a_fixed_point_for_every_mode() {
    for &mode in &ALL_MODES {
      let mut samples = vec![42.0f32; 8];
      let tally = reject(&mut samples, mode);
      assert_eq!(tally, RejectionTally::default(), "{:?} rejected", mode);
      assert_eq!(samples, vec![42.0; 8], "{:?} changed the samples", mode);
    }
  }

  #[test]
  fn too_few_samples_reject_nothing() {
    for &mode in &ALL_MODES {
      let mut samples = vec![1.0, 100.0, 10000.0];
      let tally = reject(&mut samples, mode);
      assert_eq!(tally, RejectionTally::default(), "{:?} rejected", mode);
      assert_eq!(samples.len(), 3);
    }
  }

  #[test]
  fn sigma_clip_converges_on_the_hot_pixel_vector() {
    let mut samples = vec![100.0, 101.0, 99.0, 100.0, 100.0, 255.0, 100.0];
    let tally = reject(&mut samples, Rejection::Sigma { low: 3.0, high: 3.0 });
    assert_eq!(tally, RejectionTally { low: 0, high: 1 });
    let mut kept = samples.clone();
    kept.sort_by(|a, b| a.partial_cmp(b).unwrap());
    assert_eq!(kept, vec![99.0, 100.0, 100.0, 100.0, 100.0, 101.0]);
    assert_eq!(mean(&samples).round(), 100.0);
  }

  #[test]
  fn percentile_drops_relative_outliers_in_one_pass() {
    let mut samples = vec![100.0, 104.0, 96.0, 100.0, 131.0, 60.0];
    let tally =
      reject(&mut samples, Rejection::Percentile { low: 0.3, high: 0.3 });
    // (131-100)/100 and (100-60)/100 exceed 0.3; 96 and 104 stay
    assert_eq!(tally, RejectionTally { low: 1, high: 1 });
    assert_eq!(samples, vec![100.0, 104.0, 96.0, 100.0]);
  }

  #[test]
  fn sigma_median_repairs_in_place() {
    let mut samples = vec![100.0, 101.0, 99.0, 100.0, 100.0, 255.0, 100.0];
    let tally =
      reject(&mut samples, Rejection::SigmaMedian { low: 3.0, high: 3.0 });
    assert!(tally.high >= 1);
    // the sample count does not change; the outlier became the median
    assert_eq!(samples.len(), 7);
    assert!(samples.iter().all(|&p| p <= 101.0 && p >= 99.0));
  }

  #[test]
  fn winsorized_rejects_a_wild_outlier() {
    let mut samples = vec![10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 1000.0];
    let tally =
      reject(&mut samples, Rejection::Winsorized { low: 3.0, high: 3.0 });
    assert_eq!(tally.high, 1);
    assert_eq!(samples, vec![10.0; 6]);
  }

  #[test]
  fn linear_fit_rejects_by_residual() {
    let mut samples = vec![10.0, 10.0, 10.0, 10.0, 10.0, 10.0, 1000.0];
    let tally =
      reject(&mut samples, Rejection::LinearFit { low: 1.0, high: 1.0 });
    assert!(tally.high >= 1);
    assert!(!samples.contains(&1000.0));
    assert!(samples.iter().all(|&p| p == 10.0));
  }

  #[test]
  fn asymmetric_thresholds_only_clip_their_side() {
    // generous low bound, tight high bound: only the high outlier goes
    let mut samples = vec![100.0, 100.0, 100.0, 100.0, 40.0, 160.0];
    let tally =
      reject(&mut samples, Rejection::Sigma { low: 100.0, high: 2.0 });
    assert_eq!(tally.low, 0);
    assert!(tally.high >= 1);
    assert!(!samples.contains(&160.0));
    assert!(samples.contains(&40.0));
  }
}
