// Copyright (c) 2022-2023, The rastack contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

//! Per-frame linear rescaling that aligns intensity distributions before
//! reduction. Coefficients come from robust per-(frame, channel) location
//! and scale statistics; the reference frame always maps to itself.

use rayon::prelude::*;

use crate::error::Result;
use crate::frame::ImageData;
use crate::progress::CancelToken;
use crate::sequence::SelectionMap;
use crate::stats::{ksigma_loc_scale, LocScale, StatsCache};
use crate::store::FrameStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Normalization {
  None,
  Additive,
  AdditiveScaling,
  Multiplicative,
  MultiplicativeScaling,
}

impl Normalization {
  #[inline]
  pub fn is_additive(self) -> bool {
    matches!(self, Normalization::Additive | Normalization::AdditiveScaling)
  }

  #[inline]
  pub fn is_multiplicative(self) -> bool {
    matches!(
      self,
      Normalization::Multiplicative | Normalization::MultiplicativeScaling
    )
  }

  #[inline]
  pub fn is_scaling(self) -> bool {
    matches!(
      self,
      Normalization::AdditiveScaling | Normalization::MultiplicativeScaling
    )
  }
}

/// `(offset, multiplier, scale)` per (selected frame, channel).
#[derive(Debug, Clone)]
pub struct NormCoeffs {
  channels: usize,
  offset: Vec<f32>,
  multiplier: Vec<f32>,
  scale: Vec<f32>,
}

impl NormCoeffs {
  pub fn identity(n_frames: usize, channels: usize) -> Self {
    let n = n_frames * channels;
    Self {
      channels,
      offset: vec![0.0; n],
      multiplier: vec![1.0; n],
      scale: vec![1.0; n],
    }
  }

  /// Normalized sample: `scale * p * multiplier - offset` (the unused branch
  /// of each mode is held at its identity).
  #[inline]
  pub fn apply(&self, frame: usize, channel: usize, p: f32) -> f32 {
    let i = frame * self.channels + channel;
    self.scale[i] * p * self.multiplier[i] - self.offset[i]
  }

  #[inline]
  pub fn is_identity_for(&self, frame: usize) -> bool {
    (0..self.channels).all(|c| {
      let i = frame * self.channels + c;
      self.offset[i] == 0.0 && self.multiplier[i] == 1.0 && self.scale[i] == 1.0
    })
  }
}

fn frame_stats(store: &dyn FrameStore, index: u32) -> Result<Vec<LocScale>> {
  let image = store.read_frame(index, false)?;
  Ok(match &image {
    ImageData::U16(f) => {
      f.planes.iter().map(|p| ksigma_loc_scale(&p.data)).collect()
    }
    ImageData::F32(f) => {
      f.planes.iter().map(|p| ksigma_loc_scale(&p.data)).collect()
    }
  })
}

/// Statistics pre-pass: per-(selected frame, channel) location and scale,
/// computed in parallel and served from `cache` when possible.
pub fn selection_stats(
  store: &dyn FrameStore,
  selection: &SelectionMap,
  cache: Option<&mut StatsCache>,
  cancel: &CancelToken,
) -> Result<Vec<Vec<LocScale>>> {
  let channels = store.info().channels;
  let mut stats: Vec<Option<Vec<LocScale>>> = (0..selection.len())
    .map(|o| {
      let i = selection.source(o);
      cache.as_ref().and_then(|c| {
        let per_channel: Vec<LocScale> =
          (0..channels).filter_map(|ch| c.get(i, ch)).collect();
        if per_channel.len() == channels {
          Some(per_channel)
        } else {
          None
        }
      })
    })
    .collect();

  let missing: Vec<usize> = stats
    .iter()
    .enumerate()
    .filter(|(_, s)| s.is_none())
    .map(|(o, _)| o)
    .collect();
  tracing::debug!(
    cached = selection.len() - missing.len(),
    computed = missing.len(),
    "normalization statistics pre-pass"
  );

  let computed: Vec<(usize, Vec<LocScale>)> = if store.is_reentrant_reader() {
    missing
      .par_iter()
      .map(|&o| {
        cancel.check()?;
        Ok((o, frame_stats(store, selection.source(o))?))
      })
      .collect::<Result<Vec<_>>>()?
  } else {
    missing
      .iter()
      .map(|&o| {
        cancel.check()?;
        Ok((o, frame_stats(store, selection.source(o))?))
      })
      .collect::<Result<Vec<_>>>()?
  };

  let mut cache = cache;
  for (o, per_channel) in computed {
    if let Some(cache) = cache.as_mut() {
      for (ch, &stat) in per_channel.iter().enumerate() {
        cache.insert(selection.source(o), ch, stat);
      }
    }
    stats[o] = Some(per_channel);
  }

  Ok(stats.into_iter().map(|s| s.expect("stats computed")).collect())
}

/// Compute the per-frame coefficients of §normalization for the selected
/// frames. `reference` is an output index.
pub fn compute_normalization(
  store: &dyn FrameStore,
  selection: &SelectionMap,
  mode: Normalization,
  reference: usize,
  cache: Option<&mut StatsCache>,
  cancel: &CancelToken,
) -> Result<NormCoeffs> {
  let channels = store.info().channels;
  let n = selection.len();
  if mode == Normalization::None {
    return Ok(NormCoeffs::identity(n, channels));
  }
  let stats = selection_stats(store, selection, cache, cancel)?;
  let mut coeffs = NormCoeffs::identity(n, channels);
  for channel in 0..channels {
    let LocScale { location: loc0, scale: scale0 } = stats[reference][channel];
    for (f, per_channel) in stats.iter().enumerate() {
      let LocScale { location, scale } = per_channel[channel];
      let i = f * channels + channel;
      let s = if mode.is_scaling() && scale != 0.0 {
        (scale0 / scale) as f32
      } else {
        1.0
      };
      coeffs.scale[i] = s;
      if mode.is_additive() {
        coeffs.offset[i] = (f64::from(s) * location - loc0) as f32;
      }
      if mode.is_multiplicative() {
        coeffs.multiplier[i] =
          if location != 0.0 { (loc0 / location) as f32 } else { 1.0 };
      }
    }
  }
  Ok(coeffs)
}
