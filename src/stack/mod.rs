// Copyright (c) 2022-2023, The rastack contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

//! Block-parallel stacking: merge all selected frames of a sequence into one
//! image by per-pixel reduction, reading memory-budgeted horizontal strips.
//!
//! Everything here is top-down: stores deliver top-down rows and the result
//! is written top-down. A frame registered with shift `(sx, sy)` contributes
//! its `(x - sx, y - sy)` sample to output pixel `(x, y)`, zero off-image.

pub mod blocks;
pub mod norm;
pub mod rejection;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::engine::{engine_thread_count, DEFAULT_MEMORY_BUDGET};
use crate::error::{ErrorSlot, ProcessingError, Result};
use crate::frame::{Frame, ImageData};
use crate::progress::{
  report, CancelToken, JobGuard, Progress, ProgressCounter, ProgressSink,
};
use crate::region::{split_rows_mut, Rect};
use crate::sequence::SelectionMap;
use crate::stats::{mean, median, StatsCache};
use crate::store::{AsPixelBuf, FrameStore};
use crate::util::{Pixel, PixelType};

use blocks::{plan_blocks, Block, BlockPlan};
use norm::{compute_normalization, NormCoeffs, Normalization};
use rejection::{reject, Rejection, RejectionTally};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StackMethod {
  Median,
  /// Arithmetic mean of the samples surviving rejection.
  Mean,
}

pub struct StackParams {
  pub method: StackMethod,
  pub rejection: Rejection,
  pub normalization: Normalization,
  pub use_registration: bool,
  pub force_float: bool,
  /// Per-thread memory budget in rows of all selected frames; 0 derives it
  /// from `max_memory_bytes`.
  pub rows_per_thread: usize,
  pub max_memory_bytes: u64,
  /// User thread cap; 0 means no cap.
  pub max_threads: usize,
  /// Reference frame for normalization, as an output index.
  pub reference: usize,
}

impl Default for StackParams {
  fn default() -> Self {
    Self {
      method: StackMethod::Mean,
      rejection: Rejection::None,
      normalization: Normalization::None,
      use_registration: true,
      force_float: false,
      rows_per_thread: 0,
      max_memory_bytes: DEFAULT_MEMORY_BUDGET,
      max_threads: 0,
      reference: 0,
    }
  }
}

#[derive(Debug)]
pub struct StackOutcome {
  pub image: ImageData,
  /// Number of frames merged.
  pub frames: u32,
  /// Per-channel rejection tallies.
  pub rejected_low: Vec<u64>,
  pub rejected_high: Vec<u64>,
}

struct Scratch<T> {
  /// `n_frames * largest_block_height * width` samples.
  buf: Vec<T>,
  samples: Vec<f32>,
}

/// Read the rows of `block`, shifted by `sy`, for one frame into `slot`.
/// Rows falling outside the image are zero.
fn read_block_rows<T: Pixel + AsPixelBuf>(
  store: &dyn FrameStore,
  index: u32,
  block: &Block,
  sy: isize,
  width: usize,
  height: usize,
  slot: &mut [T],
) -> Result<()> {
  let src_top = block.row_start as isize - sy;
  let src_bot = src_top + block.height as isize;
  if src_bot <= 0 || src_top >= height as isize {
    // entirely off-image
    for v in slot.iter_mut() {
      *v = T::default();
    }
    return Ok(());
  }
  if src_top < 0 || src_bot > height as isize {
    // partially off the top or bottom: clear, then crop the read
    for v in slot.iter_mut() {
      *v = T::default();
    }
  }
  let read_top = src_top.max(0) as usize;
  let read_bot = (src_bot.min(height as isize)) as usize;
  let rows = read_bot - read_top;
  let dst_row = (read_top as isize - src_top) as usize;
  let dest = &mut slot[dst_row * width..(dst_row + rows) * width];
  store.read_partial(
    index,
    block.channel,
    Rect { x: 0, y: read_top as isize, width, height: rows },
    T::buf_mut(dest),
  )
}

#[allow(clippy::too_many_arguments)]
fn stack_typed<TIn, TOut>(
  store: &dyn FrameStore,
  selection: &SelectionMap,
  params: &StackParams,
  coeffs: &NormCoeffs,
  plan: &BlockPlan,
  pool: &rayon::ThreadPool,
  progress: &ProgressSink,
  cancel: &CancelToken,
) -> Result<(Frame<TOut>, Vec<RejectionTally>)>
where
  TIn: Pixel + AsPixelBuf,
  TOut: Pixel,
{
  let info = store.info();
  let (width, height, channels) = (info.width, info.height, info.channels);
  let n = selection.len();

  // integer translation hints per (channel, frame)
  let shifts: Vec<Vec<(isize, isize)>> = (0..channels)
    .map(|ch| {
      selection
        .iter()
        .map(|i| {
          if params.use_registration {
            let reg = store.registration(ch, i);
            (reg.x.round() as isize, reg.y.round() as isize)
          } else {
            (0, 0)
          }
        })
        .collect()
    })
    .collect();

  let mut out = Frame::<TOut>::new(width, height, channels)?;
  let mut work: Vec<(Block, crate::region::PlaneRegionMut<'_, TOut>)> = Vec::new();
  for (ch, plane) in out.planes.iter_mut().enumerate() {
    let bands = plan.channel_bands(ch);
    let regions = split_rows_mut(plane, &bands);
    let channel_blocks = plan.blocks.iter().copied().filter(|b| b.channel == ch);
    work.extend(channel_blocks.zip(regions));
  }

  let tallies: Vec<(AtomicU64, AtomicU64)> =
    (0..channels).map(|_| (AtomicU64::new(0), AtomicU64::new(0))).collect();
  let errors = ErrorSlot::new();
  let counter = ProgressCounter::new(
    "stacking blocks",
    work.len() as u32,
    Arc::clone(progress),
  );
  let slot_len = plan.largest_height * width;

  pool.install(|| {
    work.into_par_iter().for_each_init(
      || Scratch::<TIn> {
        buf: vec![TIn::default(); n * slot_len],
        samples: Vec::with_capacity(n),
      },
      |scratch, (block, mut region)| {
        // cancellation is honored between blocks; a started block finishes
        if cancel.is_cancelled() || errors.is_set() {
          return;
        }
        let ch = block.channel;
        for f in 0..n {
          let (_, sy) = shifts[ch][f];
          let slot = &mut scratch.buf[f * slot_len..f * slot_len + block.height * width];
          if let Err(e) = read_block_rows::<TIn>(
            store,
            selection.source(f),
            &block,
            sy,
            width,
            height,
            slot,
          ) {
            errors.set(e);
            return;
          }
        }

        let mut local = RejectionTally::default();
        for y in 0..block.height {
          let out_row = &mut region[y];
          for x in 0..width {
            scratch.samples.clear();
            for f in 0..n {
              let (sx, _) = shifts[ch][f];
              let src_x = x as isize - sx;
              let raw = if src_x < 0 || src_x >= width as isize {
                0.0
              } else {
                scratch.buf[f * slot_len + y * width + src_x as usize].as_f32()
              };
              scratch.samples.push(coeffs.apply(f, ch, raw));
            }
            let value = match params.method {
              StackMethod::Median => median(&mut scratch.samples),
              StackMethod::Mean => {
                local.add(reject(&mut scratch.samples, params.rejection));
                mean(&scratch.samples)
              }
            };
            out_row[x] = TOut::from_f32(value);
          }
        }
        tallies[ch].0.fetch_add(local.low, Ordering::AcqRel);
        tallies[ch].1.fetch_add(local.high, Ordering::AcqRel);
        counter.tick();
      },
    );
  });

  if let Some(e) = errors.take() {
    return Err(e);
  }
  cancel.check()?;

  let tallies = tallies
    .into_iter()
    .map(|(low, high)| RejectionTally {
      low: low.into_inner(),
      high: high.into_inner(),
    })
    .collect();
  Ok((out, tallies))
}

/// Merge the selected frames of a sequence into a single image.
///
/// The per-thread memory budget drives the block decomposition; blocks run on
/// a bounded pool with per-thread scratch buffers. Cancellation between
/// blocks discards the partial result.
pub fn run_stack_job(
  store: &dyn FrameStore,
  include: Option<&(dyn Fn(u32) -> bool + Send + Sync)>,
  params: &StackParams,
  cache: Option<&mut StatsCache>,
  progress: &ProgressSink,
  cancel: &CancelToken,
) -> Result<StackOutcome> {
  let _busy = JobGuard::acquire()?;
  report(progress, "stacking", Progress::Reset);

  let info = store.info();
  let selection = match include {
    Some(include) => SelectionMap::build(info.frame_count, include),
    None => SelectionMap::all(info.frame_count),
  };
  if selection.is_empty() {
    return Err(ProcessingError::PreparationFailed(
      "no frame selected in the sequence".to_string(),
    ));
  }
  let n = selection.len();
  if params.reference >= n {
    return Err(ProcessingError::PreparationFailed(format!(
      "reference frame {} outside the {} selected frames",
      params.reference, n
    )));
  }

  let threads = engine_thread_count(
    rayon::current_num_threads(),
    usize::max_value(),
    params.max_threads,
    true,
    store.is_reentrant_reader(),
  );
  let row_bytes =
    (info.width * info.pixel_type.bytes_per_sample()) as u64 * n as u64;
  let budget_rows = if params.rows_per_thread > 0 {
    params.rows_per_thread
  } else {
    ((params.max_memory_bytes / threads as u64 / row_bytes.max(1)).max(1)) as usize
  };
  let plan = plan_blocks(info.width, info.height, info.channels, budget_rows, threads)?;
  tracing::debug!(
    frames = n,
    threads,
    blocks = plan.blocks.len(),
    largest = plan.largest_height,
    "stack plan ready"
  );

  let pool = rayon::ThreadPoolBuilder::new()
    .num_threads(threads)
    .build()
    .map_err(|e| ProcessingError::InternalError(format!("thread pool: {}", e)))?;

  let coeffs = pool.install(|| {
    compute_normalization(
      store,
      &selection,
      params.normalization,
      params.reference,
      cache,
      cancel,
    )
  })?;
  cancel.check()?;

  let (image, tallies) = match (info.pixel_type, params.force_float) {
    (PixelType::U16, false) => {
      let (frame, tallies) = stack_typed::<u16, u16>(
        store, &selection, params, &coeffs, &plan, &pool, progress, cancel,
      )?;
      (ImageData::U16(frame), tallies)
    }
    (PixelType::U16, true) => {
      let (frame, tallies) = stack_typed::<u16, f32>(
        store, &selection, params, &coeffs, &plan, &pool, progress, cancel,
      )?;
      (ImageData::F32(frame), tallies)
    }
    (PixelType::F32, _) => {
      let (frame, tallies) = stack_typed::<f32, f32>(
        store, &selection, params, &coeffs, &plan, &pool, progress, cancel,
      )?;
      (ImageData::F32(frame), tallies)
    }
  };

  for (ch, tally) in tallies.iter().enumerate() {
    if tally.low > 0 || tally.high > 0 {
      tracing::info!(
        channel = ch,
        low = tally.low,
        high = tally.high,
        "pixels rejected"
      );
    }
  }
  report(progress, "stacking", Progress::Done);

  Ok(StackOutcome {
    image,
    frames: n as u32,
    rejected_low: tallies.iter().map(|t| t.low).collect(),
    rejected_high: tallies.iter().map(|t| t.high).collect(),
  })
}
