// Copyright (c) 2022-2023, The rastack contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

//! Memory-budgeted decomposition of the output image into horizontal strips,
//! the stacker's unit of parallel work.

use crate::error::{ProcessingError, Result};
use crate::util::{ceil_div, gcd, round_up_multiple};

/// One horizontal strip of one channel of the output image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block {
  pub channel: usize,
  pub row_start: usize,
  pub height: usize,
}

#[derive(Debug, Clone)]
pub struct BlockPlan {
  pub blocks: Vec<Block>,
  pub largest_height: usize,
}

/// Partition `height` rows of `channels` channels into blocks.
///
/// `budget_rows` is the per-thread memory budget expressed in rows of all
/// input frames. When the budget would yield fewer blocks than threads, rows
/// are split finer so every thread gets work; otherwise the count is rounded
/// up to a channel multiple so channels tile independently.
pub fn plan_blocks(
  width: usize,
  height: usize,
  channels: usize,
  budget_rows: usize,
  nb_threads: usize,
) -> Result<BlockPlan> {
  if height == 0 || channels == 0 || nb_threads == 0 {
    return Err(ProcessingError::InternalError(format!(
      "block planner given height {} channels {} threads {}",
      height, channels, nb_threads
    )));
  }
  let rows_per_block = budget_rows.max(1);

  let nb_blocks = if height / rows_per_block < nb_threads {
    // few large blocks: use the smallest channel multiple divisible by the
    // thread count so the pool stays busy
    let mult = nb_threads / gcd(channels, nb_threads);
    mult * channels
  } else {
    round_up_multiple(ceil_div(height * channels, rows_per_block), channels)
  };

  let mut per_channel = nb_blocks / channels;
  if per_channel == 0 {
    return Err(ProcessingError::InternalError(
      "block planner produced too few blocks".to_string(),
    ));
  }
  // strips cannot be thinner than one row
  per_channel = per_channel.min(height);

  let base = height / per_channel;
  let remainder = height % per_channel;
  let mut blocks = Vec::with_capacity(per_channel * channels);
  for channel in 0..channels {
    let mut row_start = 0;
    for b in 0..per_channel {
      // spread the remainder row by row over the first blocks
      let block_height = base + usize::from(b < remainder);
      blocks.push(Block { channel, row_start, height: block_height });
      row_start += block_height;
    }
    if row_start != height {
      return Err(ProcessingError::InternalError(format!(
        "block plan covers {} of {} rows",
        row_start, height
      )));
    }
  }

  let largest_height = base + usize::from(remainder > 0);
  let total: usize = blocks.iter().map(|b| b.height * width).sum();
  if total != width * height * channels {
    return Err(ProcessingError::InternalError(format!(
      "block plan covers {} of {} pixels",
      total,
      width * height * channels
    )));
  }

  Ok(BlockPlan { blocks, largest_height })
}

impl BlockPlan {
  /// `(row_start, height)` bands of one channel, in plan order.
  pub fn channel_bands(&self, channel: usize) -> Vec<(usize, usize)> {
    self
      .blocks
      .iter()
      .filter(|b| b.channel == channel)
      .map(|b| (b.row_start, b.height))
      .collect()
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn assert_exact_partition(plan: &BlockPlan, height: usize, channels: usize) {
    for channel in 0..channels {
      let mut row = 0;
      let mut heights = Vec::new();
      for block in plan.blocks.iter().filter(|b| b.channel == channel) {
        assert_eq!(block.row_start, row, "gap or overlap in channel {}", channel);
        row += block.height;
        heights.push(block.height);
      }
      assert_eq!(row, height, "channel {} does not tile its rows", channel);
      let min = heights.iter().min().unwrap();
      let max = heights.iter().max().unwrap();
      assert!(max - min <= 1, "heights differ by more than one");
      assert!(*max <= plan.largest_height);
    }
  }

  #[test]
  fn partition_is_exact_for_odd_sizes() {
    let plan = plan_blocks(17, 101, 3, 7, 4).unwrap();
    assert_exact_partition(&plan, 101, 3);
    let total: usize = plan.blocks.iter().map(|b| b.height * 17).sum();
    assert_eq!(total, 17 * 101 * 3);
  }

  #[test]
  fn block_count_is_a_channel_multiple() {
    let plan = plan_blocks(8, 100, 3, 10, 2).unwrap();
    assert_eq!(plan.blocks.len() % 3, 0);
    assert_exact_partition(&plan, 100, 3);
  }

  #[test]
  fn generous_budget_still_feeds_every_thread() {
    // budget covers the whole image: the planner must still split so the
    // pool is busy
    let plan = plan_blocks(8, 64, 1, 1000, 4).unwrap();
    assert_eq!(plan.blocks.len(), 4);
    assert_exact_partition(&plan, 64, 1);
  }

  #[test]
  fn thread_multiple_respects_channels() {
    // 3 channels, 4 threads: smallest mult with (mult*3) % 4 == 0 is 4
    let plan = plan_blocks(8, 48, 3, 1000, 4).unwrap();
    assert_eq!(plan.blocks.len(), 12);
    assert_exact_partition(&plan, 48, 3);
  }

  #[test]
  fn tight_budget_gives_single_rows() {
    let plan = plan_blocks(8, 5, 1, 1, 2).unwrap();
    assert_exact_partition(&plan, 5, 1);
    assert_eq!(plan.largest_height, 1);
    assert_eq!(plan.blocks.len(), 5);
  }

  #[test]
  fn more_threads_than_rows_clamps_to_rows() {
    let plan = plan_blocks(8, 2, 1, 1000, 8).unwrap();
    assert_exact_partition(&plan, 2, 1);
    assert_eq!(plan.blocks.len(), 2);
  }

  #[test]
  fn degenerate_input_is_an_internal_error() {
    assert!(matches!(
      plan_blocks(8, 0, 1, 1, 1),
      Err(ProcessingError::InternalError(_))
    ));
    assert!(matches!(
      plan_blocks(8, 4, 1, 1, 0),
      Err(ProcessingError::InternalError(_))
    ));
  }
}
