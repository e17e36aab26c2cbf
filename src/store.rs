// Copyright (c) 2022-2023, The rastack contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

use std::path::Path;

use crate::containers::{self, ContainerKind, ContainerWriter};
use crate::error::{ProcessingError, Result};
use crate::frame::ImageData;
use crate::region::{Area, PlaneRegion, Rect};
use crate::sequence::{RegShift, Registration, SequenceInfo};
use crate::util::Pixel;

/// Caller-typed destination for partial reads.
pub enum PixelBufMut<'a> {
  U16(&'a mut [u16]),
  F32(&'a mut [f32]),
}

impl<'a> PixelBufMut<'a> {
  #[inline]
  pub fn len(&self) -> usize {
    match self {
      PixelBufMut::U16(b) => b.len(),
      PixelBufMut::F32(b) => b.len(),
    }
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// View a typed scratch slice as a partial-read destination.
pub trait AsPixelBuf: Pixel {
  fn buf_mut(slice: &mut [Self]) -> PixelBufMut<'_>;
}

impl AsPixelBuf for u16 {
  #[inline]
  fn buf_mut(slice: &mut [u16]) -> PixelBufMut<'_> {
    PixelBufMut::U16(slice)
  }
}

impl AsPixelBuf for f32 {
  #[inline]
  fn buf_mut(slice: &mut [f32]) -> PixelBufMut<'_> {
    PixelBufMut::F32(slice)
  }
}

/// Sequence backend contract.
///
/// Stores provide ordered random access to frames and frame metadata by
/// index, and produce output writers for a given container kind. Partial
/// reads are delivered top-down whatever the on-disk orientation; flipping is
/// the store's responsibility.
pub trait FrameStore: Send + Sync {
  fn frame_count(&self) -> u32;

  fn info(&self) -> SequenceInfo;

  /// Fully materialize one frame. 16-bit storage is converted to float when
  /// `want_float` is set.
  fn read_frame(&self, index: u32, want_float: bool) -> Result<ImageData>;

  /// Read the rectangle `area` of one channel into `dest`, which must hold
  /// exactly `area.width * area.height` samples of the sequence storage type.
  fn read_partial(
    &self,
    index: u32,
    channel: usize,
    area: Rect,
    dest: PixelBufMut<'_>,
  ) -> Result<()>;

  /// Zero when no registration data exists.
  fn registration(&self, channel: usize, index: u32) -> RegShift {
    let _ = (channel, index);
    RegShift::default()
  }

  /// Whether several threads may read this sequence concurrently. The engine
  /// consults this to pick its parallelism.
  fn is_reentrant_reader(&self) -> bool;

  /// Output writer for this sequence's geometry. `expected_frame_count` of
  /// `None` means unknown; writers must not rely on it then.
  fn create_writer(
    &self,
    kind: ContainerKind,
    path: &Path,
    expected_frame_count: Option<u32>,
  ) -> Result<Box<dyn ContainerWriter>> {
    containers::create_writer(kind, path, &self.info(), expected_frame_count)
  }
}

/// In-memory sequence, the join target for in-process pipelines and the test
/// backend.
pub struct MemoryStore {
  info: SequenceInfo,
  frames: Vec<ImageData>,
  registration: Registration,
  reentrant: bool,
}

impl MemoryStore {
  pub fn new(frames: Vec<ImageData>, kind: crate::sequence::SequenceKind) -> Result<Self> {
    let first = frames.first().ok_or_else(|| {
      ProcessingError::Incompatible("empty sequence".to_string())
    })?;
    let info = SequenceInfo {
      frame_count: frames.len() as u32,
      width: first.width(),
      height: first.height(),
      channels: first.channels(),
      pixel_type: first.pixel_type(),
      bit_depth: first.bit_depth(),
      kind,
    };
    for (i, frame) in frames.iter().enumerate() {
      if !frame.same_geometry(first) {
        return Err(ProcessingError::Incompatible(format!(
          "frame {} geometry differs from frame 0",
          i
        )));
      }
    }
    let channels = info.channels;
    Ok(Self { info, frames, registration: Registration::new(channels), reentrant: true })
  }

  pub fn with_registration(mut self, registration: Registration) -> Self {
    self.registration = registration;
    self
  }

  /// Force single-threaded reader behavior, for tests exercising the engine's
  /// reentrancy rule.
  pub fn non_reentrant(mut self) -> Self {
    self.reentrant = false;
    self
  }

  pub fn frame(&self, index: u32) -> &ImageData {
    &self.frames[index as usize]
  }
}

fn copy_partial<T: Pixel>(
  plane: &crate::frame::Plane<T>,
  area: Rect,
  dest: &mut [T],
) -> Result<()> {
  if area.x < 0
    || area.y < 0
    || area.x as usize + area.width > plane.cfg.width
    || area.y as usize + area.height > plane.cfg.height
  {
    return Err(ProcessingError::Incompatible(format!(
      "partial read {:?} outside {}x{} plane",
      area, plane.cfg.width, plane.cfg.height
    )));
  }
  if dest.len() != area.area() {
    return Err(ProcessingError::Incompatible(format!(
      "partial read buffer holds {} samples, area needs {}",
      dest.len(),
      area.area()
    )));
  }
  let full = PlaneRegion::new(plane, Rect {
    x: 0,
    y: 0,
    width: plane.cfg.width,
    height: plane.cfg.height,
  });
  let sub = full.subregion(Area::Rect {
    x: area.x,
    y: area.y,
    width: area.width,
    height: area.height,
  });
  for (y, row) in sub.rows_iter().enumerate() {
    dest[y * area.width..(y + 1) * area.width].copy_from_slice(row);
  }
  Ok(())
}

impl FrameStore for MemoryStore {
  fn frame_count(&self) -> u32 {
    self.info.frame_count
  }

  fn info(&self) -> SequenceInfo {
    self.info
  }

  fn read_frame(&self, index: u32, want_float: bool) -> Result<ImageData> {
    let frame = self
      .frames
      .get(index as usize)
      .ok_or(ProcessingError::FrameReadFailed { index })?
      .clone();
    Ok(if want_float { frame.into_f32() } else { frame })
  }

  fn read_partial(
    &self,
    index: u32,
    channel: usize,
    area: Rect,
    dest: PixelBufMut<'_>,
  ) -> Result<()> {
    let frame = self
      .frames
      .get(index as usize)
      .ok_or(ProcessingError::FrameReadFailed { index })?;
    match (frame, dest) {
      (ImageData::U16(f), PixelBufMut::U16(dest)) => {
        copy_partial(&f.planes[channel], area, dest)
      }
      (ImageData::F32(f), PixelBufMut::F32(dest)) => {
        copy_partial(&f.planes[channel], area, dest)
      }
      _ => Err(ProcessingError::Incompatible(
        "partial read buffer type disagrees with storage".to_string(),
      )),
    }
  }

  fn registration(&self, channel: usize, index: u32) -> RegShift {
    self.registration.shift(channel, index)
  }

  fn is_reentrant_reader(&self) -> bool {
    self.reentrant
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::frame::Frame;
  use crate::sequence::SequenceKind;

  fn numbered_frame(width: usize, height: usize) -> ImageData {
    let mut frame = Frame::<u16>::new(width, height, 1).unwrap();
    for (i, v) in frame.planes[0].data.iter_mut().enumerate() {
      *v = i as u16;
    }
    ImageData::U16(frame)
  }

  #[test]
  fn partial_read_over_full_extents_equals_read_frame() {
    let store =
      MemoryStore::new(vec![numbered_frame(4, 3)], SequenceKind::FitsFiles)
        .unwrap();
    let full = match store.read_frame(0, false).unwrap() {
      ImageData::U16(f) => f,
      _ => unreachable!(),
    };
    let mut buf = vec![0u16; 12];
    store
      .read_partial(
        0,
        0,
        Rect { x: 0, y: 0, width: 4, height: 3 },
        PixelBufMut::U16(&mut buf),
      )
      .unwrap();
    assert_eq!(buf, full.planes[0].data);
  }

  #[test]
  fn partial_read_of_interior_rect() {
    let store =
      MemoryStore::new(vec![numbered_frame(4, 4)], SequenceKind::FitsFiles)
        .unwrap();
    let mut buf = vec![0u16; 4];
    store
      .read_partial(
        0,
        0,
        Rect { x: 1, y: 2, width: 2, height: 2 },
        PixelBufMut::U16(&mut buf),
      )
      .unwrap();
    assert_eq!(buf, vec![9, 10, 13, 14]);
  }

  #[test]
  fn mismatched_geometry_is_rejected() {
    let frames = vec![numbered_frame(4, 4), numbered_frame(4, 3)];
    assert!(MemoryStore::new(frames, SequenceKind::FitsFiles).is_err());
  }

  #[test]
  fn want_float_converts() {
    let store =
      MemoryStore::new(vec![numbered_frame(2, 2)], SequenceKind::FitsFiles)
        .unwrap();
    match store.read_frame(0, true).unwrap() {
      ImageData::F32(f) => assert_eq!(f.planes[0].data, vec![0.0, 1.0, 2.0, 3.0]),
      _ => panic!("expected float conversion"),
    }
  }
}
