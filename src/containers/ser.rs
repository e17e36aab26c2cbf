// Copyright (c) 2022-2023, The rastack contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

//! SER video container: a fixed 178-byte header followed by fixed-size raw
//! frames, 8 or 16 bits per channel, little endian, rows top-down, RGB data
//! pixel-interleaved.

use std::fs::File;
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::containers::{incompatible_geometry, ContainerWriter};
use crate::error::{ProcessingError, Result};
use crate::frame::{BitDepth, Frame, ImageData};
use crate::region::Rect;
use crate::sequence::{RegShift, Registration, SequenceInfo, SequenceKind};
use crate::store::{FrameStore, PixelBufMut};
use crate::util::PixelType;

const SER_SIGNATURE: &[u8; 14] = b"LUCAM-RECORDER";
const SER_HEADER_LEN: u64 = 178;
const SER_FRAME_COUNT_OFFSET: u64 = 38;

const SER_COLOR_MONO: u32 = 0;
const SER_COLOR_RGB: u32 = 100;

// The online documentation claims 0 means big-endian 16-bit data, but the
// meaning is reversed in every producer that matters.
const SER_LITTLE_ENDIAN: u32 = 0;

#[derive(Debug, Clone, Copy)]
struct SerHeader {
  color_id: u32,
  width: u32,
  height: u32,
  bits_per_channel: u32,
  frame_count: u32,
}

impl SerHeader {
  fn channels(&self) -> usize {
    if self.color_id >= SER_COLOR_RGB {
      3
    } else {
      1
    }
  }

  fn bytes_per_channel(&self) -> usize {
    if self.bits_per_channel > 8 {
      2
    } else {
      1
    }
  }

  fn frame_bytes(&self) -> u64 {
    self.width as u64
      * self.height as u64
      * self.channels() as u64
      * self.bytes_per_channel() as u64
  }

  fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
    w.write_all(SER_SIGNATURE)?;
    w.write_u32::<LittleEndian>(0)?; // camera series id
    w.write_u32::<LittleEndian>(self.color_id)?;
    w.write_u32::<LittleEndian>(SER_LITTLE_ENDIAN)?;
    w.write_u32::<LittleEndian>(self.width)?;
    w.write_u32::<LittleEndian>(self.height)?;
    w.write_u32::<LittleEndian>(self.bits_per_channel)?;
    w.write_u32::<LittleEndian>(self.frame_count)?;
    w.write_all(&[0u8; 40])?; // observer
    w.write_all(&[0u8; 40])?; // instrument
    w.write_all(&[0u8; 40])?; // telescope
    w.write_i64::<LittleEndian>(0)?; // date/time
    w.write_i64::<LittleEndian>(0)?; // date/time UTC
    Ok(())
  }

  fn read_from<R: Read>(r: &mut R) -> Result<SerHeader> {
    let mut signature = [0u8; 14];
    r.read_exact(&mut signature)?;
    let _camera = r.read_u32::<LittleEndian>()?;
    let color_id = r.read_u32::<LittleEndian>()?;
    let _endian = r.read_u32::<LittleEndian>()?;
    let width = r.read_u32::<LittleEndian>()?;
    let height = r.read_u32::<LittleEndian>()?;
    let bits_per_channel = r.read_u32::<LittleEndian>()?;
    let frame_count = r.read_u32::<LittleEndian>()?;
    let mut skip = [0u8; 40 * 3 + 16];
    r.read_exact(&mut skip)?;
    if width == 0 || height == 0 {
      return Err(ProcessingError::Incompatible(
        "SER header has zero dimensions".to_string(),
      ));
    }
    match color_id {
      SER_COLOR_MONO | SER_COLOR_RGB => {}
      other if other < SER_COLOR_RGB => {
        // Bayer variants read as mono; demosaicing is not our business.
      }
      other => {
        return Err(ProcessingError::Incompatible(format!(
          "unsupported SER color id {}",
          other
        )));
      }
    }
    Ok(SerHeader { color_id, width, height, bits_per_channel, frame_count })
  }
}

/// SER output. The frame count is backpatched on finalize, so the expected
/// count is advisory only.
pub struct SerWriter {
  path: PathBuf,
  writer: BufWriter<File>,
  header: Option<SerHeader>,
  expected: Option<u32>,
  frame_count: u32,
}

impl SerWriter {
  pub fn create(
    path: &Path,
    info: &SequenceInfo,
    expected: Option<u32>,
  ) -> Result<SerWriter> {
    if info.pixel_type == PixelType::F32 {
      return Err(ProcessingError::Incompatible(
        "SER cannot store float samples".to_string(),
      ));
    }
    let file = File::create(path)?;
    Ok(SerWriter {
      path: path.to_path_buf(),
      writer: BufWriter::new(file),
      header: None,
      expected,
      frame_count: 0,
    })
  }

  fn write_samples(&mut self, frame: &Frame<u16>) -> Result<()> {
    let header = self.header.expect("header written before samples");
    let eight_bit = header.bytes_per_channel() == 1;
    let (width, height) = (frame.width(), frame.height());
    // SER rows are top-down, RGB interleaved per pixel.
    for y in 0..height {
      for x in 0..width {
        for plane in &frame.planes {
          let v = plane.p(x, y);
          if eight_bit {
            self.writer.write_u8(v as u8)?;
          } else {
            self.writer.write_u16::<LittleEndian>(v)?;
          }
        }
      }
    }
    Ok(())
  }
}

impl ContainerWriter for SerWriter {
  fn write_frame(&mut self, image: &ImageData) -> Result<()> {
    let frame = match image {
      ImageData::U16(f) => f,
      ImageData::F32(_) => {
        return Err(incompatible_geometry("SER frame", image, "16-bit storage"));
      }
    };
    match self.header {
      None => {
        let header = SerHeader {
          color_id: if frame.channels() == 3 {
            SER_COLOR_RGB
          } else {
            SER_COLOR_MONO
          },
          width: frame.width() as u32,
          height: frame.height() as u32,
          bits_per_channel: frame.bit_depth.bits().min(16),
          frame_count: self.expected.unwrap_or(0),
        };
        header.write_to(&mut self.writer)?;
        self.header = Some(header);
      }
      Some(h) => {
        if frame.width() as u32 != h.width
          || frame.height() as u32 != h.height
          || frame.channels() != h.channels()
        {
          return Err(incompatible_geometry(
            "SER frame",
            image,
            "the first frame's geometry",
          ));
        }
      }
    }
    self.write_samples(frame)?;
    self.frame_count += 1;
    Ok(())
  }

  fn finalize(&mut self) -> Result<Vec<PathBuf>> {
    if self.header.is_some() {
      self.writer.flush()?;
      let file = self.writer.get_mut();
      file.seek(SeekFrom::Start(SER_FRAME_COUNT_OFFSET))?;
      file.write_u32::<LittleEndian>(self.frame_count)?;
      file.flush()?;
    }
    Ok(vec![self.path.clone()])
  }
}

/// File-backed SER sequence. Reads open their own handle, so concurrent
/// reads from several threads are fine.
pub struct SerStore {
  path: PathBuf,
  header: SerHeader,
  registration: Registration,
}

impl SerStore {
  pub fn open(path: &Path) -> Result<SerStore> {
    let mut file = File::open(path)?;
    let mut header = SerHeader::read_from(&mut file)?;
    // A zero count (unfinalized capture) is recovered from the file length.
    if header.frame_count == 0 {
      let len = file.metadata()?.len();
      header.frame_count =
        ((len.saturating_sub(SER_HEADER_LEN)) / header.frame_bytes()) as u32;
    }
    let channels = header.channels();
    Ok(SerStore {
      path: path.to_path_buf(),
      header,
      registration: Registration::new(channels),
    })
  }

  pub fn with_registration(mut self, registration: Registration) -> Self {
    self.registration = registration;
    self
  }

  fn bit_depth(&self) -> BitDepth {
    if self.header.bytes_per_channel() == 1 {
      BitDepth::Eight
    } else {
      BitDepth::Sixteen
    }
  }

  fn check_index(&self, index: u32) -> Result<()> {
    if index >= self.header.frame_count {
      return Err(ProcessingError::FrameReadFailed { index });
    }
    Ok(())
  }

  /// Read `count` channel-interleaved samples starting at sample offset
  /// `sample_off` within frame `index`.
  fn read_raw(&self, index: u32, sample_off: u64, count: usize) -> Result<Vec<u16>> {
    let bpc = self.header.bytes_per_channel() as u64;
    let mut file = File::open(&self.path)
      .map_err(|_| ProcessingError::FrameReadFailed { index })?;
    let offset =
      SER_HEADER_LEN + index as u64 * self.header.frame_bytes() + sample_off * bpc;
    file
      .seek(SeekFrom::Start(offset))
      .map_err(|_| ProcessingError::FrameReadFailed { index })?;
    let mut out = vec![0u16; count];
    if bpc == 1 {
      let mut raw = vec![0u8; count];
      file
        .read_exact(&mut raw)
        .map_err(|_| ProcessingError::FrameReadFailed { index })?;
      for (dst, src) in out.iter_mut().zip(raw.iter()) {
        *dst = u16::from(*src);
      }
    } else {
      file
        .read_u16_into::<LittleEndian>(&mut out)
        .map_err(|_| ProcessingError::FrameReadFailed { index })?;
    }
    Ok(out)
  }
}

impl FrameStore for SerStore {
  fn frame_count(&self) -> u32 {
    self.header.frame_count
  }

  fn info(&self) -> SequenceInfo {
    SequenceInfo {
      frame_count: self.header.frame_count,
      width: self.header.width as usize,
      height: self.header.height as usize,
      channels: self.header.channels(),
      pixel_type: PixelType::U16,
      bit_depth: self.bit_depth(),
      kind: SequenceKind::Ser,
    }
  }

  fn read_frame(&self, index: u32, want_float: bool) -> Result<ImageData> {
    self.check_index(index)?;
    let (width, height) = (self.header.width as usize, self.header.height as usize);
    let channels = self.header.channels();
    let raw = self.read_raw(index, 0, width * height * channels)?;
    let mut frame = Frame::<u16>::with_depth(width, height, channels, self.bit_depth())?;
    for (c, plane) in frame.planes.iter_mut().enumerate() {
      for (i, v) in plane.data.iter_mut().enumerate() {
        *v = raw[i * channels + c];
      }
    }
    let image = ImageData::U16(frame);
    Ok(if want_float { image.into_f32() } else { image })
  }

  fn read_partial(
    &self,
    index: u32,
    channel: usize,
    area: Rect,
    dest: PixelBufMut<'_>,
  ) -> Result<()> {
    self.check_index(index)?;
    let dest = match dest {
      PixelBufMut::U16(d) => d,
      PixelBufMut::F32(_) => {
        return Err(ProcessingError::Incompatible(
          "SER partial reads deliver 16-bit samples".to_string(),
        ));
      }
    };
    let (width, height) = (self.header.width as usize, self.header.height as usize);
    let channels = self.header.channels();
    if area.x < 0
      || area.y < 0
      || area.x as usize + area.width > width
      || area.y as usize + area.height > height
      || dest.len() != area.area()
      || channel >= channels
    {
      return Err(ProcessingError::Incompatible(format!(
        "partial read {:?} outside {}x{}x{}",
        area, width, height, channels
      )));
    }
    // SER rows are already top-down; one interleaved row segment per output
    // row, from which we pick our channel.
    for row in 0..area.height {
      let y = area.y as usize + row;
      let sample_off = ((y * width + area.x as usize) * channels) as u64;
      let raw = self.read_raw(index, sample_off, area.width * channels)?;
      let out = &mut dest[row * area.width..(row + 1) * area.width];
      for (x, v) in out.iter_mut().enumerate() {
        *v = raw[x * channels + channel];
      }
    }
    Ok(())
  }

  fn registration(&self, channel: usize, index: u32) -> RegShift {
    self.registration.shift(channel, index)
  }

  fn is_reentrant_reader(&self) -> bool {
    true
  }
}
