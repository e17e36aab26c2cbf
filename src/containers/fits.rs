// Copyright (c) 2022-2023, The rastack contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

//! Minimal FITS subset: BITPIX 16 (with BZERO 32768) and -32, NAXIS 2/3,
//! 2880-byte records, big-endian data. Files store rows bottom-up; everything
//! delivered to callers is top-down.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::containers::{incompatible_geometry, ContainerWriter};
use crate::error::{ProcessingError, Result};
use crate::frame::{BitDepth, Frame, FrameMeta, ImageData};
use crate::region::Rect;
use crate::sequence::{RegShift, Registration, SequenceInfo, SequenceKind};
use crate::store::{FrameStore, PixelBufMut};
use crate::util::PixelType;

const RECORD: usize = 2880;
const CARD: usize = 80;
const CARDS_PER_RECORD: usize = RECORD / CARD;

const U16_BZERO: i64 = 32768;

fn card(key: &str, value: &str) -> [u8; CARD] {
  let mut out = [b' '; CARD];
  let text = format!("{:<8}= {}", key, value);
  let bytes = text.as_bytes();
  out[..bytes.len().min(CARD)].copy_from_slice(&bytes[..bytes.len().min(CARD)]);
  out
}

fn card_int(key: &str, v: i64) -> [u8; CARD] {
  card(key, &format!("{:>20}", v))
}

fn card_f64(key: &str, v: f64) -> [u8; CARD] {
  card(key, &format!("{:>20}", format!("{:.6}", v)))
}

fn card_logical(key: &str, v: bool) -> [u8; CARD] {
  card(key, &format!("{:>20}", if v { "T" } else { "F" }))
}

fn card_str(key: &str, v: &str) -> [u8; CARD] {
  let trimmed: String = v.chars().take(66).collect();
  card(key, &format!("'{}'", trimmed))
}

fn card_bare(key: &str) -> [u8; CARD] {
  let mut out = [b' '; CARD];
  out[..key.len().min(8)].copy_from_slice(&key.as_bytes()[..key.len().min(8)]);
  out
}

fn pad_to_record<W: Write>(w: &mut W, written: usize) -> Result<()> {
  let tail = written % RECORD;
  if tail != 0 {
    w.write_all(&vec![0u8; RECORD - tail])?;
  }
  Ok(())
}

/// Parsed header fields the core cares about.
#[derive(Debug, Default)]
struct FitsHeader {
  bitpix: i32,
  naxis: usize,
  naxes: [usize; 3],
  bzero: f64,
  meta: FrameMeta,
  /// Bytes from the start of the file to the first data byte.
  data_offset: u64,
}

impl FitsHeader {
  fn pixel_type(&self) -> Result<PixelType> {
    match self.bitpix {
      16 => Ok(PixelType::U16),
      -32 => Ok(PixelType::F32),
      other => Err(ProcessingError::Incompatible(format!(
        "unsupported BITPIX {}",
        other
      ))),
    }
  }

  fn parse(file: &mut impl Read) -> Result<FitsHeader> {
    let mut header = FitsHeader::default();
    let mut record = [0u8; RECORD];
    let mut records = 0usize;
    'blocks: loop {
      file.read_exact(&mut record)?;
      records += 1;
      for i in 0..CARDS_PER_RECORD {
        let card = &record[i * CARD..(i + 1) * CARD];
        let key = String::from_utf8_lossy(&card[..8]).trim_end().to_string();
        if key == "END" {
          break 'blocks;
        }
        if card.len() < 10 || card[8] != b'=' {
          continue;
        }
        let raw = String::from_utf8_lossy(&card[10..]).to_string();
        // strip trailing comment
        let value = match raw.find('/') {
          Some(pos) if !raw.trim_start().starts_with('\'') => raw[..pos].trim(),
          _ => raw.trim(),
        }
        .to_string();
        let as_str = value.trim_matches('\'').trim().to_string();
        let as_f64 = value.parse::<f64>().ok();
        match key.as_str() {
          "BITPIX" => header.bitpix = as_f64.unwrap_or(0.0) as i32,
          "NAXIS" => header.naxis = as_f64.unwrap_or(0.0) as usize,
          "NAXIS1" => header.naxes[0] = as_f64.unwrap_or(0.0) as usize,
          "NAXIS2" => header.naxes[1] = as_f64.unwrap_or(0.0) as usize,
          "NAXIS3" => header.naxes[2] = as_f64.unwrap_or(0.0) as usize,
          "BZERO" => header.bzero = as_f64.unwrap_or(0.0),
          "EXPTIME" | "EXPOSURE" => header.meta.exposure = as_f64,
          "DATE-OBS" => header.meta.timestamp = Some(as_str),
          "FILTER" => header.meta.filter = Some(as_str),
          "INSTRUME" => header.meta.instrument = Some(as_str),
          "TELESCOP" => header.meta.telescope = Some(as_str),
          "OBSERVER" => header.meta.observer = Some(as_str),
          "FOCALLEN" => header.meta.focal_length = as_f64,
          "CCD-TEMP" => header.meta.temperature = as_f64,
          "BAYERPAT" => {
            header.meta.bayer_pattern = match as_str.as_str() {
              "RGGB" => Some(crate::frame::BayerPattern::Rggb),
              "BGGR" => Some(crate::frame::BayerPattern::Bggr),
              "GBRG" => Some(crate::frame::BayerPattern::Gbrg),
              "GRBG" => Some(crate::frame::BayerPattern::Grbg),
              _ => None,
            }
          }
          _ => {}
        }
      }
    }
    header.data_offset = (records * RECORD) as u64;
    if header.naxis < 2 || header.naxes[0] == 0 || header.naxes[1] == 0 {
      return Err(ProcessingError::Incompatible(format!(
        "unusable FITS geometry NAXIS={} {:?}",
        header.naxis, header.naxes
      )));
    }
    Ok(header)
  }
}

fn meta_cards(meta: &FrameMeta) -> Vec<[u8; CARD]> {
  let mut cards = Vec::new();
  if let Some(exposure) = meta.exposure {
    cards.push(card_f64("EXPTIME", exposure));
  }
  if let Some(ref timestamp) = meta.timestamp {
    cards.push(card_str("DATE-OBS", timestamp));
  }
  if let Some(ref filter) = meta.filter {
    cards.push(card_str("FILTER", filter));
  }
  if let Some(ref instrument) = meta.instrument {
    cards.push(card_str("INSTRUME", instrument));
  }
  if let Some(ref telescope) = meta.telescope {
    cards.push(card_str("TELESCOP", telescope));
  }
  if let Some(ref observer) = meta.observer {
    cards.push(card_str("OBSERVER", observer));
  }
  if let Some(focal) = meta.focal_length {
    cards.push(card_f64("FOCALLEN", focal));
  }
  if let Some(temp) = meta.temperature {
    cards.push(card_f64("CCD-TEMP", temp));
  }
  if let Some(pattern) = meta.bayer_pattern {
    let name = match pattern {
      crate::frame::BayerPattern::Rggb => "RGGB",
      crate::frame::BayerPattern::Bggr => "BGGR",
      crate::frame::BayerPattern::Gbrg => "GBRG",
      crate::frame::BayerPattern::Grbg => "GRBG",
    };
    cards.push(card_str("BAYERPAT", name));
  }
  cards
}

fn write_header<W: Write>(
  w: &mut W,
  bitpix: i32,
  naxes: &[usize],
  meta: &FrameMeta,
) -> Result<usize> {
  let mut cards: Vec<[u8; CARD]> = Vec::new();
  cards.push(card_logical("SIMPLE", true));
  cards.push(card_int("BITPIX", i64::from(bitpix)));
  cards.push(card_int("NAXIS", naxes.len() as i64));
  for (i, &n) in naxes.iter().enumerate() {
    cards.push(card_int(&format!("NAXIS{}", i + 1), n as i64));
  }
  if bitpix == 16 {
    cards.push(card_f64("BZERO", U16_BZERO as f64));
    cards.push(card_f64("BSCALE", 1.0));
  }
  cards.extend(meta_cards(meta));
  cards.push(card_bare("END"));
  for c in &cards {
    w.write_all(c)?;
  }
  let written = cards.len() * CARD;
  pad_to_record(w, written)?;
  Ok(crate::util::round_up_multiple(written, RECORD))
}

fn write_plane_samples<W: Write, T: crate::util::Pixel>(
  w: &mut W,
  plane: &crate::frame::Plane<T>,
) -> Result<usize> {
  let mut written = 0;
  // file rows run bottom-up
  for y in (0..plane.cfg.height).rev() {
    for &v in plane.row(y) {
      match T::PIXEL_TYPE {
        PixelType::U16 => {
          let stored = (v.as_f64() as i64 - U16_BZERO) as i16;
          w.write_i16::<BigEndian>(stored)?;
          written += 2;
        }
        PixelType::F32 => {
          w.write_f32::<BigEndian>(v.as_f32())?;
          written += 4;
        }
      }
    }
  }
  Ok(written)
}

/// Write a single image to `path`.
pub fn write_image(path: &Path, image: &ImageData) -> Result<()> {
  let file = File::create(path)?;
  let mut w = BufWriter::new(file);
  let naxes: Vec<usize> = if image.channels() == 1 {
    vec![image.width(), image.height()]
  } else {
    vec![image.width(), image.height(), image.channels()]
  };
  let bitpix = match image.pixel_type() {
    PixelType::U16 => 16,
    PixelType::F32 => -32,
  };
  write_header(&mut w, bitpix, &naxes, image.meta())?;
  let mut data_bytes = 0;
  match image {
    ImageData::U16(f) => {
      for plane in &f.planes {
        data_bytes += write_plane_samples(&mut w, plane)?;
      }
    }
    ImageData::F32(f) => {
      for plane in &f.planes {
        data_bytes += write_plane_samples(&mut w, plane)?;
      }
    }
  }
  pad_to_record(&mut w, data_bytes)?;
  w.flush()?;
  Ok(())
}

fn decode_u16(stored: i16, bzero: f64) -> u16 {
  (f64::from(stored) + bzero).max(0.0).min(f64::from(u16::max_value())) as u16
}

fn read_plane<R: Read>(
  r: &mut R,
  width: usize,
  height: usize,
  bitpix: i32,
  bzero: f64,
) -> Result<PlaneSamples> {
  match bitpix {
    16 => {
      let mut raw = vec![0i16; width * height];
      r.read_i16_into::<BigEndian>(&mut raw)?;
      Ok(PlaneSamples::U16(
        raw.iter().map(|&v| decode_u16(v, bzero)).collect(),
      ))
    }
    -32 => {
      let mut raw = vec![0f32; width * height];
      r.read_f32_into::<BigEndian>(&mut raw)?;
      Ok(PlaneSamples::F32(raw))
    }
    other => Err(ProcessingError::Incompatible(format!(
      "unsupported BITPIX {}",
      other
    ))),
  }
}

enum PlaneSamples {
  U16(Vec<u16>),
  F32(Vec<f32>),
}

fn flip_into_plane<T: crate::util::Pixel>(
  samples: Vec<T>,
  width: usize,
  height: usize,
) -> crate::frame::Plane<T> {
  let mut plane = crate::frame::Plane::new(width, height);
  for y in 0..height {
    let src = &samples[(height - 1 - y) * width..(height - y) * width];
    plane.row_mut(y).copy_from_slice(src);
  }
  plane
}

/// Read a single image. `NAXIS3 == 3` is a color image; any other third axis
/// is a cube and wants `FitsCubeStore`.
pub fn read_image(path: &Path) -> Result<ImageData> {
  let file = File::open(path)?;
  let mut r = BufReader::new(file);
  let header = FitsHeader::parse(&mut r)?;
  let (width, height) = (header.naxes[0], header.naxes[1]);
  let channels = if header.naxis == 2 { 1 } else { header.naxes[2] };
  if channels != 1 && channels != 3 {
    return Err(ProcessingError::Incompatible(format!(
      "FITS file with NAXIS3 = {} is not a single image",
      channels
    )));
  }
  match header.pixel_type()? {
    PixelType::U16 => {
      let mut frame = Frame::<u16>::new(width, height, channels)?;
      for c in 0..channels {
        match read_plane(&mut r, width, height, header.bitpix, header.bzero)? {
          PlaneSamples::U16(samples) => {
            frame.planes[c] = flip_into_plane(samples, width, height);
          }
          _ => unreachable!(),
        }
      }
      frame.meta = header.meta;
      Ok(ImageData::U16(frame))
    }
    PixelType::F32 => {
      let mut frame = Frame::<f32>::new(width, height, channels)?;
      for c in 0..channels {
        match read_plane(&mut r, width, height, header.bitpix, header.bzero)? {
          PlaneSamples::F32(samples) => {
            frame.planes[c] = flip_into_plane(samples, width, height);
          }
          _ => unreachable!(),
        }
      }
      frame.meta = header.meta;
      Ok(ImageData::F32(frame))
    }
  }
}

/// FITS cube output for mono sequences: one NAXIS3 slice per frame, count
/// backpatched on finalize.
pub struct FitsCubeWriter {
  path: PathBuf,
  writer: BufWriter<File>,
  info: SequenceInfo,
  naxis3_card_offset: u64,
  data_bytes: usize,
  frame_count: u32,
}

impl FitsCubeWriter {
  pub fn create(
    path: &Path,
    info: &SequenceInfo,
    expected: Option<u32>,
  ) -> Result<FitsCubeWriter> {
    if info.channels != 1 {
      return Err(ProcessingError::Incompatible(
        "FITS cubes hold mono frames only".to_string(),
      ));
    }
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let bitpix = match info.pixel_type {
      PixelType::U16 => 16,
      PixelType::F32 => -32,
    };
    let naxes = vec![info.width, info.height, expected.unwrap_or(0) as usize];
    write_header(&mut writer, bitpix, &naxes, &FrameMeta::default())?;
    // SIMPLE, BITPIX, NAXIS, NAXIS1, NAXIS2 precede NAXIS3
    let naxis3_card_offset = 5 * CARD as u64;
    Ok(FitsCubeWriter {
      path: path.to_path_buf(),
      writer,
      info: *info,
      naxis3_card_offset,
      data_bytes: 0,
      frame_count: 0,
    })
  }
}

impl ContainerWriter for FitsCubeWriter {
  fn write_frame(&mut self, image: &ImageData) -> Result<()> {
    if image.width() != self.info.width
      || image.height() != self.info.height
      || image.channels() != 1
      || image.pixel_type() != self.info.pixel_type
    {
      return Err(incompatible_geometry("FITS cube slice", image, "cube geometry"));
    }
    match image {
      ImageData::U16(f) => {
        self.data_bytes += write_plane_samples(&mut self.writer, &f.planes[0])?;
      }
      ImageData::F32(f) => {
        self.data_bytes += write_plane_samples(&mut self.writer, &f.planes[0])?;
      }
    }
    self.frame_count += 1;
    Ok(())
  }

  fn finalize(&mut self) -> Result<Vec<PathBuf>> {
    pad_to_record(&mut self.writer, self.data_bytes)?;
    self.writer.flush()?;
    let file = self.writer.get_mut();
    file.seek(SeekFrom::Start(self.naxis3_card_offset))?;
    file.write_all(&card_int("NAXIS3", i64::from(self.frame_count)))?;
    file.flush()?;
    Ok(vec![self.path.clone()])
  }
}

/// File-backed FITS cube sequence of mono frames.
pub struct FitsCubeStore {
  path: PathBuf,
  header: FitsHeader,
  frame_count: u32,
  registration: Registration,
}

impl FitsCubeStore {
  pub fn open(path: &Path) -> Result<FitsCubeStore> {
    let file = File::open(path)?;
    let mut r = BufReader::new(file);
    let header = FitsHeader::parse(&mut r)?;
    if header.naxis != 3 {
      return Err(ProcessingError::Incompatible(format!(
        "NAXIS = {} is not a cube",
        header.naxis
      )));
    }
    let frame_count = header.naxes[2] as u32;
    Ok(FitsCubeStore {
      path: path.to_path_buf(),
      header,
      frame_count,
      registration: Registration::new(1),
    })
  }

  pub fn with_registration(mut self, registration: Registration) -> Self {
    self.registration = registration;
    self
  }

  fn bytes_per_sample(&self) -> u64 {
    match self.header.bitpix {
      16 => 2,
      _ => 4,
    }
  }

  fn plane_offset(&self, index: u32) -> u64 {
    let plane_bytes = (self.header.naxes[0] * self.header.naxes[1]) as u64
      * self.bytes_per_sample();
    self.header.data_offset + u64::from(index) * plane_bytes
  }

  fn check_index(&self, index: u32) -> Result<()> {
    if index >= self.frame_count {
      return Err(ProcessingError::FrameReadFailed { index });
    }
    Ok(())
  }
}

impl FrameStore for FitsCubeStore {
  fn frame_count(&self) -> u32 {
    self.frame_count
  }

  fn info(&self) -> SequenceInfo {
    let pixel_type = match self.header.bitpix {
      16 => PixelType::U16,
      _ => PixelType::F32,
    };
    SequenceInfo {
      frame_count: self.frame_count,
      width: self.header.naxes[0],
      height: self.header.naxes[1],
      channels: 1,
      pixel_type,
      bit_depth: match pixel_type {
        PixelType::U16 => BitDepth::Sixteen,
        PixelType::F32 => BitDepth::Float32,
      },
      kind: SequenceKind::FitsCube,
    }
  }

  fn read_frame(&self, index: u32, want_float: bool) -> Result<ImageData> {
    self.check_index(index)?;
    let (width, height) = (self.header.naxes[0], self.header.naxes[1]);
    let mut file = File::open(&self.path)
      .map_err(|_| ProcessingError::FrameReadFailed { index })?;
    file
      .seek(SeekFrom::Start(self.plane_offset(index)))
      .map_err(|_| ProcessingError::FrameReadFailed { index })?;
    let samples = read_plane(&mut file, width, height, self.header.bitpix, self.header.bzero)
      .map_err(|_| ProcessingError::FrameReadFailed { index })?;
    let image = match samples {
      PlaneSamples::U16(s) => {
        let mut frame = Frame::<u16>::new(width, height, 1)?;
        frame.planes[0] = flip_into_plane(s, width, height);
        ImageData::U16(frame)
      }
      PlaneSamples::F32(s) => {
        let mut frame = Frame::<f32>::new(width, height, 1)?;
        frame.planes[0] = flip_into_plane(s, width, height);
        ImageData::F32(frame)
      }
    };
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
    let (width, height) = (self.header.naxes[0], self.header.naxes[1]);
    if channel != 0
      || area.x < 0
      || area.y < 0
      || area.x as usize + area.width > width
      || area.y as usize + area.height > height
      || dest.len() != area.area()
    {
      return Err(ProcessingError::Incompatible(format!(
        "partial read {:?} of channel {} outside {}x{}",
        area, channel, width, height
      )));
    }
    let mut file = File::open(&self.path)
      .map_err(|_| ProcessingError::FrameReadFailed { index })?;
    let bps = self.bytes_per_sample();
    let base = self.plane_offset(index);
    let mut dest = dest;
    for row in 0..area.height {
      // the file is bottom-up: image row y lives at file row height-1-y
      let y = area.y as usize + row;
      let file_row = height - 1 - y;
      let offset = base + (file_row * width + area.x as usize) as u64 * bps;
      file
        .seek(SeekFrom::Start(offset))
        .map_err(|_| ProcessingError::FrameReadFailed { index })?;
      match &mut dest {
        PixelBufMut::U16(d) => {
          if self.header.bitpix != 16 {
            return Err(ProcessingError::Incompatible(
              "buffer type disagrees with BITPIX".to_string(),
            ));
          }
          let mut raw = vec![0i16; area.width];
          file
            .read_i16_into::<BigEndian>(&mut raw)
            .map_err(|_| ProcessingError::FrameReadFailed { index })?;
          for (dst, &v) in d[row * area.width..(row + 1) * area.width]
            .iter_mut()
            .zip(raw.iter())
          {
            *dst = decode_u16(v, self.header.bzero);
          }
        }
        PixelBufMut::F32(d) => {
          if self.header.bitpix != -32 {
            return Err(ProcessingError::Incompatible(
              "buffer type disagrees with BITPIX".to_string(),
            ));
          }
          file
            .read_f32_into::<BigEndian>(
              &mut d[row * area.width..(row + 1) * area.width],
            )
            .map_err(|_| ProcessingError::FrameReadFailed { index })?;
        }
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

/// Sequence made of one FITS file per frame, in path order.
pub struct FitsFilesStore {
  paths: Vec<PathBuf>,
  headers: Vec<FitsHeader>,
  info: SequenceInfo,
  registration: Registration,
}

impl FitsFilesStore {
  pub fn open(paths: Vec<PathBuf>) -> Result<FitsFilesStore> {
    if paths.is_empty() {
      return Err(ProcessingError::Incompatible(
        "empty per-file sequence".to_string(),
      ));
    }
    let mut headers = Vec::with_capacity(paths.len());
    for path in &paths {
      let file = File::open(path)?;
      let header = FitsHeader::parse(&mut BufReader::new(file))?;
      let channels = if header.naxis == 2 { 1 } else { header.naxes[2] };
      if channels != 1 && channels != 3 {
        return Err(ProcessingError::Incompatible(format!(
          "{} holds {} planes, not a single frame",
          path.display(),
          channels
        )));
      }
      headers.push(header);
    }
    let first = &headers[0];
    let channels = if first.naxis == 2 { 1 } else { first.naxes[2] };
    for (path, header) in paths.iter().zip(&headers) {
      if header.naxes[0] != first.naxes[0]
        || header.naxes[1] != first.naxes[1]
        || header.bitpix != first.bitpix
      {
        return Err(ProcessingError::Incompatible(format!(
          "{} disagrees with the first frame's geometry",
          path.display()
        )));
      }
    }
    let pixel_type = first.pixel_type()?;
    let info = SequenceInfo {
      frame_count: paths.len() as u32,
      width: first.naxes[0],
      height: first.naxes[1],
      channels,
      pixel_type,
      bit_depth: match pixel_type {
        PixelType::U16 => BitDepth::Sixteen,
        PixelType::F32 => BitDepth::Float32,
      },
      kind: SequenceKind::FitsFiles,
    };
    Ok(FitsFilesStore {
      paths,
      headers,
      info,
      registration: Registration::new(channels),
    })
  }

  /// Gather `{prefix}*.fit`/`.fits` files, sorted by name.
  pub fn from_prefix(dir: &Path, prefix: &str) -> Result<FitsFilesStore> {
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
      .filter_map(|entry| entry.ok().map(|e| e.path()))
      .filter(|path| {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        name.starts_with(prefix) && (ext == "fit" || ext == "fits")
      })
      .collect();
    paths.sort();
    Self::open(paths)
  }

  pub fn with_registration(mut self, registration: Registration) -> Self {
    self.registration = registration;
    self
  }

  pub fn paths(&self) -> &[PathBuf] {
    &self.paths
  }

  fn check_index(&self, index: u32) -> Result<()> {
    if index as usize >= self.paths.len() {
      return Err(ProcessingError::FrameReadFailed { index });
    }
    Ok(())
  }
}

impl FrameStore for FitsFilesStore {
  fn frame_count(&self) -> u32 {
    self.info.frame_count
  }

  fn info(&self) -> SequenceInfo {
    self.info
  }

  fn read_frame(&self, index: u32, want_float: bool) -> Result<ImageData> {
    self.check_index(index)?;
    let image = read_image(&self.paths[index as usize])
      .map_err(|_| ProcessingError::FrameReadFailed { index })?;
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
    let header = &self.headers[index as usize];
    let (width, height) = (self.info.width, self.info.height);
    if channel >= self.info.channels
      || area.x < 0
      || area.y < 0
      || area.x as usize + area.width > width
      || area.y as usize + area.height > height
      || dest.len() != area.area()
    {
      return Err(ProcessingError::Incompatible(format!(
        "partial read {:?} of channel {} outside {}x{}x{}",
        area, channel, width, height, self.info.channels
      )));
    }
    let mut file = File::open(&self.paths[index as usize])
      .map_err(|_| ProcessingError::FrameReadFailed { index })?;
    let bps = u64::from(header.bitpix.abs() as u32 / 8);
    let plane_base =
      header.data_offset + (channel * width * height) as u64 * bps;
    let mut dest = dest;
    for row in 0..area.height {
      let y = area.y as usize + row;
      let file_row = height - 1 - y;
      let offset = plane_base + (file_row * width + area.x as usize) as u64 * bps;
      file
        .seek(SeekFrom::Start(offset))
        .map_err(|_| ProcessingError::FrameReadFailed { index })?;
      match &mut dest {
        PixelBufMut::U16(d) => {
          if header.bitpix != 16 {
            return Err(ProcessingError::Incompatible(
              "buffer type disagrees with BITPIX".to_string(),
            ));
          }
          let mut raw = vec![0i16; area.width];
          file
            .read_i16_into::<BigEndian>(&mut raw)
            .map_err(|_| ProcessingError::FrameReadFailed { index })?;
          for (dst, &v) in d[row * area.width..(row + 1) * area.width]
            .iter_mut()
            .zip(raw.iter())
          {
            *dst = decode_u16(v, header.bzero);
          }
        }
        PixelBufMut::F32(d) => {
          if header.bitpix != -32 {
            return Err(ProcessingError::Incompatible(
              "buffer type disagrees with BITPIX".to_string(),
            ));
          }
          file
            .read_f32_into::<BigEndian>(
              &mut d[row * area.width..(row + 1) * area.width],
            )
            .map_err(|_| ProcessingError::FrameReadFailed { index })?;
        }
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

#[cfg(test)]
mod test {
  use super::*;
  use crate::frame::Frame;

  fn ramp_u16(width: usize, height: usize, channels: usize) -> ImageData {
    let mut frame = Frame::<u16>::new(width, height, channels).unwrap();
    for (c, plane) in frame.planes.iter_mut().enumerate() {
      for (i, v) in plane.data.iter_mut().enumerate() {
        *v = (c * 10000 + i * 7) as u16;
      }
    }
    frame.meta.exposure = Some(2.5);
    frame.meta.timestamp = Some("2023-03-01T22:15:00".to_string());
    ImageData::U16(frame)
  }

  #[test]
  fn u16_image_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("img.fit");
    let image = ramp_u16(5, 4, 1);
    write_image(&path, &image).unwrap();
    let back = read_image(&path).unwrap();
    match (&image, &back) {
      (ImageData::U16(a), ImageData::U16(b)) => {
        assert_eq!(a.planes, b.planes);
        assert_eq!(b.meta.exposure, Some(2.5));
        assert_eq!(b.meta.timestamp.as_deref(), Some("2023-03-01T22:15:00"));
      }
      _ => panic!("storage type changed in round trip"),
    }
  }

  #[test]
  fn color_image_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rgb.fit");
    let image = ramp_u16(3, 3, 3);
    write_image(&path, &image).unwrap();
    let back = read_image(&path).unwrap();
    assert_eq!(back.channels(), 3);
    match (&image, &back) {
      (ImageData::U16(a), ImageData::U16(b)) => assert_eq!(a.planes, b.planes),
      _ => unreachable!(),
    }
  }

  #[test]
  fn f32_image_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("f.fit");
    let mut frame = Frame::<f32>::new(3, 2, 1).unwrap();
    frame.planes[0].data.copy_from_slice(&[0.0, -1.5, 2.25, 1e10, 0.125, 7.0]);
    let image = ImageData::F32(frame);
    write_image(&path, &image).unwrap();
    assert_eq!(read_image(&path).unwrap(), image);
  }

  #[test]
  fn cube_round_trip_with_backpatch() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cube.fit");
    let frames: Vec<ImageData> = (0..4)
      .map(|i| {
        let mut f = Frame::<u16>::new(4, 3, 1).unwrap();
        for (j, v) in f.planes[0].data.iter_mut().enumerate() {
          *v = (i * 100 + j) as u16;
        }
        ImageData::U16(f)
      })
      .collect();
    let info = SequenceInfo {
      frame_count: 0,
      width: 4,
      height: 3,
      channels: 1,
      pixel_type: PixelType::U16,
      bit_depth: BitDepth::Sixteen,
      kind: SequenceKind::FitsCube,
    };
    {
      // count unknown up front
      let mut writer = FitsCubeWriter::create(&path, &info, None).unwrap();
      for f in &frames {
        writer.write_frame(f).unwrap();
      }
      writer.finalize().unwrap();
    }
    let store = FitsCubeStore::open(&path).unwrap();
    assert_eq!(store.frame_count(), 4);
    for (i, f) in frames.iter().enumerate() {
      assert_eq!(&store.read_frame(i as u32, false).unwrap(), f);
    }
  }

  #[test]
  fn per_file_store_reads_a_directory_of_frames() {
    let dir = tempfile::tempdir().unwrap();
    let frames: Vec<ImageData> = (0..3)
      .map(|i| {
        let mut f = Frame::<u16>::new(4, 3, 1).unwrap();
        for (j, v) in f.planes[0].data.iter_mut().enumerate() {
          *v = (i * 500 + j) as u16;
        }
        ImageData::U16(f)
      })
      .collect();
    for (i, frame) in frames.iter().enumerate() {
      let path = dir.path().join(format!("r_{:05}.fit", i + 1));
      write_image(&path, frame).unwrap();
    }
    // an unrelated file must not join the sequence
    std::fs::write(dir.path().join("notes.txt"), b"not a frame").unwrap();

    let store = FitsFilesStore::from_prefix(dir.path(), "r_").unwrap();
    assert_eq!(store.frame_count(), 3);
    assert_eq!(store.info().width, 4);
    for (i, frame) in frames.iter().enumerate() {
      assert_eq!(&store.read_frame(i as u32, false).unwrap(), frame);
    }
    // partial reads agree with the materialized frame
    let mut buf = vec![0u16; 4];
    store
      .read_partial(
        1,
        0,
        Rect { x: 1, y: 1, width: 2, height: 2 },
        PixelBufMut::U16(&mut buf),
      )
      .unwrap();
    match &frames[1] {
      ImageData::U16(f) => {
        assert_eq!(&buf[..2], &f.planes[0].row(1)[1..3]);
        assert_eq!(&buf[2..], &f.planes[0].row(2)[1..3]);
      }
      _ => unreachable!(),
    }
  }

  #[test]
  fn per_file_store_rejects_mixed_geometry() {
    let dir = tempfile::tempdir().unwrap();
    write_image(&dir.path().join("m_00001.fit"), &ramp_u16(4, 3, 1)).unwrap();
    write_image(&dir.path().join("m_00002.fit"), &ramp_u16(5, 3, 1)).unwrap();
    assert!(FitsFilesStore::from_prefix(dir.path(), "m_").is_err());
  }

  #[test]
  fn cube_partial_read_is_top_down() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cube2.fit");
    let image = ramp_u16(4, 3, 1);
    let info = SequenceInfo {
      frame_count: 0,
      width: 4,
      height: 3,
      channels: 1,
      pixel_type: PixelType::U16,
      bit_depth: BitDepth::Sixteen,
      kind: SequenceKind::FitsCube,
    };
    {
      let mut writer = FitsCubeWriter::create(&path, &info, Some(1)).unwrap();
      writer.write_frame(&image).unwrap();
      writer.finalize().unwrap();
    }
    let store = FitsCubeStore::open(&path).unwrap();
    let mut buf = vec![0u16; 8];
    store
      .read_partial(
        0,
        0,
        Rect { x: 1, y: 1, width: 2, height: 2 },
        PixelBufMut::U16(&mut buf[..4]),
      )
      .unwrap();
    match &image {
      ImageData::U16(f) => {
        assert_eq!(&buf[..2], &f.planes[0].row(1)[1..3]);
        assert_eq!(&buf[2..4], &f.planes[0].row(2)[1..3]);
      }
      _ => unreachable!(),
    }
  }
}
