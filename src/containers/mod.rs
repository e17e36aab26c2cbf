// Copyright (c) 2022-2023, The rastack contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

pub mod fits;
pub mod ser;

use std::path::{Path, PathBuf};

use crate::error::{ProcessingError, Result};
use crate::frame::ImageData;
use crate::sequence::SequenceInfo;

/// Output container kinds the core can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerKind {
  /// One FITS file per frame, named `{prefix}{index:05}.fit`.
  FitsFiles,
  FitsCube,
  Ser,
}

/// Sink for ordered frame output. Frames arrive in output-index order; the
/// first frame fixes the geometry and every later frame must match it.
pub trait ContainerWriter: Send {
  fn write_frame(&mut self, image: &ImageData) -> Result<()>;

  /// Flush, backpatch counts where the format needs it, and report the paths
  /// written.
  fn finalize(&mut self) -> Result<Vec<PathBuf>>;
}

/// Derived name for per-file outputs. `number` is 1-based.
pub fn frame_file_name(prefix: &Path, number: u32) -> PathBuf {
  let mut name = prefix.as_os_str().to_os_string();
  name.push(format!("{:05}.fit", number));
  PathBuf::from(name)
}

/// Writer producing one FITS file per frame under `prefix`.
pub struct FitsFilesWriter {
  prefix: PathBuf,
  written: Vec<PathBuf>,
}

impl FitsFilesWriter {
  pub fn new(prefix: impl Into<PathBuf>) -> Self {
    Self { prefix: prefix.into(), written: Vec::new() }
  }
}

impl ContainerWriter for FitsFilesWriter {
  fn write_frame(&mut self, image: &ImageData) -> Result<()> {
    let path = frame_file_name(&self.prefix, self.written.len() as u32 + 1);
    fits::write_image(&path, image)?;
    self.written.push(path);
    Ok(())
  }

  fn finalize(&mut self) -> Result<Vec<PathBuf>> {
    Ok(std::mem::replace(&mut self.written, Vec::new()))
  }
}

/// Open an output writer of the requested kind at `path` (a prefix for
/// per-file output, a file path otherwise).
pub fn create_writer(
  kind: ContainerKind,
  path: &Path,
  info: &SequenceInfo,
  expected_frame_count: Option<u32>,
) -> Result<Box<dyn ContainerWriter>> {
  match kind {
    ContainerKind::FitsFiles => Ok(Box::new(FitsFilesWriter::new(path))),
    ContainerKind::FitsCube => {
      Ok(Box::new(fits::FitsCubeWriter::create(path, info, expected_frame_count)?))
    }
    ContainerKind::Ser => {
      Ok(Box::new(ser::SerWriter::create(path, info, expected_frame_count)?))
    }
  }
}

pub(crate) fn incompatible_geometry(
  what: &str,
  image: &ImageData,
  expected: &str,
) -> ProcessingError {
  ProcessingError::Incompatible(format!(
    "{}: got {}x{}x{} {:?}, expected {}",
    what,
    image.width(),
    image.height(),
    image.channels(),
    image.pixel_type(),
    expected
  ))
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn frame_file_names_are_zero_padded() {
    let name = frame_file_name(Path::new("/tmp/p_"), 3);
    assert_eq!(name, PathBuf::from("/tmp/p_00003.fit"));
    let name = frame_file_name(Path::new("/tmp/p_"), 12345);
    assert_eq!(name, PathBuf::from("/tmp/p_12345.fit"));
  }
}
