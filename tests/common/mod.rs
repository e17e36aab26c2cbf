#![allow(dead_code)]

use std::sync::{Mutex, MutexGuard};

use rastack::{Frame, ImageData, MemoryStore, SequenceKind};

// Only one processing job may run per process; keep the end-to-end tests from
// tripping over each other's busy guard.
static SERIAL: Mutex<()> = Mutex::new(());

pub fn serial_guard() -> MutexGuard<'static, ()> {
  SERIAL.lock().unwrap_or_else(|e| e.into_inner())
}

pub fn constant_frame(width: usize, height: usize, value: u16) -> ImageData {
  let mut frame = Frame::<u16>::new(width, height, 1).unwrap();
  frame.planes[0].fill(value);
  ImageData::U16(frame)
}

/// Frame whose pixel (x, y) is `tag * 1000 + y * width + x`.
pub fn numbered_frame(width: usize, height: usize, tag: u16) -> ImageData {
  let mut frame = Frame::<u16>::new(width, height, 1).unwrap();
  for (i, v) in frame.planes[0].data.iter_mut().enumerate() {
    *v = tag * 1000 + i as u16;
  }
  ImageData::U16(frame)
}

pub fn mono_store(frames: Vec<ImageData>) -> MemoryStore {
  MemoryStore::new(frames, SequenceKind::FitsFiles).unwrap()
}

pub fn plane_of(image: &ImageData) -> &[u16] {
  match image {
    ImageData::U16(f) => &f.planes[0].data,
    _ => panic!("expected 16-bit storage"),
  }
}
