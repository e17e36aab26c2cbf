// Copyright (c) 2022-2023, The rastack contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

//! Bounded sequence writer: many producers hand `(index, frame)` tasks to a
//! single consumer thread, which restores output-index order through a
//! holding map and gates producers with a memory-slot semaphore.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::containers::ContainerWriter;
use crate::error::{ProcessingError, Result};
use crate::frame::ImageData;
use crate::progress::CancelToken;
use crate::util::PixelType;

/// One unit of writer work. A `None` image means "the frame at this index
/// failed; skip it but advance ordering".
pub struct WriteTask {
  pub index: u32,
  pub image: Option<ImageData>,
}

impl WriteTask {
  pub fn frame(index: u32, image: ImageData) -> Self {
    Self { index, image: Some(image) }
  }

  pub fn skipped(index: u32) -> Self {
    Self { index, image: None }
  }
}

enum Msg {
  Task(WriteTask),
  Abort,
}

/// Counting semaphore bounding concurrent in-memory frames on the writer
/// path. `max_active` of zero disables bounding.
///
/// Waits are cancellable: the wait wakes at least every 100 ms to observe the
/// cancel flag and the poison flag, so no path relies on spurious wakeups.
pub struct MemorySlots {
  max_active: usize,
  active: Mutex<usize>,
  cv: Condvar,
  poisoned: AtomicBool,
}

impl MemorySlots {
  pub fn new(max_active: usize) -> Self {
    Self {
      max_active,
      active: Mutex::new(0),
      cv: Condvar::new(),
      poisoned: AtomicBool::new(false),
    }
  }

  pub fn acquire(&self, cancel: &CancelToken) -> Result<()> {
    if self.max_active == 0 {
      return Ok(());
    }
    let mut active = self.active.lock().unwrap();
    loop {
      cancel.check()?;
      if self.poisoned.load(Ordering::Acquire) {
        return Err(ProcessingError::WriteFailed(
          "sequence writer stopped".to_string(),
        ));
      }
      if *active < self.max_active {
        *active += 1;
        return Ok(());
      }
      let (guard, _) = self
        .cv
        .wait_timeout(active, Duration::from_millis(100))
        .unwrap();
      active = guard;
    }
  }

  pub fn release(&self) {
    if self.max_active == 0 {
      return;
    }
    let mut active = self.active.lock().unwrap();
    *active = active.saturating_sub(1);
    self.cv.notify_one();
  }

  /// Fail all current and future waiters; used when the consumer dies.
  pub fn poison(&self) {
    self.poisoned.store(true, Ordering::Release);
    self.cv.notify_all();
  }

  pub fn active(&self) -> usize {
    *self.active.lock().unwrap()
  }
}

/// Where slot releases go once an output index is fully handled.
pub trait SlotNotifier: Send + Sync {
  fn frame_done(&self, index: u32);

  /// The consumer is going away; unblock producers.
  fn shutdown(&self);
}

impl SlotNotifier for MemorySlots {
  fn frame_done(&self, _index: u32) {
    self.release();
  }

  fn shutdown(&self) {
    self.poison();
  }
}

/// Coordinator for jobs producing several parallel outputs per input frame:
/// the memory slot for index `o` is released only once all outputs have
/// completed `o`.
pub struct OutputGroup {
  arity: usize,
  slots: Arc<MemorySlots>,
  pending: Mutex<HashMap<u32, usize>>,
}

impl OutputGroup {
  pub fn new(arity: usize, slots: Arc<MemorySlots>) -> Self {
    assert!(arity > 0);
    Self { arity, slots, pending: Mutex::new(HashMap::new()) }
  }
}

impl SlotNotifier for OutputGroup {
  fn frame_done(&self, index: u32) {
    let mut pending = self.pending.lock().unwrap();
    let count = pending.entry(index).or_insert(0);
    *count += 1;
    if *count == self.arity {
      pending.remove(&index);
      self.slots.release();
    }
  }

  fn shutdown(&self) {
    self.slots.poison();
  }
}

#[derive(Clone, Copy, PartialEq, Debug)]
struct TaskGeometry {
  width: usize,
  height: usize,
  channels: usize,
  pixel_type: PixelType,
}

impl TaskGeometry {
  fn of(image: &ImageData) -> Self {
    Self {
      width: image.width(),
      height: image.height(),
      channels: image.channels(),
      pixel_type: image.pixel_type(),
    }
  }
}

/// Single-consumer ordered serializer over one container sink.
pub struct SequenceWriter {
  tx: Option<Sender<Msg>>,
  slots: Arc<MemorySlots>,
  handle: Option<JoinHandle<Result<Vec<PathBuf>>>>,
}

impl SequenceWriter {
  /// Spawn the consumer thread over `sink`. `expected_frame_count` of `None`
  /// means the total is unknown; the consumer then runs until drained.
  pub fn start(
    sink: Box<dyn ContainerWriter>,
    expected_frame_count: Option<u32>,
    max_active: usize,
  ) -> Result<SequenceWriter> {
    let slots = Arc::new(MemorySlots::new(max_active));
    let notifier: Arc<dyn SlotNotifier> = slots.clone() as Arc<dyn SlotNotifier>;
    Self::start_with_notifier(sink, expected_frame_count, slots, notifier)
  }

  /// As `start`, but slot releases are routed through `notifier` (the
  /// multi-output coordinator path).
  pub fn start_with_notifier(
    sink: Box<dyn ContainerWriter>,
    expected_frame_count: Option<u32>,
    slots: Arc<MemorySlots>,
    notifier: Arc<dyn SlotNotifier>,
  ) -> Result<SequenceWriter> {
    let (tx, rx) = unbounded();
    let handle = thread::Builder::new()
      .name("seq-writer".to_string())
      .spawn(move || consume(sink, rx, expected_frame_count, notifier))
      .map_err(|e| {
        ProcessingError::InternalError(format!("writer thread: {}", e))
      })?;
    Ok(SequenceWriter { tx: Some(tx), slots, handle: Some(handle) })
  }

  /// Non-blocking enqueue, called by workers in any order.
  pub fn append(&self, task: WriteTask) -> Result<()> {
    match &self.tx {
      Some(tx) => tx.send(Msg::Task(task)).map_err(|_| {
        ProcessingError::WriteFailed("sequence writer stopped".to_string())
      }),
      None => Err(ProcessingError::WriteFailed(
        "sequence writer already stopped".to_string(),
      )),
    }
  }

  /// Backpressure: blocks while `max_active` frames are in flight.
  pub fn wait_for_slot(&self, cancel: &CancelToken) -> Result<()> {
    self.slots.acquire(cancel)
  }

  pub fn release_slot(&self) {
    self.slots.release();
  }

  pub fn slots(&self) -> &Arc<MemorySlots> {
    &self.slots
  }

  /// Graceful drain (`aborting` false) or immediate stop (`aborting` true).
  /// Returns the first error the consumer observed, or the written paths.
  pub fn stop(mut self, aborting: bool) -> Result<Vec<PathBuf>> {
    if aborting {
      if let Some(tx) = &self.tx {
        let _ = tx.send(Msg::Abort);
      }
    }
    self.tx = None; // close the channel so a draining consumer terminates
    match self.handle.take() {
      Some(handle) => match handle.join() {
        Ok(result) => result,
        Err(_) => Err(ProcessingError::InternalError(
          "sequence writer thread panicked".to_string(),
        )),
      },
      None => Ok(Vec::new()),
    }
  }
}

impl Drop for SequenceWriter {
  fn drop(&mut self) {
    if let Some(tx) = &self.tx {
      let _ = tx.send(Msg::Abort);
    }
    self.tx = None;
    if let Some(handle) = self.handle.take() {
      let _ = handle.join();
    }
  }
}

fn consume(
  mut sink: Box<dyn ContainerWriter>,
  rx: Receiver<Msg>,
  expected: Option<u32>,
  notifier: Arc<dyn SlotNotifier>,
) -> Result<Vec<PathBuf>> {
  let mut current: u32 = 0;
  let mut holding: BTreeMap<u32, WriteTask> = BTreeMap::new();
  let mut reference: Option<TaskGeometry> = None;
  let mut skipped: u32 = 0;
  let mut failure: Option<ProcessingError> = None;
  let mut aborted = false;

  loop {
    if let Some(exp) = expected {
      if current >= exp {
        break;
      }
    }
    let task = match holding.remove(&current) {
      Some(task) => task,
      None => match rx.recv() {
        Ok(Msg::Task(task)) => task,
        Ok(Msg::Abort) => {
          aborted = true;
          break;
        }
        // all producers are gone
        Err(_) => break,
      },
    };

    if let Some(image) = &task.image {
      let geometry = TaskGeometry::of(image);
      match reference {
        None => reference = Some(geometry),
        Some(reference) if reference != geometry => {
          failure = Some(ProcessingError::Incompatible(format!(
            "frame {} geometry {:?} disagrees with {:?}",
            task.index, geometry, reference
          )));
          notifier.frame_done(task.index);
          break;
        }
        Some(_) => {}
      }
    }

    if task.index != current {
      holding.insert(task.index, task);
      continue;
    }

    match task.image {
      None => {
        skipped += 1;
        tracing::debug!(index = task.index, "skipped index in output sequence");
      }
      Some(image) => {
        if let Err(e) = sink.write_frame(&image) {
          failure = Some(e);
          notifier.frame_done(task.index);
          break;
        }
      }
    }
    notifier.frame_done(task.index);
    current += 1;
  }

  // Unblock producers: anything still queued or held counts as handled.
  for (_, task) in holding {
    notifier.frame_done(task.index);
  }
  while let Ok(msg) = rx.try_recv() {
    if let Msg::Task(task) = msg {
      notifier.frame_done(task.index);
    }
  }
  notifier.shutdown();

  if let Some(e) = failure {
    return Err(e);
  }
  if aborted {
    return Ok(Vec::new());
  }
  tracing::debug!(written = current - skipped, skipped, "sequence writer drained");
  sink.finalize()
}

/// One logical writer producing several parallel outputs per input frame
/// (e.g. an extracted Ha/OIII pair). The engine treats it like a single
/// writer; the memory slot for an index frees once every output wrote it.
pub struct MultiOutputWriter {
  writers: Vec<SequenceWriter>,
  slots: Arc<MemorySlots>,
}

impl MultiOutputWriter {
  pub fn start(
    sinks: Vec<Box<dyn ContainerWriter>>,
    expected_frame_count: Option<u32>,
    max_active: usize,
  ) -> Result<MultiOutputWriter> {
    let slots = Arc::new(MemorySlots::new(max_active));
    let group: Arc<dyn SlotNotifier> =
      Arc::new(OutputGroup::new(sinks.len(), Arc::clone(&slots)));
    let writers = sinks
      .into_iter()
      .map(|sink| {
        SequenceWriter::start_with_notifier(
          sink,
          expected_frame_count,
          Arc::clone(&slots),
          Arc::clone(&group),
        )
      })
      .collect::<Result<Vec<_>>>()?;
    Ok(MultiOutputWriter { writers, slots })
  }

  pub fn outputs(&self) -> usize {
    self.writers.len()
  }

  pub fn wait_for_slot(&self, cancel: &CancelToken) -> Result<()> {
    self.slots.acquire(cancel)
  }

  /// Enqueue one output's result for `index`.
  pub fn append(&self, output: usize, task: WriteTask) -> Result<()> {
    self.writers[output].append(task)
  }

  /// Mark `index` failed on every output, advancing all orderings.
  pub fn append_skipped(&self, index: u32) -> Result<()> {
    for writer in &self.writers {
      writer.append(WriteTask::skipped(index))?;
    }
    Ok(())
  }

  pub fn stop(self, aborting: bool) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    let mut first_error = None;
    for writer in self.writers {
      match writer.stop(aborting) {
        Ok(mut p) => paths.append(&mut p),
        Err(e) => {
          if first_error.is_none() {
            first_error = Some(e);
          } else {
            tracing::warn!(error = %e, "writer error dropped, an earlier one wins");
          }
        }
      }
    }
    match first_error {
      Some(e) => Err(e),
      None => Ok(paths),
    }
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::frame::Frame;

  /// Sink capturing frames in arrival order.
  struct MemorySink {
    frames: Arc<Mutex<Vec<ImageData>>>,
    fail_on: Option<usize>,
  }

  impl MemorySink {
    fn new(frames: Arc<Mutex<Vec<ImageData>>>) -> Self {
      Self { frames, fail_on: None }
    }
  }

  impl ContainerWriter for MemorySink {
    fn write_frame(&mut self, image: &ImageData) -> Result<()> {
      let mut frames = self.frames.lock().unwrap();
      if self.fail_on == Some(frames.len()) {
        return Err(ProcessingError::WriteFailed("forced failure".to_string()));
      }
      frames.push(image.clone());
      Ok(())
    }

    fn finalize(&mut self) -> Result<Vec<PathBuf>> {
      Ok(vec![PathBuf::from("memory")])
    }
  }

  fn tagged_frame(tag: u16) -> ImageData {
    let mut frame = Frame::<u16>::new(2, 2, 1).unwrap();
    frame.planes[0].fill(tag);
    ImageData::U16(frame)
  }

  fn tag_of(image: &ImageData) -> u16 {
    match image {
      ImageData::U16(f) => f.planes[0].data[0],
      _ => unreachable!(),
    }
  }

  #[test]
  fn frames_come_out_in_index_order() {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let writer = SequenceWriter::start(
      Box::new(MemorySink::new(Arc::clone(&frames))),
      Some(4),
      0,
    )
    .unwrap();
    // deliberately scrambled producer order
    for &index in &[2u32, 0, 3, 1] {
      writer.append(WriteTask::frame(index, tagged_frame(index as u16))).unwrap();
    }
    let paths = writer.stop(false).unwrap();
    assert_eq!(paths, vec![PathBuf::from("memory")]);
    let got: Vec<u16> = frames.lock().unwrap().iter().map(tag_of).collect();
    assert_eq!(got, vec![0, 1, 2, 3]);
  }

  #[test]
  fn null_tasks_advance_ordering() {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let writer = SequenceWriter::start(
      Box::new(MemorySink::new(Arc::clone(&frames))),
      Some(3),
      0,
    )
    .unwrap();
    writer.append(WriteTask::frame(2, tagged_frame(2))).unwrap();
    writer.append(WriteTask::skipped(1)).unwrap();
    writer.append(WriteTask::frame(0, tagged_frame(0))).unwrap();
    writer.stop(false).unwrap();
    let got: Vec<u16> = frames.lock().unwrap().iter().map(tag_of).collect();
    assert_eq!(got, vec![0, 2]);
  }

  #[test]
  fn geometry_mismatch_fails_the_writer() {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let writer = SequenceWriter::start(
      Box::new(MemorySink::new(Arc::clone(&frames))),
      Some(2),
      0,
    )
    .unwrap();
    writer.append(WriteTask::frame(0, tagged_frame(0))).unwrap();
    let mut other = Frame::<u16>::new(3, 3, 1).unwrap();
    other.planes[0].fill(9);
    writer.append(WriteTask::frame(1, ImageData::U16(other))).unwrap();
    let err = writer.stop(false).unwrap_err();
    assert!(matches!(err, ProcessingError::Incompatible(_)));
  }

  #[test]
  fn write_failure_surfaces_through_stop() {
    let frames = Arc::new(Mutex::new(Vec::new()));
    let mut sink = MemorySink::new(Arc::clone(&frames));
    sink.fail_on = Some(1);
    let writer = SequenceWriter::start(Box::new(sink), Some(3), 0).unwrap();
    for index in 0..3u32 {
      writer.append(WriteTask::frame(index, tagged_frame(index as u16))).unwrap();
    }
    let err = writer.stop(false).unwrap_err();
    assert!(matches!(err, ProcessingError::WriteFailed(_)));
  }

  #[test]
  fn slot_acquire_is_cancellable() {
    let slots = MemorySlots::new(1);
    let cancel = CancelToken::new();
    slots.acquire(&cancel).unwrap();
    assert_eq!(slots.active(), 1);
    cancel.cancel();
    assert!(matches!(slots.acquire(&cancel), Err(ProcessingError::Cancelled)));
    slots.release();
    assert_eq!(slots.active(), 0);
  }

  #[test]
  fn poisoned_slots_fail_waiters() {
    let slots = MemorySlots::new(1);
    let cancel = CancelToken::new();
    slots.acquire(&cancel).unwrap();
    slots.poison();
    assert!(matches!(
      slots.acquire(&cancel),
      Err(ProcessingError::WriteFailed(_))
    ));
  }

  #[test]
  fn unbounded_slots_never_block() {
    let slots = MemorySlots::new(0);
    let cancel = CancelToken::new();
    for _ in 0..100 {
      slots.acquire(&cancel).unwrap();
    }
    assert_eq!(slots.active(), 0);
  }

  #[test]
  fn multi_output_releases_once_all_outputs_complete() {
    let frames_a = Arc::new(Mutex::new(Vec::new()));
    let frames_b = Arc::new(Mutex::new(Vec::new()));
    let multi = MultiOutputWriter::start(
      vec![
        Box::new(MemorySink::new(Arc::clone(&frames_a))),
        Box::new(MemorySink::new(Arc::clone(&frames_b))),
      ],
      Some(1),
      1,
    )
    .unwrap();
    let cancel = CancelToken::new();
    multi.wait_for_slot(&cancel).unwrap();
    multi.append(0, WriteTask::frame(0, tagged_frame(7))).unwrap();
    // only one of two outputs has completed index 0; the slot must still be
    // held
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(multi.slots.active(), 1);
    multi.append(1, WriteTask::frame(0, tagged_frame(8))).unwrap();
    let paths = multi.stop(false).unwrap();
    assert_eq!(paths.len(), 2);
    assert_eq!(frames_a.lock().unwrap().len(), 1);
    assert_eq!(frames_b.lock().unwrap().len(), 1);
  }

  #[test]
  fn strict_serialization_with_one_slot() {
    // max_active = 1 forces producer/consumer lockstep: a second acquire
    // only succeeds after the consumer finished an index.
    let frames = Arc::new(Mutex::new(Vec::new()));
    let writer = SequenceWriter::start(
      Box::new(MemorySink::new(Arc::clone(&frames))),
      Some(3),
      1,
    )
    .unwrap();
    let cancel = CancelToken::new();
    for index in 0..3u32 {
      writer.wait_for_slot(&cancel).unwrap();
      writer.append(WriteTask::frame(index, tagged_frame(index as u16))).unwrap();
    }
    writer.stop(false).unwrap();
    let got: Vec<u16> = frames.lock().unwrap().iter().map(tag_of).collect();
    assert_eq!(got, vec![0, 1, 2]);
  }
}
