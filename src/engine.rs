// Copyright (c) 2022-2023, The rastack contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

//! The sequence engine: a parallel per-frame loop with pluggable hooks,
//! memory-aware thread count, ordered writer interaction and cooperative
//! cancellation.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::containers::{self, ContainerKind};
use crate::error::{ErrorSlot, ProcessingError, Result};
use crate::frame::{Frame, ImageData};
use crate::progress::{
  report, CancelToken, JobGuard, JobPhase, Progress, ProgressCounter,
  ProgressSink,
};
use crate::region::Rect;
use crate::sequence::{SelectionMap, SequenceInfo};
use crate::store::{FrameStore, PixelBufMut};
use crate::util::PixelType;

/// Default memory budget when the caller does not override it.
pub const DEFAULT_MEMORY_BUDGET: u64 = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Default)]
pub struct JobFlags {
  pub has_output: bool,
  /// Process only the job `area` of each frame instead of whole frames.
  pub partial_image: bool,
  pub force_float: bool,
  pub stop_on_error: bool,
  pub parallel: bool,
}

/// What a job produces.
pub enum OutputSpec {
  None,
  /// One FITS file per frame under this path prefix.
  Files { prefix: PathBuf },
  /// A single sequence container fed through the bounded writer.
  Sequence { kind: ContainerKind, path: PathBuf },
}

pub struct FrameJob<'a> {
  pub store: &'a dyn FrameStore,
  /// Frame selection predicate; `None` selects every frame.
  pub include: Option<Box<dyn Fn(u32) -> bool + Send + Sync + 'a>>,
  pub flags: JobFlags,
  pub output: OutputSpec,
  pub area: Option<Rect>,
  /// User thread cap; 0 means no cap.
  pub max_threads: usize,
  pub max_memory_bytes: u64,
  /// Writer backpressure bound; 0 disables bounding.
  pub max_active_blocks: usize,
  /// Short label for progress reporting.
  pub description: String,
}

impl<'a> FrameJob<'a> {
  pub fn new(store: &'a dyn FrameStore, description: impl Into<String>) -> Self {
    Self {
      store,
      include: None,
      flags: JobFlags { parallel: true, ..Default::default() },
      output: OutputSpec::None,
      area: None,
      max_threads: 0,
      max_memory_bytes: DEFAULT_MEMORY_BUDGET,
      max_active_blocks: 0,
      description: description.into(),
    }
  }
}

/// Job-immutable view handed to the hooks. Worker-local mutable state is
/// never shared; accumulators live behind atomics.
pub struct JobContext<'a> {
  pub info: SequenceInfo,
  pub selection: &'a SelectionMap,
  pub flags: JobFlags,
  pub area: Option<Rect>,
  pub cancel: &'a CancelToken,
  pub progress: &'a ProgressSink,
  pub writer: Option<&'a crate::writer::SequenceWriter>,
  pub output_prefix: Option<&'a Path>,
  written: &'a Mutex<Vec<PathBuf>>,
}

impl<'a> JobContext<'a> {
  pub fn record_written(&self, path: PathBuf) {
    self.written.lock().unwrap().push(path);
  }
}

#[derive(Debug, Default)]
pub struct JobSummary {
  pub selected: u32,
  pub processed: u32,
  pub excluded: u32,
  pub written: Vec<PathBuf>,
  pub cancelled: bool,
}

/// Per-frame operation hooks. Everything except `image` has a sensible
/// default.
pub trait FrameOp: Send + Sync {
  /// Runs once before the loop; an error aborts with `PreparationFailed`.
  fn prepare(&self, cx: &JobContext<'_>) -> Result<()> {
    let _ = cx;
    Ok(())
  }

  /// Maximum concurrent frames the memory budget allows.
  fn memory_budget(&self, info: &SequenceInfo, max_memory_bytes: u64) -> usize {
    let per_frame = info.frame_bytes().max(1);
    ((max_memory_bytes / per_frame).max(1)) as usize
  }

  /// Expected output size in bytes, checked against free disk space.
  fn output_size(&self, info: &SequenceInfo, n_selected: usize) -> u64 {
    info.frame_bytes() * n_selected as u64
  }

  /// The per-frame operation. `o` is the output index, `i` the source index.
  fn image(
    &self,
    cx: &JobContext<'_>,
    o: u32,
    i: u32,
    image: &mut ImageData,
    area: Option<&mut Rect>,
  ) -> Result<()>;

  /// Persist one result. The default enqueues into the sequence writer when
  /// one is active, and otherwise writes a FITS file named after the source
  /// index.
  fn save(&self, cx: &JobContext<'_>, o: u32, i: u32, image: ImageData) -> Result<()> {
    if let Some(writer) = cx.writer {
      return writer.append(crate::writer::WriteTask::frame(o, image));
    }
    if let Some(prefix) = cx.output_prefix {
      let path = containers::frame_file_name(prefix, i + 1);
      containers::fits::write_image(&path, &image)?;
      cx.record_written(path);
    }
    Ok(())
  }

  /// Runs exactly once after the loop, success or not.
  fn finalize(&self, summary: &JobSummary) -> Result<()> {
    let _ = summary;
    Ok(())
  }

  /// Completion callback, run on the caller's thread after `finalize`.
  fn idle(&self, summary: &JobSummary) {
    let _ = summary;
  }
}

/// Free space on the filesystem holding `path`, when the platform can tell.
#[cfg(unix)]
pub fn available_disk_space(path: &Path) -> Option<u64> {
  use std::ffi::CString;
  use std::os::unix::ffi::OsStrExt;
  let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
  let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
  if unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) } == 0 {
    Some(stat.f_bavail as u64 * stat.f_frsize as u64)
  } else {
    None
  }
}

#[cfg(not(unix))]
pub fn available_disk_space(_path: &Path) -> Option<u64> {
  None
}

fn check_disk_space(target: &Path, needed: u64) -> Result<()> {
  let dir = if target.is_dir() {
    target
  } else {
    target.parent().unwrap_or(Path::new("."))
  };
  if let Some(available) = available_disk_space(dir) {
    if available < needed {
      return Err(ProcessingError::OutOfSpace { needed, available });
    }
  }
  Ok(())
}

/// Thread count rule: the minimum of available threads, the memory budget
/// and the user cap; single-threaded when the reader is not reentrant or
/// parallelism is off.
pub fn engine_thread_count(
  available: usize,
  memory_budget: usize,
  user_cap: usize,
  parallel: bool,
  reentrant_reader: bool,
) -> usize {
  if !parallel || !reentrant_reader {
    return 1;
  }
  let mut threads = available.min(memory_budget.max(1));
  if user_cap > 0 {
    threads = threads.min(user_cap);
  }
  threads.max(1)
}

fn output_target(output: &OutputSpec) -> Option<&Path> {
  match output {
    OutputSpec::None => None,
    OutputSpec::Files { prefix } => Some(prefix.as_path()),
    OutputSpec::Sequence { path, .. } => Some(path.as_path()),
  }
}

/// Read one frame for the loop, honoring partial-image mode. Partial reads
/// shift the job area by the frame registration `(-shift_x, +shift_y)` and
/// clip it to the image; the effective area is returned for the hook.
fn read_loop_frame(
  store: &dyn FrameStore,
  info: &SequenceInfo,
  i: u32,
  flags: JobFlags,
  job_area: Option<Rect>,
) -> Result<(ImageData, Option<Rect>)> {
  if !flags.partial_image {
    return Ok((store.read_frame(i, flags.force_float)?, None));
  }
  let area = job_area.ok_or_else(|| {
    ProcessingError::InternalError("partial-image job without an area".to_string())
  })?;
  let reg = store.registration(0, i);
  let shifted = Rect {
    x: area.x - reg.x.round() as isize,
    y: area.y + reg.y.round() as isize,
    width: area.width,
    height: area.height,
  };
  let clipped = shifted.clipped(info.width, info.height);
  if clipped.area() == 0 {
    return Err(ProcessingError::FrameReadFailed { index: i });
  }
  let image = match info.pixel_type {
    PixelType::U16 => {
      let mut frame =
        Frame::<u16>::with_depth(clipped.width, clipped.height, 1, info.bit_depth)?;
      store.read_partial(i, 0, clipped, PixelBufMut::U16(&mut frame.planes[0].data))?;
      let image = ImageData::U16(frame);
      if flags.force_float {
        image.into_f32()
      } else {
        image
      }
    }
    PixelType::F32 => {
      let mut frame = Frame::<f32>::new(clipped.width, clipped.height, 1)?;
      store.read_partial(i, 0, clipped, PixelBufMut::F32(&mut frame.planes[0].data))?;
      ImageData::F32(frame)
    }
  };
  Ok((image, Some(clipped)))
}

/// Drive `op` over every selected frame of the job's sequence.
///
/// Per-frame failures are either fatal (`stop_on_error`) or counted as
/// excluded, with a null task keeping a sequence writer's ordering intact.
/// `finalize` runs exactly once on every path out of here.
pub fn run_frame_job(
  job: &FrameJob<'_>,
  op: &dyn FrameOp,
  progress: &ProgressSink,
  cancel: &CancelToken,
) -> Result<JobSummary> {
  let _busy = JobGuard::acquire()?;
  let mut phase = JobPhase::Preparing;
  tracing::debug!(job = %job.description, ?phase, "sequence job starting");
  report(progress, &job.description, Progress::Reset);

  let info = job.store.info();
  let selection = match &job.include {
    Some(include) => SelectionMap::build(info.frame_count, include),
    None => SelectionMap::all(info.frame_count),
  };
  if selection.is_empty() {
    return Err(ProcessingError::PreparationFailed(
      "no frame selected in the sequence".to_string(),
    ));
  }
  let n_selected = selection.len();

  if job.flags.has_output && !job.flags.partial_image {
    if let Some(target) = output_target(&job.output) {
      check_disk_space(target, op.output_size(&info, n_selected))?;
    }
  }

  let threads = engine_thread_count(
    rayon::current_num_threads(),
    op.memory_budget(&info, job.max_memory_bytes),
    job.max_threads,
    job.flags.parallel,
    job.store.is_reentrant_reader(),
  );
  tracing::debug!(threads, frames = n_selected, "engine thread count decided");

  let writer = match (&job.output, job.flags.has_output) {
    (OutputSpec::Sequence { kind, path }, true) => {
      let sink = job.store.create_writer(*kind, path, Some(n_selected as u32))?;
      Some(crate::writer::SequenceWriter::start(
        sink,
        Some(n_selected as u32),
        job.max_active_blocks,
      )?)
    }
    _ => None,
  };

  let written = Mutex::new(Vec::new());
  let cx = JobContext {
    info,
    selection: &selection,
    flags: job.flags,
    area: job.area,
    cancel,
    progress,
    writer: writer.as_ref(),
    output_prefix: match &job.output {
      OutputSpec::Files { prefix } if job.flags.has_output => Some(prefix.as_path()),
      _ => None,
    },
    written: &written,
  };

  if let Err(e) = op.prepare(&cx) {
    drop(cx);
    if let Some(writer) = writer {
      let _ = writer.stop(true);
    }
    return Err(match e {
      e @ ProcessingError::PreparationFailed(_) => e,
      other => ProcessingError::PreparationFailed(other.to_string()),
    });
  }

  let pool = rayon::ThreadPoolBuilder::new()
    .num_threads(threads)
    .build()
    .map_err(|e| ProcessingError::InternalError(format!("thread pool: {}", e)))?;

  phase = JobPhase::Running;
  tracing::debug!(?phase, "frame loop starting");
  let processed = AtomicU32::new(0);
  let excluded = AtomicU32::new(0);
  let errors = ErrorSlot::new();
  let counter = ProgressCounter::new(
    job.description.clone(),
    n_selected as u32,
    std::sync::Arc::clone(progress),
  );

  let process_one = |o: u32| {
    let i = selection[o as usize];

    let (mut image, mut effective_area) =
      match read_loop_frame(job.store, &info, i, job.flags, job.area) {
        Ok(read) => read,
        Err(e) => {
          if let Some(writer) = cx.writer {
            let _ = writer.append(crate::writer::WriteTask::skipped(o));
          }
          if job.flags.stop_on_error {
            errors.set(e);
          } else {
            excluded.fetch_add(1, Ordering::AcqRel);
            tracing::warn!(frame = i, error = %e, "frame excluded");
          }
          return;
        }
      };

    if let Err(e) = op.image(&cx, o, i, &mut image, effective_area.as_mut()) {
      if let Some(writer) = cx.writer {
        let _ = writer.append(crate::writer::WriteTask::skipped(o));
      }
      if job.flags.stop_on_error {
        errors.set(e);
      } else {
        excluded.fetch_add(1, Ordering::AcqRel);
        tracing::warn!(frame = i, error = %e, "frame excluded by hook");
      }
      return;
    }

    if job.flags.has_output {
      if let Err(e) = op.save(&cx, o, i, image) {
        errors.set(e);
        return;
      }
    }

    processed.fetch_add(1, Ordering::AcqRel);
    counter.tick();
  };

  // Workers pull indices from a shared counter, and a memory slot is
  // acquired before an index is taken: the smallest pending output index
  // always owns a slot, so the writer's reordering can never starve it.
  let next = AtomicU32::new(0);
  pool.scope(|scope| {
    for _ in 0..threads {
      scope.spawn(|_| loop {
        if cancel.is_cancelled() || errors.is_set() {
          break;
        }
        if let Some(writer) = cx.writer {
          if writer.wait_for_slot(cancel).is_err() {
            break;
          }
        }
        let o = next.fetch_add(1, Ordering::AcqRel);
        if o >= n_selected as u32 {
          if let Some(writer) = cx.writer {
            writer.release_slot();
          }
          break;
        }
        process_one(o);
      });
    }
  });

  let cancelled = cancel.is_cancelled();
  if cancelled {
    phase = JobPhase::Cancelling;
    tracing::debug!(?phase, "cancellation observed by all workers");
  }

  drop(cx);
  if let Some(writer) = writer {
    let aborting = cancelled || errors.is_set();
    match writer.stop(aborting) {
      Ok(paths) => written.lock().unwrap().extend(paths),
      Err(e) => errors.set(e),
    }
  }

  let summary = JobSummary {
    selected: n_selected as u32,
    processed: processed.load(Ordering::Acquire),
    excluded: excluded.load(Ordering::Acquire),
    written: std::mem::replace(&mut *written.lock().unwrap(), Vec::new()),
    cancelled,
  };

  phase = JobPhase::Finalizing;
  tracing::debug!(?phase, "finalizing");
  if let Err(e) = op.finalize(&summary) {
    errors.set(e);
  }
  op.idle(&summary);

  let failure = errors.take();
  phase = JobPhase::Done;
  tracing::debug!(?phase, "sequence job over");
  match failure {
    Some(e) => {
      tracing::error!(job = %job.description, error = %e, "sequence job failed");
      report(progress, &format!("{}: failed", job.description), Progress::Done);
      Err(e)
    }
    None if cancelled => {
      tracing::info!(job = %job.description, "sequence job cancelled");
      report(progress, &format!("{}: cancelled", job.description), Progress::Done);
      Err(ProcessingError::Cancelled)
    }
    None => {
      if summary.excluded > 0 {
        tracing::warn!(
          excluded = summary.excluded,
          processed = summary.processed,
          "{} images failed and were excluded",
          summary.excluded
        );
      } else {
        tracing::info!(processed = summary.processed, "sequence job complete");
      }
      report(progress, &job.description, Progress::Done);
      Ok(summary)
    }
  }
}
