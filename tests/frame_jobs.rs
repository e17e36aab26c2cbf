//! End-to-end per-frame transform jobs: pass-through output, per-frame
//! failure with continuation, and cancellation before any work starts.

mod common;

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use pretty_assertions::assert_eq;
use rastack::containers::fits;
use rastack::engine::JobContext;
use rastack::{
  null_progress, CancelToken, FrameJob, FrameOp, ImageData, JobSummary,
  OutputSpec, ProcessingError,
};

use common::{mono_store, numbered_frame, plane_of, serial_guard};

struct Identity;

impl FrameOp for Identity {
  fn image(
    &self,
    _cx: &JobContext<'_>,
    _o: u32,
    _i: u32,
    _image: &mut ImageData,
    _area: Option<&mut rastack::region::Rect>,
  ) -> rastack::Result<()> {
    Ok(())
  }
}

#[test]
fn pass_through_writes_one_identical_file_per_frame() {
  let _serial = serial_guard();
  let dir = tempfile::tempdir().unwrap();
  let frames: Vec<ImageData> = (0..5).map(|i| numbered_frame(4, 4, i + 1)).collect();
  let store = mono_store(frames.clone());

  let mut job = FrameJob::new(&store, "pass-through");
  job.flags.has_output = true;
  job.output = OutputSpec::Files { prefix: dir.path().join("p_") };

  let summary =
    rastack::run_frame_job(&job, &Identity, &null_progress(), &CancelToken::new())
      .unwrap();
  assert_eq!(summary.selected, 5);
  assert_eq!(summary.processed, 5);
  assert_eq!(summary.excluded, 0);
  assert_eq!(summary.written.len(), 5);

  for (i, original) in frames.iter().enumerate() {
    let path = dir.path().join(format!("p_{:05}.fit", i + 1));
    assert!(path.exists(), "{} missing", path.display());
    let back = fits::read_image(&path).unwrap();
    assert_eq!(plane_of(&back), plane_of(original), "frame {} differs", i);
  }
}

struct FailAt {
  o: u32,
}

impl FrameOp for FailAt {
  fn image(
    &self,
    _cx: &JobContext<'_>,
    o: u32,
    i: u32,
    _image: &mut ImageData,
    _area: Option<&mut rastack::region::Rect>,
  ) -> rastack::Result<()> {
    if o == self.o {
      Err(ProcessingError::FrameProcessingFailed { index: i })
    } else {
      Ok(())
    }
  }
}

#[test]
fn per_frame_failure_continues_and_keeps_source_names() {
  let _serial = serial_guard();
  let dir = tempfile::tempdir().unwrap();
  let frames: Vec<ImageData> = (0..5).map(|i| numbered_frame(4, 4, i + 1)).collect();
  let store = mono_store(frames.clone());

  let mut job = FrameJob::new(&store, "fail-one");
  job.flags.has_output = true;
  job.output = OutputSpec::Files { prefix: dir.path().join("p_") };

  let summary = rastack::run_frame_job(
    &job,
    &FailAt { o: 2 },
    &null_progress(),
    &CancelToken::new(),
  )
  .unwrap();
  assert_eq!(summary.processed, 4);
  assert_eq!(summary.excluded, 1);
  assert_eq!(summary.processed + summary.excluded, summary.selected);

  // output names preserve source indices; the failed frame is simply absent
  for i in [1u32, 2, 4, 5].iter() {
    assert!(dir.path().join(format!("p_{:05}.fit", i)).exists());
  }
  assert!(!dir.path().join("p_00003.fit").exists());
}

#[test]
fn fatal_per_frame_error_with_stop_on_error() {
  let _serial = serial_guard();
  let dir = tempfile::tempdir().unwrap();
  let store = mono_store((0..5).map(|i| numbered_frame(4, 4, i + 1)).collect());

  let mut job = FrameJob::new(&store, "fail-fast");
  job.flags.has_output = true;
  job.flags.stop_on_error = true;
  job.output = OutputSpec::Files { prefix: dir.path().join("p_") };

  let err = rastack::run_frame_job(
    &job,
    &FailAt { o: 2 },
    &null_progress(),
    &CancelToken::new(),
  )
  .unwrap_err();
  assert!(matches!(err, ProcessingError::FrameProcessingFailed { .. }));
}

struct CountingFinalize {
  finalized: AtomicU32,
}

impl FrameOp for CountingFinalize {
  fn image(
    &self,
    _cx: &JobContext<'_>,
    _o: u32,
    _i: u32,
    _image: &mut ImageData,
    _area: Option<&mut rastack::region::Rect>,
  ) -> rastack::Result<()> {
    Ok(())
  }

  fn finalize(&self, _summary: &JobSummary) -> rastack::Result<()> {
    self.finalized.fetch_add(1, Ordering::AcqRel);
    Ok(())
  }
}

#[test]
fn cancellation_before_start_writes_nothing_and_finalizes_once() {
  let _serial = serial_guard();
  let dir = tempfile::tempdir().unwrap();
  let store = mono_store((0..5).map(|i| numbered_frame(4, 4, i + 1)).collect());

  let mut job = FrameJob::new(&store, "cancelled");
  job.flags.has_output = true;
  job.output = OutputSpec::Files { prefix: dir.path().join("p_") };

  let cancel = CancelToken::new();
  cancel.cancel();
  let op = CountingFinalize { finalized: AtomicU32::new(0) };
  let err =
    rastack::run_frame_job(&job, &op, &null_progress(), &cancel).unwrap_err();
  assert!(matches!(err, ProcessingError::Cancelled));
  assert_eq!(op.finalized.load(Ordering::Acquire), 1);

  let written: Vec<PathBuf> = std::fs::read_dir(dir.path())
    .unwrap()
    .map(|e| e.unwrap().path())
    .collect();
  assert!(written.is_empty(), "cancelled job wrote {:?}", written);
}

#[test]
fn empty_selection_fails_preparation() {
  let _serial = serial_guard();
  let store = mono_store((0..3).map(|i| numbered_frame(4, 4, i + 1)).collect());
  let mut job = FrameJob::new(&store, "empty");
  job.include = Some(Box::new(|_| false));
  let err =
    rastack::run_frame_job(&job, &Identity, &null_progress(), &CancelToken::new())
      .unwrap_err();
  assert!(matches!(err, ProcessingError::PreparationFailed(_)));
}

#[test]
fn selection_predicate_filters_frames() {
  let _serial = serial_guard();
  let dir = tempfile::tempdir().unwrap();
  let store = mono_store((0..6).map(|i| numbered_frame(4, 4, i + 1)).collect());
  let mut job = FrameJob::new(&store, "filtered");
  job.flags.has_output = true;
  job.include = Some(Box::new(|i| i % 2 == 0));
  job.output = OutputSpec::Files { prefix: dir.path().join("s_") };

  let summary =
    rastack::run_frame_job(&job, &Identity, &null_progress(), &CancelToken::new())
      .unwrap();
  assert_eq!(summary.selected, 3);
  assert_eq!(summary.processed, 3);
  // names derive from source indices 0, 2, 4
  for i in [1u32, 3, 5].iter() {
    assert!(dir.path().join(format!("s_{:05}.fit", i)).exists());
  }
  assert!(!dir.path().join("s_00002.fit").exists());
}
