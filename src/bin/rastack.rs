// Copyright (c) 2022-2023, The rastack contributors. All rights reserved
//
// This source code is subject to the terms of the BSD 2 Clause License. If
// the BSD 2 Clause License was not distributed with this source code in the
// LICENSE file, you can obtain it at
// https://opensource.org/licenses/BSD-2-Clause.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{App, Arg};

use rastack::containers::fits;
use rastack::containers::fits::{FitsCubeStore, FitsFilesStore};
use rastack::containers::ser::SerStore;
use rastack::stats::StatsCache;
use rastack::{
  null_progress, CancelToken, FrameStore, Normalization, Progress,
  ProgressSink, Rejection, StackMethod, StackParams,
};

struct StackConfig {
  input: PathBuf,
  output: PathBuf,
  params: StackParams,
  cache: Option<PathBuf>,
  quiet: bool,
}

impl StackConfig {
  fn from_cli() -> StackConfig {
    let matches = App::new("rastack")
      .version("0.1.0")
      .about("Stack an astronomical image sequence into a single image")
      .arg(Arg::with_name("INPUT")
        .help("Input sequence (SER video or FITS cube)")
        .required(true)
        .index(1))
      .arg(Arg::with_name("OUTPUT")
        .help("Stacked FITS output")
        .short("o")
        .long("output")
        .required(true)
        .takes_value(true))
      .arg(Arg::with_name("METHOD")
        .help("Stacking method (median, mean)")
        .short("m")
        .long("method")
        .takes_value(true)
        .default_value("mean"))
      .arg(Arg::with_name("REJECTION")
        .help("Rejection for mean stacking \
               (none, percentile, sigma, sigma-median, winsorized, linear-fit)")
        .short("r")
        .long("rejection")
        .takes_value(true)
        .default_value("sigma"))
      .arg(Arg::with_name("SIGMA_LOW")
        .long("sigma-low")
        .takes_value(true)
        .default_value("3.0"))
      .arg(Arg::with_name("SIGMA_HIGH")
        .long("sigma-high")
        .takes_value(true)
        .default_value("3.0"))
      .arg(Arg::with_name("NORM")
        .help("Normalization (none, add, addscale, mul, mulscale)")
        .short("n")
        .long("normalization")
        .takes_value(true)
        .default_value("none"))
      .arg(Arg::with_name("MEMORY")
        .help("Memory budget in MiB")
        .long("memory")
        .takes_value(true)
        .default_value("2048"))
      .arg(Arg::with_name("THREADS")
        .help("Thread cap (0 = all available)")
        .short("j")
        .long("threads")
        .takes_value(true)
        .default_value("0"))
      .arg(Arg::with_name("NO_REGISTRATION")
        .help("Ignore registration data")
        .long("no-registration"))
      .arg(Arg::with_name("FLOAT")
        .help("Produce a 32-bit float result")
        .long("float"))
      .arg(Arg::with_name("CACHE")
        .help("Statistics cache file for the normalization pre-pass")
        .long("stats-cache")
        .takes_value(true))
      .arg(Arg::with_name("QUIET")
        .short("q")
        .long("quiet"))
      .get_matches();

    let low: f32 = matches.value_of("SIGMA_LOW").unwrap().parse()
      .expect("invalid --sigma-low");
    let high: f32 = matches.value_of("SIGMA_HIGH").unwrap().parse()
      .expect("invalid --sigma-high");
    let rejection = match matches.value_of("REJECTION").unwrap() {
      "none" => Rejection::None,
      "percentile" => Rejection::Percentile { low, high },
      "sigma" => Rejection::Sigma { low, high },
      "sigma-median" => Rejection::SigmaMedian { low, high },
      "winsorized" => Rejection::Winsorized { low, high },
      "linear-fit" => Rejection::LinearFit { low, high },
      other => panic!("unknown rejection {:?}", other),
    };
    let method = match matches.value_of("METHOD").unwrap() {
      "median" => StackMethod::Median,
      "mean" => StackMethod::Mean,
      other => panic!("unknown method {:?}", other),
    };
    let normalization = match matches.value_of("NORM").unwrap() {
      "none" => Normalization::None,
      "add" => Normalization::Additive,
      "addscale" => Normalization::AdditiveScaling,
      "mul" => Normalization::Multiplicative,
      "mulscale" => Normalization::MultiplicativeScaling,
      other => panic!("unknown normalization {:?}", other),
    };
    let memory_mib: u64 = matches.value_of("MEMORY").unwrap().parse()
      .expect("invalid --memory");

    StackConfig {
      input: PathBuf::from(matches.value_of("INPUT").unwrap()),
      output: PathBuf::from(matches.value_of("OUTPUT").unwrap()),
      params: StackParams {
        method,
        rejection: if method == StackMethod::Median { Rejection::None } else { rejection },
        normalization,
        use_registration: !matches.is_present("NO_REGISTRATION"),
        force_float: matches.is_present("FLOAT"),
        max_memory_bytes: memory_mib * 1024 * 1024,
        max_threads: matches.value_of("THREADS").unwrap().parse()
          .expect("invalid --threads"),
        ..Default::default()
      },
      cache: matches.value_of("CACHE").map(PathBuf::from),
      quiet: matches.is_present("QUIET"),
    }
  }
}

/// A `.ser` file opens as SER, another existing file as a FITS cube, and
/// anything else is a per-file sequence prefix (`lights/r_`).
fn open_store(path: &Path) -> rastack::Result<Box<dyn FrameStore>> {
  if path.is_file() {
    return match path.extension().and_then(|e| e.to_str()) {
      Some("ser") | Some("SER") => Ok(Box::new(SerStore::open(path)?)),
      _ => Ok(Box::new(FitsCubeStore::open(path)?)),
    };
  }
  let dir = path.parent().filter(|d| !d.as_os_str().is_empty());
  let prefix = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
  Ok(Box::new(FitsFilesStore::from_prefix(
    dir.unwrap_or_else(|| Path::new(".")),
    prefix,
  )?))
}

fn main() {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .with_writer(std::io::stderr)
    .init();

  let config = StackConfig::from_cli();
  let store = match open_store(&config.input) {
    Ok(store) => store,
    Err(e) => {
      eprintln!("cannot open {}: {}", config.input.display(), e);
      std::process::exit(1);
    }
  };

  let progress: ProgressSink = if config.quiet {
    null_progress()
  } else {
    Arc::new(|label: &str, p: Progress| {
      if let Progress::Fraction(f) = p {
        eprint!("\r{}: {:5.1}%", label, f * 100.0);
        if f >= 1.0 {
          eprintln!();
        }
      }
    })
  };

  let mut cache = match &config.cache {
    Some(path) if path.exists() => match StatsCache::load(path) {
      Ok(cache) => Some(cache),
      Err(e) => {
        eprintln!("ignoring unreadable stats cache: {}", e);
        Some(StatsCache::new())
      }
    },
    Some(_) => Some(StatsCache::new()),
    None => None,
  };

  let cancel = CancelToken::new();
  let outcome = match rastack::run_stack_job(
    store.as_ref(),
    None,
    &config.params,
    cache.as_mut(),
    &progress,
    &cancel,
  ) {
    Ok(outcome) => outcome,
    Err(e) => {
      eprintln!("stacking failed: {}", e);
      std::process::exit(1);
    }
  };

  if let (Some(path), Some(cache)) = (&config.cache, &cache) {
    if let Err(e) = cache.save(path) {
      eprintln!("could not save stats cache: {}", e);
    }
  }

  if let Err(e) = fits::write_image(&config.output, &outcome.image) {
    eprintln!("cannot write {}: {}", config.output.display(), e);
    std::process::exit(1);
  }

  if !config.quiet {
    let low: u64 = outcome.rejected_low.iter().sum();
    let high: u64 = outcome.rejected_high.iter().sum();
    eprintln!(
      "stacked {} frames into {} ({} low / {} high rejections)",
      outcome.frames,
      config.output.display(),
      low,
      high
    );
  }
}
