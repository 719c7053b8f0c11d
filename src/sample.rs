//! Random row subsets drawn across a cruise.
//!
//! Used to build small training or diagnostic files from many EVT files
//! without reading all of them. A fraction of the input files is chosen at
//! random, each chosen file contributes an equal share of the requested row
//! count, and the concatenated rows can be written with
//! [`write_file`](crate::evt::write_file).
//!
//! A fixed seed makes a draw reproducible for the same inputs.

use crate::error::{AppResult, ParameterError};
use crate::evt::{decode_file, Channel, ParticleEvent, SeaflowFile};
use crate::gating::is_noise;
use chrono::{DateTime, Utc};
use rand::seq::index;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::path::PathBuf;

/// What to draw and from where.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleOptions {
    /// Rows to draw before the noise filter
    pub count: usize,
    /// Share of the input files to read, in `(0, 1]`
    pub file_fraction: f64,
    /// Minimum raw `fsc_small`
    pub min_fsc: u16,
    /// Minimum raw `pe`
    pub min_pe: u16,
    /// Minimum raw `chl_small`
    pub min_chl: u16,
    /// Drop noise rows after drawing
    pub filter_noise: bool,
    /// PRNG seed; entropy from the OS when unset
    pub seed: Option<u64>,
}

impl Default for SampleOptions {
    fn default() -> Self {
        Self {
            count: 100_000,
            file_fraction: 0.1,
            min_fsc: 0,
            min_pe: 0,
            min_chl: 0,
            filter_noise: false,
            seed: None,
        }
    }
}

impl SampleOptions {
    /// Check count and file fraction.
    pub fn validate(&self) -> Result<(), ParameterError> {
        if self.count == 0 {
            return Err(ParameterError::OutOfRange {
                name: "count",
                value: 0.0,
                expected: "> 0",
            });
        }
        if !(self.file_fraction > 0.0 && self.file_fraction <= 1.0) {
            return Err(ParameterError::OutOfRange {
                name: "file_fraction",
                value: self.file_fraction,
                expected: "> 0 and <= 1",
            });
        }
        Ok(())
    }

    fn passes_thresholds(&self, ev: &ParticleEvent) -> bool {
        ev.get(Channel::FscSmall) >= self.min_fsc
            && ev.get(Channel::Pe) >= self.min_pe
            && ev.get(Channel::ChlSmall) >= self.min_chl
    }
}

/// Drawn rows plus where they came from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Sample {
    /// Rows in file order, then in original row order within a file
    pub events: Vec<ParticleEvent>,
    /// Files that contributed rows
    pub files: Vec<PathBuf>,
    /// Files chosen but unreadable
    pub skipped: Vec<PathBuf>,
}

/// Keep EVT files whose name timestamp lies inside `[min, max]`.
///
/// OPP files and unparseable names are dropped. Old-style names carry no
/// timestamp and are kept only when no bound is given.
pub fn select_evt_files(
    files: Vec<PathBuf>,
    min: Option<DateTime<Utc>>,
    max: Option<DateTime<Utc>>,
) -> Vec<PathBuf> {
    files
        .into_iter()
        .filter(|path| {
            let Ok(file) = SeaflowFile::parse(path) else {
                return false;
            };
            if file.is_opp() {
                return false;
            }
            match file.timestamp() {
                Some(ts) => min.map_or(true, |m| ts >= m) && max.map_or(true, |m| ts <= m),
                None => min.is_none() && max.is_none(),
            }
        })
        .collect()
}

/// Draw a random row subset from a fraction of `files`.
///
/// At least one file is read. Files that fail to decode are skipped and
/// listed in [`Sample::skipped`].
pub fn sample(files: &[PathBuf], options: &SampleOptions) -> AppResult<Sample> {
    options.validate()?;
    let mut rng = match options.seed {
        Some(seed) => ChaCha8Rng::seed_from_u64(seed),
        None => ChaCha8Rng::from_entropy(),
    };
    if files.is_empty() {
        return Ok(Sample::default());
    }

    let wanted = ((files.len() as f64 * options.file_fraction) as usize).clamp(1, files.len());
    let mut chosen = index::sample(&mut rng, files.len(), wanted).into_vec();
    chosen.sort_unstable();
    let quota = options.count.div_ceil(wanted);

    let mut drawn = Sample::default();
    for path in chosen.into_iter().filter_map(|i| files.get(i)) {
        let particles = match decode_file(path) {
            Ok(p) => p,
            Err(e) if e.is_file_scoped() => {
                tracing::warn!(path = %path.display(), error = %e, "skipping file");
                drawn.skipped.push(path.clone());
                continue;
            }
            Err(e) => return Err(e),
        };

        let candidates: Vec<&ParticleEvent> = particles
            .events()
            .iter()
            .filter(|ev| options.passes_thresholds(ev))
            .collect();
        let take = quota.min(candidates.len());
        let mut picked = index::sample(&mut rng, candidates.len(), take).into_vec();
        picked.sort_unstable();

        drawn.events.extend(
            picked
                .into_iter()
                .filter_map(|i| candidates.get(i).copied())
                .filter(|ev| !options.filter_noise || !is_noise(ev))
                .copied(),
        );
        drawn.files.push(path.clone());
        tracing::debug!(path = %path.display(), rows = take, "sampled file");
    }
    drawn.events.truncate(options.count);
    Ok(drawn)
}
