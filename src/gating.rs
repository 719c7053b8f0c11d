//! Optical gating: decides which particles are optimally positioned (OPP).
//!
//! A particle passing through the focused laser beam is seen by two
//! focused-beam detectors, D1 and D2. Well-positioned particles give
//! consistent D1/D2 readings (the alignment band) and sit below the notch
//! lines relating D1 and D2 to forward scatter.
//!
//! # Lifecycle
//!
//! ```text
//! Loaded --align--> Aligned --gate--> Gated --opp_stats--> StatsReady
//!                      ^                |
//!                      +------gate------+   (re-gating restarts from Aligned)
//! ```
//!
//! The engine borrows the loaded file and never discards rows from it:
//! alignment only narrows the input to notch inference, and every gate pass
//! is recomputed over the full row set.

use crate::error::ParameterError;
use crate::evt::{Channel, ParticleEvent, ParticleFile};
use crate::stats::{calc_stats, ChannelStats};
use bitvec::prelude::*;
use serde::{Deserialize, Serialize};

/// Scale applied to `width` and `offset` to reach digitizer units.
pub const PARAM_SCALE: f64 = 1e4;

/// Forward scatter at or below this count is treated as noise.
pub const NOISE_FSC_SMALL: u16 = 1;

/// Filter parameters as supplied by a caller or calibration tool.
///
/// `None` notches and origin are inferred from the data; `width` and `offset`
/// are required at gate time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterOptions {
    /// Slope of the D1 notch line
    pub notch1: Option<f64>,
    /// Slope of the D2 notch line
    pub notch2: Option<f64>,
    /// Notch line shift, in units of 10^4 counts
    pub offset: Option<f64>,
    /// D2 - D1 sensitivity correction
    pub origin: Option<f64>,
    /// Alignment band half-width, in units of 10^4 counts
    pub width: Option<f64>,
}

impl Default for FilterOptions {
    /// Width 0.5, offset 0, everything else inferred.
    fn default() -> Self {
        Self {
            notch1: None,
            notch2: None,
            offset: Some(0.0),
            origin: None,
            width: Some(0.5),
        }
    }
}

impl FilterOptions {
    /// Options with explicit width and offset and inferred notches/origin.
    pub fn new(width: f64, offset: f64) -> Self {
        Self {
            width: Some(width),
            offset: Some(offset),
            ..Self::default()
        }
    }

    /// Set both notch slopes.
    pub fn with_notches(mut self, notch1: f64, notch2: f64) -> Self {
        self.notch1 = Some(notch1);
        self.notch2 = Some(notch2);
        self
    }

    /// Set the origin.
    pub fn with_origin(mut self, origin: f64) -> Self {
        self.origin = Some(origin);
        self
    }

    /// Check that required values are present and every value is finite.
    pub fn validate(&self) -> Result<(f64, f64), ParameterError> {
        let width = require("width", self.width)?;
        let offset = require("offset", self.offset)?;
        if width <= 0.0 {
            return Err(ParameterError::NonPositiveWidth(width));
        }
        finite_opt("notch1", self.notch1)?;
        finite_opt("notch2", self.notch2)?;
        finite_opt("origin", self.origin)?;
        Ok((width, offset))
    }
}

fn require(name: &'static str, value: Option<f64>) -> Result<f64, ParameterError> {
    let value = value.ok_or(ParameterError::Missing(name))?;
    finite(name, value)
}

fn finite(name: &'static str, value: f64) -> Result<f64, ParameterError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ParameterError::NotFinite { name, value })
    }
}

fn finite_opt(name: &'static str, value: Option<f64>) -> Result<(), ParameterError> {
    value.map_or(Ok(()), |v| finite(name, v).map(|_| ()))
}

/// The resolved parameters that produced a gating result.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GateParameters {
    /// Slope of the D1 notch line
    pub notch1: f64,
    /// Slope of the D2 notch line
    pub notch2: f64,
    /// Notch line shift
    pub offset: f64,
    /// D2 - D1 sensitivity correction
    pub origin: f64,
    /// Alignment band half-width
    pub width: f64,
}

/// Rows inside the D1/D2 alignment band, used for notch inference.
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedSubset {
    origin: f64,
    width: f64,
    indices: Vec<usize>,
}

impl AlignedSubset {
    /// Origin used for the band.
    pub fn origin(&self) -> f64 {
        self.origin
    }

    /// Width used for the band.
    pub fn width(&self) -> f64 {
        self.width
    }

    /// Indices of aligned rows into the loaded file.
    pub fn indices(&self) -> &[usize] {
        &self.indices
    }

    /// Number of aligned rows.
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    /// Whether no row is aligned.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// OPP membership over every row of a file.
#[derive(Debug, Clone, PartialEq)]
pub struct GatingResult {
    mask: BitVec,
    params: GateParameters,
}

impl GatingResult {
    /// Membership mask, one bit per file row.
    pub fn mask(&self) -> &BitSlice {
        &self.mask
    }

    /// Whether row `index` is OPP.
    pub fn is_opp(&self, index: usize) -> bool {
        self.mask.get(index).is_some_and(|b| *b)
    }

    /// Parameters that produced this result.
    pub fn params(&self) -> &GateParameters {
        &self.params
    }

    /// Number of OPP rows.
    pub fn opp_count(&self) -> usize {
        self.mask.count_ones()
    }

    /// Number of rows in the gated file.
    pub fn evt_count(&self) -> usize {
        self.mask.len()
    }

    /// `opp_count / evt_count`, or 0 for an empty file.
    pub fn opp_evt_ratio(&self) -> f64 {
        match self.evt_count() {
            0 => 0.0,
            n => self.opp_count() as f64 / n as f64,
        }
    }
}

/// Where the engine is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// File loaded, nothing computed
    Loaded,
    /// Alignment band computed
    Aligned,
    /// OPP mask computed
    Gated,
    /// OPP statistics computed
    StatsReady,
}

/// Gating engine over one loaded file.
#[derive(Debug)]
pub struct GatingEngine<'a> {
    file: &'a ParticleFile,
    state: GateState,
    aligned: Option<AlignedSubset>,
    result: Option<GatingResult>,
}

impl<'a> GatingEngine<'a> {
    /// Start a gating session over `file`.
    pub fn new(file: &'a ParticleFile) -> Self {
        Self {
            file,
            state: GateState::Loaded,
            aligned: None,
            result: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> GateState {
        self.state
    }

    /// The file being gated.
    pub fn file(&self) -> &'a ParticleFile {
        self.file
    }

    /// Most recent alignment, if any.
    pub fn aligned(&self) -> Option<&AlignedSubset> {
        self.aligned.as_ref()
    }

    /// Most recent gating result, if any.
    pub fn result(&self) -> Option<&GatingResult> {
        self.result.as_ref()
    }

    /// Compute the alignment band for `width`, inferring `origin` when absent.
    ///
    /// Discards any previous gating result.
    pub fn align(
        &mut self,
        width: f64,
        origin: Option<f64>,
    ) -> Result<&AlignedSubset, ParameterError> {
        let width = finite("width", width)?;
        if width <= 0.0 {
            return Err(ParameterError::NonPositiveWidth(width));
        }
        finite_opt("origin", origin)?;
        let origin = origin.unwrap_or_else(|| default_origin(self.file.events()));

        let indices = self
            .file
            .events()
            .iter()
            .enumerate()
            .filter(|(_, ev)| !is_noise(ev) && is_aligned(ev, origin, width))
            .map(|(i, _)| i)
            .collect();

        self.result = None;
        self.state = GateState::Aligned;
        Ok(self.aligned.insert(AlignedSubset {
            origin,
            width,
            indices,
        }))
    }

    /// Infer both notch slopes from an aligned subset.
    ///
    /// Among aligned rows with the largest `fsc_small`, the smallest D1 (D2)
    /// reading defines `notch = fsc_max / (d_min + 10^4)`.
    pub fn infer_notches(&self, aligned: &AlignedSubset) -> Result<(f64, f64), ParameterError> {
        Ok((
            self.infer_notch(aligned, Channel::D1, "notch1")?,
            self.infer_notch(aligned, Channel::D2, "notch2")?,
        ))
    }

    fn infer_notch(
        &self,
        aligned: &AlignedSubset,
        channel: Channel,
        name: &'static str,
    ) -> Result<f64, ParameterError> {
        notch_from_aligned(self.file.events(), aligned, channel, name)
    }

    /// Gate every row of the file, replacing any previous result.
    ///
    /// A row is OPP when it is not noise, lies inside the alignment band, and
    /// both D1 and D2 lie at or below their notch lines:
    /// `fsc_small >= D * notch - offset * 10^4`.
    pub fn gate(&mut self, options: &FilterOptions) -> Result<&GatingResult, ParameterError> {
        let (width, offset) = options.validate()?;

        let file = self.file;
        let events = file.events();
        let aligned = self.align(width, options.origin)?;

        let notch1 = match options.notch1 {
            Some(n) => n,
            None => notch_from_aligned(events, aligned, Channel::D1, "notch1")?,
        };
        let notch2 = match options.notch2 {
            Some(n) => n,
            None => notch_from_aligned(events, aligned, Channel::D2, "notch2")?,
        };
        let params = GateParameters {
            notch1,
            notch2,
            offset,
            origin: aligned.origin,
            width,
        };

        let mask: BitVec = events.iter().map(|ev| is_opp(ev, &params)).collect();

        tracing::trace!(
            opp_count = mask.count_ones(),
            evt_count = mask.len(),
            notch1,
            notch2,
            origin = params.origin,
            "gated file"
        );
        self.state = GateState::Gated;
        Ok(self.result.insert(GatingResult { mask, params }))
    }

    /// OPP rows in original file order.
    pub fn opp_events(&self) -> Vec<ParticleEvent> {
        match &self.result {
            Some(result) => self
                .file
                .events()
                .iter()
                .zip(result.mask.iter().by_vals())
                .filter_map(|(ev, keep)| keep.then_some(*ev))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Statistics over the OPP rows; `None` until the file has been gated.
    pub fn opp_stats(&mut self) -> Option<ChannelStats> {
        self.result.as_ref()?;
        let stats = calc_stats(&self.opp_events());
        self.state = GateState::StatsReady;
        Some(stats)
    }

    /// Statistics over every row of the file.
    pub fn evt_stats(&self) -> ChannelStats {
        calc_stats(self.file.events())
    }
}

fn notch_from_aligned(
    events: &[ParticleEvent],
    aligned: &AlignedSubset,
    channel: Channel,
    name: &'static str,
) -> Result<f64, ParameterError> {
    let rows = || aligned.indices.iter().filter_map(|&i| events.get(i));
    let fsc_max = rows()
        .map(|ev| ev.get(Channel::FscSmall))
        .max()
        .ok_or(ParameterError::NoAlignedParticles(name))?;
    let d_min = rows()
        .filter(|ev| ev.get(Channel::FscSmall) == fsc_max)
        .map(|ev| ev.get(channel))
        .min()
        .ok_or(ParameterError::NoAlignedParticles(name))?;
    Ok(f64::from(fsc_max) / (f64::from(d_min) + PARAM_SCALE))
}

/// Median of `D2 - D1` over all rows; 0 for an empty row set.
pub fn default_origin(events: &[ParticleEvent]) -> f64 {
    let mut diffs: Vec<f64> = events
        .iter()
        .map(|ev| f64::from(ev.get(Channel::D2)) - f64::from(ev.get(Channel::D1)))
        .collect();
    if diffs.is_empty() {
        return 0.0;
    }
    diffs.sort_by(f64::total_cmp);
    let mid = diffs.len() / 2;
    if diffs.len() % 2 == 0 {
        (diffs[mid - 1] + diffs[mid]) / 2.0
    } else {
        diffs[mid]
    }
}

#[inline]
/// Whether a row is below the forward scatter noise floor.
pub fn is_noise(ev: &ParticleEvent) -> bool {
    ev.get(Channel::FscSmall) <= NOISE_FSC_SMALL
}

#[inline]
fn is_aligned(ev: &ParticleEvent, origin: f64, width: f64) -> bool {
    let d1 = f64::from(ev.get(Channel::D1));
    let d2 = f64::from(ev.get(Channel::D2));
    let band = width * PARAM_SCALE;
    (d1 + origin) < (d2 + band) && d2 < (d1 + origin + band)
}

#[inline]
fn is_opp(ev: &ParticleEvent, params: &GateParameters) -> bool {
    if is_noise(ev) || !is_aligned(ev, params.origin, params.width) {
        return false;
    }
    let fsc = f64::from(ev.get(Channel::FscSmall));
    let d1 = f64::from(ev.get(Channel::D1));
    let d2 = f64::from(ev.get(Channel::D2));
    let shift = params.offset * PARAM_SCALE;
    fsc >= d1 * params.notch1 - shift && fsc >= d2 * params.notch2 - shift
}
