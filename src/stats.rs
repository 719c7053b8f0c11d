//! Per-channel summary statistics on the physical scale.

use crate::evt::{transform, Channel, ParticleEvent};
use serde::{Deserialize, Serialize};

/// Minimum, maximum and mean of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Stat {
    /// Smallest transformed value
    pub min: f64,
    /// Largest transformed value
    pub max: f64,
    /// Arithmetic mean of transformed values
    pub mean: f64,
}

/// Statistics for every channel in [`Channel::STATS`].
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ChannelStats {
    stats: [Stat; Channel::STATS.len()],
}

impl ChannelStats {
    /// Build from values listed in [`Channel::STATS`] order.
    pub fn from_array(stats: [Stat; Channel::STATS.len()]) -> Self {
        Self { stats }
    }

    /// Statistics for one channel, if it is a summarised channel.
    pub fn get(&self, channel: Channel) -> Option<&Stat> {
        Channel::STATS
            .iter()
            .position(|c| *c == channel)
            .map(|i| &self.stats[i])
    }

    /// Iterate `(channel, stat)` pairs in [`Channel::STATS`] order.
    pub fn iter(&self) -> impl Iterator<Item = (Channel, &Stat)> {
        Channel::STATS.iter().copied().zip(self.stats.iter())
    }
}

/// Compute min, max and mean of the transformed summary channels.
///
/// D1, D2 and the timing channels are not summarised. An empty row set gives
/// all-zero statistics.
pub fn calc_stats(rows: &[ParticleEvent]) -> ChannelStats {
    if rows.is_empty() {
        return ChannelStats::default();
    }

    let mut out = [Stat::default(); Channel::STATS.len()];
    for (stat, channel) in out.iter_mut().zip(Channel::STATS) {
        let mut lo = u16::MAX;
        let mut hi = u16::MIN;
        let mut sum = 0.0;
        for row in rows {
            let raw = row.get(channel);
            lo = lo.min(raw);
            hi = hi.max(raw);
            sum += transform(f64::from(raw));
        }
        // transform is monotonic, so extremes can be taken on raw counts
        *stat = Stat {
            min: transform(f64::from(lo)),
            max: transform(f64::from(hi)),
            mean: sum / rows.len() as f64,
        };
    }
    ChannelStats::from_array(out)
}
