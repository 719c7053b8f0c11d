//! EVT particle data: channel schema, row type, and the loaded file.
//!
//! A SeaFlow EVT file holds one row per detected particle. Every row carries
//! the same ten 16-bit channels in a fixed order; `Channel` is the explicit
//! enumeration used to index them.

pub mod codec;
pub mod file_id;
pub mod transform;

pub use codec::{decode, decode_file, encode, encode_gz, read_row_count, write_file};
pub use file_id::{expand_file_list, find_evt_files, SeaflowFile};
pub use transform::{transform, EventTable};

/// Number of data channels in one particle row.
pub const CHANNEL_COUNT: usize = 10;

/// Reserved leading words written in front of every newly built row.
pub const DEFAULT_ROW_PREFIX: [u16; 2] = [CHANNEL_COUNT as u16, 0];

/// A named channel of a particle row, in on-disk order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// Acquisition time counter
    Time,
    /// Pulse width
    PulseWidth,
    /// Focused-beam detector 1
    D1,
    /// Focused-beam detector 2
    D2,
    /// Forward scatter, small particle detector
    FscSmall,
    /// Forward scatter, perpendicular polarization
    FscPerp,
    /// Forward scatter, large particle detector
    FscBig,
    /// Phycoerythrin fluorescence
    Pe,
    /// Chlorophyll fluorescence, small
    ChlSmall,
    /// Chlorophyll fluorescence, large
    ChlBig,
}

impl Channel {
    /// All channels in on-disk order.
    pub const ALL: [Channel; CHANNEL_COUNT] = [
        Channel::Time,
        Channel::PulseWidth,
        Channel::D1,
        Channel::D2,
        Channel::FscSmall,
        Channel::FscPerp,
        Channel::FscBig,
        Channel::Pe,
        Channel::ChlSmall,
        Channel::ChlBig,
    ];

    /// Channels summarised in the `opp` table.
    pub const STATS: [Channel; 6] = [
        Channel::FscSmall,
        Channel::FscPerp,
        Channel::FscBig,
        Channel::Pe,
        Channel::ChlSmall,
        Channel::ChlBig,
    ];

    /// Position of this channel within a row.
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Column name used in files and in the database.
    pub const fn name(self) -> &'static str {
        match self {
            Channel::Time => "time",
            Channel::PulseWidth => "pulse_width",
            Channel::D1 => "D1",
            Channel::D2 => "D2",
            Channel::FscSmall => "fsc_small",
            Channel::FscPerp => "fsc_perp",
            Channel::FscBig => "fsc_big",
            Channel::Pe => "pe",
            Channel::ChlSmall => "chl_small",
            Channel::ChlBig => "chl_big",
        }
    }

    /// Timing channels stay on the raw integer scale.
    pub const fn is_timing(self) -> bool {
        matches!(self, Channel::Time | Channel::PulseWidth)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One particle: ten raw digitizer channels plus the reserved row prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParticleEvent {
    prefix: [u16; 2],
    values: [u16; CHANNEL_COUNT],
}

impl ParticleEvent {
    /// Build a row with the default reserved prefix.
    pub fn new(values: [u16; CHANNEL_COUNT]) -> Self {
        Self {
            prefix: DEFAULT_ROW_PREFIX,
            values,
        }
    }

    /// Build a row with an explicit reserved prefix, as read from disk.
    pub fn with_prefix(prefix: [u16; 2], values: [u16; CHANNEL_COUNT]) -> Self {
        Self { prefix, values }
    }

    /// Raw value of one channel.
    #[inline]
    pub fn get(&self, channel: Channel) -> u16 {
        self.values[channel.index()]
    }

    /// Overwrite one channel.
    pub fn set(&mut self, channel: Channel, value: u16) {
        self.values[channel.index()] = value;
    }

    /// All channel values in on-disk order.
    pub fn values(&self) -> &[u16; CHANNEL_COUNT] {
        &self.values
    }

    /// Reserved leading words.
    pub fn prefix(&self) -> [u16; 2] {
        self.prefix
    }
}

/// A decoded EVT or OPP file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticleFile {
    header_count: u32,
    events: Vec<ParticleEvent>,
}

impl ParticleFile {
    /// Wrap an in-memory row set; the header count is the row count.
    ///
    /// Row counts beyond `u32::MAX` cannot be represented in the header and
    /// saturate.
    pub fn from_events(events: Vec<ParticleEvent>) -> Self {
        let header_count = u32::try_from(events.len()).unwrap_or(u32::MAX);
        Self {
            header_count,
            events,
        }
    }

    /// Row count declared in the file header.
    pub fn header_count(&self) -> u32 {
        self.header_count
    }

    /// Number of rows present.
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Whether the file holds no rows.
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Rows in file order.
    pub fn events(&self) -> &[ParticleEvent] {
        &self.events
    }

    /// Take ownership of the rows.
    pub fn into_events(self) -> Vec<ParticleEvent> {
        self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_order_matches_layout() {
        for (i, channel) in Channel::ALL.iter().enumerate() {
            assert_eq!(channel.index(), i);
        }
        assert_eq!(Channel::FscSmall.name(), "fsc_small");
        assert!(Channel::Time.is_timing());
        assert!(Channel::PulseWidth.is_timing());
        assert!(!Channel::D1.is_timing());
    }

    #[test]
    fn test_stats_channels_exclude_gating_inputs() {
        assert!(!Channel::STATS.contains(&Channel::D1));
        assert!(!Channel::STATS.contains(&Channel::D2));
        assert!(!Channel::STATS.iter().any(|c| c.is_timing()));
    }

    #[test]
    fn test_event_accessors() {
        let mut ev = ParticleEvent::new([0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(ev.get(Channel::D2), 3);
        assert_eq!(ev.prefix(), [10, 0]);
        ev.set(Channel::Pe, 700);
        assert_eq!(ev.get(Channel::Pe), 700);
    }

    #[test]
    fn test_file_header_tracks_rows() {
        let file = ParticleFile::from_events(vec![ParticleEvent::new([1; CHANNEL_COUNT]); 3]);
        assert_eq!(file.header_count(), 3);
        assert_eq!(file.len(), 3);
        assert!(!file.is_empty());
    }
}
