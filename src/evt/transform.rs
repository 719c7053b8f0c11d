//! Conversion from raw digitizer counts to the logarithmic physical scale.
//!
//! SeaFlow detectors have a logarithmic response spanning 3.5 decades over
//! the 16-bit digitizer range, so `transform(0) == 1` and the top count maps
//! to roughly `10^3.5`.

use super::{Channel, ParticleEvent, CHANNEL_COUNT};

const DIGITIZER_RANGE: f64 = 65536.0;
const DECADES: f64 = 3.5;

/// Map a raw channel value onto the physical scale.
#[inline]
pub fn transform(raw: f64) -> f64 {
    10f64.powf((raw / DIGITIZER_RANGE) * DECADES)
}

/// An `f64` copy of a row set, raw or transformed.
#[derive(Debug, Clone, PartialEq)]
pub struct EventTable {
    rows: Vec<[f64; CHANNEL_COUNT]>,
    transformed: bool,
}

impl EventTable {
    /// Copy raw rows onto the `f64` scale without transforming them.
    pub fn from_events(events: &[ParticleEvent]) -> Self {
        let rows = events
            .iter()
            .map(|ev| ev.values().map(f64::from))
            .collect();
        Self {
            rows,
            transformed: false,
        }
    }

    /// Transform every non-timing channel in place.
    ///
    /// Calling this on an already transformed table is a no-op.
    pub fn transform_in_place(&mut self) -> &mut Self {
        if !self.transformed {
            for row in &mut self.rows {
                for channel in Channel::ALL.iter().filter(|c| !c.is_timing()) {
                    let v = &mut row[channel.index()];
                    *v = transform(*v);
                }
            }
            self.transformed = true;
        }
        self
    }

    /// Return a transformed copy, leaving `self` untouched.
    pub fn to_transformed(&self) -> Self {
        let mut copy = self.clone();
        copy.transform_in_place();
        copy
    }

    /// Whether the physical-scale transform has been applied.
    pub fn is_transformed(&self) -> bool {
        self.transformed
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the table holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Value of one channel in one row.
    pub fn value(&self, row: usize, channel: Channel) -> Option<f64> {
        self.rows.get(row).map(|r| r[channel.index()])
    }

    /// Iterate one channel's values in row order.
    pub fn column(&self, channel: Channel) -> impl Iterator<Item = f64> + '_ {
        self.rows.iter().map(move |r| r[channel.index()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transform_reference_points() {
        assert_eq!(transform(0.0), 1.0);
        assert!((transform(56173.714285714275) - 1000.0).abs() < 1e-10);
    }

    #[test]
    fn test_transform_in_place_mutates_and_is_idempotent() {
        let events = vec![ParticleEvent::new([5, 6, 0, 18724, 37449, 0, 0, 0, 0, 0])];
        let mut table = EventTable::from_events(&events);
        let before = table.clone();

        table.transform_in_place();
        assert!(table.is_transformed());
        assert_ne!(table, before);
        // timing channels untouched
        assert_eq!(table.value(0, Channel::Time), Some(5.0));
        assert_eq!(table.value(0, Channel::PulseWidth), Some(6.0));
        assert_eq!(table.value(0, Channel::D1), Some(1.0));

        let once = table.clone();
        table.transform_in_place();
        assert_eq!(table, once);
    }

    #[test]
    fn test_to_transformed_leaves_source() {
        let events = vec![ParticleEvent::new([1, 2, 3, 4, 5, 6, 7, 8, 9, 10]); 4];
        let table = EventTable::from_events(&events);
        let orig = table.clone();
        let copy = table.to_transformed();

        assert_eq!(table, orig);
        assert!(!table.is_transformed());
        assert_ne!(copy, orig);
        assert_eq!(copy.len(), orig.len());
        assert_eq!(copy.column(Channel::Pe).count(), 4);
    }
}
