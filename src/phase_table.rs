/// Half-step phase table for a bipolar stepper on a 4-input H-bridge.
///
/// Row `i` holds the level of IN1..IN4. Adjacent rows differ by exactly one
/// coil transition and row 7 wraps back to row 0.
pub const PHASE_TABLE: [[bool; 4]; PHASE_COUNT] = [
    [true, false, false, false],
    [true, true, false, false],
    [false, true, false, false],
    [false, true, true, false],
    [false, false, true, false],
    [false, false, true, true],
    [false, false, false, true],
    [true, false, false, true],
];

pub const PHASE_COUNT: usize = 8;

/// Row index into [`PHASE_TABLE`], always in `0..8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PhaseIndex(u8);

impl PhaseIndex {
    /// Reduces any persisted value into range, negative values included.
    pub fn from_raw(raw: i64) -> Self {
        Self(raw.rem_euclid(PHASE_COUNT as i64) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn next(self) -> Self {
        Self((self.0 + 1) % PHASE_COUNT as u8)
    }

    pub fn prev(self) -> Self {
        Self((self.0 + PHASE_COUNT as u8 - 1) % PHASE_COUNT as u8)
    }

    pub fn pattern(self) -> &'static [bool; 4] {
        &PHASE_TABLE[self.0 as usize]
    }
}

impl From<PhaseIndex> for i64 {
    fn from(idx: PhaseIndex) -> i64 {
        idx.0 as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjacent_rows_differ_by_one_coil() {
        for i in 0..PHASE_COUNT {
            let a = PHASE_TABLE[i];
            let b = PHASE_TABLE[(i + 1) % PHASE_COUNT];
            let changed = a.iter().zip(b.iter()).filter(|(x, y)| x != y).count();
            assert_eq!(changed, 1, "rows {} and {} differ by {}", i, (i + 1) % PHASE_COUNT, changed);
        }
    }

    #[test]
    fn from_raw_wraps_into_range() {
        assert_eq!(PhaseIndex::from_raw(8).value(), 0);
        assert_eq!(PhaseIndex::from_raw(-1).value(), 7);
        assert_eq!(PhaseIndex::from_raw(13).value(), 5);
    }

    #[test]
    fn next_and_prev_wrap() {
        let zero = PhaseIndex::default();
        assert_eq!(zero.prev().value(), 7);
        assert_eq!(zero.prev().next(), zero);
        assert_eq!(PhaseIndex::from_raw(7).next().value(), 0);
    }
}
