use std::fmt;

use rand::Rng;

use crate::op::OpKind;

/// Weighted distribution over operation kinds.
///
/// Weights always sum to exactly 100 after [`ProbabilityTable::rescale`],
/// so sampling draws from a fixed integer interval and the last cumulative
/// bucket is never biased by rounding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbabilityTable {
    weights: [u32; OpKind::COUNT],
}

impl ProbabilityTable {
    /// Uniform weight for every kind, rescaled to 100.
    pub fn uniform() -> Self {
        let mut table = ProbabilityTable { weights: [1; OpKind::COUNT] };
        table.rescale();
        table
    }

    /// Build from raw per-kind weights and rescale. The weights must carry
    /// some probability mass.
    pub fn from_weights(weights: [u32; OpKind::COUNT]) -> Self {
        let mut table = ProbabilityTable { weights };
        table.rescale();
        table
    }

    pub fn weight(&self, kind: OpKind) -> u32 {
        self.weights[kind.index()]
    }

    /// Rescale so the weights sum to exactly 100: every weight becomes
    /// `w * 100 / sum`, and the integer-division leftover is added to the
    /// kind at index 0.
    pub fn rescale(&mut self) {
        let sum: u32 = self.weights.iter().sum();
        assert!(sum > 0, "probability table has no mass");
        let mut new_sum = 0;
        for w in &mut self.weights {
            *w = *w * 100 / sum;
            new_sum += *w;
        }
        self.weights[0] += 100 - new_sum;
    }

    /// Replace every weight with a uniform draw from [0, 100), then rescale.
    pub fn randomize<R: Rng>(&mut self, rng: &mut R) {
        loop {
            for w in &mut self.weights {
                *w = rng.gen_range(0..100);
            }
            if self.weights.iter().any(|w| *w > 0) {
                break;
            }
        }
        self.rescale();
    }

    /// Cumulative upper bounds over the kinds in enumeration order; the
    /// last entry's bound is always 100.
    pub fn ranges(&self) -> ProbabilityRanges {
        let mut ranges = Vec::with_capacity(OpKind::COUNT);
        let mut upper = 0;
        for kind in OpKind::ALL {
            upper += self.weights[kind.index()];
            ranges.push((upper, kind));
        }
        ProbabilityRanges(ranges)
    }
}

impl fmt::Display for ProbabilityTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{ ")?;
        for (i, kind) in OpKind::ALL.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:?}: {}", kind.name(), self.weights[kind.index()])?;
        }
        f.write_str(" }")
    }
}

/// A number drawn in [ranges[i-1].0, ranges[i].0) selects ranges[i].1,
/// with a fictitious bound of 0 before the first entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbabilityRanges(Vec<(u32, OpKind)>);

impl ProbabilityRanges {
    /// Draw uniformly from [0, 100) and return the selected kind.
    pub fn sample<R: Rng>(&self, rng: &mut R) -> OpKind {
        let n = rng.gen_range(0..100u32);
        for (upper, kind) in &self.0 {
            if n < *upper {
                return *kind;
            }
        }
        unreachable!("{n} exceeds the cumulative bound of {self}");
    }

    pub fn entries(&self) -> &[(u32, OpKind)] {
        &self.0
    }
}

impl fmt::Display for ProbabilityRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{ ")?;
        let mut prev = 0;
        for (i, (upper, kind)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{:?}: {}\u{2013}{}", kind.name(), prev, upper)?;
            prev = *upper;
        }
        f.write_str(" }")
    }
}

#[cfg(test)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn total(table: &ProbabilityTable) -> u32 {
        OpKind::ALL.iter().map(|k| table.weight(*k)).sum()
    }

    #[test]
    fn rescale_sums_to_exactly_100() {
        let table = ProbabilityTable::uniform();
        assert_eq!(total(&table), 100);
        for kind in OpKind::ALL {
            assert!(table.weight(kind) <= 100);
        }
    }

    #[test]
    fn rescale_adds_leftover_to_first_kind() {
        // 21 kinds at weight 1: each rescales to 100/21 = 4, leaving a
        // leftover of 100 - 84 = 16 on the first kind.
        let table = ProbabilityTable::uniform();
        assert_eq!(table.weight(OpKind::Create), 4 + 16);
        assert_eq!(table.weight(OpKind::Open), 4);
    }

    #[test]
    fn three_way_rescale_leftover() {
        let mut weights = [0; OpKind::COUNT];
        weights[OpKind::Create.index()] = 1;
        weights[OpKind::Open.index()] = 1;
        weights[OpKind::Seek.index()] = 1;
        let table = ProbabilityTable::from_weights(weights);
        // 1*100/3 = 33 each; the leftover of 100 - 99 = 1 goes to the
        // first kind.
        assert_eq!(table.weight(OpKind::Create), 34);
        assert_eq!(table.weight(OpKind::Open), 33);
        assert_eq!(table.weight(OpKind::Seek), 33);
        assert_eq!(total(&table), 100);
        let ranges = table.ranges();
        assert_eq!(&ranges.entries()[..3], &[
            (34, OpKind::Create),
            (67, OpKind::Open),
            (100, OpKind::Seek),
        ]);
        assert_eq!(ranges.entries().last().unwrap().0, 100);
    }

    #[test]
    fn single_kind_always_sampled() {
        let mut weights = [0; OpKind::COUNT];
        weights[OpKind::Mkdir.index()] = 7;
        let table = ProbabilityTable::from_weights(weights);
        assert_eq!(table.weight(OpKind::Mkdir), 100);
        let ranges = table.ranges();
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        for _ in 0..1000 {
            assert_eq!(ranges.sample(&mut rng), OpKind::Mkdir);
        }
    }

    #[test]
    fn randomize_keeps_the_invariant() {
        let mut rng = ChaCha8Rng::seed_from_u64(42);
        for _ in 0..20 {
            let mut table = ProbabilityTable::uniform();
            table.randomize(&mut rng);
            assert_eq!(total(&table), 100);
        }
    }

    #[test]
    fn sampling_respects_the_ranges() {
        let mut weights = [0; OpKind::COUNT];
        weights[OpKind::Create.index()] = 50;
        weights[OpKind::Close.index()] = 50;
        let table = ProbabilityTable::from_weights(weights);
        let ranges = table.ranges();
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut seen_create = 0;
        let mut seen_close = 0;
        for _ in 0..1000 {
            match ranges.sample(&mut rng) {
                OpKind::Create => seen_create += 1,
                OpKind::Close => seen_close += 1,
                other => panic!("sampled zero-weight kind {other}"),
            }
        }
        assert!(seen_create > 400 && seen_close > 400);
    }
}
