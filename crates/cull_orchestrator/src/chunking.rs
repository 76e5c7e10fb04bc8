//! Byte-budgeted chunking.
//!
//! A point list is split into the fewest parts whose uncompressed VTXC
//! encoding fits the budget. Part sizes differ by at most one and the
//! split depends only on the point count, so replays are deterministic.

use std::ops::Range;

/// Index ranges of each part, in order. An empty input still yields one empty part.
pub fn split_ranges(len: usize, budget: usize, has_z: bool) -> Vec<Range<usize>> {
    let per_part = vtxc::points_for_budget(budget, has_z);
    let parts = len.div_ceil(per_part).max(1);
    let base = len / parts;
    let extra = len % parts;

    let mut out = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let size = base + usize::from(i < extra);
        out.push(start..start + size);
        start += size;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parts_fit_budget_and_are_balanced() {
        let budget = vtxc::encoded_len(100, false);
        let ranges = split_ranges(1_050, budget, false);

        assert_eq!(ranges.len(), 11);
        assert_eq!(ranges.first().map(|r| r.start), Some(0));
        assert_eq!(ranges.last().map(|r| r.end), Some(1_050));
        for w in ranges.windows(2) {
            assert_eq!(w[0].end, w[1].start);
        }

        let sizes: Vec<usize> = ranges.iter().map(|r| r.len()).collect();
        let (min, max) = (sizes.iter().min().unwrap(), sizes.iter().max().unwrap());
        assert!(max - min <= 1);
        assert!(sizes.iter().all(|&s| vtxc::encoded_len(s, false) <= budget));
    }

    #[test]
    fn exact_fit_and_empty_input() {
        let budget = vtxc::encoded_len(10, true);
        assert_eq!(split_ranges(30, budget, true), vec![0..10, 10..20, 20..30]);
        assert_eq!(split_ranges(0, budget, true), vec![0..0]);
        assert_eq!(split_ranges(31, budget, true).len(), 4);
    }
}
