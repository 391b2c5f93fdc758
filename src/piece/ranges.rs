use std::ops::Range;

/// Sorted, non-overlapping, non-adjacent set of byte ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<Range<u32>>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `range` and returns the parts of it that were not already present.
    pub fn insert(&mut self, range: Range<u32>) -> Vec<Range<u32>> {
        if range.is_empty() {
            return Vec::new();
        }

        let mut fresh = Vec::new();
        let mut cursor = range.start;
        for existing in &self.ranges {
            if existing.end <= cursor {
                continue;
            }
            if existing.start >= range.end {
                break;
            }
            if existing.start > cursor {
                fresh.push(cursor..existing.start);
            }
            cursor = cursor.max(existing.end);
            if cursor >= range.end {
                break;
            }
        }
        if cursor < range.end {
            fresh.push(cursor..range.end);
        }

        if !fresh.is_empty() {
            self.merge(range);
        }
        fresh
    }

    fn merge(&mut self, range: Range<u32>) {
        // First range that ends at or after the new start (touching counts).
        let first = self.ranges.partition_point(|r| r.end < range.start);
        // First range that starts strictly after the new end.
        let last = self.ranges.partition_point(|r| r.start <= range.end);

        let mut merged = range;
        if first < last {
            merged.start = merged.start.min(self.ranges[first].start);
            merged.end = merged.end.max(self.ranges[last - 1].end);
        }
        self.ranges.splice(first..last, std::iter::once(merged));
    }

    /// True if every byte of `range` is present.
    pub fn covers(&self, range: &Range<u32>) -> bool {
        if range.is_empty() {
            return true;
        }
        self.ranges
            .iter()
            .any(|r| r.start <= range.start && r.end >= range.end)
    }

    /// First gap inside `bounds`, truncated to at most `max_len` bytes.
    pub fn first_gap(&self, bounds: Range<u32>, max_len: u32) -> Option<Range<u32>> {
        let mut cursor = bounds.start;
        for r in &self.ranges {
            if r.end <= cursor {
                continue;
            }
            if r.start > cursor {
                break;
            }
            cursor = r.end;
        }
        if cursor >= bounds.end || max_len == 0 {
            return None;
        }
        let gap_end = self
            .ranges
            .iter()
            .find(|r| r.start > cursor)
            .map_or(bounds.end, |r| r.start.min(bounds.end));
        Some(cursor..gap_end.min(cursor.saturating_add(max_len)))
    }

    pub fn covered_len(&self) -> u64 {
        self.ranges.iter().map(|r| (r.end - r.start) as u64).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range<u32>> {
        self.ranges.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}
