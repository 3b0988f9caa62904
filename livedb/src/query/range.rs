use std::fmt;

/// An offset/limit window over an ordered result. A `None` limit is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryRange {
    pub offset: u64,
    pub limit: Option<u64>,
}

impl QueryRange {
    pub fn new(offset: u64, limit: u64) -> Self {
        QueryRange {
            offset,
            limit: Some(limit),
        }
    }

    pub fn infinite() -> Self {
        QueryRange {
            offset: 0,
            limit: None,
        }
    }

    /// Unbounded window starting at `offset`.
    pub fn from_offset(offset: u64) -> Self {
        QueryRange {
            offset,
            limit: None,
        }
    }

    pub fn is_infinite(&self) -> bool {
        self.limit.is_none()
    }

    pub fn is_empty(&self) -> bool {
        self.limit == Some(0)
    }

    /// Exclusive end offset, `None` when unbounded.
    pub fn end(&self) -> Option<u64> {
        self.limit.map(|limit| self.offset.saturating_add(limit))
    }

    /// Whether `offset` falls inside this range.
    pub fn includes(&self, offset: u64) -> bool {
        offset >= self.offset && self.end().map_or(true, |end| offset < end)
    }

    /// Whether every offset of `other` falls inside this range.
    pub fn contains(&self, other: &QueryRange) -> bool {
        if other.is_empty() {
            return true;
        }
        if other.offset < self.offset {
            return false;
        }
        match (self.end(), other.end()) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(end), Some(other_end)) => other_end <= end,
        }
    }

    /// Smallest range covering both inputs.
    pub fn union(a: &QueryRange, b: &QueryRange) -> QueryRange {
        let offset = a.offset.min(b.offset);
        let end = match (a.end(), b.end()) {
            (Some(x), Some(y)) => Some(x.max(y)),
            _ => None,
        };
        QueryRange {
            offset,
            limit: end.map(|end| end - offset),
        }
    }

    /// The parts of `desired` not covered by `covered`: zero, one or two ranges,
    /// in ascending offset order.
    pub fn subtract(covered: &QueryRange, desired: &QueryRange) -> Vec<QueryRange> {
        if desired.is_empty() {
            return Vec::new();
        }
        let disjoint = covered.is_empty()
            || covered.end().is_some_and(|end| end <= desired.offset)
            || desired.end().is_some_and(|end| end <= covered.offset);
        if disjoint {
            return vec![*desired];
        }

        let mut missing = Vec::new();
        if desired.offset < covered.offset {
            missing.push(QueryRange::new(desired.offset, covered.offset - desired.offset));
        }
        if let Some(covered_end) = covered.end() {
            match desired.end() {
                Some(desired_end) if desired_end > covered_end => {
                    missing.push(QueryRange::new(covered_end, desired_end - covered_end));
                }
                None => missing.push(QueryRange::from_offset(covered_end)),
                _ => {}
            }
        }
        missing
    }
}

impl fmt::Display for QueryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.limit {
            Some(limit) => write!(f, "QueryRange{{offset: {}, limit: {limit}}}", self.offset),
            None => write!(f, "QueryRange{{offset: {}, limit: inf}}", self.offset),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_subtract_disjoint() {
        let covered = QueryRange::new(0, 10);
        let desired = QueryRange::new(20, 5);
        assert_eq!(QueryRange::subtract(&covered, &desired), vec![desired]);
    }

    #[test]
    fn test_subtract_fully_covered() {
        let covered = QueryRange::new(0, 10);
        assert!(QueryRange::subtract(&covered, &QueryRange::new(2, 5)).is_empty());
        assert!(QueryRange::subtract(&QueryRange::infinite(), &QueryRange::new(200, 5)).is_empty());
    }

    #[test]
    fn test_subtract_one_side() {
        let covered = QueryRange::new(0, 10);
        assert_eq!(
            QueryRange::subtract(&covered, &QueryRange::new(5, 10)),
            vec![QueryRange::new(10, 5)]
        );
        assert_eq!(
            QueryRange::subtract(&QueryRange::new(10, 10), &QueryRange::new(5, 10)),
            vec![QueryRange::new(5, 5)]
        );
    }

    #[test]
    fn test_subtract_both_sides() {
        assert_eq!(
            QueryRange::subtract(&QueryRange::new(10, 5), &QueryRange::new(0, 30)),
            vec![QueryRange::new(0, 10), QueryRange::new(15, 15)]
        );
    }

    #[test]
    fn test_subtract_unbounded_desired() {
        assert_eq!(
            QueryRange::subtract(&QueryRange::new(0, 50), &QueryRange::infinite()),
            vec![QueryRange::from_offset(50)]
        );
    }

    #[test]
    fn test_contains_and_union() {
        let a = QueryRange::new(0, 10);
        assert!(a.contains(&QueryRange::new(3, 7)));
        assert!(!a.contains(&QueryRange::new(3, 8)));
        assert!(!a.contains(&QueryRange::infinite()));
        assert_eq!(QueryRange::union(&a, &QueryRange::new(5, 10)), QueryRange::new(0, 15));
        assert_eq!(QueryRange::union(&a, &QueryRange::from_offset(4)), QueryRange::infinite());
    }

    /// Over a grid of small ranges, the pieces returned never overlap the
    /// covered range, and together with it they cover the desired range.
    #[test]
    fn test_subtract_properties_exhaustive() {
        const MAX: u64 = 12;
        let mut ranges = Vec::new();
        for offset in 0..MAX {
            ranges.push(QueryRange::from_offset(offset));
            for limit in 0..MAX {
                ranges.push(QueryRange::new(offset, limit));
            }
        }
        for covered in &ranges {
            for desired in &ranges {
                let missing = QueryRange::subtract(covered, desired);
                assert!(missing.len() <= 2);
                for piece in &missing {
                    assert!(desired.contains(piece), "{piece} escapes {desired}");
                    for offset in 0..MAX * 3 {
                        assert!(
                            !(piece.includes(offset) && covered.includes(offset) && !covered.is_empty()),
                            "{piece} overlaps {covered} at {offset}"
                        );
                    }
                }
                for offset in 0..MAX * 3 {
                    if desired.includes(offset) && !desired.is_empty() {
                        let hit = (covered.includes(offset) && !covered.is_empty())
                            || missing.iter().any(|p| p.includes(offset));
                        assert!(hit, "offset {offset} of {desired} lost (covered {covered})");
                    }
                }
            }
        }
    }
}
