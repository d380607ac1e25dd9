//! Size classes shared by the byte-buffer pool and the block allocator
//!
//! A request is placed in the smallest configured class whose capacity
//! covers it. Each class owns one free list in each pool.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Discrete size bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeClass {
    Small,
    Medium,
    Large,
    Huge,
}

impl SizeClass {
    /// All classes, smallest first
    pub const ALL: [SizeClass; 4] = [
        SizeClass::Small,
        SizeClass::Medium,
        SizeClass::Large,
        SizeClass::Huge,
    ];

    /// Dense index for per-class arrays
    #[inline(always)]
    pub const fn index(self) -> usize {
        match self {
            SizeClass::Small => 0,
            SizeClass::Medium => 1,
            SizeClass::Large => 2,
            SizeClass::Huge => 3,
        }
    }

    /// Stable lowercase name
    pub const fn name(self) -> &'static str {
        match self {
            SizeClass::Small => "small",
            SizeClass::Medium => "medium",
            SizeClass::Large => "large",
            SizeClass::Huge => "huge",
        }
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Byte thresholds per class
///
/// A `None` entry removes the class from the table. Requests above the
/// largest configured class land in that class with a region sized to
/// the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeClassTable {
    capacities: [Option<usize>; 4],
}

impl SizeClassTable {
    pub const DEFAULT_SMALL: usize = 512;
    pub const DEFAULT_MEDIUM: usize = 4 * 1024;
    pub const DEFAULT_LARGE: usize = 64 * 1024;
    pub const DEFAULT_HUGE: usize = 1024 * 1024;

    /// Build a table with all four classes
    pub fn new(small: usize, medium: usize, large: usize, huge: usize) -> Self {
        Self {
            capacities: [Some(small), Some(medium), Some(large), Some(huge)],
        }
    }

    /// Build a table from an explicit subset of classes
    ///
    /// Entries must grow with the class order; out-of-order or zero
    /// thresholds are rejected.
    pub fn from_classes(classes: &[(SizeClass, usize)]) -> crate::Result<Self> {
        let mut capacities = [None; 4];
        for &(class, bytes) in classes {
            if bytes == 0 {
                return Err(crate::SubstrateError::InvalidArgument(format!(
                    "size class {} has zero capacity",
                    class
                )));
            }
            capacities[class.index()] = Some(bytes);
        }

        let mut last = 0usize;
        for cap in capacities.iter().flatten() {
            if *cap <= last {
                return Err(crate::SubstrateError::InvalidArgument(
                    "size class thresholds must increase with class order".to_string(),
                ));
            }
            last = *cap;
        }
        if last == 0 {
            return Err(crate::SubstrateError::InvalidArgument(
                "size class table is empty".to_string(),
            ));
        }

        Ok(Self { capacities })
    }

    /// Capacity of a class, or `None` if not configured
    #[inline]
    pub fn capacity(&self, class: SizeClass) -> Option<usize> {
        self.capacities[class.index()]
    }

    /// Replace one threshold
    pub fn set_capacity(&mut self, class: SizeClass, bytes: usize) {
        self.capacities[class.index()] = Some(bytes);
    }

    /// Configured classes, smallest first
    pub fn classes(&self) -> impl Iterator<Item = SizeClass> + '_ {
        SizeClass::ALL
            .into_iter()
            .filter(move |c| self.capacities[c.index()].is_some())
    }

    /// Largest configured class
    pub fn largest(&self) -> SizeClass {
        self.classes().last().unwrap_or(SizeClass::Huge)
    }

    /// Smallest class whose capacity covers `size`
    #[inline]
    pub fn classify(&self, size: usize) -> SizeClass {
        for class in SizeClass::ALL {
            if let Some(cap) = self.capacities[class.index()] {
                if size <= cap {
                    return class;
                }
            }
        }
        self.largest()
    }

    /// Bytes to reserve for a request of `size` in `class`
    ///
    /// Never smaller than the class floor, never smaller than the request.
    #[inline]
    pub fn region_size(&self, class: SizeClass, size: usize) -> usize {
        self.capacity(class).unwrap_or(size).max(size)
    }
}

impl Default for SizeClassTable {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_SMALL,
            Self::DEFAULT_MEDIUM,
            Self::DEFAULT_LARGE,
            Self::DEFAULT_HUGE,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_classify() {
        let table = SizeClassTable::default();
        assert_eq!(table.classify(1), SizeClass::Small);
        assert_eq!(table.classify(512), SizeClass::Small);
        assert_eq!(table.classify(513), SizeClass::Medium);
        assert_eq!(table.classify(4096), SizeClass::Medium);
        assert_eq!(table.classify(65_536), SizeClass::Large);
        assert_eq!(table.classify(65_537), SizeClass::Huge);
        assert_eq!(table.classify(10 * 1024 * 1024), SizeClass::Huge);
    }

    #[test]
    fn test_region_size_covers_request() {
        let table = SizeClassTable::default();
        assert_eq!(table.region_size(SizeClass::Small, 300), 512);
        let big = 3 * 1024 * 1024;
        assert_eq!(table.region_size(SizeClass::Huge, big), big);
    }

    #[test]
    fn test_partial_table() {
        let table = SizeClassTable::from_classes(&[
            (SizeClass::Small, 512),
            (SizeClass::Medium, 4096),
        ])
        .unwrap();

        assert_eq!(table.classify(300), SizeClass::Small);
        assert_eq!(table.classify(5000), SizeClass::Medium);
        assert_eq!(table.region_size(SizeClass::Medium, 5000), 5000);
        assert_eq!(table.largest(), SizeClass::Medium);
        assert_eq!(table.classes().count(), 2);
    }

    #[test]
    fn test_rejects_unordered_table() {
        let result = SizeClassTable::from_classes(&[
            (SizeClass::Small, 4096),
            (SizeClass::Medium, 512),
        ]);
        assert!(result.is_err());
        assert!(SizeClassTable::from_classes(&[]).is_err());
    }
}
