use std::{fmt, num::ParseIntError, ops::RangeInclusive, str::FromStr};

use thiserror::Error;

/// Errors from parsing a [`PortRange`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PortRangeError {
    /// The port, or the start of the range, is not a valid port number.
    #[error("invalid port range: {spec} ({source})")]
    InvalidStart {
        /// The argument as given.
        spec: String,
        /// Why the number didn't parse.
        source: ParseIntError,
    },
    /// The end of the range is not a valid port number.
    #[error("invalid end port: {spec} ({source})")]
    InvalidEnd {
        /// The argument as given.
        spec: String,
        /// Why the number didn't parse.
        source: ParseIntError,
    },
    /// The end of the range is below its start.
    #[error("end port is < start port: {start}-{end}")]
    Reversed {
        /// First port of the range.
        start: u16,
        /// Last port of the range.
        end: u16,
    },
}

/// An inclusive range of TCP ports, written either as `PORT` or `START-END`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    /// Creates a new range. Returns an error if `end` is smaller than `start`.
    pub fn new(start: u16, end: u16) -> Result<Self, PortRangeError> {
        if end < start {
            return Err(PortRangeError::Reversed { start, end });
        }

        Ok(Self { start, end })
    }

    /// A range containing only `port`.
    pub fn single(port: u16) -> Self {
        Self { start: port, end: port }
    }

    /// First port of the range.
    #[inline]
    pub fn start(&self) -> u16 {
        self.start
    }

    /// Last port of the range.
    #[inline]
    pub fn end(&self) -> u16 {
        self.end
    }

    /// Number of ports in the range, bounds included.
    #[inline]
    pub fn len(&self) -> usize {
        usize::from(self.end - self.start) + 1
    }

    /// Always `false`, a range holds at least one port.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Iterates over the ports in ascending order.
    pub fn ports(&self) -> Ports {
        Ports { inner: self.start..=self.end }
    }
}

impl FromStr for PortRange {
    type Err = PortRangeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid_start =
            |source: ParseIntError| PortRangeError::InvalidStart { spec: s.to_string(), source };
        let invalid_end =
            |source: ParseIntError| PortRangeError::InvalidEnd { spec: s.to_string(), source };

        match s.split_once('-') {
            Some((start, end)) => {
                let start = start.parse().map_err(invalid_start)?;
                let end = end.parse().map_err(invalid_end)?;

                Self::new(start, end)
            }
            None => s.parse().map(Self::single).map_err(invalid_start),
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl IntoIterator for PortRange {
    type Item = u16;
    type IntoIter = Ports;

    fn into_iter(self) -> Self::IntoIter {
        self.ports()
    }
}

/// Iterator over the ports of a [`PortRange`].
#[derive(Debug, Clone)]
pub struct Ports {
    inner: RangeInclusive<u16>,
}

impl Iterator for Ports {
    type Item = u16;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

/// Total number of ports across all ranges. Overlapping ranges are counted twice.
pub fn count_ports(ranges: &[PortRange]) -> usize {
    ranges.iter().map(PortRange::len).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_port() {
        let range: PortRange = "9000".parse().unwrap();
        assert_eq!(range.start(), 9000);
        assert_eq!(range.end(), 9000);
        assert_eq!(range.len(), 1);
        assert_eq!(range.to_string(), "9000");
    }

    #[test]
    fn parse_range() {
        let range: PortRange = "9001-9002".parse().unwrap();
        assert_eq!(range.ports().collect::<Vec<_>>(), vec![9001, 9002]);
        assert_eq!(range.to_string(), "9001-9002");
    }

    #[test]
    fn parse_full_range() {
        let range: PortRange = "0-65535".parse().unwrap();
        assert_eq!(range.len(), 65536);
        assert_eq!(range.ports().last(), Some(65535));
    }

    #[test]
    fn parse_rejects_out_of_bounds() {
        assert!(matches!(
            "65536".parse::<PortRange>(),
            Err(PortRangeError::InvalidStart { .. })
        ));
        assert!(matches!(
            "1-70000".parse::<PortRange>(),
            Err(PortRangeError::InvalidEnd { .. })
        ));
    }

    #[test]
    fn parse_rejects_garbage() {
        for spec in ["", "abc", "80x", "-80", "80-", "80-90-100", " 80", "80- 90"] {
            assert!(spec.parse::<PortRange>().is_err(), "{spec:?} should not parse");
        }
    }

    #[test]
    fn parse_rejects_reversed() {
        assert_eq!(
            "9002-9001".parse::<PortRange>(),
            Err(PortRangeError::Reversed { start: 9002, end: 9001 })
        );
    }

    #[test]
    fn count_ports_sums_ranges() {
        let ranges: Vec<PortRange> =
            ["9000", "9001-9002", "10000-10009"].iter().map(|s| s.parse().unwrap()).collect();
        assert_eq!(count_ports(&ranges), 13);
    }
}
