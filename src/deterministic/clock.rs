//! Logical clock backing deterministic timestamps and ids.

use crate::types::Timestamp;

/// Monotonic counter. Each tick yields a unique sequence number.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogicalClock {
    next: u64,
}

impl LogicalClock {
    pub fn starting_at(next: u64) -> Self {
        Self { next }
    }

    /// Sequence number that the next tick returns.
    pub fn peek(&self) -> u64 {
        self.next
    }

    pub fn tick(&mut self) -> u64 {
        let current = self.next;
        self.next += 1;
        current
    }
}

/// One millisecond past the epoch per sequence number.
pub fn timestamp_for(sequence: u64) -> Timestamp {
    Timestamp(sequence as i64 * 1_000)
}

/// UUIDv7-shaped id derived from a sequence number.
pub fn uuid_for(sequence: u64) -> String {
    format!("01920000-0000-7000-8000-{:012x}", sequence)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_is_monotonic() {
        let mut clock = LogicalClock::starting_at(5);
        assert_eq!(clock.tick(), 5);
        assert_eq!(clock.tick(), 6);
        assert_eq!(clock.peek(), 7);
    }

    #[test]
    fn test_derived_values() {
        assert_eq!(timestamp_for(3), Timestamp(3_000));
        assert_eq!(uuid_for(255), "01920000-0000-7000-8000-0000000000ff");
    }
}
