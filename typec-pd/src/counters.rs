//! Definition of counters, used for retry attempts, and message IDs.

/// Errors that can occur when operating on a counter.
#[non_exhaustive]
#[derive(Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    /// The counter wrapped past its maximum value.
    Exceeded,
}

/// A saturating/wrapping protocol counter with a type-defined maximum.
#[derive(Debug, Clone, Copy)]
pub struct Counter {
    value: u8,
    max_value: u8,
}

/// Types of counters, each with its maximum from the PD specification.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum CounterType {
    /// Busy responses before giving up on an AMS.
    Busy,
    /// Source_Capabilities transmissions over the port's lifetime.
    Caps,
    /// Unacknowledged Source_Capabilities before the partner counts as non-PD.
    CapsNoResponse,
    /// Discover_Identity attempts towards the cable marker.
    DiscoverIdentity,
    /// Hard resets before the partner counts as unresponsive.
    HardReset,
    /// Rolling 3-bit message ID.
    MessageId,
    /// Additional transmissions after a missing GoodCRC.
    Retry,
}

impl Counter {
    /// Create a zeroed counter of the given type.
    pub fn new(counter_type: CounterType) -> Self {
        // See USB PD spec, [Table 6.70], and the Type-C fallback rule for
        // unacknowledged capabilities.
        let max_value = match counter_type {
            CounterType::Busy => 5,
            CounterType::Caps => 50,
            CounterType::CapsNoResponse => 6,
            CounterType::DiscoverIdentity => 20,
            CounterType::HardReset => 3,
            CounterType::MessageId => 7,
            CounterType::Retry => 2,
        };

        Self { value: 0, max_value }
    }

    /// Create a counter of the given type, preloaded with a value.
    pub fn new_from_value(counter_type: CounterType, value: u8) -> Self {
        let mut counter = Self::new(counter_type);
        counter.set(value);
        counter
    }

    /// Set the counter value, wrapping at the maximum.
    pub fn set(&mut self, value: u8) {
        self.value = value % (self.max_value + 1);
    }

    /// The current value.
    pub fn value(&self) -> u8 {
        self.value
    }

    /// The maximum value for this counter's type.
    pub fn max_value(&self) -> u8 {
        self.max_value
    }

    /// Increment, reporting `Error::Exceeded` on wrap-around.
    pub fn increment(&mut self) -> Result<(), Error> {
        self.set(self.value + 1);

        if self.value == 0 { Err(Error::Exceeded) } else { Ok(()) }
    }

    /// Reset to zero.
    pub fn reset(&mut self) {
        self.value = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::{Counter, CounterType};

    #[test]
    fn message_id_wraps_modulo_8() {
        let mut counter = Counter::new(CounterType::MessageId);

        for expected in 1..=7 {
            counter.increment().unwrap();
            assert_eq!(counter.value(), expected);
        }

        // The eighth increment wraps and reports the overrun.
        assert!(counter.increment().is_err());
        assert_eq!(counter.value(), 0);
    }

    #[test]
    fn hard_reset_allows_three_attempts() {
        let mut counter = Counter::new(CounterType::HardReset);

        assert!(counter.increment().is_ok());
        assert!(counter.increment().is_ok());
        assert!(counter.increment().is_ok());
        assert!(counter.increment().is_err());
    }
}
