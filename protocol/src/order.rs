use serde::Deserialize;
use serde::Serialize;

/// Total order key for events within one conversation: origin-server
/// microsecond timestamp plus a tie-breaking counter for events that land on
/// the same microsecond. Derived `Ord` compares `time_us` first.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OrderKey {
    pub time_us: i64,
    pub counter: u32,
}

impl OrderKey {
    pub fn new(time_us: i64, counter: u32) -> Self {
        Self { time_us, counter }
    }

    /// The smallest key strictly greater than `self`.
    pub fn successor(self) -> Self {
        match self.counter.checked_add(1) {
            Some(counter) => Self {
                time_us: self.time_us,
                counter,
            },
            None => Self {
                time_us: self.time_us + 1,
                counter: 0,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_by_time_then_counter() {
        let a = OrderKey::new(10, 5);
        let b = OrderKey::new(10, 6);
        let c = OrderKey::new(11, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn successor_is_strictly_greater() {
        let k = OrderKey::new(42, 7);
        assert!(k.successor() > k);

        let saturated = OrderKey::new(42, u32::MAX);
        let next = saturated.successor();
        assert!(next > saturated);
        assert_eq!(next, OrderKey::new(43, 0));
    }
}
