//! Replica shard clock — time-modulo partitioning of periodic work.
//!
//! Every periodic task computes `minute (or day) mod server_count` and only
//! runs its body when the result equals this replica's `server_id`. This is
//! partitioning, not leader election: mutual exclusion is provided
//! separately by the store task lease.

/// This replica's position in the time-modulo partitioning scheme.
#[derive(Debug, Clone, Copy)]
pub struct ShardClock {
    pub server_id: u32,
    pub server_count: u32,
}

impl ShardClock {
    pub fn new(server_id: u32, server_count: u32) -> Self {
        Self {
            server_id,
            server_count: server_count.max(1),
        }
    }

    /// Whether a minute-keyed task fires on this replica at the given
    /// minute of the hour.
    pub fn fires_at_minute(&self, minute: u32) -> bool {
        minute % self.server_count == self.server_id % self.server_count
    }

    /// Whether a day-keyed task fires on this replica on the given day.
    pub fn fires_at_day(&self, day: u32) -> bool {
        day % self.server_count == self.server_id % self.server_count
    }

    /// Minute of the hour for a Unix timestamp.
    pub fn minute_of(epoch_secs: u64) -> u32 {
        ((epoch_secs / 60) % 60) as u32
    }

    /// Day index for a Unix timestamp.
    pub fn day_of(epoch_secs: u64) -> u32 {
        (epoch_secs / 86_400) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn three_replicas_split_an_hour_evenly() {
        let clock = ShardClock::new(1, 3);
        let fired: Vec<u32> = (0..60).filter(|&m| clock.fires_at_minute(m)).collect();

        // server_id=1 of 3 → minutes 1, 4, 7, … 58: exactly 20 of 60.
        assert_eq!(fired.len(), 20);
        assert_eq!(fired[0], 1);
        assert_eq!(fired[19], 58);
        assert!(fired.iter().all(|m| m % 3 == 1));
    }

    #[test]
    fn every_minute_fires_on_exactly_one_replica() {
        let clocks: Vec<ShardClock> = (0..3).map(|id| ShardClock::new(id, 3)).collect();
        for minute in 0..60 {
            let owners = clocks
                .iter()
                .filter(|c| c.fires_at_minute(minute))
                .count();
            assert_eq!(owners, 1, "minute {minute} fired on {owners} replicas");
        }
    }

    #[test]
    fn single_replica_fires_every_minute() {
        let clock = ShardClock::new(0, 1);
        assert!((0..60).all(|m| clock.fires_at_minute(m)));
    }

    #[test]
    fn zero_server_count_is_clamped() {
        let clock = ShardClock::new(0, 0);
        assert!(clock.fires_at_minute(7));
    }

    #[test]
    fn day_keying() {
        let clock = ShardClock::new(2, 3);
        assert!(clock.fires_at_day(2));
        assert!(clock.fires_at_day(5));
        assert!(!clock.fires_at_day(3));
    }

    #[test]
    fn timestamp_decomposition() {
        // 2021-01-01 00:05:30 UTC.
        let t = 1_609_459_530;
        assert_eq!(ShardClock::minute_of(t), 5);
        assert_eq!(ShardClock::day_of(t), t as u32 / 86_400);
    }
}
