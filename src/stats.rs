use crate::proto::{PeriodicInterruptInfo, PeriodicInterruptStatus};

/// How one acknowledgement was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyBucket {
    /// No interrupt since the previous acknowledgement.
    AlreadyAcknowledged,
    BeforeDeadline,
    /// Acknowledged this many periods after the interrupt it answers.
    PastDeadline { periods_late: u32 },
}

/// Tallies for one periodic session. Each bucket counts acknowledgements.
#[derive(Debug, Clone, Default)]
pub struct AckStats {
    pub already_acknowledged: u32,
    pub before_deadline: u32,
    pub past_deadline: u32,
    pub status: PeriodicInterruptStatus,
}

impl AckStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, bucket: LatencyBucket) {
        match bucket {
            LatencyBucket::AlreadyAcknowledged => self.already_acknowledged += 1,
            LatencyBucket::BeforeDeadline => self.before_deadline += 1,
            LatencyBucket::PastDeadline { .. } => self.past_deadline += 1,
        }
    }

    /// Records a fault that does not end the session.
    pub fn flag(&mut self, status: PeriodicInterruptStatus) {
        self.status |= status;
    }

    pub fn into_info(self, interrupt_count: u32) -> PeriodicInterruptInfo {
        PeriodicInterruptInfo {
            status: self.status,
            interrupt_count,
            already_acknowledged_count: self.already_acknowledged,
            acknowledged_before_deadline_count: self.before_deadline,
            acknowledged_after_deadline_count: self.past_deadline,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_and_flags() {
        let mut stats = AckStats::new();
        stats.record(LatencyBucket::BeforeDeadline);
        stats.record(LatencyBucket::PastDeadline { periods_late: 3 });
        stats.record(LatencyBucket::AlreadyAcknowledged);
        stats.record(LatencyBucket::BeforeDeadline);
        stats.flag(PeriodicInterruptStatus::INCOMPLETE_TRANSMIT);

        let info = stats.into_info(5);
        assert_eq!(info.interrupt_count, 5);
        assert_eq!(info.already_acknowledged_count, 1);
        assert_eq!(info.acknowledged_before_deadline_count, 2);
        assert_eq!(info.acknowledged_after_deadline_count, 1);
        assert_eq!(info.status, PeriodicInterruptStatus::INCOMPLETE_TRANSMIT);
    }
}
