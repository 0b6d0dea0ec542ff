use std::time::{Duration, Instant, SystemTime};

/// Liveness of one consumer session.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    pub last_beat: Instant,
    /// Wall-clock mirror of `last_beat`, kept for the membership snapshot.
    pub last_beat_wall: SystemTime,
    pub timeout: Duration,
}

impl Heartbeat {
    pub fn new(timeout: Duration, now: Instant) -> Self {
        Heartbeat {
            last_beat: now,
            last_beat_wall: SystemTime::now(),
            timeout,
        }
    }

    pub fn beat(&mut self, now: Instant) {
        self.last_beat = now;
        self.last_beat_wall = SystemTime::now();
    }

    pub fn deadline(&self) -> Instant {
        self.last_beat + self.timeout
    }

    pub fn check_timeout(&self, now: Instant) -> bool {
        now > self.deadline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_timeout() {
        let start = Instant::now();
        let heartbeat = Heartbeat::new(Duration::from_millis(100), start);
        assert!(heartbeat.check_timeout(start + Duration::from_millis(150)));
    }

    #[test]
    fn test_heartbeat_within_timeout() {
        let start = Instant::now();
        let heartbeat = Heartbeat::new(Duration::from_millis(100), start);
        assert!(!heartbeat.check_timeout(start + Duration::from_millis(50)));
    }

    #[test]
    fn test_beat_extends_deadline() {
        let start = Instant::now();
        let mut heartbeat = Heartbeat::new(Duration::from_millis(100), start);
        heartbeat.beat(start + Duration::from_millis(80));
        assert!(!heartbeat.check_timeout(start + Duration::from_millis(150)));
        assert_eq!(heartbeat.deadline(), start + Duration::from_millis(180));
    }
}
