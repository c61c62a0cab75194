/// A moment both players acted together closely enough to count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncEvent {
    pub window: i64,
    pub skew_ms: i64,
}

/// Per-game-type rule for deciding when two players are "in sync".
pub trait SyncStrategy: Send {
    /// Feeds one action of `player` (0 or 1) stamped with authoritative time.
    fn observe(&mut self, player: usize, timestamp_ms: i64) -> Option<SyncEvent>;
}

/// In sync when the latest actions of both players fall in the same window
/// and lie no more than `tolerance_ms` apart. Each window fires at most once.
pub struct TimestampDeltaStrategy {
    origin_ms: i64,
    window_ms: i64,
    tolerance_ms: i64,
    latest: [Option<i64>; 2],
    last_fired_window: Option<i64>,
}

impl TimestampDeltaStrategy {
    pub fn new(origin_ms: i64, window_ms: u64, tolerance_ms: u64) -> Self {
        Self {
            origin_ms,
            window_ms: window_ms.max(1) as i64,
            tolerance_ms: tolerance_ms as i64,
            latest: [None, None],
            last_fired_window: None,
        }
    }

    fn window_of(&self, timestamp_ms: i64) -> i64 {
        (timestamp_ms - self.origin_ms).div_euclid(self.window_ms)
    }
}

impl SyncStrategy for TimestampDeltaStrategy {
    fn observe(&mut self, player: usize, timestamp_ms: i64) -> Option<SyncEvent> {
        *self.latest.get_mut(player)? = Some(timestamp_ms);

        let [Some(a), Some(b)] = self.latest else {
            return None;
        };
        let window = self.window_of(a);
        if window != self.window_of(b) || self.last_fired_window == Some(window) {
            return None;
        }

        let skew_ms = (a - b).abs();
        if skew_ms > self.tolerance_ms {
            return None;
        }
        self.last_fired_window = Some(window);
        Some(SyncEvent { window, skew_ms })
    }
}
