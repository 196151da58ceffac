use std::time::Duration;

use driplet_proto::StreamMessage;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

/// Fixed-interval liveness ticks for one session. The first tick fires one
/// full interval after creation; late ticks are delayed rather than bunched.
pub struct HeartbeatEmitter {
    ticker: Interval,
    service_id: String,
    user_id: String,
}

impl HeartbeatEmitter {
    pub fn new(period: Duration, service_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let period = period.max(Duration::from_millis(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self {
            ticker,
            service_id: service_id.into(),
            user_id: user_id.into(),
        }
    }

    pub fn period(&self) -> Duration {
        self.ticker.period()
    }

    /// Cancel-safe; resolves with the heartbeat to send for this tick.
    pub async fn tick(&mut self) -> StreamMessage {
        self.ticker.tick().await;
        StreamMessage::heartbeat(self.service_id.as_str(), self.user_id.as_str())
    }
}
