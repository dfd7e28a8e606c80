use std::time::Duration;
use tokio::time::{Interval, MissedTickBehavior};

/// フラッシュ用の固定レートティッカー
///
/// 描画フレームの代わりに使う。遅れたティックはまとめて撃たずにスキップする。
#[derive(Debug)]
pub struct FlushTicker {
    interval: Interval,
    period: Duration,
}

impl FlushTicker {
    pub fn new(period: Duration) -> Self {
        let period = period.max(Duration::from_millis(1));
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        Self { interval, period }
    }

    pub fn from_millis(period_ms: u64) -> Self {
        Self::new(Duration::from_millis(period_ms))
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }
}
