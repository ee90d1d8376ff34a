//! Periodic link-quality sampling for media transports.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::media_engine::{TransportRef, TransportStats};

/// Quality of one transport over the last sampling interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkQuality {
    pub rtt_ms: f64,
    pub jitter_ms: f64,
    /// Lost packets as a share of packets in the interval, 0-100.
    pub loss_percent: f64,
    pub send_kbps: f64,
    /// 0-100, higher is better.
    pub score: u8,
}

impl LinkQuality {
    /// Summarize the interval between two samples of the same transport.
    pub fn from_samples(
        previous: Option<&TransportStats>,
        current: &TransportStats,
        elapsed: Duration,
    ) -> Self {
        let baseline = previous.cloned().unwrap_or_default();
        let sent = current.packets_sent.saturating_sub(baseline.packets_sent);
        let lost = current.packets_lost.saturating_sub(baseline.packets_lost);
        let bytes = current.bytes_sent.saturating_sub(baseline.bytes_sent);

        let loss_percent = match sent + lost {
            0 => 0.0,
            total => lost as f64 * 100.0 / total as f64,
        };
        let secs = elapsed.as_secs_f64();
        let send_kbps = if secs > 0.0 {
            bytes as f64 * 8.0 / 1000.0 / secs
        } else {
            0.0
        };
        let rtt_ms = current.round_trip_time_ms.unwrap_or(0.0);
        let jitter_ms = current.jitter_ms.unwrap_or(0.0);

        Self {
            rtt_ms,
            jitter_ms,
            loss_percent,
            send_kbps,
            score: score(rtt_ms, jitter_ms, loss_percent),
        }
    }
}

/// Weighted 0-100 score: 40 for latency, 20 for jitter, 40 for loss.
fn score(rtt_ms: f64, jitter_ms: f64, loss_percent: f64) -> u8 {
    let latency = match rtt_ms {
        r if r < 150.0 => 40,
        r if r < 300.0 => 30,
        _ => 20,
    };
    let jitter = match jitter_ms {
        j if j < 30.0 => 20,
        j if j < 50.0 => 15,
        _ => 10,
    };
    let loss = match loss_percent {
        l if l < 1.0 => 40,
        l if l < 3.0 => 30,
        l if l < 5.0 => 20,
        _ => 10,
    };
    latency + jitter + loss
}

/// Poll `transport` every `period` and publish the resulting quality.
/// Stops when cancelled or when the transport closes.
pub fn spawn_quality_monitor(
    transport: TransportRef,
    period: Duration,
    cancel: CancellationToken,
    publish: Arc<watch::Sender<Option<LinkQuality>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut previous: Option<(TransportStats, Instant)> = None;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if transport.is_closed() {
                break;
            }

            match transport.stats().await {
                Ok(stats) => {
                    let now = Instant::now();
                    let quality = match &previous {
                        Some((prev, at)) => LinkQuality::from_samples(Some(prev), &stats, now - *at),
                        None => LinkQuality::from_samples(None, &stats, Duration::ZERO),
                    };
                    trace!(target: "meet.metrics", score = quality.score, "Transport quality sampled");
                    publish.send_replace(Some(quality));
                    previous = Some((stats, now));
                }
                Err(e) => debug!(target: "meet.metrics", error = %e, "Stats unavailable"),
            }
        }
    })
}
