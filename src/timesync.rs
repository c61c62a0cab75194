use crate::error::{ServerError, ServerResult};
use crate::messages::{DataCodec, DataMessage, DataMessageType};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Clone, Copy)]
pub struct TimeSyncSettings {
    pub request_timeout: Duration,
    pub batch_interval: Duration,
    pub batch_size: usize,
    /// Samples discarded from each end of a sorted batch
    pub trim: usize,
}

impl Default for TimeSyncSettings {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(2),
            batch_interval: Duration::from_secs(10),
            batch_size: 100,
            trim: 10,
        }
    }
}

/// One completed round trip against the time source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSample {
    pub rtt_ms: i64,
    pub server_time_ms: i64,
    /// Authoritative time at the moment the reply arrived
    pub estimated_time_ms: i64,
    /// `estimated_time_ms` minus the local clock at that moment
    pub offset_ms: i64,
}

pub fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

/// The reply was stamped roughly half a round trip ago.
pub fn estimate_authoritative_time(server_time_ms: i64, rtt_ms: i64) -> i64 {
    server_time_ms + rtt_ms / 2
}

/// Mean of `samples` after dropping the `trim` smallest and largest values.
/// None when trimming would leave nothing.
pub fn trimmed_mean(samples: &mut [i64], trim: usize) -> Option<i64> {
    if samples.len() <= trim * 2 {
        return None;
    }
    samples.sort_unstable();
    let kept = &samples[trim..samples.len() - trim];
    Some(kept.iter().sum::<i64>() / kept.len() as i64)
}

/// Sends one timestamped PING to `source` and waits for the matching PONG.
pub async fn request_once(
    socket: &UdpSocket,
    source: SocketAddr,
    sequence: u64,
    timeout: Duration,
) -> ServerResult<TimeSample> {
    let ping = DataMessage::new(DataMessageType::Ping)
        .with_timestamp(unix_millis())
        .with_sequence(sequence)
        .encode(DataCodec::MsgPack)?;

    let sent_at = Instant::now();
    socket.send_to(&ping, source).await?;

    let pong = tokio::time::timeout(timeout, async {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            let (len, from) = socket.recv_from(&mut buf).await?;
            if from != source {
                continue;
            }
            let (message, _) = DataMessage::decode(&buf[..len])?;
            // Late replies to earlier, timed-out requests are skipped
            if message.kind == DataMessageType::Pong && message.sequence_number == sequence {
                return Ok::<DataMessage, ServerError>(message);
            }
        }
    })
    .await
    .map_err(|_| ServerError::Timeout(timeout.as_millis() as u64))??;

    let rtt_ms = sent_at.elapsed().as_millis() as i64;
    let estimated_time_ms = estimate_authoritative_time(pong.timestamp, rtt_ms);
    Ok(TimeSample {
        rtt_ms,
        server_time_ms: pong.timestamp,
        estimated_time_ms,
        offset_ms: estimated_time_ms - unix_millis(),
    })
}

/// Smoothed estimate of the offset between the local clock and the
/// authoritative time source. Without a source the local clock is taken as
/// authoritative.
pub struct TimeSyncService {
    source: Option<SocketAddr>,
    settings: TimeSyncSettings,
    offset_ms: AtomicI64,
    synced: AtomicBool,
    sequence: AtomicU64,
}

impl TimeSyncService {
    pub fn new(source: Option<SocketAddr>, settings: TimeSyncSettings) -> Self {
        Self {
            source,
            settings,
            offset_ms: AtomicI64::new(0),
            // The local clock is authoritative when there is no source
            synced: AtomicBool::new(source.is_none()),
            sequence: AtomicU64::new(0),
        }
    }

    #[cfg(test)]
    pub fn local() -> Self {
        Self::new(None, TimeSyncSettings::default())
    }

    /// Authoritative time in milliseconds since the epoch.
    pub fn now_ms(&self) -> i64 {
        unix_millis() + self.offset_ms()
    }

    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    /// False until the first batch against a configured source succeeds.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Relaxed)
    }

    /// Draws one batch of round trips and folds it into the offset.
    pub async fn sample_batch(&self, socket: &UdpSocket, source: SocketAddr) -> ServerResult<i64> {
        let mut offsets = Vec::with_capacity(self.settings.batch_size);
        let mut failures = 0usize;

        for _ in 0..self.settings.batch_size {
            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
            match request_once(socket, source, sequence, self.settings.request_timeout).await {
                Ok(sample) => offsets.push(sample.offset_ms),
                Err(e) => {
                    failures += 1;
                    debug!("Time sync request {} failed: {}", sequence, e);
                }
            }
        }

        let offset = trimmed_mean(&mut offsets, self.settings.trim).ok_or_else(|| {
            ServerError::Transport(format!(
                "only {} of {} time samples succeeded",
                self.settings.batch_size - failures,
                self.settings.batch_size
            ))
        })?;

        self.offset_ms.store(offset, Ordering::Relaxed);
        if !self.synced.swap(true, Ordering::Relaxed) {
            info!("Clock synced to {}, offset {} ms", source, offset);
        }
        Ok(offset)
    }

    /// Periodically re-estimates the offset. Does nothing without a source.
    pub fn spawn_sampler(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let source = self.source?;
        let service = Arc::clone(self);

        Some(tokio::spawn(async move {
            let bind = if source.is_ipv4() {
                SocketAddr::from(([0, 0, 0, 0], 0))
            } else {
                SocketAddr::from(([0u16; 8], 0))
            };
            let socket = match UdpSocket::bind(bind).await {
                Ok(socket) => socket,
                Err(e) => {
                    warn!("Time sync disabled, cannot bind socket: {}", e);
                    return;
                }
            };
            info!("Time sync against {} started", source);

            let mut ticker = tokio::time::interval(service.settings.batch_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            result = service.sample_batch(&socket, source) => match result {
                                Ok(offset) => debug!("Clock offset now {} ms", offset),
                                // Retried on the next tick
                                Err(e) => warn!("Time sync batch failed: {}", e),
                            }
                        }
                    }
                }
            }
            debug!("Time sync stopped");
        }))
    }
}
