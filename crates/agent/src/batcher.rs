//! Adaptive output batching for streamed completions.
//!
//! Fragments from a live stream arrive at irregular intervals: a fast local
//! model may push thousands of characters per second, a slow remote one a few
//! tokens at a time. [`AdaptiveBatcher`] coalesces fragments into batches and
//! picks the flush interval and batch size from a smoothed throughput
//! estimate, so fast streams are not throttled and slow ones do not flood the
//! consumer with single-character updates.

use codeloop_config::{BatchingConfig, ThroughputBand};
use codeloop_core::{ChunkReceiver, ProviderError};
use futures::Stream;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Flush parameters in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchParams {
    pub interval: Duration,
    pub max_chars: usize,
}

impl From<&ThroughputBand> for BatchParams {
    fn from(band: &ThroughputBand) -> Self {
        Self {
            interval: band.interval(),
            max_chars: band.max_chars,
        }
    }
}

/// Exponential moving average of stream throughput, mapped onto bands.
#[derive(Debug, Clone)]
pub struct ThroughputTracker {
    smoothing: f64,
    bands: Vec<ThroughputBand>,
    hysteresis: Duration,
    hysteresis_chars: usize,
    ema: Option<f64>,
    last_arrival: Option<Instant>,
    current: BatchParams,
}

impl ThroughputTracker {
    /// Start in the slowest band until throughput has been observed.
    pub fn new(config: &BatchingConfig) -> Self {
        let current = config
            .bands
            .last()
            .map(BatchParams::from)
            .unwrap_or(BatchParams {
                interval: Duration::from_millis(300),
                max_chars: 800,
            });

        Self {
            smoothing: config.smoothing,
            bands: config.bands.clone(),
            hysteresis: Duration::from_millis(config.hysteresis_ms),
            hysteresis_chars: config.hysteresis_chars,
            ema: None,
            last_arrival: None,
            current,
        }
    }

    /// Record a fragment of `chars` characters arriving at `at`.
    pub fn observe(&mut self, chars: usize, at: Instant) -> BatchParams {
        if let Some(previous) = self.last_arrival {
            // Same-instant arrivals count as one millisecond apart
            let secs = at
                .saturating_duration_since(previous)
                .max(Duration::from_millis(1))
                .as_secs_f64();
            let cps = chars as f64 / secs;

            let ema = match self.ema {
                Some(old) => self.smoothing * cps + (1.0 - self.smoothing) * old,
                None => cps,
            };
            self.ema = Some(ema);

            if let Some(candidate) = self.band_for(ema)
                && self.exceeds_hysteresis(candidate)
            {
                trace!(
                    cps = ema,
                    interval_ms = candidate.interval.as_millis() as u64,
                    max_chars = candidate.max_chars,
                    "Batch parameters changed"
                );
                self.current = candidate;
            }
        }

        self.last_arrival = Some(at);
        self.current
    }

    /// Current flush parameters.
    pub fn params(&self) -> BatchParams {
        self.current
    }

    /// Smoothed characters per second, once two fragments have arrived.
    pub fn throughput(&self) -> Option<f64> {
        self.ema
    }

    fn band_for(&self, cps: f64) -> Option<BatchParams> {
        self.bands
            .iter()
            .find(|band| cps > band.min_cps)
            .or(self.bands.last())
            .map(BatchParams::from)
    }

    fn exceeds_hysteresis(&self, candidate: BatchParams) -> bool {
        let interval_delta = if candidate.interval > self.current.interval {
            candidate.interval - self.current.interval
        } else {
            self.current.interval - candidate.interval
        };
        interval_delta > self.hysteresis
            || candidate.max_chars.abs_diff(self.current.max_chars) > self.hysteresis_chars
    }
}

enum Wake {
    Cancelled,
    Tick,
    Chunk(Option<Result<codeloop_core::StreamChunk, ProviderError>>),
}

/// Coalesces a chunk stream into batches. One instance per streaming call.
pub struct AdaptiveBatcher {
    source: ChunkReceiver,
    cancel: CancellationToken,
    tracker: ThroughputTracker,
    buffer: String,
    /// `buffer` length in chars, compared against the band's `max_chars`
    buffered_chars: usize,
    last_flush: Instant,
    source_done: bool,
    finished: bool,
}

impl AdaptiveBatcher {
    pub fn new(source: ChunkReceiver, config: &BatchingConfig, cancel: CancellationToken) -> Self {
        Self {
            source,
            cancel,
            tracker: ThroughputTracker::new(config),
            buffer: String::new(),
            buffered_chars: 0,
            last_flush: Instant::now(),
            source_done: false,
            finished: false,
        }
    }

    /// The next batch, or `None` once the source ends or the token is cancelled.
    ///
    /// A stream error ends the batcher after being yielded once.
    pub async fn next_batch(&mut self) -> Option<Result<String, ProviderError>> {
        loop {
            if self.finished {
                return None;
            }
            if self.cancel.is_cancelled() {
                self.finish();
                return None;
            }
            if self.source_done {
                self.finished = true;
                return (!self.buffer.is_empty()).then(|| Ok(self.flush()));
            }

            let params = self.tracker.params();
            if self.buffered_chars >= params.max_chars {
                return Some(Ok(self.flush()));
            }

            let deadline = self.last_flush + params.interval;
            let has_pending = !self.buffer.is_empty();

            let wake = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Wake::Cancelled,
                _ = tokio::time::sleep_until(deadline), if has_pending => Wake::Tick,
                chunk = self.source.recv() => Wake::Chunk(chunk),
            };

            match wake {
                Wake::Cancelled => {
                    self.finish();
                    return None;
                }
                Wake::Tick => return Some(Ok(self.flush())),
                Wake::Chunk(Some(Ok(chunk))) => {
                    if let Some(text) = chunk.content.filter(|t| !t.is_empty()) {
                        let chars = text.chars().count();
                        self.tracker.observe(chars, Instant::now());
                        self.buffer.push_str(&text);
                        self.buffered_chars += chars;
                    }
                    if chunk.done {
                        self.source_done = true;
                    }
                }
                Wake::Chunk(Some(Err(e))) => {
                    self.finish();
                    return Some(Err(e));
                }
                Wake::Chunk(None) => self.source_done = true,
            }
        }
    }

    /// Adapt into a `Stream` of batches.
    pub fn into_stream(self) -> impl Stream<Item = Result<String, ProviderError>> {
        futures::stream::unfold(self, |mut batcher| async move {
            batcher.next_batch().await.map(|item| (item, batcher))
        })
    }

    /// Parameters currently in effect.
    pub fn params(&self) -> BatchParams {
        self.tracker.params()
    }

    fn flush(&mut self) -> String {
        self.last_flush = Instant::now();
        self.buffered_chars = 0;
        std::mem::take(&mut self.buffer)
    }

    fn finish(&mut self) {
        self.finished = true;
        self.buffer.clear();
        self.buffered_chars = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codeloop_core::StreamChunk;
    use futures::StreamExt;
    use tokio::sync::mpsc;

    fn channel() -> (mpsc::Sender<Result<StreamChunk, ProviderError>>, ChunkReceiver) {
        mpsc::channel(64)
    }

    #[test]
    fn tracker_starts_in_slowest_band() {
        let tracker = ThroughputTracker::new(&BatchingConfig::default());
        assert_eq!(tracker.params().interval, Duration::from_millis(300));
        assert_eq!(tracker.params().max_chars, 800);
        assert!(tracker.throughput().is_none());
    }

    #[test]
    fn fast_stream_moves_to_fast_band() {
        let mut tracker = ThroughputTracker::new(&BatchingConfig::default());
        let start = Instant::now();
        tracker.observe(10, start);
        // 500 chars in 100ms = 5000 cps
        let params = tracker.observe(500, start + Duration::from_millis(100));
        assert_eq!(params.interval, Duration::from_millis(50));
        assert_eq!(params.max_chars, 150);
        assert!((tracker.throughput().unwrap() - 5000.0).abs() < 1e-6);
    }

    #[test]
    fn ema_smooths_new_samples() {
        let mut tracker = ThroughputTracker::new(&BatchingConfig::default());
        let start = Instant::now();
        tracker.observe(1, start);
        tracker.observe(100, start + Duration::from_secs(1)); // 100 cps
        tracker.observe(200, start + Duration::from_secs(2)); // 200 cps
        // 0.3 * 200 + 0.7 * 100
        assert!((tracker.throughput().unwrap() - 130.0).abs() < 1e-6);
        assert_eq!(tracker.params().interval, Duration::from_millis(200));
    }

    #[test]
    fn small_band_changes_are_ignored() {
        let config = BatchingConfig {
            bands: vec![
                ThroughputBand {
                    min_cps: 100.0,
                    interval_ms: 290,
                    max_chars: 780,
                },
                ThroughputBand {
                    min_cps: 0.0,
                    interval_ms: 300,
                    max_chars: 800,
                },
            ],
            ..BatchingConfig::default()
        };
        let mut tracker = ThroughputTracker::new(&config);
        let start = Instant::now();
        tracker.observe(1, start);
        let params = tracker.observe(1000, start + Duration::from_secs(1));
        assert_eq!(params.interval, Duration::from_millis(300));
        assert_eq!(params.max_chars, 800);
    }

    #[tokio::test(start_paused = true)]
    async fn batches_concatenate_to_input() {
        let (tx, rx) = channel();
        let fragments = ["Hel", "lo", ", ", "wor", "ld", "!"];
        for f in fragments {
            tx.send(Ok(StreamChunk::text(f))).await.unwrap();
        }
        tx.send(Ok(StreamChunk::finished(None))).await.unwrap();
        drop(tx);

        let batcher =
            AdaptiveBatcher::new(rx, &BatchingConfig::default(), CancellationToken::new());
        let batches: Vec<String> = batcher
            .into_stream()
            .map(|b| b.unwrap())
            .collect()
            .await;

        assert!(!batches.is_empty());
        assert_eq!(batches.concat(), fragments.concat());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_fragments_flush_on_interval() {
        let (tx, rx) = channel();
        let mut batcher =
            AdaptiveBatcher::new(rx, &BatchingConfig::default(), CancellationToken::new());

        let start = Instant::now();
        tx.send(Ok(StreamChunk::text("ab"))).await.unwrap();

        let batch = batcher.next_batch().await.unwrap().unwrap();
        assert_eq!(batch, "ab");
        assert!(start.elapsed() >= Duration::from_millis(300));

        drop(tx);
        assert!(batcher.next_batch().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn full_buffer_flushes_immediately() {
        let (tx, rx) = channel();
        let mut batcher =
            AdaptiveBatcher::new(rx, &BatchingConfig::default(), CancellationToken::new());

        let start = Instant::now();
        tx.send(Ok(StreamChunk::text("x".repeat(900)))).await.unwrap();

        let batch = batcher.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.len(), 900);
        assert!(start.elapsed() < Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn size_cap_counts_chars_not_bytes() {
        let (tx, rx) = channel();
        let mut batcher =
            AdaptiveBatcher::new(rx, &BatchingConfig::default(), CancellationToken::new());

        // 500 chars, 1000 bytes: under the 800-char cap
        let start = Instant::now();
        tx.send(Ok(StreamChunk::text("é".repeat(500)))).await.unwrap();

        let batch = batcher.next_batch().await.unwrap().unwrap();
        assert_eq!(batch.chars().count(), 500);
        assert!(start.elapsed() >= Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn source_end_flushes_remainder() {
        let (tx, rx) = channel();
        tx.send(Ok(StreamChunk::text("tail"))).await.unwrap();
        drop(tx);

        let mut batcher =
            AdaptiveBatcher::new(rx, &BatchingConfig::default(), CancellationToken::new());
        assert_eq!(batcher.next_batch().await.unwrap().unwrap(), "tail");
        assert!(batcher.next_batch().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_batcher_yields_nothing() {
        let (tx, rx) = channel();
        tx.send(Ok(StreamChunk::text("never seen"))).await.unwrap();

        let cancel = CancellationToken::new();
        let mut batcher = AdaptiveBatcher::new(rx, &BatchingConfig::default(), cancel.clone());
        cancel.cancel();

        assert!(batcher.next_batch().await.is_none());
        assert!(batcher.next_batch().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stream_error_is_yielded_once() {
        let (tx, rx) = channel();
        tx.send(Err(ProviderError::StreamInterrupted("reset".into())))
            .await
            .unwrap();

        let mut batcher =
            AdaptiveBatcher::new(rx, &BatchingConfig::default(), CancellationToken::new());
        assert!(matches!(
            batcher.next_batch().await,
            Some(Err(ProviderError::StreamInterrupted(_)))
        ));
        assert!(batcher.next_batch().await.is_none());
    }
}
