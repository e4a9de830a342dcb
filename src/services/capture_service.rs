use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::analysis::record::{CaptureBatch, PacketRecord};
use crate::analysis::PacketRecordBuilder;
use crate::capture::packet::DecodedPacket;
use crate::capture::pcap::PacketSource;
use crate::enrichment::Enricher;
use crate::services::cache::CaptureCache;
use crate::utils::config::Config;
use crate::utils::error::AppError;

/// Extra time granted to a capture past its own timeout before it is abandoned
const CAPTURE_GRACE: Duration = Duration::from_millis(500);

/// Captures, classifies and caches packet batches
pub struct CaptureService {
    source: Arc<dyn PacketSource>,
    builder: Arc<PacketRecordBuilder>,
    enricher: Option<Enricher>,
    cache: CaptureCache,
    /// Serialises recaptures so concurrent stale readers trigger only one
    refresh_lock: tokio::sync::Mutex<()>,
    capture_timeout: Duration,
    cache_max_age: Duration,
    default_count: usize,
    max_count: usize,
}

impl CaptureService {
    pub fn new(source: Arc<dyn PacketSource>, config: &Config) -> Self {
        let enricher = config
            .enrichment_enabled
            .then(|| Enricher::network(config.lookup_timeout()));

        Self {
            source,
            builder: Arc::new(PacketRecordBuilder::new(config.thresholds())),
            enricher,
            cache: CaptureCache::new(),
            refresh_lock: tokio::sync::Mutex::new(()),
            capture_timeout: config.capture_timeout(),
            cache_max_age: config.cache_max_age(),
            default_count: config.default_packet_count,
            max_count: config.max_packet_count,
        }
    }

    /// Replace the enrichment stage; `None` skips enrichment entirely
    pub fn with_enricher(mut self, enricher: Option<Enricher>) -> Self {
        self.enricher = enricher;
        self
    }

    pub fn with_cache_max_age(mut self, max_age: Duration) -> Self {
        self.cache_max_age = max_age;
        self
    }

    pub fn cache(&self) -> &CaptureCache {
        &self.cache
    }

    pub fn source_name(&self) -> &str {
        self.source.name()
    }

    pub fn default_count(&self) -> usize {
        self.default_count
    }

    pub fn max_count(&self) -> usize {
        self.max_count
    }

    /// Capture up to `count` packets and build their records.
    ///
    /// A capture that outlives `timeout` yields an empty batch marked
    /// `timed_out`. A failing packet source is an error.
    pub async fn capture(&self, count: usize, timeout: Duration) -> Result<CaptureBatch, AppError> {
        let started = Instant::now();
        let source = Arc::clone(&self.source);
        let task = tokio::task::spawn_blocking(move || source.capture(count, timeout));

        let packets = match tokio::time::timeout(timeout + CAPTURE_GRACE, task).await {
            Ok(Ok(result)) => result?,
            Ok(Err(e)) => return Err(AppError::InternalError(format!("Capture task failed: {}", e))),
            Err(_) => {
                warn!("{}", AppError::CaptureTimeout(timeout.as_secs()));
                let mut batch = CaptureBatch::empty(count);
                batch.duration_ms = elapsed_ms(started);
                return Ok(batch);
            }
        };

        let timed_out = packets.len() < count;
        if timed_out {
            debug!("Captured {} of {} requested packets before timeout", packets.len(), count);
        }

        let mut records = self.build_records(packets).await?;
        if let Some(enricher) = &self.enricher {
            enricher.enrich_batch(&mut records).await;
        }

        let mut batch = CaptureBatch::new(count, records);
        batch.timed_out = timed_out;
        batch.duration_ms = elapsed_ms(started);

        info!(
            "📦 Batch {} ready: {} packets in {} ms",
            batch.batch_id,
            batch.len(),
            batch.duration_ms
        );
        Ok(batch)
    }

    /// Serve the cached batch while it is fresh, otherwise recapture.
    ///
    /// Returns the batch and whether it came from the cache. With `use_cache`
    /// off a new capture is always taken; it still replaces the cached batch.
    pub async fn get_cached_or_fresh(
        &self,
        count: usize,
        use_cache: bool,
    ) -> Result<(Arc<CaptureBatch>, bool), AppError> {
        if use_cache {
            if let Some(batch) = self.cache.get(self.cache_max_age) {
                return Ok((batch, true));
            }
        }

        let _guard = self.refresh_lock.lock().await;

        // Another request may have refreshed while this one waited
        if use_cache {
            if let Some(batch) = self.cache.get(self.cache_max_age) {
                return Ok((batch, true));
            }
        }

        let batch = self.refresh_unlocked(count).await?;
        Ok((batch, false))
    }

    /// Capture a new batch and publish it to the cache
    pub async fn refresh(&self, count: usize) -> Result<Arc<CaptureBatch>, AppError> {
        let _guard = self.refresh_lock.lock().await;
        self.refresh_unlocked(count).await
    }

    async fn refresh_unlocked(&self, count: usize) -> Result<Arc<CaptureBatch>, AppError> {
        let count = count.max(self.default_count).min(self.max_count);
        let batch = self.capture(count, self.capture_timeout).await?;
        Ok(self.cache.replace(batch))
    }

    async fn build_records(&self, packets: Vec<DecodedPacket>) -> Result<Vec<PacketRecord>, AppError> {
        let builder = Arc::clone(&self.builder);
        tokio::task::spawn_blocking(move || {
            packets
                .iter()
                .zip(1u64..)
                .map(|(packet, id)| builder.build(packet, id))
                .collect::<Vec<_>>()
        })
        .await
        .map_err(|e| AppError::InternalError(format!("Record building failed: {}", e)))
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis().try_into().unwrap_or(u64::MAX)
}

/// Keeps the cache warm by recapturing on a fixed interval.
///
/// A failed capture is logged and retried after the backoff; the loop only
/// ends through [`BackgroundCapture::stop`].
pub struct BackgroundCapture {
    service: Arc<CaptureService>,
    interval: Duration,
    backoff: Duration,
    count: usize,
    stop_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BackgroundCapture {
    pub fn new(service: Arc<CaptureService>, config: &Config) -> Self {
        Self::with_timing(
            service,
            Duration::from_secs(config.background_interval_secs),
            Duration::from_secs(config.retry_backoff_secs),
            config.max_packet_count,
        )
    }

    pub fn with_timing(service: Arc<CaptureService>, interval: Duration, backoff: Duration, count: usize) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            service,
            interval,
            backoff,
            count,
            stop_tx,
            handle: Mutex::new(None),
        }
    }

    /// Spawn the loop; returns false if it is already running
    pub fn start(&self) -> bool {
        let mut handle = self.handle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if handle.as_ref().map_or(false, |h| !h.is_finished()) {
            return false;
        }

        self.stop_tx.send_replace(false);
        let mut stop_rx = self.stop_tx.subscribe();
        let service = Arc::clone(&self.service);
        let (interval, backoff, count) = (self.interval, self.backoff, self.count);

        *handle = Some(tokio::spawn(async move {
            info!("🔄 Background capture started (every {}s)", interval.as_secs());
            loop {
                let delay = tokio::select! {
                    result = service.refresh(count) => match result {
                        Ok(batch) => {
                            debug!("Background capture refreshed batch {}", batch.batch_id);
                            interval
                        }
                        Err(e) => {
                            error!("❌ Background capture failed: {}", e);
                            warn!("🔄 Retrying background capture in {} seconds...", backoff.as_secs());
                            backoff
                        }
                    },
                    _ = stop_rx.changed() => break,
                };

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = stop_rx.changed() => break,
                }
            }
            info!("Background capture stopped");
        }));

        true
    }

    /// Signal the loop to stop and wait for it to finish
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Background capture task ended abnormally: {}", e);
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_ref()
            .map_or(false, |h| !h.is_finished())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::capture::packet::{Ipv4Header, NetworkLayer, TcpHeader, TransportLayer};
    use crate::enrichment::NoopEnrichment;

    /// Packet source that hands out canned packets and counts how often it is asked
    pub(crate) struct CountingSource {
        pub calls: AtomicUsize,
        delay: Duration,
        fail: bool,
    }

    impl CountingSource {
        pub fn new() -> Self {
            Self { calls: AtomicUsize::new(0), delay: Duration::ZERO, fail: false }
        }

        pub fn slow(delay: Duration) -> Self {
            Self { delay, ..Self::new() }
        }

        pub fn failing() -> Self {
            Self { fail: true, ..Self::new() }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    pub(crate) fn http_syn(src_port: u16) -> DecodedPacket {
        let mut packet = DecodedPacket::new(54);
        packet.network = Some(NetworkLayer::Ipv4(Ipv4Header {
            version: 4,
            ihl: 5,
            tos: 0,
            total_length: 40,
            identification: 1,
            dont_fragment: true,
            more_fragments: false,
            fragment_offset: 0,
            ttl: 64,
            protocol: 6,
            checksum: 0,
            source: Ipv4Addr::new(192, 168, 1, 1),
            destination: Ipv4Addr::new(192, 168, 1, 100),
        }));
        packet.transport = Some(TransportLayer::Tcp(TcpHeader {
            source_port: src_port,
            destination_port: 80,
            sequence_number: 0,
            acknowledgment_number: 0,
            data_offset: 5,
            flags: "S".parse().unwrap(),
            window_size: 8192,
            checksum: 0,
            urgent_pointer: 0,
        }));
        packet
    }

    impl PacketSource for CountingSource {
        fn capture(&self, count: usize, _timeout: Duration) -> Result<Vec<DecodedPacket>, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                std::thread::sleep(self.delay);
            }
            if self.fail {
                return Err(AppError::CaptureError("interface went away".to_string()));
            }
            Ok((0..count as u16).map(|i| http_syn(40000 + i)).collect())
        }

        fn name(&self) -> &str {
            "mock0"
        }
    }

    pub(crate) fn test_config() -> Config {
        Config {
            default_packet_count: 3,
            max_packet_count: 10,
            capture_timeout_secs: 1,
            cache_max_age_secs: 60,
            ..Config::default()
        }
    }

    pub(crate) fn service_with(source: Arc<CountingSource>, config: &Config) -> CaptureService {
        CaptureService::new(source, config).with_enricher(Some(Enricher::new(
            Arc::new(NoopEnrichment),
            Arc::new(NoopEnrichment),
            Duration::from_secs(1),
        )))
    }

    #[tokio::test]
    async fn test_capture_numbers_records_in_order() {
        let source = Arc::new(CountingSource::new());
        let service = service_with(source.clone(), &test_config());

        let batch = service.capture(5, Duration::from_secs(1)).await.unwrap();
        let ids: Vec<u64> = batch.records.iter().map(|r| r.id()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert!(!batch.timed_out);
        assert_eq!(batch.requested, 5);

        let ports: Vec<Option<u16>> = batch
            .records
            .iter()
            .map(|r| r.analyzed().and_then(|a| a.src_port))
            .collect();
        assert_eq!(ports, vec![Some(40000), Some(40001), Some(40002), Some(40003), Some(40004)]);
    }

    #[tokio::test]
    async fn test_fresh_cache_is_reused() {
        let source = Arc::new(CountingSource::new());
        let service = service_with(source.clone(), &test_config());

        let (first, first_cached) = service.get_cached_or_fresh(3, true).await.unwrap();
        let (second, second_cached) = service.get_cached_or_fresh(3, true).await.unwrap();

        assert!(!first_cached);
        assert!(second_cached);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_cache_triggers_exactly_one_recapture() {
        let source = Arc::new(CountingSource::slow(Duration::from_millis(50)));
        let service = Arc::new(
            service_with(source.clone(), &test_config()).with_cache_max_age(Duration::from_millis(30)),
        );

        service.get_cached_or_fresh(3, true).await.unwrap();
        assert_eq!(source.calls(), 1);
        tokio::time::sleep(Duration::from_millis(60)).await;

        let readers: Vec<_> = (0..5)
            .map(|_| {
                let service = Arc::clone(&service);
                tokio::spawn(async move { service.get_cached_or_fresh(3, true).await.unwrap() })
            })
            .collect();
        let results = futures::future::join_all(readers).await;

        assert_eq!(source.calls(), 2);
        let fresh = results.iter().filter(|r| !r.as_ref().unwrap().1).count();
        assert_eq!(fresh, 1);
    }

    #[tokio::test]
    async fn test_cache_bypass_always_captures() {
        let source = Arc::new(CountingSource::new());
        let service = service_with(source.clone(), &test_config());

        service.get_cached_or_fresh(3, false).await.unwrap();
        let (_, cached) = service.get_cached_or_fresh(3, false).await.unwrap();
        assert!(!cached);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn test_refresh_count_is_clamped() {
        let source = Arc::new(CountingSource::new());
        let service = service_with(source.clone(), &test_config());

        assert_eq!(service.refresh(1).await.unwrap().len(), 3);
        assert_eq!(service.refresh(500).await.unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_overrunning_capture_yields_empty_batch() {
        let source = Arc::new(CountingSource::slow(Duration::from_millis(900)));
        let service = service_with(source.clone(), &test_config());

        let batch = service.capture(3, Duration::from_millis(100)).await.unwrap();
        assert!(batch.is_empty());
        assert!(batch.timed_out);
    }

    #[tokio::test]
    async fn test_source_failure_is_surfaced_and_not_cached() {
        let source = Arc::new(CountingSource::failing());
        let service = service_with(source.clone(), &test_config());

        let result = service.get_cached_or_fresh(3, true).await;
        assert!(matches!(result, Err(AppError::CaptureError(_))));
        assert!(!service.cache().is_populated());
    }

    #[tokio::test]
    async fn test_background_capture_populates_cache_and_stops() {
        let source = Arc::new(CountingSource::new());
        let service = Arc::new(service_with(source.clone(), &test_config()));
        let background = BackgroundCapture::with_timing(
            Arc::clone(&service),
            Duration::from_millis(20),
            Duration::from_millis(20),
            10,
        );

        assert!(background.start());
        assert!(!background.start());
        tokio::time::sleep(Duration::from_millis(100)).await;
        background.stop().await;

        assert!(!background.is_running());
        assert!(source.calls() >= 2);
        assert_eq!(service.cache().latest().unwrap().len(), 10);

        // Stopped means stopped
        let calls = source.calls();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(source.calls(), calls);
    }

    #[tokio::test]
    async fn test_background_capture_survives_failures() {
        let source = Arc::new(CountingSource::failing());
        let service = Arc::new(service_with(source.clone(), &test_config()));
        let background = BackgroundCapture::with_timing(
            service,
            Duration::from_millis(20),
            Duration::from_millis(10),
            5,
        );

        background.start();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(background.is_running());
        background.stop().await;

        assert!(source.calls() >= 3);
    }
}
