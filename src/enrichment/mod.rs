//! Best-effort hostname and geolocation lookups for public addresses.
//!
//! Enrichment runs after a batch is built and only ever fills optional
//! fields. A failed, slow or skipped lookup leaves them unset. Answers are
//! remembered per address in a bounded [`LookupMemo`].

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::{join_all, BoxFuture, FutureExt};
use log::debug;
use serde::{Deserialize, Serialize};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

use crate::analysis::record::PacketRecord;
use crate::utils::error::AppError;

const IP_API_FIELDS: &str = "status,message,country,regionName,city,isp,org,as,timezone";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub country: Option<String>,
    pub region: Option<String>,
    pub city: Option<String>,
    pub isp: Option<String>,
    pub org: Option<String>,
    #[serde(rename = "as")]
    pub as_name: Option<String>,
    pub timezone: Option<String>,
}

/// Reverse DNS collaborator
pub trait HostnameResolver: Send + Sync {
    /// `Ok(None)` when the address has no PTR record
    fn resolve(&self, ip: IpAddr) -> BoxFuture<'_, Result<Option<String>, AppError>>;
}

/// Geolocation collaborator
pub trait GeoLocator: Send + Sync {
    fn locate(&self, ip: IpAddr) -> BoxFuture<'_, Result<Option<GeoLocation>, AppError>>;
}

/// Answers every lookup with nothing, immediately
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEnrichment;

impl HostnameResolver for NoopEnrichment {
    fn resolve(&self, _ip: IpAddr) -> BoxFuture<'_, Result<Option<String>, AppError>> {
        futures::future::ready(Ok(None)).boxed()
    }
}

impl GeoLocator for NoopEnrichment {
    fn locate(&self, _ip: IpAddr) -> BoxFuture<'_, Result<Option<GeoLocation>, AppError>> {
        futures::future::ready(Ok(None)).boxed()
    }
}

/// Entries a lookup memo holds before it starts evicting
const MEMO_CAPACITY: usize = 4096;
/// How long a remembered answer is trusted
const MEMO_TTL: Duration = Duration::from_secs(3600);

/// Per-address answers with an entry cap and expiry.
///
/// When full, expired entries are dropped first and then the oldest one.
pub struct LookupMemo<V> {
    state: Mutex<MemoState<V>>,
    capacity: usize,
    ttl: Duration,
}

struct MemoState<V> {
    entries: HashMap<IpAddr, MemoEntry<V>>,
    next_seq: u64,
}

struct MemoEntry<V> {
    value: V,
    stored_at: Instant,
    /// Insertion order, used to pick the oldest entry
    seq: u64,
}

impl<V: Clone> LookupMemo<V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            state: Mutex::new(MemoState {
                entries: HashMap::new(),
                next_seq: 0,
            }),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn get(&self, ip: &IpAddr) -> Option<V> {
        let mut state = self.state.lock().ok()?;
        if state.entries.get(ip)?.stored_at.elapsed() > self.ttl {
            state.entries.remove(ip);
            return None;
        }
        state.entries.get(ip).map(|entry| entry.value.clone())
    }

    pub fn insert(&self, ip: IpAddr, value: V) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };

        if !state.entries.contains_key(&ip) && state.entries.len() >= self.capacity {
            let ttl = self.ttl;
            state.entries.retain(|_, entry| entry.stored_at.elapsed() <= ttl);

            if state.entries.len() >= self.capacity {
                let oldest = state
                    .entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.seq)
                    .map(|(ip, _)| *ip);
                if let Some(oldest) = oldest {
                    state.entries.remove(&oldest);
                }
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            ip,
            MemoEntry {
                value,
                stored_at: Instant::now(),
                seq,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|state| state.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for LookupMemo<V> {
    fn default() -> Self {
        Self::new(MEMO_CAPACITY, MEMO_TTL)
    }
}

/// PTR lookups through the system resolver configuration, memoised per address
pub struct DnsHostnameResolver {
    resolver: TokioAsyncResolver,
    memo: LookupMemo<Option<String>>,
}

impl DnsHostnameResolver {
    pub fn new() -> Self {
        Self {
            resolver: TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default()),
            memo: LookupMemo::default(),
        }
    }
}

impl Default for DnsHostnameResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl HostnameResolver for DnsHostnameResolver {
    fn resolve(&self, ip: IpAddr) -> BoxFuture<'_, Result<Option<String>, AppError>> {
        async move {
            if let Some(hit) = self.memo.get(&ip) {
                return Ok(hit);
            }

            let hostname = match self.resolver.reverse_lookup(ip).await {
                Ok(response) => response
                    .iter()
                    .next()
                    .map(|name| name.to_string().trim_end_matches('.').to_string()),
                Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => None,
                Err(e) => {
                    return Err(AppError::EnrichmentError(format!(
                        "Reverse lookup for {} failed: {}",
                        ip, e
                    )))
                }
            };

            self.memo.insert(ip, hostname.clone());
            Ok(hostname)
        }
        .boxed()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiResponse {
    status: String,
    message: Option<String>,
    country: Option<String>,
    region_name: Option<String>,
    city: Option<String>,
    isp: Option<String>,
    org: Option<String>,
    #[serde(rename = "as")]
    as_name: Option<String>,
    timezone: Option<String>,
}

/// Geolocation through the ip-api.com JSON endpoint, memoised per address
pub struct IpApiGeoLocator {
    client: reqwest::Client,
    base_url: String,
    memo: LookupMemo<Option<GeoLocation>>,
}

impl IpApiGeoLocator {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("osi-visualizer/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: "http://ip-api.com/json".to_string(),
            memo: LookupMemo::default(),
        }
    }
}

impl GeoLocator for IpApiGeoLocator {
    fn locate(&self, ip: IpAddr) -> BoxFuture<'_, Result<Option<GeoLocation>, AppError>> {
        async move {
            if let Some(hit) = self.memo.get(&ip) {
                return Ok(hit);
            }

            let url = format!("{}/{}?fields={}", self.base_url, ip, IP_API_FIELDS);
            let response: IpApiResponse = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| AppError::EnrichmentError(format!("Geolocation request failed: {}", e)))?
                .json()
                .await
                .map_err(|e| AppError::EnrichmentError(format!("Invalid geolocation response: {}", e)))?;

            let location = if response.status == "success" {
                Some(GeoLocation {
                    country: response.country,
                    region: response.region_name,
                    city: response.city,
                    isp: response.isp,
                    org: response.org,
                    as_name: response.as_name,
                    timezone: response.timezone,
                })
            } else {
                debug!(
                    "No geolocation for {}: {}",
                    ip,
                    response.message.unwrap_or_default()
                );
                None
            };

            self.memo.insert(ip, location.clone());
            Ok(location)
        }
        .boxed()
    }
}

/// Runs the collaborators against a batch's addresses, each lookup bounded by a timeout
#[derive(Clone)]
pub struct Enricher {
    hostnames: Arc<dyn HostnameResolver>,
    geo: Arc<dyn GeoLocator>,
    lookup_timeout: Duration,
}

impl Enricher {
    pub fn new(
        hostnames: Arc<dyn HostnameResolver>,
        geo: Arc<dyn GeoLocator>,
        lookup_timeout: Duration,
    ) -> Self {
        Self {
            hostnames,
            geo,
            lookup_timeout,
        }
    }

    /// Live DNS and ip-api lookups
    pub fn network(lookup_timeout: Duration) -> Self {
        Self::new(
            Arc::new(DnsHostnameResolver::new()),
            Arc::new(IpApiGeoLocator::new(lookup_timeout)),
            lookup_timeout,
        )
    }

    /// Look up every distinct public address in the batch once, then fill the records
    pub async fn enrich_batch(&self, records: &mut [PacketRecord]) {
        let addresses: BTreeSet<IpAddr> = records
            .iter()
            .filter_map(PacketRecord::analyzed)
            .flat_map(|record| [record.src_ip, record.dst_ip])
            .flatten()
            .filter(is_public_ip)
            .collect();
        if addresses.is_empty() {
            return;
        }

        let found: HashMap<IpAddr, (Option<String>, Option<GeoLocation>)> =
            join_all(addresses.into_iter().map(|ip| async move {
                let (hostname, location) = tokio::join!(self.hostname(ip), self.location(ip));
                (ip, (hostname, location))
            }))
            .await
            .into_iter()
            .collect();
        debug!("Enriched {} distinct public addresses", found.len());

        for record in records.iter_mut().filter_map(PacketRecord::analyzed_mut) {
            if let Some((hostname, location)) = record.src_ip.and_then(|ip| found.get(&ip)) {
                record.src_hostname = hostname.clone();
                record.src_geo = location.clone();
            }
            if let Some((hostname, location)) = record.dst_ip.and_then(|ip| found.get(&ip)) {
                record.dst_hostname = hostname.clone();
                record.dst_geo = location.clone();
            }
        }
    }

    async fn hostname(&self, ip: IpAddr) -> Option<String> {
        match tokio::time::timeout(self.lookup_timeout, self.hostnames.resolve(ip)).await {
            Ok(Ok(hostname)) => hostname,
            Ok(Err(e)) => {
                debug!("{}", e);
                None
            }
            Err(_) => {
                debug!("Reverse lookup for {} timed out", ip);
                None
            }
        }
    }

    async fn location(&self, ip: IpAddr) -> Option<GeoLocation> {
        match tokio::time::timeout(self.lookup_timeout, self.geo.locate(ip)).await {
            Ok(Ok(location)) => location,
            Ok(Err(e)) => {
                debug!("{}", e);
                None
            }
            Err(_) => {
                debug!("Geolocation for {} timed out", ip);
                None
            }
        }
    }
}

/// False for addresses no public service can say anything about
pub fn is_public_ip(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_private()
                || v4.is_loopback()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_broadcast()
                || v4.is_unspecified()
                || v4.is_documentation())
        }
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_public_ip(&IpAddr::V4(mapped));
            }
            let first = v6.segments()[0];
            let unique_local = first & 0xfe00 == 0xfc00;
            let link_local = first & 0xffc0 == 0xfe80;
            let documentation = first == 0x2001 && v6.segments()[1] == 0x0db8;
            !(v6.is_loopback() || v6.is_multicast() || v6.is_unspecified() || unique_local || link_local || documentation)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::analysis::PacketRecordBuilder;
    use crate::capture::packet::{DecodedPacket, Ipv4Header, NetworkLayer};
    use std::net::Ipv4Addr;

    struct CountingLookups {
        calls: AtomicUsize,
        delay: Duration,
    }

    impl CountingLookups {
        fn new(delay: Duration) -> Self {
            Self { calls: AtomicUsize::new(0), delay }
        }
    }

    impl HostnameResolver for CountingLookups {
        fn resolve(&self, ip: IpAddr) -> BoxFuture<'_, Result<Option<String>, AppError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(self.delay).await;
                Ok(Some(format!("host-{}", ip)))
            }
            .boxed()
        }
    }

    impl GeoLocator for CountingLookups {
        fn locate(&self, _ip: IpAddr) -> BoxFuture<'_, Result<Option<GeoLocation>, AppError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(self.delay).await;
                Ok(Some(GeoLocation {
                    country: Some("Testland".to_string()),
                    ..Default::default()
                }))
            }
            .boxed()
        }
    }

    struct FailingLookups;

    impl HostnameResolver for FailingLookups {
        fn resolve(&self, _ip: IpAddr) -> BoxFuture<'_, Result<Option<String>, AppError>> {
            futures::future::ready(Err(AppError::EnrichmentError("resolver down".into()))).boxed()
        }
    }

    fn record(src: Ipv4Addr, dst: Ipv4Addr) -> PacketRecord {
        let mut packet = DecodedPacket::new(20);
        packet.network = Some(NetworkLayer::Ipv4(Ipv4Header {
            version: 4,
            ihl: 5,
            tos: 0,
            total_length: 20,
            identification: 0,
            dont_fragment: false,
            more_fragments: false,
            fragment_offset: 0,
            ttl: 64,
            protocol: 47,
            checksum: 0,
            source: src,
            destination: dst,
        }));
        PacketRecordBuilder::default().build(&packet, 1)
    }

    #[test]
    fn test_public_ip_classification() {
        let public = ["8.8.8.8", "1.1.1.1", "2606:4700:4700::1111"];
        let not_public = [
            "10.1.2.3",
            "172.16.0.1",
            "192.168.1.1",
            "127.0.0.1",
            "169.254.1.1",
            "224.0.0.251",
            "255.255.255.255",
            "0.0.0.0",
            "192.0.2.10",
            "::1",
            "::",
            "fe80::1",
            "fd12:3456::1",
            "ff02::fb",
            "2001:db8::1",
            "::ffff:192.168.0.1",
        ];

        for ip in public {
            assert!(is_public_ip(&ip.parse().unwrap()), "{} should be public", ip);
        }
        for ip in not_public {
            assert!(!is_public_ip(&ip.parse().unwrap()), "{} should not be public", ip);
        }
    }

    #[tokio::test]
    async fn test_private_addresses_are_never_looked_up() {
        let lookups = Arc::new(CountingLookups::new(Duration::ZERO));
        let enricher = Enricher::new(lookups.clone(), lookups.clone(), Duration::from_secs(1));

        let mut records = vec![record(Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(10, 0, 0, 1))];
        enricher.enrich_batch(&mut records).await;

        assert_eq!(lookups.calls.load(Ordering::SeqCst), 0);
        assert!(records[0].analyzed().unwrap().dst_hostname.is_none());
    }

    #[tokio::test]
    async fn test_public_destination_is_enriched() {
        let lookups = Arc::new(CountingLookups::new(Duration::ZERO));
        let enricher = Enricher::new(lookups.clone(), lookups.clone(), Duration::from_secs(1));

        let mut records = vec![record(Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(8, 8, 8, 8))];
        enricher.enrich_batch(&mut records).await;

        let analyzed = records[0].analyzed().unwrap();
        assert_eq!(analyzed.dst_hostname.as_deref(), Some("host-8.8.8.8"));
        assert_eq!(analyzed.dst_geo.as_ref().and_then(|g| g.country.as_deref()), Some("Testland"));
        assert!(analyzed.src_hostname.is_none());
        assert_eq!(lookups.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_slow_lookup_is_dropped() {
        let lookups = Arc::new(CountingLookups::new(Duration::from_secs(30)));
        let enricher = Enricher::new(lookups.clone(), lookups, Duration::from_millis(50));

        let mut records = vec![record(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8))];
        enricher.enrich_batch(&mut records).await;

        let analyzed = records[0].analyzed().unwrap();
        assert!(analyzed.src_hostname.is_none());
        assert!(analyzed.dst_geo.is_none());
        // The rest of the record is untouched
        assert_eq!(analyzed.ttl, Some(64));
    }

    #[tokio::test]
    async fn test_lookup_error_is_swallowed() {
        let enricher = Enricher::new(Arc::new(FailingLookups), Arc::new(NoopEnrichment), Duration::from_secs(1));

        let mut records = vec![record(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8))];
        enricher.enrich_batch(&mut records).await;

        assert!(records[0].analyzed().unwrap().src_hostname.is_none());
    }

    #[tokio::test]
    async fn test_shared_address_is_looked_up_once_per_batch() {
        let lookups = Arc::new(CountingLookups::new(Duration::from_millis(10)));
        let enricher = Enricher::new(lookups.clone(), lookups.clone(), Duration::from_secs(1));

        let mut records: Vec<PacketRecord> = (0..20)
            .map(|_| record(Ipv4Addr::new(192, 168, 1, 1), Ipv4Addr::new(8, 8, 8, 8)))
            .collect();
        records.push(record(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)));
        enricher.enrich_batch(&mut records).await;

        // One reverse lookup and one geolocation for each of 8.8.8.8 and 1.1.1.1
        assert_eq!(lookups.calls.load(Ordering::SeqCst), 4);
        for record in &records {
            let analyzed = record.analyzed().unwrap();
            assert_eq!(analyzed.dst_hostname.as_deref(), Some("host-8.8.8.8"));
            assert!(analyzed.dst_geo.is_some());
        }
        assert_eq!(records[20].analyzed().unwrap().src_hostname.as_deref(), Some("host-1.1.1.1"));
        assert!(records[0].analyzed().unwrap().src_hostname.is_none());
    }

    #[test]
    fn test_memo_is_bounded() {
        let memo: LookupMemo<Option<String>> = LookupMemo::new(3, Duration::from_secs(60));
        for last in 1..=10u8 {
            memo.insert(IpAddr::V4(Ipv4Addr::new(8, 8, 8, last)), Some(format!("host-{}", last)));
        }

        assert_eq!(memo.len(), 3);
        // The newest entries survive
        assert_eq!(memo.get(&IpAddr::V4(Ipv4Addr::new(8, 8, 8, 10))), Some(Some("host-10".to_string())));
        assert!(memo.get(&IpAddr::V4(Ipv4Addr::new(8, 8, 8, 1))).is_none());

        // Overwriting a remembered address does not evict anything
        memo.insert(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 10)), None);
        assert_eq!(memo.len(), 3);
        assert_eq!(memo.get(&IpAddr::V4(Ipv4Addr::new(8, 8, 8, 10))), Some(None));
    }

    #[test]
    fn test_memo_entries_expire() {
        let memo: LookupMemo<Option<String>> = LookupMemo::new(8, Duration::from_millis(10));
        let ip = IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8));
        memo.insert(ip, Some("dns.google".to_string()));
        assert!(memo.get(&ip).is_some());

        std::thread::sleep(Duration::from_millis(30));
        assert!(memo.get(&ip).is_none());
        assert!(memo.is_empty());
    }

    #[test]
    fn test_geo_location_serializes_as_field() {
        let geo = GeoLocation { as_name: Some("AS15169 Google LLC".into()), ..Default::default() };
        let json = serde_json::to_value(&geo).unwrap();
        assert_eq!(json["as"], "AS15169 Google LLC");
    }
}
