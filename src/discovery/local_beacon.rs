//! Local beacon finder (L8): UDP broadcast/multicast announcements with
//! an adaptively-timed send loop and a receive-driven candidate cache.

use std::collections::{HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use prost::Message;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{filter_addresses, Finder};
use crate::cert::pinning::DeviceId;
use crate::config::DiscoveryConfig;
use crate::error::{CoreError, CoreResult};
use crate::protocol::wire::Announce;
use crate::service::Service;

pub const MAGIC_CURRENT: u32 = 0x2EA7D90B;
pub const MAGIC_V2: u32 = 0x2EA7D90C;
pub const MAGIC_LEGACY_V13: u32 = 0x9F79BC40;

const ADAPTATION_WINDOW: Duration = Duration::from_secs(5 * 60);
const MIN_SAMPLES: usize = 5;

/// Adaptive broadcast interval driven by a rolling send/ack success
/// ratio, clamped between a configured min and max.
pub struct AdaptiveInterval {
    current: Duration,
    min: Duration,
    max: Duration,
    samples: VecDeque<(Instant, bool)>,
}

impl AdaptiveInterval {
    pub fn new(default: Duration, min: Duration, max: Duration) -> Self {
        Self {
            current: default,
            min,
            max,
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, success: bool) {
        let now = Instant::now();
        self.samples.push_back((now, success));
        while let Some(&(t, _)) = self.samples.front() {
            if now.duration_since(t) > ADAPTATION_WINDOW {
                self.samples.pop_front();
            } else {
                break;
            }
        }
        if self.samples.len() < MIN_SAMPLES {
            return;
        }
        let successes = self.samples.iter().filter(|(_, s)| *s).count();
        let ratio = successes as f64 / self.samples.len() as f64;
        if ratio < 0.3 {
            self.current = (self.current.mul_f64(0.9)).clamp(self.min, self.max);
        } else if ratio > 0.8 {
            self.current = (self.current.mul_f64(1.1)).clamp(self.min, self.max);
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

#[derive(Debug, Clone)]
struct KnownPeer {
    addresses: Vec<String>,
    instance_id: i64,
    last_seen: Instant,
    ttl: Duration,
}

impl KnownPeer {
    fn expired(&self) -> bool {
        self.last_seen.elapsed() > self.ttl
    }
}

/// Outcome of processing a received announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceOutcome {
    New,
    NotNew,
    SelfAnnouncement,
}

pub struct LocalBeaconFinder {
    local_device: DeviceId,
    known: DashMap<DeviceId, KnownPeer>,
    positive_ttl: Duration,
    timeout: Duration,
    warned_once: DashMap<SocketAddr, ()>,
}

impl LocalBeaconFinder {
    pub fn new(local_device: DeviceId, config: &DiscoveryConfig) -> Self {
        Self {
            local_device,
            known: DashMap::new(),
            positive_ttl: config.local_positive_ttl,
            timeout: config.local_timeout,
            warned_once: DashMap::new(),
        }
    }

    /// Validates magic, checks UTF-8 addresses, drops self-announcements,
    /// and classifies the announcement as new/not-new.
    pub fn handle_announce(
        &self,
        magic: u32,
        body: &[u8],
        sender_ip: IpAddr,
    ) -> CoreResult<AnnounceOutcome> {
        match magic {
            MAGIC_CURRENT | MAGIC_V2 => {}
            MAGIC_LEGACY_V13 => {
                return Err(CoreError::TooOldVersion);
            }
            _ => return Err(CoreError::UnknownMagic),
        }

        let announce =
            Announce::decode(body).map_err(|e| CoreError::MalformedMessage(e.to_string()))?;

        if announce.device_id.len() != 32 {
            return Err(CoreError::MalformedMessage("device id must be 32 bytes".to_string()));
        }
        let mut device = [0u8; 32];
        device.copy_from_slice(&announce.device_id);

        if device == self.local_device {
            return Ok(AnnounceOutcome::SelfAnnouncement);
        }

        let addresses = substitute_unspecified(&announce.addresses, sender_ip);
        let addresses = filter_addresses(&addresses);

        let is_new = match self.known.get(&device) {
            None => true,
            Some(existing) => existing.expired() || existing.instance_id != announce.instance_id,
        };

        self.known.insert(
            device,
            KnownPeer {
                addresses,
                instance_id: announce.instance_id,
                last_seen: Instant::now(),
                ttl: self.positive_ttl,
            },
        );

        if is_new {
            info!(?device, "local beacon: new peer announcement, scheduling forced rebroadcast");
            Ok(AnnounceOutcome::New)
        } else {
            Ok(AnnounceOutcome::NotNew)
        }
    }

    pub fn warn_once_for_legacy(&self, addr: SocketAddr) -> bool {
        self.warned_once.insert(addr, ()).is_none()
    }
}

fn substitute_unspecified(addresses: &[String], sender_ip: IpAddr) -> Vec<String> {
    addresses
        .iter()
        .map(|addr| {
            if let Ok(url) = url::Url::parse(addr) {
                if let Some(std::net::IpAddr::V4(v4)) = url.host_str().and_then(|h| h.parse().ok())
                {
                    if v4.is_unspecified() {
                        let mut replaced = url.clone();
                        let _ = replaced.set_host(Some(&sender_ip.to_string()));
                        return replaced.to_string();
                    }
                }
            }
            addr.clone()
        })
        .collect()
}

#[async_trait]
impl Finder for LocalBeaconFinder {
    fn name(&self) -> &'static str {
        "local-beacon"
    }

    fn priority(&self) -> i32 {
        3
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn lookup(&self, device: DeviceId) -> CoreResult<Vec<String>> {
        match self.known.get(&device) {
            Some(peer) if !peer.expired() => Ok(peer.addresses.clone()),
            _ => Ok(Vec::new()),
        }
    }
}

/// Builds a broadcast/multicast-capable UDP socket.
fn build_socket(bind_addr: SocketAddr) -> std::io::Result<UdpSocket> {
    let domain = if bind_addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    if bind_addr.is_ipv4() {
        socket.set_broadcast(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&bind_addr.into())?;
    Ok(UdpSocket::from_std(socket.into())?)
}

/// Periodically broadcasts this device's announcement and processes
/// inbound ones, running as a supervised service.
pub struct LocalBeaconService {
    finder: Arc<LocalBeaconFinder>,
    bind_addr: SocketAddr,
    broadcast_addr: SocketAddr,
    announce_body: Vec<u8>,
    beacon_default_interval: Duration,
    beacon_min_interval: Duration,
    beacon_max_interval: Duration,
}

impl LocalBeaconService {
    pub fn new(
        finder: Arc<LocalBeaconFinder>,
        bind_addr: SocketAddr,
        broadcast_addr: SocketAddr,
        announce: Announce,
        config: &DiscoveryConfig,
    ) -> Self {
        Self {
            finder,
            bind_addr,
            broadcast_addr,
            announce_body: announce.encode_to_vec(),
            beacon_default_interval: config.beacon_default_interval,
            beacon_min_interval: config.beacon_min_interval,
            beacon_max_interval: config.beacon_max_interval,
        }
    }
}

#[async_trait]
impl Service for LocalBeaconService {
    fn name(&self) -> &str {
        "local-beacon"
    }

    async fn run(&self, cancel: CancellationToken) -> anyhow::Result<()> {
        let socket = build_socket(self.bind_addr)?;
        let mut interval = AdaptiveInterval::new(
            self.beacon_default_interval,
            self.beacon_min_interval,
            self.beacon_max_interval,
        );
        let mut buf = [0u8; 2048];

        loop {
            let mut frame = Vec::with_capacity(4 + self.announce_body.len());
            frame.extend_from_slice(&MAGIC_CURRENT.to_be_bytes());
            frame.extend_from_slice(&self.announce_body);

            let send_ok = socket.send_to(&frame, self.broadcast_addr).await.is_ok();
            interval.record(send_ok);

            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval.current()) => {}
                recv = socket.recv_from(&mut buf) => {
                    if let Ok((len, from)) = recv {
                        self.process_datagram(&buf[..len], from.ip(), from);
                    }
                }
            }
        }
    }
}

impl LocalBeaconService {
    fn process_datagram(&self, data: &[u8], sender_ip: IpAddr, sender: SocketAddr) {
        if data.len() < 4 {
            return;
        }
        let magic = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        match self.finder.handle_announce(magic, &data[4..], sender_ip) {
            Ok(AnnounceOutcome::New) => debug!("beacon: new peer"),
            Ok(_) => {}
            Err(CoreError::TooOldVersion) => {
                if self.finder.warn_once_for_legacy(sender) {
                    warn!(%sender, "beacon: legacy magic rejected");
                }
            }
            Err(CoreError::UnknownMagic) => {}
            Err(e) => warn!(error = %e, "beacon: malformed announcement"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
    const MIN_INTERVAL: Duration = Duration::from_secs(10);
    const MAX_INTERVAL: Duration = Duration::from_secs(60);

    fn device(byte: u8) -> DeviceId {
        [byte; 32]
    }

    fn finder_config(positive_ttl: Duration) -> DiscoveryConfig {
        DiscoveryConfig {
            local_positive_ttl: positive_ttl,
            ..Default::default()
        }
    }

    #[test]
    fn adaptive_interval_shrinks_on_low_success() {
        let mut interval = AdaptiveInterval::new(DEFAULT_INTERVAL, MIN_INTERVAL, MAX_INTERVAL);
        for _ in 0..6 {
            interval.record(false);
        }
        assert!(interval.current() < DEFAULT_INTERVAL);
        assert!(interval.current() >= MIN_INTERVAL);
    }

    #[test]
    fn adaptive_interval_grows_on_high_success() {
        let mut interval = AdaptiveInterval::new(DEFAULT_INTERVAL, MIN_INTERVAL, MAX_INTERVAL);
        for _ in 0..6 {
            interval.record(true);
        }
        assert!(interval.current() > DEFAULT_INTERVAL);
        assert!(interval.current() <= MAX_INTERVAL);
    }

    #[test]
    fn announce_restart_then_same_is_not_new_then_instance_change_is_new() {
        let finder = LocalBeaconFinder::new(device(0), &finder_config(Duration::from_secs(600)));
        let announce = Announce {
            device_id: device(1).to_vec(),
            addresses: vec!["tcp://192.0.2.5:22000".to_string()],
            instance_id: 1,
            protocol_version: 1,
            feature_bitmask: 0,
            client_name: "peersync".to_string(),
            client_version: "v2.0.0".to_string(),
        };
        let body = announce.encode_to_vec();
        let ip: IpAddr = "192.0.2.5".parse().unwrap();

        let first = finder.handle_announce(MAGIC_CURRENT, &body, ip).unwrap();
        assert_eq!(first, AnnounceOutcome::New);

        let second = finder.handle_announce(MAGIC_CURRENT, &body, ip).unwrap();
        assert_eq!(second, AnnounceOutcome::NotNew);

        let mut announce2 = announce;
        announce2.instance_id = 2;
        let body2 = announce2.encode_to_vec();
        let third = finder.handle_announce(MAGIC_CURRENT, &body2, ip).unwrap();
        assert_eq!(third, AnnounceOutcome::New);
    }

    #[test]
    fn self_announcement_is_dropped() {
        let finder = LocalBeaconFinder::new(device(9), &finder_config(Duration::from_secs(600)));
        let announce = Announce {
            device_id: device(9).to_vec(),
            addresses: vec![],
            instance_id: 1,
            protocol_version: 1,
            feature_bitmask: 0,
            client_name: "peersync".to_string(),
            client_version: "v2.0.0".to_string(),
        };
        let body = announce.encode_to_vec();
        let outcome = finder
            .handle_announce(MAGIC_CURRENT, &body, "192.0.2.5".parse().unwrap())
            .unwrap();
        assert_eq!(outcome, AnnounceOutcome::SelfAnnouncement);
    }

    #[test]
    fn legacy_magic_is_rejected() {
        let finder = LocalBeaconFinder::new(device(0), &finder_config(Duration::from_secs(600)));
        let result = finder.handle_announce(MAGIC_LEGACY_V13, &[], "192.0.2.5".parse().unwrap());
        assert!(matches!(result, Err(CoreError::TooOldVersion)));
    }
}
