//! # Live Packet Broadcasting
//!
//! Fan-out of freshly parsed packets to subscribed dashboard clients. Each
//! subscriber owns a bounded channel and a compiled [`Filter`]; delivery is
//! best-effort with at-most-once semantics per connection — a full buffer or
//! a closed receiver drops the subscriber silently, never the pipeline.
//!
//! The broadcaster also keeps the two in-memory metadata caches rebuilt by
//! the upsert path: gateway names for live-packet labeling and search, and
//! ChirpStack device metadata with a reverse DevAddr index used to mirror
//! gateway-side downlinks into ChirpStack-scoped feeds.

pub mod filter;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

pub use filter::{Filter, GatewayText, Ownership, SourceMode};

use crate::model::{CsPacket, LivePacket, PacketType, ParsedPacket};

/// Per-subscriber outbound buffer depth.
const SUBSCRIBER_BUFFER: usize = 64;

/// Cached ChirpStack device metadata.
#[derive(Debug, Clone, Default)]
pub struct CsDeviceMeta {
    pub device_name: String,
    pub application_name: Option<String>,
    pub dev_addr: Option<String>,
}

#[derive(Debug)]
struct Subscriber {
    filter: Filter,
    sink: mpsc::Sender<Arc<String>>,
}

/// Handle returned to the WS layer; dropping the receiver unsubscribes
/// implicitly on the next delivery attempt.
pub struct Subscription {
    pub id: u64,
    pub rx: mpsc::Receiver<Arc<String>>,
}

/// Process-wide set of live subscribers plus metadata caches.
#[derive(Debug, Default)]
pub struct Broadcaster {
    subscribers: Mutex<HashMap<u64, Arc<Subscriber>>>,
    next_id: AtomicU64,
    gateways: Mutex<HashMap<String, GatewayText>>,
    devices: Mutex<HashMap<String, CsDeviceMeta>>,
    /// Reverse index `dev_addr -> dev_eui`, rebuilt by device upserts.
    dev_addr_index: Mutex<HashMap<String, String>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber with its compiled filter.
    pub fn subscribe(&self, filter: Filter) -> Subscription {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("subscriber set lock poisoned")
            .insert(id, Arc::new(Subscriber { filter, sink: tx }));
        Subscription { id, rx }
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers
            .lock()
            .expect("subscriber set lock poisoned")
            .remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber set lock poisoned")
            .len()
    }

    /// Snapshot the membership so sends never happen under the lock.
    fn snapshot(&self) -> Vec<(u64, Arc<Subscriber>)> {
        self.subscribers
            .lock()
            .expect("subscriber set lock poisoned")
            .iter()
            .map(|(id, sub)| (*id, sub.clone()))
            .collect()
    }

    fn drop_subscribers(&self, dead: &[u64]) {
        if dead.is_empty() {
            return;
        }
        let mut subscribers = self
            .subscribers
            .lock()
            .expect("subscriber set lock poisoned");
        for id in dead {
            subscribers.remove(id);
        }
    }

    fn deliver(
        &self,
        targets: &[(u64, Arc<Subscriber>)],
        mode: SourceMode,
        packet: &LivePacket,
        gateway: Option<&GatewayText>,
    ) {
        let mut serialized: Option<Arc<String>> = None;
        let mut dead: Vec<u64> = Vec::new();

        for (id, subscriber) in targets {
            if subscriber.filter.source_mode != mode {
                continue;
            }
            if !subscriber.filter.matches(packet, gateway) {
                continue;
            }
            let json = match &serialized {
                Some(json) => json.clone(),
                None => match serde_json::to_string(packet) {
                    Ok(json) => {
                        let json = Arc::new(json);
                        serialized = Some(json.clone());
                        json
                    }
                    Err(e) => {
                        log::warn!("live packet serialization failed: {e}");
                        return;
                    }
                },
            };
            match subscriber.sink.try_send(json) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                    dead.push(*id);
                }
            }
        }
        self.drop_subscribers(&dead);
    }

    /// Fan a gateway-pipeline packet out to gateway-mode subscribers, and
    /// mirror downlinks for devices known to the CS cache into
    /// chirpstack-mode feeds.
    pub fn publish_gateway(&self, packet: &ParsedPacket) {
        let targets = self.snapshot();
        if targets.is_empty() {
            return;
        }

        let gateway_text = self.gateway_text(&packet.gateway_id);
        let live = LivePacket::from_gateway(
            packet,
            gateway_text.as_ref().and_then(|t| t.name.clone()),
        );
        self.deliver(&targets, SourceMode::Gateway, &live, gateway_text.as_ref());

        if packet.packet_type == PacketType::Downlink {
            if let Some((dev_eui, device_name)) = self.reverse_lookup(packet.dev_addr.as_deref()) {
                let mirrored = LivePacket::gateway_downlink_as_cs(packet, &dev_eui, device_name);
                self.deliver(
                    &targets,
                    SourceMode::Chirpstack,
                    &mirrored,
                    gateway_text.as_ref(),
                );
            }
        }
    }

    /// Fan an application-bus event out to chirpstack-mode subscribers.
    pub fn publish_cs(&self, packet: &CsPacket) {
        let targets = self.snapshot();
        if targets.is_empty() {
            return;
        }
        let live = LivePacket::from_cs(packet);
        self.deliver(&targets, SourceMode::Chirpstack, &live, None);
    }

    fn gateway_text(&self, gateway_id: &str) -> Option<GatewayText> {
        self.gateways
            .lock()
            .expect("gateway cache lock poisoned")
            .get(gateway_id)
            .cloned()
    }

    fn reverse_lookup(&self, dev_addr: Option<&str>) -> Option<(String, Option<String>)> {
        let dev_addr = dev_addr?;
        let dev_eui = self
            .dev_addr_index
            .lock()
            .expect("device index lock poisoned")
            .get(dev_addr)
            .cloned()?;
        let device_name = self
            .devices
            .lock()
            .expect("device cache lock poisoned")
            .get(&dev_eui)
            .map(|meta| meta.device_name.clone());
        Some((dev_eui, device_name))
    }

    /// Refresh the gateway cache after an upsert.
    pub fn update_gateway_meta(
        &self,
        gateway_id: &str,
        name: Option<String>,
        alias: Option<String>,
        group_name: Option<String>,
    ) {
        let mut gateways = self.gateways.lock().expect("gateway cache lock poisoned");
        let entry = gateways.entry(gateway_id.to_string()).or_default();
        if name.is_some() {
            entry.name = name;
        }
        if alias.is_some() {
            entry.alias = alias;
        }
        if group_name.is_some() {
            entry.group_name = group_name;
        }
    }

    /// Refresh the CS device cache and the reverse DevAddr index after an
    /// upsert.
    pub fn update_cs_device(&self, dev_eui: &str, meta: CsDeviceMeta) {
        if let Some(dev_addr) = &meta.dev_addr {
            self.dev_addr_index
                .lock()
                .expect("device index lock poisoned")
                .insert(dev_addr.clone(), dev_eui.to_string());
        }
        self.devices
            .lock()
            .expect("device cache lock poisoned")
            .insert(dev_eui.to_string(), meta);
    }

    /// Seed the gateway cache from the database at startup.
    pub fn seed_gateways(&self, rows: Vec<(String, GatewayText)>) {
        let mut gateways = self.gateways.lock().expect("gateway cache lock poisoned");
        for (id, text) in rows {
            gateways.insert(id, text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn packet(packet_type: PacketType, dev_addr: Option<&str>) -> ParsedPacket {
        ParsedPacket {
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            gateway_id: "AA555A0000000000".into(),
            border_gateway_id: None,
            packet_type,
            dev_addr: dev_addr.map(|s| s.to_string()),
            join_eui: None,
            dev_eui: None,
            operator: "The Things Network".into(),
            frequency: 868_100_000,
            spreading_factor: Some(7),
            bandwidth: Some(125_000),
            rssi: -90,
            snr: 7.0,
            payload_size: 16,
            airtime_us: 51_456,
            f_cnt: Some(10),
            f_port: Some(1),
            confirmed: Some(false),
            session_id: None,
        }
    }

    #[test]
    fn test_subscribe_receive_unsubscribe() {
        let broadcaster = Broadcaster::new();
        let mut sub = broadcaster.subscribe(Filter::default());
        assert_eq!(broadcaster.subscriber_count(), 1);

        broadcaster.publish_gateway(&packet(PacketType::Data, Some("26011AAB")));
        let json = sub.rx.try_recv().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["type"], "data");

        broadcaster.unsubscribe(sub.id);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_filtered_subscriber_gets_nothing() {
        let broadcaster = Broadcaster::new();
        let mut sub = broadcaster.subscribe(Filter {
            packet_types: Some(vec![PacketType::JoinRequest]),
            ..Default::default()
        });
        broadcaster.publish_gateway(&packet(PacketType::Data, Some("26011AAB")));
        assert!(sub.rx.try_recv().is_err());
    }

    #[test]
    fn test_full_buffer_drops_subscriber() {
        let broadcaster = Broadcaster::new();
        let sub = broadcaster.subscribe(Filter::default());
        // never drained: overflow the bounded buffer
        for _ in 0..=SUBSCRIBER_BUFFER {
            broadcaster.publish_gateway(&packet(PacketType::Data, Some("26011AAB")));
        }
        assert_eq!(broadcaster.subscriber_count(), 0);
        drop(sub);
    }

    #[test]
    fn test_closed_receiver_dropped_on_next_publish() {
        let broadcaster = Broadcaster::new();
        let sub = broadcaster.subscribe(Filter::default());
        drop(sub.rx);
        broadcaster.publish_gateway(&packet(PacketType::Data, Some("26011AAB")));
        assert_eq!(broadcaster.subscriber_count(), 0);
    }

    #[test]
    fn test_gateway_name_attached_from_cache() {
        let broadcaster = Broadcaster::new();
        broadcaster.update_gateway_meta("AA555A0000000000", Some("rooftop".into()), None, None);
        let mut sub = broadcaster.subscribe(Filter::default());
        broadcaster.publish_gateway(&packet(PacketType::Data, Some("26011AAB")));
        let value: serde_json::Value =
            serde_json::from_str(&sub.rx.try_recv().unwrap()).unwrap();
        assert_eq!(value["gateway_name"], "rooftop");
    }

    #[test]
    fn test_downlink_mirrored_to_cs_subscribers() {
        let broadcaster = Broadcaster::new();
        broadcaster.update_cs_device(
            "E100000000000001",
            CsDeviceMeta {
                device_name: "soil-probe".into(),
                application_name: Some("farm".into()),
                dev_addr: Some("26011AAB".into()),
            },
        );
        let mut cs_sub = broadcaster.subscribe(Filter {
            source_mode: SourceMode::Chirpstack,
            ..Default::default()
        });

        // a data uplink is not mirrored
        broadcaster.publish_gateway(&packet(PacketType::Data, Some("26011AAB")));
        assert!(cs_sub.rx.try_recv().is_err());

        // a downlink for a known DevAddr is
        broadcaster.publish_gateway(&packet(PacketType::Downlink, Some("26011AAB")));
        let value: serde_json::Value =
            serde_json::from_str(&cs_sub.rx.try_recv().unwrap()).unwrap();
        assert_eq!(value["dev_eui"], "E100000000000001");
        assert_eq!(value["device_name"], "soil-probe");
        assert_eq!(value["source"], "chirpstack");
    }

    #[test]
    fn test_cs_events_skip_gateway_subscribers() {
        let broadcaster = Broadcaster::new();
        let mut gw_sub = broadcaster.subscribe(Filter::default());
        let mut cs_sub = broadcaster.subscribe(Filter {
            source_mode: SourceMode::Chirpstack,
            ..Default::default()
        });

        let cs_packet = CsPacket {
            timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            kind: crate::model::CsEventKind::Up,
            dev_eui: "E100000000000001".into(),
            dev_addr: Some("26011AAB".into()),
            device_name: "soil-probe".into(),
            application_id: "12".into(),
            application_name: Some("farm".into()),
            operator: "farm".into(),
            frequency: 867_500_000,
            spreading_factor: Some(9),
            bandwidth: Some(125_000),
            rssi: -101,
            snr: -3.5,
            payload_size: 4,
            airtime_us: 164_864,
            f_cnt: Some(88),
            f_port: Some(2),
            confirmed: Some(false),
            status: None,
        };
        broadcaster.publish_cs(&cs_packet);
        assert!(gw_sub.rx.try_recv().is_err());
        let value: serde_json::Value =
            serde_json::from_str(&cs_sub.rx.try_recv().unwrap()).unwrap();
        assert_eq!(value["source"], "chirpstack");
        assert_eq!(value["device_name"], "soil-probe");
    }
}
