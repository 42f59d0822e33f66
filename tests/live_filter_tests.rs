//! Live-feed filtering through the broadcaster: the combined
//! subscriber-filter scenario and the cross-stream downlink mirror.

use std::sync::Arc;

use chrono::{TimeZone, Utc};

use loratrace::live::{CsDeviceMeta, Ownership};
use loratrace::model::{PacketType, ParsedPacket};
use loratrace::{Broadcaster, Filter, SourceMode};

fn packet(
    packet_type: PacketType,
    dev_addr: Option<&str>,
    rssi: i32,
    gateway_id: &str,
) -> ParsedPacket {
    ParsedPacket {
        timestamp: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
        gateway_id: gateway_id.into(),
        border_gateway_id: None,
        packet_type,
        dev_addr: dev_addr.map(|s| s.to_string()),
        join_eui: None,
        dev_eui: None,
        operator: "The Things Network".into(),
        frequency: 868_100_000,
        spreading_factor: Some(7),
        bandwidth: Some(125_000),
        rssi,
        snr: 5.0,
        payload_size: 16,
        airtime_us: 51_456,
        f_cnt: Some(1),
        f_port: Some(1),
        confirmed: Some(false),
        session_id: None,
    }
}

#[test]
fn test_combined_filter_scenario() {
    // types=[data], rssi_min=-100, owned prefixes=[26000000/7]: exactly the
    // data packets at or above -100 whose DevAddr starts with 26/27
    let broadcaster = Arc::new(Broadcaster::new());
    let filter = Filter {
        packet_types: Some(vec![PacketType::Data]),
        rssi_min: Some(-100),
        ownership: Some(Ownership::Owned),
        ..Default::default()
    }
    .with_prefixes(&["26000000/7".to_string()]);
    let mut sub = broadcaster.subscribe(filter);

    let cases = [
        (packet(PacketType::Data, Some("26011AAB"), -97, "GW"), true),
        (packet(PacketType::Data, Some("26011AAB"), -101, "GW"), false), // below floor
        (packet(PacketType::Data, Some("78000001"), -97, "GW"), false),  // foreign
        (packet(PacketType::JoinRequest, None, -97, "GW"), false),       // wrong type
        (packet(PacketType::Downlink, Some("26011AAB"), 0, "GW"), false), // wrong type
    ];
    let expected: Vec<bool> = cases.iter().map(|(_, keep)| *keep).collect();
    for (p, _) in &cases {
        broadcaster.publish_gateway(p);
    }

    let mut received = 0;
    while sub.rx.try_recv().is_ok() {
        received += 1;
    }
    assert_eq!(received, expected.iter().filter(|k| **k).count());
}

#[test]
fn test_cs_cross_stream_downlink() {
    // a gateway downlink for DevAddr D1 with a registered CS device E1 is
    // delivered to chirpstack-mode subscribers with the device identity
    let broadcaster = Arc::new(Broadcaster::new());
    broadcaster.update_cs_device(
        "E100000000000001",
        CsDeviceMeta {
            device_name: "valve-7".into(),
            application_name: Some("irrigation".into()),
            dev_addr: Some("26011AAB".into()),
        },
    );
    let mut cs_sub = broadcaster.subscribe(Filter {
        source_mode: SourceMode::Chirpstack,
        ..Default::default()
    });
    let mut gw_sub = broadcaster.subscribe(Filter::default());

    broadcaster.publish_gateway(&packet(
        PacketType::Downlink,
        Some("26011AAB"),
        0,
        "AA555A0000000000",
    ));

    // gateway-mode sees the plain downlink
    let gw_json: serde_json::Value =
        serde_json::from_str(&gw_sub.rx.try_recv().unwrap()).unwrap();
    assert_eq!(gw_json["type"], "downlink");
    assert!(gw_json.get("dev_eui").is_none());

    // chirpstack-mode sees the mirror with identity attached
    let cs_json: serde_json::Value =
        serde_json::from_str(&cs_sub.rx.try_recv().unwrap()).unwrap();
    assert_eq!(cs_json["dev_eui"], "E100000000000001");
    assert_eq!(cs_json["device_name"], "valve-7");
    assert_eq!(cs_json["source"], "chirpstack");

    // an unknown DevAddr is not mirrored
    broadcaster.publish_gateway(&packet(PacketType::Downlink, Some("26999999"), 0, "GW"));
    assert!(cs_sub.rx.try_recv().is_err());
}
