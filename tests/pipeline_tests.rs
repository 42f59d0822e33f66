//! End-to-end pipeline scenarios: inbound MQTT messages through decode,
//! enrichment and fan-out, observed on the writer channels and a live
//! subscriber. No database involved; the writer handle's channels are held
//! open by the test.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use loratrace::chirpstack::PayloadFormat;
use loratrace::model::{CsEventKind, PacketType};
use loratrace::pipeline::{InboundMessage, Pipeline, TopicRoute};
use loratrace::store::writer::{MetaUpsert, WriterHandle};
use loratrace::{Broadcaster, Filter, OperatorMatcher, SourceMode};

// protobuf scaffolding shared with the decoder tests
fn push_varint(out: &mut Vec<u8>, mut v: u64) {
    loop {
        let byte = (v & 0x7F) as u8;
        v >>= 7;
        if v == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn field_varint(out: &mut Vec<u8>, field: u32, value: u64) {
    push_varint(out, (field as u64) << 3);
    push_varint(out, value);
}

fn field_bytes(out: &mut Vec<u8>, field: u32, value: &[u8]) {
    push_varint(out, (field as u64) << 3 | 2);
    push_varint(out, value.len() as u64);
    out.extend_from_slice(value);
}

fn encode_uplink_frame(
    phy: &[u8],
    gateway_id: &str,
    rssi: i32,
    metadata: &[(&str, &str)],
) -> Vec<u8> {
    let mut lora = Vec::new();
    field_varint(&mut lora, 1, 125_000);
    field_varint(&mut lora, 2, 7);
    field_varint(&mut lora, 4, 1);
    let mut modulation = Vec::new();
    field_bytes(&mut modulation, 3, &lora);
    let mut tx_info = Vec::new();
    field_varint(&mut tx_info, 1, 868_100_000);
    field_bytes(&mut tx_info, 2, &modulation);

    let mut rx_info = Vec::new();
    field_bytes(&mut rx_info, 1, gateway_id.as_bytes());
    field_varint(&mut rx_info, 6, rssi as i64 as u64);
    for (key, value) in metadata {
        let mut entry = Vec::new();
        field_bytes(&mut entry, 1, key.as_bytes());
        field_bytes(&mut entry, 2, value.as_bytes());
        field_bytes(&mut rx_info, 15, &entry);
    }

    let mut frame = Vec::new();
    field_bytes(&mut frame, 1, phy);
    field_bytes(&mut frame, 4, &tx_info);
    field_bytes(&mut frame, 5, &rx_info);
    frame
}

/// 16-byte unconfirmed data up for DevAddr 26011AAB.
fn data_phy() -> Vec<u8> {
    vec![
        0x40, 0xAB, 0x1A, 0x01, 0x26, 0x00, 0x01, 0x00, 0x01, 0x01, 0x02, 0x03, 0x04, 0xAA, 0xBB,
        0xCC,
    ]
}

/// Join request for JoinEUI 70B3D57ED0000001 / DevEUI 0004A30B001B8C12.
fn join_phy() -> Vec<u8> {
    let mut frame = vec![0x00];
    frame.extend_from_slice(&[0x01, 0x00, 0x00, 0xD0, 0x7E, 0xD5, 0xB3, 0x70]);
    frame.extend_from_slice(&[0x12, 0x8C, 0x1B, 0x00, 0x0B, 0xA3, 0x04, 0x00]);
    frame.extend_from_slice(&[0x34, 0x12, 0, 0, 0, 0]);
    frame
}

struct Harness {
    inbound_tx: mpsc::Sender<InboundMessage>,
    packets_rx: mpsc::Receiver<loratrace::ParsedPacket>,
    cs_rx: mpsc::Receiver<loratrace::CsPacket>,
    meta_rx: mpsc::Receiver<MetaUpsert>,
    broadcaster: Arc<Broadcaster>,
    shutdown_tx: watch::Sender<bool>,
}

fn start_pipeline() -> Harness {
    let matcher = Arc::new(OperatorMatcher::new(&[]));
    let broadcaster = Arc::new(Broadcaster::new());
    let (packets_tx, packets_rx) = mpsc::channel(64);
    let (cs_tx, cs_rx) = mpsc::channel(64);
    let (meta_tx, meta_rx) = mpsc::channel(64);
    let handle = WriterHandle {
        packets_tx,
        cs_tx,
        meta_tx,
    };
    let (inbound_tx, inbound_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pipeline = Pipeline::new(
        matcher,
        broadcaster.clone(),
        handle,
        chrono::Duration::days(9),
    );
    tokio::spawn(pipeline.run(inbound_rx, shutdown_rx));
    Harness {
        inbound_tx,
        packets_rx,
        cs_rx,
        meta_rx,
        broadcaster,
        shutdown_tx,
    }
}

async fn recv_packet(harness: &mut Harness) -> loratrace::ParsedPacket {
    timeout(Duration::from_secs(2), harness.packets_rx.recv())
        .await
        .expect("timed out waiting for packet")
        .expect("writer channel closed")
}

#[tokio::test]
async fn test_uplink_decode_airtime_and_operator() {
    let mut harness = start_pipeline();
    harness
        .inbound_tx
        .send(InboundMessage {
            route: TopicRoute::GatewayUp {
                gateway_id: "AA555A0000000000".into(),
            },
            payload: encode_uplink_frame(&data_phy(), "aa555a0000000000", -97, &[]),
            format: PayloadFormat::Protobuf,
            received_at: Utc::now(),
        })
        .await
        .unwrap();

    let packet = recv_packet(&mut harness).await;
    assert_eq!(packet.packet_type, PacketType::Data);
    assert_eq!(packet.dev_addr.as_deref(), Some("26011AAB"));
    assert_eq!(packet.operator, "The Things Network");
    assert_eq!(packet.airtime_us, 51_456);
    assert_eq!(packet.confirmed, Some(false));
    assert_eq!(packet.rssi, -97);
    assert_eq!(packet.gateway_id, "AA555A0000000000");

    let _ = harness.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_relay_detection_upserts_both_gateways() {
    let mut harness = start_pipeline();
    harness
        .inbound_tx
        .send(InboundMessage {
            route: TopicRoute::GatewayUp {
                gateway_id: "BBBB".into(),
            },
            payload: encode_uplink_frame(&data_phy(), "bbbb", -90, &[("relay_id", "AAAA")]),
            format: PayloadFormat::Protobuf,
            received_at: Utc::now(),
        })
        .await
        .unwrap();

    let packet = recv_packet(&mut harness).await;
    assert_eq!(packet.gateway_id, "AAAA");
    assert_eq!(packet.border_gateway_id.as_deref(), Some("BBBB"));

    let mut upserted = Vec::new();
    for _ in 0..2 {
        match timeout(Duration::from_secs(2), harness.meta_rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            MetaUpsert::Gateway(gateway) => upserted.push(gateway.gateway_id),
            MetaUpsert::CsDevice(_) => panic!("unexpected device upsert"),
        }
    }
    upserted.sort();
    assert_eq!(upserted, vec!["AAAA".to_string(), "BBBB".to_string()]);

    let _ = harness.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_join_then_uplink_backfills_dev_eui() {
    let mut harness = start_pipeline();

    harness
        .inbound_tx
        .send(InboundMessage {
            route: TopicRoute::GatewayUp {
                gateway_id: "AA".into(),
            },
            payload: encode_uplink_frame(&join_phy(), "aa", -95, &[]),
            format: PayloadFormat::Protobuf,
            received_at: Utc::now(),
        })
        .await
        .unwrap();

    let join = recv_packet(&mut harness).await;
    assert_eq!(join.packet_type, PacketType::JoinRequest);
    assert_eq!(join.join_eui.as_deref(), Some("70B3D57ED0000001"));
    assert_eq!(join.dev_eui.as_deref(), Some("0004A30B001B8C12"));
    assert_eq!(join.dev_addr, None);
    assert_eq!(join.operator, "The Things Network");
    let join_session = join.session_id.clone().expect("join carries session id");

    harness
        .inbound_tx
        .send(InboundMessage {
            route: TopicRoute::GatewayUp {
                gateway_id: "AA".into(),
            },
            payload: encode_uplink_frame(&data_phy(), "aa", -95, &[]),
            format: PayloadFormat::Protobuf,
            received_at: Utc::now(),
        })
        .await
        .unwrap();

    let data = recv_packet(&mut harness).await;
    assert_eq!(data.packet_type, PacketType::Data);
    // session linkage backfills the DevEUI from the join
    assert_eq!(data.session_id.as_deref(), Some(join_session.as_str()));
    assert_eq!(data.dev_eui.as_deref(), Some("0004A30B001B8C12"));

    let _ = harness.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_tx_ack_shape() {
    let mut harness = start_pipeline();

    let mut item = Vec::new();
    field_varint(&mut item, 1, 4); // COLLISION_PACKET
    let mut ack = Vec::new();
    field_varint(&mut ack, 2, 42);
    field_bytes(&mut ack, 3, &item);

    harness
        .inbound_tx
        .send(InboundMessage {
            route: TopicRoute::GatewayAck {
                gateway_id: "AA".into(),
            },
            payload: ack,
            format: PayloadFormat::Protobuf,
            received_at: Utc::now(),
        })
        .await
        .unwrap();

    let packet = recv_packet(&mut harness).await;
    assert_eq!(packet.packet_type, PacketType::TxAck);
    assert_eq!(packet.f_cnt, Some(42));
    assert_eq!(packet.operator, "CollisionPacket");
    assert_eq!(packet.rssi, 0);
    assert_eq!(packet.snr, 0.0);
    assert_eq!(packet.airtime_us, 0);

    let _ = harness.shutdown_tx.send(true);
}

#[tokio::test]
async fn test_app_uplink_persisted_and_broadcast() {
    let mut harness = start_pipeline();
    let mut cs_sub = harness.broadcaster.subscribe(Filter {
        source_mode: SourceMode::Chirpstack,
        ..Default::default()
    });

    let payload = serde_json::json!({
        "deviceInfo": {
            "devEui": "0102030405060708",
            "deviceName": "soil-probe-3",
            "applicationId": "12",
            "applicationName": "farm"
        },
        "devAddr": "26011aab",
        "rxInfo": [{"rssi": -101, "snr": -3.5}],
        "txInfo": {"frequency": 867_500_000u64,
                   "modulation": {"lora": {"spreadingFactor": 9, "bandwidth": 125_000}}},
        "data": "AQIDBA==",
        "fCnt": 88, "fPort": 2, "confirmed": false
    });

    harness
        .inbound_tx
        .send(InboundMessage {
            route: TopicRoute::App {
                application_id: "12".into(),
                dev_eui: "0102030405060708".into(),
                kind: loratrace::chirpstack::AppTopicKind::Up,
            },
            payload: payload.to_string().into_bytes(),
            format: PayloadFormat::Json,
            received_at: Utc::now(),
        })
        .await
        .unwrap();

    let cs_packet = timeout(Duration::from_secs(2), harness.cs_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(cs_packet.kind, CsEventKind::Up);
    assert_eq!(cs_packet.dev_eui, "0102030405060708");
    assert_eq!(cs_packet.operator, "farm");
    assert_eq!(cs_packet.dev_addr.as_deref(), Some("26011AAB"));
    assert!(cs_packet.airtime_us > 0);

    // the device upsert rides the meta channel
    match timeout(Duration::from_secs(2), harness.meta_rx.recv())
        .await
        .unwrap()
        .unwrap()
    {
        MetaUpsert::CsDevice(device) => {
            assert_eq!(device.dev_eui, "0102030405060708");
            assert_eq!(device.device_name, "soil-probe-3");
        }
        MetaUpsert::Gateway(_) => panic!("unexpected gateway upsert"),
    }

    // and the live feed sees it with source=chirpstack
    let live: serde_json::Value =
        serde_json::from_str(&cs_sub.rx.recv().await.unwrap()).unwrap();
    assert_eq!(live["source"], "chirpstack");
    assert_eq!(live["dev_eui"], "0102030405060708");

    let _ = harness.shutdown_tx.send(true);
}
