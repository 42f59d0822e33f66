//! # Ingestion Pipeline
//!
//! The single consumer of the MQTT fan-in channel. Every inbound message is
//! decoded, enriched (airtime, operator, session linkage) and handed to the
//! batched writer and the live broadcaster. Decode failures are logged with
//! throttling and dropped; nothing here can stall the stream.

pub mod mqtt;
pub mod session;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::{mpsc, watch};

use crate::chirpstack::{
    application::AppUplink, decode_app_event, decode_downlink, decode_tx_ack, decode_uplink,
    AppEvent, AppTopicKind, GatewayUplink, PayloadFormat,
};
use crate::live::Broadcaster;
use crate::logging::LogThrottle;
use crate::lorawan::{parse_phy_payload, time_on_air_us, MType, PhyFrame};
use crate::model::{CsEventKind, CsPacket, GatewayUpsert, PacketType, ParsedPacket};
use crate::operators::OperatorMatcher;
use crate::store::writer::{CsDeviceUpsert, MetaUpsert, WriterHandle};

pub use mqtt::{classify_topic, spawn_reader, InboundMessage, TopicRoute};
pub use session::{SessionStamp, SessionTracker};

/// Counters for pipeline monitoring, logged periodically.
#[derive(Debug, Default, Clone, Copy)]
pub struct PipelineStats {
    pub gateway_received: u64,
    pub gateway_decoded: u64,
    pub app_received: u64,
    pub app_decoded: u64,
    pub decode_errors: u64,
    pub phy_errors: u64,
    pub dropped: u64,
}

/// The pipeline worker. Owns the session tracker; everything else is
/// shared services passed in at startup.
pub struct Pipeline {
    matcher: Arc<OperatorMatcher>,
    broadcaster: Arc<Broadcaster>,
    writer: WriterHandle,
    tracker: SessionTracker,
    stats: PipelineStats,
    decode_throttle: LogThrottle,
}

impl Pipeline {
    pub fn new(
        matcher: Arc<OperatorMatcher>,
        broadcaster: Arc<Broadcaster>,
        writer: WriterHandle,
        session_window: Duration,
    ) -> Self {
        Pipeline {
            matcher,
            broadcaster,
            writer,
            tracker: SessionTracker::new(session_window),
            stats: PipelineStats::default(),
            decode_throttle: LogThrottle::new(1000, 5),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats
    }

    /// Consume the fan-in channel until shutdown, sweeping the session map
    /// and logging stats on a timer.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<InboundMessage>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut sweep_timer = tokio::time::interval(std::time::Duration::from_secs(3600));
        let mut stats_timer = tokio::time::interval(std::time::Duration::from_secs(60));
        log::info!("pipeline worker started");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // drain whatever the readers already queued
                        while let Ok(message) = rx.try_recv() {
                            self.handle(message).await;
                        }
                        log::info!("pipeline worker shutting down");
                        return;
                    }
                }
                message = rx.recv() => match message {
                    Some(message) => self.handle(message).await,
                    None => {
                        log::info!("all MQTT readers gone, pipeline stopping");
                        return;
                    }
                },
                _ = sweep_timer.tick() => {
                    let evicted = self.tracker.sweep(Utc::now());
                    if evicted > 0 {
                        log::debug!("session sweep evicted {evicted} entries");
                    }
                }
                _ = stats_timer.tick() => {
                    let s = self.stats;
                    log::info!(
                        "pipeline: gw {}/{} app {}/{} decode_errors {} phy_errors {} dropped {}",
                        s.gateway_decoded, s.gateway_received,
                        s.app_decoded, s.app_received,
                        s.decode_errors, s.phy_errors, s.dropped,
                    );
                }
            }
        }
    }

    async fn handle(&mut self, message: InboundMessage) {
        match message.route {
            TopicRoute::GatewayUp { gateway_id } => {
                self.stats.gateway_received += 1;
                self.handle_gateway_up(&gateway_id, &message.payload, message.format, message.received_at)
                    .await;
            }
            TopicRoute::GatewayDown { gateway_id } => {
                self.stats.gateway_received += 1;
                self.handle_gateway_down(&gateway_id, &message.payload, message.format, message.received_at)
                    .await;
            }
            TopicRoute::GatewayAck { gateway_id } => {
                self.stats.gateway_received += 1;
                self.handle_gateway_ack(&gateway_id, &message.payload, message.format, message.received_at)
                    .await;
            }
            TopicRoute::GatewayStats => {}
            TopicRoute::App {
                application_id,
                dev_eui,
                kind,
            } => {
                self.stats.app_received += 1;
                self.handle_app_event(&application_id, &dev_eui, kind, &message.payload, message.received_at)
                    .await;
            }
        }
    }

    async fn emit_gateway(&mut self, packet: ParsedPacket) {
        self.broadcaster.publish_gateway(&packet);
        if self.writer.packets_tx.send(packet).await.is_err() {
            log::error!("writer channel closed, dropping packet");
        }
    }

    async fn upsert_gateway(&mut self, upsert: GatewayUpsert) {
        if self
            .writer
            .meta_tx
            .send(MetaUpsert::Gateway(upsert))
            .await
            .is_err()
        {
            log::error!("writer channel closed, dropping gateway upsert");
        }
    }

    async fn handle_gateway_up(
        &mut self,
        topic_gateway_id: &str,
        payload: &[u8],
        format: PayloadFormat,
        received_at: DateTime<Utc>,
    ) {
        let uplink = match decode_uplink(payload, format) {
            Ok(uplink) => uplink,
            Err(e) => {
                self.stats.decode_errors += 1;
                crate::log_warn_throttled!(self.decode_throttle, "gateway uplink decode: {e}");
                return;
            }
        };
        let phy = match parse_phy_payload(&uplink.phy_payload) {
            Ok(phy) => phy,
            Err(e) => {
                self.stats.phy_errors += 1;
                crate::log_warn_throttled!(self.decode_throttle, "uplink PHY parse: {e}");
                return;
            }
        };

        let rx_gateway_id = uplink
            .gateway_id
            .clone()
            .unwrap_or_else(|| topic_gateway_id.to_string())
            .to_ascii_uppercase();
        // a relayed packet is attributed to the relay; the forwarding
        // gateway is kept as border gateway
        let (gateway_id, border_gateway_id) = match &uplink.relay_id {
            Some(relay_id) => (relay_id.to_ascii_uppercase(), Some(rx_gateway_id.clone())),
            None => (rx_gateway_id.clone(), None),
        };

        let timestamp = uplink.time.unwrap_or(received_at);
        let airtime_us = time_on_air_us(
            uplink.spreading_factor,
            uplink.bandwidth,
            uplink.phy_payload.len(),
            &uplink.code_rate,
        );

        let packet = match self.build_uplink_packet(
            &phy,
            &uplink,
            gateway_id.clone(),
            border_gateway_id.clone(),
            timestamp,
            airtime_us,
        ) {
            Some(packet) => packet,
            None => {
                self.stats.dropped += 1;
                return;
            }
        };

        self.stats.gateway_decoded += 1;

        // the receiving chain is upserted on every sighting
        self.upsert_gateway(GatewayUpsert {
            gateway_id,
            name: uplink.gateway_name.clone(),
            latitude: uplink.location.map(|l| l.latitude),
            longitude: uplink.location.map(|l| l.longitude),
            ..Default::default()
        })
        .await;
        if let Some(border_id) = border_gateway_id {
            self.upsert_gateway(GatewayUpsert {
                gateway_id: border_id,
                ..Default::default()
            })
            .await;
        }

        self.emit_gateway(packet).await;
    }

    /// Type the PHY frame into a ParsedPacket; non-chartable message types
    /// (Join Accept, Rejoin, Proprietary) are dropped.
    fn build_uplink_packet(
        &mut self,
        phy: &PhyFrame,
        uplink: &GatewayUplink,
        gateway_id: String,
        border_gateway_id: Option<String>,
        timestamp: DateTime<Utc>,
        airtime_us: i64,
    ) -> Option<ParsedPacket> {
        let mut packet = ParsedPacket {
            timestamp,
            gateway_id,
            border_gateway_id,
            packet_type: PacketType::Data,
            dev_addr: None,
            join_eui: None,
            dev_eui: None,
            operator: String::new(),
            frequency: uplink.frequency,
            spreading_factor: uplink.spreading_factor,
            bandwidth: uplink.bandwidth,
            rssi: uplink.rssi,
            snr: uplink.snr,
            payload_size: uplink.phy_payload.len() as i32,
            airtime_us,
            f_cnt: None,
            f_port: None,
            confirmed: None,
            session_id: None,
        };

        match phy.mtype {
            MType::JoinRequest => {
                let join_eui = phy.join_eui.clone()?;
                let dev_eui = phy.dev_eui.clone()?;
                packet.packet_type = PacketType::JoinRequest;
                packet.operator = self.matcher.match_join_eui(&join_eui);
                packet.session_id = Some(self.tracker.on_join_request(
                    &dev_eui,
                    &join_eui,
                    &packet.operator,
                    timestamp,
                ));
                packet.join_eui = Some(join_eui);
                packet.dev_eui = Some(dev_eui);
            }
            m if m.is_data() => {
                let dev_addr = phy.dev_addr.clone()?;
                packet.operator = self.matcher.match_dev_addr(&dev_addr);
                packet.f_cnt = phy.f_cnt.map(|c| c as i64);
                packet.f_port = phy.f_port.map(|p| p as i16);
                packet.confirmed = phy.confirmed;
                if let Some(stamp) =
                    self.tracker
                        .on_data_uplink(&dev_addr, &packet.operator, timestamp)
                {
                    packet.session_id = Some(stamp.session_id);
                    packet.dev_eui = Some(stamp.dev_eui);
                }
                packet.dev_addr = Some(dev_addr);
            }
            _ => return None,
        }
        Some(packet)
    }

    async fn handle_gateway_down(
        &mut self,
        topic_gateway_id: &str,
        payload: &[u8],
        format: PayloadFormat,
        received_at: DateTime<Utc>,
    ) {
        let downlink = match decode_downlink(payload, format) {
            Ok(downlink) => downlink,
            Err(e) => {
                self.stats.decode_errors += 1;
                crate::log_warn_throttled!(self.decode_throttle, "gateway downlink decode: {e}");
                return;
            }
        };
        let phy = match parse_phy_payload(&downlink.phy_payload) {
            Ok(phy) => phy,
            Err(e) => {
                self.stats.phy_errors += 1;
                crate::log_warn_throttled!(self.decode_throttle, "downlink PHY parse: {e}");
                return;
            }
        };

        let gateway_id = topic_gateway_id.to_ascii_uppercase();
        let airtime_us = time_on_air_us(
            downlink.spreading_factor,
            downlink.bandwidth,
            downlink.phy_payload.len(),
            &downlink.code_rate,
        );

        // downlink rows have no radio metrics; join accepts on the downlink
        // path carry no readable fields but are still chartable airtime
        let (dev_addr, f_cnt, f_port, confirmed) = if phy.mtype.is_data() {
            (
                phy.dev_addr.clone(),
                phy.f_cnt.map(|c| c as i64),
                phy.f_port.map(|p| p as i16),
                phy.confirmed,
            )
        } else {
            (None, None, None, None)
        };

        let operator = match &dev_addr {
            Some(addr) => self.matcher.match_dev_addr(addr),
            None => crate::operators::UNKNOWN_OPERATOR.to_string(),
        };

        let packet = ParsedPacket {
            timestamp: received_at,
            gateway_id: gateway_id.clone(),
            border_gateway_id: None,
            packet_type: PacketType::Downlink,
            dev_addr,
            join_eui: None,
            dev_eui: None,
            operator,
            frequency: downlink.frequency,
            spreading_factor: downlink.spreading_factor,
            bandwidth: downlink.bandwidth,
            rssi: 0,
            snr: 0.0,
            payload_size: downlink.phy_payload.len() as i32,
            airtime_us,
            f_cnt,
            f_port,
            confirmed,
            session_id: None,
        };

        self.stats.gateway_decoded += 1;
        self.upsert_gateway(GatewayUpsert {
            gateway_id,
            ..Default::default()
        })
        .await;
        self.emit_gateway(packet).await;
    }

    async fn handle_gateway_ack(
        &mut self,
        topic_gateway_id: &str,
        payload: &[u8],
        format: PayloadFormat,
        received_at: DateTime<Utc>,
    ) {
        let ack = match decode_tx_ack(payload, format) {
            Ok(ack) => ack,
            Err(e) => {
                self.stats.decode_errors += 1;
                crate::log_warn_throttled!(self.decode_throttle, "tx-ack decode: {e}");
                return;
            }
        };

        // tx_ack rows carry the correlation id in f_cnt and the status in
        // operator; no radio metrics
        let packet = ParsedPacket {
            timestamp: received_at,
            gateway_id: topic_gateway_id.to_ascii_uppercase(),
            border_gateway_id: None,
            packet_type: PacketType::TxAck,
            dev_addr: None,
            join_eui: None,
            dev_eui: None,
            operator: ack.status,
            frequency: 0,
            spreading_factor: None,
            bandwidth: None,
            rssi: 0,
            snr: 0.0,
            payload_size: 0,
            airtime_us: 0,
            f_cnt: Some(ack.downlink_id),
            f_port: None,
            confirmed: None,
            session_id: None,
        };

        self.stats.gateway_decoded += 1;
        self.emit_gateway(packet).await;
    }

    async fn handle_app_event(
        &mut self,
        application_id: &str,
        topic_dev_eui: &str,
        kind: AppTopicKind,
        payload: &[u8],
        received_at: DateTime<Utc>,
    ) {
        let event = match decode_app_event(kind, payload) {
            Ok(event) => event,
            Err(e) => {
                self.stats.decode_errors += 1;
                crate::log_warn_throttled!(self.decode_throttle, "application event decode: {e}");
                return;
            }
        };

        let packet = match event {
            AppEvent::Up(up) => self.build_cs_uplink(application_id, topic_dev_eui, up, received_at),
            AppEvent::TxAck(tx_ack) => {
                let mut packet = cs_packet_base(
                    application_id,
                    topic_dev_eui,
                    &tx_ack.device_info,
                    tx_ack.time.unwrap_or(received_at),
                    CsEventKind::TxAck,
                );
                packet.f_cnt = tx_ack.f_cnt;
                packet.status = Some("OK".to_string());
                packet
            }
            AppEvent::Ack(ack) => {
                let mut packet = cs_packet_base(
                    application_id,
                    topic_dev_eui,
                    &ack.device_info,
                    ack.time.unwrap_or(received_at),
                    CsEventKind::Ack,
                );
                packet.f_cnt = ack.f_cnt;
                packet.status = Some(if ack.acknowledged { "ACK" } else { "NACK" }.to_string());
                packet
            }
            AppEvent::Down(down) => {
                let mut packet = cs_packet_base(
                    application_id,
                    topic_dev_eui,
                    &down.device_info,
                    received_at,
                    CsEventKind::Downlink,
                );
                packet.f_port = down.f_port;
                packet.payload_size = down.payload_size;
                packet.confirmed = down.confirmed;
                packet
            }
        };

        self.stats.app_decoded += 1;

        if self
            .writer
            .meta_tx
            .send(MetaUpsert::CsDevice(CsDeviceUpsert {
                dev_eui: packet.dev_eui.clone(),
                dev_addr: packet.dev_addr.clone(),
                device_name: packet.device_name.clone(),
                application_id: packet.application_id.clone(),
                application_name: packet.application_name.clone(),
            }))
            .await
            .is_err()
        {
            log::error!("writer channel closed, dropping device upsert");
        }

        self.broadcaster.publish_cs(&packet);
        // only uplinks are persisted; the rest is live-feed material
        if packet.kind == CsEventKind::Up {
            if let Err(e) = self.writer.cs_tx.send(packet).await {
                log::error!("writer channel closed, dropping cs packet: {e}");
            }
        }
    }

    fn build_cs_uplink(
        &mut self,
        application_id: &str,
        topic_dev_eui: &str,
        up: AppUplink,
        received_at: DateTime<Utc>,
    ) -> CsPacket {
        let airtime_us = time_on_air_us(
            up.spreading_factor,
            up.bandwidth,
            up.payload_size as usize,
            "4/5",
        );
        let mut packet = cs_packet_base(
            application_id,
            topic_dev_eui,
            &up.device_info,
            up.time.unwrap_or(received_at),
            CsEventKind::Up,
        );
        packet.dev_addr = up.dev_addr;
        packet.frequency = up.frequency;
        packet.spreading_factor = up.spreading_factor;
        packet.bandwidth = up.bandwidth;
        packet.rssi = up.rssi;
        packet.snr = up.snr;
        packet.payload_size = up.payload_size;
        packet.airtime_us = airtime_us;
        packet.f_cnt = up.f_cnt;
        packet.f_port = up.f_port;
        packet.confirmed = up.confirmed;
        packet
    }
}

fn cs_packet_base(
    application_id: &str,
    topic_dev_eui: &str,
    device_info: &crate::chirpstack::DeviceInfo,
    timestamp: DateTime<Utc>,
    kind: CsEventKind,
) -> CsPacket {
    let dev_eui = if device_info.dev_eui.is_empty() {
        topic_dev_eui.to_string()
    } else {
        device_info.dev_eui.clone()
    }
    .to_ascii_uppercase();
    let application_id = if device_info.application_id.is_empty() {
        application_id.to_string()
    } else {
        device_info.application_id.clone()
    };
    CsPacket {
        timestamp,
        kind,
        dev_eui,
        dev_addr: None,
        device_name: device_info.device_name.clone(),
        application_id,
        application_name: device_info.application_name.clone(),
        operator: device_info.operator(),
        frequency: 0,
        spreading_factor: None,
        bandwidth: None,
        rssi: 0,
        snr: 0.0,
        payload_size: 0,
        airtime_us: 0,
        f_cnt: None,
        f_port: None,
        confirmed: None,
        status: None,
    }
}
