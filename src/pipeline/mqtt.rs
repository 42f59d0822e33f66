//! # MQTT Consumer & Topic Dispatcher
//!
//! One reader task per configured broker. Each connects with rumqttc,
//! subscribes at QoS 0, classifies every inbound publish by topic shape and
//! forwards it into the pipeline channel. Connections auto-reconnect with a
//! fixed 5-second backoff; classification failures drop the message
//! silently.

use std::time::Duration;

use chrono::Utc;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, watch};

use crate::chirpstack::{parse_app_topic, AppTopicKind, PayloadFormat};
use crate::config::MqttServerConfig;
use crate::error::TraceError;

/// Fixed reconnect backoff.
const RECONNECT_BACKOFF: Duration = Duration::from_secs(5);

/// Where a message goes after topic classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicRoute {
    GatewayUp { gateway_id: String },
    GatewayDown { gateway_id: String },
    GatewayAck { gateway_id: String },
    /// `event/stats` is recognized but ignored.
    GatewayStats,
    App {
        application_id: String,
        dev_eui: String,
        kind: AppTopicKind,
    },
}

/// Classify a topic into its route, or `None` for anything unroutable.
///
/// Gateway topics may carry a region prefix
/// (`eu868/gateway/{id}/event/up`); application topics are anchored at the
/// first segment.
pub fn classify_topic(topic: &str) -> Option<TopicRoute> {
    if let Some((application_id, dev_eui, kind)) = parse_app_topic(topic) {
        return Some(TopicRoute::App {
            application_id,
            dev_eui,
            kind,
        });
    }

    let segments: Vec<&str> = topic.split('/').collect();
    let gw = segments.iter().position(|s| *s == "gateway")?;
    if segments.len() != gw + 4 || segments[gw + 2] != "event" {
        return None;
    }
    let gateway_id = segments[gw + 1].to_ascii_uppercase();
    match segments[gw + 3] {
        "up" => Some(TopicRoute::GatewayUp { gateway_id }),
        "down" => Some(TopicRoute::GatewayDown { gateway_id }),
        "ack" => Some(TopicRoute::GatewayAck { gateway_id }),
        "stats" => Some(TopicRoute::GatewayStats),
        _ => None,
    }
}

/// A classified message on its way to the pipeline worker.
#[derive(Debug)]
pub struct InboundMessage {
    pub route: TopicRoute,
    pub payload: Vec<u8>,
    pub format: PayloadFormat,
    pub received_at: chrono::DateTime<Utc>,
}

/// Spawn a reader task for one broker. The task runs until the shutdown
/// signal flips, reconnecting on every transport error.
pub fn spawn_reader(
    config: MqttServerConfig,
    tx: mpsc::Sender<InboundMessage>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let format = config.payload_format();
        let (host, port) = match config.host_port() {
            Ok(pair) => pair,
            Err(e) => {
                log::error!("invalid MQTT server {:?}: {e}", config.server);
                return;
            }
        };

        let client_id = format!("loratrace-{:08x}", rand::random::<u32>());
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username.clone(), password.clone());
        }

        let (client, mut event_loop) = AsyncClient::new(options, 64);
        let topic = config.topic.clone();

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        log::info!("MQTT reader for {} shutting down", config.server);
                        let _ = client.disconnect().await;
                        return;
                    }
                }
                event = event_loop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        log::info!("connected to {}, subscribing to {:?}", config.server, topic);
                        if let Err(e) = client.subscribe(topic.clone(), QoS::AtMostOnce).await {
                            log::warn!("subscribe failed on {}: {e}", config.server);
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        let Some(route) = classify_topic(&publish.topic) else {
                            log::trace!("dropping unroutable topic {}", publish.topic);
                            continue;
                        };
                        if matches!(route, TopicRoute::GatewayStats) {
                            continue;
                        }
                        let message = InboundMessage {
                            route,
                            payload: publish.payload.to_vec(),
                            format,
                            received_at: Utc::now(),
                        };
                        if tx.send(message).await.is_err() {
                            // pipeline is gone, nothing left to feed
                            return;
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::warn!(
                            "MQTT connection to {} lost: {e}; retrying in {}s",
                            config.server,
                            RECONNECT_BACKOFF.as_secs()
                        );
                        tokio::time::sleep(RECONNECT_BACKOFF).await;
                    }
                }
            }
        }
    })
}

impl MqttServerConfig {
    /// Split `host:port` (with optional `mqtt://` scheme) for rumqttc.
    pub fn host_port(&self) -> Result<(String, u16), TraceError> {
        let stripped = self
            .server
            .trim_start_matches("mqtt://")
            .trim_start_matches("tcp://");
        match stripped.rsplit_once(':') {
            Some((host, port)) => {
                let port: u16 = port
                    .parse()
                    .map_err(|_| TraceError::Config(format!("bad MQTT port in {}", self.server)))?;
                Ok((host.to_string(), port))
            }
            None => Ok((stripped.to_string(), 1883)),
        }
    }
}
