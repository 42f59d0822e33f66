//! # Subscriber Filters
//!
//! Every live subscriber carries a compiled [`Filter`]; each packet is
//! evaluated against every subscriber and dropped per-subscriber on the
//! first failing predicate. Prefix strings are compiled to `(value, mask)`
//! pairs once at subscription time.

use crate::model::{LivePacket, PacketType};
use crate::operators::parse_prefix;
use crate::util::hex::dev_addr_to_u32;

/// Which pipeline a subscriber listens to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SourceMode {
    #[default]
    Gateway,
    Chirpstack,
}

/// Device-ownership filtering: keep only owned devices, or only foreign
/// ones, by DevAddr prefix membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Owned,
    Foreign,
}

/// A compiled DevAddr prefix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompiledPrefix {
    prefix: u32,
    mask: u32,
}

impl CompiledPrefix {
    fn matches(&self, addr: u32) -> bool {
        (addr & self.mask) == self.prefix
    }
}

/// Gateway text fields the search predicate may see, fed from the
/// broadcaster's metadata cache.
#[derive(Debug, Clone, Default)]
pub struct GatewayText {
    pub name: Option<String>,
    pub alias: Option<String>,
    pub group_name: Option<String>,
}

/// Compiled subscriber filter.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    /// Exact gateway match.
    pub gateway_id: Option<String>,
    /// Gateway-set membership.
    pub gateway_ids: Option<Vec<String>>,
    pub packet_types: Option<Vec<PacketType>>,
    /// RSSI bounds, applied to uplinks only.
    pub rssi_min: Option<i32>,
    pub rssi_max: Option<i32>,
    pub ownership: Option<Ownership>,
    pub prefixes: Vec<CompiledPrefix>,
    /// Case-insensitive substring over the whitelisted text fields.
    pub search: Option<String>,
    pub source_mode: SourceMode,
}

impl Filter {
    /// Compile prefix strings (`"26000000/7"`); unparsable entries are
    /// ignored.
    pub fn with_prefixes(mut self, prefixes: &[String]) -> Self {
        self.prefixes = prefixes
            .iter()
            .filter_map(|s| parse_prefix(s))
            .map(|(prefix, bits)| {
                let mask = if bits == 0 {
                    0
                } else {
                    u32::MAX << (32 - bits as u32)
                };
                CompiledPrefix {
                    prefix: prefix & mask,
                    mask,
                }
            })
            .collect();
        self
    }

    fn gateway_matches(&self, packet: &LivePacket) -> bool {
        if let Some(wanted) = &self.gateway_id {
            if !packet.gateway_id.eq_ignore_ascii_case(wanted) {
                return false;
            }
        }
        if let Some(set) = &self.gateway_ids {
            if !set
                .iter()
                .any(|id| packet.gateway_id.eq_ignore_ascii_case(id))
            {
                return false;
            }
        }
        true
    }

    fn type_matches(&self, packet: &LivePacket) -> bool {
        match &self.packet_types {
            Some(types) => types.contains(&packet.packet_type),
            None => true,
        }
    }

    /// RSSI bounds apply to `data` and `join_request` only; downlink and
    /// tx_ack rows store zeros that must not be range-checked.
    fn rssi_matches(&self, packet: &LivePacket) -> bool {
        if !packet.packet_type.is_uplink() {
            return true;
        }
        if let Some(min) = self.rssi_min {
            if packet.rssi < min {
                return false;
            }
        }
        if let Some(max) = self.rssi_max {
            if packet.rssi > max {
                return false;
            }
        }
        true
    }

    /// Ownership applies to `data` packets only; every other type passes
    /// through regardless of any DevAddr it carries (a downlink keeps its
    /// DevAddr but is not ownership-filtered).
    fn ownership_matches(&self, packet: &LivePacket) -> bool {
        let Some(mode) = self.ownership else {
            return true;
        };
        if packet.packet_type != PacketType::Data {
            return true;
        }
        let Some(addr) = packet.dev_addr.as_deref().and_then(dev_addr_to_u32) else {
            return true;
        };
        let owned = self.prefixes.iter().any(|p| p.matches(addr));
        match mode {
            Ownership::Owned => owned,
            Ownership::Foreign => !owned,
        }
    }

    fn search_matches(&self, packet: &LivePacket, gateway: Option<&GatewayText>) -> bool {
        let Some(needle) = &self.search else {
            return true;
        };
        let needle = needle.to_lowercase();
        let mut haystacks: Vec<&str> = vec![&packet.gateway_id, &packet.operator];
        if let Some(text) = gateway {
            haystacks.extend(text.name.as_deref());
            haystacks.extend(text.alias.as_deref());
            haystacks.extend(text.group_name.as_deref());
        }
        if let Some(name) = &packet.gateway_name {
            haystacks.push(name);
        }
        haystacks.extend(packet.dev_addr.as_deref());
        haystacks.extend(packet.dev_eui.as_deref());
        haystacks.extend(packet.join_eui.as_deref());

        haystacks
            .iter()
            .any(|field| field.to_lowercase().contains(&needle))
    }

    /// Evaluate the whole predicate chain.
    pub fn matches(&self, packet: &LivePacket, gateway: Option<&GatewayText>) -> bool {
        self.gateway_matches(packet)
            && self.type_matches(packet)
            && self.rssi_matches(packet)
            && self.ownership_matches(packet)
            && self.search_matches(packet, gateway)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ParsedPacket;
    use chrono::{TimeZone, Utc};

    fn live(packet_type: PacketType, dev_addr: Option<&str>, rssi: i32) -> LivePacket {
        let packet = ParsedPacket {
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
            rssi,
            snr: 0.0,
            payload_size: 12,
            airtime_us: 46_336,
            f_cnt: Some(1),
            f_port: Some(1),
            confirmed: Some(false),
            session_id: None,
        };
        LivePacket::from_gateway(&packet, None)
    }

    #[test]
    fn test_type_and_rssi() {
        let filter = Filter {
            packet_types: Some(vec![PacketType::Data]),
            rssi_min: Some(-100),
            ..Default::default()
        };
        assert!(filter.matches(&live(PacketType::Data, Some("26011AAB"), -97), None));
        assert!(!filter.matches(&live(PacketType::Data, Some("26011AAB"), -110), None));
        assert!(!filter.matches(&live(PacketType::JoinRequest, None, -97), None));
    }

    #[test]
    fn test_rssi_ignored_for_downlink() {
        let filter = Filter {
            rssi_min: Some(-50),
            ..Default::default()
        };
        // downlink rows store rssi 0 but are not range-checked
        assert!(filter.matches(&live(PacketType::Downlink, Some("26011AAB"), 0), None));
        assert!(filter.matches(&live(PacketType::TxAck, None, 0), None));
    }

    #[test]
    fn test_ownership_complement() {
        let owned = Filter {
            ownership: Some(Ownership::Owned),
            ..Default::default()
        }
        .with_prefixes(&["26000000/7".to_string()]);
        let foreign = Filter {
            ownership: Some(Ownership::Foreign),
            ..Default::default()
        }
        .with_prefixes(&["26000000/7".to_string()]);

        for addr in ["26011AAB", "27FFFFFF", "78000001", "00000001"] {
            let packet = live(PacketType::Data, Some(addr), -90);
            // accepted by owned iff rejected by foreign
            assert_ne!(
                owned.matches(&packet, None),
                foreign.matches(&packet, None),
                "addr {addr}"
            );
        }

        // non-data types pass both
        let join = live(PacketType::JoinRequest, None, -90);
        assert!(owned.matches(&join, None));
        assert!(foreign.matches(&join, None));

        // a downlink carries a DevAddr but is still not ownership-filtered
        let downlink = live(PacketType::Downlink, Some("26011AAB"), 0);
        assert!(owned.matches(&downlink, None));
        assert!(foreign.matches(&downlink, None));
    }

    #[test]
    fn test_gateway_set() {
        let filter = Filter {
            gateway_ids: Some(vec!["aa555a0000000000".into(), "BB".into()]),
            ..Default::default()
        };
        assert!(filter.matches(&live(PacketType::Data, Some("26011AAB"), -90), None));

        let filter = Filter {
            gateway_ids: Some(vec!["CC".into()]),
            ..Default::default()
        };
        assert!(!filter.matches(&live(PacketType::Data, Some("26011AAB"), -90), None));
    }

    #[test]
    fn test_search_over_gateway_text() {
        let filter = Filter {
            search: Some("rooftop".into()),
            ..Default::default()
        };
        let meta = GatewayText {
            name: Some("Rooftop North".into()),
            alias: None,
            group_name: None,
        };
        assert!(filter.matches(&live(PacketType::Data, Some("26011AAB"), -90), Some(&meta)));
        assert!(!filter.matches(&live(PacketType::Data, Some("26011AAB"), -90), None));

        // operator text is searchable too
        let filter = Filter {
            search: Some("things".into()),
            ..Default::default()
        };
        assert!(filter.matches(&live(PacketType::Data, Some("26011AAB"), -90), None));
    }
}
