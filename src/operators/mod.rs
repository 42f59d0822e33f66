//! # Operator Matching
//!
//! Longest-prefix attribution of packets to network operators. Two rule
//! tables are kept: DevAddr prefixes (NetID assignments merged with custom
//! rules from config and database) and JoinEUI prefixes for join requests.
//!
//! The live ruleset is an immutable snapshot behind an `Arc`; a reload
//! builds a new snapshot and swaps the pointer, so in-flight matches keep
//! the table they started with.

pub mod netid;

use std::sync::{Arc, RwLock};

use crate::util::hex::{decode_hex, dev_addr_to_u32};

/// Name returned when no prefix matches.
pub const UNKNOWN_OPERATOR: &str = "Unknown";
/// Name returned for a JoinEUI that decodes as printable ASCII.
pub const PRIVATE_OPERATOR: &str = "Private";

/// A single DevAddr prefix rule.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorRule {
    /// Prefix value with the low bits zeroed.
    pub prefix: u32,
    /// Contiguous high-bit mask derived from `bits`.
    pub mask: u32,
    /// Prefix length in bits.
    pub bits: u8,
    pub name: String,
    pub priority: i32,
    pub color: Option<String>,
}

impl OperatorRule {
    pub fn new(prefix: u32, bits: u8, name: &str, priority: i32) -> Self {
        let mask = mask_for_bits(bits);
        OperatorRule {
            prefix: prefix & mask,
            mask,
            bits,
            name: name.to_string(),
            priority,
            color: None,
        }
    }

    fn matches(&self, addr: u32) -> bool {
        (addr & self.mask) == self.prefix
    }
}

/// A JoinEUI prefix rule (64-bit space).
#[derive(Debug, Clone, PartialEq)]
pub struct JoinEuiRule {
    pub prefix: u64,
    pub mask: u64,
    pub bits: u8,
    pub name: String,
}

impl JoinEuiRule {
    pub fn new(prefix: u64, bits: u8, name: &str) -> Self {
        let mask = mask_for_bits_u64(bits);
        JoinEuiRule {
            prefix: prefix & mask,
            mask,
            bits,
            name: name.to_string(),
        }
    }
}

fn mask_for_bits(bits: u8) -> u32 {
    if bits == 0 {
        0
    } else if bits >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - bits)
    }
}

fn mask_for_bits_u64(bits: u8) -> u64 {
    if bits == 0 {
        0
    } else if bits >= 64 {
        u64::MAX
    } else {
        u64::MAX << (64 - bits)
    }
}

/// Parse a `"26000000/7"` prefix string into `(prefix, bits)`.
///
/// The hex part may be shorter than 8 digits; it is left-aligned into the
/// high bits, matching how NetID blocks are written.
pub fn parse_prefix(s: &str) -> Option<(u32, u8)> {
    let (hex_part, bits_part) = s.split_once('/')?;
    let bits: u8 = bits_part.trim().parse().ok()?;
    if bits > 32 {
        return None;
    }
    let hex_part = hex_part.trim();
    if hex_part.is_empty() || hex_part.len() > 8 || !hex_part.chars().all(|c| c.is_ascii_hexdigit())
    {
        return None;
    }
    let value = u32::from_str_radix(hex_part, 16).ok()?;
    // left-align short prefixes: "26/7" means 0x26000000
    let shift = (8 - hex_part.len()) * 4;
    Some((value << shift, bits))
}

/// A custom rule supplied by config or the `custom_operators` table.
#[derive(Debug, Clone, Default)]
pub struct CustomOperator {
    /// `"26000000/7"`-style prefix strings; empty for color-only entries.
    pub prefixes: Vec<String>,
    pub name: String,
    pub priority: Option<i32>,
    pub color: Option<String>,
}

/// Default priority for custom rules; built-in NetID rules sit at 0.
pub const CUSTOM_RULE_PRIORITY: i32 = 100;

/// Immutable snapshot of both rule tables.
#[derive(Debug, Default)]
pub struct RuleSet {
    dev_addr_rules: Vec<OperatorRule>,
    join_eui_rules: Vec<JoinEuiRule>,
}

impl RuleSet {
    /// Build a snapshot: built-in tables merged with custom rules, sorted by
    /// descending priority, then descending prefix length. Ties keep
    /// insertion order (custom rules before built-ins at equal priority
    /// never happens since built-ins are priority 0).
    pub fn build(custom: &[CustomOperator]) -> Self {
        let mut rules: Vec<OperatorRule> = Vec::new();

        for op in custom {
            let priority = op.priority.unwrap_or(CUSTOM_RULE_PRIORITY);
            for prefix_str in &op.prefixes {
                match parse_prefix(prefix_str) {
                    Some((prefix, bits)) => {
                        let mut rule = OperatorRule::new(prefix, bits, &op.name, priority);
                        rule.color = op.color.clone();
                        rules.push(rule);
                    }
                    None => {
                        log::warn!(
                            "ignoring unparsable operator prefix {:?} for {:?}",
                            prefix_str,
                            op.name
                        );
                    }
                }
            }
        }

        for &(prefix, bits, name) in netid::NETID_PREFIXES {
            rules.push(OperatorRule::new(prefix, bits, name, 0));
        }

        // color-only entries attach a color to same-named rules
        for op in custom {
            if op.prefixes.is_empty() {
                if let Some(color) = &op.color {
                    for rule in rules.iter_mut().filter(|r| r.name == op.name) {
                        rule.color = Some(color.clone());
                    }
                }
            }
        }

        // stable: equal (priority, bits) keeps insertion order
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(b.bits.cmp(&a.bits)));

        let mut join_eui_rules: Vec<JoinEuiRule> = netid::JOIN_EUI_PREFIXES
            .iter()
            .map(|&(prefix, bits, name)| JoinEuiRule::new(prefix, bits, name))
            .collect();
        join_eui_rules.sort_by(|a, b| b.bits.cmp(&a.bits));

        RuleSet {
            dev_addr_rules: rules,
            join_eui_rules,
        }
    }

    /// First-match scan over the ordered DevAddr rules.
    pub fn match_addr(&self, addr: u32) -> Option<&OperatorRule> {
        self.dev_addr_rules.iter().find(|rule| rule.matches(addr))
    }

    pub fn rules(&self) -> &[OperatorRule] {
        &self.dev_addr_rules
    }
}

/// The matcher service handed to the pipeline at startup.
///
/// Matching reads are lock-free after a momentary read-lock to clone the
/// snapshot `Arc`; `reload` builds a fresh snapshot and swaps the pointer.
#[derive(Debug)]
pub struct OperatorMatcher {
    snapshot: RwLock<Arc<RuleSet>>,
}

impl OperatorMatcher {
    pub fn new(custom: &[CustomOperator]) -> Self {
        OperatorMatcher {
            snapshot: RwLock::new(Arc::new(RuleSet::build(custom))),
        }
    }

    /// Swap in a rebuilt ruleset. In-flight matches keep the old snapshot.
    pub fn reload(&self, custom: &[CustomOperator]) {
        let fresh = Arc::new(RuleSet::build(custom));
        *self.snapshot.write().expect("operator ruleset lock poisoned") = fresh;
    }

    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.snapshot
            .read()
            .expect("operator ruleset lock poisoned")
            .clone()
    }

    /// Resolve a DevAddr hex string to an operator name.
    pub fn match_dev_addr(&self, dev_addr: &str) -> String {
        let Some(addr) = dev_addr_to_u32(dev_addr) else {
            return UNKNOWN_OPERATOR.to_string();
        };
        match self.snapshot().match_addr(addr) {
            Some(rule) => rule.name.clone(),
            None => UNKNOWN_OPERATOR.to_string(),
        }
    }

    /// Resolve a JoinEUI hex string: prefix table first, then the
    /// printable-ASCII heuristic for private join servers.
    pub fn match_join_eui(&self, join_eui: &str) -> String {
        let Ok(bytes) = decode_hex(join_eui) else {
            return UNKNOWN_OPERATOR.to_string();
        };
        if bytes.len() != 8 {
            return UNKNOWN_OPERATOR.to_string();
        }
        let value = u64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]);

        let snapshot = self.snapshot();
        for rule in &snapshot.join_eui_rules {
            if (value & rule.mask) == rule.prefix {
                return rule.name.clone();
            }
        }

        if bytes.iter().all(|b| (0x20..=0x7E).contains(b)) {
            return PRIVATE_OPERATOR.to_string();
        }
        UNKNOWN_OPERATOR.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_prefix() {
        assert_eq!(parse_prefix("26000000/7"), Some((0x2600_0000, 7)));
        assert_eq!(parse_prefix("26/7"), Some((0x2600_0000, 7)));
        assert_eq!(parse_prefix("E020/11"), Some((0xE020_0000, 11)));
        assert_eq!(parse_prefix("26000000"), None);
        assert_eq!(parse_prefix("26000000/33"), None);
        assert_eq!(parse_prefix("xyz/7"), None);
    }

    #[test]
    fn test_ttn_match() {
        let matcher = OperatorMatcher::new(&[]);
        assert_eq!(matcher.match_dev_addr("26011AAB"), "The Things Network");
        assert_eq!(matcher.match_dev_addr("FFFFFFFF"), UNKNOWN_OPERATOR);
        assert_eq!(matcher.match_dev_addr("not-hex"), UNKNOWN_OPERATOR);
    }

    #[test]
    fn test_custom_rule_outranks_builtin() {
        let custom = vec![CustomOperator {
            prefixes: vec!["26010000/16".into()],
            name: "Our Fleet".into(),
            priority: None,
            color: None,
        }];
        let matcher = OperatorMatcher::new(&custom);
        assert_eq!(matcher.match_dev_addr("26011AAB"), "Our Fleet");
        // outside the /16 the builtin still wins
        assert_eq!(matcher.match_dev_addr("26FF0000"), "The Things Network");
    }

    #[test]
    fn test_equal_priority_longer_prefix_wins() {
        let custom = vec![
            CustomOperator {
                prefixes: vec!["26000000/7".into()],
                name: "Wide".into(),
                priority: Some(50),
                color: None,
            },
            CustomOperator {
                prefixes: vec!["26010000/16".into()],
                name: "Narrow".into(),
                priority: Some(50),
                color: None,
            },
        ];
        let matcher = OperatorMatcher::new(&custom);
        assert_eq!(matcher.match_dev_addr("26011AAB"), "Narrow");
        assert_eq!(matcher.match_dev_addr("27000001"), "Wide");
    }

    #[test]
    fn test_equal_priority_and_bits_keeps_insertion_order() {
        let custom = vec![
            CustomOperator {
                prefixes: vec!["26010000/16".into()],
                name: "First".into(),
                priority: Some(50),
                color: None,
            },
            CustomOperator {
                prefixes: vec!["26010000/16".into()],
                name: "Second".into(),
                priority: Some(50),
                color: None,
            },
        ];
        let matcher = OperatorMatcher::new(&custom);
        assert_eq!(matcher.match_dev_addr("26010001"), "First");
    }

    #[test]
    fn test_join_eui_table_and_private() {
        let matcher = OperatorMatcher::new(&[]);
        assert_eq!(
            matcher.match_join_eui("70B3D57ED0000001"),
            "The Things Network"
        );
        // "JOINSRVR" in ASCII
        assert_eq!(matcher.match_join_eui("4A4F494E53525652"), PRIVATE_OPERATOR);
        assert_eq!(matcher.match_join_eui("FFFF000000000000"), UNKNOWN_OPERATOR);
        assert_eq!(matcher.match_join_eui("1234"), UNKNOWN_OPERATOR);
    }

    #[test]
    fn test_reload_swaps_snapshot() {
        let matcher = OperatorMatcher::new(&[]);
        let before = matcher.snapshot();
        assert_eq!(matcher.match_dev_addr("26011AAB"), "The Things Network");

        matcher.reload(&[CustomOperator {
            prefixes: vec!["26000000/7".into()],
            name: "Renamed".into(),
            priority: None,
            color: None,
        }]);
        assert_eq!(matcher.match_dev_addr("26011AAB"), "Renamed");
        // the old snapshot is still intact for in-flight matches
        assert_eq!(
            before.match_addr(0x26011AAB).unwrap().name,
            "The Things Network"
        );
    }

    #[test]
    fn test_color_only_entry_attaches_color() {
        let custom = vec![CustomOperator {
            prefixes: vec![],
            name: "The Things Network".into(),
            priority: None,
            color: Some("#00aaff".into()),
        }];
        let matcher = OperatorMatcher::new(&custom);
        let snapshot = matcher.snapshot();
        let rule = snapshot.match_addr(0x26011AAB).unwrap();
        assert_eq!(rule.color.as_deref(), Some("#00aaff"));
    }
}
