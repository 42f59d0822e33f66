//! # Static NetID Prefix Table
//!
//! DevAddr prefixes assigned by the LoRa Alliance to network operators. The
//! high bits of a DevAddr encode the NetID, so a longest-prefix match over
//! this table attributes a packet to its carrier without any decryption.
//!
//! Entries are `(prefix, bits, name)` where `prefix` is the big-endian
//! 32-bit DevAddr value with the low bits zeroed and `bits` the prefix
//! length. The table is deliberately data-only; rule construction and
//! ordering live in the matcher.

/// Built-in DevAddr prefix assignments, merged below custom rules.
pub const NETID_PREFIXES: &[(u32, u8, &str)] = &[
    // ===== EXPERIMENTAL / PRIVATE RANGES =====
    (0x0000_0000, 7, "Experimental"),
    (0x0200_0000, 7, "Experimental"),

    // ===== COMMUNITY NETWORKS =====
    (0x2600_0000, 7, "The Things Network"),
    (0x7800_0000, 7, "Helium"),

    // ===== COMMERCIAL OPERATORS =====
    (0x0400_0000, 7, "Actility"),
    (0x0600_0000, 7, "Proximus"),
    (0x0800_0000, 7, "Swisscom"),
    (0x0A00_0000, 7, "Orbiwise"),
    (0x0C00_0000, 7, "KPN"),
    (0x0E00_0000, 7, "Orange"),
    (0x1000_0000, 7, "SoftBank"),
    (0x1200_0000, 7, "Bouygues Telecom"),
    (0x1400_0000, 7, "SK Telecom"),
    (0x1600_0000, 7, "Senet"),
    (0x1800_0000, 7, "Everynet"),
    (0x1A00_0000, 7, "Loriot"),
    (0x1C00_0000, 7, "A2A Smart City"),
    (0x1E00_0000, 7, "Digita"),
    (0x2000_0000, 7, "Comcast (machineQ)"),
    (0x2200_0000, 7, "Tata Communications"),
    (0x2400_0000, 7, "Spark"),
    (0x2800_0000, 7, "Lacuna Space"),
    (0x2A00_0000, 7, "Cisco"),
    (0x2C00_0000, 7, "Charter Communications"),
    (0x2E00_0000, 7, "Netmore"),
    (0x3000_0000, 7, "Unidata"),
    (0x3200_0000, 7, "Tektelic"),
    (0x3400_0000, 7, "Kerlink"),
    (0x3600_0000, 7, "Machines Talk"),
    (0x3800_0000, 7, "SenRa"),
    (0x3A00_0000, 7, "American Tower"),
    (0x3C00_0000, 7, "ThingsIX"),
    (0x3E00_0000, 7, "Milesight"),

    // ===== TYPE 3 (NwkID 11 bits) BLOCKS =====
    (0xE000_0000, 11, "Schneider Electric"),
    (0xE020_0000, 11, "Alibaba Cloud"),
    (0xE040_0000, 11, "Tencent"),
    (0xE060_0000, 11, "Amazon Sidewalk"),
    (0xE080_0000, 11, "Deutsche Telekom"),
];

/// JoinEUI prefixes mapping join servers to their operator or manufacturer.
/// `(prefix, bits, name)` with the prefix in the high bits of the 64-bit
/// JoinEUI.
pub const JOIN_EUI_PREFIXES: &[(u64, u8, &str)] = &[
    (0x70B3_D57E_D000_0000, 40, "The Things Network"),
    (0x70B3_D500_0000_0000, 24, "Semtech OUI block"),
    (0x6081_F900_0000_0000, 24, "Helium"),
    (0xA840_4100_0000_0000, 24, "Dragino"),
    (0x0016_C000_0000_0000, 24, "Elsys"),
    (0x0004_A300_0000_0000, 24, "Microchip"),
    (0x647F_DA00_0000_0000, 24, "Tektelic"),
    (0x24E1_2400_0000_0000, 24, "Xiaomi"),
    (0x0080_0000_0000_0000, 24, "Actility"),
];
