//! # LoRa Time-on-Air Calculator
//!
//! Implements the Semtech symbol-time formula (SX126x datasheet / AN1200.22)
//! for the airtime of a single LoRa transmission, in microseconds. The
//! analyzer attaches this to every decoded packet and the duty-cycle
//! accounting sums it per window.

/// Coding Rate (CR) for LoRa
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodingRate {
    CR4_5,
    CR4_6,
    CR4_7,
    CR4_8,
}

impl CodingRate {
    /// Parse a ChirpStack-style coding-rate string (`"4/5"`, `"CR_4_5"`).
    /// Unknown strings fall back to 4/5, the LoRaWAN default.
    pub fn parse(s: &str) -> Self {
        match s {
            "4/6" | "CR_4_6" => CodingRate::CR4_6,
            "4/7" | "CR_4_7" => CodingRate::CR4_7,
            "4/8" | "CR_4_8" => CodingRate::CR4_8,
            _ => CodingRate::CR4_5,
        }
    }

    /// CR value 1..4 as used in the symbol-count formula.
    fn value(&self) -> u32 {
        match self {
            CodingRate::CR4_5 => 1,
            CodingRate::CR4_6 => 2,
            CodingRate::CR4_7 => 3,
            CodingRate::CR4_8 => 4,
        }
    }
}

/// Inputs to the time-on-air formula.
///
/// Defaults match LoRaWAN uplinks: explicit header, CRC on, 8-symbol
/// preamble, low-data-rate optimization decided from SF/BW.
#[derive(Debug, Clone, Copy)]
pub struct AirtimeParams {
    pub spreading_factor: u32,
    pub bandwidth_hz: u32,
    pub payload_len: u32,
    pub coding_rate: CodingRate,
    pub explicit_header: bool,
    pub crc_on: bool,
    pub preamble_len: u32,
}

impl AirtimeParams {
    pub fn new(spreading_factor: u32, bandwidth_hz: u32, payload_len: u32) -> Self {
        AirtimeParams {
            spreading_factor,
            bandwidth_hz,
            payload_len,
            coding_rate: CodingRate::CR4_5,
            explicit_header: true,
            crc_on: true,
            preamble_len: 8,
        }
    }

    pub fn with_coding_rate(mut self, coding_rate: CodingRate) -> Self {
        self.coding_rate = coding_rate;
        self
    }
}

/// Low-data-rate optimization is mandatory for SF11/SF12 at 125 kHz and
/// SF12 at 250 kHz.
fn requires_ldro(sf: u32, bw_hz: u32) -> bool {
    (sf >= 11 && bw_hz == 125_000) || (sf == 12 && bw_hz == 250_000)
}

/// Compute time on air in microseconds for the given parameters.
///
/// `T_sym = 2^SF / BW`, then
/// `payloadSymbNb = 8 + max(ceil((8*PL - 4*SF + 28 + 16*CRC - 20*H) /
/// (4*(SF - 2*DE))) * (CR + 4), 0)`, and
/// `T = T_sym * (preamble + 4.25 + payloadSymbNb)`.
pub fn compute_airtime_us(params: &AirtimeParams) -> i64 {
    let sf = params.spreading_factor;
    let bw = params.bandwidth_hz;
    if sf == 0 || bw == 0 {
        return 0;
    }

    let t_sym_us = (1u64 << sf) as f64 / bw as f64 * 1_000_000.0;

    let pl = params.payload_len as f64;
    let crc = if params.crc_on { 1.0 } else { 0.0 };
    // H = 0 with an explicit header, 1 in implicit mode
    let h = if params.explicit_header { 0.0 } else { 1.0 };
    let de = if requires_ldro(sf, bw) { 1.0 } else { 0.0 };

    let numerator = 8.0 * pl - 4.0 * sf as f64 + 28.0 + 16.0 * crc - 20.0 * h;
    let denominator = 4.0 * (sf as f64 - 2.0 * de);
    let symbols = ((numerator / denominator).ceil() * (params.coding_rate.value() + 4) as f64)
        .max(0.0);
    let payload_symb_nb = 8.0 + symbols;

    let t_on_air = t_sym_us * (params.preamble_len as f64 + 4.25 + payload_symb_nb);
    t_on_air.round() as i64
}

/// Convenience entry point for the pipeline: tolerates the optional radio
/// fields of a decoded event and returns 0 when SF or BW is unknown.
pub fn time_on_air_us(
    spreading_factor: Option<i16>,
    bandwidth_hz: Option<i64>,
    payload_len: usize,
    coding_rate: &str,
) -> i64 {
    let (sf, bw) = match (spreading_factor, bandwidth_hz) {
        (Some(sf), Some(bw)) if sf > 0 && bw > 0 => (sf as u32, bw as u32),
        _ => return 0,
    };
    compute_airtime_us(
        &AirtimeParams::new(sf, bw, payload_len as u32)
            .with_coding_rate(CodingRate::parse(coding_rate)),
    )
}
