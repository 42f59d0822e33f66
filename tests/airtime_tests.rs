//! Airtime grid verification against an independent rendering of the
//! Semtech formula.

use loratrace::lorawan::{compute_airtime_us, time_on_air_us, AirtimeParams, CodingRate};

/// Straight transcription of the AN1200.22 formula, kept separate from the
/// production code path on purpose.
fn reference_airtime_us(sf: u32, bw: u32, pl: u32, cr: u32, preamble: u32) -> f64 {
    let t_sym = (1u64 << sf) as f64 / bw as f64 * 1_000_000.0;
    let de = if (sf >= 11 && bw == 125_000) || (sf == 12 && bw == 250_000) {
        1.0
    } else {
        0.0
    };
    let numerator = 8.0 * pl as f64 - 4.0 * sf as f64 + 28.0 + 16.0;
    let denominator = 4.0 * (sf as f64 - 2.0 * de);
    let payload_symb = 8.0 + ((numerator / denominator).ceil() * (cr + 4) as f64).max(0.0);
    t_sym * (preamble as f64 + 4.25 + payload_symb)
}

fn cr_for(value: u32) -> CodingRate {
    match value {
        2 => CodingRate::CR4_6,
        3 => CodingRate::CR4_7,
        4 => CodingRate::CR4_8,
        _ => CodingRate::CR4_5,
    }
}

#[test]
fn test_full_grid_within_one_microsecond() {
    for sf in 7..=12u32 {
        for bw in [125_000u32, 250_000, 500_000] {
            for cr in 1..=4u32 {
                for pl in [1u32, 16, 51, 128, 255] {
                    let expected = reference_airtime_us(sf, bw, pl, cr, 8);
                    let actual = compute_airtime_us(
                        &AirtimeParams::new(sf, bw, pl).with_coding_rate(cr_for(cr)),
                    );
                    assert!(
                        (actual as f64 - expected).abs() <= 1.0,
                        "SF{sf} BW{bw} CR4/{} PL{pl}: got {actual}, want {expected}",
                        cr + 4,
                    );
                }
            }
        }
    }
}

#[test]
fn test_spec_reference_point() {
    // SF7 / BW125 / PL16 / CR4/5 is the documented 51.456 ms uplink
    assert_eq!(time_on_air_us(Some(7), Some(125_000), 16, "4/5"), 51_456);
}

#[test]
fn test_airtime_monotonic_in_sf() {
    let mut last = 0;
    for sf in 7..=12 {
        let airtime = time_on_air_us(Some(sf), Some(125_000), 20, "4/5");
        assert!(
            airtime > last,
            "airtime must grow with SF: SF{sf} gave {airtime} after {last}"
        );
        last = airtime;
    }
}

#[test]
fn test_unknown_radio_params() {
    assert_eq!(time_on_air_us(None, None, 20, "4/5"), 0);
    assert_eq!(time_on_air_us(Some(7), None, 20, "4/5"), 0);
    assert_eq!(time_on_air_us(None, Some(125_000), 20, "4/5"), 0);
}
