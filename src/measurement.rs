//! ADC to resistance conversion for the high-side sense circuit.
//!
//! The fixture drives the cable through a 20 ohm sense resistor from a 5 V
//! rail and reads the far side with a 10-bit ADC. The calibration reading
//! taken on a zero-ohm reference cable fixes the loop current; the cable's
//! resistance is the extra voltage drop over that current.

use crate::calibration::CalibrationRecord;

pub const ADC_FULL_SCALE: f64 = 1023.0;
pub const REFERENCE_VOLTS: f64 = 5.0;
pub const SENSE_RESISTOR_OHMS: f64 = 20.0;

/// Below this loop current the calibration is treated as degenerate.
pub const MIN_CAL_CURRENT_AMPS: f64 = 0.001;

fn adc_to_volts(adc: u16) -> f64 {
    (adc as f64 / ADC_FULL_SCALE) * REFERENCE_VOLTS
}

/// Converts a raw reading against a zero-reference reading.
///
/// Degenerate calibrations yield 0 and negative results are clamped to 0.
pub fn milliohms_from_adc(raw_adc: u16, cal_adc: u16) -> u32 {
    let sense_v = adc_to_volts(raw_adc);
    let cal_v = adc_to_volts(cal_adc);
    let cal_current = (REFERENCE_VOLTS - cal_v) / SENSE_RESISTOR_OHMS;
    if cal_current <= MIN_CAL_CURRENT_AMPS {
        return 0;
    }

    let resistance_ohms = ((sense_v - cal_v) / cal_current).max(0.0);
    (resistance_ohms * 1000.0).round() as u32
}

/// Converts `raw_adc` using the channel's calibration record.
pub fn convert(raw_adc: u16, calibration: &CalibrationRecord) -> u32 {
    milliohms_from_adc(raw_adc, calibration.zero_adc)
}

pub fn milliohms_to_ohms(milliohms: u32) -> f64 {
    milliohms as f64 / 1000.0
}
