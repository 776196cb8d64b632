//! Thermo-hygrometers only broadcast; there is nothing to encode.
use super::{check_len, percent, CodecError};
use crate::state::MeterState;

const ADVERTISEMENT_LEN: usize = 6;

pub(super) fn decode_advertisement(bytes: &[u8]) -> Result<MeterState, CodecError> {
    check_len(bytes, ADVERTISEMENT_LEN, "meter advertisement")?;
    let sign = if bytes[4] & 0b1000_0000 != 0 { 1.0 } else { -1.0 };
    let whole = f32::from(bytes[4] & 0b0111_1111);
    let tenths = f32::from(bytes[3] & 0b0000_1111) / 10.0;
    Ok(MeterState {
        temperature_c: sign * (whole + tenths),
        fahrenheit_display: bytes[5] & 0b1000_0000 != 0,
        humidity: percent(bytes[5]),
        battery: percent(bytes[2]),
    })
}
