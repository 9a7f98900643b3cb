//! Bit packing helpers for the GPU-facing records

/// IEEE 754 binary16 bits of an f32, round-to-nearest-even, clamping to
/// +-inf outside the representable range
pub fn f32_to_f16_bits(value: f32) -> u16 {
    let bits = value.to_bits();
    let sign = ((bits >> 16) & 0x8000) as u16;
    let exponent = ((bits >> 23) & 0xff) as i32;
    let mantissa = bits & 0x007f_ffff;

    if exponent == 0xff {
        // inf / nan
        let nan = if mantissa != 0 { 0x0200 } else { 0 };
        return sign | 0x7c00 | nan;
    }

    let unbiased = exponent - 127;
    if unbiased > 15 {
        return sign | 0x7c00; // overflow to inf
    }
    if unbiased < -24 {
        return sign; // underflow to zero
    }

    if unbiased < -14 {
        // subnormal
        let shift = (-14 - unbiased) as u32;
        let mantissa = (mantissa | 0x0080_0000) >> (13 + shift);
        return sign | mantissa as u16;
    }

    let half_exponent = ((unbiased + 15) as u32) << 10;
    let half_mantissa = mantissa >> 13;
    // round to nearest even
    let round_bit = (mantissa >> 12) & 1;
    let half = (half_exponent | half_mantissa) + round_bit;
    sign | half as u16
}

pub fn f16_bits_to_f32(bits: u16) -> f32 {
    let sign = ((bits & 0x8000) as u32) << 16;
    let exponent = ((bits >> 10) & 0x1f) as u32;
    let mantissa = (bits & 0x03ff) as u32;

    let f32_bits = match (exponent, mantissa) {
        (0, 0) => sign,
        (0, m) => {
            // subnormal: normalize
            let shift = m.leading_zeros() - 21;
            let mantissa = (m << shift) & 0x03ff;
            let exponent = 113 - shift;
            sign | (exponent << 23) | (mantissa << 13)
        }
        (0x1f, 0) => sign | 0x7f80_0000,
        (0x1f, m) => sign | 0x7f80_0000 | (m << 13),
        (e, m) => sign | ((e + 127 - 15) << 23) | (m << 13),
    };
    f32::from_bits(f32_bits)
}

/// Two half floats in one word, x low, y high
pub fn pack_two_f16(x: f32, y: f32) -> u32 {
    f32_to_f16_bits(x) as u32 | ((f32_to_f16_bits(y) as u32) << 16)
}

pub fn unpack_two_f16(packed: u32) -> (f32, f32) {
    (
        f16_bits_to_f32(packed as u16),
        f16_bits_to_f32((packed >> 16) as u16),
    )
}

/// RGBA in [0,1] to 8 bits per channel, r in the low byte
pub fn pack_rgba8(r: f32, g: f32, b: f32, a: f32) -> u32 {
    let q = |v: f32| (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u32;
    q(r) | (q(g) << 8) | (q(b) << 16) | (q(a) << 24)
}

/// Color in the low 24 bits, light type in the high byte
pub fn pack_color_and_type(r: f32, g: f32, b: f32, light_type: u8) -> u32 {
    (pack_rgba8(r, g, b, 0.0) & 0x00ff_ffff) | ((light_type as u32) << 24)
}

/// Unit direction as 3x10 bit signed fixed point
pub fn pack_direction(x: f32, y: f32, z: f32) -> u32 {
    let q = |v: f32| {
        let quantized = ((v.clamp(-1.0, 1.0) * 0.5 + 0.5) * 1023.0 + 0.5) as u32;
        quantized & 0x3ff
    };
    q(x) | (q(y) << 10) | (q(z) << 20)
}

pub fn unpack_direction(packed: u32) -> (f32, f32, f32) {
    let u = |bits: u32| (bits & 0x3ff) as f32 / 1023.0 * 2.0 - 1.0;
    (u(packed), u(packed >> 10), u(packed >> 20))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f16_round_trips_common_values() {
        for value in [0.0f32, 1.0, -1.0, 0.5, 2.5, 65504.0, -0.125, 100.0] {
            let bits = f32_to_f16_bits(value);
            let back = f16_bits_to_f32(bits);
            assert!(
                (back - value).abs() <= value.abs() * 1e-3,
                "{} -> {:#x} -> {}",
                value,
                bits,
                back
            );
        }
    }

    #[test]
    fn f16_saturates_and_handles_zero() {
        assert_eq!(f32_to_f16_bits(1e10), 0x7c00);
        assert_eq!(f32_to_f16_bits(-1e10), 0xfc00);
        assert_eq!(f32_to_f16_bits(0.0), 0);
        assert!(f16_bits_to_f32(f32_to_f16_bits(1e-10)).abs() < 1e-6);
    }

    #[test]
    fn two_f16_pack_in_order() {
        let packed = pack_two_f16(1.5, -2.0);
        let (x, y) = unpack_two_f16(packed);
        assert!((x - 1.5).abs() < 1e-3);
        assert!((y + 2.0).abs() < 1e-3);
    }

    #[test]
    fn rgba8_and_color_type() {
        assert_eq!(pack_rgba8(1.0, 0.0, 0.0, 1.0), 0xff00_00ff);
        assert_eq!(pack_rgba8(0.0, 1.0, 0.0, 0.0), 0x0000_ff00);

        let packed = pack_color_and_type(1.0, 1.0, 1.0, 2);
        assert_eq!(packed >> 24, 2);
        assert_eq!(packed & 0x00ff_ffff, 0x00ff_ffff);
    }

    #[test]
    fn directions_quantize_within_tolerance() {
        for dir in [
            (1.0, 0.0, 0.0),
            (0.0, -1.0, 0.0),
            (0.577, 0.577, -0.577),
        ] {
            let packed = pack_direction(dir.0, dir.1, dir.2);
            let (x, y, z) = unpack_direction(packed);
            assert!((x - dir.0).abs() < 2.0 / 1023.0);
            assert!((y - dir.1).abs() < 2.0 / 1023.0);
            assert!((z - dir.2).abs() < 2.0 / 1023.0);
        }
    }
}
