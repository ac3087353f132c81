use nom::number::complete::{be_u16, be_u32};
use nom::IResult;

/// Field parsers for the fixed-point register payloads sent by the
/// inverter. Each wire field is a big-endian integer with a documented
/// decimal divisor.
pub struct Utils;

impl Utils {
    pub fn be_u16_div10(input: &[u8]) -> IResult<&[u8], f64> {
        let (input, v) = be_u16(input)?;
        Ok((input, v as f64 / 10.0))
    }

    pub fn be_u16_div100(input: &[u8]) -> IResult<&[u8], f64> {
        let (input, v) = be_u16(input)?;
        Ok((input, v as f64 / 100.0))
    }

    pub fn be_u16_div1000(input: &[u8]) -> IResult<&[u8], f64> {
        let (input, v) = be_u16(input)?;
        Ok((input, v as f64 / 1000.0))
    }

    // energy-per-day counters are plain watt hours
    pub fn be_u16_div1(input: &[u8]) -> IResult<&[u8], f64> {
        let (input, v) = be_u16(input)?;
        Ok((input, v as f64))
    }

    pub fn be_u32_div1000(input: &[u8]) -> IResult<&[u8], f64> {
        let (input, v) = be_u32(input)?;
        Ok((input, v as f64 / 1000.0))
    }
}
