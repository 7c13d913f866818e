use super::{
    error::Error,
    value::{Dictionary, Value},
};
use std::collections::HashSet;

/// Maximum number of decimal digits accepted in a byte string length.
const MAX_LENGTH_DIGITS: usize = 10;
/// Largest byte string length accepted (2^31 - 1).
const MAX_STRING_LEN: u64 = i32::MAX as u64;
/// Maximum nesting of lists and dictionaries.
const MAX_DEPTH: usize = 64;

/// Decode a single value that must span the whole input.
pub fn decode(data: &[u8]) -> Result<Value, Error> {
    let mut pos = 0;
    let value = decode_value(data, &mut pos, 0)?;

    if pos != data.len() {
        return Err(Error::invalid(pos, "trailing data after value"));
    }

    Ok(value)
}

/// Decode an input that must consist of exactly one dictionary.
///
/// The first byte is checked before anything else is parsed, so inputs that are not a
/// dictionary are rejected without any further work.
pub fn decode_dictionary(data: &[u8]) -> Result<Dictionary, Error> {
    match data.first() {
        Some(b'd') => (),
        Some(_) => return Err(Error::invalid(0, "expected a dictionary")),
        None => return Err(Error::invalid(0, "empty input")),
    }

    let mut pos = 0;
    let dict = decode_dict(data, &mut pos, 0)?;

    if pos != data.len() {
        return Err(Error::invalid(pos, "trailing data after value"));
    }

    Ok(dict)
}

fn decode_value(data: &[u8], pos: &mut usize, depth: usize) -> Result<Value, Error> {
    if depth > MAX_DEPTH {
        return Err(Error::unsupported(*pos, "nesting too deep"));
    }

    match data.get(*pos) {
        Some(b'i') => decode_integer(data, pos).map(Value::Integer),
        Some(b'l') => decode_list(data, pos, depth),
        Some(b'd') => decode_dict(data, pos, depth).map(Value::Dict),
        Some(b'0'..=b'9') => decode_bytes(data, pos).map(|b| Value::Bytes(b.to_vec())),
        Some(_) => Err(Error::invalid(*pos, "unexpected character")),
        None => Err(Error::invalid(*pos, "unexpected end of input")),
    }
}

fn decode_integer(data: &[u8], pos: &mut usize) -> Result<i64, Error> {
    // Skip the 'i'.
    *pos += 1;
    let start = *pos;

    let negative = data.get(*pos) == Some(&b'-');
    if negative {
        *pos += 1;
    }

    let digits_start = *pos;
    while data.get(*pos).map_or(false, u8::is_ascii_digit) {
        *pos += 1;
    }
    let digits = &data[digits_start..*pos];

    match data.get(*pos) {
        Some(b'e') => (),
        Some(_) => return Err(Error::invalid(*pos, "unexpected character in integer")),
        None => return Err(Error::invalid(*pos, "unexpected end of input in integer")),
    }

    if digits.is_empty() {
        return Err(Error::invalid(start, "integer has no digits"));
    }

    if digits[0] == b'0' && (digits.len() > 1 || negative) {
        return Err(Error::invalid(start, "integer has a leading zero"));
    }

    // Only ASCII digits and an optional sign at this point, so the only possible failure is
    // overflow.
    let value = std::str::from_utf8(&data[start..*pos])
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Error::unsupported(start, "integer does not fit in 64 bits"))?;

    // Skip the 'e'.
    *pos += 1;

    Ok(value)
}

fn decode_bytes<'a>(data: &'a [u8], pos: &mut usize) -> Result<&'a [u8], Error> {
    let start = *pos;

    while data.get(*pos).map_or(false, u8::is_ascii_digit) {
        *pos += 1;

        if *pos - start > MAX_LENGTH_DIGITS {
            return Err(Error::unsupported(start, "byte string length has too many digits"));
        }
    }

    if *pos == start {
        return Err(Error::invalid(start, "expected byte string length"));
    }

    match data.get(*pos) {
        Some(b':') => (),
        Some(_) => return Err(Error::invalid(*pos, "expected ':' after byte string length")),
        None => {
            return Err(Error::invalid(
                *pos,
                "unexpected end of input in byte string length",
            ))
        }
    }

    let len = std::str::from_utf8(&data[start..*pos])
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| Error::invalid(start, "malformed byte string length"))?;

    if len > MAX_STRING_LEN {
        return Err(Error::unsupported(start, "byte string is too long"));
    }

    // Skip the ':'.
    *pos += 1;

    let end = pos
        .checked_add(len as usize)
        .filter(|end| *end <= data.len())
        .ok_or_else(|| Error::invalid(*pos, "byte string is truncated"))?;

    let bytes = &data[*pos..end];
    *pos = end;

    Ok(bytes)
}

fn decode_list(data: &[u8], pos: &mut usize, depth: usize) -> Result<Value, Error> {
    *pos += 1;
    let mut list = Vec::new();

    loop {
        match data.get(*pos) {
            Some(b'e') => break,
            Some(_) => list.push(decode_value(data, pos, depth + 1)?),
            None => return Err(Error::invalid(*pos, "unterminated list")),
        }
    }

    *pos += 1;
    Ok(Value::List(list))
}

fn decode_dict(data: &[u8], pos: &mut usize, depth: usize) -> Result<Dictionary, Error> {
    if depth > MAX_DEPTH {
        return Err(Error::unsupported(*pos, "nesting too deep"));
    }

    *pos += 1;
    let mut entries = Vec::new();
    let mut seen = HashSet::new();

    loop {
        match data.get(*pos) {
            Some(b'e') => break,
            Some(b'0'..=b'9') => (),
            Some(_) => return Err(Error::invalid(*pos, "dictionary key must be a byte string")),
            None => return Err(Error::invalid(*pos, "unterminated dictionary")),
        }

        let key_offset = *pos;
        let key = decode_bytes(data, pos)?;

        if !seen.insert(key) {
            return Err(Error::invalid(key_offset, "duplicate dictionary key"));
        }

        let value = decode_value(data, pos, depth + 1)?;
        entries.push((key.to_vec(), value));
    }

    *pos += 1;
    Ok(Dictionary::from_entries(entries))
}
