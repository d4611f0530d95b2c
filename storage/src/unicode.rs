//! UTF-16LE helpers for on-disk name handling.
//!
//! NTFS stores names as UTF-16LE. Lone surrogates do occur on real volumes,
//! so decoding replaces them with `?` instead of failing the whole name.

use alloc::string::String;

/// Replacement for invalid surrogate sequences.
const REPLACEMENT_CODE_POINT: u32 = '?' as u32;

/// Decode the next code point from a UTF-16LE code-unit slice.
///
/// Consumes one or two code units, advancing `index`. Invalid surrogate
/// sequences yield the replacement code point. Returns `None` when `index`
/// is past the end of `units`.
pub fn utf16le_next_code_point(units: &[u16], index: &mut usize) -> Option<u32> {
    let unit0 = *units.get(*index)?;

    if (0xD800..=0xDBFF).contains(&unit0) {
        if let Some(&unit1) = units.get(*index + 1) {
            if (0xDC00..=0xDFFF).contains(&unit1) {
                let high = (unit0 - 0xD800) as u32;
                let low = (unit1 - 0xDC00) as u32;
                *index += 2;
                return Some(0x10000 + (high << 10) + low);
            }
        }

        *index += 1;
        return Some(REPLACEMENT_CODE_POINT);
    }

    if (0xDC00..=0xDFFF).contains(&unit0) {
        *index += 1;
        return Some(REPLACEMENT_CODE_POINT);
    }

    *index += 1;
    Some(unit0 as u32)
}

/// Convert UTF-16LE code units to an owned UTF-8 string.
///
/// Invalid surrogate sequences are replaced by `?`.
pub fn utf16le_to_utf8(units: &[u16]) -> String {
    let mut output = String::with_capacity(units.len());
    let mut index = 0;

    while let Some(code_point) = utf16le_next_code_point(units, &mut index) {
        // The replacement path guarantees every produced value is a scalar.
        let ch = char::from_u32(code_point).unwrap_or('?');
        output.push(ch);
    }

    output
}

/// Decode UTF-16LE from raw little-endian bytes.
///
/// `byte_len` must be even; odd trailing bytes are ignored.
pub fn utf16le_bytes_to_utf8(bytes: &[u8]) -> String {
    let mut units = alloc::vec::Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        units.push(u16::from_le_bytes([pair[0], pair[1]]));
    }
    utf16le_to_utf8(&units)
}

fn ascii_to_lower(code_point: u32) -> u32 {
    if (b'A' as u32..=b'Z' as u32).contains(&code_point) {
        code_point + (b'a' as u32 - b'A' as u32)
    } else {
        code_point
    }
}

/// Compare two UTF-16LE strings with ASCII-only case folding.
///
/// Non-ASCII code points are compared by value.
pub fn utf16le_eq_ignore_ascii_case(left: &[u16], right: &[u16]) -> bool {
    let mut left_index = 0;
    let mut right_index = 0;

    loop {
        let left_cp = utf16le_next_code_point(left, &mut left_index);
        let right_cp = utf16le_next_code_point(right, &mut right_index);

        match (left_cp, right_cp) {
            (None, None) => return true,
            (Some(l), Some(r)) => {
                if ascii_to_lower(l) != ascii_to_lower(r) {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

/// Compare two UTF-8 names with ASCII-only case folding.
///
/// Non-ASCII characters are compared by code point, matching the behavior of
/// the UTF-16LE comparison above.
pub fn utf8_eq_ignore_ascii_case(left: &str, right: &str) -> bool {
    let mut left_chars = left.chars();
    let mut right_chars = right.chars();

    loop {
        match (left_chars.next(), right_chars.next()) {
            (None, None) => return true,
            (Some(l), Some(r)) => {
                if ascii_to_lower(l as u32) != ascii_to_lower(r as u32) {
                    return false;
                }
            }
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(text: &str) -> alloc::vec::Vec<u16> {
        text.encode_utf16().collect()
    }

    #[test]
    fn converts_bmp_text() {
        assert_eq!(utf16le_to_utf8(&units("kernel32.dll")), "kernel32.dll");
        assert_eq!(utf16le_to_utf8(&units("données")), "données");
    }

    #[test]
    fn converts_surrogate_pairs() {
        // U+1F4BE floppy disk, encoded as a surrogate pair.
        let pair = [0xD83D, 0xDCBE];
        assert_eq!(utf16le_to_utf8(&pair), "\u{1F4BE}");
    }

    #[test]
    fn replaces_lone_surrogates() {
        // High surrogate with no low surrogate, then a normal letter.
        let broken = [0xD800, b'a' as u16];
        assert_eq!(utf16le_to_utf8(&broken), "?a");

        // Unpaired low surrogate between letters.
        let broken = [b'a' as u16, 0xDC00, b'b' as u16];
        assert_eq!(utf16le_to_utf8(&broken), "a?b");
    }

    #[test]
    fn code_point_count_round_trip() {
        let text = "a\u{1F4BE}b";
        let encoded = units(text);
        let decoded = utf16le_to_utf8(&encoded);
        assert_eq!(decoded.chars().count(), text.chars().count());
    }

    #[test]
    fn ascii_case_insensitive_compare() {
        assert!(utf16le_eq_ignore_ascii_case(&units("$I30"), &units("$i30")));
        assert!(!utf16le_eq_ignore_ascii_case(&units("$I30"), &units("$I31")));
        assert!(utf8_eq_ignore_ascii_case("Kernel32.DLL", "kernel32.dll"));
        // Non-ASCII must not be case-folded.
        assert!(!utf8_eq_ignore_ascii_case("é", "É"));
    }

    #[test]
    fn byte_decoder_matches_unit_decoder() {
        let encoded = units("System32");
        let mut bytes = alloc::vec::Vec::new();
        for unit in &encoded {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        assert_eq!(utf16le_bytes_to_utf8(&bytes), "System32");
    }
}
