// File: src/strings.rs
//
// String builtins (spec §4.2 "Strings"), grounded on
// `original_source/src/str_utils.c`'s `string_substr`/`string_find`/
// `string_split_to_array`/`array_join_with_sep`. `substr`/`find` address
// bytes, not code points, matching the original's C-string semantics and
// the `Len` opcode's `s.len()` byte count (vm.rs) so all three agree on
// what a "unit" is.

use crate::value::Value;

/// Empty separator splits into single-code-unit strings; otherwise splits
/// by the literal separator.
pub fn split(s: &str, sep: &str) -> Vec<Value> {
    if sep.is_empty() {
        s.chars().map(|c| Value::Str(c.to_string())).collect()
    } else {
        s.split(sep).map(|part| Value::Str(part.to_string())).collect()
    }
}

/// Concatenate an Array of values (each stringified via the non-recursive
/// summary form) with a separator.
pub fn join(items: &[Value], sep: &str) -> String {
    items
        .iter()
        .map(|v| v.to_string_summary())
        .collect::<Vec<_>>()
        .join(sep)
}

/// `(s, start, len)` with bounds clamped to the string, addressing bytes
/// (matching `string_substr` in `original_source/src/str_utils.c`, and
/// `Len`'s `s.len()` byte count) rather than code points. A start/len that
/// splits a multi-byte UTF-8 sequence clamps to the nearest char boundary.
pub fn substr(s: &str, start: i64, len: i64) -> String {
    let slen = s.len() as i64;
    let start = start.clamp(0, slen);
    let end = (start + len.max(0)).clamp(start, slen);
    let mut start = start as usize;
    let mut end = end as usize;
    while start > 0 && !s.is_char_boundary(start) {
        start -= 1;
    }
    while end < s.len() && !s.is_char_boundary(end) {
        end += 1;
    }
    s[start..end].to_string()
}

/// First occurrence of needle in haystack as a byte offset, -1 if absent
/// (matching `string_find`'s `strstr`-based byte offset and `Len`'s byte
/// count).
pub fn find(haystack: &str, needle: &str) -> i64 {
    match haystack.find(needle) {
        Some(byte_idx) => byte_idx as i64,
        None => -1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_empty_sep_is_per_char() {
        let parts = split("abc", "");
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn split_by_literal_sep() {
        let parts = split("a,b,c", ",");
        assert_eq!(parts.len(), 3);
    }

    #[test]
    fn substr_clamps() {
        assert_eq!(substr("hello", 1, 3), "ell");
        assert_eq!(substr("hello", -2, 3), "hel");
        assert_eq!(substr("hello", 2, 100), "llo");
    }

    #[test]
    fn find_returns_byte_index() {
        assert_eq!(find("hello world", "world"), 6);
        assert_eq!(find("hello", "xyz"), -1);
    }

    #[test]
    fn substr_and_find_agree_with_byte_len_on_multibyte_input() {
        let s = "h\u{00e9}llo";
        assert_eq!(s.len(), 6);
        assert_eq!(substr(s, 0, s.len() as i64), s);
        assert_eq!(find(s, "llo"), 3);
    }
}
