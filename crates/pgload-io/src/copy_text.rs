//! COPY text-protocol encoding.
//!
//! Records are tab-separated and newline-terminated. NULL is the `\N`
//! sentinel; backslash, tab, newline, and carriage return inside text are
//! backslash-escaped; booleans render as `t`/`f`, dates as `YYYY-MM-DD`, and
//! byte arrays as `\x`-hex (with the leading backslash itself escaped on the
//! wire).

use pgload_core::SqlValue;
use std::fmt::Write as _;

/// The COPY text null sentinel, as it appears on the wire.
pub const NULL_SENTINEL: &str = "\\N";

/// Encode one value into its wire form.
pub fn format_value(value: &SqlValue) -> String {
    match value {
        SqlValue::Null => NULL_SENTINEL.to_string(),
        SqlValue::Boolean(true) => "t".to_string(),
        SqlValue::Boolean(false) => "f".to_string(),
        SqlValue::Integer(i) => i.to_string(),
        SqlValue::Real(f) => format_real(*f),
        SqlValue::Text(s) => escape_text(s),
        SqlValue::Bytes(b) => format_bytes(b),
        SqlValue::Date(d) => d.format("%Y-%m-%d").to_string(),
    }
}

/// Encode one row: tab-separated values, newline-terminated.
pub fn format_row(row: &[SqlValue]) -> String {
    let mut out = String::new();
    for (i, value) in row.iter().enumerate() {
        if i > 0 {
            out.push('\t');
        }
        out.push_str(&format_value(value));
    }
    out.push('\n');
    out
}

/// Backslash-escape the characters the text protocol treats as structure.
pub fn escape_text(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn format_real(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f.is_infinite() {
        if f > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        f.to_string()
    }
}

fn format_bytes(bytes: &[u8]) -> String {
    // bytea hex form; the backslash is doubled for the text protocol
    let mut out = String::with_capacity(3 + bytes.len() * 2);
    out.push_str("\\\\x");
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn null_renders_as_sentinel() {
        assert_eq!(format_value(&SqlValue::Null), "\\N");
    }

    #[test]
    fn booleans_render_as_t_and_f() {
        assert_eq!(format_value(&SqlValue::Boolean(true)), "t");
        assert_eq!(format_value(&SqlValue::Boolean(false)), "f");
    }

    #[test]
    fn dates_render_iso() {
        let d = NaiveDate::from_ymd_opt(2020, 3, 1).unwrap();
        assert_eq!(format_value(&SqlValue::Date(d)), "2020-03-01");
    }

    #[test]
    fn structural_characters_are_escaped() {
        assert_eq!(escape_text("a\tb"), "a\\tb");
        assert_eq!(escape_text("a\nb"), "a\\nb");
        assert_eq!(escape_text("a\rb"), "a\\rb");
        assert_eq!(escape_text("a\\b"), "a\\\\b");
        assert_eq!(escape_text("plain"), "plain");
    }

    #[test]
    fn bytes_render_as_escaped_hex() {
        assert_eq!(
            format_value(&SqlValue::Bytes(vec![0xde, 0xad, 0x00])),
            "\\\\xdead00"
        );
    }

    #[test]
    fn nonfinite_reals_use_server_spellings() {
        assert_eq!(format_value(&SqlValue::Real(f64::NAN)), "NaN");
        assert_eq!(format_value(&SqlValue::Real(f64::INFINITY)), "Infinity");
        assert_eq!(
            format_value(&SqlValue::Real(f64::NEG_INFINITY)),
            "-Infinity"
        );
        assert_eq!(format_value(&SqlValue::Real(1.5)), "1.5");
    }

    #[test]
    fn rows_are_tab_separated_and_newline_terminated() {
        let row = vec![
            SqlValue::Text("Alice".into()),
            SqlValue::Integer(42),
            SqlValue::Null,
        ];
        assert_eq!(format_row(&row), "Alice\t42\t\\N\n");
    }
}
