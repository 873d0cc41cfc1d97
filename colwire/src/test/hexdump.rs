//! Annotated hexdump helper for inspecting encoded buffers in test failures.

use crate::tag;

/// Render `data` as rows of 16 hex bytes, each line prefixed with its
/// offset and suffixed with a best-effort guess at the tag kind of the
/// first byte on that line.
pub fn render_hexdump(data: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in data.chunks(16).enumerate() {
        let offset = row * 16;
        out.push_str(&format!("{:06x}  ", offset));
        for b in chunk {
            out.push_str(&format!("{:02x} ", b));
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }
        out.push_str(&format!(" | {}\n", describe_tag(chunk[0])));
    }
    out
}

fn describe_tag(tagbyte: u8) -> &'static str {
    if tag::is_index_ref(tagbyte) {
        return "index-ref";
    }
    match tag::tag_id(tagbyte) {
        tag::HEADER => "header",
        tag::TABLE => "table",
        tag::ROW => "row",
        tag::FLAGS => "flags",
        _ => "?",
    }
}

#[cfg(test)]
mod inline_tests {
    use super::*;

    #[cfg(test)]
    use test_log::test;

    #[test]
    fn renders_one_line_per_16_bytes() {
        let data: Vec<u8> = (0..20).collect();
        let s = render_hexdump(&data);
        assert_eq!(s.lines().count(), 2);
    }
}
