//! Result-payload XML markers (§6, §9).
//!
//! Kept as opaque byte streams everywhere except the two places that
//! actually need to recognise them: the run loop synthesises them, and
//! the tail stream (C7) parses just enough to spot `value_in_blob`. No
//! general XML parser is pulled in — a narrow prefix/attribute match is
//! all either direction needs.

/// `<JoshuaError Severity="40" ErrorMessage="…"/>` — wraps a transactional
/// insertion failure so it still becomes a result row (§7 propagation
/// policy: "anything that crosses the run boundary becomes a structured
/// result").
pub fn error_payload(message: &str) -> String {
    format!(
        r#"<Test><JoshuaError Severity="40" ErrorMessage="{}"/></Test>"#,
        escape_attr(message)
    )
}

/// `<JoshuaMessage Severity="10" Error="JoshuaTimeout" TimeoutCommandRun="…"/>`
/// — synthesised when a run is cancelled by wall-clock timeout and either
/// there is no `timeout_command`, or it could not be run.
pub fn timeout_payload(timeout_command_run: bool) -> String {
    format!(
        r#"<Test><JoshuaMessage Severity="10" Error="JoshuaTimeout" TimeoutCommandRun="{timeout_command_run}"/></Test>"#
    )
}

/// `<JoshuaMessage Severity="10" Message="value_in_blob" BlobKey="<seed>"
/// BlobVersion="2"/>` — the large-output spill marker (§4.4).
pub fn value_in_blob_marker(seed: u64) -> String {
    format!(
        r#"<Test><JoshuaMessage Message="value_in_blob" BlobKey="{seed}" BlobVersion="2"/></Test>"#
    )
}

/// A parsed `value_in_blob` marker, as read back by the tail stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMarker {
    pub blob_key: String,
    pub version: u8,
}

/// §9 "narrow tag-matching test": recognise the marker without parsing
/// full XML. Returns `None` for anything else, including well-formed XML
/// this crate doesn't care about.
pub fn parse_value_in_blob(text: &str) -> Option<BlobMarker> {
    if !text.trim_start().starts_with("<Test><JoshuaMessage") {
        return None;
    }
    if !text.contains(r#"Message="value_in_blob""#) {
        return None;
    }
    let blob_key = extract_attr(text, "BlobKey")?;
    let version = extract_attr(text, "BlobVersion")
        .and_then(|v| v.parse::<u8>().ok())
        .unwrap_or(1);
    Some(BlobMarker { blob_key, version })
}

fn extract_attr(text: &str, name: &str) -> Option<String> {
    let needle = format!(r#"{name}=""#);
    let start = text.find(&needle)? + needle.len();
    let end = text[start..].find('"')? + start;
    Some(text[start..end].to_string())
}

fn escape_attr(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('"', "&quot;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_in_blob_marker_round_trips_through_parser() {
        let marker = value_in_blob_marker(12345);
        let parsed = parse_value_in_blob(&marker).unwrap();
        assert_eq!(parsed.blob_key, "12345");
        assert_eq!(parsed.version, 2);
    }

    #[test]
    fn legacy_blob_version_1_has_no_eid_prefix_but_still_parses() {
        let legacy = r#"<Test><JoshuaMessage Message="value_in_blob" BlobKey="999" BlobVersion="1"/></Test>"#;
        let parsed = parse_value_in_blob(legacy).unwrap();
        assert_eq!(parsed.version, 1);
    }

    #[test]
    fn ordinary_output_is_not_mistaken_for_a_marker() {
        assert!(parse_value_in_blob("plain test output\nline two").is_none());
        assert!(parse_value_in_blob("<Test><JoshuaError Severity=\"40\"/></Test>").is_none());
    }

    #[test]
    fn error_payload_escapes_attribute_special_characters() {
        let payload = error_payload(r#"bad "quote" & <tag>"#);
        assert!(payload.contains("&quot;quote&quot;"));
        assert!(payload.contains("&amp;"));
        assert!(payload.contains("&lt;tag&gt;"));
    }
}
