//! XML tag extraction for speaker control responses.
//!
//! Sonos answers SOAP envelopes and Bluesound answers small XML documents;
//! both are mined for single leaf values here. Namespace prefixes are
//! ignored and entities are resolved, so `<u:CurrentVolume>` and
//! `<volume db="-18.5">` both read cleanly.

use quick_xml::events::Event;
use quick_xml::Reader;

/// Text content of the first element whose local name matches `tag`.
pub fn xml_text(xml: &str, tag: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let mut inside = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                inside = e.local_name().as_ref() == tag.as_bytes();
            }
            Ok(Event::Text(ref t)) if inside => {
                return t
                    .unescape()
                    .ok()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty());
            }
            Ok(Event::End(_)) => inside = false,
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Integer leaf value, for volume levels and counters.
pub fn xml_u8(xml: &str, tag: &str) -> Option<u8> {
    xml_text(xml, tag).and_then(|s| s.parse().ok())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn ignores_namespace_prefixes() {
        let didl = r#"<DIDL-Lite xmlns:dc="http://purl.org/dc/elements/1.1/"><item><dc:title>So What</dc:title><dc:creator>Miles Davis</dc:creator></item></DIDL-Lite>"#;
        assert_eq!(xml_text(didl, "title").as_deref(), Some("So What"));
        assert_eq!(xml_text(didl, "creator").as_deref(), Some("Miles Davis"));
        assert_eq!(xml_text(didl, "album"), None);
    }

    #[test]
    fn unescapes_entities() {
        let xml = "<status><title1>Now &amp; Then</title1></status>";
        assert_eq!(xml_text(xml, "title1").as_deref(), Some("Now & Then"));
    }

    #[test]
    fn reads_sonos_soap_volume() {
        let xml = r#"<s:Envelope><s:Body><u:GetVolumeResponse xmlns:u="urn:schemas-upnp-org:service:RenderingControl:1"><CurrentVolume>38</CurrentVolume></u:GetVolumeResponse></s:Body></s:Envelope>"#;
        assert_eq!(xml_u8(xml, "CurrentVolume"), Some(38));
    }

    #[test]
    fn reads_bluesound_volume_with_attributes() {
        let xml = r#"<volume db="-18.5" mute="0">45</volume>"#;
        assert_eq!(xml_u8(xml, "volume"), Some(45));
    }

    #[test]
    fn missing_or_non_numeric_tags_are_none() {
        assert_eq!(xml_text("<other>1</other>", "volume"), None);
        assert_eq!(xml_u8("<volume>loud</volume>", "volume"), None);
    }
}
