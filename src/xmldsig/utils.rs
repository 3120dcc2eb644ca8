use crate::xmldsig::{Error, Result};
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::io::Cursor;

/// Adds `xmlns="{namespace}"` to the root element of a fragment when the
/// root carries no default namespace of its own.
///
/// Fragments cut out of a signed document lose the namespace they inherited
/// from their parent; this restores it before canonicalization.
pub fn reinject_namespace(xml: &str, namespace: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut buf = Vec::new();
    let mut root_seen = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if !root_seen => {
                root_seen = true;
                writer.write_event(Event::Start(with_default_namespace(&e, namespace)))?;
            }
            Ok(Event::Empty(e)) if !root_seen => {
                root_seen = true;
                writer.write_event(Event::Empty(with_default_namespace(&e, namespace)))?;
            }
            Ok(Event::Eof) => break,
            Ok(e) => writer.write_event(e)?,
            Err(e) => return Err(Error::Xml(e.to_string())),
        }
        buf.clear();
    }

    if !root_seen {
        return Err(Error::Xml("Fragment has no root element".into()));
    }
    Ok(String::from_utf8(writer.into_inner().into_inner())?)
}

fn with_default_namespace(e: &BytesStart, namespace: &str) -> BytesStart<'static> {
    let mut elem = e.to_owned();
    let has_default = e
        .attributes()
        .with_checks(false)
        .filter_map(|a| a.ok())
        .any(|attr| attr.key.as_ref() == b"xmlns");
    if !has_default {
        elem.push_attribute(("xmlns", namespace));
    }
    elem
}

/// Extract element by ID attribute
pub fn extract_element_by_id(xml: &str, id: &str) -> Result<String> {
    extract_with_predicate(xml, |e| {
        e.attributes().filter_map(|a| a.ok()).any(|attr| {
            attr.key.local_name().as_ref() == b"Id"
                && attr.unescape_value().ok().as_deref() == Some(id)
        })
    })?
    .ok_or_else(|| Error::Xml(format!("Element with Id='{id}' not found")))
}

/// Extract the first element with the given local name
pub fn extract_element(xml: &str, name: &str) -> Result<String> {
    let target = name.as_bytes();
    extract_with_predicate(xml, |e| e.name().local_name().as_ref() == target)?
        .ok_or_else(|| Error::Xml(format!("Element '{name}' not found")))
}

/// Text content of the first element with the given local name
pub fn element_text(xml: &str, name: &str) -> Result<Option<String>> {
    let mut reader = Reader::from_str(xml);
    let mut buf = Vec::new();
    let mut inside = false;
    let mut text = String::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) if e.name().local_name().as_ref() == name.as_bytes() => {
                inside = true;
            }
            Ok(Event::Text(e)) if inside => {
                text.push_str(&e.xml_content().map_err(|e| Error::Xml(e.to_string()))?);
            }
            Ok(Event::GeneralRef(e)) if inside => {
                let entity = std::str::from_utf8(&e)?;
                if let Some(resolved) = quick_xml::escape::resolve_predefined_entity(entity) {
                    text.push_str(resolved);
                }
            }
            Ok(Event::End(e)) if inside && e.name().local_name().as_ref() == name.as_bytes() => {
                return Ok(Some(text));
            }
            Ok(Event::Eof) => return Ok(None),
            Ok(_) => {}
            Err(e) => return Err(Error::Xml(e.to_string())),
        }
        buf.clear();
    }
}

/// Removes every element with the given local name, subtree included.
///
/// This is the enveloped-signature transform when called with `Signature`.
pub fn strip_element(xml: &str, name: &str) -> Result<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);

    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut buf = Vec::new();
    let mut skip_depth = 0usize;
    let target = name.as_bytes();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if skip_depth > 0 || e.name().local_name().as_ref() == target {
                    skip_depth += 1;
                } else {
                    writer.write_event(Event::Start(e))?;
                }
            }
            Ok(Event::End(e)) => {
                if skip_depth > 0 {
                    skip_depth -= 1;
                } else {
                    writer.write_event(Event::End(e))?;
                }
            }
            Ok(Event::Empty(e)) => {
                if skip_depth == 0 && e.name().local_name().as_ref() != target {
                    writer.write_event(Event::Empty(e))?;
                }
            }
            Ok(Event::Eof) => break,
            Ok(e) => {
                if skip_depth == 0 {
                    writer.write_event(e)?;
                }
            }
            Err(e) => return Err(Error::Xml(e.to_string())),
        }
        buf.clear();
    }
    Ok(String::from_utf8(writer.into_inner().into_inner())?)
}

/// Copy of the first subtree whose start tag matches the predicate
fn extract_with_predicate<F>(xml: &str, mut predicate: F) -> Result<Option<String>>
where
    F: FnMut(&BytesStart) -> bool,
{
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(false);
    reader.config_mut().expand_empty_elements = true;

    let mut writer = Writer::new(Cursor::new(Vec::new()));
    let mut buf = Vec::new();
    let mut depth = 0;
    let mut capturing = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if !capturing && predicate(&e) {
                    capturing = true;
                    depth = 1;
                    writer.write_event(Event::Start(e))?;
                } else if capturing {
                    depth += 1;
                    writer.write_event(Event::Start(e))?;
                }
            }
            Ok(Event::End(e)) => {
                if capturing {
                    writer.write_event(Event::End(e))?;
                    depth -= 1;
                    if depth == 0 {
                        break;
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(e) => {
                if capturing {
                    writer.write_event(e)?;
                }
            }
            Err(e) => return Err(Error::Xml(e.to_string())),
        }
        buf.clear();
    }

    if !capturing {
        return Ok(None);
    }
    if depth != 0 {
        return Err(Error::Xml("Element is not closed".into()));
    }
    Ok(Some(String::from_utf8(writer.into_inner().into_inner())?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_element_by_id() {
        let xml = r#"<DPS><infDPS Id="DPS123">content</infDPS></DPS>"#;
        let element = extract_element_by_id(xml, "DPS123").unwrap();
        assert_eq!(element, r#"<infDPS Id="DPS123">content</infDPS>"#);
        assert!(extract_element_by_id(xml, "DPS999").is_err());
    }

    #[test]
    fn test_extract_nested_element() {
        let xml = r#"<a><Signature><SignedInfo><X>1</X></SignedInfo><SignatureValue>abc</SignatureValue></Signature></a>"#;
        let signed_info = extract_element(xml, "SignedInfo").unwrap();
        assert_eq!(signed_info, "<SignedInfo><X>1</X></SignedInfo>");
    }

    #[test]
    fn test_element_text() {
        let xml = r#"<a><b>one &amp; two</b><c/></a>"#;
        assert_eq!(element_text(xml, "b").unwrap().as_deref(), Some("one & two"));
        assert_eq!(element_text(xml, "missing").unwrap(), None);
    }

    #[test]
    fn test_reinject_namespace_when_missing() {
        let xml = r#"<infDPS Id="x"><a>1</a></infDPS>"#;
        let result = reinject_namespace(xml, "http://ns").unwrap();
        assert_eq!(result, r#"<infDPS Id="x" xmlns="http://ns"><a>1</a></infDPS>"#);
    }

    #[test]
    fn test_reinject_namespace_keeps_existing() {
        let xml = r#"<infDPS xmlns="http://other"><a>1</a></infDPS>"#;
        assert_eq!(reinject_namespace(xml, "http://ns").unwrap(), xml);
    }

    #[test]
    fn test_strip_element() {
        let xml = r#"<DPS><infDPS>x</infDPS><Signature><SignedInfo/></Signature></DPS>"#;
        assert_eq!(
            strip_element(xml, "Signature").unwrap(),
            "<DPS><infDPS>x</infDPS></DPS>"
        );
    }
}
