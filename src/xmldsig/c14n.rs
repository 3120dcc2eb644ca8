use quick_xml::Reader;
use quick_xml::escape::resolve_predefined_entity;
use quick_xml::events::{BytesRef, BytesStart, Event};
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::str;

use crate::xmldsig::{Error, Result};

type NsMap = BTreeMap<Vec<u8>, Vec<u8>>;

const XML_NS: &[u8] = b"http://www.w3.org/XML/1998/namespace";

/// Canonical XML 1.0 (inclusive, without comments).
///
/// The input is treated as the apex of the document subset, so every
/// namespace in scope is rendered on the first element that sees it.
/// Declarations, comments, processing instructions and anything outside the
/// root element are dropped.
pub fn canonicalize(xml: impl AsRef<str>) -> Result<String> {
    let mut reader = Reader::from_str(xml.as_ref());
    reader.config_mut().trim_text(false);
    reader.config_mut().expand_empty_elements = true;

    let mut out = String::with_capacity(xml.as_ref().len());
    let mut buf = Vec::new();

    // Namespaces in scope and namespaces already written, per open element
    let mut ns_declared_stack: Vec<NsMap> = vec![BTreeMap::new()];
    let mut ns_rendered_stack: Vec<NsMap> = vec![BTreeMap::new()];
    let mut depth = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                handle_start(&mut out, &e, &mut ns_declared_stack, &mut ns_rendered_stack)?;
                depth += 1;
            }
            Ok(Event::End(e)) => {
                out.push_str("</");
                out.push_str(str::from_utf8(e.name().as_ref())?);
                out.push('>');
                ns_declared_stack.pop();
                ns_rendered_stack.pop();
                depth = depth.saturating_sub(1);
            }
            Ok(Event::Text(e)) if depth > 0 => {
                let text = e.xml_content().map_err(|e| Error::Xml(e.to_string()))?;
                out.push_str(&escape_text_value(&text));
            }
            Ok(Event::CData(e)) if depth > 0 => {
                // CDATA is normalized to text content
                let raw = e.into_inner();
                let normalized = normalize_line_endings(&raw);
                out.push_str(&escape_text_value(str::from_utf8(&normalized)?));
            }
            Ok(Event::GeneralRef(e)) if depth > 0 => {
                let resolved = resolve_reference(&e)?;
                out.push_str(&escape_text_value(&resolved));
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::Xml(e.to_string())),
        }
        buf.clear();
    }

    if depth != 0 {
        return Err(Error::Xml("unexpected end of document".into()));
    }
    Ok(out)
}

/// Resolves `&name;` and `&#..;` references found in text nodes.
fn resolve_reference(reference: &BytesRef) -> Result<String> {
    let name = str::from_utf8(reference)?;

    if let Some(code) = name.strip_prefix('#') {
        let value = match code.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16),
            None => code.parse::<u32>(),
        }
        .map_err(|_| Error::Xml(format!("invalid character reference &{name};")))?;

        return char::from_u32(value)
            .map(String::from)
            .ok_or_else(|| Error::Xml(format!("invalid character reference &{name};")));
    }

    resolve_predefined_entity(name)
        .map(str::to_string)
        .ok_or_else(|| Error::Xml(format!("undeclared entity &{name};")))
}

/// Normalize line endings to LF
fn normalize_line_endings(text: &[u8]) -> Cow<'_, [u8]> {
    if !text.contains(&b'\r') {
        return Cow::Borrowed(text);
    }

    let mut result = Vec::with_capacity(text.len());
    let mut i = 0;
    while i < text.len() {
        if text[i] == b'\r' {
            result.push(b'\n');
            // CRLF collapses into a single LF
            i += if text.get(i + 1) == Some(&b'\n') { 2 } else { 1 };
        } else {
            result.push(text[i]);
            i += 1;
        }
    }
    Cow::Owned(result)
}

fn escape_attr_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + s.len() / 4);
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '"' => out.push_str("&quot;"),
            '\t' => out.push_str("&#x9;"),
            '\n' => out.push_str("&#xA;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(ch),
        }
    }
    out
}

fn escape_text_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + s.len() / 4);
    for ch in s.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '\r' => out.push_str("&#xD;"),
            _ => out.push(ch),
        }
    }
    out
}

/// Writes a start tag with its namespace declarations and attributes in
/// canonical order.
fn handle_start(
    out: &mut String,
    e: &BytesStart,
    ns_declared_stack: &mut Vec<NsMap>,
    ns_rendered_stack: &mut Vec<NsMap>,
) -> Result<()> {
    let mut current_declared = ns_declared_stack.last().cloned().unwrap_or_default();
    let mut current_rendered = ns_rendered_stack.last().cloned().unwrap_or_default();

    let mut regular_attrs = vec![];
    for attr in e.attributes().with_checks(false) {
        let attr = attr?;
        let key = attr.key.as_ref();
        if key == b"xmlns" {
            if attr.value.is_empty() {
                current_declared.remove(&b""[..]);
            } else {
                current_declared.insert(vec![], attr.value.to_vec());
            }
        } else if let Some(prefix) = key.strip_prefix(b"xmlns:") {
            if prefix != b"xml" {
                current_declared.insert(prefix.to_vec(), attr.value.to_vec());
            }
        } else {
            let value = attr.unescape_value()?;
            regular_attrs.push((key.to_vec(), value.into_owned()));
        }
    }

    // Every in-scope namespace not already written by an output ancestor
    let mut render_ns: Vec<(Vec<u8>, Vec<u8>)> = current_declared
        .iter()
        .filter(|(prefix, uri)| current_rendered.get(*prefix) != Some(*uri))
        .map(|(prefix, uri)| (prefix.clone(), uri.clone()))
        .collect();

    // An element leaving the default namespace undeclares it explicitly
    let default_undeclared = !current_declared.contains_key(&b""[..])
        && current_rendered
            .get(&b""[..])
            .is_some_and(|uri| !uri.is_empty());
    if default_undeclared {
        render_ns.insert(0, (vec![], vec![]));
    }

    let name = e.name();
    let name_str = str::from_utf8(name.as_ref())?;
    out.push('<');
    out.push_str(name_str);

    // Map iteration order puts the default namespace first, then prefixes
    for (prefix, uri) in &render_ns {
        if prefix.is_empty() {
            out.push_str(" xmlns=\"");
        } else {
            out.push_str(" xmlns:");
            out.push_str(str::from_utf8(prefix)?);
            out.push_str("=\"");
        }
        out.push_str(&escape_attr_value(str::from_utf8(uri)?));
        out.push('"');
        current_rendered.insert(prefix.clone(), uri.clone());
    }

    // Attributes sort by namespace URI, then local name
    let mut attr_info = Vec::with_capacity(regular_attrs.len());
    for (key, value) in regular_attrs {
        let (ns_uri, local_name) = match key.iter().position(|&b| b == b':') {
            Some(pos) => {
                let prefix = &key[..pos];
                let uri = if prefix == b"xml" {
                    XML_NS.to_vec()
                } else {
                    current_declared.get(prefix).cloned().unwrap_or_default()
                };
                (uri, key[pos + 1..].to_vec())
            }
            None => (vec![], key.clone()),
        };
        attr_info.push((ns_uri, local_name, key, value));
    }
    attr_info.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

    for (_, _, key, value) in &attr_info {
        out.push(' ');
        out.push_str(str::from_utf8(key)?);
        out.push_str("=\"");
        out.push_str(&escape_attr_value(value));
        out.push('"');
    }
    out.push('>');

    ns_declared_stack.push(current_declared);
    ns_rendered_stack.push(current_rendered);
    Ok(())
}
