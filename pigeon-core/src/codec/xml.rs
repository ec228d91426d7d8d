//! XML codec using a JsonML-shaped element model under the
//! `pigeon-optics:arbitrary` namespace: `<string>`, `<number>`, `<buffer
//! encoding="base64">`, `<object>` (members tagged with a `name` attribute),
//! `<array>`, `<null/>`, `<true/>`, `<false/>`, `<date>`.

use crate::error::{CoreError, Result};
use crate::value::StructuredValue;
use base64::Engine;
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::reader::Reader;
use quick_xml::writer::Writer;
use std::collections::BTreeMap;
use std::io::Cursor;

const NAMESPACE: &str = "pigeon-optics:arbitrary";

pub fn encode(value: &StructuredValue) -> Result<Vec<u8>> {
    let mut writer = Writer::new(Cursor::new(Vec::new()));
    write_value(&mut writer, value, None, true).map_err(|e| CoreError::Codec(e.to_string()))?;
    Ok(writer.into_inner().into_inner())
}

fn write_value(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    value: &StructuredValue,
    name: Option<&str>,
    is_root: bool,
) -> std::result::Result<(), quick_xml::Error> {
    match value {
        StructuredValue::Null => write_empty(writer, "null", name, is_root),
        StructuredValue::Bool(true) => write_empty(writer, "true", name, is_root),
        StructuredValue::Bool(false) => write_empty(writer, "false", name, is_root),
        StructuredValue::Int(i) => write_text(writer, "number", name, is_root, &i.to_string()),
        StructuredValue::Float(f) => write_text(writer, "number", name, is_root, &f.to_string()),
        StructuredValue::String(s) => write_text(writer, "string", name, is_root, s),
        StructuredValue::Timestamp(ts) => {
            write_text(writer, "date", name, is_root, &ts.to_rfc3339())
        }
        StructuredValue::Bytes(bytes) => {
            let mut start = start_tag("buffer", name, is_root);
            start.push_attribute(("encoding", "base64"));
            writer.write_event(Event::Start(start))?;
            let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
            writer.write_event(Event::Text(BytesText::new(&encoded)))?;
            writer.write_event(Event::End(BytesEnd::new("buffer")))?;
            Ok(())
        }
        StructuredValue::Array(items) => {
            writer.write_event(Event::Start(start_tag("array", name, is_root)))?;
            for item in items {
                write_value(writer, item, None, false)?;
            }
            writer.write_event(Event::End(BytesEnd::new("array")))?;
            Ok(())
        }
        StructuredValue::Mapping(map) => {
            writer.write_event(Event::Start(start_tag("object", name, is_root)))?;
            for (k, v) in map {
                write_value(writer, v, Some(k), false)?;
            }
            writer.write_event(Event::End(BytesEnd::new("object")))?;
            Ok(())
        }
    }
}

fn start_tag<'a>(tag: &'a str, name: Option<&str>, is_root: bool) -> BytesStart<'a> {
    let mut start = BytesStart::new(tag);
    if is_root {
        start.push_attribute(("xmlns", NAMESPACE));
    }
    if let Some(n) = name {
        start.push_attribute(("name", n));
    }
    start
}

fn write_empty(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    tag: &str,
    name: Option<&str>,
    is_root: bool,
) -> std::result::Result<(), quick_xml::Error> {
    writer.write_event(Event::Empty(start_tag(tag, name, is_root)))
}

fn write_text(
    writer: &mut Writer<Cursor<Vec<u8>>>,
    tag: &str,
    name: Option<&str>,
    is_root: bool,
    text: &str,
) -> std::result::Result<(), quick_xml::Error> {
    writer.write_event(Event::Start(start_tag(tag, name, is_root)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(tag)))?;
    Ok(())
}

pub fn decode(bytes: &[u8]) -> Result<StructuredValue> {
    let mut reader = Reader::from_reader(bytes);
    reader.trim_text(true);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf).map_err(|e| CoreError::Codec(e.to_string()))? {
            Event::Start(start) => {
                let (value, _name) = read_element(&mut reader, &start)?;
                return Ok(value);
            }
            Event::Empty(start) => {
                let (value, _name) = read_empty(&start)?;
                return Ok(value);
            }
            Event::Eof => return Err(CoreError::Codec("empty XML document".into())),
            _ => {}
        }
        buf.clear();
    }
}

fn attr(start: &BytesStart, key: &str) -> Result<Option<String>> {
    for a in start.attributes() {
        let a = a.map_err(|e| CoreError::Codec(e.to_string()))?;
        if a.key.as_ref() == key.as_bytes() {
            let raw = std::str::from_utf8(&a.value).map_err(|e| CoreError::Codec(e.to_string()))?;
            let unescaped =
                quick_xml::escape::unescape(raw).map_err(|e| CoreError::Codec(e.to_string()))?;
            return Ok(Some(unescaped.into_owned()));
        }
    }
    Ok(None)
}

fn read_empty(start: &BytesStart) -> Result<(StructuredValue, Option<String>)> {
    let name = attr(start, "name")?;
    let tag = String::from_utf8_lossy(start.name().as_ref()).to_string();
    let value = match tag.as_str() {
        "null" => StructuredValue::Null,
        "true" => StructuredValue::Bool(true),
        "false" => StructuredValue::Bool(false),
        "array" => StructuredValue::Array(Vec::new()),
        "object" => StructuredValue::Mapping(BTreeMap::new()),
        other => return Err(CoreError::Codec(format!("unsupported empty XML tag: {other}"))),
    };
    Ok((value, name))
}

fn read_element(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart,
) -> Result<(StructuredValue, Option<String>)> {
    let name = attr(start, "name")?;
    let tag = String::from_utf8_lossy(start.name().as_ref()).to_string();
    let mut buf = Vec::new();

    match tag.as_str() {
        "string" | "number" | "date" | "buffer" => {
            let mut text = String::new();
            loop {
                match reader.read_event_into(&mut buf).map_err(|e| CoreError::Codec(e.to_string()))? {
                    Event::Text(t) => {
                        text.push_str(
                            &t.unescape().map_err(|e| CoreError::Codec(e.to_string()))?,
                        )
                    }
                    Event::End(_) => break,
                    Event::Eof => return Err(CoreError::Codec("unexpected EOF in XML".into())),
                    _ => {}
                }
                buf.clear();
            }
            let value = match tag.as_str() {
                "string" => StructuredValue::String(text),
                "date" => {
                    let ts = chrono::DateTime::parse_from_rfc3339(&text)
                        .map_err(|e| CoreError::Codec(format!("invalid date: {e}")))?;
                    StructuredValue::Timestamp(ts.with_timezone(&chrono::Utc))
                }
                "number" => {
                    if let Ok(i) = text.parse::<i64>() {
                        StructuredValue::Int(i)
                    } else {
                        StructuredValue::Float(
                            text.parse::<f64>()
                                .map_err(|e| CoreError::Codec(format!("invalid number: {e}")))?,
                        )
                    }
                }
                "buffer" => {
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(text.trim())
                        .map_err(|e| CoreError::Codec(format!("invalid base64: {e}")))?;
                    StructuredValue::Bytes(bytes)
                }
                _ => unreachable!(),
            };
            Ok((value, name))
        }
        "array" => {
            let mut items = Vec::new();
            loop {
                match reader.read_event_into(&mut buf).map_err(|e| CoreError::Codec(e.to_string()))? {
                    Event::Start(child_start) => {
                        let (v, _) = read_element(reader, &child_start)?;
                        items.push(v);
                    }
                    Event::Empty(child_start) => {
                        let (v, _) = read_empty(&child_start)?;
                        items.push(v);
                    }
                    Event::End(_) => break,
                    Event::Eof => return Err(CoreError::Codec("unexpected EOF in XML".into())),
                    _ => {}
                }
                buf.clear();
            }
            Ok((StructuredValue::Array(items), name))
        }
        "object" => {
            let mut map = BTreeMap::new();
            loop {
                match reader.read_event_into(&mut buf).map_err(|e| CoreError::Codec(e.to_string()))? {
                    Event::Start(child_start) => {
                        let (v, child_name) = read_element(reader, &child_start)?;
                        let key = child_name
                            .ok_or_else(|| CoreError::Codec("object member missing name".into()))?;
                        map.insert(key, v);
                    }
                    Event::Empty(child_start) => {
                        let (v, child_name) = read_empty(&child_start)?;
                        let key = child_name
                            .ok_or_else(|| CoreError::Codec("object member missing name".into()))?;
                        map.insert(key, v);
                    }
                    Event::End(_) => break,
                    Event::Eof => return Err(CoreError::Codec("unexpected EOF in XML".into())),
                    _ => {}
                }
                buf.clear();
            }
            Ok((StructuredValue::Mapping(map), name))
        }
        other => Err(CoreError::Codec(format!("unsupported XML tag: {other}"))),
    }
}
