//! XML encoding of a settings table
//!
//! Document format:
//! ```text
//! <?xml version="1.0" encoding="utf-8" standalone="yes"?>
//! <settings version="INT">
//!   <setting id="U64" name="STR" value="STR|null" package="STR|null" />
//! </settings>
//! ```
//!
//! An absent value or package is written as the bare token `null`. A
//! present value that equals `null` or starts with `\` gets one leading `\`
//! so it cannot be confused with the absent marker.

use quick_xml::Reader;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use setstore_common::Setting;
use std::borrow::Cow;
use std::collections::HashMap;
use thiserror::Error;

const TAG_SETTINGS: &str = "settings";
const TAG_SETTING: &str = "setting";

const ATTR_VERSION: &str = "version";
const ATTR_ID: &str = "id";
const ATTR_NAME: &str = "name";
const ATTR_VALUE: &str = "value";
const ATTR_PACKAGE: &str = "package";

/// Marker for an absent value
const NULL_VALUE: &str = "null";

/// Prefix that shields literal values from the absent marker
const ESCAPE: char = '\\';

/// Codec failure
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode settings: {0}")]
    Encode(String),

    #[error("malformed settings document: {0}")]
    Malformed(String),
}

type CodecResult<T> = Result<T, CodecError>;

/// Table contents decoded from a state file
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DecodedState {
    /// Version attribute of the root element
    pub version: i32,
    /// Settings keyed by name (later duplicates win)
    pub settings: HashMap<String, Setting>,
    /// One past the highest id seen
    pub next_id: u64,
}

/// Encode a table snapshot. Settings are written in the given order.
pub fn encode(version: i32, settings: &[Setting]) -> CodecResult<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    write(
        &mut writer,
        Event::Decl(BytesDecl::new("1.0", Some("utf-8"), Some("yes"))),
    )?;

    let version = version.to_string();
    let mut root = BytesStart::new(TAG_SETTINGS);
    root.push_attribute((ATTR_VERSION, version.as_str()));
    write(&mut writer, Event::Start(root))?;

    for setting in settings {
        let id = setting.id.to_string();
        let value = pack(setting.value.as_deref());
        let package = pack(setting.namespace.as_deref());

        let mut elem = BytesStart::new(TAG_SETTING);
        elem.push_attribute((ATTR_ID, id.as_str()));
        elem.push_attribute((ATTR_NAME, setting.name.as_str()));
        elem.push_attribute((ATTR_VALUE, value.as_ref()));
        elem.push_attribute((ATTR_PACKAGE, package.as_ref()));
        write(&mut writer, Event::Empty(elem))?;
    }

    write(&mut writer, Event::End(BytesEnd::new(TAG_SETTINGS)))?;

    let mut out = writer.into_inner();
    out.push(b'\n');
    Ok(out)
}

fn write(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> CodecResult<()> {
    writer
        .write_event(event)
        .map_err(|e| CodecError::Encode(e.to_string()))
}

/// Where the parser is in the expected document structure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Prolog,
    InRoot,
    InSetting,
    Done,
}

/// Decode a state file. Any structural deviation is an error.
pub fn decode(bytes: &[u8]) -> CodecResult<DecodedState> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| CodecError::Malformed(format!("not valid utf-8: {e}")))?;

    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut state = DecodedState::default();
    let mut pos = Position::Prolog;

    loop {
        let event = reader.read_event().map_err(|e| {
            CodecError::Malformed(format!(
                "xml error at byte {}: {e}",
                reader.buffer_position()
            ))
        })?;

        match event {
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
            Event::Start(ref e) | Event::Empty(ref e) => {
                let empty = matches!(event, Event::Empty(_));
                let tag = e.name();
                match pos {
                    Position::Prolog => {
                        expect_tag(tag.as_ref(), TAG_SETTINGS)?;
                        state.version = parse_version(e)?;
                        pos = if empty { Position::Done } else { Position::InRoot };
                    }
                    Position::InRoot => {
                        expect_tag(tag.as_ref(), TAG_SETTING)?;
                        let setting = parse_setting(e)?;
                        state.next_id = state.next_id.max(setting.id + 1);
                        state.settings.insert(setting.name.clone(), setting);
                        if !empty {
                            pos = Position::InSetting;
                        }
                    }
                    Position::InSetting | Position::Done => {
                        return Err(CodecError::Malformed(format!(
                            "unexpected element <{}>",
                            String::from_utf8_lossy(tag.as_ref())
                        )));
                    }
                }
            }
            Event::End(ref e) => {
                let tag = e.name();
                pos = match pos {
                    Position::InSetting => {
                        expect_tag(tag.as_ref(), TAG_SETTING)?;
                        Position::InRoot
                    }
                    Position::InRoot => {
                        expect_tag(tag.as_ref(), TAG_SETTINGS)?;
                        Position::Done
                    }
                    Position::Prolog | Position::Done => {
                        return Err(CodecError::Malformed(format!(
                            "unexpected closing tag </{}>",
                            String::from_utf8_lossy(tag.as_ref())
                        )));
                    }
                };
            }
            Event::Text(_) | Event::CData(_) => {
                return Err(CodecError::Malformed("unexpected text content".into()));
            }
            Event::Eof => break,
        }
    }

    if pos != Position::Done {
        return Err(CodecError::Malformed(format!(
            "document ended before </{TAG_SETTINGS}>"
        )));
    }

    Ok(state)
}

fn expect_tag(actual: &[u8], expected: &str) -> CodecResult<()> {
    if actual == expected.as_bytes() {
        Ok(())
    } else {
        Err(CodecError::Malformed(format!(
            "expected <{expected}>, found <{}>",
            String::from_utf8_lossy(actual)
        )))
    }
}

fn parse_version(e: &BytesStart<'_>) -> CodecResult<i32> {
    let raw = attribute(e, ATTR_VERSION)?
        .ok_or_else(|| CodecError::Malformed("root element has no version".into()))?;
    raw.trim()
        .parse::<i32>()
        .map_err(|_| CodecError::Malformed(format!("invalid version '{raw}'")))
}

fn parse_setting(e: &BytesStart<'_>) -> CodecResult<Setting> {
    let mut id = None;
    let mut name = None;
    let mut value = None;
    let mut package = None;

    for attr in e.attributes() {
        let attr = attr.map_err(|e| CodecError::Malformed(format!("bad attribute: {e}")))?;
        let raw = attr
            .unescape_value()
            .map_err(|e| CodecError::Malformed(format!("bad attribute value: {e}")))?
            .into_owned();
        match attr.key.as_ref() {
            b"id" => id = Some(raw),
            b"name" => name = Some(raw),
            b"value" => value = Some(raw),
            b"package" => package = Some(raw),
            _ => {}
        }
    }

    let name = name
        .filter(|n| !n.is_empty())
        .ok_or_else(|| CodecError::Malformed("setting without a name".into()))?;
    let id = id
        .as_deref()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .filter(|id| *id < u64::MAX)
        .ok_or_else(|| CodecError::Malformed(format!("setting '{name}' has an invalid id")))?;

    Ok(Setting::new(
        name,
        value.as_deref().and_then(unpack),
        package.as_deref().and_then(unpack),
        id,
    ))
}

fn attribute(e: &BytesStart<'_>, key: &str) -> CodecResult<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|e| CodecError::Malformed(format!("bad attribute: {e}")))?;
        if attr.key.as_ref() == key.as_bytes() {
            let value = attr
                .unescape_value()
                .map_err(|e| CodecError::Malformed(format!("bad attribute value: {e}")))?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn pack(value: Option<&str>) -> Cow<'_, str> {
    match value {
        None => Cow::Borrowed(NULL_VALUE),
        Some(v) if v == NULL_VALUE || v.starts_with(ESCAPE) => Cow::Owned(format!("{ESCAPE}{v}")),
        Some(v) => Cow::Borrowed(v),
    }
}

fn unpack(raw: &str) -> Option<String> {
    if raw == NULL_VALUE {
        return None;
    }
    Some(raw.strip_prefix(ESCAPE).unwrap_or(raw).to_string())
}
