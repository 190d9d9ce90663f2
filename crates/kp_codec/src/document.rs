use crate::inner::InnerStream;
use crate::xml::{XmlEvent, XmlReader, XmlWriter};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use kp_core::app_error::{AppError, AppResult};
use kp_core::entry::{Entry, FieldValue};
use kp_core::protected::ProtectedValue;
use kp_core::vault::{CipherKind, DatabaseMeta, Group, KdfSettings, Vault};
use std::collections::BTreeMap;
use uuid::Uuid;

const GENERATOR: &str = "keepcore";

/// Seconds between 0001-01-01T00:00:00Z and the unix epoch; KDBX 4 stores
/// times as base64(le_u64(seconds since year one)).
const EPOCH_OFFSET_SECONDS: i64 = 62_135_596_800;

fn corrupt(message: &str) -> AppError {
    AppError::new(
        "KP_BLOB_CORRUPT",
        "codec",
        message,
        false,
        serde_json::json!({}),
    )
}

fn encode_time(ms: i64) -> String {
    let seconds = (ms.div_euclid(1000) + EPOCH_OFFSET_SECONDS).max(0) as u64;
    BASE64.encode(seconds.to_le_bytes())
}

fn decode_time(text: &str) -> AppResult<i64> {
    let raw = BASE64
        .decode(text.trim())
        .map_err(|_| corrupt("time value is not base64"))?;
    let raw: [u8; 8] = raw
        .try_into()
        .map_err(|_| corrupt("time value must be 8 bytes"))?;
    let seconds = u64::from_le_bytes(raw) as i64;
    Ok((seconds - EPOCH_OFFSET_SECONDS) * 1000)
}

fn encode_uuid(id: Uuid) -> String {
    BASE64.encode(id.as_bytes())
}

fn decode_uuid(text: &str) -> AppResult<Uuid> {
    let raw = BASE64
        .decode(text.trim())
        .map_err(|_| corrupt("uuid value is not base64"))?;
    let raw: [u8; 16] = raw
        .try_into()
        .map_err(|_| corrupt("uuid value must be 16 bytes"))?;
    Ok(Uuid::from_bytes(raw))
}

fn bool_text(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

pub fn write_document(vault: &Vault, stream: &mut InnerStream) -> String {
    let mut writer = XmlWriter::new();
    writer.open("KeePassFile");

    writer.open("Meta");
    writer.leaf("Generator", GENERATOR);
    writer.leaf("DatabaseName", &vault.meta.name);
    writer.leaf(
        "DatabaseNameChanged",
        &encode_time(vault.meta.last_mod_time_ms),
    );
    writer.leaf(
        "RecycleBinEnabled",
        bool_text(vault.meta.recycle_bin_enabled),
    );
    writer.leaf(
        "RecycleBinUUID",
        &encode_uuid(vault.recycle_bin_id().unwrap_or(Uuid::nil())),
    );
    writer.leaf(
        "HistoryMaxItems",
        &vault.meta.history_max_items.to_string(),
    );
    writer.close("Meta");

    writer.open("Root");
    write_group(&mut writer, vault, vault.root_id(), stream);
    writer.close("Root");

    writer.close("KeePassFile");
    writer.finish()
}

fn write_group(writer: &mut XmlWriter, vault: &Vault, group_id: Uuid, stream: &mut InnerStream) {
    let Some(group) = vault.group(group_id) else {
        return;
    };
    writer.open("Group");
    writer.leaf("UUID", &encode_uuid(group.id));
    writer.leaf("Name", &group.name);
    writer.leaf("IconID", &group.icon_id.to_string());
    for entry_id in &group.entry_ids {
        if let Some(entry) = vault.entry(*entry_id) {
            write_entry(writer, entry, stream, true);
        }
    }
    for child in &group.child_groups {
        write_group(writer, vault, *child, stream);
    }
    writer.close("Group");
}

fn write_entry(writer: &mut XmlWriter, entry: &Entry, stream: &mut InnerStream, with_history: bool) {
    writer.open("Entry");
    writer.leaf("UUID", &encode_uuid(entry.id));
    writer.leaf("IconID", &entry.icon_id.to_string());
    writer.leaf("Tags", &entry.tags.join(";"));

    writer.open("Times");
    writer.leaf("CreationTime", &encode_time(entry.times.creation_time_ms));
    writer.leaf(
        "LastModificationTime",
        &encode_time(entry.times.last_mod_time_ms),
    );
    writer.close("Times");

    for (key, value) in &entry.fields {
        writer.open("String");
        writer.leaf("Key", key);
        match value {
            FieldValue::Plain(text) => writer.leaf("Value", text),
            FieldValue::Protected(protected) => {
                let mut bytes = protected.reveal().as_str().as_bytes().to_vec();
                stream.apply(&mut bytes);
                writer.leaf_with_attr("Value", "Protected", "True", &BASE64.encode(&bytes));
            }
        }
        writer.close("String");
    }

    if with_history && !entry.history.is_empty() {
        writer.open("History");
        for snapshot in &entry.history {
            write_entry(writer, snapshot, stream, false);
        }
        writer.close("History");
    }

    writer.close("Entry");
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

struct ParsedMeta {
    name: String,
    last_mod_time_ms: i64,
    recycle_bin_enabled: bool,
    recycle_bin: Option<Uuid>,
    history_max_items: u32,
}

impl Default for ParsedMeta {
    fn default() -> Self {
        Self {
            name: String::new(),
            last_mod_time_ms: 0,
            recycle_bin_enabled: false,
            recycle_bin: None,
            history_max_items: 10,
        }
    }
}

struct ParsedGroup {
    id: Uuid,
    name: String,
    icon_id: u32,
    entries: Vec<Entry>,
    children: Vec<ParsedGroup>,
}

pub fn parse_document(
    xml: &str,
    stream: &mut InnerStream,
    cipher: CipherKind,
    kdf: KdfSettings,
) -> AppResult<Vault> {
    let mut reader = XmlReader::new(xml);

    match reader.next_element_event()? {
        Some(XmlEvent::Start { name, .. }) if name == "KeePassFile" => {}
        _ => return Err(corrupt("document root must be KeePassFile")),
    }

    let mut meta = ParsedMeta::default();
    let mut root: Option<ParsedGroup> = None;

    loop {
        match reader.next_element_event()? {
            Some(XmlEvent::Start { name, .. }) => match name.as_str() {
                "Meta" => meta = parse_meta(&mut reader)?,
                "Root" => root = Some(parse_root(&mut reader, stream)?),
                _ => reader.skip_element()?,
            },
            Some(XmlEvent::End(name)) if name == "KeePassFile" => break,
            Some(_) => {}
            None => return Err(corrupt("document ended before KeePassFile closed")),
        }
    }

    let root = root.ok_or_else(|| corrupt("document has no Root group"))?;
    let root_id = root.id;

    let mut groups = BTreeMap::new();
    let mut entries = BTreeMap::new();
    flatten_group(root, None, &mut groups, &mut entries);

    let recycle_bin = meta.recycle_bin.filter(|id| groups.contains_key(id));
    if let Some(bin) = recycle_bin {
        if let Some(group) = groups.get_mut(&bin) {
            group.is_recycle_bin = true;
        }
    }

    Vault::from_parts(
        DatabaseMeta {
            name: meta.name,
            last_mod_time_ms: meta.last_mod_time_ms,
            history_max_items: meta.history_max_items,
            recycle_bin_enabled: meta.recycle_bin_enabled,
        },
        cipher,
        kdf,
        groups,
        entries,
        root_id,
        recycle_bin,
    )
}

fn parse_meta(reader: &mut XmlReader) -> AppResult<ParsedMeta> {
    let mut meta = ParsedMeta::default();
    loop {
        match reader.next_element_event()? {
            Some(XmlEvent::Start { name, .. }) => match name.as_str() {
                "DatabaseName" => meta.name = reader.read_leaf_text()?,
                "DatabaseNameChanged" => {
                    meta.last_mod_time_ms = decode_time(&reader.read_leaf_text()?)?;
                }
                "RecycleBinEnabled" => {
                    meta.recycle_bin_enabled = reader.read_leaf_text()?.trim() == "True";
                }
                "RecycleBinUUID" => {
                    let id = decode_uuid(&reader.read_leaf_text()?)?;
                    meta.recycle_bin = (!id.is_nil()).then_some(id);
                }
                "HistoryMaxItems" => {
                    meta.history_max_items =
                        reader.read_leaf_text()?.trim().parse().unwrap_or(10);
                }
                _ => reader.skip_element()?,
            },
            Some(XmlEvent::End(name)) if name == "Meta" => return Ok(meta),
            Some(_) => {}
            None => return Err(corrupt("document ended inside Meta")),
        }
    }
}

fn parse_root(reader: &mut XmlReader, stream: &mut InnerStream) -> AppResult<ParsedGroup> {
    let mut root: Option<ParsedGroup> = None;
    loop {
        match reader.next_element_event()? {
            Some(XmlEvent::Start { name, .. }) => {
                if name == "Group" {
                    let group = parse_group(reader, stream)?;
                    if root.is_none() {
                        root = Some(group);
                    }
                } else {
                    reader.skip_element()?;
                }
            }
            Some(XmlEvent::End(name)) if name == "Root" => break,
            Some(_) => {}
            None => return Err(corrupt("document ended inside Root")),
        }
    }
    root.ok_or_else(|| corrupt("Root carries no Group"))
}

fn parse_group(reader: &mut XmlReader, stream: &mut InnerStream) -> AppResult<ParsedGroup> {
    let mut group = ParsedGroup {
        id: Uuid::nil(),
        name: String::new(),
        icon_id: 48,
        entries: Vec::new(),
        children: Vec::new(),
    };

    loop {
        match reader.next_element_event()? {
            Some(XmlEvent::Start { name, .. }) => match name.as_str() {
                "UUID" => group.id = decode_uuid(&reader.read_leaf_text()?)?,
                "Name" => group.name = reader.read_leaf_text()?,
                "IconID" => {
                    group.icon_id = reader.read_leaf_text()?.trim().parse().unwrap_or(48);
                }
                "Group" => group.children.push(parse_group(reader, stream)?),
                "Entry" => group.entries.push(parse_entry(reader, stream, true)?),
                _ => reader.skip_element()?,
            },
            Some(XmlEvent::End(name)) if name == "Group" => break,
            Some(_) => {}
            None => return Err(corrupt("document ended inside Group")),
        }
    }

    if group.id.is_nil() {
        return Err(corrupt("group is missing its UUID"));
    }
    Ok(group)
}

fn parse_entry(
    reader: &mut XmlReader,
    stream: &mut InnerStream,
    allow_history: bool,
) -> AppResult<Entry> {
    // group assignment happens when the tree is flattened
    let mut entry = Entry::new(Uuid::nil(), 0);
    entry.id = Uuid::nil();

    loop {
        match reader.next_element_event()? {
            Some(XmlEvent::Start { name, .. }) => match name.as_str() {
                "UUID" => entry.id = decode_uuid(&reader.read_leaf_text()?)?,
                "IconID" => {
                    entry.icon_id = reader.read_leaf_text()?.trim().parse().unwrap_or(0);
                }
                "Tags" => {
                    entry.tags = reader
                        .read_leaf_text()?
                        .split(';')
                        .map(str::trim)
                        .filter(|tag| !tag.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "Times" => parse_times(reader, &mut entry)?,
                "String" => parse_string_field(reader, stream, &mut entry)?,
                "History" => {
                    if allow_history {
                        parse_history(reader, stream, &mut entry)?;
                    } else {
                        reader.skip_element()?;
                    }
                }
                _ => reader.skip_element()?,
            },
            Some(XmlEvent::End(name)) if name == "Entry" => break,
            Some(_) => {}
            None => return Err(corrupt("document ended inside Entry")),
        }
    }

    if entry.id.is_nil() {
        return Err(corrupt("entry is missing its UUID"));
    }
    Ok(entry)
}

fn parse_times(reader: &mut XmlReader, entry: &mut Entry) -> AppResult<()> {
    loop {
        match reader.next_element_event()? {
            Some(XmlEvent::Start { name, .. }) => match name.as_str() {
                "CreationTime" => {
                    entry.times.creation_time_ms = decode_time(&reader.read_leaf_text()?)?;
                }
                "LastModificationTime" => {
                    entry.times.last_mod_time_ms = decode_time(&reader.read_leaf_text()?)?;
                }
                _ => reader.skip_element()?,
            },
            Some(XmlEvent::End(name)) if name == "Times" => return Ok(()),
            Some(_) => {}
            None => return Err(corrupt("document ended inside Times")),
        }
    }
}

fn parse_string_field(
    reader: &mut XmlReader,
    stream: &mut InnerStream,
    entry: &mut Entry,
) -> AppResult<()> {
    let mut key: Option<String> = None;
    let mut value: Option<FieldValue> = None;

    loop {
        match reader.next_element_event()? {
            Some(XmlEvent::Start { name, attrs }) => match name.as_str() {
                "Key" => key = Some(reader.read_leaf_text()?),
                "Value" => {
                    let protected = attrs
                        .iter()
                        .any(|(attr, v)| attr == "Protected" && v == "True");
                    let text = reader.read_leaf_text()?;
                    value = Some(if protected {
                        let mut bytes = BASE64
                            .decode(text.trim())
                            .map_err(|_| corrupt("protected value is not base64"))?;
                        stream.apply(&mut bytes);
                        let cleartext = String::from_utf8(bytes)
                            .map_err(|_| corrupt("protected value is not utf8"))?;
                        FieldValue::Protected(ProtectedValue::new(&cleartext)?)
                    } else {
                        FieldValue::Plain(text)
                    });
                }
                _ => reader.skip_element()?,
            },
            Some(XmlEvent::End(name)) if name == "String" => break,
            Some(_) => {}
            None => return Err(corrupt("document ended inside String")),
        }
    }

    let key = key.ok_or_else(|| corrupt("String field is missing its Key"))?;
    entry.fields.insert(key, value.unwrap_or(FieldValue::Plain(String::new())));
    Ok(())
}

fn parse_history(
    reader: &mut XmlReader,
    stream: &mut InnerStream,
    entry: &mut Entry,
) -> AppResult<()> {
    loop {
        match reader.next_element_event()? {
            Some(XmlEvent::Start { name, .. }) => {
                if name == "Entry" {
                    let mut snapshot = parse_entry(reader, stream, false)?;
                    snapshot.group = entry.group;
                    entry.history.push(snapshot);
                } else {
                    reader.skip_element()?;
                }
            }
            Some(XmlEvent::End(name)) if name == "History" => return Ok(()),
            Some(_) => {}
            None => return Err(corrupt("document ended inside History")),
        }
    }
}

fn flatten_group(
    parsed: ParsedGroup,
    parent: Option<Uuid>,
    groups: &mut BTreeMap<Uuid, Group>,
    entries: &mut BTreeMap<Uuid, Entry>,
) {
    let mut group = Group {
        id: parsed.id,
        name: parsed.name,
        parent,
        icon_id: parsed.icon_id,
        child_groups: Vec::new(),
        entry_ids: Vec::new(),
        is_recycle_bin: false,
    };

    for mut entry in parsed.entries {
        entry.group = group.id;
        for snapshot in &mut entry.history {
            snapshot.group = group.id;
        }
        group.entry_ids.push(entry.id);
        entries.insert(entry.id, entry);
    }
    for child in parsed.children {
        group.child_groups.push(child.id);
        flatten_group(child, Some(group.id), groups, entries);
    }
    groups.insert(group.id, group);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inner::InnerStream;
    use kp_core::entry::EntryData;
    use kp_core::vault::EntryFilter;

    fn round_trip(vault: &Vault) -> Vault {
        let key = [7u8; 64];
        let mut write_stream = InnerStream::new(&key);
        let xml = write_document(vault, &mut write_stream);
        let mut read_stream = InnerStream::new(&key);
        parse_document(&xml, &mut read_stream, vault.cipher, vault.kdf).expect("parse")
    }

    fn sample_vault() -> Vault {
        let mut vault = Vault::new("Sample", 1_700_000_000_000);
        vault
            .create_entry(
                &EntryData {
                    title: Some("Gmail".to_string()),
                    username: Some("u@x".to_string()),
                    password: Some("p&<>'\"".to_string()),
                    url: Some("gmail.com".to_string()),
                    tags: Some(vec!["mail".to_string(), "personal".to_string()]),
                    ..EntryData::default()
                },
                1_700_000_001_000,
            )
            .expect("create");
        vault
    }

    #[test]
    fn document_round_trip_preserves_structure_and_fields() {
        let vault = sample_vault();
        let back = round_trip(&vault);

        assert_eq!(back.meta.name, "Sample");
        let listed = back.list_entries(&EntryFilter::default());
        assert_eq!(listed.len(), 1);
        let entry = &listed[0];
        assert_eq!(entry.title, "Gmail");
        assert_eq!(entry.password, "p&<>'\"");
        assert_eq!(entry.tags, vec!["mail", "personal"]);
        assert_eq!(entry.creation_time_ms, 1_700_000_001_000);
    }

    #[test]
    fn password_stays_protected_and_masked_in_the_document() {
        let vault = sample_vault();
        let mut stream = InnerStream::new(&[7u8; 64]);
        let xml = write_document(&vault, &mut stream);
        assert!(xml.contains("Protected=\"True\""));
        assert!(!xml.contains("p&amp;&lt;&gt;"));
    }

    #[test]
    fn history_round_trips_with_protected_fields() {
        let mut vault = sample_vault();
        let id = vault.list_entries(&EntryFilter::default())[0].id;
        vault
            .update_entry(
                &EntryData {
                    id: Some(id),
                    password: Some("rotated".to_string()),
                    ..EntryData::default()
                },
                1_700_000_002_000,
            )
            .expect("update");

        let back = round_trip(&vault);
        let entry = back.entry(id).expect("entry");
        assert_eq!(entry.history.len(), 1);
        assert_eq!(
            entry.history[0].get_field("Password").as_deref(),
            Some("p&<>'\"")
        );
        assert_eq!(entry.get_field("Password").as_deref(), Some("rotated"));
    }

    #[test]
    fn recycle_bin_flag_survives_the_document() {
        let mut vault = sample_vault();
        let id = vault.list_entries(&EntryFilter::default())[0].id;
        vault.delete_entry(id, 1_700_000_003_000);
        assert!(vault.recycle_bin_id().is_some());

        let back = round_trip(&vault);
        assert_eq!(back.recycle_bin_id(), vault.recycle_bin_id());
        assert!(back.list_entries(&EntryFilter::default()).is_empty());
        assert!(back.entry(id).is_some());
    }

    #[test]
    fn subgroups_keep_their_nesting() {
        let mut vault = Vault::new("Nested", 1);
        let work = vault
            .add_group(Group::new("Work", Some(vault.root_id())))
            .expect("group");
        vault
            .create_entry(
                &EntryData {
                    group_id: Some(work),
                    title: Some("VPN".to_string()),
                    password: Some("wg".to_string()),
                    ..EntryData::default()
                },
                2,
            )
            .expect("create");

        let back = round_trip(&vault);
        let group = back.group(work).expect("group survives");
        assert_eq!(group.name, "Work");
        assert_eq!(group.parent, Some(back.root_id()));
        assert_eq!(group.entry_ids.len(), 1);
    }

    #[test]
    fn time_encoding_round_trips() {
        let ms = 1_700_000_123_000;
        assert_eq!(decode_time(&encode_time(ms)).expect("decode"), ms);
    }
}
