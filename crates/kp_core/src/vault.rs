use crate::app_error::{AppError, AppResult};
use crate::entry::{Entry, EntryData, EntryView, GroupView, FIELD_NOTES, FIELD_PASSWORD, FIELD_TITLE, FIELD_URL, FIELD_USERNAME};
use crate::random::new_uuid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

pub const RECYCLE_BIN_NAME: &str = "Recycle Bin";
pub const RECYCLE_BIN_ICON: u32 = 43;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CipherKind {
    Aes256Cbc,
    ChaCha20,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Argon2Variant {
    Argon2d,
    Argon2id,
}

impl Argon2Variant {
    /// Numeric tag used by Argon2 itself (d=0, id=2).
    pub fn type_code(self) -> u32 {
        match self {
            Argon2Variant::Argon2d => 0,
            Argon2Variant::Argon2id => 2,
        }
    }
}

/// Key-derivation settings attached to a vault. `save` re-uses them verbatim;
/// `load` captures whatever the container declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfSettings {
    pub variant: Argon2Variant,
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
    pub version: u32,
}

impl Default for KdfSettings {
    fn default() -> Self {
        Self {
            variant: Argon2Variant::Argon2id,
            memory_kib: 65_536,
            iterations: 3,
            parallelism: 1,
            version: 0x13,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseMeta {
    pub name: String,
    pub last_mod_time_ms: i64,
    pub history_max_items: u32,
    pub recycle_bin_enabled: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
    pub parent: Option<Uuid>,
    pub icon_id: u32,
    pub child_groups: Vec<Uuid>,
    pub entry_ids: Vec<Uuid>,
    pub is_recycle_bin: bool,
}

impl Group {
    pub fn new(name: &str, parent: Option<Uuid>) -> Self {
        Self {
            id: new_uuid(),
            name: name.to_string(),
            parent,
            icon_id: 48,
            child_groups: Vec::new(),
            entry_ids: Vec::new(),
            is_recycle_bin: false,
        }
    }
}

/// Filter for [`Vault::list_entries`].
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EntryFilter {
    #[serde(default)]
    pub group_id: Option<Uuid>,
    #[serde(default)]
    pub search: Option<String>,
}

/// The decrypted database: an arena of groups and entries linked by id.
/// Parent/child relations are ids, never references, so the tree carries no
/// cycles and clones freely.
#[derive(Debug, Clone, PartialEq)]
pub struct Vault {
    pub meta: DatabaseMeta,
    pub cipher: CipherKind,
    pub kdf: KdfSettings,
    groups: BTreeMap<Uuid, Group>,
    entries: BTreeMap<Uuid, Entry>,
    root: Uuid,
    recycle_bin: Option<Uuid>,
}

impl Vault {
    pub fn new(name: &str, now_ms: i64) -> Self {
        let root = Group::new(name, None);
        let root_id = root.id;
        let mut groups = BTreeMap::new();
        groups.insert(root_id, root);
        Self {
            meta: DatabaseMeta {
                name: name.to_string(),
                last_mod_time_ms: now_ms,
                history_max_items: 10,
                recycle_bin_enabled: true,
            },
            cipher: CipherKind::ChaCha20,
            kdf: KdfSettings::default(),
            groups,
            entries: BTreeMap::new(),
            root: root_id,
            recycle_bin: None,
        }
    }

    /// Rebuild a vault from parsed parts; used by the codec reader. The root
    /// must be present in `groups` and every parent/child id must resolve.
    pub fn from_parts(
        meta: DatabaseMeta,
        cipher: CipherKind,
        kdf: KdfSettings,
        groups: BTreeMap<Uuid, Group>,
        entries: BTreeMap<Uuid, Entry>,
        root: Uuid,
        recycle_bin: Option<Uuid>,
    ) -> AppResult<Self> {
        if !groups.contains_key(&root) {
            return Err(AppError::new(
                "KP_BLOB_CORRUPT",
                "vault",
                "root group id does not resolve",
                false,
                serde_json::json!({ "root": root }),
            ));
        }
        for group in groups.values() {
            for child in &group.child_groups {
                if !groups.contains_key(child) {
                    return Err(AppError::new(
                        "KP_BLOB_CORRUPT",
                        "vault",
                        "child group id does not resolve",
                        false,
                        serde_json::json!({ "group": group.id, "child": child }),
                    ));
                }
            }
            for entry_id in &group.entry_ids {
                if !entries.contains_key(entry_id) {
                    return Err(AppError::new(
                        "KP_BLOB_CORRUPT",
                        "vault",
                        "entry id does not resolve",
                        false,
                        serde_json::json!({ "group": group.id, "entry": entry_id }),
                    ));
                }
            }
        }
        Ok(Self {
            meta,
            cipher,
            kdf,
            groups,
            entries,
            root,
            recycle_bin,
        })
    }

    pub fn root_id(&self) -> Uuid {
        self.root
    }

    pub fn recycle_bin_id(&self) -> Option<Uuid> {
        self.recycle_bin
    }

    pub fn group(&self, id: Uuid) -> Option<&Group> {
        self.groups.get(&id)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn entries(&self) -> impl Iterator<Item = &Entry> {
        self.entries.values()
    }

    pub fn entry(&self, id: Uuid) -> Option<&Entry> {
        self.entries.get(&id)
    }

    /// Entry count excluding the recycle-bin subtree, surfaced in metadata.
    pub fn entry_count(&self) -> usize {
        self.entries
            .values()
            .filter(|entry| !self.in_recycle_bin(entry.group))
            .count()
    }

    fn in_recycle_bin(&self, mut group_id: Uuid) -> bool {
        let Some(bin) = self.recycle_bin else {
            return false;
        };
        loop {
            if group_id == bin {
                return true;
            }
            match self.groups.get(&group_id).and_then(|g| g.parent) {
                Some(parent) => group_id = parent,
                None => return false,
            }
        }
    }

    pub fn add_group(&mut self, mut group: Group) -> AppResult<Uuid> {
        let parent_id = group.parent.unwrap_or(self.root);
        group.parent = Some(parent_id);
        let id = group.id;
        if group.is_recycle_bin {
            self.recycle_bin = Some(id);
        }
        let parent = self.groups.get_mut(&parent_id).ok_or_else(|| {
            AppError::new(
                "KP_NOT_FOUND",
                "vault",
                "parent group does not exist",
                false,
                serde_json::json!({ "parent": parent_id }),
            )
        })?;
        parent.child_groups.push(id);
        self.groups.insert(id, group);
        Ok(id)
    }

    fn ensure_recycle_bin(&mut self) -> Uuid {
        if let Some(bin) = self.recycle_bin {
            return bin;
        }
        let mut bin = Group::new(RECYCLE_BIN_NAME, Some(self.root));
        bin.icon_id = RECYCLE_BIN_ICON;
        bin.is_recycle_bin = true;
        let id = bin.id;
        self.groups
            .get_mut(&self.root)
            .expect("root group always resolves")
            .child_groups
            .push(id);
        self.groups.insert(id, bin);
        self.recycle_bin = Some(id);
        id
    }

    fn collect_group_entries(&self, group_id: Uuid, out: &mut Vec<Uuid>) {
        let Some(group) = self.groups.get(&group_id) else {
            return;
        };
        if group.is_recycle_bin {
            return;
        }
        out.extend(group.entry_ids.iter().copied());
        for child in &group.child_groups {
            self.collect_group_entries(*child, out);
        }
    }

    /// Recursive enumeration, recycle bin excluded. A `search` filter matches
    /// title, username, URL, notes and tags, case-insensitively.
    pub fn list_entries(&self, filter: &EntryFilter) -> Vec<EntryView> {
        let start = filter.group_id.unwrap_or(self.root);
        let mut ids = Vec::new();
        self.collect_group_entries(start, &mut ids);

        ids.iter()
            .filter_map(|id| self.entries.get(id))
            .filter(|entry| match &filter.search {
                Some(needle) if !needle.is_empty() => entry.matches_search(needle),
                _ => true,
            })
            .map(Entry::to_view)
            .collect()
    }

    pub fn get_entry(&self, id: Uuid) -> Option<EntryView> {
        self.entries.get(&id).map(Entry::to_view)
    }

    /// Entries whose stored URL names the same host as `url`, either side
    /// allowed to be a subdomain of the other (covers host-only storage
    /// like `"gmail.com"` against `"https://www.gmail.com/"`).
    pub fn entries_for_host(&self, url: &str) -> Vec<EntryView> {
        let Some(host) = host_of(url) else {
            return Vec::new();
        };
        let mut ids = Vec::new();
        self.collect_group_entries(self.root, &mut ids);

        ids.iter()
            .filter_map(|id| self.entries.get(id))
            .filter(|entry| {
                let stored = entry.url();
                if stored.is_empty() {
                    return false;
                }
                match host_of(&stored) {
                    Some(stored_host) => hosts_match(&host, &stored_host),
                    None => false,
                }
            })
            .map(Entry::to_view)
            .collect()
    }

    pub fn create_entry(&mut self, data: &EntryData, now_ms: i64) -> AppResult<EntryView> {
        let group_id = data.group_id.unwrap_or(self.root);
        if !self.groups.contains_key(&group_id) {
            return Err(AppError::not_found("group"));
        }

        let mut entry = Entry::new(group_id, now_ms);
        apply_entry_data(&mut entry, data)?;
        let view = entry.to_view();
        self.groups
            .get_mut(&group_id)
            .expect("group presence checked above")
            .entry_ids
            .push(entry.id);
        self.entries.insert(entry.id, entry);
        self.meta.last_mod_time_ms = now_ms;
        Ok(view)
    }

    /// Push the current state to history, overwrite the provided fields and
    /// bump `last_mod_time`. Returns `None` for an unknown id.
    pub fn update_entry(&mut self, data: &EntryData, now_ms: i64) -> AppResult<Option<EntryView>> {
        let Some(id) = data.id else {
            return Err(AppError::new(
                "KP_NOT_FOUND",
                "vault",
                "update requires an entry id",
                false,
                serde_json::json!({}),
            ));
        };
        let max_history = self.meta.history_max_items as usize;
        let Some(entry) = self.entries.get_mut(&id) else {
            return Ok(None);
        };

        entry.push_history(max_history);
        apply_entry_data(entry, data)?;
        entry.times.last_mod_time_ms = now_ms;
        let view = entry.to_view();
        self.meta.last_mod_time_ms = now_ms;
        Ok(Some(view))
    }

    /// Move to the recycle bin when the vault keeps one; erase otherwise.
    /// Deleting an entry already inside the bin always erases.
    pub fn delete_entry(&mut self, id: Uuid, now_ms: i64) -> bool {
        let Some(entry) = self.entries.get(&id) else {
            return false;
        };
        let source_group = entry.group;
        let recycle = self.meta.recycle_bin_enabled && !self.in_recycle_bin(source_group);

        if recycle {
            let bin = self.ensure_recycle_bin();
            if let Some(group) = self.groups.get_mut(&source_group) {
                group.entry_ids.retain(|eid| *eid != id);
            }
            self.groups
                .get_mut(&bin)
                .expect("bin created above")
                .entry_ids
                .push(id);
            let entry = self.entries.get_mut(&id).expect("entry presence checked");
            entry.group = bin;
            entry.times.last_mod_time_ms = now_ms;
        } else {
            if let Some(group) = self.groups.get_mut(&source_group) {
                group.entry_ids.retain(|eid| *eid != id);
            }
            self.entries.remove(&id);
        }
        self.meta.last_mod_time_ms = now_ms;
        true
    }

    fn collect_groups_depth_first(&self, group_id: Uuid, out: &mut Vec<GroupView>) {
        let Some(group) = self.groups.get(&group_id) else {
            return;
        };
        if group.is_recycle_bin {
            return;
        }
        out.push(GroupView {
            id: group.id,
            name: group.name.clone(),
            parent_id: group.parent,
            icon_id: group.icon_id,
            entry_count: group.entry_ids.len(),
        });
        for child in &group.child_groups {
            self.collect_groups_depth_first(*child, out);
        }
    }

    /// Depth-first group listing, recycle bin excluded.
    pub fn list_groups(&self) -> Vec<GroupView> {
        let mut out = Vec::new();
        self.collect_groups_depth_first(self.root, &mut out);
        out
    }
}

fn apply_entry_data(entry: &mut Entry, data: &EntryData) -> AppResult<()> {
    if let Some(title) = &data.title {
        entry.set_field(FIELD_TITLE, title.clone());
    }
    if let Some(username) = &data.username {
        entry.set_field(FIELD_USERNAME, username.clone());
    }
    if let Some(password) = &data.password {
        entry.set_protected_field(FIELD_PASSWORD, password)?;
    }
    if let Some(url) = &data.url {
        entry.set_field(FIELD_URL, url.clone());
    }
    if let Some(notes) = &data.notes {
        entry.set_field(FIELD_NOTES, notes.clone());
    }
    if let Some(tags) = &data.tags {
        entry.tags = tags.clone();
    }
    if let Some(custom) = &data.custom {
        for (key, value) in custom {
            entry.set_field(key, value.clone());
        }
    }
    Ok(())
}

/// Same host, or one is a label-aligned subdomain of the other.
pub fn hosts_match(page_host: &str, stored_host: &str) -> bool {
    page_host == stored_host
        || page_host.ends_with(&format!(".{stored_host}"))
        || stored_host.ends_with(&format!(".{page_host}"))
}

/// Extract the lowercased host from a URL-ish string: strips scheme,
/// userinfo, port, path, query and fragment. Returns `None` for strings
/// with no host-shaped remainder.
pub fn host_of(url: &str) -> Option<String> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return None;
    }
    let after_scheme = match trimmed.find("://") {
        Some(idx) => &trimmed[idx + 3..],
        None => trimmed,
    };
    let authority = after_scheme
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default();
    let host_port = match authority.rfind('@') {
        Some(idx) => &authority[idx + 1..],
        None => authority,
    };
    let host = host_port.split(':').next().unwrap_or_default();
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_data(title: &str, url: &str) -> EntryData {
        EntryData {
            title: Some(title.to_string()),
            username: Some("user".to_string()),
            password: Some("secret".to_string()),
            url: Some(url.to_string()),
            ..EntryData::default()
        }
    }

    #[test]
    fn host_extraction_strips_scheme_port_and_path() {
        assert_eq!(
            host_of("https://www.italki.com/lesson/42").as_deref(),
            Some("www.italki.com")
        );
        assert_eq!(host_of("gmail.com").as_deref(), Some("gmail.com"));
        assert_eq!(
            host_of("http://user:pw@Example.ORG:8443/a?b#c").as_deref(),
            Some("example.org")
        );
        assert_eq!(host_of("   "), None);
    }

    #[test]
    fn create_assigns_fresh_uuid_and_lands_in_root() {
        let mut vault = Vault::new("test", 10);
        let view = vault
            .create_entry(&entry_data("Gmail", "gmail.com"), 20)
            .expect("create");
        assert_eq!(view.group_id, vault.root_id());
        assert_eq!(view.creation_time_ms, 20);
        assert_eq!(vault.entry_count(), 1);
        assert_eq!(vault.meta.last_mod_time_ms, 20);
    }

    #[test]
    fn update_pushes_history_and_bumps_mod_time() {
        let mut vault = Vault::new("test", 10);
        let created = vault
            .create_entry(&entry_data("Gmail", "gmail.com"), 20)
            .expect("create");

        let update = EntryData {
            id: Some(created.id),
            title: Some("Gmail (work)".to_string()),
            ..EntryData::default()
        };
        let updated = vault
            .update_entry(&update, 30)
            .expect("update")
            .expect("entry exists");
        assert_eq!(updated.title, "Gmail (work)");
        assert_eq!(updated.history_len, 1);
        assert_eq!(updated.last_mod_time_ms, 30);
        // untouched fields survive a partial update
        assert_eq!(updated.username, "user");
    }

    #[test]
    fn update_of_unknown_id_returns_none() {
        let mut vault = Vault::new("test", 10);
        let update = EntryData {
            id: Some(new_uuid()),
            title: Some("nope".to_string()),
            ..EntryData::default()
        };
        assert!(vault.update_entry(&update, 30).expect("update").is_none());
    }

    #[test]
    fn delete_moves_to_recycle_bin_then_erases() {
        let mut vault = Vault::new("test", 10);
        let view = vault
            .create_entry(&entry_data("Gmail", "gmail.com"), 20)
            .expect("create");

        assert!(vault.delete_entry(view.id, 30));
        let bin = vault.recycle_bin_id().expect("bin created on demand");
        assert_eq!(vault.entry(view.id).expect("still stored").group, bin);
        assert!(vault
            .list_entries(&EntryFilter::default())
            .iter()
            .all(|e| e.id != view.id));
        assert_eq!(vault.entry_count(), 0);

        // second delete erases permanently
        assert!(vault.delete_entry(view.id, 40));
        assert!(vault.entry(view.id).is_none());
    }

    #[test]
    fn recycle_bin_subtree_is_invisible_to_enumeration() {
        let mut vault = Vault::new("test", 10);
        let kept = vault
            .create_entry(&entry_data("Kept", "kept.example"), 20)
            .expect("create");
        let binned = vault
            .create_entry(&entry_data("Binned", "binned.example"), 21)
            .expect("create");
        vault.delete_entry(binned.id, 30);

        let listed = vault.list_entries(&EntryFilter::default());
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, kept.id);

        let groups = vault.list_groups();
        assert!(groups.iter().all(|g| g.name != RECYCLE_BIN_NAME));
    }

    #[test]
    fn search_filters_listing() {
        let mut vault = Vault::new("test", 10);
        vault
            .create_entry(&entry_data("Gmail", "gmail.com"), 20)
            .expect("create");
        vault
            .create_entry(&entry_data("Bank", "bank.example"), 21)
            .expect("create");

        let hits = vault.list_entries(&EntryFilter {
            group_id: None,
            search: Some("gmai".to_string()),
        });
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Gmail");
    }

    #[test]
    fn entries_for_host_matches_exact_and_subdomain_hosts() {
        let mut vault = Vault::new("test", 10);
        vault
            .create_entry(&entry_data("Italki", "italki.com"), 20)
            .expect("create");
        vault
            .create_entry(&entry_data("Mail", "https://mail.example.org/inbox"), 21)
            .expect("create");

        // page host is a subdomain of the stored host
        let hits = vault.entries_for_host("https://www.italki.com/lesson/42");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Italki");

        // stored host is a subdomain of the page host
        let hits = vault.entries_for_host("https://example.org/");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Mail");

        assert!(vault.entries_for_host("https://unrelated.net/").is_empty());
        // suffix overlap without a label boundary is not a match
        assert!(vault.entries_for_host("https://notitalki.com/").is_empty());
    }

    #[test]
    fn host_matching_requires_label_boundaries() {
        assert!(hosts_match("www.italki.com", "italki.com"));
        assert!(hosts_match("italki.com", "www.italki.com"));
        assert!(hosts_match("gmail.com", "gmail.com"));
        assert!(!hosts_match("notitalki.com", "italki.com"));
        assert!(!hosts_match("italki.com.evil.example", "italki.com"));
    }

    #[test]
    fn scoped_listing_covers_subgroups() {
        let mut vault = Vault::new("test", 10);
        let sub = vault
            .add_group(Group::new("Work", Some(vault.root_id())))
            .expect("group");
        let nested = vault.add_group(Group::new("Infra", Some(sub))).expect("group");
        vault
            .create_entry(
                &EntryData {
                    group_id: Some(nested),
                    ..entry_data("VPN", "vpn.corp")
                },
                20,
            )
            .expect("create");

        let scoped = vault.list_entries(&EntryFilter {
            group_id: Some(sub),
            search: None,
        });
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].title, "VPN");
    }
}
