use std::collections::HashMap;
use std::fs;
use std::io::{Read, Write};
use std::sync::atomic::AtomicBool;

use chrono::{DateTime, Utc};
use tempfile::TempDir;

use lomob::clients::{DocStore, RemoteEntry};
use lomob::packer::flatten_root;
use lomob::types::{FileInfo, SUPER_SCAN_ROOT_DIR_ID};
use lomob::{hash, smallfile, Catalog, Error, MasterDecryptingWriter, Result, ISO_ID_CLOUD};

// ── In-memory document store ─────────────────────────────────────────────────

struct Entry {
    name:      String,
    parent:    Option<String>,
    is_folder: bool,
    body:      Vec<u8>,
    props:     HashMap<String, String>,
}

#[derive(Default)]
struct FakeDoc {
    entries: HashMap<String, Entry>,
    next_id: u64,
}

impl FakeDoc {
    fn add(&mut self, name: &str, parent: Option<&str>, is_folder: bool, body: Vec<u8>) -> String {
        self.next_id += 1;
        let id = format!("id-{}", self.next_id);
        self.entries.insert(
            id.clone(),
            Entry {
                name: name.to_string(),
                parent: parent.map(|p| p.to_string()),
                is_folder,
                body,
                props: HashMap::new(),
            },
        );
        id
    }

    fn find(&self, name: &str, parent: Option<&str>) -> Option<(&String, &Entry)> {
        self.entries.iter().find(|(_, e)| {
            e.name == name && (parent.is_none() || e.parent.as_deref() == parent)
        })
    }

    fn folder_chain(&self, id: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut current = Some(id.to_string());
        while let Some(id) = current {
            let e = &self.entries[&id];
            chain.push(e.name.clone());
            current = e.parent.clone();
        }
        chain.reverse();
        chain
    }
}

impl DocStore for FakeDoc {
    fn get_file_id(&mut self, name: &str, parent: Option<&str>)
        -> Result<Option<(String, String)>> {
        Ok(self
            .find(name, parent)
            .map(|(id, e)| (id.clone(), e.parent.clone().unwrap_or_default())))
    }

    fn get_or_create_folder(
        &mut self,
        name: &str,
        parent: Option<&str>,
        _mod_time: Option<DateTime<Utc>>,
    ) -> Result<(bool, String)> {
        if let Some((id, _)) = self.find(name, parent) {
            return Ok((true, id.clone()));
        }
        Ok((false, self.add(name, parent, true, Vec::new())))
    }

    fn create_file(
        &mut self,
        name: &str,
        parent: Option<&str>,
        mut body: Box<dyn Read + Send>,
        _mod_time: Option<DateTime<Utc>>,
    ) -> Result<String> {
        let mut bytes = Vec::new();
        body.read_to_end(&mut bytes)?;
        Ok(self.add(name, parent, false, bytes))
    }

    fn download(&mut self, id: &str) -> Result<Box<dyn Read>> {
        let e = self
            .entries
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("entry {id}")))?;
        Ok(Box::new(std::io::Cursor::new(e.body.clone())))
    }

    fn update_app_properties(&mut self, id: &str, props: &[(&str, &str)]) -> Result<()> {
        let e = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("entry {id}")))?;
        for (k, v) in props {
            e.props.insert(k.to_string(), v.to_string());
        }
        Ok(())
    }

    fn list(&mut self, folder_id: &str) -> Result<(Vec<RemoteEntry>, Vec<RemoteEntry>)> {
        let mut folders = Vec::new();
        let mut files = Vec::new();
        for (id, e) in &self.entries {
            if e.parent.as_deref() != Some(folder_id) {
                continue;
            }
            let item = RemoteEntry {
                id:        id.clone(),
                name:      e.name.clone(),
                is_folder: e.is_folder,
                size:      e.body.len() as i64,
                mod_time:  None,
            };
            if e.is_folder {
                folders.push(item);
            } else {
                files.push(item);
            }
        }
        Ok((folders, files))
    }
}

// ── Fixture ──────────────────────────────────────────────────────────────────

struct Fixture {
    _tmp:     TempDir,
    db_path:  std::path::PathBuf,
    root:     std::path::PathBuf,
    content:  Vec<u8>,
}

fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("photos");
    fs::create_dir_all(root.join("2024")).unwrap();
    let content = b"jpeg bytes of a.jpg".to_vec();
    fs::write(root.join("2024/a.jpg"), &content).unwrap();

    let db_path = tmp.path().join("lomob.db");
    let mut catalog = Catalog::open(&db_path).unwrap();
    let root_id = catalog
        .get_or_insert_dir(&root.to_string_lossy(), SUPER_SCAN_ROOT_DIR_ID, None)
        .unwrap();
    let dir_id = catalog.get_or_insert_dir("2024", root_id, None).unwrap();
    catalog
        .insert_file(&FileInfo {
            dir_id,
            name: "a.jpg".into(),
            size: content.len() as i64,
            hash_local: hash::to_hex(&hash::hash_bytes(&content)),
            mod_time: Some(Utc::now()),
            ..FileInfo::default()
        })
        .unwrap();

    Fixture { _tmp: tmp, db_path, root, content }
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[test]
fn mirrors_hierarchy_and_uploads_ciphertext() {
    let fx = fixture();
    let mut catalog = Catalog::open(&fx.db_path).unwrap();
    let mut doc = FakeDoc::default();
    let cancel = AtomicBool::new(false);

    smallfile::upload_files(&mut catalog, &mut doc, "lomorage", Some("pw"), &cancel).unwrap();

    // folder chain: lomorage / <flattened root> / 2024
    let flat = flatten_root(&fx.root.to_string_lossy());
    let (file_id, file_entry) = doc
        .entries
        .iter()
        .find(|(_, e)| !e.is_folder)
        .map(|(id, e)| (id.clone(), e))
        .unwrap();
    assert_eq!(file_entry.name, "a.jpg");
    let parent = file_entry.parent.clone().unwrap();
    assert_eq!(doc.folder_chain(&parent), vec!["lomorage".to_string(), flat, "2024".into()]);

    // body is ciphertext that decrypts back to the original
    assert_eq!(file_entry.body.len(), fx.content.len() + lomob::SALT_LEN);
    let mut plain = Vec::new();
    let mut dec = MasterDecryptingWriter::new(&mut plain, "pw");
    dec.write_all(&file_entry.body).unwrap();
    dec.flush().unwrap();
    assert_eq!(plain, fx.content);

    // self-describing app-properties, hex on both sides
    assert_eq!(
        file_entry.props.get("hash_orig").unwrap(),
        &hash::to_hex(&hash::hash_bytes(&fx.content))
    );
    assert_eq!(
        file_entry.props.get("hash_enc").unwrap(),
        &hash::to_hex(&hash::hash_bytes(&file_entry.body))
    );

    // catalog marks the file as mirrored
    let roots = catalog.list_scan_root_dirs().unwrap();
    let root_id = *roots.keys().next().unwrap();
    let dir_id = catalog.get_dir_id("2024", root_id).unwrap().unwrap();
    let rec = catalog.get_file_by_name_and_dir("a.jpg", dir_id).unwrap().unwrap();
    assert_eq!(rec.iso_id, ISO_ID_CLOUD);
    assert_eq!(rec.ref_id, file_id);
    assert_eq!(rec.hash_remote, hash::to_base64(&hash::hash_bytes(&file_entry.body)));

    // nothing left to mirror
    assert!(catalog.list_files_not_in_iso_and_cloud().unwrap().is_empty());
}

#[test]
fn rerun_skips_mirrored_files_and_reuses_folders() {
    let fx = fixture();
    let mut catalog = Catalog::open(&fx.db_path).unwrap();
    let mut doc = FakeDoc::default();
    let cancel = AtomicBool::new(false);

    smallfile::upload_files(&mut catalog, &mut doc, "lomorage", Some("pw"), &cancel).unwrap();
    let count = doc.entries.len();

    smallfile::upload_files(&mut catalog, &mut doc, "lomorage", Some("pw"), &cancel).unwrap();
    assert_eq!(doc.entries.len(), count);
}

#[test]
fn plaintext_mirror_keeps_bytes_and_skips_cipher_property() {
    let fx = fixture();
    let mut catalog = Catalog::open(&fx.db_path).unwrap();
    let mut doc = FakeDoc::default();
    let cancel = AtomicBool::new(false);

    smallfile::upload_files(&mut catalog, &mut doc, "lomorage", None, &cancel).unwrap();

    let (_, file_entry) = doc.entries.iter().find(|(_, e)| !e.is_folder).unwrap();
    assert_eq!(file_entry.body, fx.content);
    assert!(file_entry.props.contains_key("hash_orig"));
    assert!(!file_entry.props.contains_key("hash_enc"));
}
