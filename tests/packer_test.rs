use std::fs;
use std::path::Path;
use std::sync::Mutex;

use chrono::{TimeZone, Utc};
use filetime::FileTime;
use tempfile::TempDir;
use walkdir::WalkDir;

use lomob::types::{FileInfo, SUPER_SCAN_ROOT_DIR_ID};
use lomob::{Catalog, IsoStatus, IsoWriter, Result};

/// Test double: serialises the staged tree into the output file
/// deterministically and records what it saw.
#[derive(Default)]
struct RecordingWriter {
    staged: Mutex<Vec<(String, i64, FileTime)>>,
}

impl IsoWriter for RecordingWriter {
    fn write_image(&self, volume_id: &str, output: &Path, staging_dir: &Path) -> Result<()> {
        let mut entries: Vec<(String, Vec<u8>, FileTime)> = WalkDir::new(staging_dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| {
                let rel = e
                    .path()
                    .strip_prefix(staging_dir)
                    .unwrap()
                    .to_string_lossy()
                    .to_string();
                let bytes = fs::read(e.path()).unwrap();
                let mtime = FileTime::from_last_modification_time(&e.metadata().unwrap());
                (rel, bytes, mtime)
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let mut image = Vec::new();
        image.extend_from_slice(volume_id.as_bytes());
        for (rel, bytes, mtime) in &entries {
            image.extend_from_slice(rel.as_bytes());
            image.extend_from_slice(&(bytes.len() as u64).to_le_bytes());
            image.extend_from_slice(bytes);
            self.staged.lock().unwrap().push((rel.clone(), bytes.len() as i64, *mtime));
        }
        fs::write(output, image)?;
        Ok(())
    }
}

struct Fixture {
    _tmp:    TempDir,
    db_path: std::path::PathBuf,
    root:    std::path::PathBuf,
    out_dir: std::path::PathBuf,
}

/// Root with a.jpg/b.jpg (5000 B), c.jpg (2000 B) on disk, plus d.jpg only
/// in the catalog.  Insertion order a, d, b, c.
fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("photos");
    fs::create_dir_all(&root).unwrap();
    let out_dir = tmp.path().join("out");
    fs::create_dir_all(&out_dir).unwrap();
    let db_path = tmp.path().join("lomob.db");

    let mut catalog = Catalog::open(&db_path).unwrap();
    let root_str = root.to_string_lossy().to_string();
    let root_id = catalog
        .get_or_insert_dir(&root_str, SUPER_SCAN_ROOT_DIR_ID, None)
        .unwrap();
    let dir_id = catalog.get_or_insert_dir("", root_id, None).unwrap();

    let seeds = [("a.jpg", 5000usize, true), ("d.jpg", 5000, false), ("b.jpg", 5000, true), ("c.jpg", 2000, true)];
    for (i, (name, size, on_disk)) in seeds.iter().enumerate() {
        let mod_time = Utc.with_ymd_and_hms(2024, 1, (i + 1) as u32, 12, 0, 0).unwrap();
        if *on_disk {
            let path = root.join(name);
            fs::write(&path, vec![i as u8; *size]).unwrap();
            let ft = FileTime::from_unix_time(mod_time.timestamp(), 0);
            filetime::set_file_times(&path, ft, ft).unwrap();
        }
        catalog
            .insert_file(&FileInfo {
                dir_id,
                name: name.to_string(),
                size: *size as i64,
                mod_time: Some(mod_time),
                hash_local: format!("hash-{name}"),
                ..FileInfo::default()
            })
            .unwrap();
    }

    Fixture { _tmp: tmp, db_path, root, out_dir }
}

#[test]
fn packs_until_target_and_records_atomically() {
    let fx = fixture();
    let mut catalog = Catalog::open(&fx.db_path).unwrap();
    let writer = RecordingWriter::default();

    let iso_name = fx.out_dir.join("first.iso").to_string_lossy().to_string();
    lomob::packer::mk_iso(&mut catalog, &writer, 10_000, Some(iso_name.clone())).unwrap();

    // a + b reach the 10 kB target; d vanished; c is left over
    let iso = catalog.get_iso_by_name(&iso_name).unwrap().unwrap();
    assert_eq!(iso.status, Some(IsoStatus::Created));
    assert_eq!(iso.size, fs::metadata(&iso_name).unwrap().len() as i64);
    assert_eq!(iso.hash_local, lomob::hash::to_hex(&lomob::hash::hash_file(&iso_name).unwrap()));
    assert_eq!(catalog.total_files_in_iso(iso.id).unwrap(), (10_000, 2));

    let left = catalog.list_files_not_in_iso_and_cloud().unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].name, "c.jpg");

    // the vanished file is gone from the catalog entirely
    let dirs = catalog.list_scan_root_dirs().unwrap();
    let root_id = *dirs.keys().next().unwrap();
    assert!(catalog
        .get_file_id_by_name_and_dir_path("d.jpg", "", root_id)
        .unwrap()
        .is_none());

    // staged under the flattened root, timestamps preserved
    let staged = writer.staged.lock().unwrap();
    let flat = lomob::packer::flatten_root(&fx.root.to_string_lossy());
    let names: Vec<&str> = staged.iter().map(|(n, _, _)| n.as_str()).collect();
    assert_eq!(names, vec![format!("{flat}/a.jpg"), format!("{flat}/b.jpg")]);
    let a_mtime = staged[0].2;
    assert_eq!(
        a_mtime.unix_seconds(),
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap().timestamp()
    );
}

#[test]
fn below_target_is_a_noop() {
    let fx = fixture();
    let mut catalog = Catalog::open(&fx.db_path).unwrap();
    let writer = RecordingWriter::default();

    let first = fx.out_dir.join("first.iso").to_string_lossy().to_string();
    lomob::packer::mk_iso(&mut catalog, &writer, 10_000, Some(first)).unwrap();

    // 2 kB remain, far below the target: nothing new is created
    let second = fx.out_dir.join("second.iso").to_string_lossy().to_string();
    lomob::packer::mk_iso(&mut catalog, &writer, 10_000, Some(second.clone())).unwrap();

    assert!(catalog.get_iso_by_name(&second).unwrap().is_none());
    assert_eq!(catalog.list_isos().unwrap().len(), 1);
}

#[test]
fn refuses_to_reuse_an_iso_name() {
    let fx = fixture();
    let mut catalog = Catalog::open(&fx.db_path).unwrap();
    let writer = RecordingWriter::default();

    let name = fx.out_dir.join("dup.iso").to_string_lossy().to_string();
    lomob::packer::mk_iso(&mut catalog, &writer, 5_000, Some(name.clone())).unwrap();
    assert!(lomob::packer::mk_iso(&mut catalog, &writer, 5_000, Some(name)).is_err());
}

#[test]
fn tree_listing_is_grouped_and_indented() {
    let mut roots = std::collections::HashMap::new();
    roots.insert(7i64, "/photos".to_string());

    let files = vec![
        FileInfo { dir_id: 7, name: "2024/jan/a.jpg".into(), size: 10, ..FileInfo::default() },
        FileInfo { dir_id: 7, name: "2024/b.jpg".into(), size: 20, ..FileInfo::default() },
    ];
    let listing = lomob::packer::tree_listing(&roots, &files);

    assert!(listing.starts_with("photos\n"));
    assert!(listing.contains("  2024/\n"));
    assert!(listing.contains("    jan/\n"));
    assert!(listing.contains("a.jpg (10 bytes"));
    assert!(listing.contains("b.jpg (20 bytes"));
}
