//! End-to-end lifecycle: config document → jobs → run → delivered and
//! rotated state on a local storage.

use std::fs;
use std::path::Path;

use ferry_core::config::{self, ConfigDocument};
use ferry_core::exec::CancelToken;
use ferry_core::metrics::Metrics;
use ferry_core::naming;
use ferry_core::runner::Runner;

fn doc_from(yaml: String) -> ConfigDocument {
    serde_yaml::from_str(&yaml).unwrap()
}

fn run_all(doc: &ConfigDocument, metrics: &Metrics) -> Option<ferry_core::MultiError> {
    let mut jobs = config::build_jobs(doc).unwrap();
    let cancel = CancelToken::new();
    let mut runner = Runner::new(metrics, &cancel);
    let mut all = ferry_core::MultiError::new();
    for job in &mut jobs {
        if let Some(errs) = runner.run_job(job).unwrap() {
            all.push(ferry_core::FerryError::Multi(errs));
        }
    }
    (!all.is_empty()).then_some(all)
}

fn source_tree(dir: &Path) -> std::path::PathBuf {
    let src = dir.join("data");
    fs::create_dir_all(src.join("nested")).unwrap();
    fs::write(src.join("a.txt"), b"alpha").unwrap();
    fs::write(src.join("nested/b.txt"), b"bravo").unwrap();
    src
}

#[test]
fn desc_files_job_delivers_gzipped_archive() {
    let work = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    let src = source_tree(work.path());
    let ofs = naming::ofs_from_path(&src);

    let doc = doc_from(format!(
        r#"
jobs:
  - job_name: files
    type: desc_files
    tmp_dir: {tmp}
    storages_options:
      - storage_name: local
        backup_path: {store}
        retention:
          daily: 7
          weekly: 4
    sources:
      - paths: [{src}]
        gzip: true
"#,
        tmp = work.path().join("tmp").display(),
        store = store.path().display(),
        src = src.display(),
    ));

    let metrics = Metrics::new();
    assert!(run_all(&doc, &metrics).is_none());

    let daily = store.path().join(&ofs).join("daily");
    let entries: Vec<_> = fs::read_dir(&daily)
        .unwrap()
        .map(|e| e.unwrap().path())
        .collect();
    assert_eq!(entries.len(), 1);
    let artifact = &entries[0];
    assert!(artifact.file_name().unwrap().to_string_lossy().ends_with(".tar.gz"));
    let bytes = fs::read(artifact).unwrap();
    assert_eq!(&bytes[..2], &[0x1f, 0x8b]);

    // Artifact size made it into the metrics and matches the stored copy.
    let reported = metrics
        .gather_value("backup_size_bytes", "files", &ofs)
        .unwrap();
    assert_eq!(reported as u64, bytes.len() as u64);

    // Temp artifacts are cleaned once delivered everywhere.
    let tmp_ofs = work.path().join("tmp").join(&ofs);
    let leftovers: Vec<_> = fs::read_dir(&tmp_ofs)
        .map(|iter| iter.filter_map(|e| e.ok()).collect())
        .unwrap_or_default();
    assert!(
        leftovers.is_empty(),
        "temp artifacts not cleaned: {leftovers:?}"
    );
}

#[test]
fn repeated_runs_respect_daily_count() {
    let work = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    let src = source_tree(work.path());
    let ofs = naming::ofs_from_path(&src);

    let doc = doc_from(format!(
        r#"
jobs:
  - job_name: files
    type: desc_files
    tmp_dir: {tmp}
    storages_options:
      - storage_name: local
        backup_path: {store}
        retention:
          daily: 1
    sources:
      - paths: [{src}]
"#,
        tmp = work.path().join("tmp").display(),
        store = store.path().display(),
        src = src.display(),
    ));

    let metrics = Metrics::new();
    assert!(run_all(&doc, &metrics).is_none());
    assert!(run_all(&doc, &metrics).is_none());

    let daily = store.path().join(&ofs).join("daily");
    assert_eq!(fs::read_dir(&daily).unwrap().count(), 1);
}

#[test]
fn inc_files_job_ships_base_with_sidecar_then_delta() {
    let work = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    let src = source_tree(work.path());
    let ofs = naming::ofs_from_path(&src);

    let doc = doc_from(format!(
        r#"
jobs:
  - job_name: incr
    type: inc_files
    tmp_dir: {tmp}
    storages_options:
      - storage_name: local
        backup_path: {store}
        retention:
          months: 6
    sources:
      - paths: [{src}]
        gzip: true
"#,
        tmp = work.path().join("tmp").display(),
        store = store.path().display(),
        src = src.display(),
    ));

    let metrics = Metrics::new();
    assert!(run_all(&doc, &metrics).is_none());

    let now = chrono::Utc::now();
    let day_dir = store
        .path()
        .join(&ofs)
        .join(format!("year_{}", chrono::Datelike::year(&now)))
        .join(format!("month_{:02}", chrono::Datelike::month(&now)))
        .join(format!("day_{:02}", chrono::Datelike::day(&now)));
    assert!(day_dir.join("init.tar.gz").exists());
    assert!(day_dir.join("init.tar.gz.inc").exists());

    // A second run the same day produces a delta next to the base, and the
    // pair ships atomically.
    fs::write(src.join("c.txt"), b"charlie").unwrap();
    assert!(run_all(&doc, &metrics).is_none());

    let names: Vec<String> = fs::read_dir(&day_dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    let delta: Vec<&String> = names
        .iter()
        .filter(|n| !n.starts_with("init.") && !n.ends_with(".inc"))
        .collect();
    assert_eq!(delta.len(), 1, "expected one delta in {names:?}");
    assert!(names.contains(&format!("{}.inc", delta[0])));
}

#[test]
fn list_backups_sees_delivered_files() {
    let work = tempfile::tempdir().unwrap();
    let store = tempfile::tempdir().unwrap();
    let src = source_tree(work.path());
    let ofs = naming::ofs_from_path(&src);

    let doc = doc_from(format!(
        r#"
jobs:
  - job_name: files
    type: desc_files
    tmp_dir: {tmp}
    storages_options:
      - storage_name: local
        backup_path: {store}
        retention:
          daily: 7
    sources:
      - paths: [{src}]
"#,
        tmp = work.path().join("tmp").display(),
        store = store.path().display(),
        src = src.display(),
    ));

    let metrics = Metrics::new();
    assert!(run_all(&doc, &metrics).is_none());

    let jobs = config::build_jobs(&doc).unwrap();
    let listed = jobs[0].storages[0].list_backups(&ofs).unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].contains("/daily/"));

    let mut reader = jobs[0].storages[0]
        .file_reader(&format!(
            "{ofs}/daily/{}",
            listed[0].rsplit('/').next().unwrap()
        ))
        .unwrap();
    let mut buf = Vec::new();
    std::io::Read::read_to_end(&mut reader, &mut buf).unwrap();
    assert!(!buf.is_empty());
}
