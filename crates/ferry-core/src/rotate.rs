//! Retention engine.
//!
//! Descending rotation is a graph pass: nodes are the files in the
//! generation buckets, edges are the incoming weekly/daily symlinks. A
//! deletion candidate with a surviving incoming edge is promoted (moved
//! onto the link's path) instead of unlinked; all moves run before any
//! delete so the link graph stays consistent at every intermediate step.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use chrono::{DateTime, Datelike, Utc};
use tracing::{debug, info};

use crate::error::{FerryError, MultiError};
use crate::naming::{join_remote, relative_to, remote_parent, resolve_link};
use crate::retention::{Bucket, Retention};
use crate::storage::{FileEntry, Transport};

/// Incoming symlinks of one bucket file. Weekly wins over daily when both
/// survive (the daily link is rewired to the promoted weekly path).
#[derive(Debug, Clone, Default)]
struct FileLinks {
    w_link: Option<String>,
    d_link: Option<String>,
}

fn move_file(tp: &dyn Transport, from: &str, to: &str) -> Result<(), FerryError> {
    tp.remove(to)?;
    tp.rename(from, to)?;
    Ok(())
}

/// Candidate paths of one bucket under the configured policy.
fn bucket_candidates(
    entries: &[FileEntry],
    dir: &str,
    bucket: Bucket,
    value: u64,
    retention: &Retention,
    safety: bool,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut files: Vec<&FileEntry> = entries.iter().filter(|e| !e.is_dir).collect();
    files.sort_by_key(|e| e.mtime);

    let doomed: Vec<&FileEntry> = if retention.use_count {
        let keep = value as usize + usize::from(safety);
        if files.len() > keep {
            files[..files.len() - keep].to_vec()
        } else {
            Vec::new()
        }
    } else {
        let cutoff = now - bucket.age(value);
        let newest = files.last().map(|e| e.name.clone());
        files
            .into_iter()
            .filter(|e| e.mtime < cutoff)
            .filter(|e| !(safety && Some(&e.name) == newest.as_ref()))
            .collect()
    };

    doomed
        .into_iter()
        .map(|e| join_remote(&[dir, &e.name]))
        .collect()
}

/// Apply the descending (time-bucketed) retention policy for one OFS.
/// Errors are accumulated; the pass never aborts on the first failure.
pub fn delete_descending(
    tp: &dyn Transport,
    root: &str,
    ofs: &str,
    retention: &Retention,
    safety: bool,
    now: DateTime<Utc>,
) -> MultiError {
    let mut errs = MultiError::new();
    let mut links_of: HashMap<String, FileLinks> = HashMap::new();
    let mut candidates: BTreeSet<String> = BTreeSet::new();

    for bucket in Bucket::DESCENDING {
        let Some(value) = retention.bucket_value(bucket) else {
            continue;
        };
        let dir = join_remote(&[root, ofs, bucket.as_str()]);
        let entries = match tp.read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                errs.push(e);
                continue;
            }
        };

        for entry in entries.iter().filter(|e| e.is_link) {
            let link_path = join_remote(&[&dir, &entry.name]);
            let target = match tp.read_link(&link_path) {
                Ok(t) => t,
                Err(e) => {
                    errs.push(e);
                    continue;
                }
            };
            let resolved = resolve_link(&dir, &target);
            let slot = links_of.entry(resolved).or_default();
            match bucket {
                Bucket::Weekly => slot.w_link = Some(link_path),
                Bucket::Daily => slot.d_link = Some(link_path),
                _ => {}
            }
        }

        candidates.extend(bucket_candidates(
            &entries, &dir, bucket, value, retention, safety, now,
        ));
    }

    let to_delete: BTreeMap<String, FileLinks> = candidates
        .iter()
        .map(|p| (p.clone(), links_of.get(p).cloned().unwrap_or_default()))
        .collect();

    let mut moves: Vec<(String, String)> = Vec::new();
    let mut relinks: Vec<(String, String)> = Vec::new();
    let mut deletes: Vec<String> = Vec::new();

    for (file, links) in &to_delete {
        let live_w = links
            .w_link
            .as_ref()
            .filter(|w| !to_delete.contains_key(*w));
        let live_d = links
            .d_link
            .as_ref()
            .filter(|d| !to_delete.contains_key(*d));

        match (live_w, live_d) {
            (Some(w), d) => {
                moves.push((file.clone(), w.clone()));
                if let Some(d) = d {
                    relinks.push((d.clone(), w.clone()));
                }
            }
            (None, Some(d)) => moves.push((file.clone(), d.clone())),
            (None, None) => deletes.push(file.clone()),
        }
    }

    for (from, to) in moves {
        match move_file(tp, &from, &to) {
            Ok(()) => info!(%from, %to, "promoted old backup into link slot"),
            Err(e) => errs.push(e),
        }
    }

    for (link, target) in relinks {
        let result = (|| -> Result<(), FerryError> {
            tp.remove(&link)?;
            tp.symlink(&relative_to(remote_parent(&link), &target), &link)
        })();
        match result {
            Ok(()) => debug!(%link, %target, "rewired daily symlink"),
            Err(e) => errs.push(e),
        }
    }

    for file in deletes {
        match tp.remove(&file) {
            Ok(()) => info!(%file, "deleted old backup"),
            Err(e) => errs.push(e),
        }
    }

    errs
}

/// Apply incremental retention for one OFS. `full=true` clears stale year
/// directories (year rollover); otherwise months older than the horizon
/// are removed from the applicable year.
pub fn delete_incremental(
    tp: &dyn Transport,
    root: &str,
    ofs: &str,
    months: u32,
    full: bool,
    now: DateTime<Utc>,
) -> MultiError {
    let mut errs = MultiError::new();
    let base = join_remote(&[root, ofs]);

    if full {
        let current = format!("year_{}", now.year());
        let entries = match tp.read_dir(&base) {
            Ok(entries) => entries,
            Err(e) => {
                errs.push(e);
                return errs;
            }
        };
        for entry in entries {
            if entry.name.starts_with("year_") && entry.name != current {
                let dir = join_remote(&[&base, &entry.name]);
                match tp.remove_all(&dir) {
                    Ok(()) => info!(%dir, "removed stale incremental year"),
                    Err(e) => errs.push(e),
                }
            }
        }
        // A subtree holding only stale years ends up absent.
        if let Ok(rest) = tp.read_dir(&base) {
            if rest.is_empty() {
                errs.absorb(tp.remove_all(&base));
            }
        }
        return errs;
    }

    let mut last_month = now.month() as i32 - months as i32;
    let year = if last_month > 0 {
        now.year()
    } else {
        last_month += 12;
        now.year() - 1
    };
    let year_dir = join_remote(&[&base, &format!("year_{year}")]);

    let entries = match tp.read_dir(&year_dir) {
        Ok(entries) => entries,
        Err(e) => {
            errs.push(e);
            return errs;
        }
    };
    for entry in entries {
        let Some(num) = entry
            .name
            .strip_prefix("month_")
            .filter(|rest| rest.len() == 2)
            .and_then(|rest| rest.parse::<i32>().ok())
        else {
            continue;
        };
        if num < last_month {
            let dir = join_remote(&[&year_dir, &entry.name]);
            match tp.remove_all(&dir) {
                Ok(()) => info!(%dir, "removed old incremental month"),
                Err(e) => errs.push(e),
            }
        }
    }

    errs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::local::LocalTransport;
    use chrono::TimeZone;
    use filetime::{set_file_mtime, FileTime};
    use std::fs;
    use std::path::Path;

    fn write_stamped(path: &Path, mtime_secs: i64) {
        fs::write(path, b"backup-bytes").unwrap();
        set_file_mtime(path, FileTime::from_unix_time(mtime_secs, 0)).unwrap();
    }

    fn link_stamped(dir: &Path, name: &str, target: &str, mtime_secs: i64) {
        let link = dir.join(name);
        std::os::unix::fs::symlink(target, &link).unwrap();
        let ft = FileTime::from_unix_time(mtime_secs, 0);
        filetime::set_symlink_file_times(&link, ft, ft).unwrap();
    }

    fn names_in(dir: &Path) -> Vec<String> {
        let mut v: Vec<String> = fs::read_dir(dir)
            .map(|iter| {
                iter.filter_map(|e| e.ok())
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .collect()
            })
            .unwrap_or_default();
        v.sort();
        v
    }

    const T0: i64 = 1_700_000_000;
    const HOUR: i64 = 3600;

    fn now_after(n: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(T0 + n * HOUR, 0).unwrap()
    }

    #[test]
    fn count_mode_removes_oldest() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_string_lossy().into_owned();
        let daily = tmp.path().join("o/daily");
        fs::create_dir_all(&daily).unwrap();
        for (i, name) in ["a.tar", "b.tar", "c.tar", "d.tar"].iter().enumerate() {
            write_stamped(&daily.join(name), T0 + i as i64 * HOUR);
        }

        let retention = Retention {
            daily: Some(2),
            ..Default::default()
        };
        let errs = delete_descending(
            &LocalTransport::new(),
            &root,
            "o",
            &retention,
            false,
            now_after(4),
        );
        assert!(errs.is_empty(), "{errs}");
        assert_eq!(names_in(&daily), vec!["c.tar", "d.tar"]);
    }

    #[test]
    fn safety_backup_keeps_one_extra() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_string_lossy().into_owned();
        let daily = tmp.path().join("o/daily");
        fs::create_dir_all(&daily).unwrap();
        for (i, name) in ["a.tar", "b.tar", "c.tar", "d.tar"].iter().enumerate() {
            write_stamped(&daily.join(name), T0 + i as i64 * HOUR);
        }

        let retention = Retention {
            daily: Some(2),
            ..Default::default()
        };
        let errs = delete_descending(
            &LocalTransport::new(),
            &root,
            "o",
            &retention,
            true,
            now_after(4),
        );
        assert!(errs.is_empty(), "{errs}");
        assert_eq!(names_in(&daily), vec!["b.tar", "c.tar", "d.tar"]);
    }

    #[test]
    fn age_mode_drops_expired_keeps_newest_with_safety() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_string_lossy().into_owned();
        let hourly = tmp.path().join("o/hourly");
        fs::create_dir_all(&hourly).unwrap();
        // All three older than the 2-hour horizon.
        write_stamped(&hourly.join("a.tar"), T0);
        write_stamped(&hourly.join("b.tar"), T0 + HOUR);
        write_stamped(&hourly.join("c.tar"), T0 + 2 * HOUR);

        let retention = Retention {
            use_count: false,
            hourly: Some(2),
            ..Default::default()
        };
        let errs = delete_descending(
            &LocalTransport::new(),
            &root,
            "o",
            &retention,
            true,
            now_after(10),
        );
        assert!(errs.is_empty(), "{errs}");
        // Safety spares exactly the newest expired entry.
        assert_eq!(names_in(&hourly), vec!["c.tar"]);
    }

    /// Count-based descending rotation with symlink promotion: an old
    /// monthly target of a surviving weekly link is moved into the link's
    /// slot instead of deleted.
    #[test]
    fn promotion_moves_monthly_into_surviving_weekly_slot() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_string_lossy().into_owned();
        let monthly = tmp.path().join("o/monthly");
        let weekly = tmp.path().join("o/weekly");
        fs::create_dir_all(&monthly).unwrap();
        fs::create_dir_all(&weekly).unwrap();

        write_stamped(&monthly.join("m3.tar"), T0);
        write_stamped(&monthly.join("m2.tar"), T0 + HOUR);
        write_stamped(&monthly.join("m1.tar"), T0 + 2 * HOUR);
        write_stamped(&monthly.join("m0.tar"), T0 + 3 * HOUR);

        link_stamped(&weekly, "w3.tar", "../monthly/m3.tar", T0);
        link_stamped(&weekly, "w1.tar", "../monthly/m2.tar", T0 + HOUR);
        link_stamped(&weekly, "w2.tar", "../monthly/m1.tar", T0 + 2 * HOUR);
        link_stamped(&weekly, "wnew.tar", "../monthly/m0.tar", T0 + 3 * HOUR);

        let retention = Retention {
            weekly: Some(3),
            monthly: Some(2),
            ..Default::default()
        };
        let errs = delete_descending(
            &LocalTransport::new(),
            &root,
            "o",
            &retention,
            false,
            now_after(4),
        );
        assert!(errs.is_empty(), "{errs}");

        assert_eq!(names_in(&monthly), vec!["m0.tar", "m1.tar"]);
        assert_eq!(names_in(&weekly), vec!["w1.tar", "w2.tar", "wnew.tar"]);

        // w1 was promoted into a regular file holding m2's bytes.
        let w1 = weekly.join("w1.tar");
        assert!(!fs::symlink_metadata(&w1).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&w1).unwrap(), b"backup-bytes");
        // Surviving links still resolve.
        for name in ["w2.tar", "wnew.tar"] {
            let target = fs::read_link(weekly.join(name)).unwrap();
            assert!(weekly.join(&target).canonicalize().unwrap().exists());
        }
    }

    /// Weekly wins over daily: the daily link is rewritten to point at the
    /// promoted weekly location.
    #[test]
    fn weekly_wins_daily_link_is_rewired() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_string_lossy().into_owned();
        let monthly = tmp.path().join("o/monthly");
        let weekly = tmp.path().join("o/weekly");
        let daily = tmp.path().join("o/daily");
        fs::create_dir_all(&monthly).unwrap();
        fs::create_dir_all(&weekly).unwrap();
        fs::create_dir_all(&daily).unwrap();

        write_stamped(&monthly.join("old.tar"), T0);
        write_stamped(&monthly.join("new.tar"), T0 + HOUR);
        link_stamped(&weekly, "w.tar", "../monthly/old.tar", T0);
        link_stamped(&daily, "d.tar", "../monthly/old.tar", T0);

        let retention = Retention {
            monthly: Some(1),
            weekly: Some(5),
            daily: Some(5),
            ..Default::default()
        };
        let errs = delete_descending(
            &LocalTransport::new(),
            &root,
            "o",
            &retention,
            false,
            now_after(2),
        );
        assert!(errs.is_empty(), "{errs}");

        assert_eq!(names_in(&monthly), vec!["new.tar"]);
        // Promoted to the weekly slot, not the daily one.
        let w = weekly.join("w.tar");
        assert!(!fs::symlink_metadata(&w).unwrap().file_type().is_symlink());
        // Daily link rewired to the weekly location.
        let d = daily.join("d.tar");
        assert!(fs::symlink_metadata(&d).unwrap().file_type().is_symlink());
        assert_eq!(
            fs::read_link(&d).unwrap().to_string_lossy(),
            "../weekly/w.tar"
        );
    }

    #[test]
    fn daily_only_link_receives_the_move() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_string_lossy().into_owned();
        let monthly = tmp.path().join("o/monthly");
        let daily = tmp.path().join("o/daily");
        fs::create_dir_all(&monthly).unwrap();
        fs::create_dir_all(&daily).unwrap();

        write_stamped(&monthly.join("old.tar"), T0);
        write_stamped(&monthly.join("new.tar"), T0 + HOUR);
        link_stamped(&daily, "d.tar", "../monthly/old.tar", T0);

        let retention = Retention {
            monthly: Some(1),
            daily: Some(5),
            ..Default::default()
        };
        let errs = delete_descending(
            &LocalTransport::new(),
            &root,
            "o",
            &retention,
            false,
            now_after(2),
        );
        assert!(errs.is_empty(), "{errs}");

        let d = daily.join("d.tar");
        assert!(!fs::symlink_metadata(&d).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&d).unwrap(), b"backup-bytes");
    }

    /// Rotation only ever shrinks the file set (no new names appear).
    #[test]
    fn rotation_never_creates_new_names() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_string_lossy().into_owned();
        let daily = tmp.path().join("o/daily");
        fs::create_dir_all(&daily).unwrap();
        for (i, name) in ["a.tar", "b.tar"].iter().enumerate() {
            write_stamped(&daily.join(name), T0 + i as i64 * HOUR);
        }
        let before = names_in(&daily);

        let retention = Retention {
            daily: Some(1),
            ..Default::default()
        };
        let errs = delete_descending(
            &LocalTransport::new(),
            &root,
            "o",
            &retention,
            false,
            now_after(2),
        );
        assert!(errs.is_empty(), "{errs}");
        let after = names_in(&daily);
        assert!(after.iter().all(|n| before.contains(n)));
        assert_eq!(after.len(), 1);
    }

    #[test]
    fn incremental_prunes_months_beyond_horizon() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_string_lossy().into_owned();
        let year = tmp.path().join("o/year_2024");
        for m in ["month_01", "month_03", "month_06", "month_09"] {
            fs::create_dir_all(year.join(m)).unwrap();
            fs::write(year.join(m).join("x.tar"), b"x").unwrap();
        }

        // September with a 4-month horizon: months before May go.
        let now = Utc.with_ymd_and_hms(2024, 9, 15, 0, 0, 0).unwrap();
        let errs = delete_incremental(&LocalTransport::new(), &root, "o", 4, false, now);
        assert!(errs.is_empty(), "{errs}");
        assert_eq!(names_in(&year), vec!["month_06", "month_09"]);
    }

    #[test]
    fn incremental_horizon_wraps_into_previous_year() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_string_lossy().into_owned();
        let prev = tmp.path().join("o/year_2023");
        for m in ["month_05", "month_10", "month_12"] {
            fs::create_dir_all(prev.join(m)).unwrap();
        }

        // February 2024 with a 6-month horizon: operate on 2023, cutoff
        // month 8.
        let now = Utc.with_ymd_and_hms(2024, 2, 10, 0, 0, 0).unwrap();
        let errs = delete_incremental(&LocalTransport::new(), &root, "o", 6, false, now);
        assert!(errs.is_empty(), "{errs}");
        assert_eq!(names_in(&prev), vec!["month_10", "month_12"]);
    }

    #[test]
    fn incremental_full_clears_stale_years() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_string_lossy().into_owned();
        let ofs_dir = tmp.path().join("o");
        fs::create_dir_all(ofs_dir.join("year_2024/month_12/day_31")).unwrap();
        fs::write(
            ofs_dir.join("year_2024/month_12/day_31/day_31.tar.gz"),
            b"x",
        )
        .unwrap();

        let now = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let errs = delete_incremental(&LocalTransport::new(), &root, "o", 12, true, now);
        assert!(errs.is_empty(), "{errs}");
        // Only stale years existed, so the OFS subtree is gone entirely.
        assert!(!ofs_dir.exists());
    }

    #[test]
    fn incremental_full_spares_current_year() {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().to_string_lossy().into_owned();
        let ofs_dir = tmp.path().join("o");
        fs::create_dir_all(ofs_dir.join("year_2024/month_12")).unwrap();
        fs::create_dir_all(ofs_dir.join("year_2025/month_01/day_01")).unwrap();
        fs::write(
            ofs_dir.join("year_2025/month_01/day_01/init.tar.gz"),
            b"base",
        )
        .unwrap();

        let now = Utc.with_ymd_and_hms(2025, 1, 1, 6, 0, 0).unwrap();
        let errs = delete_incremental(&LocalTransport::new(), &root, "o", 12, true, now);
        assert!(errs.is_empty(), "{errs}");
        assert!(!ofs_dir.join("year_2024").exists());
        assert!(ofs_dir.join("year_2025/month_01/day_01/init.tar.gz").exists());
    }
}
