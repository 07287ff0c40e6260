//! Canonical backup names and destination paths.
//!
//! Remote paths are `/`-separated strings relative to a storage's backup
//! root; the resolvers here are pure so they can be tested without any
//! storage session.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Datelike, Utc, Weekday};

use crate::retention::{Bucket, Retention};

/// Minute-resolution stamp embedded in every artifact basename.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d_%H-%M";

/// Stable identifier for one target within a job: the first path component
/// below the storage root. File-tree targets use their absolute path with
/// separators escaped so the whole identifier stays one component.
pub fn ofs_from_path(path: &Path) -> String {
    path.to_string_lossy()
        .trim_matches('/')
        .replace('/', "___")
}

/// Last component of an OFS (`src/db` → `db`), used as the artifact stem.
pub fn ofs_basename(ofs: &str) -> &str {
    ofs.rsplit('/').next().unwrap_or(ofs)
}

pub fn timestamp(now: DateTime<Utc>) -> String {
    now.format(TIMESTAMP_FORMAT).to_string()
}

/// `<tmp_dir>/<ofs>/<stem>_<stamp>.<ext>[.gz]`
pub fn tmp_artifact_path(
    tmp_dir: &Path,
    ofs: &str,
    ext: &str,
    gzip: bool,
    now: DateTime<Utc>,
) -> PathBuf {
    let mut name = format!("{}_{}.{}", ofs_basename(ofs), timestamp(now), ext);
    if gzip {
        name.push_str(".gz");
    }
    tmp_dir.join(ofs).join(name)
}

/// Join `/`-separated remote path segments, skipping empty ones.
pub fn join_remote(parts: &[&str]) -> String {
    let mut out = String::new();
    for part in parts {
        let trimmed = part.trim_matches('/');
        if trimmed.is_empty() {
            continue;
        }
        if !out.is_empty() || part.starts_with('/') {
            out.push('/');
        }
        out.push_str(trimmed);
    }
    if out.is_empty() && parts.iter().any(|p| p.starts_with('/')) {
        out.push('/');
    }
    out
}

/// Parent directory of a remote path (`a/b/c` → `a/b`).
pub fn remote_parent(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => "",
    }
}

/// Relative path from `from_dir` to `target` (both `/`-separated).
pub fn relative_to(from_dir: &str, target: &str) -> String {
    let from: Vec<&str> = from_dir.split('/').filter(|s| !s.is_empty()).collect();
    let to: Vec<&str> = target.split('/').filter(|s| !s.is_empty()).collect();

    let common = from
        .iter()
        .zip(to.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut parts: Vec<&str> = Vec::new();
    for _ in common..from.len() {
        parts.push("..");
    }
    parts.extend(&to[common..]);
    if parts.is_empty() {
        ".".into()
    } else {
        parts.join("/")
    }
}

/// Resolve a link target (possibly `../`-relative) against the link's
/// directory into an absolute remote path.
pub fn resolve_link(link_dir: &str, target: &str) -> String {
    if target.starts_with('/') && link_dir.starts_with('/') {
        return target.to_string();
    }
    let mut stack: Vec<&str> = link_dir.split('/').filter(|s| !s.is_empty()).collect();
    for part in target.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            other => stack.push(other),
        }
    }
    let joined = stack.join("/");
    if link_dir.starts_with('/') {
        format!("/{joined}")
    } else {
        joined
    }
}

/// Where one artifact lands on a storage: the canonical destination, the
/// incremental metadata sidecar next to it (if any), and the map of
/// symlinks to create (`link path` → `relative target`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryPlan {
    pub dst: String,
    pub metadata_dst: Option<String>,
    pub links: BTreeMap<String, String>,
}

fn bucket_applies(bucket: Bucket, now: DateTime<Utc>) -> bool {
    match bucket {
        Bucket::Yearly => now.ordinal() == 1,
        Bucket::Monthly => now.day() == 1,
        Bucket::Weekly => now.weekday() == Weekday::Sun,
        // Daily is the floor for full copies; hourly only ever links.
        Bucket::Daily | Bucket::Hourly => true,
    }
}

/// Plan a time-bucketed delivery: the artifact is written once to its
/// highest applicable configured bucket and linked from every lower one.
pub fn descending_plan(
    artifact_name: &str,
    ofs: &str,
    root: &str,
    retention: &Retention,
    now: DateTime<Utc>,
) -> DeliveryPlan {
    let mut chain = Bucket::DESCENDING
        .iter()
        .copied()
        .filter(|&b| retention.enabled(b) && bucket_applies(b, now));

    let canonical = chain.next().unwrap_or(Bucket::Daily);
    let dst_dir = join_remote(&[root, ofs, canonical.as_str()]);
    let dst = join_remote(&[&dst_dir, artifact_name]);

    let mut links = BTreeMap::new();
    for bucket in chain {
        let link_dir = join_remote(&[root, ofs, bucket.as_str()]);
        let link = join_remote(&[&link_dir, artifact_name]);
        links.insert(link, relative_to(&link_dir, &dst));
    }

    DeliveryPlan {
        dst,
        metadata_dst: None,
        links,
    }
}

/// Plan an incremental delivery into `year_YYYY/month_MM/day_DD/`. The
/// first artifact of a year is the `init` base; later ones are deltas named
/// by ISO week (Mondays) or day of month.
pub fn incremental_plan(
    ofs: &str,
    root: &str,
    gzip: bool,
    year_base: bool,
    now: DateTime<Utc>,
) -> DeliveryPlan {
    let stem = if year_base {
        "init".to_string()
    } else if now.weekday() == Weekday::Mon {
        format!("week_{:02}", now.iso_week().week())
    } else {
        format!("day_{:02}", now.day())
    };
    let mut name = format!("{stem}.tar");
    if gzip {
        name.push_str(".gz");
    }

    let dir = join_remote(&[
        root,
        ofs,
        &format!("year_{}", now.year()),
        &format!("month_{:02}", now.month()),
        &format!("day_{:02}", now.day()),
    ]);
    let dst = join_remote(&[&dir, &name]);
    let metadata_dst = Some(format!("{dst}.inc"));

    DeliveryPlan {
        dst,
        metadata_dst,
        links: BTreeMap::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn retention_all() -> Retention {
        Retention {
            hourly: Some(12),
            daily: Some(7),
            weekly: Some(4),
            monthly: Some(6),
            yearly: Some(1),
            ..Default::default()
        }
    }

    #[test]
    fn ofs_escapes_file_paths() {
        assert_eq!(ofs_from_path(Path::new("/var/www/html")), "var___www___html");
        assert_eq!(ofs_from_path(Path::new("/etc")), "etc");
    }

    #[test]
    fn ofs_basename_splits_db_targets() {
        assert_eq!(ofs_basename("prod/users"), "users");
        assert_eq!(ofs_basename("standalone"), "standalone");
    }

    #[test]
    fn tmp_path_carries_stamp_and_gz() {
        let now = Utc.with_ymd_and_hms(2024, 7, 3, 14, 5, 0).unwrap();
        let p = tmp_artifact_path(Path::new("/tmp/ferry"), "prod/users", "tar", true, now);
        assert_eq!(
            p,
            PathBuf::from("/tmp/ferry/prod/users/users_2024-07-03_14-05.tar.gz")
        );
    }

    #[test]
    fn relative_within_ofs_subtree() {
        assert_eq!(
            relative_to("/b/ofs/weekly", "/b/ofs/monthly/x.tar"),
            "../monthly/x.tar"
        );
        assert_eq!(relative_to("a/b", "a/b/c"), "c");
    }

    #[test]
    fn resolve_link_round_trips_relative() {
        let resolved = resolve_link("/b/ofs/weekly", "../monthly/x.tar");
        assert_eq!(resolved, "/b/ofs/monthly/x.tar");
    }

    #[test]
    fn plain_day_lands_in_daily_with_hourly_link() {
        // 2024-07-03 is a Wednesday.
        let now = Utc.with_ymd_and_hms(2024, 7, 3, 1, 0, 0).unwrap();
        let plan = descending_plan("a_2024-07-03_01-00.tar", "o", "/b", &retention_all(), now);
        assert_eq!(plan.dst, "/b/o/daily/a_2024-07-03_01-00.tar");
        assert_eq!(plan.links.len(), 1);
        assert_eq!(
            plan.links.get("/b/o/hourly/a_2024-07-03_01-00.tar").unwrap(),
            "../daily/a_2024-07-03_01-00.tar"
        );
    }

    #[test]
    fn first_of_month_sunday_is_monthly_with_lower_links() {
        // 2024-12-01 is a Sunday and the first of the month.
        let now = Utc.with_ymd_and_hms(2024, 12, 1, 0, 0, 0).unwrap();
        let plan = descending_plan("a.tar", "o", "/b", &retention_all(), now);
        assert_eq!(plan.dst, "/b/o/monthly/a.tar");
        assert_eq!(
            plan.links.get("/b/o/weekly/a.tar").unwrap(),
            "../monthly/a.tar"
        );
        assert_eq!(
            plan.links.get("/b/o/daily/a.tar").unwrap(),
            "../monthly/a.tar"
        );
        assert_eq!(
            plan.links.get("/b/o/hourly/a.tar").unwrap(),
            "../monthly/a.tar"
        );
    }

    #[test]
    fn disabled_buckets_are_skipped() {
        let retention = Retention {
            daily: Some(7),
            weekly: Some(4),
            ..Default::default()
        };
        // A Sunday: weekly is canonical, only daily links.
        let now = Utc.with_ymd_and_hms(2024, 7, 7, 0, 0, 0).unwrap();
        let plan = descending_plan("a.tar", "o", "/b", &retention, now);
        assert_eq!(plan.dst, "/b/o/weekly/a.tar");
        assert_eq!(plan.links.len(), 1);
        assert!(plan.links.contains_key("/b/o/daily/a.tar"));
    }

    #[test]
    fn incremental_base_is_init_with_sidecar() {
        let now = Utc.with_ymd_and_hms(2025, 1, 1, 3, 0, 0).unwrap();
        let plan = incremental_plan("o", "/b", true, true, now);
        assert_eq!(plan.dst, "/b/o/year_2025/month_01/day_01/init.tar.gz");
        assert_eq!(
            plan.metadata_dst.as_deref(),
            Some("/b/o/year_2025/month_01/day_01/init.tar.gz.inc")
        );
        assert!(plan.links.is_empty());
    }

    #[test]
    fn incremental_delta_named_by_week_or_day() {
        // 2025-03-10 is a Monday.
        let monday = Utc.with_ymd_and_hms(2025, 3, 10, 3, 0, 0).unwrap();
        let plan = incremental_plan("o", "/b", false, false, monday);
        assert_eq!(plan.dst, "/b/o/year_2025/month_03/day_10/week_11.tar");

        let tuesday = Utc.with_ymd_and_hms(2025, 3, 11, 3, 0, 0).unwrap();
        let plan = incremental_plan("o", "/b", false, false, tuesday);
        assert_eq!(plan.dst, "/b/o/year_2025/month_03/day_11/day_11.tar");
    }
}
