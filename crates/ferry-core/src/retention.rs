use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Retention generation, from finest to coarsest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bucket {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Bucket {
    /// Processing order for rotation: coarsest generation first, so that
    /// weekly symlinks are discovered after their monthly targets.
    pub const DESCENDING: [Bucket; 5] = [
        Bucket::Yearly,
        Bucket::Monthly,
        Bucket::Weekly,
        Bucket::Daily,
        Bucket::Hourly,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Bucket::Hourly => "hourly",
            Bucket::Daily => "daily",
            Bucket::Weekly => "weekly",
            Bucket::Monthly => "monthly",
            Bucket::Yearly => "yearly",
        }
    }

    /// Age-mode cutoff for keeping `n` units of this generation.
    pub fn age(self, n: u64) -> Duration {
        let n = n as i64;
        match self {
            Bucket::Hourly => Duration::hours(n),
            Bucket::Daily => Duration::days(n),
            Bucket::Weekly => Duration::weeks(n),
            Bucket::Monthly => Duration::days(n * 30),
            Bucket::Yearly => Duration::days(n * 365),
        }
    }
}

/// Per-storage retention policy. Each bucket is unused (`None` or 0) or
/// holds a value interpreted as a keep-count (`use_count=true`) or as a
/// maximum age in units of the bucket (`use_count=false`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Retention {
    #[serde(default = "default_use_count")]
    pub use_count: bool,
    #[serde(default)]
    pub hourly: Option<u64>,
    #[serde(default)]
    pub daily: Option<u64>,
    #[serde(default)]
    pub weekly: Option<u64>,
    #[serde(default)]
    pub monthly: Option<u64>,
    #[serde(default)]
    pub yearly: Option<u64>,
    /// Month horizon for the incremental year/month/day scheme.
    #[serde(default = "default_months")]
    pub months: u32,
}

fn default_use_count() -> bool {
    true
}

fn default_months() -> u32 {
    12
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            use_count: true,
            hourly: None,
            daily: None,
            weekly: None,
            monthly: None,
            yearly: None,
            months: default_months(),
        }
    }
}

impl Retention {
    pub fn bucket_value(&self, bucket: Bucket) -> Option<u64> {
        let v = match bucket {
            Bucket::Hourly => self.hourly,
            Bucket::Daily => self.daily,
            Bucket::Weekly => self.weekly,
            Bucket::Monthly => self.monthly,
            Bucket::Yearly => self.yearly,
        };
        v.filter(|&n| n > 0)
    }

    pub fn enabled(&self, bucket: Bucket) -> bool {
        self.bucket_value(bucket).is_some()
    }

    pub fn has_any_bucket(&self) -> bool {
        Bucket::DESCENDING.iter().any(|&b| self.enabled(b))
    }
}
