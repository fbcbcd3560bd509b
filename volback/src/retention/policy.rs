//! Tiered retention: decide which backups survive a pruning pass.
//!
//! Tiers are evaluated from the finest to the coarsest granularity. Each tier
//! walks the backups newest first and keeps the first backup of every period
//! it has not seen yet, up to its configured count. A backup claimed by a finer
//! tier is never reconsidered, so one archive fills at most one slot.

use crate::catalog::Backup;
use chrono::{DateTime, Datelike, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use tracing::debug;

/// Per-tier retained counts. Zero disables a tier.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    #[serde(default)]
    pub keep_daily: usize,
    #[serde(default)]
    pub keep_weekly: usize,
    #[serde(default)]
    pub keep_monthly: usize,
    #[serde(default)]
    pub keep_yearly: usize,
}

impl RetentionPolicy {
    /// True when any tier retains at least one backup.
    pub fn is_enabled(&self) -> bool {
        self.max_retained() > 0
    }

    /// Upper bound on the size of any keep-set this policy produces.
    pub fn max_retained(&self) -> usize {
        self.keep_daily + self.keep_weekly + self.keep_monthly + self.keep_yearly
    }

    fn count(&self, tier: Tier) -> usize {
        match tier {
            Tier::Daily => self.keep_daily,
            Tier::Weekly => self.keep_weekly,
            Tier::Monthly => self.keep_monthly,
            Tier::Yearly => self.keep_yearly,
        }
    }
}

/// Retention granularity, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::Daily, Tier::Weekly, Tier::Monthly, Tier::Yearly];

    fn period_key(self, timestamp: &DateTime<Local>) -> PeriodKey {
        match self {
            Tier::Daily => PeriodKey::Day(timestamp.date_naive()),
            Tier::Weekly => {
                let week = timestamp.iso_week();
                PeriodKey::Week(week.year(), week.week())
            }
            Tier::Monthly => PeriodKey::Month(timestamp.year(), timestamp.month()),
            Tier::Yearly => PeriodKey::Year(timestamp.year()),
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tier::Daily => "daily",
            Tier::Weekly => "weekly",
            Tier::Monthly => "monthly",
            Tier::Yearly => "yearly",
        };
        f.write_str(name)
    }
}

/// Label used to detect "already have one from this period".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PeriodKey {
    Day(NaiveDate),
    /// ISO week-numbering year and week
    Week(i32, u32),
    Month(i32, u32),
    Year(i32),
}

/// Backups a retention pass decided to preserve, keyed by remote path.
#[derive(Debug, Clone, Default)]
pub struct KeepSet {
    kept: HashMap<String, Tier>,
}

impl KeepSet {
    pub fn contains(&self, remote_path: &str) -> bool {
        self.kept.contains_key(remote_path)
    }

    /// The tier that claimed a backup, if any.
    pub fn tier_of(&self, remote_path: &str) -> Option<Tier> {
        self.kept.get(remote_path).copied()
    }

    pub fn len(&self) -> usize {
        self.kept.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kept.is_empty()
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.kept.keys().map(String::as_str)
    }
}

/// Sort newest first. The sort is stable so equal timestamps keep input order.
pub fn sort_newest_first(backups: &mut [Backup]) {
    backups.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
}

/// Compute the keep-set for `backups` under `policy`. Pure; no I/O.
///
/// `backups` may be in any order; it is sorted internally.
pub fn compute_keep_set(backups: &[Backup], policy: &RetentionPolicy) -> KeepSet {
    let mut sorted: Vec<&Backup> = backups.iter().collect();
    sorted.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let mut keep = KeepSet::default();

    for tier in Tier::ALL {
        let budget = policy.count(tier);
        if budget == 0 {
            continue;
        }

        let mut seen_periods = HashSet::new();
        let mut selected = 0usize;

        for backup in &sorted {
            if selected >= budget {
                break;
            }
            if keep.contains(&backup.remote_path) {
                continue;
            }
            if seen_periods.insert(tier.period_key(&backup.timestamp)) {
                debug!("Keeping {} backup: {}", tier, backup.remote_path);
                keep.kept.insert(backup.remote_path.clone(), tier);
                selected += 1;
            }
        }
    }

    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::parse_backup_timestamp;

    fn backup(name: &str) -> Backup {
        Backup {
            remote_path: format!("/backups/app/{}.7z", name),
            timestamp: parse_backup_timestamp(name).unwrap(),
        }
    }

    fn policy(daily: usize, weekly: usize, monthly: usize, yearly: usize) -> RetentionPolicy {
        RetentionPolicy {
            keep_daily: daily,
            keep_weekly: weekly,
            keep_monthly: monthly,
            keep_yearly: yearly,
        }
    }

    fn short_name(path: &str) -> String {
        let name = path.trim_start_matches("/backups/app/");
        name.trim_end_matches(".7z").to_string()
    }

    fn kept_names(keep: &KeepSet) -> Vec<String> {
        let mut names: Vec<String> = keep.paths().map(short_name).collect();
        names.sort();
        names
    }

    fn tier(keep: &KeepSet, name: &str) -> Option<Tier> {
        keep.tier_of(&format!("/backups/app/{}.7z", name))
    }

    #[test]
    fn test_daily_keeps_newest_day_first() {
        let backups = vec![
            backup("20240101.000000"),
            backup("20240101.120000"),
            backup("20240102.000000"),
        ];

        let keep = compute_keep_set(&backups, &policy(1, 0, 0, 0));
        assert_eq!(kept_names(&keep), vec!["20240102.000000"]);

        let keep = compute_keep_set(&backups, &policy(2, 0, 0, 0));
        assert_eq!(
            kept_names(&keep),
            vec!["20240101.120000", "20240102.000000"]
        );
    }

    #[test]
    fn test_all_tiers_zero_keeps_nothing() {
        let backups: Vec<Backup> = (1..=5)
            .map(|d| backup(&format!("2024010{}.000000", d)))
            .collect();
        let keep = compute_keep_set(&backups, &policy(0, 0, 0, 0));
        assert!(keep.is_empty());
    }

    #[test]
    fn test_empty_input_keeps_nothing() {
        let keep = compute_keep_set(&[], &policy(3, 3, 3, 3));
        assert!(keep.is_empty());
    }

    #[test]
    fn test_coarser_tier_skips_backups_claimed_by_finer_tier() {
        // 2024-01-01 is a Monday, so all three fall in ISO week 1 of 2024
        let backups = vec![
            backup("20240103.080000"),
            backup("20240102.080000"),
            backup("20240101.080000"),
        ];

        let keep = compute_keep_set(&backups, &policy(1, 1, 0, 0));
        assert_eq!(tier(&keep, "20240103.080000"), Some(Tier::Daily));
        // Weekly pass cannot reuse the daily pick and takes the next one in the same week
        assert_eq!(tier(&keep, "20240102.080000"), Some(Tier::Weekly));
        assert_eq!(keep.len(), 2);
    }

    #[test]
    fn test_weekly_uses_iso_week_year() {
        // 2024-12-30 belongs to ISO week 1 of 2025, same as 2025-01-02
        let backups = vec![backup("20250102.000000"), backup("20241230.000000")];
        let keep = compute_keep_set(&backups, &policy(0, 2, 0, 0));
        assert_eq!(kept_names(&keep), vec!["20250102.000000"]);
    }

    #[test]
    fn test_monthly_and_yearly_tiers() {
        let backups = vec![
            backup("20240315.000000"),
            backup("20240310.000000"),
            backup("20240220.000000"),
            backup("20231120.000000"),
            backup("20221120.000000"),
        ];

        let keep = compute_keep_set(&backups, &policy(0, 0, 2, 2));
        assert_eq!(tier(&keep, "20240315.000000"), Some(Tier::Monthly));
        assert_eq!(tier(&keep, "20240220.000000"), Some(Tier::Monthly));
        // Yearly: 2024 is unseen in the yearly pass, but its backups are taken,
        // so the next unclaimed 2024 backup fills the slot
        assert_eq!(tier(&keep, "20240310.000000"), Some(Tier::Yearly));
        assert_eq!(tier(&keep, "20231120.000000"), Some(Tier::Yearly));
        assert_eq!(keep.len(), 4);
    }

    #[test]
    fn test_keep_set_is_bounded_and_never_double_counts() {
        let mut backups = Vec::new();
        for month in 1..=12u32 {
            for day in [1u32, 8, 15, 22] {
                backups.push(backup(&format!("2023{:02}{:02}.030000", month, day)));
            }
        }

        let policies = [
            policy(0, 0, 0, 1),
            policy(7, 4, 12, 3),
            policy(100, 100, 100, 100),
            policy(2, 0, 5, 0),
        ];
        for p in policies {
            let keep = compute_keep_set(&backups, &p);
            assert!(keep.len() <= p.max_retained());

            let mut per_tier: HashMap<Tier, usize> = HashMap::new();
            for path in keep.paths() {
                *per_tier.entry(keep.tier_of(path).unwrap()).or_default() += 1;
            }
            for tier in Tier::ALL {
                assert!(per_tier.get(&tier).copied().unwrap_or(0) <= p.count(tier));
            }
        }

        // 48 backups can never be retained more than once each
        let keep = compute_keep_set(&backups, &policy(100, 100, 100, 100));
        assert_eq!(keep.len(), 48);
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let mut backups = vec![
            backup("20240110.000000"),
            backup("20240101.000000"),
            backup("20240105.000000"),
            backup("20240120.000000"),
        ];
        let p = policy(2, 1, 1, 0);
        let first = kept_names(&compute_keep_set(&backups, &p));
        backups.reverse();
        assert_eq!(first, kept_names(&compute_keep_set(&backups, &p)));
    }

    #[test]
    fn test_sort_newest_first_is_stable_for_ties() {
        let mut backups = vec![
            Backup {
                remote_path: "/a/first".to_string(),
                timestamp: parse_backup_timestamp("20240101.000000").unwrap(),
            },
            Backup {
                remote_path: "/a/second".to_string(),
                timestamp: parse_backup_timestamp("20240101.000000").unwrap(),
            },
            backup("20240102.000000"),
        ];
        sort_newest_first(&mut backups);
        assert_eq!(backups[0].remote_path, "/backups/app/20240102.000000.7z");
        assert_eq!(backups[1].remote_path, "/a/first");
        assert_eq!(backups[2].remote_path, "/a/second");
    }
}
