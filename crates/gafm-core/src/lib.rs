//! Core domain model for GAFM: account staleness classification and manager aggregation.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "gafm-core";

/// Bucket used for accounts that carry no `GT` manager.
pub const UNASSIGNED_MANAGER: &str = "N/A";

pub const TIMESTAMP_PLACEHOLDER: &str = "--/--/---- --:--";

/// Days scale used by the manager leaderboard bar.
pub const MANAGER_BAR_SCALE_DAYS: f64 = 15.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Warning,
    Critical,
    Inactive,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Warning => "warning",
            Status::Critical => "critical",
            Status::Inactive => "inactive",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Staleness thresholds, lower bound inclusive: 0-2 ok, 3-7 warning, 8-15 critical.
pub fn classify(days_since_update: u64) -> Status {
    match days_since_update {
        0..=2 => Status::Ok,
        3..=7 => Status::Warning,
        8..=15 => Status::Critical,
        _ => Status::Inactive,
    }
}

/// Upstream account with its original fields kept verbatim plus the derived status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRecord {
    #[serde(flatten)]
    pub fields: Map<String, Value>,
    pub status: Status,
}

impl AccountRecord {
    /// Builds a record from raw upstream fields. Any upstream `status` key is
    /// replaced by the classified one.
    pub fn from_fields(mut fields: Map<String, Value>) -> Self {
        fields.remove("status");
        let status = classify(days_from_value(fields.get("days_since_update")));
        Self { fields, status }
    }

    pub fn days_since_update(&self) -> u64 {
        days_from_value(self.fields.get("days_since_update"))
    }

    fn days_for_average(&self) -> f64 {
        self.fields
            .get("days_since_update")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
    }

    /// Assigned manager, if any. Numeric managers render as their JSON text.
    pub fn manager(&self) -> Option<String> {
        match self.fields.get("GT") {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) if n.as_f64() != Some(0.0) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Grouping key for the leaderboard.
    pub fn manager_key(&self) -> String {
        self.manager().unwrap_or_else(|| UNASSIGNED_MANAGER.to_string())
    }

    pub fn display_name(&self) -> &str {
        ["name", "account_name"]
            .iter()
            .filter_map(|key| self.fields.get(*key).and_then(Value::as_str))
            .find(|s| !s.is_empty())
            .unwrap_or("Sem nome")
    }
}

/// Integer days used for classification. Fractions round up so that `2.5`
/// lands in the same bucket as a `<= 2` test on the raw value would put it.
fn days_from_value(value: Option<&Value>) -> u64 {
    match value {
        Some(Value::Number(n)) => n.as_u64().unwrap_or_else(|| {
            n.as_f64()
                .filter(|f| *f > 0.0)
                .map(|f| f.ceil() as u64)
                .unwrap_or(0)
        }),
        _ => 0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerSummary {
    pub name: String,
    pub avg: f64,
    pub total: usize,
}

impl ManagerSummary {
    /// Leaderboard colour band for the average cycle. Never `inactive`.
    pub fn band(&self) -> Status {
        if self.avg <= 2.0 {
            Status::Ok
        } else if self.avg <= 7.0 {
            Status::Warning
        } else {
            Status::Critical
        }
    }

    pub fn bar_width_percent(&self) -> f64 {
        round_one_decimal((self.avg / MANAGER_BAR_SCALE_DAYS * 100.0).min(100.0))
    }
}

/// Groups accounts by exact manager key and sorts by average days, best first.
/// Equal averages keep the order in which their managers first appeared.
pub fn aggregate_by_manager(accounts: &[AccountRecord]) -> Vec<ManagerSummary> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, f64, usize)> = Vec::new();

    for account in accounts {
        let key = account.manager_key();
        let slot = match index.get(&key) {
            Some(slot) => *slot,
            None => {
                index.insert(key.clone(), groups.len());
                groups.push((key, 0.0, 0));
                groups.len() - 1
            }
        };
        groups[slot].1 += account.days_for_average();
        groups[slot].2 += 1;
    }

    let mut managers = groups
        .into_iter()
        .map(|(name, total_days, count)| ManagerSummary {
            name,
            avg: if count > 0 {
                round_one_decimal(total_days / count as f64)
            } else {
                0.0
            },
            total: count,
        })
        .collect::<Vec<_>>();
    managers.sort_by(|a, b| a.avg.total_cmp(&b.avg));
    managers
}

pub fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// The pipeline's consumer-facing contract.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposedResult {
    pub accounts: Vec<AccountRecord>,
    #[serde(rename = "updatedAt")]
    pub updated_at: Option<String>,
    pub managers: Vec<ManagerSummary>,
}

impl ComposedResult {
    pub fn from_accounts(accounts: Vec<AccountRecord>, updated_at: Option<String>) -> Self {
        let managers = aggregate_by_manager(&accounts);
        Self {
            accounts,
            updated_at,
            managers,
        }
    }

    pub fn panels(&self) -> StatusPanels<'_> {
        StatusPanels::from_accounts(&self.accounts)
    }
}

/// The three dashboard panels. Inactive accounts are shown with the critical ones.
#[derive(Debug, Clone, Serialize)]
pub struct StatusPanels<'a> {
    pub ok: Vec<&'a AccountRecord>,
    pub warning: Vec<&'a AccountRecord>,
    pub critical: Vec<&'a AccountRecord>,
}

impl<'a> StatusPanels<'a> {
    pub fn from_accounts(accounts: &'a [AccountRecord]) -> Self {
        let mut panels = Self {
            ok: Vec::new(),
            warning: Vec::new(),
            critical: Vec::new(),
        };
        for account in accounts {
            match account.status {
                Status::Ok => panels.ok.push(account),
                Status::Warning => panels.warning.push(account),
                Status::Critical | Status::Inactive => panels.critical.push(account),
            }
        }
        panels
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (self.ok.len(), self.warning.len(), self.critical.len())
    }
}

pub fn format_days_ago(days: u64) -> String {
    match days {
        0 => "Hoje".to_string(),
        n => format!("{n}d atrás"),
    }
}

/// First name of a manager, or an em dash when there is none.
pub fn short_name(full: Option<&str>) -> String {
    full.and_then(|s| s.split_whitespace().next())
        .unwrap_or("—")
        .to_string()
}

pub fn format_timestamp<Tz>(iso: Option<&str>, tz: &Tz) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    let Some(raw) = iso.map(str::trim).filter(|s| !s.is_empty()) else {
        return TIMESTAMP_PLACEHOLDER.to_string();
    };

    let parsed = DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            NaiveDate::parse_from_str(raw, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|naive| naive.and_utc())
        });

    match parsed {
        Some(dt) => dt.with_timezone(tz).format("%d/%m/%Y %H:%M").to_string(),
        None => TIMESTAMP_PLACEHOLDER.to_string(),
    }
}
