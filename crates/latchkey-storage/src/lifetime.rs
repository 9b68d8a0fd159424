//! User lifetime rules and the expiry sweep.
//!
//! `lifetimes.json` maps user names to rules. The reserved key `-default-`
//! applies to everyone without an explicit rule. A rule may also be an
//! object keyed by location code for per-location lifetimes.
//!
//! | Rule | Expires after |
//! |------|---------------|
//! | `30d` | 30 days after the user was last modified |
//! | `+10d` | 10 days after the user's last audited action |
//! | `2024-12-06` | that date |
//! | `1713637154` | the date of that POSIX timestamp |
//! | `*` | never |

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{Days, Local, NaiveDate, TimeZone};
use latchkey_core::constants::{DEFAULT_LIFETIME_KEY, DEFAULT_LIFETIME_RULE};
use latchkey_core::{Error, Location};
use serde::{Deserialize, Serialize};

use crate::audit::AuditLog;
use crate::credentials::CredentialStore;
use crate::error::{StorageError, StorageResult};
use crate::models::User;
use crate::persist::write_atomically;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifetimeRule {
    /// Days after the last modification.
    AfterModified(u64),
    /// Days after the last audited action.
    AfterActivity(u64),
    /// Fixed last valid day.
    Until(NaiveDate),
    Never,
}

impl LifetimeRule {
    /// Last valid day for `user`, `None` if the rule never expires.
    pub fn last_valid_day(&self, user: &User, last_activity: Option<NaiveDate>) -> Option<NaiveDate> {
        match self {
            LifetimeRule::Never => None,
            LifetimeRule::Until(date) => Some(*date),
            LifetimeRule::AfterModified(days) => add_days(user.modified_date(), *days),
            LifetimeRule::AfterActivity(days) => {
                add_days(last_activity.unwrap_or_else(|| user.modified_date()), *days)
            }
        }
    }

    /// Whether `user` is expired on `today` (strictly after the last valid day).
    pub fn is_expired(&self, user: &User, last_activity: Option<NaiveDate>, today: NaiveDate) -> bool {
        self.last_valid_day(user, last_activity)
            .is_some_and(|last| today > last)
    }
}

fn add_days(date: NaiveDate, days: u64) -> Option<NaiveDate> {
    // Overflow means "so far away it never matters"
    date.checked_add_days(Days::new(days))
}

impl FromStr for LifetimeRule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        let rule = s.trim();
        let invalid = |reason: &str| Error::InvalidLifetime {
            rule: rule.to_string(),
            reason: reason.to_string(),
        };

        if rule == "*" {
            return Ok(LifetimeRule::Never);
        }
        if let Ok(date) = NaiveDate::parse_from_str(rule, "%Y-%m-%d") {
            return Ok(LifetimeRule::Until(date));
        }
        if let Ok(timestamp) = rule.parse::<i64>() {
            return Local
                .timestamp_opt(timestamp, 0)
                .single()
                .map(|at| LifetimeRule::Until(at.date_naive()))
                .ok_or_else(|| invalid("timestamp out of range"));
        }
        if let Some(days) = rule.strip_suffix('d') {
            let (relative, days) = match days.strip_prefix('+') {
                Some(days) => (true, days),
                None => (false, days),
            };
            if !days.is_empty() && days.bytes().all(|b| b.is_ascii_digit()) {
                let days = days
                    .parse::<u64>()
                    .map_err(|_| invalid("day count too large"))?;
                return Ok(if relative {
                    LifetimeRule::AfterActivity(days)
                } else {
                    LifetimeRule::AfterModified(days)
                });
            }
        }

        Err(invalid(
            "expected Nd, +Nd, YYYY-MM-DD, a POSIX timestamp or *",
        ))
    }
}

impl fmt::Display for LifetimeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifetimeRule::AfterModified(days) => write!(f, "{days}d"),
            LifetimeRule::AfterActivity(days) => write!(f, "+{days}d"),
            LifetimeRule::Until(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            LifetimeRule::Never => f.write_str("*"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum RawRule {
    Single(String),
    PerLocation(BTreeMap<String, String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Rule {
    Single(LifetimeRule),
    PerLocation(HashMap<Location, LifetimeRule>),
}

/// Lifetime rules by user name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lifetimes {
    default: LifetimeRule,
    rules: HashMap<String, Rule>,
}

impl Default for Lifetimes {
    fn default() -> Self {
        Self {
            default: LifetimeRule::AfterModified(30),
            rules: HashMap::new(),
        }
    }
}

impl Lifetimes {
    /// Load `lifetimes.json`. A missing file yields the defaults.
    ///
    /// # Errors
    /// - `StorageError::Io` if the file cannot be read
    /// - `StorageError::Malformed` if it is not a JSON object of rules
    /// - `StorageError::Config` for an unparseable rule or location code
    pub fn load(path: impl AsRef<Path>) -> StorageResult<Self> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(StorageError::io(path, e)),
        };
        let raw: HashMap<String, RawRule> =
            serde_json::from_str(&text).map_err(|e| StorageError::malformed(path, e))?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: HashMap<String, RawRule>) -> StorageResult<Self> {
        let mut default: LifetimeRule = DEFAULT_LIFETIME_RULE.parse()?;
        let mut rules = HashMap::new();

        for (name, raw_rule) in raw {
            let rule = match raw_rule {
                RawRule::Single(rule) => Rule::Single(rule.parse()?),
                RawRule::PerLocation(map) => Rule::PerLocation(
                    map.into_iter()
                        .map(|(code, rule)| -> Result<(Location, LifetimeRule), Error> {
                            Ok((code.parse()?, rule.parse()?))
                        })
                        .collect::<Result<_, Error>>()?,
                ),
            };

            match (name.as_str(), rule) {
                (DEFAULT_LIFETIME_KEY, Rule::Single(rule)) => default = rule,
                (DEFAULT_LIFETIME_KEY, Rule::PerLocation(_)) => {
                    return Err(Error::InvalidLifetime {
                        rule: DEFAULT_LIFETIME_KEY.to_string(),
                        reason: "default rule must be a single rule".to_string(),
                    }
                    .into());
                }
                (_, rule) => {
                    rules.insert(name.trim().to_lowercase(), rule);
                }
            }
        }

        Ok(Self { default, rules })
    }

    /// Write the rules back, sorted by name with two-space indent.
    ///
    /// Absolute rules are written as dates, so a rule loaded from a POSIX
    /// timestamp comes back as the equivalent `YYYY-MM-DD`.
    ///
    /// # Errors
    /// Returns `StorageError::Io` if the file cannot be replaced; the
    /// previous contents stay on disk.
    pub fn save(&self, path: impl AsRef<Path>) -> StorageResult<()> {
        let path = path.as_ref();
        let mut raw = BTreeMap::new();
        raw.insert(
            DEFAULT_LIFETIME_KEY.to_string(),
            RawRule::Single(self.default.to_string()),
        );
        for (name, rule) in &self.rules {
            let rule = match rule {
                Rule::Single(rule) => RawRule::Single(rule.to_string()),
                Rule::PerLocation(map) => RawRule::PerLocation(
                    map.iter()
                        .map(|(location, rule)| (location.code().to_string(), rule.to_string()))
                        .collect(),
                ),
            };
            raw.insert(name.clone(), rule);
        }

        let text =
            serde_json::to_string_pretty(&raw).map_err(|e| StorageError::malformed(path, e))?;
        write_atomically(path, &text)
    }

    /// Set the rule for `name` at every location, replacing any previous
    /// one. The reserved name `-default-` sets the default rule.
    pub fn set(&mut self, name: &str, rule: LifetimeRule) {
        let name = name.trim().to_lowercase();
        if name == DEFAULT_LIFETIME_KEY {
            self.default = rule;
        } else {
            self.rules.insert(name, Rule::Single(rule));
        }
    }

    /// Set an explicit rule for `name`.
    pub fn with_rule(mut self, name: &str, rule: LifetimeRule) -> Self {
        self.set(name, rule);
        self
    }

    pub fn default_rule(&self) -> LifetimeRule {
        self.default
    }

    /// The rule governing `name` at `location`.
    pub fn rule_for(&self, name: &str, location: Location) -> LifetimeRule {
        match self.rules.get(name) {
            Some(Rule::Single(rule)) => *rule,
            Some(Rule::PerLocation(map)) => map.get(&location).copied().unwrap_or(self.default),
            None => self.default,
        }
    }
}

/// Users of `location` whose lifetime has run out on `today`.
///
/// # Errors
/// Propagates credential file and audit log read errors.
pub async fn expired_users(
    store: &CredentialStore,
    audit: &AuditLog,
    lifetimes: &Lifetimes,
    location: Location,
    today: NaiveDate,
) -> StorageResult<Vec<User>> {
    let mut expired = Vec::new();

    for user in store.list(location)? {
        let rule = lifetimes.rule_for(user.name.as_str(), location);
        let last_activity = match rule {
            LifetimeRule::AfterActivity(_) => audit.last_activity(location, &user.name).await?,
            _ => None,
        };
        if rule.is_expired(&user, last_activity, today) {
            expired.push(user);
        }
    }

    Ok(expired)
}
