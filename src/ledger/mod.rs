//! Notification ledger: persisted `event key -> discriminator` table.
//!
//! The ledger is what makes delivery at-most-once per logical occurrence. An
//! event key names *what* happened to *which* PR (`comment/acme/app#7`); the
//! discriminator says *which occurrence* (a timestamp, a comment id, or a bare
//! marker). A write is only honored when its discriminator advances past the
//! stored one, so replays and out-of-order deliveries are suppressed.
//!
//! Anything unreadable is dropped rather than kept: a corrupt entry costs at
//! most one extra notification, never a key that is silenced forever.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use color_eyre::Result;

use crate::snapshot::PrId;
use crate::state;

/// Build the ledger key for an event kind on one PR.
pub fn event_key(kind: &str, id: &PrId) -> String {
    format!("{kind}/{id}")
}

/// Recover the PR identity from an event key. `None` for foreign keys.
pub fn key_pr_id(key: &str) -> Option<PrId> {
    let (_, rest) = key.split_once('/')?;
    PrId::parse(rest)
}

/// The value that tells one occurrence of an event from another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Discriminator {
    /// Fires again only for a strictly later time.
    Timestamp(DateTime<Utc>),
    /// Fires again for any different id; numeric ids must increase.
    Id(String),
    /// One-shot: fires only while the key has no entry.
    Marker(String),
}

impl Discriminator {
    pub fn marker() -> Self {
        Self::Marker("1".into())
    }

    /// Persisted form: `t:<rfc3339>`, `i:<id>` or `m:<text>`.
    pub fn encode(&self) -> String {
        match self {
            Self::Timestamp(t) => format!("t:{}", t.to_rfc3339()),
            Self::Id(id) => format!("i:{id}"),
            Self::Marker(m) => format!("m:{m}"),
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        let (tag, value) = s.split_once(':')?;
        match tag {
            "t" => DateTime::parse_from_rfc3339(value)
                .ok()
                .map(|t| Self::Timestamp(t.with_timezone(&Utc))),
            "i" if !value.is_empty() => Some(Self::Id(value.to_string())),
            "m" => Some(Self::Marker(value.to_string())),
            _ => None,
        }
    }

    fn validate(&self) -> Result<(), LedgerRejection> {
        match self {
            Self::Id(id) if id.trim().is_empty() => {
                Err(LedgerRejection::Malformed("empty id".into()))
            }
            _ => Ok(()),
        }
    }

    /// Whether `self` is a fresh occurrence relative to `stored`.
    fn advances_past(&self, stored: &Discriminator) -> bool {
        match (stored, self) {
            (Self::Timestamp(old), Self::Timestamp(new)) => new > old,
            (Self::Id(old), Self::Id(new)) => {
                match (old.parse::<u64>(), new.parse::<u64>()) {
                    (Ok(old), Ok(new)) => new > old,
                    _ => old != new,
                }
            }
            (Self::Marker(_), Self::Marker(_)) => false,
            // The stored entry was written under a different rule; let the
            // new occurrence through once rather than silence the key.
            _ => true,
        }
    }
}

impl std::fmt::Display for Discriminator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Why a ledger write was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerRejection {
    /// The discriminator could not be validated.
    Malformed(String),
    /// The discriminator does not advance past the stored value.
    NotNewer {
        stored: Discriminator,
        offered: Discriminator,
    },
}

impl std::fmt::Display for LedgerRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Malformed(why) => write!(f, "malformed discriminator: {why}"),
            Self::NotNewer { stored, offered } => {
                write!(f, "{offered} does not advance past {stored}")
            }
        }
    }
}

/// In-memory ledger, loaded at run start and saved once at run end.
///
/// Mutation needs `&mut`, so one run has exactly one writer.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Ledger {
    entries: BTreeMap<String, Discriminator>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from disk. A missing file is an empty ledger; unreadable lines are
    /// skipped.
    pub fn load(path: &Path) -> Result<Self> {
        let mut ledger = Self::new();
        let Some(rows) = state::read_table(path)? else {
            return Ok(ledger);
        };

        for row in rows {
            match row.as_slice() {
                [key, value, ..] if !key.is_empty() => match Discriminator::decode(value) {
                    Some(d) => {
                        ledger.entries.insert(key.clone(), d);
                    }
                    None => tracing::warn!(
                        target: "ledger",
                        "dropping entry {key:?} with unreadable discriminator {value:?}"
                    ),
                },
                _ => tracing::warn!(target: "ledger", "dropping malformed ledger row {row:?}"),
            }
        }
        Ok(ledger)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        state::write_table(
            path,
            self.entries.iter().map(|(k, d)| [k.clone(), d.encode()]),
        )
    }

    pub fn get(&self, key: &str) -> Option<&Discriminator> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Discriminator)> {
        self.entries.iter()
    }

    /// Check whether `set(key, discriminator)` would be honored, without writing.
    pub fn check(&self, key: &str, discriminator: &Discriminator) -> Result<(), LedgerRejection> {
        discriminator.validate()?;
        match self.entries.get(key) {
            Some(stored) if !discriminator.advances_past(stored) => {
                Err(LedgerRejection::NotNewer {
                    stored: stored.clone(),
                    offered: discriminator.clone(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Record `discriminator` for `key` if it advances past the stored value.
    /// On rejection the stored value is unchanged.
    pub fn set(&mut self, key: &str, discriminator: Discriminator) -> Result<(), LedgerRejection> {
        self.check(key, &discriminator)?;
        self.entries.insert(key.to_string(), discriminator);
        Ok(())
    }

    /// Record the occurrence and report whether it is new. Malformed
    /// discriminators are logged and treated as not new.
    pub fn admit(&mut self, key: &str, discriminator: Discriminator) -> bool {
        match self.set(key, discriminator) {
            Ok(()) => true,
            Err(LedgerRejection::NotNewer { .. }) => false,
            Err(rejection) => {
                tracing::warn!(target: "ledger", "skipping write for {key}: {rejection}");
                false
            }
        }
    }

    /// Forget `key`, so its next occurrence is new again.
    pub fn remove(&mut self, key: &str) -> Option<Discriminator> {
        self.entries.remove(key)
    }

    /// Drop every entry whose PR is not in `live`. Keys that do not name a PR
    /// are dropped too. Returns the number removed.
    pub fn gc(&mut self, live: &BTreeSet<PrId>) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|key, _| key_pr_id(key).is_some_and(|id| live.contains(&id)));
        let removed = before - self.entries.len();
        if removed > 0 {
            tracing::debug!(target: "ledger", "gc removed {removed} entr(ies)");
        }
        removed
    }
}
