//! Pull-request records and the per-run snapshot.
//!
//! A [`Snapshot`] is the de-duplicated set of every PR seen in one run, keyed
//! by [`PrId`]. It is built fresh each run by the [`builder`], diffed against
//! the previous run's snapshot by the detector, and then written to
//! `snapshot.tsv` to become the next run's "previous" state.

pub mod builder;

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::{Deserialize, Serialize};

use crate::state;

/// Identity of a pull request: repository (`owner/name`) plus number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PrId {
    pub repo: String,
    pub number: u64,
}

impl PrId {
    pub fn new(repo: impl Into<String>, number: u64) -> Self {
        Self {
            repo: repo.into(),
            number,
        }
    }

    /// Canonical web URL, used when no fetched URL is available.
    pub fn web_url(&self) -> String {
        format!("https://github.com/{}/pull/{}", self.repo, self.number)
    }

    /// Split `repo` into `(owner, name)`.
    pub fn owner_name(&self) -> Option<(&str, &str)> {
        self.repo.split_once('/')
    }

    /// Parse the `owner/name#number` form produced by `Display`.
    pub fn parse(s: &str) -> Option<Self> {
        let (repo, number) = s.rsplit_once('#')?;
        if !repo.contains('/') {
            return None;
        }
        Some(Self::new(repo, number.parse().ok()?))
    }
}

impl std::fmt::Display for PrId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.repo, self.number)
    }
}

/// Aggregate review decision reported for the PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewDecision {
    #[default]
    None,
    ReviewRequired,
    ChangesRequested,
    Approved,
}

impl ReviewDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::ReviewRequired => "REVIEW_REQUIRED",
            Self::ChangesRequested => "CHANGES_REQUESTED",
            Self::Approved => "APPROVED",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "REVIEW_REQUIRED" => Self::ReviewRequired,
            "CHANGES_REQUESTED" => Self::ChangesRequested,
            "APPROVED" => Self::Approved,
            _ => Self::None,
        }
    }
}

/// State of a single submitted review.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    Approved,
    ChangesRequested,
    Commented,
    Dismissed,
    Pending,
}

impl ReviewState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "APPROVED",
            Self::ChangesRequested => "CHANGES_REQUESTED",
            Self::Commented => "COMMENTED",
            Self::Dismissed => "DISMISSED",
            Self::Pending => "PENDING",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "APPROVED" => Some(Self::Approved),
            "CHANGES_REQUESTED" => Some(Self::ChangesRequested),
            "COMMENTED" => Some(Self::Commented),
            "DISMISSED" => Some(Self::Dismissed),
            "PENDING" => Some(Self::Pending),
            _ => None,
        }
    }
}

/// The viewer's most recent review on a PR.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MyReview {
    pub state: ReviewState,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

/// Identity and preview of the most recent conversation comment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestComment {
    pub id: String,
    pub author: String,
    pub snippet: String,
}

/// Which of the viewer's assignment relations hold for a PR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AssignmentFlags {
    pub assigned_to_me: bool,
    pub assigned_to_team: bool,
    pub requested_to_me: bool,
    pub requested_to_team: bool,
}

/// One named flag out of [`AssignmentFlags`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AssignmentFlag {
    AssignedToMe,
    AssignedToTeam,
    RequestedToMe,
    RequestedToTeam,
}

impl AssignmentFlag {
    pub const ALL: [AssignmentFlag; 4] = [
        Self::RequestedToMe,
        Self::RequestedToTeam,
        Self::AssignedToMe,
        Self::AssignedToTeam,
    ];

    pub fn is_request(&self) -> bool {
        matches!(self, Self::RequestedToMe | Self::RequestedToTeam)
    }
}

impl AssignmentFlags {
    pub fn get(&self, flag: AssignmentFlag) -> bool {
        match flag {
            AssignmentFlag::AssignedToMe => self.assigned_to_me,
            AssignmentFlag::AssignedToTeam => self.assigned_to_team,
            AssignmentFlag::RequestedToMe => self.requested_to_me,
            AssignmentFlag::RequestedToTeam => self.requested_to_team,
        }
    }

    pub fn any(&self) -> bool {
        AssignmentFlag::ALL.iter().any(|f| self.get(*f))
    }
}

/// A configured listing that contributes PRs to the snapshot.
///
/// Declaration order is display order, and the first section to see a PR owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SectionKind {
    ReviewRequested,
    TeamQueue,
    Assigned,
    Mentioned,
    TeamAuthors,
    Mine,
    Participated,
    AllOpen,
}

/// How rows within a section are ordered before rendering or diffing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    UpdatedDesc,
    CreatedAsc,
    NumberDesc,
}

impl SectionKind {
    pub const ALL: [SectionKind; 8] = [
        Self::ReviewRequested,
        Self::TeamQueue,
        Self::Assigned,
        Self::Mentioned,
        Self::TeamAuthors,
        Self::Mine,
        Self::Participated,
        Self::AllOpen,
    ];

    /// Stable identifier used in the snapshot file.
    pub fn slug(&self) -> &'static str {
        match self {
            Self::ReviewRequested => "review-requested",
            Self::TeamQueue => "team-queue",
            Self::Assigned => "assigned",
            Self::Mentioned => "mentioned",
            Self::TeamAuthors => "team-authors",
            Self::Mine => "mine",
            Self::Participated => "participated",
            Self::AllOpen => "all-open",
        }
    }

    pub fn from_slug(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.slug() == s)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::ReviewRequested => "Review requested",
            Self::TeamQueue => "Team queue",
            Self::Assigned => "Assigned to me",
            Self::Mentioned => "Mentioned",
            Self::TeamAuthors => "Raised by team",
            Self::Mine => "My pull requests",
            Self::Participated => "Participated",
            Self::AllOpen => "All open",
        }
    }

    pub fn sort_key(&self) -> SortKey {
        match self {
            Self::TeamQueue => SortKey::CreatedAsc,
            Self::AllOpen => SortKey::NumberDesc,
            _ => SortKey::UpdatedDesc,
        }
    }

    /// Whether the listing must follow every page (completeness-critical)
    /// rather than take the first page only.
    pub fn paginate_fully(&self) -> bool {
        matches!(self, Self::TeamQueue | Self::AllOpen)
    }
}

impl std::fmt::Display for SectionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.slug())
    }
}

/// One PR as known to this run.
#[derive(Debug, Clone, PartialEq)]
pub struct PullRequestRecord {
    pub id: PrId,
    pub title: String,
    pub url: String,
    pub author: String,
    pub author_avatar: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub draft: bool,
    pub conversation_count: u32,
    pub approval_count: u32,
    pub in_merge_queue: bool,
    pub flags: AssignmentFlags,
    pub review_decision: ReviewDecision,
    pub my_review: Option<MyReview>,
    /// Latest review-request event aimed at the viewer or a configured team.
    pub review_requested_at: Option<DateTime<Utc>>,
    pub latest_comment: Option<LatestComment>,
    /// No enrichment lookup has succeeded for this PR yet, so the derived
    /// fields are placeholders rather than observed values.
    pub enrichment_pending: bool,
    /// Section that owns this row for display.
    pub section: SectionKind,
}

impl PullRequestRecord {
    /// A minimal row for a PR known only by identity, used when an event needs
    /// a title/url and neither snapshot has the PR.
    pub fn synthesized(id: PrId, updated_at: DateTime<Utc>) -> Self {
        Self {
            title: id.to_string(),
            url: id.web_url(),
            id,
            author: String::new(),
            author_avatar: None,
            created_at: None,
            updated_at,
            draft: false,
            conversation_count: 0,
            approval_count: 0,
            in_merge_queue: false,
            flags: AssignmentFlags::default(),
            review_decision: ReviewDecision::None,
            my_review: None,
            review_requested_at: None,
            latest_comment: None,
            enrichment_pending: false,
            section: SectionKind::AllOpen,
        }
    }

    fn to_row(&self) -> Vec<String> {
        let ts = |t: &Option<DateTime<Utc>>| t.map(|t| t.to_rfc3339()).unwrap_or_default();
        let flag = |b: bool| if b { "1" } else { "0" }.to_string();
        let comment = self.latest_comment.as_ref();

        vec![
            self.id.repo.clone(),
            self.id.number.to_string(),
            self.title.clone(),
            self.url.clone(),
            self.author.clone(),
            ts(&self.created_at),
            self.updated_at.to_rfc3339(),
            flag(self.draft),
            self.conversation_count.to_string(),
            self.approval_count.to_string(),
            flag(self.in_merge_queue),
            flag(self.flags.assigned_to_me),
            flag(self.flags.assigned_to_team),
            flag(self.flags.requested_to_me),
            flag(self.flags.requested_to_team),
            self.review_decision.as_str().to_string(),
            self.my_review
                .as_ref()
                .map(|r| r.state.as_str().to_string())
                .unwrap_or_default(),
            ts(&self.my_review.as_ref().and_then(|r| r.submitted_at)),
            ts(&self.review_requested_at),
            comment.map(|c| c.id.clone()).unwrap_or_default(),
            comment.map(|c| c.author.clone()).unwrap_or_default(),
            comment.map(|c| c.snippet.clone()).unwrap_or_default(),
            self.section.slug().to_string(),
            flag(self.enrichment_pending),
        ]
    }

    fn from_row(row: &[String]) -> Option<Self> {
        if row.len() < 23 {
            return None;
        }
        let ts = |s: &str| -> Option<DateTime<Utc>> {
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|t| t.with_timezone(&Utc))
        };
        let flag = |s: &str| s == "1";

        let id = PrId::new(row[0].clone(), row[1].parse().ok()?);
        let my_review = ReviewState::parse(&row[16]).map(|state| MyReview {
            state,
            submitted_at: ts(&row[17]),
        });
        let latest_comment = (!row[19].is_empty()).then(|| LatestComment {
            id: row[19].clone(),
            author: row[20].clone(),
            snippet: row[21].clone(),
        });

        Some(Self {
            title: row[2].clone(),
            url: if row[3].is_empty() { id.web_url() } else { row[3].clone() },
            id,
            author: row[4].clone(),
            author_avatar: None,
            created_at: ts(&row[5]),
            updated_at: ts(&row[6])?,
            draft: flag(&row[7]),
            conversation_count: row[8].parse().unwrap_or(0),
            approval_count: row[9].parse().unwrap_or(0),
            in_merge_queue: flag(&row[10]),
            flags: AssignmentFlags {
                assigned_to_me: flag(&row[11]),
                assigned_to_team: flag(&row[12]),
                requested_to_me: flag(&row[13]),
                requested_to_team: flag(&row[14]),
            },
            review_decision: ReviewDecision::parse(&row[15]),
            my_review,
            review_requested_at: ts(&row[18]),
            latest_comment,
            // Rows written before the column existed were always enriched.
            enrichment_pending: row.get(23).is_some_and(|s| flag(s)),
            section: SectionKind::from_slug(&row[22]).unwrap_or(SectionKind::AllOpen),
        })
    }
}

/// The de-duplicated set of PR records for one run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    rows: BTreeMap<PrId, PullRequestRecord>,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record unless its identity is already present.
    /// Returns whether the record was inserted.
    pub fn insert(&mut self, record: PullRequestRecord) -> bool {
        if self.rows.contains_key(&record.id) {
            return false;
        }
        self.rows.insert(record.id.clone(), record);
        true
    }

    pub fn get(&self, id: &PrId) -> Option<&PullRequestRecord> {
        self.rows.get(id)
    }

    pub fn contains(&self, id: &PrId) -> bool {
        self.rows.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &PrId> {
        self.rows.keys()
    }

    pub fn records(&self) -> impl Iterator<Item = &PullRequestRecord> {
        self.rows.values()
    }

    /// Records owned by the given section.
    pub fn owned_by(&self, section: SectionKind) -> impl Iterator<Item = &PullRequestRecord> {
        self.rows.values().filter(move |r| r.section == section)
    }

    /// Load a persisted snapshot. `Ok(None)` means there is no previous state
    /// (first run, or state was reset).
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let Some(rows) = state::read_table(path)? else {
            return Ok(None);
        };

        let mut snapshot = Self::new();
        for row in rows {
            match PullRequestRecord::from_row(&row) {
                Some(record) => {
                    snapshot.insert(record);
                }
                None => tracing::warn!(
                    target: "state",
                    "skipping unreadable snapshot row: {:?}",
                    row.first()
                ),
            }
        }
        Ok(Some(snapshot))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        state::write_table(path, self.rows.values().map(|r| r.to_row()))
    }
}

impl FromIterator<PullRequestRecord> for Snapshot {
    fn from_iter<T: IntoIterator<Item = PullRequestRecord>>(iter: T) -> Self {
        let mut snapshot = Self::new();
        for record in iter {
            snapshot.insert(record);
        }
        snapshot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn record(repo: &str, number: u64) -> PullRequestRecord {
        let mut r = PullRequestRecord::synthesized(PrId::new(repo, number), ts("2024-01-01T00:00:00Z"));
        r.title = format!("PR {number}");
        r
    }

    #[test]
    fn test_pr_id_display_and_parse() {
        let id = PrId::new("acme/app", 42);
        assert_eq!(id.to_string(), "acme/app#42");
        assert_eq!(PrId::parse("acme/app#42"), Some(id));
        assert_eq!(PrId::parse("app#42"), None);
        assert_eq!(PrId::parse("acme/app#x"), None);
    }

    #[test]
    fn test_insert_first_wins() {
        let mut snap = Snapshot::new();
        let mut first = record("acme/app", 7);
        first.section = SectionKind::ReviewRequested;
        let mut second = record("acme/app", 7);
        second.section = SectionKind::Participated;

        assert!(snap.insert(first));
        assert!(!snap.insert(second));
        assert_eq!(snap.len(), 1);
        assert_eq!(
            snap.get(&PrId::new("acme/app", 7)).unwrap().section,
            SectionKind::ReviewRequested
        );
    }

    #[test]
    fn test_save_load_preserves_fields() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.tsv");

        let mut r = record("acme/app", 9);
        r.title = "Fix\ttabs and\nnewlines".into();
        r.created_at = Some(ts("2023-12-31T10:00:00Z"));
        r.conversation_count = 4;
        r.in_merge_queue = true;
        r.flags.requested_to_team = true;
        r.review_decision = ReviewDecision::Approved;
        r.my_review = Some(MyReview {
            state: ReviewState::Approved,
            submitted_at: Some(ts("2024-01-01T08:00:00Z")),
        });
        r.latest_comment = Some(LatestComment {
            id: "1001".into(),
            author: "bob".into(),
            snippet: "looks good".into(),
        });
        r.section = SectionKind::TeamQueue;
        r.enrichment_pending = true;

        let snap: Snapshot = vec![r.clone()].into_iter().collect();
        snap.save(&path).unwrap();

        let loaded = Snapshot::load(&path).unwrap().unwrap();
        let got = loaded.get(&r.id).unwrap();
        // author_avatar is display-only and not persisted.
        assert_eq!(got, &r);
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(Snapshot::load(&dir.path().join("none.tsv")).unwrap().is_none());
    }

    #[test]
    fn test_load_skips_corrupt_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("snapshot.tsv");
        let good = record("acme/app", 1);
        let snap: Snapshot = vec![good].into_iter().collect();
        snap.save(&path).unwrap();

        let mut contents = std::fs::read_to_string(&path).unwrap();
        contents.push_str("garbage\trow\n");
        std::fs::write(&path, contents).unwrap();

        let loaded = Snapshot::load(&path).unwrap().unwrap();
        assert_eq!(loaded.len(), 1);
    }

    #[test]
    fn test_row_without_pending_column_is_enriched() {
        let mut row = record("acme/app", 4).to_row();
        row.truncate(23);
        let parsed = PullRequestRecord::from_row(&row).unwrap();
        assert!(!parsed.enrichment_pending);
    }

    #[test]
    fn test_section_slug_roundtrip() {
        for kind in SectionKind::ALL {
            assert_eq!(SectionKind::from_slug(kind.slug()), Some(kind));
        }
    }
}
