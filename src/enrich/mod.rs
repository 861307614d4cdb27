//! Per-PR enrichment cache.
//!
//! Secondary facts about a PR (conversation and approval counts, the viewer's
//! latest review, the latest comment, the most recent review request) cost one
//! GraphQL round-trip each. They only change when the PR's `updatedAt` does, so
//! results are cached on disk keyed by `(repo, number)` and reused while the
//! stored `updated_at` matches the listing's.
//!
//! Enrichment is best-effort: a failed query yields [`Enrichment::default`] and
//! leaves the cache untouched so the next run tries again.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::github::GithubApi;
use crate::github::types::{PullActivity, ReviewRecord, Reviewer};
use crate::snapshot::{LatestComment, MyReview, PrId, PullRequestRecord, ReviewState};
use crate::state;

/// Longest comment preview kept, in characters.
const SNIPPET_CHARS: usize = 80;

/// Derived fields for one PR.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Enrichment {
    pub conversation_count: u32,
    pub approval_count: u32,
    #[serde(default)]
    pub latest_comment: Option<LatestComment>,
    #[serde(default)]
    pub my_review: Option<MyReview>,
    #[serde(default)]
    pub review_requested_at: Option<DateTime<Utc>>,
}

impl Enrichment {
    /// The derived fields already carried by a snapshot row.
    pub fn from_record(record: &PullRequestRecord) -> Self {
        Self {
            conversation_count: record.conversation_count,
            approval_count: record.approval_count,
            latest_comment: record.latest_comment.clone(),
            my_review: record.my_review.clone(),
            review_requested_at: record.review_requested_at,
        }
    }
}

/// On-disk cache entry.
#[derive(Debug, Serialize, Deserialize)]
struct CacheEntry {
    updated_at: DateTime<Utc>,
    #[serde(flatten)]
    values: Enrichment,
}

/// Who "me" and "my team" are when interpreting reviews and requests.
#[derive(Debug, Clone, Default)]
pub struct Audience {
    pub viewer: String,
    /// Team slugs whose review requests count as aimed at the viewer.
    pub team_slugs: Vec<String>,
}

impl Audience {
    fn is_viewer(&self, login: &str) -> bool {
        !self.viewer.is_empty() && login.eq_ignore_ascii_case(&self.viewer)
    }

    fn targets(&self, reviewer: &Reviewer) -> bool {
        match reviewer {
            Reviewer::User(login) => self.is_viewer(login),
            Reviewer::Team(slug) => self.team_slugs.iter().any(|t| t.eq_ignore_ascii_case(slug)),
        }
    }
}

/// Disk-backed enrichment cache over a [`GithubApi`].
pub struct EnrichmentCache {
    api: Arc<dyn GithubApi>,
    dir: PathBuf,
    audience: Audience,
    fetches: AtomicUsize,
}

impl EnrichmentCache {
    pub fn new(api: Arc<dyn GithubApi>, dir: impl Into<PathBuf>, audience: Audience) -> Self {
        Self {
            api,
            dir: dir.into(),
            audience,
            fetches: AtomicUsize::new(0),
        }
    }

    /// Number of upstream queries issued (cache misses) so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    fn entry_path(&self, id: &PrId) -> PathBuf {
        let (owner, name) = id.owner_name().unwrap_or(("_", id.repo.as_str()));
        self.dir.join(format!("{owner}__{name}__{}.json", id.number))
    }

    /// Return derived fields for `id` at `updated_at`, querying upstream only
    /// if the cached entry is missing or was recorded at a different time.
    /// Failures degrade to zero values.
    pub async fn enrich(&self, id: &PrId, updated_at: DateTime<Utc>) -> Enrichment {
        self.try_enrich(id, updated_at).await.unwrap_or_default()
    }

    /// Like [`enrich`](Self::enrich), but `None` when the upstream query
    /// failed, so callers can fall back to values they already hold.
    pub async fn try_enrich(&self, id: &PrId, updated_at: DateTime<Utc>) -> Option<Enrichment> {
        let path = self.entry_path(id);
        if let Some(entry) = state::load_json::<CacheEntry>(&path)
            && entry.updated_at == updated_at
        {
            tracing::debug!(target: "enrich", "cache hit for {id}");
            return Some(entry.values);
        }

        self.fetches.fetch_add(1, Ordering::Relaxed);
        let activity = match self.api.pull_activity(&id.repo, id.number).await {
            Ok(activity) => activity,
            Err(e) => {
                tracing::warn!(target: "enrich", "enrichment for {id} failed: {e}");
                return None;
            }
        };

        let values = derive(&activity, &self.audience);
        let entry = CacheEntry { updated_at, values };
        if let Err(e) = state::save_json(&path, &entry) {
            tracing::warn!(target: "enrich", "could not cache enrichment for {id}: {e}");
        }
        Some(entry.values)
    }
}

/// Compute the derived fields from raw activity.
pub fn derive(activity: &PullActivity, audience: &Audience) -> Enrichment {
    let latest = latest_review_per_author(&activity.reviews);

    let approval_count = latest
        .values()
        .filter(|r| r.state == ReviewState::Approved)
        .count() as u32;

    let my_review = latest
        .iter()
        .find(|(login, _)| audience.is_viewer(login))
        .map(|(_, r)| MyReview {
            state: r.state,
            submitted_at: r.submitted_at,
        });

    let review_requested_at = activity
        .review_requests
        .iter()
        .filter(|event| audience.targets(&event.reviewer))
        .map(|event| event.created_at)
        .max();

    let latest_comment = activity.latest_comment.as_ref().map(|c| LatestComment {
        id: c.id.clone(),
        author: c.author.clone(),
        snippet: snippet(&c.body),
    });

    Enrichment {
        conversation_count: activity.comment_count + activity.review_thread_count,
        approval_count,
        latest_comment,
        my_review,
        review_requested_at,
    }
}

/// Reduce reviews to each author's most recent one.
///
/// Reviews arrive oldest first; a later review by the same author replaces an
/// earlier one. Ties on `submitted_at` keep the later position. Pending reviews
/// are drafts and never supersede a submitted state.
fn latest_review_per_author(reviews: &[ReviewRecord]) -> HashMap<&str, &ReviewRecord> {
    let mut latest: HashMap<&str, &ReviewRecord> = HashMap::new();
    for review in reviews.iter().filter(|r| r.state != ReviewState::Pending) {
        match latest.get(review.author.as_str()) {
            Some(current) if current.submitted_at > review.submitted_at => {}
            _ => {
                latest.insert(review.author.as_str(), review);
            }
        }
    }
    latest
}

/// One-line preview of a comment body.
fn snippet(body: &str) -> String {
    let flat = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= SNIPPET_CHARS {
        return flat;
    }
    let mut cut: String = flat.chars().take(SNIPPET_CHARS - 1).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::types::{ActivityComment, ReviewRequestEvent};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn review(author: &str, state: ReviewState, at: &str) -> ReviewRecord {
        ReviewRecord {
            author: author.into(),
            state,
            submitted_at: Some(ts(at)),
        }
    }

    fn audience() -> Audience {
        Audience {
            viewer: "me".into(),
            team_slugs: vec!["platform".into()],
        }
    }

    #[test]
    fn test_approval_count_uses_latest_state_per_reviewer() {
        let activity = PullActivity {
            reviews: vec![
                review("alice", ReviewState::Approved, "2024-01-01T00:00:00Z"),
                review("alice", ReviewState::ChangesRequested, "2024-01-02T00:00:00Z"),
                review("bob", ReviewState::Approved, "2024-01-03T00:00:00Z"),
            ],
            ..Default::default()
        };
        assert_eq!(derive(&activity, &audience()).approval_count, 1);
    }

    #[test]
    fn test_pending_review_does_not_supersede() {
        let activity = PullActivity {
            reviews: vec![
                review("alice", ReviewState::Approved, "2024-01-01T00:00:00Z"),
                review("alice", ReviewState::Pending, "2024-01-02T00:00:00Z"),
            ],
            ..Default::default()
        };
        assert_eq!(derive(&activity, &audience()).approval_count, 1);
    }

    #[test]
    fn test_my_review_and_request_time() {
        let activity = PullActivity {
            comment_count: 3,
            review_thread_count: 2,
            reviews: vec![
                review("me", ReviewState::Approved, "2024-01-01T00:00:00Z"),
                review("me", ReviewState::Dismissed, "2024-01-02T00:00:00Z"),
            ],
            review_requests: vec![
                ReviewRequestEvent {
                    reviewer: Reviewer::User("someone".into()),
                    created_at: ts("2024-01-05T00:00:00Z"),
                },
                ReviewRequestEvent {
                    reviewer: Reviewer::Team("platform".into()),
                    created_at: ts("2024-01-03T00:00:00Z"),
                },
                ReviewRequestEvent {
                    reviewer: Reviewer::User("me".into()),
                    created_at: ts("2024-01-04T00:00:00Z"),
                },
            ],
            latest_comment: Some(ActivityComment {
                id: "77".into(),
                author: "carol".into(),
                body: "multi\nline   body".into(),
            }),
        };

        let out = derive(&activity, &audience());
        assert_eq!(out.conversation_count, 5);
        assert_eq!(out.my_review.unwrap().state, ReviewState::Dismissed);
        assert_eq!(out.review_requested_at, Some(ts("2024-01-04T00:00:00Z")));
        assert_eq!(out.latest_comment.unwrap().snippet, "multi line body");
    }

    #[test]
    fn test_snippet_truncates() {
        let long = "x".repeat(200);
        let s = snippet(&long);
        assert_eq!(s.chars().count(), SNIPPET_CHARS);
        assert!(s.ends_with('…'));
    }
}
