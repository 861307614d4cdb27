//! Types exchanged with GitHub.
//!
//! The `Gql*` and `Rest*` structs mirror the wire payloads and are private to
//! the `github` module; everything else is the normalized form the rest of the
//! crate consumes.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use crate::snapshot::{PrId, ReviewDecision, ReviewState};

/// A PR author (or other actor) as reported by the listing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Actor {
    pub login: String,
    pub avatar_url: Option<String>,
}

/// One raw PR entry from a listing query, before enrichment.
#[derive(Debug, Clone, PartialEq)]
pub struct PrEntry {
    pub id: PrId,
    pub title: String,
    pub url: String,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub draft: bool,
    /// `None` when the listing carries no merge-queue data.
    pub in_merge_queue: Option<bool>,
    pub author: Option<Actor>,
    pub comment_count: u32,
    pub review_decision: ReviewDecision,
    /// Logins of users with a pending review request.
    pub requested_users: Vec<String>,
    /// Slugs of teams with a pending review request.
    pub requested_teams: Vec<String>,
    pub assignees: Vec<String>,
    pub viewer_reacted: bool,
}

/// One page of a listing query.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub entries: Vec<PrEntry>,
    pub has_more: bool,
    pub next_cursor: Option<String>,
}

/// Point lookup of a single PR, used for merge verification and title backfill.
#[derive(Debug, Clone, PartialEq)]
pub struct PullDetail {
    pub id: PrId,
    pub title: String,
    pub url: String,
    /// `"open"` or `"closed"`.
    pub state: String,
    pub merged: bool,
    pub merged_at: Option<DateTime<Utc>>,
}

/// A reviewer targeted by a review request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reviewer {
    User(String),
    Team(String),
}

/// A single review, as needed for approval counting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRecord {
    pub author: String,
    pub state: ReviewState,
    pub submitted_at: Option<DateTime<Utc>>,
}

/// A "review requested" timeline event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewRequestEvent {
    pub reviewer: Reviewer,
    pub created_at: DateTime<Utc>,
}

/// The most recent conversation comment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityComment {
    pub id: String,
    pub author: String,
    pub body: String,
}

/// Secondary activity facts about one PR, fetched in one consolidated query.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullActivity {
    pub comment_count: u32,
    pub review_thread_count: u32,
    pub latest_comment: Option<ActivityComment>,
    pub reviews: Vec<ReviewRecord>,
    pub review_requests: Vec<ReviewRequestEvent>,
}

// ── GraphQL wire types ───────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct GqlEnvelope<T> {
    pub data: Option<T>,
    #[serde(default)]
    pub errors: Vec<GqlError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GqlError {
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GqlNodes<T> {
    #[serde(default = "Vec::new")]
    pub nodes: Vec<Option<T>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GqlCount {
    #[serde(default)]
    pub total_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GqlActor {
    pub login: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// `requestedReviewer` is a union: users carry `login`, teams carry `slug`.
#[derive(Debug, Deserialize)]
pub(crate) struct GqlReviewer {
    #[serde(default)]
    pub login: Option<String>,
    #[serde(default)]
    pub slug: Option<String>,
}

impl GqlReviewer {
    fn into_reviewer(self) -> Option<Reviewer> {
        match (self.login, self.slug) {
            (Some(login), _) => Some(Reviewer::User(login)),
            (None, Some(slug)) => Some(Reviewer::Team(slug)),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GqlReviewRequest {
    pub requested_reviewer: Option<GqlReviewer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GqlReactionGroup {
    #[serde(default)]
    pub viewer_has_reacted: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GqlRepository {
    pub name_with_owner: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GqlPullRequest {
    pub number: u64,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub is_draft: bool,
    #[serde(default)]
    pub is_in_merge_queue: bool,
    #[serde(default)]
    pub review_decision: Option<ReviewDecision>,
    pub repository: GqlRepository,
    #[serde(default)]
    pub author: Option<GqlActor>,
    #[serde(default)]
    pub comments: Option<GqlCount>,
    #[serde(default)]
    pub assignees: Option<GqlNodes<GqlActor>>,
    #[serde(default)]
    pub review_requests: Option<GqlNodes<GqlReviewRequest>>,
    #[serde(default)]
    pub reaction_groups: Option<Vec<GqlReactionGroup>>,
}

impl From<GqlPullRequest> for PrEntry {
    fn from(pr: GqlPullRequest) -> Self {
        let mut requested_users = Vec::new();
        let mut requested_teams = Vec::new();
        for request in pr
            .review_requests
            .map(|r| r.nodes)
            .unwrap_or_default()
            .into_iter()
            .flatten()
        {
            match request.requested_reviewer.and_then(GqlReviewer::into_reviewer) {
                Some(Reviewer::User(login)) => requested_users.push(login),
                Some(Reviewer::Team(slug)) => requested_teams.push(slug),
                None => {}
            }
        }

        Self {
            id: PrId::new(pr.repository.name_with_owner, pr.number),
            title: pr.title,
            url: pr.url,
            created_at: pr.created_at,
            updated_at: pr.updated_at,
            draft: pr.is_draft,
            in_merge_queue: Some(pr.is_in_merge_queue),
            author: pr.author.map(|a| Actor {
                login: a.login,
                avatar_url: a.avatar_url,
            }),
            comment_count: pr.comments.map(|c| c.total_count).unwrap_or(0),
            review_decision: pr.review_decision.unwrap_or_default(),
            requested_users,
            requested_teams,
            assignees: pr
                .assignees
                .map(|a| a.nodes.into_iter().flatten().map(|a| a.login).collect())
                .unwrap_or_default(),
            viewer_reacted: pr
                .reaction_groups
                .unwrap_or_default()
                .iter()
                .any(|g| g.viewer_has_reacted),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GqlPageInfo {
    #[serde(default)]
    pub has_next_page: bool,
    #[serde(default)]
    pub end_cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GqlSearch {
    pub page_info: GqlPageInfo,
    /// Non-PR hits come back as empty objects, so nodes stay untyped until
    /// they are matched against [`GqlPullRequest`].
    #[serde(default)]
    pub nodes: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GqlSearchData {
    pub search: GqlSearch,
}

impl From<GqlSearch> for SearchPage {
    fn from(search: GqlSearch) -> Self {
        let entries = search
            .nodes
            .into_iter()
            .filter_map(|node| serde_json::from_value::<GqlPullRequest>(node).ok())
            .map(PrEntry::from)
            .collect();
        Self {
            entries,
            has_more: search.page_info.has_next_page,
            next_cursor: search.page_info.end_cursor,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GqlComment {
    #[serde(default)]
    pub database_id: Option<u64>,
    #[serde(default)]
    pub author: Option<GqlActor>,
    #[serde(default)]
    pub body: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GqlCommentConnection {
    #[serde(default)]
    pub total_count: u32,
    #[serde(default = "Vec::new")]
    pub nodes: Vec<Option<GqlComment>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GqlReview {
    #[serde(default)]
    pub author: Option<GqlActor>,
    pub state: String,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GqlReviewRequestedEvent {
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub requested_reviewer: Option<GqlReviewer>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GqlActivity {
    pub comments: GqlCommentConnection,
    #[serde(default)]
    pub review_threads: Option<GqlCount>,
    #[serde(default)]
    pub reviews: Option<GqlNodes<GqlReview>>,
    /// Timeline nodes are left untyped: the filter only asks for review
    /// requests, but any other node shape is skipped rather than fatal.
    #[serde(default)]
    pub timeline_items: Option<GqlNodes<serde_json::Value>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct GqlActivityRepo {
    pub pull_request: Option<GqlActivity>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GqlActivityData {
    pub repository: Option<GqlActivityRepo>,
}

impl From<GqlActivity> for PullActivity {
    fn from(pr: GqlActivity) -> Self {
        let latest_comment = pr
            .comments
            .nodes
            .into_iter()
            .flatten()
            .next_back()
            .and_then(|c| {
                Some(ActivityComment {
                    id: c.database_id?.to_string(),
                    author: c.author.map(|a| a.login).unwrap_or_default(),
                    body: c.body,
                })
            });

        let reviews = pr
            .reviews
            .map(|r| r.nodes)
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .filter_map(|r| {
                Some(ReviewRecord {
                    author: r.author?.login,
                    state: ReviewState::parse(&r.state)?,
                    submitted_at: r.submitted_at,
                })
            })
            .collect();

        let review_requests = pr
            .timeline_items
            .map(|t| t.nodes)
            .unwrap_or_default()
            .into_iter()
            .flatten()
            .filter_map(|node| serde_json::from_value::<GqlReviewRequestedEvent>(node).ok())
            .filter_map(|event| {
                Some(ReviewRequestEvent {
                    reviewer: event.requested_reviewer?.into_reviewer()?,
                    created_at: event.created_at,
                })
            })
            .collect();

        Self {
            comment_count: pr.comments.total_count,
            review_thread_count: pr.review_threads.map(|t| t.total_count).unwrap_or(0),
            latest_comment,
            reviews,
            review_requests,
        }
    }
}

// ── REST wire types ──────────────────────────────────────

#[derive(Debug, Deserialize)]
pub(crate) struct RestUser {
    pub login: String,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RestTeam {
    pub slug: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RestPull {
    pub number: u64,
    pub title: String,
    pub html_url: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub merged: bool,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub user: Option<RestUser>,
    #[serde(default)]
    pub requested_reviewers: Vec<RestUser>,
    #[serde(default)]
    pub requested_teams: Vec<RestTeam>,
    #[serde(default)]
    pub assignees: Vec<RestUser>,
}

impl RestPull {
    /// Normalize a REST listing row. The plain listing carries no merge-queue,
    /// comment-count, or review-decision data: queue state is left unknown and
    /// the rest take defaults.
    pub fn into_entry(self, repo: &str) -> PrEntry {
        PrEntry {
            id: PrId::new(repo, self.number),
            title: self.title,
            url: self.html_url,
            created_at: self.created_at,
            updated_at: self.updated_at,
            draft: self.draft,
            in_merge_queue: None,
            author: self.user.map(|u| Actor {
                login: u.login,
                avatar_url: u.avatar_url,
            }),
            comment_count: 0,
            review_decision: ReviewDecision::None,
            requested_users: self.requested_reviewers.into_iter().map(|u| u.login).collect(),
            requested_teams: self.requested_teams.into_iter().map(|t| t.slug).collect(),
            assignees: self.assignees.into_iter().map(|u| u.login).collect(),
            viewer_reacted: false,
        }
    }

    pub fn into_detail(self, repo: &str) -> PullDetail {
        PullDetail {
            id: PrId::new(repo, self.number),
            title: self.title,
            url: self.html_url,
            state: self.state,
            merged: self.merged,
            merged_at: self.merged_at,
        }
    }
}
