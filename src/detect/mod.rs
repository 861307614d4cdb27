//! Event detector: diffs two snapshots into typed PR events.
//!
//! There is no per-PR state object. Every transition is read off the
//! field-level difference between the previous run's snapshot and this run's:
//!
//! - identity appears                 → new PR (or the specific request/assignment)
//! - assignment flag false → true     → newly requested / assigned
//! - review-request time advances     → re-requested
//! - merge-queue membership changes   → entered / left merge queue
//! - identity disappears + verified   → merged
//! - latest comment id changes        → new comment
//! - my review approved → dismissed   → approval dismissed
//! - joins the mentioned listing      → newly mentioned
//!
//! [`diff`] is pure. Disappearances are only candidates; [`verify_merges`]
//! asks the source of truth before a "merged" event exists. [`admit`] then
//! runs every event through the ledger so a replayed occurrence is dropped.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::config::NotifyConfig;
use crate::github::GithubApi;
use crate::ledger::{Discriminator, Ledger, event_key};
use crate::pool;
use crate::snapshot::{
    AssignmentFlag, LatestComment, PrId, PullRequestRecord, ReviewState, Snapshot,
};

/// What kind of transition an event is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NewPr,
    /// A specific assignment or review-request flag turned on.
    Flag(AssignmentFlag),
    ReRequested,
    EnteredQueue,
    LeftQueue,
    Merged,
    NewComment,
    ApprovalDismissed,
    Mentioned,
}

impl EventKind {
    /// Prefix of the ledger key and notification group.
    pub fn slug(&self) -> &'static str {
        match self {
            Self::NewPr => "new",
            Self::Flag(AssignmentFlag::RequestedToMe) => "requested-me",
            Self::Flag(AssignmentFlag::RequestedToTeam) => "requested-team",
            Self::Flag(AssignmentFlag::AssignedToMe) => "assigned-me",
            Self::Flag(AssignmentFlag::AssignedToTeam) => "assigned-team",
            Self::ReRequested => "rerequested",
            Self::EnteredQueue => "queued",
            Self::LeftQueue => "dequeued",
            Self::Merged => "merged",
            Self::NewComment => "comment",
            Self::ApprovalDismissed => "dismissed",
            Self::Mentioned => "mentioned",
        }
    }

    /// Headline shown as the notification title.
    pub fn headline(&self) -> &'static str {
        match self {
            Self::NewPr => "New pull request",
            Self::Flag(AssignmentFlag::RequestedToMe) => "Review requested",
            Self::Flag(AssignmentFlag::RequestedToTeam) => "Team review requested",
            Self::Flag(AssignmentFlag::AssignedToMe) => "Assigned to you",
            Self::Flag(AssignmentFlag::AssignedToTeam) => "Assigned to your team",
            Self::ReRequested => "Review re-requested",
            Self::EnteredQueue => "Entered merge queue",
            Self::LeftQueue => "Left merge queue",
            Self::Merged => "Merged",
            Self::NewComment => "New comment",
            Self::ApprovalDismissed => "Approval dismissed",
            Self::Mentioned => "You were mentioned",
        }
    }

    /// The kind whose ledger entry is cleared when this one is admitted, so a
    /// PR that leaves and re-enters the queue is announced again.
    fn resets(&self) -> Option<EventKind> {
        match self {
            Self::EnteredQueue => Some(Self::LeftQueue),
            Self::LeftQueue => Some(Self::EnteredQueue),
            _ => None,
        }
    }
}

/// A detected transition on one PR.
#[derive(Debug, Clone, PartialEq)]
pub enum PrEvent {
    NewPr {
        row: PullRequestRecord,
    },
    Flag {
        row: PullRequestRecord,
        flag: AssignmentFlag,
    },
    ReRequested {
        row: PullRequestRecord,
        requested_at: DateTime<Utc>,
    },
    EnteredQueue {
        row: PullRequestRecord,
    },
    LeftQueue {
        row: PullRequestRecord,
    },
    Merged {
        row: PullRequestRecord,
        merged_at: DateTime<Utc>,
    },
    NewComment {
        row: PullRequestRecord,
        comment: LatestComment,
    },
    ApprovalDismissed {
        row: PullRequestRecord,
        at: DateTime<Utc>,
    },
    Mentioned {
        row: PullRequestRecord,
    },
}

impl PrEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::NewPr { .. } => EventKind::NewPr,
            Self::Flag { flag, .. } => EventKind::Flag(*flag),
            Self::ReRequested { .. } => EventKind::ReRequested,
            Self::EnteredQueue { .. } => EventKind::EnteredQueue,
            Self::LeftQueue { .. } => EventKind::LeftQueue,
            Self::Merged { .. } => EventKind::Merged,
            Self::NewComment { .. } => EventKind::NewComment,
            Self::ApprovalDismissed { .. } => EventKind::ApprovalDismissed,
            Self::Mentioned { .. } => EventKind::Mentioned,
        }
    }

    pub fn row(&self) -> &PullRequestRecord {
        match self {
            Self::NewPr { row }
            | Self::Flag { row, .. }
            | Self::ReRequested { row, .. }
            | Self::EnteredQueue { row }
            | Self::LeftQueue { row }
            | Self::Merged { row, .. }
            | Self::NewComment { row, .. }
            | Self::ApprovalDismissed { row, .. }
            | Self::Mentioned { row } => row,
        }
    }

    pub fn id(&self) -> &PrId {
        &self.row().id
    }

    /// Ledger key, also used as the notification group.
    pub fn key(&self) -> String {
        event_key(self.kind().slug(), self.id())
    }

    /// Which occurrence this is.
    pub fn discriminator(&self) -> Discriminator {
        let row = self.row();
        match self {
            Self::NewPr { .. } => {
                Discriminator::Timestamp(row.created_at.unwrap_or(row.updated_at))
            }
            Self::Flag { flag, .. } => {
                let at = if flag.is_request() {
                    row.review_requested_at.unwrap_or(row.updated_at)
                } else {
                    row.updated_at
                };
                Discriminator::Timestamp(at)
            }
            Self::ReRequested { requested_at, .. } => Discriminator::Timestamp(*requested_at),
            Self::EnteredQueue { .. } | Self::LeftQueue { .. } | Self::Mentioned { .. } => {
                Discriminator::marker()
            }
            Self::Merged { merged_at, .. } => Discriminator::Timestamp(*merged_at),
            Self::NewComment { comment, .. } => Discriminator::Id(comment.id.clone()),
            Self::ApprovalDismissed { at, .. } => Discriminator::Timestamp(*at),
        }
    }

    /// Notification title.
    pub fn title(&self) -> String {
        match self {
            Self::NewComment { comment, .. } if !comment.author.is_empty() => {
                format!("New comment from {}", comment.author)
            }
            _ => self.kind().headline().to_string(),
        }
    }

    /// Notification subtitle: the PR reference.
    pub fn subtitle(&self) -> String {
        self.id().to_string()
    }

    /// Notification body.
    pub fn body(&self) -> String {
        let row = self.row();
        match self {
            Self::NewComment { comment, .. } if !comment.snippet.is_empty() => {
                format!("{}: {}", row.title, comment.snippet)
            }
            Self::NewPr { .. } if !row.author.is_empty() => {
                format!("{} by {}", row.title, row.author)
            }
            _ => row.title.clone(),
        }
    }

    pub fn url(&self) -> &str {
        &self.row().url
    }

    /// One-line summary for logs.
    pub fn summary_line(&self) -> String {
        format!("{} {} ({})", self.kind().slug(), self.id(), self.row().title)
    }
}

/// Everything [`diff`] compares.
#[derive(Debug, Clone, Copy)]
pub struct DiffInput<'a> {
    pub previous: &'a Snapshot,
    pub current: &'a Snapshot,
    /// Last run's mentioned set; `None` when it was never recorded.
    pub previous_mentioned: Option<&'a BTreeSet<PrId>>,
    /// This run's mentioned set; `None` when the listing failed.
    pub current_mentioned: Option<&'a BTreeSet<PrId>>,
    /// PRs that were in the merge queue last run.
    pub previous_queue: &'a BTreeSet<PrId>,
    /// PRs listed only by sections completing for the first time. Their
    /// absence from the previous snapshot says nothing, so they are not new.
    pub baseline: &'a BTreeSet<PrId>,
    pub viewer: &'a str,
}

/// Result of a pure diff.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    pub events: Vec<PrEvent>,
    /// Present last run, absent now. Merge candidates, never events by themselves.
    pub vanished: Vec<PrId>,
}

/// Row for an event: current, else previous, else a synthesized stand-in.
pub fn row_for(id: &PrId, current: &Snapshot, previous: &Snapshot) -> PullRequestRecord {
    current
        .get(id)
        .or_else(|| previous.get(id))
        .cloned()
        .unwrap_or_else(|| PullRequestRecord::synthesized(id.clone(), Utc::now()))
}

fn is_viewer(viewer: &str, login: &str) -> bool {
    !viewer.is_empty() && login.eq_ignore_ascii_case(viewer)
}

/// Compare two snapshots and list every transition, in snapshot order.
pub fn diff(input: DiffInput<'_>) -> Diff {
    let DiffInput {
        previous,
        current,
        viewer,
        ..
    } = input;
    let mut out = Diff::default();

    for cur in current.records() {
        match previous.get(&cur.id) {
            None if input.baseline.contains(&cur.id) => {
                tracing::debug!(target: "detect", "{} recorded as baseline", cur.id);
            }
            None => new_pr_events(cur, viewer, &mut out.events),
            Some(prev) => changed_pr_events(prev, cur, input, &mut out.events),
        }
    }

    out.vanished = previous
        .ids()
        .filter(|id| !current.contains(id))
        .cloned()
        .collect();

    if let (Some(before), Some(now)) = (input.previous_mentioned, input.current_mentioned) {
        for id in now.difference(before) {
            out.events.push(PrEvent::Mentioned {
                row: row_for(id, current, previous),
            });
        }
    }

    out
}

fn new_pr_events(cur: &PullRequestRecord, viewer: &str, events: &mut Vec<PrEvent>) {
    if is_viewer(viewer, &cur.author) {
        return;
    }
    let flagged: Vec<AssignmentFlag> = AssignmentFlag::ALL
        .into_iter()
        .filter(|f| cur.flags.get(*f))
        .collect();
    if flagged.is_empty() {
        events.push(PrEvent::NewPr { row: cur.clone() });
        return;
    }
    for flag in flagged {
        events.push(PrEvent::Flag {
            row: cur.clone(),
            flag,
        });
    }
}

fn changed_pr_events(
    prev: &PullRequestRecord,
    cur: &PullRequestRecord,
    input: DiffInput<'_>,
    events: &mut Vec<PrEvent>,
) {
    // 1. Flags that turned on. A request on a PR that was requested before
    //    is a re-request.
    let mut rerequested = false;
    for flag in AssignmentFlag::ALL {
        if prev.flags.get(flag) || !cur.flags.get(flag) {
            continue;
        }
        if flag.is_request() && prev.review_requested_at.is_some() {
            if !rerequested {
                rerequested = true;
                events.push(PrEvent::ReRequested {
                    row: cur.clone(),
                    requested_at: cur.review_requested_at.unwrap_or(cur.updated_at),
                });
            }
            continue;
        }
        events.push(PrEvent::Flag {
            row: cur.clone(),
            flag,
        });
    }

    // 2. A newer request while the request was already pending.
    if !rerequested
        && let (Some(before), Some(now)) = (prev.review_requested_at, cur.review_requested_at)
        && now > before
    {
        events.push(PrEvent::ReRequested {
            row: cur.clone(),
            requested_at: now,
        });
    }

    // 3. Merge queue membership.
    let was_queued = input.previous_queue.contains(&cur.id) || prev.in_merge_queue;
    if cur.in_merge_queue && !was_queued {
        events.push(PrEvent::EnteredQueue { row: cur.clone() });
    } else if !cur.in_merge_queue && was_queued {
        events.push(PrEvent::LeftQueue { row: cur.clone() });
    }

    // 4. Latest comment, unless it is the viewer's own. A previous row that
    //    was never enriched has no comment to compare against.
    if !prev.enrichment_pending
        && let Some(comment) = &cur.latest_comment
        && prev.latest_comment.as_ref().map(|c| &c.id) != Some(&comment.id)
        && !is_viewer(input.viewer, &comment.author)
    {
        events.push(PrEvent::NewComment {
            row: cur.clone(),
            comment: comment.clone(),
        });
    }

    // 5. My approval dismissed.
    if let (Some(before), Some(now)) = (&prev.my_review, &cur.my_review)
        && before.state == ReviewState::Approved
        && now.state == ReviewState::Dismissed
    {
        events.push(PrEvent::ApprovalDismissed {
            row: cur.clone(),
            at: now.submitted_at.unwrap_or(cur.updated_at),
        });
    }
}

/// Confirm which vanished PRs were actually merged.
///
/// Anything the lookup cannot confirm (closed unmerged, no merge time, lookup
/// failed) produces no event.
pub async fn verify_merges(
    api: Arc<dyn GithubApi>,
    vanished: &[PrId],
    current: &Snapshot,
    previous: &Snapshot,
    workers: usize,
) -> Vec<PrEvent> {
    let jobs: Vec<PullRequestRecord> = vanished
        .iter()
        .map(|id| row_for(id, current, previous))
        .collect();

    let checked = pool::bounded(jobs, workers, move |row| {
        let api = Arc::clone(&api);
        async move {
            let result = api.pull_detail(&row.id.repo, row.id.number).await;
            (row, result)
        }
    })
    .await;

    let mut events = Vec::new();
    for (mut row, result) in checked {
        match result {
            Ok(detail) if detail.merged => match detail.merged_at {
                Some(merged_at) => {
                    if !detail.title.is_empty() {
                        row.title = detail.title;
                    }
                    if !detail.url.is_empty() {
                        row.url = detail.url;
                    }
                    events.push(PrEvent::Merged { row, merged_at });
                }
                None => tracing::debug!(
                    target: "detect",
                    "{} reports merged without a merge time; skipping",
                    row.id
                ),
            },
            Ok(detail) => tracing::debug!(
                target: "detect",
                "{} left the listings ({}), not merged",
                row.id,
                detail.state
            ),
            Err(e) => tracing::warn!(
                target: "detect",
                "could not verify {}; not announcing: {e}",
                row.id
            ),
        }
    }
    events
}

/// Drop disabled kinds and already-notified occurrences, recording the rest.
///
/// Disabled kinds never touch the ledger. Admitted events are recorded before
/// they are returned, so a crash after this point loses a notification rather
/// than repeating one.
pub fn admit(events: Vec<PrEvent>, ledger: &mut Ledger, notify: &NotifyConfig) -> Vec<PrEvent> {
    let mut fresh = Vec::new();
    for event in events {
        let kind = event.kind();
        if !notify.allows(kind) {
            tracing::debug!(target: "detect", "{} disabled", event.summary_line());
            continue;
        }
        let key = event.key();
        if !ledger.admit(&key, event.discriminator()) {
            tracing::debug!(target: "detect", "{} already notified", event.summary_line());
            continue;
        }
        if let Some(other) = kind.resets() {
            ledger.remove(&event_key(other.slug(), event.id()));
        }
        tracing::info!(target: "detect", "{}", event.summary_line());
        fresh.push(event);
    }
    fresh
}
