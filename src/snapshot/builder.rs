//! Snapshot builder: merges every section's listing into one snapshot.
//!
//! Sections run in declared order. For each one:
//!
//! 1. Fetch its listing (single-shot, full, per-author fan-out, or the
//!    all-open listing with its per-repo fallback).
//! 2. Record decoration facts for *every* entry, including PRs an earlier
//!    section already owns.
//! 3. Enrich the PRs this section is first to see, bounded-parallel, and
//!    collate the results back into input order.
//! 4. Sort by the section's sort key and append to the snapshot.
//!
//! A section that failed or came back partial carries forward the previous
//! snapshot's rows it owned, so an outage never reads as "these PRs vanished".
//! Carried rows are added after every section has run, so fresh data from a
//! later section always wins.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use crate::config::{Config, TeamRef};
use crate::enrich::{Audience, Enrichment, EnrichmentCache};
use crate::fetch::{FetchOutcome, FetchStatus, Fetcher, Pagination};
use crate::github::GithubApi;
use crate::github::query::{search_filter, search_web_url};
use crate::github::types::PrEntry;
use crate::pool;

use super::{AssignmentFlags, PrId, PullRequestRecord, SectionKind, Snapshot, SortKey};

/// Who the viewer is, for computing assignment flags.
#[derive(Debug, Clone, Default)]
pub struct Identity {
    pub viewer: String,
    pub review_team: Option<TeamRef>,
    /// Lowercased logins of the review team's members.
    pub review_members: BTreeSet<String>,
}

impl Identity {
    fn is_viewer(&self, login: &str) -> bool {
        !self.viewer.is_empty() && login.eq_ignore_ascii_case(&self.viewer)
    }

    fn is_teammate(&self, login: &str) -> bool {
        !self.is_viewer(login) && self.review_members.contains(&login.to_ascii_lowercase())
    }

    /// Flags derived from the entry's own request and assignee lists.
    pub fn flags_for(&self, entry: &PrEntry) -> AssignmentFlags {
        let team_slug = self.review_team.as_ref().map(|t| t.slug.as_str());
        AssignmentFlags {
            assigned_to_me: entry.assignees.iter().any(|a| self.is_viewer(a)),
            assigned_to_team: entry.assignees.iter().any(|a| self.is_teammate(a)),
            requested_to_me: entry.requested_users.iter().any(|u| self.is_viewer(u)),
            requested_to_team: team_slug.is_some_and(|slug| {
                entry
                    .requested_teams
                    .iter()
                    .any(|t| t.eq_ignore_ascii_case(slug))
            }),
        }
    }

    /// Audience for enrichment: the viewer plus the review team's slug.
    pub fn audience(&self) -> Audience {
        Audience {
            viewer: self.viewer.clone(),
            team_slugs: self.review_team.iter().map(|t| t.slug.clone()).collect(),
        }
    }
}

/// Where a section's entries come from.
#[derive(Debug, Clone)]
pub enum SectionSource {
    Search { qualifier: String },
    TeamAuthors { team: TeamRef },
    AllOpen,
}

/// One section to build.
#[derive(Debug, Clone)]
pub struct SectionPlan {
    pub kind: SectionKind,
    pub source: SectionSource,
}

/// Turn the config into the ordered list of sections to build.
///
/// Disabled sections are left out; team sections are skipped when their team
/// is unset; "all open" needs a repo allowlist.
pub fn plan_sections(config: &Config) -> Vec<SectionPlan> {
    let mut plans = Vec::new();
    for kind in SectionKind::ALL {
        if !config.sections.enabled(kind) {
            continue;
        }
        let source = match kind {
            SectionKind::ReviewRequested => search("review-requested:@me"),
            SectionKind::TeamQueue => match config.teams.review_team() {
                Some(team) => search(&format!("team-review-requested:{team}")),
                None => continue,
            },
            SectionKind::Assigned => search("assignee:@me"),
            SectionKind::Mentioned => search("mentions:@me"),
            SectionKind::TeamAuthors => match config.teams.authors_team() {
                Some(team) => SectionSource::TeamAuthors { team },
                None => continue,
            },
            SectionKind::Mine => search("author:@me"),
            SectionKind::Participated => search("involves:@me"),
            SectionKind::AllOpen if config.repos.is_empty() => continue,
            SectionKind::AllOpen => SectionSource::AllOpen,
        };
        plans.push(SectionPlan { kind, source });
    }
    plans
}

fn search(qualifier: &str) -> SectionSource {
    SectionSource::Search {
        qualifier: qualifier.to_string(),
    }
}

/// What one section contributed.
#[derive(Debug, Clone)]
pub struct SectionResult {
    pub kind: SectionKind,
    pub status: FetchStatus,
    /// PRs this section owns, in display order.
    pub ids: Vec<PrId>,
    /// Web search link for the section header.
    pub search_url: String,
    /// Rows carried forward from the previous snapshot.
    pub carried: usize,
}

impl SectionResult {
    pub fn failed(&self) -> bool {
        self.status == FetchStatus::Failed
    }
}

/// Facts recorded for every PR a section saw, owned or not.
#[derive(Debug, Clone, Default)]
pub struct Decorations {
    pub team_requested: BTreeSet<PrId>,
    pub mentioned: BTreeSet<PrId>,
    pub reacted: BTreeSet<PrId>,
    pub membership: BTreeMap<PrId, BTreeSet<SectionKind>>,
}

impl Decorations {
    fn record(&mut self, kind: SectionKind, entry: &PrEntry, flags: &AssignmentFlags) {
        let id = &entry.id;
        self.membership.entry(id.clone()).or_default().insert(kind);
        if flags.requested_to_team || kind == SectionKind::TeamQueue {
            self.team_requested.insert(id.clone());
        }
        if kind == SectionKind::Mentioned {
            self.mentioned.insert(id.clone());
        }
        if entry.viewer_reacted {
            self.reacted.insert(id.clone());
        }
    }

    pub fn in_section(&self, id: &PrId, kind: SectionKind) -> bool {
        self.membership.get(id).is_some_and(|s| s.contains(&kind))
    }
}

/// Everything one build produced.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub snapshot: Snapshot,
    pub sections: Vec<SectionResult>,
    pub decorations: Decorations,
    /// The fresh mentioned set, only when the mentioned listing succeeded.
    pub mentioned: Option<BTreeSet<PrId>>,
}

impl BuildOutput {
    pub fn failed_sections(&self) -> impl Iterator<Item = SectionKind> + '_ {
        self.sections.iter().filter(|s| s.failed()).map(|s| s.kind)
    }
}

/// Builds one run's snapshot.
pub struct SnapshotBuilder {
    api: Arc<dyn GithubApi>,
    fetcher: Fetcher,
    cache: Arc<EnrichmentCache>,
    identity: Identity,
    repos: Vec<String>,
}

impl SnapshotBuilder {
    pub fn new(
        api: Arc<dyn GithubApi>,
        fetcher: Fetcher,
        cache: Arc<EnrichmentCache>,
        identity: Identity,
        repos: Vec<String>,
    ) -> Self {
        Self {
            api,
            fetcher,
            cache,
            identity,
            repos,
        }
    }

    pub async fn build(&self, plans: &[SectionPlan], previous: Option<&Snapshot>) -> BuildOutput {
        let mut out = BuildOutput::default();
        let mut carried: Vec<PullRequestRecord> = Vec::new();

        for plan in plans {
            let (outcome, search_url) = self.fetch_section(plan).await;
            let status = outcome.status;
            tracing::debug!(
                target: "fetch",
                "section {} -> {} entr(ies), {status:?}",
                plan.kind,
                outcome.entries.len()
            );

            // Decorations see every entry; ownership goes to the first section.
            let mut fresh: Vec<(PrEntry, AssignmentFlags)> = Vec::new();
            let mut seen_here = HashSet::new();
            for entry in outcome.entries {
                let flags = self.identity.flags_for(&entry);
                out.decorations.record(plan.kind, &entry, &flags);
                if out.snapshot.contains(&entry.id) || !seen_here.insert(entry.id.clone()) {
                    continue;
                }
                fresh.push((entry, flags));
            }

            let mut records = self.enrich_all(plan.kind, fresh, previous).await;
            sort_records(&mut records, plan.kind.sort_key());

            let mut ids = Vec::with_capacity(records.len());
            for record in records {
                ids.push(record.id.clone());
                out.snapshot.insert(record);
            }

            let mut carried_here = 0;
            if status != FetchStatus::Complete
                && let Some(previous) = previous
            {
                for row in previous.owned_by(plan.kind) {
                    if !seen_here.contains(&row.id) {
                        carried.push(row.clone());
                        carried_here += 1;
                    }
                }
                if carried_here > 0 {
                    tracing::info!(
                        target: "fetch",
                        "section {} {status:?}; carrying forward {carried_here} previous row(s)",
                        plan.kind
                    );
                }
            }

            if plan.kind == SectionKind::Mentioned && status == FetchStatus::Complete {
                out.mentioned = Some(
                    out.decorations
                        .membership
                        .iter()
                        .filter(|(_, kinds)| kinds.contains(&SectionKind::Mentioned))
                        .map(|(id, _)| id.clone())
                        .collect(),
                );
            }

            out.sections.push(SectionResult {
                kind: plan.kind,
                status,
                ids,
                search_url,
                carried: carried_here,
            });
        }

        for row in carried {
            out.snapshot.insert(row);
        }
        out
    }

    async fn fetch_section(&self, plan: &SectionPlan) -> (FetchOutcome, String) {
        match &plan.source {
            SectionSource::Search { qualifier } => {
                let filter = search_filter(&self.repos, qualifier);
                let pagination = if plan.kind.paginate_fully() {
                    Pagination::Full
                } else {
                    Pagination::SingleShot
                };
                let url = search_web_url(&filter);
                (self.fetcher.fetch(&filter, pagination).await, url)
            }
            SectionSource::TeamAuthors { team } => {
                let members = match self.api.team_members(&team.org, &team.slug).await {
                    Ok(members) => members,
                    Err(e) => {
                        tracing::warn!(target: "fetch", "could not list members of {team}: {e}");
                        let url = search_web_url(&search_filter(&self.repos, ""));
                        return (FetchOutcome::failed(), url);
                    }
                };
                let qualifiers: Vec<String> =
                    members.iter().map(|m| format!("author:{m}")).collect();
                let url = search_web_url(&search_filter(&self.repos, &qualifiers.join(" ")));
                let filters = qualifiers
                    .iter()
                    .map(|q| search_filter(&self.repos, q))
                    .collect();
                (self.fetcher.fetch_many(filters).await, url)
            }
            SectionSource::AllOpen => {
                let url = search_web_url(&search_filter(&self.repos, ""));
                (self.fetcher.fetch_all_open(&self.repos).await, url)
            }
        }
    }

    /// Enrich every entry with at most `workers` lookups in flight.
    ///
    /// When a lookup fails, the previous run's derived fields for that PR are
    /// reused so a transient outage does not look like activity next run.
    async fn enrich_all(
        &self,
        section: SectionKind,
        entries: Vec<(PrEntry, AssignmentFlags)>,
        previous: Option<&Snapshot>,
    ) -> Vec<PullRequestRecord> {
        let workers = self.fetcher.policy().workers;
        let cache = Arc::clone(&self.cache);
        let api = Arc::clone(&self.api);
        let jobs: Vec<_> = entries
            .into_iter()
            .map(|(entry, flags)| {
                let prior = previous.and_then(|p| p.get(&entry.id)).cloned();
                (entry, flags, prior)
            })
            .collect();

        pool::bounded(jobs, workers, move |(entry, flags, prior)| {
            let cache = Arc::clone(&cache);
            let api = Arc::clone(&api);
            async move {
                let fresh = cache.try_enrich(&entry.id, entry.updated_at).await;
                let derived = Derived::resolve(&entry, fresh, prior.as_ref());
                let mut entry = entry;
                if entry.title.trim().is_empty() {
                    backfill_title(api.as_ref(), &mut entry).await;
                }
                make_record(entry, flags, derived, section)
            }
        })
        .await
    }
}

/// Row fields that do not come straight from the listing.
#[derive(Debug, Clone, Default)]
struct Derived {
    enrichment: Enrichment,
    /// No successful lookup has backed `enrichment` yet.
    enrichment_pending: bool,
    in_merge_queue: bool,
}

impl Derived {
    /// Combine a fresh lookup (if any) with the PR's previous row. Facts the
    /// listing or the lookup could not supply keep their previous value.
    fn resolve(
        entry: &PrEntry,
        fresh: Option<Enrichment>,
        prior: Option<&PullRequestRecord>,
    ) -> Self {
        let (enrichment, enrichment_pending) = match (fresh, prior) {
            (Some(fresh), _) => (fresh, false),
            (None, Some(row)) => (Enrichment::from_record(row), row.enrichment_pending),
            (None, None) => (Enrichment::default(), true),
        };
        let in_merge_queue = entry
            .in_merge_queue
            .unwrap_or_else(|| prior.is_some_and(|row| row.in_merge_queue));
        Self {
            enrichment,
            enrichment_pending,
            in_merge_queue,
        }
    }
}

async fn backfill_title(api: &dyn GithubApi, entry: &mut PrEntry) {
    match api.pull_detail(&entry.id.repo, entry.id.number).await {
        Ok(detail) => {
            entry.title = detail.title;
            if entry.url.is_empty() {
                entry.url = detail.url;
            }
        }
        Err(e) => tracing::debug!(target: "fetch", "title backfill for {} failed: {e}", entry.id),
    }
}

fn make_record(
    entry: PrEntry,
    flags: AssignmentFlags,
    derived: Derived,
    section: SectionKind,
) -> PullRequestRecord {
    let Derived {
        enrichment,
        enrichment_pending,
        in_merge_queue,
    } = derived;
    let (author, author_avatar) = match entry.author {
        Some(actor) => (actor.login, actor.avatar_url),
        None => (String::new(), None),
    };
    PullRequestRecord {
        url: if entry.url.is_empty() {
            entry.id.web_url()
        } else {
            entry.url
        },
        id: entry.id,
        title: entry.title,
        author,
        author_avatar,
        created_at: entry.created_at,
        updated_at: entry.updated_at,
        draft: entry.draft,
        // Enrichment degrades to zero on failure; the listing count is a floor.
        conversation_count: enrichment.conversation_count.max(entry.comment_count),
        approval_count: enrichment.approval_count,
        in_merge_queue,
        flags,
        review_decision: entry.review_decision,
        my_review: enrichment.my_review,
        review_requested_at: enrichment.review_requested_at,
        latest_comment: enrichment.latest_comment,
        enrichment_pending,
        section,
    }
}

/// Deterministic order within a section. Ties fall back to identity.
pub fn sort_records(records: &mut [PullRequestRecord], key: SortKey) {
    match key {
        SortKey::UpdatedDesc => {
            records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)))
        }
        SortKey::CreatedAsc => records.sort_by(|a, b| {
            // Unknown creation times sort last.
            let created = |r: &PullRequestRecord| (r.created_at.is_none(), r.created_at);
            created(a).cmp(&created(b)).then_with(|| a.id.cmp(&b.id))
        }),
        SortKey::NumberDesc => records.sort_by(|a, b| {
            b.id.number
                .cmp(&a.id.number)
                .then_with(|| a.id.repo.cmp(&b.id.repo))
        }),
    }
}
