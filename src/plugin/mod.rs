//! One plugin run, start to finish.
//!
//! The host invokes prbar on a schedule; each invocation is a single
//! run-to-completion:
//!
//! 1. Resolve who the viewer is.
//! 2. Build the snapshot (fetch + enrich every section).
//! 3. Render the menu.
//! 4. Diff against the previous snapshot, verify merges, filter through the
//!    ledger. Skipped on the first run, which only primes state.
//! 5. Persist snapshot, ledger, mentioned set, merge-queue set and the
//!    sections still waiting to prime.
//! 6. Deliver notifications.
//!
//! A section that does not complete on the priming run stays unprimed. The
//! first time it completes later, the PRs only it lists become the baseline
//! instead of "new PR" events.
//!
//! Events are recorded before they are delivered, so a crash between the two
//! loses a notification instead of repeating it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use color_eyre::eyre::{Result, WrapErr};

use crate::avatar::AvatarCache;
use crate::config::Config;
use crate::detect::{self, DiffInput, PrEvent};
use crate::enrich::EnrichmentCache;
use crate::fetch::Fetcher;
use crate::github::GithubApi;
use crate::ledger::Ledger;
use crate::notify::{Notification, Notifier};
use crate::render::{self, MenuInput};
use crate::snapshot::builder::{BuildOutput, Identity, SnapshotBuilder, plan_sections};
use crate::fetch::FetchStatus;
use crate::snapshot::{PrId, SectionKind, Snapshot};
use crate::state::{self, StateLayout};

/// Everything a run needs, passed explicitly.
pub struct RunContext {
    pub config: Config,
    pub layout: StateLayout,
    pub api: Arc<dyn GithubApi>,
    /// `None` detects and records events without delivering them.
    pub notifier: Option<Arc<dyn Notifier>>,
    /// `None` renders without images.
    pub avatars: Option<Arc<AvatarCache>>,
}

/// What a run did.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Menu text for stdout.
    pub menu: String,
    /// No previous snapshot existed; state was seeded and nothing was sent.
    pub primed: bool,
    /// Events that passed the ledger.
    pub events: Vec<PrEvent>,
    /// Notifications handed to the sink.
    pub delivered: usize,
    pub failed_sections: Vec<SectionKind>,
    /// Sections that have not completed since state was seeded.
    pub unprimed: Vec<SectionKind>,
    pub snapshot_size: usize,
    pub ledger_removed: usize,
    /// Enrichment cache misses this run.
    pub enrich_fetches: usize,
}

impl RunContext {
    /// Execute one run.
    pub async fn run_once(&self) -> Result<RunReport> {
        self.layout.ensure()?;
        let now = Utc::now();

        // 1. Identity.
        let identity = self.resolve_identity().await?;
        tracing::debug!(target: "plugin", "running as {}", identity.viewer);

        // 2. Build.
        let previous = match Snapshot::load(&self.layout.snapshot()) {
            Ok(previous) => previous,
            Err(e) => {
                tracing::warn!(target: "plugin", "previous snapshot unreadable, priming: {e}");
                None
            }
        };

        let policy = self.config.limits.fetch_policy();
        let workers = policy.workers;
        let fetcher = Fetcher::new(Arc::clone(&self.api), policy);
        let cache = Arc::new(EnrichmentCache::new(
            Arc::clone(&self.api),
            self.layout.enrich_dir(),
            identity.audience(),
        ));
        let viewer = identity.viewer.clone();
        let builder = SnapshotBuilder::new(
            Arc::clone(&self.api),
            fetcher,
            Arc::clone(&cache),
            identity,
            self.config.repos.clone(),
        );
        let plans = plan_sections(&self.config);
        let build = builder.build(&plans, previous.as_ref()).await;
        let failed_sections: Vec<SectionKind> = build.failed_sections().collect();

        // 3. Render.
        let avatars = self.load_avatars(&build, workers).await;
        let menu = render::render(&MenuInput {
            build: &build,
            display: &self.config.display,
            avatars: &avatars,
            viewer: &viewer,
            now,
        });

        // 4. Detect.
        let mut ledger = match Ledger::load(&self.layout.ledger()) {
            Ok(ledger) => ledger,
            Err(e) => {
                tracing::warn!(target: "plugin", "ledger unreadable, starting empty: {e}");
                Ledger::new()
            }
        };

        let primed = previous.is_none();
        let (unprimed, baseline) = self.priming_state(primed, &build);
        let events = match &previous {
            Some(previous) => {
                self.detect(previous, &build, &baseline, &mut ledger, &viewer, workers)
                    .await
            }
            None => {
                tracing::info!(
                    target: "plugin",
                    "no previous snapshot; priming with {} PR(s), notifications skipped",
                    build.snapshot.len()
                );
                Vec::new()
            }
        };

        let mut live: BTreeSet<PrId> = build.snapshot.ids().cloned().collect();
        if let Some(previous) = &previous {
            live.extend(previous.ids().cloned());
        }
        let ledger_removed = ledger.gc(&live);

        // 5. Persist.
        self.persist(&build, &ledger, &unprimed)?;

        // 6. Deliver.
        let delivered = self.deliver(&events).await;

        Ok(RunReport {
            menu,
            primed,
            events,
            delivered,
            failed_sections,
            unprimed: unprimed.into_iter().collect(),
            snapshot_size: build.snapshot.len(),
            ledger_removed,
            enrich_fetches: cache.fetch_count(),
        })
    }

    async fn resolve_identity(&self) -> Result<Identity> {
        let viewer = match self.config.viewer.as_deref().map(str::trim) {
            Some(login) if !login.is_empty() => login.to_string(),
            _ => self
                .api
                .viewer_login()
                .await
                .wrap_err("could not determine the authenticated GitHub user")?,
        };

        let review_team = self.config.teams.review_team();
        let mut review_members = BTreeSet::new();
        if let Some(team) = &review_team {
            match self.api.team_members(&team.org, &team.slug).await {
                Ok(members) => {
                    review_members = members.iter().map(|m| m.to_ascii_lowercase()).collect();
                }
                Err(e) => {
                    tracing::warn!(target: "plugin", "could not list members of {team}: {e}")
                }
            }
        }

        Ok(Identity {
            viewer,
            review_team,
            review_members,
        })
    }

    async fn load_avatars(&self, build: &BuildOutput, workers: usize) -> HashMap<String, String> {
        let Some(cache) = &self.avatars else {
            return HashMap::new();
        };
        if !self.config.display.avatars {
            return HashMap::new();
        }

        let mut authors: HashMap<String, String> = HashMap::new();
        for record in build.snapshot.records() {
            if let Some(url) = &record.author_avatar
                && !record.author.is_empty()
            {
                authors
                    .entry(record.author.clone())
                    .or_insert_with(|| url.clone());
            }
        }
        let mut authors: Vec<(String, String)> = authors.into_iter().collect();
        authors.sort();
        Arc::clone(cache).get_many(authors, workers).await
    }

    /// Sections still waiting to prime after this run, and the PRs that
    /// sections completing for the first time contribute as baseline.
    fn priming_state(
        &self,
        primed: bool,
        build: &BuildOutput,
    ) -> (BTreeSet<SectionKind>, BTreeSet<PrId>) {
        let incomplete: BTreeSet<SectionKind> = build
            .sections
            .iter()
            .filter(|s| s.status != FetchStatus::Complete)
            .map(|s| s.kind)
            .collect();

        if primed {
            if !incomplete.is_empty() {
                tracing::warn!(
                    target: "plugin",
                    "{} section(s) incomplete on the first run; their PRs will be baseline once they load",
                    incomplete.len()
                );
            }
            return (incomplete, BTreeSet::new());
        }

        let waiting = match state::load_section_set(&self.layout.unprimed()) {
            Ok(set) => set,
            Err(e) => {
                tracing::warn!(target: "plugin", "ignoring unreadable unprimed set: {e}");
                BTreeSet::new()
            }
        };
        if waiting.is_empty() {
            return (waiting, BTreeSet::new());
        }

        // Any rows a waiting section produced this run are baseline, even
        // from a partial listing.
        let quiet: BTreeSet<SectionKind> = build
            .sections
            .iter()
            .filter(|s| waiting.contains(&s.kind) && !s.failed())
            .map(|s| s.kind)
            .collect();
        let baseline: BTreeSet<PrId> = build
            .sections
            .iter()
            .filter(|s| quiet.contains(&s.kind))
            .flat_map(|s| s.ids.iter())
            .filter(|id| {
                build
                    .decorations
                    .membership
                    .get(*id)
                    .is_none_or(|kinds| kinds.is_subset(&quiet))
            })
            .cloned()
            .collect();

        let still_waiting: BTreeSet<SectionKind> = build
            .sections
            .iter()
            .filter(|s| waiting.contains(&s.kind) && incomplete.contains(&s.kind))
            .map(|s| s.kind)
            .collect();
        for kind in quiet.difference(&still_waiting) {
            tracing::info!(target: "plugin", "section {kind} primed");
        }
        if !baseline.is_empty() {
            tracing::info!(
                target: "plugin",
                "{} PR(s) from newly loaded sections recorded without notifying",
                baseline.len()
            );
        }
        (still_waiting, baseline)
    }

    async fn detect(
        &self,
        previous: &Snapshot,
        build: &BuildOutput,
        baseline: &BTreeSet<PrId>,
        ledger: &mut Ledger,
        viewer: &str,
        workers: usize,
    ) -> Vec<PrEvent> {
        let previous_mentioned = load_set(&self.layout.mentioned());
        let previous_queue = load_set(&self.layout.merge_queue()).unwrap_or_else(|| {
            previous
                .records()
                .filter(|r| r.in_merge_queue)
                .map(|r| r.id.clone())
                .collect()
        });

        let diff = detect::diff(DiffInput {
            previous,
            current: &build.snapshot,
            previous_mentioned: previous_mentioned.as_ref(),
            current_mentioned: build.mentioned.as_ref(),
            previous_queue: &previous_queue,
            baseline,
            viewer,
        });

        let mut events = diff.events;
        if !diff.vanished.is_empty() && self.config.notify.merged {
            tracing::debug!(
                target: "plugin",
                "verifying {} PR(s) that left the listings",
                diff.vanished.len()
            );
            events.extend(
                detect::verify_merges(
                    Arc::clone(&self.api),
                    &diff.vanished,
                    &build.snapshot,
                    previous,
                    workers,
                )
                .await,
            );
        }

        detect::admit(events, ledger, &self.config.notify)
    }

    fn persist(
        &self,
        build: &BuildOutput,
        ledger: &Ledger,
        unprimed: &BTreeSet<SectionKind>,
    ) -> Result<()> {
        build.snapshot.save(&self.layout.snapshot())?;
        ledger.save(&self.layout.ledger())?;
        if let Some(mentioned) = &build.mentioned {
            state::save_id_set(&self.layout.mentioned(), mentioned)?;
        }
        let queued: Vec<&PrId> = build
            .snapshot
            .records()
            .filter(|r| r.in_merge_queue)
            .map(|r| &r.id)
            .collect();
        state::save_id_set(&self.layout.merge_queue(), queued)?;
        state::save_section_set(&self.layout.unprimed(), unprimed)?;
        Ok(())
    }

    async fn deliver(&self, events: &[PrEvent]) -> usize {
        let Some(notifier) = &self.notifier else {
            return 0;
        };
        if !self.config.notify.enabled {
            return 0;
        }
        for event in events {
            notifier.notify(&Notification::from_event(event)).await;
        }
        if !events.is_empty() {
            tracing::info!(
                target: "notify",
                "sent {} notification(s) via {}",
                events.len(),
                notifier.name()
            );
        }
        events.len()
    }
}

fn load_set(path: &std::path::Path) -> Option<BTreeSet<PrId>> {
    match state::load_id_set(path) {
        Ok(set) => set,
        Err(e) => {
            tracing::warn!(target: "plugin", "ignoring unreadable {}: {e}", path.display());
            None
        }
    }
}

/// Last-modified time of the snapshot, for the `ledger` command's header.
pub fn snapshot_time(layout: &StateLayout) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(layout.snapshot()).and_then(|m| m.modified()).ok()?;
    Some(DateTime::<Utc>::from(modified))
}
