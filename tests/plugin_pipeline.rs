//! End-to-end runs of the plugin pipeline against an in-memory GitHub.
//!
//! Each test drives `RunContext::run_once` several times over one state
//! directory, changing the fake upstream between runs, and checks what was
//! notified and what was persisted.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use color_eyre::eyre::{Result, bail, eyre};
use tempfile::TempDir;

use prbar::config::Config;
use prbar::github::GithubApi;
use prbar::github::query::search_filter;
use prbar::github::types::{
    ActivityComment, Actor, PrEntry, PullActivity, PullDetail, ReviewRecord, SearchPage,
};
use prbar::ledger::{Discriminator, Ledger};
use prbar::notify::{Notification, Notifier};
use prbar::plugin::{RunContext, RunReport};
use prbar::snapshot::{PrId, ReviewDecision, ReviewState, SectionKind, Snapshot};
use prbar::state::StateLayout;

const REPO: &str = "acme/app";
const REVIEW_REQUESTED: &str = "review-requested:@me";
const PARTICIPATED: &str = "involves:@me";
const ALL_OPEN: &str = "";

fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

// ---- fakes ----

#[derive(Default)]
struct World {
    /// Listing entries by section qualifier ("" is the all-open listing).
    listings: HashMap<String, Vec<PrEntry>>,
    /// Failing search qualifiers; "rest" fails the per-repo listing.
    failing: HashSet<String>,
    activity: HashMap<PrId, PullActivity>,
    failing_activity: HashSet<PrId>,
    details: HashMap<PrId, PullDetail>,
    detail_calls: Vec<PrId>,
}

struct FakeGithub {
    world: Mutex<World>,
}

impl FakeGithub {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            world: Mutex::new(World::default()),
        })
    }

    fn list(&self, qualifier: &str, entries: Vec<PrEntry>) {
        self.world
            .lock()
            .unwrap()
            .listings
            .insert(qualifier.to_string(), entries);
    }

    fn fail(&self, qualifier: &str) {
        self.world
            .lock()
            .unwrap()
            .failing
            .insert(qualifier.to_string());
    }

    fn heal(&self, qualifier: &str) {
        self.world.lock().unwrap().failing.remove(qualifier);
    }

    fn set_activity(&self, id: PrId, activity: PullActivity) {
        self.world.lock().unwrap().activity.insert(id, activity);
    }

    fn fail_activity(&self, id: PrId) {
        self.world.lock().unwrap().failing_activity.insert(id);
    }

    fn heal_activity(&self, id: &PrId) {
        self.world.lock().unwrap().failing_activity.remove(id);
    }

    fn set_detail(&self, number: u64, merged: bool, merged_at: Option<&str>) {
        let id = PrId::new(REPO, number);
        let detail = PullDetail {
            id: id.clone(),
            title: format!("PR {number}"),
            url: id.web_url(),
            state: "closed".into(),
            merged,
            merged_at: merged_at.map(ts),
        };
        self.world.lock().unwrap().details.insert(id, detail);
    }

    fn detail_calls(&self) -> Vec<PrId> {
        self.world.lock().unwrap().detail_calls.clone()
    }

    fn qualifier(filter: &str) -> String {
        let base = search_filter(&[REPO.to_string()], "");
        filter
            .strip_prefix(&base)
            .unwrap_or(filter)
            .trim()
            .to_string()
    }
}

#[async_trait]
impl GithubApi for FakeGithub {
    async fn viewer_login(&self) -> Result<String> {
        Ok("me".into())
    }

    async fn search_page(
        &self,
        filter: &str,
        _page_size: u32,
        _cursor: Option<&str>,
    ) -> Result<SearchPage> {
        let qualifier = Self::qualifier(filter);
        let world = self.world.lock().unwrap();
        if world.failing.contains(&qualifier) {
            bail!("search for {qualifier:?} is down");
        }
        Ok(SearchPage {
            entries: world.listings.get(&qualifier).cloned().unwrap_or_default(),
            has_more: false,
            next_cursor: None,
        })
    }

    async fn list_open_pulls(&self, _repo: &str) -> Result<Vec<PrEntry>> {
        let world = self.world.lock().unwrap();
        if world.failing.contains("rest") {
            bail!("REST listing unavailable");
        }
        // The REST listing carries no merge-queue data.
        let entries = world.listings.get(ALL_OPEN).cloned().unwrap_or_default();
        Ok(entries
            .into_iter()
            .map(|e| PrEntry {
                in_merge_queue: None,
                ..e
            })
            .collect())
    }

    async fn pull_detail(&self, repo: &str, number: u64) -> Result<PullDetail> {
        let id = PrId::new(repo, number);
        let mut world = self.world.lock().unwrap();
        world.detail_calls.push(id.clone());
        world
            .details
            .get(&id)
            .cloned()
            .ok_or_else(|| eyre!("no such PR {id}"))
    }

    async fn pull_activity(&self, repo: &str, number: u64) -> Result<PullActivity> {
        let id = PrId::new(repo, number);
        let world = self.world.lock().unwrap();
        if world.failing_activity.contains(&id) {
            bail!("activity for {id} is down");
        }
        Ok(world.activity.get(&id).cloned().unwrap_or_default())
    }

    async fn team_members(&self, _org: &str, _slug: &str) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct RecordingNotifier {
    sent: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
    fn groups(&self) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|n| n.group.clone())
            .collect()
    }

    fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    fn name(&self) -> &str {
        "recording"
    }

    async fn notify(&self, notification: &Notification) {
        self.sent.lock().unwrap().push(notification.clone());
    }
}

// ---- harness ----

fn entry(number: u64, updated: &str) -> PrEntry {
    let id = PrId::new(REPO, number);
    PrEntry {
        url: id.web_url(),
        id,
        title: format!("PR {number}"),
        created_at: Some(ts("2024-01-01T00:00:00Z")),
        updated_at: ts(updated),
        draft: false,
        in_merge_queue: Some(false),
        author: Some(Actor {
            login: "alice".into(),
            avatar_url: None,
        }),
        comment_count: 0,
        review_decision: ReviewDecision::None,
        requested_users: Vec::new(),
        requested_teams: Vec::new(),
        assignees: Vec::new(),
        viewer_reacted: false,
    }
}

fn requested(number: u64, updated: &str) -> PrEntry {
    let mut e = entry(number, updated);
    e.requested_users = vec!["me".into()];
    e
}

fn comment(id: &str, author: &str) -> PullActivity {
    PullActivity {
        comment_count: 1,
        latest_comment: Some(ActivityComment {
            id: id.into(),
            author: author.into(),
            body: "looks good".into(),
        }),
        ..PullActivity::default()
    }
}

struct Harness {
    _dir: TempDir,
    github: Arc<FakeGithub>,
    notifier: Arc<RecordingNotifier>,
    ctx: RunContext,
}

impl Harness {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let github = FakeGithub::new();
        let notifier = Arc::new(RecordingNotifier::default());

        let mut config = Config {
            repos: vec![REPO.into()],
            viewer: Some("me".into()),
            ..Config::default()
        };
        config.display.avatars = false;
        config.limits.retry_delay_ms = 0;

        let ctx = RunContext {
            config,
            layout: StateLayout::new(dir.path()),
            api: github.clone(),
            notifier: Some(notifier.clone() as Arc<dyn Notifier>),
            avatars: None,
        };
        Self {
            _dir: dir,
            github,
            notifier,
            ctx,
        }
    }

    async fn run(&self) -> RunReport {
        self.ctx.run_once().await.unwrap()
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::load(&self.ctx.layout.snapshot())
            .unwrap()
            .expect("snapshot should be persisted")
    }

    fn ledger(&self) -> Ledger {
        Ledger::load(&self.ctx.layout.ledger()).unwrap()
    }
}

// ---- first run ----

#[tokio::test]
async fn first_run_primes_without_notifying() {
    let h = Harness::new();
    h.github.list(REVIEW_REQUESTED, vec![requested(7, "2024-01-01T00:00:00Z")]);
    h.github.list(ALL_OPEN, vec![entry(7, "2024-01-01T00:00:00Z"), entry(8, "2024-01-01T00:00:00Z")]);

    let report = h.run().await;

    assert!(report.primed);
    assert!(report.events.is_empty());
    assert!(h.notifier.groups().is_empty());

    let contents = std::fs::read_to_string(h.ctx.layout.snapshot()).unwrap();
    assert!(!contents.trim().is_empty(), "snapshot file should have rows");
    assert_eq!(h.snapshot().len(), 2);
}

#[tokio::test]
async fn section_failing_from_the_first_run_primes_when_it_loads() {
    let h = Harness::new();
    h.github.list(ALL_OPEN, vec![entry(7, "2024-01-01T00:00:00Z")]);
    h.github.fail(PARTICIPATED);

    let report = h.run().await;
    assert!(report.primed);
    assert_eq!(report.failed_sections, vec![SectionKind::Participated]);
    assert_eq!(report.unprimed, vec![SectionKind::Participated]);
    assert!(h.ctx.layout.snapshot().exists(), "priming is not held back");

    // The healthy sections notify while the broken one keeps failing.
    h.github.list(REVIEW_REQUESTED, vec![requested(8, "2024-01-02T00:00:00Z")]);
    let report = h.run().await;
    assert!(!report.primed);
    assert_eq!(report.unprimed, vec![SectionKind::Participated]);
    assert_eq!(h.notifier.groups(), vec!["requested-me/acme/app#8"]);

    // Its first successful listing is the baseline.
    h.notifier.clear();
    h.github.heal(PARTICIPATED);
    h.github.list(PARTICIPATED, vec![entry(20, "2024-01-02T00:00:00Z")]);
    let report = h.run().await;
    assert!(report.events.is_empty());
    assert!(report.unprimed.is_empty());
    assert!(h.snapshot().contains(&PrId::new(REPO, 20)));
    assert!(h.notifier.groups().is_empty());

    h.github.list(
        PARTICIPATED,
        vec![entry(20, "2024-01-02T00:00:00Z"), entry(21, "2024-01-03T00:00:00Z")],
    );
    h.run().await;
    assert_eq!(h.notifier.groups(), vec!["new/acme/app#21"]);
}

// ---- idempotence ----

#[tokio::test]
async fn unchanged_runs_are_silent_and_new_request_fires_once() {
    let h = Harness::new();
    h.github.list(REVIEW_REQUESTED, vec![requested(7, "2024-01-01T00:00:00Z")]);
    h.run().await;

    let report = h.run().await;
    assert!(!report.primed);
    assert!(report.events.is_empty());

    h.github.list(
        REVIEW_REQUESTED,
        vec![requested(7, "2024-01-01T00:00:00Z"), requested(8, "2024-01-02T00:00:00Z")],
    );
    let report = h.run().await;
    assert_eq!(report.delivered, 1);
    assert_eq!(h.notifier.groups(), vec!["requested-me/acme/app#8"]);

    h.notifier.clear();
    let report = h.run().await;
    assert!(report.events.is_empty());
    assert!(h.notifier.groups().is_empty());
}

#[tokio::test]
async fn new_comment_notifies_once_and_own_comment_is_silent() {
    let h = Harness::new();
    let id = PrId::new(REPO, 7);
    h.github.list(PARTICIPATED, vec![entry(7, "2024-01-01T00:00:00Z")]);
    h.github.set_activity(id.clone(), comment("100", "alice"));
    h.run().await;

    h.github.list(PARTICIPATED, vec![entry(7, "2024-01-02T00:00:00Z")]);
    h.github.set_activity(id.clone(), comment("101", "carol"));
    h.run().await;
    assert_eq!(h.notifier.groups(), vec!["comment/acme/app#7"]);
    assert_eq!(
        h.ledger().get("comment/acme/app#7"),
        Some(&Discriminator::Id("101".into()))
    );

    h.notifier.clear();
    h.run().await;
    assert!(h.notifier.groups().is_empty());

    h.github.list(PARTICIPATED, vec![entry(7, "2024-01-03T00:00:00Z")]);
    h.github.set_activity(id, comment("102", "me"));
    h.run().await;
    assert!(h.notifier.groups().is_empty(), "own comments do not notify");
}

#[tokio::test]
async fn no_notify_still_records_events() {
    let mut h = Harness::new();
    h.github.list(REVIEW_REQUESTED, vec![]);
    h.run().await;

    h.ctx.notifier = None;
    h.github.list(REVIEW_REQUESTED, vec![requested(9, "2024-01-02T00:00:00Z")]);
    let report = h.run().await;
    assert_eq!(report.events.len(), 1);
    assert_eq!(report.delivered, 0);
    assert!(h.ledger().get("requested-me/acme/app#9").is_some());

    h.ctx.notifier = Some(h.notifier.clone() as Arc<dyn Notifier>);
    let report = h.run().await;
    assert!(report.events.is_empty());
    assert!(h.notifier.groups().is_empty());
}

// ---- merges ----

#[tokio::test]
async fn vanished_unmerged_pr_is_not_reported_merged() {
    let h = Harness::new();
    h.github.list(ALL_OPEN, vec![entry(42, "2024-01-01T00:00:00Z")]);
    h.run().await;

    h.github.list(ALL_OPEN, vec![]);
    h.github.set_detail(42, false, None);
    let report = h.run().await;

    assert_eq!(h.github.detail_calls(), vec![PrId::new(REPO, 42)]);
    assert!(report.events.is_empty());
    assert!(h.notifier.groups().is_empty());
}

#[tokio::test]
async fn vanished_merged_pr_is_reported_once() {
    let h = Harness::new();
    h.github.list(ALL_OPEN, vec![entry(43, "2024-01-01T00:00:00Z")]);
    h.run().await;

    h.github.list(ALL_OPEN, vec![]);
    h.github.set_detail(43, true, Some("2024-01-02T00:00:00Z"));
    h.run().await;
    assert_eq!(h.notifier.groups(), vec!["merged/acme/app#43"]);

    // Gone from both snapshots now, so nothing is verified again.
    h.notifier.clear();
    h.run().await;
    assert!(h.notifier.groups().is_empty());
    assert_eq!(h.github.detail_calls().len(), 1);
}

// ---- sections ----

#[tokio::test]
async fn pr_in_two_sections_appears_once() {
    let h = Harness::new();
    h.github.list(REVIEW_REQUESTED, vec![requested(7, "2024-01-01T00:00:00Z")]);
    h.github.list(PARTICIPATED, vec![entry(7, "2024-01-01T00:00:00Z")]);

    let report = h.run().await;

    let snapshot = h.snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(
        snapshot.get(&PrId::new(REPO, 7)).unwrap().section,
        SectionKind::ReviewRequested
    );
    assert_eq!(report.menu.matches("acme/app#7").count(), 1);
    assert!(report.menu.contains("Participated (0)"));
}

#[tokio::test]
async fn failed_section_carries_rows_forward() {
    let h = Harness::new();
    h.github.list(PARTICIPATED, vec![entry(7, "2024-01-01T00:00:00Z")]);
    h.run().await;

    h.github.fail(PARTICIPATED);
    let report = h.run().await;

    assert_eq!(report.failed_sections, vec![SectionKind::Participated]);
    assert!(report.events.is_empty());
    assert!(h.github.detail_calls().is_empty(), "nothing vanished");
    assert!(h.snapshot().contains(&PrId::new(REPO, 7)));
    assert!(report.menu.contains("Participated (0)"));
    assert!(report.menu.contains("⚠ Unavailable: Participated"));
}

#[tokio::test]
async fn rest_fallback_keeps_merge_queue_state() {
    let h = Harness::new();
    let id = PrId::new(REPO, 7);
    let mut queued = entry(7, "2024-01-01T00:00:00Z");
    queued.in_merge_queue = Some(true);
    h.github.list(ALL_OPEN, vec![queued]);
    h.run().await;
    h.run().await;

    h.github.fail(ALL_OPEN);
    let report = h.run().await;
    assert!(report.failed_sections.is_empty(), "fallback listing succeeded");
    assert!(report.events.is_empty());
    assert!(h.snapshot().get(&id).unwrap().in_merge_queue);

    h.github.heal(ALL_OPEN);
    let report = h.run().await;
    assert!(report.events.is_empty());
    assert!(h.notifier.groups().is_empty());
    assert!(h.ledger().get("dequeued/acme/app#7").is_none());
}

// ---- enrichment ----

#[tokio::test]
async fn comment_seen_during_enrichment_outage_is_not_new_later() {
    let h = Harness::new();
    let id = PrId::new(REPO, 8);
    h.github.list(PARTICIPATED, vec![entry(7, "2024-01-01T00:00:00Z")]);
    h.run().await;

    h.github.set_activity(id.clone(), comment("500", "carol"));
    h.github.fail_activity(id.clone());
    h.github.list(
        PARTICIPATED,
        vec![entry(7, "2024-01-01T00:00:00Z"), entry(8, "2024-01-02T00:00:00Z")],
    );
    h.run().await;
    assert_eq!(h.notifier.groups(), vec!["new/acme/app#8"]);
    assert!(h.snapshot().get(&id).unwrap().enrichment_pending);

    h.notifier.clear();
    h.github.heal_activity(&id);
    h.run().await;
    assert!(h.notifier.groups().is_empty(), "existing comment is not announced");
    let row = h.snapshot().get(&id).cloned().unwrap();
    assert!(!row.enrichment_pending);
    assert_eq!(row.latest_comment.unwrap().id, "500");

    h.github.list(
        PARTICIPATED,
        vec![entry(7, "2024-01-01T00:00:00Z"), entry(8, "2024-01-03T00:00:00Z")],
    );
    h.github.set_activity(id, comment("501", "carol"));
    h.run().await;
    assert_eq!(h.notifier.groups(), vec!["comment/acme/app#8"]);
}

#[tokio::test]
async fn approval_count_reflects_latest_review_per_reviewer() {
    let h = Harness::new();
    let id = PrId::new(REPO, 7);
    h.github.list(PARTICIPATED, vec![entry(7, "2024-01-01T00:00:00Z")]);
    let review = |author: &str, state, at: &str| ReviewRecord {
        author: author.into(),
        state,
        submitted_at: Some(ts(at)),
    };
    h.github.set_activity(
        id.clone(),
        PullActivity {
            reviews: vec![
                review("alice", ReviewState::Approved, "2024-01-01T01:00:00Z"),
                review("alice", ReviewState::ChangesRequested, "2024-01-01T02:00:00Z"),
                review("bob", ReviewState::Approved, "2024-01-01T03:00:00Z"),
            ],
            ..PullActivity::default()
        },
    );

    let report = h.run().await;
    assert_eq!(h.snapshot().get(&id).unwrap().approval_count, 1);
    assert!(report.menu.contains("✔1 acme/app#7"));
}

#[tokio::test]
async fn enrichment_is_refetched_only_when_updated_at_changes() {
    let h = Harness::new();
    h.github.list(PARTICIPATED, vec![entry(7, "2024-01-01T00:00:00Z")]);

    assert_eq!(h.run().await.enrich_fetches, 1);
    assert_eq!(h.run().await.enrich_fetches, 0);

    h.github.list(PARTICIPATED, vec![entry(7, "2024-01-02T00:00:00Z")]);
    assert_eq!(h.run().await.enrich_fetches, 1);
    assert_eq!(h.run().await.enrich_fetches, 0);
}

// ---- ledger GC ----

#[tokio::test]
async fn ledger_drops_entries_for_prs_gone_from_both_snapshots() {
    let h = Harness::new();
    h.github.list(PARTICIPATED, vec![entry(7, "2024-01-01T00:00:00Z")]);
    h.run().await;

    let mut ledger = h.ledger();
    assert!(ledger.admit("comment/acme/app#7", Discriminator::Id("5".into())));
    assert!(ledger.admit("comment/acme/app#99", Discriminator::Id("5".into())));
    ledger.save(&h.ctx.layout.ledger()).unwrap();

    let report = h.run().await;
    assert_eq!(report.ledger_removed, 1);

    let ledger = h.ledger();
    assert_eq!(
        ledger.get("comment/acme/app#7"),
        Some(&Discriminator::Id("5".into()))
    );
    assert!(ledger.get("comment/acme/app#99").is_none());
}
