//! PR data fetcher: turns named listings into raw PR entries.
//!
//! A listing is read one page at a time through a [`PageCursor`], which can be
//! resumed from any continuation cursor. Each page gets one retry after a short
//! delay; if it still fails, whatever was already collected is returned as a
//! partial result instead of failing the run. Callers treat missing data as
//! "nothing new this round", never as evidence that a PR was closed.

use std::sync::Arc;
use std::time::Duration;

use color_eyre::Result;

use crate::github::GithubApi;
use crate::github::query::search_filter;
use crate::github::types::PrEntry;
use crate::pool;

/// Paging and retry knobs, taken from `[limits]` in the config.
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub page_size: u32,
    /// Upper bound on pages followed in full-pagination mode.
    pub max_pages: u32,
    pub retry_delay: Duration,
    pub workers: usize,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            page_size: 50,
            max_pages: 10,
            retry_delay: Duration::from_millis(1500),
            workers: 8,
        }
    }
}

/// Whether a listing should stop after the first page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pagination {
    /// First page only; for listings where an approximate result is fine.
    SingleShot,
    /// Follow the continuation cursor until exhausted (or `max_pages`).
    Full,
}

/// How much of a listing was actually retrieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStatus {
    Complete,
    /// Some pages (or some repos) were retrieved before a failure.
    Partial,
    /// Nothing was retrieved.
    Failed,
}

impl FetchStatus {
    /// Combine the statuses of independent sub-listings.
    pub fn merge(statuses: &[FetchStatus]) -> FetchStatus {
        if statuses.is_empty() || statuses.iter().all(|s| *s == FetchStatus::Complete) {
            FetchStatus::Complete
        } else if statuses.iter().all(|s| *s == FetchStatus::Failed) {
            FetchStatus::Failed
        } else {
            FetchStatus::Partial
        }
    }
}

/// Entries from one listing plus how complete they are.
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub entries: Vec<PrEntry>,
    pub status: FetchStatus,
}

impl FetchOutcome {
    pub fn failed() -> Self {
        Self {
            entries: Vec::new(),
            status: FetchStatus::Failed,
        }
    }
}

/// Lazy, restartable page-at-a-time reader over one search filter.
pub struct PageCursor {
    api: Arc<dyn GithubApi>,
    filter: String,
    page_size: u32,
    retry_delay: Duration,
    cursor: Option<String>,
    exhausted: bool,
}

impl PageCursor {
    pub fn new(api: Arc<dyn GithubApi>, filter: impl Into<String>, policy: &FetchPolicy) -> Self {
        Self {
            api,
            filter: filter.into(),
            page_size: policy.page_size,
            retry_delay: policy.retry_delay,
            cursor: None,
            exhausted: false,
        }
    }

    /// Continue from a previously returned continuation cursor.
    pub fn resume_from(mut self, cursor: impl Into<String>) -> Self {
        self.cursor = Some(cursor.into());
        self.exhausted = false;
        self
    }

    /// The cursor the next page will be requested from.
    pub fn cursor(&self) -> Option<&str> {
        self.cursor.as_deref()
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Fetch the next page. `Ok(None)` once the listing is exhausted.
    /// A failing page is retried once; on a second failure the cursor stays
    /// put so the caller may resume later.
    pub async fn next_page(&mut self) -> Result<Option<Vec<PrEntry>>> {
        if self.exhausted {
            return Ok(None);
        }

        let page = match self.request().await {
            Ok(page) => page,
            Err(first) => {
                tracing::debug!(
                    target: "fetch",
                    "page for {:?} failed, retrying in {:?}: {first}",
                    self.filter,
                    self.retry_delay
                );
                tokio::time::sleep(self.retry_delay).await;
                self.request().await?
            }
        };

        match (page.has_more, page.next_cursor) {
            (true, Some(next)) => self.cursor = Some(next),
            _ => self.exhausted = true,
        }
        Ok(Some(page.entries))
    }

    async fn request(&self) -> Result<crate::github::types::SearchPage> {
        self.api
            .search_page(&self.filter, self.page_size, self.cursor.as_deref())
            .await
    }
}

/// Fetches listings for the snapshot builder.
#[derive(Clone)]
pub struct Fetcher {
    api: Arc<dyn GithubApi>,
    policy: FetchPolicy,
}

impl Fetcher {
    pub fn new(api: Arc<dyn GithubApi>, policy: FetchPolicy) -> Self {
        Self { api, policy }
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Collect a listing, keeping whatever was retrieved if a page fails.
    pub async fn fetch(&self, filter: &str, pagination: Pagination) -> FetchOutcome {
        let mut pages = PageCursor::new(Arc::clone(&self.api), filter, &self.policy);
        let max_pages = match pagination {
            Pagination::SingleShot => 1,
            Pagination::Full => self.policy.max_pages.max(1),
        };

        let mut entries = Vec::new();
        let mut fetched = 0;
        while fetched < max_pages {
            match pages.next_page().await {
                Ok(Some(page)) => {
                    entries.extend(page);
                    fetched += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(
                        target: "fetch",
                        "listing {filter:?} stopped after {fetched} page(s): {e}"
                    );
                    let status = if fetched == 0 {
                        FetchStatus::Failed
                    } else {
                        FetchStatus::Partial
                    };
                    return FetchOutcome { entries, status };
                }
            }
        }

        if pagination == Pagination::Full && !pages.is_exhausted() {
            tracing::info!(
                target: "fetch",
                "listing {filter:?} truncated at {max_pages} page(s)"
            );
        }

        FetchOutcome {
            entries,
            status: FetchStatus::Complete,
        }
    }

    /// Run several single-shot listings in parallel (bounded) and concatenate
    /// their entries in filter order.
    pub async fn fetch_many(&self, filters: Vec<String>) -> FetchOutcome {
        let workers = self.policy.workers;
        let fetcher = self.clone();
        let outcomes = pool::bounded(filters, workers, move |filter| {
            let fetcher = fetcher.clone();
            async move { fetcher.fetch(&filter, Pagination::SingleShot).await }
        })
        .await;

        let statuses: Vec<FetchStatus> = outcomes.iter().map(|o| o.status).collect();
        FetchOutcome {
            entries: outcomes.into_iter().flat_map(|o| o.entries).collect(),
            status: FetchStatus::merge(&statuses),
        }
    }

    /// Every open PR in the allowlisted repos.
    ///
    /// Tries the paginated search first; if that fails outright, re-derives the
    /// listing repo by repo through the plain per-repository endpoint.
    pub async fn fetch_all_open(&self, repos: &[String]) -> FetchOutcome {
        let primary = self.fetch(&search_filter(repos, ""), Pagination::Full).await;
        if primary.status != FetchStatus::Failed || repos.is_empty() {
            return primary;
        }

        tracing::warn!(
            target: "fetch",
            "search listing failed, falling back to per-repo listing for {} repo(s)",
            repos.len()
        );

        let api = Arc::clone(&self.api);
        let results = pool::bounded(repos.to_vec(), self.policy.workers, move |repo| {
            let api = Arc::clone(&api);
            async move {
                let result = api.list_open_pulls(&repo).await;
                (repo, result)
            }
        })
        .await;

        let mut entries = Vec::new();
        let mut statuses = Vec::new();
        for (repo, result) in results {
            match result {
                Ok(found) => {
                    entries.extend(found);
                    statuses.push(FetchStatus::Complete);
                }
                Err(e) => {
                    tracing::warn!(target: "fetch", "fallback listing for {repo} failed: {e}");
                    statuses.push(FetchStatus::Failed);
                }
            }
        }

        FetchOutcome {
            entries,
            status: FetchStatus::merge(&statuses),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::types::{PullActivity, PullDetail, SearchPage};
    use crate::snapshot::{PrId, ReviewDecision};
    use async_trait::async_trait;
    use chrono::Utc;
    use color_eyre::eyre::eyre;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    fn entry(number: u64) -> PrEntry {
        PrEntry {
            id: PrId::new("acme/app", number),
            title: format!("PR {number}"),
            url: String::new(),
            created_at: None,
            updated_at: Utc::now(),
            draft: false,
            in_merge_queue: Some(false),
            author: None,
            comment_count: 0,
            review_decision: ReviewDecision::None,
            requested_users: vec![],
            requested_teams: vec![],
            assignees: vec![],
            viewer_reacted: false,
        }
    }

    /// Serves scripted search responses in order.
    struct ScriptedApi {
        pages: Mutex<VecDeque<Result<SearchPage>>>,
        cursors_seen: Mutex<Vec<Option<String>>>,
        fallback: Option<Vec<PrEntry>>,
    }

    impl ScriptedApi {
        fn new(pages: Vec<Result<SearchPage>>) -> Self {
            Self {
                pages: Mutex::new(pages.into()),
                cursors_seen: Mutex::new(Vec::new()),
                fallback: None,
            }
        }
    }

    #[async_trait]
    impl GithubApi for ScriptedApi {
        async fn viewer_login(&self) -> Result<String> {
            Ok("me".into())
        }

        async fn search_page(
            &self,
            _filter: &str,
            _page_size: u32,
            cursor: Option<&str>,
        ) -> Result<SearchPage> {
            self.cursors_seen
                .lock()
                .unwrap()
                .push(cursor.map(String::from));
            self.pages
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(eyre!("no more scripted pages")))
        }

        async fn list_open_pulls(&self, _repo: &str) -> Result<Vec<PrEntry>> {
            self.fallback.clone().ok_or_else(|| eyre!("fallback down"))
        }

        async fn pull_detail(&self, _repo: &str, _number: u64) -> Result<PullDetail> {
            Err(eyre!("unused"))
        }

        async fn pull_activity(&self, _repo: &str, _number: u64) -> Result<PullActivity> {
            Err(eyre!("unused"))
        }

        async fn team_members(&self, _org: &str, _slug: &str) -> Result<Vec<String>> {
            Ok(vec![])
        }
    }

    fn page(numbers: &[u64], next: Option<&str>) -> Result<SearchPage> {
        Ok(SearchPage {
            entries: numbers.iter().map(|n| entry(*n)).collect(),
            has_more: next.is_some(),
            next_cursor: next.map(String::from),
        })
    }

    fn fast_policy() -> FetchPolicy {
        FetchPolicy {
            retry_delay: Duration::from_millis(1),
            ..FetchPolicy::default()
        }
    }

    #[tokio::test]
    async fn test_full_pagination_follows_cursor() {
        let api = Arc::new(ScriptedApi::new(vec![
            page(&[1, 2], Some("c1")),
            page(&[3], None),
        ]));
        let fetcher = Fetcher::new(api.clone(), fast_policy());

        let out = fetcher.fetch("q", Pagination::Full).await;
        assert_eq!(out.status, FetchStatus::Complete);
        assert_eq!(out.entries.len(), 3);
        assert_eq!(
            *api.cursors_seen.lock().unwrap(),
            vec![None, Some("c1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_single_shot_stops_after_first_page() {
        let api = Arc::new(ScriptedApi::new(vec![
            page(&[1, 2], Some("c1")),
            page(&[3], None),
        ]));
        let fetcher = Fetcher::new(api.clone(), fast_policy());

        let out = fetcher.fetch("q", Pagination::SingleShot).await;
        assert_eq!(out.status, FetchStatus::Complete);
        assert_eq!(out.entries.len(), 2);
        assert_eq!(api.cursors_seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_once_then_succeed() {
        let api = Arc::new(ScriptedApi::new(vec![
            Err(eyre!("timeout")),
            page(&[1], None),
        ]));
        let fetcher = Fetcher::new(api, fast_policy());

        let out = fetcher.fetch("q", Pagination::Full).await;
        assert_eq!(out.status, FetchStatus::Complete);
        assert_eq!(out.entries.len(), 1);
    }

    #[tokio::test]
    async fn test_second_page_failure_returns_partial() {
        let api = Arc::new(ScriptedApi::new(vec![
            page(&[1, 2], Some("c1")),
            Err(eyre!("bad json")),
            Err(eyre!("bad json again")),
        ]));
        let fetcher = Fetcher::new(api, fast_policy());

        let out = fetcher.fetch("q", Pagination::Full).await;
        assert_eq!(out.status, FetchStatus::Partial);
        assert_eq!(out.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_cursor_stays_put_after_failure_and_resumes() {
        let api = Arc::new(ScriptedApi::new(vec![
            page(&[1], Some("c1")),
            Err(eyre!("down")),
            Err(eyre!("still down")),
            page(&[2], None),
        ]));
        let mut cursor = PageCursor::new(api, "q", &fast_policy());

        assert_eq!(cursor.next_page().await.unwrap().unwrap().len(), 1);
        assert!(cursor.next_page().await.is_err());
        assert_eq!(cursor.cursor(), Some("c1"));
        assert_eq!(cursor.next_page().await.unwrap().unwrap().len(), 1);
        assert!(cursor.next_page().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_all_open_falls_back_per_repo() {
        let mut api = ScriptedApi::new(vec![Err(eyre!("down")), Err(eyre!("down"))]);
        api.fallback = Some(vec![entry(10), entry(11)]);
        let fetcher = Fetcher::new(Arc::new(api), fast_policy());

        let out = fetcher.fetch_all_open(&["acme/app".to_string()]).await;
        assert_eq!(out.status, FetchStatus::Complete);
        assert_eq!(out.entries.len(), 2);
    }

    #[tokio::test]
    async fn test_all_open_total_failure() {
        let api = ScriptedApi::new(vec![Err(eyre!("down")), Err(eyre!("down"))]);
        let fetcher = Fetcher::new(Arc::new(api), fast_policy());

        let out = fetcher.fetch_all_open(&["acme/app".to_string()]).await;
        assert_eq!(out.status, FetchStatus::Failed);
        assert!(out.entries.is_empty());
    }

    #[test]
    fn test_status_merge() {
        use FetchStatus::*;
        assert_eq!(FetchStatus::merge(&[]), Complete);
        assert_eq!(FetchStatus::merge(&[Complete, Complete]), Complete);
        assert_eq!(FetchStatus::merge(&[Failed, Failed]), Failed);
        assert_eq!(FetchStatus::merge(&[Complete, Failed]), Partial);
    }
}
