//! GitHub access: the upstream data source behind a trait.
//!
//! [`GithubApi`] is the seam the rest of the crate talks to. The production
//! implementation, [`GhCli`], shells out to the `gh` CLI via
//! `tokio::process::Command`, so prbar holds no token of its own: requests
//! run as whichever account `gh auth` is logged into.
//!
//! Every call is bounded by a timeout, and anything other than a successful
//! exit with valid JSON on stdout is an error. Retry and fallback policy live
//! with the callers (`fetch`, `enrich`), not here.

pub mod query;
pub mod types;

use std::time::Duration;

use async_trait::async_trait;
use color_eyre::eyre::{Result, WrapErr, bail, eyre};
use serde::Deserialize;
use serde::de::DeserializeOwned;

use self::types::{
    GqlActivityData, GqlEnvelope, GqlSearchData, PrEntry, PullActivity, PullDetail, RestPull,
    SearchPage,
};

/// Queryable source of pull-request data.
#[async_trait]
pub trait GithubApi: Send + Sync {
    /// Login of the authenticated user.
    async fn viewer_login(&self) -> Result<String>;

    /// Fetch one page of PRs matching `filter`, continuing from `cursor`.
    async fn search_page(
        &self,
        filter: &str,
        page_size: u32,
        cursor: Option<&str>,
    ) -> Result<SearchPage>;

    /// All open PRs of one repository via the plain per-repo listing.
    /// Slower than search but independent of the search index.
    async fn list_open_pulls(&self, repo: &str) -> Result<Vec<PrEntry>>;

    /// Point lookup of one PR.
    async fn pull_detail(&self, repo: &str, number: u64) -> Result<PullDetail>;

    /// Conversation, review, and review-request activity for one PR.
    async fn pull_activity(&self, repo: &str, number: u64) -> Result<PullActivity>;

    /// Logins of the members of `org/slug`.
    async fn team_members(&self, org: &str, slug: &str) -> Result<Vec<String>>;
}

/// [`GithubApi`] backed by the `gh` CLI.
pub struct GhCli {
    /// Path to the gh binary. Defaults to "gh".
    gh_bin: String,
    timeout: Duration,
}

impl GhCli {
    pub fn new(timeout: Duration) -> Self {
        Self {
            gh_bin: "gh".to_owned(),
            timeout,
        }
    }

    /// Use a specific `gh` binary.
    pub fn with_binary(mut self, gh_bin: impl Into<String>) -> Self {
        self.gh_bin = gh_bin.into();
        self
    }

    /// Check that `gh` is installed and authenticated.
    pub async fn ensure_available(&self) -> Result<()> {
        let which = tokio::process::Command::new("which")
            .arg(&self.gh_bin)
            .output()
            .await;
        match which {
            Ok(output) if output.status.success() => {}
            _ => bail!("`{}` CLI is not installed or not on PATH", self.gh_bin),
        }

        let auth = tokio::process::Command::new(&self.gh_bin)
            .args(["auth", "status"])
            .output()
            .await
            .wrap_err("failed to run `gh auth status`")?;
        if !auth.status.success() {
            let stderr = String::from_utf8_lossy(&auth.stderr);
            bail!("`gh` is not authenticated: {}", stderr.trim());
        }
        Ok(())
    }

    /// Run `gh` with `args` and return stdout, failing on timeout or non-zero exit.
    async fn run(&self, args: &[String]) -> Result<Vec<u8>> {
        let child = tokio::process::Command::new(&self.gh_bin)
            .args(args)
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| eyre!("`gh {}` timed out after {:?}", describe(args), self.timeout))?
            .wrap_err_with(|| format!("failed to run `gh {}`", describe(args)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("`gh {}` failed: {}", describe(args), stderr.trim());
        }
        Ok(output.stdout)
    }

    async fn api_json<T: DeserializeOwned>(&self, args: Vec<String>) -> Result<T> {
        let stdout = self.run(&args).await?;
        serde_json::from_slice(&stdout)
            .wrap_err_with(|| format!("invalid JSON from `gh {}`", describe(&args)))
    }

    /// `gh api --paginate` prints one JSON array per page back to back.
    async fn api_paginated<T: DeserializeOwned>(&self, endpoint: &str) -> Result<Vec<T>> {
        let args = vec!["api".into(), "--paginate".into(), endpoint.to_string()];
        let stdout = self.run(&args).await?;

        let mut items = Vec::new();
        for page in serde_json::Deserializer::from_slice(&stdout).into_iter::<Vec<T>>() {
            items.extend(page.wrap_err_with(|| format!("invalid JSON page from `gh api {endpoint}`"))?);
        }
        Ok(items)
    }

    async fn graphql<T: DeserializeOwned>(&self, query: &str, vars: &[GqlVar<'_>]) -> Result<T> {
        let mut args = vec!["api".to_string(), "graphql".into(), "-f".into(), format!("query={query}")];
        for var in vars {
            match var {
                GqlVar::Str(name, value) => {
                    args.push("-f".into());
                    args.push(format!("{name}={value}"));
                }
                GqlVar::Int(name, value) => {
                    args.push("-F".into());
                    args.push(format!("{name}={value}"));
                }
            }
        }

        let envelope: GqlEnvelope<T> = self.api_json(args).await?;
        match envelope.data {
            Some(data) => Ok(data),
            None => {
                let messages: Vec<_> = envelope.errors.into_iter().map(|e| e.message).collect();
                bail!("graphql returned no data: {}", messages.join("; "))
            }
        }
    }
}

/// A GraphQL variable passed on the `gh api graphql` command line.
enum GqlVar<'a> {
    Str(&'a str, &'a str),
    Int(&'a str, u64),
}

/// Short description of a gh invocation for error messages (no query bodies).
fn describe(args: &[String]) -> String {
    args.iter()
        .take(3)
        .map(|a| match a.split_once('=') {
            Some((name, _)) if a.len() > 60 => format!("{name}=…"),
            _ => a.clone(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Deserialize)]
struct RestLogin {
    login: String,
}

#[async_trait]
impl GithubApi for GhCli {
    async fn viewer_login(&self) -> Result<String> {
        let user: RestLogin = self.api_json(vec!["api".into(), "user".into()]).await?;
        Ok(user.login)
    }

    async fn search_page(
        &self,
        filter: &str,
        page_size: u32,
        cursor: Option<&str>,
    ) -> Result<SearchPage> {
        let mut vars = vec![GqlVar::Str("q", filter), GqlVar::Int("n", u64::from(page_size))];
        if let Some(cursor) = cursor {
            vars.push(GqlVar::Str("cursor", cursor));
        }
        let data: GqlSearchData = self.graphql(query::SEARCH_PULLS, &vars).await?;
        Ok(data.search.into())
    }

    async fn list_open_pulls(&self, repo: &str) -> Result<Vec<PrEntry>> {
        let pulls: Vec<RestPull> = self
            .api_paginated(&format!("repos/{repo}/pulls?state=open&per_page=100"))
            .await?;
        Ok(pulls.into_iter().map(|p| p.into_entry(repo)).collect())
    }

    async fn pull_detail(&self, repo: &str, number: u64) -> Result<PullDetail> {
        let pull: RestPull = self
            .api_json(vec!["api".into(), format!("repos/{repo}/pulls/{number}")])
            .await?;
        Ok(pull.into_detail(repo))
    }

    async fn pull_activity(&self, repo: &str, number: u64) -> Result<PullActivity> {
        let (owner, name) = repo
            .split_once('/')
            .ok_or_else(|| eyre!("repo {repo:?} is not in owner/name form"))?;
        let vars = [
            GqlVar::Str("owner", owner),
            GqlVar::Str("name", name),
            GqlVar::Int("number", number),
        ];
        let data: GqlActivityData = self.graphql(query::PULL_ACTIVITY, &vars).await?;
        let pr = data
            .repository
            .and_then(|r| r.pull_request)
            .ok_or_else(|| eyre!("{repo}#{number} not found"))?;
        Ok(pr.into())
    }

    async fn team_members(&self, org: &str, slug: &str) -> Result<Vec<String>> {
        let members: Vec<RestLogin> = self
            .api_paginated(&format!("orgs/{org}/teams/{slug}/members?per_page=100"))
            .await?;
        Ok(members.into_iter().map(|m| m.login).collect())
    }
}
