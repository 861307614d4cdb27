//! Configuration for prbar, loaded from TOML.
//!
//! # Configuration file format
//!
//! prbar looks for `~/.config/prbar/config.toml` by default (override with
//! `--config`). All sections are optional; prbar runs with defaults if the
//! file is missing or empty.
//!
//! ```toml
//! # Repositories to watch, "owner/name".
//! repos = ["acme/app", "acme/api"]
//!
//! # Login override (default: whoever `gh` is authenticated as).
//! # viewer = "octocat"
//!
//! # Optional override for where state and caches live.
//! # state_dir = "/tmp/prbar"
//!
//! [teams]
//! review  = "acme/platform"   # team whose review queue is listed
//! authors = "acme/frontend"   # team whose members' PRs are listed
//!
//! [sections]
//! participated = false        # every section defaults to on
//!
//! [notify]
//! enabled  = true
//! notifier = "terminal-notifier"
//! comment  = false            # per-event toggles default to on
//!
//! [limits]
//! workers              = 8
//! page_size            = 50
//! max_pages            = 10
//! retry_delay_ms       = 1500
//! command_timeout_secs = 20
//! avatar_ttl_hours     = 168
//!
//! [display]
//! avatars = true
//! title   = "⇅"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use color_eyre::eyre::{Result, WrapErr, eyre};
use serde::Deserialize;

use crate::detect::EventKind;
use crate::fetch::FetchPolicy;
use crate::snapshot::SectionKind;

/// Top-level prbar configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Repository allowlist, `owner/name`.
    #[serde(default)]
    pub repos: Vec<String>,

    /// Login to treat as "me". Resolved from `gh` when unset.
    #[serde(default)]
    pub viewer: Option<String>,

    #[serde(default)]
    pub teams: TeamsConfig,

    #[serde(default)]
    pub sections: SectionsConfig,

    #[serde(default)]
    pub notify: NotifyConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub display: DisplayConfig,

    /// Where snapshot, ledger and caches are kept.
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
}

/// The two independent team-based sections. Each is `org/slug`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TeamsConfig {
    /// Team whose pending review requests form the team queue.
    #[serde(default)]
    pub review: Option<String>,
    /// Team whose members' open PRs are listed.
    #[serde(default)]
    pub authors: Option<String>,
}

/// A parsed `org/slug` team reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamRef {
    pub org: String,
    pub slug: String,
}

impl TeamRef {
    pub fn parse(s: &str) -> Option<Self> {
        let (org, slug) = s.trim().split_once('/')?;
        if org.is_empty() || slug.is_empty() || slug.contains('/') {
            return None;
        }
        Some(Self {
            org: org.to_string(),
            slug: slug.to_string(),
        })
    }
}

impl std::fmt::Display for TeamRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.org, self.slug)
    }
}

impl TeamsConfig {
    pub fn review_team(&self) -> Option<TeamRef> {
        self.review.as_deref().and_then(TeamRef::parse)
    }

    pub fn authors_team(&self) -> Option<TeamRef> {
        self.authors.as_deref().and_then(TeamRef::parse)
    }
}

/// Per-section on/off switches.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SectionsConfig {
    pub review_requested: bool,
    pub team_queue: bool,
    pub assigned: bool,
    pub mentioned: bool,
    pub team_authors: bool,
    pub mine: bool,
    pub participated: bool,
    pub all_open: bool,
}

impl Default for SectionsConfig {
    fn default() -> Self {
        Self {
            review_requested: true,
            team_queue: true,
            assigned: true,
            mentioned: true,
            team_authors: true,
            mine: true,
            participated: true,
            all_open: true,
        }
    }
}

impl SectionsConfig {
    pub fn enabled(&self, kind: SectionKind) -> bool {
        match kind {
            SectionKind::ReviewRequested => self.review_requested,
            SectionKind::TeamQueue => self.team_queue,
            SectionKind::Assigned => self.assigned,
            SectionKind::Mentioned => self.mentioned,
            SectionKind::TeamAuthors => self.team_authors,
            SectionKind::Mine => self.mine,
            SectionKind::Participated => self.participated,
            SectionKind::AllOpen => self.all_open,
        }
    }
}

/// Notification switches.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Master switch for the desktop notifier.
    pub enabled: bool,
    /// Notifier binary.
    pub notifier: String,
    pub new_pr: bool,
    pub requested: bool,
    pub assigned: bool,
    pub rerequested: bool,
    pub merge_queue: bool,
    pub merged: bool,
    pub comment: bool,
    pub dismissed: bool,
    pub mentioned: bool,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            notifier: "terminal-notifier".to_string(),
            new_pr: true,
            requested: true,
            assigned: true,
            rerequested: true,
            merge_queue: true,
            merged: true,
            comment: true,
            dismissed: true,
            mentioned: true,
        }
    }
}

impl NotifyConfig {
    /// Whether events of `kind` are detected and delivered at all.
    pub fn allows(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::NewPr => self.new_pr,
            EventKind::Flag(flag) if flag.is_request() => self.requested,
            EventKind::Flag(_) => self.assigned,
            EventKind::ReRequested => self.rerequested,
            EventKind::EnteredQueue | EventKind::LeftQueue => self.merge_queue,
            EventKind::Merged => self.merged,
            EventKind::NewComment => self.comment,
            EventKind::ApprovalDismissed => self.dismissed,
            EventKind::Mentioned => self.mentioned,
        }
    }
}

/// Concurrency, paging and timeout limits.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub workers: usize,
    pub page_size: u32,
    pub max_pages: u32,
    pub retry_delay_ms: u64,
    pub command_timeout_secs: u64,
    pub avatar_ttl_hours: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            page_size: 50,
            max_pages: 10,
            retry_delay_ms: 1500,
            command_timeout_secs: 20,
            avatar_ttl_hours: 24 * 7,
        }
    }
}

impl LimitsConfig {
    pub fn fetch_policy(&self) -> FetchPolicy {
        FetchPolicy {
            page_size: self.page_size.clamp(1, 100),
            max_pages: self.max_pages.max(1),
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            workers: self.workers.max(1),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.max(1))
    }

    pub fn avatar_ttl(&self) -> Duration {
        Duration::from_secs(self.avatar_ttl_hours.saturating_mul(3600))
    }
}

/// Decoration symbols and display toggles.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Inline author avatars.
    pub avatars: bool,
    /// Menu-bar title glyph.
    pub title: String,
    pub draft: String,
    pub merge_queue: String,
    pub team_requested: String,
    pub mentioned: String,
    pub reacted: String,
    pub approval: String,
    pub conversation: String,
    pub changes_requested: String,
    pub approved_by_me: String,
    pub commented_by_me: String,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            avatars: true,
            title: "⇅".into(),
            draft: "◌".into(),
            merge_queue: "⇶".into(),
            team_requested: "👥".into(),
            mentioned: "@".into(),
            reacted: "★".into(),
            approval: "✔".into(),
            conversation: "💬".into(),
            changes_requested: "✖".into(),
            approved_by_me: "✅".into(),
            commented_by_me: "✎".into(),
        }
    }
}

impl Config {
    /// Default config path, `~/.config/prbar/config.toml`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("prbar").join("config.toml"))
    }

    /// Load configuration from a TOML file.
    ///
    /// A missing file yields defaults. Problems that still leave a usable
    /// config are logged by [`Config::validate`], never returned.
    pub fn load(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .wrap_err_with(|| format!("failed to read {}", path.display()))?;
            let config: Config = toml::from_str(&contents)
                .wrap_err_with(|| format!("failed to parse {}", path.display()))?;
            tracing::debug!("loaded config from {}", path.display());
            config
        } else {
            tracing::info!("config file {} not found, using defaults", path.display());
            Self::default()
        };

        config.validate();
        Ok(config)
    }

    /// Log warnings for common configuration issues.
    pub fn validate(&self) {
        if self.repos.is_empty() {
            tracing::warn!("repos is empty; listings are not restricted and \"all open\" is skipped");
        }
        for repo in &self.repos {
            if repo.split('/').count() != 2 {
                tracing::warn!("repo {repo:?} is not in owner/name form");
            }
        }
        if let Some(raw) = &self.teams.review
            && TeamRef::parse(raw).is_none()
        {
            tracing::warn!("teams.review {raw:?} is not org/slug; team queue disabled");
        }
        if let Some(raw) = &self.teams.authors
            && TeamRef::parse(raw).is_none()
        {
            tracing::warn!("teams.authors {raw:?} is not org/slug; team authors disabled");
        }
        if self.limits.workers == 0 {
            tracing::warn!("limits.workers is 0, using 1");
        }
        if self.limits.page_size == 0 || self.limits.page_size > 100 {
            tracing::warn!("limits.page_size must be 1..=100, clamping");
        }
        if self.notify.enabled && self.notify.notifier.trim().is_empty() {
            tracing::warn!("notify.notifier is empty; notifications will be skipped");
        }
    }

    /// Resolve the state directory: explicit override, then config, then the
    /// user cache directory.
    pub fn resolve_state_dir(&self, override_dir: Option<&Path>) -> Result<PathBuf> {
        if let Some(dir) = override_dir {
            return Ok(dir.to_path_buf());
        }
        if let Some(dir) = &self.state_dir {
            return Ok(dir.clone());
        }
        dirs::cache_dir()
            .map(|d| d.join("prbar"))
            .ok_or_else(|| eyre!("no cache directory available; pass --state-dir"))
    }
}
