//! Menu renderer: SwiftBar/xbar plugin text.
//!
//! Output grammar, one item per line:
//!
//! ```text
//! ⇅ 3                                              title (PRs waiting on me)
//! ---
//! Review requested (2) | href=https://github.com/pulls?q=...
//! 👥 ✔1 💬4 acme/app#7 Add cache | href=https://... image=...
//! --alice · updated 2h ago | href=https://...      submenu under the PR
//! ---
//! Refresh | refresh=true
//! ```
//!
//! Rendering is pure: everything it shows comes from the build output.

use std::collections::HashMap;
use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::config::DisplayConfig;
use crate::snapshot::builder::{BuildOutput, SectionResult};
use crate::snapshot::{PullRequestRecord, ReviewState};

/// Everything one menu render needs.
pub struct MenuInput<'a> {
    pub build: &'a BuildOutput,
    pub display: &'a DisplayConfig,
    /// Base64 avatar images by author login.
    pub avatars: &'a HashMap<String, String>,
    pub viewer: &'a str,
    pub now: DateTime<Utc>,
}

/// Render the whole menu.
pub fn render(input: &MenuInput<'_>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{} {}", input.display.title, attention_count(input));
    out.push_str("---\n");

    for section in &input.build.sections {
        render_section(&mut out, input, section);
    }

    out.push_str("---\n");
    let failed: Vec<&str> = input.build.failed_sections().map(|k| k.label()).collect();
    if !failed.is_empty() {
        let _ = writeln!(out, "⚠ Unavailable: {} | color=gray", failed.join(", "));
    }
    let _ = writeln!(
        out,
        "Updated {} | color=gray size=11",
        input.now.format("%H:%M UTC")
    );
    out.push_str("Refresh | refresh=true\n");
    out
}

/// PRs that want something from the viewer.
fn attention_count(input: &MenuInput<'_>) -> usize {
    input
        .build
        .snapshot
        .records()
        .filter(|r| !r.author.eq_ignore_ascii_case(input.viewer))
        .filter(|r| r.flags.requested_to_me || r.flags.requested_to_team || r.flags.assigned_to_me)
        .count()
}

fn render_section(out: &mut String, input: &MenuInput<'_>, section: &SectionResult) {
    // A failed section shows zero rather than whatever was carried forward.
    let count = if section.failed() { 0 } else { section.ids.len() };
    let _ = writeln!(
        out,
        "{} ({count}) | href={}",
        section.kind.label(),
        section.search_url
    );
    if section.failed() {
        return;
    }
    for id in &section.ids {
        if let Some(record) = input.build.snapshot.get(id) {
            render_pr(out, input, record);
        }
    }
}

fn render_pr(out: &mut String, input: &MenuInput<'_>, record: &PullRequestRecord) {
    let marks = marks(input, record);
    let mut line = String::new();
    if !marks.is_empty() {
        line.push_str(&marks.join(" "));
        line.push(' ');
    }
    let _ = write!(line, "{} {}", record.id, clean(&record.title));
    let _ = write!(line, " | href={}", record.url);
    if let Some(image) = input.avatars.get(&record.author) {
        let _ = write!(line, " image={image}");
    }
    out.push_str(&line);
    out.push('\n');

    let mut detail = format!("--{}", clean(&record.author));
    let _ = write!(detail, " · updated {}", ago(input.now, record.updated_at));
    if let Some(comment) = &record.latest_comment
        && !comment.snippet.is_empty()
    {
        let _ = write!(detail, " · {}: {}", clean(&comment.author), clean(&comment.snippet));
    }
    let _ = writeln!(out, "{detail} | href={}", record.url);
}

/// Decoration marks in a fixed order.
pub fn marks(input: &MenuInput<'_>, record: &PullRequestRecord) -> Vec<String> {
    let d = input.display;
    let decorations = &input.build.decorations;
    let mut marks = Vec::new();

    if record.draft {
        marks.push(d.draft.clone());
    }
    if record.in_merge_queue {
        marks.push(d.merge_queue.clone());
    }
    if decorations.team_requested.contains(&record.id) {
        marks.push(d.team_requested.clone());
    }
    if decorations.mentioned.contains(&record.id) {
        marks.push(d.mentioned.clone());
    }
    if decorations.reacted.contains(&record.id) {
        marks.push(d.reacted.clone());
    }
    match record.my_review.as_ref().map(|r| r.state) {
        Some(ReviewState::Approved) => marks.push(d.approved_by_me.clone()),
        Some(ReviewState::ChangesRequested) => marks.push(d.changes_requested.clone()),
        Some(ReviewState::Commented) => marks.push(d.commented_by_me.clone()),
        _ => {}
    }
    if record.approval_count > 0 {
        marks.push(format!("{}{}", d.approval, record.approval_count));
    }
    if record.conversation_count > 0 {
        marks.push(format!("{}{}", d.conversation, record.conversation_count));
    }
    marks
}

/// Strip what would break the line grammar: newlines and the `|` separator.
fn clean(text: &str) -> String {
    text.replace(['\n', '\r'], " ").replace('|', "¦")
}

/// Coarse relative time.
fn ago(now: DateTime<Utc>, then: DateTime<Utc>) -> String {
    let mins = (now - then).num_minutes().max(0);
    if mins < 1 {
        "just now".to_string()
    } else if mins < 60 {
        format!("{mins}m ago")
    } else if mins < 60 * 24 {
        format!("{}h ago", mins / 60)
    } else {
        format!("{}d ago", mins / (60 * 24))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchStatus;
    use crate::snapshot::{MyReview, PrId, SectionKind};

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn build() -> BuildOutput {
        let mut record = PullRequestRecord::synthesized(PrId::new("acme/app", 7), ts("2024-01-01T10:00:00Z"));
        record.title = "Add | cache\nlayer".into();
        record.author = "alice".into();
        record.approval_count = 1;
        record.conversation_count = 4;
        record.flags.requested_to_me = true;
        record.my_review = Some(MyReview {
            state: ReviewState::Commented,
            submitted_at: None,
        });
        record.section = SectionKind::ReviewRequested;

        let mut out = BuildOutput::default();
        out.decorations.team_requested.insert(record.id.clone());
        out.sections.push(SectionResult {
            kind: SectionKind::ReviewRequested,
            status: FetchStatus::Complete,
            ids: vec![record.id.clone()],
            search_url: "https://github.com/pulls?q=x".into(),
            carried: 0,
        });
        out.sections.push(SectionResult {
            kind: SectionKind::Mine,
            status: FetchStatus::Failed,
            ids: vec![],
            search_url: "https://github.com/pulls?q=y".into(),
            carried: 2,
        });
        out.snapshot.insert(record);
        out
    }

    #[test]
    fn test_render_menu() {
        let build = build();
        let display = DisplayConfig::default();
        let mut avatars = HashMap::new();
        avatars.insert("alice".to_string(), "QUJD".to_string());
        let input = MenuInput {
            build: &build,
            display: &display,
            avatars: &avatars,
            viewer: "me",
            now: ts("2024-01-01T12:00:00Z"),
        };

        let text = render(&input);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "⇅ 1");
        assert_eq!(lines[1], "---");
        assert_eq!(lines[2], "Review requested (1) | href=https://github.com/pulls?q=x");
        assert_eq!(
            lines[3],
            "👥 ✎ ✔1 💬4 acme/app#7 Add ¦ cache layer | href=https://github.com/acme/app/pull/7 image=QUJD"
        );
        assert!(lines[4].starts_with("--alice · updated 2h ago"));
        assert_eq!(lines[5], "My pull requests (0) | href=https://github.com/pulls?q=y");
        assert!(text.contains("⚠ Unavailable: My pull requests"));
        assert!(text.ends_with("Refresh | refresh=true\n"));
    }

    #[test]
    fn test_ago_buckets() {
        let now = ts("2024-01-10T00:00:00Z");
        assert_eq!(ago(now, now), "just now");
        assert_eq!(ago(now, ts("2024-01-09T23:30:00Z")), "30m ago");
        assert_eq!(ago(now, ts("2024-01-08T00:00:00Z")), "2d ago");
    }
}
