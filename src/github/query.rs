//! GraphQL documents and search-filter construction.

/// Search one page of pull requests matching a filter string.
pub const SEARCH_PULLS: &str = r#"
query($q: String!, $n: Int!, $cursor: String) {
  search(query: $q, type: ISSUE, first: $n, after: $cursor) {
    pageInfo { hasNextPage endCursor }
    nodes {
      ... on PullRequest {
        number
        title
        url
        createdAt
        updatedAt
        isDraft
        isInMergeQueue
        reviewDecision
        repository { nameWithOwner }
        author { login avatarUrl(size: 64) }
        comments { totalCount }
        assignees(first: 10) { nodes { login } }
        reviewRequests(first: 20) {
          nodes {
            requestedReviewer {
              ... on User { login }
              ... on Team { slug }
            }
          }
        }
        reactionGroups { viewerHasReacted }
      }
    }
  }
}
"#;

/// Everything enrichment needs about one PR, in a single round-trip.
pub const PULL_ACTIVITY: &str = r#"
query($owner: String!, $name: String!, $number: Int!) {
  repository(owner: $owner, name: $name) {
    pullRequest(number: $number) {
      comments(last: 1) {
        totalCount
        nodes { databaseId author { login } body }
      }
      reviewThreads { totalCount }
      reviews(last: 100) {
        nodes { author { login } state submittedAt }
      }
      timelineItems(last: 20, itemTypes: [REVIEW_REQUESTED_EVENT]) {
        nodes {
          ... on ReviewRequestedEvent {
            createdAt
            requestedReviewer {
              ... on User { login }
              ... on Team { slug }
            }
          }
        }
      }
    }
  }
}
"#;

/// Qualifiers every listing shares.
const BASE_QUALIFIERS: &str = "is:pr is:open archived:false";

/// Build a search filter: shared qualifiers, the repo allowlist, then the
/// section-specific qualifier (may be empty).
pub fn search_filter(repos: &[String], qualifier: &str) -> String {
    let mut parts = vec![BASE_QUALIFIERS.to_string()];
    parts.extend(repos.iter().map(|r| format!("repo:{r}")));
    if !qualifier.is_empty() {
        parts.push(qualifier.to_string());
    }
    parts.join(" ")
}

/// Web URL for a search, used as a section header link.
pub fn search_web_url(filter: &str) -> String {
    let encoded: String = filter
        .bytes()
        .map(|b| match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                (b as char).to_string()
            }
            b' ' => "+".to_string(),
            other => format!("%{other:02X}"),
        })
        .collect();
    format!("https://github.com/pulls?q={encoded}")
}
