use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;
use vigil_batch::collaborators::SourceOfRecord;
use vigil_core::{
    ChangeSet, FileChange, FileChangeKind, GitLabConfig, PublishReceipt, UnitMetadata, UnitState,
    VigilError,
};

use crate::transport::{ensure_success, transport_error};

/// GitLab REST v4 client acting as the source of merge requests.
///
/// Merge requests are addressed by project path (`group/project`) or numeric
/// id plus the merge request iid.
///
/// # Examples
///
/// ```
/// use vigil_core::GitLabConfig;
/// use vigil_review::gitlab::GitLabClient;
///
/// let client = GitLabClient::new(&GitLabConfig::default()).unwrap();
/// assert_eq!(client.api_base(), "https://gitlab.com/api/v4");
/// ```
pub struct GitLabClient {
    http: reqwest::Client,
    api_base: String,
    token: Option<String>,
}

impl GitLabClient {
    /// Create a client for the instance at `config.url`.
    ///
    /// # Errors
    ///
    /// Returns [`VigilError::Config`] if the HTTP client cannot be built.
    pub fn new(config: &GitLabConfig) -> Result<Self, VigilError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent("vigil")
            .build()
            .map_err(|e| VigilError::Config(format!("failed to create GitLab client: {e}")))?;
        Ok(Self {
            http,
            api_base: format!("{}/api/v4", config.url.trim_end_matches('/')),
            token: config.token.clone(),
        })
    }

    /// Base URL of the REST API, without trailing slash.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    /// Project paths contain `/`, so they travel as one percent-encoded segment.
    fn project_url(&self, project: &str) -> String {
        format!("{}/projects/{}", self.api_base, urlencoding::encode(project))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("PRIVATE-TOKEN", token),
            None => request,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        context: &str,
        request: reqwest::RequestBuilder,
    ) -> Result<T, VigilError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(|e| transport_error(context, e))?;
        let response = ensure_success(context, response).await?;
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(context, e))?;
        serde_json::from_str(&text)
            .map_err(|e| VigilError::InvalidInput(format!("{context}: unexpected response: {e}")))
    }
}

#[async_trait]
impl SourceOfRecord for GitLabClient {
    async fn list_units(
        &self,
        collection_id: &str,
        state: UnitState,
        max_count: usize,
    ) -> Result<Vec<UnitMetadata>, VigilError> {
        let url = format!("{}/merge_requests", self.project_url(collection_id));
        let per_page = max_count.clamp(1, 100).to_string();
        let state = state.to_string();
        let request = self.http.get(&url).query(&[
            ("state", state.as_str()),
            ("per_page", per_page.as_str()),
            ("order_by", "updated_at"),
            ("sort", "desc"),
        ]);
        let merge_requests: Vec<MergeRequest> =
            self.get_json("list merge requests", request).await?;
        debug!(
            project = collection_id,
            count = merge_requests.len(),
            "listed merge requests"
        );
        Ok(merge_requests
            .into_iter()
            .take(max_count)
            .map(UnitMetadata::from)
            .collect())
    }

    async fn get_unit(
        &self,
        collection_id: &str,
        unit_id: u64,
    ) -> Result<UnitMetadata, VigilError> {
        let url = format!("{}/merge_requests/{unit_id}", self.project_url(collection_id));
        let merge_request: MergeRequest = self
            .get_json("fetch merge request", self.http.get(&url))
            .await?;
        Ok(merge_request.into())
    }

    async fn get_change_set(
        &self,
        collection_id: &str,
        unit_id: u64,
    ) -> Result<ChangeSet, VigilError> {
        let url = format!(
            "{}/merge_requests/{unit_id}/changes",
            self.project_url(collection_id)
        );
        let changes: MergeRequestChanges = self
            .get_json("fetch merge request changes", self.http.get(&url))
            .await?;
        Ok(changes.into_change_set(unit_id))
    }

    async fn publish(
        &self,
        collection_id: &str,
        unit_id: u64,
        text: &str,
    ) -> Result<PublishReceipt, VigilError> {
        let url = format!(
            "{}/merge_requests/{unit_id}/notes",
            self.project_url(collection_id)
        );
        let request = self
            .http
            .post(&url)
            .json(&serde_json::json!({ "body": text }));
        let note: Note = self.get_json("post merge request note", request).await?;
        debug!(project = collection_id, unit = unit_id, note = note.id, "posted note");
        Ok(PublishReceipt { id: note.id })
    }
}

/// Split a merge request web URL into project path and iid.
///
/// Accepts `https://host/group/sub/project/-/merge_requests/42`.
///
/// # Errors
///
/// Returns [`VigilError::InvalidInput`] if `url` does not point at a merge request.
///
/// # Examples
///
/// ```
/// use vigil_review::gitlab::parse_merge_request_url;
///
/// let (project, iid) =
///     parse_merge_request_url("https://gitlab.com/acme/web/app/-/merge_requests/42").unwrap();
/// assert_eq!(project, "acme/web/app");
/// assert_eq!(iid, 42);
/// assert!(parse_merge_request_url("https://gitlab.com/acme/app").is_err());
/// ```
pub fn parse_merge_request_url(url: &str) -> Result<(String, u64), VigilError> {
    let invalid = |reason: &str| {
        VigilError::InvalidInput(format!("cannot parse merge request URL '{url}': {reason}"))
    };
    let parsed = reqwest::Url::parse(url).map_err(|e| invalid(&e.to_string()))?;
    let segments: Vec<&str> = parsed
        .path_segments()
        .map(|segments| segments.filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();
    match segments.as_slice() {
        [project @ .., "-", "merge_requests", iid] if !project.is_empty() => {
            let iid = iid
                .parse()
                .map_err(|_| invalid("merge request id is not a number"))?;
            Ok((project.join("/"), iid))
        }
        _ => Err(invalid("expected <project>/-/merge_requests/<iid>")),
    }
}

#[derive(Debug, Deserialize)]
struct MergeRequest {
    iid: u64,
    title: String,
    description: Option<String>,
    author: Option<Author>,
    #[serde(default)]
    labels: Vec<String>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    source_branch: String,
    #[serde(default)]
    target_branch: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    work_in_progress: bool,
    #[serde(default)]
    upvotes: u32,
}

#[derive(Debug, Deserialize)]
struct Author {
    username: String,
}

impl From<MergeRequest> for UnitMetadata {
    fn from(mr: MergeRequest) -> Self {
        UnitMetadata {
            id: mr.iid,
            title: mr.title,
            description: mr.description.unwrap_or_default(),
            author: mr.author.map(|a| a.username).unwrap_or_default(),
            labels: mr.labels,
            created_at: mr.created_at,
            source_branch: mr.source_branch,
            target_branch: mr.target_branch,
            draft: mr.draft || mr.work_in_progress,
            upvotes: mr.upvotes,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MergeRequestChanges {
    #[serde(default)]
    changes: Vec<Change>,
}

impl MergeRequestChanges {
    fn into_change_set(self, unit_id: u64) -> ChangeSet {
        ChangeSet {
            unit_id,
            changes: self.changes.into_iter().map(FileChange::from).collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Change {
    #[serde(default)]
    old_path: String,
    #[serde(default)]
    new_path: String,
    #[serde(default)]
    diff: String,
    #[serde(default)]
    new_file: bool,
    #[serde(default)]
    deleted_file: bool,
    #[serde(default)]
    renamed_file: bool,
}

impl From<Change> for FileChange {
    fn from(change: Change) -> Self {
        let kind = if change.new_file {
            FileChangeKind::Added
        } else if change.deleted_file {
            FileChangeKind::Deleted
        } else if change.renamed_file {
            FileChangeKind::Renamed
        } else {
            FileChangeKind::Modified
        };
        FileChange {
            old_path: change.old_path,
            new_path: change.new_path,
            diff: change.diff,
            kind,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Note {
    id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_request_maps_to_metadata() {
        let json = r#"{
            "iid": 17,
            "title": "Add OAuth login",
            "description": null,
            "author": { "username": "dana", "name": "Dana" },
            "labels": ["security", "backend"],
            "created_at": "2024-03-01T09:30:00.000Z",
            "source_branch": "feature/oauth",
            "target_branch": "main",
            "state": "opened"
        }"#;
        let mr: MergeRequest = serde_json::from_str(json).unwrap();
        let meta = UnitMetadata::from(mr);
        assert_eq!(meta.id, 17);
        assert_eq!(meta.author, "dana");
        assert_eq!(meta.description, "");
        assert_eq!(meta.labels, vec!["security", "backend"]);
        assert_eq!(meta.source_branch, "feature/oauth");
        assert_eq!(meta.created_at.to_rfc3339(), "2024-03-01T09:30:00+00:00");
    }

    #[test]
    fn change_flags_map_to_kind() {
        let json = r#"{ "changes": [
            { "old_path": "a.rs", "new_path": "a.rs", "diff": "+x", "new_file": true },
            { "old_path": "b.rs", "new_path": "b.rs", "diff": "-y", "deleted_file": true },
            { "old_path": "c.rs", "new_path": "d.rs", "diff": "", "renamed_file": true },
            { "old_path": "e.rs", "new_path": "e.rs", "diff": "+z" }
        ] }"#;
        let changes: MergeRequestChanges = serde_json::from_str(json).unwrap();
        let set = changes.into_change_set(5);
        assert_eq!(set.unit_id, 5);
        let kinds: Vec<_> = set.changes.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                FileChangeKind::Added,
                FileChangeKind::Deleted,
                FileChangeKind::Renamed,
                FileChangeKind::Modified,
            ]
        );
        assert_eq!(set.changes[2].path(), "d.rs");
    }

    #[test]
    fn missing_changes_is_empty_set() {
        let changes: MergeRequestChanges = serde_json::from_str("{}").unwrap();
        assert!(changes.into_change_set(1).changes.is_empty());
    }

    #[test]
    fn project_path_is_encoded() {
        let client = GitLabClient::new(&GitLabConfig::default()).unwrap();
        assert_eq!(
            client.project_url("my group/proj"),
            "https://gitlab.com/api/v4/projects/my%20group%2Fproj"
        );
        assert_eq!(
            client.project_url("1234"),
            "https://gitlab.com/api/v4/projects/1234"
        );
    }

    #[test]
    fn draft_and_wip_both_mark_draft() {
        let json = r#"{
            "iid": 2, "title": "WIP: refactor", "created_at": "2024-03-01T09:30:00Z",
            "work_in_progress": true, "upvotes": 3
        }"#;
        let meta = UnitMetadata::from(serde_json::from_str::<MergeRequest>(json).unwrap());
        assert!(meta.draft);
        assert_eq!(meta.upvotes, 3);
        assert_eq!(meta.author, "");
    }

    #[test]
    fn merge_request_urls() {
        assert_eq!(
            parse_merge_request_url("https://git.example.com/team/app/-/merge_requests/7/")
                .unwrap(),
            ("team/app".to_string(), 7)
        );
        for bad in [
            "not a url",
            "https://gitlab.com/-/merge_requests/3",
            "https://gitlab.com/team/app/-/merge_requests/abc",
            "https://gitlab.com/team/app/-/issues/3",
        ] {
            let err = parse_merge_request_url(bad).unwrap_err();
            assert!(matches!(err, VigilError::InvalidInput(_)), "{bad}");
        }
    }

    #[test]
    fn trailing_slash_is_trimmed_from_base() {
        let config = GitLabConfig {
            url: "https://git.example.com/".into(),
            ..GitLabConfig::default()
        };
        let client = GitLabClient::new(&config).unwrap();
        assert_eq!(client.api_base(), "https://git.example.com/api/v4");
        assert_eq!(
            client.project_url("team/app"),
            "https://git.example.com/api/v4/projects/team%2Fapp"
        );
    }
}
