//! Resolution of the initial file or workspace location for a session.

use workbench_client::StartPath;

/// One prioritized source of a start location. `workspace` is only omitted
/// for the command-line path candidate, where it is inferred by probing the
/// filesystem.
#[derive(Debug, Clone)]
pub struct StartPathCandidate {
    pub urls: Vec<String>,
    pub workspace: Option<bool>,
}

impl StartPathCandidate {
    pub fn workspace(urls: Vec<String>) -> Self {
        Self {
            urls,
            workspace: Some(true),
        }
    }

    pub fn folder(urls: Vec<String>) -> Self {
        Self {
            urls,
            workspace: Some(false),
        }
    }

    /// A plain filesystem path; whether it is a workspace gets probed.
    pub fn path(url: String) -> Self {
        Self {
            urls: vec![url],
            workspace: None,
        }
    }
}

impl From<StartPath> for StartPathCandidate {
    fn from(last_visited: StartPath) -> Self {
        Self {
            urls: vec![last_visited.url],
            workspace: Some(last_visited.workspace),
        }
    }
}

/// Chooses the first candidate, in the given order, whose URL is non-empty.
///
/// Within a candidate the first non-empty URL value wins. Returns `None`
/// when no candidate yields one.
pub async fn resolve_start_path(
    candidates: Vec<Option<StartPathCandidate>>,
) -> Option<StartPath> {
    for candidate in candidates.into_iter().flatten() {
        let Some(url) = candidate.urls.iter().find(|url| !url.is_empty()) else {
            continue;
        };
        let workspace = match candidate.workspace {
            Some(workspace) => workspace,
            // A single file means a file session; anything else (including
            // probe failures) is treated as a workspace.
            None => !is_file(url).await,
        };
        return Some(StartPath {
            url: url.clone(),
            workspace,
        });
    }
    None
}

async fn is_file(path: &str) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata.is_file(),
        Err(err) => {
            tracing::warn!(error = %err, path, "start path probe failed");
            false
        }
    }
}
