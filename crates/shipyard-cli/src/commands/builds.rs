//! Build commands.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use shipyard_core::{BuildId, BuildRecord, LogEntry};

use super::ApiClient;

#[derive(Debug, Serialize)]
struct SubmitBody {
    repository_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    commit_hash: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    submitter_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    build_id: BuildId,
    message: String,
}

pub async fn submit(
    client: &ApiClient,
    repository: &str,
    branch: Option<String>,
    commit: Option<String>,
    submitter: Option<String>,
) -> Result<()> {
    let body = SubmitBody {
        repository_url: repository.to_string(),
        branch,
        commit_hash: commit,
        submitter_id: submitter,
    };
    let response: SubmitResponse = client.post("/builds", &body).await?;
    println!("{}", response.message);
    println!("Build ID: {}", response.build_id);
    Ok(())
}

pub async fn status(client: &ApiClient, id: &str) -> Result<()> {
    let record: BuildRecord = client.get(&format!("/builds/{}", id)).await?;
    print!("{}", describe(&record));
    Ok(())
}

pub async fn logs(client: &ApiClient, id: &str) -> Result<()> {
    let lines: Vec<LogEntry> = client.get(&format!("/builds/{}/logs", id)).await?;
    for entry in lines {
        println!("{} {}", entry.emitted_at.format("%H:%M:%S%.3f"), entry.line);
    }
    Ok(())
}

pub async fn list(client: &ApiClient, limit: u32) -> Result<()> {
    let builds: Vec<BuildRecord> = client.get(&format!("/builds?limit={}", limit)).await?;
    if builds.is_empty() {
        println!("No builds");
        return Ok(());
    }
    println!("{:<36}  {:<9}  {:<19}  REPOSITORY", "ID", "PHASE", "CREATED");
    for record in &builds {
        println!("{}", row(record));
    }
    Ok(())
}

fn row(record: &BuildRecord) -> String {
    format!(
        "{:<36}  {:<9}  {:<19}  {}",
        record.id.to_string(),
        record.phase.as_str(),
        record.created_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        record.repository_url
    )
}

fn describe(record: &BuildRecord) -> String {
    let mut out = String::new();
    let mut field = |name: &str, value: &str| {
        out.push_str(&format!("{:<12} {}\n", format!("{}:", name), value));
    };
    field("Build", &record.id.to_string());
    field("Repository", &record.repository_url);
    if let Some(branch) = &record.branch {
        field("Branch", branch);
    }
    if let Some(commit) = &record.commit_hash {
        field("Commit", commit);
    }
    field("Submitter", &record.submitter_id);
    field("Phase", record.phase.as_str());
    field("Message", &record.status_message);
    if let Some(artifact) = &record.artifact_reference {
        field("Artifact", artifact);
    }
    if let Some(ms) = record.duration_ms {
        field("Duration", &format!("{:.1}s", ms as f64 / 1000.0));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use shipyard_core::{BuildRequest, Outcome, ProgressEvent};

    #[test]
    fn test_describe_finished_build() {
        let request = BuildRequest::new("https://github.com/acme/widget.git", "user-1")
            .with_branch("main");
        let mut record = BuildRecord::queued(&request);
        record.apply(&ProgressEvent::completed(
            request.id,
            Outcome::Succeeded,
            Some("http://storage:8084/artifacts/x".to_string()),
            2500,
        ));

        let text = describe(&record);
        assert!(text.contains("Branch:      main\n"));
        assert!(text.contains("Phase:       succeeded\n"));
        assert!(text.contains("Artifact:    http://storage:8084/artifacts/x\n"));
        assert!(text.contains("Duration:    2.5s\n"));
        assert!(!text.contains("Commit:"));
    }

    #[test]
    fn test_row_starts_with_id() {
        let request = BuildRequest::new("https://github.com/acme/widget.git", "user-1");
        let record = BuildRecord::queued(&request);
        let line = row(&record);
        assert!(line.starts_with(&request.id.to_string()));
        assert!(line.contains("queued"));
        assert!(line.ends_with("https://github.com/acme/widget.git"));
    }
}
