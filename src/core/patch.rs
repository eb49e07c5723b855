use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::diagnose::Diagnosis;
use super::error::StageError;
use super::event::CiEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationStatus {
    Pending,
    SyntacticallyValid,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    pub path: String,
    pub original_excerpt: String,
    pub new_excerpt: String,
}

/// Candidate set of file changes derived from a diagnosis. `rejected`
/// proposals never reach the delivery coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchProposal {
    pub file_changes: Vec<FileChange>,
    pub validation_status: ValidationStatus,
    pub rationale: String,
    /// Warnings for fixes that could not be turned into a concrete change.
    pub dropped: Vec<String>,
}

/// Read-only view of the repository at the failing commit. `Ok(None)`
/// means the path does not exist there.
#[async_trait]
pub trait RepoSnapshot: Send + Sync {
    async fn read_file(
        &self,
        repository: &str,
        commit_sha: &str,
        path: &str,
    ) -> Result<Option<String>, StageError>;
}

const EXCERPT_CHARS: usize = 2000;

/// Turn each suggested fix into a concrete file change. Fixes whose target
/// file cannot be located, or that carry no concrete patch content, are
/// dropped with a recorded warning rather than failing the proposal; a
/// proposal whose every fix was dropped is marked rejected.
pub async fn synthesize(
    repo: &dyn RepoSnapshot,
    event: &CiEvent,
    diagnosis: &Diagnosis,
) -> Result<PatchProposal, StageError> {
    let mut file_changes = Vec::new();
    let mut dropped = Vec::new();

    for fix in &diagnosis.suggested_fixes {
        let Some(patch) = &fix.patch else {
            dropped.push(format!("{}: fix has no concrete patch content", fix.target_file));
            continue;
        };
        match repo
            .read_file(&event.repository, &event.commit_sha, &fix.target_file)
            .await?
        {
            Some(original) => file_changes.push(FileChange {
                path: fix.target_file.clone(),
                original_excerpt: excerpt(&original),
                new_excerpt: patch.clone(),
            }),
            None => {
                dropped.push(format!("{}: not found in repository snapshot", fix.target_file));
            }
        }
    }

    let validation_status = if file_changes.is_empty() {
        ValidationStatus::Rejected
    } else if file_changes
        .iter()
        .all(|c| validate_structure(&c.path, &c.new_excerpt))
    {
        ValidationStatus::SyntacticallyValid
    } else {
        ValidationStatus::Rejected
    };

    Ok(PatchProposal {
        file_changes,
        validation_status,
        rationale: diagnosis.summary.clone(),
        dropped,
    })
}

/// Lightweight structural check on proposed content, by file extension.
/// Formats we can parse are parsed; everything else gets a bracket-balance
/// check. This is not a semantic review, only a guard against obviously
/// broken output.
pub fn validate_structure(path: &str, content: &str) -> bool {
    let ext = path.rsplit('.').next().unwrap_or_default().to_lowercase();
    match ext.as_str() {
        "json" => serde_json::from_str::<serde_json::Value>(content).is_ok(),
        "yml" | "yaml" => serde_yaml::from_str::<serde_yaml::Value>(content).is_ok(),
        "toml" => content.parse::<toml::Value>().is_ok(),
        _ => brackets_balanced(content),
    }
}

fn brackets_balanced(content: &str) -> bool {
    let mut stack = Vec::new();
    let mut in_string: Option<char> = None;
    let mut escaped = false;
    for c in content.chars() {
        if let Some(quote) = in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == quote {
                in_string = None;
            }
            continue;
        }
        match c {
            '"' | '\'' => in_string = Some(c),
            '{' | '[' | '(' => stack.push(c),
            '}' => {
                if stack.pop() != Some('{') {
                    return false;
                }
            }
            ']' => {
                if stack.pop() != Some('[') {
                    return false;
                }
            }
            ')' => {
                if stack.pop() != Some('(') {
                    return false;
                }
            }
            _ => {}
        }
    }
    stack.is_empty()
}

fn excerpt(content: &str) -> String {
    if content.chars().count() <= EXCERPT_CHARS {
        content.to_string()
    } else {
        content.chars().take(EXCERPT_CHARS).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diagnose::{RootCause, SuggestedFix};
    use crate::core::event::{CiSource, RawLogRef};
    use chrono::Utc;
    use std::collections::HashMap;

    struct FakeRepo {
        files: HashMap<String, String>,
    }

    #[async_trait]
    impl RepoSnapshot for FakeRepo {
        async fn read_file(
            &self,
            _repository: &str,
            _commit_sha: &str,
            path: &str,
        ) -> Result<Option<String>, StageError> {
            Ok(self.files.get(path).cloned())
        }
    }

    fn event() -> CiEvent {
        CiEvent {
            event_id: "e1".into(),
            source: CiSource::GithubActions,
            repository: "acme/widgets".into(),
            commit_sha: "abc".into(),
            raw_log_ref: RawLogRef::Inline { text: String::new() },
            build_url: None,
            received_at: Utc::now(),
        }
    }

    fn diagnosis(fixes: Vec<SuggestedFix>) -> Diagnosis {
        Diagnosis {
            summary: "pinned dependency is broken".into(),
            root_cause_category: RootCause::Dependency,
            confidence: 0.9,
            suggested_fixes: fixes,
        }
    }

    #[tokio::test]
    async fn located_fix_becomes_a_valid_change() {
        let repo = FakeRepo {
            files: HashMap::from([(".github/workflows/ci.yml".to_string(), "jobs: {}".to_string())]),
        };
        let d = diagnosis(vec![SuggestedFix {
            target_file: ".github/workflows/ci.yml".into(),
            description: "bump runner image".into(),
            patch: Some("jobs:\n  build:\n    runs-on: ubuntu-24.04\n".into()),
        }]);
        let proposal = synthesize(&repo, &event(), &d).await.unwrap();
        assert_eq!(proposal.validation_status, ValidationStatus::SyntacticallyValid);
        assert_eq!(proposal.file_changes.len(), 1);
        assert!(proposal.dropped.is_empty());
    }

    #[tokio::test]
    async fn missing_target_files_are_dropped_not_fatal() {
        let repo = FakeRepo {
            files: HashMap::from([("Cargo.toml".to_string(), "[package]".to_string())]),
        };
        let d = diagnosis(vec![
            SuggestedFix {
                target_file: "no/such/file.txt".into(),
                description: "fix".into(),
                patch: Some("content".into()),
            },
            SuggestedFix {
                target_file: "Cargo.toml".into(),
                description: "pin version".into(),
                patch: Some("[package]\nname = \"x\"\n".into()),
            },
        ]);
        let proposal = synthesize(&repo, &event(), &d).await.unwrap();
        assert_eq!(proposal.file_changes.len(), 1);
        assert_eq!(proposal.dropped.len(), 1);
        assert_eq!(proposal.validation_status, ValidationStatus::SyntacticallyValid);
    }

    #[tokio::test]
    async fn all_fixes_dropped_rejects_the_proposal() {
        let repo = FakeRepo { files: HashMap::new() };
        let d = diagnosis(vec![SuggestedFix {
            target_file: "ghost.yml".into(),
            description: "fix".into(),
            patch: Some("a: 1".into()),
        }]);
        let proposal = synthesize(&repo, &event(), &d).await.unwrap();
        assert!(proposal.file_changes.is_empty());
        assert_eq!(proposal.validation_status, ValidationStatus::Rejected);
    }

    #[tokio::test]
    async fn structurally_broken_content_rejects_the_proposal() {
        let repo = FakeRepo {
            files: HashMap::from([("config.json".to_string(), "{}".to_string())]),
        };
        let d = diagnosis(vec![SuggestedFix {
            target_file: "config.json".into(),
            description: "fix".into(),
            patch: Some("{\"unterminated\": ".into()),
        }]);
        let proposal = synthesize(&repo, &event(), &d).await.unwrap();
        assert_eq!(proposal.validation_status, ValidationStatus::Rejected);
    }

    #[test]
    fn bracket_balance_ignores_string_literals() {
        assert!(validate_structure("build.sh", "echo \"unmatched } is fine\"\n"));
        assert!(!validate_structure("build.sh", "if [ -f x ]; then {\n"));
        assert!(validate_structure("pom.xml", "<project></project>"));
    }

    #[test]
    fn toml_and_yaml_are_parsed() {
        assert!(validate_structure("Cargo.toml", "[package]\nname = \"x\"\n"));
        assert!(!validate_structure("Cargo.toml", "[package\nname ="));
        assert!(validate_structure("ci.yaml", "jobs:\n  build:\n    steps: []\n"));
    }
}
