use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::diagnose::Diagnosis;
use super::error::StageError;
use super::event::CiEvent;
use super::patch::{PatchProposal, ValidationStatus};
use super::store::Store;

/// Written exactly once per run. `pr_reference` is persisted the moment PR
/// creation succeeds, before the notification goes out, so a crashed or
/// retried delivery never opens a second PR.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeliveryReceipt {
    pub pr_reference: Option<String>,
    pub notification_reference: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
}

/// VCS change-request API with create-or-get semantics keyed by an
/// idempotency token derived from the event id.
#[async_trait]
pub trait ChangeRequestApi: Send + Sync {
    async fn create_or_get(
        &self,
        idempotency_key: &str,
        event: &CiEvent,
        diagnosis: &Diagnosis,
        proposal: &PatchProposal,
    ) -> Result<String, StageError>;
}

/// Notification channel. Returns a delivery reference.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str, pr_reference: Option<&str>) -> Result<String, StageError>;
}

/// Best-effort annotation of the originating build (Jenkins description
/// post-back). Failures never affect pipeline state.
#[async_trait]
pub trait BuildAnnotator: Send + Sync {
    async fn annotate(&self, event: &CiEvent, diagnosis: &Diagnosis) -> Result<(), StageError>;
}

/// Drive one delivery attempt for a run whose patch stage is complete.
///
/// Safe to re-enter: an existing receipt short-circuits, and a persisted
/// `pr_reference` skips PR creation so only the notification is retried.
pub async fn deliver(
    store: &Store,
    vcs: Option<&dyn ChangeRequestApi>,
    notifier: Option<&dyn Notifier>,
    event: &CiEvent,
    diagnosis: &Diagnosis,
    proposal: Option<&PatchProposal>,
    receipt: DeliveryReceipt,
    call_timeout: Duration,
) -> Result<DeliveryReceipt, StageError> {
    if receipt.delivered_at.is_some() {
        info!(event_id = %event.event_id, "delivery already recorded, no-op");
        return Ok(receipt);
    }

    let valid_proposal = proposal.filter(|p| {
        p.validation_status == ValidationStatus::SyntacticallyValid && !p.file_changes.is_empty()
    });

    let mut pr_reference = receipt.pr_reference;
    if pr_reference.is_none() {
        if let (Some(vcs), Some(p)) = (vcs, valid_proposal) {
            let pr = tokio::time::timeout(
                call_timeout,
                vcs.create_or_get(&event.event_id, event, diagnosis, p),
            )
            .await
            .map_err(|_| StageError::Timeout(call_timeout))??;
            info!(event_id = %event.event_id, pr = %pr, "change request opened");
            // Persist before the notification step; a retry must find it.
            store
                .set_pr_reference(&event.event_id, &pr)
                .await
                .map_err(|e| StageError::Transient(e.to_string()))?;
            pr_reference = Some(pr);
        }
    }

    let notification_reference = match notifier {
        Some(notifier) => {
            let text = compose_message(event, diagnosis, pr_reference.as_deref(), valid_proposal);
            let reference =
                tokio::time::timeout(call_timeout, notifier.send(&text, pr_reference.as_deref()))
                    .await
                    .map_err(|_| StageError::Timeout(call_timeout))??;
            info!(event_id = %event.event_id, reference = %reference, "notification sent");
            Some(reference)
        }
        None => None,
    };

    let receipt = DeliveryReceipt {
        pr_reference,
        notification_reference,
        delivered_at: Some(Utc::now()),
    };
    store
        .set_delivery_receipt(&event.event_id, &receipt)
        .await
        .map_err(|e| StageError::Transient(e.to_string()))?;
    Ok(receipt)
}

pub fn compose_message(
    event: &CiEvent,
    diagnosis: &Diagnosis,
    pr_reference: Option<&str>,
    proposal: Option<&PatchProposal>,
) -> String {
    let mut text = format!(
        "*CI failure diagnosed* in `{}`\n*Diagnosis*: {}\n*Root cause*: {}\n*Confidence*: {:.2}\n",
        event.repository,
        diagnosis.summary,
        diagnosis.root_cause_category.as_str(),
        diagnosis.confidence,
    );
    if let Some(url) = &event.build_url {
        text.push_str(&format!("<{}|Open build>\n", url));
    }
    match (pr_reference, proposal) {
        (Some(pr), _) => text.push_str(&format!("Proposed fix: {}\n", pr)),
        (None, Some(_)) => text.push_str("A fix proposal was prepared but no PR was opened.\n"),
        (None, None) => text.push_str("No automated fix proposed; diagnosis only.\n"),
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::diagnose::RootCause;
    use crate::core::event::{CiSource, RawLogRef};

    fn event() -> CiEvent {
        CiEvent {
            event_id: "e1".into(),
            source: CiSource::Jenkins,
            repository: "acme/widgets".into(),
            commit_sha: "abc".into(),
            raw_log_ref: RawLogRef::Inline { text: String::new() },
            build_url: Some("http://jenkins/job/w/1/".into()),
            received_at: Utc::now(),
        }
    }

    fn diagnosis() -> Diagnosis {
        Diagnosis {
            summary: "broken pin".into(),
            root_cause_category: RootCause::Dependency,
            confidence: 0.9,
            suggested_fixes: vec![],
        }
    }

    #[test]
    fn message_mentions_pr_when_present() {
        let text = compose_message(&event(), &diagnosis(), Some("https://pr/1"), None);
        assert!(text.contains("https://pr/1"));
        assert!(text.contains("Open build"));
    }

    #[test]
    fn diagnosis_only_message_says_so() {
        let text = compose_message(&event(), &diagnosis(), None, None);
        assert!(text.contains("diagnosis only"));
    }
}
