use crate::core::event::CiEvent;
use crate::core::extract::ExtractedSummary;

pub fn system_prompt() -> &'static str {
    "You are a senior DevOps engineer diagnosing failing CI builds. \
     Respond with strict JSON only, no prose and no code fences, with keys: \
     summary (one sentence), \
     root_cause_category (one of: dependency, test_flake, config_error, compile_error, infra, unknown), \
     confidence (float 0.0-1.0), \
     suggested_fixes (array, most promising first, each with keys: \
     target_file, description, patch — patch is the complete proposed file content)."
}

pub fn user_prompt(event: &CiEvent, summary: &ExtractedSummary) -> String {
    let mut prompt = format!(
        "CI source: {}\nRepository: {}\nCommit: {}\n",
        event.source.as_str(),
        event.repository,
        if event.commit_sha.is_empty() {
            "unknown"
        } else {
            &event.commit_sha
        },
    );
    if summary.low_confidence {
        prompt.push_str(
            "Note: no clear failure signal was found in the log; the excerpt below is the raw tail.\n",
        );
    }
    prompt.push_str("\nFailing build log excerpt:\n");
    prompt.push_str(&summary.text);
    prompt
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{CiSource, RawLogRef};
    use chrono::Utc;

    #[test]
    fn user_prompt_carries_metadata_and_excerpt() {
        let event = CiEvent {
            event_id: "e1".into(),
            source: CiSource::Jenkins,
            repository: "acme/widgets".into(),
            commit_sha: "abc123".into(),
            raw_log_ref: RawLogRef::Inline { text: String::new() },
            build_url: None,
            received_at: Utc::now(),
        };
        let summary = ExtractedSummary {
            text: "FATAL: boom".into(),
            low_confidence: false,
            lines_scanned: 10,
        };
        let p = user_prompt(&event, &summary);
        assert!(p.contains("jenkins"));
        assert!(p.contains("acme/widgets"));
        assert!(p.contains("FATAL: boom"));
    }
}
