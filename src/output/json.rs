use anyhow::Result;
use serde::Serialize;

pub fn format_value<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

#[cfg(test)]
mod tests {
    use crate::orchestrator::filters::SkipReason;
    use crate::orchestrator::{CycleReport, CycleSkip, MessageOutcome, ReplyOutcome};

    use super::format_value;

    #[test]
    fn cycle_report_serializes_tagged_outcomes() {
        let report = CycleReport {
            skipped: None,
            fetched: 2,
            candidates: 1,
            outcomes: vec![
                MessageOutcome {
                    id: "a1".into(),
                    outcome: ReplyOutcome::Replied,
                },
                MessageOutcome {
                    id: "b2".into(),
                    outcome: ReplyOutcome::Skipped(SkipReason::NoReply),
                },
            ],
        };

        let value: serde_json::Value =
            serde_json::from_str(&format_value(&report).expect("json")).expect("parse");
        assert!(value.get("skipped").is_none());
        assert_eq!(value["outcomes"][0]["id"], "a1");
        assert_eq!(value["outcomes"][0]["outcome"]["status"], "replied");
        assert_eq!(value["outcomes"][1]["outcome"]["detail"], "no_reply");
    }

    #[test]
    fn skipped_cycle_carries_reason() {
        let report = CycleReport {
            skipped: Some(CycleSkip::ProviderUnavailable("timeout".to_string())),
            ..CycleReport::default()
        };
        let value: serde_json::Value =
            serde_json::from_str(&format_value(&report).expect("json")).expect("parse");
        assert_eq!(value["skipped"]["reason"], "provider_unavailable");
        assert_eq!(value["skipped"]["detail"], "timeout");
    }
}
