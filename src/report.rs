use std::fmt::Write;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::{Mode, SendResult, SendStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
}

pub fn summarize(results: &[SendResult]) -> RunSummary {
    let sent = results
        .iter()
        .filter(|result| result.status == SendStatus::Success)
        .count();
    RunSummary {
        total: results.len(),
        sent,
        failed: results.len() - sent,
    }
}

pub fn build_report(
    run_id: Uuid,
    mode: Mode,
    template_name: &str,
    finished_at: DateTime<Utc>,
    results: &[SendResult],
) -> String {
    let summary = summarize(results);
    let mut output = String::new();

    let _ = writeln!(output, "# Notification Dispatch Report");
    let _ = writeln!(
        output,
        "Run {} ({} mode, template `{}`) finished {}",
        run_id,
        mode,
        template_name,
        finished_at.format("%Y-%m-%d %H:%M UTC")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Summary");
    let _ = writeln!(output, "- Recipients: {}", summary.total);
    let _ = writeln!(output, "- Sent: {}", summary.sent);
    let _ = writeln!(output, "- Failed: {}", summary.failed);

    let _ = writeln!(output);
    let _ = writeln!(output, "## Failures");
    let failures: Vec<&SendResult> = results
        .iter()
        .filter(|result| result.status == SendStatus::Failed)
        .collect();
    if failures.is_empty() {
        let _ = writeln!(output, "No failed deliveries.");
    } else {
        for failure in failures {
            let _ = writeln!(output, "- {}: {}", failure.student_name, failure.message);
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## All Recipients");
    if results.is_empty() {
        let _ = writeln!(output, "No rows were dispatched.");
    } else {
        let _ = writeln!(output, "| # | Student | Status | Message |");
        let _ = writeln!(output, "|---|---------|--------|---------|");
        for (index, result) in results.iter().enumerate() {
            let _ = writeln!(
                output,
                "| {} | {} | {} | {} |",
                index + 1,
                escape_cell(&result.student_name),
                result.status,
                escape_cell(&result.message)
            );
        }
    }

    output
}

fn escape_cell(value: &str) -> String {
    value.replace('|', "\\|").replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn result(name: &str, status: SendStatus, message: &str) -> SendResult {
        SendResult {
            student_name: name.to_string(),
            status,
            message: message.to_string(),
        }
    }

    #[test]
    fn summary_counts_outcomes() {
        let results = vec![
            result("Asha", SendStatus::Success, "Sent successfully"),
            result("Bo", SendStatus::Failed, "Invalid token"),
            result("Cy", SendStatus::Success, "Sent successfully"),
        ];
        assert_eq!(
            summarize(&results),
            RunSummary {
                total: 3,
                sent: 2,
                failed: 1
            }
        );
    }

    #[test]
    fn report_lists_failures_and_every_row() {
        let results = vec![
            result("Asha", SendStatus::Success, "Sent successfully"),
            result("Bo", SendStatus::Failed, "Invalid | token"),
        ];
        let finished = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        let report = build_report(Uuid::nil(), Mode::Fees, "fee_reminder", finished, &results);

        assert!(report.contains("fees mode, template `fee_reminder`"));
        assert!(report.contains("2024-05-01 09:30 UTC"));
        assert!(report.contains("- Failed: 1"));
        assert!(report.contains("- Bo: Invalid | token"));
        assert!(report.contains("| 2 | Bo | failed | Invalid \\| token |"));
    }

    #[test]
    fn empty_run_says_so() {
        let finished = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        let report = build_report(Uuid::nil(), Mode::Grades, "marks_report", finished, &[]);
        assert!(report.contains("No failed deliveries."));
        assert!(report.contains("No rows were dispatched."));
    }
}
