use std::collections::BTreeMap;
use std::fmt::Write;

use chrono::{DateTime, Utc};

use crate::models::Insight;
use crate::store::SegmentSnapshot;

/// Markdown summary of the current segment assignments and the most recent
/// insights, for the operations channel.
pub fn build_report(
    segments: &[SegmentSnapshot],
    insights: &[Insight],
    generated_at: DateTime<Utc>,
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Marketplace Health Report");
    let _ = writeln!(output, "Generated {}", generated_at.format("%Y-%m-%d %H:%M UTC"));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Segment Mix");

    if segments.is_empty() {
        let _ = writeln!(output, "No analyzed entities yet.");
    } else {
        let mut mix: BTreeMap<(&str, &str), usize> = BTreeMap::new();
        for snapshot in segments {
            *mix.entry((snapshot.entity_type.as_str(), snapshot.segment.as_str()))
                .or_insert(0) += 1;
        }
        for ((entity_type, segment), count) in mix {
            let _ = writeln!(output, "- {entity_type} / {segment}: {count}");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Highest Risk Insights");

    let mut ranked: Vec<&Insight> = insights.iter().collect();
    ranked.sort_by(|a, b| b.risk_score.cmp(&a.risk_score));

    if ranked.is_empty() {
        let _ = writeln!(output, "No insights recorded yet.");
    } else {
        for insight in ranked.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} ({}) risk {}/100, confidence {:.2}, model {}",
                insight.related_entity,
                insight.prediction_type,
                insight.risk_score,
                insight.confidence,
                insight.model_used,
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Insight Notes");

    if insights.is_empty() {
        let _ = writeln!(output, "No insights recorded yet.");
    } else {
        let mut recent: Vec<&Insight> = insights.iter().collect();
        recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        for insight in recent.iter().take(5) {
            let _ = writeln!(
                output,
                "- {} on {}: {}",
                insight.related_entity,
                insight.created_at.format("%Y-%m-%d"),
                insight.explanation,
            );
        }
    }

    output
}
