use crate::models::{Metrics, PredictionType, RiskBand};

/// Where a node assessment came from, in fallback order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnalysisSource {
    Classifier,
    Llm,
    Rules,
}

impl AnalysisSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisSource::Classifier => "classifier",
            AnalysisSource::Llm => "llm",
            AnalysisSource::Rules => "rules-based",
        }
    }

    pub fn confidence(&self) -> f64 {
        match self {
            AnalysisSource::Classifier => 0.95,
            AnalysisSource::Llm => 0.88,
            AnalysisSource::Rules => 0.75,
        }
    }
}

/// Scored analysis for one storage node. The classifier path supplies only
/// the risk level; explanation and recommendations are derived here from
/// metric thresholds, not from the model.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeAssessment {
    pub risk_score: i64,
    pub analysis: String,
    pub recommendations: Vec<String>,
}

/// Maps the classifier's 0-3 level onto the 0-100 score scale.
pub fn scale_risk_level(level: f64) -> i64 {
    (level * 33.33).round() as i64
}

pub fn prediction_type_for_score(score: i64) -> PredictionType {
    if score >= 80 {
        PredictionType::CriticalPerformanceIssue
    } else if score >= 60 {
        PredictionType::PerformanceDegradation
    } else if score >= 40 {
        PredictionType::AnomalyDetected
    } else {
        PredictionType::NormalOperation
    }
}

/// Assessment built around a classifier-produced risk level.
pub fn assessment_from_level(level: f64, metrics: &Metrics, node_id: &str) -> NodeAssessment {
    NodeAssessment {
        risk_score: scale_risk_level(level),
        analysis: analysis_from_level(level, metrics, node_id),
        recommendations: recommendations_from_level(level, metrics),
    }
}

fn analysis_from_level(level: f64, m: &Metrics, node_id: &str) -> String {
    let label = RiskBand::from_level(level).label();
    let iops = m.iops.unwrap_or(0.0);
    let latency = m.latency_ms.unwrap_or(0.0);
    let error_rate = m.error_rate_pct.unwrap_or(0.0);
    let queue_depth = m.queue_depth.unwrap_or(0.0);

    let mut issues = Vec::new();
    if iops > 100_000.0 {
        issues.push(format!("high IOPS load ({iops:.0})"));
    }
    if latency > 10.0 {
        issues.push(format!("elevated latency ({latency}ms)"));
    }
    if error_rate > 1.0 {
        issues.push(format!("error rate at {error_rate}%"));
    }
    if queue_depth > 64.0 {
        issues.push(format!("queue saturation (depth: {queue_depth:.0})"));
    }

    let issue_text = if issues.is_empty() {
        String::new()
    } else {
        format!(" Detected: {}.", issues.join(", "))
    };

    format!(
        "Risk classifier predicts {label} risk ({level:.0}/3) for node {node_id}.{issue_text} \
         Based on 25 engineered features including IOPS patterns, latency distribution, \
         error trends, and capacity utilization."
    )
}

fn recommendations_from_level(level: f64, m: &Metrics) -> Vec<String> {
    let iops = m.iops.unwrap_or(0.0);
    let latency = m.latency_ms.unwrap_or(0.0);
    let error_rate = m.error_rate_pct.unwrap_or(0.0);
    let queue_depth = m.queue_depth.unwrap_or(0.0);

    let mut recommendations = Vec::new();

    if level >= 3.0 {
        recommendations.push("CRITICAL: Immediate investigation required".to_string());
        if error_rate > 3.0 {
            recommendations.push("Check for hardware failures or connectivity issues".to_string());
        }
        if latency > 20.0 {
            recommendations
                .push("Network congestion detected - investigate InfiniBand fabric".to_string());
        }
        if iops > 120_000.0 {
            recommendations
                .push("Resource saturation - consider scaling or load balancing".to_string());
        }
    } else if level >= 2.0 {
        recommendations.push("HIGH: Schedule maintenance window for investigation".to_string());
        if latency > 10.0 {
            recommendations
                .push("Monitor latency trends - potential congestion building".to_string());
        }
        if queue_depth > 64.0 {
            recommendations
                .push("Queue depth approaching limits - review workload distribution".to_string());
        }
    } else if level >= 1.0 {
        recommendations.push("MEDIUM: Monitor closely for trend changes".to_string());
        if iops > 80_000.0 {
            recommendations.push("IOPS trending high - prepare capacity plan".to_string());
        }
    } else {
        recommendations.push("LOW: Continue normal monitoring".to_string());
    }

    recommendations
}

/// Deterministic last-resort analysis requiring no external call. Each
/// threshold contributes a fixed score increment, capped at 100.
pub fn rules_based_assessment(metrics: &Metrics, node_id: &str) -> NodeAssessment {
    let iops = metrics.iops.unwrap_or(0.0);
    let latency = metrics.latency_ms.unwrap_or(0.0);
    let error_rate = metrics.error_rate_pct.unwrap_or(0.0);
    let queue_depth = metrics.queue_depth.unwrap_or(0.0);
    let throughput = metrics.throughput_mbps.unwrap_or(0.0);

    let mut risk_score: i64 = 0;
    let mut issues = Vec::new();
    let mut recommendations = Vec::new();

    if iops > 100_000.0 {
        risk_score += 20;
        issues.push(format!("Node {node_id}: High IOPS ({iops:.0})"));
        recommendations.push(format!("Scale out storage for node {node_id}"));
    }
    if latency > 10.0 {
        risk_score += 25;
        issues.push(format!("Node {node_id}: High latency ({latency}ms)"));
        recommendations.push(format!("Investigate network congestion on node {node_id}"));
    }
    if error_rate > 1.0 {
        risk_score += 30;
        issues.push(format!("Node {node_id}: Elevated error rate ({error_rate}%)"));
        recommendations.push(format!("Check hardware health on node {node_id}"));
    }
    if queue_depth > 64.0 {
        risk_score += 15;
        issues.push(format!("Node {node_id}: Queue saturation (depth: {queue_depth:.0})"));
        recommendations.push(format!("Increase queue depth or reduce load on node {node_id}"));
    }
    if throughput < 1_000.0 && iops > 50_000.0 {
        risk_score += 10;
        issues.push(format!("Node {node_id}: Low throughput relative to IOPS"));
        recommendations.push(format!("Optimize block size for node {node_id}"));
    }

    let analysis = if issues.is_empty() {
        "All metrics within acceptable thresholds".to_string()
    } else {
        format!(
            "Rules-based analysis detected {} issue(s): {}",
            issues.len(),
            issues.join("; ")
        )
    };

    if recommendations.is_empty() {
        recommendations.push("Continue monitoring".to_string());
    }

    NodeAssessment {
        risk_score: risk_score.min(100),
        analysis,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hot_metrics() -> Metrics {
        let mut m = Metrics::default();
        m.iops = Some(125_000.0);
        m.latency_ms = Some(22.0);
        m.error_rate_pct = Some(3.5);
        m.throughput_mbps = Some(900.0);
        m.queue_depth = Some(88.0);
        m
    }

    #[test]
    fn classifier_levels_scale_to_percent_scores() {
        assert_eq!(scale_risk_level(0.0), 0);
        assert_eq!(scale_risk_level(1.0), 33);
        assert_eq!(scale_risk_level(2.0), 67);
        assert_eq!(scale_risk_level(3.0), 100);
    }

    #[test]
    fn prediction_type_tiers_by_score() {
        assert_eq!(
            prediction_type_for_score(85),
            PredictionType::CriticalPerformanceIssue
        );
        assert_eq!(
            prediction_type_for_score(67),
            PredictionType::PerformanceDegradation
        );
        assert_eq!(prediction_type_for_score(45), PredictionType::AnomalyDetected);
        assert_eq!(prediction_type_for_score(33), PredictionType::NormalOperation);
    }

    #[test]
    fn level_assessment_names_the_detected_issues() {
        let assessment = assessment_from_level(3.0, &hot_metrics(), "ib-node-02");

        assert_eq!(assessment.risk_score, 100);
        assert!(assessment.analysis.contains("CRITICAL risk (3/3)"));
        assert!(assessment.analysis.contains("high IOPS load (125000)"));
        assert!(assessment.analysis.contains("elevated latency (22ms)"));
        assert!(assessment.analysis.contains("queue saturation (depth: 88)"));

        assert!(assessment.recommendations[0].starts_with("CRITICAL"));
        assert!(assessment
            .recommendations
            .iter()
            .any(|r| r.contains("hardware failures")));
        assert!(assessment
            .recommendations
            .iter()
            .any(|r| r.contains("InfiniBand fabric")));
    }

    #[test]
    fn medium_level_keeps_recommendations_proportionate() {
        let mut m = Metrics::default();
        m.iops = Some(85_000.0);

        let assessment = assessment_from_level(1.0, &m, "ib-node-01");
        assert_eq!(assessment.risk_score, 33);
        assert_eq!(assessment.recommendations.len(), 2);
        assert!(assessment.recommendations[0].starts_with("MEDIUM"));
        assert!(assessment.recommendations[1].contains("capacity plan"));
    }

    #[test]
    fn rules_fallback_sums_threshold_increments() {
        let assessment = rules_based_assessment(&hot_metrics(), "ib-node-02");

        // 20 + 25 + 30 + 15 + 10
        assert_eq!(assessment.risk_score, 100);
        assert!(assessment.analysis.contains("5 issue(s)"));
        assert_eq!(assessment.recommendations.len(), 5);
    }

    #[test]
    fn rules_fallback_is_quiet_on_healthy_nodes() {
        let mut m = Metrics::default();
        m.iops = Some(30_000.0);
        m.latency_ms = Some(3.0);
        m.throughput_mbps = Some(2_000.0);

        let assessment = rules_based_assessment(&m, "ib-node-01");
        assert_eq!(assessment.risk_score, 0);
        assert_eq!(
            assessment.analysis,
            "All metrics within acceptable thresholds"
        );
        assert_eq!(assessment.recommendations, vec!["Continue monitoring"]);
    }

    #[test]
    fn source_confidence_is_fixed_per_provider() {
        assert_eq!(AnalysisSource::Classifier.confidence(), 0.95);
        assert_eq!(AnalysisSource::Llm.confidence(), 0.88);
        assert_eq!(AnalysisSource::Rules.confidence(), 0.75);
    }
}
