use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum EntityKind {
    Student,
    Tutor,
    Subject,
    StorageNode,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Student => "student",
            EntityKind::Tutor => "tutor",
            EntityKind::Subject => "subject",
            EntityKind::StorageNode => "storage_node",
        }
    }

    /// Kinds the analysis pipeline evaluates. Subject records are
    /// aggregation-only.
    pub fn is_analyzable(&self) -> bool {
        !matches!(self, EntityKind::Subject)
    }

    pub fn noun(&self) -> &'static str {
        match self {
            EntityKind::Student => "Student",
            EntityKind::Tutor => "Tutor",
            EntityKind::Subject => "Subject",
            EntityKind::StorageNode => "Node",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sparse rolling metrics for one entity. Every field may be absent; readers
/// apply their own documented defaults, the store never fills any in.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    // Rolling session counters and shape.
    pub sessions_7d: Option<f64>,
    pub sessions_14d: Option<f64>,
    pub sessions_30d: Option<f64>,
    pub days_since_last_session: Option<f64>,
    pub sessions_weekend_ratio: Option<f64>,
    pub sessions_evening_ratio: Option<f64>,

    // Engagement.
    pub avg_rating: Option<f64>,
    pub rating_trend: Option<f64>,
    pub rating_volatility: Option<f64>,
    pub avg_session_duration_min: Option<f64>,
    pub total_session_hours_30d: Option<f64>,
    pub engagement_score: Option<f64>,
    pub questions_asked_30d: Option<f64>,
    pub materials_accessed_30d: Option<f64>,

    // Financial (student side).
    pub payment_success_rate_30d: Option<f64>,
    pub payment_failures_30d: Option<f64>,
    pub avg_transaction_value: Option<f64>,
    pub total_revenue_30d: Option<f64>,
    pub payment_method_count: Option<f64>,
    pub days_since_last_payment: Option<f64>,

    // Behavioral.
    pub ib_calls_7d: Option<f64>,
    pub ib_calls_14d: Option<f64>,
    pub cancellation_rate_7d: Option<f64>,
    pub cancellation_rate_30d: Option<f64>,
    pub no_show_rate_30d: Option<f64>,
    pub late_cancellations_30d: Option<f64>,
    pub avg_response_time_hours: Option<f64>,
    pub support_tickets_30d: Option<f64>,
    pub complaints_30d: Option<f64>,

    // Tutor-relationship (student side).
    pub tutor_consistency_score: Option<f64>,
    pub unique_tutors_30d: Option<f64>,
    pub preferred_tutor_ratio: Option<f64>,
    pub tutor_rating_avg: Option<f64>,
    pub tutor_availability_score: Option<f64>,
    pub tutor_subject_expertise_score: Option<f64>,
    pub tutor_match_score: Option<f64>,
    pub tutor_changed_count_30d: Option<f64>,
    pub preferred_tutor_sessions_ratio: Option<f64>,

    // Tutor delivery and workload.
    pub utilization_rate: Option<f64>,
    pub available_hours_week: Option<f64>,
    pub booked_hours_week: Option<f64>,
    pub earnings_30d: Option<f64>,
    pub avg_hourly_rate: Option<f64>,
    pub payout_failures_30d: Option<f64>,
    pub earnings_trend: Option<f64>,
    pub instant_book_ratio: Option<f64>,
    pub refund_rate_30d: Option<f64>,
    pub cancellations_by_tutor_30d: Option<f64>,
    pub reschedule_rate_30d: Option<f64>,
    pub consecutive_teaching_days: Option<f64>,
    pub hours_taught_7d: Option<f64>,
    pub hours_taught_14d: Option<f64>,
    pub response_rate: Option<f64>,

    // Tutor roster.
    pub unique_students_30d: Option<f64>,
    pub repeat_student_ratio: Option<f64>,
    pub retention_rate_30d: Option<f64>,
    pub avg_student_tenure_days: Option<f64>,
    pub new_students_30d: Option<f64>,
    pub sessions_per_student: Option<f64>,
    pub subjects_taught_count: Option<f64>,
    pub preferred_by_students_count: Option<f64>,
    pub student_rating_given_avg: Option<f64>,

    // Aggregator-owned health.
    pub health_score: Option<f64>,

    // Subject supply/demand.
    pub region: Option<String>,
    pub available_tutors: Option<f64>,
    pub active_students: Option<f64>,
    pub demand_score: Option<f64>,
    pub supply_score: Option<f64>,
    pub balance_status: Option<String>,

    // Storage-fabric node counters.
    pub iops: Option<f64>,
    pub latency_ms: Option<f64>,
    pub error_rate_pct: Option<f64>,
    pub throughput_mbps: Option<f64>,
    pub queue_depth: Option<f64>,
    pub active_connections: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub entity_id: String,
    pub entity_type: EntityKind,
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
    #[serde(flatten)]
    pub metrics: Metrics,
}

impl MetricsRecord {
    pub fn new(entity_id: impl Into<String>, entity_type: EntityKind, now: DateTime<Utc>) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_type,
            last_updated: now,
            metrics: Metrics::default(),
        }
    }

    /// Record created on the first event referencing an entity: counters at
    /// zero, full health.
    pub fn bootstrap(
        entity_id: impl Into<String>,
        entity_type: EntityKind,
        now: DateTime<Utc>,
    ) -> Self {
        let mut record = Self::new(entity_id, entity_type, now);
        record.metrics.sessions_7d = Some(0.0);
        record.metrics.sessions_14d = Some(0.0);
        record.metrics.sessions_30d = Some(0.0);
        record.metrics.ib_calls_7d = Some(0.0);
        record.metrics.ib_calls_14d = Some(0.0);
        record.metrics.avg_rating = Some(0.0);
        record.metrics.health_score = Some(100.0);
        record
    }
}

/// Canonical multi-task model output for marketplace entities.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub first_session_success: f64,
    pub session_velocity: f64,
    pub churn_risk_14d: f64,
    pub churn_risk_30d: f64,
    pub health_score: f64,
}

impl Prediction {
    /// Fixed fallback returned whenever inference is unavailable or the
    /// response cannot be parsed.
    pub fn conservative_default() -> Self {
        Self {
            first_session_success: 0.5,
            session_velocity: 0.0,
            churn_risk_14d: 0.5,
            churn_risk_30d: 0.5,
            health_score: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionSource {
    Model,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Segment {
    Thriving,
    Healthy,
    AtRisk,
    Churned,
    Star,
    Churning,
}

impl Segment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Segment::Thriving => "thriving",
            Segment::Healthy => "healthy",
            Segment::AtRisk => "at_risk",
            Segment::Churned => "churned",
            Segment::Star => "star",
            Segment::Churning => "churning",
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discrete risk bucket for storage nodes, from the classifier's 0-3 level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskBand {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskBand {
    pub fn from_level(level: f64) -> Self {
        match (level as i64).clamp(0, 3) {
            0 => RiskBand::Low,
            1 => RiskBand::Medium,
            2 => RiskBand::High,
            _ => RiskBand::Critical,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RiskBand::Low => "LOW",
            RiskBand::Medium => "MEDIUM",
            RiskBand::High => "HIGH",
            RiskBand::Critical => "CRITICAL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionType {
    ChurnRisk,
    CustomerHealth,
    SessionQuality,
    FirstSessionSuccess,
    TutorCapacity,
    MarketplaceBalance,
    CriticalPerformanceIssue,
    PerformanceDegradation,
    AnomalyDetected,
    NormalOperation,
    HighIbCallFrequency,
    LowHealthScore,
    SupplyDemandImbalance,
}

impl PredictionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionType::ChurnRisk => "churn_risk",
            PredictionType::CustomerHealth => "customer_health",
            PredictionType::SessionQuality => "session_quality",
            PredictionType::FirstSessionSuccess => "first_session_success",
            PredictionType::TutorCapacity => "tutor_capacity",
            PredictionType::MarketplaceBalance => "marketplace_balance",
            PredictionType::CriticalPerformanceIssue => "critical_performance_issue",
            PredictionType::PerformanceDegradation => "performance_degradation",
            PredictionType::AnomalyDetected => "anomaly_detected",
            PredictionType::NormalOperation => "normal_operation",
            PredictionType::HighIbCallFrequency => "high_ib_call_frequency",
            PredictionType::LowHealthScore => "low_health_score",
            PredictionType::SupplyDemandImbalance => "supply_demand_imbalance",
        }
    }
}

impl fmt::Display for PredictionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted, explained, scored observation derived from one prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Insight {
    pub insight_id: String,
    pub related_entity: String,
    pub prediction_type: PredictionType,
    pub risk_score: i64,
    pub explanation: String,
    pub recommendations: Vec<String>,
    pub confidence: f64,
    pub model_used: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    HighIbCallFrequency,
    LowHealthScore,
    SupplyDemandImbalance,
    HighRiskDetected,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::HighIbCallFrequency => "high_ib_call_frequency",
            AlertType::LowHealthScore => "low_health_score",
            AlertType::SupplyDemandImbalance => "supply_demand_imbalance",
            AlertType::HighRiskDetected => "high_risk_detected",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub alert_type: AlertType,
    pub severity: Severity,
    pub entity_id: String,
    pub entity_type: EntityKind,
    pub details: serde_json::Value,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingEvent {
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload", rename_all = "snake_case")]
pub enum EventPayload {
    SessionStarted(SessionEvent),
    SessionCompleted(SessionEvent),
    IbCallLogged(IbCallEvent),
    TutorAvailabilityUpdated(TutorAvailabilityEvent),
    CustomerHealthUpdate(HealthUpdateEvent),
    SupplyDemandUpdate(SupplyDemandEvent),
    NodeMetricsReported(NodeMetricsEvent),
}

impl EventPayload {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::SessionStarted(_) => "session_started",
            EventPayload::SessionCompleted(_) => "session_completed",
            EventPayload::IbCallLogged(_) => "ib_call_logged",
            EventPayload::TutorAvailabilityUpdated(_) => "tutor_availability_updated",
            EventPayload::CustomerHealthUpdate(_) => "customer_health_update",
            EventPayload::SupplyDemandUpdate(_) => "supply_demand_update",
            EventPayload::NodeMetricsReported(_) => "node_metrics_reported",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionEvent {
    pub session_id: Option<String>,
    pub student_id: Option<String>,
    pub tutor_id: Option<String>,
    pub subject: Option<String>,
    pub session_type: Option<String>,
    pub scheduled_duration_minutes: Option<f64>,
    pub actual_duration_minutes: Option<f64>,
    pub student_rating: Option<f64>,
    pub tutor_rating: Option<f64>,
    pub completed_successfully: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IbCallEvent {
    pub call_id: Option<String>,
    pub student_id: Option<String>,
    pub reason: Option<String>,
    pub duration_seconds: Option<f64>,
    pub resolved: Option<bool>,
    pub priority: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TutorAvailabilityEvent {
    pub tutor_id: Option<String>,
    pub available_hours_this_week: Option<f64>,
    pub subjects: Option<Vec<String>>,
    pub timezone: Option<String>,
    pub accepts_instant_book: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthUpdateEvent {
    pub student_id: Option<String>,
    pub sessions_last_7_days: Option<f64>,
    pub sessions_last_30_days: Option<f64>,
    pub ib_calls_last_14_days: Option<f64>,
    pub avg_session_rating: Option<f64>,
    pub health_score: Option<f64>,
    pub churn_risk: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SupplyDemandEvent {
    pub subject: Option<String>,
    pub region: Option<String>,
    pub available_tutors: Option<f64>,
    pub active_students: Option<f64>,
    pub demand_score: Option<f64>,
    pub supply_score: Option<f64>,
    pub balance_status: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetricsEvent {
    pub node_id: Option<String>,
    pub iops: Option<f64>,
    pub latency_ms: Option<f64>,
    pub error_rate_pct: Option<f64>,
    pub throughput_mbps: Option<f64>,
    pub queue_depth: Option<f64>,
    pub active_connections: Option<f64>,
}

/// Documented field patch written back after one evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionPatch {
    pub prediction: Prediction,
    pub segment: Segment,
    pub recommendations: Vec<String>,
    pub model_version: String,
    pub prediction_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarketplaceResult {
    pub entity_id: String,
    pub entity_type: EntityKind,
    pub prediction: Prediction,
    pub segment: Segment,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeResult {
    pub entity_id: String,
    pub risk_score: i64,
    pub band: RiskBand,
    pub source: String,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum AnalysisResult {
    Marketplace(MarketplaceResult),
    Node(NodeResult),
}

impl AnalysisResult {
    pub fn entity_id(&self) -> &str {
        match self {
            AnalysisResult::Marketplace(r) => &r.entity_id,
            AnalysisResult::Node(r) => &r.entity_id,
        }
    }

    pub fn segment_label(&self) -> &'static str {
        match self {
            AnalysisResult::Marketplace(r) => r.segment.as_str(),
            AnalysisResult::Node(r) => r.band.label(),
        }
    }
}

/// Aggregates for one batch pass over a single entity kind.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub entity_type: EntityKind,
    pub processed: usize,
    pub segments: BTreeMap<String, usize>,
    pub high_churn_count: usize,
    pub avg_churn_risk: f64,
    pub avg_health_score: f64,
}

impl RunSummary {
    pub fn from_results(entity_type: EntityKind, results: &[AnalysisResult]) -> Self {
        let mut segments: BTreeMap<String, usize> = BTreeMap::new();
        let mut churn_risks = Vec::new();
        let mut health_scores = Vec::new();
        let mut high_churn_count = 0;

        for result in results {
            *segments.entry(result.segment_label().to_string()).or_insert(0) += 1;
            if let AnalysisResult::Marketplace(r) = result {
                if r.prediction.churn_risk_14d > 0.7 {
                    high_churn_count += 1;
                }
                churn_risks.push(r.prediction.churn_risk_14d);
                health_scores.push(r.prediction.health_score);
            }
        }

        let mean = |values: &[f64]| {
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        };

        Self {
            entity_type,
            processed: results.len(),
            segments,
            high_churn_count,
            avg_churn_risk: mean(&churn_risks),
            avg_health_score: mean(&health_scores),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_decode_from_tagged_wire_shape() {
        let raw = r#"{
            "event_type": "session_completed",
            "timestamp": "2026-08-01T12:00:00Z",
            "payload": {
                "session_id": "sess_1",
                "student_id": "stu_1001",
                "tutor_id": "tut_201",
                "tutor_rating": 5,
                "completed_successfully": true
            }
        }"#;

        let event: IncomingEvent = serde_json::from_str(raw).unwrap();
        match &event.payload {
            EventPayload::SessionCompleted(session) => {
                assert_eq!(session.student_id.as_deref(), Some("stu_1001"));
                assert_eq!(session.tutor_rating, Some(5.0));
            }
            other => panic!("unexpected payload: {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_fail_to_decode() {
        let raw = r#"{"event_type": "mystery", "payload": {}}"#;
        assert!(serde_json::from_str::<IncomingEvent>(raw).is_err());
    }

    #[test]
    fn metrics_record_round_trips_sparsely() {
        let mut record = MetricsRecord::bootstrap("stu_1", EntityKind::Student, Utc::now());
        record.metrics.sessions_7d = Some(3.0);

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["entity_type"], "student");
        assert_eq!(value["sessions_7d"], 3.0);

        let back: MetricsRecord = serde_json::from_value(value).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn risk_band_clamps_levels() {
        assert_eq!(RiskBand::from_level(0.0), RiskBand::Low);
        assert_eq!(RiskBand::from_level(1.4), RiskBand::Medium);
        assert_eq!(RiskBand::from_level(2.0), RiskBand::High);
        assert_eq!(RiskBand::from_level(3.0), RiskBand::Critical);
        assert_eq!(RiskBand::from_level(9.0), RiskBand::Critical);
        assert_eq!(RiskBand::from_level(-1.0), RiskBand::Low);
    }
}
