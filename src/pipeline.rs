use std::sync::Arc;

use anyhow::bail;
use chrono::{Duration, Utc};
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::features::engineer_features;
use crate::inference::InferenceAdapter;
use crate::insight::{synthesize, INSIGHT_TTL_DAYS};
use crate::llm::LlmRouter;
use crate::models::{
    Alert, AlertType, AnalysisResult, EntityKind, Insight, MarketplaceResult, MetricsRecord,
    NodeResult, PredictionPatch, PredictionSource, RiskBand, RunSummary, Severity,
};
use crate::nodes::{
    assessment_from_level, prediction_type_for_score, rules_based_assessment, AnalysisSource,
};
use crate::recommend::recommend;
use crate::segment::classify;
use crate::store::EntityStore;

/// Node scores at or above this publish a high-risk alert.
const HIGH_RISK_ALERT_THRESHOLD: i64 = 80;

/// Outcome of a single-entity request. Missing entities are a distinct
/// result, not an error.
#[derive(Debug)]
pub enum EntityOutcome {
    Processed(AnalysisResult),
    NotFound,
}

/// One kind's batch pass: the per-entity results that completed plus the
/// aggregate summary.
#[derive(Debug)]
pub struct BatchOutcome {
    pub results: Vec<AnalysisResult>,
    pub summary: RunSummary,
}

/// Orchestrates feature engineering, inference, segmentation,
/// recommendations, and insight persistence per entity. All collaborators
/// are injected once at startup and shared across invocations.
pub struct Pipeline {
    store: Arc<dyn EntityStore>,
    bus: Arc<dyn EventBus>,
    inference: InferenceAdapter,
    classifier: InferenceAdapter,
    llm: LlmRouter,
    model_version: String,
    batch_size: i64,
}

impl Pipeline {
    pub fn new(
        store: Arc<dyn EntityStore>,
        bus: Arc<dyn EventBus>,
        inference: InferenceAdapter,
        classifier: InferenceAdapter,
        llm: LlmRouter,
        model_version: String,
        batch_size: i64,
    ) -> Self {
        Self {
            store,
            bus,
            inference,
            classifier,
            llm,
            model_version,
            batch_size,
        }
    }

    /// Evaluates one entity by id, surfacing a missing row as `NotFound`.
    pub async fn process_entity(
        &self,
        entity_id: &str,
        kind: EntityKind,
    ) -> anyhow::Result<EntityOutcome> {
        match self.store.get_metrics(entity_id, kind).await? {
            None => Ok(EntityOutcome::NotFound),
            Some(record) => Ok(EntityOutcome::Processed(
                self.analyze_record(&record).await?,
            )),
        }
    }

    /// Pages through every entity of the kind. A failing entity is logged
    /// and skipped; the batch always runs to completion.
    pub async fn run_batch(&self, kind: EntityKind) -> anyhow::Result<BatchOutcome> {
        let mut results = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let page = self
                .store
                .query_by_kind(kind, self.batch_size, token.as_deref())
                .await?;

            for record in &page.items {
                match self.analyze_record(record).await {
                    Ok(result) => results.push(result),
                    Err(err) => {
                        error!(entity_id = %record.entity_id, "error processing entity: {err:#}");
                    }
                }
            }

            match page.next_token {
                Some(next) => token = Some(next),
                None => break,
            }
        }

        let summary = RunSummary::from_results(kind, &results);
        info!(
            kind = %kind,
            processed = summary.processed,
            segments = ?summary.segments,
            "completed prediction refresh"
        );
        Ok(BatchOutcome { results, summary })
    }

    /// Full refresh over every analyzable kind.
    pub async fn run_all(&self) -> anyhow::Result<Vec<BatchOutcome>> {
        let mut outcomes = Vec::new();
        for kind in [EntityKind::Student, EntityKind::Tutor, EntityKind::StorageNode] {
            outcomes.push(self.run_batch(kind).await?);
        }
        Ok(outcomes)
    }

    async fn analyze_record(&self, record: &MetricsRecord) -> anyhow::Result<AnalysisResult> {
        match record.entity_type {
            EntityKind::Student | EntityKind::Tutor => self.analyze_marketplace(record).await,
            EntityKind::StorageNode => self.analyze_node(record).await,
            EntityKind::Subject => bail!("subject entities are aggregation-only"),
        }
    }

    async fn analyze_marketplace(
        &self,
        record: &MetricsRecord,
    ) -> anyhow::Result<AnalysisResult> {
        let now = Utc::now();
        let kind = record.entity_type;
        let features = engineer_features(record, kind, now);

        let (mut prediction, source) = self.inference.predict(&features).await;
        if source == PredictionSource::Fallback {
            // A stored health score takes precedence over the default's 50
            // for classification.
            if let Some(health) = record.metrics.health_score {
                prediction.health_score = health;
            }
        }

        let segment = classify(&prediction, kind);
        let recommendations = recommend(&record.metrics, &prediction, segment, kind);

        self.store
            .apply_predictions(
                &record.entity_id,
                kind,
                &PredictionPatch {
                    prediction,
                    segment,
                    recommendations: recommendations.clone(),
                    model_version: self.model_version.clone(),
                    prediction_timestamp: now,
                },
            )
            .await?;

        let insights = synthesize(
            &record.entity_id,
            kind,
            &prediction,
            segment,
            &recommendations,
            &record.metrics,
            now,
            &self.model_version,
        );
        for insight in &insights {
            if let Err(err) = self.store.put_insight(insight).await {
                warn!(
                    entity_id = %record.entity_id,
                    prediction_type = %insight.prediction_type,
                    "failed to persist insight: {err}"
                );
            }
        }

        info!(
            entity_id = %record.entity_id,
            segment = %segment,
            churn_14d = prediction.churn_risk_14d,
            health = prediction.health_score,
            insights = insights.len(),
            "updated predictions"
        );

        Ok(AnalysisResult::Marketplace(MarketplaceResult {
            entity_id: record.entity_id.clone(),
            entity_type: kind,
            prediction,
            segment,
            recommendations,
        }))
    }

    /// Storage nodes walk a provider chain: risk classifier, then LLM, then
    /// deterministic rules. The classifier supplies only the level; its
    /// explanation and recommendations are threshold-derived.
    async fn analyze_node(&self, record: &MetricsRecord) -> anyhow::Result<AnalysisResult> {
        let now = Utc::now();
        let features = engineer_features(record, EntityKind::StorageNode, now);

        let (assessment, source, model_used) =
            match self.classifier.classify_risk(&features).await {
                Ok(level) => (
                    assessment_from_level(level, &record.metrics, &record.entity_id),
                    AnalysisSource::Classifier,
                    self.classifier.name().to_string(),
                ),
                Err(err) => {
                    warn!(
                        entity_id = %record.entity_id,
                        "risk classifier failed, trying completion service: {err}"
                    );
                    match self.llm.node_assessment(record).await {
                        Ok((assessment, model_used)) => {
                            (assessment, AnalysisSource::Llm, model_used)
                        }
                        Err(err) => {
                            warn!(
                                entity_id = %record.entity_id,
                                "completion service failed, using rules-based analysis: {err}"
                            );
                            (
                                rules_based_assessment(&record.metrics, &record.entity_id),
                                AnalysisSource::Rules,
                                AnalysisSource::Rules.as_str().to_string(),
                            )
                        }
                    }
                }
            };

        let insight = Insight {
            insight_id: format!("insight_{}_{}", record.entity_id, now.timestamp_millis()),
            related_entity: record.entity_id.clone(),
            prediction_type: prediction_type_for_score(assessment.risk_score),
            risk_score: assessment.risk_score,
            explanation: assessment.analysis.clone(),
            recommendations: assessment.recommendations.clone(),
            confidence: source.confidence(),
            model_used,
            created_at: now,
            expires_at: now + Duration::days(INSIGHT_TTL_DAYS),
        };
        self.store.put_insight(&insight).await?;

        if assessment.risk_score >= HIGH_RISK_ALERT_THRESHOLD {
            let alert = Alert {
                alert_type: AlertType::HighRiskDetected,
                severity: Severity::Critical,
                entity_id: record.entity_id.clone(),
                entity_type: EntityKind::StorageNode,
                details: serde_json::json!({
                    "risk_score": assessment.risk_score,
                    "analysis": assessment.analysis,
                    "recommendations": assessment.recommendations,
                }),
                message: format!(
                    "High risk detected for node {}: {}/100",
                    record.entity_id, assessment.risk_score
                ),
                timestamp: now,
            };
            if let Err(err) = self.bus.publish_alerts(&[alert]).await {
                warn!(entity_id = %record.entity_id, "failed to publish high-risk alert: {err}");
            }
        }

        Ok(AnalysisResult::Node(NodeResult {
            entity_id: record.entity_id.clone(),
            risk_score: assessment.risk_score,
            band: RiskBand::from_level((assessment.risk_score as f64 / 33.33).round()),
            source: source.as_str().to_string(),
            recommendations: assessment.recommendations,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::recording::RecordingBus;
    use crate::inference::stub::StubEndpoint;
    use crate::models::{PredictionType, Segment};
    use crate::store::memory::MemoryStore;

    fn degraded_student() -> MetricsRecord {
        let mut record = MetricsRecord::bootstrap("stu_1003", EntityKind::Student, Utc::now());
        record.metrics.sessions_7d = Some(0.0);
        record.metrics.sessions_14d = Some(0.0);
        record.metrics.sessions_30d = Some(0.0);
        record.metrics.health_score = Some(35.0);
        record
    }

    async fn seed_record(store: &MemoryStore, record: &MetricsRecord) {
        store.put_metrics(record).await.unwrap();
    }

    fn pipeline(
        store: Arc<MemoryStore>,
        bus: Arc<RecordingBus>,
        inference: InferenceAdapter,
        classifier: InferenceAdapter,
    ) -> Pipeline {
        Pipeline::new(
            store,
            bus,
            inference,
            classifier,
            LlmRouter::unconfigured(),
            "marketplace-health-v1".to_string(),
            100,
        )
    }

    #[tokio::test]
    async fn degraded_student_with_unavailable_inference_classifies_churned() {
        let store = Arc::new(MemoryStore::default());
        let bus = Arc::new(RecordingBus::default());
        seed_record(&store, &degraded_student()).await;

        let pipeline = pipeline(
            store.clone(),
            bus,
            InferenceAdapter::new(StubEndpoint::failing(), "multitask"),
            InferenceAdapter::unconfigured("classifier"),
        );

        let outcome = pipeline
            .process_entity("stu_1003", EntityKind::Student)
            .await
            .unwrap();

        let result = match outcome {
            EntityOutcome::Processed(AnalysisResult::Marketplace(r)) => r,
            other => panic!("unexpected outcome: {other:?}"),
        };

        // Conservative default prediction, except health follows the store.
        assert_eq!(result.prediction.churn_risk_14d, 0.5);
        assert_eq!(result.prediction.session_velocity, 0.0);
        assert_eq!(result.prediction.health_score, 35.0);
        assert_eq!(result.segment, Segment::Churned);

        assert!(result.recommendations[0].starts_with("HIGH CHURN RISK"));
        assert!(result
            .recommendations
            .iter()
            .any(|r| r.contains("re-engagement")));

        let types: Vec<PredictionType> = store
            .insights()
            .iter()
            .map(|i| i.prediction_type)
            .collect();
        assert!(types.contains(&PredictionType::ChurnRisk));
        assert!(types.contains(&PredictionType::CustomerHealth));
        assert!(types.contains(&PredictionType::SessionQuality));

        let patch = store.patched("stu_1003", EntityKind::Student).unwrap();
        assert_eq!(patch.segment, Segment::Churned);
    }

    #[tokio::test]
    async fn model_predictions_flow_through_unmodified() {
        let store = Arc::new(MemoryStore::default());
        let bus = Arc::new(RecordingBus::default());

        let mut record = MetricsRecord::bootstrap("stu_1001", EntityKind::Student, Utc::now());
        record.metrics.health_score = Some(35.0);
        seed_record(&store, &record).await;

        let endpoint = StubEndpoint::returning(vec![serde_json::json!({
            "predictions": [[0.9, 2.5, 0.05, 0.1, 92.0]]
        })]);
        let pipeline = pipeline(
            store.clone(),
            bus,
            InferenceAdapter::new(endpoint, "multitask"),
            InferenceAdapter::unconfigured("classifier"),
        );

        let outcome = pipeline
            .process_entity("stu_1001", EntityKind::Student)
            .await
            .unwrap();

        let result = match outcome {
            EntityOutcome::Processed(AnalysisResult::Marketplace(r)) => r,
            other => panic!("unexpected outcome: {other:?}"),
        };

        // A genuine model output is never overridden by the stored score.
        assert_eq!(result.prediction.health_score, 92.0);
        assert_eq!(result.segment, Segment::Thriving);
    }

    #[tokio::test]
    async fn missing_entity_is_a_distinct_outcome() {
        let store = Arc::new(MemoryStore::default());
        let bus = Arc::new(RecordingBus::default());
        let pipeline = pipeline(
            store,
            bus,
            InferenceAdapter::unconfigured("multitask"),
            InferenceAdapter::unconfigured("classifier"),
        );

        let outcome = pipeline
            .process_entity("stu_missing", EntityKind::Student)
            .await
            .unwrap();
        assert!(matches!(outcome, EntityOutcome::NotFound));
    }

    #[tokio::test]
    async fn batch_skips_failing_entities_and_completes() {
        let store = Arc::new(MemoryStore::default());
        let bus = Arc::new(RecordingBus::default());

        for id in ["stu_1", "stu_2", "stu_3"] {
            seed_record(
                &store,
                &MetricsRecord::bootstrap(id, EntityKind::Student, Utc::now()),
            )
            .await;
        }
        *store.fail_patch_for.lock().unwrap() = Some("stu_2".to_string());

        let pipeline = pipeline(
            store.clone(),
            bus,
            InferenceAdapter::new(StubEndpoint::failing(), "multitask"),
            InferenceAdapter::unconfigured("classifier"),
        );

        let outcome = pipeline.run_batch(EntityKind::Student).await.unwrap();

        assert_eq!(outcome.results.len(), 2);
        assert_eq!(outcome.summary.processed, 2);
        assert!(!outcome
            .results
            .iter()
            .any(|r| r.entity_id() == "stu_2"));
    }

    #[tokio::test]
    async fn batch_paginates_past_the_page_size() {
        let store = Arc::new(MemoryStore::default());
        let bus = Arc::new(RecordingBus::default());

        for id in ["stu_1", "stu_2", "stu_3"] {
            seed_record(
                &store,
                &MetricsRecord::bootstrap(id, EntityKind::Student, Utc::now()),
            )
            .await;
        }

        let mut pipeline = pipeline(
            store.clone(),
            bus,
            InferenceAdapter::new(StubEndpoint::failing(), "multitask"),
            InferenceAdapter::unconfigured("classifier"),
        );
        pipeline.batch_size = 1;

        let outcome = pipeline.run_batch(EntityKind::Student).await.unwrap();
        assert_eq!(outcome.results.len(), 3);
    }

    #[tokio::test]
    async fn batch_summary_counts_segments() {
        let store = Arc::new(MemoryStore::default());
        let bus = Arc::new(RecordingBus::default());

        let mut healthy = MetricsRecord::bootstrap("stu_a", EntityKind::Student, Utc::now());
        healthy.metrics.health_score = Some(75.0);
        let mut gone = MetricsRecord::bootstrap("stu_b", EntityKind::Student, Utc::now());
        gone.metrics.health_score = Some(30.0);
        seed_record(&store, &healthy).await;
        seed_record(&store, &gone).await;

        let pipeline = pipeline(
            store,
            bus,
            InferenceAdapter::new(StubEndpoint::failing(), "multitask"),
            InferenceAdapter::unconfigured("classifier"),
        );

        let outcome = pipeline.run_batch(EntityKind::Student).await.unwrap();
        // Fallback churn 0.5 puts the healthy-store student at_risk; the
        // degraded one drops to churned on the stored health score.
        assert_eq!(outcome.summary.segments.get("at_risk"), Some(&1));
        assert_eq!(outcome.summary.segments.get("churned"), Some(&1));
        assert_eq!(outcome.summary.processed, 2);
    }

    #[tokio::test]
    async fn node_classifier_path_persists_insight() {
        let store = Arc::new(MemoryStore::default());
        let bus = Arc::new(RecordingBus::default());

        let mut node = MetricsRecord::new("ib-node-01", EntityKind::StorageNode, Utc::now());
        node.metrics.iops = Some(90_000.0);
        node.metrics.latency_ms = Some(12.0);
        seed_record(&store, &node).await;

        let classifier = InferenceAdapter::new(
            StubEndpoint::returning(vec![serde_json::json!(2.0)]),
            "fabric-risk-classifier",
        );
        let pipeline = pipeline(
            store.clone(),
            bus.clone(),
            InferenceAdapter::unconfigured("multitask"),
            classifier,
        );

        let outcome = pipeline
            .process_entity("ib-node-01", EntityKind::StorageNode)
            .await
            .unwrap();

        let result = match outcome {
            EntityOutcome::Processed(AnalysisResult::Node(r)) => r,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(result.risk_score, 67);
        assert_eq!(result.band, RiskBand::High);
        assert_eq!(result.source, "classifier");

        let insights = store.insights();
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].prediction_type, PredictionType::PerformanceDegradation);
        assert_eq!(insights[0].confidence, 0.95);
        assert_eq!(insights[0].model_used, "fabric-risk-classifier");
        // 67 is under the alert threshold
        assert!(bus.alerts().is_empty());
    }

    #[tokio::test]
    async fn critical_node_publishes_high_risk_alert() {
        let store = Arc::new(MemoryStore::default());
        let bus = Arc::new(RecordingBus::default());

        let mut node = MetricsRecord::new("ib-node-02", EntityKind::StorageNode, Utc::now());
        node.metrics.iops = Some(125_000.0);
        node.metrics.latency_ms = Some(25.0);
        node.metrics.error_rate_pct = Some(4.0);
        seed_record(&store, &node).await;

        let classifier = InferenceAdapter::new(
            StubEndpoint::returning(vec![serde_json::json!(3.0)]),
            "fabric-risk-classifier",
        );
        let pipeline = pipeline(
            store.clone(),
            bus.clone(),
            InferenceAdapter::unconfigured("multitask"),
            classifier,
        );

        pipeline
            .process_entity("ib-node-02", EntityKind::StorageNode)
            .await
            .unwrap();

        let alerts = bus.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::HighRiskDetected);
        assert_eq!(alerts[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn node_chain_falls_back_to_completion_service() {
        use crate::llm::fake::FakeCompletion;

        let store = Arc::new(MemoryStore::default());
        let bus = Arc::new(RecordingBus::default());

        let node = MetricsRecord::new("ib-node-04", EntityKind::StorageNode, Utc::now());
        seed_record(&store, &node).await;

        let llm = LlmRouter::new(
            Some(FakeCompletion::returning(
                "haiku",
                vec!["{\"risk_score\": 44, \"analysis\": \"Mild congestion building\", \
                      \"recommendations\": [\"Watch latency\"]}"],
            )),
            None,
        );
        let pipeline = Pipeline::new(
            store.clone(),
            bus,
            InferenceAdapter::unconfigured("multitask"),
            InferenceAdapter::unconfigured("classifier"),
            llm,
            "marketplace-health-v1".to_string(),
            100,
        );

        let outcome = pipeline
            .process_entity("ib-node-04", EntityKind::StorageNode)
            .await
            .unwrap();

        let result = match outcome {
            EntityOutcome::Processed(AnalysisResult::Node(r)) => r,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(result.source, "llm");
        assert_eq!(result.risk_score, 44);

        let insights = store.insights();
        assert_eq!(insights[0].prediction_type, PredictionType::AnomalyDetected);
        assert_eq!(insights[0].confidence, 0.88);
        assert_eq!(insights[0].model_used, "haiku");
        assert_eq!(insights[0].explanation, "Mild congestion building");
    }

    #[tokio::test]
    async fn node_chain_bottoms_out_at_rules() {
        let store = Arc::new(MemoryStore::default());
        let bus = Arc::new(RecordingBus::default());

        let mut node = MetricsRecord::new("ib-node-03", EntityKind::StorageNode, Utc::now());
        node.metrics.latency_ms = Some(14.0);
        seed_record(&store, &node).await;

        let pipeline = pipeline(
            store.clone(),
            bus,
            InferenceAdapter::unconfigured("multitask"),
            InferenceAdapter::unconfigured("classifier"),
        );

        let outcome = pipeline
            .process_entity("ib-node-03", EntityKind::StorageNode)
            .await
            .unwrap();

        let result = match outcome {
            EntityOutcome::Processed(AnalysisResult::Node(r)) => r,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(result.source, "rules-based");
        assert_eq!(result.risk_score, 25);
        assert_eq!(store.insights()[0].confidence, 0.75);
    }
}
