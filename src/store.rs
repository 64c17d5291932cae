use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use thiserror::Error;

use crate::models::{EntityKind, Insight, MetricsRecord, PredictionPatch, PredictionType, Segment};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("entity {entity_id} ({entity_type}) not found")]
    NotFound {
        entity_id: String,
        entity_type: EntityKind,
    },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("malformed stored record: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// One page of a keyset scan over an entity kind. The continuation token is
/// opaque to callers; pass it back verbatim to resume.
#[derive(Debug, Clone)]
pub struct Page {
    pub items: Vec<MetricsRecord>,
    pub next_token: Option<String>,
}

/// Segment assignment snapshot used by the report builder.
#[derive(Debug, Clone)]
pub struct SegmentSnapshot {
    pub entity_id: String,
    pub entity_type: EntityKind,
    pub segment: Segment,
}

/// The durable key-value store behind the pipeline, keyed by
/// `(entity_id, entity_type)`. Constructed once at startup and shared.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn get_metrics(
        &self,
        entity_id: &str,
        entity_type: EntityKind,
    ) -> Result<Option<MetricsRecord>, StoreError>;

    /// Full overwrite upsert of one entity's metrics.
    async fn put_metrics(&self, record: &MetricsRecord) -> Result<(), StoreError>;

    /// Documented field patch written after one evaluation; fails with
    /// `NotFound` when the entity row no longer exists.
    async fn apply_predictions(
        &self,
        entity_id: &str,
        entity_type: EntityKind,
        patch: &PredictionPatch,
    ) -> Result<(), StoreError>;

    async fn query_by_kind(
        &self,
        entity_type: EntityKind,
        limit: i64,
        start_after: Option<&str>,
    ) -> Result<Page, StoreError>;

    async fn put_insight(&self, insight: &Insight) -> Result<(), StoreError>;

    async fn list_recent_insights(&self, limit: i64) -> Result<Vec<Insight>, StoreError>;

    async fn list_segments(&self) -> Result<Vec<SegmentSnapshot>, StoreError>;
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(sqlx::Error::from)?;
        Ok(())
    }
}

fn round_to(value: f64, digits: i32) -> f64 {
    let factor = 10f64.powi(digits);
    (value * factor).round() / factor
}

fn parse_json_str<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, StoreError> {
    Ok(serde_json::from_value(serde_json::Value::String(
        raw.to_string(),
    ))?)
}

#[async_trait]
impl EntityStore for PgStore {
    async fn get_metrics(
        &self,
        entity_id: &str,
        entity_type: EntityKind,
    ) -> Result<Option<MetricsRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT metrics FROM marketplace_health.entities \
             WHERE entity_id = $1 AND entity_type = $2",
        )
        .bind(entity_id)
        .bind(entity_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let metrics: serde_json::Value = row.get("metrics");
                Ok(Some(serde_json::from_value(metrics)?))
            }
            None => Ok(None),
        }
    }

    async fn put_metrics(&self, record: &MetricsRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO marketplace_health.entities
            (entity_id, entity_type, metrics, last_updated)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (entity_id, entity_type) DO UPDATE
            SET metrics = EXCLUDED.metrics, last_updated = EXCLUDED.last_updated
            "#,
        )
        .bind(&record.entity_id)
        .bind(record.entity_type.as_str())
        .bind(serde_json::to_value(record)?)
        .bind(record.last_updated)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn apply_predictions(
        &self,
        entity_id: &str,
        entity_type: EntityKind,
        patch: &PredictionPatch,
    ) -> Result<(), StoreError> {
        let p = &patch.prediction;
        let predictions = serde_json::json!({
            "churn_risk_14d": round_to(p.churn_risk_14d, 4),
            "churn_risk_30d": round_to(p.churn_risk_30d, 4),
            "first_session_success_prob": round_to(p.first_session_success, 4),
            "session_velocity": round_to(p.session_velocity, 4),
            "health_score": round_to(p.health_score, 2),
        });

        let result = sqlx::query(
            r#"
            UPDATE marketplace_health.entities
            SET segment = $3,
                predictions = $4,
                recommendations = $5,
                model_version = $6,
                prediction_timestamp = $7
            WHERE entity_id = $1 AND entity_type = $2
            "#,
        )
        .bind(entity_id)
        .bind(entity_type.as_str())
        .bind(patch.segment.as_str())
        .bind(predictions)
        .bind(serde_json::to_value(&patch.recommendations)?)
        .bind(&patch.model_version)
        .bind(patch.prediction_timestamp)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound {
                entity_id: entity_id.to_string(),
                entity_type,
            });
        }
        Ok(())
    }

    async fn query_by_kind(
        &self,
        entity_type: EntityKind,
        limit: i64,
        start_after: Option<&str>,
    ) -> Result<Page, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT metrics FROM marketplace_health.entities
            WHERE entity_type = $1 AND ($2::text IS NULL OR entity_id > $2)
            ORDER BY entity_id
            LIMIT $3
            "#,
        )
        .bind(entity_type.as_str())
        .bind(start_after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let metrics: serde_json::Value = row.get("metrics");
            items.push(serde_json::from_value::<MetricsRecord>(metrics)?);
        }

        let next_token = if items.len() as i64 == limit {
            items.last().map(|record| record.entity_id.clone())
        } else {
            None
        };

        Ok(Page { items, next_token })
    }

    async fn put_insight(&self, insight: &Insight) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO marketplace_health.insights
            (insight_id, related_entity, prediction_type, risk_score, explanation,
             recommendations, confidence, model_used, created_at, expires_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (insight_id) DO NOTHING
            "#,
        )
        .bind(&insight.insight_id)
        .bind(&insight.related_entity)
        .bind(insight.prediction_type.as_str())
        .bind(insight.risk_score)
        .bind(&insight.explanation)
        .bind(serde_json::to_value(&insight.recommendations)?)
        .bind(insight.confidence)
        .bind(&insight.model_used)
        .bind(insight.created_at)
        .bind(insight.expires_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_recent_insights(&self, limit: i64) -> Result<Vec<Insight>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT insight_id, related_entity, prediction_type, risk_score,
                   explanation, recommendations, confidence, model_used,
                   created_at, expires_at
            FROM marketplace_health.insights
            ORDER BY created_at DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut insights = Vec::with_capacity(rows.len());
        for row in rows {
            let prediction_type: PredictionType =
                parse_json_str(row.get::<String, _>("prediction_type").as_str())?;
            let recommendations: Vec<String> =
                serde_json::from_value(row.get::<serde_json::Value, _>("recommendations"))?;

            insights.push(Insight {
                insight_id: row.get("insight_id"),
                related_entity: row.get("related_entity"),
                prediction_type,
                risk_score: row.get("risk_score"),
                explanation: row.get("explanation"),
                recommendations,
                confidence: row.get("confidence"),
                model_used: row.get("model_used"),
                created_at: row.get::<DateTime<Utc>, _>("created_at"),
                expires_at: row.get::<DateTime<Utc>, _>("expires_at"),
            });
        }

        Ok(insights)
    }

    async fn list_segments(&self) -> Result<Vec<SegmentSnapshot>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT entity_id, entity_type, segment
            FROM marketplace_health.entities
            WHERE segment IS NOT NULL
            ORDER BY entity_type, entity_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut snapshots = Vec::with_capacity(rows.len());
        for row in rows {
            snapshots.push(SegmentSnapshot {
                entity_id: row.get("entity_id"),
                entity_type: parse_json_str(row.get::<String, _>("entity_type").as_str())?,
                segment: parse_json_str(row.get::<String, _>("segment").as_str())?,
            });
        }

        Ok(snapshots)
    }
}

/// Seed entities mirroring a small live marketplace, for local runs.
pub async fn seed(store: &dyn EntityStore, now: DateTime<Utc>) -> Result<(), StoreError> {
    let mut thriving = MetricsRecord::bootstrap("stu_1001", EntityKind::Student, now);
    thriving.metrics.sessions_7d = Some(3.0);
    thriving.metrics.sessions_14d = Some(6.0);
    thriving.metrics.sessions_30d = Some(12.0);
    thriving.metrics.days_since_last_session = Some(2.0);
    thriving.metrics.avg_rating = Some(4.8);
    thriving.metrics.engagement_score = Some(88.0);
    thriving.metrics.health_score = Some(92.0);

    let mut fading = MetricsRecord::bootstrap("stu_1002", EntityKind::Student, now);
    fading.metrics.sessions_14d = Some(1.0);
    fading.metrics.sessions_30d = Some(4.0);
    fading.metrics.days_since_last_session = Some(11.0);
    fading.metrics.ib_calls_7d = Some(1.0);
    fading.metrics.ib_calls_14d = Some(3.0);
    fading.metrics.payment_success_rate_30d = Some(0.8);
    fading.metrics.health_score = Some(54.0);

    let mut gone = MetricsRecord::bootstrap("stu_1003", EntityKind::Student, now);
    gone.metrics.days_since_last_session = Some(27.0);
    gone.metrics.tutor_consistency_score = Some(0.3);
    gone.metrics.health_score = Some(35.0);

    let mut steady_tutor = MetricsRecord::bootstrap("tut_201", EntityKind::Tutor, now);
    steady_tutor.metrics.sessions_7d = Some(9.0);
    steady_tutor.metrics.sessions_14d = Some(17.0);
    steady_tutor.metrics.sessions_30d = Some(35.0);
    steady_tutor.metrics.avg_rating = Some(4.7);
    steady_tutor.metrics.utilization_rate = Some(0.8);
    steady_tutor.metrics.retention_rate_30d = Some(0.85);
    steady_tutor.metrics.health_score = Some(90.0);

    let mut strained_tutor = MetricsRecord::bootstrap("tut_202", EntityKind::Tutor, now);
    strained_tutor.metrics.sessions_7d = Some(22.0);
    strained_tutor.metrics.sessions_14d = Some(41.0);
    strained_tutor.metrics.sessions_30d = Some(78.0);
    strained_tutor.metrics.hours_taught_7d = Some(31.0);
    strained_tutor.metrics.complaints_30d = Some(2.0);
    strained_tutor.metrics.avg_rating = Some(3.9);
    strained_tutor.metrics.health_score = Some(48.0);

    let mut math = MetricsRecord::new("Mathematics", EntityKind::Subject, now);
    math.metrics.region = Some("northeast".to_string());
    math.metrics.available_tutors = Some(14.0);
    math.metrics.active_students = Some(220.0);
    math.metrics.demand_score = Some(91.0);
    math.metrics.supply_score = Some(58.0);
    math.metrics.balance_status = Some("high_demand".to_string());

    let mut quiet_node = MetricsRecord::new("ib-node-01", EntityKind::StorageNode, now);
    quiet_node.metrics.iops = Some(42_000.0);
    quiet_node.metrics.latency_ms = Some(4.0);
    quiet_node.metrics.error_rate_pct = Some(0.2);
    quiet_node.metrics.throughput_mbps = Some(2_400.0);
    quiet_node.metrics.queue_depth = Some(18.0);
    quiet_node.metrics.active_connections = Some(120.0);

    let mut hot_node = MetricsRecord::new("ib-node-02", EntityKind::StorageNode, now);
    hot_node.metrics.iops = Some(125_000.0);
    hot_node.metrics.latency_ms = Some(22.0);
    hot_node.metrics.error_rate_pct = Some(2.4);
    hot_node.metrics.throughput_mbps = Some(900.0);
    hot_node.metrics.queue_depth = Some(88.0);
    hot_node.metrics.active_connections = Some(340.0);

    for record in [
        thriving,
        fading,
        gone,
        steady_tutor,
        strained_tutor,
        math,
        quiet_node,
        hot_node,
    ] {
        store.put_metrics(&record).await?;
    }

    Ok(())
}
