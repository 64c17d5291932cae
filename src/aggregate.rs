use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::models::{
    Alert, AlertType, EntityKind, EventPayload, HealthUpdateEvent, IncomingEvent, MetricsRecord,
    NodeMetricsEvent, Severity, SupplyDemandEvent, TutorAvailabilityEvent,
};
use crate::store::{EntityStore, StoreError};

/// Applies one incoming event to the store's rolling metrics, then runs
/// anomaly detection over the updated record and publishes any alerts in a
/// single batch. A failed publish is logged and swallowed; the metric update
/// has already landed and must not be rolled back by a notification problem.
/// Returns the alerts the event raised so callers can enrich them.
pub async fn process_event(
    store: &dyn EntityStore,
    bus: &dyn EventBus,
    event: &IncomingEvent,
) -> Result<Vec<Alert>, StoreError> {
    let now = Utc::now();
    update_metrics(store, event, now).await?;

    let metrics = match primary_entity(&event.payload) {
        Some((entity_id, entity_type)) => store.get_metrics(entity_id, entity_type).await?,
        None => None,
    };

    let alerts = detect_anomalies(event, metrics.as_ref(), now);
    if !alerts.is_empty() {
        if let Err(error) = bus.publish_alerts(&alerts).await {
            warn!(%error, count = alerts.len(), "failed to publish alerts");
        }
    }

    Ok(alerts)
}

/// Expands raised alerts into qualitative insights via the completion
/// service. Each alert is independent; a failed generation is logged and the
/// rest continue.
pub async fn enrich_alerts(
    store: &dyn EntityStore,
    llm: &crate::llm::LlmRouter,
    alerts: &[Alert],
) {
    for alert in alerts {
        match llm.generate_alert_insight(alert, Utc::now()).await {
            Ok(insight) => {
                if let Err(error) = store.put_insight(&insight).await {
                    warn!(%error, entity_id = %alert.entity_id, "failed to persist alert insight");
                }
            }
            Err(error) => {
                warn!(
                    %error,
                    alert_type = %alert.alert_type,
                    entity_id = %alert.entity_id,
                    "failed to generate alert insight"
                );
            }
        }
    }
}

/// Entity whose updated record feeds anomaly detection: the student when the
/// event names one, otherwise the tutor.
fn primary_entity(payload: &EventPayload) -> Option<(&str, EntityKind)> {
    match payload {
        EventPayload::SessionStarted(s) | EventPayload::SessionCompleted(s) => s
            .student_id
            .as_deref()
            .map(|id| (id, EntityKind::Student))
            .or_else(|| s.tutor_id.as_deref().map(|id| (id, EntityKind::Tutor))),
        EventPayload::IbCallLogged(c) => {
            c.student_id.as_deref().map(|id| (id, EntityKind::Student))
        }
        EventPayload::CustomerHealthUpdate(h) => {
            h.student_id.as_deref().map(|id| (id, EntityKind::Student))
        }
        EventPayload::TutorAvailabilityUpdated(t) => {
            t.tutor_id.as_deref().map(|id| (id, EntityKind::Tutor))
        }
        EventPayload::SupplyDemandUpdate(_) | EventPayload::NodeMetricsReported(_) => None,
    }
}

async fn update_metrics(
    store: &dyn EntityStore,
    event: &IncomingEvent,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    match &event.payload {
        EventPayload::SessionStarted(session) | EventPayload::SessionCompleted(session) => {
            let completed = matches!(event.payload, EventPayload::SessionCompleted(_));

            if let Some(student_id) = session.student_id.as_deref() {
                let mut record = fetch_or_bootstrap(store, student_id, EntityKind::Student, now).await?;
                apply_session_to_student(&mut record, now);
                store.put_metrics(&record).await?;
            }

            if let Some(tutor_id) = session.tutor_id.as_deref() {
                let mut record = fetch_or_bootstrap(store, tutor_id, EntityKind::Tutor, now).await?;
                let rating = if completed { session.tutor_rating } else { None };
                apply_session_to_tutor(&mut record, rating, now);
                store.put_metrics(&record).await?;
            }
        }
        EventPayload::IbCallLogged(call) => {
            if let Some(student_id) = call.student_id.as_deref() {
                let mut record = fetch_or_bootstrap(store, student_id, EntityKind::Student, now).await?;
                apply_ib_call(&mut record, now);
                store.put_metrics(&record).await?;
            }
        }
        EventPayload::CustomerHealthUpdate(update) => {
            if let (Some(student_id), Some(_)) = (update.student_id.as_deref(), update.health_score)
            {
                let mut record = fetch_or_bootstrap(store, student_id, EntityKind::Student, now).await?;
                apply_health_update(&mut record, update, now);
                store.put_metrics(&record).await?;
            }
        }
        EventPayload::TutorAvailabilityUpdated(update) => {
            if let Some(tutor_id) = update.tutor_id.as_deref() {
                let mut record = fetch_or_bootstrap(store, tutor_id, EntityKind::Tutor, now).await?;
                apply_availability(&mut record, update, now);
                store.put_metrics(&record).await?;
            }
        }
        EventPayload::SupplyDemandUpdate(update) => {
            if let Some(record) = subject_record_from(update, now) {
                store.put_metrics(&record).await?;
            }
        }
        EventPayload::NodeMetricsReported(report) => {
            if let Some(node_id) = report.node_id.as_deref() {
                let mut record =
                    fetch_or_bootstrap(store, node_id, EntityKind::StorageNode, now).await?;
                apply_node_metrics(&mut record, report, now);
                store.put_metrics(&record).await?;
            }
        }
    }

    debug!(event_type = event.payload.event_type(), "metrics updated");
    Ok(())
}

async fn fetch_or_bootstrap(
    store: &dyn EntityStore,
    entity_id: &str,
    entity_type: EntityKind,
    now: DateTime<Utc>,
) -> Result<MetricsRecord, StoreError> {
    Ok(store
        .get_metrics(entity_id, entity_type)
        .await?
        .unwrap_or_else(|| MetricsRecord::bootstrap(entity_id, entity_type, now)))
}

fn bump(slot: &mut Option<f64>) {
    *slot = Some(slot.unwrap_or(0.0) + 1.0);
}

pub fn apply_session_to_student(record: &mut MetricsRecord, now: DateTime<Utc>) {
    bump(&mut record.metrics.sessions_7d);
    bump(&mut record.metrics.sessions_14d);
    bump(&mut record.metrics.sessions_30d);
    record.last_updated = now;
}

/// Increments the tutor's window counters; a rating on a completed session
/// also folds into the rolling 30-day average.
pub fn apply_session_to_tutor(
    record: &mut MetricsRecord,
    rating: Option<f64>,
    now: DateTime<Utc>,
) {
    bump(&mut record.metrics.sessions_7d);
    bump(&mut record.metrics.sessions_14d);
    bump(&mut record.metrics.sessions_30d);

    if let Some(rating) = rating {
        let n = record.metrics.sessions_30d.unwrap_or(0.0);
        let current = record.metrics.avg_rating.unwrap_or(0.0);
        record.metrics.avg_rating = Some(rolling_average(current, n, rating));
    }
    record.last_updated = now;
}

/// `new_avg = ((old_avg * (n - 1)) + rating) / n`, where `n` counts the
/// session being folded in. Guarded so an inconsistent zero count cannot
/// divide by zero.
pub fn rolling_average(current_avg: f64, n: f64, rating: f64) -> f64 {
    if n <= 0.0 {
        return current_avg;
    }
    ((current_avg * (n - 1.0)) + rating) / n
}

pub fn apply_ib_call(record: &mut MetricsRecord, now: DateTime<Utc>) {
    bump(&mut record.metrics.ib_calls_7d);
    bump(&mut record.metrics.ib_calls_14d);
    record.last_updated = now;
}

/// Health snapshots overwrite the tracked fields outright; last write wins.
pub fn apply_health_update(
    record: &mut MetricsRecord,
    update: &HealthUpdateEvent,
    now: DateTime<Utc>,
) {
    if let Some(health) = update.health_score {
        record.metrics.health_score = Some(health);
    }
    if let Some(sessions) = update.sessions_last_7_days {
        record.metrics.sessions_7d = Some(sessions);
    }
    if let Some(sessions) = update.sessions_last_30_days {
        record.metrics.sessions_30d = Some(sessions);
    }
    if let Some(calls) = update.ib_calls_last_14_days {
        record.metrics.ib_calls_14d = Some(calls);
    }
    if let Some(rating) = update.avg_session_rating {
        record.metrics.avg_rating = Some(rating);
    }
    record.last_updated = now;
}

pub fn apply_availability(
    record: &mut MetricsRecord,
    update: &TutorAvailabilityEvent,
    now: DateTime<Utc>,
) {
    if let Some(hours) = update.available_hours_this_week {
        record.metrics.available_hours_week = Some(hours);
    }
    if let Some(accepts) = update.accepts_instant_book {
        record.metrics.instant_book_ratio = Some(if accepts { 1.0 } else { 0.0 });
    }
    record.last_updated = now;
}

pub fn subject_record_from(
    update: &SupplyDemandEvent,
    now: DateTime<Utc>,
) -> Option<MetricsRecord> {
    let subject = update.subject.as_deref()?;
    let mut record = MetricsRecord::new(subject, EntityKind::Subject, now);
    record.metrics.region = update.region.clone();
    record.metrics.available_tutors = Some(update.available_tutors.unwrap_or(0.0));
    record.metrics.active_students = Some(update.active_students.unwrap_or(0.0));
    record.metrics.demand_score = Some(update.demand_score.unwrap_or(0.0));
    record.metrics.supply_score = Some(update.supply_score.unwrap_or(0.0));
    record.metrics.balance_status =
        Some(update.balance_status.clone().unwrap_or_else(|| "unknown".to_string()));
    Some(record)
}

pub fn apply_node_metrics(
    record: &mut MetricsRecord,
    report: &NodeMetricsEvent,
    now: DateTime<Utc>,
) {
    record.metrics.iops = report.iops.or(record.metrics.iops);
    record.metrics.latency_ms = report.latency_ms.or(record.metrics.latency_ms);
    record.metrics.error_rate_pct = report.error_rate_pct.or(record.metrics.error_rate_pct);
    record.metrics.throughput_mbps = report.throughput_mbps.or(record.metrics.throughput_mbps);
    record.metrics.queue_depth = report.queue_depth.or(record.metrics.queue_depth);
    record.metrics.active_connections =
        report.active_connections.or(record.metrics.active_connections);
    record.last_updated = now;
}

/// Flat row shape for historical event imports. Unused columns stay empty;
/// which ones apply depends on the event type.
#[derive(Debug, serde::Deserialize)]
struct CsvEventRow {
    event_type: String,
    timestamp: Option<DateTime<Utc>>,
    student_id: Option<String>,
    tutor_id: Option<String>,
    subject: Option<String>,
    region: Option<String>,
    student_rating: Option<f64>,
    tutor_rating: Option<f64>,
    health_score: Option<f64>,
    sessions_last_7_days: Option<f64>,
    sessions_last_30_days: Option<f64>,
    ib_calls_last_14_days: Option<f64>,
    demand_score: Option<f64>,
    supply_score: Option<f64>,
    balance_status: Option<String>,
    node_id: Option<String>,
    iops: Option<f64>,
    latency_ms: Option<f64>,
    error_rate_pct: Option<f64>,
    throughput_mbps: Option<f64>,
    queue_depth: Option<f64>,
}

impl CsvEventRow {
    fn into_event(self) -> Option<IncomingEvent> {
        let payload = match self.event_type.as_str() {
            "session_started" => EventPayload::SessionStarted(crate::models::SessionEvent {
                student_id: self.student_id,
                tutor_id: self.tutor_id,
                subject: self.subject,
                ..Default::default()
            }),
            "session_completed" => EventPayload::SessionCompleted(crate::models::SessionEvent {
                student_id: self.student_id,
                tutor_id: self.tutor_id,
                subject: self.subject,
                student_rating: self.student_rating,
                tutor_rating: self.tutor_rating,
                completed_successfully: Some(true),
                ..Default::default()
            }),
            "ib_call_logged" => EventPayload::IbCallLogged(crate::models::IbCallEvent {
                student_id: self.student_id,
                ..Default::default()
            }),
            "customer_health_update" => EventPayload::CustomerHealthUpdate(HealthUpdateEvent {
                student_id: self.student_id,
                sessions_last_7_days: self.sessions_last_7_days,
                sessions_last_30_days: self.sessions_last_30_days,
                ib_calls_last_14_days: self.ib_calls_last_14_days,
                health_score: self.health_score,
                ..Default::default()
            }),
            "supply_demand_update" => EventPayload::SupplyDemandUpdate(SupplyDemandEvent {
                subject: self.subject,
                region: self.region,
                demand_score: self.demand_score,
                supply_score: self.supply_score,
                balance_status: self.balance_status,
                ..Default::default()
            }),
            "node_metrics_reported" => EventPayload::NodeMetricsReported(NodeMetricsEvent {
                node_id: self.node_id,
                iops: self.iops,
                latency_ms: self.latency_ms,
                error_rate_pct: self.error_rate_pct,
                throughput_mbps: self.throughput_mbps,
                queue_depth: self.queue_depth,
                ..Default::default()
            }),
            _ => return None,
        };

        Some(IncomingEvent {
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            payload,
        })
    }
}

/// Imports historical events from a flat CSV file, running each through the
/// normal aggregation path. Undecodable rows and per-event failures are
/// logged and skipped; one bad row never aborts the import.
pub async fn ingest_csv(
    store: &dyn EntityStore,
    bus: &dyn EventBus,
    llm: Option<&crate::llm::LlmRouter>,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut processed = 0usize;

    for result in reader.deserialize::<CsvEventRow>() {
        let row = match result {
            Ok(row) => row,
            Err(error) => {
                warn!(%error, "skipping undecodable event row");
                continue;
            }
        };

        let Some(event) = row.into_event() else {
            warn!("skipping row with unrecognized event type");
            continue;
        };

        match process_event(store, bus, &event).await {
            Ok(alerts) => {
                if let Some(llm) = llm {
                    enrich_alerts(store, llm, &alerts).await;
                }
                processed += 1;
            }
            Err(error) => warn!(%error, "failed to process imported event"),
        }
    }

    Ok(processed)
}

/// Threshold rules over the updated record. Each rule is independent and may
/// add its own alert; one event can raise several.
pub fn detect_anomalies(
    event: &IncomingEvent,
    metrics: Option<&MetricsRecord>,
    now: DateTime<Utc>,
) -> Vec<Alert> {
    let mut alerts = Vec::new();

    if let Some(record) = metrics {
        if record.entity_type == EntityKind::Student {
            let ib_calls_14d = record.metrics.ib_calls_14d.unwrap_or(0.0);
            let health_score = record.metrics.health_score.unwrap_or(100.0);

            if ib_calls_14d >= 3.0 {
                alerts.push(Alert {
                    alert_type: AlertType::HighIbCallFrequency,
                    severity: Severity::Warning,
                    entity_id: record.entity_id.clone(),
                    entity_type: record.entity_type,
                    details: serde_json::json!({
                        "ib_calls_14d": ib_calls_14d as i64,
                        "health_score": health_score,
                    }),
                    message: format!(
                        "Student {} has {} IB calls in 14 days",
                        record.entity_id, ib_calls_14d as i64
                    ),
                    timestamp: now,
                });
            }

            if health_score < 70.0 {
                alerts.push(Alert {
                    alert_type: AlertType::LowHealthScore,
                    severity: if health_score < 50.0 {
                        Severity::Critical
                    } else {
                        Severity::Warning
                    },
                    entity_id: record.entity_id.clone(),
                    entity_type: record.entity_type,
                    details: serde_json::json!({
                        "health_score": health_score,
                        "sessions_7d": record.metrics.sessions_7d.unwrap_or(0.0) as i64,
                        "ib_calls_14d": ib_calls_14d as i64,
                    }),
                    message: format!(
                        "Student {} has low health score: {}",
                        record.entity_id, health_score
                    ),
                    timestamp: now,
                });
            }
        }
    }

    if let EventPayload::SupplyDemandUpdate(update) = &event.payload {
        if update.balance_status.as_deref() == Some("high_demand") {
            let subject = update.subject.as_deref().unwrap_or("unknown");
            let demand = update.demand_score.unwrap_or(0.0);
            let supply = update.supply_score.unwrap_or(0.0);
            alerts.push(Alert {
                alert_type: AlertType::SupplyDemandImbalance,
                severity: Severity::Info,
                entity_id: subject.to_string(),
                entity_type: EntityKind::Subject,
                details: serde_json::json!({
                    "balance_status": "high_demand",
                    "demand_score": demand,
                    "supply_score": supply,
                }),
                message: format!(
                    "High demand detected for {subject} (Demand: {demand}, Supply: {supply})"
                ),
                timestamp: now,
            });
        }
    }

    alerts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::recording::RecordingBus;
    use crate::models::{IbCallEvent, SessionEvent};
    use crate::store::memory::MemoryStore;

    fn session_event(student: Option<&str>, tutor: Option<&str>, rating: Option<f64>) -> IncomingEvent {
        IncomingEvent {
            timestamp: Utc::now(),
            payload: EventPayload::SessionCompleted(SessionEvent {
                session_id: Some("sess_1".to_string()),
                student_id: student.map(str::to_string),
                tutor_id: tutor.map(str::to_string),
                tutor_rating: rating,
                completed_successfully: Some(true),
                ..SessionEvent::default()
            }),
        }
    }

    #[test]
    fn rolling_average_matches_contract_case() {
        // Four rated sessions in the window, three already averaged at 4.0,
        // the fourth rated 5: (4.0 * 3 + 5) / 4.
        assert_eq!(rolling_average(4.0, 4.0, 5.0), 4.25);
    }

    #[test]
    fn rolling_average_guards_zero_count() {
        assert_eq!(rolling_average(3.5, 0.0, 5.0), 3.5);
        assert_eq!(rolling_average(3.5, -1.0, 5.0), 3.5);
    }

    #[test]
    fn tutor_session_updates_counters_and_average() {
        let now = Utc::now();
        let mut record = MetricsRecord::bootstrap("tut_201", EntityKind::Tutor, now);
        record.metrics.sessions_30d = Some(3.0);
        record.metrics.avg_rating = Some(4.0);

        apply_session_to_tutor(&mut record, Some(5.0), now);

        assert_eq!(record.metrics.sessions_30d, Some(4.0));
        assert_eq!(record.metrics.avg_rating, Some(4.25));
    }

    #[test]
    fn first_rated_session_sets_the_average_outright() {
        let now = Utc::now();
        let mut record = MetricsRecord::bootstrap("tut_202", EntityKind::Tutor, now);

        apply_session_to_tutor(&mut record, Some(5.0), now);

        assert_eq!(record.metrics.sessions_30d, Some(1.0));
        assert_eq!(record.metrics.avg_rating, Some(5.0));
    }

    #[test]
    fn health_update_overwrites_tracked_fields() {
        let now = Utc::now();
        let mut record = MetricsRecord::bootstrap("stu_1001", EntityKind::Student, now);
        record.metrics.sessions_7d = Some(9.0);
        record.metrics.sessions_14d = Some(12.0);

        let update = HealthUpdateEvent {
            student_id: Some("stu_1001".to_string()),
            sessions_last_7_days: Some(2.0),
            sessions_last_30_days: Some(8.0),
            ib_calls_last_14_days: Some(1.0),
            health_score: Some(64.0),
            ..HealthUpdateEvent::default()
        };
        apply_health_update(&mut record, &update, now);

        assert_eq!(record.metrics.health_score, Some(64.0));
        assert_eq!(record.metrics.sessions_7d, Some(2.0));
        assert_eq!(record.metrics.sessions_30d, Some(8.0));
        assert_eq!(record.metrics.ib_calls_14d, Some(1.0));
        // 14-day window is not part of the snapshot payload
        assert_eq!(record.metrics.sessions_14d, Some(12.0));
    }

    #[test]
    fn ib_call_threshold_raises_warning() {
        let now = Utc::now();
        let mut record = MetricsRecord::bootstrap("stu_1002", EntityKind::Student, now);
        record.metrics.ib_calls_14d = Some(3.0);

        let event = IncomingEvent {
            timestamp: now,
            payload: EventPayload::IbCallLogged(IbCallEvent {
                student_id: Some("stu_1002".to_string()),
                ..IbCallEvent::default()
            }),
        };
        let alerts = detect_anomalies(&event, Some(&record), now);

        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::HighIbCallFrequency);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert!(alerts[0].message.contains("3 IB calls"));
    }

    #[test]
    fn low_health_severity_tiers_at_fifty() {
        let now = Utc::now();
        let event = session_event(Some("stu_1"), None, None);

        let mut record = MetricsRecord::bootstrap("stu_1", EntityKind::Student, now);
        record.metrics.health_score = Some(65.0);
        let alerts = detect_anomalies(&event, Some(&record), now);
        assert_eq!(alerts[0].severity, Severity::Warning);

        record.metrics.health_score = Some(42.0);
        let alerts = detect_anomalies(&event, Some(&record), now);
        assert_eq!(alerts[0].severity, Severity::Critical);
    }

    #[test]
    fn one_event_can_raise_multiple_alerts() {
        let now = Utc::now();
        let mut record = MetricsRecord::bootstrap("stu_9", EntityKind::Student, now);
        record.metrics.ib_calls_14d = Some(4.0);
        record.metrics.health_score = Some(40.0);

        let event = session_event(Some("stu_9"), None, None);
        let alerts = detect_anomalies(&event, Some(&record), now);

        assert_eq!(alerts.len(), 2);
    }

    #[test]
    fn tutor_records_do_not_trip_student_rules() {
        let now = Utc::now();
        let mut record = MetricsRecord::bootstrap("tut_5", EntityKind::Tutor, now);
        record.metrics.health_score = Some(20.0);

        let event = session_event(None, Some("tut_5"), None);
        assert!(detect_anomalies(&event, Some(&record), now).is_empty());
    }

    #[test]
    fn high_demand_update_raises_info_alert() {
        let now = Utc::now();
        let event = IncomingEvent {
            timestamp: now,
            payload: EventPayload::SupplyDemandUpdate(SupplyDemandEvent {
                subject: Some("Physics".to_string()),
                demand_score: Some(92.0),
                supply_score: Some(51.0),
                balance_status: Some("high_demand".to_string()),
                ..SupplyDemandEvent::default()
            }),
        };

        let alerts = detect_anomalies(&event, None, now);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::SupplyDemandImbalance);
        assert_eq!(alerts[0].severity, Severity::Info);
        assert!(alerts[0].message.contains("Physics"));

        let balanced = IncomingEvent {
            timestamp: now,
            payload: EventPayload::SupplyDemandUpdate(SupplyDemandEvent {
                subject: Some("Physics".to_string()),
                balance_status: Some("balanced".to_string()),
                ..SupplyDemandEvent::default()
            }),
        };
        assert!(detect_anomalies(&balanced, None, now).is_empty());
    }

    #[tokio::test]
    async fn session_event_updates_both_sides_and_bootstraps() {
        let store = MemoryStore::default();
        let bus = RecordingBus::default();

        let event = session_event(Some("stu_1001"), Some("tut_201"), Some(4.0));
        process_event(&store, &bus, &event).await.unwrap();

        let student = store
            .get_metrics("stu_1001", EntityKind::Student)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(student.metrics.sessions_7d, Some(1.0));
        assert_eq!(student.metrics.sessions_30d, Some(1.0));

        let tutor = store
            .get_metrics("tut_201", EntityKind::Tutor)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tutor.metrics.sessions_30d, Some(1.0));
        assert_eq!(tutor.metrics.avg_rating, Some(4.0));
    }

    #[tokio::test]
    async fn publish_failure_does_not_fail_the_event() {
        let store = MemoryStore::default();
        let bus = RecordingBus::failing();

        // Third call crosses the alert threshold.
        for _ in 0..3 {
            let event = IncomingEvent {
                timestamp: Utc::now(),
                payload: EventPayload::IbCallLogged(IbCallEvent {
                    student_id: Some("stu_7".to_string()),
                    ..IbCallEvent::default()
                }),
            };
            process_event(&store, &bus, &event).await.unwrap();
        }

        let record = store
            .get_metrics("stu_7", EntityKind::Student)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.metrics.ib_calls_14d, Some(3.0));
    }

    #[tokio::test]
    async fn raised_alerts_can_be_enriched_into_insights() {
        use crate::llm::fake::FakeCompletion;
        use crate::llm::LlmRouter;

        let store = MemoryStore::default();
        let bus = RecordingBus::default();

        let mut record = MetricsRecord::bootstrap("stu_4", EntityKind::Student, Utc::now());
        record.metrics.health_score = Some(45.0);
        store.put_metrics(&record).await.unwrap();

        let event = session_event(Some("stu_4"), None, None);
        let alerts = process_event(&store, &bus, &event).await.unwrap();
        assert_eq!(alerts.len(), 1);

        let llm = LlmRouter::new(
            Some(FakeCompletion::returning(
                "haiku",
                vec!["{\"risk_score\": 82, \"explanation\": \"Sharp decline\", \
                      \"recommendations\": [\"Call within 24h\"]}"],
            )),
            None,
        );
        enrich_alerts(&store, &llm, &alerts).await;

        let insights = store.insights();
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].risk_score, 82);
        assert_eq!(insights[0].related_entity, "stu_4");
    }

    #[tokio::test]
    async fn enrichment_failures_leave_the_batch_intact() {
        use crate::llm::fake::FakeCompletion;
        use crate::llm::LlmRouter;

        let store = MemoryStore::default();
        let alert = Alert {
            alert_type: AlertType::LowHealthScore,
            severity: Severity::Warning,
            entity_id: "stu_5".to_string(),
            entity_type: EntityKind::Student,
            details: serde_json::json!({}),
            message: "Student stu_5 has low health score: 60".to_string(),
            timestamp: Utc::now(),
        };

        let llm = LlmRouter::new(Some(FakeCompletion::failing("haiku")), None);
        enrich_alerts(&store, &llm, &[alert]).await;
        assert!(store.insights().is_empty());
    }

    #[tokio::test]
    async fn csv_import_replays_events_and_skips_bad_rows() {
        use std::io::Write as _;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "event_type,timestamp,student_id,tutor_id,subject,region,student_rating,\
             tutor_rating,health_score,sessions_last_7_days,sessions_last_30_days,\
             ib_calls_last_14_days,demand_score,supply_score,balance_status,node_id,\
             iops,latency_ms,error_rate_pct,throughput_mbps,queue_depth"
        )
        .unwrap();
        writeln!(
            file,
            "session_completed,2026-08-01T10:00:00Z,stu_1,tut_1,Physics,,,5,,,,,,,,,,,,,"
        )
        .unwrap();
        writeln!(
            file,
            "customer_health_update,2026-08-01T11:00:00Z,stu_1,,,,,,62,1,4,0,,,,,,,,,"
        )
        .unwrap();
        writeln!(file, "mystery_event,,,,,,,,,,,,,,,,,,,,").unwrap();

        let store = MemoryStore::default();
        let bus = RecordingBus::default();
        let processed = ingest_csv(&store, &bus, None, file.path()).await.unwrap();

        assert_eq!(processed, 2);

        let student = store
            .get_metrics("stu_1", EntityKind::Student)
            .await
            .unwrap()
            .unwrap();
        // Health snapshot lands after the session increment.
        assert_eq!(student.metrics.health_score, Some(62.0));
        assert_eq!(student.metrics.sessions_7d, Some(1.0));

        let tutor = store
            .get_metrics("tut_1", EntityKind::Tutor)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tutor.metrics.avg_rating, Some(5.0));

        // The 62 health snapshot is below the alert threshold.
        let alerts = bus.alerts();
        assert!(alerts
            .iter()
            .any(|a| a.alert_type == AlertType::LowHealthScore));
    }

    #[tokio::test]
    async fn supply_demand_upserts_subject_record_and_alerts() {
        let store = MemoryStore::default();
        let bus = RecordingBus::default();

        let event = IncomingEvent {
            timestamp: Utc::now(),
            payload: EventPayload::SupplyDemandUpdate(SupplyDemandEvent {
                subject: Some("Chemistry".to_string()),
                region: Some("midwest".to_string()),
                available_tutors: Some(7.0),
                active_students: Some(150.0),
                demand_score: Some(88.0),
                supply_score: Some(40.0),
                balance_status: Some("high_demand".to_string()),
            }),
        };
        process_event(&store, &bus, &event).await.unwrap();

        let subject = store
            .get_metrics("Chemistry", EntityKind::Subject)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(subject.metrics.balance_status.as_deref(), Some("high_demand"));
        assert_eq!(subject.metrics.available_tutors, Some(7.0));

        let alerts = bus.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::SupplyDemandImbalance);
    }
}
