use chrono::{DateTime, Datelike, Timelike, Utc};

use crate::models::{EntityKind, Metrics, MetricsRecord};

/// Input widths the trained models were fitted on. Field order below is part
/// of the endpoint contract and must never be reordered.
pub const STUDENT_FEATURES: usize = 46;
pub const TUTOR_FEATURES: usize = 46;
pub const STORAGE_NODE_FEATURES: usize = 25;

/// Maps a sparse metrics record to the fixed-order vector for its kind.
/// Total over arbitrary input: absent fields take their documented defaults.
/// `now` only participates in the storage-node time features.
pub fn engineer_features(
    record: &MetricsRecord,
    kind: EntityKind,
    now: DateTime<Utc>,
) -> Vec<f64> {
    match kind {
        EntityKind::Student => student_features(&record.metrics).to_vec(),
        EntityKind::Tutor => tutor_features(&record.metrics).to_vec(),
        EntityKind::StorageNode => storage_node_features(&record.metrics, now).to_vec(),
        EntityKind::Subject => Vec::new(),
    }
}

fn get(value: Option<f64>, default: f64) -> f64 {
    value.unwrap_or(default)
}

struct SessionShape {
    sessions_7d: f64,
    sessions_14d: f64,
    sessions_30d: f64,
    freq_7d: f64,
    freq_14d: f64,
    freq_30d: f64,
    days_since_last: f64,
    avg_gap: f64,
    trend_7_14: f64,
    trend_14_30: f64,
    acceleration: f64,
    weekend_ratio: f64,
    evening_ratio: f64,
}

/// The 13 session-window features shared by both marketplace vectors.
fn session_shape(m: &Metrics) -> SessionShape {
    let sessions_7d = get(m.sessions_7d, 0.0);
    let sessions_14d = get(m.sessions_14d, 0.0);
    let sessions_30d = get(m.sessions_30d, 0.0);

    let avg_gap = if sessions_30d > 0.0 {
        30.0 / sessions_30d
    } else {
        30.0
    };
    let trend_7_14 = if sessions_14d > sessions_7d {
        sessions_7d - (sessions_14d - sessions_7d)
    } else {
        0.0
    };
    let trend_14_30 = if sessions_30d > sessions_14d {
        sessions_14d - (sessions_30d - sessions_14d)
    } else {
        0.0
    };

    SessionShape {
        sessions_7d,
        sessions_14d,
        sessions_30d,
        freq_7d: sessions_7d / 7.0,
        freq_14d: sessions_14d / 14.0,
        freq_30d: sessions_30d / 30.0,
        days_since_last: get(m.days_since_last_session, 30.0),
        avg_gap,
        trend_7_14,
        trend_14_30,
        acceleration: trend_7_14 - trend_14_30,
        weekend_ratio: get(m.sessions_weekend_ratio, 0.3),
        evening_ratio: get(m.sessions_evening_ratio, 0.5),
    }
}

/// Student vector: session (13), engagement (8), financial (6),
/// behavioral (10), tutor-relationship (9).
pub fn student_features(m: &Metrics) -> [f64; STUDENT_FEATURES] {
    let s = session_shape(m);
    let ib_calls_14d = get(m.ib_calls_14d, 0.0);

    [
        s.sessions_7d,
        s.sessions_14d,
        s.sessions_30d,
        s.freq_7d,
        s.freq_14d,
        s.freq_30d,
        s.days_since_last,
        s.avg_gap,
        s.trend_7_14,
        s.trend_14_30,
        s.acceleration,
        s.weekend_ratio,
        s.evening_ratio,
        get(m.avg_rating, 0.0),
        get(m.rating_trend, 0.0),
        get(m.rating_volatility, 0.0),
        get(m.avg_session_duration_min, 60.0),
        get(m.total_session_hours_30d, 0.0),
        get(m.engagement_score, 50.0),
        get(m.questions_asked_30d, 0.0),
        get(m.materials_accessed_30d, 0.0),
        get(m.payment_success_rate_30d, 1.0),
        get(m.payment_failures_30d, 0.0),
        get(m.avg_transaction_value, 50.0),
        get(m.total_revenue_30d, 0.0),
        get(m.payment_method_count, 1.0),
        get(m.days_since_last_payment, 7.0),
        get(m.ib_calls_7d, 0.0),
        ib_calls_14d,
        ib_calls_14d / 14.0,
        get(m.cancellation_rate_7d, 0.0),
        get(m.cancellation_rate_30d, 0.0),
        get(m.no_show_rate_30d, 0.0),
        get(m.late_cancellations_30d, 0.0),
        get(m.avg_response_time_hours, 24.0),
        get(m.support_tickets_30d, 0.0),
        get(m.complaints_30d, 0.0),
        get(m.tutor_consistency_score, 0.5),
        get(m.unique_tutors_30d, 1.0),
        get(m.preferred_tutor_ratio, 0.7),
        get(m.tutor_rating_avg, 4.0),
        get(m.tutor_availability_score, 0.8),
        get(m.tutor_subject_expertise_score, 0.7),
        get(m.tutor_match_score, 0.75),
        get(m.tutor_changed_count_30d, 0.0),
        get(m.preferred_tutor_sessions_ratio, 0.8),
    ]
}

/// Tutor vector: session (13), delivery (8), financial (6), behavioral (10),
/// roster (9). Same session derivations as the student vector, burnout and
/// retention signals elsewhere.
pub fn tutor_features(m: &Metrics) -> [f64; TUTOR_FEATURES] {
    let s = session_shape(m);

    [
        s.sessions_7d,
        s.sessions_14d,
        s.sessions_30d,
        s.freq_7d,
        s.freq_14d,
        s.freq_30d,
        s.days_since_last,
        s.avg_gap,
        s.trend_7_14,
        s.trend_14_30,
        s.acceleration,
        s.weekend_ratio,
        s.evening_ratio,
        get(m.avg_rating, 4.0),
        get(m.rating_trend, 0.0),
        get(m.rating_volatility, 0.0),
        get(m.avg_session_duration_min, 60.0),
        get(m.total_session_hours_30d, 0.0),
        get(m.utilization_rate, 0.5),
        get(m.available_hours_week, 20.0),
        get(m.booked_hours_week, 10.0),
        get(m.earnings_30d, 0.0),
        get(m.avg_hourly_rate, 40.0),
        get(m.payout_failures_30d, 0.0),
        get(m.earnings_trend, 0.0),
        get(m.instant_book_ratio, 0.5),
        get(m.refund_rate_30d, 0.0),
        get(m.cancellations_by_tutor_30d, 0.0),
        get(m.late_cancellations_30d, 0.0),
        get(m.no_show_rate_30d, 0.0),
        get(m.avg_response_time_hours, 24.0),
        get(m.response_rate, 0.9),
        get(m.complaints_30d, 0.0),
        get(m.reschedule_rate_30d, 0.0),
        get(m.consecutive_teaching_days, 0.0),
        get(m.hours_taught_7d, 0.0),
        get(m.hours_taught_14d, 0.0),
        get(m.unique_students_30d, 1.0),
        get(m.repeat_student_ratio, 0.5),
        get(m.retention_rate_30d, 0.7),
        get(m.avg_student_tenure_days, 30.0),
        get(m.new_students_30d, 0.0),
        get(m.sessions_per_student, 1.0),
        get(m.subjects_taught_count, 1.0),
        get(m.preferred_by_students_count, 0.0),
        get(m.student_rating_given_avg, 4.5),
    ]
}

/// Storage-node vector for the fabric risk classifier: IOPS (4), latency (4),
/// throughput (2), errors (2), time (3), access pattern (2), device (3),
/// derived (5). Several inputs are fixed estimates pending richer telemetry
/// from the fabric agents.
pub fn storage_node_features(
    m: &Metrics,
    now: DateTime<Utc>,
) -> [f64; STORAGE_NODE_FEATURES] {
    let iops = get(m.iops, 0.0);
    let latency = get(m.latency_ms, 0.0);
    let error_rate = get(m.error_rate_pct, 0.0);
    let throughput = get(m.throughput_mbps, 0.0);
    let queue_depth = get(m.queue_depth, 0.0);

    let iops_per_latency = if latency > 0.0 { iops / latency } else { 0.0 };
    let anomaly_score = error_rate * 2.0 + if latency > 10.0 { 3.0 } else { 0.0 };
    let trend_score = if iops > 80_000.0 { 7.0 } else { 3.0 }
        + if latency > 15.0 { 2.0 } else { 0.0 };
    let workload_type = if iops > 100_000.0 {
        2.0
    } else if latency > 10.0 {
        1.0
    } else {
        0.0
    };

    [
        (iops * 0.6).trunc(),
        (iops * 0.4).trunc(),
        iops,
        (iops * 0.15).trunc(),
        latency,
        latency * 2.5,
        latency * 5.0,
        if latency > 10.0 { 3.0 } else { 0.0 },
        throughput,
        (throughput * 0.1).trunc(),
        error_rate,
        if error_rate > 1.0 { 0.5 } else { -0.2 },
        f64::from(now.hour()),
        f64::from(now.weekday().num_days_from_monday()),
        3600.0,
        0.7,
        0.3,
        queue_depth,
        128.0,
        32.0,
        iops_per_latency,
        anomaly_score,
        trend_score,
        (iops / 150_000.0).min(1.0),
        workload_type,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn empty_record(kind: EntityKind) -> MetricsRecord {
        MetricsRecord::new("e1", kind, Utc::now())
    }

    #[test]
    fn vector_lengths_are_fixed_per_kind() {
        let now = Utc::now();
        for (kind, expected) in [
            (EntityKind::Student, STUDENT_FEATURES),
            (EntityKind::Tutor, TUTOR_FEATURES),
            (EntityKind::StorageNode, STORAGE_NODE_FEATURES),
        ] {
            let mut record = empty_record(kind);
            assert_eq!(engineer_features(&record, kind, now).len(), expected);

            record.metrics.sessions_7d = Some(12.0);
            record.metrics.iops = Some(90_000.0);
            record.metrics.earnings_30d = Some(1800.0);
            assert_eq!(engineer_features(&record, kind, now).len(), expected);
        }
    }

    #[test]
    fn empty_student_metrics_yield_documented_defaults() {
        let features = student_features(&Metrics::default());

        let expected: [f64; STUDENT_FEATURES] = [
            0.0, 0.0, 0.0, // session counts
            0.0, 0.0, 0.0, // frequencies
            30.0, 30.0, 0.0, 0.0, 0.0, 0.3, 0.5, // gaps and trends
            0.0, 0.0, 0.0, 60.0, 0.0, 50.0, 0.0, 0.0, // engagement
            1.0, 0.0, 50.0, 0.0, 1.0, 7.0, // financial
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 24.0, 0.0, 0.0, // behavioral
            0.5, 1.0, 0.7, 4.0, 0.8, 0.7, 0.75, 0.0, 0.8, // tutor relationship
        ];

        assert_eq!(features, expected);
    }

    #[test]
    fn session_derivations_match_contract() {
        let mut m = Metrics::default();
        m.sessions_7d = Some(3.0);
        m.sessions_14d = Some(8.0);
        m.sessions_30d = Some(20.0);

        let features = student_features(&m);

        assert!((features[3] - 3.0 / 7.0).abs() < 1e-9);
        assert!((features[4] - 8.0 / 14.0).abs() < 1e-9);
        assert!((features[5] - 20.0 / 30.0).abs() < 1e-9);
        // 30 / sessions_30d
        assert!((features[7] - 1.5).abs() < 1e-9);
        // 3 - (8 - 3) = -2
        assert_eq!(features[8], -2.0);
        // 8 - (20 - 8) = -4
        assert_eq!(features[9], -4.0);
        // acceleration = -2 - (-4) = 2
        assert_eq!(features[10], 2.0);
    }

    #[test]
    fn trends_zero_when_windows_do_not_grow() {
        let mut m = Metrics::default();
        m.sessions_7d = Some(5.0);
        m.sessions_14d = Some(5.0);
        m.sessions_30d = Some(5.0);

        let features = student_features(&m);
        assert_eq!(features[8], 0.0);
        assert_eq!(features[9], 0.0);
        assert_eq!(features[10], 0.0);
        // avg gap = 30 / 5
        assert_eq!(features[7], 6.0);
    }

    #[test]
    fn ib_call_rate_divides_by_fourteen() {
        let mut m = Metrics::default();
        m.ib_calls_14d = Some(7.0);

        let features = student_features(&m);
        assert_eq!(features[28], 7.0);
        assert!((features[29] - 0.5).abs() < 1e-9);
    }

    #[test]
    fn tutor_vector_reads_tutor_signals() {
        let mut m = Metrics::default();
        m.utilization_rate = Some(0.9);
        m.earnings_30d = Some(2400.0);
        m.retention_rate_30d = Some(0.4);

        let features = tutor_features(&m);
        assert_eq!(features[18], 0.9);
        assert_eq!(features[21], 2400.0);
        assert_eq!(features[39], 0.4);
        // tutor defaults differ from the student vector where signals differ
        assert_eq!(features[13], 4.0); // avg_rating default
        assert_eq!(features[45], 4.5); // student_rating_given_avg default
    }

    #[test]
    fn storage_node_features_follow_threshold_rules() {
        let mut m = Metrics::default();
        m.iops = Some(120_000.0);
        m.latency_ms = Some(20.0);
        m.error_rate_pct = Some(2.0);
        m.throughput_mbps = Some(1500.0);
        m.queue_depth = Some(80.0);

        // Wednesday 14:00 UTC
        let now = Utc.with_ymd_and_hms(2026, 8, 5, 14, 0, 0).unwrap();
        let features = storage_node_features(&m, now);

        assert_eq!(features[0], 72_000.0); // read share
        assert_eq!(features[1], 48_000.0); // write share
        assert_eq!(features[5], 50.0); // p95 estimate
        assert_eq!(features[7], 3.0); // latency spikes
        assert_eq!(features[11], 0.5); // error trend
        assert_eq!(features[12], 14.0);
        assert_eq!(features[13], 2.0);
        assert_eq!(features[20], 6_000.0); // iops per latency
        assert_eq!(features[21], 7.0); // anomaly score
        assert_eq!(features[22], 9.0); // trend score
        assert_eq!(features[23], 0.8); // capacity utilization
        assert_eq!(features[24], 2.0); // workload type
    }

    #[test]
    fn subject_records_are_not_vectorized() {
        let record = empty_record(EntityKind::Subject);
        assert!(engineer_features(&record, EntityKind::Subject, Utc::now()).is_empty());
    }
}
