use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::models::{
    EventPayload, HealthUpdateEvent, IbCallEvent, IncomingEvent, NodeMetricsEvent, SessionEvent,
    SupplyDemandEvent, TutorAvailabilityEvent,
};

const SUBJECTS: &[&str] = &[
    "Mathematics",
    "Physics",
    "Chemistry",
    "Biology",
    "English",
    "History",
    "Computer Science",
    "Spanish",
    "French",
];

const REGIONS: &[&str] = &["northeast", "southeast", "midwest", "west", "southwest"];

const CALL_REASONS: &[&str] = &[
    "scheduling_issue",
    "technical_problem",
    "tutor_concern",
    "billing_question",
    "general_inquiry",
];

pub fn rng_from_seed(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_os_rng(),
    }
}

fn pick<'a, R: Rng>(rng: &mut R, options: &'a [&'a str]) -> &'a str {
    options[rng.random_range(0..options.len())]
}

fn student_id<R: Rng>(rng: &mut R) -> String {
    format!("stu_{}", rng.random_range(1000..=9999))
}

fn tutor_id<R: Rng>(rng: &mut R) -> String {
    format!("tut_{}", rng.random_range(100..=999))
}

/// One synthetic marketplace event with realistic payload ranges. Output is
/// deterministic for a seeded generator, which the ingestion tests rely on.
pub fn generate_event<R: Rng>(rng: &mut R, now: DateTime<Utc>) -> IncomingEvent {
    let payload = match rng.random_range(0..7) {
        0 => EventPayload::SessionStarted(SessionEvent {
            session_id: Some(format!("sess_{}_{}", now.timestamp_millis(), rng.random_range(1000..=9999))),
            student_id: Some(student_id(rng)),
            tutor_id: Some(tutor_id(rng)),
            subject: Some(pick(rng, SUBJECTS).to_string()),
            session_type: Some(
                pick(rng, &["one_on_one", "group", "instant_book"]).to_string(),
            ),
            scheduled_duration_minutes: Some([30.0, 60.0, 90.0][rng.random_range(0..3)]),
            ..SessionEvent::default()
        }),
        1 => EventPayload::SessionCompleted(SessionEvent {
            session_id: Some(format!("sess_{}_{}", now.timestamp_millis(), rng.random_range(1000..=9999))),
            student_id: Some(student_id(rng)),
            tutor_id: Some(tutor_id(rng)),
            subject: Some(pick(rng, SUBJECTS).to_string()),
            actual_duration_minutes: Some(rng.random_range(20..=95) as f64),
            student_rating: Some(rng.random_range(3..=5) as f64),
            tutor_rating: Some(rng.random_range(3..=5) as f64),
            completed_successfully: Some(rng.random::<f64>() > 0.1),
            ..SessionEvent::default()
        }),
        2 => EventPayload::IbCallLogged(IbCallEvent {
            call_id: Some(format!("call_{}_{}", now.timestamp_millis(), rng.random_range(100..=999))),
            student_id: Some(student_id(rng)),
            reason: Some(pick(rng, CALL_REASONS).to_string()),
            duration_seconds: Some(rng.random_range(60..=600) as f64),
            resolved: Some(rng.random::<f64>() > 0.3),
            priority: Some(pick(rng, &["low", "medium", "high"]).to_string()),
        }),
        3 => EventPayload::TutorAvailabilityUpdated(TutorAvailabilityEvent {
            tutor_id: Some(tutor_id(rng)),
            available_hours_this_week: Some(rng.random_range(0..=40) as f64),
            subjects: Some(vec![
                pick(rng, SUBJECTS).to_string(),
                pick(rng, SUBJECTS).to_string(),
            ]),
            timezone: Some(pick(rng, &["EST", "CST", "MST", "PST"]).to_string()),
            accepts_instant_book: Some(rng.random::<f64>() > 0.5),
        }),
        4 => EventPayload::CustomerHealthUpdate(HealthUpdateEvent {
            student_id: Some(student_id(rng)),
            sessions_last_7_days: Some(rng.random_range(0..=10) as f64),
            sessions_last_30_days: Some(rng.random_range(0..=40) as f64),
            ib_calls_last_14_days: Some(rng.random_range(0..=5) as f64),
            avg_session_rating: Some(((rng.random::<f64>() * 2.0 + 3.0) * 100.0).round() / 100.0),
            health_score: Some((rng.random::<f64>() * 40.0 + 60.0).round()),
            churn_risk: Some(pick(rng, &["low", "medium", "high"]).to_string()),
        }),
        5 => EventPayload::SupplyDemandUpdate(SupplyDemandEvent {
            subject: Some(pick(rng, SUBJECTS).to_string()),
            region: Some(pick(rng, REGIONS).to_string()),
            available_tutors: Some(rng.random_range(5..=100) as f64),
            active_students: Some(rng.random_range(10..=500) as f64),
            demand_score: Some((rng.random::<f64>() * 50.0 + 50.0).round()),
            supply_score: Some((rng.random::<f64>() * 50.0 + 50.0).round()),
            balance_status: Some(
                pick(rng, &["balanced", "high_demand", "oversupplied"]).to_string(),
            ),
        }),
        _ => EventPayload::NodeMetricsReported(NodeMetricsEvent {
            node_id: Some(format!("ib-node-{:02}", rng.random_range(1..=8))),
            iops: Some(rng.random_range(20_000..=140_000) as f64),
            latency_ms: Some((rng.random::<f64>() * 25.0 * 10.0).round() / 10.0),
            error_rate_pct: Some((rng.random::<f64>() * 4.0 * 100.0).round() / 100.0),
            throughput_mbps: Some(rng.random_range(500..=3_000) as f64),
            queue_depth: Some(rng.random_range(4..=96) as f64),
            active_connections: Some(rng.random_range(50..=400) as f64),
        }),
    };

    IncomingEvent {
        timestamp: now,
        payload,
    }
}
