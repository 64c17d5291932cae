use crate::models::{EntityKind, Prediction, Segment};

/// Assigns the health/risk bucket for one evaluation. Checks run in priority
/// order and the first match wins; the order encodes which signal dominates
/// when several apply.
pub fn classify(prediction: &Prediction, kind: EntityKind) -> Segment {
    match kind {
        EntityKind::Tutor => classify_tutor(prediction),
        _ => classify_student(prediction),
    }
}

fn classify_student(prediction: &Prediction) -> Segment {
    let churn_14d = prediction.churn_risk_14d;
    let churn_30d = prediction.churn_risk_30d;
    let health = prediction.health_score;

    if churn_14d > 0.7 || health < 40.0 {
        Segment::Churned
    } else if churn_14d > 0.4 || churn_30d > 0.6 || health < 60.0 {
        Segment::AtRisk
    } else if churn_14d < 0.2 && health > 80.0 {
        Segment::Thriving
    } else {
        Segment::Healthy
    }
}

/// The multi-task head has no separate burnout output; for tutors the 14-day
/// churn probability is read as burnout risk.
fn classify_tutor(prediction: &Prediction) -> Segment {
    let burnout = prediction.churn_risk_14d;
    let health = prediction.health_score;

    if burnout > 0.7 || health < 40.0 {
        Segment::Churning
    } else if burnout > 0.4 || health < 60.0 {
        Segment::AtRisk
    } else if burnout < 0.2 && health > 80.0 {
        Segment::Star
    } else {
        Segment::Healthy
    }
}
