use crate::models::{EntityKind, Metrics, Prediction, Segment};

/// Hard cap on the outgoing list. Rules past the cap are dropped silently,
/// so rule order below is a contract, not a style choice.
pub const MAX_RECOMMENDATIONS: usize = 5;

/// Produces the priority-ordered action list for one evaluation. Rules are
/// independent and may each contribute zero or more messages; the list is
/// truncated to the first five and never deduplicated.
pub fn recommend(
    metrics: &Metrics,
    prediction: &Prediction,
    segment: Segment,
    kind: EntityKind,
) -> Vec<String> {
    let mut recommendations = match kind {
        EntityKind::Tutor => tutor_rules(metrics, prediction, segment),
        _ => student_rules(metrics, prediction, segment),
    };
    recommendations.truncate(MAX_RECOMMENDATIONS);
    recommendations
}

fn student_rules(metrics: &Metrics, prediction: &Prediction, segment: Segment) -> Vec<String> {
    let mut out = Vec::new();

    // Retention rules first; the segment check covers entities classified
    // churned off the stored health score alone.
    if prediction.churn_risk_14d > 0.6 || segment == Segment::Churned {
        out.push("HIGH CHURN RISK: Schedule proactive check-in call within 48 hours".to_string());

        if metrics.sessions_7d.unwrap_or(0.0) == 0.0 {
            out.push("No sessions in 7 days - send re-engagement campaign".to_string());
        }
        if metrics.ib_calls_14d.unwrap_or(0.0) >= 2.0 {
            out.push("Multiple IB calls detected - assign dedicated account manager".to_string());
        }
    }

    if prediction.session_velocity < 0.5 && segment != Segment::Churned {
        out.push("Low session frequency - offer scheduling assistance or flexible hours".to_string());
    }

    if metrics.payment_success_rate_30d.unwrap_or(1.0) < 0.9 {
        out.push("Payment failures detected - update billing information".to_string());
    }

    if metrics.tutor_consistency_score.unwrap_or(1.0) < 0.5 {
        out.push("Low tutor consistency - assign preferred tutor for better match".to_string());
    }

    if prediction.first_session_success < 0.5 {
        out.push("Low first session success probability - provide onboarding support".to_string());
    }

    if segment == Segment::Thriving {
        out.push("Thriving customer - consider upsell or referral program".to_string());
    }

    out
}

fn tutor_rules(metrics: &Metrics, prediction: &Prediction, segment: Segment) -> Vec<String> {
    let mut out = Vec::new();
    let burnout = prediction.churn_risk_14d;

    if burnout > 0.6 || segment == Segment::Churning {
        out.push("HIGH BURNOUT RISK: Schedule tutor check-in within 48 hours".to_string());

        if metrics.hours_taught_7d.unwrap_or(0.0) >= 25.0 {
            out.push("Heavy teaching load this week - reduce bookings or add recovery days".to_string());
        }
        if metrics.complaints_30d.unwrap_or(0.0) >= 2.0 {
            out.push("Repeated complaints detected - route to support team for review".to_string());
        }
    }

    if prediction.session_velocity < 0.5 && segment != Segment::Churning {
        out.push("Low session volume - promote profile or assist with schedule fill".to_string());
    }

    if metrics.payout_failures_30d.unwrap_or(0.0) > 0.0 {
        out.push("Payout failures detected - verify payout information".to_string());
    }

    if metrics.retention_rate_30d.unwrap_or(1.0) < 0.5 {
        out.push("Low student retention - offer retention coaching session".to_string());
    }

    if metrics.avg_rating.unwrap_or(0.0) < 4.0 {
        out.push("Ratings below target - schedule quality coaching".to_string());
    }

    if segment == Segment::Star {
        out.push("Star tutor - feature in marketplace and expand availability".to_string());
    }

    out
}
