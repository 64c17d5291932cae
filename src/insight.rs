use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::models::{EntityKind, Insight, Metrics, Prediction, PredictionType, Segment};

/// Pipeline insights expire out of the store after 30 days.
pub const INSIGHT_TTL_DAYS: i64 = 30;

/// How many of the entity's recommendations ride along on each insight.
const ATTACHED_RECOMMENDATIONS: usize = 3;

/// Expands one prediction/segment/recommendation tuple into 3-6 insight
/// records, each gated by its own threshold and carrying its own scaled risk
/// score and fixed confidence. Timestamps within the batch are strictly
/// increasing so a store ordered by timestamp reproduces creation order.
#[allow(clippy::too_many_arguments)]
pub fn synthesize(
    entity_id: &str,
    kind: EntityKind,
    prediction: &Prediction,
    segment: Segment,
    recommendations: &[String],
    metrics: &Metrics,
    now: DateTime<Utc>,
    model_used: &str,
) -> Vec<Insight> {
    let noun = kind.noun();
    let velocity = prediction.session_velocity;
    let health = prediction.health_score;
    let max_churn = prediction.churn_risk_14d.max(prediction.churn_risk_30d);

    let mut drafts: Vec<(PredictionType, i64, String, f64)> = Vec::new();

    // Churn risk, when either window crosses 30%.
    if max_churn > 0.3 {
        let risk_score = (max_churn * 100.0).round() as i64;
        let mut explanation = format!("{noun} shows {risk_score}% churn probability. ");
        if prediction.churn_risk_14d > 0.5 {
            explanation.push_str("High risk of churning within 14 days. ");
        } else if prediction.churn_risk_30d > 0.5 {
            explanation.push_str("Elevated risk of churning within 30 days. ");
        }
        explanation.push_str(&format!(
            "Session velocity: {velocity:.2}/week, Health score: {health:.0}/100."
        ));
        drafts.push((PredictionType::ChurnRisk, risk_score, explanation, 0.85));
    }

    // Overall health, always reported; the risk score inverts the health
    // score so a thriving entity reads near zero.
    {
        let risk_score = (100.0 - health).round() as i64;
        let mut explanation = format!(
            "Overall health score of {health:.0}/100 indicates {segment} status. \
             Session frequency: {velocity:.2}/week. "
        );
        if metrics.avg_rating.unwrap_or(0.0) < 4.0 {
            explanation.push_str("Low satisfaction ratings detected. ");
        }
        drafts.push((PredictionType::CustomerHealth, risk_score, explanation, 0.88));
    }

    // Session quality, when bookings fall under half a session per week.
    if velocity < 0.5 {
        let risk_score = (((0.5 - velocity) * 200.0).round() as i64).min(100);
        let days_since = metrics.days_since_last_session.unwrap_or(0.0);
        let explanation = format!(
            "Low session booking rate of {velocity:.2} sessions/week. \
             Last session {days_since:.0} days ago. "
        );
        drafts.push((PredictionType::SessionQuality, risk_score, explanation, 0.82));
    }

    // Onboarding, when first-session success is unlikely.
    if prediction.first_session_success < 0.6 {
        let risk_score = ((1.0 - prediction.first_session_success) * 100.0).round() as i64;
        let explanation = format!(
            "First session success probability: {:.0}%. \
             {noun} may need additional onboarding support or tutor matching optimization.",
            prediction.first_session_success * 100.0,
        );
        drafts.push((
            PredictionType::FirstSessionSuccess,
            risk_score,
            explanation,
            0.79,
        ));
    }

    // Capacity planning, always emitted.
    let capacity_score = ((velocity * 20.0).round() as i64).min(100);
    let mut explanation = format!("Current session velocity: {velocity:.2}/week. ");
    if velocity > 2.0 {
        explanation.push_str("High engagement - ensure tutor availability matches demand.");
    } else if velocity < 0.5 {
        explanation.push_str("Low engagement - may need tutor outreach or scheduling flexibility.");
    } else {
        explanation.push_str("Moderate engagement - monitor for changes.");
    }
    // High velocity means low capacity risk.
    drafts.push((
        PredictionType::TutorCapacity,
        100 - capacity_score,
        explanation,
        0.75,
    ));

    // Marketplace balance, always emitted.
    let balance_score = health.round() as i64;
    let explanation = format!(
        "{noun} health: {health:.0}/100, Segment: {segment}. \
         Churn risk: {:.0}%, Session velocity: {velocity:.2}/week.",
        max_churn * 100.0,
    );
    drafts.push((
        PredictionType::MarketplaceBalance,
        100 - balance_score,
        explanation,
        0.80,
    ));

    drafts
        .into_iter()
        .enumerate()
        .map(|(index, (prediction_type, risk_score, explanation, confidence))| {
            let created_at = now + Duration::milliseconds(index as i64);
            Insight {
                insight_id: insight_id(created_at),
                related_entity: entity_id.to_string(),
                prediction_type,
                risk_score,
                explanation,
                recommendations: recommendations
                    .iter()
                    .take(ATTACHED_RECOMMENDATIONS)
                    .cloned()
                    .collect(),
                confidence,
                model_used: model_used.to_string(),
                created_at,
                expires_at: created_at + Duration::days(INSIGHT_TTL_DAYS),
            }
        })
        .collect()
}

/// Synthetic id: creation millis plus a random suffix, unique within the
/// batch because the millis are already distinct per insight.
pub fn insight_id(created_at: DateTime<Utc>) -> String {
    let suffix: u32 = rand::rng().random();
    format!("insight_{}_{:08x}", created_at.timestamp_millis(), suffix)
}
