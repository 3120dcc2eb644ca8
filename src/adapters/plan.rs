use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::ports::{CollaboratorError, LimitDecision, PlanAction, PlanOracle};

const SERVICE: &str = "plan service";

/// Plan oracle answering over HTTP.
///
/// `POST {base}/limits/check` with `{ user_id, action }` and
/// `POST {base}/usage/{history_id}`.
#[derive(Debug, Clone)]
pub struct HttpPlanOracle {
    client: Client,
    base_url: String,
}

#[derive(Serialize)]
struct LimitQuery<'a> {
    user_id: &'a str,
    action: PlanAction,
}

impl HttpPlanOracle {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| unavailable(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

fn unavailable(detail: String) -> CollaboratorError {
    CollaboratorError::Unavailable {
        service: SERVICE,
        detail,
    }
}

#[async_trait]
impl PlanOracle for HttpPlanOracle {
    async fn check_limits(
        &self,
        user_id: &str,
        action: PlanAction,
    ) -> Result<LimitDecision, CollaboratorError> {
        let response = self
            .client
            .post(format!("{}/limits/check", self.base_url))
            .json(&LimitQuery { user_id, action })
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        if !response.status().is_success() {
            return Err(unavailable(format!("HTTP {}", response.status())));
        }

        let decision: LimitDecision =
            response
                .json()
                .await
                .map_err(|e| CollaboratorError::InvalidResponse {
                    service: SERVICE,
                    detail: e.to_string(),
                })?;
        debug!(user_id, ?action, allowed = decision.allowed, "Plan limits checked");
        Ok(decision)
    }

    async fn increment_usage(&self, history_id: &str) -> Result<(), CollaboratorError> {
        let response = self
            .client
            .post(format!("{}/usage/{history_id}", self.base_url))
            .send()
            .await
            .map_err(|e| unavailable(e.to_string()))?;

        if !response.status().is_success() {
            warn!(history_id, status = %response.status(), "Usage increment rejected");
            return Err(unavailable(format!("HTTP {}", response.status())));
        }
        Ok(())
    }
}

/// Allows everything. Used when no plan service is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnlimitedPlan;

#[async_trait]
impl PlanOracle for UnlimitedPlan {
    async fn check_limits(
        &self,
        _user_id: &str,
        _action: PlanAction,
    ) -> Result<LimitDecision, CollaboratorError> {
        Ok(LimitDecision::allow())
    }

    async fn increment_usage(&self, _history_id: &str) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unlimited_plan_allows() {
        let decision = UnlimitedPlan
            .check_limits("user", PlanAction::Emitir)
            .await
            .unwrap();
        assert!(decision.allowed);
        assert!(decision.history_id.is_none());
    }

    #[test]
    fn test_base_url_trailing_slash() {
        let oracle = HttpPlanOracle::new("http://plans.local/", Duration::from_secs(1)).unwrap();
        assert_eq!(oracle.base_url, "http://plans.local");
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        let oracle = HttpPlanOracle::new("http://127.0.0.1:1", Duration::from_secs(1)).unwrap();
        let err = oracle
            .check_limits("user", PlanAction::Visualizar)
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Unavailable { .. }));
    }
}
