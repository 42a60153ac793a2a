use crate::error::EngineError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use core_types::{Decision, DecisionAction, Signal, SignalOperation};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Market context handed to the oracle alongside the signal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketAnalysis {
    pub symbol: String,
    pub reference_price: Decimal,
    pub captured_at: DateTime<Utc>,
    /// Free-form indicators (fear/greed, dominance, ...) from whatever gathered them.
    #[serde(default)]
    pub indicators: serde_json::Map<String, serde_json::Value>,
}

/// Gathers the market context for a signal. Fetching market data is outside
/// the engine; this is the seam where a provider plugs in.
#[async_trait]
pub trait MarketAnalysisProvider: Send + Sync {
    async fn analyze(&self, signal: &Signal) -> Result<MarketAnalysis, EngineError>;
}

/// Provides only what the signal itself carries.
#[derive(Debug, Clone, Default)]
pub struct SignalOnlyAnalysis;

#[async_trait]
impl MarketAnalysisProvider for SignalOnlyAnalysis {
    async fn analyze(&self, signal: &Signal) -> Result<MarketAnalysis, EngineError> {
        Ok(MarketAnalysis {
            symbol: signal.symbol.clone(),
            reference_price: signal.price,
            captured_at: Utc::now(),
            indicators: serde_json::Map::new(),
        })
    }
}

/// The black box that turns a signal into BUY, SELL or HOLD.
#[async_trait]
pub trait DecisionOracle: Send + Sync {
    async fn make_decision(
        &self,
        signal: &Signal,
        analysis: &MarketAnalysis,
    ) -> Result<Decision, EngineError>;
}

/// The oracle's wire format. The cooldown arrives as an absolute time.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OracleResponse {
    action: DecisionAction,
    confidence: Decimal,
    #[serde(default)]
    stop_loss: Option<Decimal>,
    #[serde(default)]
    take_profit: Option<Decimal>,
    #[serde(default)]
    cooldown_until: Option<DateTime<Utc>>,
    #[serde(default)]
    reasoning: Option<String>,
}

impl OracleResponse {
    fn into_decision(self, now: DateTime<Utc>, default_cooldown_minutes: u32) -> Decision {
        // Round partial minutes up so the cooldown never ends early.
        let cooldown_minutes = self
            .cooldown_until
            .map(|until| {
                let secs = (until - now).num_seconds().max(0);
                u32::try_from((secs + 59) / 60).unwrap_or(u32::MAX)
            })
            .unwrap_or(default_cooldown_minutes);
        Decision {
            action: self.action,
            confidence: self.confidence.clamp(Decimal::ZERO, dec!(100)),
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            cooldown_minutes,
            reasoning: self.reasoning,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OracleRequest<'a> {
    signal: &'a Signal,
    market_analysis: &'a MarketAnalysis,
}

/// Posts `{signal, marketAnalysis}` as JSON to an external decision service.
pub struct HttpDecisionOracle {
    client: reqwest::Client,
    url: String,
    default_cooldown_minutes: u32,
}

impl HttpDecisionOracle {
    pub fn new(url: impl Into<String>, timeout: Duration, default_cooldown_minutes: u32) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            default_cooldown_minutes,
        })
    }
}

#[async_trait]
impl DecisionOracle for HttpDecisionOracle {
    async fn make_decision(
        &self,
        signal: &Signal,
        analysis: &MarketAnalysis,
    ) -> Result<Decision, EngineError> {
        let response = self
            .client
            .post(&self.url)
            .json(&OracleRequest {
                signal,
                market_analysis: analysis,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    EngineError::Oracle(format!("request to {} timed out", self.url))
                } else {
                    EngineError::Http(e)
                }
            })?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(EngineError::Oracle(format!("HTTP {status}: {text}")));
        }
        let parsed: OracleResponse = serde_json::from_str(&text)?;
        Ok(parsed.into_decision(Utc::now(), self.default_cooldown_minutes))
    }
}

/// Follows the signal's direction with a fixed confidence. Used for dry runs and
/// when no oracle endpoint is configured.
#[derive(Debug, Clone)]
pub struct SignalFollowingOracle {
    pub confidence: Decimal,
    pub cooldown_minutes: u32,
}

impl Default for SignalFollowingOracle {
    fn default() -> Self {
        Self {
            confidence: dec!(75),
            cooldown_minutes: 120,
        }
    }
}

#[async_trait]
impl DecisionOracle for SignalFollowingOracle {
    async fn make_decision(
        &self,
        signal: &Signal,
        _analysis: &MarketAnalysis,
    ) -> Result<Decision, EngineError> {
        let action = match signal.operation {
            SignalOperation::OpenLong => DecisionAction::Buy,
            SignalOperation::OpenShort => DecisionAction::Sell,
            SignalOperation::CloseLong | SignalOperation::CloseShort => DecisionAction::Hold,
        };
        Ok(Decision {
            action,
            confidence: self.confidence,
            stop_loss: signal.stop_loss,
            take_profit: signal.take_profit,
            cooldown_minutes: self.cooldown_minutes,
            reasoning: Some("following the signal".into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn signal(operation: SignalOperation) -> Signal {
        Signal {
            id: Uuid::new_v4(),
            symbol: "BTCUSDT".into(),
            operation,
            price: dec!(64000),
            exchange: None,
            stop_loss: Some(dec!(63000)),
            take_profit: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn following_oracle_mirrors_the_signal() {
        let s = signal(SignalOperation::OpenShort);
        let analysis = SignalOnlyAnalysis.analyze(&s).await.unwrap();
        let decision = SignalFollowingOracle::default()
            .make_decision(&s, &analysis)
            .await
            .unwrap();
        assert_eq!(decision.action, DecisionAction::Sell);
        assert_eq!(decision.stop_loss, Some(dec!(63000)));
        assert_eq!(analysis.reference_price, dec!(64000));
    }

    #[test]
    fn cooldown_until_becomes_whole_minutes() {
        let now = Utc::now();
        let json = serde_json::json!({
            "action": "BUY",
            "confidence": 140,
            "cooldownUntil": now + chrono::Duration::seconds(90 * 60 + 1),
        });
        let parsed: OracleResponse = serde_json::from_value(json).unwrap();
        let decision = parsed.into_decision(now, 120);
        assert_eq!(decision.cooldown_minutes, 91);
        assert_eq!(decision.confidence, dec!(100));
    }

    #[test]
    fn missing_cooldown_uses_the_default() {
        let parsed: OracleResponse =
            serde_json::from_str(r#"{"action":"HOLD","confidence":"10"}"#).unwrap();
        let decision = parsed.into_decision(Utc::now(), 120);
        assert_eq!(decision.action, DecisionAction::Hold);
        assert_eq!(decision.cooldown_minutes, 120);
    }
}
