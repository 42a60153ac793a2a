use crate::error::ApiError;
use crate::paper::PaperExchange;
use crate::{BinanceClient, BybitClient, ExchangeConnector};
use configuration::{ExchangesConfig, PaperConfig};
use core_types::{ExchangeId, UserProfile};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Hands out a connector bound to one user's account on one exchange.
pub trait ConnectorFactory: Send + Sync {
    fn connector(
        &self,
        user: &UserProfile,
        exchange: ExchangeId,
    ) -> Result<Arc<dyn ExchangeConnector>, ApiError>;
}

/// Builds authenticated REST clients from the user's stored credentials.
/// Clients are cached per (user, exchange, key) so rotated keys get a fresh client.
pub struct LiveConnectorFactory {
    config: ExchangesConfig,
    cache: Mutex<HashMap<(Uuid, ExchangeId, String), Arc<dyn ExchangeConnector>>>,
}

impl LiveConnectorFactory {
    pub fn new(config: ExchangesConfig) -> Self {
        Self {
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl ConnectorFactory for LiveConnectorFactory {
    fn connector(
        &self,
        user: &UserProfile,
        exchange: ExchangeId,
    ) -> Result<Arc<dyn ExchangeConnector>, ApiError> {
        let credential = user.credential(exchange).ok_or_else(|| {
            ApiError::Authentication(format!("user {} has no enabled {exchange} credentials", user.id))
        })?;
        let key = (user.id, exchange, credential.api_key.clone());

        let mut cache = self
            .cache
            .lock()
            .map_err(|_| ApiError::Unavailable("connector cache lock poisoned".into()))?;
        if let Some(existing) = cache.get(&key) {
            return Ok(existing.clone());
        }

        let recv_window = self.config.recv_window_ms;
        let connector: Arc<dyn ExchangeConnector> = match exchange {
            ExchangeId::Binance => Arc::new(BinanceClient::new(
                self.config.binance.url(credential.testnet),
                &credential.api_key,
                &credential.api_secret,
                recv_window,
            )?),
            ExchangeId::Bybit => Arc::new(BybitClient::new(
                self.config.bybit.url(credential.testnet),
                &credential.api_key,
                &credential.api_secret,
                recv_window,
            )?),
            ExchangeId::Paper => Arc::new(PaperExchange::new(ExchangeId::Paper, self.config.paper.clone())),
        };
        cache.insert(key, connector.clone());
        Ok(connector)
    }
}

/// Gives every (user, exchange) pair its own simulated account. Used for dry runs
/// and in tests, where `account` exposes the venue for scripting.
pub struct PaperConnectorFactory {
    config: PaperConfig,
    accounts: Mutex<HashMap<(Uuid, ExchangeId), Arc<PaperExchange>>>,
}

impl PaperConnectorFactory {
    pub fn new(config: PaperConfig) -> Self {
        Self {
            config,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    /// The simulated account, created on first use.
    pub fn account(&self, user_id: Uuid, exchange: ExchangeId) -> Arc<PaperExchange> {
        let mut accounts = match self.accounts.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        accounts
            .entry((user_id, exchange))
            .or_insert_with(|| Arc::new(PaperExchange::new(exchange, self.config.clone())))
            .clone()
    }
}

impl ConnectorFactory for PaperConnectorFactory {
    fn connector(
        &self,
        user: &UserProfile,
        exchange: ExchangeId,
    ) -> Result<Arc<dyn ExchangeConnector>, ApiError> {
        Ok(self.account(user.id, exchange))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::{ExchangeCredential, RiskTolerance, UserTradingConfig};

    fn user(credentials: Vec<ExchangeCredential>) -> UserProfile {
        UserProfile {
            id: Uuid::new_v4(),
            tier: "standard".into(),
            risk_tolerance: RiskTolerance::Moderate,
            subscription_active: true,
            subscription_expires_at: None,
            trading_enabled: true,
            trading_suspended: false,
            credentials,
            balances: vec![],
            trading: UserTradingConfig::default(),
        }
    }

    #[test]
    fn live_factory_requires_credentials() {
        let factory = LiveConnectorFactory::new(ExchangesConfig::default());
        let result = factory.connector(&user(vec![]), ExchangeId::Binance);
        assert!(matches!(result, Err(ApiError::Authentication(_))));
    }

    #[test]
    fn live_factory_reuses_clients() {
        let factory = LiveConnectorFactory::new(ExchangesConfig::default());
        let u = user(vec![ExchangeCredential {
            exchange: ExchangeId::Bybit,
            api_key: "key".into(),
            api_secret: "secret".into(),
            enabled: true,
            testnet: true,
        }]);
        let a = factory.connector(&u, ExchangeId::Bybit).unwrap();
        let b = factory.connector(&u, ExchangeId::Bybit).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.exchange(), ExchangeId::Bybit);
    }

    #[test]
    fn paper_accounts_are_isolated_per_user() {
        let factory = PaperConnectorFactory::new(PaperConfig::default());
        let first = factory.account(Uuid::new_v4(), ExchangeId::Binance);
        let second = factory.account(Uuid::new_v4(), ExchangeId::Binance);
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
