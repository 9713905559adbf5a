//! ACME HTTP-01 certificate issuance via `instant-acme` (§4.4).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, NewAccount, NewOrder, OrderStatus,
    RetryPolicy,
};
use parking_lot::RwLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("ACME account not initialized")]
    NotRegistered,
    #[error("challenge failed: {0}")]
    ChallengeFailed(String),
    #[error("order never became ready: {0}")]
    OrderNotReady(String),
    #[error("invalid hostname: {0}")]
    InvalidHost(String),
    #[error("no HTTP-01 challenge offered for this authorization")]
    NoHttp01Challenge,
    #[error("acme protocol error: {0}")]
    Acme(#[from] instant_acme::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct AcmeConfig {
    pub staging: bool,
    pub contact_email: Option<String>,
    pub account_dir: PathBuf,
    pub order_timeout: Duration,
}

impl AcmeConfig {
    pub fn directory_url(&self) -> String {
        if self.staging {
            "https://acme-staging-v02.api.letsencrypt.org/directory".to_string()
        } else {
            "https://acme-v02.api.letsencrypt.org/directory".to_string()
        }
    }
}

/// HTTP-01 challenge tokens awaiting validation: token -> key authorization.
pub type ChallengeTokens = Arc<RwLock<HashMap<String, String>>>;

pub struct AcmeClient {
    config: AcmeConfig,
    challenge_tokens: ChallengeTokens,
    account: RwLock<Option<Account>>,
}

impl AcmeClient {
    pub fn new(config: AcmeConfig) -> Self {
        Self {
            config,
            challenge_tokens: Arc::new(RwLock::new(HashMap::new())),
            account: RwLock::new(None),
        }
    }

    pub fn challenge_tokens(&self) -> ChallengeTokens {
        self.challenge_tokens.clone()
    }

    /// Load a saved account or register a new one.
    pub async fn init(&self) -> Result<(), AcmeError> {
        std::fs::create_dir_all(&self.config.account_dir)?;
        let credentials_path = self.config.account_dir.join("credentials.json");

        if credentials_path.exists() {
            if let Ok(account) = self.load_account(&credentials_path).await {
                tracing::info!("loaded existing ACME account");
                *self.account.write() = Some(account);
                return Ok(());
            }
            tracing::warn!("saved ACME account credentials were unusable, registering a new one");
        }

        let (account, credentials) = self.create_account().await?;
        let json = serde_json::to_string_pretty(&credentials)
            .map_err(|e| AcmeError::ChallengeFailed(format!("serializing account credentials: {e}")))?;
        std::fs::write(&credentials_path, json)?;
        tracing::info!(staging = self.config.staging, "registered new ACME account");
        *self.account.write() = Some(account);
        Ok(())
    }

    async fn load_account(&self, path: &PathBuf) -> Result<Account, AcmeError> {
        let contents = std::fs::read_to_string(path)?;
        let credentials: instant_acme::AccountCredentials = serde_json::from_str(&contents)
            .map_err(|e| AcmeError::ChallengeFailed(format!("invalid saved credentials: {e}")))?;
        let account = Account::builder()?.from_credentials(credentials).await?;
        Ok(account)
    }

    async fn create_account(&self) -> Result<(Account, instant_acme::AccountCredentials), AcmeError> {
        let contact = self
            .config
            .contact_email
            .as_ref()
            .map(|e| format!("mailto:{e}"));
        let contact_refs: Vec<&str> = contact.as_deref().into_iter().collect();

        let new_account = NewAccount {
            contact: &contact_refs,
            terms_of_service_agreed: true,
            only_return_existing: false,
        };

        let (account, credentials) = Account::builder()?
            .create(&new_account, self.config.directory_url(), None)
            .await?;
        Ok((account, credentials))
    }

    /// Walk the HTTP-01 challenge flow for `host` and return the issued
    /// certificate chain and private key, both PEM-encoded.
    pub async fn issue(&self, host: &str) -> Result<(String, String), AcmeError> {
        if host.is_empty() || host.contains('/') || host.starts_with('.') {
            return Err(AcmeError::InvalidHost(host.to_string()));
        }

        let account = self.account.read().clone().ok_or(AcmeError::NotRegistered)?;

        let identifiers = [Identifier::Dns(host.to_string())];
        let mut order = account.new_order(&NewOrder::new(&identifiers)).await?;

        let mut authorizations = order.authorizations();
        while let Some(auth_result) = authorizations.next().await {
            let mut auth = auth_result?;
            match auth.status {
                AuthorizationStatus::Pending => {
                    let mut challenge = auth
                        .challenge(ChallengeType::Http01)
                        .ok_or(AcmeError::NoHttp01Challenge)?;
                    let key_auth = challenge.key_authorization();
                    self.challenge_tokens
                        .write()
                        .insert(challenge.token.clone(), key_auth.as_str().to_string());
                    challenge.set_ready().await?;
                }
                AuthorizationStatus::Valid => {}
                status => {
                    self.challenge_tokens.write().clear();
                    return Err(AcmeError::ChallengeFailed(format!("unexpected status: {status:?}")));
                }
            }
        }

        let retry_policy = RetryPolicy::new().timeout(self.config.order_timeout);
        let status = order.poll_ready(&retry_policy).await?;
        self.challenge_tokens.write().clear();

        match status {
            OrderStatus::Ready => {}
            OrderStatus::Invalid => return Err(AcmeError::ChallengeFailed("order became invalid".to_string())),
            other => return Err(AcmeError::OrderNotReady(format!("{other:?}"))),
        }

        let private_key_pem = order.finalize().await?;
        let cert_chain = order.poll_certificate(&retry_policy).await?;
        Ok((cert_chain, private_key_pem))
    }

    pub fn get_challenge_response(&self, token: &str) -> Option<String> {
        self.challenge_tokens.read().get(token).cloned()
    }

    pub fn is_staging(&self) -> bool {
        self.config.staging
    }
}

/// Answers HTTP-01 challenge requests on the plaintext listener.
pub struct ChallengeHandler {
    tokens: ChallengeTokens,
}

impl ChallengeHandler {
    pub fn new(tokens: ChallengeTokens) -> Self {
        Self { tokens }
    }

    pub fn handle(&self, token: &str) -> Option<String> {
        self.tokens.read().get(token).cloned()
    }
}
