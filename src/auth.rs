use crate::ledger::LedgerError;
use crate::models::TokenRefreshResult;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Активная пользовательская сессия
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserSession {
    pub user_id: String,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl UserSession {
    /// Session without tokens, enough for the local ledger
    pub fn local(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: None,
            refresh_token: None,
        }
    }
}

/// Менеджер аутентификации: кто сейчас вошел и с какими токенами.
/// Без сессии start/end отклоняются до любых изменений состояния.
pub struct AuthManager {
    api_base_url: String,
    api_key: Option<String>,
    pub session: Arc<tokio::sync::RwLock<Option<UserSession>>>,
}

impl AuthManager {
    pub fn new(api_base_url: String, api_key: Option<String>) -> Self {
        Self {
            api_base_url,
            api_key,
            session: Arc::new(tokio::sync::RwLock::new(None)),
        }
    }

    /// Установить (или сбросить) сессию
    pub async fn set_session(&self, session: Option<UserSession>) {
        match &session {
            Some(s) => info!("[AUTH] Signed in as {}", s.user_id),
            None => info!("[AUTH] Signed out"),
        }
        *self.session.write().await = session;
    }

    pub async fn current_user(&self) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .map(|s| s.user_id.clone())
    }

    pub async fn get_access_token(&self) -> Result<String, LedgerError> {
        self.session
            .read()
            .await
            .as_ref()
            .and_then(|s| s.access_token.clone())
            .ok_or_else(|| LedgerError::Auth("Access token not set. Sign in first.".to_string()))
    }

    pub async fn get_refresh_token(&self) -> Option<String> {
        self.session
            .read()
            .await
            .as_ref()
            .and_then(|s| s.refresh_token.clone())
    }

    /// Обновить токены через refresh token и сохранить их в сессии.
    /// Возвращает новый access token.
    pub async fn refresh_session(&self) -> Result<String, LedgerError> {
        let refresh = self.get_refresh_token().await.ok_or_else(|| {
            LedgerError::Auth("Token expired (401) but no refresh token available".into())
        })?;

        let result = self.refresh_token(&refresh).await?;

        let mut guard = self.session.write().await;
        match guard.as_mut() {
            Some(session) => {
                session.access_token = Some(result.access_token.clone());
                if let Some(new_refresh) = result.refresh_token {
                    session.refresh_token = Some(new_refresh);
                }
            }
            None => {
                warn!("[AUTH] Session was cleared during token refresh, dropping new tokens");
                return Err(LedgerError::Auth("Signed out during token refresh".into()));
            }
        }
        info!("[AUTH] Access token refreshed");
        Ok(result.access_token)
    }

    /// Обновить токен через refresh token
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenRefreshResult, LedgerError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| LedgerError::Network(format!("Failed to create HTTP client: {}", e)))?;

        let url = format!(
            "{}/auth/v1/token?grant_type=refresh_token",
            self.api_base_url
        );
        let mut request = client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&serde_json::json!({
                "refresh_token": refresh_token
            }));
        if let Some(key) = &self.api_key {
            request = request.header("apikey", key);
        }

        let response = request
            .send()
            .await
            .map_err(|e| LedgerError::Network(format!("Network error during token refresh: {}", e)))?;

        if !response.status().is_success() {
            return Err(LedgerError::Auth(format!(
                "Token refresh failed with status: {}",
                response.status()
            )));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LedgerError::Parse(format!("Failed to parse refresh response: {}", e)))?;

        let access_token = json["access_token"]
            .as_str()
            .ok_or_else(|| LedgerError::Parse("Missing access_token in refresh response".to_string()))?
            .to_string();

        let refresh_token = json["refresh_token"].as_str().map(|s| s.to_string());

        Ok(TokenRefreshResult {
            access_token,
            refresh_token,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_no_session_means_no_user() {
        let auth = AuthManager::new(String::new(), None);
        assert_eq!(auth.current_user().await, None);
        assert!(matches!(
            auth.get_access_token().await,
            Err(LedgerError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn test_set_and_clear_session() {
        let auth = AuthManager::new(String::new(), None);
        auth.set_session(Some(UserSession {
            user_id: "user-1".into(),
            access_token: Some("token".into()),
            refresh_token: None,
        }))
        .await;
        assert_eq!(auth.current_user().await.as_deref(), Some("user-1"));
        assert_eq!(auth.get_access_token().await.unwrap(), "token");

        auth.set_session(None).await;
        assert_eq!(auth.current_user().await, None);
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_fails() {
        let auth = AuthManager::new(String::new(), None);
        auth.set_session(Some(UserSession::local("user-1"))).await;
        assert!(matches!(
            auth.refresh_session().await,
            Err(LedgerError::Auth(_))
        ));
    }
}
