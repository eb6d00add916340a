use super::{checked_daily_total, daily_log_note, Ledger, LedgerError};
use crate::auth::AuthManager;
use crate::clock::format_date;
use crate::config::LedgerConfig;
use crate::engine::round_hours;
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Сколько раз повторять compare-and-swap дневного лога при параллельной записи
const MAX_CAS_ATTEMPTS: usize = 3;

/// Ledger поверх REST API (PostgREST-совместимый: /rest/v1/<table>).
/// Токены берутся из AuthManager, при 401 выполняется одна попытка refresh.
pub struct HttpLedger {
    api_base_url: String,
    api_key: Option<String>,
    app_version: String,
    cap_hours: f64,
    auth: Arc<AuthManager>,
    client: reqwest::Client,
}

impl HttpLedger {
    pub fn new(config: LedgerConfig, auth: Arc<AuthManager>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.http_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            api_base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            app_version: config.app_version,
            cap_hours: config.daily_cap_hours,
            auth,
            client,
        }
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.api_base_url, table)
    }

    /// Отправить запрос с заголовками авторизации.
    /// `build` вызывается заново на каждой попытке (после refresh токена).
    async fn send_authorized<F>(&self, context: &str, build: F) -> Result<reqwest::Response, LedgerError>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut access_token = self.auth.get_access_token().await?;
        let mut retry_with_refresh = true;

        loop {
            let mut request = build(&self.client)
                .header("Content-Type", "application/json")
                .header("Authorization", format!("Bearer {}", access_token))
                .header("X-App-Version", &self.app_version)
                .header("Prefer", "return=representation");
            if let Some(key) = &self.api_key {
                request = request.header("apikey", key);
            }

            let response = request
                .send()
                .await
                .map_err(|e| LedgerError::Network(e.to_string()))?;
            let status = response.status();

            if status == 401 && retry_with_refresh {
                info!("[LEDGER] Token expired (401) during {}, refreshing", context);
                access_token = self.auth.refresh_session().await.map_err(|e| {
                    warn!("[LEDGER] Failed to refresh token during {}: {}", context, e);
                    e
                })?;
                retry_with_refresh = false; // Только одна попытка обновления
                continue;
            }

            if status.is_success() {
                return Ok(response);
            }

            let body = response.text().await.unwrap_or_default();
            let message = if body.is_empty() {
                status.canonical_reason().unwrap_or("Unknown").into()
            } else {
                body
            };
            if status == 401 {
                return Err(LedgerError::Auth(message));
            }
            return Err(LedgerError::Http {
                status: status.as_u16(),
                message,
            });
        }
    }

    async fn rows(response: reqwest::Response) -> Result<Vec<Value>, LedgerError> {
        response
            .json::<Vec<Value>>()
            .await
            .map_err(|e| LedgerError::Parse(e.to_string()))
    }

    /// (id, hours) строки дневного лога, если она есть
    async fn fetch_daily_row(&self, user_id: &str, date: &str) -> Result<Option<(String, f64)>, LedgerError> {
        let url = self.table_url("daily_logs");
        let response = self
            .send_authorized("daily_logs lookup", |client| {
                client.get(&url).query(&[
                    ("user_id", format!("eq.{}", user_id)),
                    ("date", format!("eq.{}", date)),
                    ("select", "id,hours".to_string()),
                ])
            })
            .await?;

        let rows = Self::rows(response).await?;
        let Some(row) = rows.first() else {
            return Ok(None);
        };
        let id = value_to_id(&row["id"])
            .ok_or_else(|| LedgerError::Parse("Missing id in daily_logs row".into()))?;
        let hours = row["hours"]
            .as_f64()
            .ok_or_else(|| LedgerError::Parse("Missing hours in daily_logs row".into()))?;
        Ok(Some((id, hours)))
    }
}

/// Id строки: строка (uuid) или число (serial)
fn value_to_id(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl Ledger for HttpLedger {
    async fn create_session(
        &self,
        user_id: &str,
        start_time: DateTime<FixedOffset>,
        date: NaiveDate,
    ) -> Result<String, LedgerError> {
        let url = self.table_url("timer_sessions");
        let body = serde_json::json!({
            "user_id": user_id,
            "start_time": start_time.to_rfc3339(),
            "date": format_date(date),
        });

        let response = self
            .send_authorized("create_session", |client| client.post(&url).json(&body))
            .await?;
        let rows = Self::rows(response).await?;
        let id = rows
            .first()
            .and_then(|row| value_to_id(&row["id"]))
            .ok_or_else(|| LedgerError::Parse("Missing id in created timer session".into()))?;

        debug!("[LEDGER] Created remote session {} for {}", id, user_id);
        Ok(id)
    }

    async fn finalize_session(
        &self,
        user_id: &str,
        session_id: &str,
        end_time: DateTime<FixedOffset>,
        duration_seconds: u64,
    ) -> Result<(), LedgerError> {
        let url = self.table_url("timer_sessions");
        let body = serde_json::json!({
            "end_time": end_time.to_rfc3339(),
            "duration_seconds": duration_seconds,
        });

        let response = self
            .send_authorized("finalize_session", |client| {
                client
                    .patch(&url)
                    .query(&[
                        ("id", format!("eq.{}", session_id)),
                        ("user_id", format!("eq.{}", user_id)),
                    ])
                    .json(&body)
            })
            .await?;

        if Self::rows(response).await?.is_empty() {
            return Err(LedgerError::NotFound(session_id.to_string()));
        }
        Ok(())
    }

    /// Read-modify-write через compare-and-swap: PATCH применяется только
    /// если `hours` в строке все еще равны прочитанному значению.
    async fn add_hours_to_daily_log(
        &self,
        user_id: &str,
        date: NaiveDate,
        hours: f64,
    ) -> Result<f64, LedgerError> {
        let date_str = format_date(date);
        let rounded = round_hours(hours);
        let url = self.table_url("daily_logs");

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            match self.fetch_daily_row(user_id, &date_str).await? {
                Some((id, current)) => {
                    let total = checked_daily_total(current, rounded, self.cap_hours)?;
                    let body = serde_json::json!({
                        "hours": total,
                        "notes": daily_log_note(rounded, true),
                    });
                    let response = self
                        .send_authorized("daily_logs update", |client| {
                            client
                                .patch(&url)
                                .query(&[
                                    ("id", format!("eq.{}", id)),
                                    ("hours", format!("eq.{}", current)),
                                ])
                                .json(&body)
                        })
                        .await?;

                    if !Self::rows(response).await?.is_empty() {
                        info!(
                            "[LEDGER] Daily log {} for {}: +{:.2}h → {:.2}h",
                            date_str, user_id, rounded, total
                        );
                        return Ok(total);
                    }
                    warn!(
                        "[LEDGER] Daily log {} changed concurrently (attempt {}/{}), retrying",
                        date_str, attempt, MAX_CAS_ATTEMPTS
                    );
                }
                None => {
                    let total = checked_daily_total(0.0, rounded, self.cap_hours)?;
                    let body = serde_json::json!({
                        "user_id": user_id,
                        "date": date_str,
                        "hours": total,
                        "notes": daily_log_note(rounded, false),
                    });
                    match self
                        .send_authorized("daily_logs insert", |client| client.post(&url).json(&body))
                        .await
                    {
                        Ok(_) => {
                            info!(
                                "[LEDGER] Daily log {} for {} created with {:.2}h",
                                date_str, user_id, total
                            );
                            return Ok(total);
                        }
                        // Строку уже создал параллельный writer: перечитываем
                        Err(LedgerError::Http { status: 409, .. }) => {
                            warn!(
                                "[LEDGER] Daily log {} created concurrently (attempt {}/{}), retrying",
                                date_str, attempt, MAX_CAS_ATTEMPTS
                            );
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        Err(LedgerError::Conflict(format!(
            "daily log {} for {} kept changing after {} attempts",
            date_str, user_id, MAX_CAS_ATTEMPTS
        )))
    }

    async fn daily_hours(&self, user_id: &str, date: NaiveDate) -> Result<f64, LedgerError> {
        Ok(self
            .fetch_daily_row(user_id, &format_date(date))
            .await?
            .map(|(_, hours)| hours)
            .unwrap_or(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserSession;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use tiny_http::{Response, Server};

    #[derive(Debug, Clone)]
    struct Recorded {
        method: String,
        url: String,
        body: String,
        authorization: Option<String>,
    }

    struct Stub {
        base: String,
        requests: Arc<Mutex<Vec<Recorded>>>,
    }

    impl Stub {
        fn requests(&self) -> Vec<Recorded> {
            self.requests.lock().unwrap().clone()
        }
    }

    /// Локальный HTTP-сервер; `handler` возвращает (status, body) на каждый запрос.
    fn spawn_stub<H>(mut handler: H) -> Stub
    where
        H: FnMut(&Recorded) -> (u16, String) + Send + 'static,
    {
        let server = Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let log = requests.clone();

        std::thread::spawn(move || {
            for mut request in server.incoming_requests() {
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                let authorization = request
                    .headers()
                    .iter()
                    .find(|h| h.field.equiv("Authorization"))
                    .map(|h| h.value.as_str().to_string());
                let recorded = Recorded {
                    method: request.method().to_string(),
                    url: request.url().to_string(),
                    body,
                    authorization,
                };
                let (status, payload) = handler(&recorded);
                log.lock().unwrap().push(recorded);
                let _ = request.respond(Response::from_string(payload).with_status_code(status));
            }
        });

        Stub {
            base: format!("http://127.0.0.1:{}", port),
            requests,
        }
    }

    async fn ledger_for(stub: &Stub, refresh_token: Option<&str>) -> HttpLedger {
        let auth = Arc::new(AuthManager::new(stub.base.clone(), None));
        auth.set_session(Some(UserSession {
            user_id: "user-1".into(),
            access_token: Some("token-1".into()),
            refresh_token: refresh_token.map(|s| s.to_string()),
        }))
        .await;
        let config = LedgerConfig {
            api_base_url: stub.base.clone(),
            ..LedgerConfig::default()
        };
        HttpLedger::new(config, auth)
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 10, 14).unwrap()
    }

    fn at(h: u32) -> DateTime<FixedOffset> {
        FixedOffset::east_opt(330 * 60)
            .unwrap()
            .with_ymd_and_hms(2026, 10, 14, h, 0, 0)
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_session_posts_and_returns_id() {
        let stub = spawn_stub(|_| (201, r#"[{"id":"sess-42"}]"#.to_string()));
        let ledger = ledger_for(&stub, None).await;

        let id = ledger.create_session("user-1", at(9), day()).await.unwrap();
        assert_eq!(id, "sess-42");

        let requests = stub.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].url, "/rest/v1/timer_sessions");
        assert_eq!(requests[0].authorization.as_deref(), Some("Bearer token-1"));
        let body: Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(body["user_id"], "user-1");
        assert_eq!(body["date"], "2026-10-14");
        assert!(body["start_time"].as_str().unwrap().ends_with("+05:30"));
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed_once() {
        let stub = spawn_stub(|req| {
            if req.url.starts_with("/auth/v1/token") {
                return (200, r#"{"access_token":"token-2","refresh_token":"r-2"}"#.into());
            }
            match req.authorization.as_deref() {
                Some("Bearer token-2") => (201, r#"[{"id":7}]"#.into()),
                _ => (401, "JWT expired".into()),
            }
        });
        let ledger = ledger_for(&stub, Some("r-1")).await;

        let id = ledger.create_session("user-1", at(9), day()).await.unwrap();
        assert_eq!(id, "7");
        assert_eq!(stub.requests().len(), 3);
        assert_eq!(ledger.auth.get_access_token().await.unwrap(), "token-2");
    }

    #[tokio::test]
    async fn test_finalize_unknown_session_is_not_found() {
        let stub = spawn_stub(|_| (200, "[]".into()));
        let ledger = ledger_for(&stub, None).await;

        let result = ledger.finalize_session("user-1", "missing", at(10), 120).await;
        assert_eq!(result, Err(LedgerError::NotFound("missing".into())));
        assert!(stub.requests()[0].url.contains("id=eq.missing"));
    }

    #[tokio::test]
    async fn test_cap_rejected_before_any_write() {
        let stub = spawn_stub(|_| (200, r#"[{"id":7,"hours":11.5}]"#.into()));
        let ledger = ledger_for(&stub, None).await;

        let result = ledger.add_hours_to_daily_log("user-1", day(), 0.6).await;
        assert!(matches!(result, Err(LedgerError::CapExceeded { .. })));
        assert!(stub.requests().iter().all(|r| r.method == "GET"));
    }

    #[tokio::test]
    async fn test_concurrent_change_retries_with_fresh_value() {
        let mut reads = 0;
        let mut patches = 0;
        let stub = spawn_stub(move |req| match req.method.as_str() {
            "GET" => {
                reads += 1;
                let hours = if reads == 1 { 1.0 } else { 2.0 };
                (200, format!(r#"[{{"id":7,"hours":{}}}]"#, hours))
            }
            "PATCH" => {
                patches += 1;
                if patches == 1 {
                    // другой writer успел изменить строку
                    (200, "[]".into())
                } else {
                    (200, r#"[{"id":7,"hours":2.5}]"#.into())
                }
            }
            _ => (500, String::new()),
        });
        let ledger = ledger_for(&stub, None).await;

        let total = ledger.add_hours_to_daily_log("user-1", day(), 0.5).await.unwrap();
        assert_eq!(total, 2.5);

        let patches: Vec<_> = stub
            .requests()
            .into_iter()
            .filter(|r| r.method == "PATCH")
            .collect();
        assert_eq!(patches.len(), 2);
        assert!(patches[0].url.contains("hours=eq.1"));
        assert!(patches[1].url.contains("hours=eq.2"));
    }

    #[tokio::test]
    async fn test_missing_row_is_created() {
        let stub = spawn_stub(|req| match req.method.as_str() {
            "GET" => (200, "[]".into()),
            _ => (201, r#"[{"id":1,"hours":0.25}]"#.into()),
        });
        let ledger = ledger_for(&stub, None).await;

        let total = ledger.add_hours_to_daily_log("user-1", day(), 0.25).await.unwrap();
        assert_eq!(total, 0.25);
        let insert = stub.requests().into_iter().find(|r| r.method == "POST").unwrap();
        let body: Value = serde_json::from_str(&insert.body).unwrap();
        assert_eq!(body["notes"], "Automated Timer Session - 0.25h");
    }

    #[tokio::test]
    async fn test_signed_out_ledger_fails_without_request() {
        let stub = spawn_stub(|_| (200, "[]".into()));
        let auth = Arc::new(AuthManager::new(stub.base.clone(), None));
        let ledger = HttpLedger::new(
            LedgerConfig {
                api_base_url: stub.base.clone(),
                ..LedgerConfig::default()
            },
            auth,
        );

        let result = ledger.daily_hours("user-1", day()).await;
        assert!(matches!(result, Err(LedgerError::Auth(_))));
        assert!(stub.requests().is_empty());
    }
}
