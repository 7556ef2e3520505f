use super::{LoginRequest, LoginResponse};
use crate::config::ApiSettings;
use crate::error::LoginError;
use serde::Deserialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

const ROLE_INFOS_PATH: &str = "/user/auth/roleInfos";
const SCAN_LOGIN_PATH: &str = "/user/auth/scanLogin";

const CODE_SUCCESS: i64 = 200;
const CODE_TOKEN_EXPIRED: i64 = 220;
const CODE_TICKET_EXPIRED: i64 = 2209;

#[derive(Debug, Deserialize)]
struct ApiReply {
    code: i64,
    #[serde(default, alias = "message")]
    msg: Option<String>,
}

/// Maps an API reply code to a response. `None` means "go on to the next step".
pub fn classify(code: i64, message: &str) -> Option<LoginResponse> {
    match code {
        CODE_SUCCESS => None,
        CODE_TICKET_EXPIRED => Some(LoginResponse::Expired),
        CODE_TOKEN_EXPIRED => Some(LoginResponse::InvalidCredentials),
        code => Some(LoginResponse::Rejected {
            code,
            message: message.to_string(),
        }),
    }
}

/// HTTP client for the scan-login API: validates the ticket, then confirms the login.
///
/// Requests are blocking and run on the blocking pool, one per attempt.
#[derive(Clone)]
pub struct KuroLoginClient {
    agent: ureq::Agent,
    base_url: Arc<str>,
    app_version: Arc<str>,
}

impl KuroLoginClient {
    /// `timeout` bounds each request so a timed-out attempt doesn't hold a thread.
    pub fn new(settings: &ApiSettings, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .user_agent("okhttp/4.9.0")
            .timeout(timeout)
            .max_idle_connections_per_host(4)
            .build();
        Self {
            agent,
            base_url: settings.base_url.trim_end_matches('/').into(),
            app_version: settings.app_version.as_str().into(),
        }
    }

    fn post(
        &self,
        path: &str,
        request: &LoginRequest,
        form: &[(&str, &str)],
    ) -> Result<ApiReply, LoginError> {
        let url = format!("{}{}", self.base_url, path);
        let sent = self
            .agent
            .post(&url)
            .set("source", "android")
            .set("version", &self.app_version)
            .set("devCode", &request.credentials.dev_code)
            .set("token", &request.credentials.token)
            .send_form(form);

        let response = match sent {
            Ok(response) => response,
            Err(ureq::Error::Status(code, _)) if code >= 500 => {
                return Err(LoginError::Status(code));
            }
            // The API reports most failures in the JSON body, whatever the status.
            Err(ureq::Error::Status(_, response)) => response,
            Err(e) => return Err(LoginError::Transport(Box::new(e))),
        };

        let status = response.status();
        let body = response.into_string()?;
        serde_json::from_str(&body).map_err(|e| {
            LoginError::Protocol(format!(
                "{} answered HTTP {} with {} bytes: {}",
                path,
                status,
                body.len(),
                e
            ))
        })
    }

    fn login(&self, request: &LoginRequest) -> Result<LoginResponse, LoginError> {
        let ticket = request.ticket.as_str();

        let reply = self.post(ROLE_INFOS_PATH, request, &[("qrCode", ticket)])?;
        tracing::debug!("roleInfos answered {}", reply.code);
        if let Some(response) = classify(reply.code, reply.msg.as_deref().unwrap_or_default()) {
            return Ok(response);
        }

        let auto_login = if request.auto_login { "true" } else { "false" };
        let reply = self.post(
            SCAN_LOGIN_PATH,
            request,
            &[
                ("autoLogin", auto_login),
                ("qrCode", ticket),
                ("id", ""),
                ("verifyCode", request.verify_code.as_str()),
            ],
        )?;
        tracing::debug!("scanLogin answered {}", reply.code);
        Ok(classify(reply.code, reply.msg.as_deref().unwrap_or_default())
            .unwrap_or(LoginResponse::Success))
    }
}

impl Service<LoginRequest> for KuroLoginClient {
    type Response = LoginResponse;
    type Error = LoginError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: LoginRequest) -> Self::Future {
        let client = self.clone();
        Box::pin(async move {
            tokio::task::spawn_blocking(move || client.login(&request))
                .await
                .map_err(|e| LoginError::Worker(e.to_string()))?
        })
    }
}
