use futures::StreamExt;
use snafu::ResultExt;
use tokio::sync::{mpsc, oneshot};

use murmur_protocol::{ChatRequest, ServerHealth};

use crate::config::ServerConfig;
use crate::error::{
    BuildHttpClientSnafu, ClientResult, HealthStatusSnafu, HttpRequestSnafu, LoginStatusSnafu,
    ServiceUnavailableSnafu, UnauthorizedSnafu,
};
use crate::transport::{
    ChatTransport, StreamEnd, TransportEvent, TransportHandle, TransportWorker,
    make_transport_stream,
};

/// The server recognizes a single basic-auth account.
const AUTH_USERNAME: &str = "admin";

/// reqwest-backed transport for the inference server's HTTP surface.
pub struct HttpTransport {
    config: ServerConfig,
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: ServerConfig) -> ClientResult<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context(BuildHttpClientSnafu {
                stage: "build-http-client",
            })?;

        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.config.base_url())
    }

    /// Probes the health endpoint and decodes the readiness payload.
    pub async fn check_health(&self) -> ClientResult<ServerHealth> {
        let response = self
            .client
            .get(self.endpoint("/health"))
            .send()
            .await
            .context(HttpRequestSnafu {
                stage: "send-health-request",
            })?;

        let status = response.status();
        if !status.is_success() {
            return HealthStatusSnafu {
                stage: "health-http-status",
                status: status.as_u16(),
            }
            .fail();
        }

        response
            .json::<ServerHealth>()
            .await
            .context(HttpRequestSnafu {
                stage: "decode-health-response",
            })
    }

    /// Verifies the configured credentials against the login endpoint.
    pub async fn verify_login(&self) -> ClientResult<()> {
        let response = self
            .client
            .post(self.endpoint("/login"))
            .basic_auth(AUTH_USERNAME, Some(self.config.password.as_str()))
            .send()
            .await
            .context(HttpRequestSnafu {
                stage: "send-login-request",
            })?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status == reqwest::StatusCode::UNAUTHORIZED {
            UnauthorizedSnafu {
                stage: "login-http-status",
            }
            .fail()
        } else if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            ServiceUnavailableSnafu {
                stage: "login-http-status",
            }
            .fail()
        } else {
            LoginStatusSnafu {
                stage: "login-http-status",
                status: status.as_u16(),
            }
            .fail()
        }
    }

    async fn run_chat_worker(
        client: reqwest::Client,
        url: String,
        password: String,
        request: ChatRequest,
        event_tx: mpsc::UnboundedSender<TransportEvent>,
        mut cancel_rx: oneshot::Receiver<()>,
    ) {
        let send = client
            .post(url)
            .basic_auth(AUTH_USERNAME, Some(password.as_str()))
            .json(&request)
            .send();

        let response = tokio::select! {
            _ = &mut cancel_rx => {
                tracing::debug!("chat request cancelled before the response arrived");
                return;
            }
            result = send => match result {
                Ok(response) => response,
                Err(error) => {
                    tracing::warn!(error = %error, "chat request failed to connect");
                    let _ = event_tx.send(TransportEvent::Closed(StreamEnd::NetworkError(
                        error.to_string(),
                    )));
                    return;
                }
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                status = status.as_u16(),
                "chat endpoint returned a non-success status"
            );
            let _ = event_tx.send(TransportEvent::Closed(StreamEnd::HttpStatus(
                status.as_u16(),
            )));
            return;
        }

        let mut body = response.bytes_stream();

        loop {
            tokio::select! {
                _ = &mut cancel_rx => {
                    tracing::debug!("chat response stream cancelled");
                    return;
                }
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        if event_tx.send(TransportEvent::Body(bytes.to_vec())).is_err() {
                            return;
                        }
                    }
                    Some(Err(error)) => {
                        tracing::warn!(error = %error, "chat response stream failed");
                        let _ = event_tx.send(TransportEvent::Closed(StreamEnd::NetworkError(
                            error.to_string(),
                        )));
                        return;
                    }
                    None => {
                        let _ = event_tx.send(TransportEvent::Closed(StreamEnd::Success));
                        return;
                    }
                }
            }
        }
    }
}

impl ChatTransport for HttpTransport {
    fn send_chat(&self, request: ChatRequest) -> ClientResult<TransportHandle> {
        let (event_tx, stream, cancel_rx) = make_transport_stream();
        let worker: TransportWorker = Box::pin(Self::run_chat_worker(
            self.client.clone(),
            self.endpoint("/chat"),
            self.config.password.clone(),
            request,
            event_tx,
            cancel_rx,
        ));

        Ok(TransportHandle { stream, worker })
    }
}
