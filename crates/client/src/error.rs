use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ClientError {
    #[snafu(display("an exchange is already in progress on this session"))]
    SessionBusy { stage: &'static str },
    #[snafu(display("failed to build http client: {source}"))]
    BuildHttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("http request failed on `{stage}`: {source}"))]
    HttpRequest {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("incorrect username or password"))]
    Unauthorized { stage: &'static str },
    #[snafu(display("service temporarily unavailable"))]
    ServiceUnavailable { stage: &'static str },
    #[snafu(display("login endpoint returned status {status}"))]
    LoginStatus { stage: &'static str, status: u16 },
    #[snafu(display("health endpoint returned status {status}"))]
    HealthStatus { stage: &'static str, status: u16 },
}

pub type ClientResult<T> = Result<T, ClientError>;
