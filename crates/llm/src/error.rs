use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
#[snafu(display("unknown {kind} '{raw}'"))]
pub struct ParseKindError {
    pub kind: &'static str,
    pub raw: String,
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ApiError {
    #[snafu(display("failed to build api http client on `{stage}`: {source}"))]
    BuildHttpClient {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("api request failed on `{stage}`: {source}"))]
    HttpRequest {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("api returned status {status} on `{stage}`: {body}"))]
    HttpStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("failed to decode api response on `{stage}`: {source}"))]
    DecodeResponse {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("reading the response stream failed on `{stage}`: {source}"))]
    StreamRead {
        stage: &'static str,
        source: reqwest::Error,
    },
    #[snafu(display("generation stream failed on `{stage}`: {message}"))]
    StreamInterrupted {
        stage: &'static str,
        message: String,
    },
}

pub type ApiResult<T> = Result<T, ApiError>;
