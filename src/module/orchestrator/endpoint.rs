use crate::library::BoxedError;
use async_trait::async_trait;
use hyper::client::HttpConnector;
use hyper::header::CONTENT_TYPE;
use hyper::{body, Body, Client as HttpClient, Method, Request, StatusCode};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, trace};

/// Characters escaped in evaluation ids placed into a path segment
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'\\')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

fn segment(evaluation_id: &str) -> String {
    utf8_percent_encode(evaluation_id, PATH_SEGMENT).to_string()
}

/// Failure of a single request to the execution endpoint
#[derive(Debug, Error)]
pub enum EndpointError {
    /// Request could not be constructed
    #[error("invalid request to {url}")]
    Request {
        /// Target of the request
        url: String,
        /// Underlying error
        #[source]
        source: hyper::http::Error,
    },
    /// Connection failed or dropped before a complete response arrived
    #[error("unable to reach {url}")]
    Connection {
        /// Target of the request
        url: String,
        /// Underlying error
        #[source]
        source: BoxedError,
    },
    /// Endpoint answered with an unsuccessful status
    #[error("{url} responded with status {status}: {body}")]
    Status {
        /// Target of the request
        url: String,
        /// HTTP status code
        status: u16,
        /// Response body
        body: String,
    },
}

impl EndpointError {
    /// Whether repeating the request may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, EndpointError::Connection { .. })
    }
}

/// Response to an output manifest request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// HTTP status of the response
    pub status: u16,
    /// Output paths listed in the response, empty for unsuccessful responses
    pub paths: Vec<PathBuf>,
}

impl Manifest {
    /// Whether the endpoint answered with a 2xx status
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Remote service executing evaluation jobs
#[async_trait]
pub trait ExecutionEndpoint: Send + Sync {
    /// Location of the endpoint, used in diagnostics
    fn location(&self) -> &str;

    /// Starts an evaluation and returns the identifier assigned by the endpoint
    async fn submit(&self, declaration: &str) -> Result<String, EndpointError>;

    /// Raw status of an evaluation
    async fn status(&self, evaluation_id: &str) -> Result<String, EndpointError>;

    /// Standard output of an evaluation
    async fn stdout(&self, evaluation_id: &str) -> Result<String, EndpointError>;

    /// Standard error of an evaluation
    async fn stderr(&self, evaluation_id: &str) -> Result<String, EndpointError>;

    /// Output manifest of an evaluation, unsuccessful statuses are part of the result
    async fn manifest(&self, evaluation_id: &str) -> Result<Manifest, EndpointError>;

    /// Releases the evaluation on the endpoint
    async fn close(&self, evaluation_id: &str) -> Result<(), EndpointError>;
}

/// [`ExecutionEndpoint`] reached over HTTP
pub struct HttpExecutionEndpoint {
    base: String,
    client: HttpClient<HttpConnector>,
    request_timeout: Duration,
}

impl HttpExecutionEndpoint {
    /// Creates an endpoint below the given base URL, e.g. `http://localhost:8010`
    pub fn new(base: impl Into<String>) -> Self {
        Self {
            base: base.into().trim_end_matches('/').to_owned(),
            client: HttpClient::new(),
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Limits how long a single request including its response body may take
    ///
    /// Requests exceeding it fail like a dropped connection and are retried accordingly.
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        payload: Option<String>,
    ) -> Result<(StatusCode, String), EndpointError> {
        let url = format!("{}{}", self.base, path);
        let request = Request::builder()
            .method(method)
            .uri(&url)
            .header(CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(payload.map(Body::from).unwrap_or_else(Body::empty))
            .map_err(|source| EndpointError::Request {
                url: url.clone(),
                source,
            })?;

        let connection_error = |e: hyper::Error| EndpointError::Connection {
            url: url.clone(),
            source: e.into(),
        };

        let exchange = async {
            let response = self.client.request(request).await?;
            let status = response.status();
            let bytes = body::to_bytes(response.into_body()).await?;
            Ok::<_, hyper::Error>((status, bytes))
        };

        let (status, bytes) = timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| EndpointError::Connection {
                url: url.clone(),
                source: format!("no response within {:?}", self.request_timeout).into(),
            })?
            .map_err(connection_error)?;

        trace!(%url, %status, length = bytes.len(), "Endpoint responded");

        Ok((status, String::from_utf8_lossy(&bytes).into_owned()))
    }

    async fn expect_success(
        &self,
        method: Method,
        path: &str,
        payload: Option<String>,
    ) -> Result<String, EndpointError> {
        let (status, body) = self.send(method, path, payload).await?;

        if status.is_success() {
            Ok(body)
        } else {
            Err(EndpointError::Status {
                url: format!("{}{}", self.base, path),
                status: status.as_u16(),
                body,
            })
        }
    }
}

#[async_trait]
impl ExecutionEndpoint for HttpExecutionEndpoint {
    fn location(&self) -> &str {
        &self.base
    }

    async fn submit(&self, declaration: &str) -> Result<String, EndpointError> {
        let body = self
            .expect_success(
                Method::POST,
                "/evaluation/startEvaluation",
                Some(declaration.to_owned()),
            )
            .await?;

        Ok(body.trim().to_owned())
    }

    async fn status(&self, evaluation_id: &str) -> Result<String, EndpointError> {
        let path = format!("/evaluation/status/{}", segment(evaluation_id));
        Ok(self
            .expect_success(Method::GET, &path, None)
            .await?
            .trim()
            .to_owned())
    }

    async fn stdout(&self, evaluation_id: &str) -> Result<String, EndpointError> {
        let path = format!("/evaluation/stdout/{}", segment(evaluation_id));
        self.expect_success(Method::GET, &path, None).await
    }

    async fn stderr(&self, evaluation_id: &str) -> Result<String, EndpointError> {
        let path = format!("/evaluation/stderr/{}", segment(evaluation_id));
        self.expect_success(Method::GET, &path, None).await
    }

    async fn manifest(&self, evaluation_id: &str) -> Result<Manifest, EndpointError> {
        let path = format!("/evaluation/getEvaluation/{}", segment(evaluation_id));
        let (status, body) = self.send(Method::GET, &path, None).await?;

        let paths = if status.is_success() {
            body.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(PathBuf::from)
                .collect()
        } else {
            debug!(%evaluation_id, %status, "Output manifest unavailable");
            Vec::new()
        };

        Ok(Manifest {
            status: status.as_u16(),
            paths,
        })
    }

    async fn close(&self, evaluation_id: &str) -> Result<(), EndpointError> {
        self.expect_success(
            Method::POST,
            "/evaluation/close",
            Some(evaluation_id.to_owned()),
        )
        .await?;

        Ok(())
    }
}
