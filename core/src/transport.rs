use crate::error::TransportError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use url::Url;

/// Body of a streamed response, chunk by chunk, in arrival order.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, TransportError>>;

/// One file sent as a `multipart/form-data` part.
#[derive(Clone, PartialEq, Eq)]
pub struct FileUpload {
    pub field: String,
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl std::fmt::Debug for FileUpload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileUpload")
            .field("field", &self.field)
            .field("file_name", &self.file_name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// A backend call, described independently of the HTTP client executing it.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Sent as a multipart form instead of `body` when present.
    pub upload: Option<FileUpload>,
    pub bearer: Option<String>,
    /// Whether the dispatcher should attach the session token and renew it on 401.
    pub authenticated: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            upload: None,
            bearer: None,
            authenticated: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn patch(path: impl Into<String>) -> Self {
        Self::new(Method::PATCH, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json(mut self, body: &impl Serialize) -> Result<Self, TransportError> {
        let value = serde_json::to_value(body)
            .map_err(|err| TransportError::InvalidRequest(err.to_string()))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn upload(mut self, upload: FileUpload) -> Self {
        self.upload = Some(upload);
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    /// Sent without the session credential and never renewed.
    pub fn anonymous(mut self) -> Self {
        self.authenticated = false;
        self
    }
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: body.into(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// A response whose body is still arriving.
pub struct StreamingResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl StreamingResponse {
    /// Drains the remaining body. Used for error bodies only.
    pub async fn collect_body(self) -> Result<Vec<u8>, TransportError> {
        let mut body = self.body;
        let mut out = Vec::new();
        while let Some(chunk) = body.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }
}

impl std::fmt::Debug for StreamingResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends `request` and buffers the whole response.
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransportError>;

    /// Sends `request` and returns as soon as the headers are in.
    async fn open_stream(&self, request: ApiRequest) -> Result<StreamingResponse, TransportError>;
}

/// [`HttpTransport`] over a `reqwest` client.
#[derive(Debug, Clone)]
pub struct ReqwestTransport {
    http: Client,
    base_url: Url,
}

impl ReqwestTransport {
    pub fn new(base_url: Url) -> Result<Self, TransportError> {
        let http = Client::builder().build()?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: Client, base_url: Url) -> Self {
        Self {
            http,
            base_url: with_trailing_slash(base_url),
        }
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, TransportError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| TransportError::InvalidRequest(format!("invalid path {path}: {err}")))
    }

    fn build(&self, request: &ApiRequest) -> Result<reqwest::RequestBuilder, TransportError> {
        let mut builder = self
            .http
            .request(request.method.clone(), self.endpoint(&request.path)?);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        if let Some(token) = &request.bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(upload) = &request.upload {
            let part = Part::bytes(upload.bytes.clone()).file_name(upload.file_name.clone());
            builder = builder.multipart(Form::new().part(upload.field.clone(), part));
        } else if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        Ok(builder)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn execute(&self, request: ApiRequest) -> Result<ApiResponse, TransportError> {
        let response = self.build(&request)?.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    async fn open_stream(&self, request: ApiRequest) -> Result<StreamingResponse, TransportError> {
        let response = self.build(&request)?.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(TransportError::from))
            .boxed();
        Ok(StreamingResponse {
            status,
            headers,
            body,
        })
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
