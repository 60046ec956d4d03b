use {
    std::{collections::BTreeMap, io},
    serde::{Serialize, Deserialize},
    serde_json::ser::Formatter,
    thiserror::Error,
    http::{HeaderMap, StatusCode, header::{self, IntoHeaderName, HeaderName, HeaderValue}},
};

pub const CONTENT_TYPE_JSON: &str = "application/json";

/// Response produced by the visitor function, before it is handed to whatever
/// harness serves it (local http server, one-shot cli invocation, etc.).
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            body: vec![],
        }
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn with_header<K: IntoHeaderName>(mut self, header_name: K, header_value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(header_name, header_value.into());
        self
    }

    pub fn with_body(mut self, body: impl HttpResponseBody) -> Self {
        self.body = body.into_bytes();
        self
    }

    /// Renders `{"visitor": "6"}`, with a space after every separator, the way existing clients receive it.
    pub fn with_json<T: Serialize>(self, value: &T) -> Result<Self, HttpResponseError> {
        let mut body = Vec::new();
        let mut serializer = serde_json::Serializer::with_formatter(&mut body, SpacedFormatter);
        value.serialize(&mut serializer)
            .map_err(|err| HttpResponseError::SerializationError { reason: err.to_string() })?;
        Ok(self
            .with_header(header::CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON))
            .with_body(body))
    }

    /// Browser widgets call the function cross-origin, so every response (errors included) carries these.
    pub fn with_cors(self) -> Self {
        self
            .with_header(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"))
            .with_header(header::ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"))
    }

    pub fn body_str(&self) -> Result<&str, HttpResponseError> {
        std::str::from_utf8(&self.body)
            .map_err(|err| HttpResponseError::InvalidBody { reason: err.to_string() })
    }

    pub fn into_envelope(self) -> Result<ResponseEnvelope, HttpResponseError> {
        let mut headers = BTreeMap::new();
        for (name, value) in self.headers.iter() {
            let value = value.to_str()
                .map_err(|_err| HttpResponseError::InvalidHeader { name: name.to_string() })?;
            headers.insert(canonical_header_name(name), value.to_owned());
        }

        let body = String::from_utf8(self.body)
            .map_err(|err| HttpResponseError::InvalidBody { reason: err.to_string() })?;

        Ok(ResponseEnvelope {
            status_code: self.status,
            body,
            headers,
        })
    }
}

impl Default for HttpResponse {
    fn default() -> Self {
        Self::new()
    }
}

/// Compact json with `", "` between entries and `": "` between keys and values.
struct SpacedFormatter;

impl Formatter for SpacedFormatter {
    fn begin_array_value<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_key<W: ?Sized + io::Write>(&mut self, writer: &mut W, first: bool) -> io::Result<()> {
        if first { Ok(()) } else { writer.write_all(b", ") }
    }

    fn begin_object_value<W: ?Sized + io::Write>(&mut self, writer: &mut W) -> io::Result<()> {
        writer.write_all(b": ")
    }
}

/// The `{statusCode, body, headers}` shape serverless harnesses expect from a function.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    #[serde(rename = "statusCode", with = "http_serde::status_code")]
    pub status_code: StatusCode,
    pub body: String,
    pub headers: BTreeMap<String, String>,
}

/// `http` keeps header names lowercase, the envelope uses the `Content-Type` spelling.
fn canonical_header_name(name: &HeaderName) -> String {
    name.as_str()
        .split('-')
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct VisitorCount {
    /// Rendered as a string, existing widgets read it that way.
    pub visitor: String,
}

impl VisitorCount {
    pub fn new(count: u64) -> Self {
        Self {
            visitor: count.to_string(),
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl ErrorBody {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum HttpResponseError {
    #[error("failed to serialize response body: {reason}")]
    SerializationError { reason: String },

    #[error("response body is not valid utf-8: {reason}")]
    InvalidBody { reason: String },

    #[error("header value can not be rendered as string: {name}")]
    InvalidHeader { name: String },
}

pub trait HttpResponseBody {
    fn into_bytes(self) -> Vec<u8>;
}

impl HttpResponseBody for Vec<u8> {
    fn into_bytes(self) -> Vec<u8> { self }
}

impl HttpResponseBody for String {
    fn into_bytes(self) -> Vec<u8> { self.into_bytes() }
}

impl HttpResponseBody for &str {
    fn into_bytes(self) -> Vec<u8> { self.as_bytes().to_vec() }
}
