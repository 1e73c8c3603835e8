//! Backend-agnostic request description.

use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use lectern_common::{Error, Result};

/// Characters escaped inside a single path segment.
const PATH_SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

/// HTTP method of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Patch => "PATCH",
            Method::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One field of a multipart form.
#[derive(Debug, Clone, PartialEq)]
pub enum FormPart {
    /// Plain text field.
    Text { name: String, value: String },
    /// File field.
    File {
        name: String,
        filename: String,
        content_type: Option<String>,
        data: Vec<u8>,
    },
}

impl FormPart {
    /// Field name.
    pub fn name(&self) -> &str {
        match self {
            FormPart::Text { name, .. } | FormPart::File { name, .. } => name,
        }
    }
}

/// Request payload.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(Value),
    Multipart(Vec<FormPart>),
}

/// A single call against the backend.
///
/// The path is a template such as `/api/documents/{id}`; placeholders are
/// filled from `params` and percent-encoded by [`ApiRequest::resolve_path`].
#[derive(Debug, Clone, PartialEq)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub params: BTreeMap<String, String>,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    pub headers: Vec<(String, String)>,
}

impl ApiRequest {
    /// Create a request with no parameters or body.
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: BTreeMap::new(),
            query: Vec::new(),
            body: RequestBody::Empty,
            headers: Vec::new(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::Post, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::Put, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::Delete, path)
    }

    /// Bind a path placeholder.
    pub fn param(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.params.insert(name.into(), value.to_string());
        self
    }

    /// Append a query parameter.
    pub fn query(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((name.into(), value.to_string()));
        self
    }

    /// Append a query parameter only when a value is present.
    pub fn query_opt<V: ToString>(self, name: impl Into<String>, value: Option<V>) -> Self {
        match value {
            Some(value) => self.query(name, value),
            None => self,
        }
    }

    /// Attach a JSON body.
    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    /// Attach a JSON body serialized from `body`.
    ///
    /// # Errors
    /// - `body` cannot be represented as JSON
    pub fn json_from<T: Serialize>(self, body: &T) -> Result<Self> {
        let value = serde_json::to_value(body)
            .map_err(|e| Error::InvalidInput(format!("Failed to serialize body: {}", e)))?;
        Ok(self.json(value))
    }

    /// Attach a multipart body.
    pub fn multipart(mut self, parts: Vec<FormPart>) -> Self {
        self.body = RequestBody::Multipart(parts);
        self
    }

    /// Add a request header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Substitute every `{name}` placeholder of the path template.
    ///
    /// # Errors
    /// - A placeholder has no bound parameter
    /// - The template contains an unbalanced brace
    pub fn resolve_path(&self) -> Result<String> {
        let mut resolved = String::with_capacity(self.path.len());
        let mut rest = self.path.as_str();

        while let Some(open) = rest.find('{') {
            resolved.push_str(&rest[..open]);
            let after = &rest[open + 1..];
            let close = after.find('}').ok_or_else(|| {
                Error::InvalidInput(format!("Unterminated placeholder in '{}'", self.path))
            })?;
            let name = &after[..close];
            let value = self.params.get(name).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "Missing path parameter '{}' for '{}'",
                    name, self.path
                ))
            })?;
            resolved.extend(utf8_percent_encode(value, PATH_SEGMENT));
            rest = &after[close + 1..];
        }

        if rest.contains('}') {
            return Err(Error::InvalidInput(format!(
                "Unbalanced placeholder in '{}'",
                self.path
            )));
        }
        resolved.push_str(rest);
        Ok(resolved)
    }

    /// `METHOD /resolved/path`, used for logging and scripted routes.
    pub fn route(&self) -> Result<String> {
        Ok(format!("{} {}", self.method, self.resolve_path()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path() {
        let request = ApiRequest::get("/api/documents/{id}/conversation").param("id", 7);
        assert_eq!(
            request.resolve_path().unwrap(),
            "/api/documents/7/conversation"
        );
    }

    #[test]
    fn test_resolve_path_encodes_segments() {
        let request = ApiRequest::get("/api/lectures/user/{userId}").param("userId", "a b/c");
        assert_eq!(
            request.resolve_path().unwrap(),
            "/api/lectures/user/a%20b%2Fc"
        );
    }

    #[test]
    fn test_missing_param_is_rejected() {
        let request = ApiRequest::delete("/api/documents/{id}");
        assert!(matches!(
            request.resolve_path(),
            Err(Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_unbalanced_template_is_rejected() {
        assert!(ApiRequest::get("/api/{id").param("id", 1).resolve_path().is_err());
        assert!(ApiRequest::get("/api/id}").resolve_path().is_err());
    }

    #[test]
    fn test_query_opt_skips_none() {
        let request = ApiRequest::get("/api/documents/search/similar")
            .query("q", "rust")
            .query_opt("limit", None::<u32>);
        assert_eq!(request.query, vec![("q".to_string(), "rust".to_string())]);
    }

    #[test]
    fn test_route() {
        let request = ApiRequest::put("/api/documents/{id}").param("id", 3);
        assert_eq!(request.route().unwrap(), "PUT /api/documents/3");
    }

    #[test]
    fn test_json_from() {
        #[derive(Serialize)]
        struct Body {
            name: &'static str,
        }
        let request = ApiRequest::post("/api/lectures")
            .json_from(&Body { name: "Algebra" })
            .unwrap();
        assert_eq!(
            request.body,
            RequestBody::Json(serde_json::json!({ "name": "Algebra" }))
        );
    }
}
