//! HTTP outbound automaton.
//!
//! Emits one request (request line, headers, optional body) and treats
//! whatever the server replies with as terminal. No response-body parsing.

use crate::automaton::{Action, Automaton, AutomatonError, Terminator};

const CRLF: &str = "\r\n";

/// One HTTP request to emit.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub host: String,
    /// Extra headers appended after the defaults.
    pub headers: Vec<(String, String)>,
    pub body: Option<Vec<u8>>,
}

impl HttpRequest {
    pub fn get(host: impl Into<String>, path: impl Into<String>) -> Self {
        HttpRequest {
            method: "GET".to_string(),
            path: path.into(),
            host: host.into(),
            headers: Vec::new(),
            body: None,
        }
    }
}

/// Outbound HTTP automaton.
pub struct HttpClient {
    request: HttpRequest,
}

impl HttpClient {
    pub fn new(request: HttpRequest) -> Self {
        HttpClient { request }
    }

    fn render(&self) -> Vec<u8> {
        let r = &self.request;
        let mut out = format!("{} {} HTTP/1.1{CRLF}", r.method.to_ascii_uppercase(), r.path);
        out.push_str(&format!("Host: {}{CRLF}", r.host));
        out.push_str(&format!("Accept-Encoding: identity{CRLF}"));
        out.push_str(&format!(
            "User-Agent: protonode/{}{CRLF}",
            env!("CARGO_PKG_VERSION")
        ));
        for (name, value) in &r.headers {
            out.push_str(&format!("{name}: {value}{CRLF}"));
        }
        if let Some(body) = &r.body {
            out.push_str(&format!("Content-Length: {}{CRLF}", body.len()));
        }
        out.push_str(CRLF);

        let mut bytes = out.into_bytes();
        if let Some(body) = &r.body {
            bytes.extend_from_slice(body);
        }
        bytes
    }
}

impl Automaton for HttpClient {
    fn initial(&mut self) -> Result<Action, AutomatonError> {
        Ok(Action::idle().with_terminator(Terminator::Bytes(b"\r\n\r\n".to_vec())))
    }

    fn connect(&mut self) -> Result<Action, AutomatonError> {
        Ok(Action::send(self.render()))
    }

    fn operative(&mut self, _chunk: &[u8]) -> Result<Action, AutomatonError> {
        // Any reply ends the session; the response body is not our problem.
        Ok(Action::finish().with_close())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automaton::Label;

    #[test]
    fn test_request_rendering() {
        let mut c = HttpClient::new(HttpRequest {
            method: "get".to_string(),
            path: "/api/1.0/".to_string(),
            host: "localhost".to_string(),
            headers: vec![("Accept".to_string(), "application/xml".to_string())],
            body: None,
        });

        let action = c.next(Label::Initial, b"").unwrap();
        assert_eq!(
            action.terminator,
            Some(Terminator::Bytes(b"\r\n\r\n".to_vec()))
        );

        let action = c.next(Label::Connect, b"").unwrap();
        let text = String::from_utf8(action.push.unwrap()).unwrap();
        assert!(text.starts_with("GET /api/1.0/ HTTP/1.1\r\n"));
        assert!(text.contains("Host: localhost\r\n"));
        assert!(text.contains("Accept-Encoding: identity\r\n"));
        assert!(text.contains("Accept: application/xml\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_body_gets_content_length() {
        let mut request = HttpRequest::get("localhost", "/submit");
        request.method = "POST".to_string();
        request.body = Some(b"payload".to_vec());
        let mut c = HttpClient::new(request);

        let action = c.next(Label::Connect, b"").unwrap();
        let bytes = action.push.unwrap();
        let text = String::from_utf8_lossy(&bytes);
        assert!(text.contains("Content-Length: 7\r\n"));
        assert!(text.ends_with("\r\n\r\npayload"));
    }

    #[test]
    fn test_any_reply_is_terminal() {
        let mut c = HttpClient::new(HttpRequest::get("localhost", "/"));
        c.next(Label::Initial, b"").unwrap();
        c.next(Label::Connect, b"").unwrap();

        let action = c.next(Label::Operative, b"HTTP/1.1 200 OK").unwrap();
        assert!(action.done);
        assert!(action.close);
    }
}
