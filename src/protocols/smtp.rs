//! SMTP automata: command-mode server and scripted client.
//!
//! The server enforces reply-code sequencing in handler state, not in the
//! framing layer: RCPT needs a prior MAIL, DATA needs a prior RCPT, MAIL
//! while set is "nested", a second greeting is "duplicate". Each rejection
//! is a 5xx reply that leaves accumulated state untouched.
//!
//! The client is a fixed, pre-computed script of `(command, expected reply
//! prefix)` pairs. A mismatched reply fails the whole session; resuming a
//! multi-step SMTP dialog from the middle is not well-defined.

use crate::automaton::{Action, Automaton, AutomatonError, Terminator};
use base64::prelude::*;
use std::collections::VecDeque;

pub const CRLF: &str = "\r\n";

/// Server software version advertised in the greeting.
const VERSION: &str = "1.0";

/// End-of-data sentinel for the DATA phase.
fn data_terminator() -> Terminator {
    Terminator::Bytes(b"\r\n.\r\n".to_vec())
}

/// SMTP or its LMTP variant. LMTP differs only in the greeting verb: LHLO
/// greets and HELO is not implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Smtp,
    Lmtp,
}

impl Dialect {
    fn greeting_verb(self) -> &'static str {
        match self {
            Dialect::Smtp => "HELO",
            Dialect::Lmtp => "LHLO",
        }
    }

    fn duplicate_reply(self) -> &'static str {
        match self {
            Dialect::Smtp => "503 Duplicate HELO/EHLO",
            Dialect::Lmtp => "503 Duplicate LHLO",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Command,
    Data,
}

/// Inbound SMTP automaton.
pub struct SmtpServer {
    dialect: Dialect,
    fqdn: String,
    mode: Mode,
    greeting: Option<String>,
    mail_from: Option<String>,
    rcpt_to: Vec<String>,
    message: Option<String>,
}

impl SmtpServer {
    pub fn new(fqdn: impl Into<String>) -> Self {
        SmtpServer::with_dialect(Dialect::Smtp, fqdn)
    }

    pub fn with_dialect(dialect: Dialect, fqdn: impl Into<String>) -> Self {
        SmtpServer {
            dialect,
            fqdn: fqdn.into(),
            mode: Mode::Command,
            greeting: None,
            mail_from: None,
            rcpt_to: Vec::new(),
            message: None,
        }
    }

    /// The last accepted message body, leading-dot transparency undone.
    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn recipients(&self) -> &[String] {
        &self.rcpt_to
    }

    fn reply(text: impl AsRef<str>) -> Action {
        Action::send(format!("{}{CRLF}", text.as_ref()))
    }

    fn not_implemented(verb: &str) -> Action {
        Self::reply(format!(
            "502 Error: command '{}' not implemented",
            verb.to_ascii_lowercase()
        ))
    }

    fn command(&mut self, line: &str) -> Action {
        if line.is_empty() {
            return Self::reply("500 Error: bad syntax");
        }
        let (verb, arg) = match line.find(' ') {
            Some(i) => {
                let arg = line[i + 1..].trim();
                (&line[..i], if arg.is_empty() { None } else { Some(arg) })
            }
            None => (line, None),
        };

        match verb.to_ascii_uppercase().as_str() {
            "HELO" | "EHLO" if self.dialect == Dialect::Smtp => self.greet(verb, arg),
            "LHLO" if self.dialect == Dialect::Lmtp => self.greet(verb, arg),
            "MAIL" => self.mail(arg),
            "RCPT" => self.rcpt(arg),
            "DATA" => self.data(arg),
            "RSET" => self.rset(arg),
            "NOOP" => self.noop(arg),
            "QUIT" => Action::finish()
                .with_push(format!("221 Bye{CRLF}"))
                .with_close(),
            _ => Self::not_implemented(verb),
        }
    }

    fn greet(&mut self, verb: &str, arg: Option<&str>) -> Action {
        let Some(name) = arg else {
            return Self::reply(format!(
                "501 Syntax: {} hostname",
                verb.to_ascii_uppercase()
            ));
        };
        if self.greeting.is_some() {
            return Self::reply(self.dialect.duplicate_reply());
        }
        self.greeting = Some(name.to_string());
        Self::reply(format!("250 {}", self.fqdn))
    }

    fn mail(&mut self, arg: Option<&str>) -> Action {
        let address = arg.and_then(|a| clean_addr("FROM:", a));
        let Some(address) = address else {
            return Self::reply("501 Syntax: MAIL FROM:<address>");
        };
        if self.mail_from.is_some() {
            return Self::reply("503 Error: nested MAIL command");
        }
        self.mail_from = Some(address);
        Self::reply("250 Ok")
    }

    fn rcpt(&mut self, arg: Option<&str>) -> Action {
        if self.mail_from.is_none() {
            return Self::reply("503 Error: need MAIL command");
        }
        let Some(address) = arg.and_then(|a| clean_addr("TO:", a)) else {
            return Self::reply("501 Syntax: RCPT TO: <address>");
        };
        self.rcpt_to.push(address);
        Self::reply("250 Ok")
    }

    fn data(&mut self, arg: Option<&str>) -> Action {
        if self.rcpt_to.is_empty() {
            return Self::reply("503 Error: need RCPT command");
        }
        if arg.is_some() {
            return Self::reply("501 Syntax: DATA");
        }
        self.mode = Mode::Data;
        Self::reply("354 End data with <CR><LF>.<CR><LF>").with_terminator(data_terminator())
    }

    fn rset(&mut self, arg: Option<&str>) -> Action {
        if arg.is_some() {
            return Self::reply("501 Syntax: RSET");
        }
        self.mail_from = None;
        self.rcpt_to.clear();
        self.message = None;
        self.mode = Mode::Command;
        Self::reply("250 Ok")
    }

    fn noop(&mut self, arg: Option<&str>) -> Action {
        Self::reply(if arg.is_some() {
            "501 Syntax: NOOP"
        } else {
            "250 Ok"
        })
    }

    /// One complete DATA payload, end-of-data sentinel excluded. Undo the
    /// leading-dot transparency and switch framing back to command lines.
    fn end_of_data(&mut self, chunk: &[u8]) -> Action {
        let raw = String::from_utf8_lossy(chunk);
        let unstuffed: Vec<&str> = raw
            .split(CRLF)
            .map(|line| line.strip_prefix('.').unwrap_or(line))
            .collect();
        self.message = Some(unstuffed.join("\n"));
        self.mode = Mode::Command;
        Self::reply("250 Ok").with_terminator(Terminator::crlf())
    }
}

impl Automaton for SmtpServer {
    fn initial(&mut self) -> Result<Action, AutomatonError> {
        Ok(
            Self::reply(format!("220 {} {VERSION}", self.fqdn))
                .with_terminator(Terminator::crlf()),
        )
    }

    fn operative(&mut self, chunk: &[u8]) -> Result<Action, AutomatonError> {
        match self.mode {
            Mode::Command => {
                let line = String::from_utf8_lossy(chunk);
                Ok(self.command(&line))
            }
            Mode::Data => Ok(self.end_of_data(chunk)),
        }
    }
}

/// Strip a `FROM:`/`TO:` keyword and surrounding angle brackets. Returns
/// `None` on a missing keyword or empty remainder; the bare null path
/// `<>` is passed through untouched.
fn clean_addr(keyword: &str, arg: &str) -> Option<String> {
    let head = arg.get(..keyword.len())?;
    if !head.eq_ignore_ascii_case(keyword) {
        return None;
    }
    let address = arg[keyword.len()..].trim();
    if address.is_empty() {
        return None;
    }
    let address = if address.len() > 2 && address.starts_with('<') && address.ends_with('>') {
        &address[1..address.len() - 1]
    } else {
        address
    };
    Some(address.to_string())
}

/// The envelope and body for one outbound session.
#[derive(Debug, Clone)]
pub struct Mail {
    pub localname: String,
    pub source: String,
    pub targets: Vec<String>,
    pub message: String,
    /// AUTH PLAIN credentials, `(user, password)`.
    pub auth: Option<(String, String)>,
}

struct Step {
    send: Option<String>,
    expect: &'static str,
}

/// Outbound SMTP automaton: a fixed script, one command per reply, each
/// reply checked against the expected code prefix of the step it answers.
pub struct SmtpClient {
    steps: VecDeque<Step>,
    awaiting: Option<&'static str>,
}

impl SmtpClient {
    pub fn new(mail: Mail) -> Self {
        SmtpClient::with_dialect(Dialect::Smtp, mail)
    }

    pub fn with_dialect(dialect: Dialect, mail: Mail) -> Self {
        let mut steps = VecDeque::new();
        // Greeting wait: nothing to send, the server speaks first.
        steps.push_back(Step {
            send: None,
            expect: "220",
        });
        if let Some((user, pass)) = &mail.auth {
            let token = BASE64_STANDARD.encode(format!("\0{user}\0{pass}"));
            steps.push_back(Step {
                send: Some(format!("AUTH PLAIN {token}")),
                expect: "235",
            });
        }
        steps.push_back(Step {
            send: Some(format!("{} {}", dialect.greeting_verb(), mail.localname)),
            expect: "250",
        });
        steps.push_back(Step {
            send: Some(format!("MAIL FROM: <{}>", mail.source)),
            expect: "250",
        });
        for target in &mail.targets {
            steps.push_back(Step {
                send: Some(format!("RCPT TO: <{target}>")),
                expect: "250",
            });
        }
        steps.push_back(Step {
            send: Some("DATA".to_string()),
            expect: "354",
        });
        steps.push_back(Step {
            send: Some(quote_data(&mail.message)),
            expect: "250",
        });
        steps.push_back(Step {
            send: Some("QUIT".to_string()),
            expect: "221",
        });
        SmtpClient {
            steps,
            awaiting: None,
        }
    }

    fn advance(&mut self, reply: &[u8]) -> Result<Action, AutomatonError> {
        if let Some(expected) = self.awaiting {
            if !reply.starts_with(expected.as_bytes()) {
                return Err(AutomatonError::UnexpectedReply {
                    expected,
                    got: String::from_utf8_lossy(reply).into_owned(),
                });
            }
        }
        match self.steps.pop_front() {
            Some(step) => {
                self.awaiting = Some(step.expect);
                Ok(match step.send {
                    Some(command) => Action::send(format!("{command}{CRLF}")),
                    None => Action::idle(),
                })
            }
            None => Ok(Action::finish().with_close()),
        }
    }
}

impl Automaton for SmtpClient {
    fn initial(&mut self) -> Result<Action, AutomatonError> {
        Ok(Action::idle().with_terminator(Terminator::crlf()))
    }

    fn connect(&mut self) -> Result<Action, AutomatonError> {
        self.advance(b"")
    }

    fn operative(&mut self, chunk: &[u8]) -> Result<Action, AutomatonError> {
        self.advance(chunk)
    }
}

/// Prepare a message body for the DATA phase: normalize newlines to CRLF,
/// dot-stuff leading dots, append the end-of-data dot.
fn quote_data(message: &str) -> String {
    let normalized = message.replace(CRLF, "\n").replace('\r', "\n");
    let mut out = String::new();
    for (i, line) in normalized.split('\n').enumerate() {
        if i > 0 {
            out.push_str(CRLF);
        }
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
    }
    if !out.ends_with(CRLF) {
        out.push_str(CRLF);
    }
    out.push('.');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::automaton::Label;

    fn push_str(action: &Action) -> String {
        String::from_utf8(action.push.clone().expect("action carries a push")).unwrap()
    }

    #[test]
    fn test_server_happy_path() {
        let mut s = SmtpServer::new("mail.example.org");

        let action = s.next(Label::Initial, b"").unwrap();
        assert_eq!(push_str(&action), "220 mail.example.org 1.0\r\n");
        assert_eq!(action.terminator, Some(Terminator::crlf()));

        let action = s.next(Label::Operative, b"HELO a").unwrap();
        assert_eq!(push_str(&action), "250 mail.example.org\r\n");

        let action = s.next(Label::Operative, b"MAIL FROM: <a@b>").unwrap();
        assert_eq!(push_str(&action), "250 Ok\r\n");

        let action = s.next(Label::Operative, b"RCPT TO: <c@d>").unwrap();
        assert_eq!(push_str(&action), "250 Ok\r\n");

        let action = s.next(Label::Operative, b"DATA").unwrap();
        assert_eq!(push_str(&action), "354 End data with <CR><LF>.<CR><LF>\r\n");
        assert_eq!(
            action.terminator,
            Some(Terminator::Bytes(b"\r\n.\r\n".to_vec()))
        );

        let action = s.next(Label::Operative, b"hi").unwrap();
        assert_eq!(push_str(&action), "250 Ok\r\n");
        assert_eq!(action.terminator, Some(Terminator::crlf()));
        assert_eq!(s.message(), Some("hi"));

        let action = s.next(Label::Operative, b"QUIT").unwrap();
        assert_eq!(push_str(&action), "221 Bye\r\n");
        assert!(action.close);
        assert!(action.done);
    }

    #[test]
    fn test_rcpt_before_mail_is_rejected() {
        let mut s = SmtpServer::new("x");
        s.next(Label::Initial, b"").unwrap();

        let action = s.next(Label::Operative, b"RCPT TO: <c@d>").unwrap();
        assert_eq!(push_str(&action), "503 Error: need MAIL command\r\n");
        assert!(!action.done);
        assert!(!action.close);
    }

    #[test]
    fn test_data_before_rcpt_is_rejected() {
        let mut s = SmtpServer::new("x");
        s.next(Label::Initial, b"").unwrap();
        s.next(Label::Operative, b"MAIL FROM: <a@b>").unwrap();

        let action = s.next(Label::Operative, b"DATA").unwrap();
        assert_eq!(push_str(&action), "503 Error: need RCPT command\r\n");
    }

    #[test]
    fn test_nested_mail_and_duplicate_helo() {
        let mut s = SmtpServer::new("x");
        s.next(Label::Initial, b"").unwrap();
        s.next(Label::Operative, b"HELO a").unwrap();

        let action = s.next(Label::Operative, b"HELO a").unwrap();
        assert_eq!(push_str(&action), "503 Duplicate HELO/EHLO\r\n");

        s.next(Label::Operative, b"MAIL FROM: <a@b>").unwrap();
        let action = s.next(Label::Operative, b"MAIL FROM: <a@b>").unwrap();
        assert_eq!(push_str(&action), "503 Error: nested MAIL command\r\n");
    }

    #[test]
    fn test_syntax_rejections() {
        let mut s = SmtpServer::new("x");
        s.next(Label::Initial, b"").unwrap();

        let action = s.next(Label::Operative, b"HELO").unwrap();
        assert_eq!(push_str(&action), "501 Syntax: HELO hostname\r\n");

        let action = s.next(Label::Operative, b"MAIL FROM: ").unwrap();
        assert_eq!(push_str(&action), "501 Syntax: MAIL FROM:<address>\r\n");

        let action = s.next(Label::Operative, b"").unwrap();
        assert_eq!(push_str(&action), "500 Error: bad syntax\r\n");

        let action = s.next(Label::Operative, b"NOOP now").unwrap();
        assert_eq!(push_str(&action), "501 Syntax: NOOP\r\n");

        let action = s.next(Label::Operative, b"VRFY a").unwrap();
        assert_eq!(
            push_str(&action),
            "502 Error: command 'vrfy' not implemented\r\n"
        );
    }

    #[test]
    fn test_data_argument_is_rejected() {
        let mut s = SmtpServer::new("x");
        s.next(Label::Initial, b"").unwrap();
        s.next(Label::Operative, b"MAIL FROM: <a@b>").unwrap();
        s.next(Label::Operative, b"RCPT TO: <c@d>").unwrap();

        let action = s.next(Label::Operative, b"DATA SEND").unwrap();
        assert_eq!(push_str(&action), "501 Syntax: DATA\r\n");
    }

    #[test]
    fn test_rset_clears_envelope() {
        let mut s = SmtpServer::new("x");
        s.next(Label::Initial, b"").unwrap();
        s.next(Label::Operative, b"MAIL FROM: <a@b>").unwrap();

        let action = s.next(Label::Operative, b"RSET").unwrap();
        assert_eq!(push_str(&action), "250 Ok\r\n");

        // Envelope state is gone, so RCPT needs MAIL again.
        let action = s.next(Label::Operative, b"RCPT TO: <c@d>").unwrap();
        assert_eq!(push_str(&action), "503 Error: need MAIL command\r\n");
    }

    #[test]
    fn test_data_undoes_dot_stuffing() {
        let mut s = SmtpServer::new("x");
        s.next(Label::Initial, b"").unwrap();
        s.next(Label::Operative, b"MAIL FROM: <a@b>").unwrap();
        s.next(Label::Operative, b"RCPT TO: <c@d>").unwrap();
        s.next(Label::Operative, b"DATA").unwrap();

        s.next(Label::Operative, b"line one\r\n..dotted\r\nlast")
            .unwrap();
        assert_eq!(s.message(), Some("line one\n.dotted\nlast"));
    }

    #[test]
    fn test_null_sender_path_is_kept() {
        let mut s = SmtpServer::new("x");
        s.next(Label::Initial, b"").unwrap();
        let action = s.next(Label::Operative, b"MAIL FROM: <>").unwrap();
        assert_eq!(push_str(&action), "250 Ok\r\n");
    }

    #[test]
    fn test_client_script_order() {
        let mut c = SmtpClient::new(Mail {
            localname: "work".to_string(),
            source: "me@work.it".to_string(),
            targets: vec!["you@work.it".to_string(), "us@work.it".to_string()],
            message: "Hello World!\nHello Again!".to_string(),
            auth: None,
        });

        let action = c.next(Label::Initial, b"").unwrap();
        assert_eq!(action.terminator, Some(Terminator::crlf()));
        assert!(action.push.is_none());

        // Greeting wait: nothing sent until the server's 220 arrives.
        let action = c.next(Label::Connect, b"").unwrap();
        assert!(action.push.is_none());

        let action = c.next(Label::Operative, b"220 x 1.0").unwrap();
        assert_eq!(push_str(&action), "HELO work\r\n");

        let action = c.next(Label::Operative, b"250 x").unwrap();
        assert_eq!(push_str(&action), "MAIL FROM: <me@work.it>\r\n");

        let action = c.next(Label::Operative, b"250 Ok").unwrap();
        assert_eq!(push_str(&action), "RCPT TO: <you@work.it>\r\n");

        let action = c.next(Label::Operative, b"250 Ok").unwrap();
        assert_eq!(push_str(&action), "RCPT TO: <us@work.it>\r\n");

        let action = c.next(Label::Operative, b"250 Ok").unwrap();
        assert_eq!(push_str(&action), "DATA\r\n");

        let action = c.next(Label::Operative, b"354 go").unwrap();
        assert_eq!(
            push_str(&action),
            "Hello World!\r\nHello Again!\r\n.\r\n"
        );

        let action = c.next(Label::Operative, b"250 Ok").unwrap();
        assert_eq!(push_str(&action), "QUIT\r\n");

        let action = c.next(Label::Operative, b"221 Bye").unwrap();
        assert!(action.done);
        assert!(action.close);
        assert!(action.push.is_none());
    }

    #[test]
    fn test_client_auth_step() {
        let mut c = SmtpClient::new(Mail {
            localname: "work".to_string(),
            source: "me@work.it".to_string(),
            targets: vec!["you@work.it".to_string()],
            message: "hi".to_string(),
            auth: Some(("user".to_string(), "pass".to_string())),
        });

        c.next(Label::Connect, b"").unwrap();
        let action = c.next(Label::Operative, b"220 x").unwrap();
        assert_eq!(push_str(&action), "AUTH PLAIN AHVzZXIAcGFzcw==\r\n");

        let action = c.next(Label::Operative, b"235 ok").unwrap();
        assert_eq!(push_str(&action), "HELO work\r\n");
    }

    #[test]
    fn test_client_aborts_on_unexpected_reply() {
        let mut c = SmtpClient::new(Mail {
            localname: "work".to_string(),
            source: "me@work.it".to_string(),
            targets: vec!["you@work.it".to_string()],
            message: "hi".to_string(),
            auth: None,
        });

        c.next(Label::Connect, b"").unwrap();
        c.next(Label::Operative, b"220 x").unwrap();

        // HELO was sent; a 451 instead of 250 kills the session.
        match c.next(Label::Operative, b"451 try again later") {
            Err(AutomatonError::UnexpectedReply { expected, got }) => {
                assert_eq!(expected, "250");
                assert!(got.starts_with("451"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_quote_data() {
        assert_eq!(quote_data("a\nb"), "a\r\nb\r\n.");
        assert_eq!(quote_data(".hidden\nok"), "..hidden\r\nok\r\n.");
        assert_eq!(quote_data("ends\n"), "ends\r\n.");
        assert_eq!(quote_data("mixed\r\nlines\rhere"), "mixed\r\nlines\r\nhere\r\n.");
    }

    #[test]
    fn test_replay_determinism() {
        let script = [
            (Label::Initial, &b""[..]),
            (Label::Operative, &b"HELO a"[..]),
            (Label::Operative, &b"MAIL FROM: <a@b>"[..]),
            (Label::Operative, &b"RCPT TO: <c@d>"[..]),
            (Label::Operative, &b"DATA"[..]),
            (Label::Operative, &b"hi"[..]),
        ];

        let mut first = SmtpServer::new("x");
        let mut second = SmtpServer::new("x");
        for (label, chunk) in script {
            assert_eq!(
                first.next(label, chunk).unwrap(),
                second.next(label, chunk).unwrap()
            );
        }
    }
}
