//! LMTP automata.
//!
//! LMTP shares the whole SMTP grammar and only substitutes the greeting:
//! LHLO greets, HELO is not implemented.

use crate::protocols::smtp::{Dialect, Mail, SmtpClient, SmtpServer};

pub fn server(fqdn: impl Into<String>) -> SmtpServer {
    SmtpServer::with_dialect(Dialect::Lmtp, fqdn)
}

pub fn client(mail: Mail) -> SmtpClient {
    SmtpClient::with_dialect(Dialect::Lmtp, mail)
}
