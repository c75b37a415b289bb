//! Reference protocol automata.
//!
//! These validate the automaton contract: each is a pure state machine
//! over `(label, chunk)` transitions, with all socket work left to the
//! node.

pub mod echo;
pub mod http;
pub mod lmtp;
pub mod smtp;

pub use echo::{EchoClient, EchoServer};
pub use http::{HttpClient, HttpRequest};
pub use smtp::{Mail, SmtpClient, SmtpServer};
