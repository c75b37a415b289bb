//! protonode: event-driven text protocol node.
//!
//! Runs one of the reference protocols in either role:
//! - `--server --protocol echo|smtp|lmtp` starts a listening node
//! - the client role connects out and drives the matching outbound
//!   automaton (echo lines, a mail submission, or one HTTP request)

use protonode::config::{Config, ProtocolKind};
use protonode::node::shutdown;
use protonode::protocols::{
    lmtp, EchoClient, EchoServer, HttpClient, HttpRequest, Mail, SmtpClient, SmtpServer,
};
use protonode::{Automaton, Node};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        protocol = ?config.protocol,
        server = config.server,
        "Starting protonode"
    );

    shutdown::install();
    let mut node = Node::new(config.node_options())?;

    if config.server {
        match config.protocol {
            ProtocolKind::Echo => {
                node.listen(&config.host, config.port, || {
                    Box::new(EchoServer::new()) as Box<dyn Automaton>
                })?;
            }
            ProtocolKind::Smtp => {
                let fqdn = config.fqdn.clone();
                node.listen(&config.host, config.port, move || {
                    Box::new(SmtpServer::new(fqdn.clone())) as Box<dyn Automaton>
                })?;
            }
            ProtocolKind::Lmtp => {
                let fqdn = config.fqdn.clone();
                node.listen(&config.host, config.port, move || {
                    Box::new(lmtp::server(fqdn.clone())) as Box<dyn Automaton>
                })?;
            }
            ProtocolKind::Http => {
                return Err("the http protocol has no server role".into());
            }
        }
    } else {
        let automaton: Box<dyn Automaton> = match config.protocol {
            ProtocolKind::Echo => Box::new(EchoClient::new(config.lines.clone())),
            ProtocolKind::Smtp => Box::new(SmtpClient::new(mail_request(&config)?)),
            ProtocolKind::Lmtp => Box::new(lmtp::client(mail_request(&config)?)),
            ProtocolKind::Http => Box::new(HttpClient::new(HttpRequest::get(
                config.host.clone(),
                config.path.clone(),
            ))),
        };
        node.send(&config.host, config.port, automaton)?;
    }

    node.run()?;
    Ok(())
}

/// Assemble the outbound mail envelope from client-role options.
fn mail_request(config: &Config) -> Result<Mail, Box<dyn std::error::Error>> {
    let source = config
        .source
        .clone()
        .ok_or("--source is required for the mail client role")?;
    if config.targets.is_empty() {
        return Err("at least one --target is required for the mail client role".into());
    }
    let message = config
        .message
        .clone()
        .ok_or("--message is required for the mail client role")?;

    Ok(Mail {
        localname: config.fqdn.clone(),
        source,
        targets: config.targets.clone(),
        message,
        auth: config.auth.clone(),
    })
}
