//! TLS sniffing from the ClientHello.
//!
//! The proxy never terminates TLS. It waits until the whole first record is
//! buffered, reads the server name and the first ALPN identifier from the
//! ClientHello, and evaluates its rules against them.

pub(crate) mod client_hello;
mod rules;

use std::time::Duration;

use async_trait::async_trait;
use passthru_config::CATCHALL;
use tracing::trace;

use super::{ConnBuf, ConnBufError, Protocol, ProtocolError};
use crate::context::Context;

pub use client_hello::{
    parse_client_hello, record_len, ClientHelloError, ClientHelloInfo, MAX_RECORD_LEN,
    RECORD_HEADER_LEN,
};
pub use rules::{parse_rules, Rule, RuleKind};

/// Delay between peeks while the ClientHello is still arriving.
pub const PEEK_RETRY_INTERVAL: Duration = Duration::from_millis(20);

const NAME: &str = "TLS";

/// Routes on the SNI and ALPN of the ClientHello.
#[derive(Debug, Clone, Default)]
pub struct TlsProtocol {
    rules: Vec<Rule>,
}

impl TlsProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Wait for the first record and parse it.
    pub async fn client_hello(
        &self,
        ctx: &Context,
        buf: &ConnBuf,
    ) -> Result<ClientHelloInfo, ProtocolError> {
        let mut header = [0u8; RECORD_HEADER_LEN];
        let mut record = Vec::new();

        loop {
            if let Some(interrupt) = ctx.err() {
                return Err(interrupt.into());
            }

            if try_peek(buf, &mut header).await? {
                let total = record_len(&header).map_err(not_tls)?;
                record.resize(total, 0);
                if try_peek(buf, &mut record).await? {
                    return parse_client_hello(&record).map_err(not_tls);
                }
            }

            tokio::select! {
                biased;
                interrupt = ctx.done() => return Err(interrupt.into()),
                _ = tokio::time::sleep(PEEK_RETRY_INTERVAL) => {}
            }
        }
    }
}

#[async_trait]
impl Protocol for TlsProtocol {
    fn name(&self) -> &'static str {
        NAME
    }

    fn clone_with_no_rules(&self) -> Box<dyn Protocol> {
        Box::new(TlsProtocol::new())
    }

    fn apply_rules(&mut self, rules: &[String]) -> Result<(), ProtocolError> {
        self.rules = parse_rules(rules)?;
        Ok(())
    }

    async fn identify(&self, ctx: &Context, buf: &ConnBuf) -> Result<String, ProtocolError> {
        let hello = self.client_hello(ctx, buf).await?;
        trace!(
            server_name = hello.server_name.as_deref().unwrap_or(""),
            alpn = hello.alpn.as_deref().unwrap_or(""),
            "Parsed ClientHello"
        );

        // No rules configured: only the implicit catch-all applies.
        if self.rules.is_empty() {
            return Ok(CATCHALL.to_string());
        }

        self.rules
            .iter()
            .find(|rule| rule.matches(&hello))
            .map(|rule| rule.name().to_string())
            .ok_or(ProtocolError::NoRuleMatched)
    }
}

/// Fill `out` from the buffer. `Ok(false)` means not enough bytes yet.
async fn try_peek(buf: &ConnBuf, out: &mut [u8]) -> Result<bool, ProtocolError> {
    match buf.peek(out, out.len()).await {
        Ok(_) => Ok(true),
        Err(ConnBufError::NotEnoughData { .. }) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn not_tls(e: ClientHelloError) -> ProtocolError {
    ProtocolError::NotMatched {
        protocol: NAME,
        reason: e.to_string(),
    }
}
