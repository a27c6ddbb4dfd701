//! The out-of-scope external collaborator seam.
//!
//! spec.md §1 places the concrete gateway wire client out of scope: "the
//! real vendor SDK is a caller-supplied adapter." [`UnwiredGateway`] is
//! that caller's default when no adapter has been supplied — it always
//! fails to connect, so `hkmd-gateway`'s reconnect-backoff loop runs
//! indefinitely rather than the process panicking or silently doing
//! nothing. Production deployments replace this with a real
//! `QuoteGateway` implementation before `hkmd_daemon::run` is called.

use std::sync::Arc;

use async_trait::async_trait;

use hkmd_gateway::{GatewayError, PushSink, QuoteGateway};
use hkmd_model::RawRow;

#[derive(Debug, Default)]
pub struct UnwiredGateway;

#[async_trait]
impl QuoteGateway for UnwiredGateway {
    fn name(&self) -> &'static str {
        "unwired"
    }

    async fn connect(&self, _sink: Arc<dyn PushSink>) -> Result<(), GatewayError> {
        Err(GatewayError::Other(
            "no concrete QuoteGateway adapter has been wired into this process".to_string(),
        ))
    }

    async fn subscribe(&self, _symbols: &[(String, String)]) -> Result<(), GatewayError> {
        Ok(())
    }

    async fn wait_for_disconnect(&self) -> GatewayError {
        std::future::pending::<()>().await;
        unreachable!("connect() never succeeds, so this is never awaited")
    }

    async fn poll_recent(
        &self,
        _market: &str,
        _symbol: &str,
        _n: usize,
    ) -> Result<Vec<RawRow>, GatewayError> {
        Ok(Vec::new())
    }

    async fn backfill(
        &self,
        _market: &str,
        _symbol: &str,
        _n: usize,
    ) -> Result<Vec<RawRow>, GatewayError> {
        Ok(Vec::new())
    }
}
