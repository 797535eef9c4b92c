//! Direct outbound: dial the target itself

use crate::error::{Error, Result};
use crate::outbound::{Outbound, TargetAddr};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

pub struct DirectOutbound;

#[async_trait]
impl Outbound for DirectOutbound {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn dial(&self, target: &TargetAddr) -> Result<TcpStream> {
        let addr = target.to_string();
        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::network(format!("direct connect to {addr} failed: {e}")))?;
        stream.set_nodelay(true).ok();
        debug!("direct connection to {} established", addr);
        Ok(stream)
    }
}
