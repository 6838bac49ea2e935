//! Tool server lifecycle management
//!
//! Holds at most one live client for a configured server. The client never
//! restarts its own process; callers decide when to, through this type.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::config::ToolServerConfig;
use crate::rpc::{ChannelState, StdioRpcClient};
use crate::Result;

/// One configured tool server and its current client, if any
pub struct ToolServer {
    config: ToolServerConfig,

    client: RwLock<Option<Arc<StdioRpcClient>>>,
}

impl ToolServer {
    pub fn new(config: ToolServerConfig) -> Self {
        Self {
            config,
            client: RwLock::new(None),
        }
    }

    pub fn config(&self) -> &ToolServerConfig {
        &self.config
    }

    /// The live client, starting the server if none is running.
    ///
    /// A client whose channel has closed is replaced by a fresh process.
    pub async fn client(&self) -> Result<Arc<StdioRpcClient>> {
        {
            let current = self.client.read().await;
            if let Some(client) = current.as_ref() {
                if client.state() != ChannelState::Closed {
                    return Ok(Arc::clone(client));
                }
            }
        }
        self.start().await
    }

    /// Start the server unless a live client already exists
    pub async fn start(&self) -> Result<Arc<StdioRpcClient>> {
        let mut current = self.client.write().await;
        if let Some(client) = current.as_ref() {
            if client.state() != ChannelState::Closed {
                return Ok(Arc::clone(client));
            }
            tracing::info!("Tool server '{}' channel closed, starting a new one", self.config.name);
        }

        let client = Arc::new(StdioRpcClient::spawn(&self.config).await?);
        if self.config.initialize {
            if let Err(e) = client.initialize(&self.config.client_name).await {
                client.shutdown().await?;
                return Err(e);
            }
        }

        *current = Some(Arc::clone(&client));
        tracing::info!("Tool server '{}' started", self.config.name);
        Ok(client)
    }

    /// Stop the server, failing any calls still pending on it
    pub async fn stop(&self) -> Result<()> {
        let mut current = self.client.write().await;
        if let Some(client) = current.take() {
            client.shutdown().await?;
            tracing::info!("Tool server '{}' stopped", self.config.name);
        }
        Ok(())
    }

    pub async fn restart(&self) -> Result<Arc<StdioRpcClient>> {
        self.stop().await?;
        self.start().await
    }

    /// Whether a client exists and its channel is not closed
    pub async fn is_running(&self) -> bool {
        self.client
            .read()
            .await
            .as_ref()
            .map(|c| c.state() != ChannelState::Closed)
            .unwrap_or(false)
    }
}
