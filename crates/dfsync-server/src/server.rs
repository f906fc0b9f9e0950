//! Server bootstrap: mount directory, service, pipeline and accept loop.

use std::net::SocketAddr;
use std::sync::Arc;

use dfsync_transport::{CallHandler, RpcServer};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ServerConfig;
use crate::error::ServiceResult;
use crate::handler::FileServiceHandler;
use crate::pipeline::NotificationPipeline;
use crate::service::FileService;

/// A running dfsync server.
pub struct DfsServer {
    config: ServerConfig,
    service: Arc<FileService>,
    pipeline: Arc<NotificationPipeline>,
    shutdown: CancellationToken,
}

impl DfsServer {
    /// Creates the mount directory if needed, registers existing files and
    /// starts the notification pipeline.
    pub async fn start(config: ServerConfig) -> ServiceResult<Self> {
        tokio::fs::create_dir_all(&config.mount_path).await?;
        let service = Arc::new(FileService::new(&config.mount_path, config.chunk_size));
        service.load_existing().await?;
        let pipeline = Arc::new(NotificationPipeline::start(
            service.clone(),
            config.num_async_workers,
        ));
        Ok(Self {
            config,
            service,
            pipeline,
            shutdown: CancellationToken::new(),
        })
    }

    /// Binds the configured address.
    pub async fn bind(&self) -> ServiceResult<TcpListener> {
        Ok(TcpListener::bind(self.config.bind_addr).await?)
    }

    /// Serves on `listener` until [`DfsServer::shutdown`] is called, then
    /// drains the notification pipeline.
    pub async fn serve(&self, listener: TcpListener) -> dfsync_transport::Result<()> {
        let handler: Arc<dyn CallHandler> = Arc::new(FileServiceHandler::new(
            self.service.clone(),
            self.pipeline.clone(),
        ));
        let result = RpcServer::serve(listener, handler, self.shutdown.clone()).await;
        self.pipeline.shutdown().await;
        info!(mount = %self.config.mount_path.display(), "server stopped");
        result
    }

    /// Binds to `127.0.0.1:0`, serves in the background and returns the
    /// bound address.
    pub async fn spawn_local(self: &Arc<Self>) -> ServiceResult<SocketAddr> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = self.clone();
        tokio::spawn(async move {
            if let Err(e) = server.serve(listener).await {
                tracing::error!(error = %e, "server loop failed");
            }
        });
        Ok(addr)
    }

    /// Stops accepting connections and cancels every running call.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// The shared file service.
    pub fn service(&self) -> &Arc<FileService> {
        &self.service
    }

    /// The notification pipeline.
    pub fn pipeline(&self) -> &Arc<NotificationPipeline> {
        &self.pipeline
    }

    /// Effective configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}
