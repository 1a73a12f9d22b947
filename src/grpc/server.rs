//! gRPC server initialization and lifecycle management

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use super::proto::serving::v1::prediction_service_server::PredictionServiceServer;
use super::service::PredictionServiceImpl;
use crate::environment::Environment;

/// Start the gRPC prediction server on an already-bound listener
///
/// `max_message_size` is in bytes and bounds both directions. Runs until
/// `shutdown` resolves, then lets in-flight calls finish.
pub async fn start_grpc_server<F>(
    listener: TcpListener,
    env: Arc<Environment>,
    request_timeout: Option<Duration>,
    max_message_size: usize,
    shutdown: F,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    F: Future<Output = ()> + Send,
{
    let service = PredictionServiceImpl::new(env).with_request_timeout(request_timeout);

    // Enable gRPC reflection
    let file_descriptor_set: &[u8] = tonic::include_file_descriptor_set!("descriptor");
    let reflection_service = tonic_reflection::server::Builder::configure()
        .register_encoded_file_descriptor_set(file_descriptor_set)
        .build_v1()?;

    tracing::info!(
        addr = %listener.local_addr()?,
        max_message_size,
        "Starting gRPC prediction service"
    );

    Server::builder()
        .add_service(
            PredictionServiceServer::new(service)
                .max_decoding_message_size(max_message_size)
                .max_encoding_message_size(max_message_size),
        )
        .add_service(reflection_service)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await?;

    tracing::info!("gRPC server stopped");
    Ok(())
}
