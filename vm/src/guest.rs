use crate::error::VmError;
use hyper_util::rt::TokioIo;
use skiff_core::guest::guest_service_client::GuestServiceClient;
use skiff_core::guest::{RunSpecSignalRequest, RunSpecSignalResponse};
use std::path::{Path, PathBuf};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Streaming;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

/// Client for the in-guest agent, reached over a Unix socket.
#[derive(Clone)]
pub struct GuestClient {
    inner: GuestServiceClient<Channel>,
}

/// A gRPC channel whose connections all go to the Unix socket `socket`.
pub async fn connect_unix(socket: &Path) -> Result<Channel, tonic::transport::Error> {
    let socket: PathBuf = socket.to_path_buf();
    // The URI is ignored; every connection goes to the socket.
    Endpoint::try_from("http://[::]:50051")?
        .connect_with_connector(service_fn(move |_: Uri| {
            let socket = socket.clone();
            async move { UnixStream::connect(socket).await.map(TokioIo::new) }
        }))
        .await
}

impl GuestClient {
    pub async fn connect(socket: &Path) -> Result<Self, VmError> {
        let channel = connect_unix(socket).await?;
        Ok(Self {
            inner: GuestServiceClient::new(channel),
        })
    }

    /// Opens one signal-run stream. Requests are taken from `requests` until
    /// the sender is dropped.
    pub async fn run_spec_signal(
        &mut self,
        requests: mpsc::Receiver<RunSpecSignalRequest>,
    ) -> Result<Streaming<RunSpecSignalResponse>, VmError> {
        let response = self
            .inner
            .run_spec_signal(ReceiverStream::new(requests))
            .await?;
        Ok(response.into_inner())
    }
}
