use crate::error::ShimError;
use crate::events::timestamp;
use crate::pio::StdioPaths;
use crate::service::{CreateParams, ExecParams, TaskService};
use crate::signal_runner::RunnerStatus;
use oci_spec::runtime::Process;
use prost_types::Any;
use skiff_core::task::task_server::Task;
use skiff_core::task::{
    self, CheckpointTaskRequest, CloseIoRequest, ConnectRequest, ConnectResponse,
    CreateTaskRequest, CreateTaskResponse, DeleteRequest, DeleteResponse, ExecProcessRequest,
    KillRequest, PauseRequest, PidsRequest, PidsResponse, ResizePtyRequest, ResumeRequest,
    ShutdownRequest, StartRequest, StartResponse, StateRequest, StateResponse, StatsRequest,
    StatsResponse, UpdateTaskRequest, WaitRequest, WaitResponse,
};
use skiff_mount::MountSpec;
use std::path::PathBuf;
use std::sync::Arc;
use tonic::{Request, Response, Status};

pub struct TaskServiceGrpc {
    service: Arc<TaskService>,
}

impl TaskServiceGrpc {
    pub fn new(service: Arc<TaskService>) -> Self {
        Self { service }
    }
}

#[tonic::async_trait]
impl Task for TaskServiceGrpc {
    async fn state(&self, request: Request<StateRequest>) -> Result<Response<StateResponse>, Status> {
        let req = request.into_inner();
        let state = self
            .service
            .state(&req.id, &req.exec_id)
            .await
            .map_err(into_status)?;

        Ok(Response::new(StateResponse {
            id: state.id,
            bundle: state.bundle.display().to_string(),
            pid: state.pid,
            status: status_to_grpc(state.status) as i32,
            stdin: state.stdio.stdin,
            stdout: state.stdio.stdout,
            stderr: state.stdio.stderr,
            terminal: state.terminal,
            exit_status: state.exit_status,
            exited_at: state.exited_at.map(timestamp),
            exec_id: state.exec_id,
        }))
    }

    async fn create(
        &self,
        request: Request<CreateTaskRequest>,
    ) -> Result<Response<CreateTaskResponse>, Status> {
        let req = request.into_inner();

        if req.id.is_empty() {
            return Err(Status::invalid_argument("id is required"));
        }
        if !req.checkpoint.is_empty() || !req.parent_checkpoint.is_empty() {
            return Err(into_status(ShimError::NotImplemented("checkpoint restore")));
        }

        let params = CreateParams {
            id: req.id,
            bundle: PathBuf::from(req.bundle),
            rootfs: req
                .rootfs
                .into_iter()
                .map(|m| MountSpec::new(&m.r#type, &m.source, m.options))
                .collect(),
            terminal: req.terminal,
            stdio: StdioPaths {
                stdin: req.stdin,
                stdout: req.stdout,
                stderr: req.stderr,
            },
        };

        let pid = self.service.create(params).await.map_err(into_status)?;
        Ok(Response::new(CreateTaskResponse { pid }))
    }

    async fn start(&self, request: Request<StartRequest>) -> Result<Response<StartResponse>, Status> {
        let req = request.into_inner();
        let pid = self
            .service
            .start(&req.id, &req.exec_id)
            .await
            .map_err(into_status)?;
        Ok(Response::new(StartResponse { pid }))
    }

    async fn delete(
        &self,
        request: Request<DeleteRequest>,
    ) -> Result<Response<DeleteResponse>, Status> {
        let req = request.into_inner();
        let exit = self
            .service
            .delete(&req.id, &req.exec_id)
            .await
            .map_err(into_status)?;
        Ok(Response::new(DeleteResponse {
            pid: exit.pid,
            exit_status: exit.exit_status,
            exited_at: exit.exited_at.map(timestamp),
        }))
    }

    async fn pids(&self, request: Request<PidsRequest>) -> Result<Response<PidsResponse>, Status> {
        let req = request.into_inner();
        self.service.pids(&req.id).await.map_err(into_status)?;
        Ok(Response::new(PidsResponse::default()))
    }

    async fn pause(&self, request: Request<PauseRequest>) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.service.pause(&req.id).await.map_err(into_status)?;
        Ok(Response::new(()))
    }

    async fn resume(&self, request: Request<ResumeRequest>) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.service.resume(&req.id).await.map_err(into_status)?;
        Ok(Response::new(()))
    }

    async fn checkpoint(
        &self,
        request: Request<CheckpointTaskRequest>,
    ) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.service.checkpoint(&req.id).await.map_err(into_status)?;
        Ok(Response::new(()))
    }

    async fn kill(&self, request: Request<KillRequest>) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.service
            .kill(&req.id, &req.exec_id, req.signal, req.all)
            .await
            .map_err(into_status)?;
        Ok(Response::new(()))
    }

    async fn exec(&self, request: Request<ExecProcessRequest>) -> Result<Response<()>, Status> {
        let req = request.into_inner();

        if req.exec_id.is_empty() {
            return Err(Status::invalid_argument("exec_id is required"));
        }
        let process = decode_process(req.spec.as_ref()).map_err(into_status)?;

        self.service
            .exec(ExecParams {
                id: req.id,
                exec_id: req.exec_id,
                terminal: req.terminal,
                stdio: StdioPaths {
                    stdin: req.stdin,
                    stdout: req.stdout,
                    stderr: req.stderr,
                },
                process,
            })
            .await
            .map_err(into_status)?;
        Ok(Response::new(()))
    }

    async fn resize_pty(&self, request: Request<ResizePtyRequest>) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.service
            .resize_pty(&req.id, &req.exec_id, req.width, req.height)
            .await
            .map_err(into_status)?;
        Ok(Response::new(()))
    }

    async fn close_io(&self, request: Request<CloseIoRequest>) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.service
            .close_io(&req.id, &req.exec_id, req.stdin)
            .await
            .map_err(into_status)?;
        Ok(Response::new(()))
    }

    async fn update(&self, request: Request<UpdateTaskRequest>) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.service.update(&req.id).await.map_err(into_status)?;
        Ok(Response::new(()))
    }

    async fn wait(&self, request: Request<WaitRequest>) -> Result<Response<WaitResponse>, Status> {
        let req = request.into_inner();
        let exit = self
            .service
            .wait(&req.id, &req.exec_id)
            .await
            .map_err(into_status)?;
        Ok(Response::new(WaitResponse {
            exit_status: exit.exit_status,
            exited_at: exit.exited_at.map(timestamp),
        }))
    }

    async fn stats(&self, request: Request<StatsRequest>) -> Result<Response<StatsResponse>, Status> {
        let req = request.into_inner();
        self.service.stats(&req.id).await.map_err(into_status)?;
        Ok(Response::new(StatsResponse::default()))
    }

    async fn connect(
        &self,
        request: Request<ConnectRequest>,
    ) -> Result<Response<ConnectResponse>, Status> {
        let req = request.into_inner();
        let info = self.service.connect(&req.id).await.map_err(into_status)?;
        Ok(Response::new(ConnectResponse {
            shim_pid: info.shim_pid,
            task_pid: info.task_pid,
            version: info.version.to_string(),
        }))
    }

    async fn shutdown(&self, request: Request<ShutdownRequest>) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.service.shutdown(req.now).await.map_err(into_status)?;
        Ok(Response::new(()))
    }
}

fn into_status(e: ShimError) -> Status {
    if let ShimError::Hypervisor(_) | ShimError::Transport(_) | ShimError::Io(_) = &e {
        tracing::error!(error = %e, "Task request failed");
    }
    Status::from(e)
}

fn status_to_grpc(status: RunnerStatus) -> task::Status {
    match status {
        RunnerStatus::Created => task::Status::Created,
        RunnerStatus::Running => task::Status::Running,
        RunnerStatus::Stopped => task::Status::Stopped,
    }
}

/// The JSON-encoded OCI process carried by an exec request.
fn decode_process(spec: Option<&Any>) -> Result<Process, ShimError> {
    let spec = spec.ok_or_else(|| ShimError::InvalidSpec("exec request has no process spec".to_string()))?;
    if !spec.type_url.is_empty() && spec.type_url != skiff_core::PROCESS_SPEC_TYPE_URL {
        return Err(ShimError::InvalidSpec(format!(
            "unexpected process spec type {}",
            spec.type_url
        )));
    }
    serde_json::from_slice(&spec.value)
        .map_err(|e| ShimError::InvalidSpec(format!("process spec: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::Reexec;
    use crate::runtime::Runtime;
    use crate::service::VmDefaults;
    use skiff_core::task::task_client::TaskClient;
    use skiff_core::task::task_server::TaskServer;
    use skiff_guest::LocalHypervisor;
    use skiff_image::{ImageCache, LocalLayoutFetcher, MkfsExt4Builder, OciFilesystemConverter};
    use tempfile::TempDir;
    use tokio::net::UnixListener;
    use tokio_stream::wrappers::UnixListenerStream;
    use tonic::Code;
    use tonic::transport::Server;

    #[test]
    fn test_decode_process() {
        assert!(matches!(decode_process(None), Err(ShimError::InvalidSpec(_))));

        let bad = Any {
            type_url: skiff_core::PROCESS_SPEC_TYPE_URL.to_string(),
            value: b"not json".to_vec(),
        };
        assert!(matches!(decode_process(Some(&bad)), Err(ShimError::InvalidSpec(_))));

        let wrong_type = Any {
            type_url: "example.com/Other".to_string(),
            value: b"{}".to_vec(),
        };
        assert!(matches!(
            decode_process(Some(&wrong_type)),
            Err(ShimError::InvalidSpec(_))
        ));

        let good = Any {
            type_url: skiff_core::PROCESS_SPEC_TYPE_URL.to_string(),
            value: br#"{"args":["echo","sidecar"],"cwd":"/"}"#.to_vec(),
        };
        let process = decode_process(Some(&good)).unwrap();
        assert_eq!(
            process.args().clone().unwrap(),
            vec!["echo".to_string(), "sidecar".to_string()]
        );
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_to_grpc(RunnerStatus::Created), task::Status::Created);
        assert_eq!(status_to_grpc(RunnerStatus::Running), task::Status::Running);
        assert_eq!(status_to_grpc(RunnerStatus::Stopped), task::Status::Stopped);
    }

    #[tokio::test]
    async fn test_errors_over_the_wire() {
        let tmp = TempDir::new().unwrap();
        let ext4 = Arc::new(MkfsExt4Builder::default());
        let images = ImageCache::new(
            tmp.path().join("cache"),
            Arc::new(LocalLayoutFetcher::new()),
            Arc::new(OciFilesystemConverter::new(ext4.clone())),
        );
        let (runtime, _events) = Runtime::new(Reexec::new());
        let service = Arc::new(TaskService::new(
            runtime,
            Arc::new(LocalHypervisor::in_process()),
            Arc::new(images),
            ext4,
            VmDefaults::default(),
        ));

        let socket = tmp.path().join("task.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        tokio::spawn(
            Server::builder()
                .add_service(TaskServer::new(TaskServiceGrpc::new(service)))
                .serve_with_incoming(UnixListenerStream::new(listener)),
        );

        let channel = skiff_vm::connect_unix(&socket).await.unwrap();
        let mut client = TaskClient::new(channel);

        let err = client
            .state(StateRequest {
                id: "c1".to_string(),
                exec_id: String::new(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::NotFound);

        let err = client
            .create(CreateTaskRequest {
                id: "c1".to_string(),
                bundle: tmp.path().join("missing").display().to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let err = client
            .pause(PauseRequest {
                id: "c1".to_string(),
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::Unimplemented);

        let err = client
            .exec(ExecProcessRequest {
                id: "c1".to_string(),
                exec_id: "sidecar".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        client
            .shutdown(ShutdownRequest {
                id: "c1".to_string(),
                now: false,
            })
            .await
            .unwrap();
    }
}
