pub mod task {
    tonic::include_proto!("skiff.task.v1");
}

pub mod events {
    tonic::include_proto!("skiff.events.v1");
}

pub mod guest {
    tonic::include_proto!("skiff.guest.v1");
}

/// Type URL carried by `ExecProcessRequest.spec`.
pub const PROCESS_SPEC_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Process";

/// Version tag returned by `Connect`.
pub const TASK_API_VERSION: &str = "skiff.task.v1";
