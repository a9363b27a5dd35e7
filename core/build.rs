fn main() -> Result<(), Box<dyn std::error::Error>> {
    tonic_build::configure().build_transport(false).compile_protos(
        &[
            "../proto/task.proto",
            "../proto/events.proto",
            "../proto/guest.proto",
        ],
        &["../proto"],
    )?;
    Ok(())
}
