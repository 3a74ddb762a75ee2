use tokio::runtime::Runtime;

/// A single-threaded runtime whose clock only advances when every task is idle, so emulated
/// time is independent of how fast the host machine is
pub fn new_rt() -> std::io::Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
}
