/*!
 * Anykernel Server - Main Entry Point
 *
 * Runs one runtime instance and serves syscall-proxy clients on a unix
 * socket.
 *
 * Environment variables:
 * - ANYKERNEL_SOCKET: socket path (default: /tmp/anykernel.sock)
 * - ANYKERNEL_NCPU, ANYKERNEL_IDLE_WORKERS, ANYKERNEL_WORKER_SOFT_CAP,
 *   ANYKERNEL_MAX_FRAME: runtime sizing
 */

use anyhow::{Context, Result};
use anykernel::core::limits::DEFAULT_SOCKET_PATH;
use anykernel::{init_tracing, BuiltinSyscalls, ProxyServer, Runtime, RuntimeConfig};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

fn main() -> Result<()> {
    init_tracing();

    let config = RuntimeConfig::from_env();
    info!(
        ncpu = config.ncpu,
        max_idle_workers = config.max_idle_workers,
        max_frame_len = config.max_frame_len,
        "anykernel server starting"
    );
    let runtime = Runtime::init_global(config).clone();

    let path = std::env::var_os("ANYKERNEL_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));
    if path.exists() {
        std::fs::remove_file(&path)
            .with_context(|| format!("removing stale socket {}", path.display()))?;
    }
    let listener = UnixListener::bind(&path)
        .with_context(|| format!("binding {}", path.display()))?;

    let server = Arc::new(ProxyServer::new(runtime, Arc::new(BuiltinSyscalls)));
    server.serve(listener).context("serving proxy clients")?;
    Ok(())
}
