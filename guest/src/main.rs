//! Entry point for the GCS guest agent.

#[cfg(not(target_os = "linux"))]
compile_error!("the GCS guest agent is Linux-only; build with a Linux target");

#[cfg(target_os = "linux")]
use std::path::PathBuf;
#[cfg(target_os = "linux")]
use std::sync::Arc;

#[cfg(target_os = "linux")]
use clap::Parser;
#[cfg(target_os = "linux")]
use gcs_guest::container::LibcontainerRuntime;
#[cfg(target_os = "linux")]
use gcs_guest::host::Host;
#[cfg(target_os = "linux")]
use gcs_guest::stdio::{notify_host_ready, TransportConnector};
#[cfg(target_os = "linux")]
use gcs_guest::storage::LinuxStorage;
#[cfg(target_os = "linux")]
use gcs_shared::layout::GuestLayout;
#[cfg(target_os = "linux")]
use gcs_shared::{GcsError, GcsResult, ResultExt, Transport};
#[cfg(target_os = "linux")]
use tracing::{info, warn};

/// GCS Guest Agent - hosts containers and attaches storage inside the VM
#[cfg(target_os = "linux")]
#[derive(Parser, Debug)]
#[command(author, version, about = "GCS Guest Agent - VM-side container agent")]
struct GuestArgs {
    /// Notify URI to signal host when ready
    ///
    /// Examples:
    ///   --notify vsock://2696
    ///   --notify unix:///var/run/gcs-ready.sock
    #[arg(short, long)]
    notify: Option<String>,

    /// Transport used to dial host stdio ports and 9p shares
    ///
    /// Only the scheme (and unix socket path) is used; ports come from
    /// each request.
    #[arg(short, long, default_value = "vsock://0")]
    transport: String,

    /// Container runtime state directory
    #[arg(long, default_value_os_t = GuestLayout::default().state_dir())]
    state_root: PathBuf,
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> GcsResult<()> {
    // Set panic hook to ensure we see panics
    std::panic::set_hook(Box::new(|panic_info| {
        eprintln!("[PANIC] Guest agent panicked: {}", panic_info);
        std::process::exit(1);
    }));

    // Respects RUST_LOG, defaults to "error"
    if let Err(e) = tracing_subscriber::fmt()
        .with_target(true)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("error")),
        )
        .try_init()
    {
        eprintln!("[ERROR] Failed to initialize tracing: {}", e);
    }

    let args = GuestArgs::parse();
    info!(state_root = %args.state_root.display(), transport = %args.transport, "GCS guest agent starting");

    // Detached container init processes are reparented to us.
    nix::sys::prctl::set_child_subreaper(true)
        .map_err(|e| GcsError::Internal(format!("failed to become child subreaper: {}", e)))?;

    let transport: Transport = args.transport.parse().map_err(GcsError::InvalidRequest)?;
    let runtime = LibcontainerRuntime::new(&args.state_root)?;
    let storage = LinuxStorage::new(transport.clone());
    let cancel = storage.cancellation_token();
    let stdio = TransportConnector::new(transport);

    let _host = Host::new(Arc::new(runtime), Arc::new(storage), Arc::new(stdio));

    if let Some(notify) = &args.notify {
        let endpoint: Transport = notify.parse().map_err(GcsError::InvalidRequest)?;
        notify_host_ready(&endpoint).await?;
    }

    wait_for_shutdown().await?;
    warn!("shutdown requested; cancelling pending storage operations");
    cancel.cancel();
    Ok(())
}

#[cfg(target_os = "linux")]
async fn wait_for_shutdown() -> GcsResult<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to wait for SIGINT")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;

    #[test]
    fn test_args_defaults() {
        let args = GuestArgs::parse_from(["gcs-guest"]);
        assert_eq!(args.notify, None);
        assert_eq!(args.transport, "vsock://0");
        assert_eq!(args.state_root, PathBuf::from("/run/gcs/state"));
    }

    #[test]
    fn test_args_overrides() {
        let args = GuestArgs::parse_from([
            "gcs-guest",
            "--notify",
            "vsock://2696",
            "--transport",
            "unix:///run/host.sock",
            "--state-root",
            "/tmp/state",
        ]);
        assert_eq!(args.notify.as_deref(), Some("vsock://2696"));
        assert_eq!(args.transport, "unix:///run/host.sock");
        assert_eq!(args.state_root, PathBuf::from("/tmp/state"));
    }
}
