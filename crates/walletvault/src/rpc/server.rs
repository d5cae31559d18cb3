use super::{
    bus::CommandBus,
    client::BusClient,
    transport::{connect_stream, serve_stream},
};
use crate::paths::VaultPaths;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[cfg(unix)]
use eyre::Context as _;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

struct ActiveGuard {
    active: Arc<AtomicUsize>,
}

impl ActiveGuard {
    fn enter(active: &Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::SeqCst);
        Self {
            active: Arc::clone(active),
        }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serve the bus on this process's stdin/stdout.
pub async fn run_stdio(bus: Arc<CommandBus>) -> eyre::Result<()> {
    serve_stream(bus, tokio::io::stdin(), tokio::io::stdout()).await
}

#[cfg(unix)]
fn bind_listener(paths: &VaultPaths) -> eyre::Result<UnixListener> {
    let p = &paths.socket;
    if p.exists() {
        let md = std::fs::symlink_metadata(p).context("stat existing socket path")?;
        if md.file_type().is_symlink() {
            eyre::bail!("refusing to remove symlink at {}", p.display());
        }
        std::fs::remove_file(p)
            .with_context(|| format!("remove existing socket at {}", p.display()))?;
    }
    if let Some(parent) = p.parent() {
        crate::fsutil::ensure_private_dir(parent)?;
    }
    let l =
        UnixListener::bind(p).with_context(|| format!("bind unix socket at {}", p.display()))?;

    {
        use std::os::unix::fs::PermissionsExt as _;
        if let Err(e) = std::fs::set_permissions(
            p,
            std::fs::Permissions::from_mode(crate::fsutil::MODE_FILE_PRIVATE),
        ) {
            warn!(error = %e, "failed to set unix socket permissions");
        }
    }

    Ok(l)
}

/// Singleton daemon: one vault shared by every connection on the data-dir socket.
#[cfg(unix)]
pub async fn run_daemon(
    paths: &VaultPaths,
    bus: Arc<CommandBus>,
    idle_exit_seconds: Option<u64>,
) -> eyre::Result<()> {
    paths.ensure_private_dirs()?;
    let lock_path = paths.daemon_lock();
    let Some(_lock) = crate::fsutil::try_lock_exclusive(&lock_path)? else {
        eyre::bail!("daemon lock already held at {}", lock_path.display());
    };

    let listener = bind_listener(paths)?;
    info!(socket = %paths.socket.display(), "daemon listening");

    let active = Arc::new(AtomicUsize::new(0));
    let idle = idle_exit_seconds.map(Duration::from_secs);
    let mut last_empty = Instant::now();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        if active.load(Ordering::SeqCst) == 0 {
            if let Some(idle_dur) = idle {
                if last_empty.elapsed() >= idle_dur {
                    info!("idle timeout reached; exiting");
                    break;
                }
            }
        } else {
            last_empty = Instant::now();
        }

        let accept_fut = async {
            let (stream, _addr) = listener.accept().await?;
            Ok::<_, eyre::Report>(stream)
        };
        let stream = tokio::select! {
            res = &mut shutdown => {
                res.context("listen for ctrl-c")?;
                info!("shutdown requested");
                break;
            }
            accepted = async {
                match idle {
                    Some(_) => tokio::time::timeout(Duration::from_millis(250), accept_fut)
                        .await
                        .ok(),
                    None => Some(accept_fut.await),
                }
            } => match accepted {
                Some(res) => res?,
                None => continue,
            },
        };

        let guard = ActiveGuard::enter(&active);
        let bus = Arc::clone(&bus);
        tokio::spawn(async move {
            let _guard = guard;
            let (r, w) = stream.into_split();
            if let Err(e) = serve_stream(bus, r, w).await {
                warn!(error = %e, "connection handler failed");
            }
        });
    }

    if let Err(e) = std::fs::remove_file(&paths.socket) {
        warn!(error = %e, "failed to remove daemon socket");
    }
    Ok(())
}

#[cfg(not(unix))]
pub async fn run_daemon(
    _paths: &VaultPaths,
    _bus: Arc<CommandBus>,
    _idle_exit_seconds: Option<u64>,
) -> eyre::Result<()> {
    eyre::bail!("the daemon needs unix domain sockets; use `walletvault stdio` instead")
}

/// Connect to a running daemon.
#[cfg(unix)]
pub async fn connect_daemon(paths: &VaultPaths) -> eyre::Result<BusClient> {
    let stream = UnixStream::connect(&paths.socket)
        .await
        .with_context(|| format!("connect to daemon at {}", paths.socket.display()))?;
    let (r, w) = stream.into_split();
    Ok(connect_stream(r, w))
}

#[cfg(not(unix))]
pub async fn connect_daemon(_paths: &VaultPaths) -> eyre::Result<BusClient> {
    eyre::bail!("the daemon needs unix domain sockets")
}
