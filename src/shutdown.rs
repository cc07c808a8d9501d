/// Completes when the process receives SIGINT, SIGTERM or SIGQUIT.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
  use tokio::signal::unix::{SignalKind, signal};

  let mut sigterm = signal(SignalKind::terminate())?;
  let mut sigquit = signal(SignalKind::quit())?;

  tokio::select! {
    res = tokio::signal::ctrl_c() => res?,
    _ = sigterm.recv() => {},
    _ = sigquit.recv() => {},
  }
  Ok(())
}

#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
  tokio::signal::ctrl_c().await
}
