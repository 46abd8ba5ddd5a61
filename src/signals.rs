use signal_hook::{
    consts::{SIGINT, SIGTERM},
    iterator::Signals,
};
use tokio::sync::watch;

/// What should we do when the user stops this program?
///
/// Returns a receiver that flips to `true` on the first SIGINT or SIGTERM.
/// A second signal exits immediately.
pub fn handle_shutdown() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    let mut signals =
        Signals::new([SIGINT, SIGTERM]).expect("No signals :(. This really should never happen");

    std::thread::spawn(move || {
        for signal in signals.forever() {
            if *tx.borrow() {
                log::warn!("Received signal {signal} again, exiting now");
                std::process::exit(1);
            }
            log::info!("Received signal {signal}, shutting down");
            let _ = sd_notify::notify(true, &[sd_notify::NotifyState::Stopping]);
            let _ = tx.send(true);
        }
    });

    rx
}

/// Resolves once `shutdown` turns `true` or its sender is gone.
pub async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}
