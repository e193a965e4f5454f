//! Signal-aware cancellation (spec §4.5/§5): INT/TERM/USR1 listeners feed
//! a single channel the dispatcher `select!`s against every tick. Grounded
//! in `hoffmang9-WesoForge/crates/client/src/shutdown.rs`'s
//! `spawn_ctrl_c_handler`, extended from ctrl-c-only to INT/TERM/USR1 so
//! the exit-code mapping (130/138/146) can tell them apart.

use tokio::sync::mpsc;

use crate::errors::Signal;

/// Spawns the unix signal listeners and returns a receiver the dispatcher
/// polls each tick. Dropping the sender side happens naturally when the
/// listener tasks are aborted at shutdown.
pub fn spawn_signal_listener() -> mpsc::Receiver<Signal> {
    let (tx, rx) = mpsc::channel(4);

    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};

        let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut usr1 = signal(SignalKind::user_defined1()).expect("failed to install SIGUSR1 handler");
        let mut cont = signal(SignalKind::from_raw(libc::SIGCONT)).expect("failed to install SIGCONT handler");

        loop {
            let event = tokio::select! {
                _ = int.recv() => Signal::Int,
                _ = term.recv() => Signal::Int,
                _ = usr1.recv() => Signal::Usr1,
                _ = cont.recv() => Signal::Cont,
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn listener_does_not_fire_without_a_signal() {
        let mut rx = spawn_signal_listener();
        let result = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
        assert!(result.is_err(), "no signal was sent; recv() should time out");
    }
}
