use std::io::IsTerminal;
use std::time::Duration;

use crossterm::{
    event::{self, Event, KeyCode, KeyEvent, KeyModifiers},
    terminal,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Listens for `q` (or ctrl-c while the terminal is in raw mode) and
/// cancels `token`.
///
/// Blocking: run it on a blocking thread. Returns once `token` or `stop`
/// is cancelled, restoring the terminal on the way out.
pub fn input_handler(token: CancellationToken, stop: CancellationToken) {
    if !std::io::stdin().is_terminal() {
        debug!("stdin is not a terminal, keyboard cancellation disabled");
        return;
    }
    if terminal::enable_raw_mode().is_err() {
        info!("Failed to enable raw mode. Input handling will be disabled.");
        return;
    }

    while !token.is_cancelled() && !stop.is_cancelled() {
        if let Ok(true) = event::poll(Duration::from_millis(100))
            && let Ok(Event::Key(key)) = event::read()
            && is_cancel_key(&key)
        {
            info!("Cancellation requested. Shutting down gracefully...");
            token.cancel();
        }
    }

    if terminal::disable_raw_mode().is_err() {
        info!("Failed to disable raw mode.");
    }
}

fn is_cancel_key(key: &KeyEvent) -> bool {
    match key.code {
        KeyCode::Char('q') => key.modifiers == KeyModifiers::NONE,
        KeyCode::Char('c') => key.modifiers.contains(KeyModifiers::CONTROL),
        _ => false,
    }
}
