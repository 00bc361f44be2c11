use indicatif::{ProgressBar, ProgressStyle};
use seghaul_engine::ProgressEvent;
use tokio::sync::mpsc;

const TEMPLATE: &str = "{prefix:>5.bold} [{bar:30.cyan/blue}] {msg}";

fn track_bar(event: &ProgressEvent) -> ProgressBar {
    let bar = ProgressBar::new(event.total as u64);
    if let Ok(style) = ProgressStyle::with_template(TEMPLATE) {
        bar.set_style(style.progress_chars("=> "));
    }
    bar.set_prefix(event.track.clone());
    bar
}

/// Draw one bar per track until the sender side closes.
pub async fn render(mut events: mpsc::Receiver<ProgressEvent>, hidden: bool) {
    let mut current: Option<(String, ProgressBar)> = None;

    while let Some(event) = events.recv().await {
        if hidden {
            continue;
        }
        let switched = current
            .as_ref()
            .is_none_or(|(track, _)| *track != event.track);
        if switched {
            if let Some((_, bar)) = current.take() {
                bar.finish();
            }
            current = Some((event.track.clone(), track_bar(&event)));
        }
        if let Some((_, bar)) = &current {
            bar.set_position(event.finished as u64);
            bar.set_message(event.to_string());
        }
    }

    if let Some((_, bar)) = current {
        bar.finish();
    }
}
