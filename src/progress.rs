//! Transfer progress reporting
//!
//! A reporter task runs beside the chunk loop. The loop posts the byte
//! length of every chunk it moved; the task turns the running total into
//! a fixed number of bar segments and renders each segment as it fills.
//! It ends on reaching the total (`Finish`), on cancellation (`Abort`),
//! or when the loop drops its sender early (`Abort`, the transfer came up
//! short).

use crate::protocol::BAR_WIDTH;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// Notifications in flight before the chunk loop waits on the renderer
const NOTIFY_BUFFER: usize = 64;

/// What the reporter task knows about one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressState {
    pub tag: String,
    pub total: u64,
    pub consumed: u64,
    pub bar_width: usize,
}

impl ProgressState {
    pub fn new(tag: &str, total: u64) -> Self {
        Self {
            tag: tag.to_string(),
            total,
            consumed: 0,
            bar_width: BAR_WIDTH,
        }
    }

    /// Segments completed by `consumed`, capped at `bar_width`.
    pub fn filled(&self) -> usize {
        if self.total == 0 {
            return self.bar_width;
        }
        let filled = (self.consumed as u128 * self.bar_width as u128) / self.total as u128;
        filled.min(self.bar_width as u128) as usize
    }

    pub fn complete(&self) -> bool {
        self.consumed >= self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderEvent {
    /// One more segment filled; `filled` counts segments now shown.
    Advance { filled: usize },
    Finish,
    Abort { filled: usize },
}

/// Sink for progress renders.
pub trait Render: Send + 'static {
    fn render(&mut self, state: &ProgressState, event: RenderEvent);
}

/// How the reporter task ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Finished,
    Aborted,
}

/// Terminal bar backed by indicatif.
pub struct TerminalRender {
    bar: Option<ProgressBar>,
    hidden: bool,
}

impl TerminalRender {
    pub fn new() -> Self {
        Self { bar: None, hidden: false }
    }

    /// Renders nothing; used for `--quiet`.
    pub fn hidden() -> Self {
        Self { bar: None, hidden: true }
    }

    fn bar(&mut self, state: &ProgressState) -> &ProgressBar {
        let hidden = self.hidden;
        self.bar.get_or_insert_with(|| {
            let pb = ProgressBar::new(state.bar_width as u64);
            if hidden {
                pb.set_draw_target(ProgressDrawTarget::hidden());
            }
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{prefix:<12}{msg:<12}: [{bar:16}] {elapsed_precise}")
                    .unwrap_or_else(|_| ProgressStyle::default_bar())
                    .progress_chars("█ -"),
            );
            pb.set_prefix(state.tag.clone());
            pb.set_message("processing");
            pb
        })
    }
}

impl Default for TerminalRender {
    fn default() -> Self {
        Self::new()
    }
}

impl Render for TerminalRender {
    fn render(&mut self, state: &ProgressState, event: RenderEvent) {
        let bar = self.bar(state).clone();
        match event {
            RenderEvent::Advance { filled } => bar.set_position(filled as u64),
            RenderEvent::Finish => {
                bar.set_position(state.bar_width as u64);
                bar.finish_with_message("finish");
            }
            RenderEvent::Abort { filled } => {
                bar.set_position(filled as u64);
                bar.abandon_with_message("abort");
            }
        }
    }
}

/// Handle to a running reporter task.
///
/// Dropping the handle without calling [`finish`](Self::finish) cancels
/// the task so it never outlives the transfer.
pub struct ProgressHandle {
    notify: Option<mpsc::Sender<u64>>,
    cancel: CancellationToken,
    done: Option<JoinHandle<Outcome>>,
}

/// Start a reporter for `total` bytes tagged `tag`.
pub fn start<R: Render>(tag: &str, total: u64, render: R) -> ProgressHandle {
    let (tx, rx) = mpsc::channel(NOTIFY_BUFFER);
    let cancel = CancellationToken::new();
    let state = ProgressState::new(tag, total);
    let done = tokio::spawn(run(state, rx, cancel.clone(), render));
    ProgressHandle {
        notify: Some(tx),
        cancel,
        done: Some(done),
    }
}

async fn run<R: Render>(
    mut state: ProgressState,
    mut rx: mpsc::Receiver<u64>,
    cancel: CancellationToken,
    mut render: R,
) -> Outcome {
    let mut shown = 0usize;
    if state.complete() {
        render.render(&state, RenderEvent::Finish);
        return Outcome::Finished;
    }
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                render.render(&state, RenderEvent::Abort { filled: shown });
                return Outcome::Aborted;
            }
            msg = rx.recv() => match msg {
                Some(n) => {
                    state.consumed = state.consumed.saturating_add(n);
                    let filled = state.filled();
                    while shown < filled {
                        shown += 1;
                        render.render(&state, RenderEvent::Advance { filled: shown });
                    }
                    if state.complete() {
                        render.render(&state, RenderEvent::Finish);
                        return Outcome::Finished;
                    }
                }
                None => {
                    render.render(&state, RenderEvent::Abort { filled: shown });
                    return Outcome::Aborted;
                }
            }
        }
    }
}

impl ProgressHandle {
    /// Report `bytes` newly consumed. Ignored once the task has ended.
    pub async fn notify(&self, bytes: u64) {
        if let Some(tx) = &self.notify {
            let _ = tx.send(bytes).await;
        }
    }

    /// Abort the bar; the task renders `Abort` and stops.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Release the notify channel and wait for the task's final render.
    pub async fn finish(mut self) -> Outcome {
        self.notify.take();
        match self.done.take() {
            Some(done) => done.await.unwrap_or(Outcome::Aborted),
            None => Outcome::Aborted,
        }
    }
}

impl Drop for ProgressHandle {
    fn drop(&mut self) {
        if self.done.is_some() {
            self.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use parking_lot::Mutex;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<RenderEvent>>>);

    impl Render for Recorder {
        fn render(&mut self, _: &ProgressState, event: RenderEvent) {
            self.0.lock().push(event);
        }
    }

    fn advances(events: &[RenderEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, RenderEvent::Advance { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_full_sequence_renders_every_segment_then_finish() {
        let rec = Recorder::default();
        let total = 10_000u64;
        let handle = start("upload", total, rec.clone());
        let mut sent = 0;
        for n in [4096u64, 4096, 1808] {
            handle.notify(n).await;
            sent += n;
        }
        assert_eq!(sent, total);
        assert_eq!(handle.finish().await, Outcome::Finished);

        let events = rec.0.lock().clone();
        assert_eq!(advances(&events), BAR_WIDTH);
        assert_eq!(events.last(), Some(&RenderEvent::Finish));
        let fills: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                RenderEvent::Advance { filled } => Some(*filled),
                _ => None,
            })
            .collect();
        assert_eq!(fills, (1..=BAR_WIDTH).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_many_small_notifications() {
        let rec = Recorder::default();
        let handle = start("download", 1000, rec.clone());
        for _ in 0..1000 {
            handle.notify(1).await;
        }
        assert_eq!(handle.finish().await, Outcome::Finished);
        let events = rec.0.lock().clone();
        assert_eq!(advances(&events), BAR_WIDTH);
        assert_eq!(events.iter().filter(|e| **e == RenderEvent::Finish).count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_mid_sequence_aborts() {
        let rec = Recorder::default();
        let handle = start("upload", 1600, rec.clone());
        handle.notify(500).await;
        tokio::task::yield_now().await;
        handle.cancel();
        handle.notify(1100).await;
        assert_eq!(handle.finish().await, Outcome::Aborted);

        let events = rec.0.lock().clone();
        let abort_at = events
            .iter()
            .position(|e| matches!(e, RenderEvent::Abort { .. }))
            .expect("abort render");
        assert_eq!(abort_at, events.len() - 1);
        assert!(advances(&events) < BAR_WIDTH);
        assert!(!events.contains(&RenderEvent::Finish));
    }

    #[tokio::test]
    async fn test_overshoot_is_capped() {
        let rec = Recorder::default();
        let handle = start("upload", 100, rec.clone());
        handle.notify(5000).await;
        assert_eq!(handle.finish().await, Outcome::Finished);
        let events = rec.0.lock().clone();
        assert_eq!(advances(&events), BAR_WIDTH);
    }

    #[tokio::test]
    async fn test_zero_total_finishes_immediately() {
        let rec = Recorder::default();
        let handle = start("upload", 0, rec.clone());
        assert_eq!(handle.finish().await, Outcome::Finished);
        assert_eq!(rec.0.lock().clone(), vec![RenderEvent::Finish]);
    }

    #[tokio::test]
    async fn test_short_stream_aborts_when_sender_released() {
        let rec = Recorder::default();
        let handle = start("download", 4096, rec.clone());
        handle.notify(1024).await;
        assert_eq!(handle.finish().await, Outcome::Aborted);
        let events = rec.0.lock().clone();
        assert_eq!(events.last(), Some(&RenderEvent::Abort { filled: 4 }));
    }

    #[test]
    fn test_filled_segments() {
        let mut state = ProgressState::new("t", 160);
        assert_eq!(state.filled(), 0);
        state.consumed = 9;
        assert_eq!(state.filled(), 0);
        state.consumed = 10;
        assert_eq!(state.filled(), 1);
        state.consumed = 159;
        assert_eq!(state.filled(), 15);
        state.consumed = 10_000;
        assert_eq!(state.filled(), BAR_WIDTH);
    }
}
