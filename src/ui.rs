//! Stderr progress for the CLI: one line (or spinner) per pipeline stage.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_millis(120);
const FRAME_BAR_TEMPLATE: &str = "{spinner} {msg} [{bar:30}] {pos}/{len} frames ({eta})";
const FRAME_COUNT_TEMPLATE: &str = "{spinner} {msg} {pos} frames";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UiMode {
    Auto,
    Plain,
    Pretty,
}

impl UiMode {
    fn parse(flag: Option<&str>) -> Self {
        match flag.map(str::trim) {
            Some("plain") => UiMode::Plain,
            Some("pretty") => UiMode::Pretty,
            _ => UiMode::Auto,
        }
    }
}

#[derive(Clone, Debug)]
pub struct Ui {
    mode: UiMode,
    stderr_is_tty: bool,
    piped_output: bool,
}

impl Ui {
    pub fn new(mode: UiMode, stderr_is_tty: bool, piped_output: bool) -> Self {
        Self {
            mode,
            stderr_is_tty,
            piped_output,
        }
    }

    /// `piped_output` keeps `auto` plain when stdout is redirected, so the
    /// JSON report is not interleaved with spinner redraws.
    pub fn from_args(ui_flag: Option<&str>, stderr_is_tty: bool, piped_output: bool) -> Self {
        Self::new(UiMode::parse(ui_flag), stderr_is_tty, piped_output)
    }

    fn animated(&self) -> bool {
        if !self.stderr_is_tty {
            return false;
        }
        match self.mode {
            UiMode::Pretty => true,
            UiMode::Auto => !self.piped_output,
            UiMode::Plain => false,
        }
    }

    pub fn stage(&self, name: &str) -> Stage {
        if !self.animated() {
            return Stage::plain(name);
        }
        let bar = styled(ProgressBar::new_spinner(), "{spinner} {msg}");
        bar.set_message(format!("{name}…"));
        Stage::animated(name, bar)
    }

    /// A stage that counts decoded frames. Shows a bar when the container
    /// announced a frame count, a running counter otherwise.
    pub fn frames(&self, name: &str, total: Option<u64>) -> Stage {
        if !self.animated() {
            return Stage::plain(name);
        }
        let bar = match total {
            Some(total) if total > 0 => styled(ProgressBar::new(total), FRAME_BAR_TEMPLATE),
            _ => styled(ProgressBar::new_spinner(), FRAME_COUNT_TEMPLATE),
        };
        bar.set_message(name.to_string());
        Stage::animated(name, bar)
    }
}

fn styled(bar: ProgressBar, template: &str) -> ProgressBar {
    bar.set_draw_target(ProgressDrawTarget::stderr());
    bar.enable_steady_tick(TICK);
    let style = ProgressStyle::with_template(template)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    bar.set_style(style);
    bar
}

/// A running stage. Reports its outcome and duration when dropped.
pub struct Stage {
    name: String,
    started: Instant,
    bar: Option<ProgressBar>,
    failed: bool,
}

impl Stage {
    fn plain(name: &str) -> Self {
        eprintln!("==> {name}");
        Self::with_bar(name, None)
    }

    fn animated(name: &str, bar: ProgressBar) -> Self {
        Self::with_bar(name, Some(bar))
    }

    fn with_bar(name: &str, bar: Option<ProgressBar>) -> Self {
        Self {
            name: name.to_string(),
            started: Instant::now(),
            bar,
            failed: false,
        }
    }

    pub fn set_position(&self, pos: u64) {
        if let Some(bar) = &self.bar {
            bar.set_position(pos);
        }
    }

    /// End the stage with a failure mark.
    pub fn fail(mut self) {
        self.failed = true;
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        let mark = if self.failed { "✘" } else { "✔" };
        let line = format!(
            "{mark} {} ({})",
            self.name,
            format_elapsed(self.started.elapsed())
        );
        match &self.bar {
            Some(bar) => {
                if let Ok(style) = ProgressStyle::with_template("{msg}") {
                    bar.set_style(style);
                }
                bar.finish_with_message(line);
            }
            None => eprintln!("{line}"),
        }
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    if elapsed < Duration::from_secs(1) {
        format!("{}ms", elapsed.as_millis())
    } else {
        format!("{:.2}s", elapsed.as_secs_f64())
    }
}
