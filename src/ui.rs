use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use std::time::{Duration, Instant};

/// Stage reporting on stderr for the command-line driver.
///
/// A spinner is drawn only on a terminal, and `plain` turns it off there too.
#[derive(Clone, Copy, Debug)]
pub struct Ui {
    spinner: bool,
}

impl Ui {
    pub fn from_mode(ui_mode: Option<&str>, is_tty: bool) -> Self {
        Self {
            spinner: is_tty && ui_mode != Some("plain"),
        }
    }

    pub fn stage(&self, name: &str) -> StageGuard {
        if self.spinner {
            let spinner = ProgressBar::new_spinner();
            spinner.set_draw_target(ProgressDrawTarget::stderr());
            spinner.enable_steady_tick(Duration::from_millis(120));
            let style = ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner());
            spinner.set_style(style);
            spinner.set_message(format!("{name}…"));
            StageGuard::new(name.to_string(), Some(spinner))
        } else {
            eprintln!("==> {}", name);
            StageGuard::new(name.to_string(), None)
        }
    }
}

pub struct StageGuard {
    name: String,
    start: Instant,
    spinner: Option<ProgressBar>,
    failed: bool,
}

impl StageGuard {
    fn new(name: String, spinner: Option<ProgressBar>) -> Self {
        Self {
            name,
            start: Instant::now(),
            spinner,
            failed: false,
        }
    }

    /// Mark the stage as failed; the closing line shows a cross instead of a check.
    pub fn fail(&mut self) {
        self.failed = true;
    }
}

impl Drop for StageGuard {
    fn drop(&mut self) {
        let mark = if self.failed { "✘" } else { "✔" };
        let elapsed = self.start.elapsed();
        let message = format!("{} {} ({})", mark, self.name, format_duration(elapsed));
        if let Some(spinner) = &self.spinner {
            spinner.finish_with_message(message);
        } else {
            eprintln!("{message}");
        }
    }
}

fn format_duration(duration: Duration) -> String {
    if duration.as_secs() >= 1 {
        format!("{:.2}s", duration.as_secs_f64())
    } else {
        format!("{}ms", duration.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spinner_needs_a_terminal() {
        assert!(!Ui::from_mode(Some("pretty"), false).spinner);
        assert!(!Ui::from_mode(None, false).spinner);
        assert!(!Ui::from_mode(Some("plain"), true).spinner);
        assert!(Ui::from_mode(Some("pretty"), true).spinner);
        assert!(Ui::from_mode(Some("fancy"), true).spinner);
    }

    #[test]
    fn plain_stages_close_with_a_mark() {
        let ui = Ui::from_mode(Some("plain"), true);
        let mut stage = ui.stage("Warm up");
        assert!(stage.spinner.is_none());
        stage.fail();
        assert!(stage.failed);
    }

    #[test]
    fn durations_switch_to_seconds() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.50s");
    }
}
