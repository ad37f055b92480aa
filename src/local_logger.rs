use std::{
    env,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::logger::{GroupEvent, WORKLOAD_TARGET, get_group_event};
use console::{Style, style};
use indicatif::{ProgressBar, ProgressStyle};
use lazy_static::lazy_static;
use log::Log;
use simplelog::SharedLogger;
use std::io::Write;

pub const HANGWATCH_U8_COLOR_CODE: u8 = 214; // #FFAF00

lazy_static! {
    pub static ref SPINNER: Arc<Mutex<Option<ProgressBar>>> = Arc::new(Mutex::new(None));
    pub static ref IS_TTY: bool = std::io::IsTerminal::is_terminal(&std::io::stdout());
}

/// Hide the spinner temporarily, execute `f`, then redraw it.
///
/// If the output is not a TTY, `f` will be executed without hiding the spinner.
pub fn suspend_progress_bar<F: FnOnce() -> R, R>(f: F) -> R {
    if *IS_TTY {
        if let Ok(mut spinner) = SPINNER.lock() {
            if let Some(spinner) = spinner.as_mut() {
                return spinner.suspend(f);
            }
        }
    }

    f()
}

/// Read the wanted log level from `HANGWATCH_LOG`, defaulting to `info`.
pub fn log_level_from_env() -> log::LevelFilter {
    env::var("HANGWATCH_LOG")
        .ok()
        .and_then(|log_level| log_level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info)
}

pub struct LocalLogger {
    log_level: log::LevelFilter,
}

impl LocalLogger {
    pub fn new() -> Self {
        LocalLogger {
            log_level: log_level_from_env(),
        }
    }

    fn start_spinner(name: &str) {
        let spinner = ProgressBar::new_spinner();
        if let Ok(template) = ProgressStyle::with_template(
            format!(
                "  {{spinner:>.{}}} {{wide_msg:.{}.bold}}",
                HANGWATCH_U8_COLOR_CODE, HANGWATCH_U8_COLOR_CODE
            )
            .as_str(),
        ) {
            spinner.set_style(template);
        }
        spinner.set_message(format!("{name}..."));
        spinner.enable_steady_tick(Duration::from_millis(100));
        if let Ok(mut slot) = SPINNER.lock() {
            slot.replace(spinner);
        }
    }
}

impl Default for LocalLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl Log for LocalLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        // Workload output is only echoed to the terminal at trace level
        if metadata.target() == WORKLOAD_TARGET {
            return self.log_level >= log::LevelFilter::Trace;
        }
        metadata.level() <= self.log_level
    }

    fn log(&self, record: &log::Record) {
        if let Some(group_event) = get_group_event(record) {
            match group_event {
                GroupEvent::Start(name) | GroupEvent::StartOpened(name) => {
                    println!(
                        "\n{}",
                        style(format!("»» {name} "))
                            .bold()
                            .color256(HANGWATCH_U8_COLOR_CODE)
                    );

                    if *IS_TTY {
                        Self::start_spinner(&name);
                    } else {
                        println!("{name}...");
                    }
                }
                GroupEvent::End => {
                    if *IS_TTY {
                        if let Ok(mut spinner) = SPINNER.lock() {
                            if let Some(spinner) = spinner.take() {
                                spinner.finish_and_clear();
                            }
                        }
                    }
                }
            }

            return;
        }

        if !self.enabled(record.metadata()) {
            return;
        }

        suspend_progress_bar(|| print_record(record));
    }

    fn flush(&self) {
        let _ = std::io::stdout().flush();
    }
}

/// Print a log record to the console with the appropriate style
fn print_record(record: &log::Record) {
    let error_style = Style::new().red();
    let info_style = Style::new().white();
    let warn_style = Style::new().yellow();
    let debug_style = Style::new().blue().dim();
    let trace_style = Style::new().black().dim();

    match record.level() {
        log::Level::Error => eprintln!("{}", error_style.apply_to(record.args())),
        log::Level::Warn => eprintln!("{}", warn_style.apply_to(record.args())),
        log::Level::Info => println!("{}", info_style.apply_to(record.args())),
        log::Level::Debug => println!(
            "{}",
            debug_style.apply_to(format!("[DEBUG::{}] {}", record.target(), record.args())),
        ),
        log::Level::Trace => println!(
            "{}",
            trace_style.apply_to(format!("[TRACE::{}] {}", record.target(), record.args()))
        ),
    }
}

impl SharedLogger for LocalLogger {
    fn level(&self) -> log::LevelFilter {
        self.log_level
    }

    fn config(&self) -> Option<&simplelog::Config> {
        None
    }

    fn as_log(self: Box<Self>) -> Box<dyn Log> {
        Box::new(*self)
    }
}

pub fn get_local_logger() -> Box<dyn SharedLogger> {
    Box::new(LocalLogger::new())
}

pub fn clean_logger() {
    if let Ok(mut spinner) = SPINNER.lock() {
        if let Some(spinner) = spinner.take() {
            spinner.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_level_defaults_to_info() {
        temp_env::with_var("HANGWATCH_LOG", None::<&str>, || {
            assert_eq!(log_level_from_env(), log::LevelFilter::Info);
        });
    }

    #[test]
    fn test_log_level_from_env() {
        temp_env::with_var("HANGWATCH_LOG", Some("trace"), || {
            assert_eq!(log_level_from_env(), log::LevelFilter::Trace);
        });
        temp_env::with_var("HANGWATCH_LOG", Some("not-a-level"), || {
            assert_eq!(log_level_from_env(), log::LevelFilter::Info);
        });
    }

    #[test]
    fn test_workload_output_only_enabled_at_trace() {
        let logger = LocalLogger {
            log_level: log::LevelFilter::Debug,
        };
        let workload = log::Metadata::builder()
            .target(WORKLOAD_TARGET)
            .level(log::Level::Trace)
            .build();
        assert!(!logger.enabled(&workload));

        let logger = LocalLogger {
            log_level: log::LevelFilter::Trace,
        };
        assert!(logger.enabled(&workload));
    }
}
