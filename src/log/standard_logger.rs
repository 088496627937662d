use log4rs::append::console::{ConsoleAppender, Target};
use log4rs::config::{Appender, Logger, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::Config;

use crate::log::{LogSettings, ModuleFilter};

// ISO 8601 timestamp, colored level, target
const LOG_PATTERN: &str = "{d(%Y-%m-%dT%H:%M:%SZ)} {h({l})} {t} - {m}{n}";
const APPENDER: &str = "stderr";

impl From<&ModuleFilter> for Logger {
    fn from(filter: &ModuleFilter) -> Self {
        Logger::builder().build(filter.module.clone(), filter.level)
    }
}

impl LogSettings {
    /// Installs or reconfigures the log4rs backend to match these settings.
    pub(in crate::log) fn apply(&mut self) {
        // Results may be written to stdout, so diagnostics go to stderr.
        let stderr = ConsoleAppender::builder()
            .target(Target::Stderr)
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build();
        let config = self
            .module_filters
            .values()
            .fold(
                Config::builder().appender(Appender::builder().build(APPENDER, Box::new(stderr))),
                |builder, filter| builder.logger(filter.into()),
            )
            .build(Root::builder().appender(APPENDER).build(self.level));
        let config = match config {
            Ok(config) => config,
            Err(e) => {
                eprintln!("invalid log configuration: {e}");
                return;
            }
        };

        match &self.handle {
            Some(handle) => handle.set_config(config),
            None => match log4rs::init_config(config) {
                Ok(handle) => self.handle = Some(handle),
                // The embedding application already installed a logger.
                Err(e) => eprintln!("failed to install logger: {e}"),
            },
        }
    }
}
