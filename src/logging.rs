//! Server log events
//!
//! Every diagnostic goes to the `log` facade. A server can additionally hand
//! each entry to a subscriber closure registered on the builder.

use log::Level;
use std::fmt;
use std::sync::Arc;
use std::time::SystemTime;

/// `log` target used for all server diagnostics
pub const LOG_TARGET: &str = "iscsi_target::server";

/// Source tag carried by every [`LogEntry`]
pub const LOG_SOURCE: &str = "iSCSI Server";

/// One structured log event
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: SystemTime,
    pub level: Level,
    pub source: &'static str,
    pub message: String,
}

/// Subscriber callback for log entries
pub type LogSubscriber = dyn Fn(&LogEntry) + Send + Sync;

/// Log sink shared by the acceptor and every connection thread
#[derive(Clone, Default)]
pub struct ServerLog {
    subscriber: Option<Arc<LogSubscriber>>,
}

impl fmt::Debug for ServerLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerLog")
            .field("subscriber", &self.subscriber.is_some())
            .finish()
    }
}

impl ServerLog {
    pub fn new(subscriber: Option<Arc<LogSubscriber>>) -> Self {
        ServerLog { subscriber }
    }

    pub fn emit(&self, level: Level, args: fmt::Arguments<'_>) {
        let to_log = log::log_enabled!(target: LOG_TARGET, level);
        if !to_log && self.subscriber.is_none() {
            return;
        }

        let message = args.to_string();
        if to_log {
            log::log!(target: LOG_TARGET, level, "{}", message);
        }
        if let Some(subscriber) = &self.subscriber {
            subscriber(&LogEntry {
                timestamp: SystemTime::now(),
                level,
                source: LOG_SOURCE,
                message,
            });
        }
    }

    pub fn error(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Error, args)
    }

    pub fn info(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Info, args)
    }

    pub fn debug(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Debug, args)
    }

    pub fn trace(&self, args: fmt::Arguments<'_>) {
        self.emit(Level::Trace, args)
    }
}
