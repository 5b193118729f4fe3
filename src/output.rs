//! User-facing output channels.
//!
//! Diagnostics go through `tracing`; everything the user is meant to read goes
//! through a [`Logger`], which decides stream and styling per channel.

use colored::*;
use std::sync::{Arc, Mutex};

use crate::config::LogLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Sql,
    Result,
    Task,
    Info,
    Success,
    Error,
}

/// Restricts which channels a logger emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultFilter {
    All,
    /// Only the result payload, for `--json` output.
    JsonOnly,
}

#[derive(Clone)]
enum Sink {
    Stdio,
    Capture(Arc<Mutex<Vec<(Channel, String)>>>),
}

#[derive(Clone)]
pub struct Logger {
    level: LogLevel,
    silent: bool,
    filter: ResultFilter,
    sink: Sink,
}

impl Logger {
    pub fn new(level: LogLevel, silent: bool) -> Self {
        Self {
            level,
            silent,
            filter: ResultFilter::All,
            sink: Sink::Stdio,
        }
    }

    /// A logger that records lines in memory instead of printing them.
    pub fn capture(level: LogLevel) -> Self {
        Self {
            level,
            silent: false,
            filter: ResultFilter::All,
            sink: Sink::Capture(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn silenced(mut self, silent: bool) -> Self {
        self.silent = silent;
        self
    }

    /// Same sink and level, restricted to `filter`.
    pub fn filtered(&self, filter: ResultFilter) -> Self {
        Self {
            filter,
            ..self.clone()
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn is_silent(&self) -> bool {
        self.silent
    }

    /// Lines recorded by a capturing logger. Empty for stdio loggers.
    pub fn captured(&self) -> Vec<(Channel, String)> {
        match &self.sink {
            Sink::Capture(lines) => lines.lock().map(|l| l.clone()).unwrap_or_default(),
            Sink::Stdio => Vec::new(),
        }
    }

    pub fn sql(&self, sql: &str) {
        self.emit(Channel::Sql, sql);
    }

    pub fn result(&self, text: &str) {
        self.emit(Channel::Result, text);
    }

    pub fn task(&self, text: &str) {
        self.emit(Channel::Task, text);
    }

    pub fn info(&self, text: &str) {
        self.emit(Channel::Info, text);
    }

    pub fn success(&self, text: &str) {
        self.emit(Channel::Success, text);
    }

    pub fn error(&self, text: &str) {
        self.emit(Channel::Error, text);
    }

    fn enabled(&self, channel: Channel) -> bool {
        if channel == Channel::Error {
            return true;
        }
        if self.silent {
            return false;
        }
        match self.filter {
            ResultFilter::JsonOnly => channel == Channel::Result,
            // Progress chatter needs at least info level.
            ResultFilter::All => match channel {
                Channel::Task | Channel::Info => self.level >= LogLevel::Info,
                _ => true,
            },
        }
    }

    fn emit(&self, channel: Channel, text: &str) {
        if !self.enabled(channel) {
            return;
        }
        match &self.sink {
            Sink::Capture(lines) => {
                if let Ok(mut lines) = lines.lock() {
                    lines.push((channel, text.to_string()));
                }
            }
            Sink::Stdio => match channel {
                Channel::Sql => println!("{}", text.dimmed()),
                Channel::Result | Channel::Info => println!("{}", text),
                Channel::Success => println!("{}", text.green()),
                Channel::Task => eprintln!("{}", text.cyan()),
                Channel::Error => eprintln!("{} {}", "Error:".red().bold(), text),
            },
        }
    }
}
