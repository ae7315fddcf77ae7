use std::{collections::VecDeque, time::Instant};

// Short log of things the user may want to see: modules imported, requests that failed and why.
// Not a server log. Developer-facing warnings go to stderr instead.
pub struct Log {
    pub lines: VecDeque<String>,
}

const MAX_LINES: usize = 100;

impl Log {
    pub fn new() -> Log {
        Log {lines: VecDeque::new()}
    }

    pub fn add_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > MAX_LINES {
            self.lines.pop_front();
        }
    }

    pub fn clear(&mut self) {
        self.lines.clear();
    }

    pub fn last(&self) -> Option<&str> { self.lines.back().map(|s| s.as_str()) }
}

#[macro_export]
macro_rules! log {
    ($log:expr, $($arg:tt)*) => (
        ($log).add_line(format!($($arg)*))
    );
}

// A very minimal profiling thing. Prints to stderr in destructor.
pub struct ProfileScope {
    name: String,
    start: Instant,
    threshold_secs: f64,
    active: bool,
}

impl ProfileScope {
    pub fn with_threshold(secs: f64, name: String) -> Self {
        ProfileScope {start: Instant::now(), name, threshold_secs: secs, active: true}
    }

    // Don't print anything, e.g. because the measured thing failed and was reported separately.
    pub fn disarm(&mut self) {
        self.active = false;
    }
}

impl Drop for ProfileScope {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        let secs = self.start.elapsed().as_secs_f64();
        if self.threshold_secs <= 0.0 || secs >= self.threshold_secs {
            eprintln!("info: {} took {:.3}s", self.name, secs);
        }
    }
}
