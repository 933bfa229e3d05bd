//! Optional metrics collected and aggregated during load tests.
//!
//! Every request outcome reported by a [`FlockUser`](../scenario/struct.FlockUser.html)
//! flows into a [`StatsAggregator`](./struct.StatsAggregator.html), which keeps one
//! [`RequestEntry`](./struct.RequestEntry.html) per `(method, name)` pair plus an
//! `Aggregated` entry summarizing everything. Aggregators merge: two aggregators built
//! from disjoint outcome sets merge into exactly the aggregator built from their union,
//! regardless of merge order or grouping. This is what lets Workers ship deltas that the
//! Master folds into one global view.
//!
//! Response times are tracked in integer milliseconds. The response time histogram keeps
//! two significant digits, bounding the relative error of reported percentiles to 5%.

use chrono::prelude::*;
use itertools::Itertools;
use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::util;
use crate::FlockError;

/// Percentiles included in the final report.
pub const PERCENTILES_TO_REPORT: [f64; 11] = [
    0.5, 0.66, 0.75, 0.8, 0.9, 0.95, 0.98, 0.99, 0.999, 0.9999, 1.0,
];

/// Label used for the entry summarizing all requests.
pub const AGGREGATED: &str = "Aggregated";

/// Messages sent from running users to the runner that owns them.
#[derive(Debug, Clone)]
pub enum FlockMetric {
    Request(RequestMetric),
    Exception(ExceptionMetric),
}

/// The outcome of one request, as reported by a user.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestMetric {
    pub method: String,
    pub name: String,
    /// Elapsed time in milliseconds.
    pub response_time: f64,
    pub response_length: usize,
    /// Set when the request failed.
    pub error: Option<String>,
}

/// An error returned by, or a panic raised from, a task function.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionMetric {
    pub user_spec: String,
    pub task: String,
    pub error: String,
}

/// Round a response time so the histogram keeps two significant digits.
pub(crate) fn bucket_response_time(response_time: u64) -> u64 {
    if response_time < 100 {
        response_time
    } else if response_time < 1_000 {
        util::round_half_even(response_time, 10)
    } else if response_time < 10_000 {
        util::round_half_even(response_time, 100)
    } else {
        util::round_half_even(response_time, 1_000)
    }
}

/// The most recent failure seen for an entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct ErrorSample {
    /// Milliseconds since the unix epoch.
    pub timestamp: i64,
    pub error: String,
}

/// Statistics for a single `(method, name)` pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RequestEntry {
    pub method: String,
    pub name: String,
    pub num_requests: usize,
    pub num_failures: usize,
    /// Sum of all response times, in milliseconds.
    pub total_response_time: u64,
    pub min_response_time: Option<u64>,
    pub max_response_time: u64,
    /// Histogram of rounded response times and how often each was seen.
    pub response_times: BTreeMap<u64, usize>,
    pub total_content_length: u64,
    /// Requests completed during the current one second window.
    pub window_requests: usize,
    pub window_failures: usize,
    /// Requests completed during the last complete one second window.
    pub last_window_requests: usize,
    pub last_window_failures: usize,
    pub first_request_at: Option<i64>,
    pub last_request_at: Option<i64>,
    pub last_error: Option<ErrorSample>,
}
impl RequestEntry {
    pub fn new(method: &str, name: &str) -> Self {
        RequestEntry {
            method: method.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub(crate) fn log(
        &mut self,
        response_time: u64,
        response_length: usize,
        timestamp: i64,
        error: Option<&str>,
    ) {
        self.num_requests += 1;
        self.window_requests += 1;
        self.total_response_time = self.total_response_time.saturating_add(response_time);
        self.min_response_time = Some(match self.min_response_time {
            Some(min) => min.min(response_time),
            None => response_time,
        });
        self.max_response_time = self.max_response_time.max(response_time);
        *self
            .response_times
            .entry(bucket_response_time(response_time))
            .or_insert(0) += 1;
        self.total_content_length = self
            .total_content_length
            .saturating_add(response_length as u64);
        self.first_request_at = Some(self.first_request_at.map_or(timestamp, |t| t.min(timestamp)));
        self.last_request_at = Some(self.last_request_at.map_or(timestamp, |t| t.max(timestamp)));
        if let Some(error) = error {
            self.num_failures += 1;
            self.window_failures += 1;
            let sample = ErrorSample {
                timestamp,
                error: error.to_string(),
            };
            if self.last_error.as_ref().map_or(true, |last| sample > *last) {
                self.last_error = Some(sample);
            }
        }
    }

    /// Fold another entry for the same key into this one.
    pub fn merge(&mut self, other: &RequestEntry) {
        self.num_requests += other.num_requests;
        self.num_failures += other.num_failures;
        self.total_response_time = self
            .total_response_time
            .saturating_add(other.total_response_time);
        self.min_response_time = match (self.min_response_time, other.min_response_time) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.max_response_time = self.max_response_time.max(other.max_response_time);
        merge_times(&mut self.response_times, &other.response_times);
        self.total_content_length = self
            .total_content_length
            .saturating_add(other.total_content_length);
        self.window_requests += other.window_requests;
        self.window_failures += other.window_failures;
        self.last_window_requests += other.last_window_requests;
        self.last_window_failures += other.last_window_failures;
        self.first_request_at = match (self.first_request_at, other.first_request_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.last_request_at = match (self.last_request_at, other.last_request_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
        if other.last_error > self.last_error {
            self.last_error = other.last_error.clone();
        }
    }

    /// Response time below which `percent` of the requests completed.
    pub fn percentile(&self, percent: f64) -> u64 {
        calculate_response_time_percentile(
            &self.response_times,
            self.num_requests,
            self.min_response_time.unwrap_or(0),
            self.max_response_time,
            percent,
        )
    }

    pub fn median_response_time(&self) -> u64 {
        self.percentile(0.5)
    }

    pub fn avg_response_time(&self) -> f64 {
        match self.num_requests {
            0 => 0.0,
            n => self.total_response_time as f64 / n as f64,
        }
    }

    pub fn avg_content_length(&self) -> f64 {
        match self.num_requests {
            0 => 0.0,
            n => self.total_content_length as f64 / n as f64,
        }
    }

    pub fn fail_ratio(&self) -> f64 {
        match self.num_requests {
            0 => 0.0,
            n => self.num_failures as f64 / n as f64,
        }
    }

    /// Close the current one second window.
    pub(crate) fn reset_window(&mut self) {
        self.last_window_requests = self.window_requests;
        self.last_window_failures = self.window_failures;
        self.window_requests = 0;
        self.window_failures = 0;
    }

    // An empty entry for the same key, still carrying the window counters.
    fn cleared(&self) -> RequestEntry {
        RequestEntry {
            window_requests: self.window_requests,
            window_failures: self.window_failures,
            last_window_requests: self.last_window_requests,
            last_window_failures: self.last_window_failures,
            ..RequestEntry::new(&self.method, &self.name)
        }
    }

    fn clear_windows(&mut self) {
        self.window_requests = 0;
        self.window_failures = 0;
        self.last_window_requests = 0;
        self.last_window_failures = 0;
    }

    fn report(&self, duration: usize) -> EntryReport {
        let (total_rps, total_fail_per_sec) =
            per_second_calculations(duration, self.num_requests, self.num_failures);
        let mut percentiles = BTreeMap::new();
        for percent in PERCENTILES_TO_REPORT.iter() {
            percentiles.insert(percentile_label(*percent), self.percentile(*percent));
        }
        EntryReport {
            method: self.method.clone(),
            name: self.name.clone(),
            num_requests: self.num_requests,
            num_failures: self.num_failures,
            avg_response_time: self.avg_response_time(),
            min_response_time: self.min_response_time.unwrap_or(0),
            max_response_time: self.max_response_time,
            median_response_time: self.median_response_time(),
            avg_content_length: self.avg_content_length(),
            current_rps: self.last_window_requests as f64,
            current_fail_per_sec: self.last_window_failures as f64,
            total_rps: total_rps as f64,
            total_fail_per_sec: total_fail_per_sec as f64,
            percentiles,
        }
    }
}

/// Failures grouped by method, name and error text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorEntry {
    pub method: String,
    pub name: String,
    pub error: String,
    pub occurrences: usize,
}

/// Task errors and panics grouped by location and message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExceptionEntry {
    /// Where the exception was raised, as `user spec: task`.
    pub task: String,
    pub error: String,
    pub count: usize,
    /// Every node that reported this exception.
    pub nodes: BTreeSet<String>,
}

/// Per-key request rates for the last complete window, as reported by one node.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WindowRates {
    pub entries: BTreeMap<String, (usize, usize)>,
    pub total: (usize, usize),
}
impl WindowRates {
    pub fn add(&mut self, other: &WindowRates) {
        for (key, (requests, failures)) in &other.entries {
            let rate = self.entries.entry(key.clone()).or_insert((0, 0));
            rate.0 += requests;
            rate.1 += failures;
        }
        self.total.0 += other.total.0;
        self.total.1 += other.total.1;
    }
}

/// Aggregated request statistics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatsAggregator {
    /// One entry per request, keyed by `method name`.
    pub entries: BTreeMap<String, RequestEntry>,
    /// The `Aggregated` entry summarizing all requests.
    pub total: RequestEntry,
    /// Keyed by `method name error`.
    pub errors: BTreeMap<String, ErrorEntry>,
    /// Keyed by `task: error`.
    pub exceptions: BTreeMap<String, ExceptionEntry>,
}
impl Default for StatsAggregator {
    fn default() -> Self {
        StatsAggregator::new()
    }
}
impl StatsAggregator {
    pub fn new() -> Self {
        StatsAggregator {
            entries: BTreeMap::new(),
            total: RequestEntry::new("", AGGREGATED),
            errors: BTreeMap::new(),
            exceptions: BTreeMap::new(),
        }
    }

    /// Record one request outcome.
    ///
    /// `response_time` is in milliseconds and is rounded to the nearest millisecond,
    /// halves to even.
    /// Negative or non-finite times are rejected and leave the aggregator unchanged.
    pub fn record(
        &mut self,
        method: &str,
        name: &str,
        response_time: f64,
        response_length: usize,
        error: Option<&str>,
    ) -> Result<(), FlockError> {
        self.record_at(
            method,
            name,
            response_time,
            response_length,
            error,
            util::epoch_ms(),
        )
    }

    pub(crate) fn record_at(
        &mut self,
        method: &str,
        name: &str,
        response_time: f64,
        response_length: usize,
        error: Option<&str>,
        timestamp: i64,
    ) -> Result<(), FlockError> {
        if !response_time.is_finite() || response_time < 0.0 {
            return Err(FlockError::InvalidResponseTime {
                value: response_time,
                detail: format!(
                    "{} {}: response time must be a finite, non-negative number of milliseconds",
                    method, name
                ),
            });
        }
        let response_time = util::round_half_even_f64(response_time);

        self.entries
            .entry(request_key(method, name))
            .or_insert_with(|| RequestEntry::new(method, name))
            .log(response_time, response_length, timestamp, error);
        self.total
            .log(response_time, response_length, timestamp, error);

        if let Some(error) = error {
            self.errors
                .entry(format!("{} {} {}", method, name, error))
                .or_insert_with(|| ErrorEntry {
                    method: method.to_string(),
                    name: name.to_string(),
                    error: error.to_string(),
                    occurrences: 0,
                })
                .occurrences += 1;
        }
        Ok(())
    }

    /// Record a task error or panic seen on `node`.
    pub fn record_exception(&mut self, task: &str, error: &str, node: &str) {
        let exception = self
            .exceptions
            .entry(format!("{}: {}", task, error))
            .or_insert_with(|| ExceptionEntry {
                task: task.to_string(),
                error: error.to_string(),
                count: 0,
                nodes: BTreeSet::new(),
            });
        exception.count += 1;
        exception.nodes.insert(node.to_string());
    }

    /// Fold another aggregator into this one.
    pub fn merge(&mut self, other: &StatsAggregator) {
        for (key, entry) in &other.entries {
            self.entries
                .entry(key.clone())
                .or_insert_with(|| RequestEntry::new(&entry.method, &entry.name))
                .merge(entry);
        }
        self.total.merge(&other.total);
        for (key, error) in &other.errors {
            self.errors
                .entry(key.clone())
                .or_insert_with(|| ErrorEntry {
                    occurrences: 0,
                    ..error.clone()
                })
                .occurrences += error.occurrences;
        }
        for (key, exception) in &other.exceptions {
            let merged = self
                .exceptions
                .entry(key.clone())
                .or_insert_with(|| ExceptionEntry {
                    count: 0,
                    nodes: BTreeSet::new(),
                    ..exception.clone()
                });
            merged.count += exception.count;
            merged.nodes.extend(exception.nodes.iter().cloned());
        }
    }

    /// Close the current one second window on every entry.
    pub fn reset_window(&mut self) {
        for entry in self.entries.values_mut() {
            entry.reset_window();
        }
        self.total.reset_window();
    }

    /// Clear everything.
    pub fn reset(&mut self) {
        *self = StatsAggregator::new();
    }

    /// Everything recorded since the last call, leaving the window counters in place
    /// so current rates keep being tracked.
    pub fn take_delta(&mut self) -> StatsAggregator {
        let delta = self.clone();
        self.entries = self
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.cleared()))
            .collect();
        self.total = self.total.cleared();
        self.errors.clear();
        self.exceptions.clear();
        delta
    }

    /// A copy with every window counter zeroed, for folding into cumulative totals.
    pub fn without_windows(&self) -> StatsAggregator {
        let mut stats = self.clone();
        for entry in stats.entries.values_mut() {
            entry.clear_windows();
        }
        stats.total.clear_windows();
        stats
    }

    /// Request rates of the last complete window.
    pub fn window_rates(&self) -> WindowRates {
        WindowRates {
            entries: self
                .entries
                .iter()
                .map(|(key, entry)| {
                    (
                        key.clone(),
                        (entry.last_window_requests, entry.last_window_failures),
                    )
                })
                .collect(),
            total: (
                self.total.last_window_requests,
                self.total.last_window_failures,
            ),
        }
    }

    /// Replace the last complete window with externally computed rates.
    pub fn set_window_rates(&mut self, rates: &WindowRates) {
        for (key, entry) in self.entries.iter_mut() {
            let (requests, failures) = rates.entries.get(key).copied().unwrap_or((0, 0));
            entry.window_requests = 0;
            entry.window_failures = 0;
            entry.last_window_requests = requests;
            entry.last_window_failures = failures;
        }
        self.total.window_requests = 0;
        self.total.window_failures = 0;
        self.total.last_window_requests = rates.total.0;
        self.total.last_window_failures = rates.total.1;
    }

    pub fn get(&self, method: &str, name: &str) -> Option<&RequestEntry> {
        self.entries.get(&request_key(method, name))
    }

    /// Percentile for one entry, `None` if nothing was recorded for it.
    pub fn percentile(&self, method: &str, name: &str, percent: f64) -> Option<u64> {
        self.get(method, name).map(|entry| entry.percentile(percent))
    }

    pub fn num_requests(&self) -> usize {
        self.total.num_requests
    }

    pub fn num_failures(&self) -> usize {
        self.total.num_failures
    }

    pub fn num_exceptions(&self) -> usize {
        self.exceptions.values().map(|e| e.count).sum()
    }

    /// Reports for every entry followed by the `Aggregated` entry.
    pub fn report(&self, duration: usize) -> Vec<EntryReport> {
        self.entries
            .values()
            .map(|entry| entry.report(duration))
            .chain(std::iter::once(self.total.report(duration)))
            .collect()
    }
}

/// Summary of one entry, as shown in tables and snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EntryReport {
    pub method: String,
    pub name: String,
    pub num_requests: usize,
    pub num_failures: usize,
    pub avg_response_time: f64,
    pub min_response_time: u64,
    pub max_response_time: u64,
    pub median_response_time: u64,
    pub avg_content_length: f64,
    pub current_rps: f64,
    pub current_fail_per_sec: f64,
    pub total_rps: f64,
    pub total_fail_per_sec: f64,
    pub percentiles: BTreeMap<String, u64>,
}

/// Metrics returned when a load test finishes, and shown while it runs.
#[derive(Debug, Clone, Default)]
pub struct FlockMetrics {
    /// When the first users started.
    pub started: Option<DateTime<Local>>,
    /// Seconds since the load test started.
    pub duration: usize,
    /// The most users that were running at one time.
    pub users: usize,
    pub stats: StatsAggregator,
    /// Set when showing the final report, which adds percentiles, errors and exceptions.
    pub final_metrics: bool,
    pub display_metrics: bool,
    pub display_errors: bool,
    /// Process exit code to use when any failure or exception was recorded.
    pub exit_code_on_error: i32,
}
impl FlockMetrics {
    pub fn print(&self) {
        if self.display_metrics {
            info!("printing final metrics after {} seconds...", self.duration);
            print!("{}", self);
        }
    }

    pub(crate) fn print_running(&self) {
        if self.display_metrics {
            info!(
                "printing running metrics after {} seconds...",
                self.duration
            );
            println!("{}", self);
        }
    }

    /// Process exit code: 0 for a clean run, `exit_code_on_error` otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.stats.num_failures() > 0 || self.stats.num_exceptions() > 0 {
            self.exit_code_on_error
        } else {
            0
        }
    }

    pub fn to_json(&self) -> Result<String, FlockError> {
        let report = serde_json::json!({
            "started": self.started.map(|s| s.timestamp()).unwrap_or(0),
            "duration": self.duration,
            "users": self.users,
            "requests": self.stats.report(self.duration),
            "errors": self.stats.errors.values().collect::<Vec<_>>(),
            "exceptions": self.stats.exceptions.values().collect::<Vec<_>>(),
        });
        Ok(serde_json::to_string_pretty(&report)?)
    }

    pub(crate) fn fmt_requests(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stats.entries.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            "\n === PER REQUEST METRICS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>14} | {:>8} | {:>7}",
            "Name", "# reqs", "# fails", "req/s", "fail/s"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for entry in self.stats.entries.values() {
            self.fmt_request_row(fmt, &request_key(&entry.method, &entry.name), entry)?;
        }
        writeln!(
            fmt,
            " -------------------------+---------------+----------------+----------+--------"
        )?;
        self.fmt_request_row(fmt, AGGREGATED, &self.stats.total)
    }

    fn fmt_request_row(
        &self,
        fmt: &mut fmt::Formatter<'_>,
        label: &str,
        entry: &RequestEntry,
    ) -> fmt::Result {
        let fail_percent = entry.fail_ratio() as f32 * 100.0;
        // Reqs and fails per second over the whole run while final, else the last window.
        let (reqs, fails) = if self.final_metrics {
            per_second_calculations(self.duration, entry.num_requests, entry.num_failures)
        } else {
            (
                entry.last_window_requests as f32,
                entry.last_window_failures as f32,
            )
        };
        // Compress 100.0 and 0.0 to 100 and 0 respectively to save width.
        let fails_column = if fail_percent as usize == 100 || fail_percent as usize == 0 {
            format!(
                "{} ({}%)",
                format_number(entry.num_failures),
                fail_percent as usize
            )
        } else {
            format!(
                "{} ({:.1}%)",
                format_number(entry.num_failures),
                fail_percent
            )
        };
        writeln!(
            fmt,
            " {:<24} | {:>13} | {:>14} | {:>8.reqs_p$} | {:>7.fails_p$}",
            util::truncate_string(label, 24),
            format_number(entry.num_requests),
            fails_column,
            reqs,
            fails,
            reqs_p = determine_precision(reqs),
            fails_p = determine_precision(fails),
        )
    }

    pub(crate) fn fmt_response_times(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.stats.entries.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " {:<24} | {:>11} | {:>10} | {:>10} | {:>11}",
            "Name", "Avg (ms)", "Min", "Max", "Median"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        let rows = self
            .stats
            .entries
            .values()
            .map(|entry| (request_key(&entry.method, &entry.name), entry))
            .chain(std::iter::once((AGGREGATED.to_string(), &self.stats.total)));
        for (index, (label, entry)) in rows.enumerate() {
            if index == self.stats.entries.len() {
                writeln!(
                    fmt,
                    " -------------------------+-------------+------------+-------------+-----------"
                )?;
            }
            let average = entry.avg_response_time() as f32;
            writeln!(
                fmt,
                " {:<24} | {:>11.avg_precision$} | {:>10} | {:>11} | {:>10}",
                util::truncate_string(&label, 24),
                average,
                format_number(entry.min_response_time.unwrap_or(0) as usize),
                format_number(entry.max_response_time as usize),
                format_number(entry.median_response_time() as usize),
                avg_precision = determine_precision(average),
            )?;
        }
        Ok(())
    }

    pub(crate) fn fmt_percentiles(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only include percentiles when displaying the final metrics report.
        if !self.final_metrics || self.stats.entries.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        writeln!(
            fmt,
            " Slowest page load within specified percentile of requests (in ms):"
        )?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        let mut header = format!(" {:<24}", "Name");
        for percent in PERCENTILES_TO_REPORT.iter() {
            header.push_str(&format!(" | {:>6}", percentile_label(*percent)));
        }
        writeln!(fmt, "{}", header)?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        let rows = self
            .stats
            .entries
            .values()
            .map(|entry| (request_key(&entry.method, &entry.name), entry))
            .chain(std::iter::once((AGGREGATED.to_string(), &self.stats.total)));
        for (label, entry) in rows {
            let mut row = format!(" {:<24}", util::truncate_string(&label, 24));
            for percent in PERCENTILES_TO_REPORT.iter() {
                row.push_str(&format!(
                    " | {:>6}",
                    format_number(entry.percentile(*percent) as usize)
                ));
            }
            writeln!(fmt, "{}", row)?;
        }
        Ok(())
    }

    pub(crate) fn fmt_errors(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Only include errors when displaying the final metrics report, and if there are
        // errors to display.
        if !self.final_metrics || !self.display_errors || self.stats.errors.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            "\n === ERRORS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(fmt, " {:<11} | Error", "Count")?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;

        // Reverse sort errors to display the error occuring the most first.
        for (occurrences, error) in self
            .stats
            .errors
            .values()
            .map(|e| (e.occurrences, format!("{} {}: {}", e.method, e.name, e.error)))
            .sorted()
            .rev()
        {
            writeln!(fmt, " {:<12}  {}", format_number(occurrences), error)?;
        }
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )
    }

    pub(crate) fn fmt_exceptions(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.final_metrics || !self.display_errors || self.stats.exceptions.is_empty() {
            return Ok(());
        }

        writeln!(
            fmt,
            "\n === EXCEPTIONS ===\n ------------------------------------------------------------------------------"
        )?;
        writeln!(fmt, " {:<11} | {:<30} | Nodes", "Count", "Exception")?;
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )?;
        for exception in self
            .stats
            .exceptions
            .values()
            .sorted_by(|a, b| b.count.cmp(&a.count).then(a.task.cmp(&b.task)))
        {
            writeln!(
                fmt,
                " {:<12}  {:<30}   {}",
                format_number(exception.count),
                format!("{}: {}", exception.task, exception.error),
                exception.nodes.iter().join(", ")
            )?;
        }
        writeln!(
            fmt,
            " ------------------------------------------------------------------------------"
        )
    }
}

impl fmt::Display for FlockMetrics {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        self.fmt_requests(fmt)?;
        self.fmt_response_times(fmt)?;
        self.fmt_percentiles(fmt)?;
        self.fmt_errors(fmt)?;
        self.fmt_exceptions(fmt)
    }
}

/// Key identifying an entry.
pub fn request_key(method: &str, name: &str) -> String {
    format!("{} {}", method, name)
}

fn percentile_label(percent: f64) -> String {
    format!("{}%", (percent * 10_000.0).round() / 100.0)
}

/// Helper to calculate requests and fails per seconds.
pub(crate) fn per_second_calculations(duration: usize, total: usize, fail: usize) -> (f32, f32) {
    if duration == 0 {
        (0.0, 0.0)
    } else {
        (
            total as f32 / duration as f32,
            fail as f32 / duration as f32,
        )
    }
}

fn determine_precision(value: f32) -> usize {
    if value < 1000.0 {
        2
    } else {
        0
    }
}

/// Format large number in locale appropriate style.
pub(crate) fn format_number(number: usize) -> String {
    (number).to_formatted_string(&Locale::en)
}

/// Merge one response time histogram into another.
pub(crate) fn merge_times(global: &mut BTreeMap<u64, usize>, local: &BTreeMap<u64, usize>) {
    for (response_time, count) in local {
        *global.entry(*response_time).or_insert(0) += count;
    }
}

/// Get the response time that a certain share of the requests finished within.
///
/// This is the `floor(total * percent) + 1`-th smallest recorded value, or the maximum
/// when that falls past the end, clamped to the exact minimum and maximum since the
/// histogram holds rounded values.
pub(crate) fn calculate_response_time_percentile(
    response_times: &BTreeMap<u64, usize>,
    total_requests: usize,
    min: u64,
    max: u64,
    percent: f64,
) -> u64 {
    if total_requests == 0 {
        return 0;
    }
    let preceding = (total_requests as f64 * percent).floor() as usize;
    trace!(
        "percentile: {}, {} of {} requests precede it",
        percent,
        preceding,
        total_requests
    );

    let mut total_count: usize = 0;
    for (value, counter) in response_times {
        total_count += counter;
        if total_count > preceding {
            return (*value).max(min).min(max);
        }
    }
    max
}

#[cfg(test)]
mod test {
    use super::*;

    fn aggregator_from(times: &[f64]) -> StatsAggregator {
        let mut stats = StatsAggregator::new();
        for (i, time) in times.iter().enumerate() {
            stats
                .record_at("GET", "/", *time, 10, None, 1_000 + i as i64)
                .unwrap();
        }
        stats
    }

    #[test]
    fn response_time_buckets() {
        assert_eq!(bucket_response_time(0), 0);
        assert_eq!(bucket_response_time(99), 99);
        assert_eq!(bucket_response_time(147), 150);
        assert_eq!(bucket_response_time(3432), 3400);
        assert_eq!(bucket_response_time(58760), 59000);
    }

    #[test]
    fn percentiles_of_known_distribution() {
        let stats = aggregator_from(&[1.0, 2.0, 2.0, 3.0, 4.0, 5.0, 5.0, 5.0, 9.0, 10.0]);
        let entry = stats.get("GET", "/").unwrap();
        assert_eq!(entry.percentile(0.5), 5);
        assert_eq!(entry.percentile(1.0), 10);
        assert_eq!(entry.percentile(0.0), 1);
        assert_eq!(entry.percentile(0.9), 10);
        assert_eq!(entry.percentile(0.8), 9);
        assert_eq!(entry.median_response_time(), 5);
        assert_eq!(entry.min_response_time, Some(1));
        assert_eq!(entry.max_response_time, 10);
        assert!((entry.avg_response_time() - 4.6).abs() < f64::EPSILON);
        assert_eq!(stats.percentile("GET", "/", 0.5), Some(5));
        assert_eq!(stats.percentile("GET", "/missing", 0.5), None);
    }

    #[test]
    fn percentile_clamped_to_exact_extremes() {
        // 147 rounds to 150, but the slowest request took 147.
        let stats = aggregator_from(&[120.0, 147.0]);
        let entry = stats.get("GET", "/").unwrap();
        assert_eq!(entry.percentile(1.0), 147);
        assert_eq!(entry.percentile(0.99), 147);
        assert_eq!(entry.percentile(0.0), 120);
    }

    #[test]
    fn invalid_response_times_are_rejected() {
        let mut stats = StatsAggregator::new();
        assert!(stats.record("GET", "/", -1.0, 0, None).is_err());
        assert!(stats.record("GET", "/", f64::NAN, 0, None).is_err());
        assert!(stats.record("GET", "/", f64::INFINITY, 0, None).is_err());
        assert_eq!(stats, StatsAggregator::new());
        assert!(stats.record("GET", "/", 0.4, 0, None).is_ok());
        assert_eq!(stats.num_requests(), 1);
    }

    #[test]
    fn huge_response_times_saturate() {
        let mut stats = StatsAggregator::new();
        stats.record("GET", "/", 1e300, 0, None).unwrap();
        stats.record("GET", "/", 1.0, usize::MAX, None).unwrap();
        stats.record("GET", "/", 1e300, usize::MAX, None).unwrap();
        let entry = stats.get("GET", "/").unwrap();
        assert_eq!(entry.num_requests, 3);
        assert_eq!(entry.min_response_time, Some(1));
        assert_eq!(entry.max_response_time, u64::MAX);
        assert_eq!(entry.total_response_time, u64::MAX);
        assert_eq!(entry.total_content_length, u64::MAX);
        assert_eq!(entry.percentile(0.0), 1);
        assert_eq!(entry.percentile(1.0), u64::MAX);

        // Merging saturated entries doesn't overflow either.
        let mut merged = stats.clone();
        merged.merge(&stats);
        let entry = merged.get("GET", "/").unwrap();
        assert_eq!(entry.num_requests, 6);
        assert_eq!(entry.total_response_time, u64::MAX);
        assert_eq!(entry.total_content_length, u64::MAX);
    }

    #[test]
    fn response_times_round_half_to_even() {
        let stats = aggregator_from(&[0.5, 1.5, 2.5, 2.6]);
        let entry = stats.get("GET", "/").unwrap();
        assert_eq!(entry.min_response_time, Some(0));
        assert_eq!(entry.max_response_time, 3);
        assert_eq!(entry.total_response_time, 7);
        assert_eq!(entry.response_times.get(&2), Some(&2));
    }

    #[test]
    fn failures_and_errors() {
        let mut stats = StatsAggregator::new();
        stats.record_at("GET", "/", 10.0, 5, None, 1).unwrap();
        stats
            .record_at("GET", "/", 20.0, 0, Some("503 Service Unavailable"), 2)
            .unwrap();
        stats
            .record_at("GET", "/", 30.0, 0, Some("503 Service Unavailable"), 3)
            .unwrap();
        stats
            .record_at("POST", "/login", 5.0, 0, Some("timeout"), 4)
            .unwrap();

        let entry = stats.get("GET", "/").unwrap();
        assert_eq!(entry.num_requests, 3);
        assert_eq!(entry.num_failures, 2);
        assert_eq!(entry.last_error.as_ref().unwrap().timestamp, 3);
        assert_eq!(stats.total.num_requests, 4);
        assert_eq!(stats.total.num_failures, 3);
        assert_eq!(stats.errors.len(), 2);
        assert_eq!(
            stats.errors["GET / 503 Service Unavailable"].occurrences,
            2
        );
    }

    #[test]
    fn merge_is_order_independent() {
        let mut a = StatsAggregator::new();
        let mut b = StatsAggregator::new();
        let mut c = StatsAggregator::new();
        let mut union = StatsAggregator::new();
        let outcomes = [
            ("GET", "/", 12.0, None, 10),
            ("GET", "/", 180.0, Some("boom"), 11),
            ("POST", "/a", 3.0, None, 12),
            ("GET", "/", 4500.0, None, 13),
            ("POST", "/a", 77.0, Some("bad"), 14),
            ("GET", "/b", 1.0, None, 15),
        ];
        for (i, (method, name, time, error, ts)) in outcomes.iter().enumerate() {
            let target = match i % 3 {
                0 => &mut a,
                1 => &mut b,
                _ => &mut c,
            };
            target.record_at(method, name, *time, 1, *error, *ts).unwrap();
            union.record_at(method, name, *time, 1, *error, *ts).unwrap();
        }
        a.record_exception("Browse: index", "panicked", "worker_1");
        union.record_exception("Browse: index", "panicked", "worker_1");
        c.record_exception("Browse: index", "panicked", "worker_2");
        union.record_exception("Browse: index", "panicked", "worker_2");

        // (a + b) + c
        let mut left = a.clone();
        left.merge(&b);
        left.merge(&c);
        // a + (c + b)
        let mut inner = c.clone();
        inner.merge(&b);
        let mut right = a.clone();
        right.merge(&inner);
        // c + a + b
        let mut shuffled = c.clone();
        shuffled.merge(&a);
        shuffled.merge(&b);

        assert_eq!(left, union);
        assert_eq!(right, union);
        assert_eq!(shuffled, union);
        assert_eq!(union.exceptions["Browse: index: panicked"].count, 2);
        assert_eq!(union.exceptions["Browse: index: panicked"].nodes.len(), 2);
    }

    #[test]
    fn merge_with_empty_is_identity() {
        let stats = aggregator_from(&[5.0, 50.0, 500.0]);
        let mut merged = stats.clone();
        merged.merge(&StatsAggregator::new());
        assert_eq!(merged, stats);
        let mut empty = StatsAggregator::new();
        empty.merge(&stats);
        assert_eq!(empty, stats);
    }

    #[test]
    fn windows_roll_over() {
        let mut stats = aggregator_from(&[1.0, 2.0, 3.0]);
        assert_eq!(stats.total.window_requests, 3);
        stats.reset_window();
        assert_eq!(stats.total.last_window_requests, 3);
        assert_eq!(stats.total.window_requests, 0);
        assert_eq!(stats.window_rates().total, (3, 0));
        stats.reset_window();
        assert_eq!(stats.window_rates().total, (0, 0));
    }

    #[test]
    fn delta_keeps_windows_and_sums_to_whole() {
        let mut worker = StatsAggregator::new();
        let mut master = StatsAggregator::new();
        let mut whole = StatsAggregator::new();
        for i in 0..5 {
            worker.record_at("GET", "/", 10.0 * i as f64, 1, None, i).unwrap();
            whole.record_at("GET", "/", 10.0 * i as f64, 1, None, i).unwrap();
        }
        master.merge(&worker.take_delta().without_windows());
        assert_eq!(worker.total.num_requests, 0);
        assert_eq!(worker.total.window_requests, 5);
        for i in 5..8 {
            worker.record_at("GET", "/", 10.0 * i as f64, 1, None, i).unwrap();
            whole.record_at("GET", "/", 10.0 * i as f64, 1, None, i).unwrap();
        }
        master.merge(&worker.take_delta().without_windows());
        assert_eq!(master, whole.without_windows());
    }

    #[test]
    fn reset_clears_everything() {
        let mut stats = aggregator_from(&[1.0, 2.0]);
        stats.record_exception("a", "b", "local");
        stats.reset();
        assert_eq!(stats, StatsAggregator::new());
        assert_eq!(stats.num_requests(), 0);
    }

    #[test]
    fn exit_code_reflects_errors() {
        let mut metrics = FlockMetrics {
            stats: aggregator_from(&[1.0]),
            exit_code_on_error: 3,
            ..Default::default()
        };
        assert_eq!(metrics.exit_code(), 0);
        metrics.stats.record_exception("a", "b", "local");
        assert_eq!(metrics.exit_code(), 3);
    }

    #[test]
    fn display_tables() {
        let mut stats = aggregator_from(&[1.0, 2.0, 3.0]);
        stats
            .record_at("POST", "/login", 20.0, 0, Some("denied"), 9)
            .unwrap();
        stats.record_exception("Browse: login", "panicked at oops", "local");
        let metrics = FlockMetrics {
            duration: 2,
            stats,
            final_metrics: true,
            display_metrics: true,
            display_errors: true,
            ..Default::default()
        };
        let output = format!("{}", metrics);
        assert!(output.contains("=== PER REQUEST METRICS ==="));
        assert!(output.contains("GET /"));
        assert!(output.contains("Aggregated"));
        assert!(output.contains("99.99%"));
        assert!(output.contains("=== ERRORS ==="));
        assert!(output.contains("POST /login: denied"));
        assert!(output.contains("=== EXCEPTIONS ==="));
        assert!(output.contains("panicked at oops"));

        let json: serde_json::Value = serde_json::from_str(&metrics.to_json().unwrap()).unwrap();
        assert_eq!(json["requests"].as_array().unwrap().len(), 3);
        assert_eq!(json["exceptions"][0]["count"], 1);
    }
}
