//! Worker counters and their Prometheus text exposition.
//!
//! Every error class of the lease lifecycle gets its own counter so that a
//! worker defect (technical errors), a broker outage (fetch errors) and a
//! broker that never heard about an outcome (report failures) can be told
//! apart on a dashboard.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

use extask_core::WorkerId;
use serde::Serialize;

/// Live counters of one poll loop.
#[derive(Debug, Default)]
pub struct WorkerMetrics {
    polls: AtomicU64,
    empty_polls: AtomicU64,
    fetch_errors: AtomicU64,
    tasks_leased: AtomicU64,
    completed: AtomicU64,
    business_failures: AtomicU64,
    technical_errors: AtomicU64,
    failures_reported: AtomicU64,
    lease_lost: AtomicU64,
    report_failures: AtomicU64,
    in_flight: AtomicU64,
}

/// Point-in-time copy of [`WorkerMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub polls: u64,
    pub empty_polls: u64,
    pub fetch_errors: u64,
    pub tasks_leased: u64,
    pub completed: u64,
    pub business_failures: u64,
    pub technical_errors: u64,
    pub failures_reported: u64,
    pub lease_lost: u64,
    pub report_failures: u64,
    pub in_flight: u64,
}

impl WorkerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_poll(&self) {
        self.polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_empty_poll(&self) {
        self.empty_polls.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fetch_error(&self) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_leased(&self, n: usize) {
        self.tasks_leased.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_business_failure(&self) {
        self.business_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_technical_error(&self) {
        self.technical_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure_reported(&self) {
        self.failures_reported.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lease_lost(&self) {
        self.lease_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_report_failure(&self) {
        self.report_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_started(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    pub fn task_finished(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            polls: self.polls.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
            fetch_errors: self.fetch_errors.load(Ordering::Relaxed),
            tasks_leased: self.tasks_leased.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            business_failures: self.business_failures.load(Ordering::Relaxed),
            technical_errors: self.technical_errors.load(Ordering::Relaxed),
            failures_reported: self.failures_reported.load(Ordering::Relaxed),
            lease_lost: self.lease_lost.load(Ordering::Relaxed),
            report_failures: self.report_failures.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::SeqCst),
        }
    }
}

/// Format the snapshots of several workers as Prometheus text.
pub fn render_prometheus(workers: &[(WorkerId, MetricsSnapshot)]) -> String {
    let mut output = String::new();

    let counters: [(&str, &str, fn(&MetricsSnapshot) -> u64); 10] = [
        ("extask_polls_total", "Fetch-and-lock calls issued", |s| s.polls),
        ("extask_empty_polls_total", "Fetch-and-lock calls that returned no task", |s| {
            s.empty_polls
        }),
        ("extask_fetch_errors_total", "Fetch-and-lock calls that failed", |s| {
            s.fetch_errors
        }),
        ("extask_tasks_leased_total", "Tasks claimed from the broker", |s| {
            s.tasks_leased
        }),
        ("extask_tasks_completed_total", "Tasks completed at the broker", |s| {
            s.completed
        }),
        ("extask_business_failures_total", "Tasks that ended in a business failure", |s| {
            s.business_failures
        }),
        ("extask_technical_errors_total", "Tasks that ended in a technical error", |s| {
            s.technical_errors
        }),
        ("extask_failures_reported_total", "Failure reports accepted by the broker", |s| {
            s.failures_reported
        }),
        ("extask_lease_lost_total", "Outcome calls rejected because the lease was gone", |s| {
            s.lease_lost
        }),
        ("extask_report_failures_total", "Outcome calls that never reached the broker", |s| {
            s.report_failures
        }),
    ];

    for (name, help, value) in counters {
        writeln!(output, "# HELP {name} {help}").ok();
        writeln!(output, "# TYPE {name} counter").ok();
        for (worker_id, snapshot) in workers {
            writeln!(output, "{name}{{worker=\"{worker_id}\"}} {}", value(snapshot)).ok();
        }
    }

    writeln!(output, "# HELP extask_tasks_in_flight Tasks currently being processed").ok();
    writeln!(output, "# TYPE extask_tasks_in_flight gauge").ok();
    for (worker_id, snapshot) in workers {
        writeln!(
            output,
            "extask_tasks_in_flight{{worker=\"{worker_id}\"}} {}",
            snapshot.in_flight
        )
        .ok();
    }

    output
}
