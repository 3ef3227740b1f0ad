//! `cloudexec status` table

use chrono::{Local, TimeZone};
use cx_state_store::{Job, State};

const HEADERS: [&str; 12] = [
    "Job Name",
    "Job ID",
    "Status",
    "Droplet IP",
    "Memory",
    "CPUs",
    "Disk",
    "Started At",
    "Updated At",
    "Time Elapsed",
    "Hourly Cost",
    "Total Cost",
];

/// Jobs worth showing: active ones plus the latest completed job, or everything
pub fn select_jobs(state: &State, show_all: bool) -> Vec<&Job> {
    let latest_completed = state.latest_completed_job().map(|job| job.id);
    state
        .jobs()
        .iter()
        .filter(|job| show_all || job.is_active() || Some(job.id) == latest_completed)
        .collect()
}

pub fn format_elapsed(seconds: i64) -> String {
    const MINUTE: i64 = 60;
    const HOUR: i64 = MINUTE * 60;
    const DAY: i64 = HOUR * 24;
    const WEEK: i64 = DAY * 7;

    match seconds {
        s if s < MINUTE * 2 => format!("{} seconds", s),
        s if s < HOUR * 2 => format!("{} minutes", s / MINUTE),
        s if s < DAY * 2 => format!("{} hours", s / HOUR),
        s if s < WEEK * 2 => format!("{} days", s / DAY),
        s => format!("{} weeks", s / WEEK),
    }
}

fn format_date(timestamp: i64) -> String {
    if timestamp == 0 {
        return String::new();
    }
    Local
        .timestamp_opt(timestamp, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

fn row(job: &Job, now: i64) -> Vec<String> {
    let handle = job.droplet.as_ref();
    let size = handle.and_then(|h| h.size.as_ref());
    vec![
        job.name.clone(),
        job.id.to_string(),
        job.status.to_string(),
        handle.map(|h| h.ip.clone()).unwrap_or_default(),
        format!("{} MB", size.map_or(0, |s| s.memory)),
        size.map_or(0, |s| s.vcpus).to_string(),
        format!("{} GB", size.map_or(0, |s| s.disk)),
        format_date(job.started_at),
        format_date(job.updated_at),
        format_elapsed(job.elapsed(now)),
        format!("${:.4}", handle.map_or(0.0, |h| h.hourly_price())),
        format!("${:.4}", job.cost(now)),
    ]
}

/// Left-aligned columns separated by two spaces
pub fn render(jobs: &[&Job], now: i64) -> String {
    let rows: Vec<Vec<String>> = jobs.iter().map(|job| row(job, now)).collect();

    let mut widths: Vec<usize> = HEADERS.iter().map(|h| h.chars().count()).collect();
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let header: Vec<String> = HEADERS.iter().map(|h| h.to_uppercase()).collect();
    for line in std::iter::once(&header).chain(rows.iter()) {
        let cells: Vec<String> = line
            .iter()
            .zip(&widths)
            .map(|(cell, width)| format!("{:<width$}", cell, width = *width))
            .collect();
        out.push_str(cells.join("  ").trim_end());
        out.push('\n');
    }
    out
}
