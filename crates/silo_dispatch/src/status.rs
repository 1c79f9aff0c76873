//! Status page rendering: queue contents, lock tables, merge overview.
//!
//! The URL path selects the flavor: plain text when the query carries
//! `text`, an HTML fragment otherwise; `verbose` adds the full queue
//! listing.

use std::fmt::Write as _;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::disk::Disk;
use crate::handler::DispatchHandler;

struct StatusRequest {
    text: bool,
    verbose: bool,
}

fn parse(path: &str) -> StatusRequest {
    let query = path.split_once('?').map(|(_, q)| q).unwrap_or("");
    let has = |key: &str| {
        query
            .split('&')
            .any(|attr| attr == key || attr.starts_with(&format!("{key}=")))
    };
    StatusRequest {
        text: has("text") || has("format") && query.contains("format=text"),
        verbose: has("verbose"),
    }
}

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

pub(crate) fn render(handler: &DispatchHandler, path: &str) -> String {
    let req = parse(path);
    if req.text {
        render_text(handler, &req)
    } else {
        render_html(handler, &req)
    }
}

fn render_html(handler: &DispatchHandler, req: &StatusRequest) -> String {
    let now = now_unix_secs();
    let mut out = String::new();
    out.push_str("<h1>Dispatch handler</h1>\n");
    for (i, disk) in handler.disks().iter().enumerate() {
        let _ = writeln!(out, "<h2>Disk {i}</h2>");
        let _ = writeln!(out, "Queue size: {}<br>", disk.queue_len());
        let _ = writeln!(out, "Disk state: {}<br>", disk.state().name());
        let per_stripe: Vec<String> = disk
            .stripes()
            .iter()
            .map(|s| s.queue_len().to_string())
            .collect();
        let _ = writeln!(out, "Stripe queue sizes: {}<br>", per_stripe.join(", "));
        out.push_str("<h4>Active operations</h4>\n");
        for stripe in disk.stripes() {
            for lock in stripe.lock_snapshot() {
                let holder = lock
                    .msg_type
                    .map(|t| t.name())
                    .unwrap_or("control");
                let _ = writeln!(
                    out,
                    "{holder}:{} ({}, {} lock, priority {}) running for {} secs<br/>",
                    lock.msg_id,
                    lock.bucket,
                    lock.mode,
                    lock.priority,
                    now.saturating_sub(lock.acquired_unix_secs)
                );
            }
        }
        if !req.verbose {
            continue;
        }
        out.push_str("<h4>Input queue</h4>\n<ul>\n");
        for stripe in disk.stripes() {
            for entry in stripe.queue_snapshot() {
                let _ = writeln!(
                    out,
                    "<li>{}:{} {} (priority: {}, waited: {} ms)</li>",
                    entry.msg_type, entry.msg_id, entry.bucket, entry.priority, entry.waited_ms
                );
            }
        }
        out.push_str("</ul>\n");
    }
    let merges = handler.merge_summaries();
    let _ = writeln!(out, "Active merge operations: {}<br>", merges.len());
    if req.verbose {
        out.push_str("<h4>Active merges</h4>\n");
        if merges.is_empty() {
            out.push_str("None\n");
        }
        for (bucket, age_secs) in merges {
            let _ = writeln!(out, "<b>{bucket}</b> running for {age_secs} secs<br>");
        }
    }
    out
}

fn render_text(handler: &DispatchHandler, req: &StatusRequest) -> String {
    let now = now_unix_secs();
    let mut out = String::new();
    out.push_str("dispatch handler\n");
    for (i, disk) in handler.disks().iter().enumerate() {
        let _ = writeln!(
            out,
            "disk {i}: state {} queued {}",
            disk.state().name(),
            disk.queue_len()
        );
        for (j, stripe) in disk.stripes().iter().enumerate() {
            let locks = stripe.lock_snapshot();
            let _ = writeln!(
                out,
                "  stripe {j}: queued {} locked {}",
                stripe.queue_len(),
                locks.len()
            );
            for lock in locks {
                let holder = lock.msg_type.map(|t| t.name()).unwrap_or("control");
                let _ = writeln!(
                    out,
                    "    lock {} {} {holder}:{} priority {} held {} secs",
                    lock.bucket,
                    lock.mode,
                    lock.msg_id,
                    lock.priority,
                    now.saturating_sub(lock.acquired_unix_secs)
                );
            }
            if req.verbose {
                for entry in stripe.queue_snapshot() {
                    let _ = writeln!(
                        out,
                        "    queued {} {}:{} priority {} waited {} ms",
                        entry.bucket, entry.msg_type, entry.msg_id, entry.priority, entry.waited_ms
                    );
                }
            }
        }
    }
    let merges = handler.merge_summaries();
    let _ = writeln!(out, "merges: {}", merges.len());
    for (bucket, age_secs) in merges {
        let _ = writeln!(out, "  merge {bucket} running for {age_secs} secs");
    }
    out
}

/// Plain listing of every queued entry on a disk, stripe by stripe.
pub(crate) fn dump_queue(disk: &Disk) -> String {
    let mut out = String::new();
    for stripe in disk.stripes() {
        for entry in stripe.queue_snapshot() {
            let _ = writeln!(
                out,
                "{}: {}:{} (priority: {})",
                entry.bucket, entry.msg_type, entry.msg_id, entry.priority
            );
        }
    }
    out
}
