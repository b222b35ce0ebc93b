use tracing::trace;

// Counters go out as trace events and show up once the filter enables
// `intake.metrics=trace`.

pub fn inc_requests(route: &'static str) {
    trace!(target = "intake.metrics", route = route, "requests_total_inc");
}

pub fn batch_committed(submitted: usize, committed: usize, elapsed_ms: u128) {
    trace!(
        target = "intake.metrics",
        submitted = submitted as u64,
        committed = committed as u64,
        rejected = submitted.saturating_sub(committed) as u64,
        elapsed_ms = elapsed_ms as u64,
        "batch_committed"
    );
}

pub fn extraction_finished(ok: bool, elapsed_ms: u128) {
    trace!(
        target = "intake.metrics",
        ok = ok,
        elapsed_ms = elapsed_ms as u64,
        "extraction_finished"
    );
}

pub fn listing_submitted(ok: bool) {
    trace!(target = "intake.metrics", ok = ok, "listing_submitted");
}

pub fn favorite_toggled(saved: bool) {
    trace!(target = "intake.metrics", saved = saved, "favorite_toggled");
}
