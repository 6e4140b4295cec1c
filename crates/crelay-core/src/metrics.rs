use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Process-local rolling counters exposed on `/metrics` in plain-text
/// scrape format. Cheap enough to bump from any path.
#[derive(Debug, Default)]
pub struct Metrics {
    pub requests_total: AtomicU64,
    pub responses_2xx: AtomicU64,
    pub responses_4xx: AtomicU64,
    pub responses_5xx: AtomicU64,
    pub upstream_retries: AtomicU64,
    pub token_refreshes: AtomicU64,
    pub refresh_failures: AtomicU64,
    pub rate_limited_hits: AtomicU64,
    pub no_account_available: AtomicU64,
    pub client_disconnects: AtomicU64,
    pub inflight: AtomicI64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe_status(&self, status: u16) {
        match status {
            200..=299 => self.responses_2xx.fetch_add(1, Ordering::Relaxed),
            400..=499 => self.responses_4xx.fetch_add(1, Ordering::Relaxed),
            _ => self.responses_5xx.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn render(&self) -> String {
        let mut out = String::with_capacity(1024);
        let counters: [(&str, u64); 10] = [
            ("crelay_requests_total", self.requests_total.load(Ordering::Relaxed)),
            ("crelay_responses_2xx_total", self.responses_2xx.load(Ordering::Relaxed)),
            ("crelay_responses_4xx_total", self.responses_4xx.load(Ordering::Relaxed)),
            ("crelay_responses_5xx_total", self.responses_5xx.load(Ordering::Relaxed)),
            ("crelay_upstream_retries_total", self.upstream_retries.load(Ordering::Relaxed)),
            ("crelay_token_refreshes_total", self.token_refreshes.load(Ordering::Relaxed)),
            ("crelay_refresh_failures_total", self.refresh_failures.load(Ordering::Relaxed)),
            ("crelay_rate_limited_total", self.rate_limited_hits.load(Ordering::Relaxed)),
            ("crelay_no_account_total", self.no_account_available.load(Ordering::Relaxed)),
            ("crelay_client_disconnects_total", self.client_disconnects.load(Ordering::Relaxed)),
        ];
        for (name, value) in counters {
            out.push_str("# TYPE ");
            out.push_str(name);
            out.push_str(" counter\n");
            out.push_str(name);
            out.push(' ');
            out.push_str(&value.to_string());
            out.push('\n');
        }
        out.push_str("# TYPE crelay_inflight gauge\n");
        out.push_str("crelay_inflight ");
        out.push_str(&self.inflight.load(Ordering::Relaxed).to_string());
        out.push('\n');
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_is_scrapeable_text() {
        let metrics = Metrics::new();
        metrics.requests_total.fetch_add(3, Ordering::Relaxed);
        metrics.observe_status(200);
        metrics.observe_status(404);
        metrics.observe_status(502);
        let text = metrics.render();
        assert!(text.contains("crelay_requests_total 3"));
        assert!(text.contains("crelay_responses_2xx_total 1"));
        assert!(text.contains("crelay_responses_4xx_total 1"));
        assert!(text.contains("crelay_responses_5xx_total 1"));
        assert!(text.contains("crelay_inflight 0"));
    }
}
