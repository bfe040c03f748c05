//! Usage-tracking counters. Sensitive reads and mutating operations bump
//! these; the exposition endpoint serves the standard text format.

use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

pub struct UsageMetrics {
    pub registry: Registry,
    /// Labelled by endpoint family: instance, group, project.
    pub audit_api_reads: IntCounterVec,
    pub audit_events_recorded: IntCounter,
    pub epics_created: IntCounter,
    pub members_added: IntCounter,
    pub seat_rejections: IntCounter,
}

impl UsageMetrics {
    pub fn new() -> anyhow::Result<UsageMetrics> {
        let registry = Registry::new();

        let audit_api_reads = IntCounterVec::new(
            Opts::new(
                "audit_events_api_reads_total",
                "Audit event API reads by endpoint family",
            ),
            &["endpoint"],
        )?;
        let audit_events_recorded = IntCounter::new(
            "audit_events_recorded_total",
            "Audit events written to the stores",
        )?;
        let epics_created = IntCounter::new("epics_created_total", "Epics created via the API")?;
        let members_added = IntCounter::new("members_added_total", "Members admitted via the API")?;
        let seat_rejections = IntCounter::new(
            "seat_limit_rejections_total",
            "Member additions refused for seat exhaustion",
        )?;

        registry.register(Box::new(audit_api_reads.clone()))?;
        registry.register(Box::new(audit_events_recorded.clone()))?;
        registry.register(Box::new(epics_created.clone()))?;
        registry.register(Box::new(members_added.clone()))?;
        registry.register(Box::new(seat_rejections.clone()))?;

        Ok(UsageMetrics {
            registry,
            audit_api_reads,
            audit_events_recorded,
            epics_created,
            members_added,
            seat_rejections,
        })
    }

    pub fn render(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buf) {
            tracing::error!("failed to encode metrics: {}", e);
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}
