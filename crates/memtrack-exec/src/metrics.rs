//! Usage events for finished queries.
//!
//! This module purposefully avoids pulling heavy telemetry stacks.
//! Wire these up to OpenTelemetry/Prometheus in the binary layer.

use crate::registry::QueryUsage;

#[cfg(feature = "tracing")]
pub fn emit_usage(event: &str, usage: &QueryUsage) {
    tracing::debug!(
        %event,
        query = %usage.id,
        user = %usage.user,
        amount = usage.amount,
        peak = usage.peak,
        limit = usage.limit,
        "query memory"
    );
}

#[cfg(not(feature = "tracing"))]
pub fn emit_usage(_event: &str, _usage: &QueryUsage) { /* no-op */
}
