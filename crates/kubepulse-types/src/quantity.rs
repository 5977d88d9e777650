//! Kubernetes quantity normalization
//!
//! CPU is reported in millicores and memory in MiB so samples from different
//! pods and nodes can be compared directly. Both functions are total: input
//! they cannot read becomes `0.0` instead of an error, so a single odd sample
//! never takes down a whole metrics cycle.

const BYTES_PER_MIB: f64 = 1024.0 * 1024.0;

/// Memory suffixes and their byte multipliers.
/// Two-character binary suffixes come first so `Ki` is never read as `K`.
const MEMORY_SUFFIXES: [(&str, f64); 9] = [
    ("Ki", 1024.0),
    ("Mi", 1024.0 * 1024.0),
    ("Gi", 1024.0 * 1024.0 * 1024.0),
    ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
    ("k", 1e3),
    ("K", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
];

/// Convert a CPU quantity (`250m`, `1`, `0.5`, `1200u`, `83000n`) to millicores
pub fn cpu_millicores(quantity: &str) -> f64 {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return 0.0;
    }

    // (number, multiplier, divisor)
    let (number, multiplier, divisor) = if let Some(n) = quantity.strip_suffix('n') {
        (n, 1.0, 1e6)
    } else if let Some(u) = quantity.strip_suffix('u') {
        (u, 1.0, 1e3)
    } else if let Some(m) = quantity.strip_suffix('m') {
        (m, 1.0, 1.0)
    } else {
        (quantity, 1000.0, 1.0)
    };

    parse_finite(number)
        .map(|value| value * multiplier / divisor)
        .unwrap_or(0.0)
}

/// Convert a memory quantity (`128Mi`, `1Gi`, `500M`, `1048576`) to MiB
pub fn memory_mib(quantity: &str) -> f64 {
    let quantity = quantity.trim();
    if quantity.is_empty() {
        return 0.0;
    }

    for (suffix, multiplier) in MEMORY_SUFFIXES {
        if let Some(number) = quantity.strip_suffix(suffix) {
            return parse_finite(number)
                .map(|value| value * multiplier / BYTES_PER_MIB)
                .unwrap_or(0.0);
        }
    }

    // No suffix: raw bytes
    parse_finite(quantity)
        .map(|bytes| bytes / BYTES_PER_MIB)
        .unwrap_or(0.0)
}

fn parse_finite(number: &str) -> Option<f64> {
    number
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}
