use gyre_graph::{Graph, Node};

#[derive(Clone, Debug, PartialEq)]
pub struct RetryBackoffConfig {
    pub initial_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
    pub jitter: bool,
}

impl Default for RetryBackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 200,
            backoff_factor: 2.0,
            max_delay_ms: 60_000,
            jitter: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: RetryBackoffConfig,
}

/// Node `retries` attribute, with the graph-level `default_retries` as
/// fallback; the attempt budget is retries plus the first try.
pub fn build_retry_policy(node: &Node, graph: &Graph, backoff: RetryBackoffConfig) -> RetryPolicy {
    let retries = node
        .attrs
        .get_i64("retries")
        .or_else(|| graph.attrs.get_i64("default_retries"))
        .unwrap_or(0)
        .max(0) as u32;
    RetryPolicy {
        max_attempts: retries + 1,
        backoff,
    }
}

/// Backoff before the next attempt: the base delay grows by
/// `backoff_factor` per completed attempt and saturates at `max_delay_ms`;
/// jitter then scales it into [0.5x, 1.5x).
pub fn delay_for_attempt_ms(attempt: u32, config: &RetryBackoffConfig, jitter_seed: u64) -> u64 {
    let ceiling = config.max_delay_ms as f64;
    let mut delay = (config.initial_delay_ms as f64).min(ceiling);
    for _ in 1..attempt {
        delay = (delay * config.backoff_factor).min(ceiling);
        if delay >= ceiling {
            break;
        }
    }
    if config.jitter {
        delay *= jitter_factor(jitter_seed, attempt);
    }
    delay.round().max(0.0) as u64
}

/// Deterministic jitter in [0.5, 1.5): the seed and attempt are scrambled
/// through a 64-bit finalizer and the top 53 bits become the unit fraction,
/// so a given run retries a given node on a fixed cadence.
fn jitter_factor(jitter_seed: u64, attempt: u32) -> f64 {
    let scrambled = scramble(jitter_seed ^ ((attempt as u64) << 32));
    let unit = (scrambled >> 11) as f64 / (1u64 << 53) as f64;
    0.5 + unit
}

/// splitmix-style bit finalizer.
fn scramble(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}

/// Per-node jitter seed: the run and node ids folded byte-wise through the
/// same finalizer.
pub fn jitter_seed(run_id: &str, node_id: &str) -> u64 {
    let mut seed = 0u64;
    for byte in run_id.bytes().chain([0u8]).chain(node_id.bytes()) {
        seed = scramble(seed ^ byte as u64);
    }
    seed
}
