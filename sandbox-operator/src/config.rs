use clap::Parser;

/// Controller-wide configuration, parsed from CLI flags with environment
/// variable fallbacks, mirrors the one-struct-per-concern `clap::Parser`
/// pattern the platform's other binaries use for their own config structs.
#[derive(Parser, Clone, Debug)]
pub struct Config {
    /// Concurrent reconciler workers for the Sandbox controller.
    #[arg(long, env = "SANDBOX_WORKERS", default_value_t = 500)]
    pub sandbox_workers: u16,

    /// Concurrent reconciler workers for the bypass (pod-driven) controller.
    #[arg(long, env = "BYPASS_WORKERS", default_value_t = 50)]
    pub bypass_workers: u16,

    /// Interval between dangling-instance GC passes, in seconds.
    #[arg(long, env = "GC_INTERVAL_SECS", default_value_t = 1200)]
    pub gc_interval_secs: u64,

    /// Bound on concurrent dangling-instance deletions.
    #[arg(long, env = "GC_CONCURRENCY", default_value_t = 100)]
    pub gc_concurrency: usize,

    /// Port to serve `/metrics`, `/healthz` and `/readyz` on. Absent disables
    /// the metrics server entirely.
    #[arg(long, env = "METRICS_PORT")]
    pub metrics_port: Option<u16>,

    /// Address of the external compute provider's gRPC endpoint.
    #[arg(long, env = "PROVIDER_ENDPOINT", default_value = "http://localhost:50051")]
    pub provider_endpoint: String,
}

/// Operating namespace. Read directly from the environment rather than
/// routed through `clap`, matching the platform's convention of reading its
/// own pod namespace directly rather than as a configured flag.
pub fn pod_namespace() -> String {
    std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "agent-sandbox-system".to_string())
}
