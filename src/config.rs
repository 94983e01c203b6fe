use serde::Deserialize;

/// Environment-driven configuration for the object-store/queue backed deployments (§6.3).
/// Constructed once at process start and handed by value to store/queue constructors, mirroring
/// how `rivet-config` centralizes environment reads instead of scattering `std::env::var` calls
/// through the call stack.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub state_bucket: String,
    #[serde(default = "default_state_prefix")]
    pub state_prefix: String,
    pub queue_url: String,
    pub aws_region: Option<String>,
}

fn default_state_prefix() -> String {
    "wf/".to_string()
}

impl Config {
    /// Reads `STATE_BUCKET`, `STATE_PREFIX`, `QUEUE_URL`, `AWS_REGION` from the process
    /// environment. `STATE_PREFIX` is normalized to end with `/` regardless of how it was set.
    pub fn from_env() -> anyhow::Result<Self> {
        let state_bucket = std::env::var("STATE_BUCKET")
            .map_err(|_| anyhow::anyhow!("STATE_BUCKET is required"))?;
        let state_prefix = std::env::var("STATE_PREFIX").unwrap_or_else(|_| default_state_prefix());
        let queue_url =
            std::env::var("QUEUE_URL").map_err(|_| anyhow::anyhow!("QUEUE_URL is required"))?;
        let aws_region = std::env::var("AWS_REGION").ok();

        Ok(Self {
            state_bucket,
            state_prefix: normalize_prefix(&state_prefix),
            queue_url,
            aws_region,
        })
    }
}

fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() {
        return String::new();
    }
    if prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{prefix}/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_missing_trailing_slash() {
        assert_eq!(normalize_prefix("wf"), "wf/");
        assert_eq!(normalize_prefix("wf/"), "wf/");
        assert_eq!(normalize_prefix(""), "");
    }
}
