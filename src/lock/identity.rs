use chrono::Utc;

/// Identity of this process as a lock holder: `{hostname}-{pid}`.
///
/// Falls back to `node-{unix millis}` when the hostname cannot be resolved.
pub fn resolve_node_id() -> String {
    match hostname::get() {
        Ok(name) => {
            let name = name.to_string_lossy();
            if name.is_empty() {
                synthetic_node_id()
            } else {
                format!("{}-{}", name, std::process::id())
            }
        }
        Err(e) => {
            let fallback = synthetic_node_id();
            tracing::warn!(error = %e, node_id = %fallback, "Hostname unavailable, using synthetic node id");
            fallback
        }
    }
}

pub fn synthetic_node_id() -> String {
    format!("node-{}", Utc::now().timestamp_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_ends_with_pid_or_is_synthetic() {
        let id = resolve_node_id();
        let pid_suffix = format!("-{}", std::process::id());
        assert!(id.ends_with(&pid_suffix) || id.starts_with("node-"));
    }

    #[test]
    fn synthetic_id_is_time_based() {
        let id = synthetic_node_id();
        let millis: i64 = id.strip_prefix("node-").unwrap().parse().unwrap();
        assert!(millis > 0);
    }
}
