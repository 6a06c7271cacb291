use std::time::{SystemTime, UNIX_EPOCH};

use uuid::Uuid;

pub fn get_current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn format_rule_handle(prefix: &str, rule_id: &Uuid) -> String {
    format!("{}-{}", prefix, rule_id.simple())
}
