/// Prefix under which every schedule record of a deployment lives.
pub fn schedules_prefix(key_prefix: &str) -> String {
    format!("{}/schedules/", key_prefix.trim_end_matches('/'))
}

/// The KV store key for a job's schedule record.
pub fn schedule_key(key_prefix: &str, job_name: &str) -> String {
    format!("{}{}", schedules_prefix(key_prefix), job_name)
}

/// Extract the job name from a schedule key, if it belongs to `key_prefix`.
pub fn parse_schedule_key<'a>(key_prefix: &str, key: &'a str) -> Option<&'a str> {
    let prefix = schedules_prefix(key_prefix);
    let name = key.strip_prefix(prefix.as_str())?;
    if name.is_empty() || name.contains('/') {
        return None;
    }
    Some(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_key_layout() {
        assert_eq!(schedule_key("leasehold", "Cleanup"), "leasehold/schedules/Cleanup");
        assert_eq!(schedule_key("leasehold/", "Cleanup"), "leasehold/schedules/Cleanup");
    }

    #[test]
    fn parse_schedule_key_rejects_foreign_keys() {
        assert_eq!(
            parse_schedule_key("leasehold", "leasehold/schedules/Cleanup"),
            Some("Cleanup")
        );
        assert_eq!(parse_schedule_key("leasehold", "other/schedules/Cleanup"), None);
        assert_eq!(parse_schedule_key("leasehold", "leasehold/schedules/"), None);
        assert_eq!(parse_schedule_key("leasehold", "leasehold/schedules/a/b"), None);
    }
}
