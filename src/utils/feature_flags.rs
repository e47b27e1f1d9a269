pub fn is_truthy(value: impl AsRef<str>) -> bool {
    matches!(
        value.as_ref().trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

pub fn is_truthy_env(key: &str) -> bool {
    std::env::var(key).ok().map(is_truthy).unwrap_or(false)
}

pub fn read_env_ms(key: &str, fallback: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(fallback)
}

pub fn is_connectivity_test_disabled() -> bool {
    is_truthy_env("GITPERSONA_SKIP_SSH_TEST")
}
