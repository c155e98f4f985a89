/// Build metadata (from build.rs) for easy debugging in deployed
/// environments.
pub fn banner() -> String {
    let build_time = option_env!("SVCWATCHDOG_BUILD_TIME").unwrap_or("unknown");
    let build_host = option_env!("SVCWATCHDOG_BUILD_HOST").unwrap_or("unknown");
    format!(
        "svcwatchdog {}, build time: {build_time}, build host: {build_host}",
        env!("CARGO_PKG_VERSION")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn banner_carries_the_crate_version() {
        assert!(banner().contains(env!("CARGO_PKG_VERSION")));
    }
}
