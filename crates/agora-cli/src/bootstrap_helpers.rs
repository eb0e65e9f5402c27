use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// `--log-filter` wins over `RUST_LOG`; both fall back to `warn`.
fn tracing_filter(directives: Option<&str>) -> EnvFilter {
    let builder = EnvFilter::builder().with_default_directive(LevelFilter::WARN.into());
    match directives.map(str::trim).filter(|directives| !directives.is_empty()) {
        Some(directives) => builder.parse_lossy(directives),
        None => builder.from_env_lossy(),
    }
}

pub(crate) fn init_tracing(directives: Option<&str>) {
    // stdout carries streamed turn output
    tracing_subscriber::fmt()
        .with_env_filter(tracing_filter(directives))
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

#[cfg(test)]
mod tests {
    use tracing::level_filters::LevelFilter;

    use super::tracing_filter;

    #[test]
    fn unit_explicit_directives_override_default_level() {
        let filter = tracing_filter(Some("agora_client=debug"));
        assert_eq!(filter.max_level_hint(), Some(LevelFilter::DEBUG));
        assert!(filter.to_string().contains("agora_client=debug"));
    }
}
