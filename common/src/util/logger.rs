/// Initialise logging from `RUST_LOG`, defaulting to `info`.
pub fn init() {
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .format_timestamp(None)
    .try_init();
}
